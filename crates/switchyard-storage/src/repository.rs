//! Repository layer for data access

pub mod broadcasts;
pub mod contacts;
pub mod http_logs;
pub mod msgs;
pub mod optins;
pub mod orgs;
pub mod schedules;
pub mod sessions;
pub mod templates;
pub mod ticketers;
pub mod tickets;

pub use broadcasts::BroadcastRepository;
pub use contacts::ContactRepository;
pub use http_logs::HttpLogRepository;
pub use msgs::MsgRepository;
pub use optins::OptInRepository;
pub use orgs::OrgRepository;
pub use schedules::ScheduleRepository;
pub use sessions::SessionRepository;
pub use templates::TemplateRepository;
pub use ticketers::TicketerRepository;
pub use tickets::TicketRepository;
