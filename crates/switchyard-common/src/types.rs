//! Common types for switchyard

use serde::{Deserialize, Serialize};

/// Unique identifier for orgs (tenants)
pub type OrgId = i32;

/// Unique identifier for contacts
pub type ContactId = i32;

/// Unique identifier for contact groups
pub type GroupId = i32;

/// Unique identifier for users
pub type UserId = i32;

/// Unique identifier for ticketers
pub type TicketerId = i32;

/// Unique identifier for tickets
pub type TicketId = i32;

/// Unique identifier for channels
pub type ChannelId = i32;

/// Unique identifier for optins
pub type OptInId = i32;

/// Unique identifier for message templates
pub type TemplateId = i32;

/// Unique identifier for schedules
pub type ScheduleId = i32;

/// Unique identifier for broadcasts
pub type BroadcastId = i64;

/// Unique identifier for outbound/inbound messages
pub type MsgId = i64;

/// Unique identifier for flow sessions
pub type SessionId = i64;

/// ISO-639-3 language code, e.g. `eng`
pub type Language = String;

/// Builds a locale string from a language and an optional country,
/// e.g. `eng` + `EC` gives `eng-EC`
pub fn locale_for(language: &str, country: Option<&str>) -> String {
    match country {
        Some(c) if !c.is_empty() => format!("{}-{}", language, c),
        _ => language.to_string(),
    }
}

/// Identity of a broadcast: either a persisted row or an ephemeral send
/// that only ever exists as a task payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Option<BroadcastId>", into = "Option<BroadcastId>")]
pub enum BroadcastRef {
    Persisted(BroadcastId),
    Ephemeral,
}

impl BroadcastRef {
    pub fn id(&self) -> Option<BroadcastId> {
        match self {
            BroadcastRef::Persisted(id) => Some(*id),
            BroadcastRef::Ephemeral => None,
        }
    }
}

impl From<Option<BroadcastId>> for BroadcastRef {
    fn from(id: Option<BroadcastId>) -> Self {
        match id {
            Some(id) => BroadcastRef::Persisted(id),
            None => BroadcastRef::Ephemeral,
        }
    }
}

impl From<BroadcastRef> for Option<BroadcastId> {
    fn from(r: BroadcastRef) -> Self {
        r.id()
    }
}

/// Contact status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContactStatus {
    Active,
    Blocked,
    Stopped,
    Archived,
}

impl ContactStatus {
    /// Single-character code stored in the database
    pub fn code(&self) -> &'static str {
        match self {
            ContactStatus::Active => "A",
            ContactStatus::Blocked => "B",
            ContactStatus::Stopped => "S",
            ContactStatus::Archived => "V",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "A" => Some(ContactStatus::Active),
            "B" => Some(ContactStatus::Blocked),
            "S" => Some(ContactStatus::Stopped),
            "V" => Some(ContactStatus::Archived),
            _ => None,
        }
    }
}

/// Ticket status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    Open,
    Closed,
}

impl TicketStatus {
    pub fn code(&self) -> &'static str {
        match self {
            TicketStatus::Open => "O",
            TicketStatus::Closed => "C",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "O" => Some(TicketStatus::Open),
            "C" => Some(TicketStatus::Closed),
            _ => None,
        }
    }
}

/// Ticket event kinds, appended to the audit log on every transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketEventType {
    Opened,
    Closed,
    Reopened,
    NoteAdded,
    Assigned,
}

impl TicketEventType {
    pub fn code(&self) -> &'static str {
        match self {
            TicketEventType::Opened => "O",
            TicketEventType::Closed => "C",
            TicketEventType::Reopened => "R",
            TicketEventType::NoteAdded => "N",
            TicketEventType::Assigned => "A",
        }
    }
}

/// Outbound message status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MsgStatus {
    Initializing,
    Queued,
    Errored,
    Failed,
    Sent,
}

impl MsgStatus {
    pub fn code(&self) -> &'static str {
        match self {
            MsgStatus::Initializing => "I",
            MsgStatus::Queued => "Q",
            MsgStatus::Errored => "E",
            MsgStatus::Failed => "F",
            MsgStatus::Sent => "S",
        }
    }
}

/// Reason an outbound message was failed without ever being sent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailedReason {
    NoDestination,
}

impl FailedReason {
    pub fn code(&self) -> &'static str {
        match self {
            FailedReason::NoDestination => "D",
        }
    }
}

/// Flow session status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Waiting,
    Completed,
    Expired,
    Interrupted,
}

impl SessionStatus {
    pub fn code(&self) -> &'static str {
        match self {
            SessionStatus::Waiting => "W",
            SessionStatus::Completed => "C",
            SessionStatus::Expired => "X",
            SessionStatus::Interrupted => "I",
        }
    }
}

/// A uniform contact address, e.g. `tel:+1555000001` or `facebook:12345`.
///
/// URNs may carry query-style parameters after the path, e.g.
/// `tel:+593979012345?country=EC`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Urn {
    scheme: String,
    path: String,
    params: Vec<(String, String)>,
}

impl Urn {
    /// Parse a URN from a string, returning None if it isn't `scheme:path`
    pub fn parse(s: &str) -> Option<Self> {
        let (scheme, rest) = s.split_once(':')?;
        if scheme.is_empty() || rest.is_empty() {
            return None;
        }

        let (path, query) = match rest.split_once('?') {
            Some((p, q)) => (p, Some(q)),
            None => (rest, None),
        };
        if path.is_empty() {
            return None;
        }

        let params = query
            .map(|q| {
                q.split('&')
                    .filter_map(|kv| kv.split_once('='))
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect()
            })
            .unwrap_or_default();

        Some(Self {
            scheme: scheme.to_string(),
            path: path.to_string(),
            params,
        })
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// The `scheme:path` form without parameters, used as the stable identity
    pub fn identity(&self) -> String {
        format!("{}:{}", self.scheme, self.path)
    }

    /// Look up a query parameter, e.g. `country`
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// The country this URN belongs to, if one was recorded at creation
    pub fn country(&self) -> Option<&str> {
        self.param("country")
    }
}

impl std::fmt::Display for Urn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.scheme, self.path)?;
        for (i, (k, v)) in self.params.iter().enumerate() {
            write!(f, "{}{}={}", if i == 0 { "?" } else { "&" }, k, v)?;
        }
        Ok(())
    }
}

impl std::str::FromStr for Urn {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| crate::Error::Validation(format!("invalid URN: {}", s)))
    }
}

impl Serialize for Urn {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Urn {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Urn::parse(&s).ok_or_else(|| serde::de::Error::custom(format!("invalid URN: {}", s)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_urn_parse() {
        let urn = Urn::parse("tel:+593979012345").unwrap();
        assert_eq!(urn.scheme(), "tel");
        assert_eq!(urn.path(), "+593979012345");
        assert_eq!(urn.identity(), "tel:+593979012345");
        assert_eq!(urn.country(), None);
        assert_eq!(urn.to_string(), "tel:+593979012345");
    }

    #[test]
    fn test_urn_params() {
        let urn = Urn::parse("tel:+593979012345?country=EC").unwrap();
        assert_eq!(urn.country(), Some("EC"));
        assert_eq!(urn.identity(), "tel:+593979012345");
        assert_eq!(urn.to_string(), "tel:+593979012345?country=EC");
    }

    #[test]
    fn test_urn_invalid() {
        assert!(Urn::parse("notaurn").is_none());
        assert!(Urn::parse(":path").is_none());
        assert!(Urn::parse("tel:").is_none());
    }

    #[test]
    fn test_broadcast_ref_serde() {
        #[derive(Serialize, Deserialize)]
        struct Wrapper {
            broadcast_id: BroadcastRef,
        }

        let w: Wrapper = serde_json::from_str(r#"{"broadcast_id": 12}"#).unwrap();
        assert_eq!(w.broadcast_id, BroadcastRef::Persisted(12));

        let w: Wrapper = serde_json::from_str(r#"{"broadcast_id": null}"#).unwrap();
        assert_eq!(w.broadcast_id, BroadcastRef::Ephemeral);

        let out = serde_json::to_string(&Wrapper {
            broadcast_id: BroadcastRef::Ephemeral,
        })
        .unwrap();
        assert_eq!(out, r#"{"broadcast_id":null}"#);
    }

    #[test]
    fn test_locale_for() {
        assert_eq!(locale_for("eng", Some("EC")), "eng-EC");
        assert_eq!(locale_for("eng", None), "eng");
        assert_eq!(locale_for("fra", Some("")), "fra");
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(TicketStatus::Open.code(), "O");
        assert_eq!(TicketStatus::from_code("C"), Some(TicketStatus::Closed));
        assert_eq!(TicketStatus::from_code("Z"), None);
        assert_eq!(ContactStatus::from_code("A"), Some(ContactStatus::Active));
    }
}
