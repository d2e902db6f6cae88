//! Shared outbound HTTP client with retries and trace capture
//!
//! All ticket provider traffic goes through this client. Connection errors
//! and 5xx responses are retried with exponential backoff up to a capped
//! number of attempts; 4xx responses are never retried. Every request
//! produces a trace that callers persist to the HTTP log.

use std::time::{Duration, Instant};

use chrono::Utc;
use switchyard_common::config::HttpConfig;
use switchyard_common::types::{OrgId, TicketerId};
use switchyard_common::{Error, Result};
use switchyard_storage::models::NewHttpLog;
use tracing::debug;

/// A captured request/response pair
#[derive(Debug, Clone)]
pub struct HttpTrace {
    pub url: String,
    pub status_code: i32,
    pub request: String,
    pub response: Option<String>,
    pub elapsed_ms: i32,
    pub is_error: bool,
}

/// Collects traces across the provider calls of one operation so they can
/// be persisted together, even when the operation fails
#[derive(Default)]
pub struct HttpLogger {
    traces: Vec<HttpTrace>,
}

impl HttpLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log(&mut self, trace: HttpTrace) {
        self.traces.push(trace);
    }

    pub fn is_empty(&self) -> bool {
        self.traces.is_empty()
    }

    /// Convert the collected traces into HTTP log rows for a ticketer
    pub fn as_logs(&self, org_id: OrgId, ticketer_id: Option<TicketerId>) -> Vec<NewHttpLog> {
        let now = Utc::now();
        self.traces
            .iter()
            .map(|t| NewHttpLog {
                org_id,
                ticketer_id,
                url: t.url.clone(),
                status_code: t.status_code,
                request: t.request.clone(),
                response: t.response.clone(),
                request_time_ms: t.elapsed_ms,
                is_error: t.is_error,
                created_on: now,
            })
            .collect()
    }
}

/// A response that made it back from the remote end
#[derive(Debug)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Shared outbound HTTP client
#[derive(Clone)]
pub struct HttpClient {
    client: reqwest::Client,
    max_attempts: u32,
    backoff: Duration,
}

impl HttpClient {
    pub fn new(config: &HttpConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            max_attempts: config.max_attempts.max(1),
            backoff: Duration::from_millis(config.backoff_ms),
        })
    }

    pub fn inner(&self) -> &reqwest::Client {
        &self.client
    }

    /// Send a request, retrying per policy, logging one trace for the
    /// overall exchange
    pub async fn send(
        &self,
        req: reqwest::RequestBuilder,
        logger: &mut HttpLogger,
    ) -> Result<HttpResponse> {
        let request = req.build()?;
        let url = request.url().to_string();
        let request_desc = format!("{} {}", request.method(), url);
        let started = Instant::now();

        // a request with a streaming body can't be replayed
        let max_attempts = if request.try_clone().is_some() {
            self.max_attempts
        } else {
            1
        };

        let mut stored = Some(request);
        let mut last_err: Option<Error> = None;

        for attempt in 1..=max_attempts {
            let this_req = match stored.as_ref().and_then(|r| r.try_clone()) {
                Some(clone) => clone,
                None => match stored.take() {
                    Some(orig) => orig,
                    None => break,
                },
            };

            match self.client.execute(this_req).await {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    let body = resp.text().await.unwrap_or_default();

                    if !should_retry(Some(status)) || attempt == max_attempts {
                        logger.log(HttpTrace {
                            url,
                            status_code: status as i32,
                            request: request_desc,
                            response: Some(body.clone()),
                            elapsed_ms: started.elapsed().as_millis() as i32,
                            is_error: status >= 400,
                        });
                        return Ok(HttpResponse { status, body });
                    }
                }
                Err(e) => {
                    last_err = Some(e.into());
                    if attempt == max_attempts {
                        break;
                    }
                }
            }

            let wait = backoff_for_attempt(self.backoff, attempt);
            debug!(attempt, wait_ms = wait.as_millis() as u64, "retrying HTTP request");
            tokio::time::sleep(wait).await;
        }

        // transport-level failure on every attempt
        logger.log(HttpTrace {
            url,
            status_code: 0,
            request: request_desc,
            response: None,
            elapsed_ms: started.elapsed().as_millis() as i32,
            is_error: true,
        });

        Err(last_err.unwrap_or_else(|| Error::Provider("request could not be sent".to_string())))
    }
}

/// Whether a response warrants a retry. None means the request never got a
/// response at all.
fn should_retry(status: Option<u16>) -> bool {
    match status {
        None => true,
        Some(s) => (500..600).contains(&s),
    }
}

fn backoff_for_attempt(base: Duration, attempt: u32) -> Duration {
    base * 2u32.saturating_pow(attempt.saturating_sub(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_retry() {
        assert!(should_retry(None));
        assert!(should_retry(Some(500)));
        assert!(should_retry(Some(503)));
        assert!(!should_retry(Some(200)));
        assert!(!should_retry(Some(400)));
        assert!(!should_retry(Some(404)));
        assert!(!should_retry(Some(429)));
    }

    #[test]
    fn test_backoff_doubles() {
        let base = Duration::from_millis(250);
        assert_eq!(backoff_for_attempt(base, 1), Duration::from_millis(250));
        assert_eq!(backoff_for_attempt(base, 2), Duration::from_millis(500));
        assert_eq!(backoff_for_attempt(base, 3), Duration::from_millis(1000));
    }

    #[test]
    fn test_logger_collects() {
        let mut logger = HttpLogger::new();
        assert!(logger.is_empty());

        logger.log(HttpTrace {
            url: "https://api.example.com/tickets".to_string(),
            status_code: 201,
            request: "POST https://api.example.com/tickets".to_string(),
            response: Some("{}".to_string()),
            elapsed_ms: 12,
            is_error: false,
        });

        let logs = logger.as_logs(1, Some(3));
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].org_id, 1);
        assert_eq!(logs[0].ticketer_id, Some(3));
        assert_eq!(logs[0].status_code, 201);
        assert!(!logs[0].is_error);
    }
}
