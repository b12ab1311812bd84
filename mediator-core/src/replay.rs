//! Replay execution: operator-crafted raw requests issued through a plain
//! HTTP client, bypassing interception entirely.

use crate::error::{MediatorError, Result};
use crate::events::ReplayOutcome;
use crate::exchange::HeaderList;
use dashmap::DashMap;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// A raw request text parsed into its components.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedRequest {
    pub method: String,
    pub url: String,
    pub headers: HeaderList,
    pub body: Vec<u8>,
}

/// Parse operator-typed raw HTTP request text.
///
/// Accepts absolute-form targets (`GET https://a.test/x HTTP/1.1`) and
/// origin-form targets with a `Host` header, which default to https.
pub fn parse_raw_request(text: &str) -> Result<ParsedRequest> {
    let normalized = text.replace("\r\n", "\n");
    let (head, body) = match normalized.split_once("\n\n") {
        Some((head, body)) => (head, body.as_bytes().to_vec()),
        None => (normalized.as_str(), Vec::new()),
    };

    let mut lines = head.lines();
    let request_line = lines
        .next()
        .filter(|l| !l.trim().is_empty())
        .ok_or_else(|| MediatorError::RawRequest("empty request".into()))?;

    let mut parts = request_line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| MediatorError::RawRequest("missing method".into()))?
        .to_uppercase();
    let target = parts
        .next()
        .ok_or_else(|| MediatorError::RawRequest("missing request target".into()))?
        .to_string();

    let mut headers = HeaderList::new();
    for line in lines {
        if line.trim().is_empty() {
            continue;
        }
        match line.split_once(':') {
            Some((name, value)) => headers.push(name.trim(), value.trim_start()),
            None => {
                return Err(MediatorError::RawRequest(format!(
                    "malformed header line '{}'",
                    line
                )))
            }
        }
    }

    let url = if target.starts_with("http://") || target.starts_with("https://") {
        target
    } else {
        let host = headers
            .get("Host")
            .ok_or_else(|| MediatorError::RawRequest("origin-form target without Host header".into()))?;
        let path = if target.starts_with('/') {
            target
        } else {
            format!("/{}", target)
        };
        format!("https://{}{}", host, path)
    };

    Ok(ParsedRequest {
        method,
        url,
        headers,
        body,
    })
}

/// Issues replays through reqwest. Replays never enter the suspended map
/// and cannot be forwarded or dropped; they are cancellable by tab id.
struct ReplaySlot {
    generation: u64,
    token: CancellationToken,
}

pub struct ReplayExecutor {
    client: reqwest::Client,
    in_flight: DashMap<String, ReplaySlot>,
    generation: std::sync::atomic::AtomicU64,
}

impl ReplayExecutor {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .danger_accept_invalid_certs(true)
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| MediatorError::Replay(format!("client build failed: {}", e)))?;
        Ok(Self {
            client,
            in_flight: DashMap::new(),
            generation: std::sync::atomic::AtomicU64::new(0),
        })
    }

    /// Execute `raw` for the given repeater tab. Always resolves to a
    /// `ReplayOutcome`; failures travel in its `error` field.
    pub async fn execute(&self, tab_id: &str, raw: &str) -> ReplayOutcome {
        let started = Instant::now();
        let token = CancellationToken::new();
        let generation = self
            .generation
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        // A newer replay on the same tab cancels the one in flight.
        if let Some(previous) = self.in_flight.insert(
            tab_id.to_string(),
            ReplaySlot {
                generation,
                token: token.clone(),
            },
        ) {
            previous.token.cancel();
        }

        let outcome = match parse_raw_request(raw) {
            Ok(parsed) => {
                info!("Replay [{}] {} {}", tab_id, parsed.method, parsed.url);
                tokio::select! {
                    _ = token.cancelled() => ReplayOutcome {
                        tab_id: tab_id.to_string(),
                        raw: String::new(),
                        duration_ms: started.elapsed().as_millis() as u64,
                        error: Some("cancelled".into()),
                    },
                    result = self.send(&parsed) => match result {
                        Ok(rendered) => ReplayOutcome {
                            tab_id: tab_id.to_string(),
                            raw: rendered,
                            duration_ms: started.elapsed().as_millis() as u64,
                            error: None,
                        },
                        Err(e) => ReplayOutcome {
                            tab_id: tab_id.to_string(),
                            raw: String::new(),
                            duration_ms: started.elapsed().as_millis() as u64,
                            error: Some(e.to_string()),
                        },
                    },
                }
            }
            Err(e) => ReplayOutcome {
                tab_id: tab_id.to_string(),
                raw: String::new(),
                duration_ms: 0,
                error: Some(e.to_string()),
            },
        };

        // Only clear the slot if a newer replay has not replaced it.
        self.in_flight
            .remove_if(tab_id, |_, slot| slot.generation == generation);
        outcome
    }

    /// Cancel the replay in flight for `tab_id`, if any.
    pub fn cancel(&self, tab_id: &str) -> bool {
        match self.in_flight.remove(tab_id) {
            Some((_, slot)) => {
                slot.token.cancel();
                true
            }
            None => false,
        }
    }

    async fn send(&self, parsed: &ParsedRequest) -> Result<String> {
        let method = reqwest::Method::from_bytes(parsed.method.as_bytes())
            .map_err(|e| MediatorError::Replay(format!("bad method: {}", e)))?;

        let mut request = self.client.request(method, &parsed.url);
        for header in parsed.headers.iter() {
            // reqwest derives Host and Content-Length itself.
            if header.name.eq_ignore_ascii_case("host")
                || header.name.eq_ignore_ascii_case("content-length")
            {
                continue;
            }
            request = request.header(header.name.as_str(), header.value.as_str());
        }
        if !parsed.body.is_empty() {
            request = request.body(parsed.body.clone());
        }

        let response = request
            .send()
            .await
            .map_err(|e| MediatorError::Replay(e.to_string()))?;

        let status = response.status();
        let version = format!("{:?}", response.version());
        let mut rendered = format!(
            "{} {}{}\r\n",
            version,
            status.as_u16(),
            status
                .canonical_reason()
                .map(|r| format!(" {}", r))
                .unwrap_or_default()
        );
        for (name, value) in response.headers() {
            match value.to_str() {
                Ok(v) => rendered.push_str(&format!("{}: {}\r\n", name, v)),
                Err(_) => warn!("Skipping non-UTF-8 response header '{}' in replay render", name),
            }
        }
        rendered.push_str("\r\n");

        let body = response
            .bytes()
            .await
            .map_err(|e| MediatorError::Replay(e.to_string()))?;
        rendered.push_str(&String::from_utf8_lossy(&body));
        Ok(rendered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_origin_form_with_host() {
        let parsed = parse_raw_request(
            "POST /login HTTP/1.1\r\nHost: a.test\r\nContent-Type: text/plain\r\n\r\nu=a&p=b",
        )
        .unwrap();
        assert_eq!(parsed.method, "POST");
        assert_eq!(parsed.url, "https://a.test/login");
        assert_eq!(parsed.headers.get("Content-Type"), Some("text/plain"));
        assert_eq!(parsed.body, b"u=a&p=b");
    }

    #[test]
    fn parses_absolute_form_without_host() {
        let parsed = parse_raw_request("GET http://a.test:8080/x?q=1 HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!(parsed.url, "http://a.test:8080/x?q=1");
        assert!(parsed.body.is_empty());
    }

    #[test]
    fn missing_host_for_origin_form_is_an_error() {
        let err = parse_raw_request("GET /x HTTP/1.1\r\n\r\n").unwrap_err();
        assert!(err.to_string().contains("Host"));
    }

    #[test]
    fn bare_newlines_are_accepted() {
        let parsed = parse_raw_request("GET /x HTTP/1.1\nHost: a.test\n\nbody").unwrap();
        assert_eq!(parsed.url, "https://a.test/x");
        assert_eq!(parsed.body, b"body");
    }

    #[test]
    fn malformed_header_line_is_an_error() {
        assert!(parse_raw_request("GET /x HTTP/1.1\nHost a.test\n\n").is_err());
    }

    #[tokio::test]
    async fn cancel_resolves_with_cancelled_marker() {
        // A local server that accepts and then never answers, so the
        // replay stays in flight until cancelled.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let exec = std::sync::Arc::new(ReplayExecutor::new().unwrap());
        let raw = format!("GET http://127.0.0.1:{}/ HTTP/1.1\r\n\r\n", port);
        let task = {
            let exec = exec.clone();
            tokio::spawn(async move { exec.execute("tab-1", &raw).await })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(exec.cancel("tab-1"));

        let outcome = task.await.unwrap();
        assert_eq!(outcome.error.as_deref(), Some("cancelled"));
        assert_eq!(outcome.tab_id, "tab-1");
    }

    #[tokio::test]
    async fn cancel_of_idle_tab_is_a_noop() {
        let exec = ReplayExecutor::new().unwrap();
        assert!(!exec.cancel("nobody"));
    }
}
