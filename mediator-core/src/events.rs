//! Operator wire protocol: outbound events and inbound commands.
//!
//! Every outbound message is a `{type, data}` envelope; every inbound
//! command carries a `command` tag. Bodies are base64 on the wire.

use crate::exchange::{b64, Exchange, HeaderList};
use crate::exclusion::ExclusionRule;
use crate::project::RepeaterTab;
use crate::rewrite::MatchReplaceRule;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Capture payload, request or response variant. Prompts reuse the same
/// shapes with `pending: true`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExchangeEvent {
    #[serde(rename_all = "camelCase")]
    Request {
        id: String,
        seq: u64,
        method: String,
        url: String,
        headers: HeaderList,
        #[serde(with = "b64")]
        body: Vec<u8>,
        resource_type: String,
        timestamp: DateTime<Utc>,
        pending: bool,
    },
    #[serde(rename_all = "camelCase")]
    Response {
        /// Correlates with a prior request event's `id`. Load-bearing: the
        /// history must never fall back to URL matching.
        #[serde(rename = "req_id")]
        req_id: String,
        url: String,
        status: u16,
        headers: HeaderList,
        #[serde(with = "b64")]
        body: Vec<u8>,
        pending: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl ExchangeEvent {
    pub fn request(ex: &Exchange, pending: bool) -> Self {
        ExchangeEvent::Request {
            id: ex.id.clone(),
            seq: ex.seq,
            method: ex.method.clone(),
            url: ex.url.clone(),
            headers: ex.headers.clone(),
            body: ex.body.clone(),
            resource_type: ex.resource_type.clone(),
            timestamp: ex.timestamp,
            pending,
        }
    }

    pub fn response(ex: &Exchange, pending: bool, error: Option<String>) -> Self {
        let (status, headers, body) = match &ex.response {
            Some(res) => (res.status, res.headers.clone(), res.body.clone()),
            None => (0, HeaderList::new(), Vec::new()),
        };
        ExchangeEvent::Response {
            req_id: ex.id.clone(),
            url: ex.url.clone(),
            status,
            headers,
            body,
            pending,
            error,
        }
    }
}

/// Outcome of a replay execution, delivered to the owning repeater tab.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayOutcome {
    pub tab_id: String,
    pub raw: String,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Command acknowledgement. Operator errors are reported here, never as
/// channel failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ack {
    pub command: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Ack {
    pub fn ok(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ok: true,
            error: None,
        }
    }

    pub fn err(command: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ok: false,
            error: Some(error.into()),
        }
    }
}

/// Out-of-band notifications: degraded mode, upstream drops, save failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notice {
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl Notice {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            id: None,
        }
    }

    pub fn for_exchange(kind: impl Into<String>, message: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            id: Some(id.into()),
        }
    }
}

/// Outbound envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum OutboundMessage {
    /// A visible capture event (request or response).
    Capture(ExchangeEvent),
    /// An interception prompt: the exchange is suspended awaiting a
    /// decision. Never shed from the outbound queue.
    Intercept(ExchangeEvent),
    ReplayResponse(ReplayOutcome),
    Ack(Ack),
    Notice(Notice),
}

impl OutboundMessage {
    /// Prompts must never be lost; everything else may be shed under
    /// back-pressure.
    pub fn is_prompt(&self) -> bool {
        matches!(self, OutboundMessage::Intercept(_))
    }
}

/// Operator-supplied edit merged into a suspended exchange on forward.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExchangeEdit {
    pub method: Option<String>,
    pub url: Option<String>,
    pub headers: Option<HeaderList>,
    #[serde(with = "b64::opt")]
    pub body: Option<Vec<u8>>,
    pub status: Option<u16>,
}

impl ExchangeEdit {
    pub fn is_empty(&self) -> bool {
        self.method.is_none()
            && self.url.is_none()
            && self.headers.is_none()
            && self.body.is_none()
            && self.status.is_none()
    }
}

/// Inbound commands from the operator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    /// Launch the instrumented browser.
    Start,
    /// Stop the browser; all suspended exchanges are dropped.
    Stop,
    InterceptRequests {
        enabled: bool,
    },
    #[serde(rename_all = "camelCase")]
    Forward {
        id: String,
        #[serde(default)]
        modified: Option<ExchangeEdit>,
        #[serde(default)]
        intercept_response: Option<bool>,
    },
    Drop {
        id: String,
    },
    #[serde(rename_all = "camelCase")]
    Replay {
        tab_id: String,
        raw_request: String,
    },
    #[serde(rename_all = "camelCase")]
    ReplayCancel {
        tab_id: String,
    },
    #[serde(rename_all = "camelCase")]
    InterceptResponse {
        id: String,
        enabled: bool,
    },
    SetExclusions {
        rules: Vec<ExclusionRule>,
    },
    /// Retroactively purge history entries matching the current exclusion
    /// rules.
    PurgeHistory,
    SetMatchReplace {
        rules: Vec<MatchReplaceRule>,
    },
    SetTabs {
        tabs: Vec<RepeaterTab>,
    },
}

impl Command {
    /// Command name echoed back in acks.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Start => "start",
            Command::Stop => "stop",
            Command::InterceptRequests { .. } => "intercept_requests",
            Command::Forward { .. } => "forward",
            Command::Drop { .. } => "drop",
            Command::Replay { .. } => "replay",
            Command::ReplayCancel { .. } => "replay_cancel",
            Command::InterceptResponse { .. } => "intercept_response",
            Command::SetExclusions { .. } => "set_exclusions",
            Command::PurgeHistory => "purge_history",
            Command::SetMatchReplace { .. } => "set_match_replace",
            Command::SetTabs { .. } => "set_tabs",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::ExchangeState;

    fn sample_exchange() -> Exchange {
        Exchange::new(
            "42-abcd".into(),
            7,
            "drv".into(),
            "GET".into(),
            "https://a.test/x".into(),
            HeaderList::from_pairs([("Host", "a.test")]),
            Vec::new(),
            "document".into(),
        )
    }

    #[test]
    fn capture_request_wire_shape() {
        let msg = OutboundMessage::Capture(ExchangeEvent::request(&sample_exchange(), false));
        let v: serde_json::Value = serde_json::to_value(&msg).unwrap();

        assert_eq!(v["type"], "capture");
        assert_eq!(v["data"]["type"], "request");
        assert_eq!(v["data"]["id"], "42-abcd");
        assert_eq!(v["data"]["seq"], 7);
        assert_eq!(v["data"]["resourceType"], "document");
        assert_eq!(v["data"]["pending"], false);
    }

    #[test]
    fn capture_response_carries_req_id() {
        let mut ex = sample_exchange();
        ex.response = Some(crate::exchange::ResponseRecord {
            status: 200,
            headers: HeaderList::new(),
            body: b"ok".to_vec(),
        });
        ex.state = ExchangeState::Completed;

        let v: serde_json::Value =
            serde_json::to_value(OutboundMessage::Capture(ExchangeEvent::response(&ex, false, None)))
                .unwrap();
        assert_eq!(v["data"]["type"], "response");
        assert_eq!(v["data"]["req_id"], "42-abcd");
        assert_eq!(v["data"]["status"], 200);
    }

    #[test]
    fn forward_command_parses_with_partial_edit() {
        let raw = r#"{"command":"forward","id":"x","modified":{"body":"dT1hJnA9WA=="},"interceptResponse":true}"#;
        let cmd: Command = serde_json::from_str(raw).unwrap();
        match cmd {
            Command::Forward {
                id,
                modified,
                intercept_response,
            } => {
                assert_eq!(id, "x");
                assert_eq!(intercept_response, Some(true));
                let edit = modified.unwrap();
                assert_eq!(edit.body.as_deref(), Some(b"u=a&p=X".as_slice()));
                assert!(edit.method.is_none());
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn bare_commands_parse() {
        let cmd: Command = serde_json::from_str(r#"{"command":"start"}"#).unwrap();
        assert_eq!(cmd.name(), "start");
        let cmd: Command =
            serde_json::from_str(r#"{"command":"intercept_requests","enabled":true}"#).unwrap();
        assert_eq!(cmd.name(), "intercept_requests");
    }
}
