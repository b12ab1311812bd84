//! The exchange model: one HTTP request together with its eventual response.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Base64 (de)serialization for binary bodies. Bodies cross the wire and the
/// project file as base64 strings so binary payloads survive JSON.
pub(crate) mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        STANDARD.decode(s.as_bytes()).map_err(serde::de::Error::custom)
    }

    /// Same encoding for `Option<Vec<u8>>` fields (edit payloads).
    pub mod opt {
        use super::*;

        pub fn serialize<S: Serializer>(bytes: &Option<Vec<u8>>, ser: S) -> Result<S::Ok, S::Error> {
            match bytes {
                Some(b) => ser.serialize_some(&STANDARD.encode(b)),
                None => ser.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Option<Vec<u8>>, D::Error> {
            let s: Option<String> = Option::deserialize(de)?;
            match s {
                Some(s) => STANDARD
                    .decode(s.as_bytes())
                    .map(Some)
                    .map_err(serde::de::Error::custom),
                None => Ok(None),
            }
        }
    }
}

/// A single HTTP header. Name casing is preserved as seen on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub name: String,
    pub value: String,
}

impl Header {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Ordered header list. Unlike a map, this preserves insertion order,
/// original casing, and duplicate names, all of which the wire protocol
/// requires.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HeaderList(pub Vec<Header>);

impl HeaderList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<N, V>(pairs: impl IntoIterator<Item = (N, V)>) -> Self
    where
        N: Into<String>,
        V: Into<String>,
    {
        Self(pairs.into_iter().map(|(n, v)| Header::new(n, v)).collect())
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push(Header::new(name, value));
    }

    /// First value for `name`, compared case-insensitively.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    /// Replace the first occurrence of `name` in place (removing any later
    /// duplicates), or append if the header is absent.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        let mut seen = false;
        self.0.retain_mut(|h| {
            if h.name.eq_ignore_ascii_case(name) {
                if seen {
                    return false;
                }
                h.value = value.clone();
                seen = true;
            }
            true
        });
        if !seen {
            self.push(name, value);
        }
    }

    pub fn remove(&mut self, name: &str) {
        self.0.retain(|h| !h.name.eq_ignore_ascii_case(name));
    }

    /// Rewrite Content-Length to match the final body. An edited body must
    /// never go upstream with a stale length.
    pub fn set_content_length(&mut self, len: usize) {
        self.set("Content-Length", len.to_string());
    }

    pub fn iter(&self) -> impl Iterator<Item = &Header> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<Header> for HeaderList {
    fn from_iter<T: IntoIterator<Item = Header>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Exchange lifecycle.
///
/// `captured → (req_suspended?) → in_flight → (res_suspended?) → completed | dropped`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExchangeState {
    Captured,
    ReqRewritten,
    ReqSuspended,
    InFlight,
    ResRewritten,
    ResSuspended,
    Completed,
    Dropped,
}

impl ExchangeState {
    /// Terminal states admit no further mutation besides mirroring into
    /// history.
    pub fn is_terminal(self) -> bool {
        matches!(self, ExchangeState::Completed | ExchangeState::Dropped)
    }
}

/// The response side of an exchange. Present iff the exchange has reached
/// `res_suspended` or `completed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseRecord {
    pub status: u16,
    pub headers: HeaderList,
    #[serde(with = "b64")]
    pub body: Vec<u8>,
}

/// The central entity: one captured HTTP request and its eventual response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Exchange {
    /// Process-unique opaque identifier, assigned exactly once.
    pub id: String,
    /// Dense display sequence, strictly increasing in allocation order.
    pub seq: u64,
    pub method: String,
    pub url: String,
    pub headers: HeaderList,
    #[serde(with = "b64")]
    pub body: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<ResponseRecord>,
    pub state: ExchangeState,
    #[serde(default)]
    pub intercept_response: bool,
    #[serde(default)]
    pub dropped: bool,
    pub resource_type: String,
    pub timestamp: DateTime<Utc>,
    /// Driver-side correlation key. Runtime-only, never persisted.
    #[serde(skip, default)]
    pub driver_id: String,
}

impl Exchange {
    pub fn new(
        id: String,
        seq: u64,
        driver_id: String,
        method: String,
        url: String,
        headers: HeaderList,
        body: Vec<u8>,
        resource_type: String,
    ) -> Self {
        Self {
            id,
            seq,
            method,
            url,
            headers,
            body,
            response: None,
            state: ExchangeState::Captured,
            intercept_response: false,
            dropped: false,
            resource_type,
            timestamp: Utc::now(),
            driver_id,
        }
    }

    /// Host component of the exchange URL, when it parses.
    pub fn host(&self) -> Option<String> {
        url::Url::parse(&self.url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_list_preserves_order_case_and_duplicates() {
        let mut headers = HeaderList::new();
        headers.push("X-First", "1");
        headers.push("Set-Cookie", "a=1");
        headers.push("Set-Cookie", "b=2");

        assert_eq!(headers.len(), 3);
        assert_eq!(headers.get("set-cookie"), Some("a=1"));
        assert_eq!(headers.0[0].name, "X-First");
        assert_eq!(headers.0[2].value, "b=2");
    }

    #[test]
    fn set_replaces_first_and_drops_duplicates() {
        let mut headers = HeaderList::from_pairs([
            ("Content-Length", "10"),
            ("Accept", "*/*"),
            ("content-length", "11"),
        ]);
        headers.set_content_length(42);

        assert_eq!(headers.len(), 2);
        assert_eq!(headers.get("Content-Length"), Some("42"));
        assert_eq!(headers.0[0].name, "Content-Length");
    }

    #[test]
    fn body_round_trips_through_base64() {
        let ex = Exchange::new(
            "id-1".into(),
            1,
            "drv-1".into(),
            "POST".into(),
            "https://a.test/x".into(),
            HeaderList::new(),
            vec![0x00, 0xff, 0x7f],
            "xhr".into(),
        );
        let json = serde_json::to_string(&ex).unwrap();
        assert!(json.contains("\"body\":\"AP9/\""));

        let back: Exchange = serde_json::from_str(&json).unwrap();
        assert_eq!(back.body, ex.body);
        assert_eq!(back.state, ExchangeState::Captured);
    }
}
