use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Locally generated identifier for one generation request.
///
/// Never server-assigned. Format: `req_<unix millis>_<16 hex chars>`, so ids
/// created in the same millisecond still differ by their random suffix.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    pub fn new() -> Self {
        let millis = Utc::now().timestamp_millis();
        let suffix: u64 = rand::thread_rng().gen();
        Self(format!("req_{millis}_{suffix:016x}"))
    }

    pub fn from_raw(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for RequestId {
    type Err = std::convert::Infallible;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.to_owned()))
    }
}

impl AsRef<str> for RequestId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn request_id_has_prefix_and_timestamp() {
        let id = RequestId::new();
        let parts: Vec<&str> = id.as_str().split('_').collect();
        assert_eq!(parts.len(), 3, "got: {id}");
        assert_eq!(parts[0], "req");
        assert!(parts[1].parse::<i64>().is_ok(), "got: {id}");
        assert_eq!(parts[2].len(), 16);
    }

    #[test]
    fn ids_are_unique_within_a_burst() {
        let ids: HashSet<RequestId> = (0..1000).map(|_| RequestId::new()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn display_and_from_str_roundtrip() {
        let id = RequestId::new();
        let parsed: RequestId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn serializes_as_plain_string() {
        let id = RequestId::from_raw("req-custom");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"req-custom\"");
    }
}
