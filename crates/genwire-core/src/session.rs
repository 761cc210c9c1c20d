use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Server-issued authentication session.
///
/// Replaced wholesale on renewal, never edited in place.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub output_path_prefix_enabled: bool,
    #[serde(default)]
    pub permissions: BTreeSet<String>,
}

/// `GetNewSession` response body.
#[derive(Debug, Deserialize)]
pub struct NewSessionResponse {
    pub session_id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub output_append_user: bool,
    #[serde(default)]
    pub permissions: Vec<String>,
}

impl From<NewSessionResponse> for Session {
    fn from(resp: NewSessionResponse) -> Self {
        Self {
            session_id: resp.session_id,
            user_id: resp.user_id,
            output_path_prefix_enabled: resp.output_append_user,
            permissions: resp.permissions.into_iter().collect(),
        }
    }
}

impl Session {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            user_id: None,
            output_path_prefix_enabled: false,
            permissions: BTreeSet::new(),
        }
    }

    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions.contains(permission)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_full_response() {
        let resp: NewSessionResponse = serde_json::from_str(
            r#"{"session_id":"abc","user_id":"local","output_append_user":true,"permissions":["basic","admin","basic"]}"#,
        )
        .unwrap();
        let session = Session::from(resp);
        assert_eq!(session.session_id, "abc");
        assert_eq!(session.user_id.as_deref(), Some("local"));
        assert!(session.output_path_prefix_enabled);
        assert_eq!(session.permissions.len(), 2);
        assert!(session.has_permission("admin"));
    }

    #[test]
    fn optional_fields_default() {
        let resp: NewSessionResponse = serde_json::from_str(r#"{"session_id":"abc"}"#).unwrap();
        let session = Session::from(resp);
        assert_eq!(session, Session::new("abc"));
        assert!(!session.has_permission("basic"));
    }

    #[test]
    fn missing_session_id_is_rejected() {
        assert!(serde_json::from_str::<NewSessionResponse>(r#"{"user_id":"x"}"#).is_err());
    }
}
