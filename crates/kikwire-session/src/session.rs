//! The per-account session record.
//!
//! A session is what the client remembers about an account between
//! runs. The important field is `node`: once the server has assigned a
//! routing node, every later connection authenticates against it
//! directly instead of repeating node discovery.

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Persisted per-account state.
///
/// `node` is `Some` if and only if node discovery has completed at least
/// once for this account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Device identifier, 32 lowercase hex digits.
    pub device_id: String,
    /// Installation identifier, 16 lowercase hex digits.
    pub android_id: String,
    /// Server-assigned routing node.
    #[serde(default)]
    pub node: Option<String>,
    /// Last captcha answer sent during node discovery.
    #[serde(default)]
    pub captcha_token: Option<String>,
}

impl Session {
    /// A brand-new session with random device identifiers and no node.
    pub fn fresh() -> Self {
        Self {
            device_id: random_hex(16),
            android_id: random_hex(8),
            node: None,
            captcha_token: None,
        }
    }

    /// Returns a copy with `node` set.
    pub fn with_node(mut self, node: impl Into<String>) -> Self {
        self.node = Some(node.into());
        self
    }

    /// Returns `true` once node discovery has completed.
    pub fn has_node(&self) -> bool {
        self.node.is_some()
    }
}

/// `len` random bytes as lowercase hex.
fn random_hex(len: usize) -> String {
    let mut rng = rand::rng();
    (0..len).map(|_| format!("{:02x}", rng.random::<u8>())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_has_hex_ids_and_no_node() {
        let s = Session::fresh();
        assert_eq!(s.device_id.len(), 32);
        assert_eq!(s.android_id.len(), 16);
        assert!(s.device_id.chars().all(|c| c.is_ascii_hexdigit()));
        assert!(!s.has_node());
        assert!(s.captcha_token.is_none());
    }

    #[test]
    fn test_fresh_sessions_differ() {
        assert_ne!(Session::fresh().device_id, Session::fresh().device_id);
    }

    #[test]
    fn test_with_node_keeps_device_ids() {
        let s = Session::fresh();
        let noded = s.clone().with_node("node123@talk.kik.com");
        assert_eq!(noded.node.as_deref(), Some("node123@talk.kik.com"));
        assert_eq!(noded.device_id, s.device_id);
        assert_eq!(noded.android_id, s.android_id);
    }

    #[test]
    fn test_deserialize_without_optional_fields() {
        let s: Session =
            serde_json::from_str(r#"{"device_id":"aa","android_id":"bb"}"#).unwrap();
        assert_eq!(s.node, None);
        assert_eq!(s.captcha_token, None);
    }
}
