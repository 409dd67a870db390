//! Secret values that must never reach a log line.
//!
//! Room passwords and the media-engine attach token travel through request
//! bodies, configuration and actor messages. They are wrapped in
//! [`SecretString`] so that `Debug` output (and therefore `tracing` fields
//! formatted with `?`) shows `[REDACTED]` instead of the value.
//!
//! ```rust
//! use common::secret::{ExposeSecret, SecretString};
//!
//! #[derive(Debug)]
//! struct CreateRoom {
//!     name: String,
//!     password: SecretString,
//! }
//!
//! let req = CreateRoom {
//!     name: "standup".to_string(),
//!     password: SecretString::from("hunter2"),
//! };
//! assert!(!format!("{req:?}").contains("hunter2"));
//! assert_eq!(req.password.expose_secret(), "hunter2");
//! ```

pub use secrecy::{ExposeSecret, SecretBox, SecretString};

/// Compare a stored secret with a caller-supplied candidate.
///
/// The comparison walks the full length of both inputs so that the time taken
/// does not reveal the position of the first mismatching byte.
#[must_use]
pub fn secret_matches(stored: &SecretString, candidate: &str) -> bool {
    let stored = stored.expose_secret().as_bytes();
    let candidate = candidate.as_bytes();

    let mut diff = stored.len() ^ candidate.len();
    for (i, byte) in stored.iter().enumerate() {
        let other = candidate.get(i).copied().unwrap_or(0);
        diff |= usize::from(byte ^ other);
    }
    diff == 0
}

/// Whether a secret holds an empty value (used for "no password" rooms).
#[must_use]
pub fn is_blank(secret: &SecretString) -> bool {
    secret.expose_secret().is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[test]
    fn test_debug_is_redacted() {
        let secret = SecretString::from("hunter2");
        let debug_str = format!("{secret:?}");

        assert!(debug_str.contains("REDACTED"));
        assert!(!debug_str.contains("hunter2"));
    }

    #[test]
    fn test_secret_matches() {
        let stored = SecretString::from("open-sesame");
        assert!(secret_matches(&stored, "open-sesame"));
        assert!(!secret_matches(&stored, "open-sesam"));
        assert!(!secret_matches(&stored, "open-sesame!"));
        assert!(!secret_matches(&stored, ""));
    }

    #[test]
    fn test_blank_secret() {
        assert!(is_blank(&SecretString::from("")));
        assert!(!is_blank(&SecretString::from("x")));
        assert!(secret_matches(&SecretString::from(""), ""));
    }

    #[test]
    fn test_deserialize_keeps_value_hidden() {
        #[allow(dead_code)]
        #[derive(Debug, Deserialize)]
        struct JoinRequest {
            password: SecretString,
        }

        let req: JoinRequest =
            serde_json::from_str(r#"{"password": "my-secret-value"}"#).expect("deserialize");

        assert_eq!(req.password.expose_secret(), "my-secret-value");
        assert!(!format!("{req:?}").contains("my-secret-value"));
    }
}
