//! Newtype wrappers for identifiers and digests.
//!
//! All newtypes serialize/deserialize as plain strings.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;

macro_rules! string_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new instance from a string.
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            /// Return the inner string as a slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume self and return the inner `String`.
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl Deref for $name {
            type Target = str;
            fn deref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl PartialEq<str> for $name {
            fn eq(&self, other: &str) -> bool {
                self.0 == other
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }
    };
}

string_newtype!(
    /// Reverse-DNS application identifier, e.g. `org.example.editor`.
    AppId
);

string_newtype!(
    /// Lowercase 64-character hex SHA-256 digest.
    ///
    /// Construct through [`Sha256Digest::parse`] to get validation; `new`
    /// trusts its input and is meant for digests computed locally.
    Sha256Digest
);

impl Sha256Digest {
    /// Validate and normalize (lowercase) a hex SHA-256 digest.
    pub fn parse(s: &str) -> Option<Self> {
        let trimmed = s.trim();
        if trimmed.len() == 64 && trimmed.bytes().all(|b| b.is_ascii_hexdigit()) {
            Some(Self(trimmed.to_ascii_lowercase()))
        } else {
            None
        }
    }

    /// Case-insensitive comparison against a computed hex digest.
    pub fn matches(&self, actual_hex: &str) -> bool {
        self.0.eq_ignore_ascii_case(actual_hex)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn app_id_display_and_as_ref() {
        let id = AppId::new("org.example.app");
        assert_eq!(id.to_string(), "org.example.app");
        assert_eq!(AsRef::<str>::as_ref(&id), "org.example.app");
    }

    #[test]
    fn digest_parse_normalizes_case() {
        let upper = "E3B0C44298FC1C149AFBF4C8996FB92427AE41E4649B934CA495991B7852B855";
        let digest = Sha256Digest::parse(upper).unwrap();
        assert_eq!(
            digest.as_str(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert!(digest.matches(upper));
    }

    #[test]
    fn digest_parse_rejects_bad_input() {
        assert!(Sha256Digest::parse("").is_none());
        assert!(Sha256Digest::parse("abc").is_none());
        assert!(Sha256Digest::parse(&"g".repeat(64)).is_none());
    }

    #[test]
    fn digest_serde_is_transparent() {
        let d = Sha256Digest::new("00".repeat(32));
        let json = serde_json::to_string(&d).unwrap();
        assert_eq!(json, format!("\"{}\"", "00".repeat(32)));
    }
}
