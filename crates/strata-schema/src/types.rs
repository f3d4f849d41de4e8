//! Newtype wrappers for tree identities.
//!
//! Identities serialize as plain hex strings so result records and the store
//! layout stay human-readable.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;

/// Number of hex characters shown when an identity is abbreviated for logs.
pub const SHORT_ID_LEN: usize = 12;

macro_rules! id_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

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

        impl AsRef<std::path::Path> for $name {
            fn as_ref(&self) -> &std::path::Path {
                std::path::Path::new(&self.0)
            }
        }

        impl PartialEq<str> for $name {
            fn eq(&self, other: &str) -> bool {
                self.0 == other
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }
    };
}

id_newtype!(
    /// Full 64-character hex identity of a stage's cumulative effect on a tree.
    TreeId
);

id_newtype!(
    /// Truncated prefix of a [`TreeId`], used for display.
    ShortId
);

impl TreeId {
    pub fn short(&self) -> ShortId {
        let end = self
            .0
            .char_indices()
            .nth(SHORT_ID_LEN)
            .map_or(self.0.len(), |(i, _)| i);
        ShortId::new(&self.0[..end])
    }

    /// Whether the identity is safe to use as a single path component.
    pub fn is_valid(&self) -> bool {
        !self.0.is_empty() && self.0.bytes().all(|b| b.is_ascii_hexdigit())
    }
}
