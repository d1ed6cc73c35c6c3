//! Typed identifier wrappers.
//!
//! Plain `String`/`u64` newtypes that stop a session id from being passed
//! where an intent name belongs, and vice versa. No format is enforced —
//! callers decide whether ids are ULIDs, UUIDs, or opaque tokens.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! typed_string_id {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl $name {
            /// Create a new typed id from anything that converts to `String`.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Borrow the inner string.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

typed_string_id!(SessionId, "Unique identifier for a conversation session.");
typed_string_id!(UserId, "Unique identifier for a user.");
typed_string_id!(IntentName, "Stable, unique identifier for a configured intent.");
typed_string_id!(SlotName, "Name of a slot, unique within its owning intent.");
typed_string_id!(TaskId, "Unique identifier for an async task (ULID-like).");
typed_string_id!(RequestId, "Unique identifier for one inbound turn request, for tracing.");

/// A conversation turn number. Starts at 1; a session with N recorded
/// turns has turn numbers exactly `{1, ..., N}` with no gaps (spec §3, §8).
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct TurnNumber(pub u64);

impl TurnNumber {
    /// The first turn number of any session.
    pub const FIRST: TurnNumber = TurnNumber(1);

    /// The turn number immediately following this one.
    pub fn next(self) -> TurnNumber {
        TurnNumber(self.0 + 1)
    }
}

impl fmt::Display for TurnNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
