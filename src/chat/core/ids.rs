//! Conversation and message identifiers.
//!
//! UUID newtypes, so a message id cannot be passed where a conversation id is
//! expected. Stored as canonical hyphenated TEXT. With the `uuid_v7` feature
//! new ids are time-ordered.

use std::fmt;
use std::str::FromStr;

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[cfg(feature = "uuid_v7")]
fn fresh_uuid() -> Uuid {
    Uuid::now_v7()
}

#[cfg(not(feature = "uuid_v7"))]
fn fresh_uuid() -> Uuid {
    Uuid::new_v4()
}

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Generate a fresh identifier.
            #[must_use]
            pub fn new() -> Self {
                Self(fresh_uuid())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }

        impl ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.0.to_string()))
            }
        }

        impl FromSql for $name {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                value
                    .as_str()?
                    .parse()
                    .map_err(|err| FromSqlError::Other(Box::new(err)))
            }
        }
    };
}

uuid_id!(
    /// Identifier of a conversation.
    ///
    /// Stable for the whole lifetime of the conversation; the only handle the
    /// UI and the title generator use to address it.
    ConversationId
);

uuid_id!(
    /// Identifier of a single persisted message.
    MessageId
);
