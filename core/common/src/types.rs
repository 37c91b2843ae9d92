//! Identifier types used throughout the sync engine.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Generate a fresh random identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Wrap an existing UUID.
            pub fn from_uuid(id: Uuid) -> Self {
                Self(id)
            }

            /// Get the inner UUID.
            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = crate::Error;

            fn from_str(s: &str) -> crate::Result<Self> {
                Uuid::parse_str(s).map(Self).map_err(|e| {
                    crate::Error::InvalidInput(format!(
                        "invalid {} '{}': {}",
                        stringify!($name),
                        s,
                        e
                    ))
                })
            }
        }
    };
}

uuid_id!(
    /// Tenant owning tasks, executions and conflicts.
    TenantId
);
uuid_id!(
    /// A configured sync task.
    TaskId
);
uuid_id!(
    /// One attempt at running a sync task.
    ExecutionId
);
uuid_id!(
    /// A detected bidirectional sync conflict.
    ConflictId
);
uuid_id!(
    /// A tenant's connection to an external system.
    IntegrationId
);
uuid_id!(
    /// A tenant-defined conversion schema.
    SchemaId
);
uuid_id!(
    /// The user who triggered or resolved something.
    UserId
);

/// Identifier of a stored entity (shard), assigned by the shard service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShardId(String);

impl ShardId {
    /// Create a shard id.
    ///
    /// # Errors
    /// - Returns error if id is empty
    pub fn new(id: impl Into<String>) -> crate::Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(crate::Error::InvalidInput(
                "ShardId cannot be empty".to_string(),
            ));
        }
        Ok(Self(id))
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
