//! Strongly typed identifiers.
//!
//! Every identifier wraps a UUID v7 (time-sortable) so that IDs minted on the
//! same node sort by creation time.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Mint a new identifier using UUID v7.
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            /// Wrap an existing UUID.
            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
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
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }
    };
}

uuid_id!(
    /// Identity of a service definition (the aggregate root).
    ServiceId
);
uuid_id!(
    /// Tenant that owns a service definition.
    TenantId
);
uuid_id!(
    /// An authoring or initiating user.
    UserId
);
uuid_id!(
    /// A published, immutable version of a service definition.
    VersionId
);
uuid_id!(
    /// One running (or finished) execution of a published workflow.
    InstanceId
);
