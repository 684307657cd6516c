//! Unique identifiers for evolution entities.

use serde::{Deserialize, Serialize};
use ulid::Ulid;

macro_rules! ulid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(Ulid);

        impl $name {
            /// Generate a new identifier.
            pub fn new() -> Self {
                Self(Ulid::new())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                self.0.fmt(f)
            }
        }

        impl std::str::FromStr for $name {
            type Err = ulid::DecodeError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.parse()?))
            }
        }
    };
}

ulid_id! {
    /// Unique identifier for a Trajectory
    TrajectoryId
}

ulid_id! {
    /// Unique identifier for a Checkpoint
    CheckpointId
}

ulid_id! {
    /// Unique identifier for one evolution run
    RunId
}

ulid_id! {
    /// Unique identifier for a SafetyReport
    SafetyReportId
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_display_roundtrip() {
        let id = TrajectoryId::new();
        let parsed: TrajectoryId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_ids_are_unique() {
        assert_ne!(RunId::new(), RunId::new());
    }
}
