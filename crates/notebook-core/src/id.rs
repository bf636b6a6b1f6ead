//! Opaque identifiers for notebooks, cells and execution runs.
//!
//! All identifiers are UUID v4 strings, so an ID is never handed out twice
//! within a process, including after the entity it named was deleted.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! opaque_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Allocate a fresh, never-before-seen identifier.
            pub fn generate() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

opaque_id!(
    /// Identifies a notebook in the store.
    NotebookId
);

opaque_id!(
    /// Identifies a cell. Stable across reorders and edits.
    CellId
);

opaque_id!(
    /// Token for one execution attempt of a cell.
    ///
    /// Output and completion for a run are only committed while the cell's
    /// recorded run token still matches.
    RunId
);
