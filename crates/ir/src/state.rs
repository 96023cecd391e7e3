//! Tracker states shared between the catalog and the engine.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
/// Lifecycle state of a resource handle.
pub enum HandleState {
    Acquired,
    Closed,
    /// Returned, stored outside the scope or handed to an owner.
    Escaped,
    /// The declaring scope exited on some path without release or escape.
    Leaked,
}

impl fmt::Display for HandleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HandleState::Acquired => "acquired",
            HandleState::Closed => "closed",
            HandleState::Escaped => "escaped",
            HandleState::Leaked => "leaked",
        };
        write!(f, "{s}")
    }
}

impl FromStr for HandleState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "acquired" => Ok(HandleState::Acquired),
            "closed" => Ok(HandleState::Closed),
            "escaped" => Ok(HandleState::Escaped),
            "leaked" => Ok(HandleState::Leaked),
            other => Err(format!("unknown handle state '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
/// Kind of a transaction context.
pub enum TxKind {
    Manual,
    Declarative,
}
