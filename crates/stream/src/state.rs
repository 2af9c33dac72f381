//! Consumer subscription lifecycle.
//!
//! `Created -> ResolvingStart -> Delivering -> Closed`, where any state may
//! move to `Closed` and `Closed` is terminal.

use std::fmt;

use crate::error::{Error, Result};

/// States of one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConsumerState {
    /// Subscribed, delivery task not yet running.
    #[default]
    Created,

    /// Looking up the stored offset or resolving the offset spec.
    ResolvingStart,

    /// Reading, handling and checkpointing records.
    Delivering,

    Closed,
}

impl ConsumerState {
    /// Transition from Created to ResolvingStart.
    ///
    /// # Errors
    /// Returns `Error::InvalidState` unless the current state is Created.
    pub fn start_resolving(self) -> Result<Self> {
        match self {
            Self::Created => Ok(Self::ResolvingStart),
            current => Err(Error::invalid_state(current.to_string(), "RESOLVING_START")),
        }
    }

    /// Transition from ResolvingStart to Delivering.
    ///
    /// # Errors
    /// Returns `Error::InvalidState` unless the current state is ResolvingStart.
    pub fn start_delivering(self) -> Result<Self> {
        match self {
            Self::ResolvingStart => Ok(Self::Delivering),
            current => Err(Error::invalid_state(current.to_string(), "DELIVERING")),
        }
    }

    /// Transition from any state to Closed.
    #[must_use]
    pub const fn close(self) -> Self {
        Self::Closed
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Closed)
    }

    /// Whether records may currently be handed to the handler.
    #[must_use]
    pub const fn is_delivering(self) -> bool {
        matches!(self, Self::Delivering)
    }
}

impl fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "CREATED",
            Self::ResolvingStart => "RESOLVING_START",
            Self::Delivering => "DELIVERING",
            Self::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}
