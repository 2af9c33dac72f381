//! Offset tracking: when a consumer checkpoints, and what it last checkpointed.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::Offset;

/// Store interval used by the periodic policy when none is given.
pub const DEFAULT_STORE_EVERY: u64 = 10_000;

/// Decides when a consumer stores its offset without being asked.
///
/// Handlers may always call `MessageContext::store_offset` on top of
/// whatever policy is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum TrackingPolicy {
    /// Never store automatically.
    #[default]
    Manual,
    /// Store after every `every` records processed since the last store.
    Periodic { every: u64 },
}

impl TrackingPolicy {
    #[must_use]
    pub const fn manual() -> Self {
        Self::Manual
    }

    #[must_use]
    pub const fn periodic(every: u64) -> Self {
        Self::Periodic { every }
    }

    /// Whether this policy stores offsets on its own.
    #[must_use]
    pub const fn is_automatic(&self) -> bool {
        matches!(self, Self::Periodic { .. })
    }

    /// Validate the policy.
    ///
    /// # Errors
    /// Returns `Error::InvalidConfig` for a zero interval.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Periodic { every: 0 } => Err(Error::invalid_config(
                "periodic tracking interval must be positive",
            )),
            _ => Ok(()),
        }
    }

    /// Whether an automatic store is due given the current tracking state.
    #[must_use]
    pub const fn should_store(&self, state: &TrackingState) -> bool {
        match self {
            Self::Manual => false,
            Self::Periodic { every } => *every > 0 && state.processed_since_store >= *every,
        }
    }
}

/// Per-subscription checkpoint bookkeeping.
///
/// Owned by a single delivery loop, never shared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TrackingState {
    last_stored: Option<Offset>,
    last_delivered: Option<Offset>,
    processed_since_store: u64,
}

impl TrackingState {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            last_stored: None,
            last_delivered: None,
            processed_since_store: 0,
        }
    }

    /// State for a consumer restarting from an already stored offset.
    #[must_use]
    pub const fn resumed(stored: Offset) -> Self {
        Self {
            last_stored: Some(stored),
            last_delivered: None,
            processed_since_store: 0,
        }
    }

    /// Note that the record at `offset` was fully handled.
    pub fn record_delivered(&mut self, offset: Offset) {
        self.last_delivered = Some(self.last_delivered.map_or(offset, |last| last.max(offset)));
        self.processed_since_store = self.processed_since_store.saturating_add(1);
    }

    /// Whether storing `offset` would advance the checkpoint without going past delivery.
    #[must_use]
    pub fn can_store(&self, offset: Offset) -> bool {
        let delivered = self.last_delivered.is_some_and(|last| offset <= last);
        let advances = self.last_stored.is_none_or(|stored| offset > stored);
        delivered && advances
    }

    /// Record a successful store of `offset`.
    ///
    /// Returns `false`, leaving the state untouched, when the offset would not
    /// advance the checkpoint or lies beyond the last delivered record.
    pub fn mark_stored(&mut self, offset: Offset) -> bool {
        if !self.can_store(offset) {
            return false;
        }
        self.last_stored = Some(offset);
        self.processed_since_store = 0;
        true
    }

    #[must_use]
    pub const fn last_stored(&self) -> Option<Offset> {
        self.last_stored
    }

    #[must_use]
    pub const fn last_delivered(&self) -> Option<Offset> {
        self.last_delivered
    }

    #[must_use]
    pub const fn processed_since_store(&self) -> u64 {
        self.processed_since_store
    }
}
