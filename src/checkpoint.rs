//! Checkpoint timestamp for snapshot-consistent recovery

use serde::{Deserialize, Serialize};

use crate::Timestamp;

/// Largest representable version stamp
pub const MAX_TIMESTAMP: Timestamp = Timestamp::MAX;

/// A recovery checkpoint.
///
/// Recovery reconciles every multi-version record chain against the
/// checkpoint timestamp so that the rebuilt state equals the moment the
/// checkpoint was taken. A zero timestamp means "no checkpoint, recover the
/// latest versions".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    ts: Timestamp,
}

impl Checkpoint {
    /// A checkpoint at the given timestamp
    pub const fn new(ts: Timestamp) -> Self {
        Self { ts }
    }

    /// The "no checkpoint" marker
    pub const fn none() -> Self {
        Self { ts: 0 }
    }

    /// Whether a checkpoint was taken
    #[inline]
    pub const fn valid(&self) -> bool {
        self.ts > 0
    }

    /// The checkpoint timestamp
    #[inline]
    pub const fn checkpoint_ts(&self) -> Timestamp {
        self.ts
    }
}
