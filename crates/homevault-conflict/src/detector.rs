//! Freshness detection
//!
//! Decides, for a file that is in sync on paper, which side moved since the
//! last confirmed sync. Timestamps are compared at millisecond granularity;
//! equal timestamps never pick a winner.

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use homevault_core::domain::ContentHash;

/// Outcome of a freshness comparison
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// Nothing to do
    UpToDate,
    /// The local copy changed after the remote one; push it
    PushLocal,
    /// The remote copy changed since it was last seen; download it
    PullRemote,
    /// Neither side is newer but the content differs
    Conflict,
}

/// Everything the comparison looks at
#[derive(Debug, Clone, Copy)]
pub struct FreshnessInput<'a> {
    pub local_modified: DateTime<Utc>,
    pub local_hash: &'a ContentHash,
    /// Hash the client was last confirmed to hold
    pub last_known_hash: Option<&'a ContentHash>,
    pub remote_modified: DateTime<Utc>,
    /// Hash reported by the provider listing, if it reports one
    pub remote_hash: Option<&'a ContentHash>,
    /// Remote timestamp recorded at the last confirmed sync
    pub stored_remote_modified: Option<DateTime<Utc>>,
}

/// Compares local and remote versions of a tracked file
pub struct FreshnessDetector;

impl FreshnessDetector {
    /// Evaluates which side, if any, should win
    ///
    /// 1. Local strictly newer than remote with content that drifted from
    ///    the last known hash: push.
    /// 2. Remote newer than the recorded remote timestamp: pull. With no
    ///    recorded timestamp the remote must be newer than the local file.
    /// 3. Neither newer and the content differs: conflict.
    pub fn evaluate(input: &FreshnessInput<'_>) -> Freshness {
        let local_ms = input.local_modified.timestamp_millis();
        let remote_ms = input.remote_modified.timestamp_millis();

        let local_drifted = input.last_known_hash != Some(input.local_hash);
        if local_ms > remote_ms && local_drifted {
            debug!(local_ms, remote_ms, "Local copy is newer");
            return Freshness::PushLocal;
        }

        let remote_newer = match input.stored_remote_modified {
            Some(stored) => remote_ms > stored.timestamp_millis(),
            None => remote_ms > local_ms,
        };
        if remote_newer {
            debug!(remote_ms, "Remote copy is newer");
            return Freshness::PullRemote;
        }

        let remote_hash = input.remote_hash.or(input.last_known_hash);
        match remote_hash {
            Some(remote) if remote != input.local_hash => {
                info!(
                    local_hash = %input.local_hash,
                    remote_hash = %remote,
                    "Content differs with no newer side"
                );
                Freshness::Conflict
            }
            _ => Freshness::UpToDate,
        }
    }
}
