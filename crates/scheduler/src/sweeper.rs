//! Claim-timeout sweep.
//!
//! A worker that dies mid-execution never settles its claim. The sweep hands
//! such rows back to PENDING with counters and due time untouched, so the next
//! poll (from any process) picks them up again. A worker that was merely slow
//! finds its claim gone when it tries to settle and logs `ClaimLost`.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::worker::ExecutionContext;

/// Release every claim older than `timeout`. Returns how many were released.
pub(crate) fn sweep_expired_claims(
    ctx: &ExecutionContext,
    timeout: Duration,
    now: DateTime<Utc>,
) -> usize {
    let Some(claimed_before) = chrono::Duration::from_std(timeout)
        .ok()
        .and_then(|t| now.checked_sub_signed(t))
    else {
        return 0;
    };

    let released = match ctx.store_retry.run("release_expired_claims", || {
        ctx.store.release_expired_claims(claimed_before)
    }) {
        Ok(ids) => ids,
        Err(e) => {
            ctx.stats.update(|s| s.store_errors += 1);
            warn!(error = %e, "claim-timeout sweep failed");
            return 0;
        }
    };

    for id in &released {
        warn!(
            instance_id = %id,
            claimed_before = %claimed_before,
            "released stale claim"
        );
    }
    ctx.stats.update(|s| s.swept += released.len() as u64);
    released.len()
}
