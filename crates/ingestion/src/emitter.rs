//! Snapshot emission schedule and sequence numbering.

use std::time::Duration;

use tokio::time::Instant;

/// Monotonic snapshot sequence, continued across reconnects
#[derive(Debug, Clone, Default)]
pub struct SequenceGenerator {
    last: u64,
}

impl SequenceGenerator {
    /// Continue after `last`, typically the archive's latest sequence
    pub fn starting_after(last: u64) -> Self {
        Self { last }
    }

    pub fn next(&mut self) -> u64 {
        self.last += 1;
        self.last
    }

    pub fn last(&self) -> u64 {
        self.last
    }
}

/// Decides when snapshots are due.
///
/// Changes are coalesced: the first change after an emission opens a window
/// and one snapshot goes out when it closes. A zero window emits per change.
/// Independently, a periodic snapshot is due every `periodic` interval.
#[derive(Debug, Clone)]
pub struct EmissionSchedule {
    coalesce_window: Duration,
    periodic: Duration,
    dirty_since: Option<Instant>,
    next_periodic: Instant,
}

impl EmissionSchedule {
    pub fn new(coalesce_window: Duration, periodic: Duration, now: Instant) -> Self {
        Self {
            coalesce_window,
            periodic,
            dirty_since: None,
            next_periodic: now + periodic,
        }
    }

    /// Record a book change. Returns `true` when the snapshot is due now.
    pub fn mark_dirty(&mut self, now: Instant) -> bool {
        if self.coalesce_window.is_zero() {
            return true;
        }
        if self.dirty_since.is_none() {
            self.dirty_since = Some(now);
        }
        false
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty_since.is_some()
    }

    /// When the pending change snapshot is due
    pub fn change_deadline(&self) -> Option<Instant> {
        self.dirty_since.map(|since| since + self.coalesce_window)
    }

    pub fn periodic_deadline(&self) -> Instant {
        self.next_periodic
    }

    /// A change snapshot went out
    pub fn change_emitted(&mut self) {
        self.dirty_since = None;
    }

    /// A periodic snapshot went out at `now`. It also covers any pending
    /// change.
    pub fn periodic_emitted(&mut self, now: Instant) {
        self.dirty_since = None;
        self.next_periodic += self.periodic;
        if self.next_periodic <= now {
            self.next_periodic = now + self.periodic;
        }
    }
}

/// Sleep until `deadline`, or forever when there is none
pub(crate) async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
