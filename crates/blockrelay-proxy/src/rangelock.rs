//! Sector-range lock manager
//!
//! Per-slot list of in-flight locked LBA ranges. Acquisition is
//! all-or-nothing against every currently-held range on the slot; a
//! blocked context stays linked as a waiter, parked inside its list entry,
//! until an unlock grants it and pushes it onto the retry queue. One
//! unlock may grant several waiters.

use crate::directory::Slot;
use crate::engine::WriteContext;
use blockrelay_common::{BlockCount, Lba};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Identity of one lock-list entry.
pub type Ticket = u64;

struct LockEntry {
    ticket: Ticket,
    start_lba: Lba,
    block_count: BlockCount,
    held: bool,
    /// Present only while the entry is a waiter.
    parked: Option<Box<WriteContext>>,
}

/// Lock list anchored on a directory slot.
#[derive(Default)]
pub struct LockList {
    entries: Vec<LockEntry>,
}

impl LockList {
    /// Number of entries currently holding their range.
    #[must_use]
    pub fn held_count(&self) -> usize {
        self.entries.iter().filter(|e| e.held).count()
    }

    /// Number of entries still waiting.
    #[must_use]
    pub fn waiter_count(&self) -> usize {
        self.entries.iter().filter(|e| !e.held).count()
    }
}

/// Result of a lock attempt.
pub enum LockAttempt {
    /// The range is held; the context is handed back to keep running.
    Locked(Box<WriteContext>),
    /// An overlapping range is in flight; the context is parked.
    Queued,
}

/// `[a, a+n)` and `[b, b+m)` intersect.
#[must_use]
pub const fn ranges_overlap(a: Lba, n: BlockCount, b: Lba, m: BlockCount) -> bool {
    a < b + m && b < a + n
}

/// Range lock manager shared by all slots.
pub struct RangeLockManager {
    next_ticket: AtomicU64,
    retry_tx: mpsc::UnboundedSender<Box<WriteContext>>,
}

impl RangeLockManager {
    pub fn new(retry_tx: mpsc::UnboundedSender<Box<WriteContext>>) -> Self {
        Self {
            next_ticket: AtomicU64::new(1),
            retry_tx,
        }
    }

    /// Try to lock the context's pre-read range on `slot`.
    ///
    /// The entry is linked either way; only a range overlapping no held
    /// entry is marked held.
    pub fn lock(&self, slot: &Slot, mut context: Box<WriteContext>) -> LockAttempt {
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        context.ticket = Some(ticket);
        let (start_lba, block_count) = context.pre_read_range();

        let mut list = slot.locks.lock();
        let blocked = list
            .entries
            .iter()
            .any(|e| e.held && ranges_overlap(e.start_lba, e.block_count, start_lba, block_count));

        if blocked {
            debug!(ticket, start_lba, block_count, "range busy, queueing");
            list.entries.push(LockEntry {
                ticket,
                start_lba,
                block_count,
                held: false,
                parked: Some(context),
            });
            LockAttempt::Queued
        } else {
            context.region_locked = true;
            list.entries.push(LockEntry {
                ticket,
                start_lba,
                block_count,
                held: true,
                parked: None,
            });
            LockAttempt::Locked(context)
        }
    }

    /// Release the range held under `ticket` and grant any waiters whose
    /// range no longer overlaps a held range. Granted contexts go to the
    /// retry queue for re-dispatch.
    pub fn unlock(&self, slot: &Slot, ticket: Ticket) {
        let mut granted = Vec::new();
        {
            let mut list = slot.locks.lock();
            let Some(position) = list.entries.iter().position(|e| e.ticket == ticket) else {
                warn!(ticket, "unlock for unknown ticket");
                return;
            };
            list.entries.remove(position);

            // A grant makes the entry held, which the next iteration must
            // see, so waiters are re-checked against the live list.
            for index in 0..list.entries.len() {
                if list.entries[index].held {
                    continue;
                }
                let (start_lba, block_count) =
                    (list.entries[index].start_lba, list.entries[index].block_count);
                let blocked = list.entries.iter().enumerate().any(|(other, e)| {
                    other != index
                        && e.held
                        && ranges_overlap(e.start_lba, e.block_count, start_lba, block_count)
                });
                if !blocked {
                    let entry = &mut list.entries[index];
                    entry.held = true;
                    let mut context = entry.parked.take().expect("waiter owns its context");
                    context.region_locked = true;
                    granted.push(context);
                }
            }
        }

        for context in granted {
            debug!(
                ticket = context.ticket.unwrap_or_default(),
                "granting queued range lock"
            );
            if self.retry_tx.send(context).is_err() {
                warn!("retry queue closed; dropping granted write context");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::Directory;
    use blockrelay_common::SlotId;

    fn manager() -> (RangeLockManager, mpsc::UnboundedReceiver<Box<WriteContext>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (RangeLockManager::new(tx), rx)
    }

    fn context(lba: Lba, blocks: BlockCount) -> Box<WriteContext> {
        WriteContext::stub(SlotId::new(0), lba, blocks)
    }

    #[test]
    fn overlap_arithmetic() {
        assert!(ranges_overlap(0, 4, 3, 2));
        assert!(ranges_overlap(3, 2, 0, 4));
        assert!(!ranges_overlap(0, 4, 4, 4));
        assert!(!ranges_overlap(8, 2, 0, 8));
        assert!(ranges_overlap(5, 1, 5, 1));
    }

    #[test]
    fn non_overlapping_ranges_both_lock() {
        let directory = Directory::new(1);
        let slot = directory.slot(SlotId::new(0)).unwrap();
        let (locks, _rx) = manager();

        assert!(matches!(
            locks.lock(slot, context(0, 4)),
            LockAttempt::Locked(_)
        ));
        assert!(matches!(
            locks.lock(slot, context(4, 4)),
            LockAttempt::Locked(_)
        ));
        assert_eq!(slot.locks.lock().held_count(), 2);
    }

    #[test]
    fn overlapping_range_queues_until_unlock() {
        let directory = Directory::new(1);
        let slot = directory.slot(SlotId::new(0)).unwrap();
        let (locks, mut rx) = manager();

        let LockAttempt::Locked(first) = locks.lock(slot, context(0, 8)) else {
            panic!("first lock must be granted");
        };
        assert!(matches!(locks.lock(slot, context(4, 4)), LockAttempt::Queued));
        assert_eq!(slot.locks.lock().waiter_count(), 1);
        assert!(rx.try_recv().is_err());

        locks.unlock(slot, first.ticket.unwrap());
        let resumed = rx.try_recv().expect("waiter granted on unlock");
        assert!(resumed.region_locked);
        assert_eq!(slot.locks.lock().held_count(), 1);
        assert_eq!(slot.locks.lock().waiter_count(), 0);
    }

    #[test]
    fn unlock_grants_cascade_to_all_unblocked_waiters() {
        let directory = Directory::new(1);
        let slot = directory.slot(SlotId::new(0)).unwrap();
        let (locks, mut rx) = manager();

        let LockAttempt::Locked(wide) = locks.lock(slot, context(0, 16)) else {
            panic!("first lock must be granted");
        };
        assert!(matches!(locks.lock(slot, context(0, 4)), LockAttempt::Queued));
        assert!(matches!(locks.lock(slot, context(8, 4)), LockAttempt::Queued));

        locks.unlock(slot, wide.ticket.unwrap());
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_ok());
        assert_eq!(slot.locks.lock().held_count(), 2);
    }

    #[test]
    fn cascade_respects_mutual_overlap_between_waiters() {
        let directory = Directory::new(1);
        let slot = directory.slot(SlotId::new(0)).unwrap();
        let (locks, mut rx) = manager();

        let LockAttempt::Locked(wide) = locks.lock(slot, context(0, 16)) else {
            panic!("first lock must be granted");
        };
        assert!(matches!(locks.lock(slot, context(0, 8)), LockAttempt::Queued));
        assert!(matches!(locks.lock(slot, context(4, 8)), LockAttempt::Queued));

        // Only the first waiter can be granted; the second overlaps it.
        locks.unlock(slot, wide.ticket.unwrap());
        let granted = rx.try_recv().expect("first waiter granted");
        assert!(rx.try_recv().is_err());
        assert_eq!(slot.locks.lock().waiter_count(), 1);

        locks.unlock(slot, granted.ticket.unwrap());
        assert!(rx.try_recv().is_ok());
    }
}
