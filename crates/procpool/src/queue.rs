//! FIFO queue of pending submissions.
//!
//! Strict FIFO among enqueued submissions; cancelled entries are taken out
//! in place without disturbing the order of the rest. Capacity accounting
//! rides on semaphore permits: one permit per slot, tombstones included, so
//! takers and entries always balance.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Semaphore;

use crate::submission::{ErasedSubmission, Slot, SubmissionId};

pub(crate) struct SubmissionQueue {
    slots: Mutex<VecDeque<Slot>>,
    permits: Semaphore,
    /// Orderly shutdown: close once the last real entry has been taken.
    draining: AtomicBool,
}

impl SubmissionQueue {
    pub(crate) fn new() -> Self {
        Self {
            slots: Mutex::new(VecDeque::new()),
            permits: Semaphore::new(0),
            draining: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a submission. Fails once shutdown has been requested.
    pub(crate) fn push(&self, slot: Slot) -> Result<(), Slot> {
        if self.draining.load(Ordering::Acquire) || self.permits.is_closed() {
            return Err(slot);
        }
        self.lock().push_back(slot);
        self.permits.add_permits(1);
        Ok(())
    }

    /// Wait for the next submission. Returns `None` once the queue has shut
    /// down and drained.
    pub(crate) async fn take(&self) -> Option<Slot> {
        loop {
            let permit = self.permits.acquire().await.ok()?;
            permit.forget();

            let mut slots = self.lock();
            let Some(slot) = slots.pop_front() else {
                // Permit left over from a drained entry.
                continue;
            };
            let emptied = slots.iter().all(Slot::is_tombstone);
            drop(slots);

            if self.draining.load(Ordering::Acquire) && emptied {
                self.permits.close();
            }
            if slot.is_tombstone() {
                continue;
            }
            return Some(slot);
        }
    }

    /// Remove a queued submission by id, leaving a tombstone in its place.
    pub(crate) fn remove(&self, id: SubmissionId) -> Option<Box<dyn ErasedSubmission>> {
        self.lock()
            .iter_mut()
            .find(|slot| slot.id == id)
            .and_then(|slot| slot.work.take())
    }

    /// Take every pending submission out and refuse all further traffic.
    pub(crate) fn drain_and_close(&self) -> Vec<Slot> {
        let drained: Vec<Slot> = {
            let mut slots = self.lock();
            slots.drain(..).filter(|slot| !slot.is_tombstone()).collect()
        };
        self.draining.store(true, Ordering::Release);
        self.permits.close();
        drained
    }

    /// Orderly shutdown: accept no new submissions and close once the
    /// pending ones have been taken.
    pub(crate) fn shutdown(&self) {
        self.draining.store(true, Ordering::Release);
        let empty = self.lock().iter().all(Slot::is_tombstone);
        if empty {
            self.permits.close();
        }
    }

    /// Number of pending (non-tombstone) submissions.
    pub(crate) fn len(&self) -> usize {
        self.lock().iter().filter(|slot| !slot.is_tombstone()).count()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for SubmissionQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubmissionQueue")
            .field("pending", &self.len())
            .field("draining", &self.draining.load(Ordering::Acquire))
            .finish()
    }
}
