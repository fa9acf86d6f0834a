//! Barrier-delimited epoch engine.
//!
//! Writes arriving between two BARRIER frames form an epoch. Epochs finish
//! in FIFO order; finishing the head may cascade into its successor. The
//! BarrierAck for an epoch is emitted according to the write-ordering mode
//! in effect, which only ever degrades.

use crate::error::ReplError;
use std::collections::VecDeque;
use tracing::{debug, warn};

/// Write-ordering modes, weakest first. A mode only degrades.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum WriteOrdering {
    None,
    DrainIo,
    BdevFlush,
    BioBarrier,
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EpochFlags: u32 {
        const HAS_BARRIER_NUMBER     = 0x01;
        const CONTAINS_BARRIER       = 0x02;
        const BARRIER_IN_NEXT_ISSUED = 0x04;
        const BARRIER_IN_NEXT_DONE   = 0x08;
        const IS_FINISHING           = 0x10;
    }
}

#[derive(Debug)]
pub struct Epoch {
    pub id: u64,
    pub barrier_nr: u32,
    /// Writes attached to this epoch.
    pub size: u32,
    /// Unsubmitted plus unacked writes, plus one while a flush is out.
    pub active: u32,
    pub flags: EpochFlags,
    flush_done: bool,
}

impl Epoch {
    fn new(id: u64) -> Self {
        Self {
            id,
            barrier_nr: 0,
            size: 0,
            active: 0,
            flags: EpochFlags::empty(),
            flush_done: false,
        }
    }

    fn reset(&mut self, id: u64) {
        self.id = id;
        self.barrier_nr = 0;
        self.size = 0;
        self.active = 0;
        self.flags = EpochFlags::empty();
        self.flush_done = false;
    }
}

/// What the caller must do after an epoch event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpochAction {
    SendBarrierAck { barrier: u32, set_size: u32 },
    IssueFlush { epoch: u64 },
}

/// Result of attaching a write to the current epoch.
#[derive(Debug, Clone, Copy)]
pub struct StartWrite {
    pub epoch: u64,
    /// First write of a fresh epoch.
    pub is_new_epoch: bool,
}

#[derive(Debug)]
pub struct EpochList {
    epochs: VecDeque<Epoch>,
    next_id: u64,
    write_ordering: WriteOrdering,
    cleanup: bool,
}

impl EpochList {
    pub fn new(write_ordering: WriteOrdering) -> Self {
        let mut epochs = VecDeque::new();
        epochs.push_back(Epoch::new(0));
        Self {
            epochs,
            next_id: 1,
            write_ordering,
            cleanup: false,
        }
    }

    pub fn write_ordering(&self) -> WriteOrdering {
        self.write_ordering
    }

    /// Degrade the write-ordering mode; it never goes back up.
    pub fn degrade_write_ordering(&mut self, to: WriteOrdering) {
        if to < self.write_ordering {
            warn!(from = ?self.write_ordering, ?to, "write ordering degraded");
            self.write_ordering = to;
        }
    }

    pub fn epoch_count(&self) -> usize {
        self.epochs.len()
    }

    fn find(&mut self, id: u64) -> Option<&mut Epoch> {
        self.epochs.iter_mut().find(|e| e.id == id)
    }

    /// Attach one incoming write to the current epoch, opening a new epoch
    /// if the current one already carries its barrier number.
    pub fn start_write(&mut self) -> StartWrite {
        let needs_new = self
            .epochs
            .back()
            .map(|e| e.flags.contains(EpochFlags::HAS_BARRIER_NUMBER))
            .unwrap_or(true);
        if needs_new {
            let id = self.next_id;
            self.next_id += 1;
            self.epochs.push_back(Epoch::new(id));
        }
        let current = self.epochs.back_mut().expect("current epoch");
        let is_new_epoch = current.size == 0;
        current.size += 1;
        current.active += 1;
        StartWrite {
            epoch: current.id,
            is_new_epoch,
        }
    }

    /// Mark the current epoch as containing a barrier write (BIO_BARRIER
    /// ordering only).
    pub fn mark_contains_barrier(&mut self, epoch: u64) {
        if let Some(e) = self.find(epoch) {
            e.flags |= EpochFlags::CONTAINS_BARRIER;
        }
        // the epoch ahead learns that its trailing barrier went out
        let mut mark_prev = None;
        for (i, e) in self.epochs.iter().enumerate() {
            if e.id == epoch && i > 0 {
                mark_prev = Some(i - 1);
            }
        }
        if let Some(i) = mark_prev {
            self.epochs[i].flags |= EpochFlags::BARRIER_IN_NEXT_ISSUED;
        }
    }

    /// The barrier write opening epoch `epoch` completed; the predecessor
    /// may now finish without its own flush.
    pub fn barrier_in_next_done(&mut self, epoch: u64) -> Vec<EpochAction> {
        let mut idx = None;
        for (i, e) in self.epochs.iter().enumerate() {
            if e.id == epoch && i > 0 {
                idx = Some(i - 1);
            }
        }
        if let Some(i) = idx {
            self.epochs[i].flags |= EpochFlags::BARRIER_IN_NEXT_DONE;
        }
        self.try_finish()
    }

    /// A BARRIER frame arrived for the current epoch.
    pub fn got_barrier(&mut self, barrier_nr: u32) -> Result<Vec<EpochAction>, ReplError> {
        let current = self.epochs.back_mut().expect("current epoch");
        if current.size == 0 {
            return Err(ReplError::malformed("barrier for empty epoch"));
        }
        if current.flags.contains(EpochFlags::HAS_BARRIER_NUMBER) {
            return Err(ReplError::malformed("second barrier for epoch"));
        }
        current.barrier_nr = barrier_nr;
        current.flags |= EpochFlags::HAS_BARRIER_NUMBER;
        debug!(barrier_nr, epoch = current.id, size = current.size, "barrier received");
        Ok(self.try_finish())
    }

    /// One write of `epoch` drained from active (completed or failed).
    pub fn write_drained(&mut self, epoch: u64) -> Vec<EpochAction> {
        if let Some(e) = self.find(epoch) {
            debug_assert!(e.active > 0);
            e.active = e.active.saturating_sub(1);
        }
        self.try_finish()
    }

    /// The asynchronous flush issued for `epoch` returned.
    pub fn flush_done(&mut self, epoch: u64, ok: bool) -> Vec<EpochAction> {
        if !ok {
            // flush failure: stop relying on flushes from now on
            self.degrade_write_ordering(WriteOrdering::DrainIo);
        }
        if let Some(e) = self.find(epoch) {
            e.flush_done = true;
            e.active = e.active.saturating_sub(1);
        }
        self.try_finish()
    }

    /// Disconnect teardown: finish everything that can finish without
    /// issuing further IO.
    pub fn cleanup(&mut self) -> Vec<EpochAction> {
        self.cleanup = true;
        self.try_finish()
    }

    fn try_finish(&mut self) -> Vec<EpochAction> {
        let mut actions = Vec::new();
        loop {
            let is_current = self.epochs.len() == 1;
            let Some(head) = self.epochs.front_mut() else {
                break;
            };
            let finishable = head.size > 0
                && head.active == 0
                && (head.flags.contains(EpochFlags::HAS_BARRIER_NUMBER) || self.cleanup);
            if !finishable {
                break;
            }

            let immediate = self.cleanup
                || self.write_ordering <= WriteOrdering::DrainIo
                || head.flush_done
                || head.flags.contains(EpochFlags::BARRIER_IN_NEXT_DONE)
                || (head.size == 1 && head.flags.contains(EpochFlags::CONTAINS_BARRIER));

            if !immediate {
                if !head.flags.contains(EpochFlags::IS_FINISHING) {
                    head.flags |= EpochFlags::IS_FINISHING;
                    head.active += 1;
                    actions.push(EpochAction::IssueFlush { epoch: head.id });
                }
                break;
            }

            if head.flags.contains(EpochFlags::HAS_BARRIER_NUMBER) {
                actions.push(EpochAction::SendBarrierAck {
                    barrier: head.barrier_nr,
                    set_size: head.size,
                });
            }

            if is_current {
                // recycle the current epoch in place
                let id = self.next_id;
                self.next_id += 1;
                head.reset(id);
                break;
            }
            self.epochs.pop_front();
            // successor became last; loop re-checks the new head
        }
        actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain_all(list: &mut EpochList, epoch: u64, n: u32) -> Vec<EpochAction> {
        let mut actions = Vec::new();
        for _ in 0..n {
            actions.extend(list.write_drained(epoch));
        }
        actions
    }

    #[test]
    fn bdev_flush_acks_after_flush() {
        let mut list = EpochList::new(WriteOrdering::BdevFlush);
        let mut epoch = 0;
        for _ in 0..3 {
            epoch = list.start_write().epoch;
        }
        assert!(list.got_barrier(7).unwrap().is_empty());

        let actions = drain_all(&mut list, epoch, 3);
        assert_eq!(actions, vec![EpochAction::IssueFlush { epoch }]);

        let actions = list.flush_done(epoch, true);
        assert_eq!(
            actions,
            vec![EpochAction::SendBarrierAck {
                barrier: 7,
                set_size: 3
            }]
        );
        // ordering unchanged on success
        assert_eq!(list.write_ordering(), WriteOrdering::BdevFlush);
    }

    #[test]
    fn flush_failure_degrades_to_drain() {
        let mut list = EpochList::new(WriteOrdering::BdevFlush);
        let epoch = list.start_write().epoch;
        list.got_barrier(1).unwrap();
        let actions = list.write_drained(epoch);
        assert_eq!(actions, vec![EpochAction::IssueFlush { epoch }]);

        let actions = list.flush_done(epoch, false);
        assert_eq!(
            actions,
            vec![EpochAction::SendBarrierAck {
                barrier: 1,
                set_size: 1
            }]
        );
        assert_eq!(list.write_ordering(), WriteOrdering::DrainIo);

        // next epoch takes the drained path, no flush
        let epoch = list.start_write().epoch;
        list.got_barrier(2).unwrap();
        let actions = list.write_drained(epoch);
        assert_eq!(
            actions,
            vec![EpochAction::SendBarrierAck {
                barrier: 2,
                set_size: 1
            }]
        );
    }

    #[test]
    fn drain_mode_acks_without_flush() {
        let mut list = EpochList::new(WriteOrdering::DrainIo);
        let epoch = list.start_write().epoch;
        list.got_barrier(9).unwrap();
        let actions = list.write_drained(epoch);
        assert_eq!(
            actions,
            vec![EpochAction::SendBarrierAck {
                barrier: 9,
                set_size: 1
            }]
        );
    }

    #[test]
    fn epochs_finish_in_fifo_order() {
        let mut list = EpochList::new(WriteOrdering::DrainIo);
        let e1 = list.start_write().epoch;
        list.got_barrier(1).unwrap();
        // writes of the next epoch arrive before e1 drains
        let e2 = list.start_write().epoch;
        assert_ne!(e1, e2);
        list.got_barrier(2).unwrap();

        // e2 drains first: nothing may finish yet
        let actions = list.write_drained(e2);
        assert!(actions.is_empty());

        // e1 drains: both finish, in order
        let actions = list.write_drained(e1);
        assert_eq!(
            actions,
            vec![
                EpochAction::SendBarrierAck {
                    barrier: 1,
                    set_size: 1
                },
                EpochAction::SendBarrierAck {
                    barrier: 2,
                    set_size: 1
                },
            ]
        );
        assert_eq!(list.epoch_count(), 1);
    }

    #[test]
    fn barrier_for_empty_epoch_is_protocol_error() {
        let mut list = EpochList::new(WriteOrdering::DrainIo);
        assert!(list.got_barrier(1).is_err());
    }

    #[test]
    fn single_barrier_write_epoch_finishes_without_flush() {
        let mut list = EpochList::new(WriteOrdering::BioBarrier);
        let epoch = list.start_write().epoch;
        list.mark_contains_barrier(epoch);
        list.got_barrier(4).unwrap();
        let actions = list.write_drained(epoch);
        assert_eq!(
            actions,
            vec![EpochAction::SendBarrierAck {
                barrier: 4,
                set_size: 1
            }]
        );
    }

    #[test]
    fn cleanup_finishes_without_io() {
        let mut list = EpochList::new(WriteOrdering::BdevFlush);
        let epoch = list.start_write().epoch;
        list.got_barrier(3).unwrap();
        list.write_drained(epoch);
        // flush was issued but never completes; cleanup forces the finish
        let actions = list.cleanup();
        assert!(actions.is_empty());
        let actions = list.flush_done(epoch, true);
        assert_eq!(
            actions,
            vec![EpochAction::SendBarrierAck {
                barrier: 3,
                set_size: 1
            }]
        );
    }
}
