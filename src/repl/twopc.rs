//! Two-phase-commit receiver and reply aggregation.
//!
//! Cluster-wide state changes arrive as Prepare / Commit / Abort. At most
//! one remote transaction is engaged per resource; a Prepare for a second
//! transaction is answered Retry, a duplicate Prepare re-acks the previous
//! verdict. The reply aggregator collects Yes/No/Retry from every
//! participant, OR-ing reachability and primary masks, and settles on
//! timeout or abort.

use crate::proto::wire::{TwopcReplyPayload, TwopcRequestPayload};
use crate::types::NodeId;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TwopcVerdict {
    Yes,
    No,
    Retry,
}

/// Lifecycle of a reply aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregatorState {
    WaitingReplies,
    AllReplied,
    Timeout,
    Aborted,
}

#[derive(Debug, Clone)]
struct Engaged {
    tid: u32,
    initiator_node_id: u32,
    verdict: TwopcVerdict,
    request: TwopcRequestPayload,
}

/// Receiver-side transaction state, one per resource.
#[derive(Debug, Default)]
pub struct TwopcReceiver {
    engaged: Option<Engaged>,
    last_committed: Option<(u32, u32)>,
}

/// What `on_prepare` decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrepareOutcome {
    pub verdict: TwopcVerdict,
    /// A new transaction was engaged; the caller arms the timeout timer.
    pub fresh: bool,
}

/// What `on_commit` / `on_abort` decided.
#[derive(Debug, Clone)]
pub struct FinishOutcome {
    /// Apply the prepared state change (false for abort or stale frames).
    pub apply: Option<TwopcRequestPayload>,
    /// The timeout timer must be cancelled.
    pub disarm_timer: bool,
}

impl TwopcReceiver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn engaged_tid(&self) -> Option<u32> {
        self.engaged.as_ref().map(|e| e.tid)
    }

    /// Handle a Prepare frame. `evaluate` runs the state change with the
    /// prepare flag and reports whether this node can follow.
    pub fn on_prepare(
        &mut self,
        req: &TwopcRequestPayload,
        evaluate: impl FnOnce(&TwopcRequestPayload) -> TwopcVerdict,
    ) -> PrepareOutcome {
        if let Some(engaged) = &self.engaged {
            if engaged.tid == req.tid && engaged.initiator_node_id == req.initiator_node_id {
                // retransmitted prepare: repeat the earlier answer
                debug!(tid = req.tid, "duplicate two-pc prepare, re-acking");
                return PrepareOutcome {
                    verdict: engaged.verdict,
                    fresh: false,
                };
            }
            warn!(
                engaged = engaged.tid,
                incoming = req.tid,
                "concurrent two-pc transactions, answering retry"
            );
            return PrepareOutcome {
                verdict: TwopcVerdict::Retry,
                fresh: false,
            };
        }

        if self.last_committed == Some((req.initiator_node_id, req.tid)) {
            // prepare retransmitted after we already committed
            return PrepareOutcome {
                verdict: TwopcVerdict::Yes,
                fresh: false,
            };
        }

        let verdict = evaluate(req);
        self.engaged = Some(Engaged {
            tid: req.tid,
            initiator_node_id: req.initiator_node_id,
            verdict,
            request: *req,
        });
        PrepareOutcome {
            verdict,
            fresh: true,
        }
    }

    /// Handle Commit. Stale or unknown transactions are ignored, which
    /// makes duplicate Prepare+Commit idempotent.
    pub fn on_commit(&mut self, tid: u32, initiator_node_id: u32) -> FinishOutcome {
        match self.engaged.take() {
            Some(e) if e.tid == tid && e.initiator_node_id == initiator_node_id => {
                self.last_committed = Some((initiator_node_id, tid));
                FinishOutcome {
                    apply: Some(e.request),
                    disarm_timer: true,
                }
            }
            other => {
                self.engaged = other;
                FinishOutcome {
                    apply: None,
                    disarm_timer: false,
                }
            }
        }
    }

    /// Handle Abort: tear the transaction down without applying.
    pub fn on_abort(&mut self, tid: u32, initiator_node_id: u32) -> FinishOutcome {
        match self.engaged.take() {
            Some(e) if e.tid == tid && e.initiator_node_id == initiator_node_id => FinishOutcome {
                apply: None,
                disarm_timer: true,
            },
            other => {
                self.engaged = other;
                FinishOutcome {
                    apply: None,
                    disarm_timer: false,
                }
            }
        }
    }

    /// The prepare timer fired before Commit/Abort arrived.
    pub fn on_timeout(&mut self, tid: u32) -> bool {
        match &self.engaged {
            Some(e) if e.tid == tid => {
                warn!(tid, "two-pc prepare timed out, aborting transaction");
                self.engaged = None;
                true
            }
            _ => false,
        }
    }
}

/// Initiator-side aggregation of Yes/No/Retry replies.
#[derive(Debug)]
pub struct ReplyAggregator {
    pub tid: u32,
    state: AggregatorState,
    waiting: u64,
    pub reachable_nodes: u64,
    pub primary_nodes: u64,
    pub weak_nodes: u64,
    nays: u32,
    retries: u32,
}

impl ReplyAggregator {
    pub fn new(tid: u32, participants: u64) -> Self {
        Self {
            tid,
            state: if participants == 0 {
                AggregatorState::AllReplied
            } else {
                AggregatorState::WaitingReplies
            },
            waiting: participants,
            reachable_nodes: 0,
            primary_nodes: 0,
            weak_nodes: 0,
            nays: 0,
            retries: 0,
        }
    }

    pub fn state(&self) -> AggregatorState {
        self.state
    }

    /// Record one participant's reply; returns the new state.
    pub fn record(
        &mut self,
        node: NodeId,
        verdict: TwopcVerdict,
        reply: &TwopcReplyPayload,
    ) -> AggregatorState {
        if self.state != AggregatorState::WaitingReplies {
            return self.state;
        }
        if reply.tid != self.tid {
            debug!(got = reply.tid, want = self.tid, "stale two-pc reply ignored");
            return self.state;
        }
        let bit = 1u64 << node;
        if self.waiting & bit == 0 {
            return self.state;
        }
        self.waiting &= !bit;
        match verdict {
            TwopcVerdict::Yes => {
                self.reachable_nodes |= reply.reachable_nodes | bit;
                self.primary_nodes |= reply.primary_nodes;
                self.weak_nodes |= reply.weak_nodes;
            }
            TwopcVerdict::No => self.nays += 1,
            TwopcVerdict::Retry => self.retries += 1,
        }
        if self.waiting == 0 {
            self.state = AggregatorState::AllReplied;
        }
        self.state
    }

    pub fn timeout(&mut self) {
        if self.state == AggregatorState::WaitingReplies {
            self.state = AggregatorState::Timeout;
        }
    }

    pub fn abort(&mut self) {
        self.state = AggregatorState::Aborted;
    }

    /// Combined verdict once all replies are in.
    pub fn verdict(&self) -> Option<TwopcVerdict> {
        if self.state != AggregatorState::AllReplied {
            return None;
        }
        Some(if self.nays > 0 {
            TwopcVerdict::No
        } else if self.retries > 0 {
            TwopcVerdict::Retry
        } else {
            TwopcVerdict::Yes
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(tid: u32, initiator: u32) -> TwopcRequestPayload {
        TwopcRequestPayload {
            tid,
            initiator_node_id: initiator,
            target_node_id: -1,
            nodes_to_reach: 0b110,
            primary_nodes: 0b001,
            mask: 0x10,
            val: 0x10,
        }
    }

    fn reply(tid: u32) -> TwopcReplyPayload {
        TwopcReplyPayload {
            tid,
            initiator_node_id: 0,
            reachable_nodes: 0,
            primary_nodes: 0,
            weak_nodes: 0,
        }
    }

    #[test]
    fn prepare_commit_applies_once() {
        let mut rx = TwopcReceiver::new();
        let mut applied = 0;

        let out = rx.on_prepare(&req(7, 1), |_| TwopcVerdict::Yes);
        assert_eq!(out.verdict, TwopcVerdict::Yes);
        assert!(out.fresh);

        let fin = rx.on_commit(7, 1);
        if fin.apply.is_some() {
            applied += 1;
        }
        assert!(fin.disarm_timer);

        // duplicate prepare + commit change nothing
        let out = rx.on_prepare(&req(7, 1), |_| panic!("must not re-evaluate"));
        assert_eq!(out.verdict, TwopcVerdict::Yes);
        assert!(!out.fresh);
        let fin = rx.on_commit(7, 1);
        if fin.apply.is_some() {
            applied += 1;
        }
        assert_eq!(applied, 1);
    }

    #[test]
    fn concurrent_transaction_gets_retry() {
        let mut rx = TwopcReceiver::new();
        rx.on_prepare(&req(7, 1), |_| TwopcVerdict::Yes);
        let out = rx.on_prepare(&req(8, 2), |_| panic!("must not evaluate"));
        assert_eq!(out.verdict, TwopcVerdict::Retry);
        assert!(!out.fresh);
    }

    #[test]
    fn abort_tears_down_without_apply() {
        let mut rx = TwopcReceiver::new();
        rx.on_prepare(&req(7, 1), |_| TwopcVerdict::Yes);
        let fin = rx.on_abort(7, 1);
        assert!(fin.apply.is_none());
        assert!(fin.disarm_timer);
        assert_eq!(rx.engaged_tid(), None);
    }

    #[test]
    fn timeout_clears_transaction() {
        let mut rx = TwopcReceiver::new();
        rx.on_prepare(&req(7, 1), |_| TwopcVerdict::Yes);
        assert!(rx.on_timeout(7));
        assert!(!rx.on_timeout(7));
        // a fresh prepare may engage again afterwards
        let out = rx.on_prepare(&req(9, 1), |_| TwopcVerdict::Yes);
        assert!(out.fresh);
    }

    #[test]
    fn aggregator_waits_for_all_participants() {
        let mut agg = ReplyAggregator::new(5, 0b110);
        assert_eq!(agg.state(), AggregatorState::WaitingReplies);
        assert_eq!(agg.verdict(), None);

        agg.record(1, TwopcVerdict::Yes, &reply(5));
        assert_eq!(agg.state(), AggregatorState::WaitingReplies);

        agg.record(2, TwopcVerdict::Yes, &reply(5));
        assert_eq!(agg.state(), AggregatorState::AllReplied);
        assert_eq!(agg.verdict(), Some(TwopcVerdict::Yes));
        assert_eq!(agg.reachable_nodes, 0b110);
    }

    #[test]
    fn no_dominates_retry() {
        let mut agg = ReplyAggregator::new(5, 0b11);
        agg.record(0, TwopcVerdict::Retry, &reply(5));
        agg.record(1, TwopcVerdict::No, &reply(5));
        assert_eq!(agg.verdict(), Some(TwopcVerdict::No));
    }

    #[test]
    fn stale_and_duplicate_replies_ignored() {
        let mut agg = ReplyAggregator::new(5, 0b10);
        agg.record(1, TwopcVerdict::Yes, &reply(4)); // wrong tid
        assert_eq!(agg.state(), AggregatorState::WaitingReplies);
        agg.record(1, TwopcVerdict::Yes, &reply(5));
        agg.record(1, TwopcVerdict::No, &reply(5)); // already counted
        assert_eq!(agg.verdict(), Some(TwopcVerdict::Yes));
    }

    #[test]
    fn timeout_settles_aggregation() {
        let mut agg = ReplyAggregator::new(5, 0b10);
        agg.timeout();
        assert_eq!(agg.state(), AggregatorState::Timeout);
        assert_eq!(agg.verdict(), None);
        // late replies are ignored
        agg.record(1, TwopcVerdict::Yes, &reply(5));
        assert_eq!(agg.state(), AggregatorState::Timeout);
    }
}
