//! Generation-UUID comparison and the resync role decision.
//!
//! Each device carries a current UUID, one bitmap UUID per peer slot and a
//! short history ring. Comparing the local view against the peer's view
//! yields a rule code: positive means SyncSource, negative SyncTarget,
//! magnitude 2 means "set the full bitmap first", magnitude 3 "copy the
//! bitmap from another peer's slot", ±100 split brain, -1000 unrelated
//! data, -1091/-1096 a situation an old dialect cannot express.

use crate::config::AfterSbPolicy;
use crate::error::ReplError;
use crate::types::{HISTORY_UUIDS, NodeId, UUID_JUST_CREATED, uuid_equal};
use tracing::{info, warn};

/// Offset applied to a bitmap UUID when a resync starts; lets the fixups
/// recognize a lost sync-uuid packet.
pub const UUID_NEW_BM_OFFSET: u64 = 0x0001_0000_0000_0000;

pub const RULE_SPLIT_BRAIN: i32 = 100;
pub const RULE_SPLIT_BRAIN_HISTORY: i32 = -100;
pub const RULE_UNRELATED: i32 = -1000;
pub const RULE_NEED_PROTO_START: i32 = -1091;
pub const RULE_NEED_PROTO_END: i32 = -1096;

/// One side's UUID view entering the comparison.
#[derive(Debug, Clone, Default)]
pub struct UuidView {
    pub current: u64,
    /// Bitmap UUID for the peer being compared against.
    pub bitmap: u64,
    /// Bitmap UUIDs of the remaining slots, with their node ids.
    pub bitmap_other: Vec<(NodeId, u64)>,
    pub history: [u64; HISTORY_UUIDS],
    pub crashed_primary: bool,
}

/// Outcome of `uuid_compare`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompareResult {
    pub code: i32,
    /// Rule number that fired, for logging.
    pub rule: u32,
    /// Slot to copy the bitmap from, for |code| == 3.
    pub copy_slot: Option<NodeId>,
}

impl CompareResult {
    fn plain(code: i32, rule: u32) -> Self {
        Self {
            code,
            rule,
            copy_slot: None,
        }
    }
}

fn fresh(uuid: u64) -> bool {
    uuid == UUID_JUST_CREATED || uuid == 0
}

/// The last sync-uuid packet of a resync we were target of did not get
/// through: the peer's bitmap slot still shows the pre-resync value. Undo
/// the peer's start-of-resync bump so the comparison sees rule 50.
fn fixup_resync_start1(local: &UuidView, peer: &mut UuidView, protocol: u32) -> Option<i32> {
    if !uuid_equal(local.current, peer.history[0]) {
        return None;
    }
    let matched = if protocol >= 96 {
        (peer.history[0] & !1).wrapping_add(UUID_NEW_BM_OFFSET) == (peer.bitmap & !1)
    } else {
        uuid_equal(local.history[0], peer.history[1])
    };
    if !matched {
        return None;
    }
    if protocol < 91 {
        return Some(RULE_NEED_PROTO_START);
    }
    warn!("sync-uuid packet lost, undoing peer start-of-resync uuid bump");
    peer.bitmap = peer.history[0];
    peer.history[0] = peer.history[1];
    peer.history[1] = 0;
    Some(-1)
}

/// Mirror of `fixup_resync_start1` for the source side: our own
/// start-of-resync bump happened but the peer never saw the sync-uuid.
fn fixup_resync_start2(local: &mut UuidView, peer: &UuidView, protocol: u32) -> Option<i32> {
    if !uuid_equal(peer.current, local.history[0]) {
        return None;
    }
    let matched = if protocol >= 96 {
        (local.history[0] & !1).wrapping_add(UUID_NEW_BM_OFFSET) == (local.bitmap & !1)
    } else {
        uuid_equal(peer.history[0], local.history[1])
    };
    if !matched {
        return None;
    }
    if protocol < 91 {
        return Some(RULE_NEED_PROTO_END);
    }
    warn!("sync-uuid packet lost, undoing local start-of-resync uuid bump");
    local.bitmap = local.history[0];
    local.history[0] = local.history[1];
    local.history[1] = 0;
    Some(1)
}

/// A finished resync whose end-of-resync UUID bump was lost across a
/// crash: the peer already carries our current UUID as its bitmap UUID
/// while its current trails one generation behind in our history.
fn fixup_resync_end(local: &UuidView, peer: &mut UuidView) -> bool {
    if peer.bitmap != 0
        && uuid_equal(local.current, peer.bitmap)
        && uuid_equal(peer.current, local.history[0])
    {
        warn!("end-of-resync uuid bump lost on peer, adopting current");
        peer.history[0] = peer.current;
        peer.current = peer.bitmap;
        peer.bitmap = 0;
        return true;
    }
    false
}

/// Compare UUID views. Symmetric up to sign for rules 10 through 80.
pub fn uuid_compare(
    local_in: &UuidView,
    peer_in: &UuidView,
    resolve_conflicts: bool,
    protocol: u32,
) -> CompareResult {
    let mut local = local_in.clone();
    let mut peer = peer_in.clone();

    // rule 10: both sides never written to
    if local.current == UUID_JUST_CREATED && peer.current == UUID_JUST_CREATED {
        return CompareResult::plain(0, 10);
    }

    // rules 20/30: one side fresh, full copy toward it
    if fresh(peer.current) && !fresh(local.current) {
        return CompareResult::plain(2, 20);
    }
    if fresh(local.current) && !fresh(peer.current) {
        return CompareResult::plain(-2, 30);
    }

    // old dialects lose uuid bumps across a crash; repair before comparing
    if protocol <= 110 {
        fixup_resync_end(&local, &mut peer);
    }

    // rule 40: identical current data
    if uuid_equal(local.current, peer.current) {
        let code = match (local.crashed_primary, peer.crashed_primary) {
            (false, false) => 0,
            (true, false) => 1,
            (false, true) => -1,
            // both crashed primary: a split brain with identical data,
            // direction settled by the conflict-resolver side
            (true, true) => {
                if resolve_conflicts {
                    -1
                } else {
                    1
                }
            }
        };
        return CompareResult::plain(code, 40);
    }

    // rule 50: peer's bitmap slot for us still names our current data
    if peer.bitmap != 0 && uuid_equal(local.current, peer.bitmap) {
        return CompareResult::plain(-1, 50);
    }

    if protocol <= 110 {
        if let Some(code) = fixup_resync_start1(&local, &mut peer, protocol) {
            return CompareResult::plain(code, 51);
        }
    }

    // rule 52: another peer's slot on the peer names our current data
    for &(node, uuid) in &peer.bitmap_other {
        if uuid != 0 && uuid_equal(local.current, uuid) {
            return CompareResult {
                code: -3,
                rule: 52,
                copy_slot: Some(node),
            };
        }
    }

    // rule 60: our current data is in the peer's past
    for &h in &peer.history {
        if h != 0 && uuid_equal(local.current, h) {
            return CompareResult::plain(-2, 60);
        }
    }

    // rule 70: our bitmap slot for the peer names its current data
    if local.bitmap != 0 && uuid_equal(peer.current, local.bitmap) {
        return CompareResult::plain(1, 70);
    }

    if protocol <= 110 {
        if let Some(code) = fixup_resync_start2(&mut local, &peer, protocol) {
            return CompareResult::plain(code, 71);
        }
    }

    // rule 72: one of our other slots names the peer's current data
    for &(node, uuid) in &local.bitmap_other {
        if uuid != 0 && uuid_equal(peer.current, uuid) {
            return CompareResult {
                code: 3,
                rule: 72,
                copy_slot: Some(node),
            };
        }
    }

    // rule 80: the peer's current data is in our past
    for &h in &local.history {
        if h != 0 && uuid_equal(peer.current, h) {
            return CompareResult::plain(2, 80);
        }
    }

    // rule 90: both bitmap slots match and are set: we diverged from the
    // same base while disconnected
    if local.bitmap != 0 && uuid_equal(local.bitmap, peer.bitmap) {
        return CompareResult::plain(RULE_SPLIT_BRAIN, 90);
    }

    // rule 100: common ancestry further back
    for &lh in &local.history {
        for &ph in &peer.history {
            if lh != 0 && uuid_equal(lh, ph) {
                return CompareResult::plain(RULE_SPLIT_BRAIN_HISTORY, 100);
            }
        }
    }

    CompareResult::plain(RULE_UNRELATED, 0)
}

/// Inputs to split-brain auto recovery beyond the UUID views.
#[derive(Debug, Clone, Copy)]
pub struct SplitBrainContext {
    /// Out-of-sync block counts on each side, the "changes" figures.
    pub ch_self: u64,
    pub ch_peer: u64,
    /// Primary bit of each side's bitmap UUID; set on the side that kept
    /// writing after the split.
    pub self_younger: bool,
    pub peer_younger: bool,
    pub local_primary: bool,
    pub peer_primary: bool,
    pub resolve_conflicts: bool,
}

/// Recovery with zero primaries. Returns 1 (discard peer), -1 (discard
/// local) or 0 (no automatic decision).
pub fn recover_0p(policy: AfterSbPolicy, ctx: &SplitBrainContext) -> i32 {
    use AfterSbPolicy::*;
    match policy {
        Disconnect | CallHelper => 0,
        DiscardYounger => {
            if ctx.self_younger && !ctx.peer_younger {
                return -1;
            }
            if ctx.peer_younger && !ctx.self_younger {
                return 1;
            }
            recover_0p(DiscardZeroChanges, ctx)
        }
        DiscardOlder => {
            if ctx.self_younger && !ctx.peer_younger {
                return 1;
            }
            if ctx.peer_younger && !ctx.self_younger {
                return -1;
            }
            recover_0p(DiscardZeroChanges, ctx)
        }
        DiscardZeroChanges | DiscardLeastChanges => {
            if ctx.ch_self == 0 && ctx.ch_peer == 0 {
                return if ctx.resolve_conflicts { -1 } else { 1 };
            }
            if ctx.ch_peer == 0 {
                return 1;
            }
            if ctx.ch_self == 0 {
                return -1;
            }
            if policy == DiscardLeastChanges {
                if ctx.ch_self < ctx.ch_peer {
                    -1
                } else if ctx.ch_self > ctx.ch_peer {
                    1
                } else if ctx.resolve_conflicts {
                    -1
                } else {
                    1
                }
            } else {
                0
            }
        }
        DiscardLocal => -1,
        DiscardRemote => 1,
        // not meaningful with zero primaries
        Consensus | Violently | DiscardSecondary => 0,
    }
}

/// Recovery with exactly one primary.
pub fn recover_1p(policy: AfterSbPolicy, base: AfterSbPolicy, ctx: &SplitBrainContext) -> i32 {
    use AfterSbPolicy::*;
    match policy {
        Disconnect | CallHelper => 0,
        Consensus => {
            let rv = recover_0p(base, ctx);
            // only accept a decision that discards the secondary
            if rv == -1 && !ctx.local_primary {
                -1
            } else if rv == 1 && !ctx.peer_primary {
                1
            } else {
                0
            }
        }
        DiscardSecondary => {
            if ctx.local_primary {
                1
            } else {
                -1
            }
        }
        Violently => recover_0p(base, ctx),
        _ => 0,
    }
}

/// Recovery with two primaries.
pub fn recover_2p(policy: AfterSbPolicy, base: AfterSbPolicy, ctx: &SplitBrainContext) -> i32 {
    use AfterSbPolicy::*;
    match policy {
        Violently => recover_0p(base, ctx),
        _ => 0,
    }
}

/// What the handshake decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDecision {
    /// Replication goes straight to Established.
    NoSync,
    /// We hold the newer data: WFBitmapS.
    SyncSource { set_bitmap: bool, copy_slot: Option<NodeId> },
    /// The peer holds the newer data: WFBitmapT.
    SyncTarget { set_bitmap: bool, copy_slot: Option<NodeId> },
}

/// Full handshake: compare, then run the split-brain ladder if needed.
pub fn sync_handshake(
    local: &UuidView,
    peer: &UuidView,
    protocol: u32,
    policies: (AfterSbPolicy, AfterSbPolicy, AfterSbPolicy),
    ctx: &SplitBrainContext,
) -> Result<SyncDecision, ReplError> {
    let cmp = uuid_compare(local, peer, ctx.resolve_conflicts, protocol);
    info!(
        rule = cmp.rule,
        code = cmp.code,
        "uuid handshake: local {:#018x} peer {:#018x}",
        local.current,
        peer.current
    );

    let code = match cmp.code {
        RULE_UNRELATED => {
            return Err(ReplError::ProtocolIncompatible(
                "unrelated data, aborting".into(),
            ));
        }
        RULE_NEED_PROTO_START | RULE_NEED_PROTO_END => {
            return Err(ReplError::ProtocolIncompatible(format!(
                "uuid state requires a newer protocol ({})",
                cmp.code
            )));
        }
        RULE_SPLIT_BRAIN | RULE_SPLIT_BRAIN_HISTORY => {
            let primaries = ctx.local_primary as u32 + ctx.peer_primary as u32;
            let (policy, base) = match primaries {
                0 => (policies.0, policies.0),
                1 => (policies.1, policies.0),
                _ => (policies.2, policies.0),
            };
            let rv = match primaries {
                0 => recover_0p(policy, ctx),
                1 => recover_1p(policy, base, ctx),
                _ => recover_2p(policy, base, ctx),
            };
            if rv == 0 {
                return Err(ReplError::SplitBrain(format!("{policy:?}")));
            }
            warn!(direction = rv, "split brain auto-resolved, starting resync");
            // discard means full resync toward the discarded side
            rv * 2
        }
        code => code,
    };

    Ok(match code {
        0 => SyncDecision::NoSync,
        1 => SyncDecision::SyncSource {
            set_bitmap: false,
            copy_slot: None,
        },
        2 => SyncDecision::SyncSource {
            set_bitmap: true,
            copy_slot: None,
        },
        3 => SyncDecision::SyncSource {
            set_bitmap: false,
            copy_slot: cmp.copy_slot,
        },
        -1 => SyncDecision::SyncTarget {
            set_bitmap: false,
            copy_slot: None,
        },
        -2 => SyncDecision::SyncTarget {
            set_bitmap: true,
            copy_slot: None,
        },
        -3 => SyncDecision::SyncTarget {
            set_bitmap: false,
            copy_slot: cmp.copy_slot,
        },
        other => {
            return Err(ReplError::ProtocolIncompatible(format!(
                "unhandled uuid compare code {other}"
            )));
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view(current: u64, bitmap: u64, history: [u64; 2]) -> UuidView {
        UuidView {
            current,
            bitmap,
            bitmap_other: Vec::new(),
            history,
            crashed_primary: false,
        }
    }

    fn ctx() -> SplitBrainContext {
        SplitBrainContext {
            ch_self: 0,
            ch_peer: 0,
            self_younger: false,
            peer_younger: false,
            local_primary: false,
            peer_primary: false,
            resolve_conflicts: false,
        }
    }

    #[test]
    fn fresh_pairing_identical_uuids_no_sync() {
        let a = view(0x1000, 0, [0, 0]);
        let b = view(0x1000, 0, [0, 0]);
        let cmp = uuid_compare(&a, &b, false, 117);
        assert_eq!(cmp.code, 0);
        assert_eq!(cmp.rule, 40);

        let decision = sync_handshake(
            &a,
            &b,
            117,
            (
                AfterSbPolicy::Disconnect,
                AfterSbPolicy::Disconnect,
                AfterSbPolicy::Disconnect,
            ),
            &ctx(),
        )
        .unwrap();
        assert_eq!(decision, SyncDecision::NoSync);
    }

    #[test]
    fn peer_current_in_history_makes_target() {
        // device A: current X, history [Y]; device B: current Y.
        // from B's point of view: local current Y is in peer's history.
        let y: u64 = 0x0B0B;
        let b = view(y, 0, [0, 0]);
        let a = view(0x0A0A, 0, [y, 0]);
        let cmp = uuid_compare(&b, &a, false, 117);
        assert_eq!(cmp.code, -2);
        assert_eq!(cmp.rule, 60);

        // and A sees the mirror image
        let cmp = uuid_compare(&a, &b, false, 117);
        assert_eq!(cmp.code, 2);
        assert_eq!(cmp.rule, 80);
    }

    #[test]
    fn antisymmetry_for_plain_rules() {
        let cases = vec![
            (view(4, 0, [0, 0]), view(4, 0, [0, 0])),
            (view(0x10, 0, [0, 0]), view(4, 0, [0, 0])),
            (view(0x10, 0, [0, 0]), view(0x10, 0, [0, 0])),
            (view(0x10, 0x20, [0, 0]), view(0x20, 0, [0, 0])),
            (view(0x10, 0, [0x30, 0]), view(0x30, 0, [0, 0])),
            (view(0x10, 0, [0, 0]), view(0x10, 0x44, [0, 0])),
        ];
        for (a, b) in cases {
            let ab = uuid_compare(&a, &b, false, 117).code;
            let ba = uuid_compare(&b, &a, false, 117).code;
            assert_eq!(ab, -ba, "a={a:?} b={b:?}");
        }
    }

    #[test]
    fn both_crashed_primaries_resolved_by_conflict_flag() {
        let mut a = view(0x1000, 0, [0, 0]);
        let mut b = view(0x1000, 0, [0, 0]);
        a.crashed_primary = true;
        b.crashed_primary = true;
        assert_eq!(uuid_compare(&a, &b, true, 117).code, -1);
        assert_eq!(uuid_compare(&a, &b, false, 117).code, 1);
    }

    #[test]
    fn bitmap_slot_match_is_split_brain() {
        let a = view(0x10, 0x99, [0, 0]);
        let b = view(0x20, 0x99, [0, 0]);
        let cmp = uuid_compare(&a, &b, false, 117);
        assert_eq!(cmp.code, RULE_SPLIT_BRAIN);
        assert_eq!(cmp.rule, 90);
    }

    #[test]
    fn split_brain_least_changes_discards_fewer() {
        // both sides crashed primary with equal current uuids is the
        // classic two-crashed-primaries split brain; here we force the
        // ladder through a rule-90 detection
        let a = view(0x10, 0x99, [0, 0]);
        let b = view(0x20, 0x99, [0, 0]);
        let mut c = ctx();
        c.ch_self = 10;
        c.ch_peer = 3;
        let decision = sync_handshake(
            &a,
            &b,
            117,
            (
                AfterSbPolicy::DiscardLeastChanges,
                AfterSbPolicy::Disconnect,
                AfterSbPolicy::Disconnect,
            ),
            &c,
        )
        .unwrap();
        assert_eq!(
            decision,
            SyncDecision::SyncSource {
                set_bitmap: true,
                copy_slot: None
            }
        );
    }

    #[test]
    fn split_brain_disconnect_policy_errors() {
        let a = view(0x10, 0x99, [0, 0]);
        let b = view(0x20, 0x99, [0, 0]);
        let err = sync_handshake(
            &a,
            &b,
            117,
            (
                AfterSbPolicy::Disconnect,
                AfterSbPolicy::Disconnect,
                AfterSbPolicy::Disconnect,
            ),
            &ctx(),
        )
        .unwrap_err();
        assert!(matches!(err, ReplError::SplitBrain(_)));
    }

    #[test]
    fn unrelated_data_rejected() {
        let a = view(0x10, 0, [0x11, 0x12]);
        let b = view(0x20, 0, [0x21, 0x22]);
        let cmp = uuid_compare(&a, &b, false, 117);
        assert_eq!(cmp.code, RULE_UNRELATED);
        assert!(sync_handshake(
            &a,
            &b,
            117,
            (
                AfterSbPolicy::Disconnect,
                AfterSbPolicy::Disconnect,
                AfterSbPolicy::Disconnect
            ),
            &ctx()
        )
        .is_err());
    }

    #[test]
    fn copy_slot_from_other_peer() {
        let mut b = view(0x20, 0, [0, 0]);
        b.bitmap_other = vec![(2, 0x10)];
        let a = view(0x10, 0, [0, 0]);
        let cmp = uuid_compare(&a, &b, false, 117);
        assert_eq!(cmp.code, -3);
        assert_eq!(cmp.rule, 52);
        assert_eq!(cmp.copy_slot, Some(2));
    }

    #[test]
    fn lost_sync_uuid_fixup_needs_dialect_91() {
        // peer bumped its bitmap slot by the start-of-resync offset but we
        // never saw the sync-uuid packet
        let local = view(0x50, 0, [0, 0]);
        let peer = view(
            0x70,
            0x50u64.wrapping_add(UUID_NEW_BM_OFFSET),
            [0x50, 0],
        );
        let cmp = uuid_compare(&local, &peer, false, 96);
        assert_eq!(cmp.code, -1);
        assert_eq!(cmp.rule, 51);

        let cmp = uuid_compare(&local, &peer, false, 90);
        assert_eq!(cmp.code, RULE_NEED_PROTO_START);
    }

    #[test]
    fn recover_0p_table() {
        let mut c = ctx();
        c.ch_self = 5;
        c.ch_peer = 5;
        assert_eq!(recover_0p(AfterSbPolicy::Disconnect, &c), 0);
        assert_eq!(recover_0p(AfterSbPolicy::DiscardLocal, &c), -1);
        assert_eq!(recover_0p(AfterSbPolicy::DiscardRemote, &c), 1);
        assert_eq!(recover_0p(AfterSbPolicy::DiscardZeroChanges, &c), 0);

        c.ch_peer = 0;
        assert_eq!(recover_0p(AfterSbPolicy::DiscardZeroChanges, &c), 1);

        c.ch_peer = 8;
        assert_eq!(recover_0p(AfterSbPolicy::DiscardLeastChanges, &c), -1);

        c.self_younger = true;
        assert_eq!(recover_0p(AfterSbPolicy::DiscardYounger, &c), -1);
        assert_eq!(recover_0p(AfterSbPolicy::DiscardOlder, &c), 1);
    }

    #[test]
    fn consensus_only_discards_secondary() {
        let mut c = ctx();
        c.local_primary = true;
        c.ch_self = 0;
        c.ch_peer = 7;
        // 0p base says discard local, but local is primary: no decision
        assert_eq!(
            recover_1p(
                AfterSbPolicy::Consensus,
                AfterSbPolicy::DiscardZeroChanges,
                &c
            ),
            0
        );
        // discard-secondary always has an answer
        assert_eq!(
            recover_1p(
                AfterSbPolicy::DiscardSecondary,
                AfterSbPolicy::DiscardZeroChanges,
                &c
            ),
            1
        );
    }
}
