//! Connection, replication and disk state machines plus the packed wire
//! representation used by P_STATE and the one-phase state-change path.

use crate::error::ReplError;

/// Connection lifecycle. Anything at or below `Disconnecting` cancels
/// outstanding work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ConnState {
    StandAlone = 0,
    Disconnecting = 1,
    Unconnected = 2,
    Timeout = 3,
    BrokenPipe = 4,
    NetworkFailure = 5,
    ProtocolError = 6,
    TearDown = 7,
    Connecting = 8,
    Connected = 9,
}

/// Per peer-device replication state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReplState {
    Off = 0,
    Established = 1,
    StartingSyncS = 2,
    StartingSyncT = 3,
    WFBitmapS = 4,
    WFBitmapT = 5,
    WFSyncUuid = 6,
    SyncSource = 7,
    SyncTarget = 8,
    PausedSyncS = 9,
    PausedSyncT = 10,
    VerifyS = 11,
    VerifyT = 12,
    Ahead = 13,
    Behind = 14,
}

impl ReplState {
    pub fn from_u8(v: u8) -> Option<Self> {
        use ReplState::*;
        Some(match v {
            0 => Off,
            1 => Established,
            2 => StartingSyncS,
            3 => StartingSyncT,
            4 => WFBitmapS,
            5 => WFBitmapT,
            6 => WFSyncUuid,
            7 => SyncSource,
            8 => SyncTarget,
            9 => PausedSyncS,
            10 => PausedSyncT,
            11 => VerifyS,
            12 => VerifyT,
            13 => Ahead,
            14 => Behind,
            _ => return None,
        })
    }

    /// States in which this node is receiving resync data.
    pub fn is_sync_target(self) -> bool {
        matches!(self, ReplState::SyncTarget | ReplState::PausedSyncT)
    }

    pub fn is_sync_source(self) -> bool {
        matches!(self, ReplState::SyncSource | ReplState::PausedSyncS)
    }

    pub fn is_resync(self) -> bool {
        self.is_sync_target() || self.is_sync_source()
    }

    pub fn is_verify(self) -> bool {
        matches!(self, ReplState::VerifyS | ReplState::VerifyT)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum DiskState {
    Diskless = 0,
    Attaching = 1,
    Failed = 2,
    Negotiating = 3,
    Inconsistent = 4,
    Outdated = 5,
    DUnknown = 6,
    Consistent = 7,
    UpToDate = 8,
}

impl DiskState {
    pub fn from_u8(v: u8) -> Option<Self> {
        use DiskState::*;
        Some(match v {
            0 => Diskless,
            1 => Attaching,
            2 => Failed,
            3 => Negotiating,
            4 => Inconsistent,
            5 => Outdated,
            6 => DUnknown,
            7 => Consistent,
            8 => UpToDate,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Role {
    Unknown = 0,
    Primary = 1,
    Secondary = 2,
}

impl Role {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => Role::Unknown,
            1 => Role::Primary,
            2 => Role::Secondary,
            _ => return None,
        })
    }
}

// state-change retcodes on the wire
pub const SS_SUCCESS: i32 = 1;
pub const SS_TWO_PRIMARIES: i32 = -4;
pub const SS_NO_UP_TO_DATE_DISK: i32 = -7;
pub const SS_CW_FAILED_BY_PEER: i32 = -10;
pub const SS_CONCURRENT_ST_CHG: i32 = -14;
pub const SS_IN_TRANSIENT_STATE: i32 = -18;

/// Peer device state as packed into a P_STATE payload:
/// role:2 peer_role:2 repl:5 disk:4 pdsk:4 susp:1 aftr_isp:1 peer_isp:1
/// user_isp:1, low bits first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnifiedState {
    pub role: Role,
    pub peer_role: Role,
    pub repl: ReplState,
    pub disk: DiskState,
    pub pdsk: DiskState,
    pub susp: bool,
    pub aftr_isp: bool,
    pub peer_isp: bool,
    pub user_isp: bool,
}

impl Default for UnifiedState {
    fn default() -> Self {
        Self {
            role: Role::Secondary,
            peer_role: Role::Unknown,
            repl: ReplState::Off,
            disk: DiskState::Diskless,
            pdsk: DiskState::DUnknown,
            susp: false,
            aftr_isp: false,
            peer_isp: false,
            user_isp: false,
        }
    }
}

impl UnifiedState {
    pub fn pack(&self) -> u32 {
        (self.role as u32)
            | (self.peer_role as u32) << 2
            | (self.repl as u32) << 4
            | (self.disk as u32) << 9
            | (self.pdsk as u32) << 13
            | (self.susp as u32) << 17
            | (self.aftr_isp as u32) << 18
            | (self.peer_isp as u32) << 19
            | (self.user_isp as u32) << 20
    }

    pub fn unpack(v: u32) -> Result<Self, ReplError> {
        let bad = || ReplError::malformed(format!("state word {v:#x}"));
        Ok(Self {
            role: Role::from_u8((v & 0x3) as u8).ok_or_else(bad)?,
            peer_role: Role::from_u8(((v >> 2) & 0x3) as u8).ok_or_else(bad)?,
            repl: ReplState::from_u8(((v >> 4) & 0x1f) as u8).ok_or_else(bad)?,
            disk: DiskState::from_u8(((v >> 9) & 0xf) as u8).ok_or_else(bad)?,
            pdsk: DiskState::from_u8(((v >> 13) & 0xf) as u8).ok_or_else(bad)?,
            susp: v & (1 << 17) != 0,
            aftr_isp: v & (1 << 18) != 0,
            peer_isp: v & (1 << 19) != 0,
            user_isp: v & (1 << 20) != 0,
        })
    }

    /// Apply a mask/val change request at the packed level.
    pub fn apply_mask_val(&self, mask: u32, val: u32) -> Result<Self, ReplError> {
        Self::unpack((self.pack() & !mask) | (val & mask))
    }
}

/// Sanity-check a requested peer state change. Mirrors the checks an
/// initiator runs locally before committing.
pub fn evaluate_state_change(
    current: &UnifiedState,
    requested: &UnifiedState,
    two_primaries_allowed: bool,
) -> i32 {
    if requested.role == Role::Primary
        && requested.peer_role == Role::Primary
        && !two_primaries_allowed
    {
        return SS_TWO_PRIMARIES;
    }
    if requested.repl.is_sync_source() && requested.disk < DiskState::UpToDate {
        return SS_NO_UP_TO_DATE_DISK;
    }
    if requested.repl.is_sync_target() && requested.pdsk < DiskState::UpToDate {
        return SS_NO_UP_TO_DATE_DISK;
    }
    if current.repl == ReplState::Off && requested.repl.is_resync() {
        // a resync can only start from an established link
        return SS_IN_TRANSIENT_STATE;
    }
    SS_SUCCESS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_unpack_roundtrip() {
        let s = UnifiedState {
            role: Role::Primary,
            peer_role: Role::Secondary,
            repl: ReplState::SyncTarget,
            disk: DiskState::Inconsistent,
            pdsk: DiskState::UpToDate,
            susp: false,
            aftr_isp: true,
            peer_isp: false,
            user_isp: false,
        };
        assert_eq!(UnifiedState::unpack(s.pack()).unwrap(), s);
    }

    #[test]
    fn mask_val_changes_only_masked_fields() {
        let s = UnifiedState::default();
        // set repl = Established (1) via its field mask
        let mask = 0x1f << 4;
        let val = (ReplState::Established as u32) << 4;
        let s2 = s.apply_mask_val(mask, val).unwrap();
        assert_eq!(s2.repl, ReplState::Established);
        assert_eq!(s2.role, s.role);
        assert_eq!(s2.disk, s.disk);
    }

    #[test]
    fn invalid_repl_state_rejected() {
        assert!(UnifiedState::unpack(0x1f << 4).is_err());
    }

    #[test]
    fn two_primaries_needs_config() {
        let cur = UnifiedState::default();
        let mut req = cur;
        req.role = Role::Primary;
        req.peer_role = Role::Primary;
        assert_eq!(evaluate_state_change(&cur, &req, false), SS_TWO_PRIMARIES);
        assert_eq!(evaluate_state_change(&cur, &req, true), SS_SUCCESS);
    }

    #[test]
    fn sync_source_needs_up_to_date_disk() {
        let mut cur = UnifiedState::default();
        cur.repl = ReplState::Established;
        let mut req = cur;
        req.repl = ReplState::SyncSource;
        req.disk = DiskState::Inconsistent;
        assert_eq!(
            evaluate_state_change(&cur, &req, false),
            SS_NO_UP_TO_DATE_DISK
        );
        req.disk = DiskState::UpToDate;
        assert_eq!(evaluate_state_change(&cur, &req, false), SS_SUCCESS);
    }
}
