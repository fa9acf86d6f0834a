//! Core scalar types shared across the replication engine.

use std::time::{SystemTime, UNIX_EPOCH};

/// Sector number in 512-byte units.
pub type Sector = u64;

/// Shift between sectors and bytes.
pub const SECTOR_SHIFT: u32 = 9;

/// Node id inside one replication resource. Fits a bitmap slot index.
pub type NodeId = u32;

/// Maximum nodes per resource; bounds bitmap-slot vectors and node masks.
pub const MAX_NODES: usize = 32;

/// History UUID ring length per device.
pub const HISTORY_UUIDS: usize = 2;

/// Generation UUID of a device that was created and never written to.
pub const UUID_JUST_CREATED: u64 = 4;

/// Low bit of a generation UUID flags a primary crash; masked off for
/// equality comparisons.
pub const UUID_PRIMARY_BIT: u64 = 1;

/// `block_id` sentinel: resync writes not matching a peer's request.
pub const ID_SYNCER: u64 = u64::MAX;
/// `block_id` sentinel in OV results: the range verified clean.
pub const ID_IN_SYNC: u64 = 4711;
/// `block_id` sentinel in OV results: the range differs.
pub const ID_OUT_OF_SYNC: u64 = 4712;

/// Compare generation UUIDs ignoring the crashed-primary bit.
#[inline]
pub fn uuid_equal(a: u64, b: u64) -> bool {
    (a & !UUID_PRIMARY_BIT) == (b & !UUID_PRIMARY_BIT)
}

#[inline]
pub fn sectors_to_bytes(sectors: u64) -> u64 {
    sectors << SECTOR_SHIFT
}

#[inline]
pub fn bytes_to_sectors(bytes: u64) -> u64 {
    bytes >> SECTOR_SHIFT
}

/// Unix time in seconds.
pub fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

macro_rules! arena_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u32);

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

arena_id!(
    /// Index of a resource in the registry.
    ResourceId
);
arena_id!(
    /// Index of a volume within its resource.
    DeviceId
);
arena_id!(
    /// Index of a connection within its resource.
    ConnectionId
);

/// A (connection, device) pair, the unit most replication state hangs off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerDeviceId {
    pub connection: ConnectionId,
    pub device: DeviceId,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uuid_equality_masks_primary_bit() {
        assert!(uuid_equal(0x1000, 0x1001));
        assert!(uuid_equal(0x1001, 0x1000));
        assert!(!uuid_equal(0x1000, 0x2000));
    }

    #[test]
    fn sector_byte_conversion() {
        assert_eq!(sectors_to_bytes(8), 4096);
        assert_eq!(bytes_to_sectors(4096), 8);
    }
}
