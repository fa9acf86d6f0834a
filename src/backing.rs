//! External collaborators of the replication core.
//!
//! The block layer, activity log and policy helper are narrow interfaces
//! here. Completions come back as typed messages on the per-connection
//! worker channel rather than callbacks. A memory-backed implementation
//! serves the daemon's demo mode and the tests.

use crate::repl::request::Cookie;
use crate::types::{DeviceId, Sector, sectors_to_bytes};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

bitflags::bitflags! {
    /// What the backing device can do; drives the write-ordering clamp.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BackendCaps: u32 {
        const FLUSH   = 1;
        const FUA     = 2;
        const DISCARD = 4;
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SubmitFlags: u32 {
        const FLUSH = 1;
        const FUA   = 2;
        const SYNC  = 4;
    }
}

/// One operation handed to the block layer.
#[derive(Debug)]
pub enum BlockOp {
    Write {
        cookie: Cookie,
        sector: Sector,
        data: Vec<u8>,
        flags: SubmitFlags,
    },
    Discard {
        cookie: Cookie,
        sector: Sector,
        size: u32,
    },
    Read {
        cookie: Cookie,
        sector: Sector,
        size: u32,
    },
    Flush {
        epoch: u64,
    },
}

/// Completion message delivered to the worker channel.
#[derive(Debug)]
pub struct BlockCompletion {
    pub device: DeviceId,
    pub kind: CompletionKind,
    pub ok: bool,
    /// Read payload, when the op was a read and succeeded.
    pub data: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionKind {
    Write { cookie: Cookie },
    Discard { cookie: Cookie },
    Read { cookie: Cookie },
    Flush { epoch: u64 },
}

/// Submit/complete primitives of the block layer.
pub trait BlockBackend: Send + Sync + 'static {
    fn submit(&self, device: DeviceId, op: BlockOp, done: &mpsc::UnboundedSender<BlockCompletion>);
    fn capabilities(&self) -> BackendCaps;
    /// Device size in sectors.
    fn size_sectors(&self, device: DeviceId) -> u64;
}

/// Begin/complete IO coverage for a sector range (activity log).
pub trait ActivityLog: Send + Sync + 'static {
    fn begin_io(&self, device: DeviceId, sector: Sector, size: u32);
    fn complete_io(&self, device: DeviceId, sector: Sector, size: u32);
}

/// Activity log that keeps no state.
#[derive(Debug, Default)]
pub struct NullActivityLog;

impl ActivityLog for NullActivityLog {
    fn begin_io(&self, _device: DeviceId, _sector: Sector, _size: u32) {}
    fn complete_io(&self, _device: DeviceId, _sector: Sector, _size: u32) {}
}

/// Policy hook events forwarded to an external helper process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HelperEvent {
    SplitBrain,
    PriLostAfterSb,
    FencePeer,
}

/// Pluggable helper invocation. The return value follows the helper exit
/// code convention: 3 discard local, 4 discard remote, anything else no
/// decision.
pub trait HelperHook: Send + Sync + 'static {
    fn call(&self, event: HelperEvent, resource: &str) -> i32;
}

#[derive(Debug, Default)]
pub struct NullHelper;

impl HelperHook for NullHelper {
    fn call(&self, event: HelperEvent, resource: &str) -> i32 {
        debug!(?event, resource, "helper hook invoked, no handler");
        0
    }
}

/// Memory-backed block device set; completes synchronously.
pub struct MemoryBackend {
    devices: Mutex<HashMap<DeviceId, Vec<u8>>>,
    caps: BackendCaps,
    fail_flush: Mutex<bool>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            devices: Mutex::new(HashMap::new()),
            caps: BackendCaps::FLUSH | BackendCaps::FUA | BackendCaps::DISCARD,
            fail_flush: Mutex::new(false),
        }
    }

    pub fn with_caps(caps: BackendCaps) -> Self {
        Self {
            devices: Mutex::new(HashMap::new()),
            caps,
            fail_flush: Mutex::new(false),
        }
    }

    pub fn add_device(&self, device: DeviceId, sectors: u64) {
        self.devices
            .lock()
            .unwrap()
            .insert(device, vec![0u8; sectors_to_bytes(sectors) as usize]);
    }

    /// Make subsequent flushes fail (write-ordering degrade tests).
    pub fn set_fail_flush(&self, fail: bool) {
        *self.fail_flush.lock().unwrap() = fail;
    }

    pub fn read_range(&self, device: DeviceId, sector: Sector, len: usize) -> Option<Vec<u8>> {
        let devices = self.devices.lock().unwrap();
        let data = devices.get(&device)?;
        let off = sectors_to_bytes(sector) as usize;
        if off + len > data.len() {
            return None;
        }
        Some(data[off..off + len].to_vec())
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockBackend for MemoryBackend {
    fn submit(&self, device: DeviceId, op: BlockOp, done: &mpsc::UnboundedSender<BlockCompletion>) {
        let completion = match op {
            BlockOp::Write {
                cookie,
                sector,
                data,
                flags: _,
            } => {
                let mut devices = self.devices.lock().unwrap();
                let ok = match devices.get_mut(&device) {
                    Some(dev) => {
                        let off = sectors_to_bytes(sector) as usize;
                        if off + data.len() <= dev.len() {
                            dev[off..off + data.len()].copy_from_slice(&data);
                            true
                        } else {
                            false
                        }
                    }
                    None => false,
                };
                BlockCompletion {
                    device,
                    kind: CompletionKind::Write { cookie },
                    ok,
                    data: None,
                }
            }
            BlockOp::Discard {
                cookie,
                sector,
                size,
            } => {
                let mut devices = self.devices.lock().unwrap();
                let ok = match devices.get_mut(&device) {
                    Some(dev) => {
                        let off = sectors_to_bytes(sector) as usize;
                        let len = size as usize;
                        if off + len <= dev.len() {
                            dev[off..off + len].fill(0);
                            true
                        } else {
                            false
                        }
                    }
                    None => false,
                };
                BlockCompletion {
                    device,
                    kind: CompletionKind::Discard { cookie },
                    ok,
                    data: None,
                }
            }
            BlockOp::Read {
                cookie,
                sector,
                size,
            } => {
                let data = self.read_range(device, sector, size as usize);
                BlockCompletion {
                    device,
                    kind: CompletionKind::Read { cookie },
                    ok: data.is_some(),
                    data,
                }
            }
            BlockOp::Flush { epoch } => BlockCompletion {
                device,
                kind: CompletionKind::Flush { epoch },
                ok: !*self.fail_flush.lock().unwrap(),
                data: None,
            },
        };
        let _ = done.send(completion);
    }

    fn capabilities(&self) -> BackendCaps {
        self.caps
    }

    fn size_sectors(&self, device: DeviceId) -> u64 {
        self.devices
            .lock()
            .unwrap()
            .get(&device)
            .map(|d| (d.len() as u64) >> crate::types::SECTOR_SHIFT)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_then_read() {
        let backend = MemoryBackend::new();
        let dev = DeviceId(0);
        backend.add_device(dev, 64);
        let (tx, mut rx) = mpsc::unbounded_channel();

        backend.submit(
            dev,
            BlockOp::Write {
                cookie: Cookie(1),
                sector: 2,
                data: vec![0xAB; 1024],
                flags: SubmitFlags::empty(),
            },
            &tx,
        );
        let c = rx.recv().await.unwrap();
        assert!(c.ok);

        backend.submit(
            dev,
            BlockOp::Read {
                cookie: Cookie(2),
                sector: 2,
                size: 1024,
            },
            &tx,
        );
        let c = rx.recv().await.unwrap();
        assert!(c.ok);
        assert_eq!(c.data.unwrap(), vec![0xAB; 1024]);
    }

    #[tokio::test]
    async fn out_of_range_write_fails() {
        let backend = MemoryBackend::new();
        let dev = DeviceId(0);
        backend.add_device(dev, 2);
        let (tx, mut rx) = mpsc::unbounded_channel();
        backend.submit(
            dev,
            BlockOp::Write {
                cookie: Cookie(1),
                sector: 8,
                data: vec![0; 4096],
                flags: SubmitFlags::empty(),
            },
            &tx,
        );
        assert!(!rx.recv().await.unwrap().ok);
    }

    #[tokio::test]
    async fn flush_failure_injection() {
        let backend = MemoryBackend::new();
        let dev = DeviceId(0);
        backend.add_device(dev, 8);
        backend.set_fail_flush(true);
        let (tx, mut rx) = mpsc::unbounded_channel();
        backend.submit(dev, BlockOp::Flush { epoch: 3 }, &tx);
        let c = rx.recv().await.unwrap();
        assert!(!c.ok);
        assert_eq!(c.kind, CompletionKind::Flush { epoch: 3 });
    }
}
