//! Metadata store: generation UUIDs and out-of-sync bitmaps, persisted in
//! sled. The replication pipeline itself is never persisted; only what a
//! device must remember across restarts to run the sync handshake.

use crate::error::ReplError;
use crate::repl::bitmap::SyncBitmap;
use crate::types::{DeviceId, HISTORY_UUIDS, NodeId, UUID_JUST_CREATED};
use byteorder::{BigEndian, ByteOrder};
use std::path::Path;
use tracing::info;

/// Persisted UUID vector of one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredUuids {
    pub current: u64,
    /// Bitmap UUID per peer slot.
    pub bitmap: Vec<(NodeId, u64)>,
    pub history: [u64; HISTORY_UUIDS],
    pub crashed_primary: bool,
}

impl Default for StoredUuids {
    fn default() -> Self {
        Self {
            current: UUID_JUST_CREATED,
            bitmap: Vec::new(),
            history: [0; HISTORY_UUIDS],
            crashed_primary: false,
        }
    }
}

impl StoredUuids {
    fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; 8 + HISTORY_UUIDS * 8 + 1 + 4 + self.bitmap.len() * 12];
        BigEndian::write_u64(&mut buf[0..8], self.current);
        for (i, h) in self.history.iter().enumerate() {
            BigEndian::write_u64(&mut buf[8 + i * 8..16 + i * 8], *h);
        }
        let mut off = 8 + HISTORY_UUIDS * 8;
        buf[off] = self.crashed_primary as u8;
        off += 1;
        BigEndian::write_u32(&mut buf[off..off + 4], self.bitmap.len() as u32);
        off += 4;
        for (node, uuid) in &self.bitmap {
            BigEndian::write_u32(&mut buf[off..off + 4], *node);
            BigEndian::write_u64(&mut buf[off + 4..off + 12], *uuid);
            off += 12;
        }
        buf
    }

    fn decode(buf: &[u8]) -> Result<Self, ReplError> {
        let fixed = 8 + HISTORY_UUIDS * 8 + 1 + 4;
        if buf.len() < fixed {
            return Err(ReplError::LocalIo("short uuid record".into()));
        }
        let current = BigEndian::read_u64(&buf[0..8]);
        let mut history = [0u64; HISTORY_UUIDS];
        for (i, h) in history.iter_mut().enumerate() {
            *h = BigEndian::read_u64(&buf[8 + i * 8..16 + i * 8]);
        }
        let mut off = 8 + HISTORY_UUIDS * 8;
        let crashed_primary = buf[off] != 0;
        off += 1;
        let count = BigEndian::read_u32(&buf[off..off + 4]) as usize;
        off += 4;
        if buf.len() < off + count * 12 {
            return Err(ReplError::LocalIo("truncated uuid record".into()));
        }
        let mut bitmap = Vec::with_capacity(count);
        for _ in 0..count {
            let node = BigEndian::read_u32(&buf[off..off + 4]);
            let uuid = BigEndian::read_u64(&buf[off + 4..off + 12]);
            bitmap.push((node, uuid));
            off += 12;
        }
        Ok(Self {
            current,
            bitmap,
            history,
            crashed_primary,
        })
    }

    pub fn bitmap_for(&self, node: NodeId) -> u64 {
        self.bitmap
            .iter()
            .find(|(n, _)| *n == node)
            .map(|(_, u)| *u)
            .unwrap_or(0)
    }

    pub fn set_bitmap_for(&mut self, node: NodeId, uuid: u64) {
        for entry in self.bitmap.iter_mut() {
            if entry.0 == node {
                entry.1 = uuid;
                return;
            }
        }
        self.bitmap.push((node, uuid));
    }

    /// Rotate the current UUID into history and install a new one.
    pub fn new_current(&mut self, uuid: u64) {
        self.history[1] = self.history[0];
        self.history[0] = self.current;
        self.current = uuid;
    }
}

pub struct MetaStore {
    db: sled::Db,
}

impl MetaStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, ReplError> {
        let db = sled::open(path.as_ref())
            .map_err(|e| ReplError::LocalIo(format!("metadata open: {e}")))?;
        info!(path = %path.as_ref().display(), "metadata store opened");
        Ok(Self { db })
    }

    fn uuid_key(device: DeviceId) -> Vec<u8> {
        format!("uuids/{}", device.0).into_bytes()
    }

    fn bitmap_key(device: DeviceId) -> Vec<u8> {
        format!("bitmap/{}", device.0).into_bytes()
    }

    pub fn load_uuids(&self, device: DeviceId) -> Result<StoredUuids, ReplError> {
        match self
            .db
            .get(Self::uuid_key(device))
            .map_err(|e| ReplError::LocalIo(e.to_string()))?
        {
            Some(v) => StoredUuids::decode(&v),
            None => Ok(StoredUuids::default()),
        }
    }

    pub fn save_uuids(&self, device: DeviceId, uuids: &StoredUuids) -> Result<(), ReplError> {
        self.db
            .insert(Self::uuid_key(device), uuids.encode())
            .map_err(|e| ReplError::LocalIo(e.to_string()))?;
        self.db
            .flush()
            .map_err(|e| ReplError::LocalIo(e.to_string()))?;
        Ok(())
    }

    pub fn load_bitmap(&self, device: DeviceId, bits: u64) -> Result<SyncBitmap, ReplError> {
        match self
            .db
            .get(Self::bitmap_key(device))
            .map_err(|e| ReplError::LocalIo(e.to_string()))?
        {
            Some(v) => {
                let mut bm = SyncBitmap::new(bits);
                for (i, chunk) in v.chunks_exact(8).enumerate() {
                    bm.or_word(i, u64::from_le_bytes(chunk.try_into().expect("word")));
                }
                Ok(bm)
            }
            None => Ok(SyncBitmap::new(bits)),
        }
    }

    pub fn save_bitmap(&self, device: DeviceId, bitmap: &SyncBitmap) -> Result<(), ReplError> {
        let mut buf = Vec::with_capacity(bitmap.words().len() * 8);
        for w in bitmap.words() {
            buf.extend_from_slice(&w.to_le_bytes());
        }
        self.db
            .insert(Self::bitmap_key(device), buf)
            .map_err(|e| ReplError::LocalIo(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uuid_record_roundtrip() {
        let mut u = StoredUuids::default();
        u.new_current(0xAAAA_0001);
        u.set_bitmap_for(2, 0xBBBB);
        u.set_bitmap_for(5, 0xCCCC);
        u.crashed_primary = true;
        assert_eq!(StoredUuids::decode(&u.encode()).unwrap(), u);
    }

    #[test]
    fn new_current_rotates_history() {
        let mut u = StoredUuids::default();
        u.current = 0x10;
        u.new_current(0x20);
        u.new_current(0x30);
        assert_eq!(u.current, 0x30);
        assert_eq!(u.history, [0x20, 0x10]);
    }

    #[test]
    fn store_roundtrip() {
        let dir = std::env::temp_dir().join(format!("blockrepl_meta_{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        let store = MetaStore::open(&dir).unwrap();

        let dev = DeviceId(3);
        let mut u = StoredUuids::default();
        u.new_current(0x77);
        store.save_uuids(dev, &u).unwrap();
        assert_eq!(store.load_uuids(dev).unwrap(), u);

        let mut bm = SyncBitmap::new(128);
        bm.set_range(10, 20);
        store.save_bitmap(dev, &bm).unwrap();
        let loaded = store.load_bitmap(dev, 128).unwrap();
        assert_eq!(loaded.words(), bm.words());

        drop(store);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
