//! Out-of-sync bitmap and the bitmap transfer receiver.
//!
//! Two encodings arrive on the wire: plain little-endian word chunks, and
//! RLE with variable-length-integer run lengths. Set segments are OR'd
//! into the local bitmap; the transfer terminates once the bit offset
//! reaches the total bit count.

use crate::error::ReplError;
use crate::proto::vli::{BitstreamReader, BitstreamWriter, vli_decode, vli_encode};

/// Encoding selector carried in the low nibble of the compressed-bitmap
/// header byte.
pub const RLE_VLI_BITS: u8 = 2;

/// One dirty bit covers this many bytes of device data.
pub const BM_BLOCK_SIZE: u64 = 4096;

/// In-memory out-of-sync bitmap, one bit per 4KiB block.
#[derive(Debug, Clone)]
pub struct SyncBitmap {
    words: Vec<u64>,
    bits: u64,
}

impl SyncBitmap {
    pub fn new(bits: u64) -> Self {
        let words = bits.div_ceil(64) as usize;
        Self {
            words: vec![0; words],
            bits,
        }
    }

    pub fn bits(&self) -> u64 {
        self.bits
    }

    pub fn test(&self, bit: u64) -> bool {
        if bit >= self.bits {
            return false;
        }
        self.words[(bit / 64) as usize] & (1 << (bit % 64)) != 0
    }

    pub fn set(&mut self, bit: u64) {
        if bit < self.bits {
            self.words[(bit / 64) as usize] |= 1 << (bit % 64);
        }
    }

    pub fn clear(&mut self, bit: u64) {
        if bit < self.bits {
            self.words[(bit / 64) as usize] &= !(1 << (bit % 64));
        }
    }

    pub fn set_range(&mut self, start: u64, len: u64) {
        for bit in start..(start + len).min(self.bits) {
            self.set(bit);
        }
    }

    pub fn clear_range(&mut self, start: u64, len: u64) {
        for bit in start..(start + len).min(self.bits) {
            self.clear(bit);
        }
    }

    pub fn set_all(&mut self) {
        self.set_range(0, self.bits);
    }

    /// Count of dirty bits; the `ch` figure in split-brain policies.
    pub fn count_set(&self) -> u64 {
        self.words.iter().map(|w| w.count_ones() as u64).sum()
    }

    pub fn or_word(&mut self, index: usize, value: u64) {
        if index < self.words.len() {
            self.words[index] |= value;
            if index == self.words.len() - 1 {
                let tail = self.bits % 64;
                if tail != 0 {
                    self.words[index] &= (1u64 << tail) - 1;
                }
            }
        }
    }

    pub fn words(&self) -> &[u64] {
        &self.words
    }
}

/// Whether a transfer chunk completed the bitmap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitmapChunk {
    Continue,
    Done,
}

/// Progress state across P_BITMAP / P_COMPRESSED_BITMAP frames.
#[derive(Debug, Default)]
pub struct BitmapReceiver {
    bit_offset: u64,
    word_offset: usize,
}

impl BitmapReceiver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Plain chunk: little-endian u64 words, OR'd in at the running word
    /// offset.
    pub fn recv_plain(
        &mut self,
        bitmap: &mut SyncBitmap,
        payload: &[u8],
    ) -> Result<BitmapChunk, ReplError> {
        if payload.len() % 8 != 0 {
            return Err(ReplError::malformed("bitmap chunk not word aligned"));
        }
        let words = payload.len() / 8;
        if (self.word_offset + words) as u64 * 64 >= bitmap.bits() + 64 {
            return Err(ReplError::malformed("bitmap chunk past end"));
        }
        for (i, chunk) in payload.chunks_exact(8).enumerate() {
            let word = u64::from_le_bytes(chunk.try_into().expect("8-byte chunk"));
            bitmap.or_word(self.word_offset + i, word);
        }
        self.word_offset += words;
        self.bit_offset = ((self.word_offset as u64) * 64).min(bitmap.bits());
        Ok(self.progress(bitmap))
    }

    /// RLE chunk: one header byte, then a VLI bitstream of run lengths
    /// alternating clear/set.
    pub fn recv_rle(
        &mut self,
        bitmap: &mut SyncBitmap,
        payload: &[u8],
    ) -> Result<BitmapChunk, ReplError> {
        let Some((&head, stream)) = payload.split_first() else {
            return Err(ReplError::malformed("empty compressed bitmap chunk"));
        };
        let code = head & 0x0f;
        if code != RLE_VLI_BITS {
            return Err(ReplError::malformed(format!(
                "unknown bitmap encoding {code}"
            )));
        }
        let pad_bits = (head >> 4) & 0x07;
        let mut set = head & 0x80 != 0;

        let mut reader = BitstreamReader::new(stream, pad_bits);
        while reader.remaining() > 0 {
            let run = vli_decode(&mut reader)
                .ok_or_else(|| ReplError::malformed("truncated bitmap run"))?;
            if self.bit_offset + run > bitmap.bits() {
                return Err(ReplError::malformed("bitmap run overflow"));
            }
            if set {
                bitmap.set_range(self.bit_offset, run);
            }
            self.bit_offset += run;
            set = !set;
        }
        Ok(self.progress(bitmap))
    }

    fn progress(&self, bitmap: &SyncBitmap) -> BitmapChunk {
        if self.bit_offset >= bitmap.bits() {
            BitmapChunk::Done
        } else {
            BitmapChunk::Continue
        }
    }
}

/// Encode a whole bitmap as one RLE chunk (header byte + bitstream).
pub fn encode_rle(bitmap: &SyncBitmap) -> Vec<u8> {
    let mut writer = BitstreamWriter::new();
    let start_set = bitmap.test(0);
    let mut current = start_set;
    let mut run = 0u64;
    for bit in 0..bitmap.bits() {
        if bitmap.test(bit) == current {
            run += 1;
        } else {
            vli_encode(&mut writer, run);
            current = !current;
            run = 1;
        }
    }
    if run > 0 {
        vli_encode(&mut writer, run);
    }
    let pad = writer.pad_bits();
    let stream = writer.finish();
    let mut out = Vec::with_capacity(1 + stream.len());
    out.push(RLE_VLI_BITS | (pad << 4) | ((start_set as u8) << 7));
    out.extend_from_slice(&stream);
    out
}

/// Encode a whole bitmap as plain little-endian words.
pub fn encode_plain(bitmap: &SyncBitmap) -> Vec<u8> {
    let mut out = Vec::with_capacity(bitmap.words().len() * 8);
    for word in bitmap.words() {
        out.extend_from_slice(&word.to_le_bytes());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_bitmap(bits: u64) -> SyncBitmap {
        let mut bm = SyncBitmap::new(bits);
        bm.set_range(3, 9);
        bm.set(64);
        bm.set_range(100, 40);
        bm.set(bits - 1);
        bm
    }

    #[test]
    fn rle_roundtrip() {
        let bm = sample_bitmap(400);
        let chunk = encode_rle(&bm);

        let mut target = SyncBitmap::new(400);
        let mut rx = BitmapReceiver::new();
        assert_eq!(rx.recv_rle(&mut target, &chunk).unwrap(), BitmapChunk::Done);
        assert_eq!(target.words(), bm.words());
    }

    #[test]
    fn rle_roundtrip_starts_set() {
        let mut bm = SyncBitmap::new(130);
        bm.set_range(0, 130);
        let chunk = encode_rle(&bm);
        let mut target = SyncBitmap::new(130);
        let mut rx = BitmapReceiver::new();
        assert_eq!(rx.recv_rle(&mut target, &chunk).unwrap(), BitmapChunk::Done);
        assert_eq!(target.count_set(), 130);
    }

    #[test]
    fn plain_roundtrip_in_chunks() {
        let bm = sample_bitmap(256);
        let payload = encode_plain(&bm);

        let mut target = SyncBitmap::new(256);
        let mut rx = BitmapReceiver::new();
        assert_eq!(
            rx.recv_plain(&mut target, &payload[..16]).unwrap(),
            BitmapChunk::Continue
        );
        assert_eq!(
            rx.recv_plain(&mut target, &payload[16..]).unwrap(),
            BitmapChunk::Done
        );
        assert_eq!(target.words(), bm.words());
    }

    #[test]
    fn rle_overflow_rejected() {
        let mut bm = SyncBitmap::new(64);
        bm.set_range(0, 64);
        let chunk = encode_rle(&bm);
        // decode into a smaller bitmap
        let mut target = SyncBitmap::new(32);
        let mut rx = BitmapReceiver::new();
        assert!(rx.recv_rle(&mut target, &chunk).is_err());
    }

    #[test]
    fn unknown_encoding_rejected() {
        let mut target = SyncBitmap::new(64);
        let mut rx = BitmapReceiver::new();
        assert!(rx.recv_rle(&mut target, &[0x05, 0xff]).is_err());
    }

    #[test]
    fn set_ranges_or_into_existing_bits() {
        let mut bm = SyncBitmap::new(128);
        bm.set(5);
        let mut src = SyncBitmap::new(128);
        src.set(70);
        let chunk = encode_rle(&src);
        let mut rx = BitmapReceiver::new();
        rx.recv_rle(&mut bm, &chunk).unwrap();
        assert!(bm.test(5));
        assert!(bm.test(70));
        assert_eq!(bm.count_set(), 2);
    }
}
