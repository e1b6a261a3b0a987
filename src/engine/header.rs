//! # File Header
//!
//! Page 0 of the vault file holds two fixed-size header slots, A at byte 0
//! and B at byte [`SLOT_SIZE`]. A checkpoint always writes the slot that is
//! *not* current, with the generation incremented, and syncs it. On open the
//! valid slot with the highest generation wins, so a crash in the middle of
//! a header write leaves the previous checkpoint in force.
//!
//! ```text
//! [magic "BVLT"][version u32][page_size u64][generation u64][total_pages u64]
//! [dir_offset u64][dir_len u64][map_offset u64][map_len u64]
//! [log_offset u64][log_len u64][checkpoint_seq u64][crc32 u32]
//! ```

use crate::encoding::{Decode, Encode, EncodingError};
use crc32fast::Hasher as Crc32;
use tracing::warn;

use super::EngineError;

/// Bytes reserved per header slot.
pub const SLOT_SIZE: usize = 256;

/// Smallest page size that fits both slots.
pub const MIN_PAGE_SIZE: u64 = 2 * SLOT_SIZE as u64;

const MAGIC: [u8; 4] = *b"BVLT";
const VERSION: u32 = 1;

/// Persistent root of a vault: where everything else lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    pub page_size: u64,
    /// Bumped by every checkpoint.
    pub generation: u64,
    pub total_pages: u64,
    pub dir_offset: u64,
    pub dir_len: u64,
    pub map_offset: u64,
    pub map_len: u64,
    pub log_offset: u64,
    pub log_len: u64,
    /// Last sequence id covered by the directory and free map.
    pub checkpoint_seq: u64,
}

impl Encode for FileHeader {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        MAGIC.encode_to(buf)?;
        VERSION.encode_to(buf)?;
        for field in [
            self.page_size,
            self.generation,
            self.total_pages,
            self.dir_offset,
            self.dir_len,
            self.map_offset,
            self.map_len,
            self.log_offset,
            self.log_len,
            self.checkpoint_seq,
        ] {
            field.encode_to(buf)?;
        }
        Ok(())
    }
}

impl Decode for FileHeader {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (magic, mut offset) = <[u8; 4]>::decode_from(buf)?;
        if magic != MAGIC {
            return Err(EncodingError::InvalidTag {
                tag: u32::from_le_bytes(magic),
                type_name: "FileHeader magic",
            });
        }
        let (version, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        if version != VERSION {
            return Err(EncodingError::InvalidTag {
                tag: version,
                type_name: "FileHeader version",
            });
        }

        let mut fields = [0u64; 10];
        for field in fields.iter_mut() {
            let (value, n) = u64::decode_from(&buf[offset..])?;
            *field = value;
            offset += n;
        }
        let [
            page_size,
            generation,
            total_pages,
            dir_offset,
            dir_len,
            map_offset,
            map_len,
            log_offset,
            log_len,
            checkpoint_seq,
        ] = fields;

        Ok((
            Self {
                page_size,
                generation,
                total_pages,
                dir_offset,
                dir_len,
                map_offset,
                map_len,
                log_offset,
                log_len,
                checkpoint_seq,
            },
            offset,
        ))
    }
}

impl FileHeader {
    /// Byte offset of the slot this header is written to.
    pub fn slot_offset(&self) -> u64 {
        (self.generation % 2) * SLOT_SIZE as u64
    }

    /// Encodes into a full, zero-padded slot with trailing CRC.
    pub fn to_slot(&self) -> Result<[u8; SLOT_SIZE], EngineError> {
        let mut body = Vec::with_capacity(SLOT_SIZE);
        self.encode_to(&mut body)?;
        let mut hasher = Crc32::new();
        hasher.update(&body);
        body.extend_from_slice(&hasher.finalize().to_le_bytes());

        let mut slot = [0u8; SLOT_SIZE];
        slot[..body.len()].copy_from_slice(&body);
        Ok(slot)
    }

    /// Parses one slot. `None` if it is empty, torn or foreign.
    pub fn from_slot(slot: &[u8]) -> Option<Self> {
        let (header, consumed) = FileHeader::decode_from(slot).ok()?;
        let stored = u32::decode_from(slot.get(consumed..)?).ok()?.0;
        let mut hasher = Crc32::new();
        hasher.update(&slot[..consumed]);
        (hasher.finalize() == stored).then_some(header)
    }

    /// Picks the valid slot with the highest generation out of page 0.
    pub fn select(page0: &[u8]) -> Result<Self, EngineError> {
        if page0.len() < 2 * SLOT_SIZE {
            return Err(EngineError::InvalidHeader("file shorter than header page".into()));
        }
        let a = Self::from_slot(&page0[..SLOT_SIZE]);
        let b = Self::from_slot(&page0[SLOT_SIZE..2 * SLOT_SIZE]);

        match (a, b) {
            (Some(a), Some(b)) => Ok(if b.generation > a.generation { b } else { a }),
            (Some(h), None) | (None, Some(h)) => {
                warn!(generation = h.generation, "one header slot is invalid");
                Ok(h)
            }
            (None, None) => Err(EngineError::InvalidHeader("no valid header slot".into())),
        }
    }
}
