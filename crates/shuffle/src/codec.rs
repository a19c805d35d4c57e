//! Block framing and record encoding for sorted runs.
//!
//! A run is a sequence of blocks, each a 12-byte little-endian header
//! `raw_len, stored_len, crc32` followed by `stored_len` bytes. An all-zero
//! header ends the run. After decompression a block payload is a
//! concatenation of `key_len:u32, value_len:u32, key, value` records; a
//! record never spans two blocks.

use std::io::Read;

use rse_common::{CompressionCodec, Result, RseError};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Encoded size of a [`BlockHeader`].
pub const BLOCK_HEADER_LEN: usize = 12;
/// Payload size at which writers cut a new block.
pub const DEFAULT_BLOCK_BYTES: usize = 64 * 1024;
const RECORD_PREFIX_LEN: usize = 8;

/// One key/value pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl Record {
    pub fn new(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Bytes this record occupies inside a block payload.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        RECORD_PREFIX_LEN + self.key.len() + self.value.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub raw_len: u32,
    pub stored_len: u32,
    pub crc32: u32,
}

impl BlockHeader {
    pub const EOF: BlockHeader = BlockHeader {
        raw_len: 0,
        stored_len: 0,
        crc32: 0,
    };

    #[must_use]
    pub fn is_eof(&self) -> bool {
        self.raw_len == 0 && self.stored_len == 0
    }

    #[must_use]
    pub fn encode(&self) -> [u8; BLOCK_HEADER_LEN] {
        let mut out = [0_u8; BLOCK_HEADER_LEN];
        out[0..4].copy_from_slice(&self.raw_len.to_le_bytes());
        out[4..8].copy_from_slice(&self.stored_len.to_le_bytes());
        out[8..12].copy_from_slice(&self.crc32.to_le_bytes());
        out
    }

    #[must_use]
    pub fn decode(bytes: &[u8; BLOCK_HEADER_LEN]) -> Self {
        Self {
            raw_len: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            stored_len: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            crc32: u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
        }
    }
}

/// Append one record to a block payload.
pub fn encode_record(buf: &mut Vec<u8>, key: &[u8], value: &[u8]) {
    buf.extend_from_slice(&(key.len() as u32).to_le_bytes());
    buf.extend_from_slice(&(value.len() as u32).to_le_bytes());
    buf.extend_from_slice(key);
    buf.extend_from_slice(value);
}

/// Decode the record starting at `*pos` in `payload`, advancing `pos`.
///
/// Returns `Ok(None)` at the end of the payload.
pub fn decode_record(payload: &[u8], pos: &mut usize) -> Result<Option<Record>> {
    if *pos == payload.len() {
        return Ok(None);
    }
    let rest = &payload[*pos..];
    if rest.len() < RECORD_PREFIX_LEN {
        return Err(RseError::Corrupt(format!(
            "record prefix truncated at offset {}",
            *pos
        )));
    }
    let key_len = u32::from_le_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
    let value_len = u32::from_le_bytes([rest[4], rest[5], rest[6], rest[7]]) as usize;
    let end = RECORD_PREFIX_LEN
        .checked_add(key_len)
        .and_then(|n| n.checked_add(value_len))
        .ok_or_else(|| RseError::Corrupt("record length overflow".to_string()))?;
    if rest.len() < end {
        return Err(RseError::Corrupt(format!(
            "record body truncated at offset {}: need {end} bytes, have {}",
            *pos,
            rest.len()
        )));
    }
    let key = rest[RECORD_PREFIX_LEN..RECORD_PREFIX_LEN + key_len].to_vec();
    let value = rest[RECORD_PREFIX_LEN + key_len..end].to_vec();
    *pos += end;
    Ok(Some(Record { key, value }))
}

/// Compress a payload into stored bytes and the header describing them.
pub fn seal_block(codec: CompressionCodec, payload: &[u8]) -> (BlockHeader, Vec<u8>) {
    let stored = match codec {
        CompressionCodec::None => payload.to_vec(),
        CompressionCodec::Lz4 => lz4_flex::block::compress(payload),
    };
    let header = BlockHeader {
        raw_len: payload.len() as u32,
        stored_len: stored.len() as u32,
        crc32: crc32fast::hash(&stored),
    };
    (header, stored)
}

/// Check a stored block against its header.
pub fn verify_block(header: &BlockHeader, stored: &[u8]) -> Result<()> {
    let actual = crc32fast::hash(stored);
    if actual != header.crc32 {
        return Err(RseError::Corrupt(format!(
            "block checksum mismatch: expected {:08x}, got {actual:08x}",
            header.crc32
        )));
    }
    Ok(())
}

/// Verify and decompress a stored block into its payload.
pub fn open_block(codec: CompressionCodec, header: &BlockHeader, stored: &[u8]) -> Result<Vec<u8>> {
    verify_block(header, stored)?;
    let payload = match codec {
        CompressionCodec::None => stored.to_vec(),
        CompressionCodec::Lz4 => lz4_flex::block::decompress(stored, header.raw_len as usize)
            .map_err(|e| RseError::Corrupt(format!("lz4 block decode failed: {e}")))?,
    };
    if payload.len() != header.raw_len as usize {
        return Err(RseError::Corrupt(format!(
            "block payload length {} does not match header raw_len {}",
            payload.len(),
            header.raw_len
        )));
    }
    Ok(payload)
}

/// Read one framed block from a blocking reader.
///
/// Returns the header and stored bytes; the EOF header comes back with an
/// empty body. A stream that ends before the EOF header is corrupt, and so
/// is a header claiming more than `max_stored` body bytes.
pub fn read_block<R: Read>(reader: &mut R, max_stored: u64) -> Result<(BlockHeader, Vec<u8>)> {
    let mut hdr = [0_u8; BLOCK_HEADER_LEN];
    reader.read_exact(&mut hdr).map_err(truncated)?;
    let header = BlockHeader::decode(&hdr);
    if header.is_eof() {
        return Ok((header, Vec::new()));
    }
    check_stored_len(&header, max_stored)?;
    let mut stored = vec![0_u8; header.stored_len as usize];
    reader.read_exact(&mut stored).map_err(truncated)?;
    Ok((header, stored))
}

/// Async counterpart of [`read_block`] for fetch bodies.
pub async fn read_block_async<R>(reader: &mut R, max_stored: u64) -> Result<(BlockHeader, Vec<u8>)>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut hdr = [0_u8; BLOCK_HEADER_LEN];
    reader.read_exact(&mut hdr).await.map_err(truncated)?;
    let header = BlockHeader::decode(&hdr);
    if header.is_eof() {
        return Ok((header, Vec::new()));
    }
    check_stored_len(&header, max_stored)?;
    let mut stored = vec![0_u8; header.stored_len as usize];
    reader.read_exact(&mut stored).await.map_err(truncated)?;
    Ok((header, stored))
}

fn check_stored_len(header: &BlockHeader, max_stored: u64) -> Result<()> {
    if u64::from(header.stored_len) > max_stored {
        return Err(RseError::Corrupt(format!(
            "block claims {} stored bytes, at most {max_stored} remain",
            header.stored_len
        )));
    }
    Ok(())
}

fn truncated(e: std::io::Error) -> RseError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        RseError::Corrupt("run truncated before end-of-run marker".to_string())
    } else {
        RseError::Io(e)
    }
}
