//! On-disk envelope framing for the file content table.
//!
//! Layout, all integers little-endian:
//!
//! ```text
//!  offset  size  field
//!  0       17    magic "FileContentTable."
//!  17      4     hash algorithm name length
//!  21      n     hash algorithm name (UTF-8)
//!  21+n    4     format version (19)
//!  25+n    16    correlation id
//!  41+n    8     body length        (patched after the body is written)
//!  49+n    32    BLAKE3 checksum    (patched after the body is written)
//!  81+n    ..    body
//! ```
//!
//! The checksum covers the header prefix (magic through correlation id),
//! the body bytes, and the body length, in that order, so any mutation of
//! header or body fails validation. The magic, algorithm name, and format
//! version together act as the compatibility guard: on mismatch the
//! loader reports invalid-format and the caller starts fresh.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

use uuid::Uuid;

use crate::{FctError, Result, HASH_ALGORITHM_NAME};

pub(crate) const TABLE_MAGIC: &[u8; 17] = b"FileContentTable.";
pub(crate) const FORMAT_VERSION: u32 = 19;

/// Longest algorithm name the loader will accept; guards the length field
/// against corrupt values before allocation.
const MAX_ALGORITHM_NAME_LEN: u32 = 64;

const CHECKSUM_LEN: usize = 32;

/// Writer-side envelope state: the header prefix plus the offset of the
/// placeholder fields to patch once the body is complete.
pub(crate) struct EnvelopeWriter {
    prefix: Vec<u8>,
    patch_offset: u64,
}

impl EnvelopeWriter {
    /// Write the envelope header with zeroed length/checksum placeholders.
    pub(crate) fn begin<W: Write>(writer: &mut W) -> Result<Self> {
        let correlation_id = *Uuid::new_v4().as_bytes();

        let name = HASH_ALGORITHM_NAME.as_bytes();
        let mut prefix = Vec::with_capacity(TABLE_MAGIC.len() + 4 + name.len() + 4 + 16);
        prefix.extend_from_slice(TABLE_MAGIC);
        prefix.extend_from_slice(&(name.len() as u32).to_le_bytes());
        prefix.extend_from_slice(name);
        prefix.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        prefix.extend_from_slice(&correlation_id);

        writer.write_all(&prefix)?;
        writer.write_all(&0u64.to_le_bytes())?;
        writer.write_all(&[0u8; CHECKSUM_LEN])?;

        let patch_offset = prefix.len() as u64;
        Ok(Self {
            prefix,
            patch_offset,
        })
    }

    /// Hasher pre-seeded with the header prefix; the caller feeds it the
    /// body bytes as they are written, then calls [`finish_checksum`].
    pub(crate) fn hasher(&self) -> blake3::Hasher {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.prefix);
        hasher
    }

    /// Seek back and fill in the length and checksum placeholders.
    pub(crate) fn patch(&self, file: &mut File, body_len: u64, checksum: [u8; 32]) -> Result<()> {
        file.seek(SeekFrom::Start(self.patch_offset))?;
        file.write_all(&body_len.to_le_bytes())?;
        file.write_all(&checksum)?;
        Ok(())
    }
}

/// Parsed and length-validated envelope header; the body follows in the
/// reader.
#[derive(Debug)]
pub(crate) struct EnvelopeHeader {
    prefix: Vec<u8>,
    pub body_len: u64,
    checksum: [u8; 32],
}

impl EnvelopeHeader {
    /// Read the header and apply the compatibility guard.
    pub(crate) fn read<R: Read>(reader: &mut R) -> Result<Self> {
        let mut magic = [0u8; 17];
        reader.read_exact(&mut magic)?;
        if &magic != TABLE_MAGIC {
            return Err(FctError::InvalidFormat("bad magic".into()));
        }

        let name_len = read_u32(reader)?;
        if name_len > MAX_ALGORITHM_NAME_LEN {
            return Err(FctError::InvalidFormat(format!(
                "algorithm name length {} out of range",
                name_len
            )));
        }
        let mut name = vec![0u8; name_len as usize];
        reader.read_exact(&mut name)?;
        if name != HASH_ALGORITHM_NAME.as_bytes() {
            return Err(FctError::InvalidFormat(format!(
                "hash algorithm {:?} does not match {:?}",
                String::from_utf8_lossy(&name),
                HASH_ALGORITHM_NAME
            )));
        }

        let format_version = read_u32(reader)?;
        if format_version != FORMAT_VERSION {
            return Err(FctError::InvalidFormat(format!(
                "format version {} does not match {}",
                format_version, FORMAT_VERSION
            )));
        }

        let mut correlation_id = [0u8; 16];
        reader.read_exact(&mut correlation_id)?;

        let mut body_len_bytes = [0u8; 8];
        reader.read_exact(&mut body_len_bytes)?;
        let body_len = u64::from_le_bytes(body_len_bytes);

        let mut checksum = [0u8; CHECKSUM_LEN];
        reader.read_exact(&mut checksum)?;

        let mut prefix = Vec::with_capacity(17 + 4 + name.len() + 4 + 16);
        prefix.extend_from_slice(&magic);
        prefix.extend_from_slice(&(name_len).to_le_bytes());
        prefix.extend_from_slice(&name);
        prefix.extend_from_slice(&format_version.to_le_bytes());
        prefix.extend_from_slice(&correlation_id);

        Ok(Self {
            prefix,
            body_len,
            checksum,
        })
    }

    /// Verify the stored checksum against the body actually read.
    pub(crate) fn verify(&self, body: &[u8]) -> Result<()> {
        if body.len() as u64 != self.body_len {
            return Err(FctError::InvalidFormat(format!(
                "body length {} does not match header {}",
                body.len(),
                self.body_len
            )));
        }
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.prefix);
        hasher.update(body);
        hasher.update(&self.body_len.to_le_bytes());
        if hasher.finalize().as_bytes() != &self.checksum {
            return Err(FctError::InvalidFormat("body checksum mismatch".into()));
        }
        Ok(())
    }
}

/// Fold the body length into a prefix+body hasher and produce the final
/// envelope checksum.
pub(crate) fn finish_checksum(mut hasher: blake3::Hasher, body_len: u64) -> [u8; 32] {
    hasher.update(&body_len.to_le_bytes());
    *hasher.finalize().as_bytes()
}

fn read_u32<R: Read>(reader: &mut R) -> Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}
