//! Binary on-disk snapshot of the file cache.
//!
//! Layout (all integers little-endian):
//!
//! ```text
//! magic:u32 = 0xCAFEBABE
//! version:u32 = 1
//! file_count:u32
//! repeat file_count times:
//!   filename_len:u32, filename:bytes
//!   mime_len:u32, mime:bytes
//!   data_size:u64
//!   last_modified:u64   (seconds since epoch)
//!   data:bytes[data_size]
//! ```

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

use tracing::{info, warn};

use super::cache::{CachedFile, FileCache, MAX_CACHED_FILES};
use crate::error::{MinuetError, MinuetResult};

pub const SNAPSHOT_MAGIC: u32 = 0xCAFE_BABE;
pub const SNAPSHOT_VERSION: u32 = 1;

const MAX_NAME_LEN: u32 = 256;
const MAX_MIME_LEN: u32 = 64;

fn write_u32_le(w: &mut impl Write, v: u32) -> MinuetResult<()> {
    w.write_all(&v.to_le_bytes())?;
    Ok(())
}

fn write_u64_le(w: &mut impl Write, v: u64) -> MinuetResult<()> {
    w.write_all(&v.to_le_bytes())?;
    Ok(())
}

fn read_u32_le(r: &mut impl Read) -> MinuetResult<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64_le(r: &mut impl Read) -> MinuetResult<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_string(r: &mut impl Read, len: u32) -> MinuetResult<String> {
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf)?;
    String::from_utf8(buf).map_err(|_| MinuetError::Snapshot("non-UTF-8 name".to_string()))
}

pub fn save(cache: &FileCache, snapshot_path: &Path) -> MinuetResult<()> {
    if let Some(parent) = snapshot_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let mut out = BufWriter::new(File::create(snapshot_path)?);

    write_u32_le(&mut out, SNAPSHOT_MAGIC)?;
    write_u32_le(&mut out, SNAPSHOT_VERSION)?;
    write_u32_le(&mut out, cache.len() as u32)?;

    for entry in cache.entries() {
        let name = entry.logical_path.as_bytes();
        let mime = entry.mime_type.as_bytes();
        if name.len() as u32 >= MAX_NAME_LEN || mime.len() as u32 >= MAX_MIME_LEN {
            return Err(MinuetError::Snapshot(format!(
                "name too long: {}",
                entry.logical_path
            )));
        }

        write_u32_le(&mut out, name.len() as u32)?;
        out.write_all(name)?;
        write_u32_le(&mut out, mime.len() as u32)?;
        out.write_all(mime)?;
        write_u64_le(&mut out, entry.data.len() as u64)?;
        write_u64_le(&mut out, entry.last_modified)?;
        out.write_all(&entry.data)?;
    }

    out.flush()?;
    info!(
        target: "fileserver",
        path = %snapshot_path.display(),
        files = cache.len(),
        "cache snapshot saved"
    );
    Ok(())
}

/// Load a snapshot. Entries above `max_file_size` are skipped; the entry
/// ceiling is enforced. Magic and version mismatches are errors.
pub fn load(snapshot_path: &Path, max_file_size: usize) -> MinuetResult<FileCache> {
    let mut input = BufReader::new(File::open(snapshot_path)?);

    let magic = read_u32_le(&mut input)?;
    if magic != SNAPSHOT_MAGIC {
        return Err(MinuetError::Snapshot("invalid magic".to_string()));
    }
    let version = read_u32_le(&mut input)?;
    if version != SNAPSHOT_VERSION {
        return Err(MinuetError::Snapshot(format!(
            "unsupported version {version}"
        )));
    }
    let file_count = read_u32_le(&mut input)?;

    let mut cache = FileCache::new();
    for _ in 0..file_count.min(MAX_CACHED_FILES as u32) {
        let name_len = read_u32_le(&mut input)?;
        if name_len >= MAX_NAME_LEN {
            return Err(MinuetError::Snapshot("entry name too long".to_string()));
        }
        let logical_path = read_string(&mut input, name_len)?;

        let mime_len = read_u32_le(&mut input)?;
        if mime_len >= MAX_MIME_LEN {
            return Err(MinuetError::Snapshot("entry mime too long".to_string()));
        }
        let mime_type = read_string(&mut input, mime_len)?;

        let data_size = read_u64_le(&mut input)?;
        let last_modified = read_u64_le(&mut input)?;

        if data_size as usize > max_file_size {
            warn!(
                target: "fileserver",
                logical_path = %logical_path,
                size = data_size,
                "snapshot entry exceeds max file size, skipping"
            );
            input.seek(SeekFrom::Current(data_size as i64))?;
            continue;
        }

        let mut data = vec![0u8; data_size as usize];
        input.read_exact(&mut data)?;

        cache.push(CachedFile {
            logical_path,
            mime_type,
            data,
            last_modified,
        })?;
    }

    info!(
        target: "fileserver",
        path = %snapshot_path.display(),
        files = cache.len(),
        "cache snapshot loaded"
    );
    Ok(cache)
}
