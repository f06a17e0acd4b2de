//! Point-in-time snapshot files.
//!
//! Layout, after the `REDIS0001` magic:
//!
//! ```text
//! 0xFE <length-encoded db number>     select database
//! 0xFD <i32 le absolute-seconds>      expiry for the next entry
//! <type byte> <key string> <body>     one entry
//! 0xFF                                end of file
//! ```
//!
//! Strings use the encodings in [`crate::length`]; list/set bodies
//! are a length plus elements, sorted sets interleave member and
//! score, hashes interleave field and value.
//!
//! The writer targets `temp-<pid>.rdb` next to the destination and
//! renames over it only after a successful fsync, so a crashed or
//! failed dump never clobbers the previous snapshot. An unfinished
//! writer removes its temp file on drop.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use thiserror::Error;
use tracing::warn;

use crate::length;

pub const MAGIC: &[u8; 9] = b"REDIS0001";

const OP_EOF: u8 = 0xFF;
const OP_SELECT_DB: u8 = 0xFE;
const OP_EXPIRE: u8 = 0xFD;

const TYPE_STRING: u8 = 0;
const TYPE_LIST: u8 = 1;
const TYPE_SET: u8 = 2;
const TYPE_ZSET: u8 = 3;
const TYPE_HASH: u8 = 4;

/// Errors reading or writing snapshot files.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("not a snapshot file (bad magic)")]
    BadMagic,

    #[error("unsupported snapshot version {0}")]
    UnsupportedVersion(String),

    #[error("snapshot ends mid-record")]
    Truncated,

    #[error("corrupt snapshot: {0}")]
    Corrupt(String),
}

/// A value in exchange form, decoded from (or bound for) a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub enum SnapValue {
    Str(Bytes),
    List(Vec<Bytes>),
    Set(Vec<Bytes>),
    Zset(Vec<(Bytes, f64)>),
    Hash(Vec<(Bytes, Bytes)>),
}

/// One entry read back from a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapEntry {
    pub db: u32,
    pub key: Bytes,
    pub value: SnapValue,
    /// Absolute expiry in unix seconds, if any.
    pub expire_at_secs: Option<i64>,
}

/// Streaming snapshot writer with atomic-rename semantics.
pub struct SnapshotWriter {
    final_path: PathBuf,
    tmp_path: PathBuf,
    writer: BufWriter<File>,
    compression: bool,
    current_db: Option<u32>,
    finished: bool,
}

impl SnapshotWriter {
    /// Starts a snapshot aimed at `path`. Nothing appears there until
    /// [`Self::finish`] succeeds.
    pub fn create(path: impl Into<PathBuf>, compression: bool) -> Result<Self, SnapshotError> {
        let final_path = path.into();
        let tmp_path = temp_path(&final_path);
        let file = File::create(&tmp_path)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(MAGIC)?;
        Ok(Self {
            final_path,
            tmp_path,
            writer,
            compression,
            current_db: None,
            finished: false,
        })
    }

    /// Writes one entry, emitting a database selector when `db`
    /// differs from the previous entry's.
    pub fn write_entry(
        &mut self,
        db: u32,
        key: &[u8],
        value: &SnapValue,
        expire_at_secs: Option<i64>,
    ) -> Result<(), SnapshotError> {
        if self.current_db != Some(db) {
            self.writer.write_all(&[OP_SELECT_DB])?;
            length::write_length(&mut self.writer, db)?;
            self.current_db = Some(db);
        }
        if let Some(at) = expire_at_secs {
            self.writer.write_all(&[OP_EXPIRE])?;
            let clamped = at.clamp(0, i32::MAX as i64) as i32;
            self.writer.write_all(&clamped.to_le_bytes())?;
        }

        let w = &mut self.writer;
        match value {
            SnapValue::Str(data) => {
                w.write_all(&[TYPE_STRING])?;
                length::write_string(w, key, self.compression)?;
                length::write_string(w, data, self.compression)?;
            }
            SnapValue::List(items) => {
                w.write_all(&[TYPE_LIST])?;
                length::write_string(w, key, self.compression)?;
                length::write_length(w, items.len() as u32)?;
                for item in items {
                    length::write_string(w, item, self.compression)?;
                }
            }
            SnapValue::Set(members) => {
                w.write_all(&[TYPE_SET])?;
                length::write_string(w, key, self.compression)?;
                length::write_length(w, members.len() as u32)?;
                for member in members {
                    length::write_string(w, member, self.compression)?;
                }
            }
            SnapValue::Zset(members) => {
                w.write_all(&[TYPE_ZSET])?;
                length::write_string(w, key, self.compression)?;
                length::write_length(w, members.len() as u32)?;
                for (member, score) in members {
                    length::write_string(w, member, self.compression)?;
                    length::write_double(w, *score)?;
                }
            }
            SnapValue::Hash(fields) => {
                w.write_all(&[TYPE_HASH])?;
                length::write_string(w, key, self.compression)?;
                length::write_length(w, fields.len() as u32)?;
                for (field, value) in fields {
                    length::write_string(w, field, self.compression)?;
                    length::write_string(w, value, self.compression)?;
                }
            }
        }
        Ok(())
    }

    /// Terminates, fsyncs and atomically renames into place.
    pub fn finish(mut self) -> Result<(), SnapshotError> {
        self.writer.write_all(&[OP_EOF])?;
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        fs::rename(&self.tmp_path, &self.final_path)?;
        self.finished = true;
        Ok(())
    }
}

impl Drop for SnapshotWriter {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(e) = fs::remove_file(&self.tmp_path) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(path = %self.tmp_path.display(), "failed to remove temp snapshot: {e}");
                }
            }
        }
    }
}

/// The temp file a snapshot is staged in: `temp-<pid>.rdb` beside
/// the destination.
pub fn temp_path(final_path: &Path) -> PathBuf {
    let name = format!("temp-{}.rdb", std::process::id());
    match final_path.parent() {
        Some(dir) => dir.join(name),
        None => PathBuf::from(name),
    }
}

/// Loads every entry of a snapshot file.
pub fn load(path: &Path) -> Result<Vec<SnapEntry>, SnapshotError> {
    let file = File::open(path)?;
    let mut r = BufReader::new(file);

    let mut magic = [0u8; 9];
    length::read_exact(&mut r, &mut magic)?;
    if &magic[..5] != b"REDIS" {
        return Err(SnapshotError::BadMagic);
    }
    if &magic != MAGIC {
        return Err(SnapshotError::UnsupportedVersion(
            String::from_utf8_lossy(&magic[5..]).into_owned(),
        ));
    }

    let mut entries = Vec::new();
    let mut db = 0u32;
    let mut pending_expire: Option<i64> = None;

    loop {
        let op = read_u8(&mut r)?;
        match op {
            OP_EOF => break,
            OP_SELECT_DB => {
                db = match length::read_length(&mut r)? {
                    length::Length::Plain(n) => n,
                    length::Length::Special(_) => {
                        return Err(SnapshotError::Corrupt("db selector not a length".into()))
                    }
                };
            }
            OP_EXPIRE => {
                let mut raw = [0u8; 4];
                length::read_exact(&mut r, &mut raw)?;
                pending_expire = Some(i32::from_le_bytes(raw) as i64);
            }
            type_byte => {
                let key = Bytes::from(length::read_string(&mut r)?);
                let value = read_body(&mut r, type_byte)?;
                entries.push(SnapEntry {
                    db,
                    key,
                    value,
                    expire_at_secs: pending_expire.take(),
                });
            }
        }
    }
    Ok(entries)
}

fn read_body(r: &mut impl Read, type_byte: u8) -> Result<SnapValue, SnapshotError> {
    match type_byte {
        TYPE_STRING => Ok(SnapValue::Str(Bytes::from(length::read_string(r)?))),
        TYPE_LIST | TYPE_SET => {
            let len = plain_length(r)?;
            let mut items = Vec::with_capacity(capped(len));
            for _ in 0..len {
                items.push(Bytes::from(length::read_string(r)?));
            }
            Ok(if type_byte == TYPE_LIST {
                SnapValue::List(items)
            } else {
                SnapValue::Set(items)
            })
        }
        TYPE_ZSET => {
            let len = plain_length(r)?;
            let mut members = Vec::with_capacity(capped(len));
            for _ in 0..len {
                let member = Bytes::from(length::read_string(r)?);
                let score = length::read_double(r)?;
                members.push((member, score));
            }
            Ok(SnapValue::Zset(members))
        }
        TYPE_HASH => {
            let len = plain_length(r)?;
            let mut fields = Vec::with_capacity(capped(len));
            for _ in 0..len {
                let field = Bytes::from(length::read_string(r)?);
                let value = Bytes::from(length::read_string(r)?);
                fields.push((field, value));
            }
            Ok(SnapValue::Hash(fields))
        }
        other => Err(SnapshotError::Corrupt(format!("unknown type byte {other}"))),
    }
}

/// Caps pre-allocation so a corrupt count cannot reserve gigabytes;
/// the loop still reads exactly `len` elements.
fn capped(len: u32) -> usize {
    (len as usize).min(65_536)
}

fn plain_length(r: &mut impl Read) -> Result<u32, SnapshotError> {
    match length::read_length(r)? {
        length::Length::Plain(len) => Ok(len),
        length::Length::Special(_) => Err(SnapshotError::Corrupt(
            "collection length used a special encoding".into(),
        )),
    }
}

fn read_u8(r: &mut impl Read) -> Result<u8, SnapshotError> {
    let mut b = [0u8; 1];
    length::read_exact(r, &mut b)?;
    Ok(b[0])
}
