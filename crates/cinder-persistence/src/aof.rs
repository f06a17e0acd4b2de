//! The append-only journal.
//!
//! Every mutating command is appended as a multi-bulk frame — the
//! same bytes a client would have sent — so replay is nothing more
//! than feeding the file back through the request parser. A
//! synthetic `SELECT <db>` frame precedes any command whose database
//! differs from the journal's last, and time-relative commands are
//! rewritten by the executor (EXPIRE → EXPIREAT) before they get
//! here, making the journal replayable at any later time.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Bytes, BytesMut};
use cinder_protocol::{encode_command, RequestParser};
use thiserror::Error;
use tracing::warn;

use crate::snapshot::{SnapEntry, SnapValue};

/// When the journal file is flushed to stable storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FsyncPolicy {
    /// Leave it to the OS.
    Never,
    /// At most one fsync per wall-clock second.
    #[default]
    EverySecond,
    /// After every appended command.
    Always,
}

/// Errors replaying a journal.
#[derive(Debug, Error)]
pub enum AofError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("journal is malformed: {0}")]
    BadFrame(#[from] cinder_protocol::ProtocolError),
}

/// Appends command frames to the live journal file.
pub struct AofWriter {
    path: PathBuf,
    file: File,
    policy: FsyncPolicy,
    last_fsync_secs: u64,
    current_db: Option<u32>,
    scratch: BytesMut,
}

impl AofWriter {
    /// Opens (or creates) the journal for appending.
    pub fn open(path: impl Into<PathBuf>, policy: FsyncPolicy) -> io::Result<Self> {
        let path = path.into();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file,
            policy,
            last_fsync_secs: 0,
            current_db: None,
            scratch: BytesMut::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one command, preceded by `SELECT <db>` when the target
    /// database changed since the last append.
    pub fn append(&mut self, db: u32, argv: &[Bytes]) -> io::Result<()> {
        self.scratch.clear();
        if self.current_db != Some(db) {
            encode_select(&mut self.scratch, db);
            self.current_db = Some(db);
        }
        encode_command(&mut self.scratch, argv);
        self.file.write_all(&self.scratch)?;

        match self.policy {
            FsyncPolicy::Always => self.file.sync_data()?,
            FsyncPolicy::EverySecond => {
                let now = unix_secs();
                if now != self.last_fsync_secs {
                    self.file.sync_data()?;
                    self.last_fsync_secs = now;
                }
            }
            FsyncPolicy::Never => {}
        }
        Ok(())
    }

    /// Periodic fsync hook for the `EverySecond` policy. Appends
    /// already fsync on the second boundary; this covers quiet
    /// periods after a burst.
    pub fn fsync_if_due(&mut self) -> io::Result<()> {
        if self.policy == FsyncPolicy::EverySecond {
            let now = unix_secs();
            if now != self.last_fsync_secs {
                self.file.sync_data()?;
                self.last_fsync_secs = now;
            }
        }
        Ok(())
    }

    /// Re-opens the file after a rewrite replaced it on disk. The
    /// db-tracking state resets so the next append re-emits SELECT.
    pub fn reopen(&mut self) -> io::Result<()> {
        self.file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.current_db = None;
        Ok(())
    }
}

/// Writes a minimal equivalent journal for `entries` to `path`:
/// one SET per string, a push/add chain per collection, a trailing
/// EXPIREAT where applicable. Used by the background rewrite.
pub fn write_rewrite(path: &Path, entries: &[SnapEntry]) -> io::Result<()> {
    let file = File::create(path)?;
    let mut w = BufWriter::new(file);
    let mut frame = BytesMut::new();
    let mut current_db: Option<u32> = None;

    for entry in entries {
        frame.clear();
        if current_db != Some(entry.db) {
            encode_select(&mut frame, entry.db);
            current_db = Some(entry.db);
        }

        let key = &entry.key;
        match &entry.value {
            SnapValue::Str(data) => {
                encode_command(
                    &mut frame,
                    &[Bytes::from_static(b"SET"), key.clone(), data.clone()],
                );
            }
            SnapValue::List(items) => {
                for item in items {
                    encode_command(
                        &mut frame,
                        &[Bytes::from_static(b"RPUSH"), key.clone(), item.clone()],
                    );
                }
            }
            SnapValue::Set(members) => {
                for member in members {
                    encode_command(
                        &mut frame,
                        &[Bytes::from_static(b"SADD"), key.clone(), member.clone()],
                    );
                }
            }
            SnapValue::Zset(members) => {
                for (member, score) in members {
                    encode_command(
                        &mut frame,
                        &[
                            Bytes::from_static(b"ZADD"),
                            key.clone(),
                            Bytes::from(crate::length::format_g17(*score)),
                            member.clone(),
                        ],
                    );
                }
            }
            SnapValue::Hash(fields) => {
                for (field, value) in fields {
                    encode_command(
                        &mut frame,
                        &[
                            Bytes::from_static(b"HSET"),
                            key.clone(),
                            field.clone(),
                            value.clone(),
                        ],
                    );
                }
            }
        }

        if let Some(at) = entry.expire_at_secs {
            encode_command(
                &mut frame,
                &[
                    Bytes::from_static(b"EXPIREAT"),
                    key.clone(),
                    Bytes::from(at.to_string()),
                ],
            );
        }
        w.write_all(&frame)?;
    }

    w.flush()?;
    w.get_ref().sync_all()?;
    Ok(())
}

/// Appends the accumulated diff to the rewritten temp file, fsyncs,
/// and renames it over the live journal. The final step of a
/// successful background rewrite.
pub fn install_rewrite(tmp: &Path, live: &Path, diff: &[u8]) -> io::Result<()> {
    let mut file = OpenOptions::new().append(true).open(tmp)?;
    file.write_all(diff)?;
    file.sync_all()?;
    fs::rename(tmp, live)
}

/// Replays the journal, handing each command's argv to `apply` (the
/// executor runs it through the normal dispatch path). Returns the
/// number of commands applied. A truncated trailing frame is logged
/// and tolerated; a malformed one is an error.
pub fn replay(path: &Path, mut apply: impl FnMut(Vec<Bytes>)) -> Result<u64, AofError> {
    let mut file = File::open(path)?;
    let mut parser = RequestParser::new();
    let mut buf = BytesMut::with_capacity(64 * 1024);
    let mut chunk = [0u8; 64 * 1024];
    let mut applied = 0u64;

    loop {
        let n = file.read(&mut chunk)?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        while let Some(argv) = parser.next_request(&mut buf)? {
            apply(argv);
            applied += 1;
        }
    }

    if !buf.is_empty() {
        warn!(
            path = %path.display(),
            trailing = buf.len(),
            "journal ends mid-frame; dropping the partial tail"
        );
    }
    Ok(applied)
}

fn encode_select(dst: &mut BytesMut, db: u32) {
    encode_command(
        dst,
        &[Bytes::from_static(b"SELECT"), Bytes::from(db.to_string())],
    );
}

fn unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
