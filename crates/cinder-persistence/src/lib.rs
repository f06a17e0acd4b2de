//! cinder-persistence: durable formats.
//!
//! Two on-disk artifacts keep the keyspace durable:
//!
//! * the **snapshot** — a point-in-time binary dump of every database
//!   with a compressed length encoding (`snapshot`, `length`);
//! * the **journal** — an append-only log of every mutating command,
//!   framed exactly like the client wire protocol (`aof`).
//!
//! Both writers follow the same discipline: write to a temp file,
//! fsync, atomically rename over the live file, and clean the temp
//! file up on failure.

pub mod aof;
pub mod length;
pub mod snapshot;

pub use aof::{AofWriter, FsyncPolicy};
pub use snapshot::{SnapEntry, SnapValue, SnapshotError, SnapshotWriter};
