//! cinder-core: the storage engine.
//!
//! Owns the value model, the per-database keyspace with expiration,
//! and the data-type engines (lists, sets, sorted sets, hashes) plus
//! the SORT machinery. Everything here is single-threaded by design:
//! exactly one executor task owns the keyspace, so no type in this
//! crate carries a lock.

pub mod db;
pub mod expiry;
pub mod glob;
pub mod object;
pub mod sort;
pub mod time;
pub mod types;

pub use db::{Db, Entry, Keyspace, Storage, SwapPtr};
pub use glob::GlobPattern;
pub use object::{StrValue, Value};
pub use sort::{SortError, SortOptions};
pub use types::hash::Hash;
pub use types::sorted_set::{NanScore, ScoreBound, SortedSet};
