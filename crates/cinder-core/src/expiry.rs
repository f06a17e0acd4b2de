//! Active expiration by random sampling.
//!
//! Lazy eviction on lookup handles keys that clients still read;
//! this cycle reclaims the ones nobody touches. Per database it
//! samples a batch from the expiry map, removes the expired entries,
//! and goes again while more than a quarter of the batch was dead —
//! adaptive enough to drain a high-expiry-density keyspace without
//! stalling the executor on a clean one.

use crate::db::Keyspace;

/// Keys sampled from each database's expiry map per round.
const SAMPLE_SIZE: usize = 100;

/// Fraction of the sample that must be expired to warrant another round.
const REPEAT_THRESHOLD: usize = SAMPLE_SIZE / 4;

/// Runs one expiration cycle over every database. Returns the total
/// number of keys removed.
pub fn run_cycle(keyspace: &mut Keyspace) -> usize {
    let mut total_removed = 0;
    for db in keyspace.dbs_mut() {
        loop {
            if db.expires.is_empty() {
                break;
            }
            let sample = db.sample_expires(SAMPLE_SIZE);
            let mut removed = 0;
            for key in &sample {
                if db.expire_if_needed(key) {
                    removed += 1;
                }
            }
            total_removed += removed;
            if removed <= REPEAT_THRESHOLD {
                break;
            }
        }
    }
    total_removed
}
