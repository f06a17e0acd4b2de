//! Sorted set: one logical collection, two indexes.
//!
//! An `AHashMap<Bytes, f64>` answers member→score in O(1); the
//! [`SkipList`] keeps (score, member) order for ranged reads and rank
//! queries. Every mutation updates both or neither — the pair never
//! disagrees between commands.

use ahash::AHashMap;
use bytes::Bytes;

use super::skiplist::{Iter, SkipList};
use crate::object::normalize_range;

pub use super::skiplist::ScoreBound;

/// An add or increment produced a NaN score (e.g. +inf + -inf).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NanScore;

#[derive(Debug, Default)]
pub struct SortedSet {
    scores: AHashMap<Bytes, f64>,
    list: SkipList,
}

impl Clone for SortedSet {
    fn clone(&self) -> Self {
        // rebuild the skip list rather than deep-copying arena state;
        // clones happen off the hot path (background snapshots)
        let mut copy = SortedSet::new();
        for (member, score) in self.iter() {
            copy.scores.insert(member.clone(), score);
            copy.list.insert(member.clone(), score);
        }
        copy
    }
}

impl SortedSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.scores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    /// The shared ZADD/ZINCRBY primitive. With `incr` false the score
    /// replaces any existing one; with `incr` true it is added to it.
    /// Returns the final score and whether the member was newly added.
    pub fn upsert(&mut self, member: Bytes, score: f64, incr: bool) -> Result<(f64, bool), NanScore> {
        match self.scores.get(&member).copied() {
            Some(old) => {
                let new = if incr { old + score } else { score };
                if new.is_nan() {
                    return Err(NanScore);
                }
                if new != old {
                    self.list.remove(&member, old);
                    self.list.insert(member.clone(), new);
                    self.scores.insert(member, new);
                }
                Ok((new, false))
            }
            None => {
                if score.is_nan() {
                    return Err(NanScore);
                }
                self.list.insert(member.clone(), score);
                self.scores.insert(member, score);
                Ok((score, true))
            }
        }
    }

    /// Removes a member. Returns `true` if it existed.
    pub fn remove(&mut self, member: &[u8]) -> bool {
        match self.scores.remove(member) {
            Some(score) => {
                let removed = self.list.remove(member, score);
                debug_assert!(removed, "indexes out of sync");
                true
            }
            None => false,
        }
    }

    pub fn score(&self, member: &[u8]) -> Option<f64> {
        self.scores.get(member).copied()
    }

    pub fn contains(&self, member: &[u8]) -> bool {
        self.scores.contains_key(member)
    }

    /// 0-based rank, lowest score first; `rev` counts from the top.
    pub fn rank(&self, member: &[u8], rev: bool) -> Option<usize> {
        let score = self.score(member)?;
        let rank = self.list.rank(member, score)?;
        Some(if rev { self.len() - 1 - rank } else { rank })
    }

    /// Members in rank range [start, stop] (inclusive, negative
    /// indices allowed). `rev` walks the range from the top.
    pub fn range_by_rank(&self, start: i64, stop: i64, rev: bool) -> Vec<(Bytes, f64)> {
        let len = self.len() as i64;
        // map reversed indices onto the forward order
        let (start, stop) = if rev {
            let (s, e) = normalize_range(start, stop, len);
            (len - 1 - e, len - 1 - s)
        } else {
            normalize_range(start, stop, len)
        };
        if start > stop || stop < 0 {
            return Vec::new();
        }
        let count = (stop - start + 1) as usize;
        let mut out: Vec<(Bytes, f64)> = self
            .list
            .iter_from_rank(start.max(0) as usize)
            .take(count)
            .map(|(m, s)| (m.clone(), s))
            .collect();
        if rev {
            out.reverse();
        }
        out
    }

    /// Members with score in [min, max], with an optional
    /// (offset, count) window applied after the range filter.
    pub fn range_by_score(
        &self,
        min: &ScoreBound,
        max: &ScoreBound,
        window: Option<(usize, usize)>,
    ) -> Vec<(Bytes, f64)> {
        let in_range = self
            .list
            .iter_from_score(min)
            .take_while(|(_, s)| max.accepts_as_max(*s))
            .map(|(m, s)| (m.clone(), s));
        match window {
            Some((offset, count)) => in_range.skip(offset).take(count).collect(),
            None => in_range.collect(),
        }
    }

    pub fn count_in_range(&self, min: &ScoreBound, max: &ScoreBound) -> usize {
        self.list.count_in_range(min, max)
    }

    /// Removes members with score in [min, max]; returns how many.
    pub fn remove_range_by_score(&mut self, min: &ScoreBound, max: &ScoreBound) -> usize {
        let removed = self.list.remove_range_by_score(min, max);
        for member in &removed {
            self.scores.remove(member);
        }
        removed.len()
    }

    /// Removes members at ranks [start, stop] (negative allowed);
    /// returns how many.
    pub fn remove_range_by_rank(&mut self, start: i64, stop: i64) -> usize {
        let (start, stop) = normalize_range(start, stop, self.len() as i64);
        if start > stop {
            return 0;
        }
        let removed = self
            .list
            .remove_range_by_rank(start as usize, stop as usize);
        for member in &removed {
            self.scores.remove(member);
        }
        removed.len()
    }

    /// Iterates (member, score) pairs in score order.
    pub fn iter(&self) -> Iter<'_> {
        self.list.iter()
    }
}
