//! Skip list ordered by (score, member) with per-link span counts.
//!
//! The span on each forward link counts how many level-0 nodes the
//! link crosses, which is what makes rank queries O(log N): summing
//! spans along the search path yields the position of the landing
//! node. Nodes live in an index arena (`Vec<Node>` plus a free list)
//! so the structure is safe Rust with no reference cycles; index 0 is
//! the head sentinel and never stores data.
//!
//! Expected O(log N) insert/remove/rank with geometric level
//! promotion (p = 1/4, max 32 levels).

use std::cmp::Ordering;

use bytes::Bytes;
use rand::Rng;

const MAX_LEVEL: usize = 32;

/// Promotion probability is 1/BRANCHING per level.
const BRANCHING: u32 = 4;

#[derive(Debug, Clone, Copy, Default)]
struct Link {
    forward: Option<usize>,
    /// Level-0 nodes this link crosses (0 for a dangling link).
    span: usize,
}

#[derive(Debug)]
struct Node {
    member: Bytes,
    score: f64,
    backward: Option<usize>,
    links: Vec<Link>,
}

/// Total order on (score, member); member bytes break score ties.
fn key_cmp(score_a: f64, member_a: &[u8], score_b: f64, member_b: &[u8]) -> Ordering {
    match score_a.partial_cmp(&score_b) {
        Some(Ordering::Equal) | None => member_a.cmp(member_b),
        Some(ord) => ord,
    }
}

/// One endpoint of a score interval. `value` may be ±infinity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreBound {
    pub value: f64,
    pub exclusive: bool,
}

impl ScoreBound {
    pub fn inclusive(value: f64) -> Self {
        Self {
            value,
            exclusive: false,
        }
    }

    /// Parses a ZRANGEBYSCORE-style bound: a float, `-inf` / `+inf`,
    /// with a `(` prefix marking exclusivity. NaN is rejected.
    pub fn parse(data: &[u8]) -> Option<ScoreBound> {
        let (exclusive, rest) = match data.first() {
            Some(b'(') => (true, &data[1..]),
            _ => (false, data),
        };
        let s = std::str::from_utf8(rest).ok()?;
        let value: f64 = s.parse().ok()?;
        if value.is_nan() {
            return None;
        }
        Some(ScoreBound { value, exclusive })
    }

    /// True when `score` satisfies this bound used as a minimum.
    pub fn accepts_as_min(&self, score: f64) -> bool {
        if self.exclusive {
            score > self.value
        } else {
            score >= self.value
        }
    }

    /// True when `score` satisfies this bound used as a maximum.
    pub fn accepts_as_max(&self, score: f64) -> bool {
        if self.exclusive {
            score < self.value
        } else {
            score <= self.value
        }
    }
}

/// The skip list proper. Callers must not insert a (score, member)
/// pair that is already present — the owning sorted set handles
/// updates as remove + insert.
#[derive(Debug)]
pub struct SkipList {
    nodes: Vec<Node>,
    free: Vec<usize>,
    level: usize,
    len: usize,
    tail: Option<usize>,
}

impl SkipList {
    pub fn new() -> Self {
        let head = Node {
            member: Bytes::new(),
            score: 0.0,
            backward: None,
            links: vec![Link::default(); MAX_LEVEL],
        };
        Self {
            nodes: vec![head],
            free: Vec::new(),
            level: 1,
            len: 0,
            tail: None,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn random_level(&self) -> usize {
        let mut rng = rand::rng();
        let mut level = 1;
        while level < MAX_LEVEL && rng.random_range(0..BRANCHING) == 0 {
            level += 1;
        }
        level
    }

    fn alloc(&mut self, member: Bytes, score: f64, level: usize) -> usize {
        let node = Node {
            member,
            score,
            backward: None,
            links: vec![Link::default(); level],
        };
        match self.free.pop() {
            Some(idx) => {
                self.nodes[idx] = node;
                idx
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        }
    }

    /// Inserts a member. The pair must not already be present.
    pub fn insert(&mut self, member: Bytes, score: f64) {
        let mut update = [0usize; MAX_LEVEL];
        let mut rank = [0usize; MAX_LEVEL];

        let mut x = 0;
        for i in (0..self.level).rev() {
            rank[i] = if i == self.level - 1 { 0 } else { rank[i + 1] };
            while let Some(next) = self.nodes[x].links[i].forward {
                let n = &self.nodes[next];
                if key_cmp(n.score, &n.member, score, &member) == Ordering::Less {
                    rank[i] += self.nodes[x].links[i].span;
                    x = next;
                } else {
                    break;
                }
            }
            update[i] = x;
        }

        let new_level = self.random_level();
        if new_level > self.level {
            for i in self.level..new_level {
                rank[i] = 0;
                update[i] = 0;
                self.nodes[0].links[i].span = self.len;
            }
            self.level = new_level;
        }

        let idx = self.alloc(member, score, new_level);
        for i in 0..new_level {
            let prev = update[i];
            let prev_link = self.nodes[prev].links[i];
            self.nodes[idx].links[i].forward = prev_link.forward;
            self.nodes[idx].links[i].span = prev_link.span - (rank[0] - rank[i]);
            self.nodes[prev].links[i].forward = Some(idx);
            self.nodes[prev].links[i].span = rank[0] - rank[i] + 1;
        }
        for i in new_level..self.level {
            self.nodes[update[i]].links[i].span += 1;
        }

        self.nodes[idx].backward = if update[0] == 0 { None } else { Some(update[0]) };
        match self.nodes[idx].links[0].forward {
            Some(next) => self.nodes[next].backward = Some(idx),
            None => self.tail = Some(idx),
        }
        self.len += 1;
    }

    /// Removes a (member, score) pair. Returns `true` if it existed.
    pub fn remove(&mut self, member: &[u8], score: f64) -> bool {
        let mut update = [0usize; MAX_LEVEL];
        let mut x = 0;
        for i in (0..self.level).rev() {
            while let Some(next) = self.nodes[x].links[i].forward {
                let n = &self.nodes[next];
                if key_cmp(n.score, &n.member, score, member) == Ordering::Less {
                    x = next;
                } else {
                    break;
                }
            }
            update[i] = x;
        }

        let target = match self.nodes[x].links[0].forward {
            Some(t) => t,
            None => return false,
        };
        let n = &self.nodes[target];
        if n.score != score || n.member != member {
            return false;
        }

        self.unlink(target, &update);
        self.free.push(target);
        true
    }

    /// Detaches `target`, which is the level-0 successor of
    /// `update[0]`, from every level and fixes spans.
    fn unlink(&mut self, target: usize, update: &[usize; MAX_LEVEL]) {
        for i in 0..self.level {
            let u = update[i];
            if self.nodes[u].links[i].forward == Some(target) {
                let t_link = self.nodes[target].links[i];
                self.nodes[u].links[i].span += t_link.span;
                self.nodes[u].links[i].span -= 1;
                self.nodes[u].links[i].forward = t_link.forward;
            } else {
                self.nodes[u].links[i].span -= 1;
            }
        }
        match self.nodes[target].links[0].forward {
            Some(next) => self.nodes[next].backward = self.nodes[target].backward,
            None => self.tail = self.nodes[target].backward,
        }
        while self.level > 1 && self.nodes[0].links[self.level - 1].forward.is_none() {
            self.nodes[0].links[self.level - 1].span = 0;
            self.level -= 1;
        }
        self.len -= 1;
    }

    /// 0-based rank of a present (member, score) pair.
    pub fn rank(&self, member: &[u8], score: f64) -> Option<usize> {
        let mut rank = 0;
        let mut x = 0;
        for i in (0..self.level).rev() {
            while let Some(next) = self.nodes[x].links[i].forward {
                let n = &self.nodes[next];
                if key_cmp(n.score, &n.member, score, member) != Ordering::Greater {
                    rank += self.nodes[x].links[i].span;
                    x = next;
                } else {
                    break;
                }
            }
        }
        if x != 0 && self.nodes[x].score == score && self.nodes[x].member == member {
            Some(rank - 1)
        } else {
            None
        }
    }

    /// Node index at a 0-based rank.
    fn node_at_rank(&self, rank0: usize) -> Option<usize> {
        if rank0 >= self.len {
            return None;
        }
        let target = rank0 + 1;
        let mut traversed = 0;
        let mut x = 0;
        for i in (0..self.level).rev() {
            while let Some(next) = self.nodes[x].links[i].forward {
                if traversed + self.nodes[x].links[i].span <= target {
                    traversed += self.nodes[x].links[i].span;
                    x = next;
                } else {
                    break;
                }
            }
            if traversed == target {
                return Some(x);
            }
        }
        None
    }

    /// (member, score) at a 0-based rank.
    pub fn get_by_rank(&self, rank0: usize) -> Option<(&Bytes, f64)> {
        self.node_at_rank(rank0)
            .map(|idx| (&self.nodes[idx].member, self.nodes[idx].score))
    }

    /// First node satisfying `min`, with its 0-based rank.
    fn first_in_range(&self, min: &ScoreBound) -> Option<(usize, usize)> {
        let mut x = 0;
        let mut rank = 0;
        for i in (0..self.level).rev() {
            while let Some(next) = self.nodes[x].links[i].forward {
                if !min.accepts_as_min(self.nodes[next].score) {
                    rank += self.nodes[x].links[i].span;
                    x = next;
                } else {
                    break;
                }
            }
        }
        self.nodes[x].links[0].forward.map(|idx| (idx, rank))
    }

    /// Last node satisfying `max`, with its 0-based rank.
    fn last_in_range(&self, max: &ScoreBound) -> Option<(usize, usize)> {
        let mut x = 0;
        let mut rank = 0;
        for i in (0..self.level).rev() {
            while let Some(next) = self.nodes[x].links[i].forward {
                if max.accepts_as_max(self.nodes[next].score) {
                    rank += self.nodes[x].links[i].span;
                    x = next;
                } else {
                    break;
                }
            }
        }
        if x == 0 {
            None
        } else {
            Some((x, rank - 1))
        }
    }

    /// Number of members with a score inside [min, max].
    pub fn count_in_range(&self, min: &ScoreBound, max: &ScoreBound) -> usize {
        let first = match self.first_in_range(min) {
            Some((_, rank)) => rank,
            None => return 0,
        };
        let last = match self.last_in_range(max) {
            Some((_, rank)) => rank,
            None => return 0,
        };
        (last + 1).saturating_sub(first)
    }

    /// Iterates (member, score) pairs in order from the start.
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            list: self,
            cur: self.nodes[0].links[0].forward,
        }
    }

    /// Iterates from a 0-based rank.
    pub fn iter_from_rank(&self, rank0: usize) -> Iter<'_> {
        Iter {
            list: self,
            cur: self.node_at_rank(rank0),
        }
    }

    /// Iterates members whose score satisfies `min`, in order. The
    /// caller stops when the max bound no longer accepts.
    pub fn iter_from_score(&self, min: &ScoreBound) -> Iter<'_> {
        Iter {
            list: self,
            cur: self.first_in_range(min).map(|(idx, _)| idx),
        }
    }

    /// Removes every member with score in [min, max], returning them.
    pub fn remove_range_by_score(&mut self, min: &ScoreBound, max: &ScoreBound) -> Vec<Bytes> {
        let mut update = [0usize; MAX_LEVEL];
        let mut x = 0;
        for i in (0..self.level).rev() {
            while let Some(next) = self.nodes[x].links[i].forward {
                if !min.accepts_as_min(self.nodes[next].score) {
                    x = next;
                } else {
                    break;
                }
            }
            update[i] = x;
        }

        let mut removed = Vec::new();
        while let Some(target) = self.nodes[update[0]].links[0].forward {
            if !max.accepts_as_max(self.nodes[target].score) {
                break;
            }
            self.unlink(target, &update);
            removed.push(std::mem::take(&mut self.nodes[target].member));
            self.free.push(target);
        }
        removed
    }

    /// Removes members at 0-based ranks [start, stop], returning them.
    pub fn remove_range_by_rank(&mut self, start0: usize, stop0: usize) -> Vec<Bytes> {
        if start0 >= self.len || start0 > stop0 {
            return Vec::new();
        }
        let stop0 = stop0.min(self.len - 1);
        // 1-based bounds, matching the span arithmetic
        let start = start0 + 1;
        let mut remaining = stop0 - start0 + 1;

        let mut update = [0usize; MAX_LEVEL];
        let mut traversed = 0;
        let mut x = 0;
        for i in (0..self.level).rev() {
            while let Some(next) = self.nodes[x].links[i].forward {
                if traversed + self.nodes[x].links[i].span < start {
                    traversed += self.nodes[x].links[i].span;
                    x = next;
                } else {
                    break;
                }
            }
            update[i] = x;
        }

        let mut removed = Vec::with_capacity(remaining);
        while remaining > 0 {
            let target = match self.nodes[update[0]].links[0].forward {
                Some(t) => t,
                None => break,
            };
            self.unlink(target, &update);
            removed.push(std::mem::take(&mut self.nodes[target].member));
            self.free.push(target);
            remaining -= 1;
        }
        removed
    }
}

impl Default for SkipList {
    fn default() -> Self {
        Self::new()
    }
}

/// Forward iterator over (member, score) pairs.
pub struct Iter<'a> {
    list: &'a SkipList,
    cur: Option<usize>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = (&'a Bytes, f64);

    fn next(&mut self) -> Option<Self::Item> {
        let idx = self.cur?;
        let node = &self.list.nodes[idx];
        self.cur = node.links[0].forward;
        Some((&node.member, node.score))
    }
}
