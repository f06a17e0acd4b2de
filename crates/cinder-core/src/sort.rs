//! The SORT engine.
//!
//! Sorts the elements of a list, set or sorted set — numerically by
//! default, lexicographically with ALPHA — optionally keyed through a
//! BY pattern, windowed with LIMIT, and projected through GET
//! patterns. The caller supplies element iteration and key lookup;
//! this module is pure ordering logic.

use std::cmp::Ordering;

use bytes::Bytes;
use thiserror::Error;

/// Parsed SORT clauses (STORE is handled by the caller).
#[derive(Debug, Default, Clone)]
pub struct SortOptions {
    /// BY pattern; `*` is replaced with the element. A pattern
    /// without `*` disables sorting entirely.
    pub by: Option<Bytes>,
    /// LIMIT (offset, count), already clamped non-negative.
    pub limit: Option<(usize, usize)>,
    /// GET patterns; `#` projects the element itself.
    pub gets: Vec<Bytes>,
    pub desc: bool,
    pub alpha: bool,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SortError {
    /// A numeric sort met an element (or BY value) that is not a number.
    #[error("One or more scores can't be converted into double")]
    NotANumber,
}

/// Weight attached to an element for ordering.
#[derive(Debug)]
enum SortKey {
    Number(f64),
    /// ALPHA key; `None` (missing BY lookup) sorts before present.
    Alpha(Option<Bytes>),
}

/// Substitutes the first `*` of `pattern` with `element`. Returns
/// `None` when the pattern has no `*` (nothing to substitute).
pub fn substitute_pattern(pattern: &[u8], element: &[u8]) -> Option<Vec<u8>> {
    let star = pattern.iter().position(|&b| b == b'*')?;
    let mut out = Vec::with_capacity(pattern.len() - 1 + element.len());
    out.extend_from_slice(&pattern[..star]);
    out.extend_from_slice(element);
    out.extend_from_slice(&pattern[star + 1..]);
    Some(out)
}

/// Sorts and windows `elements` per `opts`. `lookup` resolves BY keys
/// to their string values (`None` for missing or non-string).
pub fn sort_elements(
    mut elements: Vec<Bytes>,
    opts: &SortOptions,
    lookup: &mut dyn FnMut(&[u8]) -> Option<Bytes>,
) -> Result<Vec<Bytes>, SortError> {
    // a BY pattern with no `*` cannot vary per element: skip sorting
    let dontsort = opts
        .by
        .as_ref()
        .is_some_and(|p| !p.contains(&b'*'));

    if !dontsort {
        let mut keyed: Vec<(SortKey, Bytes)> = Vec::with_capacity(elements.len());
        for element in elements {
            let weight_src = match &opts.by {
                Some(pattern) => {
                    let by_key = substitute_pattern(pattern, &element)
                        .expect("dontsort filtered patterns without '*'");
                    lookup(&by_key)
                }
                None => Some(element.clone()),
            };
            let key = if opts.alpha {
                SortKey::Alpha(weight_src)
            } else {
                match weight_src {
                    None => SortKey::Number(0.0),
                    Some(raw) => SortKey::Number(parse_score(&raw)?),
                }
            };
            keyed.push((key, element));
        }

        let cmp = |a: &(SortKey, Bytes), b: &(SortKey, Bytes)| {
            let ord = compare_keys(&a.0, &b.0, &a.1, &b.1);
            if opts.desc {
                ord.reverse()
            } else {
                ord
            }
        };

        // LIMIT covering a strict prefix: partition first, then only
        // sort the prefix that will actually be returned
        match prefix_len(opts.limit, keyed.len()) {
            Some(end) if end > 0 => {
                keyed.select_nth_unstable_by(end - 1, cmp);
                keyed[..end].sort_by(cmp);
            }
            _ => keyed.sort_by(cmp),
        }

        elements = keyed.into_iter().map(|(_, e)| e).collect();
    }

    if let Some((offset, count)) = opts.limit {
        elements = elements
            .into_iter()
            .skip(offset)
            .take(count)
            .collect();
    }
    Ok(elements)
}

/// Projects sorted elements through the GET patterns. With no GET
/// patterns the elements themselves are the rows. Missing lookups
/// (and patterns without `*`) yield `None` (a nil row).
pub fn apply_gets(
    elements: &[Bytes],
    gets: &[Bytes],
    lookup: &mut dyn FnMut(&[u8]) -> Option<Bytes>,
) -> Vec<Option<Bytes>> {
    if gets.is_empty() {
        return elements.iter().map(|e| Some(e.clone())).collect();
    }
    let mut rows = Vec::with_capacity(elements.len() * gets.len());
    for element in elements {
        for pattern in gets {
            if &pattern[..] == b"#" {
                rows.push(Some(element.clone()));
            } else {
                let row = substitute_pattern(pattern, element)
                    .and_then(|key| lookup(&key));
                rows.push(row);
            }
        }
    }
    rows
}

/// The prefix worth sorting when LIMIT covers a strict prefix.
fn prefix_len(limit: Option<(usize, usize)>, len: usize) -> Option<usize> {
    let (offset, count) = limit?;
    let end = offset.checked_add(count)?;
    if end < len {
        Some(end)
    } else {
        None
    }
}

fn compare_keys(a: &SortKey, b: &SortKey, elem_a: &Bytes, elem_b: &Bytes) -> Ordering {
    let ord = match (a, b) {
        (SortKey::Number(x), SortKey::Number(y)) => {
            x.partial_cmp(y).unwrap_or(Ordering::Equal)
        }
        (SortKey::Alpha(x), SortKey::Alpha(y)) => match (x, y) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(x), Some(y)) => x.cmp(y),
        },
        // keys are homogeneous per invocation
        _ => Ordering::Equal,
    };
    ord.then_with(|| elem_a.cmp(elem_b))
}

fn parse_score(raw: &[u8]) -> Result<f64, SortError> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.trim().parse::<f64>().ok())
        .filter(|v| !v.is_nan())
        .ok_or(SortError::NotANumber)
}
