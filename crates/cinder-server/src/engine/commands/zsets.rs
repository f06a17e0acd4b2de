//! Sorted-set commands.

use ahash::AHashMap;
use bytes::Bytes;
use cinder_core::object::Value;
use cinder_core::{ScoreBound, SortedSet};
use cinder_protocol::Reply;

use super::{format_score, parse_float, parse_int, upper, wrong_type_reply};
use crate::engine::{ClientState, Engine, HandlerResult};

fn reply(r: Reply) -> HandlerResult {
    HandlerResult::Reply(r)
}

fn is_zset(value: &Value) -> bool {
    matches!(value, Value::Zset(_))
}

/// ZADD and ZINCRBY share this: the one difference is whether the
/// given score replaces or increments.
fn upsert(
    engine: &mut Engine,
    client: &mut ClientState,
    argv: &[Bytes],
    incr: bool,
) -> HandlerResult {
    let score = match parse_float(&argv[2]) {
        Ok(score) => score,
        Err(e) => return reply(e),
    };
    let member = argv[3].clone();

    let db = engine.keyspace.db_mut(client.db);
    match db.classify(&argv[1], is_zset) {
        Err(()) => return reply(wrong_type_reply()),
        Ok(true) => db.insert_new(argv[1].clone(), Value::Zset(SortedSet::new())),
        Ok(false) => {}
    }
    let Some(Value::Zset(zset)) = db.lookup_write(&argv[1]) else {
        unreachable!("key was just classified or created as a zset");
    };

    let before = zset.score(&member);
    match zset.upsert(member, score, incr) {
        Err(_) => reply(Reply::error("resulting score is not a number (NaN)")),
        Ok((new_score, added)) => {
            if added || before != Some(new_score) {
                engine.add_dirty(1);
            }
            if incr {
                reply(Reply::Bulk(format_score(new_score)))
            } else {
                reply(Reply::from_bool(added))
            }
        }
    }
}

pub(crate) fn zadd(engine: &mut Engine, client: &mut ClientState, argv: &[Bytes]) -> HandlerResult {
    upsert(engine, client, argv, false)
}

pub(crate) fn zincrby(engine: &mut Engine, client: &mut ClientState, argv: &[Bytes]) -> HandlerResult {
    upsert(engine, client, argv, true)
}

pub(crate) fn zrem(engine: &mut Engine, client: &mut ClientState, argv: &[Bytes]) -> HandlerResult {
    let db = engine.keyspace.db_mut(client.db);
    match db.lookup_write(&argv[1]) {
        None => reply(Reply::Integer(0)),
        Some(Value::Zset(zset)) => {
            if zset.remove(&argv[2]) {
                if zset.is_empty() {
                    db.remove(&argv[1]);
                }
                engine.add_dirty(1);
                reply(Reply::Integer(1))
            } else {
                reply(Reply::Integer(0))
            }
        }
        Some(_) => reply(wrong_type_reply()),
    }
}

pub(crate) fn zcard(engine: &mut Engine, client: &mut ClientState, argv: &[Bytes]) -> HandlerResult {
    let db = engine.keyspace.db_mut(client.db);
    match db.lookup_read(&argv[1]) {
        None => reply(Reply::Integer(0)),
        Some(Value::Zset(zset)) => reply(Reply::Integer(zset.len() as i64)),
        Some(_) => reply(wrong_type_reply()),
    }
}

pub(crate) fn zscore(engine: &mut Engine, client: &mut ClientState, argv: &[Bytes]) -> HandlerResult {
    let db = engine.keyspace.db_mut(client.db);
    match db.lookup_read(&argv[1]) {
        None => reply(Reply::Nil),
        Some(Value::Zset(zset)) => match zset.score(&argv[2]) {
            Some(score) => reply(Reply::Bulk(format_score(score))),
            None => reply(Reply::Nil),
        },
        Some(_) => reply(wrong_type_reply()),
    }
}

pub(crate) fn zrank(engine: &mut Engine, client: &mut ClientState, argv: &[Bytes]) -> HandlerResult {
    rank(engine, client, argv, false)
}

pub(crate) fn zrevrank(engine: &mut Engine, client: &mut ClientState, argv: &[Bytes]) -> HandlerResult {
    rank(engine, client, argv, true)
}

fn rank(engine: &mut Engine, client: &mut ClientState, argv: &[Bytes], rev: bool) -> HandlerResult {
    let db = engine.keyspace.db_mut(client.db);
    match db.lookup_read(&argv[1]) {
        None => reply(Reply::Nil),
        Some(Value::Zset(zset)) => match zset.rank(&argv[2], rev) {
            Some(rank) => reply(Reply::Integer(rank as i64)),
            None => reply(Reply::Nil),
        },
        Some(_) => reply(wrong_type_reply()),
    }
}

pub(crate) fn zrange(engine: &mut Engine, client: &mut ClientState, argv: &[Bytes]) -> HandlerResult {
    range(engine, client, argv, false)
}

pub(crate) fn zrevrange(engine: &mut Engine, client: &mut ClientState, argv: &[Bytes]) -> HandlerResult {
    range(engine, client, argv, true)
}

fn range(engine: &mut Engine, client: &mut ClientState, argv: &[Bytes], rev: bool) -> HandlerResult {
    let (start, stop) = match (parse_int(&argv[2]), parse_int(&argv[3])) {
        (Ok(s), Ok(e)) => (s, e),
        _ => return reply(Reply::error("value is not an integer or out of range")),
    };
    let with_scores = match argv.get(4) {
        None => false,
        Some(arg) if upper(arg) == b"WITHSCORES" => true,
        Some(_) => return reply(Reply::error("syntax error")),
    };

    let db = engine.keyspace.db_mut(client.db);
    match db.lookup_read(&argv[1]) {
        None => reply(Reply::MultiBulk(Vec::new())),
        Some(Value::Zset(zset)) => {
            let members = zset.range_by_rank(start, stop, rev);
            reply(scored_rows(members, with_scores))
        }
        Some(_) => reply(wrong_type_reply()),
    }
}

pub(crate) fn zrangebyscore(
    engine: &mut Engine,
    client: &mut ClientState,
    argv: &[Bytes],
) -> HandlerResult {
    let (min, max) = match (ScoreBound::parse(&argv[2]), ScoreBound::parse(&argv[3])) {
        (Some(min), Some(max)) => (min, max),
        _ => return reply(Reply::error("min or max is not a double")),
    };

    // optional clauses: [LIMIT offset count] [WITHSCORES]
    let mut window = None;
    let mut with_scores = false;
    let mut rest = &argv[4..];
    while let Some(arg) = rest.first() {
        match upper(arg).as_slice() {
            b"LIMIT" if rest.len() >= 3 => {
                let (offset, count) = match (parse_int(&rest[1]), parse_int(&rest[2])) {
                    (Ok(o), Ok(c)) => (o, c),
                    _ => return reply(Reply::error("value is not an integer or out of range")),
                };
                let offset = offset.max(0) as usize;
                let count = if count < 0 { usize::MAX } else { count as usize };
                window = Some((offset, count));
                rest = &rest[3..];
            }
            b"WITHSCORES" => {
                with_scores = true;
                rest = &rest[1..];
            }
            _ => return reply(Reply::error("syntax error")),
        }
    }

    let db = engine.keyspace.db_mut(client.db);
    match db.lookup_read(&argv[1]) {
        None => reply(Reply::MultiBulk(Vec::new())),
        Some(Value::Zset(zset)) => {
            let members = zset.range_by_score(&min, &max, window);
            reply(scored_rows(members, with_scores))
        }
        Some(_) => reply(wrong_type_reply()),
    }
}

pub(crate) fn zcount(engine: &mut Engine, client: &mut ClientState, argv: &[Bytes]) -> HandlerResult {
    let (min, max) = match (ScoreBound::parse(&argv[2]), ScoreBound::parse(&argv[3])) {
        (Some(min), Some(max)) => (min, max),
        _ => return reply(Reply::error("min or max is not a double")),
    };
    let db = engine.keyspace.db_mut(client.db);
    match db.lookup_read(&argv[1]) {
        None => reply(Reply::Integer(0)),
        Some(Value::Zset(zset)) => reply(Reply::Integer(zset.count_in_range(&min, &max) as i64)),
        Some(_) => reply(wrong_type_reply()),
    }
}

pub(crate) fn zremrangebyscore(
    engine: &mut Engine,
    client: &mut ClientState,
    argv: &[Bytes],
) -> HandlerResult {
    let (min, max) = match (ScoreBound::parse(&argv[2]), ScoreBound::parse(&argv[3])) {
        (Some(min), Some(max)) => (min, max),
        _ => return reply(Reply::error("min or max is not a double")),
    };
    let db = engine.keyspace.db_mut(client.db);
    match db.lookup_write(&argv[1]) {
        None => reply(Reply::Integer(0)),
        Some(Value::Zset(zset)) => {
            let removed = zset.remove_range_by_score(&min, &max);
            if zset.is_empty() {
                db.remove(&argv[1]);
            }
            if removed > 0 {
                engine.add_dirty(1);
            }
            reply(Reply::Integer(removed as i64))
        }
        Some(_) => reply(wrong_type_reply()),
    }
}

pub(crate) fn zremrangebyrank(
    engine: &mut Engine,
    client: &mut ClientState,
    argv: &[Bytes],
) -> HandlerResult {
    let (start, stop) = match (parse_int(&argv[2]), parse_int(&argv[3])) {
        (Ok(s), Ok(e)) => (s, e),
        _ => return reply(Reply::error("value is not an integer or out of range")),
    };
    let db = engine.keyspace.db_mut(client.db);
    match db.lookup_write(&argv[1]) {
        None => reply(Reply::Integer(0)),
        Some(Value::Zset(zset)) => {
            let removed = zset.remove_range_by_rank(start, stop);
            if zset.is_empty() {
                db.remove(&argv[1]);
            }
            if removed > 0 {
                engine.add_dirty(1);
            }
            reply(Reply::Integer(removed as i64))
        }
        Some(_) => reply(wrong_type_reply()),
    }
}

pub(crate) fn zunion(engine: &mut Engine, client: &mut ClientState, argv: &[Bytes]) -> HandlerResult {
    union_inter(engine, client, argv, false)
}

pub(crate) fn zinter(engine: &mut Engine, client: &mut ClientState, argv: &[Bytes]) -> HandlerResult {
    union_inter(engine, client, argv, true)
}

#[derive(Clone, Copy)]
enum Aggregate {
    Sum,
    Min,
    Max,
}

impl Aggregate {
    fn apply(self, a: f64, b: f64) -> f64 {
        let v = match self {
            Aggregate::Sum => a + b,
            Aggregate::Min => a.min(b),
            Aggregate::Max => a.max(b),
        };
        // +inf plus -inf has no meaningful sum; pin it to zero
        if v.is_nan() {
            0.0
        } else {
            v
        }
    }
}

/// `ZUNION|ZINTER dst numkeys key [key ...] [WEIGHTS w ...]
/// [AGGREGATE SUM|MIN|MAX]`, storing the result at dst.
fn union_inter(
    engine: &mut Engine,
    client: &mut ClientState,
    argv: &[Bytes],
    inter: bool,
) -> HandlerResult {
    let numkeys = match parse_int(&argv[2]) {
        Ok(n) if n > 0 => n as usize,
        _ => {
            return reply(Reply::error(
                "at least 1 input key is needed for ZUNION/ZINTER",
            ))
        }
    };
    if argv.len() < 3 + numkeys {
        return reply(Reply::error("syntax error"));
    }
    let source_keys = &argv[3..3 + numkeys];

    let mut weights = vec![1.0f64; numkeys];
    let mut aggregate = Aggregate::Sum;
    let mut rest = &argv[3 + numkeys..];
    while let Some(arg) = rest.first() {
        match upper(arg).as_slice() {
            b"WEIGHTS" if rest.len() > numkeys => {
                for (slot, raw) in weights.iter_mut().zip(&rest[1..1 + numkeys]) {
                    *slot = match parse_float(raw) {
                        Ok(w) => w,
                        Err(e) => return reply(e),
                    };
                }
                rest = &rest[1 + numkeys..];
            }
            b"AGGREGATE" if rest.len() >= 2 => {
                aggregate = match upper(&rest[1]).as_slice() {
                    b"SUM" => Aggregate::Sum,
                    b"MIN" => Aggregate::Min,
                    b"MAX" => Aggregate::Max,
                    _ => return reply(Reply::error("syntax error")),
                };
                rest = &rest[2..];
            }
            _ => return reply(Reply::error("syntax error")),
        }
    }

    let db = engine.keyspace.db_mut(client.db);
    for key in source_keys {
        db.expire_if_needed(key);
    }

    // weight-scaled member → score accumulation
    let mut acc: AHashMap<Bytes, (f64, usize)> = AHashMap::new();
    for (key, &weight) in source_keys.iter().zip(&weights) {
        let zset = match db.entries.get(key).and_then(|e| e.value()) {
            None => continue,
            Some(Value::Zset(zset)) => zset,
            Some(_) => return reply(wrong_type_reply()),
        };
        for (member, score) in zset.iter() {
            let scaled = score * weight;
            match acc.get_mut(&member[..]) {
                Some((total, seen)) => {
                    *total = aggregate.apply(*total, scaled);
                    *seen += 1;
                }
                None => {
                    acc.insert(member.clone(), (scaled, 1));
                }
            }
        }
    }

    let mut result = SortedSet::new();
    for (member, (score, seen)) in acc {
        if inter && seen != numkeys {
            continue;
        }
        let score = if score.is_nan() { 0.0 } else { score };
        let _ = result.upsert(member, score, false);
    }

    let card = result.len();
    let dst = argv[1].clone();
    let db = engine.keyspace.db_mut(client.db);
    if result.is_empty() {
        db.remove(&dst);
    } else {
        db.set_value(dst, Value::Zset(result));
    }
    engine.add_dirty(1);
    reply(Reply::Integer(card as i64))
}

/// Renders (member, score) rows, interleaving scores when asked.
fn scored_rows(members: Vec<(Bytes, f64)>, with_scores: bool) -> Reply {
    let mut rows = Vec::with_capacity(members.len() * if with_scores { 2 } else { 1 });
    for (member, score) in members {
        rows.push(Reply::Bulk(member));
        if with_scores {
            rows.push(Reply::Bulk(format_score(score)));
        }
    }
    Reply::MultiBulk(rows)
}
