//! Keyspace commands: key management, expiry, SELECT, SORT.

use std::collections::VecDeque;

use bytes::Bytes;
use cinder_core::object::Value;
use cinder_core::sort::{self, SortOptions};
use cinder_core::{time, GlobPattern};
use cinder_protocol::Reply;

use super::{parse_int, upper, wrong_type_reply};
use crate::engine::{ClientState, Engine, HandlerResult};

fn reply(r: Reply) -> HandlerResult {
    HandlerResult::Reply(r)
}

pub(crate) fn keys(engine: &mut Engine, client: &mut ClientState, argv: &[Bytes]) -> HandlerResult {
    let pattern = GlobPattern::new(&argv[1]);
    let db = engine.keyspace.db_mut(client.db);
    let rows = db
        .entries
        .keys()
        .filter(|key| !db.expires.get(*key).is_some_and(|&at| time::is_expired(at)))
        .filter(|key| pattern.matches_all() || pattern.matches(key))
        .map(|key| Reply::Bulk(key.clone()))
        .collect();
    reply(Reply::MultiBulk(rows))
}

pub(crate) fn randomkey(engine: &mut Engine, client: &mut ClientState, _argv: &[Bytes]) -> HandlerResult {
    let db = engine.keyspace.db_mut(client.db);
    match db.random_key() {
        Some(key) => reply(Reply::Bulk(key)),
        None => reply(Reply::Nil),
    }
}

pub(crate) fn type_command(engine: &mut Engine, client: &mut ClientState, argv: &[Bytes]) -> HandlerResult {
    let db = engine.keyspace.db_mut(client.db);
    let name = match db.lookup_read(&argv[1]) {
        Some(value) => value.type_name(),
        None => "none",
    };
    reply(Reply::Status(name.into()))
}

pub(crate) fn rename(engine: &mut Engine, client: &mut ClientState, argv: &[Bytes]) -> HandlerResult {
    match rename_inner(engine, client, argv, false) {
        Ok(_) => reply(Reply::ok()),
        Err(r) => reply(r),
    }
}

pub(crate) fn renamenx(engine: &mut Engine, client: &mut ClientState, argv: &[Bytes]) -> HandlerResult {
    match rename_inner(engine, client, argv, true) {
        Ok(done) => reply(Reply::from_bool(done)),
        Err(r) => reply(r),
    }
}

fn rename_inner(
    engine: &mut Engine,
    client: &mut ClientState,
    argv: &[Bytes],
    nx: bool,
) -> Result<bool, Reply> {
    let (src, dst) = (&argv[1], &argv[2]);
    if src == dst {
        return Err(Reply::error("source and destination objects are the same"));
    }
    let db = engine.keyspace.db_mut(client.db);
    if db.expire_if_needed(src) || !db.entries.contains_key(src) {
        return Err(Reply::error("no such key"));
    }
    if nx && db.contains(dst) {
        return Ok(false);
    }

    let expire = db.expire_at(src);
    let mut entry = db.remove(src).expect("source existence just checked");
    entry.cached_size = 0; // re-measured under the new name
    db.remove(dst);
    db.entries.insert(dst.clone(), entry);
    if let Some(at) = expire {
        db.set_expire(dst, at);
    }
    db.refresh_size(dst);
    engine.add_dirty(1);
    Ok(true)
}

pub(crate) fn move_command(engine: &mut Engine, client: &mut ClientState, argv: &[Bytes]) -> HandlerResult {
    let target = match parse_int(&argv[2]) {
        Ok(n) => n,
        Err(e) => return reply(e),
    };
    if target < 0 || target as usize >= engine.keyspace.db_count() {
        return reply(Reply::error("index out of range"));
    }
    let target = target as usize;
    if target == client.db {
        return reply(Reply::error("source and destination objects are the same"));
    }

    let key = &argv[1];
    let src = engine.keyspace.db_mut(client.db);
    if !src.contains(key) {
        return reply(Reply::Integer(0));
    }
    if engine.keyspace.db_mut(target).contains(key) {
        return reply(Reply::Integer(0));
    }

    let src = engine.keyspace.db_mut(client.db);
    let expire = src.expire_at(key);
    let mut entry = src.remove(key).expect("source existence just checked");
    entry.cached_size = 0; // accounted in the target db instead

    let dst = engine.keyspace.db_mut(target);
    dst.entries.insert(key.clone(), entry);
    if let Some(at) = expire {
        dst.set_expire(key, at);
    }
    dst.refresh_size(key);
    engine.add_dirty(1);
    reply(Reply::Integer(1))
}

pub(crate) fn select(engine: &mut Engine, client: &mut ClientState, argv: &[Bytes]) -> HandlerResult {
    match parse_int(&argv[1]) {
        Ok(n) if n >= 0 && (n as usize) < engine.keyspace.db_count() => {
            client.db = n as usize;
            reply(Reply::ok())
        }
        _ => reply(Reply::error("invalid DB index")),
    }
}

pub(crate) fn flushdb(engine: &mut Engine, client: &mut ClientState, _argv: &[Bytes]) -> HandlerResult {
    engine.release_swapped_pages(client.db);
    let removed = engine.keyspace.db_mut(client.db).clear();
    engine.add_dirty(removed as u64);
    reply(Reply::ok())
}

pub(crate) fn flushall(engine: &mut Engine, _client: &mut ClientState, _argv: &[Bytes]) -> HandlerResult {
    for db_idx in 0..engine.keyspace.db_count() {
        engine.release_swapped_pages(db_idx);
    }
    let removed = engine.keyspace.clear_all();
    engine.add_dirty(removed as u64);
    reply(Reply::ok())
}

pub(crate) fn dbsize(engine: &mut Engine, client: &mut ClientState, _argv: &[Bytes]) -> HandlerResult {
    reply(Reply::Integer(engine.keyspace.db(client.db).len() as i64))
}

pub(crate) fn expire(engine: &mut Engine, client: &mut ClientState, argv: &[Bytes]) -> HandlerResult {
    match parse_int(&argv[2]) {
        Ok(seconds) => expire_at(engine, client, argv, time::now_secs() as i64 + seconds),
        Err(e) => reply(e),
    }
}

pub(crate) fn expireat(engine: &mut Engine, client: &mut ClientState, argv: &[Bytes]) -> HandlerResult {
    match parse_int(&argv[2]) {
        Ok(when) => expire_at(engine, client, argv, when),
        Err(e) => reply(e),
    }
}

/// Shared EXPIRE/EXPIREAT tail, working on an absolute unix-seconds
/// deadline. An existing expiry cannot be overwritten; a deadline in
/// the past deletes the key outright (journaled as a DEL).
fn expire_at(
    engine: &mut Engine,
    client: &mut ClientState,
    argv: &[Bytes],
    when_secs: i64,
) -> HandlerResult {
    let key = &argv[1];
    let db = engine.keyspace.db_mut(client.db);
    if !db.contains(key) {
        return reply(Reply::Integer(0));
    }
    if db.expire_at(key).is_some() {
        return reply(Reply::Integer(0));
    }

    if when_secs <= time::now_secs() as i64 {
        db.remove(key);
        engine.add_dirty(1);
        engine.propagate_override =
            Some(vec![vec![Bytes::from_static(b"DEL"), key.clone()]]);
        return reply(Reply::Integer(1));
    }

    db.set_expire(key, when_secs as u64 * 1000);
    engine.add_dirty(1);
    // journal and replicas get the absolute form, so replay at any
    // later time lands on the same deadline
    engine.propagate_override = Some(vec![vec![
        Bytes::from_static(b"EXPIREAT"),
        key.clone(),
        Bytes::from(when_secs.to_string()),
    ]]);
    reply(Reply::Integer(1))
}

pub(crate) fn ttl(engine: &mut Engine, client: &mut ClientState, argv: &[Bytes]) -> HandlerResult {
    let db = engine.keyspace.db_mut(client.db);
    if db.expire_if_needed(&argv[1]) {
        return reply(Reply::Integer(-1));
    }
    match db.ttl_secs(&argv[1]) {
        Some(secs) => reply(Reply::Integer(secs as i64)),
        None => reply(Reply::Integer(-1)),
    }
}

/// `SORT key [BY pat] [LIMIT off cnt] [GET pat ...] [ASC|DESC]
/// [ALPHA] [STORE dst]`.
pub(crate) fn sort_command(engine: &mut Engine, client: &mut ClientState, argv: &[Bytes]) -> HandlerResult {
    let mut opts = SortOptions::default();
    let mut store: Option<Bytes> = None;

    let mut rest = &argv[2..];
    while let Some(arg) = rest.first() {
        match upper(arg).as_slice() {
            b"ASC" => rest = &rest[1..],
            b"DESC" => {
                opts.desc = true;
                rest = &rest[1..];
            }
            b"ALPHA" => {
                opts.alpha = true;
                rest = &rest[1..];
            }
            b"LIMIT" if rest.len() >= 3 => {
                let (offset, count) = match (parse_int(&rest[1]), parse_int(&rest[2])) {
                    (Ok(o), Ok(c)) => (o, c),
                    _ => return reply(Reply::error("value is not an integer or out of range")),
                };
                let offset = offset.max(0) as usize;
                let count = if count < 0 { usize::MAX } else { count as usize };
                opts.limit = Some((offset, count));
                rest = &rest[3..];
            }
            b"BY" if rest.len() >= 2 => {
                opts.by = Some(rest[1].clone());
                rest = &rest[2..];
            }
            b"GET" if rest.len() >= 2 => {
                opts.gets.push(rest[1].clone());
                rest = &rest[2..];
            }
            b"STORE" if rest.len() >= 2 => {
                store = Some(rest[1].clone());
                rest = &rest[2..];
            }
            _ => return reply(Reply::error("syntax error")),
        }
    }

    let db_idx = client.db;
    let elements: Vec<Bytes> = match engine.keyspace.db_mut(db_idx).lookup_read(&argv[1]) {
        None => Vec::new(),
        Some(Value::List(list)) => list.iter().cloned().collect(),
        Some(Value::Set(members)) => members.iter().cloned().collect(),
        Some(Value::Zset(zset)) => zset.iter().map(|(m, _)| m.clone()).collect(),
        Some(_) => return reply(wrong_type_reply()),
    };

    // BY/GET references may point at paged-out keys; resolve through
    // the blocking load path
    let mut lookup = |key: &[u8]| -> Option<Bytes> {
        engine.load_key_now(db_idx, key);
        match engine.keyspace.db_mut(db_idx).lookup_read(key) {
            Some(Value::Str(s)) => Some(s.as_bytes()),
            _ => None,
        }
    };

    let sorted = match sort::sort_elements(elements, &opts, &mut lookup) {
        Ok(sorted) => sorted,
        Err(e) => return reply(Reply::error(e.to_string())),
    };
    let rows = sort::apply_gets(&sorted, &opts.gets, &mut lookup);

    match store {
        Some(dst) => {
            let count = rows.len();
            let db = engine.keyspace.db_mut(db_idx);
            if rows.is_empty() {
                db.remove(&dst);
            } else {
                let list: VecDeque<Bytes> = rows
                    .into_iter()
                    .map(|row| row.unwrap_or_else(Bytes::new))
                    .collect();
                db.set_value(dst, Value::List(list));
            }
            engine.add_dirty(1);
            reply(Reply::Integer(count as i64))
        }
        None => {
            let rows = rows
                .into_iter()
                .map(|row| match row {
                    Some(data) => Reply::Bulk(data),
                    None => Reply::Nil,
                })
                .collect();
            reply(Reply::MultiBulk(rows))
        }
    }
}
