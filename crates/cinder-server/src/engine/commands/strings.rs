//! String commands.

use bytes::Bytes;
use cinder_core::object::{StrValue, Value};
use cinder_protocol::Reply;

use super::{parse_int, wrong_type_reply};
use crate::engine::{ClientState, Engine, HandlerResult};

fn reply(r: Reply) -> HandlerResult {
    HandlerResult::Reply(r)
}

pub(crate) fn get(engine: &mut Engine, client: &mut ClientState, argv: &[Bytes]) -> HandlerResult {
    let db = engine.keyspace.db_mut(client.db);
    match db.lookup_read(&argv[1]) {
        Some(Value::Str(s)) => reply(Reply::Bulk(s.as_bytes())),
        Some(_) => reply(wrong_type_reply()),
        None => reply(Reply::Nil),
    }
}

pub(crate) fn set(engine: &mut Engine, client: &mut ClientState, argv: &[Bytes]) -> HandlerResult {
    let db = engine.keyspace.db_mut(client.db);
    db.set_value(argv[1].clone(), Value::str(argv[2].clone()));
    engine.add_dirty(1);
    reply(Reply::ok())
}

pub(crate) fn setnx(engine: &mut Engine, client: &mut ClientState, argv: &[Bytes]) -> HandlerResult {
    let db = engine.keyspace.db_mut(client.db);
    if db.contains(&argv[1]) {
        return reply(Reply::Integer(0));
    }
    db.set_value(argv[1].clone(), Value::str(argv[2].clone()));
    engine.add_dirty(1);
    reply(Reply::Integer(1))
}

pub(crate) fn getset(engine: &mut Engine, client: &mut ClientState, argv: &[Bytes]) -> HandlerResult {
    let db = engine.keyspace.db_mut(client.db);
    let old = match db.lookup_read(&argv[1]) {
        Some(Value::Str(s)) => Reply::Bulk(s.as_bytes()),
        Some(_) => return reply(wrong_type_reply()),
        None => Reply::Nil,
    };
    db.set_value(argv[1].clone(), Value::str(argv[2].clone()));
    engine.add_dirty(1);
    reply(old)
}

pub(crate) fn append(engine: &mut Engine, client: &mut ClientState, argv: &[Bytes]) -> HandlerResult {
    let db = engine.keyspace.db_mut(client.db);
    let existing = match db.lookup_write(&argv[1]) {
        None => None,
        Some(Value::Str(s)) => Some(s.as_bytes()),
        Some(_) => return reply(wrong_type_reply()),
    };
    let joined = match existing {
        None => argv[2].clone(),
        Some(old) => {
            let mut joined = Vec::with_capacity(old.len() + argv[2].len());
            joined.extend_from_slice(&old);
            joined.extend_from_slice(&argv[2]);
            Bytes::from(joined)
        }
    };
    let new_len = joined.len();
    db.upsert_keep_ttl(argv[1].clone(), Value::Str(StrValue::raw(joined)));
    engine.add_dirty(1);
    reply(Reply::Integer(new_len as i64))
}

pub(crate) fn substr(engine: &mut Engine, client: &mut ClientState, argv: &[Bytes]) -> HandlerResult {
    let (start, end) = match (parse_int(&argv[2]), parse_int(&argv[3])) {
        (Ok(s), Ok(e)) => (s, e),
        _ => return reply(Reply::error("value is not an integer or out of range")),
    };
    let db = engine.keyspace.db_mut(client.db);
    match db.lookup_read(&argv[1]) {
        Some(Value::Str(s)) => {
            let data = s.as_bytes();
            let (start, end) = cinder_core::object::normalize_range(start, end, data.len() as i64);
            if start > end {
                return reply(Reply::bulk(""));
            }
            reply(Reply::Bulk(data.slice(start as usize..=end as usize)))
        }
        Some(_) => reply(wrong_type_reply()),
        None => reply(Reply::Nil),
    }
}

pub(crate) fn mget(engine: &mut Engine, client: &mut ClientState, argv: &[Bytes]) -> HandlerResult {
    let db = engine.keyspace.db_mut(client.db);
    let rows = argv[1..]
        .iter()
        .map(|key| match db.lookup_read(key) {
            Some(Value::Str(s)) => Reply::Bulk(s.as_bytes()),
            _ => Reply::Nil,
        })
        .collect();
    reply(Reply::MultiBulk(rows))
}

pub(crate) fn mset(engine: &mut Engine, client: &mut ClientState, argv: &[Bytes]) -> HandlerResult {
    if (argv.len() - 1) % 2 != 0 {
        return reply(Reply::error("wrong number of arguments for MSET"));
    }
    let db = engine.keyspace.db_mut(client.db);
    for pair in argv[1..].chunks_exact(2) {
        db.set_value(pair[0].clone(), Value::str(pair[1].clone()));
    }
    engine.add_dirty((argv.len() as u64 - 1) / 2);
    reply(Reply::ok())
}

pub(crate) fn msetnx(engine: &mut Engine, client: &mut ClientState, argv: &[Bytes]) -> HandlerResult {
    if (argv.len() - 1) % 2 != 0 {
        return reply(Reply::error("wrong number of arguments for MSETNX"));
    }
    let db = engine.keyspace.db_mut(client.db);
    if argv[1..].chunks_exact(2).any(|pair| db.contains(&pair[0])) {
        return reply(Reply::Integer(0));
    }
    for pair in argv[1..].chunks_exact(2) {
        db.set_value(pair[0].clone(), Value::str(pair[1].clone()));
    }
    engine.add_dirty((argv.len() as u64 - 1) / 2);
    reply(Reply::Integer(1))
}

pub(crate) fn incr(engine: &mut Engine, client: &mut ClientState, argv: &[Bytes]) -> HandlerResult {
    incr_decr(engine, client, argv, 1)
}

pub(crate) fn decr(engine: &mut Engine, client: &mut ClientState, argv: &[Bytes]) -> HandlerResult {
    incr_decr(engine, client, argv, -1)
}

pub(crate) fn incrby(engine: &mut Engine, client: &mut ClientState, argv: &[Bytes]) -> HandlerResult {
    match parse_int(&argv[2]) {
        Ok(delta) => incr_decr(engine, client, argv, delta),
        Err(e) => reply(e),
    }
}

pub(crate) fn decrby(engine: &mut Engine, client: &mut ClientState, argv: &[Bytes]) -> HandlerResult {
    match parse_int(&argv[2]) {
        // i64::MIN has no negation; reject it instead of wrapping
        Ok(delta) => match delta.checked_neg() {
            Some(delta) => incr_decr(engine, client, argv, delta),
            None => reply(Reply::error("increment or decrement would overflow")),
        },
        Err(e) => reply(e),
    }
}

/// The shared INCR/DECR/INCRBY/DECRBY primitive. An absent key
/// counts from zero; the expiry (if any) is preserved.
fn incr_decr(
    engine: &mut Engine,
    client: &mut ClientState,
    argv: &[Bytes],
    delta: i64,
) -> HandlerResult {
    let db = engine.keyspace.db_mut(client.db);
    let current = match db.lookup_write(&argv[1]) {
        None => 0,
        Some(Value::Str(s)) => match s.to_i64() {
            Some(n) => n,
            None => return reply(Reply::error("value is not an integer or out of range")),
        },
        Some(_) => return reply(wrong_type_reply()),
    };
    let new = match current.checked_add(delta) {
        Some(n) => n,
        None => return reply(Reply::error("increment or decrement would overflow")),
    };
    db.upsert_keep_ttl(argv[1].clone(), Value::Str(StrValue::Int(new)));
    engine.add_dirty(1);
    reply(Reply::Integer(new))
}

pub(crate) fn exists(engine: &mut Engine, client: &mut ClientState, argv: &[Bytes]) -> HandlerResult {
    let db = engine.keyspace.db_mut(client.db);
    reply(Reply::from_bool(db.contains(&argv[1])))
}

pub(crate) fn del(engine: &mut Engine, client: &mut ClientState, argv: &[Bytes]) -> HandlerResult {
    let mut removed = 0;
    for key in &argv[1..] {
        let db = engine.keyspace.db_mut(client.db);
        if db.expire_if_needed(key) {
            continue;
        }
        if db.remove(key).is_some() {
            removed += 1;
        }
    }
    engine.add_dirty(removed);
    reply(Reply::Integer(removed as i64))
}
