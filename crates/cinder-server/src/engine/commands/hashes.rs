//! Hash commands.

use bytes::Bytes;
use cinder_core::object::Value;
use cinder_core::Hash;
use cinder_protocol::Reply;

use super::wrong_type_reply;
use crate::engine::{ClientState, Engine, HandlerResult};

fn reply(r: Reply) -> HandlerResult {
    HandlerResult::Reply(r)
}

fn is_hash(value: &Value) -> bool {
    matches!(value, Value::Hash(_))
}

pub(crate) fn hset(engine: &mut Engine, client: &mut ClientState, argv: &[Bytes]) -> HandlerResult {
    let max_entries = engine.config.hash_max_zipmap_entries;
    let max_value = engine.config.hash_max_zipmap_value;

    let db = engine.keyspace.db_mut(client.db);
    match db.classify(&argv[1], is_hash) {
        Err(()) => return reply(wrong_type_reply()),
        Ok(true) => db.insert_new(argv[1].clone(), Value::Hash(Hash::new())),
        Ok(false) => {}
    }
    let Some(Value::Hash(hash)) = db.lookup_write(&argv[1]) else {
        unreachable!("key was just classified or created as a hash");
    };
    let created = hash.set(argv[2].clone(), argv[3].clone(), max_entries, max_value);
    engine.add_dirty(1);
    reply(Reply::from_bool(created))
}

pub(crate) fn hget(engine: &mut Engine, client: &mut ClientState, argv: &[Bytes]) -> HandlerResult {
    let db = engine.keyspace.db_mut(client.db);
    match db.lookup_read(&argv[1]) {
        None => reply(Reply::Nil),
        Some(Value::Hash(hash)) => match hash.get(&argv[2]) {
            Some(value) => reply(Reply::Bulk(value)),
            None => reply(Reply::Nil),
        },
        Some(_) => reply(wrong_type_reply()),
    }
}

pub(crate) fn hdel(engine: &mut Engine, client: &mut ClientState, argv: &[Bytes]) -> HandlerResult {
    let db = engine.keyspace.db_mut(client.db);
    match db.lookup_write(&argv[1]) {
        None => reply(Reply::Integer(0)),
        Some(Value::Hash(hash)) => {
            if hash.remove(&argv[2]) {
                if hash.is_empty() {
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

pub(crate) fn hlen(engine: &mut Engine, client: &mut ClientState, argv: &[Bytes]) -> HandlerResult {
    let db = engine.keyspace.db_mut(client.db);
    match db.lookup_read(&argv[1]) {
        None => reply(Reply::Integer(0)),
        Some(Value::Hash(hash)) => reply(Reply::Integer(hash.len() as i64)),
        Some(_) => reply(wrong_type_reply()),
    }
}

pub(crate) fn hexists(engine: &mut Engine, client: &mut ClientState, argv: &[Bytes]) -> HandlerResult {
    let db = engine.keyspace.db_mut(client.db);
    match db.lookup_read(&argv[1]) {
        None => reply(Reply::Integer(0)),
        Some(Value::Hash(hash)) => reply(Reply::from_bool(hash.contains(&argv[2]))),
        Some(_) => reply(wrong_type_reply()),
    }
}

pub(crate) fn hkeys(engine: &mut Engine, client: &mut ClientState, argv: &[Bytes]) -> HandlerResult {
    project(engine, client, argv, |field, _| vec![field])
}

pub(crate) fn hvals(engine: &mut Engine, client: &mut ClientState, argv: &[Bytes]) -> HandlerResult {
    project(engine, client, argv, |_, value| vec![value])
}

pub(crate) fn hgetall(engine: &mut Engine, client: &mut ClientState, argv: &[Bytes]) -> HandlerResult {
    project(engine, client, argv, |field, value| vec![field, value])
}

fn project(
    engine: &mut Engine,
    client: &mut ClientState,
    argv: &[Bytes],
    pick: fn(Bytes, Bytes) -> Vec<Bytes>,
) -> HandlerResult {
    let db = engine.keyspace.db_mut(client.db);
    match db.lookup_read(&argv[1]) {
        None => reply(Reply::MultiBulk(Vec::new())),
        Some(Value::Hash(hash)) => {
            let rows = hash
                .iter()
                .flat_map(|(field, value)| pick(field, value))
                .map(Reply::Bulk)
                .collect();
            reply(Reply::MultiBulk(rows))
        }
        Some(_) => reply(wrong_type_reply()),
    }
}
