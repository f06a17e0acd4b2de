//! Set commands.

use ahash::AHashSet;
use bytes::Bytes;
use cinder_core::object::Value;
use cinder_protocol::Reply;
use rand::seq::IteratorRandom;

use super::wrong_type_reply;
use crate::engine::{ClientState, Engine, HandlerResult};

fn reply(r: Reply) -> HandlerResult {
    HandlerResult::Reply(r)
}

fn is_set(value: &Value) -> bool {
    matches!(value, Value::Set(_))
}

pub(crate) fn sadd(engine: &mut Engine, client: &mut ClientState, argv: &[Bytes]) -> HandlerResult {
    let db = engine.keyspace.db_mut(client.db);
    match db.classify(&argv[1], is_set) {
        Err(()) => return reply(wrong_type_reply()),
        Ok(true) => db.insert_new(argv[1].clone(), Value::Set(AHashSet::new())),
        Ok(false) => {}
    }
    let Some(Value::Set(members)) = db.lookup_write(&argv[1]) else {
        unreachable!("key was just classified or created as a set");
    };
    if members.insert(argv[2].clone()) {
        engine.add_dirty(1);
        reply(Reply::Integer(1))
    } else {
        reply(Reply::Integer(0))
    }
}

pub(crate) fn srem(engine: &mut Engine, client: &mut ClientState, argv: &[Bytes]) -> HandlerResult {
    let db = engine.keyspace.db_mut(client.db);
    match db.lookup_write(&argv[1]) {
        None => reply(Reply::Integer(0)),
        Some(Value::Set(members)) => {
            if members.remove(&argv[2]) {
                if members.is_empty() {
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

pub(crate) fn smove(engine: &mut Engine, client: &mut ClientState, argv: &[Bytes]) -> HandlerResult {
    let (src, dst, member) = (&argv[1], &argv[2], &argv[3]);
    let db = engine.keyspace.db_mut(client.db);

    if db.classify(dst, is_set).is_err() {
        return reply(wrong_type_reply());
    }

    let removed = match db.lookup_write(src) {
        None => return reply(Reply::Integer(0)),
        Some(Value::Set(members)) => {
            let removed = members.remove(member);
            if removed && members.is_empty() {
                db.remove(src);
            }
            removed
        }
        Some(_) => return reply(wrong_type_reply()),
    };
    if !removed {
        return reply(Reply::Integer(0));
    }

    if db.classify(dst, is_set) == Ok(true) {
        db.insert_new(dst.clone(), Value::Set(AHashSet::new()));
    }
    let Some(Value::Set(members)) = db.lookup_write(dst) else {
        unreachable!("destination was just classified or created as a set");
    };
    members.insert(member.clone());
    engine.add_dirty(1);
    reply(Reply::Integer(1))
}

pub(crate) fn sismember(engine: &mut Engine, client: &mut ClientState, argv: &[Bytes]) -> HandlerResult {
    let db = engine.keyspace.db_mut(client.db);
    match db.lookup_read(&argv[1]) {
        None => reply(Reply::Integer(0)),
        Some(Value::Set(members)) => reply(Reply::from_bool(members.contains(&argv[2]))),
        Some(_) => reply(wrong_type_reply()),
    }
}

pub(crate) fn scard(engine: &mut Engine, client: &mut ClientState, argv: &[Bytes]) -> HandlerResult {
    let db = engine.keyspace.db_mut(client.db);
    match db.lookup_read(&argv[1]) {
        None => reply(Reply::Integer(0)),
        Some(Value::Set(members)) => reply(Reply::Integer(members.len() as i64)),
        Some(_) => reply(wrong_type_reply()),
    }
}

pub(crate) fn spop(engine: &mut Engine, client: &mut ClientState, argv: &[Bytes]) -> HandlerResult {
    let db = engine.keyspace.db_mut(client.db);
    let member = match db.lookup_write(&argv[1]) {
        None => return reply(Reply::Nil),
        Some(Value::Set(members)) => {
            let victim = members
                .iter()
                .choose(&mut rand::rng())
                .expect("stored sets are never empty")
                .clone();
            members.remove(&victim);
            if members.is_empty() {
                db.remove(&argv[1]);
            }
            victim
        }
        Some(_) => return reply(wrong_type_reply()),
    };
    engine.add_dirty(1);
    // the random pick must replay deterministically
    engine.propagate_override = Some(vec![vec![
        Bytes::from_static(b"SREM"),
        argv[1].clone(),
        member.clone(),
    ]]);
    reply(Reply::Bulk(member))
}

pub(crate) fn srandmember(engine: &mut Engine, client: &mut ClientState, argv: &[Bytes]) -> HandlerResult {
    let db = engine.keyspace.db_mut(client.db);
    match db.lookup_read(&argv[1]) {
        None => reply(Reply::Nil),
        Some(Value::Set(members)) => {
            let member = members
                .iter()
                .choose(&mut rand::rng())
                .expect("stored sets are never empty");
            reply(Reply::Bulk(member.clone()))
        }
        Some(_) => reply(wrong_type_reply()),
    }
}

pub(crate) fn smembers(engine: &mut Engine, client: &mut ClientState, argv: &[Bytes]) -> HandlerResult {
    match combine(engine, client, &argv[1..], SetOp::Inter) {
        Ok(members) => reply(members_reply(members)),
        Err(r) => reply(r),
    }
}

pub(crate) fn sinter(engine: &mut Engine, client: &mut ClientState, argv: &[Bytes]) -> HandlerResult {
    match combine(engine, client, &argv[1..], SetOp::Inter) {
        Ok(members) => reply(members_reply(members)),
        Err(r) => reply(r),
    }
}

pub(crate) fn sunion(engine: &mut Engine, client: &mut ClientState, argv: &[Bytes]) -> HandlerResult {
    match combine(engine, client, &argv[1..], SetOp::Union) {
        Ok(members) => reply(members_reply(members)),
        Err(r) => reply(r),
    }
}

pub(crate) fn sdiff(engine: &mut Engine, client: &mut ClientState, argv: &[Bytes]) -> HandlerResult {
    match combine(engine, client, &argv[1..], SetOp::Diff) {
        Ok(members) => reply(members_reply(members)),
        Err(r) => reply(r),
    }
}

pub(crate) fn sinterstore(engine: &mut Engine, client: &mut ClientState, argv: &[Bytes]) -> HandlerResult {
    store(engine, client, argv, SetOp::Inter)
}

pub(crate) fn sunionstore(engine: &mut Engine, client: &mut ClientState, argv: &[Bytes]) -> HandlerResult {
    store(engine, client, argv, SetOp::Union)
}

pub(crate) fn sdiffstore(engine: &mut Engine, client: &mut ClientState, argv: &[Bytes]) -> HandlerResult {
    store(engine, client, argv, SetOp::Diff)
}

#[derive(Clone, Copy)]
enum SetOp {
    Inter,
    Union,
    Diff,
}

/// Evaluates an intersection, union or difference over the named
/// keys. A missing key is the empty set.
fn combine(
    engine: &mut Engine,
    client: &mut ClientState,
    keys: &[Bytes],
    op: SetOp,
) -> Result<AHashSet<Bytes>, Reply> {
    let db = engine.keyspace.db_mut(client.db);
    for key in keys {
        db.expire_if_needed(key);
    }

    // snapshot each operand; wrong types abort before any work
    let mut sets: Vec<Option<&AHashSet<Bytes>>> = Vec::with_capacity(keys.len());
    for key in keys {
        match db.entries.get(key).and_then(|e| e.value()) {
            None => sets.push(None),
            Some(Value::Set(members)) => sets.push(Some(members)),
            Some(_) => return Err(wrong_type_reply()),
        }
    }

    match op {
        SetOp::Inter => {
            // iterate the smallest operand, probe the rest
            let Some(smallest_idx) = (0..sets.len()).min_by_key(|&i| match sets[i] {
                Some(s) => s.len(),
                None => 0,
            }) else {
                return Ok(AHashSet::new());
            };
            let Some(smallest) = sets[smallest_idx] else {
                return Ok(AHashSet::new());
            };
            let mut result = AHashSet::new();
            'member: for member in smallest {
                for (i, set) in sets.iter().enumerate() {
                    if i == smallest_idx {
                        continue;
                    }
                    match set {
                        Some(s) if s.contains(member) => {}
                        _ => continue 'member,
                    }
                }
                result.insert(member.clone());
            }
            Ok(result)
        }
        SetOp::Union => {
            let mut result = AHashSet::new();
            for set in sets.into_iter().flatten() {
                result.extend(set.iter().cloned());
            }
            Ok(result)
        }
        SetOp::Diff => {
            let mut result: AHashSet<Bytes> = match sets.first() {
                Some(Some(first)) => first.iter().cloned().collect(),
                _ => return Ok(AHashSet::new()),
            };
            for set in sets[1..].iter().flatten() {
                for member in set.iter() {
                    result.remove(member);
                }
                if result.is_empty() {
                    break;
                }
            }
            Ok(result)
        }
    }
}

fn members_reply(members: AHashSet<Bytes>) -> Reply {
    Reply::MultiBulk(members.into_iter().map(Reply::Bulk).collect())
}

/// The *STORE variants: write the combination to `dst` (deleting it
/// when the result is empty) and reply with the cardinality.
fn store(engine: &mut Engine, client: &mut ClientState, argv: &[Bytes], op: SetOp) -> HandlerResult {
    let dst = argv[1].clone();
    let members = match combine(engine, client, &argv[2..], op) {
        Ok(members) => members,
        Err(r) => return reply(r),
    };
    let card = members.len();
    let db = engine.keyspace.db_mut(client.db);
    if members.is_empty() {
        db.remove(&dst);
    } else {
        db.set_value(dst, Value::Set(members));
    }
    engine.add_dirty(1);
    reply(Reply::Integer(card as i64))
}
