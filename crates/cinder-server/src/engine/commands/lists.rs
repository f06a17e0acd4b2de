//! List commands.

use std::collections::VecDeque;

use bytes::Bytes;
use cinder_core::object::{normalize_range, Value};
use cinder_protocol::Reply;

use super::{parse_int, wrong_type_reply};
use crate::engine::{blocking, ClientState, Engine, HandlerResult};

fn reply(r: Reply) -> HandlerResult {
    HandlerResult::Reply(r)
}

fn is_list(value: &Value) -> bool {
    matches!(value, Value::List(_))
}

pub(crate) fn lpush(engine: &mut Engine, client: &mut ClientState, argv: &[Bytes]) -> HandlerResult {
    push(engine, client, argv, true)
}

pub(crate) fn rpush(engine: &mut Engine, client: &mut ClientState, argv: &[Bytes]) -> HandlerResult {
    push(engine, client, argv, false)
}

fn push(engine: &mut Engine, client: &mut ClientState, argv: &[Bytes], left: bool) -> HandlerResult {
    let db_idx = client.db;
    match engine.keyspace.db_mut(db_idx).classify(&argv[1], is_list) {
        Err(()) => return reply(wrong_type_reply()),
        Ok(true) => {
            // no list: a parked BLPOP/BRPOP takes the element directly
            // and the keyspace stays untouched
            if blocking::serve_push(engine, db_idx, &argv[1], &argv[2]) {
                return reply(Reply::Integer(1));
            }
            engine
                .keyspace
                .db_mut(db_idx)
                .insert_new(argv[1].clone(), Value::List(VecDeque::new()));
        }
        Ok(false) => {}
    }

    let db = engine.keyspace.db_mut(db_idx);
    let Some(Value::List(list)) = db.lookup_write(&argv[1]) else {
        unreachable!("key was just classified or created as a list");
    };
    if left {
        list.push_front(argv[2].clone());
    } else {
        list.push_back(argv[2].clone());
    }
    let len = list.len();
    engine.add_dirty(1);
    reply(Reply::Integer(len as i64))
}

pub(crate) fn lpop(engine: &mut Engine, client: &mut ClientState, argv: &[Bytes]) -> HandlerResult {
    pop(engine, client, argv, true)
}

pub(crate) fn rpop(engine: &mut Engine, client: &mut ClientState, argv: &[Bytes]) -> HandlerResult {
    pop(engine, client, argv, false)
}

fn pop(engine: &mut Engine, client: &mut ClientState, argv: &[Bytes], left: bool) -> HandlerResult {
    let db = engine.keyspace.db_mut(client.db);
    match db.lookup_write(&argv[1]) {
        None => reply(Reply::Nil),
        Some(Value::List(list)) => {
            let element = if left {
                list.pop_front()
            } else {
                list.pop_back()
            };
            let element = element.expect("stored lists are never empty");
            if list.is_empty() {
                db.remove(&argv[1]);
            }
            engine.add_dirty(1);
            reply(Reply::Bulk(element))
        }
        Some(_) => reply(wrong_type_reply()),
    }
}

pub(crate) fn llen(engine: &mut Engine, client: &mut ClientState, argv: &[Bytes]) -> HandlerResult {
    let db = engine.keyspace.db_mut(client.db);
    match db.lookup_read(&argv[1]) {
        None => reply(Reply::Integer(0)),
        Some(Value::List(list)) => reply(Reply::Integer(list.len() as i64)),
        Some(_) => reply(wrong_type_reply()),
    }
}

pub(crate) fn lindex(engine: &mut Engine, client: &mut ClientState, argv: &[Bytes]) -> HandlerResult {
    let index = match parse_int(&argv[2]) {
        Ok(n) => n,
        Err(e) => return reply(e),
    };
    let db = engine.keyspace.db_mut(client.db);
    match db.lookup_read(&argv[1]) {
        None => reply(Reply::Nil),
        Some(Value::List(list)) => {
            let resolved = resolve_index(index, list.len());
            match resolved.and_then(|i| list.get(i)) {
                Some(element) => reply(Reply::Bulk(element.clone())),
                None => reply(Reply::Nil),
            }
        }
        Some(_) => reply(wrong_type_reply()),
    }
}

pub(crate) fn lset(engine: &mut Engine, client: &mut ClientState, argv: &[Bytes]) -> HandlerResult {
    let index = match parse_int(&argv[2]) {
        Ok(n) => n,
        Err(e) => return reply(e),
    };
    let db = engine.keyspace.db_mut(client.db);
    match db.lookup_write(&argv[1]) {
        None => reply(Reply::error("no such key")),
        Some(Value::List(list)) => {
            let len = list.len();
            match resolve_index(index, len).and_then(|i| list.get_mut(i)) {
                Some(slot) => {
                    *slot = argv[3].clone();
                    engine.add_dirty(1);
                    reply(Reply::ok())
                }
                None => reply(Reply::error("index out of range")),
            }
        }
        Some(_) => reply(wrong_type_reply()),
    }
}

pub(crate) fn lrange(engine: &mut Engine, client: &mut ClientState, argv: &[Bytes]) -> HandlerResult {
    let (start, stop) = match (parse_int(&argv[2]), parse_int(&argv[3])) {
        (Ok(s), Ok(e)) => (s, e),
        _ => return reply(Reply::error("value is not an integer or out of range")),
    };
    let db = engine.keyspace.db_mut(client.db);
    match db.lookup_read(&argv[1]) {
        None => reply(Reply::MultiBulk(Vec::new())),
        Some(Value::List(list)) => {
            let (start, stop) = normalize_range(start, stop, list.len() as i64);
            if start > stop {
                return reply(Reply::MultiBulk(Vec::new()));
            }
            let rows = list
                .iter()
                .skip(start as usize)
                .take((stop - start + 1) as usize)
                .map(|element| Reply::Bulk(element.clone()))
                .collect();
            reply(Reply::MultiBulk(rows))
        }
        Some(_) => reply(wrong_type_reply()),
    }
}

pub(crate) fn ltrim(engine: &mut Engine, client: &mut ClientState, argv: &[Bytes]) -> HandlerResult {
    let (start, stop) = match (parse_int(&argv[2]), parse_int(&argv[3])) {
        (Ok(s), Ok(e)) => (s, e),
        _ => return reply(Reply::error("value is not an integer or out of range")),
    };
    let db = engine.keyspace.db_mut(client.db);
    match db.lookup_write(&argv[1]) {
        None => reply(Reply::ok()),
        Some(Value::List(list)) => {
            let (start, stop) = normalize_range(start, stop, list.len() as i64);
            if start > stop {
                db.remove(&argv[1]);
            } else {
                list.truncate(stop as usize + 1);
                list.drain(..start as usize);
                if list.is_empty() {
                    db.remove(&argv[1]);
                }
            }
            engine.add_dirty(1);
            reply(Reply::ok())
        }
        Some(_) => reply(wrong_type_reply()),
    }
}

pub(crate) fn lrem(engine: &mut Engine, client: &mut ClientState, argv: &[Bytes]) -> HandlerResult {
    let count = match parse_int(&argv[2]) {
        Ok(n) => n,
        Err(e) => return reply(e),
    };
    let target = &argv[3];
    let db = engine.keyspace.db_mut(client.db);
    match db.lookup_write(&argv[1]) {
        None => reply(Reply::Integer(0)),
        Some(Value::List(list)) => {
            let limit = if count == 0 {
                usize::MAX
            } else {
                count.unsigned_abs() as usize
            };
            let from_tail = count < 0;
            let mut removed = 0;

            if from_tail {
                let mut i = list.len();
                while i > 0 && removed < limit {
                    i -= 1;
                    if list[i] == *target {
                        let _ = list.remove(i);
                        removed += 1;
                    }
                }
            } else {
                let mut i = 0;
                while i < list.len() && removed < limit {
                    if list[i] == *target {
                        let _ = list.remove(i);
                        removed += 1;
                    } else {
                        i += 1;
                    }
                }
            }

            if list.is_empty() {
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

pub(crate) fn rpoplpush(engine: &mut Engine, client: &mut ClientState, argv: &[Bytes]) -> HandlerResult {
    let db_idx = client.db;
    let (src, dst) = (&argv[1], &argv[2]);

    // check the destination before touching the source
    let dst_state = match engine.keyspace.db_mut(db_idx).classify(dst, is_list) {
        Err(()) => return reply(wrong_type_reply()),
        Ok(absent) => absent,
    };

    let db = engine.keyspace.db_mut(db_idx);
    let element = match db.lookup_write(src) {
        None => return reply(Reply::Nil),
        Some(Value::List(list)) => {
            let element = list.pop_back().expect("stored lists are never empty");
            if list.is_empty() {
                db.remove(src);
            }
            element
        }
        Some(_) => return reply(wrong_type_reply()),
    };
    engine.add_dirty(1);

    if dst_state && src != dst {
        // destination absent: a parked waiter may take the element
        if blocking::serve_push(engine, db_idx, dst, &element) {
            engine.propagate_override =
                Some(vec![vec![Bytes::from_static(b"RPOP"), src.clone()]]);
            return reply(Reply::Bulk(element));
        }
        engine
            .keyspace
            .db_mut(db_idx)
            .insert_new(dst.clone(), Value::List(VecDeque::new()));
    } else if src == dst && engine.keyspace.db_mut(db_idx).lookup_read(src).is_none() {
        // popping emptied the rotation source: recreate it
        engine
            .keyspace
            .db_mut(db_idx)
            .insert_new(dst.clone(), Value::List(VecDeque::new()));
    }

    let db = engine.keyspace.db_mut(db_idx);
    let Some(Value::List(dst_list)) = db.lookup_write(dst) else {
        unreachable!("destination was just classified or created as a list");
    };
    dst_list.push_front(element.clone());
    reply(Reply::Bulk(element))
}

/// Maps a possibly-negative index onto the list, `None` when out of
/// bounds.
fn resolve_index(index: i64, len: usize) -> Option<usize> {
    let len = len as i64;
    let resolved = if index < 0 { len + index } else { index };
    if (0..len).contains(&resolved) {
        Some(resolved as usize)
    } else {
        None
    }
}
