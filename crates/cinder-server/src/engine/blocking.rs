//! Blocking list pops: parking clients and waking them on push.
//!
//! A client that BLPOPs an empty key joins that key's waiter FIFO
//! (one per database) and keeps its reply channel parked in the
//! executor. A later push hands its element straight to the oldest
//! live waiter as `[key, element]` — the element never touches the
//! list, so there is nothing to journal. Deadlines are enforced by
//! the periodic tick, which answers expired waiters with a nil
//! multi-bulk.

use bytes::Bytes;
use cinder_core::object::Value;
use cinder_core::time;
use cinder_protocol::Reply;

use super::{BlockedState, CallMode, ClientState, CommandOutcome, Engine, HandlerResult};
use crate::engine::commands::{parse_int, wrong_type_reply};

/// BLPOP / BRPOP: `key [key ...] timeout`.
pub(crate) fn blocking_pop(
    engine: &mut Engine,
    client: &mut ClientState,
    argv: &[Bytes],
    left: bool,
) -> HandlerResult {
    let timeout_secs = match parse_int(&argv[argv.len() - 1]) {
        Ok(n) if n >= 0 => n as u64,
        Ok(_) => return HandlerResult::Reply(Reply::error("timeout is negative")),
        Err(_) => {
            return HandlerResult::Reply(Reply::error(
                "timeout is not an integer or out of range",
            ))
        }
    };
    let keys = &argv[1..argv.len() - 1];

    // serve from the first key that already has an element
    for key in keys {
        let db = engine.keyspace.db_mut(client.db);
        match db.lookup_write(key) {
            None => {}
            Some(Value::List(list)) => {
                let element = if left {
                    list.pop_front()
                } else {
                    list.pop_back()
                };
                let element = element.expect("stored lists are never empty");
                if list.is_empty() {
                    db.remove(key);
                }
                engine.add_dirty(1);
                let pop = if left { "LPOP" } else { "RPOP" };
                engine.propagate_override = Some(vec![vec![
                    Bytes::from_static(pop.as_bytes()),
                    key.clone(),
                ]]);
                return HandlerResult::Reply(Reply::MultiBulk(vec![
                    Reply::Bulk(key.clone()),
                    Reply::Bulk(element),
                ]));
            }
            Some(_) => return HandlerResult::Reply(wrong_type_reply()),
        }
    }

    // a queued transaction cannot yield the connection
    if engine.call_mode != CallMode::Normal {
        return HandlerResult::Reply(Reply::NilMultiBulk);
    }

    // park on every requested key
    let mut parked_keys: Vec<Bytes> = Vec::with_capacity(keys.len());
    for key in keys {
        if parked_keys.iter().any(|k| k == key) {
            continue;
        }
        engine.blocked_keys[client.db]
            .entry(key.clone())
            .or_default()
            .push_back(client.id);
        parked_keys.push(key.clone());
    }
    let deadline_ms = if timeout_secs == 0 {
        None
    } else {
        Some(time::now_ms() + timeout_secs * 1000)
    };
    HandlerResult::Block {
        keys: parked_keys,
        deadline_ms,
    }
}

/// Offers a pushed element to waiters on `key`. Returns `true` when
/// a waiter consumed it (the caller must not store it).
pub(crate) fn serve_push(engine: &mut Engine, db_idx: usize, key: &Bytes, element: &Bytes) -> bool {
    loop {
        let waiter_id = {
            let Some(queue) = engine.blocked_keys[db_idx].get_mut(key) else {
                return false;
            };
            match queue.pop_front() {
                Some(id) => {
                    if queue.is_empty() {
                        engine.blocked_keys[db_idx].remove(key);
                    }
                    id
                }
                None => {
                    engine.blocked_keys[db_idx].remove(key);
                    return false;
                }
            }
        };

        let Some(client) = engine.clients.get_mut(&waiter_id) else {
            continue; // stale registration
        };
        let Some(blocked) = client.blocked.take() else {
            continue;
        };
        let keys = blocked.keys;
        clear_registrations(engine, db_idx, waiter_id, &keys);

        let reply = Reply::MultiBulk(vec![Reply::Bulk(key.clone()), Reply::Bulk(element.clone())]);
        if blocked.reply.send(CommandOutcome::Reply(reply)).is_ok() {
            return true;
        }
        // receiver gone (client disconnecting): try the next waiter
    }
}

/// Drops a client's waiter registrations on every key it parked on.
pub(crate) fn clear_registrations(engine: &mut Engine, db_idx: usize, client_id: u64, keys: &[Bytes]) {
    for key in keys {
        if let Some(queue) = engine.blocked_keys[db_idx].get_mut(key) {
            queue.retain(|&id| id != client_id);
            if queue.is_empty() {
                engine.blocked_keys[db_idx].remove(key);
            }
        }
    }
}

/// Periodic-tick hook: answers every waiter whose deadline passed
/// with a nil multi-bulk.
pub(crate) fn unblock_expired(engine: &mut Engine) {
    let now = time::now_ms();
    let expired: Vec<u64> = engine
        .clients
        .iter()
        .filter_map(|(&id, client)| {
            client
                .blocked
                .as_ref()
                .and_then(|b| b.deadline_ms)
                .filter(|&deadline| now >= deadline)
                .map(|_| id)
        })
        .collect();

    for id in expired {
        let Some(client) = engine.clients.get_mut(&id) else {
            continue;
        };
        let db_idx = client.db;
        let Some(BlockedState { keys, reply, .. }) = client.blocked.take() else {
            continue;
        };
        clear_registrations(engine, db_idx, id, &keys);
        let _ = reply.send(CommandOutcome::Reply(Reply::NilMultiBulk));
    }
}
