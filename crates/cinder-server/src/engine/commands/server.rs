//! Server administration, replication entry points and transactions.

use bytes::Bytes;
use cinder_core::db::Storage;
use cinder_core::object::Value;
use cinder_protocol::Reply;
use tracing::{info, warn};

use super::upper;
use crate::engine::{dispatch, CallMode, ClientState, Engine, HandlerResult};

fn reply(r: Reply) -> HandlerResult {
    HandlerResult::Reply(r)
}

pub(crate) fn ping(_engine: &mut Engine, _client: &mut ClientState, _argv: &[Bytes]) -> HandlerResult {
    reply(Reply::pong())
}

pub(crate) fn echo(_engine: &mut Engine, _client: &mut ClientState, argv: &[Bytes]) -> HandlerResult {
    reply(Reply::Bulk(argv[1].clone()))
}

pub(crate) fn quit(_engine: &mut Engine, _client: &mut ClientState, _argv: &[Bytes]) -> HandlerResult {
    HandlerResult::Close(Reply::ok())
}

pub(crate) fn auth(engine: &mut Engine, client: &mut ClientState, argv: &[Bytes]) -> HandlerResult {
    match &engine.config.requirepass {
        None => reply(Reply::error("Client sent AUTH, but no password is set")),
        Some(pass) if pass.as_bytes() == &argv[1][..] => {
            client.authenticated = true;
            reply(Reply::ok())
        }
        Some(_) => {
            client.authenticated = false;
            reply(Reply::error("invalid password"))
        }
    }
}

pub(crate) fn save(engine: &mut Engine, _client: &mut ClientState, _argv: &[Bytes]) -> HandlerResult {
    if engine.bgsave_in_progress() {
        return reply(Reply::error("background save in progress"));
    }
    match engine.foreground_save() {
        Ok(()) => reply(Reply::ok()),
        Err(e) => {
            warn!("SAVE failed: {e}");
            reply(Reply::error(e.to_string()))
        }
    }
}

pub(crate) fn bgsave(engine: &mut Engine, _client: &mut ClientState, _argv: &[Bytes]) -> HandlerResult {
    if engine.bgsave_in_progress() {
        return reply(Reply::error("Background save already in progress"));
    }
    engine.start_bgsave();
    reply(Reply::Status("Background saving started".into()))
}

pub(crate) fn bgrewriteaof(engine: &mut Engine, _client: &mut ClientState, _argv: &[Bytes]) -> HandlerResult {
    if engine.rewrite_in_progress() {
        return reply(Reply::error(
            "background append only file rewriting already in progress",
        ));
    }
    engine.start_rewrite();
    reply(Reply::Status(
        "Background append only file rewriting started".into(),
    ))
}

pub(crate) fn lastsave(engine: &mut Engine, _client: &mut ClientState, _argv: &[Bytes]) -> HandlerResult {
    reply(Reply::Integer(engine.last_save_secs as i64))
}

pub(crate) fn shutdown(engine: &mut Engine, _client: &mut ClientState, _argv: &[Bytes]) -> HandlerResult {
    if !engine.config.save_points.is_empty() {
        if let Err(e) = engine.foreground_save() {
            warn!("refusing SHUTDOWN, final save failed: {e}");
            return reply(Reply::error("Errors trying to SHUTDOWN. Check logs."));
        }
    }
    if let Some(aof) = engine.aof.as_mut() {
        let _ = aof.fsync_if_due();
    }
    info!("server shutting down on SHUTDOWN command");
    std::process::exit(0);
}

pub(crate) fn info(engine: &mut Engine, _client: &mut ClientState, _argv: &[Bytes]) -> HandlerResult {
    reply(Reply::Bulk(Bytes::from(engine.info_text())))
}

pub(crate) fn monitor(engine: &mut Engine, client: &mut ClientState, _argv: &[Bytes]) -> HandlerResult {
    let rx = engine.register_monitor(client.id);
    HandlerResult::Monitor(rx)
}

pub(crate) fn slaveof(engine: &mut Engine, _client: &mut ClientState, argv: &[Bytes]) -> HandlerResult {
    let host = upper(&argv[1]);
    let port = upper(&argv[2]);
    if host == b"NO" && port == b"ONE" {
        engine.set_master(None);
        return reply(Reply::ok());
    }
    let host = match std::str::from_utf8(&argv[1]) {
        Ok(host) => host.to_string(),
        Err(_) => return reply(Reply::error("invalid master host")),
    };
    let port: u16 = match std::str::from_utf8(&argv[2]).ok().and_then(|s| s.parse().ok()) {
        Some(port) => port,
        None => return reply(Reply::error("invalid master port")),
    };
    engine.set_master(Some((host, port)));
    reply(Reply::ok())
}

pub(crate) fn sync(engine: &mut Engine, client: &mut ClientState, _argv: &[Bytes]) -> HandlerResult {
    let rx = engine.register_replica(client.id);
    HandlerResult::Replica(rx)
}

pub(crate) fn debug(engine: &mut Engine, client: &mut ClientState, argv: &[Bytes]) -> HandlerResult {
    match upper(&argv[1]).as_slice() {
        b"OBJECT" if argv.len() == 3 => {
            let db = engine.keyspace.db_mut(client.db);
            if db.expire_if_needed(&argv[2]) {
                return reply(Reply::error("no such key"));
            }
            let Some(entry) = db.entries.get(&argv[2]) else {
                return reply(Reply::error("no such key"));
            };
            let text = match &entry.storage {
                Storage::Memory(value) | Storage::Swapping(value) => {
                    let encoding = match value {
                        Value::Str(s) => s.encoding_name(),
                        Value::Hash(h) => h.encoding_name(),
                        _ => "normal",
                    };
                    format!(
                        "Value refcount:1 encoding:{encoding} serializedlength:{}",
                        value.approx_size()
                    )
                }
                Storage::Swapped(ptr) | Storage::Loading(ptr) => format!(
                    "Value swapped at: page {} pages {}",
                    ptr.page, ptr.pages
                ),
            };
            reply(Reply::Status(text.into()))
        }
        b"RELOAD" if argv.len() == 2 => match engine.debug_reload() {
            Ok(()) => reply(Reply::ok()),
            Err(e) => reply(Reply::error(format!("Error trying DEBUG RELOAD: {e}"))),
        },
        _ => reply(Reply::error(
            "DEBUG subcommand must be OBJECT <key> or RELOAD",
        )),
    }
}

pub(crate) fn multi(_engine: &mut Engine, client: &mut ClientState, _argv: &[Bytes]) -> HandlerResult {
    if client.multi.is_some() {
        return reply(Reply::error("MULTI calls can not be nested"));
    }
    client.multi = Some(Vec::new());
    reply(Reply::ok())
}

pub(crate) fn exec(engine: &mut Engine, client: &mut ClientState, _argv: &[Bytes]) -> HandlerResult {
    let Some(queued) = client.multi.take() else {
        return reply(Reply::error("EXEC without MULTI"));
    };

    let previous_mode = engine.call_mode;
    engine.call_mode = CallMode::Exec;
    let mut replies = Vec::with_capacity(queued.len());
    for argv in queued {
        let sub = match dispatch::execute(engine, client, &argv) {
            HandlerResult::Reply(r) | HandlerResult::Close(r) => r,
            // connection-yielding results cannot happen inside EXEC
            _ => Reply::error("command not allowed in MULTI"),
        };
        replies.push(sub);
    }
    engine.call_mode = previous_mode;
    // sub-commands already journaled themselves; the EXEC frame
    // itself must not propagate
    engine.propagate_override = Some(Vec::new());
    reply(Reply::MultiBulk(replies))
}

pub(crate) fn discard(_engine: &mut Engine, client: &mut ClientState, _argv: &[Bytes]) -> HandlerResult {
    if client.multi.take().is_none() {
        return reply(Reply::error("DISCARD without MULTI"));
    }
    reply(Reply::ok())
}
