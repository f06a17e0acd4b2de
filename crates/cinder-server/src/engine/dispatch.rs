//! Table-driven command dispatch.
//!
//! Every command is one row: name, arity (negative = minimum),
//! flags, the (first, last, step) extent locating its keys in argv,
//! and the handler. The extent drives both the paging preload gate
//! and post-command size accounting; `last = -1` means "through the
//! final argument".
//!
//! `execute` is the single entry point for real clients, queued
//! transactions, journal replay and the master stream: the gates it
//! applies (auth, arity, MULTI queueing, memory pressure, preload)
//! and the propagation it performs afterwards are what the rest of
//! the engine relies on for consistency.

use bytes::Bytes;
use cinder_protocol::Reply;

use super::commands::{hashes, keys, lists, server, sets, strings, zsets};
use super::{blocking, CallMode, ClientState, Engine, HandlerResult};

/// The final argument arrives as a counted payload after an inline
/// command line.
pub(crate) const BULK: u8 = 1 << 0;
/// Plain inline command; all arguments are on the line.
pub(crate) const INLINE: u8 = 1 << 1;
/// Refused while used memory exceeds `maxmemory`.
pub(crate) const DENY_OOM: u8 = 1 << 2;

pub(crate) type Handler = fn(&mut Engine, &mut ClientState, &[Bytes]) -> HandlerResult;

pub(crate) struct CommandSpec {
    pub(crate) name: &'static str,
    /// Positive = exact argc (command included); negative = minimum.
    pub(crate) arity: i32,
    pub(crate) flags: u8,
    pub(crate) first_key: i32,
    pub(crate) last_key: i32,
    pub(crate) key_step: i32,
    pub(crate) handler: Handler,
}

macro_rules! cmd {
    ($name:literal, $arity:literal, $flags:expr, ($f:literal, $l:literal, $s:literal), $handler:path) => {
        CommandSpec {
            name: $name,
            arity: $arity,
            flags: $flags,
            first_key: $f,
            last_key: $l,
            key_step: $s,
            handler: $handler,
        }
    };
}

fn blpop(engine: &mut Engine, client: &mut ClientState, argv: &[Bytes]) -> HandlerResult {
    blocking::blocking_pop(engine, client, argv, true)
}

fn brpop(engine: &mut Engine, client: &mut ClientState, argv: &[Bytes]) -> HandlerResult {
    blocking::blocking_pop(engine, client, argv, false)
}

pub(crate) static TABLE: &[CommandSpec] = &[
    // strings
    cmd!("GET", 2, INLINE, (1, 1, 1), strings::get),
    cmd!("SET", 3, BULK | DENY_OOM, (1, 1, 1), strings::set),
    cmd!("SETNX", 3, BULK | DENY_OOM, (1, 1, 1), strings::setnx),
    cmd!("GETSET", 3, BULK | DENY_OOM, (1, 1, 1), strings::getset),
    cmd!("APPEND", 3, BULK | DENY_OOM, (1, 1, 1), strings::append),
    cmd!("SUBSTR", 4, INLINE, (1, 1, 1), strings::substr),
    cmd!("MGET", -2, INLINE, (1, -1, 1), strings::mget),
    cmd!("MSET", -3, INLINE | DENY_OOM, (1, -1, 2), strings::mset),
    cmd!("MSETNX", -3, INLINE | DENY_OOM, (1, -1, 2), strings::msetnx),
    cmd!("INCR", 2, INLINE | DENY_OOM, (1, 1, 1), strings::incr),
    cmd!("DECR", 2, INLINE | DENY_OOM, (1, 1, 1), strings::decr),
    cmd!("INCRBY", 3, INLINE | DENY_OOM, (1, 1, 1), strings::incrby),
    cmd!("DECRBY", 3, INLINE | DENY_OOM, (1, 1, 1), strings::decrby),
    cmd!("EXISTS", 2, INLINE, (1, 1, 1), strings::exists),
    cmd!("DEL", -2, INLINE, (1, -1, 1), strings::del),
    // lists
    cmd!("LPUSH", 3, BULK | DENY_OOM, (1, 1, 1), lists::lpush),
    cmd!("RPUSH", 3, BULK | DENY_OOM, (1, 1, 1), lists::rpush),
    cmd!("LPOP", 2, INLINE, (1, 1, 1), lists::lpop),
    cmd!("RPOP", 2, INLINE, (1, 1, 1), lists::rpop),
    cmd!("BLPOP", -3, INLINE, (1, -2, 1), blpop),
    cmd!("BRPOP", -3, INLINE, (1, -2, 1), brpop),
    cmd!("LLEN", 2, INLINE, (1, 1, 1), lists::llen),
    cmd!("LINDEX", 3, INLINE, (1, 1, 1), lists::lindex),
    cmd!("LSET", 4, BULK | DENY_OOM, (1, 1, 1), lists::lset),
    cmd!("LRANGE", 4, INLINE, (1, 1, 1), lists::lrange),
    cmd!("LTRIM", 4, INLINE, (1, 1, 1), lists::ltrim),
    cmd!("LREM", 4, BULK, (1, 1, 1), lists::lrem),
    cmd!("RPOPLPUSH", 3, BULK | DENY_OOM, (1, 2, 1), lists::rpoplpush),
    // sets
    cmd!("SADD", 3, BULK | DENY_OOM, (1, 1, 1), sets::sadd),
    cmd!("SREM", 3, BULK, (1, 1, 1), sets::srem),
    cmd!("SMOVE", 4, BULK, (1, 2, 1), sets::smove),
    cmd!("SISMEMBER", 3, BULK, (1, 1, 1), sets::sismember),
    cmd!("SCARD", 2, INLINE, (1, 1, 1), sets::scard),
    cmd!("SPOP", 2, INLINE, (1, 1, 1), sets::spop),
    cmd!("SRANDMEMBER", 2, INLINE, (1, 1, 1), sets::srandmember),
    cmd!("SINTER", -2, INLINE | DENY_OOM, (1, -1, 1), sets::sinter),
    cmd!("SINTERSTORE", -3, INLINE | DENY_OOM, (1, -1, 1), sets::sinterstore),
    cmd!("SUNION", -2, INLINE | DENY_OOM, (1, -1, 1), sets::sunion),
    cmd!("SUNIONSTORE", -3, INLINE | DENY_OOM, (1, -1, 1), sets::sunionstore),
    cmd!("SDIFF", -2, INLINE | DENY_OOM, (1, -1, 1), sets::sdiff),
    cmd!("SDIFFSTORE", -3, INLINE | DENY_OOM, (1, -1, 1), sets::sdiffstore),
    cmd!("SMEMBERS", 2, INLINE, (1, 1, 1), sets::smembers),
    // sorted sets
    cmd!("ZADD", 4, BULK | DENY_OOM, (1, 1, 1), zsets::zadd),
    cmd!("ZINCRBY", 4, BULK | DENY_OOM, (1, 1, 1), zsets::zincrby),
    cmd!("ZREM", 3, BULK, (1, 1, 1), zsets::zrem),
    cmd!("ZRANGE", -4, INLINE, (1, 1, 1), zsets::zrange),
    cmd!("ZREVRANGE", -4, INLINE, (1, 1, 1), zsets::zrevrange),
    cmd!("ZRANGEBYSCORE", -4, INLINE, (1, 1, 1), zsets::zrangebyscore),
    cmd!("ZCOUNT", 4, INLINE, (1, 1, 1), zsets::zcount),
    cmd!("ZCARD", 2, INLINE, (1, 1, 1), zsets::zcard),
    cmd!("ZSCORE", 3, BULK, (1, 1, 1), zsets::zscore),
    cmd!("ZRANK", 3, BULK, (1, 1, 1), zsets::zrank),
    cmd!("ZREVRANK", 3, BULK, (1, 1, 1), zsets::zrevrank),
    cmd!("ZREMRANGEBYSCORE", 4, INLINE, (1, 1, 1), zsets::zremrangebyscore),
    cmd!("ZREMRANGEBYRANK", 4, INLINE, (1, 1, 1), zsets::zremrangebyrank),
    cmd!("ZUNION", -4, INLINE | DENY_OOM, (0, 0, 0), zsets::zunion),
    cmd!("ZINTER", -4, INLINE | DENY_OOM, (0, 0, 0), zsets::zinter),
    // hashes
    cmd!("HSET", 4, BULK | DENY_OOM, (1, 1, 1), hashes::hset),
    cmd!("HGET", 3, BULK, (1, 1, 1), hashes::hget),
    cmd!("HDEL", 3, BULK, (1, 1, 1), hashes::hdel),
    cmd!("HLEN", 2, INLINE, (1, 1, 1), hashes::hlen),
    cmd!("HKEYS", 2, INLINE, (1, 1, 1), hashes::hkeys),
    cmd!("HVALS", 2, INLINE, (1, 1, 1), hashes::hvals),
    cmd!("HGETALL", 2, INLINE, (1, 1, 1), hashes::hgetall),
    cmd!("HEXISTS", 3, BULK, (1, 1, 1), hashes::hexists),
    // keyspace
    cmd!("KEYS", 2, INLINE, (0, 0, 0), keys::keys),
    cmd!("RANDOMKEY", 1, INLINE, (0, 0, 0), keys::randomkey),
    cmd!("TYPE", 2, INLINE, (1, 1, 1), keys::type_command),
    cmd!("RENAME", 3, INLINE, (1, 2, 1), keys::rename),
    cmd!("RENAMENX", 3, INLINE, (1, 2, 1), keys::renamenx),
    cmd!("MOVE", 3, INLINE, (1, 1, 1), keys::move_command),
    cmd!("SELECT", 2, INLINE, (0, 0, 0), keys::select),
    cmd!("FLUSHDB", 1, INLINE, (0, 0, 0), keys::flushdb),
    cmd!("FLUSHALL", 1, INLINE, (0, 0, 0), keys::flushall),
    cmd!("DBSIZE", 1, INLINE, (0, 0, 0), keys::dbsize),
    cmd!("EXPIRE", 3, INLINE, (1, 1, 1), keys::expire),
    cmd!("EXPIREAT", 3, INLINE, (1, 1, 1), keys::expireat),
    cmd!("TTL", 2, INLINE, (1, 1, 1), keys::ttl),
    cmd!("SORT", -2, INLINE | DENY_OOM, (1, 1, 1), keys::sort_command),
    // server
    cmd!("PING", 1, INLINE, (0, 0, 0), server::ping),
    cmd!("ECHO", 2, BULK, (0, 0, 0), server::echo),
    cmd!("AUTH", 2, INLINE, (0, 0, 0), server::auth),
    cmd!("SAVE", 1, INLINE, (0, 0, 0), server::save),
    cmd!("BGSAVE", 1, INLINE, (0, 0, 0), server::bgsave),
    cmd!("BGREWRITEAOF", 1, INLINE, (0, 0, 0), server::bgrewriteaof),
    cmd!("LASTSAVE", 1, INLINE, (0, 0, 0), server::lastsave),
    cmd!("SHUTDOWN", 1, INLINE, (0, 0, 0), server::shutdown),
    cmd!("INFO", 1, INLINE, (0, 0, 0), server::info),
    cmd!("MONITOR", 1, INLINE, (0, 0, 0), server::monitor),
    cmd!("SLAVEOF", 3, INLINE, (0, 0, 0), server::slaveof),
    cmd!("SYNC", 1, INLINE, (0, 0, 0), server::sync),
    cmd!("DEBUG", -2, INLINE, (0, 0, 0), server::debug),
    // transactions
    cmd!("MULTI", 1, INLINE, (0, 0, 0), server::multi),
    cmd!("EXEC", 1, INLINE, (0, 0, 0), server::exec),
    cmd!("DISCARD", 1, INLINE, (0, 0, 0), server::discard),
    cmd!("QUIT", 1, INLINE, (0, 0, 0), server::quit),
];

/// Case-insensitive table lookup.
pub(crate) fn lookup(name: &[u8]) -> Option<&'static CommandSpec> {
    TABLE
        .iter()
        .find(|spec| spec.name.as_bytes().eq_ignore_ascii_case(name))
}

/// Argv indices of a command's keys, per its (first, last, step).
pub(crate) fn key_indices(spec: &CommandSpec, argc: usize) -> Vec<usize> {
    if spec.first_key <= 0 {
        return Vec::new();
    }
    let last = if spec.last_key < 0 {
        argc as i32 + spec.last_key
    } else {
        spec.last_key
    };
    let mut indices = Vec::new();
    let mut i = spec.first_key;
    while i <= last && (i as usize) < argc {
        indices.push(i as usize);
        i += spec.key_step.max(1);
    }
    indices
}

/// Runs one command through the full gate: lookup, arity, auth,
/// transaction queueing, memory pressure, paging preload, handler,
/// then journal/replica propagation.
pub(crate) fn execute(engine: &mut Engine, client: &mut ClientState, argv: &[Bytes]) -> HandlerResult {
    let Some(spec) = lookup(&argv[0]) else {
        return HandlerResult::Reply(Reply::error(format!(
            "unknown command '{}'",
            String::from_utf8_lossy(&argv[0])
        )));
    };

    let argc = argv.len() as i32;
    if (spec.arity > 0 && argc != spec.arity) || (spec.arity < 0 && argc < -spec.arity) {
        return HandlerResult::Reply(Reply::error(format!(
            "wrong number of arguments for '{}' command",
            spec.name.to_ascii_lowercase()
        )));
    }

    if engine.config.requirepass.is_some() && !client.authenticated && spec.name != "AUTH" {
        return HandlerResult::Reply(Reply::error("operation not permitted"));
    }

    // inside MULTI everything but EXEC/DISCARD is queued
    if client.multi.is_some() && !matches!(spec.name, "EXEC" | "DISCARD") {
        client
            .multi
            .as_mut()
            .expect("just checked")
            .push(argv.to_vec());
        return HandlerResult::Reply(Reply::queued());
    }

    engine.feed_monitors(client.db, spec, argv);

    if spec.flags & DENY_OOM != 0 && engine.over_maxmemory() {
        return HandlerResult::Reply(Reply::error(
            "command not allowed when used memory > 'maxmemory'",
        ));
    }

    // paging gate: commands whose keys are swapped out wait for the
    // loads instead of blocking the executor
    if engine.vm.is_some() && spec.first_key > 0 {
        let pending = engine.preload_gate(client, spec, argv);
        if pending > 0 {
            return HandlerResult::Parked { pending };
        }
    }

    engine.total_commands += 1;
    let dirty_before = engine.dirty;
    engine.propagate_override = None;

    let result = (spec.handler)(engine, client, argv);

    if engine.dirty > dirty_before && engine.call_mode != CallMode::Replay {
        let frames = engine
            .propagate_override
            .take()
            .unwrap_or_else(|| vec![argv.to_vec()]);
        engine.propagate(client.db, &frames);
    } else {
        engine.propagate_override = None;
    }

    for idx in key_indices(spec, argv.len()) {
        engine.keyspace.db_mut(client.db).refresh_size(&argv[idx]);
    }

    result
}
