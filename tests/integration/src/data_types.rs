//! List, set, sorted-set and hash behavior.

use crate::helpers::{Reply, ServerOptions, TestServer};

#[tokio::test]
async fn list_push_order() {
    let server = TestServer::start();
    let mut c = server.connect().await;

    // RPUSH preserves push order, LPUSH reverses it
    for v in ["a", "b", "c"] {
        c.get_int(&["RPUSH", "r", v]).await;
    }
    assert_eq!(c.get_strings(&["LRANGE", "r", "0", "-1"]).await, vec!["a", "b", "c"]);

    for v in ["a", "b", "c"] {
        c.get_int(&["LPUSH", "l", v]).await;
    }
    assert_eq!(c.get_strings(&["LRANGE", "l", "0", "-1"]).await, vec!["c", "b", "a"]);
    assert_eq!(c.get_int(&["LLEN", "l"]).await, 3);
}

#[tokio::test]
async fn list_pops_delete_empty_key() {
    let server = TestServer::start();
    let mut c = server.connect().await;

    c.get_int(&["RPUSH", "l", "only"]).await;
    assert_eq!(c.get_bulk(&["LPOP", "l"]).await, Some("only".into()));
    assert_eq!(c.cmd(&["RPOP", "l"]).await, Reply::Nil);
    assert_eq!(c.get_int(&["EXISTS", "l"]).await, 0);
}

#[tokio::test]
async fn lindex_lset_lrange() {
    let server = TestServer::start();
    let mut c = server.connect().await;

    for v in ["a", "b", "c"] {
        c.get_int(&["RPUSH", "l", v]).await;
    }
    assert_eq!(c.get_bulk(&["LINDEX", "l", "0"]).await, Some("a".into()));
    assert_eq!(c.get_bulk(&["LINDEX", "l", "-1"]).await, Some("c".into()));
    assert_eq!(c.cmd(&["LINDEX", "l", "9"]).await, Reply::Nil);

    c.ok(&["LSET", "l", "1", "B"]).await;
    assert_eq!(c.get_strings(&["LRANGE", "l", "0", "-1"]).await, vec!["a", "B", "c"]);
    let msg = c.err(&["LSET", "l", "9", "x"]).await;
    assert!(msg.contains("index out of range"), "got: {msg}");
    let msg = c.err(&["LSET", "ghost", "0", "x"]).await;
    assert!(msg.contains("no such key"), "got: {msg}");
}

#[tokio::test]
async fn ltrim_and_lrem() {
    let server = TestServer::start();
    let mut c = server.connect().await;

    for v in ["a", "b", "c", "d", "e"] {
        c.get_int(&["RPUSH", "l", v]).await;
    }
    c.ok(&["LTRIM", "l", "1", "3"]).await;
    assert_eq!(c.get_strings(&["LRANGE", "l", "0", "-1"]).await, vec!["b", "c", "d"]);

    for v in ["x", "y", "x", "z", "x"] {
        c.get_int(&["RPUSH", "m", v]).await;
    }
    // positive count removes from the head side
    assert_eq!(c.get_int(&["LREM", "m", "2", "x"]).await, 2);
    assert_eq!(c.get_strings(&["LRANGE", "m", "0", "-1"]).await, vec!["y", "z", "x"]);
    // zero removes all
    assert_eq!(c.get_int(&["LREM", "m", "0", "x"]).await, 1);
    assert_eq!(c.get_int(&["LREM", "m", "0", "missing"]).await, 0);
}

#[tokio::test]
async fn rpoplpush_moves_and_rotates() {
    let server = TestServer::start();
    let mut c = server.connect().await;

    for v in ["a", "b", "c"] {
        c.get_int(&["RPUSH", "src", v]).await;
    }
    assert_eq!(c.get_bulk(&["RPOPLPUSH", "src", "dst"]).await, Some("c".into()));
    assert_eq!(c.get_strings(&["LRANGE", "src", "0", "-1"]).await, vec!["a", "b"]);
    assert_eq!(c.get_strings(&["LRANGE", "dst", "0", "-1"]).await, vec!["c"]);

    // self-rotation
    assert_eq!(c.get_bulk(&["RPOPLPUSH", "src", "src"]).await, Some("b".into()));
    assert_eq!(c.get_strings(&["LRANGE", "src", "0", "-1"]).await, vec!["b", "a"]);

    assert_eq!(c.cmd(&["RPOPLPUSH", "ghost", "dst"]).await, Reply::Nil);
}

#[tokio::test]
async fn set_membership() {
    let server = TestServer::start();
    let mut c = server.connect().await;

    assert_eq!(c.get_int(&["SADD", "s", "a"]).await, 1);
    assert_eq!(c.get_int(&["SADD", "s", "a"]).await, 0);
    c.get_int(&["SADD", "s", "b"]).await;
    assert_eq!(c.get_int(&["SCARD", "s"]).await, 2);
    assert_eq!(c.get_int(&["SISMEMBER", "s", "a"]).await, 1);
    assert_eq!(c.get_int(&["SISMEMBER", "s", "z"]).await, 0);
    assert_eq!(c.get_int(&["SREM", "s", "a"]).await, 1);
    assert_eq!(c.get_int(&["SREM", "s", "a"]).await, 0);

    let mut members = c.get_strings(&["SMEMBERS", "s"]).await;
    members.sort();
    assert_eq!(members, vec!["b"]);
}

#[tokio::test]
async fn set_algebra() {
    let server = TestServer::start();
    let mut c = server.connect().await;

    for m in ["a", "b", "c"] {
        c.get_int(&["SADD", "s1", m]).await;
    }
    for m in ["b", "c", "d"] {
        c.get_int(&["SADD", "s2", m]).await;
    }

    let mut inter = c.get_strings(&["SINTER", "s1", "s2"]).await;
    inter.sort();
    assert_eq!(inter, vec!["b", "c"]);

    let mut union = c.get_strings(&["SUNION", "s1", "s2"]).await;
    union.sort();
    assert_eq!(union, vec!["a", "b", "c", "d"]);

    let mut diff = c.get_strings(&["SDIFF", "s1", "s2"]).await;
    diff.sort();
    assert_eq!(diff, vec!["a"]);

    // intersecting with a missing key is empty
    assert!(c.get_strings(&["SINTER", "s1", "ghost"]).await.is_empty());

    assert_eq!(c.get_int(&["SINTERSTORE", "dst", "s1", "s2"]).await, 2);
    assert_eq!(c.get_int(&["SCARD", "dst"]).await, 2);
    // an empty result deletes the destination
    assert_eq!(c.get_int(&["SINTERSTORE", "dst", "s1", "ghost"]).await, 0);
    assert_eq!(c.get_int(&["EXISTS", "dst"]).await, 0);
}

#[tokio::test]
async fn smove_and_spop() {
    let server = TestServer::start();
    let mut c = server.connect().await;

    c.get_int(&["SADD", "src", "m"]).await;
    assert_eq!(c.get_int(&["SMOVE", "src", "dst", "m"]).await, 1);
    assert_eq!(c.get_int(&["SMOVE", "src", "dst", "m"]).await, 0);
    assert_eq!(c.get_int(&["SISMEMBER", "dst", "m"]).await, 1);
    assert_eq!(c.get_int(&["EXISTS", "src"]).await, 0);

    let popped = c.get_bulk(&["SPOP", "dst"]).await;
    assert_eq!(popped, Some("m".into()));
    assert_eq!(c.get_int(&["EXISTS", "dst"]).await, 0);
    assert_eq!(c.cmd(&["SPOP", "dst"]).await, Reply::Nil);
}

#[tokio::test]
async fn zset_score_ordering_with_ties() {
    let server = TestServer::start();
    let mut c = server.connect().await;

    c.get_int(&["ZADD", "z", "1", "a"]).await;
    c.get_int(&["ZADD", "z", "2", "b"]).await;
    c.get_int(&["ZADD", "z", "1", "c"]).await;

    // ties break on member bytes: a, c share score 1
    let rows = c.get_strings(&["ZRANGE", "z", "0", "-1", "WITHSCORES"]).await;
    assert_eq!(rows, vec!["a", "1", "c", "1", "b", "2"]);

    assert_eq!(
        c.get_strings(&["ZREVRANGE", "z", "0", "-1"]).await,
        vec!["b", "c", "a"]
    );
}

#[tokio::test]
async fn zset_rank_and_score() {
    let server = TestServer::start();
    let mut c = server.connect().await;

    for (score, member) in [("10", "a"), ("20", "b"), ("30", "c")] {
        c.get_int(&["ZADD", "z", score, member]).await;
    }
    assert_eq!(c.get_int(&["ZCARD", "z"]).await, 3);
    assert_eq!(c.get_int(&["ZRANK", "z", "a"]).await, 0);
    assert_eq!(c.get_int(&["ZRANK", "z", "c"]).await, 2);
    assert_eq!(c.get_int(&["ZREVRANK", "z", "c"]).await, 0);
    assert_eq!(c.cmd(&["ZRANK", "z", "ghost"]).await, Reply::Nil);
    assert_eq!(c.get_bulk(&["ZSCORE", "z", "b"]).await, Some("20".into()));

    // replacing a score moves the member
    c.get_int(&["ZADD", "z", "5", "c"]).await;
    assert_eq!(c.get_int(&["ZRANK", "z", "c"]).await, 0);
}

#[tokio::test]
async fn zincrby_accumulates() {
    let server = TestServer::start();
    let mut c = server.connect().await;

    assert_eq!(c.get_bulk(&["ZINCRBY", "z", "2.5", "m"]).await, Some("2.5".into()));
    assert_eq!(c.get_bulk(&["ZINCRBY", "z", "1.5", "m"]).await, Some("4".into()));
}

#[tokio::test]
async fn zrangebyscore_and_zcount() {
    let server = TestServer::start();
    let mut c = server.connect().await;

    for (score, member) in [("1", "a"), ("2", "b"), ("3", "c"), ("4", "d")] {
        c.get_int(&["ZADD", "z", score, member]).await;
    }
    assert_eq!(
        c.get_strings(&["ZRANGEBYSCORE", "z", "2", "3"]).await,
        vec!["b", "c"]
    );
    // exclusive bound and infinity
    assert_eq!(
        c.get_strings(&["ZRANGEBYSCORE", "z", "(2", "+inf"]).await,
        vec!["c", "d"]
    );
    assert_eq!(
        c.get_strings(&["ZRANGEBYSCORE", "z", "-inf", "+inf", "LIMIT", "1", "2"]).await,
        vec!["b", "c"]
    );
    assert_eq!(c.get_int(&["ZCOUNT", "z", "2", "3"]).await, 2);
    let msg = c.err(&["ZRANGEBYSCORE", "z", "two", "3"]).await;
    assert!(msg.contains("double"), "got: {msg}");
}

#[tokio::test]
async fn zremrange_variants() {
    let server = TestServer::start();
    let mut c = server.connect().await;

    for (score, member) in [("1", "a"), ("2", "b"), ("3", "c"), ("4", "d")] {
        c.get_int(&["ZADD", "z", score, member]).await;
    }
    assert_eq!(c.get_int(&["ZREMRANGEBYSCORE", "z", "2", "3"]).await, 2);
    assert_eq!(c.get_strings(&["ZRANGE", "z", "0", "-1"]).await, vec!["a", "d"]);
    assert_eq!(c.get_int(&["ZREMRANGEBYRANK", "z", "0", "0"]).await, 1);
    assert_eq!(c.get_strings(&["ZRANGE", "z", "0", "-1"]).await, vec!["d"]);

    assert_eq!(c.get_int(&["ZREM", "z", "d"]).await, 1);
    assert_eq!(c.get_int(&["EXISTS", "z"]).await, 0);
}

#[tokio::test]
async fn zunion_zinter_store() {
    let server = TestServer::start();
    let mut c = server.connect().await;

    for (score, member) in [("1", "a"), ("2", "b")] {
        c.get_int(&["ZADD", "z1", score, member]).await;
    }
    for (score, member) in [("10", "b"), ("10", "c")] {
        c.get_int(&["ZADD", "z2", score, member]).await;
    }

    assert_eq!(c.get_int(&["ZUNION", "u", "2", "z1", "z2"]).await, 3);
    let rows = c.get_strings(&["ZRANGE", "u", "0", "-1", "WITHSCORES"]).await;
    assert_eq!(rows, vec!["a", "1", "c", "10", "b", "12"]);

    assert_eq!(c.get_int(&["ZINTER", "i", "2", "z1", "z2"]).await, 1);
    assert_eq!(
        c.get_strings(&["ZRANGE", "i", "0", "-1", "WITHSCORES"]).await,
        vec!["b", "12"]
    );

    // weights scale the inputs
    assert_eq!(
        c.get_int(&["ZUNION", "w", "2", "z1", "z2", "WEIGHTS", "2", "1"]).await,
        3
    );
    assert_eq!(c.get_bulk(&["ZSCORE", "w", "b"]).await, Some("14".into()));
}

#[tokio::test]
async fn hash_basics() {
    let server = TestServer::start();
    let mut c = server.connect().await;

    assert_eq!(c.get_int(&["HSET", "h", "f1", "v1"]).await, 1);
    assert_eq!(c.get_int(&["HSET", "h", "f1", "v1b"]).await, 0);
    assert_eq!(c.get_bulk(&["HGET", "h", "f1"]).await, Some("v1b".into()));
    assert_eq!(c.cmd(&["HGET", "h", "ghost"]).await, Reply::Nil);
    assert_eq!(c.get_int(&["HEXISTS", "h", "f1"]).await, 1);
    assert_eq!(c.get_int(&["HLEN", "h"]).await, 1);

    c.get_int(&["HSET", "h", "f2", "v2"]).await;
    let mut keys = c.get_strings(&["HKEYS", "h"]).await;
    keys.sort();
    assert_eq!(keys, vec!["f1", "f2"]);
    assert_eq!(c.get_strings(&["HGETALL", "h"]).await.len(), 4);

    assert_eq!(c.get_int(&["HDEL", "h", "f1"]).await, 1);
    assert_eq!(c.get_int(&["HDEL", "h", "f1"]).await, 0);
    assert_eq!(c.get_int(&["HDEL", "h", "f2"]).await, 1);
    assert_eq!(c.get_int(&["EXISTS", "h"]).await, 0);
}

#[tokio::test]
async fn hash_conversion_preserves_data() {
    // hash-max-zipmap-entries 3: the fourth field converts the
    // encoding, and every field must survive
    let server = TestServer::start_with(ServerOptions {
        hash_max_zipmap_entries: Some(3),
        ..Default::default()
    });
    let mut c = server.connect().await;

    for i in 1..=3 {
        c.get_int(&["HSET", "h", &format!("k{i}"), &format!("v{i}")]).await;
    }
    c.get_int(&["HSET", "h", "k4", "v4"]).await;

    assert_eq!(c.get_bulk(&["HGET", "h", "k1"]).await, Some("v1".into()));
    assert_eq!(c.get_bulk(&["HGET", "h", "k4"]).await, Some("v4".into()));
    assert_eq!(c.get_int(&["HLEN", "h"]).await, 4);
}
