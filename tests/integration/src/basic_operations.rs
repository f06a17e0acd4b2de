//! String and keyspace command behavior.

use crate::helpers::{Reply, TestServer};

#[tokio::test]
async fn ping_and_echo() {
    let server = TestServer::start();
    let mut c = server.connect().await;

    assert_eq!(c.cmd(&["PING"]).await, Reply::Status("PONG".into()));
    assert_eq!(c.get_bulk(&["ECHO", "hello"]).await, Some("hello".into()));
}

#[tokio::test]
async fn string_round_trip() {
    let server = TestServer::start();
    let mut c = server.connect().await;

    c.ok(&["SET", "foo", "bar"]).await;
    assert_eq!(c.get_bulk(&["GET", "foo"]).await, Some("bar".into()));
    assert_eq!(c.get_int(&["APPEND", "foo", "baz"]).await, 6);
    assert_eq!(c.get_bulk(&["GET", "foo"]).await, Some("barbaz".into()));
}

#[tokio::test]
async fn get_missing_is_nil() {
    let server = TestServer::start();
    let mut c = server.connect().await;
    assert_eq!(c.cmd(&["GET", "missing"]).await, Reply::Nil);
}

#[tokio::test]
async fn setnx_and_getset() {
    let server = TestServer::start();
    let mut c = server.connect().await;

    assert_eq!(c.get_int(&["SETNX", "k", "first"]).await, 1);
    assert_eq!(c.get_int(&["SETNX", "k", "second"]).await, 0);
    assert_eq!(c.get_bulk(&["GETSET", "k", "third"]).await, Some("first".into()));
    assert_eq!(c.get_bulk(&["GET", "k"]).await, Some("third".into()));
}

#[tokio::test]
async fn substr_with_negative_indices() {
    let server = TestServer::start();
    let mut c = server.connect().await;

    c.ok(&["SET", "s", "Hello World"]).await;
    assert_eq!(c.get_bulk(&["SUBSTR", "s", "0", "4"]).await, Some("Hello".into()));
    assert_eq!(c.get_bulk(&["SUBSTR", "s", "-5", "-1"]).await, Some("World".into()));
    assert_eq!(c.cmd(&["SUBSTR", "missing", "0", "1"]).await, Reply::Nil);
}

#[tokio::test]
async fn counters() {
    let server = TestServer::start();
    let mut c = server.connect().await;

    assert_eq!(c.get_int(&["INCR", "n"]).await, 1);
    assert_eq!(c.get_int(&["INCR", "n"]).await, 2);
    assert_eq!(c.get_int(&["INCRBY", "n", "40"]).await, 42);
    assert_eq!(c.get_int(&["DECR", "n"]).await, 41);
    assert_eq!(c.get_int(&["DECRBY", "n", "40"]).await, 1);
    assert_eq!(c.get_bulk(&["GET", "n"]).await, Some("1".into()));
}

#[tokio::test]
async fn counter_overflow_is_rejected() {
    let server = TestServer::start();
    let mut c = server.connect().await;

    c.ok(&["SET", "n", "9223372036854775807"]).await;
    let msg = c.err(&["INCR", "n"]).await;
    assert!(msg.contains("overflow"), "got: {msg}");

    // DECRBY of i64::MIN has no representable negation
    c.ok(&["SET", "n", "0"]).await;
    let msg = c.err(&["DECRBY", "n", "-9223372036854775808"]).await;
    assert!(msg.contains("overflow"), "got: {msg}");
    assert_eq!(c.get_bulk(&["GET", "n"]).await, Some("0".into()));
}

#[tokio::test]
async fn incr_non_integer_errors() {
    let server = TestServer::start();
    let mut c = server.connect().await;

    c.ok(&["SET", "s", "not a number"]).await;
    let msg = c.err(&["INCR", "s"]).await;
    assert!(msg.contains("not an integer"), "got: {msg}");
}

#[tokio::test]
async fn mset_mget_msetnx() {
    let server = TestServer::start();
    let mut c = server.connect().await;

    c.ok(&["MSET", "a", "1", "b", "2"]).await;
    let got = c.get_multi(&["MGET", "a", "b", "missing"]).await;
    assert_eq!(
        got,
        vec![
            Reply::Bulk(b"1".to_vec()),
            Reply::Bulk(b"2".to_vec()),
            Reply::Nil
        ]
    );

    // MSETNX is all-or-nothing
    assert_eq!(c.get_int(&["MSETNX", "c", "3", "a", "clobber"]).await, 0);
    assert_eq!(c.cmd(&["GET", "c"]).await, Reply::Nil);
    assert_eq!(c.get_int(&["MSETNX", "c", "3", "d", "4"]).await, 1);
    assert_eq!(c.get_bulk(&["GET", "d"]).await, Some("4".into()));
}

#[tokio::test]
async fn del_and_exists() {
    let server = TestServer::start();
    let mut c = server.connect().await;

    c.ok(&["SET", "a", "1"]).await;
    c.ok(&["SET", "b", "2"]).await;
    assert_eq!(c.get_int(&["EXISTS", "a"]).await, 1);
    assert_eq!(c.get_int(&["DEL", "a", "b", "ghost"]).await, 2);
    assert_eq!(c.get_int(&["EXISTS", "a"]).await, 0);
}

#[tokio::test]
async fn type_reports_kind() {
    let server = TestServer::start();
    let mut c = server.connect().await;

    c.ok(&["SET", "s", "v"]).await;
    c.get_int(&["RPUSH", "l", "v"]).await;
    c.get_int(&["SADD", "st", "v"]).await;
    c.get_int(&["ZADD", "z", "1", "v"]).await;
    c.get_int(&["HSET", "h", "f", "v"]).await;

    assert_eq!(c.cmd(&["TYPE", "s"]).await, Reply::Status("string".into()));
    assert_eq!(c.cmd(&["TYPE", "l"]).await, Reply::Status("list".into()));
    assert_eq!(c.cmd(&["TYPE", "st"]).await, Reply::Status("set".into()));
    assert_eq!(c.cmd(&["TYPE", "z"]).await, Reply::Status("zset".into()));
    assert_eq!(c.cmd(&["TYPE", "h"]).await, Reply::Status("hash".into()));
    assert_eq!(c.cmd(&["TYPE", "none"]).await, Reply::Status("none".into()));
}

#[tokio::test]
async fn wrong_type_is_rejected() {
    let server = TestServer::start();
    let mut c = server.connect().await;

    c.get_int(&["RPUSH", "l", "v"]).await;
    let msg = c.err(&["GET", "l"]).await;
    assert!(msg.starts_with("WRONGTYPE"), "got: {msg}");
    let msg = c.err(&["INCR", "l"]).await;
    assert!(msg.starts_with("WRONGTYPE"), "got: {msg}");
}

#[tokio::test]
async fn keys_patterns() {
    let server = TestServer::start();
    let mut c = server.connect().await;

    c.ok(&["SET", "user:1", "a"]).await;
    c.ok(&["SET", "user:2", "b"]).await;
    c.ok(&["SET", "item:1", "c"]).await;

    let mut users = c.get_strings(&["KEYS", "user:*"]).await;
    users.sort();
    assert_eq!(users, vec!["user:1", "user:2"]);
    assert_eq!(c.get_strings(&["KEYS", "*"]).await.len(), 3);
}

#[tokio::test]
async fn rename_semantics() {
    let server = TestServer::start();
    let mut c = server.connect().await;

    c.ok(&["SET", "old", "v"]).await;
    c.ok(&["RENAME", "old", "new"]).await;
    assert_eq!(c.get_int(&["EXISTS", "old"]).await, 0);
    assert_eq!(c.get_bulk(&["GET", "new"]).await, Some("v".into()));

    let msg = c.err(&["RENAME", "ghost", "x"]).await;
    assert!(msg.contains("no such key"), "got: {msg}");
    let msg = c.err(&["RENAME", "new", "new"]).await;
    assert!(msg.contains("same"), "got: {msg}");

    c.ok(&["SET", "other", "w"]).await;
    assert_eq!(c.get_int(&["RENAMENX", "new", "other"]).await, 0);
    assert_eq!(c.get_int(&["RENAMENX", "new", "fresh"]).await, 1);
}

#[tokio::test]
async fn select_and_move() {
    let server = TestServer::start();
    let mut c = server.connect().await;

    c.ok(&["SET", "k", "v"]).await;
    assert_eq!(c.get_int(&["MOVE", "k", "1"]).await, 1);
    assert_eq!(c.get_int(&["EXISTS", "k"]).await, 0);

    c.ok(&["SELECT", "1"]).await;
    assert_eq!(c.get_bulk(&["GET", "k"]).await, Some("v".into()));

    // moving onto an existing key fails
    c.ok(&["SET", "dup", "a"]).await;
    c.ok(&["SELECT", "0"]).await;
    c.ok(&["SET", "dup", "b"]).await;
    assert_eq!(c.get_int(&["MOVE", "dup", "1"]).await, 0);

    let msg = c.err(&["SELECT", "9999"]).await;
    assert!(msg.contains("invalid DB index"), "got: {msg}");
}

#[tokio::test]
async fn dbsize_and_flushdb() {
    let server = TestServer::start();
    let mut c = server.connect().await;

    c.ok(&["SET", "a", "1"]).await;
    c.ok(&["SET", "b", "2"]).await;
    assert_eq!(c.get_int(&["DBSIZE"]).await, 2);
    c.ok(&["FLUSHDB"]).await;
    assert_eq!(c.get_int(&["DBSIZE"]).await, 0);
}

#[tokio::test]
async fn flushall_covers_every_db() {
    let server = TestServer::start();
    let mut c = server.connect().await;

    c.ok(&["SET", "k0", "v"]).await;
    c.ok(&["SELECT", "2"]).await;
    c.ok(&["SET", "k2", "v"]).await;
    c.ok(&["FLUSHALL"]).await;
    assert_eq!(c.get_int(&["DBSIZE"]).await, 0);
    c.ok(&["SELECT", "0"]).await;
    assert_eq!(c.get_int(&["DBSIZE"]).await, 0);
}

#[tokio::test]
async fn randomkey() {
    let server = TestServer::start();
    let mut c = server.connect().await;

    assert_eq!(c.cmd(&["RANDOMKEY"]).await, Reply::Nil);
    c.ok(&["SET", "only", "v"]).await;
    assert_eq!(c.get_bulk(&["RANDOMKEY"]).await, Some("only".into()));
}

#[tokio::test]
async fn sort_numeric_and_alpha() {
    let server = TestServer::start();
    let mut c = server.connect().await;

    for v in ["3", "1", "10", "2"] {
        c.get_int(&["RPUSH", "nums", v]).await;
    }
    assert_eq!(
        c.get_strings(&["SORT", "nums"]).await,
        vec!["1", "2", "3", "10"]
    );
    assert_eq!(
        c.get_strings(&["SORT", "nums", "DESC"]).await,
        vec!["10", "3", "2", "1"]
    );
    assert_eq!(
        c.get_strings(&["SORT", "nums", "LIMIT", "1", "2"]).await,
        vec!["2", "3"]
    );

    for v in ["banana", "apple", "cherry"] {
        c.get_int(&["RPUSH", "fruit", v]).await;
    }
    assert_eq!(
        c.get_strings(&["SORT", "fruit", "ALPHA"]).await,
        vec!["apple", "banana", "cherry"]
    );
    let msg = c.err(&["SORT", "fruit"]).await;
    assert!(msg.contains("double"), "got: {msg}");
}

#[tokio::test]
async fn sort_by_and_get_patterns() {
    let server = TestServer::start();
    let mut c = server.connect().await;

    for id in ["1", "2", "3"] {
        c.get_int(&["RPUSH", "ids", id]).await;
    }
    c.ok(&["SET", "weight_1", "30"]).await;
    c.ok(&["SET", "weight_2", "10"]).await;
    c.ok(&["SET", "weight_3", "20"]).await;
    c.ok(&["SET", "name_1", "one"]).await;
    c.ok(&["SET", "name_2", "two"]).await;
    c.ok(&["SET", "name_3", "three"]).await;

    assert_eq!(
        c.get_strings(&["SORT", "ids", "BY", "weight_*"]).await,
        vec!["2", "3", "1"]
    );
    assert_eq!(
        c.get_strings(&["SORT", "ids", "BY", "weight_*", "GET", "name_*", "GET", "#"])
            .await,
        vec!["two", "2", "three", "3", "one", "1"]
    );

    // BY without '*' skips sorting
    assert_eq!(
        c.get_strings(&["SORT", "ids", "BY", "nosort"]).await,
        vec!["1", "2", "3"]
    );
}

#[tokio::test]
async fn sort_store_writes_a_list() {
    let server = TestServer::start();
    let mut c = server.connect().await;

    for v in ["3", "1", "2"] {
        c.get_int(&["RPUSH", "src", v]).await;
    }
    assert_eq!(c.get_int(&["SORT", "src", "STORE", "dst"]).await, 3);
    assert_eq!(c.cmd(&["TYPE", "dst"]).await, Reply::Status("list".into()));
    assert_eq!(
        c.get_strings(&["LRANGE", "dst", "0", "-1"]).await,
        vec!["1", "2", "3"]
    );
}
