//! Snapshot and journal durability.

use crate::helpers::{Reply, ServerOptions, TestServer};

#[tokio::test]
async fn save_then_reload_round_trip() {
    let server = TestServer::start();
    let mut c = server.connect().await;

    c.ok(&["SET", "k1", "hello"]).await;
    for v in ["x", "y", "z"] {
        c.get_int(&["RPUSH", "k2", v]).await;
    }
    c.get_int(&["ZADD", "k3", "2.5", "m"]).await;
    c.get_int(&["SADD", "k4", "member"]).await;
    c.get_int(&["HSET", "k5", "f", "v"]).await;
    c.get_int(&["EXPIRE", "k1", "60"]).await;

    // DEBUG RELOAD = SAVE + flush + load from the snapshot
    c.ok(&["DEBUG", "RELOAD"]).await;

    assert_eq!(c.get_bulk(&["GET", "k1"]).await, Some("hello".into()));
    assert_eq!(c.get_strings(&["LRANGE", "k2", "0", "-1"]).await, vec!["x", "y", "z"]);
    assert_eq!(c.get_bulk(&["ZSCORE", "k3", "m"]).await, Some("2.5".into()));
    assert_eq!(c.get_int(&["SISMEMBER", "k4", "member"]).await, 1);
    assert_eq!(c.get_bulk(&["HGET", "k5", "f"]).await, Some("v".into()));

    let ttl = c.get_int(&["TTL", "k1"]).await;
    assert!((0..=60).contains(&ttl), "ttl must survive the dump, was {ttl}");
}

#[tokio::test]
async fn integer_strings_survive_the_dump() {
    let server = TestServer::start();
    let mut c = server.connect().await;

    // i8 / i16 / i32 sized and beyond
    for (key, value) in [("a", "7"), ("b", "-129"), ("c", "70000"), ("d", "3000000000")] {
        c.ok(&["SET", key, value]).await;
    }
    c.ok(&["DEBUG", "RELOAD"]).await;
    for (key, value) in [("a", "7"), ("b", "-129"), ("c", "70000"), ("d", "3000000000")] {
        assert_eq!(c.get_bulk(&["GET", key]).await, Some(value.into()));
    }
}

#[tokio::test]
async fn save_survives_a_restart() {
    let mut server = TestServer::start();
    let mut c = server.connect().await;

    c.ok(&["SET", "persistent", "value"]).await;
    c.ok(&["SELECT", "3"]).await;
    c.ok(&["SET", "other-db", "too"]).await;
    c.ok(&["SAVE"]).await;
    drop(c);

    server.restart();
    let mut c = server.connect().await;
    assert_eq!(c.get_bulk(&["GET", "persistent"]).await, Some("value".into()));
    c.ok(&["SELECT", "3"]).await;
    assert_eq!(c.get_bulk(&["GET", "other-db"]).await, Some("too".into()));
}

#[tokio::test]
async fn lastsave_advances_on_save() {
    let server = TestServer::start();
    let mut c = server.connect().await;

    let before = c.get_int(&["LASTSAVE"]).await;
    tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
    c.ok(&["SET", "k", "v"]).await;
    c.ok(&["SAVE"]).await;
    let after = c.get_int(&["LASTSAVE"]).await;
    assert!(after > before, "lastsave {before} -> {after}");
}

#[tokio::test]
async fn bgsave_reports_and_completes() {
    let server = TestServer::start();
    let mut c = server.connect().await;

    c.ok(&["SET", "k", "v"]).await;
    match c.cmd(&["BGSAVE"]).await {
        Reply::Status(s) => assert!(s.contains("Background saving started"), "got: {s}"),
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn journal_replays_after_restart() {
    let mut server = TestServer::start_with(ServerOptions {
        appendonly: true,
        ..Default::default()
    });
    let mut c = server.connect().await;

    c.ok(&["SET", "s", "value"]).await;
    c.get_int(&["RPUSH", "l", "a"]).await;
    c.get_int(&["RPUSH", "l", "b"]).await;
    c.get_int(&["INCR", "n"]).await;
    c.get_int(&["INCR", "n"]).await;
    c.ok(&["SELECT", "2"]).await;
    c.ok(&["SET", "db2", "x"]).await;
    drop(c);

    server.restart();
    let mut c = server.connect().await;
    assert_eq!(c.get_bulk(&["GET", "s"]).await, Some("value".into()));
    assert_eq!(c.get_strings(&["LRANGE", "l", "0", "-1"]).await, vec!["a", "b"]);
    assert_eq!(c.get_bulk(&["GET", "n"]).await, Some("2".into()));
    c.ok(&["SELECT", "2"]).await;
    assert_eq!(c.get_bulk(&["GET", "db2"]).await, Some("x".into()));
}

#[tokio::test]
async fn journal_records_deletions() {
    let mut server = TestServer::start_with(ServerOptions {
        appendonly: true,
        ..Default::default()
    });
    let mut c = server.connect().await;

    c.ok(&["SET", "keep", "1"]).await;
    c.ok(&["SET", "drop", "2"]).await;
    c.get_int(&["DEL", "drop"]).await;
    drop(c);

    server.restart();
    let mut c = server.connect().await;
    assert_eq!(c.get_bulk(&["GET", "keep"]).await, Some("1".into()));
    assert_eq!(c.cmd(&["GET", "drop"]).await, Reply::Nil);
}

#[tokio::test]
async fn rewrite_compacts_and_preserves_data() {
    let mut server = TestServer::start_with(ServerOptions {
        appendonly: true,
        ..Default::default()
    });
    let mut c = server.connect().await;

    // churn one counter so the journal holds far more commands than
    // keys, then rewrite
    for _ in 0..50 {
        c.get_int(&["INCR", "n"]).await;
    }
    c.get_int(&["RPUSH", "l", "a"]).await;
    match c.cmd(&["BGREWRITEAOF"]).await {
        Reply::Status(s) => assert!(s.contains("rewriting started"), "got: {s}"),
        other => panic!("unexpected {other:?}"),
    }
    // let the rewrite land, then keep writing
    tokio::time::sleep(std::time::Duration::from_millis(500)).await;
    c.get_int(&["INCR", "n"]).await;
    drop(c);

    server.restart();
    let mut c = server.connect().await;
    assert_eq!(c.get_bulk(&["GET", "n"]).await, Some("51".into()));
    assert_eq!(c.get_strings(&["LRANGE", "l", "0", "-1"]).await, vec!["a"]);
}

#[tokio::test]
async fn expire_replays_as_an_absolute_deadline() {
    let mut server = TestServer::start_with(ServerOptions {
        appendonly: true,
        ..Default::default()
    });
    let mut c = server.connect().await;

    c.ok(&["SET", "k", "v"]).await;
    c.get_int(&["EXPIRE", "k", "100"]).await;
    tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
    drop(c);

    server.restart();
    let mut c = server.connect().await;
    let ttl = c.get_int(&["TTL", "k"]).await;
    // replay must not reset the clock to a fresh 100 seconds
    assert!((1..=99).contains(&ttl), "ttl after replay was {ttl}");
}
