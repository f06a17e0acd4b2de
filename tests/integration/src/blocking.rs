//! Blocking list pops.

use std::time::Duration;

use crate::helpers::{Reply, TestServer};

#[tokio::test]
async fn blpop_returns_immediately_when_data_exists() {
    let server = TestServer::start();
    let mut c = server.connect().await;

    c.get_int(&["RPUSH", "l", "ready"]).await;
    assert_eq!(
        c.cmd(&["BLPOP", "l", "5"]).await,
        Reply::Multi(vec![
            Reply::Bulk(b"l".to_vec()),
            Reply::Bulk(b"ready".to_vec())
        ])
    );
    assert_eq!(c.get_int(&["EXISTS", "l"]).await, 0);
}

#[tokio::test]
async fn push_wakes_a_parked_blpop() {
    let server = TestServer::start();
    let mut waiter = server.connect().await;
    let mut pusher = server.connect().await;

    waiter.send(&["BLPOP", "mylist", "5"]).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    // the pushed element goes straight to the waiter
    assert_eq!(pusher.get_int(&["RPUSH", "mylist", "hello"]).await, 1);
    assert_eq!(
        waiter.read_reply().await,
        Reply::Multi(vec![
            Reply::Bulk(b"mylist".to_vec()),
            Reply::Bulk(b"hello".to_vec())
        ])
    );
    // ...so it never lands in the list
    assert_eq!(pusher.get_int(&["LLEN", "mylist"]).await, 0);
}

#[tokio::test]
async fn brpop_takes_from_the_tail() {
    let server = TestServer::start();
    let mut c = server.connect().await;

    for v in ["a", "b"] {
        c.get_int(&["RPUSH", "l", v]).await;
    }
    assert_eq!(
        c.cmd(&["BRPOP", "l", "1"]).await,
        Reply::Multi(vec![Reply::Bulk(b"l".to_vec()), Reply::Bulk(b"b".to_vec())])
    );
}

#[tokio::test]
async fn blpop_times_out_with_nil() {
    let server = TestServer::start();
    let mut c = server.connect().await;

    let start = std::time::Instant::now();
    assert_eq!(c.cmd(&["BLPOP", "empty", "1"]).await, Reply::NilMulti);
    let waited = start.elapsed();
    assert!(waited >= Duration::from_millis(900), "returned after {waited:?}");
    assert!(waited < Duration::from_secs(3), "deadline overshot: {waited:?}");
}

#[tokio::test]
async fn blpop_scans_keys_in_order() {
    let server = TestServer::start();
    let mut c = server.connect().await;

    c.get_int(&["RPUSH", "second", "two"]).await;
    assert_eq!(
        c.cmd(&["BLPOP", "first", "second", "1"]).await,
        Reply::Multi(vec![
            Reply::Bulk(b"second".to_vec()),
            Reply::Bulk(b"two".to_vec())
        ])
    );
}

#[tokio::test]
async fn oldest_waiter_wins() {
    let server = TestServer::start();
    let mut first = server.connect().await;
    let mut second = server.connect().await;
    let mut pusher = server.connect().await;

    first.send(&["BLPOP", "q", "5"]).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    second.send(&["BLPOP", "q", "5"]).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    pusher.get_int(&["RPUSH", "q", "one"]).await;
    assert_eq!(
        first.read_reply().await,
        Reply::Multi(vec![Reply::Bulk(b"q".to_vec()), Reply::Bulk(b"one".to_vec())])
    );

    pusher.get_int(&["RPUSH", "q", "two"]).await;
    assert_eq!(
        second.read_reply().await,
        Reply::Multi(vec![Reply::Bulk(b"q".to_vec()), Reply::Bulk(b"two".to_vec())])
    );
}

#[tokio::test]
async fn unblocked_client_keeps_working() {
    let server = TestServer::start();
    let mut c = server.connect().await;

    assert_eq!(c.cmd(&["BLPOP", "none", "1"]).await, Reply::NilMulti);
    // the connection parses and serves normally afterwards
    c.ok(&["SET", "k", "v"]).await;
    assert_eq!(c.get_bulk(&["GET", "k"]).await, Some("v".into()));
}
