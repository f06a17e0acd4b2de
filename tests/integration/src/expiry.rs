//! Expiration semantics.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::helpers::{Reply, TestServer};

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64
}

#[tokio::test]
async fn expire_sets_a_ttl() {
    let server = TestServer::start();
    let mut c = server.connect().await;

    c.ok(&["SET", "k", "v"]).await;
    assert_eq!(c.get_int(&["TTL", "k"]).await, -1);
    assert_eq!(c.get_int(&["EXPIRE", "k", "60"]).await, 1);
    let ttl = c.get_int(&["TTL", "k"]).await;
    assert!((58..=60).contains(&ttl), "ttl was {ttl}");
}

#[tokio::test]
async fn expire_missing_key() {
    let server = TestServer::start();
    let mut c = server.connect().await;
    assert_eq!(c.get_int(&["EXPIRE", "ghost", "60"]).await, 0);
}

#[tokio::test]
async fn existing_ttl_cannot_be_overwritten() {
    let server = TestServer::start();
    let mut c = server.connect().await;

    c.ok(&["SET", "k", "v"]).await;
    assert_eq!(c.get_int(&["EXPIRE", "k", "100"]).await, 1);
    assert_eq!(c.get_int(&["EXPIRE", "k", "5"]).await, 0);
    let ttl = c.get_int(&["TTL", "k"]).await;
    assert!(ttl > 50, "ttl must keep the first deadline, was {ttl}");
}

#[tokio::test]
async fn expireat_round_trip() {
    let server = TestServer::start();
    let mut c = server.connect().await;

    c.ok(&["SET", "k", "v"]).await;
    let deadline = unix_now() + 60;
    assert_eq!(c.get_int(&["EXPIREAT", "k", &deadline.to_string()]).await, 1);
    let ttl = c.get_int(&["TTL", "k"]).await;
    assert!((58..=60).contains(&ttl), "ttl was {ttl}");
}

#[tokio::test]
async fn past_expireat_deletes_the_key() {
    let server = TestServer::start();
    let mut c = server.connect().await;

    c.ok(&["SET", "k", "v"]).await;
    assert_eq!(c.get_int(&["EXPIREAT", "k", "1"]).await, 1);
    assert_eq!(c.get_int(&["EXISTS", "k"]).await, 0);
}

#[tokio::test]
async fn expired_key_reads_as_absent() {
    let server = TestServer::start();
    let mut c = server.connect().await;

    c.ok(&["SET", "k", "v"]).await;
    assert_eq!(c.get_int(&["EXPIRE", "k", "1"]).await, 1);
    tokio::time::sleep(Duration::from_millis(1300)).await;
    assert_eq!(c.cmd(&["GET", "k"]).await, Reply::Nil);
    assert_eq!(c.get_int(&["EXISTS", "k"]).await, 0);
    assert_eq!(c.get_int(&["TTL", "k"]).await, -1);
}

#[tokio::test]
async fn set_clears_ttl() {
    let server = TestServer::start();
    let mut c = server.connect().await;

    c.ok(&["SET", "k", "v"]).await;
    c.get_int(&["EXPIRE", "k", "60"]).await;
    c.ok(&["SET", "k", "w"]).await;
    assert_eq!(c.get_int(&["TTL", "k"]).await, -1);
}

#[tokio::test]
async fn incr_keeps_ttl() {
    let server = TestServer::start();
    let mut c = server.connect().await;

    c.ok(&["SET", "n", "1"]).await;
    c.get_int(&["EXPIRE", "n", "60"]).await;
    c.get_int(&["INCR", "n"]).await;
    let ttl = c.get_int(&["TTL", "n"]).await;
    assert!(ttl > 0, "read-modify-write must keep the ttl, got {ttl}");
}
