//! Wire-framing tests: inline commands, trailing bulk payloads,
//! pipelining, protocol errors.

use crate::helpers::{Reply, TestServer};

#[tokio::test]
async fn inline_command() {
    let server = TestServer::start();
    let mut c = server.connect().await;

    c.send_raw(b"PING\r\n").await;
    assert_eq!(c.read_reply().await, Reply::Status("PONG".into()));
}

#[tokio::test]
async fn inline_with_bare_newline() {
    let server = TestServer::start();
    let mut c = server.connect().await;

    c.send_raw(b"PING\n").await;
    assert_eq!(c.read_reply().await, Reply::Status("PONG".into()));
}

#[tokio::test]
async fn inline_set_with_trailing_bulk() {
    let server = TestServer::start();
    let mut c = server.connect().await;

    // old-style bulk command: the last token is the payload length
    c.send_raw(b"SET foo 3\r\nbar\r\n").await;
    assert_eq!(c.read_reply().await, Reply::Status("OK".into()));
    assert_eq!(c.get_bulk(&["GET", "foo"]).await, Some("bar".into()));
}

#[tokio::test]
async fn trailing_bulk_split_across_writes() {
    let server = TestServer::start();
    let mut c = server.connect().await;

    // line first, payload later — the exact-fit and split cases must
    // both work
    c.send_raw(b"SET split 5\r\n").await;
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    c.send_raw(b"hel").await;
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    c.send_raw(b"lo\r\n").await;
    assert_eq!(c.read_reply().await, Reply::Status("OK".into()));
    assert_eq!(c.get_bulk(&["GET", "split"]).await, Some("hello".into()));
}

#[tokio::test]
async fn trailing_bulk_binary_payload() {
    let server = TestServer::start();
    let mut c = server.connect().await;

    c.send_raw(b"SET bin 4\r\na\r\nb\r\n").await;
    assert_eq!(c.read_reply().await, Reply::Status("OK".into()));
    match c.cmd(&["GET", "bin"]).await {
        Reply::Bulk(data) => assert_eq!(data, b"a\r\nb"),
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn invalid_trailing_bulk_count() {
    let server = TestServer::start();
    let mut c = server.connect().await;

    c.send_raw(b"SET foo bar\r\n").await;
    match c.read_reply().await {
        Reply::Error(msg) => assert!(msg.contains("bulk"), "got: {msg}"),
        other => panic!("unexpected {other:?}"),
    }
    // connection survives the error
    assert_eq!(c.cmd(&["PING"]).await, Reply::Status("PONG".into()));
}

#[tokio::test]
async fn multibulk_binary_safe() {
    let server = TestServer::start();
    let mut c = server.connect().await;

    c.send_raw(b"*3\r\n$3\r\nSET\r\n$3\r\nkey\r\n$5\r\nv\x00\x01\r\x02\r\n")
        .await;
    assert_eq!(c.read_reply().await, Reply::Status("OK".into()));
    match c.cmd(&["GET", "key"]).await {
        Reply::Bulk(data) => assert_eq!(data, b"v\x00\x01\r\x02"),
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn negative_bulk_length_keeps_connection() {
    let server = TestServer::start();
    let mut c = server.connect().await;

    c.send_raw(b"*1\r\n$-3\r\n").await;
    match c.read_reply().await {
        Reply::Error(_) => {}
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(c.cmd(&["PING"]).await, Reply::Status("PONG".into()));
}

#[tokio::test]
async fn pipelined_commands_reply_in_order() {
    let server = TestServer::start();
    let mut c = server.connect().await;

    c.send_raw(b"*3\r\n$3\r\nSET\r\n$1\r\na\r\n$1\r\n1\r\nPING\r\n*2\r\n$3\r\nGET\r\n$1\r\na\r\n")
        .await;
    assert_eq!(c.read_reply().await, Reply::Status("OK".into()));
    assert_eq!(c.read_reply().await, Reply::Status("PONG".into()));
    assert_eq!(c.read_reply().await, Reply::Bulk(b"1".to_vec()));
}

#[tokio::test]
async fn unknown_command() {
    let server = TestServer::start();
    let mut c = server.connect().await;

    let msg = c.err(&["FROB", "x"]).await;
    assert!(msg.contains("unknown command"), "got: {msg}");
}

#[tokio::test]
async fn wrong_arity() {
    let server = TestServer::start();
    let mut c = server.connect().await;

    let msg = c.err(&["GET"]).await;
    assert!(msg.contains("wrong number of arguments"), "got: {msg}");
}
