//! MULTI / EXEC / DISCARD.

use crate::helpers::{Reply, TestServer};

#[tokio::test]
async fn exec_replies_with_each_sub_reply() {
    let server = TestServer::start();
    let mut c = server.connect().await;

    c.ok(&["MULTI"]).await;
    assert_eq!(c.cmd(&["SET", "a", "1"]).await, Reply::Status("QUEUED".into()));
    assert_eq!(c.cmd(&["INCR", "a"]).await, Reply::Status("QUEUED".into()));
    assert_eq!(
        c.cmd(&["EXEC"]).await,
        Reply::Multi(vec![Reply::Status("OK".into()), Reply::Integer(2)])
    );
    assert_eq!(c.get_bulk(&["GET", "a"]).await, Some("2".into()));
}

#[tokio::test]
async fn queued_commands_do_not_execute_early() {
    let server = TestServer::start();
    let mut c = server.connect().await;
    let mut observer = server.connect().await;

    c.ok(&["MULTI"]).await;
    c.cmd(&["SET", "k", "v"]).await;
    assert_eq!(observer.cmd(&["GET", "k"]).await, Reply::Nil);
    c.cmd(&["EXEC"]).await;
    assert_eq!(observer.get_bulk(&["GET", "k"]).await, Some("v".into()));
}

#[tokio::test]
async fn discard_drops_the_queue() {
    let server = TestServer::start();
    let mut c = server.connect().await;

    c.ok(&["MULTI"]).await;
    c.cmd(&["SET", "k", "v"]).await;
    c.ok(&["DISCARD"]).await;
    assert_eq!(c.cmd(&["GET", "k"]).await, Reply::Nil);
}

#[tokio::test]
async fn exec_without_multi() {
    let server = TestServer::start();
    let mut c = server.connect().await;

    let msg = c.err(&["EXEC"]).await;
    assert!(msg.contains("EXEC without MULTI"), "got: {msg}");
    let msg = c.err(&["DISCARD"]).await;
    assert!(msg.contains("DISCARD without MULTI"), "got: {msg}");
}

#[tokio::test]
async fn nested_multi_is_rejected() {
    let server = TestServer::start();
    let mut c = server.connect().await;

    c.ok(&["MULTI"]).await;
    let msg = c.err(&["MULTI"]).await;
    assert!(msg.contains("nested"), "got: {msg}");
    c.cmd(&["DISCARD"]).await;
}

#[tokio::test]
async fn errors_inside_exec_do_not_abort_the_rest() {
    let server = TestServer::start();
    let mut c = server.connect().await;

    c.ok(&["SET", "s", "text"]).await;
    c.ok(&["MULTI"]).await;
    c.cmd(&["INCR", "s"]).await; // will fail at execution
    c.cmd(&["SET", "after", "yes"]).await;
    let replies = match c.cmd(&["EXEC"]).await {
        Reply::Multi(replies) => replies,
        other => panic!("unexpected {other:?}"),
    };
    assert!(matches!(&replies[0], Reply::Error(_)));
    assert_eq!(replies[1], Reply::Status("OK".into()));
    assert_eq!(c.get_bulk(&["GET", "after"]).await, Some("yes".into()));
}

#[tokio::test]
async fn blocking_pop_degrades_inside_exec() {
    let server = TestServer::start();
    let mut c = server.connect().await;

    c.ok(&["MULTI"]).await;
    c.cmd(&["BLPOP", "nolist", "5"]).await;
    assert_eq!(
        c.cmd(&["EXEC"]).await,
        Reply::Multi(vec![Reply::NilMulti]),
        "a queued BLPOP cannot block"
    );
}
