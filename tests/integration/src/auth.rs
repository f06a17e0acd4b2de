//! AUTH / requirepass gating.

use crate::helpers::{Reply, ServerOptions, TestServer};

fn protected() -> TestServer {
    TestServer::start_with(ServerOptions {
        requirepass: Some("sekrit".into()),
        ..Default::default()
    })
}

#[tokio::test]
async fn commands_require_auth() {
    let server = protected();
    let mut c = server.connect().await;

    let msg = c.err(&["GET", "k"]).await;
    assert!(msg.contains("operation not permitted"), "got: {msg}");
    let msg = c.err(&["PING"]).await;
    assert!(msg.contains("operation not permitted"), "got: {msg}");
}

#[tokio::test]
async fn wrong_password_rejected() {
    let server = protected();
    let mut c = server.connect().await;

    let msg = c.err(&["AUTH", "nope"]).await;
    assert!(msg.contains("invalid password"), "got: {msg}");
    // still locked out
    let msg = c.err(&["GET", "k"]).await;
    assert!(msg.contains("operation not permitted"), "got: {msg}");
}

#[tokio::test]
async fn correct_password_unlocks_the_connection() {
    let server = protected();
    let mut c = server.connect().await;

    c.ok(&["AUTH", "sekrit"]).await;
    c.ok(&["SET", "k", "v"]).await;
    assert_eq!(c.get_bulk(&["GET", "k"]).await, Some("v".into()));
}

#[tokio::test]
async fn auth_is_per_connection() {
    let server = protected();
    let mut authed = server.connect().await;
    authed.ok(&["AUTH", "sekrit"]).await;
    authed.ok(&["SET", "k", "v"]).await;

    let mut fresh = server.connect().await;
    let msg = fresh.err(&["GET", "k"]).await;
    assert!(msg.contains("operation not permitted"), "got: {msg}");
}

#[tokio::test]
async fn auth_without_requirepass() {
    let server = TestServer::start();
    let mut c = server.connect().await;

    let msg = c.err(&["AUTH", "anything"]).await;
    assert!(msg.contains("no password is set"), "got: {msg}");
    assert_eq!(c.cmd(&["PING"]).await, Reply::Status("PONG".into()));
}
