//! Value paging: values swap to disk under memory pressure and come
//! back transparently.

use std::time::{Duration, Instant};

use crate::helpers::{Reply, ServerOptions, TestServer};

fn paged_server() -> TestServer {
    // a 1-byte budget forces everything resident to be swap-out
    // eligible on the next tick
    TestServer::start_with(ServerOptions {
        vm_max_memory: Some(1),
        ..Default::default()
    })
}

#[tokio::test]
async fn values_survive_being_swapped_out() {
    let server = paged_server();
    let mut c = server.connect().await;

    let big = "x".repeat(4000);
    for i in 0..10 {
        c.ok(&["SET", &format!("key:{i}"), &big]).await;
    }

    // give the swap-out cron a few ticks
    tokio::time::sleep(Duration::from_millis(800)).await;

    for i in 0..10 {
        assert_eq!(
            c.get_bulk(&["GET", &format!("key:{i}")]).await,
            Some(big.clone()),
            "key:{i} must read back after paging"
        );
    }
}

#[tokio::test]
async fn info_reports_swap_activity() {
    let server = paged_server();
    let mut c = server.connect().await;

    let big = "y".repeat(4000);
    for i in 0..10 {
        c.ok(&["SET", &format!("k{i}"), &big]).await;
    }

    // wait until at least one key is on disk
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let info = c.get_bulk(&["INFO"]).await.expect("INFO is a bulk reply");
        assert!(info.contains("vm_enabled:1"));
        let swapped: u64 = info
            .lines()
            .find_map(|line| line.strip_prefix("vm_swapped_keys:"))
            .and_then(|v| v.trim().parse().ok())
            .expect("vm_swapped_keys in INFO");
        if swapped > 0 {
            break;
        }
        if Instant::now() > deadline {
            panic!("no key was ever swapped out");
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

#[tokio::test]
async fn swapped_keys_can_be_deleted_and_overwritten() {
    let server = paged_server();
    let mut c = server.connect().await;

    let big = "z".repeat(4000);
    for i in 0..10 {
        c.ok(&["SET", &format!("k{i}"), &big]).await;
    }
    tokio::time::sleep(Duration::from_millis(800)).await;

    // deletion and overwrite must work whatever the storage state
    assert_eq!(c.get_int(&["DEL", "k0"]).await, 1);
    assert_eq!(c.cmd(&["GET", "k0"]).await, Reply::Nil);
    c.ok(&["SET", "k1", "small now"]).await;
    assert_eq!(c.get_bulk(&["GET", "k1"]).await, Some("small now".into()));
}

#[tokio::test]
async fn snapshot_includes_swapped_values() {
    let server = paged_server();
    let mut c = server.connect().await;

    let big = "s".repeat(4000);
    for i in 0..10 {
        c.ok(&["SET", &format!("k{i}"), &big]).await;
    }
    tokio::time::sleep(Duration::from_millis(800)).await;

    // the dump must contain the on-disk values too
    c.ok(&["DEBUG", "RELOAD"]).await;
    for i in 0..10 {
        assert_eq!(c.get_bulk(&["GET", &format!("k{i}")]).await, Some(big.clone()));
    }
}
