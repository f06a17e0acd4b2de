//! Integration test harness; the suites live in the modules below.

mod helpers;

mod auth;
mod basic_operations;
mod blocking;
mod data_types;
mod expiry;
mod paging;
mod persistence;
mod protocol;
mod transactions;

fn main() {
    // tests only; run with `cargo test`
}
