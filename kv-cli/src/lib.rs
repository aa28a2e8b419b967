//! `kv-cli`. [Author fengyang]
//!
//! ## Getting started
//!
//! ```doc
//! ❯ ./kv-cli
//!
//! ██  ██  █        █
//! ██ ██   ██      ██
//! ███      ██    ██
//! ██ ██     ██  ██
//! ██  ██     ████  KV Storage CLI
//!
//! Welcome to kv-cli.
//! Connecting to http://127.0.0.1:8080.
//!
//! kvcli > create bucket orders
//! kvcli > set orders order_key xxx
//! kvcli > get orders order_key
//! kvcli > del orders order_key
//! kvcli > exit
//! ```

pub mod ast;
pub mod config;
pub mod rusty;
pub mod session;
pub mod show;
pub mod trace;
