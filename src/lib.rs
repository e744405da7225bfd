//! Relay: a streaming agent runtime.
//!
//! A [`runtime::SessionRuntime`] drives one conversation: it streams model
//! calls, runs the requested tools behind a permission gate and lifecycle
//! hooks, keeps history inside a token budget and optionally mirrors it to a
//! segmented on-disk log.
//!
//! # Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use relay::api::HttpModelClient;
//! use relay::config::load_config;
//! use relay::runtime::SessionRuntime;
//! use relay::tools::{clock::ClockTool, ToolRegistry};
//!
//! # async fn example() {
//! let loaded = load_config(None).unwrap();
//! let client = Arc::new(HttpModelClient::new(&loaded.config.api));
//! let mut tools = ToolRegistry::new();
//! tools.register(ClockTool).unwrap();
//! let mut runtime = SessionRuntime::new(&loaded.config, client, tools);
//! let (events, _rx) = tokio::sync::mpsc::unbounded_channel();
//! let summary = runtime.run("What time is it?", &events).await.unwrap();
//! println!("{:?}", summary.answer);
//! # }
//! ```

pub mod api;
pub mod config;
pub mod context;
pub mod error;
pub mod hooks;
pub mod permission;
pub mod runtime;
pub mod stream;
#[cfg(test)]
pub mod testsupport;
pub mod tokens;
pub mod tools;
pub mod types;
pub mod wal;
