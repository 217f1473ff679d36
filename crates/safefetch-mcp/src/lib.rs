//! `safefetch` crate (library surface).
//!
//! The primary entrypoint is the `safefetch` binary (CLI + MCP stdio + download server).
//! The handlers live here so the MCP layer, the CLI and tests share one implementation.

pub use safefetch_core as core;

pub mod handlers;
pub mod http;
