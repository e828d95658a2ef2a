//! SQL Explorer MCP Library
//!
//! This library provides MCP (Model Context Protocol) tools for AI assistants
//! to run SQL against MySQL and PostgreSQL through pooled, time-bounded
//! connections. [`tools::RequestRouter`] is the transport-agnostic core;
//! [`mcp::SqlService`] adapts it to rmcp.

pub mod config;
pub mod db;
pub mod error;
pub mod mcp;
pub mod models;
pub mod tools;
pub mod transport;

pub use config::Config;
pub use error::{DbError, ErrorKind};
pub use mcp::SqlService;
pub use tools::RequestRouter;
