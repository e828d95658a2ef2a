//! MCP server integration module.
//!
//! This module provides the integration between the MCP protocol and
//! the request router using the rmcp framework: tools, resources and
//! prompts.

pub mod prompts;
pub mod resources;
pub mod service;

pub use service::SqlService;
