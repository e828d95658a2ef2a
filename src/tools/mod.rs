//! Tool-facing layer.
//!
//! - `router`: validates invocations and drives one operation per call
//! - `classify`: sqlparser-based statement classification
//! - `marshal`: normalized results to JSON envelopes
//! - `format`: optional table/markdown renderings

pub mod classify;
pub mod format;
pub mod marshal;
pub mod router;

pub use classify::{Classification, classify};
pub use format::OutputFormat;
pub use marshal::{DEFAULT_MAX_PAYLOAD_BYTES, ResponseEnvelope, ResultMarshaler, ResultPayload};
pub use router::{BackendSummary, RequestRouter, RetryPolicy, ToolCall, ToolInvocation};
