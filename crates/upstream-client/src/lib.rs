//! Upstream Client (C6): talks to the code-assist backend.
//!
//! Builds the envelope, sends the request, classifies failures (capacity
//! exhaustion vs. auth vs. generic), and decodes streamed responses into
//! unwrapped events. Knows nothing about accounts, tokens, or pools beyond
//! the `ForceRefresh` hook it's handed per call.

pub mod client;
pub mod envelope;
pub mod error;

pub use client::{DroppedChunkHook, ForceRefresh, StreamChunk, UpstreamClient};
pub use envelope::{IMAGE_GEN_MODEL, build_envelope, extract_usage_metadata, unwrap_response};
pub use error::{Error, Result};
