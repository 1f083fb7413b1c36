//! Wire types and the HTTP transport for the chat completions endpoint.

pub mod llm;
pub mod message;
pub mod sse;
