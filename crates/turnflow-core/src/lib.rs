//! Protocol traits and data model shared by every `turnflow-*` crate:
//! typed ids, the cache/store/LLM capability traits, the config-time and
//! session-time data model, and the external turn contract.
//!
//! Implementation crates depend on this one; this crate depends on none
//! of them.

#![deny(missing_docs)]

pub mod cache;
pub mod config;
pub mod duration;
pub mod error;
pub mod id;
pub mod llm;
pub mod session;
pub mod state;
pub mod turn;

pub use cache::{Cache, get_or_compute};
pub use duration::DurationMs;
pub use llm::{ChatMessage, CompletionRequest, CompletionResponse, LlmClient};
pub use state::SessionStore;
