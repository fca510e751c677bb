//! Persisted chat: message reconciliation, generation, resumable delivery
//! and per-user entitlements.

pub mod constants;
pub mod conversions;
pub mod delivery;
pub mod entitlements;
pub mod errors;
pub mod events;
pub mod generation;
pub mod handlers;
pub mod prompts;
pub mod reconciler;
pub mod storage;
pub mod tools;
pub mod types;

pub use errors::error_mapping;
pub use handlers::router;
