//! Concrete [`crate::CompletionService`] adapters. Each is behind its own
//! Cargo feature so a caller who brings their own backend doesn't have to
//! pull in `async-openai` or `anthropic-sdk-rust` at all.

#[cfg(feature = "openai")]
pub mod openai;

#[cfg(feature = "anthropic")]
pub mod anthropic;
