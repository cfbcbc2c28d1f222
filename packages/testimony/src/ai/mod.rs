//! Reasoner implementations backed by hosted language models.
//!
//! - `OpenAiReasoner` - chat completions with JSON replies (requires `openai` feature)
//!
//! Prompts and reply parsing are shared through [`crate::pipeline::prompts`].

#[cfg(feature = "openai")]
pub mod openai;

#[cfg(feature = "openai")]
pub use openai::OpenAiReasoner;
