//! LLM integration: the structured-generation collaborator.
//!
//! Every stage that talks to a language model holds an
//! `Arc<dyn LlmProvider>` handed to it at construction time. There is no
//! process-wide client or template registry, so two pipelines built with
//! different providers never observe each other's configuration.
//!
//! ```ignore
//! use std::sync::Arc;
//! use autodev::llm::{LiteLlmClient, LlmProvider};
//!
//! let client: Arc<dyn LlmProvider> = Arc::new(LiteLlmClient::from_env()?);
//! ```

pub mod litellm;

pub use litellm::{
    Choice, GenerationRequest, GenerationResponse, LiteLlmClient, LlmProvider, Message, Usage,
    DEFAULT_API_BASE, DEFAULT_MODEL,
};
