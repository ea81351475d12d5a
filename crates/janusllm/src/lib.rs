//! janusllm: translation between OpenAI-compatible chat-completion traffic
//! and backend-specific LLM APIs (OpenAI, Amazon Bedrock Converse).

pub mod apis;
pub mod schema;
pub mod translators;

// Re-export the types the service layer works with.
pub use schema::ApiSchema;
pub use translators::{
    HeaderFields, HeaderMutation, LlmTokenUsage, RequestTransform, ResponseBodyMode,
    ResponseTransform, Translator, TranslatorError,
};
