use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::section::Section;

/// A finite, ordered, non-restartable sequence of text fragments. Dropping
/// the receiver cancels the stream.
pub type TokenStream = tokio::sync::mpsc::Receiver<String>;

/// External text-generation capability consumed by the controller.
///
/// The controller treats every operation as fallible and degrades on failure;
/// implementations should not retry internally.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Judge what the clinician's latest turn means for the current section.
    /// May return one of the closed labels or free text; the controller
    /// performs its own tolerant mapping.
    async fn classify(&self, section: Section, text: &str) -> Result<String>;

    /// Single synchronous completion, used for opening prompts and follow-up
    /// questions.
    async fn generate_text(&self, prompt: &str, system_message: Option<&str>) -> Result<String>;

    /// Single synchronous completion expected to contain one structured
    /// payload (possibly wrapped in a fenced code block).
    async fn generate_structured(&self, prompt: &str, system_message: &str) -> Result<String>;

    /// Token-by-token generation. When `structured` is set the prompt asks
    /// for sentinel-delimited JSON objects; the fragments themselves are
    /// still raw text.
    async fn stream_tokens(
        &self,
        prompt: &str,
        system_message: Option<&str>,
        structured: bool,
    ) -> Result<TokenStream>;
}

/// One ranked literature passage returned by the knowledge base.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedPassage {
    pub document_id: String,
    pub title: String,
    pub article_id: String,
    pub similarity: f32,
    pub text: String,
    pub index: i32,
}

/// External literature retrieval capability, used only for the `doubts`
/// section's evidence-backed answers.
#[async_trait]
pub trait KnowledgeRetriever: Send + Sync {
    /// Ranked passages for a query, best match first. An empty result is not
    /// an error.
    async fn retrieve(&self, query: &str, limit: usize) -> Result<Vec<RetrievedPassage>>;
}
