//! OpenRouter-backed `TextGenerator`.
//!
//! Every call builds a fresh agent with the right preamble for its job. The
//! streaming path runs the completion to the end and re-emits it in small
//! word-boundary fragments, so downstream consumers exercise the same
//! incremental handling they would against a token-level provider.

use anyhow::Result;
use async_trait::async_trait;
use rig::client::CompletionClient;
use rig::completion::Prompt;
use rig::providers::openrouter;
use tracing::debug;

use consult_flow::{FlowError, Section, TextGenerator, TokenStream};

const DEFAULT_MODEL: &str = "openai/gpt-4o-mini";

/// Fragment size for the re-emitted streaming completion.
const FRAGMENT_CHARS: usize = 64;

const CLASSIFY_PREAMBLE: &str = "You are classifying a doctor's message within a medical \
consultation. Respond with exactly one of these labels and nothing else:\n\
SECTION_COMPLETE - the doctor has finished documenting the current section and wants to move on\n\
MEDICAL_QUESTION - the doctor is asking a clinical question that should be answered from medical literature\n\
GENERAL_QUESTION - the doctor is asking a general, non-clinical question\n\
NEEDS_FOLLOWUP - the doctor provided information but the section is not complete yet";

const STRUCTURED_STREAM_PREAMBLE: &str = "You are a helpful medical assistant. Follow the output \
format instructions in the prompt exactly, emitting only the requested JSON objects and delimiters.";

pub struct OpenRouterGenerator {
    api_key: String,
    model: String,
}

impl OpenRouterGenerator {
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("OPENROUTER_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENROUTER_API_KEY not set"))?;
        let model = std::env::var("LLM_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());
        Ok(Self { api_key, model })
    }

    fn agent(&self, preamble: &str) -> rig::agent::Agent<openrouter::CompletionModel> {
        let client = openrouter::Client::new(&self.api_key);
        client.agent(&self.model).preamble(preamble).build()
    }

    async fn complete(&self, preamble: &str, prompt: &str) -> consult_flow::Result<String> {
        self.agent(preamble)
            .prompt(prompt)
            .await
            .map_err(|e| FlowError::Generation(e.to_string()))
    }
}

/// Split a completion into fragments of roughly `max_chars`, breaking only at
/// whitespace so words never straddle a fragment boundary.
fn into_fragments(text: &str, max_chars: usize) -> Vec<String> {
    let mut fragments = Vec::new();
    let mut current = String::new();
    for word in text.split_inclusive(char::is_whitespace) {
        if !current.is_empty() && current.len() + word.len() > max_chars {
            fragments.push(std::mem::take(&mut current));
        }
        current.push_str(word);
    }
    if !current.is_empty() {
        fragments.push(current);
    }
    fragments
}

#[async_trait]
impl TextGenerator for OpenRouterGenerator {
    async fn classify(&self, section: Section, text: &str) -> consult_flow::Result<String> {
        let prompt = format!(
            "Current section: {} ({})\n\nDoctor's message:\n{}",
            section,
            section.description(),
            text
        );
        let label = self.complete(CLASSIFY_PREAMBLE, &prompt).await?;
        debug!(%section, %label, "Classified doctor message");
        Ok(label)
    }

    async fn generate_text(
        &self,
        prompt: &str,
        system_message: Option<&str>,
    ) -> consult_flow::Result<String> {
        let preamble = system_message.unwrap_or("You are a helpful medical assistant.");
        self.complete(preamble, prompt).await
    }

    async fn generate_structured(
        &self,
        prompt: &str,
        system_message: &str,
    ) -> consult_flow::Result<String> {
        self.complete(system_message, prompt).await
    }

    async fn stream_tokens(
        &self,
        prompt: &str,
        system_message: Option<&str>,
        structured: bool,
    ) -> consult_flow::Result<TokenStream> {
        let preamble = match system_message {
            Some(message) => message,
            None if structured => STRUCTURED_STREAM_PREAMBLE,
            None => "You are a helpful medical assistant.",
        };
        let completion = self.complete(preamble, prompt).await?;

        let (tx, rx) = tokio::sync::mpsc::channel(32);
        tokio::spawn(async move {
            for fragment in into_fragments(&completion, FRAGMENT_CHARS) {
                // Receiver dropped means the client went away; stop emitting.
                if tx.send(fragment).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fragments_break_at_whitespace() {
        let text = "alpha beta gamma delta epsilon zeta";
        let fragments = into_fragments(text, 12);
        assert!(fragments.len() > 1);
        assert_eq!(fragments.concat(), text);
        for fragment in &fragments {
            assert!(fragment.ends_with(char::is_whitespace) || text.ends_with(fragment.as_str()));
        }
    }

    #[test]
    fn single_long_word_is_one_fragment() {
        let text = "supercalifragilisticexpialidocious";
        assert_eq!(into_fragments(text, 8), vec![text.to_string()]);
    }

    #[test]
    fn empty_text_yields_no_fragments() {
        assert!(into_fragments("", 64).is_empty());
    }
}
