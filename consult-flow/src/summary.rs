//! Format-aware section summarization.
//!
//! The generation adapter is asked for a JSON payload matching the section's
//! presentation format. Whatever comes back — fenced, malformed or missing —
//! this module always produces a structurally valid `SectionSummary`.

use tracing::warn;

use crate::generate::TextGenerator;
use crate::message::{ChatMessage, MessageSender, SectionSummary};
use crate::section::{Section, SectionFormat};

const LIST_SYSTEM_PROMPT: &str = "You are a medical AI assistant that helps organize medical consultation notes. \
Based on the conversation about the {section} section, create a {style} of key points. \
Return ONLY a JSON with the format: {\"format\": \"{format}\", \"items\": [\"point 1\", \"point 2\", ...]}";

const PARAGRAPH_SYSTEM_PROMPT: &str = "You are a medical AI assistant that helps organize medical consultation notes. \
Based on the conversation about the {section} section, create a concise paragraph summary. \
Return ONLY a JSON with the format: {\"format\": \"paragraph\", \"content\": \"Your paragraph text here\"}";

/// Summarize a section's conversation into its required structured format.
///
/// Never fails: generation or parse problems degrade to the heuristic
/// fallback so a valid summary is always stored.
pub async fn summarize_section(
    generator: &dyn TextGenerator,
    section: Section,
    messages: &[ChatMessage],
) -> SectionSummary {
    let format = section.format();
    let conversation = conversation_text(messages);
    let prompt = format!(
        "Here is the conversation about the {section} section:\n\n{conversation}\n\n\
         Please summarize this information according to the required format."
    );

    let raw = match generator
        .generate_structured(&prompt, &system_prompt(section, format))
        .await
    {
        Ok(raw) => raw,
        Err(e) => {
            warn!(section = %section, error = %e, "summary generation failed, using conversation fallback");
            // Fall back over the provider's own lines so the stored record
            // still carries the clinician's input.
            let provider_lines = messages
                .iter()
                .filter(|m| m.sender == MessageSender::Provider)
                .map(|m| m.content.text().to_string())
                .collect::<Vec<_>>()
                .join("\n");
            return fallback_summary(format, &provider_lines);
        }
    };

    let payload = extract_payload(&raw);
    match serde_json::from_str::<SectionSummary>(payload) {
        Ok(summary) => summary,
        Err(e) => {
            warn!(section = %section, error = %e, "summary payload malformed, applying heuristic fallback");
            fallback_summary(format, &raw)
        }
    }
}

fn system_prompt(section: Section, format: SectionFormat) -> String {
    match format {
        SectionFormat::Paragraph => PARAGRAPH_SYSTEM_PROMPT.replace("{section}", section.as_str()),
        SectionFormat::NumberedList => LIST_SYSTEM_PROMPT
            .replace("{section}", section.as_str())
            .replace("{style}", "numbered list")
            .replace("{format}", format.as_str()),
        SectionFormat::BulletList => LIST_SYSTEM_PROMPT
            .replace("{section}", section.as_str())
            .replace("{style}", "bulleted list")
            .replace("{format}", format.as_str()),
    }
}

fn conversation_text(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .map(|m| match m.sender {
            MessageSender::Provider => format!("Doctor: {}", m.content.text()),
            MessageSender::Ai => format!("AI: {}", m.content.text()),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Strip a fenced code block wrapper, if any, and return the inner payload.
fn extract_payload(raw: &str) -> &str {
    if let Some(start) = raw.find("```json") {
        let rest = &raw[start + "```json".len()..];
        match rest.find("```") {
            Some(end) => rest[..end].trim(),
            None => rest.trim(),
        }
    } else if let Some(start) = raw.find("```") {
        let rest = &raw[start + "```".len()..];
        match rest.find("```") {
            Some(end) => rest[..end].trim(),
            None => rest.trim(),
        }
    } else {
        raw.trim()
    }
}

/// Heuristic fallback for malformed summary payloads: wrap paragraphs
/// verbatim, split list formats into markup-stripped lines.
fn fallback_summary(format: SectionFormat, raw: &str) -> SectionSummary {
    match format {
        SectionFormat::Paragraph => SectionSummary::Paragraph {
            content: raw.trim().to_string(),
        },
        list => {
            let items: Vec<String> = raw
                .lines()
                .map(strip_list_markup)
                .filter(|line| !line.is_empty())
                .map(str::to_string)
                .collect();
            match list {
                SectionFormat::NumberedList => SectionSummary::NumberedList { items },
                _ => SectionSummary::BulletList { items },
            }
        }
    }
}

fn strip_list_markup(line: &str) -> &str {
    line.trim()
        .trim_start_matches(|c: char| {
            c.is_ascii_digit() || matches!(c, '*' | '-' | '•' | '.' | ')' | ' ')
        })
        .trim()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{FlowError, Result};
    use crate::generate::TokenStream;
    use async_trait::async_trait;

    struct CannedGenerator {
        structured: Result<String>,
    }

    #[async_trait]
    impl TextGenerator for CannedGenerator {
        async fn classify(&self, _section: Section, _text: &str) -> Result<String> {
            unimplemented!("not used by summarization")
        }

        async fn generate_text(&self, _prompt: &str, _system: Option<&str>) -> Result<String> {
            unimplemented!("not used by summarization")
        }

        async fn generate_structured(&self, _prompt: &str, _system: &str) -> Result<String> {
            match &self.structured {
                Ok(text) => Ok(text.clone()),
                Err(_) => Err(FlowError::Generation("unavailable".to_string())),
            }
        }

        async fn stream_tokens(
            &self,
            _prompt: &str,
            _system: Option<&str>,
            _structured: bool,
        ) -> Result<TokenStream> {
            unimplemented!("not used by summarization")
        }
    }

    fn history_messages() -> Vec<ChatMessage> {
        vec![
            ChatMessage::ai("s1", Section::History, "What is the history of the present illness?"),
            ChatMessage::provider("s1", Section::History, "Three days of fever and cough."),
        ]
    }

    #[tokio::test]
    async fn parses_valid_payload() {
        let generator = CannedGenerator {
            structured: Ok(r#"{"format":"paragraph","content":"Three days of fever and cough."}"#
                .to_string()),
        };
        let summary = summarize_section(&generator, Section::History, &history_messages()).await;
        assert_eq!(
            summary,
            SectionSummary::Paragraph {
                content: "Three days of fever and cough.".to_string()
            }
        );
    }

    #[tokio::test]
    async fn strips_fenced_code_blocks_before_parsing() {
        let generator = CannedGenerator {
            structured: Ok(
                "```json\n{\"format\":\"numbered_list\",\"items\":[\"fever\",\"cough\"]}\n```"
                    .to_string(),
            ),
        };
        let summary = summarize_section(&generator, Section::Plan, &history_messages()).await;
        assert_eq!(
            summary,
            SectionSummary::NumberedList {
                items: vec!["fever".to_string(), "cough".to_string()]
            }
        );
    }

    #[tokio::test]
    async fn malformed_list_payload_falls_back_to_stripped_lines() {
        let generator = CannedGenerator {
            structured: Ok("- BP 120/80\n* HR 72 bpm\n1. Temp 38.2C\n\n".to_string()),
        };
        let summary = summarize_section(&generator, Section::VitalSigns, &history_messages()).await;
        assert_eq!(
            summary,
            SectionSummary::BulletList {
                items: vec![
                    "BP 120/80".to_string(),
                    "HR 72 bpm".to_string(),
                    "Temp 38.2C".to_string(),
                ]
            }
        );
    }

    #[tokio::test]
    async fn malformed_paragraph_payload_wraps_raw_text() {
        let generator = CannedGenerator {
            structured: Ok("not json at all".to_string()),
        };
        let summary = summarize_section(&generator, Section::Notes, &history_messages()).await;
        assert_eq!(
            summary,
            SectionSummary::Paragraph {
                content: "not json at all".to_string()
            }
        );
    }

    #[tokio::test]
    async fn generation_failure_falls_back_to_provider_lines() {
        let generator = CannedGenerator {
            structured: Err(FlowError::Generation("boom".to_string())),
        };
        let summary = summarize_section(&generator, Section::History, &history_messages()).await;
        assert_eq!(
            summary,
            SectionSummary::Paragraph {
                content: "Three days of fever and cough.".to_string()
            }
        );
    }
}
