//! Retrieval-augmented answer construction for the `doubts` section.
//!
//! Passages come back from the knowledge base ranked but flat; here they are
//! grouped per source document, capped, and turned into a generation request
//! that speaks the sentinel-delimited answer protocol parsed by the framer.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::generate::RetrievedPassage;

/// Sentinel emitted by the generator after each complete JSON answer object.
pub const ANSWER_DELIMITER: &str = "<<END_ANSWER>>";

const MEDICAL_SYSTEM_MESSAGE: &str = "You are a medical AI assistant helping a doctor with their questions. \
Use the provided medical literature to give evidence-based answers. \
Be concise and factual. Cite your sources clearly.";

/// A literature source with its passages grouped, deduplicated by document id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedSource {
    pub id: String,
    pub title: String,
    pub article_id: String,
    pub similarity: f32,
    pub passages: Vec<Passage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Passage {
    pub text: String,
    pub index: i32,
}

/// Citation metadata kept for enriching streamed answer objects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceCitation {
    pub id: String,
    pub title: String,
    pub article_id: String,
}

/// Everything needed to run one streaming answer: the prompt, the stream
/// mode, and the id → citation map used by the framer.
#[derive(Debug, Clone)]
pub struct AnswerRequest {
    pub prompt: String,
    pub system_message: Option<String>,
    pub structured: bool,
    pub source_map: HashMap<String, SourceCitation>,
}

/// Group flat passages by source document, keeping at most `max_sources`
/// distinct sources in first-seen order. Passages for an already-admitted
/// source are appended even past the cap; a new source past the cap is
/// excluded regardless of its similarity.
pub fn group_sources(passages: Vec<RetrievedPassage>, max_sources: usize) -> Vec<RetrievedSource> {
    let mut sources: Vec<RetrievedSource> = Vec::new();
    for passage in passages {
        if let Some(existing) = sources.iter_mut().find(|s| s.id == passage.document_id) {
            existing.passages.push(Passage {
                text: passage.text,
                index: passage.index,
            });
        } else if sources.len() < max_sources {
            sources.push(RetrievedSource {
                id: passage.document_id,
                title: passage.title,
                article_id: passage.article_id,
                similarity: passage.similarity,
                passages: vec![Passage {
                    text: passage.text,
                    index: passage.index,
                }],
            });
        }
    }
    sources
}

/// Build the structured-mode generation request for a medical question.
///
/// Empty `sources` is not an error: the request degrades to an explicit
/// "nothing found" answer with an empty citation map.
pub fn build_medical_answer(
    question: &str,
    sources: &[RetrievedSource],
    delimiter: &str,
    max_objects: usize,
) -> AnswerRequest {
    let source_map: HashMap<String, SourceCitation> = sources
        .iter()
        .map(|s| {
            (
                s.id.clone(),
                SourceCitation {
                    id: s.id.clone(),
                    title: s.title.clone(),
                    article_id: s.article_id.clone(),
                },
            )
        })
        .collect();

    let prompt = if sources.is_empty() {
        format!(
            "Doctor's Question: {question}\n\n\
             No relevant information was found in the medical knowledge base.\n\n\
             Respond with exactly one JSON object of the form \
             {{\"answer\": \"No relevant information found in the medical knowledge base.\", \"sources\": []}} \
             followed immediately by the delimiter {delimiter}"
        )
    } else {
        let sources_text = sources
            .iter()
            .map(|s| {
                let passages = s
                    .passages
                    .iter()
                    .map(|p| format!("  [passage {}] {}", p.index, p.text))
                    .collect::<Vec<_>>()
                    .join("\n");
                format!("Source {} — {} (article {}):\n{}", s.id, s.title, s.article_id, passages)
            })
            .collect::<Vec<_>>()
            .join("\n\n");

        format!(
            "Doctor's Question: {question}\n\n\
             Search Results:\n{sources_text}\n\n\
             Answer strictly from the sources above.\n\
             Respond with up to {max_objects} JSON objects, each of the form \
             {{\"answer\": \"...\", \"sources\": [\"source id\", ...]}}.\n\
             Cite only the ids of sources you actually used, at most 3 per object.\n\
             Immediately after the closing brace of each JSON object, emit the delimiter {delimiter} \
             with no other text outside the JSON objects."
        )
    };

    AnswerRequest {
        prompt,
        system_message: Some(MEDICAL_SYSTEM_MESSAGE.to_string()),
        structured: true,
        source_map,
    }
}

/// Build the plain-text generation request for a general (non-literature)
/// question. No retrieval, no framing.
pub fn build_general_answer(question: &str) -> AnswerRequest {
    AnswerRequest {
        prompt: format!(
            "The doctor asked the following question during a medical consultation:\n\n{question}\n\n\
             Provide a concise, helpful answer."
        ),
        system_message: Some(
            "You are a medical AI assistant supporting a doctor during a consultation. \
             Be concise and factual."
                .to_string(),
        ),
        structured: false,
        source_map: HashMap::new(),
    }
}
