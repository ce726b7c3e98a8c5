//! Parser for the sentinel-delimited answer stream.
//!
//! The generator is instructed to emit `jsonObject delimiter jsonObject
//! delimiter ... incompleteTail` over a plain text channel. The framer turns
//! that unreliable stream into discrete validated events: push fragments in,
//! get complete objects out, and flush the tail once at end of stream. One
//! framer instance per answer; no state survives across answers.

use serde_json::Value;
use std::collections::HashMap;
use tracing::debug;

use crate::retrieval::SourceCitation;

/// One event extracted from the answer stream.
#[derive(Debug, Clone, PartialEq)]
pub enum AnswerEvent {
    /// A complete JSON answer object, with source ids already replaced by
    /// full citation records.
    Structured(Value),
    /// Unstructured text: either a plain-text stream fragment or the
    /// end-of-stream fallback for an unparseable tail.
    Text(String),
}

impl AnswerEvent {
    /// Ids of the sources cited by a structured event. Empty for text events.
    pub fn cited_source_ids(&self) -> Vec<String> {
        match self {
            AnswerEvent::Structured(value) => value
                .get("sources")
                .and_then(Value::as_array)
                .map(|sources| {
                    sources
                        .iter()
                        .filter_map(|s| s.get("id").and_then(Value::as_str))
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            AnswerEvent::Text(_) => Vec::new(),
        }
    }
}

/// Accumulating parser for one sentinel-delimited answer stream.
pub struct StreamFramer {
    delimiter: String,
    sources: HashMap<String, SourceCitation>,
    buffer: String,
}

impl StreamFramer {
    pub fn new(delimiter: impl Into<String>, sources: HashMap<String, SourceCitation>) -> Self {
        Self {
            delimiter: delimiter.into(),
            sources,
            buffer: String::new(),
        }
    }

    /// Append one fragment and return every answer object completed by it.
    ///
    /// Malformed segments are dropped without aborting the stream; the final
    /// (possibly incomplete) segment stays buffered for the next push.
    pub fn push(&mut self, fragment: &str) -> Vec<AnswerEvent> {
        self.buffer.push_str(fragment);
        if !self.buffer.contains(&self.delimiter) {
            return Vec::new();
        }

        let mut segments: Vec<String> = self
            .buffer
            .split(&self.delimiter)
            .map(str::to_string)
            .collect();
        // The last segment is an incomplete tail (possibly empty); keep it.
        self.buffer = segments.pop().unwrap_or_default();

        segments
            .iter()
            .filter_map(|segment| match self.parse_segment(segment) {
                Some(event) => Some(event),
                None => {
                    debug!("dropping malformed answer segment ({} bytes)", segment.len());
                    None
                }
            })
            .collect()
    }

    /// Flush at end of stream. A parseable tail becomes one final structured
    /// event; an unparseable non-empty tail is emitted verbatim so no
    /// trailing content is silently lost.
    pub fn finish(mut self) -> Option<AnswerEvent> {
        let tail = std::mem::take(&mut self.buffer);
        if tail.trim().is_empty() {
            return None;
        }
        match self.parse_segment(&tail) {
            Some(event) => Some(event),
            None => Some(AnswerEvent::Text(tail)),
        }
    }

    fn parse_segment(&self, segment: &str) -> Option<AnswerEvent> {
        let value: Value = serde_json::from_str(segment.trim()).ok()?;
        Some(AnswerEvent::Structured(self.enrich(value)))
    }

    /// Replace a `sources` array of id strings with full citation records.
    /// Ids that don't resolve are dropped, not defaulted.
    fn enrich(&self, mut value: Value) -> Value {
        let Some(object) = value.as_object_mut() else {
            return value;
        };
        let Some(ids) = object.get("sources").and_then(Value::as_array).cloned() else {
            return value;
        };
        let enriched: Vec<Value> = ids
            .iter()
            .filter_map(Value::as_str)
            .filter_map(|id| self.sources.get(id))
            .filter_map(|citation| serde_json::to_value(citation).ok())
            .collect();
        object.insert("sources".to_string(), Value::Array(enriched));
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const DELIM: &str = "<<END_ANSWER>>";

    fn citation(id: &str) -> SourceCitation {
        SourceCitation {
            id: id.to_string(),
            title: format!("Title {id}"),
            article_id: format!("PMC-{id}"),
        }
    }

    fn framer_with(ids: &[&str]) -> StreamFramer {
        let sources = ids
            .iter()
            .map(|id| (id.to_string(), citation(id)))
            .collect();
        StreamFramer::new(DELIM, sources)
    }

    #[test]
    fn complete_object_then_incomplete_tail() {
        let mut framer = framer_with(&[]);
        let mut events = framer.push(r#"{"format":"paragraph","content":"ok"}"#);
        assert!(events.is_empty());

        events = framer.push(DELIM);
        assert_eq!(events.len(), 1);
        assert_eq!(
            events[0],
            AnswerEvent::Structured(json!({"format":"paragraph","content":"ok"}))
        );

        assert!(framer.push(r#"{"format"#).is_empty());
        assert_eq!(
            framer.finish(),
            Some(AnswerEvent::Text(r#"{"format"#.to_string()))
        );
    }

    #[test]
    fn delimiter_split_across_fragments_still_frames() {
        let mut framer = framer_with(&[]);
        assert!(framer.push(r#"{"answer":"a","sources":[]}<<END_"#).is_empty());
        let events = framer.push("ANSWER>>");
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn malformed_middle_segment_is_dropped() {
        let mut framer = framer_with(&[]);
        let input = format!(
            r#"{{"answer":"one","sources":[]}}{DELIM}not json{DELIM}{{"answer":"two","sources":[]}}{DELIM}"#
        );
        let events = framer.push(&input);
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[0],
            AnswerEvent::Structured(json!({"answer":"one","sources":[]}))
        );
        assert_eq!(
            events[1],
            AnswerEvent::Structured(json!({"answer":"two","sources":[]}))
        );
        assert_eq!(framer.finish(), None);
    }

    #[test]
    fn sources_are_enriched_and_unresolved_ids_dropped() {
        let mut framer = framer_with(&["doc-1"]);
        let input = format!(r#"{{"answer":"x","sources":["doc-1","ghost"]}}{DELIM}"#);
        let events = framer.push(&input);
        assert_eq!(events.len(), 1);
        assert_eq!(
            events[0],
            AnswerEvent::Structured(json!({
                "answer": "x",
                "sources": [{"id": "doc-1", "title": "Title doc-1", "article_id": "PMC-doc-1"}]
            }))
        );
        assert_eq!(events[0].cited_source_ids(), vec!["doc-1".to_string()]);
    }

    #[test]
    fn parseable_tail_is_emitted_at_finish() {
        let mut framer = framer_with(&[]);
        assert!(framer.push(r#"{"answer":"tail","sources":[]}"#).is_empty());
        assert_eq!(
            framer.finish(),
            Some(AnswerEvent::Structured(json!({"answer":"tail","sources":[]})))
        );
    }

    #[test]
    fn empty_tail_yields_nothing() {
        let mut framer = framer_with(&[]);
        framer.push(&format!(r#"{{"answer":"a","sources":[]}}{DELIM}  "#));
        assert_eq!(framer.finish(), None);
    }
}
