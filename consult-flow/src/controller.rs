//! The consultation flow controller.
//!
//! Owns the section state machine and drives classification, summarization,
//! retrieval and streaming for one turn at a time. Collaborators are injected
//! as trait objects so the whole flow runs against deterministic fakes in
//! tests.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tracing::{error, info, warn};

use crate::classify::ClassificationLabel;
use crate::error::{FlowError, Result};
use crate::framer::{AnswerEvent, StreamFramer};
use crate::generate::{KnowledgeRetriever, TextGenerator};
use crate::message::{ChatMessage, ConsultationSession, MessageContent, MessageSender, SessionStatus};
use crate::retrieval::{self, ANSWER_DELIMITER, AnswerRequest};
use crate::section::Section;
use crate::store::SessionStore;
use crate::summary::summarize_section;

const COMPLETION_ACKNOWLEDGMENT: &str = "This consultation is complete. \
You can review the structured record or generate the summary document.";

const DOUBTS_FOLLOW_UP: &str = "Is there anything specific you'd like to know about this case? \
Or would you like to move to the next section?";

const DEFAULT_FOLLOW_UP: &str = "Is there anything else to add for this section?";

const MEDICAL_ANSWER_PLACEHOLDER: &str = "[Evidence-based answer with sources]";
const GENERAL_ANSWER_PLACEHOLDER: &str = "[Response to general question]";

const FOLLOW_UP_SYSTEM_MESSAGE: &str = "You are a medical AI assistant guiding a doctor through a \
structured consultation. Ask one short follow-up question that helps complete the current section. \
Return only the question.";

/// Tunables for the flow. Defaults match the deployed behavior.
#[derive(Debug, Clone)]
pub struct FlowConfig {
    /// Distinct literature sources kept per answer.
    pub max_sources: usize,
    /// Structured objects allowed in one streamed answer.
    pub max_answer_objects: usize,
    /// Passages requested from the retriever before grouping.
    pub retrieval_limit: usize,
    /// Sentinel marking the end of each streamed JSON object.
    pub delimiter: String,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            max_sources: 3,
            max_answer_objects: 3,
            retrieval_limit: 5,
            delimiter: ANSWER_DELIMITER.to_string(),
        }
    }
}

/// Exactly one of these is returned per processed turn. The two question
/// variants describe a stream still to be run via [`ConsultationFlow::stream_answer`];
/// the other three are fully persisted before they are returned.
#[derive(Debug, Clone)]
pub enum TurnResponse {
    SectionTransition {
        previous_section: Section,
        current_section: Section,
        message: String,
    },
    FollowUp {
        current_section: Section,
        message: String,
    },
    MedicalQuestion {
        current_section: Section,
        answer: AnswerRequest,
    },
    GeneralQuestion {
        current_section: Section,
        answer: AnswerRequest,
    },
    CompletionAcknowledgment {
        current_section: Section,
        message: String,
    },
}

pub struct ConsultationFlow {
    store: Arc<dyn SessionStore>,
    generator: Arc<dyn TextGenerator>,
    retriever: Arc<dyn KnowledgeRetriever>,
    config: FlowConfig,
    // At-most-one in-flight turn per session; different sessions proceed in
    // parallel.
    session_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl ConsultationFlow {
    pub fn new(
        store: Arc<dyn SessionStore>,
        generator: Arc<dyn TextGenerator>,
        retriever: Arc<dyn KnowledgeRetriever>,
    ) -> Self {
        Self::with_config(store, generator, retriever, FlowConfig::default())
    }

    pub fn with_config(
        store: Arc<dyn SessionStore>,
        generator: Arc<dyn TextGenerator>,
        retriever: Arc<dyn KnowledgeRetriever>,
        config: FlowConfig,
    ) -> Self {
        Self {
            store,
            generator,
            retriever,
            config,
            session_locks: DashMap::new(),
        }
    }

    /// Create a session at `chief_complaint` and persist the opening prompt.
    pub async fn start_session(
        &self,
        patient_id: &str,
        provider_id: &str,
    ) -> Result<(ConsultationSession, String)> {
        let session = ConsultationSession::new(patient_id, provider_id);
        self.store.create_session(session.clone()).await?;

        let message = self.opening_prompt(Section::ChiefComplaint).await;
        self.store
            .append_message(ChatMessage::ai(&session.id, Section::ChiefComplaint, &message))
            .await?;

        info!(session_id = %session.id, "consultation session started");
        Ok((session, message))
    }

    /// Process one inbound provider message.
    ///
    /// The section mutates only on the transition arm; every other arm leaves
    /// the session untouched.
    pub async fn process_turn(&self, session_id: &str, doctor_text: &str) -> Result<TurnResponse> {
        let lock = self.session_lock(session_id);
        let _guard = lock.lock().await;

        let mut session = self
            .store
            .get_session(session_id)
            .await?
            .ok_or_else(|| FlowError::SessionNotFound(session_id.to_string()))?;

        // Terminal state accepts input but never transitions again.
        if session.current_section.is_terminal() {
            self.store
                .append_message(ChatMessage::provider(session_id, Section::Complete, doctor_text))
                .await?;
            let message = COMPLETION_ACKNOWLEDGMENT.to_string();
            self.store
                .append_message(ChatMessage::ai(session_id, Section::Complete, &message))
                .await?;
            // Terminal sessions take no further turns that need serializing.
            self.session_locks.remove(session_id);
            return Ok(TurnResponse::CompletionAcknowledgment {
                current_section: Section::Complete,
                message,
            });
        }

        let section = session.current_section;
        self.store
            .append_message(ChatMessage::provider(session_id, section, doctor_text))
            .await?;

        let label = self.classify(section, doctor_text).await;
        info!(session_id, section = %section, label = ?label, "turn classified");

        match label {
            ClassificationLabel::SectionComplete => self.transition(&mut session, section).await,
            ClassificationLabel::MedicalQuestion if section == Section::Doubts => {
                let answer = self.build_medical_answer(doctor_text).await;
                Ok(TurnResponse::MedicalQuestion {
                    current_section: section,
                    answer,
                })
            }
            ClassificationLabel::GeneralQuestion if section == Section::Doubts => {
                Ok(TurnResponse::GeneralQuestion {
                    current_section: section,
                    answer: retrieval::build_general_answer(doctor_text),
                })
            }
            _ => self.follow_up(session_id, section, doctor_text).await,
        }
    }

    /// Run the streaming half of a question response: drive the token stream
    /// through the framer and forward events to the returned receiver.
    ///
    /// A placeholder message is persisted once the stream completes or is
    /// abandoned, so history stays complete without storing partial objects.
    pub async fn stream_answer(
        &self,
        session_id: &str,
        section: Section,
        request: AnswerRequest,
    ) -> Result<mpsc::Receiver<AnswerEvent>> {
        let mut tokens = self
            .generator
            .stream_tokens(&request.prompt, request.system_message.as_deref(), request.structured)
            .await?;

        let (tx, rx) = mpsc::channel(32);
        let store = self.store.clone();
        let session_id = session_id.to_string();
        let structured = request.structured;
        let mut framer = StreamFramer::new(self.config.delimiter.clone(), request.source_map);

        tokio::spawn(async move {
            let mut cited: Vec<String> = Vec::new();
            let mut abandoned = false;

            'stream: while let Some(fragment) = tokens.recv().await {
                if structured {
                    for event in framer.push(&fragment) {
                        for id in event.cited_source_ids() {
                            if !cited.contains(&id) {
                                cited.push(id);
                            }
                        }
                        if tx.send(event).await.is_err() {
                            abandoned = true;
                            break 'stream;
                        }
                    }
                } else if tx.send(AnswerEvent::Text(fragment)).await.is_err() {
                    abandoned = true;
                    break;
                }
            }

            if !abandoned && structured {
                if let Some(event) = framer.finish() {
                    for id in event.cited_source_ids() {
                        if !cited.contains(&id) {
                            cited.push(id);
                        }
                    }
                    let _ = tx.send(event).await;
                }
            }

            let content = if structured {
                MessageContent::Rag {
                    text: MEDICAL_ANSWER_PLACEHOLDER.to_string(),
                    sources: cited,
                }
            } else {
                MessageContent::Text {
                    text: GENERAL_ANSWER_PLACEHOLDER.to_string(),
                }
            };
            let message = ChatMessage::new(&session_id, MessageSender::Ai, section, content);
            if let Err(e) = store.append_message(message).await {
                error!(session_id, error = %e, "failed to persist streamed answer marker");
            }
        });

        Ok(rx)
    }

    fn session_lock(&self, session_id: &str) -> Arc<Mutex<()>> {
        self.session_locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn classify(&self, section: Section, text: &str) -> ClassificationLabel {
        match self.generator.classify(section, text).await {
            Ok(raw) => ClassificationLabel::from_response(&raw),
            Err(e) => {
                warn!(section = %section, error = %e, "classification unavailable, defaulting to follow-up");
                ClassificationLabel::NeedsFollowup
            }
        }
    }

    /// The single place the session's section is allowed to change.
    async fn transition(
        &self,
        session: &mut ConsultationSession,
        current: Section,
    ) -> Result<TurnResponse> {
        // `doubts` has no fixed presentation format and is exempt from the
        // summarization pipeline.
        if current != Section::Doubts {
            let messages = self.store.messages(&session.id, Some(current)).await?;
            let summary = summarize_section(self.generator.as_ref(), current, &messages).await;
            self.store.upsert_summary(&session.id, current, &summary).await?;
        }

        let next = current.next();
        session.current_section = next;
        session.status = if next.is_terminal() {
            SessionStatus::Completed
        } else {
            SessionStatus::InProgress
        };
        session.updated_at = chrono::Utc::now();
        self.store.update_session(session).await?;
        if next.is_terminal() {
            // The session never transitions again; drop its lock entry so the
            // map doesn't grow with finished consultations. In-flight turns
            // still hold their Arc clone and stay serialized.
            self.session_locks.remove(&session.id);
        }

        let message = self.opening_prompt(next).await;
        self.store
            .append_message(ChatMessage::ai(&session.id, next, &message))
            .await?;

        info!(session_id = %session.id, from = %current, to = %next, "section transition");
        Ok(TurnResponse::SectionTransition {
            previous_section: current,
            current_section: next,
            message,
        })
    }

    async fn follow_up(
        &self,
        session_id: &str,
        section: Section,
        doctor_text: &str,
    ) -> Result<TurnResponse> {
        let message = if section == Section::Doubts {
            DOUBTS_FOLLOW_UP.to_string()
        } else {
            let prompt = format!(
                "The consultation is in the '{section}' section, covering {}.\n\
                 The doctor just said: \"{doctor_text}\"\n\
                 Ask one short follow-up question to help complete this section.",
                section.description()
            );
            match self
                .generator
                .generate_text(&prompt, Some(FOLLOW_UP_SYSTEM_MESSAGE))
                .await
            {
                Ok(text) => text,
                Err(e) => {
                    warn!(section = %section, error = %e, "follow-up generation failed, using fixed prompt");
                    DEFAULT_FOLLOW_UP.to_string()
                }
            }
        };

        self.store
            .append_message(ChatMessage::ai(session_id, section, &message))
            .await?;
        Ok(TurnResponse::FollowUp {
            current_section: section,
            message,
        })
    }

    async fn build_medical_answer(&self, question: &str) -> AnswerRequest {
        let passages = match self
            .retriever
            .retrieve(question, self.config.retrieval_limit)
            .await
        {
            Ok(passages) => passages,
            Err(e) => {
                warn!(error = %e, "knowledge retrieval failed, answering without sources");
                Vec::new()
            }
        };
        let sources = retrieval::group_sources(passages, self.config.max_sources);
        retrieval::build_medical_answer(
            question,
            &sources,
            &self.config.delimiter,
            self.config.max_answer_objects,
        )
    }

    async fn opening_prompt(&self, section: Section) -> String {
        let prompt = format!(
            "A structured medical consultation is entering the '{section}' section, which covers {}.\n\
             Write one short question inviting the doctor to provide this information. \
             Return only the question.",
            section.description()
        );
        match self.generator.generate_text(&prompt, None).await {
            Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
            Ok(_) => section.fallback_prompt().to_string(),
            Err(e) => {
                warn!(section = %section, error = %e, "opening prompt generation failed, using fixed prompt");
                section.fallback_prompt().to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generate::{RetrievedPassage, TokenStream};
    use crate::store::InMemorySessionStore;
    use async_trait::async_trait;

    struct CompletingGenerator;

    #[async_trait]
    impl TextGenerator for CompletingGenerator {
        async fn classify(&self, _section: Section, _text: &str) -> Result<String> {
            Ok("SECTION_COMPLETE".to_string())
        }

        async fn generate_text(&self, _prompt: &str, _system: Option<&str>) -> Result<String> {
            Ok("next?".to_string())
        }

        async fn generate_structured(&self, _prompt: &str, _system: &str) -> Result<String> {
            Ok(r#"{"format":"paragraph","content":"x"}"#.to_string())
        }

        async fn stream_tokens(
            &self,
            _prompt: &str,
            _system: Option<&str>,
            _structured: bool,
        ) -> Result<TokenStream> {
            let (_tx, rx) = mpsc::channel(1);
            Ok(rx)
        }
    }

    struct EmptyRetriever;

    #[async_trait]
    impl KnowledgeRetriever for EmptyRetriever {
        async fn retrieve(&self, _query: &str, _limit: usize) -> Result<Vec<RetrievedPassage>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn lock_entry_is_dropped_once_the_session_completes() {
        let store = Arc::new(InMemorySessionStore::new());
        let flow = ConsultationFlow::new(
            store.clone(),
            Arc::new(CompletingGenerator),
            Arc::new(EmptyRetriever),
        );

        let mut session = ConsultationSession::new("patient-1", "provider-1");
        session.current_section = Section::Notes;
        let id = session.id.clone();
        store.create_session(session).await.unwrap();

        flow.process_turn(&id, "done").await.unwrap();
        assert!(flow.session_locks.is_empty());

        // Turns on the finished session don't leave an entry behind either.
        flow.process_turn(&id, "anything else?").await.unwrap();
        assert!(flow.session_locks.is_empty());
    }

    #[tokio::test]
    async fn in_progress_sessions_keep_their_lock_entry() {
        let store = Arc::new(InMemorySessionStore::new());
        let flow = ConsultationFlow::new(
            store.clone(),
            Arc::new(CompletingGenerator),
            Arc::new(EmptyRetriever),
        );

        let mut session = ConsultationSession::new("patient-1", "provider-1");
        session.current_section = Section::History;
        let id = session.id.clone();
        store.create_session(session).await.unwrap();

        flow.process_turn(&id, "done").await.unwrap();
        assert_eq!(flow.session_locks.len(), 1);
    }
}
