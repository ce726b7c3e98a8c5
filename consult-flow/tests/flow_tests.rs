//! End-to-end controller scenarios against deterministic fakes.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

use consult_flow::{
    ANSWER_DELIMITER, AnswerEvent, ChatMessage, ConsultationFlow, ConsultationSession, FlowError,
    InMemorySessionStore, KnowledgeRetriever, MessageContent, MessageSender, Result,
    RetrievedPassage, Section, SectionSummary, SessionStatus, SessionStore, TextGenerator,
    TokenStream, TurnResponse,
};

#[derive(Default)]
struct ScriptedGenerator {
    /// `None` simulates an unavailable classifier.
    classify_response: Option<String>,
    /// `None` simulates a failed structured completion.
    structured_response: Option<String>,
    /// `None` simulates a failed text completion (fixed prompts kick in).
    text_response: Option<String>,
    /// Fragments delivered by `stream_tokens`, in order.
    fragments: Vec<String>,
}

#[async_trait]
impl TextGenerator for ScriptedGenerator {
    async fn classify(&self, _section: Section, _text: &str) -> Result<String> {
        self.classify_response
            .clone()
            .ok_or_else(|| FlowError::Generation("classifier down".to_string()))
    }

    async fn generate_text(&self, _prompt: &str, _system: Option<&str>) -> Result<String> {
        self.text_response
            .clone()
            .ok_or_else(|| FlowError::Generation("completion down".to_string()))
    }

    async fn generate_structured(&self, _prompt: &str, _system: &str) -> Result<String> {
        self.structured_response
            .clone()
            .ok_or_else(|| FlowError::Generation("completion down".to_string()))
    }

    async fn stream_tokens(
        &self,
        _prompt: &str,
        _system: Option<&str>,
        _structured: bool,
    ) -> Result<TokenStream> {
        let (tx, rx) = mpsc::channel(64);
        for fragment in &self.fragments {
            tx.send(fragment.clone()).await.expect("channel capacity");
        }
        Ok(rx)
    }
}

#[derive(Default)]
struct ScriptedRetriever {
    passages: Vec<RetrievedPassage>,
}

#[async_trait]
impl KnowledgeRetriever for ScriptedRetriever {
    async fn retrieve(&self, _query: &str, _limit: usize) -> Result<Vec<RetrievedPassage>> {
        Ok(self.passages.clone())
    }
}

fn passage(doc: &str, index: i32, similarity: f32) -> RetrievedPassage {
    RetrievedPassage {
        document_id: doc.to_string(),
        title: format!("Title {doc}"),
        article_id: format!("PMC-{doc}"),
        similarity,
        text: format!("passage {index} of {doc}"),
        index,
    }
}

struct Harness {
    store: Arc<InMemorySessionStore>,
    flow: ConsultationFlow,
}

fn harness(generator: ScriptedGenerator, retriever: ScriptedRetriever) -> Harness {
    let store = Arc::new(InMemorySessionStore::new());
    let flow = ConsultationFlow::new(store.clone(), Arc::new(generator), Arc::new(retriever));
    Harness { store, flow }
}

async fn seed_session(store: &InMemorySessionStore, section: Section) -> String {
    let mut session = ConsultationSession::new("patient-1", "provider-1");
    session.current_section = section;
    if section == Section::Complete {
        session.status = SessionStatus::Completed;
    }
    let id = session.id.clone();
    store.create_session(session).await.unwrap();
    id
}

async fn ai_messages(store: &InMemorySessionStore, id: &str, section: Section) -> Vec<ChatMessage> {
    store
        .messages(id, Some(section))
        .await
        .unwrap()
        .into_iter()
        .filter(|m| m.sender == MessageSender::Ai)
        .collect()
}

#[tokio::test]
async fn section_complete_transitions_and_summarizes() {
    let h = harness(
        ScriptedGenerator {
            classify_response: Some("SECTION_COMPLETE".to_string()),
            structured_response: Some(
                r#"{"format":"paragraph","content":"Fever for three days."}"#.to_string(),
            ),
            text_response: Some("What did the patient report?".to_string()),
            ..Default::default()
        },
        ScriptedRetriever::default(),
    );
    let id = seed_session(&h.store, Section::History).await;

    let response = h.flow.process_turn(&id, "that's all for the history").await.unwrap();

    match response {
        TurnResponse::SectionTransition {
            previous_section,
            current_section,
            message,
        } => {
            assert_eq!(previous_section, Section::History);
            assert_eq!(current_section, Section::Subjective);
            assert_eq!(message, "What did the patient report?");
        }
        other => panic!("expected transition, got {other:?}"),
    }

    let session = h.store.get_session(&id).await.unwrap().unwrap();
    assert_eq!(session.current_section, Section::Subjective);
    assert_eq!(session.status, SessionStatus::InProgress);

    let summary = h.store.get_summary(&id, Section::History).await.unwrap();
    assert_eq!(
        summary,
        Some(SectionSummary::Paragraph {
            content: "Fever for three days.".to_string()
        })
    );

    // Exactly one opening prompt tagged with the new section.
    assert_eq!(ai_messages(&h.store, &id, Section::Subjective).await.len(), 1);
}

#[tokio::test]
async fn doubts_transitions_without_writing_a_summary() {
    let h = harness(
        ScriptedGenerator {
            classify_response: Some("SECTION_COMPLETE".to_string()),
            structured_response: Some(r#"{"format":"paragraph","content":"x"}"#.to_string()),
            text_response: Some("What medications are you prescribing?".to_string()),
            ..Default::default()
        },
        ScriptedRetriever::default(),
    );
    let id = seed_session(&h.store, Section::Doubts).await;

    let response = h.flow.process_turn(&id, "no more questions, next").await.unwrap();
    assert!(matches!(
        response,
        TurnResponse::SectionTransition {
            previous_section: Section::Doubts,
            current_section: Section::Medications,
            ..
        }
    ));
    assert_eq!(h.store.get_summary(&id, Section::Doubts).await.unwrap(), None);
}

#[tokio::test]
async fn finishing_notes_completes_the_session() {
    let h = harness(
        ScriptedGenerator {
            classify_response: Some("SECTION_COMPLETE".to_string()),
            structured_response: Some(r#"{"format":"paragraph","content":"n"}"#.to_string()),
            text_response: None,
            ..Default::default()
        },
        ScriptedRetriever::default(),
    );
    let id = seed_session(&h.store, Section::Notes).await;

    h.flow.process_turn(&id, "done").await.unwrap();

    let session = h.store.get_session(&id).await.unwrap().unwrap();
    assert_eq!(session.current_section, Section::Complete);
    assert_eq!(session.status, SessionStatus::Completed);
}

#[tokio::test]
async fn completed_session_only_acknowledges() {
    let h = harness(
        ScriptedGenerator {
            classify_response: Some("SECTION_COMPLETE".to_string()),
            ..Default::default()
        },
        ScriptedRetriever::default(),
    );
    let id = seed_session(&h.store, Section::Complete).await;

    for _ in 0..2 {
        let response = h.flow.process_turn(&id, "anything else?").await.unwrap();
        assert!(matches!(
            response,
            TurnResponse::CompletionAcknowledgment {
                current_section: Section::Complete,
                ..
            }
        ));
    }

    let session = h.store.get_session(&id).await.unwrap().unwrap();
    assert_eq!(session.current_section, Section::Complete);
    // Both turns persisted: two provider messages, two acknowledgments.
    assert_eq!(h.store.messages(&id, None).await.unwrap().len(), 4);
}

#[tokio::test]
async fn unknown_session_is_fatal() {
    let h = harness(ScriptedGenerator::default(), ScriptedRetriever::default());
    let err = h.flow.process_turn("no-such-session", "hello").await.unwrap_err();
    assert!(matches!(err, FlowError::SessionNotFound(_)));
}

#[tokio::test]
async fn classifier_failure_defaults_to_follow_up() {
    let h = harness(
        ScriptedGenerator {
            classify_response: None,
            text_response: Some("Could you describe the onset?".to_string()),
            ..Default::default()
        },
        ScriptedRetriever::default(),
    );
    let id = seed_session(&h.store, Section::History).await;

    let response = h.flow.process_turn(&id, "patient has a cough").await.unwrap();
    match response {
        TurnResponse::FollowUp {
            current_section,
            message,
        } => {
            assert_eq!(current_section, Section::History);
            assert_eq!(message, "Could you describe the onset?");
        }
        other => panic!("expected follow-up, got {other:?}"),
    }

    // No mutation, and the follow-up is in the history.
    let session = h.store.get_session(&id).await.unwrap().unwrap();
    assert_eq!(session.current_section, Section::History);
    assert_eq!(ai_messages(&h.store, &id, Section::History).await.len(), 1);
}

#[tokio::test]
async fn medical_question_in_doubts_caps_sources_first_seen() {
    let h = harness(
        ScriptedGenerator {
            classify_response: Some("MEDICAL_QUESTION".to_string()),
            ..Default::default()
        },
        ScriptedRetriever {
            passages: vec![
                passage("a", 0, 0.80),
                passage("b", 0, 0.78),
                passage("a", 1, 0.77),
                passage("c", 0, 0.75),
                passage("d", 0, 0.99),
            ],
        },
    );
    let id = seed_session(&h.store, Section::Doubts).await;

    let response = h.flow.process_turn(&id, "what is the evidence for X?").await.unwrap();
    match response {
        TurnResponse::MedicalQuestion {
            current_section,
            answer,
        } => {
            assert_eq!(current_section, Section::Doubts);
            assert!(answer.structured);
            assert_eq!(answer.source_map.len(), 3);
            assert!(answer.source_map.contains_key("a"));
            assert!(answer.source_map.contains_key("b"));
            assert!(answer.source_map.contains_key("c"));
            assert!(!answer.source_map.contains_key("d"));
        }
        other => panic!("expected medical question, got {other:?}"),
    }

    let session = h.store.get_session(&id).await.unwrap().unwrap();
    assert_eq!(session.current_section, Section::Doubts);
}

#[tokio::test]
async fn medical_question_outside_doubts_is_a_follow_up() {
    let h = harness(
        ScriptedGenerator {
            classify_response: Some("MEDICAL_QUESTION".to_string()),
            text_response: Some("Anything else for this section?".to_string()),
            ..Default::default()
        },
        ScriptedRetriever::default(),
    );
    let id = seed_session(&h.store, Section::History).await;

    let response = h.flow.process_turn(&id, "what about contraindications?").await.unwrap();
    assert!(matches!(response, TurnResponse::FollowUp { .. }));
}

#[tokio::test]
async fn streamed_medical_answer_is_framed_enriched_and_persisted() {
    let h = harness(
        ScriptedGenerator {
            classify_response: Some("MEDICAL_QUESTION".to_string()),
            fragments: vec![
                r#"{"answer":"Aspirin is indicated.","sources":["a","ghost"]}"#.to_string(),
                ANSWER_DELIMITER.to_string(),
                r#"{"answer"#.to_string(),
            ],
            ..Default::default()
        },
        ScriptedRetriever {
            passages: vec![passage("a", 0, 0.9)],
        },
    );
    let id = seed_session(&h.store, Section::Doubts).await;

    let answer = match h.flow.process_turn(&id, "is aspirin indicated?").await.unwrap() {
        TurnResponse::MedicalQuestion { answer, .. } => answer,
        other => panic!("expected medical question, got {other:?}"),
    };

    let mut rx = h.flow.stream_answer(&id, Section::Doubts, answer).await.unwrap();
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }

    assert_eq!(events.len(), 2);
    match &events[0] {
        AnswerEvent::Structured(value) => {
            assert_eq!(value["answer"], "Aspirin is indicated.");
            // Resolved id enriched, unknown id dropped.
            assert_eq!(value["sources"].as_array().unwrap().len(), 1);
            assert_eq!(value["sources"][0]["title"], "Title a");
        }
        other => panic!("expected structured event, got {other:?}"),
    }
    assert_eq!(events[1], AnswerEvent::Text(r#"{"answer"#.to_string()));

    // Placeholder marker persisted after the stream drained, citing the
    // sources actually used.
    let markers = ai_messages(&h.store, &id, Section::Doubts).await;
    assert_eq!(markers.len(), 1);
    match &markers[0].content {
        MessageContent::Rag { sources, .. } => assert_eq!(sources, &vec!["a".to_string()]),
        other => panic!("expected rag marker, got {other:?}"),
    }
}

/// Hands out one externally fed token stream, letting the test pace fragment
/// delivery around the consumer's lifetime.
struct HeldStreamGenerator {
    stream: tokio::sync::Mutex<Option<TokenStream>>,
}

#[async_trait]
impl TextGenerator for HeldStreamGenerator {
    async fn classify(&self, _section: Section, _text: &str) -> Result<String> {
        Ok("MEDICAL_QUESTION".to_string())
    }

    async fn generate_text(&self, _prompt: &str, _system: Option<&str>) -> Result<String> {
        Err(FlowError::Generation("completion down".to_string()))
    }

    async fn generate_structured(&self, _prompt: &str, _system: &str) -> Result<String> {
        Err(FlowError::Generation("completion down".to_string()))
    }

    async fn stream_tokens(
        &self,
        _prompt: &str,
        _system: Option<&str>,
        _structured: bool,
    ) -> Result<TokenStream> {
        self.stream
            .lock()
            .await
            .take()
            .ok_or_else(|| FlowError::Generation("stream already taken".to_string()))
    }
}

#[tokio::test]
async fn abandoned_stream_discards_tail_but_persists_marker() {
    let (token_tx, token_rx) = mpsc::channel(8);
    let store = Arc::new(InMemorySessionStore::new());
    let flow = ConsultationFlow::new(
        store.clone(),
        Arc::new(HeldStreamGenerator {
            stream: tokio::sync::Mutex::new(Some(token_rx)),
        }),
        Arc::new(ScriptedRetriever {
            passages: vec![passage("a", 0, 0.9), passage("b", 0, 0.8)],
        }),
    );
    let id = seed_session(&store, Section::Doubts).await;

    let answer = match flow.process_turn(&id, "what is the evidence?").await.unwrap() {
        TurnResponse::MedicalQuestion { answer, .. } => answer,
        other => panic!("expected medical question, got {other:?}"),
    };
    let mut rx = flow.stream_answer(&id, Section::Doubts, answer).await.unwrap();

    token_tx
        .send(format!(r#"{{"answer":"first","sources":["a"]}}{ANSWER_DELIMITER}"#))
        .await
        .unwrap();
    let first = rx.recv().await.unwrap();
    assert!(matches!(first, AnswerEvent::Structured(_)));

    // Client disconnects mid-answer.
    drop(rx);

    // A further object plus a parseable tail citing "b". The forwarder must
    // stop on the dead channel and never flush the tail.
    token_tx
        .send(format!(
            r#"{{"answer":"more","sources":[]}}{ANSWER_DELIMITER}{{"answer":"tail","sources":["b"]}}"#
        ))
        .await
        .unwrap();
    drop(token_tx);

    let mut markers = Vec::new();
    for _ in 0..50 {
        markers = ai_messages(&store, &id, Section::Doubts).await;
        if !markers.is_empty() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    // Exactly one placeholder marker, citing only the delivered answer's
    // source; the discarded tail's "b" never lands anywhere.
    assert_eq!(markers.len(), 1);
    match &markers[0].content {
        MessageContent::Rag { sources, .. } => assert_eq!(sources, &vec!["a".to_string()]),
        other => panic!("expected rag marker, got {other:?}"),
    }
}

#[tokio::test]
async fn general_question_streams_plain_text() {
    let h = harness(
        ScriptedGenerator {
            classify_response: Some("GENERAL_QUESTION".to_string()),
            fragments: vec!["You could ".to_string(), "phrase it as...".to_string()],
            ..Default::default()
        },
        ScriptedRetriever::default(),
    );
    let id = seed_session(&h.store, Section::Doubts).await;

    let answer = match h.flow.process_turn(&id, "how should I phrase this?").await.unwrap() {
        TurnResponse::GeneralQuestion { answer, .. } => answer,
        other => panic!("expected general question, got {other:?}"),
    };
    assert!(!answer.structured);

    let mut rx = h.flow.stream_answer(&id, Section::Doubts, answer).await.unwrap();
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    assert_eq!(
        events,
        vec![
            AnswerEvent::Text("You could ".to_string()),
            AnswerEvent::Text("phrase it as...".to_string()),
        ]
    );

    let markers = ai_messages(&h.store, &id, Section::Doubts).await;
    assert_eq!(markers.len(), 1);
    assert!(matches!(markers[0].content, MessageContent::Text { .. }));
}

#[tokio::test]
async fn concurrent_turns_on_one_session_are_serialized() {
    let h = harness(
        ScriptedGenerator {
            classify_response: Some("SECTION_COMPLETE".to_string()),
            structured_response: Some(r#"{"format":"paragraph","content":"x"}"#.to_string()),
            text_response: Some("next?".to_string()),
            ..Default::default()
        },
        ScriptedRetriever::default(),
    );
    let id = seed_session(&h.store, Section::History).await;

    let (a, b) = tokio::join!(
        h.flow.process_turn(&id, "done"),
        h.flow.process_turn(&id, "done")
    );
    a.unwrap();
    b.unwrap();

    // Two serialized transitions, not two racing reads of the same section.
    let session = h.store.get_session(&id).await.unwrap().unwrap();
    assert_eq!(session.current_section, Section::VitalSigns);
}

#[tokio::test]
async fn start_session_opens_at_chief_complaint() {
    let h = harness(
        ScriptedGenerator {
            text_response: None, // force the fixed opening question
            ..Default::default()
        },
        ScriptedRetriever::default(),
    );

    let (session, message) = h.flow.start_session("patient-1", "provider-1").await.unwrap();
    assert_eq!(session.current_section, Section::ChiefComplaint);
    assert_eq!(message, "What is the chief complaint of the patient?");
    assert_eq!(
        ai_messages(&h.store, &session.id, Section::ChiefComplaint).await.len(),
        1
    );
}
