//! Core library for guided medical consultations: the section state machine,
//! classification-driven turn handling, format-aware section summarization,
//! retrieval-augmented answer construction, and the sentinel-delimited
//! streaming protocol.
//!
//! Persistence, text generation and knowledge retrieval are injected through
//! the traits in [`store`] and [`generate`]; the service crate provides the
//! production adapters.

pub mod classify;
pub mod controller;
pub mod error;
pub mod framer;
pub mod generate;
pub mod message;
pub mod retrieval;
pub mod section;
pub mod store;
pub mod summary;

pub use classify::ClassificationLabel;
pub use controller::{ConsultationFlow, FlowConfig, TurnResponse};
pub use error::{FlowError, Result};
pub use framer::{AnswerEvent, StreamFramer};
pub use generate::{KnowledgeRetriever, RetrievedPassage, TextGenerator, TokenStream};
pub use message::{
    ChatMessage, ConsultationSession, MessageContent, MessageSender, SectionSummary, SessionStatus,
};
pub use retrieval::{
    ANSWER_DELIMITER, AnswerRequest, Passage, RetrievedSource, SourceCitation, build_general_answer,
    build_medical_answer, group_sources,
};
pub use section::{SECTION_ORDER, Section, SectionFormat};
pub use store::{InMemorySessionStore, SessionStore};
pub use summary::summarize_section;
