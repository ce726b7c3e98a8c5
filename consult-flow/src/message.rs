use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::FlowError;
use crate::section::Section;

/// A consultation session between a provider and a patient.
///
/// `current_section` is mutated only by the controller's transition step, and
/// `status` is `Completed` exactly when `current_section` is the terminal
/// section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsultationSession {
    pub id: String,
    pub patient_id: String,
    pub provider_id: String,
    pub current_section: Section,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ConsultationSession {
    pub fn new(patient_id: impl Into<String>, provider_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            patient_id: patient_id.into(),
            provider_id: provider_id.into(),
            current_section: Section::ChiefComplaint,
            status: SessionStatus::InProgress,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    InProgress,
    Completed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::InProgress => "in_progress",
            SessionStatus::Completed => "completed",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, FlowError> {
        match raw {
            "in_progress" => Ok(SessionStatus::InProgress),
            "completed" => Ok(SessionStatus::Completed),
            other => Err(FlowError::Storage(format!("unknown session status: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageSender {
    Provider,
    Ai,
}

impl MessageSender {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageSender::Provider => "provider",
            MessageSender::Ai => "ai",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, FlowError> {
        match raw {
            "provider" => Ok(MessageSender::Provider),
            "ai" => Ok(MessageSender::Ai),
            other => Err(FlowError::Storage(format!("unknown message sender: {other}"))),
        }
    }
}

/// Message payload: plain text, or a retrieval-augmented answer marker that
/// records which sources were cited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageContent {
    Text { text: String },
    Rag { text: String, sources: Vec<String> },
}

impl MessageContent {
    pub fn text(&self) -> &str {
        match self {
            MessageContent::Text { text } => text,
            MessageContent::Rag { text, .. } => text,
        }
    }
}

/// One chat message in a session's append-only history. The `section` tag is
/// the section that was active when the message was produced; it drives the
/// later per-section summarization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub session_id: String,
    pub sender: MessageSender,
    pub section: Section,
    pub content: MessageContent,
    pub created_at: DateTime<Utc>,
}

impl ChatMessage {
    pub fn new(
        session_id: impl Into<String>,
        sender: MessageSender,
        section: Section,
        content: MessageContent,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            sender,
            section,
            content,
            created_at: Utc::now(),
        }
    }

    pub fn provider(session_id: impl Into<String>, section: Section, text: impl Into<String>) -> Self {
        Self::new(
            session_id,
            MessageSender::Provider,
            section,
            MessageContent::Text { text: text.into() },
        )
    }

    pub fn ai(session_id: impl Into<String>, section: Section, text: impl Into<String>) -> Self {
        Self::new(
            session_id,
            MessageSender::Ai,
            section,
            MessageContent::Text { text: text.into() },
        )
    }
}

/// Structured distillation of one section's conversation, shaped by that
/// section's presentation format. At most one live record per
/// (session, section) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "format", rename_all = "snake_case")]
pub enum SectionSummary {
    NumberedList { items: Vec<String> },
    BulletList { items: Vec<String> },
    Paragraph { content: String },
}
