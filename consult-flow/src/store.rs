use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;

use crate::error::Result;
use crate::message::{ChatMessage, ConsultationSession, SectionSummary};
use crate::section::Section;

/// Persistence boundary for sessions, chat history and section summaries.
///
/// Implementations are assumed strongly consistent for a single session; no
/// cross-session transactions are required.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create_session(&self, session: ConsultationSession) -> Result<()>;
    async fn get_session(&self, id: &str) -> Result<Option<ConsultationSession>>;
    async fn update_session(&self, session: &ConsultationSession) -> Result<()>;

    /// Append one message to the session's history. Messages are append-only
    /// and ordered by creation time.
    async fn append_message(&self, message: ChatMessage) -> Result<()>;

    /// All messages for a session in chronological order, optionally filtered
    /// by their section tag.
    async fn messages(&self, session_id: &str, section: Option<Section>) -> Result<Vec<ChatMessage>>;

    /// Create or overwrite the summary for (session, section).
    async fn upsert_summary(
        &self,
        session_id: &str,
        section: Section,
        summary: &SectionSummary,
    ) -> Result<()>;

    async fn get_summary(&self, session_id: &str, section: Section) -> Result<Option<SectionSummary>>;

    /// All stored summaries for a session, in section order.
    async fn summaries(&self, session_id: &str) -> Result<Vec<(Section, SectionSummary)>>;
}

/// In-memory implementation of `SessionStore`, used in tests and demos.
#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: Arc<DashMap<String, ConsultationSession>>,
    messages: Arc<DashMap<String, Vec<ChatMessage>>>,
    summaries: Arc<DashMap<(String, Section), SectionSummary>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn create_session(&self, session: ConsultationSession) -> Result<()> {
        self.sessions.insert(session.id.clone(), session);
        Ok(())
    }

    async fn get_session(&self, id: &str) -> Result<Option<ConsultationSession>> {
        Ok(self.sessions.get(id).map(|entry| entry.clone()))
    }

    async fn update_session(&self, session: &ConsultationSession) -> Result<()> {
        self.sessions.insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn append_message(&self, message: ChatMessage) -> Result<()> {
        self.messages
            .entry(message.session_id.clone())
            .or_default()
            .push(message);
        Ok(())
    }

    async fn messages(&self, session_id: &str, section: Option<Section>) -> Result<Vec<ChatMessage>> {
        let all = self
            .messages
            .get(session_id)
            .map(|entry| entry.clone())
            .unwrap_or_default();
        Ok(match section {
            Some(section) => all.into_iter().filter(|m| m.section == section).collect(),
            None => all,
        })
    }

    async fn upsert_summary(
        &self,
        session_id: &str,
        section: Section,
        summary: &SectionSummary,
    ) -> Result<()> {
        self.summaries
            .insert((session_id.to_string(), section), summary.clone());
        Ok(())
    }

    async fn get_summary(&self, session_id: &str, section: Section) -> Result<Option<SectionSummary>> {
        Ok(self
            .summaries
            .get(&(session_id.to_string(), section))
            .map(|entry| entry.clone()))
    }

    async fn summaries(&self, session_id: &str) -> Result<Vec<(Section, SectionSummary)>> {
        let mut out = Vec::new();
        for section in crate::section::SECTION_ORDER {
            if let Some(summary) = self.summaries.get(&(session_id.to_string(), section)) {
                out.push((section, summary.clone()));
            }
        }
        Ok(out)
    }
}
