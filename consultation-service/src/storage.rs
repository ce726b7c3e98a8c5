//! Postgres-backed `SessionStore`.
//!
//! One row per session, append-only chat messages, and summaries upserted on
//! the (session, section) key. Message content and summaries are stored as
//! JSONB in the library's own serialized shapes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;

use consult_flow::{
    ChatMessage, ConsultationSession, FlowError, MessageSender, Result, SECTION_ORDER, Section,
    SectionSummary, SessionStatus, SessionStore,
};

const SCHEMA: [&str; 3] = [
    "CREATE TABLE IF NOT EXISTS consultation_sessions (
        id TEXT PRIMARY KEY,
        patient_id TEXT NOT NULL,
        provider_id TEXT NOT NULL,
        current_section TEXT NOT NULL,
        status TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS chat_messages (
        id TEXT PRIMARY KEY,
        session_id TEXT NOT NULL,
        sender TEXT NOT NULL,
        section TEXT NOT NULL,
        content JSONB NOT NULL,
        created_at TIMESTAMPTZ NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS section_summaries (
        session_id TEXT NOT NULL,
        section TEXT NOT NULL,
        content JSONB NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL,
        PRIMARY KEY (session_id, section)
    )",
];

pub struct PostgresSessionStore {
    pool: sqlx::PgPool,
}

impl PostgresSessionStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }
        Ok(Self { pool })
    }
}

fn storage_error(e: sqlx::Error) -> FlowError {
    FlowError::Storage(e.to_string())
}

type SessionRow = (
    String,
    String,
    String,
    String,
    String,
    DateTime<Utc>,
    DateTime<Utc>,
);

fn session_from_row(row: SessionRow) -> Result<ConsultationSession> {
    Ok(ConsultationSession {
        id: row.0,
        patient_id: row.1,
        provider_id: row.2,
        current_section: Section::parse(&row.3)?,
        status: SessionStatus::parse(&row.4)?,
        created_at: row.5,
        updated_at: row.6,
    })
}

type MessageRow = (String, String, String, String, serde_json::Value, DateTime<Utc>);

fn message_from_row(row: MessageRow) -> Result<ChatMessage> {
    Ok(ChatMessage {
        id: row.0,
        session_id: row.1,
        sender: MessageSender::parse(&row.2)?,
        section: Section::parse(&row.3)?,
        content: serde_json::from_value(row.4)?,
        created_at: row.5,
    })
}

#[async_trait]
impl SessionStore for PostgresSessionStore {
    async fn create_session(&self, session: ConsultationSession) -> Result<()> {
        sqlx::query(
            "INSERT INTO consultation_sessions \
             (id, patient_id, provider_id, current_section, status, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(&session.id)
        .bind(&session.patient_id)
        .bind(&session.provider_id)
        .bind(session.current_section.as_str())
        .bind(session.status.as_str())
        .bind(session.created_at)
        .bind(session.updated_at)
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;
        Ok(())
    }

    async fn get_session(&self, id: &str) -> Result<Option<ConsultationSession>> {
        let row = sqlx::query_as::<_, SessionRow>(
            "SELECT id, patient_id, provider_id, current_section, status, created_at, updated_at \
             FROM consultation_sessions WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_error)?;
        row.map(session_from_row).transpose()
    }

    async fn update_session(&self, session: &ConsultationSession) -> Result<()> {
        sqlx::query(
            "UPDATE consultation_sessions \
             SET current_section = $2, status = $3, updated_at = $4 WHERE id = $1",
        )
        .bind(&session.id)
        .bind(session.current_section.as_str())
        .bind(session.status.as_str())
        .bind(session.updated_at)
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;
        Ok(())
    }

    async fn append_message(&self, message: ChatMessage) -> Result<()> {
        sqlx::query(
            "INSERT INTO chat_messages (id, session_id, sender, section, content, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(&message.id)
        .bind(&message.session_id)
        .bind(message.sender.as_str())
        .bind(message.section.as_str())
        .bind(serde_json::to_value(&message.content)?)
        .bind(message.created_at)
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;
        Ok(())
    }

    async fn messages(&self, session_id: &str, section: Option<Section>) -> Result<Vec<ChatMessage>> {
        let rows = match section {
            Some(section) => {
                sqlx::query_as::<_, MessageRow>(
                    "SELECT id, session_id, sender, section, content, created_at \
                     FROM chat_messages WHERE session_id = $1 AND section = $2 \
                     ORDER BY created_at",
                )
                .bind(session_id)
                .bind(section.as_str())
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query_as::<_, MessageRow>(
                    "SELECT id, session_id, sender, section, content, created_at \
                     FROM chat_messages WHERE session_id = $1 ORDER BY created_at",
                )
                .bind(session_id)
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(storage_error)?;
        rows.into_iter().map(message_from_row).collect()
    }

    async fn upsert_summary(
        &self,
        session_id: &str,
        section: Section,
        summary: &SectionSummary,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO section_summaries (session_id, section, content, updated_at) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (session_id, section) \
             DO UPDATE SET content = EXCLUDED.content, updated_at = EXCLUDED.updated_at",
        )
        .bind(session_id)
        .bind(section.as_str())
        .bind(serde_json::to_value(summary)?)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;
        Ok(())
    }

    async fn get_summary(&self, session_id: &str, section: Section) -> Result<Option<SectionSummary>> {
        let row = sqlx::query_as::<_, (serde_json::Value,)>(
            "SELECT content FROM section_summaries WHERE session_id = $1 AND section = $2",
        )
        .bind(session_id)
        .bind(section.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_error)?;
        row.map(|(content,)| serde_json::from_value(content).map_err(FlowError::from))
            .transpose()
    }

    async fn summaries(&self, session_id: &str) -> Result<Vec<(Section, SectionSummary)>> {
        let rows = sqlx::query_as::<_, (String, serde_json::Value)>(
            "SELECT section, content FROM section_summaries WHERE session_id = $1",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_error)?;

        let mut out = Vec::with_capacity(rows.len());
        for (section, content) in rows {
            out.push((Section::parse(&section)?, serde_json::from_value(content)?));
        }
        // Present summaries in consultation order, not insertion order.
        out.sort_by_key(|(section, _)| {
            SECTION_ORDER.iter().position(|s| s == section).unwrap_or(usize::MAX)
        });
        Ok(out)
    }
}
