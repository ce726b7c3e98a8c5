use serde::{Deserialize, Serialize};

use consult_flow::{ConsultationSession, Section, SectionSummary, TurnResponse};

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateConsultationRequest {
    pub patient_id: String,
    pub provider_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateConsultationResponse {
    pub session_id: String,
    pub current_section: Section,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatRequest {
    pub message: String,
}

/// Response body for the non-streaming turn outcomes. Question turns are
/// answered over SSE instead and never produce one of these.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatResponse {
    SectionTransition {
        previous_section: Section,
        current_section: Section,
        message: String,
    },
    FollowUp {
        current_section: Section,
        message: String,
    },
    CompletionAcknowledgment {
        current_section: Section,
        message: String,
    },
}

impl ChatResponse {
    /// Maps the synchronous turn outcomes; question outcomes return `None`
    /// because they stream.
    pub fn from_turn(turn: &TurnResponse) -> Option<Self> {
        match turn {
            TurnResponse::SectionTransition {
                previous_section,
                current_section,
                message,
            } => Some(Self::SectionTransition {
                previous_section: *previous_section,
                current_section: *current_section,
                message: message.clone(),
            }),
            TurnResponse::FollowUp {
                current_section,
                message,
            } => Some(Self::FollowUp {
                current_section: *current_section,
                message: message.clone(),
            }),
            TurnResponse::CompletionAcknowledgment {
                current_section,
                message,
            } => Some(Self::CompletionAcknowledgment {
                current_section: *current_section,
                message: message.clone(),
            }),
            TurnResponse::MedicalQuestion { .. } | TurnResponse::GeneralQuestion { .. } => None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionView {
    pub session_id: String,
    pub patient_id: String,
    pub provider_id: String,
    pub current_section: Section,
    pub status: String,
    pub created_at: String,
    pub updated_at: String,
}

impl From<ConsultationSession> for SessionView {
    fn from(session: ConsultationSession) -> Self {
        Self {
            session_id: session.id,
            patient_id: session.patient_id,
            provider_id: session.provider_id,
            current_section: session.current_section,
            status: session.status.as_str().to_string(),
            created_at: session.created_at.to_rfc3339(),
            updated_at: session.updated_at.to_rfc3339(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SummaryView {
    pub section: Section,
    pub summary: SectionSummary,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SummariesResponse {
    pub session_id: String,
    pub summaries: Vec<SummaryView>,
}
