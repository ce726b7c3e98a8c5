use serde::{Deserialize, Serialize};

/// Closed label set for what a clinician's free-text turn means for flow
/// control. Transient per turn, never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClassificationLabel {
    SectionComplete,
    NeedsFollowup,
    MedicalQuestion,
    GeneralQuestion,
}

impl ClassificationLabel {
    /// Map a free-form classifier response onto the closed label set.
    ///
    /// Priority-ordered substring containment: a response mentioning several
    /// labels resolves to the highest-priority one. Anything unrecognized
    /// defaults to `NeedsFollowup` so a misbehaving classifier can slow the
    /// conversation down but never block it.
    pub fn from_response(response: &str) -> Self {
        let normalized = response.to_ascii_uppercase();
        if normalized.contains("SECTION_COMPLETE") {
            ClassificationLabel::SectionComplete
        } else if normalized.contains("MEDICAL_QUESTION") {
            ClassificationLabel::MedicalQuestion
        } else if normalized.contains("GENERAL_QUESTION") {
            ClassificationLabel::GeneralQuestion
        } else {
            ClassificationLabel::NeedsFollowup
        }
    }
}
