use serde::{Deserialize, Serialize};

use crate::error::FlowError;

/// One stage of the fixed consultation sequence. The order is total and the
/// last value is terminal: `next` never moves past `Complete`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Section {
    ChiefComplaint,
    History,
    Subjective,
    VitalSigns,
    Physical,
    Objective,
    Assessment,
    Plan,
    Doubts,
    Medications,
    Notes,
    Complete,
}

/// Presentation format a section's structured summary must follow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SectionFormat {
    NumberedList,
    BulletList,
    Paragraph,
}

/// The full consultation sequence, in order.
pub const SECTION_ORDER: [Section; 12] = [
    Section::ChiefComplaint,
    Section::History,
    Section::Subjective,
    Section::VitalSigns,
    Section::Physical,
    Section::Objective,
    Section::Assessment,
    Section::Plan,
    Section::Doubts,
    Section::Medications,
    Section::Notes,
    Section::Complete,
];

impl Section {
    pub fn as_str(&self) -> &'static str {
        match self {
            Section::ChiefComplaint => "chief_complaint",
            Section::History => "history",
            Section::Subjective => "subjective",
            Section::VitalSigns => "vital_signs",
            Section::Physical => "physical",
            Section::Objective => "objective",
            Section::Assessment => "assessment",
            Section::Plan => "plan",
            Section::Doubts => "doubts",
            Section::Medications => "medications",
            Section::Notes => "notes",
            Section::Complete => "complete",
        }
    }

    /// Parse a raw identifier. Exact or case-insensitive matches only.
    pub fn parse(raw: &str) -> Result<Self, FlowError> {
        let normalized = raw.trim().to_ascii_lowercase();
        SECTION_ORDER
            .iter()
            .copied()
            .find(|s| s.as_str() == normalized)
            .ok_or_else(|| FlowError::InvalidSection(raw.to_string()))
    }

    /// The successor in the consultation sequence. Idempotent at the
    /// terminal section.
    pub fn next(&self) -> Section {
        let idx = SECTION_ORDER.iter().position(|s| s == self).unwrap_or(0);
        if idx + 1 < SECTION_ORDER.len() {
            SECTION_ORDER[idx + 1]
        } else {
            Section::Complete
        }
    }

    pub fn is_terminal(&self) -> bool {
        *self == Section::Complete
    }

    /// Summary format for this section. Sections without a mapping (`doubts`,
    /// `complete`) fall back to paragraph.
    pub fn format(&self) -> SectionFormat {
        match self {
            Section::ChiefComplaint => SectionFormat::NumberedList,
            Section::History => SectionFormat::Paragraph,
            Section::Subjective => SectionFormat::Paragraph,
            Section::VitalSigns => SectionFormat::BulletList,
            Section::Physical => SectionFormat::BulletList,
            Section::Objective => SectionFormat::BulletList,
            Section::Assessment => SectionFormat::NumberedList,
            Section::Plan => SectionFormat::NumberedList,
            Section::Medications => SectionFormat::NumberedList,
            Section::Notes => SectionFormat::Paragraph,
            _ => SectionFormat::Paragraph,
        }
    }

    /// Semantic description used as context when generating the opening
    /// prompt for this section.
    pub fn description(&self) -> &'static str {
        match self {
            Section::ChiefComplaint => "the main reason the patient is seeking care",
            Section::History => "the history of the present illness",
            Section::Subjective => "subjective information reported by the patient",
            Section::VitalSigns => "the patient's vital signs",
            Section::Physical => "findings from the physical examination",
            Section::Objective => "objective findings from tests or measurements",
            Section::Assessment => "the clinician's assessment of the patient's condition",
            Section::Plan => "the treatment plan for the patient",
            Section::Doubts => "medical questions or doubts the clinician has about this case",
            Section::Medications => "medications being prescribed or continued",
            Section::Notes => "any additional notes for the record",
            Section::Complete => "the consultation record is complete",
        }
    }

    /// Fixed opening question for this section, used when prompt generation
    /// is unavailable.
    pub fn fallback_prompt(&self) -> &'static str {
        match self {
            Section::ChiefComplaint => "What is the chief complaint of the patient?",
            Section::History => "What is the history of the present illness?",
            Section::Subjective => "What subjective information did the patient report?",
            Section::VitalSigns => "What are the patient's vital signs?",
            Section::Physical => "What were your findings from the physical examination?",
            Section::Objective => "What objective findings do you have from tests or measurements?",
            Section::Assessment => "What is your assessment of the patient's condition?",
            Section::Plan => "What is your treatment plan for the patient?",
            Section::Doubts => "Do you have any medical questions or doubts about this case?",
            Section::Medications => "What medications are you prescribing or continuing?",
            Section::Notes => "Are there any additional notes you'd like to include?",
            Section::Complete => {
                "The consultation is complete. You can review the record or generate the summary document."
            }
        }
    }
}

impl std::fmt::Display for Section {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl SectionFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            SectionFormat::NumberedList => "numbered_list",
            SectionFormat::BulletList => "bullet_list",
            SectionFormat::Paragraph => "paragraph",
        }
    }
}

impl std::fmt::Display for SectionFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
