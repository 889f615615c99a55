//! Domain types shared by the upload pipeline and the sync side.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Rejected target descriptor or batch. Never becomes a task.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("invalid value for {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("batch contains no files")]
    EmptyBatch,

    #[error("file {0} is empty")]
    EmptyFile(String),
}

/// Lifecycle tag of a facility photo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Taken before the on-site survey
    PreSurvey,
    /// Taken during the survey
    Survey,
    /// Taken after the work is completed
    Completion,
}

impl Phase {
    /// Path segment for this phase. Pre-survey and survey photos share a folder.
    pub fn storage_segment(self) -> &'static str {
        match self {
            Phase::PreSurvey | Phase::Survey => "survey",
            Phase::Completion => "completion",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::PreSurvey => "pre_survey",
            Phase::Survey => "survey",
            Phase::Completion => "completion",
        }
    }
}

impl FromStr for Phase {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pre_survey" | "presurvey" | "pre-survey" => Ok(Phase::PreSurvey),
            "survey" => Ok(Phase::Survey),
            "completion" | "complete" => Ok(Phase::Completion),
            other => Err(ValidationError::InvalidField {
                field: "phase",
                reason: format!("unknown phase '{other}'"),
            }),
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a photo belongs inside a business scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Placement {
    /// A numbered facility inside a numbered outlet
    Facility {
        kind: String,
        outlet_number: u32,
        facility_number: u32,
    },
    /// Non-facility photo filed under a category
    Category(String),
}

/// Target descriptor as submitted by a caller. Every field is optional until
/// [`TargetDescriptor::validate`] has run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetDescriptor {
    pub business_id: Option<Uuid>,
    pub phase: Option<String>,
    pub facility_kind: Option<String>,
    pub outlet_number: Option<u32>,
    pub facility_number: Option<u32>,
    pub category: Option<String>,
}

impl TargetDescriptor {
    /// Check required fields and produce a typed target.
    ///
    /// A facility kind requires both numbers; without a facility kind a
    /// non-empty category is required.
    pub fn validate(&self) -> Result<UploadTarget, ValidationError> {
        let business_id = self
            .business_id
            .ok_or(ValidationError::MissingField("business_id"))?;
        if business_id.is_nil() {
            return Err(ValidationError::InvalidField {
                field: "business_id",
                reason: "nil uuid".to_string(),
            });
        }

        let phase: Phase = self
            .phase
            .as_deref()
            .ok_or(ValidationError::MissingField("phase"))?
            .parse()?;

        let facility_kind = self
            .facility_kind
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty());

        let placement = match facility_kind {
            Some(kind) => {
                let outlet_number = self
                    .outlet_number
                    .ok_or(ValidationError::MissingField("outlet_number"))?;
                let facility_number = self
                    .facility_number
                    .ok_or(ValidationError::MissingField("facility_number"))?;
                Placement::Facility {
                    kind: kind.to_string(),
                    outlet_number,
                    facility_number,
                }
            }
            None => {
                let category = self
                    .category
                    .as_deref()
                    .map(str::trim)
                    .filter(|c| !c.is_empty())
                    .ok_or(ValidationError::MissingField("category"))?;
                Placement::Category(category.to_string())
            }
        };

        Ok(UploadTarget {
            business_id,
            phase,
            placement,
        })
    }
}

/// Validated destination of an upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadTarget {
    pub business_id: Uuid,
    pub phase: Phase,
    pub placement: Placement,
}

impl UploadTarget {
    pub fn facility_association(&self) -> FacilityAssociation {
        match &self.placement {
            Placement::Facility {
                kind,
                outlet_number,
                facility_number,
            } => FacilityAssociation::Facility {
                kind: kind.clone(),
                outlet_number: *outlet_number,
                facility_number: *facility_number,
            },
            Placement::Category(category) => FacilityAssociation::Category(category.clone()),
        }
    }
}

/// Facility association stored on the metadata row: a JSON object for
/// facility photos, a plain string for category photos.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FacilityAssociation {
    Facility {
        kind: String,
        outlet_number: u32,
        facility_number: u32,
    },
    Category(String),
}

/// Bytes handed in by a caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub filename: String,
    pub mime_type: String,
    pub bytes: Bytes,
}

impl SourceFile {
    pub fn new(
        filename: impl Into<String>,
        mime_type: impl Into<String>,
        bytes: impl Into<Bytes>,
    ) -> Self {
        Self {
            filename: filename.into(),
            mime_type: mime_type.into(),
            bytes: bytes.into(),
        }
    }

    pub fn size(&self) -> usize {
        self.bytes.len()
    }
}

/// Canonical, server-confirmed file entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: Uuid,
    pub business_id: Uuid,
    /// Stored object name (`{timestamp}_{filename}`)
    pub filename: String,
    pub original_filename: String,
    /// SHA-256 of the stored bytes, lowercase hex
    pub content_hash: String,
    pub storage_path: String,
    pub size_bytes: i64,
    pub mime_type: String,
    pub upload_status: String,
    pub facility: FacilityAssociation,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Metadata row about to be inserted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewFileRecord {
    pub business_id: Uuid,
    pub filename: String,
    pub original_filename: String,
    pub content_hash: String,
    pub storage_path: String,
    pub size_bytes: i64,
    pub mime_type: String,
    pub facility: FacilityAssociation,
}

/// Remote change notification, normalized from the provider payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    Insert(FileRecord),
    Update(FileRecord),
    /// Deletes usually only carry the primary key.
    Delete { id: Uuid, business_id: Option<Uuid> },
}

impl ChangeEvent {
    pub fn id(&self) -> Uuid {
        match self {
            ChangeEvent::Insert(r) | ChangeEvent::Update(r) => r.id,
            ChangeEvent::Delete { id, .. } => *id,
        }
    }

    pub fn business_id(&self) -> Option<Uuid> {
        match self {
            ChangeEvent::Insert(r) | ChangeEvent::Update(r) => Some(r.business_id),
            ChangeEvent::Delete { business_id, .. } => *business_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ChangeEvent::Insert(_) => "insert",
            ChangeEvent::Update(_) => "update",
            ChangeEvent::Delete { .. } => "delete",
        }
    }
}
