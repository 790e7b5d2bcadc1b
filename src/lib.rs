use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use indexmap::IndexMap;
use std::{fmt, str::FromStr, time::Duration};
use uuid::Uuid;

pub mod error;
pub mod manifest;
pub mod notify;
pub mod poller;
pub mod schedule;
pub mod server;
pub mod state;
pub mod telemetry;
pub mod uploader;
pub mod worker;

pub use error::{Error, FailureClass, Result};

/// Sentinel job id sent before the backend has assigned one.
pub const UNASSIGNED_JOB_ID: &str = "-";

/// Backend processing pipeline a submitted file enters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    FileExtraction,
    InfoExtraction,
    InstructionExtraction,
    QaGeneration,
    SchemaExtraction,
    SchemaExtractionFrontend,
}

/// Everything that varies per job type, kept in one place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobProfile {
    /// File property to mark in-progress once the upload is accepted, if any.
    pub state: Option<(StateProperty, FileState)>,
    /// Lead time the backend needs before a status query is meaningful.
    pub poll_delay: Duration,
}

impl JobType {
    pub const ALL: [JobType; 6] = [
        JobType::FileExtraction,
        JobType::InfoExtraction,
        JobType::InstructionExtraction,
        JobType::QaGeneration,
        JobType::SchemaExtraction,
        JobType::SchemaExtractionFrontend,
    ];

    pub const fn profile(self) -> JobProfile {
        let state = match self {
            JobType::FileExtraction => Some((
                StateProperty::ExtractState,
                FileState::Extract(ExtractState::Extracting),
            )),
            JobType::InstructionExtraction => Some((
                StateProperty::InstructionExtractionState,
                FileState::Extract(ExtractState::Extracting),
            )),
            JobType::InfoExtraction => Some((
                StateProperty::KeyValueState,
                FileState::Transform(TransformState::Transforming),
            )),
            JobType::QaGeneration => Some((
                StateProperty::QaState,
                FileState::Transform(TransformState::Transforming),
            )),
            JobType::SchemaExtraction | JobType::SchemaExtractionFrontend => None,
        };

        JobProfile {
            state,
            poll_delay: Duration::from_millis(5000),
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            JobType::FileExtraction => "file_extraction",
            JobType::InfoExtraction => "info_extraction",
            JobType::InstructionExtraction => "instruction_extraction",
            JobType::QaGeneration => "qa_generation",
            JobType::SchemaExtraction => "schema_extraction",
            JobType::SchemaExtractionFrontend => "schema_extraction_frontend",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        JobType::ALL
            .into_iter()
            .find(|job_type| job_type.as_str() == s)
            .ok_or_else(|| format!("unknown job type: {s}"))
    }
}

/// Per-file state fields that track a job's progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StateProperty {
    ExtractState,
    InstructionExtractionState,
    KeyValueState,
    QaState,
}

impl StateProperty {
    pub const fn as_str(self) -> &'static str {
        match self {
            StateProperty::ExtractState => "extractState",
            StateProperty::InstructionExtractionState => "instructionExtractionState",
            StateProperty::KeyValueState => "keyValueState",
            StateProperty::QaState => "qaState",
        }
    }

    /// Value a slot holds when no job is running on it.
    pub const fn ready(self) -> FileState {
        match self {
            StateProperty::ExtractState | StateProperty::InstructionExtractionState => {
                FileState::Extract(ExtractState::Ready)
            }
            StateProperty::KeyValueState | StateProperty::QaState => {
                FileState::Transform(TransformState::Ready)
            }
        }
    }
}

impl fmt::Display for StateProperty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExtractState {
    Ready,
    Extracting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransformState {
    Ready,
    Transforming,
}

/// Written out as the bare marker (`"READY"`, `"EXTRACTING"`, ...). Only
/// serialized: `READY` exists in both families, so a marker alone does not
/// say which one it came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(untagged)]
pub enum FileState {
    Extract(ExtractState),
    Transform(TransformState),
}

impl fmt::Display for FileState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FileState::Extract(ExtractState::Ready) | FileState::Transform(TransformState::Ready) => {
                "READY"
            }
            FileState::Extract(ExtractState::Extracting) => "EXTRACTING",
            FileState::Transform(TransformState::Transforming) => "TRANSFORMING",
        };
        f.write_str(name)
    }
}

/// Pre-signed storage destination: target URL plus the form fields the
/// storage backend requires alongside the file. Fields keep the order the
/// backend issued them in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresignedUrl {
    pub url: String,
    #[serde(default)]
    pub fields: IndexMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresignedResponse {
    pub presigned_url: PresignedUrl,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryType {
    JobResult,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryParams {
    pub user_id: String,
    pub file_id: String,
    pub job_id: String,
    pub query_type: QueryType,
}

impl QueryParams {
    /// Query for the result of a job the backend has not yet named.
    pub fn job_result(user_id: impl Into<String>, file_id: impl Into<String>) -> Self {
        QueryParams {
            user_id: user_id.into(),
            file_id: file_id.into(),
            job_id: UNASSIGNED_JOB_ID.to_string(),
            query_type: QueryType::JobResult,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobParams {
    #[serde(default)]
    pub target_page_numbers: Option<Vec<u32>>,
}

#[derive(Clone)]
pub struct UploadFile {
    pub name: String,
    pub bytes: Vec<u8>,
}

impl fmt::Debug for UploadFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadFile")
            .field("name", &self.name)
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// One user-initiated submission. Owned by the call that runs it.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub api_url: String,
    pub job_type: JobType,
    pub user_id: String,
    pub client_id: String,
    pub file_id: String,
    pub destination: PresignedResponse,
    pub file: UploadFile,
    pub token: String,
    pub file_index: usize,
    pub job_params: Option<JobParams>,
}

impl UploadRequest {
    pub fn filename(&self) -> &str {
        &self.file.name
    }
}

/// A submission queued for the batch runner.
#[derive(Debug)]
pub struct JobRequest {
    pub id: Uuid,
    pub submitted_at: DateTime<Utc>,
    pub upload: UploadRequest,
}

impl JobRequest {
    pub fn new(upload: UploadRequest) -> Self {
        JobRequest {
            id: Uuid::new_v4(),
            submitted_at: Utc::now(),
            upload,
        }
    }

    /// Time since submission. A clock that stepped backwards reads as zero.
    pub fn elapsed_since(submitted_at: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
        (now - submitted_at).to_std().unwrap_or_default()
    }
}
