//! Shared fakes for the integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use jobpoll::poller::{JobHandler, JobStatus, JobStatusResponse, PollOutcome, PollParams, Poller};
use jobpoll::state::FileStateSink;
use jobpoll::{
    Error, FileState, JobType, PresignedResponse, PresignedUrl, StateProperty, UploadFile,
    UploadRequest,
};
use indexmap::IndexMap;
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
pub struct RecordingSink {
    pub updates: Mutex<Vec<(usize, StateProperty, FileState)>>,
}

impl RecordingSink {
    pub fn updates(&self) -> Vec<(usize, StateProperty, FileState)> {
        self.updates.lock().unwrap().clone()
    }
}

impl FileStateSink for RecordingSink {
    fn update_file_at_index(&self, index: usize, property: StateProperty, value: FileState) {
        self.updates.lock().unwrap().push((index, property, value));
    }
}

/// Records every poll and answers with success.
#[derive(Default)]
pub struct RecordingPoller {
    pub calls: Mutex<Vec<PollParams>>,
}

impl RecordingPoller {
    pub fn calls(&self) -> Vec<PollParams> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Poller for RecordingPoller {
    async fn poll(&self, params: PollParams, _cancel_token: CancellationToken) -> PollOutcome {
        self.calls.lock().unwrap().push(params);
        PollOutcome::Succeeded(succeeded("job-1"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Callback {
    Success(Option<String>),
    Error(String),
    Timeout,
}

#[derive(Default)]
pub struct RecordingHandler {
    pub calls: Mutex<Vec<Callback>>,
}

impl RecordingHandler {
    pub fn calls(&self) -> Vec<Callback> {
        self.calls.lock().unwrap().clone()
    }
}

impl JobHandler for RecordingHandler {
    fn on_success(&self, response: JobStatusResponse) {
        self.calls
            .lock()
            .unwrap()
            .push(Callback::Success(response.job_id));
    }

    fn on_error(&self, error: Error) {
        self.calls
            .lock()
            .unwrap()
            .push(Callback::Error(error.to_string()));
    }

    fn on_timeout(&self) {
        self.calls.lock().unwrap().push(Callback::Timeout);
    }
}

pub fn succeeded(job_id: &str) -> JobStatusResponse {
    JobStatusResponse {
        status: JobStatus::Succeeded,
        job_id: Some(job_id.to_string()),
        result: None,
        message: None,
    }
}

pub fn destination(url: String) -> PresignedResponse {
    let mut fields = IndexMap::new();
    fields.insert("key".to_string(), "uploads/u1/f1".to_string());
    fields.insert("policy".to_string(), "cG9saWN5".to_string());
    PresignedResponse {
        presigned_url: PresignedUrl { url, fields },
    }
}

pub fn upload_request(
    storage_url: String,
    job_type: JobType,
    file_index: usize,
    name: &str,
) -> UploadRequest {
    UploadRequest {
        api_url: "http://api.invalid".to_string(),
        job_type,
        user_id: "u1".to_string(),
        client_id: "c1".to_string(),
        file_id: format!("file-{file_index}"),
        destination: destination(storage_url),
        file: UploadFile {
            name: name.to_string(),
            bytes: b"%PDF-1.4 test".to_vec(),
        },
        token: "tok".to_string(),
        file_index,
        job_params: None,
    }
}
