use thiserror::Error;

/// Failures a caller may want to tell apart when reporting to a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Storage answered with anything other than 204.
    UploadRejected,
    /// Connection failure or the upload budget ran out.
    NetworkOrTimeout,
    /// The job-status stage failed after a successful upload.
    PollFailure,
    /// Bad local input: unreadable file, malformed manifest or URL.
    Local,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Error uploading file: {filename}. Storage responded with status {status}")]
    UploadRejected { filename: String, status: u16 },

    #[error("Error uploading file: {filename}. {source}")]
    Transport {
        filename: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Invalid upload destination: {0}")]
    InvalidDestination(String),

    #[error("Job status query rejected with status {status}: {body}")]
    PollRejected { status: u16, body: String },

    #[error("Job status query failed: {0}")]
    PollTransport(#[source] reqwest::Error),

    #[error("Job status polling aborted: {0}")]
    PollAborted(String),

    #[error("Invalid manifest: {0}")]
    InvalidManifest(String),

    #[error("Job {job_id} failed: {message}")]
    JobFailed { job_id: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn class(&self) -> FailureClass {
        match self {
            Error::UploadRejected { .. } => FailureClass::UploadRejected,
            Error::Transport { .. } => FailureClass::NetworkOrTimeout,
            Error::PollRejected { .. }
            | Error::PollTransport(_)
            | Error::PollAborted(_)
            | Error::JobFailed { .. } => FailureClass::PollFailure,
            Error::InvalidDestination(_)
            | Error::InvalidManifest(_)
            | Error::Io(_)
            | Error::Json(_) => FailureClass::Local,
        }
    }

    pub fn is_timeout(&self) -> bool {
        match self {
            Error::Transport { source, .. } | Error::PollTransport(source) => source.is_timeout(),
            _ => false,
        }
    }
}
