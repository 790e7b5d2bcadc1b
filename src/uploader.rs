use crate::notify::{self, Notifier};
use crate::poller::{JobHandler, PollParams, Poller};
use crate::schedule::{schedule_poll, PollHandle};
use crate::state::FileStateSink;
use crate::{Error, PresignedResponse, QueryParams, Result, UploadFile, UploadRequest};
use reqwest::{multipart, Client, StatusCode, Url};
use std::{sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::*;

/// Placeholder key sent with status queries; the bearer token authenticates.
const POLL_API_KEY: &str = "-";

#[derive(Debug, Clone)]
pub struct UploaderConfig {
    pub upload_timeout: Duration,
    /// Put the job's state slot back to READY when the upload fails.
    pub reset_state_on_failure: bool,
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            upload_timeout: Duration::from_secs(30),
            reset_state_on_failure: false,
        }
    }
}

/// Performs the multipart upload to a pre-signed storage destination.
#[derive(Debug, Clone)]
pub struct Uploader {
    client: Client,
    upload_timeout: Duration,
}

impl Uploader {
    pub fn new(client: Client, upload_timeout: Duration) -> Self {
        Uploader {
            client,
            upload_timeout,
        }
    }

    /// Posts the descriptor's fields followed by the file. Only 204 counts as accepted.
    #[instrument(skip_all, fields(filename = %file.name, size = file.bytes.len()))]
    pub async fn upload(&self, destination: &PresignedResponse, file: &UploadFile) -> Result<()> {
        let target = &destination.presigned_url;
        let url = Url::parse(&target.url)
            .map_err(|err| Error::InvalidDestination(format!("{}: {err}", target.url)))?;

        let mut form = multipart::Form::new();
        for (key, value) in &target.fields {
            form = form.text(key.clone(), value.clone());
        }
        let part = multipart::Part::bytes(file.bytes.clone()).file_name(file.name.clone());
        form = form.part("file", part);

        let response = self
            .client
            .post(url)
            .timeout(self.upload_timeout)
            .multipart(form)
            .send()
            .await
            .map_err(|source| Error::Transport {
                filename: file.name.clone(),
                source,
            })?;

        let status = response.status();
        if status != StatusCode::NO_CONTENT {
            debug!(message = "Upload rejected", status = status.as_u16());
            return Err(Error::UploadRejected {
                filename: file.name.clone(),
                status: status.as_u16(),
            });
        }

        Ok(())
    }
}

/// Uploads a file, marks it in progress, and hands off to the poller.
pub struct JobSubmitter {
    uploader: Uploader,
    poller: Arc<dyn Poller>,
    state: Arc<dyn FileStateSink>,
    notifier: Arc<dyn Notifier>,
    config: UploaderConfig,
}

impl JobSubmitter {
    pub fn new(
        config: UploaderConfig,
        poller: Arc<dyn Poller>,
        state: Arc<dyn FileStateSink>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let uploader = Uploader::new(Client::new(), config.upload_timeout);
        Self::with_uploader(uploader, config, poller, state, notifier)
    }

    pub fn with_uploader(
        uploader: Uploader,
        config: UploaderConfig,
        poller: Arc<dyn Poller>,
        state: Arc<dyn FileStateSink>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        JobSubmitter {
            uploader,
            poller,
            state,
            notifier,
            config,
        }
    }

    pub fn config(&self) -> &UploaderConfig {
        &self.config
    }

    /// Runs the upload stage and, once storage accepts the file, schedules a
    /// status poll after the job type's delay. Returns as soon as the poll is
    /// scheduled; the poll's outcome reaches `handler`.
    pub async fn run_async_request_job(
        &self,
        request: UploadRequest,
        handler: Arc<dyn JobHandler>,
    ) -> Result<PollHandle> {
        self.run_with_cancellation(request, handler, CancellationToken::new())
            .await
    }

    /// Same as [`JobSubmitter::run_async_request_job`], with the scheduled poll
    /// tied to `cancel_token`.
    #[instrument(
        skip_all,
        fields(job_type = %request.job_type, file_id = %request.file_id, index = request.file_index)
    )]
    pub async fn run_with_cancellation(
        &self,
        request: UploadRequest,
        handler: Arc<dyn JobHandler>,
        cancel_token: CancellationToken,
    ) -> Result<PollHandle> {
        let profile = request.job_type.profile();

        if let Err(err) = self
            .uploader
            .upload(&request.destination, &request.file)
            .await
        {
            error!(message = "Upload failed", error = %err, timeout = err.is_timeout());
            self.notifier
                .error(&notify::upload_failed_message(request.filename()));
            if self.config.reset_state_on_failure {
                if let Some((property, _)) = profile.state {
                    self.state
                        .update_file_at_index(request.file_index, property, property.ready());
                }
            }
            return Err(err);
        }

        if let Some((property, in_progress)) = profile.state {
            self.state
                .update_file_at_index(request.file_index, property, in_progress);
        }
        self.notifier
            .success(&notify::submitted_message(request.filename()));

        let params = PollParams {
            api_url: request.api_url,
            api_key: POLL_API_KEY.to_string(),
            query: QueryParams::job_result(request.user_id, request.file_id),
            token: request.token,
            target_pages: request.job_params.and_then(|p| p.target_page_numbers),
        };
        info!(message = "Upload accepted, scheduling poll", delay_ms = profile.poll_delay.as_millis() as u64);

        Ok(schedule_poll(
            self.poller.clone(),
            params,
            profile.poll_delay,
            handler,
            cancel_token,
        ))
    }
}
