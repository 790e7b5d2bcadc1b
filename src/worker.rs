use crate::poller::{JobHandler, JobStatusResponse};
use crate::schedule::PollHandle;
use crate::uploader::JobSubmitter;
use crate::{Error, JobRequest};
use async_channel::Receiver;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::*;
use uuid::Uuid;

#[derive(Debug)]
pub enum WorkMessage {
    JobStarted(Uuid),
    UploadAccepted(Uuid, PollHandle),
    UploadFailed(Uuid, Error),
    JobSucceeded(Uuid, JobStatusResponse),
    JobFailed(Uuid, Error),
    JobTimedOut(Uuid),
}

/// Routes the poll callbacks of one job back to the server.
struct ChannelHandler {
    job_id: Uuid,
    send_to_server: UnboundedSender<WorkMessage>,
}

impl ChannelHandler {
    fn send(&self, msg: WorkMessage) {
        if let Err(err) = self.send_to_server.send(msg) {
            warn!(message = "Server gone, dropping job outcome", job_id = %self.job_id, outcome = ?err.0);
        }
    }
}

impl JobHandler for ChannelHandler {
    fn on_success(&self, response: JobStatusResponse) {
        self.send(WorkMessage::JobSucceeded(self.job_id, response));
    }

    fn on_error(&self, error: Error) {
        self.send(WorkMessage::JobFailed(self.job_id, error));
    }

    fn on_timeout(&self) {
        self.send(WorkMessage::JobTimedOut(self.job_id));
    }
}

pub async fn start(
    cancel_token: CancellationToken,
    submitter: Arc<JobSubmitter>,
    recv_from_queue: Receiver<JobRequest>,
    send_to_server: UnboundedSender<WorkMessage>,
) {
    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                debug!("Worker Cancelled");
                break;
            },
            job = recv_from_queue.recv() => {
                let job = match job {
                    Ok(job) => job,
                    Err(_) => {
                        debug!("Job queue closed, worker exiting");
                        break;
                    }
                };

                let job_id = job.id;
                if send_to_server.send(WorkMessage::JobStarted(job_id)).is_err() {
                    error!(message = "Server gone, worker exiting", job_id = %job_id);
                    break;
                }

                let msg = match process(&submitter, job, &send_to_server, cancel_token.child_token()).await {
                    Ok(handle) => WorkMessage::UploadAccepted(job_id, handle),
                    Err(err) => WorkMessage::UploadFailed(job_id, err),
                };
                if let Err(err) = send_to_server.send(msg) {
                    error!(message = "Server gone, worker exiting", job_id = %job_id);
                    if let WorkMessage::UploadAccepted(_, handle) = err.0 {
                        handle.cancel();
                    }
                    break;
                }
            }
        }
    }
    info!("Worker stopped.");
}

#[instrument(skip_all, fields(job_id = %job.id, filename = %job.upload.filename()))]
async fn process(
    submitter: &JobSubmitter,
    job: JobRequest,
    send_to_server: &UnboundedSender<WorkMessage>,
    cancel_token: CancellationToken,
) -> Result<PollHandle, Error> {
    let handler = Arc::new(ChannelHandler {
        job_id: job.id,
        send_to_server: send_to_server.clone(),
    });
    submitter
        .run_with_cancellation(job.upload, handler, cancel_token)
        .await
}
