use crate::poller::JobStatusResponse;
use crate::schedule::PollHandle;
use crate::uploader::JobSubmitter;
use crate::worker::{self, WorkMessage};
use crate::{Error, JobRequest};
use anyhow::Error as AnyError;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::*;
use uuid::Uuid;

#[derive(Debug)]
pub enum WorkResponseMessage {
    UploadAccepted(Uuid),
    UploadFailed(Uuid, Error),
    JobSucceeded(Uuid, JobStatusResponse),
    JobFailed(Uuid, Error),
    JobTimedOut(Uuid),
}

impl WorkResponseMessage {
    pub fn job_id(&self) -> Uuid {
        match self {
            WorkResponseMessage::UploadAccepted(id)
            | WorkResponseMessage::UploadFailed(id, _)
            | WorkResponseMessage::JobSucceeded(id, _)
            | WorkResponseMessage::JobFailed(id, _)
            | WorkResponseMessage::JobTimedOut(id) => *id,
        }
    }

    /// True when no further message will follow for this job.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, WorkResponseMessage::UploadAccepted(_))
    }
}

/// Jobs handed to a worker that have not reached a terminal state.
/// `None` while the upload is still running.
type Outstanding = HashMap<Uuid, Option<PollHandle>>;

/// Runs submissions with at most `workers_count` uploads in flight. Returns
/// once the client channel is closed and every job has finished, or when
/// `cancel_token` fires, which also cancels every pending poll.
pub async fn serve(
    cancel_token: CancellationToken,
    submitter: Arc<JobSubmitter>,
    workers_count: u16,
    mut recv_from_client: mpsc::UnboundedReceiver<JobRequest>,
    send_to_client: mpsc::UnboundedSender<WorkResponseMessage>,
) -> Result<(), AnyError> {
    let workers_count = workers_count.max(1);
    let (send_to_server, mut recv_from_worker) = mpsc::unbounded_channel::<WorkMessage>();
    let (send_to_queue, recv_from_queue) =
        async_channel::bounded::<JobRequest>(workers_count as usize);

    let mut workers = vec![];
    for _ in 0..workers_count {
        let send_to_server = send_to_server.clone();
        let cancel_token = cancel_token.clone();
        let recv_from_queue = recv_from_queue.clone();
        let submitter = submitter.clone();
        let join_handle = tokio::spawn(
            async move {
                worker::start(cancel_token, submitter, recv_from_queue, send_to_server).await;
            }
            .instrument(info_span!("worker")),
        );
        workers.push(join_handle);
    }

    let mut free_workers = workers_count as i64;
    let mut queued: VecDeque<JobRequest> = VecDeque::new();
    let mut outstanding: Outstanding = HashMap::new();
    let mut accepting = true;

    loop {
        while free_workers > 0 {
            let Some(job) = queued.pop_front() else {
                break;
            };
            outstanding.insert(job.id, None);
            send_to_queue.send(job).await?;
            free_workers -= 1;
        }

        if !accepting && queued.is_empty() && outstanding.is_empty() {
            debug!("All jobs finished");
            break;
        }

        tokio::select! {
            _ = cancel_token.cancelled() => {
                debug!("Server Cancelled");
                for handle in outstanding.values().flatten() {
                    handle.cancel();
                }
                break;
            },
            chan_msg = recv_from_worker.recv() => {
                let Some(msg) = chan_msg else {
                    debug!("Worker channel closed unexpectedly, exiting");
                    cancel_token.cancel();
                    break;
                };
                let response = match msg {
                    WorkMessage::JobStarted(job_id) => {
                        debug!(message = "Starting job", job_id = %job_id);
                        None
                    },
                    WorkMessage::UploadAccepted(job_id, handle) => {
                        debug!(message = "Upload accepted", job_id = %job_id, delay_ms = handle.delay().as_millis() as u64);
                        free_workers += 1;
                        // The poll may already have reported back.
                        if let Some(slot) = outstanding.get_mut(&job_id) {
                            *slot = Some(handle);
                        }
                        Some(WorkResponseMessage::UploadAccepted(job_id))
                    },
                    WorkMessage::UploadFailed(job_id, err) => {
                        debug!(message = "Upload failed", job_id = %job_id, error = %err);
                        free_workers += 1;
                        outstanding.remove(&job_id);
                        Some(WorkResponseMessage::UploadFailed(job_id, err))
                    },
                    WorkMessage::JobSucceeded(job_id, response) => {
                        debug!(message = "Completed job", job_id = %job_id);
                        outstanding.remove(&job_id);
                        Some(WorkResponseMessage::JobSucceeded(job_id, response))
                    },
                    WorkMessage::JobFailed(job_id, err) => {
                        debug!(message = "Failed job", job_id = %job_id, error = %err);
                        outstanding.remove(&job_id);
                        Some(WorkResponseMessage::JobFailed(job_id, err))
                    },
                    WorkMessage::JobTimedOut(job_id) => {
                        debug!(message = "Job timed out", job_id = %job_id);
                        outstanding.remove(&job_id);
                        Some(WorkResponseMessage::JobTimedOut(job_id))
                    },
                };

                if let Some(response) = response {
                    if let Err(err) = send_to_client.send(response) {
                        error!(message = "Failed to send response to client", error = ?err);
                        cancel_token.cancel();
                        break;
                    }
                }
            },
            chan_msg = recv_from_client.recv(), if accepting => {
                match chan_msg {
                    None => {
                        debug!("Client channel closed, draining outstanding jobs");
                        accepting = false;
                    },
                    Some(job_request) => {
                        debug!(message = "Requested job", job_id = %job_request.id, filename = %job_request.upload.filename());
                        queued.push_back(job_request);
                    }
                }
            }
        }
    }

    send_to_queue.close();

    // Wait for all workers to complete
    futures::future::join_all(workers)
        .await
        .into_iter()
        .collect::<Result<Vec<_>, _>>()?;

    info!("Server stopped.");

    Ok(())
}
