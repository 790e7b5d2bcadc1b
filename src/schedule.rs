use crate::poller::{JobHandler, PollOutcome, PollParams, PollResolution, Poller};
use crate::Error;
use futures::FutureExt;
use std::{any::Any, panic::AssertUnwindSafe, sync::Arc, time::Duration};
use tokio::{task::JoinHandle, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing::*;

/// Handle to a poll that has been scheduled but possibly not started yet.
/// Dropping the handle does not cancel the poll; call [`PollHandle::cancel`].
#[derive(Debug)]
pub struct PollHandle {
    params: PollParams,
    delay: Duration,
    cancel_token: CancellationToken,
    join: JoinHandle<PollResolution>,
}

impl PollHandle {
    pub fn params(&self) -> &PollParams {
        &self.params
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Waits for the poll to reach a terminal state.
    pub async fn join(self) -> PollResolution {
        match self.join.await {
            Ok(resolution) => resolution,
            Err(err) if err.is_panic() => {
                error!(message = "Poll task panicked", error = ?err);
                PollResolution::Failed
            }
            Err(err) => {
                error!(message = "Poll task did not complete", error = ?err);
                PollResolution::Cancelled
            }
        }
    }
}

/// Starts `poller` after `delay` without blocking the caller. The terminal
/// outcome goes to `handler`; cancelling `cancel_token` (or any parent of it)
/// before or during the poll stops it without firing a callback.
pub fn schedule_poll(
    poller: Arc<dyn Poller>,
    params: PollParams,
    delay: Duration,
    handler: Arc<dyn JobHandler>,
    cancel_token: CancellationToken,
) -> PollHandle {
    let join = {
        let params = params.clone();
        let cancel_token = cancel_token.clone();
        let span = info_span!("poll", file_id = %params.query.file_id);
        tokio::spawn(
            async move {
                tokio::select! {
                    _ = cancel_token.cancelled() => {
                        debug!("Poll cancelled before it started");
                        return PollResolution::Cancelled;
                    },
                    _ = sleep(delay) => {},
                }

                debug!(message = "Starting poll", delay_ms = delay.as_millis() as u64);
                let outcome = match AssertUnwindSafe(poller.poll(params, cancel_token))
                    .catch_unwind()
                    .await
                {
                    Ok(outcome) => outcome,
                    Err(panic) => {
                        let reason = panic_reason(panic.as_ref());
                        error!(message = "Poller panicked", reason = %reason);
                        PollOutcome::Failed(Error::PollAborted(reason))
                    }
                };
                outcome.dispatch(handler.as_ref())
            }
            .instrument(span),
        )
    };

    PollHandle {
        params,
        delay,
        cancel_token,
        join,
    }
}

fn panic_reason(panic: &(dyn Any + Send)) -> String {
    if let Some(reason) = panic.downcast_ref::<&str>() {
        reason.to_string()
    } else if let Some(reason) = panic.downcast_ref::<String>() {
        reason.clone()
    } else {
        "poller panicked".to_string()
    }
}
