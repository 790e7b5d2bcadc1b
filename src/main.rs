use anyhow::{Context, Error};
use chrono::Utc;
use clap::Parser;

use jobpoll::manifest::{Manifest, SubmitContext};
use jobpoll::notify::TracingNotifier;
use jobpoll::poller::{HttpPoller, PollerConfig};
use jobpoll::server::{self, WorkResponseMessage};
use jobpoll::state::FileTable;
use jobpoll::telemetry;
use jobpoll::uploader::{JobSubmitter, UploaderConfig};
use jobpoll::JobRequest;
use std::{collections::HashMap, env, path::PathBuf, sync::Arc, time::Duration};
use tokio::{
    signal::unix::{signal, SignalKind},
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, instrument, Instrument};

#[derive(Parser, Clone, Debug, PartialEq)]
#[command(author, version, about)]
pub struct ConfigContext {
    #[arg(long = "api-url", help = "Base URL of the job API")]
    api_url: String,

    #[arg(long, env = "JOBPOLL_TOKEN", help = "Auth token for job status queries")]
    token: String,

    #[arg(long = "user-id")]
    user_id: String,

    #[arg(long = "client-id", default_value = "-")]
    client_id: String,

    #[arg(
        short = 'm',
        long,
        help = "JSON manifest listing files and their pre-signed destinations"
    )]
    manifest: PathBuf,

    #[arg(
        short = 'n',
        long = "number_active",
        help = "Number of uploads in parallel",
        default_value = "3"
    )]
    num: u16,

    #[arg(long = "upload-timeout", help = "Upload timeout in seconds", default_value = "30")]
    upload_timeout: u64,

    #[arg(long = "poll-timeout", help = "Overall poll budget in seconds", default_value = "300")]
    poll_timeout: u64,

    #[arg(long = "poll-interval", help = "Initial poll interval in milliseconds", default_value = "2000")]
    poll_interval: u64,

    #[arg(long = "reset-on-failure", help = "Reset file state to READY when an upload fails")]
    reset_on_failure: bool,

    #[arg(long = "jaeger-endpoint", help = "Jaeger collector endpoint for span export")]
    jaeger_endpoint: Option<String>,
}

#[instrument(skip_all)]
async fn setup(config: ConfigContext, cancel_token: CancellationToken) -> Result<(), Error> {
    let manifest = Manifest::load(&config.manifest)
        .await
        .with_context(|| format!("loading manifest {}", config.manifest.display()))?;
    let files = Arc::new(FileTable::new(manifest.filenames()));

    let base_dir = config
        .manifest
        .parent()
        .map(PathBuf::from)
        .unwrap_or_default();
    let ctx = SubmitContext {
        api_url: config.api_url.clone(),
        token: config.token.clone(),
        user_id: config.user_id.clone(),
        client_id: config.client_id.clone(),
    };
    let requests = manifest.into_requests(&base_dir, &ctx).await?;

    let poller = HttpPoller::new(PollerConfig {
        interval: Duration::from_millis(config.poll_interval),
        timeout: Duration::from_secs(config.poll_timeout),
        ..PollerConfig::default()
    });
    let submitter = Arc::new(JobSubmitter::new(
        UploaderConfig {
            upload_timeout: Duration::from_secs(config.upload_timeout),
            reset_state_on_failure: config.reset_on_failure,
        },
        Arc::new(poller),
        files.clone(),
        Arc::new(TracingNotifier),
    ));

    // Channel for sending requests to be processed
    let (send_to_server, recv_from_client) = mpsc::unbounded_channel();

    // Channel for getting response from server
    let (send_to_client, mut recv_from_server) = mpsc::unbounded_channel();

    let server_spawn = {
        let cancel_token = cancel_token.clone();
        tokio::spawn(
            async move {
                if let Err(err) = server::serve(
                    cancel_token,
                    submitter,
                    config.num,
                    recv_from_client,
                    send_to_client,
                )
                .await
                {
                    error!("Error running server: {}", err);
                }
            }
            .instrument(info_span!("server")),
        )
    };

    let mut submitted = HashMap::new();
    for upload in requests {
        let job = JobRequest::new(upload);
        submitted.insert(job.id, (job.upload.filename().to_string(), job.submitted_at));
        send_to_server.send(job)?;
    }
    drop(send_to_server);
    debug!("Done setting tasks");

    let mut succeeded = 0usize;
    let mut failed = 0usize;
    while let Some(msg) = recv_from_server.recv().await {
        let job_id = msg.job_id();
        let (name, elapsed) = match submitted.get(&job_id) {
            Some((name, at)) => (name.as_str(), JobRequest::elapsed_since(*at, Utc::now())),
            None => ("?", Duration::ZERO),
        };
        let elapsed_ms = elapsed.as_millis() as u64;
        match &msg {
            WorkResponseMessage::UploadAccepted(_) => {
                info!(event = "Uploaded", file = name, job_id = %job_id, elapsed_ms);
            }
            WorkResponseMessage::JobSucceeded(_, response) => {
                succeeded += 1;
                info!(event = "Succeeded", file = name, job_id = %job_id, remote_job = ?response.job_id, elapsed_ms);
                println!("{name}: succeeded after {:.1}s", elapsed.as_secs_f64());
            }
            WorkResponseMessage::UploadFailed(_, err) | WorkResponseMessage::JobFailed(_, err) => {
                failed += 1;
                println!("{name}: failed after {:.1}s ({err})", elapsed.as_secs_f64());
            }
            WorkResponseMessage::JobTimedOut(_) => {
                failed += 1;
                println!("{name}: timed out after {:.1}s", elapsed.as_secs_f64());
            }
        }
    }

    server_spawn.await?;

    for (index, file) in files.snapshot().iter().enumerate() {
        debug!(
            message = "Final file state",
            index,
            file = %file.name,
            extract = %file.extract_state,
            instruction = %file.instruction_extraction_state,
            key_value = %file.key_value_state,
            qa = %file.qa_state
        );
    }
    println!("{succeeded} succeeded, {failed} failed");

    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    if env::var("RUST_LOG").is_err() {
        env::set_var("RUST_LOG", "jobpoll=DEBUG");
    }

    let config = ConfigContext::parse();
    telemetry::init(config.jaeger_endpoint.as_deref())?;

    let token = CancellationToken::new();

    let cloned_token = token.clone();
    let app = tokio::spawn(setup(config, cloned_token));

    tokio::spawn(async move {
        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
                (Err(err), _) | (_, Err(err)) => {
                    error!("Unable to install signal handlers: {}", err);
                    return;
                }
            };
        tokio::select! {
            _ = sigterm.recv() => {println!("Received SIGTERM"); token.cancel()},
            _ = sigint.recv() => {println!("Received SIGINT"); token.cancel()},
        }
    });
    app.await??;
    println!("Shutting down.");
    telemetry::shutdown();

    Ok(())
}
