//! Upload stage tests against a mock storage endpoint.

mod common;

#[cfg(test)]
mod tests {
    use super::common::*;
    use jobpoll::notify::{ChannelNotifier, Notification};
    use jobpoll::poller::PollResolution;
    use jobpoll::state::FileTable;
    use jobpoll::uploader::{JobSubmitter, Uploader, UploaderConfig};
    use jobpoll::{
        ExtractState, FailureClass, FileState, JobType, QueryParams, StateProperty,
        TransformState, UploadFile,
    };
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc::{self, UnboundedReceiver};
    use wiremock::matchers::{body_string_contains, header_regex, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct Harness {
        submitter: JobSubmitter,
        sink: Arc<RecordingSink>,
        poller: Arc<RecordingPoller>,
        notifications: UnboundedReceiver<Notification>,
    }

    fn harness(config: UploaderConfig) -> Harness {
        let sink = Arc::new(RecordingSink::default());
        let poller = Arc::new(RecordingPoller::default());
        let (tx, notifications) = mpsc::unbounded_channel();
        let submitter = JobSubmitter::new(
            config,
            poller.clone(),
            sink.clone(),
            Arc::new(ChannelNotifier::new(tx)),
        );
        Harness {
            submitter,
            sink,
            poller,
            notifications,
        }
    }

    fn drain(rx: &mut UnboundedReceiver<Notification>) -> Vec<Notification> {
        let mut out = vec![];
        while let Ok(n) = rx.try_recv() {
            out.push(n);
        }
        out
    }

    async fn storage(status: u16) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/bucket"))
            .respond_with(ResponseTemplate::new(status))
            .mount(&server)
            .await;
        server
    }

    #[tokio::test]
    async fn accepted_upload_marks_state_and_schedules_poll() {
        let server = storage(204).await;
        let mut h = harness(UploaderConfig::default());
        let handler = Arc::new(RecordingHandler::default());

        let request = upload_request(
            format!("{}/bucket", server.uri()),
            JobType::QaGeneration,
            2,
            "report.pdf",
        );
        let handle = h
            .submitter
            .run_async_request_job(request, handler.clone())
            .await
            .unwrap();

        assert_eq!(
            h.sink.updates(),
            vec![(
                2,
                StateProperty::QaState,
                FileState::Transform(TransformState::Transforming)
            )]
        );
        assert_eq!(
            drain(&mut h.notifications),
            vec![Notification::Success("report.pdf submitted!".into())]
        );
        assert_eq!(handle.delay(), Duration::from_millis(5000));
        assert_eq!(handle.params().query, QueryParams::job_result("u1", "file-2"));
        assert_eq!(handle.params().api_key, "-");
        assert_eq!(handle.params().token, "tok");

        // Returned before the poll could start.
        assert!(h.poller.calls().is_empty());
        handle.cancel();
        assert_eq!(handle.join().await, PollResolution::Cancelled);
        assert!(h.poller.calls().is_empty());
        assert!(handler.calls().is_empty());
    }

    #[tokio::test]
    async fn poll_runs_after_delay_with_job_result_query() {
        let server = storage(204).await;
        let h = harness(UploaderConfig::default());
        let handler = Arc::new(RecordingHandler::default());

        let request = upload_request(
            format!("{}/bucket", server.uri()),
            JobType::FileExtraction,
            0,
            "scan.pdf",
        );
        let handle = h
            .submitter
            .run_async_request_job(request, handler.clone())
            .await
            .unwrap();

        tokio::time::pause();
        tokio::time::sleep(Duration::from_millis(4999)).await;
        assert!(h.poller.calls().is_empty());

        assert_eq!(handle.join().await, PollResolution::Succeeded);
        let calls = h.poller.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].query.job_id, "-");
        assert_eq!(calls[0].query.file_id, "file-0");
        assert_eq!(handler.calls(), vec![Callback::Success(Some("job-1".into()))]);
        assert_eq!(
            h.sink.updates(),
            vec![(
                0,
                StateProperty::ExtractState,
                FileState::Extract(ExtractState::Extracting)
            )]
        );
    }

    #[tokio::test]
    async fn success_status_other_than_204_is_rejected() {
        for status in [200u16, 201, 403, 500] {
            let server = storage(status).await;
            let mut h = harness(UploaderConfig::default());

            let request = upload_request(
                format!("{}/bucket", server.uri()),
                JobType::InfoExtraction,
                0,
                "a.pdf",
            );
            let err = h
                .submitter
                .run_async_request_job(request, Arc::new(RecordingHandler::default()))
                .await
                .unwrap_err();

            assert_eq!(err.class(), FailureClass::UploadRejected, "status {status}");
            assert!(h.sink.updates().is_empty());
            assert_eq!(
                drain(&mut h.notifications),
                vec![Notification::Error(
                    "Error uploading file: a.pdf. Please try again.".into()
                )]
            );
            assert!(h.poller.calls().is_empty());
        }
    }

    #[tokio::test]
    async fn slow_storage_hits_upload_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(204).set_delay(Duration::from_secs(3)))
            .mount(&server)
            .await;

        let mut h = harness(UploaderConfig {
            upload_timeout: Duration::from_millis(200),
            ..UploaderConfig::default()
        });
        let request = upload_request(server.uri(), JobType::QaGeneration, 0, "big.pdf");
        let err = h
            .submitter
            .run_async_request_job(request, Arc::new(RecordingHandler::default()))
            .await
            .unwrap_err();

        assert!(err.is_timeout());
        assert_eq!(err.class(), FailureClass::NetworkOrTimeout);
        assert!(h.sink.updates().is_empty());
        assert_eq!(drain(&mut h.notifications).len(), 1);
    }

    #[tokio::test]
    async fn unreachable_storage_is_a_network_failure() {
        let mut h = harness(UploaderConfig::default());
        let request = upload_request(
            "http://127.0.0.1:1/bucket".into(),
            JobType::QaGeneration,
            0,
            "a.pdf",
        );
        let err = h
            .submitter
            .run_async_request_job(request, Arc::new(RecordingHandler::default()))
            .await
            .unwrap_err();

        assert_eq!(err.class(), FailureClass::NetworkOrTimeout);
        assert!(h.sink.updates().is_empty());
        assert!(matches!(
            drain(&mut h.notifications).as_slice(),
            [Notification::Error(_)]
        ));
    }

    #[tokio::test]
    async fn malformed_destination_is_reported_without_upload() {
        let mut h = harness(UploaderConfig::default());
        let request = upload_request("not a url".into(), JobType::QaGeneration, 0, "a.pdf");
        let err = h
            .submitter
            .run_async_request_job(request, Arc::new(RecordingHandler::default()))
            .await
            .unwrap_err();

        assert_eq!(err.class(), FailureClass::Local);
        assert_eq!(drain(&mut h.notifications).len(), 1);
    }

    #[tokio::test]
    async fn failure_can_reset_state_to_ready() {
        let server = storage(400).await;
        let h = harness(UploaderConfig {
            reset_state_on_failure: true,
            ..UploaderConfig::default()
        });
        let request = upload_request(
            format!("{}/bucket", server.uri()),
            JobType::InstructionExtraction,
            1,
            "a.pdf",
        );
        assert!(h
            .submitter
            .run_async_request_job(request, Arc::new(RecordingHandler::default()))
            .await
            .is_err());

        assert_eq!(
            h.sink.updates(),
            vec![(
                1,
                StateProperty::InstructionExtractionState,
                FileState::Extract(ExtractState::Ready)
            )]
        );
    }

    #[tokio::test]
    async fn schema_jobs_poll_without_state_update() {
        let server = storage(204).await;
        let mut h = harness(UploaderConfig::default());
        let request = upload_request(
            format!("{}/bucket", server.uri()),
            JobType::SchemaExtraction,
            0,
            "a.pdf",
        );
        let handle = h
            .submitter
            .run_async_request_job(request, Arc::new(RecordingHandler::default()))
            .await
            .unwrap();

        assert!(h.sink.updates().is_empty());
        assert_eq!(drain(&mut h.notifications).len(), 1);
        assert_eq!(handle.delay(), Duration::from_millis(5000));
        handle.cancel();
    }

    #[tokio::test]
    async fn form_sends_fields_before_file() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/bucket"))
            .and(header_regex("content-type", "^multipart/form-data; boundary="))
            .and(body_string_contains("name=\"key\""))
            .and(body_string_contains("uploads/u1/f1"))
            .and(body_string_contains("name=\"file\"; filename=\"doc.pdf\""))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let uploader = Uploader::new(reqwest::Client::new(), Duration::from_secs(30));
        uploader
            .upload(
                &destination(format!("{}/bucket", server.uri())),
                &UploadFile {
                    name: "doc.pdf".into(),
                    bytes: b"%PDF".to_vec(),
                },
            )
            .await
            .unwrap();

        let received = server.received_requests().await.unwrap();
        let body = String::from_utf8_lossy(&received[0].body).into_owned();
        let policy_at = body.find("name=\"policy\"").unwrap();
        let file_at = body.find("name=\"file\"").unwrap();
        assert!(policy_at < file_at);
        assert!(body.contains("%PDF"));
    }

    #[tokio::test]
    async fn concurrent_submissions_keep_their_own_slots() {
        let server = storage(204).await;
        let table = Arc::new(FileTable::new(vec!["a.pdf".into(), "b.pdf".into()]));
        let (tx, _rx) = mpsc::unbounded_channel();
        let submitter = Arc::new(JobSubmitter::new(
            UploaderConfig::default(),
            Arc::new(RecordingPoller::default()),
            table.clone(),
            Arc::new(ChannelNotifier::new(tx)),
        ));

        let url = format!("{}/bucket", server.uri());
        let first = submitter.run_async_request_job(
            upload_request(url.clone(), JobType::QaGeneration, 0, "a.pdf"),
            Arc::new(RecordingHandler::default()),
        );
        let second = submitter.run_async_request_job(
            upload_request(url, JobType::FileExtraction, 1, "b.pdf"),
            Arc::new(RecordingHandler::default()),
        );
        let (first, second) = tokio::join!(first, second);
        first.unwrap().cancel();
        second.unwrap().cancel();

        let files = table.snapshot();
        assert_eq!(
            files[0].qa_state,
            FileState::Transform(TransformState::Transforming)
        );
        assert_eq!(files[0].extract_state, StateProperty::ExtractState.ready());
        assert_eq!(
            files[1].extract_state,
            FileState::Extract(ExtractState::Extracting)
        );
        assert_eq!(files[1].qa_state, StateProperty::QaState.ready());
    }
}
