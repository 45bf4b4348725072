// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Background consumer of pending reports.
//!
//! The worker wakes on a signal from the server (a report just landed) or
//! on its periodic timer, walks the pending set, and pushes each report
//! through the transport under the database's lease protocol. Everything
//! except a vanished report is retryable under backoff.

use async_trait::async_trait;
use bytes::Bytes;
use faultline_common::{Error, Result};
use faultline_db::{CrashReportDatabase, Report};
use flate2::write::GzEncoder;
use flate2::Compression;
use http_body_util::{BodyExt, Full};
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Sends one dump to the collection endpoint, returning the
/// server-assigned report id.
#[async_trait]
pub trait UploadTransport: Send + Sync {
    async fn upload(&self, report: &Report, client_id: Uuid, body: Vec<u8>) -> Result<String>;
}

#[derive(Debug, Clone)]
pub struct UploadOptions {
    /// At most one upload attempt per this interval across the database,
    /// unless disabled (`--no-rate-limit`).
    pub rate_limit: Option<Duration>,
    /// Per-request transport deadline.
    pub request_timeout: Duration,
    /// Periodic wake-up when no report signal arrives.
    pub poll_interval: Duration,
    /// Cap for the per-report exponential backoff.
    pub backoff_cap: Duration,
}

impl Default for UploadOptions {
    fn default() -> Self {
        UploadOptions {
            rate_limit: Some(Duration::from_secs(60 * 15)),
            request_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_secs(60 * 5),
            backoff_cap: Duration::from_secs(60 * 60 * 4),
        }
    }
}

pub struct UploadWorker {
    database: Arc<CrashReportDatabase>,
    transport: Arc<dyn UploadTransport>,
    report_notify: Arc<Notify>,
    stop: watch::Receiver<bool>,
    options: UploadOptions,
}

impl UploadWorker {
    pub fn new(
        database: Arc<CrashReportDatabase>,
        transport: Arc<dyn UploadTransport>,
        report_notify: Arc<Notify>,
        stop: watch::Receiver<bool>,
        options: UploadOptions,
    ) -> Self {
        UploadWorker {
            database,
            transport,
            report_notify,
            stop,
            options,
        }
    }

    /// Runs until the stop signal flips. An in-flight transport call is
    /// finished, never abandoned mid-request.
    pub async fn run(mut self) {
        loop {
            self.process_pending().await;
            tokio::select! {
                _ = self.stop.changed() => break,
                _ = self.report_notify.notified() => {}
                _ = tokio::time::sleep(self.options.poll_interval) => {}
            }
            if *self.stop.borrow() {
                break;
            }
        }
        debug!("upload worker stopped");
    }

    async fn process_pending(&self) {
        let settings = self.database.settings();
        match settings.get_uploads_enabled() {
            Ok(true) => {}
            Ok(false) => {
                debug!("uploads disabled, leaving reports pending");
                return;
            }
            Err(e) => {
                warn!(error = %e, "cannot read uploads-enabled setting");
                return;
            }
        }
        let client_id = match settings.get_client_id() {
            Ok(client_id) => client_id,
            Err(e) => {
                warn!(error = %e, "cannot read client id");
                return;
            }
        };

        let pending = match self.database.get_pending_reports() {
            Ok(pending) => pending,
            Err(e) => {
                warn!(error = %e, "cannot enumerate pending reports");
                return;
            }
        };

        for report in pending {
            if *self.stop.borrow() {
                return;
            }
            if !self.attempt_due(&report) {
                continue;
            }
            self.upload_one(report, client_id).await;
        }
    }

    /// Rate limiting plus per-report exponential backoff keyed on
    /// `upload_attempts`.
    fn attempt_due(&self, report: &Report) -> bool {
        let now = now_seconds();

        if let Some(interval) = self.options.rate_limit {
            match self.database.settings().get_last_upload_attempt_time() {
                Ok(last) if now < last.saturating_add(interval.as_secs()) => {
                    debug!(uuid = %report.uuid, "rate limited, skipping attempt");
                    return false;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "cannot read last upload attempt time");
                    return false;
                }
            }
        }

        if report.upload_attempts > 0 {
            let shift = (report.upload_attempts - 1).min(16);
            let backoff = Duration::from_secs(60)
                .saturating_mul(1 << shift)
                .min(self.options.backoff_cap);
            if now < report.last_upload_attempt_time.saturating_add(backoff.as_secs()) {
                debug!(
                    uuid = %report.uuid,
                    attempts = report.upload_attempts,
                    "in backoff, skipping attempt"
                );
                return false;
            }
        }
        true
    }

    async fn upload_one(&self, report: Report, client_id: Uuid) {
        let uuid = report.uuid;
        let mut lease = match self.database.get_report_for_uploading(uuid) {
            Ok(lease) => lease,
            Err(Error::Busy) => {
                debug!(%uuid, "another uploader holds the lease");
                return;
            }
            Err(Error::NotFound) => {
                debug!(%uuid, "report left the pending set");
                return;
            }
            Err(e) => {
                warn!(%uuid, error = %e, "cannot lease report");
                return;
            }
        };

        let mut body = Vec::new();
        if let Err(e) = lease.dump_file().read_to_end(&mut body) {
            warn!(%uuid, error = %e, "cannot read dump bytes");
            let _ = self.database.record_upload_attempt(lease, false, "");
            return;
        }

        let report_meta = lease.report().clone();
        let outcome = tokio::time::timeout(
            self.options.request_timeout,
            self.transport.upload(&report_meta, client_id, body),
        )
        .await
        .unwrap_or_else(|_| Err(Error::Transport("request deadline exceeded".into())));

        let _ = self
            .database
            .settings()
            .set_last_upload_attempt_time(now_seconds());

        match outcome {
            Ok(server_id) => {
                info!(%uuid, server_id, "report uploaded");
                if let Err(e) = self.database.record_upload_attempt(lease, true, &server_id) {
                    warn!(%uuid, error = %e, "cannot record successful attempt");
                }
            }
            Err(e) => {
                warn!(%uuid, error = %e, "upload attempt failed");
                if let Err(e) = self.database.record_upload_attempt(lease, false, "") {
                    warn!(%uuid, error = %e, "cannot record failed attempt");
                }
            }
        }
    }
}

/// Default transport: one POST per report to the collection endpoint, dump
/// bytes as the body, report identity in the query string.
pub struct HttpTransport {
    url: String,
    gzip: bool,
    client: hyper_util::client::legacy::Client<
        hyper_util::client::legacy::connect::HttpConnector,
        Full<Bytes>,
    >,
}

impl HttpTransport {
    pub fn new(url: String, gzip: bool) -> Self {
        let client = hyper_util::client::legacy::Client::builder(
            hyper_util::rt::TokioExecutor::new(),
        )
        .build(hyper_util::client::legacy::connect::HttpConnector::new());
        HttpTransport { url, gzip, client }
    }
}

#[async_trait]
impl UploadTransport for HttpTransport {
    async fn upload(&self, report: &Report, client_id: Uuid, body: Vec<u8>) -> Result<String> {
        let url = format!(
            "{}{}uuid={}&client_id={}",
            self.url,
            if self.url.contains('?') { "&" } else { "?" },
            report.uuid,
            client_id,
        );

        let (body, encoding) = if self.gzip {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder
                .write_all(&body)
                .and_then(|()| encoder.finish())
                .map(|compressed| (compressed, Some("gzip")))
                .map_err(|e| Error::Transport(format!("gzip: {e}")))?
        } else {
            (body, None)
        };

        let mut request = http::Request::builder()
            .method(http::Method::POST)
            .uri(&url)
            .header(http::header::CONTENT_TYPE, "application/octet-stream");
        if let Some(encoding) = encoding {
            request = request.header(http::header::CONTENT_ENCODING, encoding);
        }
        let request = request
            .body(Full::new(Bytes::from(body)))
            .map_err(|e| Error::Transport(format!("build request: {e}")))?;

        let response = self
            .client
            .request(request)
            .await
            .map_err(|e| Error::Transport(format!("send: {e}")))?;

        let status = response.status();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| Error::Transport(format!("read response: {e}")))?
            .to_bytes();

        if !status.is_success() {
            return Err(Error::Transport(format!("server returned {status}")));
        }
        // The endpoint answers with the server-side report id.
        Ok(String::from_utf8_lossy(&body).trim().to_string())
    }
}

fn now_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use std::sync::Mutex;

    struct ScriptedTransport {
        outcomes: Mutex<Vec<Result<String>>>,
        seen: Mutex<Vec<Uuid>>,
    }

    #[async_trait]
    impl UploadTransport for ScriptedTransport {
        async fn upload(&self, report: &Report, _client_id: Uuid, body: Vec<u8>) -> Result<String> {
            assert!(!body.is_empty());
            self.seen.lock().unwrap().push(report.uuid);
            self.outcomes.lock().unwrap().remove(0)
        }
    }

    fn make_report(db: &CrashReportDatabase) -> Uuid {
        let mut new_report = db.prepare_new_report().unwrap();
        new_report.write_all(b"dump bytes").unwrap();
        db.finished_writing_report(new_report).unwrap()
    }

    fn worker_parts(
        dir: &tempfile::TempDir,
        outcomes: Vec<Result<String>>,
    ) -> (Arc<CrashReportDatabase>, Arc<ScriptedTransport>, UploadWorker) {
        let database = Arc::new(CrashReportDatabase::initialize(dir.path()).unwrap());
        database.settings().set_uploads_enabled(true).unwrap();
        let transport = Arc::new(ScriptedTransport {
            outcomes: Mutex::new(outcomes),
            seen: Mutex::new(Vec::new()),
        });
        let worker = UploadWorker::new(
            database.clone(),
            transport.clone(),
            Arc::new(Notify::new()),
            watch::channel(false).1,
            UploadOptions {
                rate_limit: None,
                ..Default::default()
            },
        );
        (database, transport, worker)
    }

    #[tokio::test]
    async fn test_successful_upload_completes_report() {
        let dir = tempfile::tempdir().unwrap();
        let (database, transport, worker) = worker_parts(&dir, vec![Ok("srv-42".into())]);
        let uuid = make_report(&database);

        worker.process_pending().await;

        assert_eq!(transport.seen.lock().unwrap().as_slice(), &[uuid]);
        let report = database.look_up_report(uuid).unwrap();
        assert!(report.uploaded);
        assert_eq!(report.id, "srv-42");
        assert_eq!(report.upload_attempts, 1);
        assert!(database.settings().get_last_upload_attempt_time().unwrap() > 0);
    }

    #[tokio::test]
    async fn test_failed_upload_returns_report_to_pending() {
        let dir = tempfile::tempdir().unwrap();
        let (database, _transport, worker) =
            worker_parts(&dir, vec![Err(Error::Transport("refused".into()))]);
        let uuid = make_report(&database);

        worker.process_pending().await;

        let report = database.look_up_report(uuid).unwrap();
        assert!(!report.uploaded);
        assert_eq!(report.upload_attempts, 1);
        assert_eq!(database.get_pending_reports().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_uploads_disabled_leaves_reports_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let (database, transport, worker) = worker_parts(&dir, vec![Ok("unused".into())]);
        database.settings().set_uploads_enabled(false).unwrap();
        make_report(&database);

        worker.process_pending().await;

        assert!(transport.seen.lock().unwrap().is_empty());
        assert_eq!(database.get_pending_reports().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_backoff_skips_recent_failure() {
        let dir = tempfile::tempdir().unwrap();
        let (database, transport, worker) = worker_parts(
            &dir,
            vec![Err(Error::Transport("refused".into())), Ok("late".into())],
        );
        let uuid = make_report(&database);

        worker.process_pending().await;
        // Second pass immediately after: the report is in backoff.
        worker.process_pending().await;

        assert_eq!(transport.seen.lock().unwrap().len(), 1);
        assert_eq!(database.look_up_report(uuid).unwrap().upload_attempts, 1);
    }

    #[tokio::test]
    async fn test_rate_limit_defers_second_report() {
        let dir = tempfile::tempdir().unwrap();
        let database = Arc::new(CrashReportDatabase::initialize(dir.path()).unwrap());
        database.settings().set_uploads_enabled(true).unwrap();
        let transport = Arc::new(ScriptedTransport {
            outcomes: Mutex::new(vec![Ok("first".into()), Ok("second".into())]),
            seen: Mutex::new(Vec::new()),
        });
        let worker = UploadWorker::new(
            database.clone(),
            transport.clone(),
            Arc::new(Notify::new()),
            watch::channel(false).1,
            UploadOptions {
                rate_limit: Some(Duration::from_secs(3600)),
                ..Default::default()
            },
        );
        make_report(&database);
        make_report(&database);

        worker.process_pending().await;

        // Only one attempt went through; the second hit the rate limit.
        assert_eq!(transport.seen.lock().unwrap().len(), 1);
        assert_eq!(database.get_pending_reports().unwrap().len(), 1);
        assert_eq!(database.get_completed_reports().unwrap().len(), 1);
    }
}
