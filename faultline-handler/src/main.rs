// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use anyhow::Context;
use clap::Parser;
use faultline_db::CrashReportDatabase;
use faultline_handler::prune::{PruneOptions, PruneWorker};
use faultline_handler::server::{ExceptionHandlerServer, ServerOptions};
use faultline_handler::upload::{HttpTransport, UploadOptions, UploadWorker};
use std::collections::BTreeMap;
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tracing::{error, info};

/// Exit code of the last-chance panic hook, distinct from startup
/// failures so a supervisor can tell them apart.
const EXIT_HANDLER_CRASHED: i32 = 70;

#[derive(Parser, Debug)]
#[command(name = "faultline-handler", about = "Out-of-process crash handler")]
struct Args {
    /// Crash report database root.
    #[arg(long)]
    database: PathBuf,

    /// Upload endpoint; omit to disable uploads entirely.
    #[arg(long)]
    url: Option<String>,

    /// KEY=VALUE pair stamped into every report. Repeatable.
    #[arg(long = "annotation", value_parser = parse_annotation)]
    annotations: Vec<(String, String)>,

    /// Attempt every pending report on each pass instead of one per
    /// rate-limit interval.
    #[arg(long)]
    no_rate_limit: bool,

    /// Send dump bodies uncompressed.
    #[arg(long)]
    no_upload_gzip: bool,

    /// Unix socket the handler serves on. May be omitted when
    /// `--initial-client-data` is given (single-shot mode).
    #[arg(long)]
    socket_path: Option<PathBuf>,

    /// Inherited, already-connected client socket fd (set by clients that
    /// spawn the handler at crash time).
    #[arg(long)]
    initial_client_data: Option<RawFd>,

    /// Deadline for a connecting peer to complete registration, in
    /// seconds. Registered clients may idle indefinitely.
    #[arg(long, default_value_t = 30)]
    registration_timeout: u64,
}

fn parse_annotation(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("annotation {raw:?} is not KEY=VALUE"))
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // The handler must outlive its clients; a crash inside the handler is
    // recorded and surfaced through a distinct exit code rather than a
    // silent unwind.
    std::panic::set_hook(Box::new(|panic| {
        error!(%panic, "handler panicked");
        std::process::exit(EXIT_HANDLER_CRASHED);
    }));

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("build runtime")?;
    runtime.block_on(run(args))
}

async fn run(args: Args) -> anyhow::Result<()> {
    anyhow::ensure!(
        args.socket_path.is_some() || args.initial_client_data.is_some(),
        "one of --socket-path or --initial-client-data is required"
    );
    let database = Arc::new(
        CrashReportDatabase::initialize(&args.database)
            .with_context(|| format!("initialize database at {}", args.database.display()))?,
    );
    let report_notify = Arc::new(Notify::new());
    let (stop_tx, stop_rx) = watch::channel(false);
    let mut workers = Vec::new();

    match &args.url {
        Some(url) if !url.is_empty() => {
            let transport = Arc::new(HttpTransport::new(url.clone(), !args.no_upload_gzip));
            let options = UploadOptions {
                rate_limit: if args.no_rate_limit {
                    None
                } else {
                    UploadOptions::default().rate_limit
                },
                ..Default::default()
            };
            workers.push(tokio::spawn(
                UploadWorker::new(
                    database.clone(),
                    transport,
                    report_notify.clone(),
                    stop_rx.clone(),
                    options,
                )
                .run(),
            ));
        }
        _ => info!("no upload endpoint configured, reports stay pending"),
    }

    workers.push(tokio::spawn(
        PruneWorker::new(database.clone(), stop_rx.clone(), PruneOptions::default()).run(),
    ));

    let annotations: BTreeMap<String, String> = args.annotations.into_iter().collect();
    let server = ExceptionHandlerServer::new(
        database,
        annotations,
        report_notify,
        ServerOptions {
            socket_path: args.socket_path,
            initial_client_fd: args.initial_client_data,
            registration_timeout: Some(Duration::from_secs(args.registration_timeout)),
        },
    );
    info!(token = server.shutdown_token(), "handler starting");

    tokio::select! {
        result = server.run() => result.context("exception handler server")?,
        _ = tokio::signal::ctrl_c() => info!("interrupted, shutting down"),
    }

    // Drain the workers; each finishes any in-flight transport call first.
    let _ = stop_tx.send(true);
    for worker in workers {
        let _ = worker.await;
    }
    Ok(())
}
