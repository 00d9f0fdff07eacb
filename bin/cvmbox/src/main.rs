//! cvmbox - nested workspace container supervisor
//!
//! Starts sysbox and an inner dockerd inside the outer container, builds the
//! workspace container on top of them and keeps supervising the daemons
//! until one of them exits or the process is asked to stop.

mod cli;

use std::collections::BTreeMap;
use std::future::Future;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use cvmbox_agent::{
    run_workspace, wait_ready, BuildPipeline, ContainerClient, DaemonConfig, DaemonSet,
    DockerClient, LogReporter, OsFilesystem, OsMounter, PipelineDeps, ProgressReporter,
    ReadinessConfig,
};
use cvmbox_observability::{
    init_logging, log_fatal, BuildLogConfig, BuildLogSink, BuildLogWriter, HttpLogPublisher,
};

use crate::cli::{Cli, Commands, DockerArgs};

const READY_INTERVAL: Duration = Duration::from_millis(500);

// ---------------------------------------------------------------------------
// Entrypoint
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let _log_guard = match init_logging(&cli.logging_config()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let result = match cli.command {
        Commands::Docker(args) => cmd_docker(args).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log_fatal(&format!("{e:#}"));
            ExitCode::FAILURE
        }
    }
}

// ---------------------------------------------------------------------------
// docker subcommand
// ---------------------------------------------------------------------------

/// Progress reporting into the remote build log
struct BuildLogProgress(BuildLogWriter);

impl ProgressReporter for BuildLogProgress {
    fn report(&self, message: &str) {
        info!(progress = true, "{message}");
        self.0.info(message);
    }
}

async fn cmd_docker(args: DockerArgs) -> Result<()> {
    let host_env: BTreeMap<String, String> = std::env::vars().collect();
    let config = args.build_config(host_env)?;

    let sink = args.build_log_url.as_ref().map(|url| {
        BuildLogSink::spawn(
            Arc::new(HttpLogPublisher::new(url, &args.agent_token)),
            BuildLogConfig::default(),
        )
    });
    let progress: Arc<dyn ProgressReporter> = match &sink {
        Some(sink) => Arc::new(BuildLogProgress(sink.writer())),
        None => Arc::new(LogReporter),
    };

    let socket = args
        .docker_socket
        .to_str()
        .context("Docker socket path is not valid UTF-8")?;
    let daemons = DaemonSet::new(DaemonConfig {
        socket: args.docker_socket.clone(),
        ..Default::default()
    });
    let client: Arc<dyn ContainerClient> =
        Arc::new(DockerClient::connect(socket).context("Failed to connect to dockerd")?);

    let cancel = CancellationToken::new();
    let result =
        build_and_supervise(&args, config, &daemons, client, progress.clone(), &cancel).await;

    if let (Err(e), Some(sink)) = (&result, &sink) {
        sink.writer().error(&format!("{e:#}"));
    }
    drop(progress);
    if let Some(sink) = sink {
        if let Err(e) = sink.close().await {
            warn!(error = %e, "failed to flush build logs");
        }
    }

    daemons.shutdown().await;
    result
}

async fn build_and_supervise(
    args: &DockerArgs,
    config: cvmbox_agent::BuildConfig,
    daemons: &DaemonSet,
    client: Arc<dyn ContainerClient>,
    progress: Arc<dyn ProgressReporter>,
    cancel: &CancellationToken,
) -> Result<()> {
    progress.report("Starting container runtime");
    daemons.start().await.context("Failed to start daemons")?;
    wait_ready(client.as_ref(), READY_INTERVAL, args.ready_timeout())
        .await
        .context("dockerd did not become ready")?;

    let deps = PipelineDeps::new(
        Arc::clone(&client),
        Arc::new(OsFilesystem),
        Arc::new(OsMounter::default()),
    )
    .with_progress(progress);
    let pipeline = BuildPipeline::new(config, deps);
    let readiness = ReadinessConfig {
        interval: READY_INTERVAL,
        timeout: args.ready_timeout(),
    };

    let build = async {
        tokio::select! {
            result = run_workspace(&pipeline, daemons, client.as_ref(), &readiness, cancel) => {
                result.context("Failed to build workspace")
            }
            err = daemons.watch_mandatory() => Err(err.into()),
            err = daemons.watch_dockerd() => Err(err.into()),
        }
    };
    let handle = interruptible(build, tokio::signal::ctrl_c(), cancel).await?;
    info!(
        container = %handle.container_id,
        image = %pipeline.config().image,
        "workspace is running"
    );

    tokio::select! {
        err = daemons.watch_mandatory() => Err(err.into()),
        err = daemons.watch_dockerd() => Err(err.into()),
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            Ok(())
        }
    }
}

/// Run `work` unless `interrupt` resolves first, in which case `cancel` is
/// cancelled and the build counts as failed
async fn interruptible<T>(
    work: impl Future<Output = Result<T>>,
    interrupt: impl Future<Output = std::io::Result<()>>,
    cancel: &CancellationToken,
) -> Result<T> {
    tokio::select! {
        result = work => result,
        signal = interrupt => {
            cancel.cancel();
            if let Err(e) = signal {
                bail!("failed to listen for interrupts: {e}");
            }
            bail!("interrupted while building workspace")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_interrupt_fails_the_build() {
        let cancel = CancellationToken::new();
        let err = interruptible(std::future::pending::<Result<()>>(), async { Ok(()) }, &cancel)
            .await
            .unwrap_err();

        assert!(err.to_string().contains("interrupted"));
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_finished_build_is_not_interrupted() {
        let cancel = CancellationToken::new();
        let value = interruptible(async { Ok(7) }, std::future::pending(), &cancel)
            .await
            .unwrap();

        assert_eq!(value, 7);
        assert!(!cancel.is_cancelled());
    }
}
