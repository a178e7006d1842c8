use std::{process, sync::Arc, time::Duration};

use kessel::{
    cache::{CacheSystem, HttpFetcher, IntegrityManifest, ManifestDrift},
    config,
    infra::{
        error::InfraError,
        http::{self, HttpState},
        telemetry,
    },
};
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &InfraError) {
    if dispatcher::has_been_set() {
        error!(error = %error, code = error.code(), "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, code = error.code(), "application error");
    });
}

async fn run() -> Result<(), InfraError> {
    let (cli_args, settings) = config::load_with_cli().map_err(|err| {
        InfraError::configuration(format!("failed to load configuration: {err}"))
    })?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::Manifest(args) => run_manifest(args),
    }
}

async fn run_serve(settings: config::Settings) -> Result<(), InfraError> {
    let origin = format!("http://{}", settings.server.addr);
    let client = reqwest::Client::builder()
        .user_agent(HttpFetcher::user_agent())
        .build()
        .map_err(|err| InfraError::configuration(format!("http client: {err}")))?;
    let fetcher = HttpFetcher::new(client, &origin)
        .map_err(|err| InfraError::configuration(format!("warming origin: {err}")))?;

    let mut builder = CacheSystem::builder(settings.cache.clone(), Arc::new(fetcher));
    if let Some(path) = settings.assets.manifest_path.as_ref() {
        builder = builder.manifest(path);
    }
    let system = Arc::new(builder.build());
    let tasks = system.spawn_background();

    let router = http::build_router(HttpState::new(
        Arc::clone(&system),
        settings.assets.root.clone(),
    ));
    let listener = tokio::net::TcpListener::bind(settings.server.addr).await?;
    info!(
        addr = %settings.server.addr,
        assets = %settings.assets.root.display(),
        "kessel listening"
    );

    let result = axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(InfraError::from);

    drain_on_shutdown(&system, settings.server.graceful_shutdown).await;
    tasks.shutdown().await;
    result
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

/// Give queued invalidations a bounded chance to land before exit.
async fn drain_on_shutdown(system: &CacheSystem, limit: Duration) {
    match tokio::time::timeout(limit, system.bus().drain()).await {
        Ok(report) => info!(processed = report.processed, "invalidation queue flushed"),
        Err(_) => warn!(
            pending = system.bus().queue_len(),
            "invalidation queue not drained before shutdown"
        ),
    }
}

fn run_manifest(args: config::ManifestArgs) -> Result<(), InfraError> {
    match args.command {
        config::ManifestCommand::Build(build) => {
            let manifest = IntegrityManifest::generate(&build.dir)?;
            manifest.save(&build.out)?;
            info!(
                dir = %build.dir.display(),
                out = %build.out.display(),
                assets = manifest.len(),
                "integrity manifest written"
            );
            Ok(())
        }
        config::ManifestCommand::Verify(verify) => {
            let manifest = IntegrityManifest::load(&verify.manifest)?;
            let drift = manifest.verify_tree(&verify.dir)?;
            for item in &drift {
                match item {
                    ManifestDrift::Missing(path) => warn!(asset = %path, "listed asset missing"),
                    ManifestDrift::Changed(path) => warn!(asset = %path, "asset digest changed"),
                    ManifestDrift::Unlisted(path) => warn!(asset = %path, "asset not in manifest"),
                }
            }
            if drift.is_empty() {
                info!(assets = manifest.len(), "integrity manifest verified");
                Ok(())
            } else {
                Err(InfraError::ManifestDrift {
                    drifted: drift.len(),
                })
            }
        }
    }
}
