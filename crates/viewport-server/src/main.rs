//! `viewport-server`: process wiring for the map-viewport localization
//! core (SPEC_FULL.md §2). Loads config, builds the matching
//! `ApplicationState`, and either runs a single `match_once` (`--once`)
//! or starts the producer thread plus the axum HTTP/WebSocket surface.

mod capture;
mod cli;
mod config;
mod http;

use std::sync::Arc;

use clap::Parser;
use viewport_core::pyramid::default_level_specs;
use viewport_core::transform::ControlPoint;
use viewport_core::{ApplicationState, StartupConfig};

fn build_startup_config(cfg: &config::Config) -> StartupConfig {
    let control_points = cfg
        .control_points
        .iter()
        .map(|p| ControlPoint { lat: p.lat, lng: p.lng, ref_x: p.ref_x, ref_y: p.ref_y })
        .collect();

    let level_specs = default_level_specs();
    let coordinator_config = viewport_core::matching::CoordinatorConfig::default();

    let cascade_overrides = cfg
        .cascade_overrides
        .iter()
        .map(|(name, o)| {
            (
                name.clone(),
                viewport_core::CascadeLevelOverride { tau_conf: o.tau_conf, n_min: o.n_min },
            )
        })
        .collect();

    StartupConfig {
        reference_map_path: cfg.reference_map_path.clone(),
        pyramid_cache_path: cfg.pyramid_cache_path.clone(),
        control_points,
        level_specs,
        coordinator: coordinator_config,
        initial_target_fps: cfg.initial_target_fps.max(cfg.min_fps),
        min_fps: cfg.min_fps,
        max_fps: cfg.max_fps,
        collectibles: Vec::new(),
        cascade_overrides,
    }
}

fn main() -> anyhow::Result<()> {
    let cli = cli::Cli::parse();

    if let Some(level) = &cli.log_level {
        std::env::set_var("RUST_LOG", level);
    } else if std::env::var_os("RUST_LOG").is_none() {
        std::env::set_var("RUST_LOG", "viewport_server=info,viewport_core=info,warn");
    }
    let _logging_guard = env_tracing_logger::init();

    let cfg = config::Config::load(&cli.config)?;

    if cli.rebuild_pyramid_cache && cfg.pyramid_cache_path.exists() {
        tracing::info!(path = %cfg.pyramid_cache_path.display(), "removing pyramid cache before rebuild");
        std::fs::remove_file(&cfg.pyramid_cache_path)?;
    }

    let startup = build_startup_config(&cfg);

    if let Some(image_path) = cli.once.clone() {
        return run_once(startup, image_path);
    }

    let capture_source: Box<dyn viewport_core::frame::CaptureSource> =
        Box::new(capture::UnconfiguredCaptureSource);
    let core = Arc::new(ApplicationState::init(startup, capture_source)?);

    let producer_handle = core.start();

    let rt = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    let serve_result = rt.block_on(async move {
        let addr: std::net::SocketAddr = cfg.http_bind_addr.parse()?;
        let app = http::router(core.clone());
        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!(%addr, "viewport-server listening");

        tokio::select! {
            result = axum::serve(listener, app) => {
                if let Err(e) = result {
                    tracing::error!(error = %e, "HTTP server exited with error");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received ctrl-c, shutting down");
            }
        }
        core.stop();
        anyhow::Ok(())
    });

    producer_handle.join().ok();
    serve_result
}

fn run_once(startup: StartupConfig, image_path: std::path::PathBuf) -> anyhow::Result<()> {
    let capture_source: Box<dyn viewport_core::frame::CaptureSource> =
        Box::new(capture::FileCaptureSource::new(image_path.clone()));
    let core = ApplicationState::init(startup, capture_source)?;

    let decoded = image::open(&image_path)?;
    let gray = decoded.to_luma8();
    let query = viewport_core::cv_backend::preprocess(&gray)?;

    match core.match_once(&query)? {
        Some(result) => {
            println!("{}", serde_json::to_string_pretty(&serde_json::json!({
                "viewport": result.viewport,
                "confidence": result.confidence,
                "inliers": result.inliers,
                "level_used": result.level_used,
                "elapsed_ms": result.elapsed_ms,
                "method": result.method,
            }))?);
        }
        None => {
            println!("{}", serde_json::json!({ "method": "lost" }));
        }
    }
    Ok(())
}
