mod cli;

use anyhow::{Context, Result};
use cli::{Cli, Commands};
use env_logger::Env;
use fbcam::config::{Config, DisplayConfig};
use fbcam::cpu::CpuMonitor;
use fbcam::display::CapturePipeline;
use fbcam::lan::{DriverTune, LanMode, RouteFix};
use fbcam::rpc::{RpcEngine, StreamControl};
use log::{debug, info, warn};
use std::path::Path;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse_args();

    let default_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(Env::default().default_filter_or(default_level))
        .format_timestamp_millis()
        .init();

    match cli.command {
        Commands::Run(args) => run(args.into_config()).await,
        Commands::Snapshot { output, display } => snapshot(&display.display_config(), &output),
    }
}

async fn run(config: Config) -> Result<()> {
    info!("fbcam {} starting", env!("CARGO_PKG_VERSION"));

    if config.lan.enable || config.lan.tune_wifi {
        let lan_config = config.lan.clone();
        tokio::task::spawn_blocking(move || startup_network(&lan_config))
            .await
            .context("LAN startup task failed")?;
    }

    let pipeline = if config.display.enabled {
        match CapturePipeline::init(&config.display) {
            Ok(pipeline) => Some(Arc::new(pipeline)),
            Err(e) => {
                warn!("display capture disabled: {}", e);
                None
            }
        }
    } else {
        None
    };

    if let Some(pipeline) = pipeline.as_ref() {
        if config.display.autostart {
            pipeline
                .start(config.display.fps)
                .context("failed to start display capture")?;
        }
    }

    let rpc = if config.rpc_enabled {
        let stream = pipeline.clone().map(|p| p as Arc<dyn StreamControl>);
        let engine = RpcEngine::new(config.rpc.clone(), stream);
        engine.start().context("failed to start rpc engine")?;
        Some(engine)
    } else {
        None
    };

    let mut cpu = CpuMonitor::new();
    let mut ticker = tokio::time::interval(config.status_interval);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
            _ = ticker.tick() => {
                log_status(&mut cpu, rpc.as_ref(), pipeline.as_deref());
            }
        }
    }

    // The responder may still be driving the pipeline; stop it first.
    if let Some(rpc) = rpc {
        tokio::task::spawn_blocking(move || rpc.stop())
            .await
            .context("rpc shutdown task failed")?;
    }

    if let Some(pipeline) = pipeline {
        match Arc::try_unwrap(pipeline) {
            Ok(pipeline) => {
                tokio::task::spawn_blocking(move || pipeline.cleanup())
                    .await
                    .context("display shutdown task failed")?;
            }
            Err(pipeline) => pipeline.stop(),
        }
    }

    Ok(())
}

fn startup_network(lan: &fbcam::config::LanConfig) {
    let mode = LanMode::new(lan);

    if lan.tune_wifi {
        match mode.fix_route_priority() {
            RouteFix::Fixed => info!("wifi route priority fixed"),
            RouteFix::NothingToFix => debug!("wifi routes already fine"),
            RouteFix::Retry => warn!("route tools unavailable, route priority unchanged"),
        }
        match mode.optimize_driver() {
            DriverTune::Done => debug!("wifi driver checked"),
            DriverTune::Skipped => debug!("wifi driver tuning skipped"),
            DriverTune::Retry => warn!("wifi driver tuning deferred"),
        }
    }

    if lan.enable {
        if let Err(e) = mode.enable() {
            warn!("could not enable LAN mode: {}", e);
        }
    }
}

fn log_status(cpu: &mut CpuMonitor, rpc: Option<&RpcEngine>, pipeline: Option<&CapturePipeline>) {
    let total = cpu.update().unwrap_or_else(|e| {
        debug!("cpu sample failed: {}", e);
        cpu.total()
    });
    let own = cpu.process(std::process::id() as i32);

    let rpc_state = rpc.map_or("off".to_string(), |r| {
        let status = r.status();
        format!("{} ({} requests)", status.state, status.requests_handled)
    });
    let display = pipeline.map_or("off".to_string(), |p| {
        let status = p.status();
        let last = p
            .frames()
            .latest()
            .map_or("none".to_string(), |f| format!("{}ms ago", f.age().num_milliseconds()));
        format!(
            "{} {}x{} @{}fps, {} frames, {} failed, last {}",
            if status.running { "streaming" } else { "idle" },
            status.width,
            status.height,
            status.fps,
            status.frames_produced,
            status.frames_failed,
            last
        )
    });

    info!(
        "cpu {:.1}% (self {:.1}%) | rpc {} | display {}",
        total, own, rpc_state, display
    );
}

fn snapshot(display: &DisplayConfig, output: &Path) -> Result<()> {
    let pipeline = CapturePipeline::init(display).context("failed to open display")?;

    // Room for the raw RGB frame; the JPEG is far smaller.
    let (width, height) = pipeline.output_dims();
    let mut buf = vec![0u8; (width * height * 3) as usize];
    let size = pipeline
        .try_capture_frame(&mut buf)
        .context("failed to capture display frame")?;

    std::fs::write(output, &buf[..size])
        .with_context(|| format!("failed to write {}", output.display()))?;
    info!(
        "wrote {} ({} bytes, {})",
        output.display(),
        size,
        pipeline.orientation()
    );

    pipeline.cleanup();
    Ok(())
}
