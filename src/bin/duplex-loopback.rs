//! Duplex Loopback Demo
//!
//! Opens a full-duplex pass-through stream and logs its statistics until
//! Ctrl-C. `--simulate` runs against virtual hardware instead of the
//! desktop backend; `--config <path>` reads settings from a TOML file.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use duplex_audio_io::{
    audio::device::list_devices,
    backend::{simulated::Clock, simulated::SimulatedHostConfig, BackendSelector, SimulatedHost},
    config::AppConfig,
    DuplexStream, SampleBuffer, StreamEvent,
};

struct Args {
    simulate: bool,
    config: Option<PathBuf>,
}

fn parse_args() -> Result<Args> {
    let mut args = Args {
        simulate: false,
        config: None,
    };
    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--simulate" => args.simulate = true,
            "--config" => {
                let path = iter.next().context("--config needs a path")?;
                args.config = Some(PathBuf::from(path));
            }
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }
    Ok(args)
}

fn print_devices() {
    println!("\n=== Available Audio Devices ===");
    let devices = list_devices();
    if devices.is_empty() {
        println!("  (none)");
    }
    for device in &devices {
        let device_type = match (device.is_input, device.is_output) {
            (true, true) => "Input/Output",
            (true, false) => "Input",
            (false, true) => "Output",
            _ => "Unknown",
        };
        let default_marker = if device.is_default { " [DEFAULT]" } else { "" };
        println!("  {} ({}){}:", device.name, device_type, default_marker);
        println!("    ID: {}", device.id);
        println!("    Sample rates: {:?}", device.sample_rates);
        println!("    Channels: {:?}", device.channels);
    }
    println!();
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting duplex loopback");

    let args = parse_args()?;
    let app_config = match &args.config {
        Some(path) => AppConfig::load_from_path(path)?,
        None => AppConfig::load_default()?,
    };
    let stream_config = app_config.stream_config();

    let selector = if args.simulate {
        tracing::info!("Using simulated hardware");
        let host = SimulatedHost::new(SimulatedHostConfig {
            clock: Clock::Threaded,
            capture_jitter: 0.2,
            ..SimulatedHostConfig::default()
        });
        BackendSelector::with_native_host(Arc::new(host))
    } else {
        print_devices();
        BackendSelector::for_platform().context("no audio backend in this build (try --simulate)")?
    };

    let processor = |buf: &mut SampleBuffer<'_>, _frames: usize, _rate: u32| {
        buf.pass_through();
        buf.input.is_some_and(|input| input.iter().any(|s| *s != 0.0))
    };
    let stream = DuplexStream::open(stream_config, processor, selector)?;
    if let Some(negotiated) = stream.negotiated() {
        tracing::info!(
            "Negotiated {} (capture {:?}, render {:?}, {} frames buffered, {:?})",
            negotiated.backend,
            negotiated.capture,
            negotiated.render,
            negotiated.buffer_frames,
            negotiated.policy
        );
    }
    stream.start()?;

    let mut stats_timer = tokio::time::interval(Duration::from_secs(app_config.stats_interval_secs.max(1)));
    stats_timer.tick().await;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Ctrl-C received, shutting down");
                break;
            }
            _ = stats_timer.tick() => {
                for event in stream.events().try_iter() {
                    match event {
                        StreamEvent::RecoveryFailed { reason } => tracing::error!("Recovery failed: {}", reason),
                        other => tracing::info!("Event: {:?}", other),
                    }
                }
                let stats = stream.stats();
                tracing::info!(
                    "State: {} | Callbacks: {} | Processed: {} | Dropouts: {} | Overruns: {} | Restarts: {} | Buffer: {} frames",
                    stream.state(),
                    stats.callbacks,
                    stats.processed,
                    stats.dropouts,
                    stats.overruns,
                    stats.restarts,
                    stats.buffer_frames
                );
            }
        }
    }

    stream.close();
    Ok(())
}
