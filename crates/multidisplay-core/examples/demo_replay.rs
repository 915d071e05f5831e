//! Demo capture replay
//!
//! Records a few seconds of simulated sensor data, writes it to a capture
//! file, loads it back and replays it at 4x speed.
//!
//! Usage:
//!   cargo run --example demo_replay -- [SAMPLES]

use anyhow::Context;
use multidisplay_core::prelude::*;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let count: usize = match std::env::args().nth(1) {
        Some(arg) => arg.parse().context("SAMPLES must be a number")?,
        None => 80,
    };

    let dir = std::env::temp_dir().join("multidisplay-demo");
    std::fs::create_dir_all(&dir)?;

    let mut engine = Engine::new(EngineConfig {
        capture_dir: Some(dir.clone()),
        replay_speed: 4.0,
        ..Default::default()
    });

    for sample in DemoSimulator::new().generate(count, 50) {
        engine.store().append(sample);
    }
    let path = engine.save_capture_default()?;
    println!("Wrote {} samples to {}", count, path.display());

    engine.clear();
    let report = engine.open_capture(&path)?;
    println!(
        "Loaded {} samples ({} warnings)",
        report.samples,
        report.warnings.len()
    );

    let mut events = engine.subscribe();
    engine.start_replay(false)?;

    loop {
        match events.recv().await {
            Ok(EngineEvent::Sample { sample, .. }) => {
                println!(
                    "{:>7.2}s  rpm {:>6.0}  boost {:>5.2} bar  lambda {:>4.2}",
                    sample.timestamp_ms as f64 / 1000.0,
                    sample.rpm(),
                    sample.boost(),
                    sample.lambda()
                );
            }
            Ok(EngineEvent::Replay(ReplayStatus::Idle)) => break,
            Ok(_) => {}
            Err(RecvError::Lagged(missed)) => {
                tracing::warn!("Display fell behind, skipped {} events", missed);
            }
            Err(RecvError::Closed) => break,
        }
    }

    engine.replay().finished().await;
    println!("Replay finished");
    Ok(())
}
