use anyhow::Result;
use concentrator::core::{Measurement, MeasurementKey, Ticks};
use concentrator::engine::{ChannelPublisher, Concentrator, ConcentratorConfig};
use concentrator::timing::TimerRegistry;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const SOURCES: u32 = 4;
const FRAMES_PER_SECOND: u32 = 30;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    println!("Measurement Concentrator Demo");
    println!("=============================\n");

    let config = ConcentratorConfig {
        expected_measurements_per_frame: SOURCES as usize,
        ..ConcentratorConfig::new(FRAMES_PER_SECOND, 0.5, 1.0)
    };

    let registry = TimerRegistry::new();
    let (publisher, mut frames) = ChannelPublisher::channel(256);

    let concentrator = Arc::new(
        Concentrator::builder(config, publisher)
            .timer_registry(registry.clone())
            .build()?,
    );
    concentrator.start()?;

    // Synthetic feed: every source reports once per frame interval
    let running = Arc::new(AtomicBool::new(true));
    let feed = {
        let pacing = registry.attach_input(FRAMES_PER_SECOND, None)?;
        let concentrator = concentrator.clone();
        let running = running.clone();

        thread::Builder::new().name("synthetic-feed".to_string()).spawn(move || {
            let keys: Vec<MeasurementKey> = (1..=SOURCES).map(|id| MeasurementKey::new("PMU", id)).collect();
            let mut sample = 0u64;

            while running.load(Ordering::Acquire) {
                if !pacing.wait_for_frame(Duration::from_millis(100)) {
                    continue;
                }

                let timestamp = pacing.last_frame_time();
                let batch: Vec<Measurement> = keys
                    .iter()
                    .map(|key| Measurement::new(key.clone(), timestamp, 60.0 + (sample % 10) as f64 * 0.001))
                    .collect();

                concentrator.sort_measurements(&batch);
                sample += 1;
            }
        })?
    };

    let mut received = 0;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);

    while let Ok(Some(frame)) = tokio::time::timeout_at(deadline, frames.recv()).await {
        received += 1;
        if received % FRAMES_PER_SECOND as usize == 1 {
            println!(
                "frame {} @ {} - {} measurements, {} down-sampled",
                frame.index,
                frame.timestamp,
                frame.measurements.len(),
                frame.downsampled
            );
        }
    }

    running.store(false, Ordering::Release);
    if feed.join().is_err() {
        anyhow::bail!("synthetic feed thread panicked");
    }

    concentrator.stop();

    println!("\nReceived {} frames ({:.1}/sec)\n", received, received as f64 / 3.0);
    println!("{}", concentrator.status());

    println!("Demo complete at {}", Ticks::now());

    Ok(())
}
