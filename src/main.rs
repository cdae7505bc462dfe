mod config;
mod error;
mod models;
mod pipeline;
mod serial;
mod storage;
mod telemetry;
mod utils;

use log::{error, info, warn};
use tokio::sync::watch;

use config::GatewayConfig;
use pipeline::{PipelineLoop, PipelineSettings};
use serial::{FrameReader, TtyTransport};
use storage::{CsvStore, Recorder};
use telemetry::Publisher;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .format_timestamp_secs()
        .init();

    // Load configuration
    let config = match GatewayConfig::new() {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    // Open the serial device and drop anything buffered before startup
    let transport = match TtyTransport::open(&config.serial.port, config.serial.baud_rate) {
        Ok(transport) => transport,
        Err(e) => {
            error!("Failed to open serial port {}: {}", config.serial.port, e);
            return Err(e.into());
        }
    };
    let mut reader = FrameReader::new(transport, config.serial.clone());
    if let Err(e) = reader.reset().await {
        warn!("Could not clear serial input buffer: {}", e);
    }
    info!(
        "Listening on {} at {} baud",
        config.serial.port, config.serial.baud_rate
    );

    let (sink, _driver) = telemetry::connect(&config.mqtt);
    let publisher = Publisher::new(config.mqtt.topic.clone(), config.device.clone());

    let recorder = config.recorder.enabled.then(|| {
        let store = CsvStore::new(&config.recorder.path);
        info!("Recording measurements to {}", store.path().display());
        Recorder::new(store)
    });

    let mut pipeline = PipelineLoop::new(
        reader,
        sink,
        publisher,
        recorder,
        PipelineSettings::from(&config),
    );

    // Handle Ctrl+C gracefully
    let (stop_tx, stop_rx) = watch::channel(false);
    let interrupted = stop_tx.subscribe();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                let _ = stop_tx.send(true);
            }
            Err(e) => {
                error!("Failed to listen for Ctrl+C: {}", e);
                // Keep the sender alive so the pipeline is not told to stop
                std::future::pending::<()>().await;
            }
        }
    });

    let result = pipeline.run(stop_rx).await;
    pipeline.sink().disconnect().await;

    match result {
        Ok(()) if *interrupted.borrow() => {
            info!("Program terminated by user. Exiting gracefully.")
        }
        Ok(()) => info!("Program completed successfully"),
        Err(e) => {
            error!("Fatal error: {}", e);
            return Err(e.into());
        }
    }

    Ok(())
}
