/// Acquisition loop: trigger, read, decode, resolve, then publish and record
use log::{debug, error, info, warn};
use std::fmt;
use tokio::sync::watch;
use tokio::time::{sleep, Duration};

use crate::config::GatewayConfig;
use crate::error::{PipelineError, ResolveError};
use crate::models::{Channel, MeasurementSet, CHANNELS, CHANNEL_COUNT};
use crate::serial::{decode, resolve_all, FrameReader, SerialTransport};
use crate::storage::{DurableStore, Recorder};
use crate::telemetry::{PublishOutcome, Publisher, TelemetrySink};
use crate::utils::now_local;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Triggering,
    Reading,
    Decoding,
    Resolving,
    Dispatching,
    Waiting,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PipelineSettings {
    pub poll_interval: Duration,
    /// Consecutive storage failures before the loop gives up; 0 never gives up
    pub max_storage_failures: u32,
}

impl From<&GatewayConfig> for PipelineSettings {
    fn from(config: &GatewayConfig) -> Self {
        Self {
            poll_interval: config.poll_interval,
            max_storage_failures: config.max_storage_failures,
        }
    }
}

/// What happened during one iteration
#[derive(Debug, Clone, PartialEq)]
pub struct IterationReport {
    pub valid: bool,
    /// `None` when the set was invalid and nothing was published
    pub outcome: Option<PublishOutcome>,
    pub recorded: bool,
}

pub struct PipelineLoop<T, K, S> {
    reader: FrameReader<T>,
    sink: K,
    publisher: Publisher,
    recorder: Option<Recorder<S>>,
    channels: [Channel; CHANNEL_COUNT],
    settings: PipelineSettings,
    storage_failures: u32,
    state: PipelineState,
}

impl<T, K, S> PipelineLoop<T, K, S>
where
    T: SerialTransport,
    K: TelemetrySink,
    S: DurableStore,
{
    pub fn new(
        reader: FrameReader<T>,
        sink: K,
        publisher: Publisher,
        recorder: Option<Recorder<S>>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            reader,
            sink,
            publisher,
            recorder,
            channels: CHANNELS,
            settings,
            storage_failures: 0,
            state: PipelineState::Idle,
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn sink(&self) -> &K {
        &self.sink
    }

    fn enter(&mut self, state: PipelineState) {
        debug!("Pipeline state {} -> {}", self.state, state);
        self.state = state;
    }

    /// Run iterations until `stop` turns true or its sender is dropped
    ///
    /// The flag is checked before each iteration and interrupts the wait
    /// between iterations; a running iteration always completes.
    pub async fn run(&mut self, mut stop: watch::Receiver<bool>) -> Result<(), PipelineError> {
        info!("Starting sensor gateway pipeline");
        loop {
            if *stop.borrow() {
                info!("Stop requested, leaving pipeline loop");
                return Ok(());
            }

            let report = self.run_iteration().await?;
            debug!(
                "Iteration finished: valid={} outcome={:?} recorded={}",
                report.valid, report.outcome, report.recorded
            );

            self.enter(PipelineState::Waiting);
            tokio::select! {
                _ = sleep(self.settings.poll_interval) => {}
                changed = stop.changed() => {
                    if changed.is_err() {
                        info!("Stop signal source gone, leaving pipeline loop");
                        return Ok(());
                    }
                }
            }
        }
    }

    /// One pass from trigger through dispatch
    ///
    /// Bad reads and bad frames produce an invalid set and an `Ok` report; only
    /// a broken channel table or persistent storage failure is an error.
    pub async fn run_iteration(&mut self) -> Result<IterationReport, PipelineError> {
        let set = self.acquire().await?;
        self.dispatch(&set).await
    }

    async fn acquire(&mut self) -> Result<MeasurementSet, ResolveError> {
        self.enter(PipelineState::Triggering);
        if let Err(e) = self.reader.trigger().await {
            warn!("Could not trigger device, skipping reading: {}", e);
            return Ok(MeasurementSet::invalid(now_local()));
        }

        self.enter(PipelineState::Reading);
        let frame = match self.reader.read_frame().await {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Bad read, skipping reading: {}", e);
                return Ok(MeasurementSet::invalid(now_local()));
            }
        };

        self.enter(PipelineState::Decoding);
        let decoded = match decode(&frame) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!("Bad frame, skipping reading: {}", e);
                return Ok(MeasurementSet::invalid(now_local()));
            }
        };

        self.enter(PipelineState::Resolving);
        resolve_all(&decoded, &self.channels)
    }

    async fn dispatch(&mut self, set: &MeasurementSet) -> Result<IterationReport, PipelineError> {
        self.enter(PipelineState::Dispatching);

        let outcome = match set.readings() {
            Some(readings) => {
                let outcome = self.publisher.publish_readings(&self.sink, readings).await;
                if let PublishOutcome::PartialOrFullFailure { delivered, failed } = outcome {
                    warn!(
                        "Publish incomplete: {} delivered, {} failed",
                        delivered, failed
                    );
                }
                Some(outcome)
            }
            None => {
                warn!("No valid reading this cycle, not publishing");
                None
            }
        };

        let recorded = self.record(set)?;

        Ok(IterationReport {
            valid: set.is_valid(),
            outcome,
            recorded,
        })
    }

    fn record(&mut self, set: &MeasurementSet) -> Result<bool, PipelineError> {
        let Some(recorder) = self.recorder.as_mut() else {
            return Ok(false);
        };

        match recorder.record(set) {
            Ok(()) => {
                self.storage_failures = 0;
                Ok(true)
            }
            Err(e) => {
                self.storage_failures += 1;
                error!(
                    "Failed to write log row ({} consecutive): {}",
                    self.storage_failures, e
                );
                let limit = self.settings.max_storage_failures;
                if limit > 0 && self.storage_failures >= limit {
                    return Err(PipelineError::Storage {
                        failures: self.storage_failures,
                        source: e,
                    });
                }
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DeviceMetadata, SerialConfig};
    use crate::error::{DeliveryError, StorageError};
    use crate::models::FRAME_LEN;
    use async_trait::async_trait;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    const FRAME: [u8; FRAME_LEN] = [
        0x32, 0x00, 0x64, 0x01, 0x0A, 0x00, 0xE8, 0x03, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xFF,
        0x00, b'\n',
    ];

    /// Returns `FRAME` or an I/O error; optionally raises `stop` after a number of reads
    struct StubTransport {
        healthy: bool,
        reads: Arc<AtomicUsize>,
        stop_after: Option<(usize, watch::Sender<bool>)>,
    }

    impl StubTransport {
        fn new(healthy: bool) -> Self {
            Self {
                healthy,
                reads: Arc::new(AtomicUsize::new(0)),
                stop_after: None,
            }
        }
    }

    #[async_trait]
    impl SerialTransport for StubTransport {
        async fn write(&mut self, _bytes: &[u8]) -> io::Result<()> {
            Ok(())
        }

        async fn read_line(&mut self) -> io::Result<Vec<u8>> {
            let count = self.reads.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some((limit, stop)) = &self.stop_after {
                if count >= *limit {
                    let _ = stop.send(true);
                }
            }
            if self.healthy {
                Ok(FRAME.to_vec())
            } else {
                Err(io::Error::new(io::ErrorKind::BrokenPipe, "device unplugged"))
            }
        }

        async fn reset_input_buffer(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[derive(Clone, Default)]
    struct StubSink {
        sent: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl TelemetrySink for StubSink {
        async fn send(&self, _topic: &str, payload: Vec<u8>) -> Result<(), DeliveryError> {
            self.sent
                .lock()
                .unwrap()
                .push(String::from_utf8(payload).unwrap());
            Ok(())
        }
    }

    #[derive(Clone, Default)]
    struct StubStore {
        fail: bool,
        rows: Arc<Mutex<Vec<Vec<String>>>>,
    }

    impl DurableStore for StubStore {
        fn exists(&self) -> bool {
            false
        }

        fn append_row(&mut self, fields: &[String]) -> Result<(), StorageError> {
            if self.fail {
                return Err(StorageError::Io(io::Error::new(
                    io::ErrorKind::PermissionDenied,
                    "read-only filesystem",
                )));
            }
            self.rows.lock().unwrap().push(fields.to_vec());
            Ok(())
        }
    }

    fn serial_config() -> SerialConfig {
        SerialConfig {
            port: "stub".into(),
            baud_rate: 115_200,
            trigger: None,
            settle_delay: Duration::ZERO,
            read_timeout: Duration::from_millis(50),
        }
    }

    fn pipeline(
        transport: StubTransport,
        sink: StubSink,
        store: Option<StubStore>,
        max_storage_failures: u32,
    ) -> PipelineLoop<StubTransport, StubSink, StubStore> {
        let publisher = Publisher::new(
            "gateway-data",
            DeviceMetadata {
                device_id: "RPI_001".into(),
                location: None,
                location_detail: None,
            },
        );
        PipelineLoop::new(
            FrameReader::new(transport, serial_config()),
            sink,
            publisher,
            store.map(Recorder::new),
            PipelineSettings {
                poll_interval: Duration::ZERO,
                max_storage_failures,
            },
        )
    }

    #[tokio::test]
    async fn valid_frame_is_published_and_recorded() {
        let sink = StubSink::default();
        let store = StubStore::default();
        let mut pipeline = pipeline(
            StubTransport::new(true),
            sink.clone(),
            Some(store.clone()),
            10,
        );

        let report = pipeline.run_iteration().await.unwrap();

        assert_eq!(
            report,
            IterationReport {
                valid: true,
                outcome: Some(PublishOutcome::AllDelivered),
                recorded: true,
            }
        );
        assert_eq!(pipeline.state(), PipelineState::Dispatching);
        let sent = sink.sent.lock().unwrap();
        assert_eq!(sent.len(), 4);
        assert!(sent[1].contains("\"hcho_ppm\":3.56"));

        let rows = store.rows.lock().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(
            rows[1][1..].to_vec(),
            vec!["0.5", "3.56", "10.0", "10.0", "0.0", "0.0", "0.0", "2.55"]
        );
    }

    #[tokio::test]
    async fn failing_reader_never_escapes_the_iteration() {
        let sink = StubSink::default();
        let store = StubStore::default();
        let mut pipeline = pipeline(
            StubTransport::new(false),
            sink.clone(),
            Some(store.clone()),
            10,
        );

        for _ in 0..150 {
            let report = pipeline.run_iteration().await.unwrap();
            assert!(!report.valid);
            assert_eq!(report.outcome, None);
            assert!(report.recorded);
        }

        assert!(sink.sent.lock().unwrap().is_empty());
        let rows = store.rows.lock().unwrap();
        assert_eq!(rows.len(), 151);
        assert!(rows[1..].iter().all(|row| row[1..].iter().all(String::is_empty)));
    }

    #[tokio::test]
    async fn recorder_is_optional() {
        let mut pipeline = pipeline(StubTransport::new(true), StubSink::default(), None, 10);
        let report = pipeline.run_iteration().await.unwrap();
        assert!(report.valid);
        assert!(!report.recorded);
    }

    #[tokio::test]
    async fn storage_failures_surface_after_limit() {
        let store = StubStore {
            fail: true,
            ..Default::default()
        };
        let mut pipeline = pipeline(StubTransport::new(true), StubSink::default(), Some(store), 3);

        for _ in 0..2 {
            let report = pipeline.run_iteration().await.unwrap();
            assert!(!report.recorded);
        }
        let err = pipeline.run_iteration().await.unwrap_err();
        assert!(matches!(err, PipelineError::Storage { failures: 3, .. }));
    }

    #[tokio::test]
    async fn storage_failure_limit_zero_keeps_running() {
        let store = StubStore {
            fail: true,
            ..Default::default()
        };
        let mut pipeline = pipeline(StubTransport::new(false), StubSink::default(), Some(store), 0);
        for _ in 0..20 {
            assert!(pipeline.run_iteration().await.is_ok());
        }
    }

    #[tokio::test]
    async fn broken_channel_table_is_fatal() {
        let mut pipeline = pipeline(StubTransport::new(true), StubSink::default(), None, 10);
        pipeline.channels[7].high = 16;
        let err = pipeline.run_iteration().await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Configuration(ResolveError::IndexOutOfRange { index: 16, .. })
        ));
    }

    #[tokio::test]
    async fn run_stops_on_signal_after_many_bad_reads() {
        let (tx, rx) = watch::channel(false);
        let mut transport = StubTransport::new(false);
        let reads = transport.reads.clone();
        transport.stop_after = Some((120, tx));

        let mut pipeline = pipeline(transport, StubSink::default(), None, 10);
        pipeline.run(rx).await.unwrap();

        assert_eq!(reads.load(Ordering::SeqCst), 120);
        assert_eq!(pipeline.state(), PipelineState::Waiting);
    }

    #[tokio::test]
    async fn run_does_not_start_when_already_stopped() {
        let (_tx, rx) = watch::channel(true);
        let transport = StubTransport::new(true);
        let reads = transport.reads.clone();
        let mut pipeline = pipeline(transport, StubSink::default(), None, 10);

        pipeline.run(rx).await.unwrap();
        assert_eq!(reads.load(Ordering::SeqCst), 0);
        assert_eq!(pipeline.state(), PipelineState::Idle);
    }
}
