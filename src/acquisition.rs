//! Fixed-rate acquisition across several armbands.
//!
//! # Timing
//!
//! Ticks follow a fixed schedule anchored at the session start
//! (`start + k * tick_interval`), so per-tick jitter never accumulates into
//! drift. A tick that overruns its slot fires late once, and the slots it
//! overran are skipped rather than fired as a burst of catch-up ticks.
//!
//! # Ownership
//!
//! Each tick moves every [`DeviceSession`] into its own blocking worker, runs
//! `fill_buffer(); read_frame()` there and gets the session back with the
//! result. The pool has one thread per device and the control loop waits for
//! all of them before emitting the tick's [`Sample`].

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures::future::join_all;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::task::{spawn_blocking, JoinError};
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::config::{AcquisitionSettings, DeviceConfig, SerialSettings};
use crate::errors::{AcquisitionError, DriverError};
use crate::protocol::Frame;
use crate::session::{DeviceSession, PortHandle, PortOpener};
use crate::sink::{MemorySink, SampleSink};

/// One tick's readings across all devices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sample {
    /// Device name → decoded frame.
    pub readings: BTreeMap<String, Frame>,
    /// Tick start, microseconds since the session started (monotonic clock).
    pub timestamp_us: u64,
    /// Tick start as wall-clock time, microseconds since the Unix epoch.
    pub unix_time_us: u64,
}

impl Sample {
    pub fn timestamp(&self) -> Duration {
        Duration::from_micros(self.timestamp_us)
    }
}

/// Stops a running session at the next tick boundary.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AcquisitionSummary {
    pub ticks: u64,
    /// Ticks whose work took longer than the tick interval.
    pub overruns: u64,
    pub cancelled: bool,
}

type Joined<T> = std::result::Result<(DeviceSession, crate::errors::Result<T>), JoinError>;

/// Run `op` on every session concurrently and hand the sessions back.
async fn fan_out<T, F>(sessions: Vec<DeviceSession>, op: F) -> Vec<Joined<T>>
where
    T: Send + 'static,
    F: Fn(&mut DeviceSession) -> crate::errors::Result<T> + Copy + Send + 'static,
{
    let tasks = sessions.into_iter().map(|mut session| {
        spawn_blocking(move || {
            let result = op(&mut session);
            (session, result)
        })
    });
    join_all(tasks).await
}

/// Close every session through the worker pool.
async fn close_all(sessions: Vec<DeviceSession>) {
    if sessions.is_empty() {
        return;
    }
    let closed = fan_out(sessions, |session: &mut DeviceSession| {
        session.close();
        Ok(())
    })
    .await;
    for joined in closed {
        if let Err(e) = joined {
            warn!("close task failed: {}", e);
        }
    }
}

fn unix_time_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

pub struct AcquisitionScheduler {
    opener: Arc<dyn PortOpener>,
    serial: SerialSettings,
    settings: AcquisitionSettings,
    cancel: CancelToken,
}

impl AcquisitionScheduler {
    pub fn new(
        opener: Arc<dyn PortOpener>,
        serial: SerialSettings,
        settings: AcquisitionSettings,
    ) -> Self {
        Self {
            opener,
            serial,
            settings,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Acquire from every device for the configured window, feeding `sink`.
    ///
    /// Device names must be unique and the tick interval non-zero.
    /// All sessions are opened first; if any fails, the ones already open are
    /// closed and no sample is produced. Any device error during the loop
    /// aborts the whole session. Sessions are closed on every exit path.
    pub fn run(
        &self,
        devices: &[(DeviceConfig, PortHandle)],
        sink: &mut dyn SampleSink,
    ) -> Result<AcquisitionSummary, AcquisitionError> {
        if devices.is_empty() {
            return Err(AcquisitionError::NoDevices);
        }
        if self.settings.tick_interval_ms == 0 {
            return Err(AcquisitionError::InvalidSettings(
                "tick_interval_ms must be > 0".into(),
            ));
        }
        let mut names = HashSet::new();
        if let Some((config, _)) = devices.iter().find(|(c, _)| !names.insert(c.name.as_str())) {
            return Err(AcquisitionError::InvalidSettings(format!(
                "device name {} appears more than once",
                config.name
            )));
        }

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(devices.len())
            .thread_name("biox-acquisition")
            .enable_time()
            .build()
            .map_err(|e| AcquisitionError::Runtime(format!("worker pool init failed: {e}")))?;

        runtime.block_on(self.run_async(devices, sink))
    }

    /// `run` into memory.
    pub fn collect(
        &self,
        devices: &[(DeviceConfig, PortHandle)],
    ) -> Result<Vec<Sample>, AcquisitionError> {
        let mut sink = MemorySink::default();
        self.run(devices, &mut sink)?;
        Ok(sink.samples)
    }

    async fn run_async(
        &self,
        devices: &[(DeviceConfig, PortHandle)],
        sink: &mut dyn SampleSink,
    ) -> Result<AcquisitionSummary, AcquisitionError> {
        let mut sessions = self.open_all(devices).await?;
        let outcome = self.tick_loop(&mut sessions, sink).await;
        close_all(sessions).await;

        match &outcome {
            Ok(summary) => info!(
                "acquisition finished: ticks={}, overruns={}, cancelled={}",
                summary.ticks, summary.overruns, summary.cancelled
            ),
            Err(e) => warn!("acquisition aborted: {}", e),
        }
        outcome
    }

    async fn open_all(
        &self,
        devices: &[(DeviceConfig, PortHandle)],
    ) -> Result<Vec<DeviceSession>, AcquisitionError> {
        let tasks = devices.iter().map(|(config, port)| {
            let opener = Arc::clone(&self.opener);
            let config = config.clone();
            let port = port.clone();
            let serial = self.serial;
            spawn_blocking(move || {
                let result = config.layout().map_err(DriverError::from).and_then(|layout| {
                    DeviceSession::open(opener.as_ref(), &config.name, &port, layout, &serial)
                });
                (config.name, result)
            })
        });

        let mut opened = Vec::with_capacity(devices.len());
        let mut failure = None;
        for joined in join_all(tasks).await {
            match joined {
                Ok((_, Ok(session))) => opened.push(session),
                Ok((name, Err(e))) => {
                    warn!("open failed: device={}, error={}", name, e);
                    if failure.is_none() {
                        failure = Some(AcquisitionError::device(&name, e));
                    }
                }
                Err(e) => {
                    if failure.is_none() {
                        failure = Some(AcquisitionError::Runtime(e.to_string()));
                    }
                }
            }
        }

        if let Some(err) = failure {
            close_all(opened).await;
            return Err(err);
        }
        Ok(opened)
    }

    async fn tick_loop(
        &self,
        sessions: &mut Vec<DeviceSession>,
        sink: &mut dyn SampleSink,
    ) -> Result<AcquisitionSummary, AcquisitionError> {
        let period = self.settings.tick_interval();
        let session_start = Instant::now();
        let session_end = session_start + self.settings.duration();
        let wall_start = unix_time_us();

        let mut ticker = interval_at(session_start, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut summary = AcquisitionSummary::default();
        info!(
            "acquisition started: devices={}, duration={:?}, interval={:?}",
            sessions.len(),
            self.settings.duration(),
            period
        );

        loop {
            ticker.tick().await;
            if self.cancel.is_cancelled() {
                info!("acquisition cancelled after {} ticks", summary.ticks);
                summary.cancelled = true;
                break;
            }
            let t0 = Instant::now();
            if t0 >= session_end {
                break;
            }

            let batch = std::mem::take(sessions);
            let mut readings = BTreeMap::new();
            let mut failure = None;
            for joined in fan_out(batch, DeviceSession::sample).await {
                match joined {
                    Ok((session, Ok(frame))) => {
                        readings.insert(session.name().to_string(), frame);
                        sessions.push(session);
                    }
                    Ok((session, Err(e))) => {
                        if failure.is_none() {
                            failure = Some(AcquisitionError::device(session.name(), e));
                        }
                        sessions.push(session);
                    }
                    Err(e) => {
                        if failure.is_none() {
                            failure = Some(AcquisitionError::Runtime(e.to_string()));
                        }
                    }
                }
            }
            if let Some(err) = failure {
                return Err(err);
            }

            let offset = t0.duration_since(session_start);
            sink.accept_sample(Sample {
                readings,
                timestamp_us: offset.as_micros() as u64,
                unix_time_us: wall_start + offset.as_micros() as u64,
            })
            .map_err(AcquisitionError::Sink)?;
            summary.ticks += 1;

            let elapsed = t0.elapsed();
            if elapsed > period {
                summary.overruns += 1;
                debug!("tick {} overran: {:?} > {:?}", summary.ticks, elapsed, period);
            }
        }

        Ok(summary)
    }
}
