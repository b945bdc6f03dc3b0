//! The capture coordinator: owns every thread of a recording run.
//!
//! Given an immutable configuration and the opened devices, the
//! coordinator allocates all buffer pairs up front, spawns one named
//! thread per active sensor plus the writer thread, joins them all at the
//! end of the recording, and writes the performance report. It is the
//! only component that can see every buffer pair at once.
//!
//! There is no mid-run cancel: the duration is the one planned way a
//! recording ends. A fatal error in any thread instead trips the shared
//! [`Shutdown`] flag, so sibling threads close their devices and wind
//! down before the process exits with a failure.

use crate::config::{RecordingConfig, SensorKind};
use crate::device::{CameraSettings, FrameCamera, SampleProbe};
use crate::double_buffer::DoubleBuffer;
use crate::sources::{PolledSource, PupilCameraSource, SourceError, WorldCameraSource};
use crate::telemetry::{PerformanceReport, ReportError, Telemetry};
use crate::writer::{DownsamplePass, WriteError, Writer, WriterChannel};
use log::{error, info};
use std::borrow::Cow;
use std::fmt;
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// A run-wide stop flag. Any thread can trip it; every capture loop and
/// the writer poll it and wind down once it is set.
#[derive(Debug, Clone, Default)]
pub struct Shutdown(Arc<AtomicBool>);

impl Shutdown {
    /// A fresh, untripped flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Trips the flag. Idempotent.
    pub fn trigger(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Whether the flag has been tripped.
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// The opened device backends for one run, one slot per sensor. Enabled
/// sensors must have their device present.
#[derive(Default)]
pub struct SensorRig {
    /// The spectrometer link.
    pub spectrometer: Option<Box<dyn SampleProbe>>,
    /// The world camera.
    pub world: Option<Box<dyn FrameCamera>>,
    /// The pupil camera.
    pub pupil: Option<Box<dyn FrameCamera>>,
    /// The sunglasses sensor.
    pub sunglasses: Option<Box<dyn SampleProbe>>,
}

/// Why a recording run failed.
#[derive(Debug)]
pub enum CaptureError {
    /// No sensor was enabled.
    NoSensors,

    /// A sensor was enabled but its device was not supplied.
    MissingDevice(SensorKind),

    /// The output directory could not be created.
    OutputDir(std::io::Error),

    /// A capture thread could not be spawned.
    Spawn(std::io::Error),

    /// A sensor's capture loop failed.
    Source {
        /// The sensor that failed.
        kind: SensorKind,
        /// What went wrong.
        source: SourceError,
    },

    /// The writer failed.
    Write(WriteError),

    /// The performance report could not be written.
    Report(ReportError),

    /// A thread died without reporting an error.
    ThreadPanicked(&'static str),
}

impl fmt::Display for CaptureError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use CaptureError as CE;
        let msg = match self {
            CE::NoSensors => Cow::from("no sensors enabled"),
            CE::MissingDevice(kind) => {
                Cow::from(format!("{kind} is enabled but no device was supplied"))
            }
            CE::OutputDir(error) => {
                Cow::from(format!("could not create output directory: {}", error))
            }
            CE::Spawn(error) => Cow::from(format!("could not spawn capture thread: {}", error)),
            CE::Source { kind, source } => Cow::from(format!("{kind} failed: {}", source)),
            CE::Write(error) => Cow::from(format!("writer failed: {}", error)),
            CE::Report(error) => Cow::from(format!("performance report failed: {}", error)),
            CE::ThreadPanicked(name) => Cow::from(format!("{name} thread panicked")),
        };

        write!(f, "{}", msg)
    }
}

impl std::error::Error for CaptureError {}

/// What a completed run produced.
#[derive(Debug)]
pub struct RunSummary {
    /// How many chunk files were written.
    pub chunks_written: u32,
    /// The performance report, as also written to `performance.json`.
    pub report: PerformanceReport,
}

/// Spawns, supervises, and joins the threads of one recording run.
pub struct Coordinator {
    config: RecordingConfig,
}

impl Coordinator {
    /// A coordinator for the given run configuration.
    pub fn new(config: RecordingConfig) -> Self {
        Self { config }
    }

    /// Records for the configured duration, consuming the rig.
    ///
    /// Returns once every thread has joined and the performance report is
    /// on disk. The first fatal error from any thread becomes this call's
    /// error; panicked threads count as fatal too.
    pub fn record(&self, mut rig: SensorRig) -> Result<RunSummary, CaptureError> {
        let config = &self.config;
        if !config.enabled.any() {
            return Err(CaptureError::NoSensors);
        }
        fs::create_dir_all(&config.output_dir).map_err(CaptureError::OutputDir)?;

        info!("output directory: {}", config.output_dir.display());
        info!("duration: {} seconds", config.duration.as_secs());
        info!(
            "buffer window: {} s + {} s grace",
            config.buffer_window.as_secs(),
            config.grace_period.as_secs()
        );
        for kind in SensorKind::ALL {
            info!(
                "{} | enabled: {}",
                kind,
                if config.enabled.contains(kind) { 1 } else { 0 }
            );
        }

        // Every pair exists for the writer's sake even when its sensor is
        // off; a disabled sensor just contributes empty streams.
        let pairs: Vec<Arc<DoubleBuffer>> = SensorKind::ALL
            .iter()
            .map(|&kind| {
                let capacity = if config.enabled.contains(kind) {
                    config.buffer_capacity(kind)
                } else {
                    0
                };
                Arc::new(DoubleBuffer::new(capacity))
            })
            .collect();

        let telemetry = Telemetry::new();
        let shutdown = Shutdown::new();
        let duration = Some(config.duration);

        let mut sources: Vec<(SensorKind, JoinHandle<Result<(), SourceError>>)> = Vec::new();

        if config.enabled.spectrometer {
            let kind = SensorKind::Spectrometer;
            let probe = rig
                .spectrometer
                .take()
                .ok_or(CaptureError::MissingDevice(kind))?;
            let mut source = PolledSource::new(
                kind,
                probe,
                Arc::clone(&pairs[kind.index()]),
                telemetry.counter(kind),
                None,
            );
            sources.push((
                kind,
                spawn_named(kind.name(), &shutdown, move |shutdown| {
                    source.run(duration, shutdown)
                })?,
            ));
        }

        if config.enabled.world {
            let kind = SensorKind::WorldCamera;
            let camera = rig.world.take().ok_or(CaptureError::MissingDevice(kind))?;
            let initial = CameraSettings {
                gain: config.world.initial_gain,
                exposure: config.world.initial_exposure,
                frame_duration_us: config.world.frame_duration_us,
            };
            let mut source = WorldCameraSource::new(
                camera,
                Arc::clone(&pairs[kind.index()]),
                telemetry.counter(kind),
                initial,
                config.world.agc,
            );
            sources.push((
                kind,
                spawn_named(kind.name(), &shutdown, move |shutdown| {
                    source.run(duration, shutdown)
                })?,
            ));
        }

        if config.enabled.pupil {
            let kind = SensorKind::PupilCamera;
            let camera = rig.pupil.take().ok_or(CaptureError::MissingDevice(kind))?;
            let mut source = PupilCameraSource::new(
                camera,
                Arc::clone(&pairs[kind.index()]),
                telemetry.counter(kind),
                config.frames_per_buffer(kind),
            );
            sources.push((
                kind,
                spawn_named(kind.name(), &shutdown, move |shutdown| {
                    source.run(duration, shutdown)
                })?,
            ));
        }

        if config.enabled.sunglasses {
            let kind = SensorKind::Sunglasses;
            let probe = rig
                .sunglasses
                .take()
                .ok_or(CaptureError::MissingDevice(kind))?;
            let pace = Duration::from_secs_f64(1.0 / f64::from(config.sunglasses.fps));
            let mut source = PolledSource::new(
                kind,
                probe,
                Arc::clone(&pairs[kind.index()]),
                telemetry.counter(kind),
                Some(pace),
            );
            sources.push((
                kind,
                spawn_named(kind.name(), &shutdown, move |shutdown| {
                    source.run(duration, shutdown)
                })?,
            ));
        }

        let channels: Vec<WriterChannel> = SensorKind::ALL
            .iter()
            .map(|&kind| WriterChannel {
                kind,
                pair: Arc::clone(&pairs[kind.index()]),
            })
            .collect();
        let world_pass = config.enabled.world.then(|| {
            DownsamplePass::new(
                &config.world,
                config.frames_per_buffer(SensorKind::WorldCamera),
            )
        });
        let mut writer = Writer::new(
            config.output_dir.clone(),
            config.buffer_window,
            config.grace_period,
            channels,
            world_pass,
        );
        let run_duration = config.duration;
        let writer_handle = spawn_named("writer", &shutdown, move |shutdown| {
            writer.run(run_duration, shutdown)
        })?;

        // Join everyone; keep the first failure but let every thread
        // finish winding down.
        let mut first_error: Option<CaptureError> = None;
        for (kind, handle) in sources {
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(source)) => {
                    first_error.get_or_insert(CaptureError::Source { kind, source });
                }
                Err(_) => {
                    first_error.get_or_insert(CaptureError::ThreadPanicked(kind.name()));
                }
            }
        }
        let chunks_written = match writer_handle.join() {
            Ok(Ok(chunks)) => chunks,
            Ok(Err(error)) => {
                first_error.get_or_insert(CaptureError::Write(error));
                0
            }
            Err(_) => {
                first_error.get_or_insert(CaptureError::ThreadPanicked("writer"));
                0
            }
        };
        info!("all capture threads joined");

        // The report is written even for a failed run; whatever was
        // counted is still worth keeping.
        if let Err(error) = telemetry.write_report(config) {
            first_error.get_or_insert(CaptureError::Report(error));
        }

        match first_error {
            Some(error) => Err(error),
            None => Ok(RunSummary {
                chunks_written,
                report: telemetry.report(config),
            }),
        }
    }
}

/// Spawns a named thread whose closure gets the shared shutdown flag. A
/// failing closure trips the flag on its way out, so siblings stop too.
fn spawn_named<T, E, F>(
    name: &'static str,
    shutdown: &Shutdown,
    run: F,
) -> Result<JoinHandle<Result<T, E>>, CaptureError>
where
    T: Send + 'static,
    E: fmt::Display + Send + 'static,
    F: FnOnce(&Shutdown) -> Result<T, E> + Send + 'static,
{
    let shutdown = shutdown.clone();
    thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            let result = run(&shutdown);
            if let Err(error) = &result {
                error!("{name} | fatal: {error}");
                shutdown.trigger();
            }
            result
        })
        .map_err(CaptureError::Spawn)
}
