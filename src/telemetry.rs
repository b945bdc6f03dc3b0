//! Per-run capture telemetry and the performance report.
//!
//! Every source increments an atomic frame counter as it captures; at
//! shutdown the coordinator echoes the run configuration and the counter
//! totals into `performance.json` next to the chunk files, so an analysis
//! pass can sanity-check a recording without parsing it.

use crate::config::{RecordingConfig, SensorKind};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use std::fs;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A cloneable handle on one sensor's captured-frame total.
#[derive(Debug, Clone, Default)]
pub struct FrameCounter(Arc<AtomicU64>);

impl FrameCounter {
    /// Records one captured frame.
    pub fn increment(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    /// Frames captured so far.
    pub fn count(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Frame counters for all sensors of a run.
#[derive(Debug, Default)]
pub struct Telemetry {
    counters: [FrameCounter; 4],
}

impl Telemetry {
    /// Fresh telemetry with every counter at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// The counter handle for one sensor, to hand to its source.
    pub fn counter(&self, kind: SensorKind) -> FrameCounter {
        self.counters[kind.index()].clone()
    }

    /// Frames captured by one sensor so far.
    pub fn captured_frames(&self, kind: SensorKind) -> u64 {
        self.counters[kind.index()].count()
    }

    /// Builds the end-of-run report from the counters and the run
    /// configuration.
    pub fn report(&self, config: &RecordingConfig) -> PerformanceReport {
        PerformanceReport {
            duration_seconds: config.duration.as_secs(),
            buffer_window_seconds: config.buffer_window.as_secs(),
            grace_period_seconds: config.grace_period.as_secs(),
            sensors: SensorKind::ALL
                .iter()
                .map(|&kind| SensorReport {
                    kind,
                    enabled: config.enabled.contains(kind),
                    fps: config.fps(kind),
                    captured_frames: self.captured_frames(kind),
                })
                .collect(),
        }
    }

    /// Writes the report to `performance.json` in the output directory.
    pub fn write_report(&self, config: &RecordingConfig) -> Result<(), ReportError> {
        let report = self.report(config);
        let rendered = serde_json::to_string_pretty(&report).map_err(ReportError::JsonError)?;
        fs::write(config.output_dir.join("performance.json"), rendered)
            .map_err(ReportError::IoError)
    }
}

/// Run configuration echo plus per-sensor captured-frame totals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerformanceReport {
    /// Requested recording duration.
    pub duration_seconds: u64,
    /// Buffer window each chunk covers.
    pub buffer_window_seconds: u64,
    /// Grace period the writer waited past each window.
    pub grace_period_seconds: u64,
    /// One entry per sensor, in chunk stream order.
    pub sensors: Vec<SensorReport>,
}

impl PerformanceReport {
    /// The report entry for one sensor.
    pub fn sensor(&self, kind: SensorKind) -> &SensorReport {
        &self.sensors[kind.index()]
    }
}

/// One sensor's line in the performance report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorReport {
    /// Which sensor this entry describes.
    pub kind: SensorKind,
    /// Whether it was active this run.
    pub enabled: bool,
    /// Its configured sample rate.
    pub fps: u32,
    /// How many frames it captured.
    pub captured_frames: u64,
}

/// Raised when the performance report cannot be produced.
#[derive(Debug)]
pub enum ReportError {
    /// The report file could not be written.
    IoError(std::io::Error),

    /// The report could not be serialized.
    JsonError(serde_json::Error),
}

impl fmt::Display for ReportError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let msg = match self {
            ReportError::IoError(error) => Cow::from(format!("io error: {}", error)),
            ReportError::JsonError(error) => Cow::from(format!("json error: {}", error)),
        };

        write!(f, "{}", msg)
    }
}

impl std::error::Error for ReportError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EnabledSensors;
    use std::path::PathBuf;

    #[test]
    fn counters_are_shared_between_handles() {
        let telemetry = Telemetry::new();
        let counter = telemetry.counter(SensorKind::PupilCamera);
        counter.increment();
        counter.increment();
        assert_eq!(telemetry.captured_frames(SensorKind::PupilCamera), 2);
        assert_eq!(telemetry.captured_frames(SensorKind::WorldCamera), 0);
    }

    #[test]
    fn report_round_trips_through_json() {
        let dir = tempfile::tempdir().unwrap();
        let config = RecordingConfig::new(
            dir.path().to_path_buf(),
            30,
            EnabledSensors {
                spectrometer: true,
                sunglasses: true,
                ..Default::default()
            },
        );

        let telemetry = Telemetry::new();
        for _ in 0..30 {
            telemetry.counter(SensorKind::Spectrometer).increment();
        }
        telemetry.write_report(&config).unwrap();

        let raw = std::fs::read_to_string(dir.path().join("performance.json")).unwrap();
        let report: PerformanceReport = serde_json::from_str(&raw).unwrap();
        assert_eq!(report.duration_seconds, 30);
        assert_eq!(report.sensor(SensorKind::Spectrometer).captured_frames, 30);
        assert!(report.sensor(SensorKind::Spectrometer).enabled);
        assert!(!report.sensor(SensorKind::WorldCamera).enabled);
    }

    #[test]
    fn report_echoes_configuration() {
        let config = RecordingConfig::new(
            PathBuf::from("/tmp/out"),
            120,
            EnabledSensors {
                world: true,
                ..Default::default()
            },
        );
        let report = Telemetry::new().report(&config);
        assert_eq!(report.buffer_window_seconds, 10);
        assert_eq!(report.sensor(SensorKind::WorldCamera).fps, 200);
        assert_eq!(report.sensors.len(), 4);
    }
}
