//! Run configuration for a recording session.
//!
//! Everything the capture pipeline needs to know — which sensors are on,
//! their native rates and record sizes, the buffer window, the AGC
//! calibration — is collected into one immutable [`RecordingConfig`] built
//! at startup and handed to the coordinator. Nothing in here changes once a
//! recording has begun.

use crate::agc::AgcCalibration;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// The four sensors the rig can carry. The declaration order here is also
/// the stream order inside every chunk file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SensorKind {
    /// Ambient light/IMU spectrometer microcontroller on the serial bus.
    Spectrometer,
    /// Outward-facing raw Bayer camera.
    WorldCamera,
    /// Eye-facing UVC camera producing compressed frames.
    PupilCamera,
    /// Hall-effect sensor sensing the sunglasses flip.
    Sunglasses,
}

impl SensorKind {
    /// All sensor kinds, in chunk stream order.
    pub const ALL: [SensorKind; 4] = [
        SensorKind::Spectrometer,
        SensorKind::WorldCamera,
        SensorKind::PupilCamera,
        SensorKind::Sunglasses,
    ];

    /// Short lowercase name used in log messages and reports.
    pub fn name(self) -> &'static str {
        match self {
            SensorKind::Spectrometer => "spectrometer",
            SensorKind::WorldCamera => "world",
            SensorKind::PupilCamera => "pupil",
            SensorKind::Sunglasses => "sunglasses",
        }
    }

    /// Position of this sensor in [`SensorKind::ALL`].
    pub fn index(self) -> usize {
        match self {
            SensorKind::Spectrometer => 0,
            SensorKind::WorldCamera => 1,
            SensorKind::PupilCamera => 2,
            SensorKind::Sunglasses => 3,
        }
    }
}

impl fmt::Display for SensorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Which sensors are active for this run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EnabledSensors {
    /// Record from the spectrometer chip.
    pub spectrometer: bool,
    /// Record from the world camera.
    pub world: bool,
    /// Record from the pupil camera.
    pub pupil: bool,
    /// Record from the sunglasses sensor.
    pub sunglasses: bool,
}

impl EnabledSensors {
    /// Whether the given sensor is enabled.
    pub fn contains(&self, kind: SensorKind) -> bool {
        match kind {
            SensorKind::Spectrometer => self.spectrometer,
            SensorKind::WorldCamera => self.world,
            SensorKind::PupilCamera => self.pupil,
            SensorKind::Sunglasses => self.sunglasses,
        }
    }

    /// Whether at least one sensor is enabled.
    pub fn any(&self) -> bool {
        self.spectrometer || self.world || self.pupil || self.sunglasses
    }

    /// How many sensors are enabled.
    pub fn count(&self) -> usize {
        SensorKind::ALL
            .iter()
            .filter(|kind| self.contains(**kind))
            .count()
    }
}

/// Spectrometer sampling parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpectrometerConfig {
    /// Readings per second the chip transmits.
    pub fps: u32,
    /// Size of one delimiter-framed reading, in bytes.
    pub record_bytes: usize,
}

impl Default for SpectrometerConfig {
    fn default() -> Self {
        Self {
            fps: 1,
            record_bytes: 148,
        }
    }
}

/// AGC behavior for the world camera.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AgcConfig {
    /// Whether the feedback loop runs at all.
    pub enabled: bool,
    /// Base adaptation speed, in `(0, 1)`. Closer to 1 adapts more slowly.
    pub speed_setting: f64,
    /// Minimum time between consecutive adjustments.
    pub period: Duration,
    /// Sensor calibration the controller clamps against.
    pub calibration: AgcCalibration,
}

impl Default for AgcConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            speed_setting: 0.95,
            period: Duration::from_millis(250),
            calibration: AgcCalibration::default(),
        }
    }
}

/// World camera geometry and capture parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WorldCameraConfig {
    /// Frames per second.
    pub fps: u32,
    /// Image height in photosites.
    pub rows: u16,
    /// Image width in photosites.
    pub cols: u16,
    /// How many times each dimension is halved before a frame is written
    /// out. Applied by the writer, not during capture.
    pub downsample_factor: u8,
    /// Analogue gain applied to the first captured frame.
    pub initial_gain: f64,
    /// Exposure time applied to the first captured frame, in microseconds.
    pub initial_exposure: f64,
    /// Fixed frame duration requested from the camera, in microseconds.
    pub frame_duration_us: u64,
    /// Feedback loop settings.
    pub agc: AgcConfig,
}

impl WorldCameraConfig {
    /// Size of one raw frame as captured, in bytes (one byte per photosite).
    pub fn frame_bytes(&self) -> usize {
        self.rows as usize * self.cols as usize
    }
}

impl Default for WorldCameraConfig {
    fn default() -> Self {
        Self {
            fps: 200,
            rows: 480,
            cols: 640,
            downsample_factor: 1,
            initial_gain: 1.0,
            initial_exposure: 100.0,
            frame_duration_us: 5_000,
            agc: AgcConfig::default(),
        }
    }
}

/// Pupil camera capture parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PupilCameraConfig {
    /// Frames per second.
    pub fps: u32,
    /// Upper bound on the size of one compressed frame, in bytes. Frames
    /// vary in size; the buffer is provisioned for the worst case.
    pub max_frame_bytes: usize,
}

impl Default for PupilCameraConfig {
    fn default() -> Self {
        Self {
            fps: 120,
            max_frame_bytes: 22_000,
        }
    }
}

/// Sunglasses sensor sampling parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SunglassesConfig {
    /// Readings per second.
    pub fps: u32,
    /// Size of one reading, in bytes (a little-endian `i16`).
    pub record_bytes: usize,
}

impl Default for SunglassesConfig {
    fn default() -> Self {
        Self {
            fps: 1,
            record_bytes: 2,
        }
    }
}

/// Immutable configuration for one recording run.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordingConfig {
    /// Directory receiving chunk files and the performance report.
    pub output_dir: PathBuf,
    /// Total recording duration.
    pub duration: Duration,
    /// Which sensors are active.
    pub enabled: EnabledSensors,
    /// How much capture time one buffer of each pair holds.
    pub buffer_window: Duration,
    /// Extra wait after a window elapses before the writer assumes the
    /// buffer generation is safe to flush.
    pub grace_period: Duration,
    /// Spectrometer parameters.
    pub spectrometer: SpectrometerConfig,
    /// World camera parameters.
    pub world: WorldCameraConfig,
    /// Pupil camera parameters.
    pub pupil: PupilCameraConfig,
    /// Sunglasses sensor parameters.
    pub sunglasses: SunglassesConfig,
}

impl RecordingConfig {
    /// Builds a configuration with default sensor parameters.
    pub fn new(output_dir: PathBuf, duration_seconds: u32, enabled: EnabledSensors) -> Self {
        Self {
            output_dir,
            duration: Duration::from_secs(duration_seconds.into()),
            enabled,
            buffer_window: Duration::from_secs(10),
            grace_period: Duration::from_secs(2),
            spectrometer: SpectrometerConfig::default(),
            world: WorldCameraConfig::default(),
            pupil: PupilCameraConfig::default(),
            sunglasses: SunglassesConfig::default(),
        }
    }

    /// Configured sample rate of the given sensor.
    pub fn fps(&self, kind: SensorKind) -> u32 {
        match kind {
            SensorKind::Spectrometer => self.spectrometer.fps,
            SensorKind::WorldCamera => self.world.fps,
            SensorKind::PupilCamera => self.pupil.fps,
            SensorKind::Sunglasses => self.sunglasses.fps,
        }
    }

    /// Worst-case record size of the given sensor, in bytes.
    pub fn max_record_bytes(&self, kind: SensorKind) -> usize {
        match kind {
            SensorKind::Spectrometer => self.spectrometer.record_bytes,
            SensorKind::WorldCamera => self.world.frame_bytes(),
            SensorKind::PupilCamera => self.pupil.max_frame_bytes,
            SensorKind::Sunglasses => self.sunglasses.record_bytes,
        }
    }

    /// How many records fit in one buffer of the given sensor's pair.
    pub fn frames_per_buffer(&self, kind: SensorKind) -> usize {
        self.fps(kind) as usize * self.buffer_window.as_secs() as usize
    }

    /// Capacity of one buffer of the given sensor's pair, in bytes:
    /// `fps × window seconds × max record size`.
    pub fn buffer_capacity(&self, kind: SensorKind) -> usize {
        self.frames_per_buffer(kind) * self.max_record_bytes(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_capacity_follows_rate_and_record_size() {
        let mut config = RecordingConfig::new(
            PathBuf::from("/tmp/out"),
            30,
            EnabledSensors {
                spectrometer: true,
                ..Default::default()
            },
        );
        config.buffer_window = Duration::from_secs(10);

        // 1 Hz * 10 s * 148 B
        assert_eq!(config.buffer_capacity(SensorKind::Spectrometer), 1480);
        // 200 fps * 10 s frames
        assert_eq!(config.frames_per_buffer(SensorKind::WorldCamera), 2000);
        assert_eq!(
            config.buffer_capacity(SensorKind::WorldCamera),
            2000 * 640 * 480
        );
    }

    #[test]
    fn enabled_sensors_queries() {
        let enabled = EnabledSensors {
            world: true,
            sunglasses: true,
            ..Default::default()
        };
        assert!(enabled.any());
        assert_eq!(enabled.count(), 2);
        assert!(enabled.contains(SensorKind::WorldCamera));
        assert!(!enabled.contains(SensorKind::Spectrometer));
        assert!(!EnabledSensors::default().any());
    }

    #[test]
    fn stream_order_is_stable() {
        let names: Vec<&str> = SensorKind::ALL.iter().map(|k| k.name()).collect();
        assert_eq!(names, ["spectrometer", "world", "pupil", "sunglasses"]);
        for (position, kind) in SensorKind::ALL.iter().enumerate() {
            assert_eq!(kind.index(), position);
        }
    }
}
