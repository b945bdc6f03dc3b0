//! The per-sensor capture loops.
//!
//! A source owns its device, one end of a buffer pair, and a frame
//! counter, and runs on its own thread for the length of the recording.
//! Three shapes cover the rig: a polled loop for the fixed-record devices
//! (spectrometer, sunglasses), a frame-channel loop for the world camera
//! (which also drives the AGC), and a frame-channel loop with
//! frame-count swapping for the pupil camera, whose compressed frames
//! vary in size.
//!
//! Fatal conditions — device failure, framing corruption, a buffer
//! overrun — end the source with an error; the coordinator turns that
//! into a run-wide shutdown. Reaching the requested duration ends it
//! cleanly, releasing the device on the way out.

use crate::agc::agc;
use crate::config::{AgcConfig, SensorKind};
use crate::coordinator::Shutdown;
use crate::device::{CameraSettings, DeviceError, FrameCamera, SampleProbe};
use crate::double_buffer::{DoubleBuffer, OverrunError};
use crate::telemetry::FrameCounter;
use log::info;
use std::borrow::Cow;
use std::fmt;
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How long a camera source waits on its frame channel before rechecking
/// the clock and the shutdown flag.
const FRAME_POLL: Duration = Duration::from_millis(50);

/// Why a source stopped capturing early.
#[derive(Debug)]
pub enum SourceError {
    /// The device failed or desynchronized.
    Device(DeviceError),

    /// A record did not fit its buffer: configured and observed sensor
    /// rates disagree.
    Overrun(OverrunError),
}

impl fmt::Display for SourceError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let msg = match self {
            SourceError::Device(error) => Cow::from(format!("device error: {}", error)),
            SourceError::Overrun(error) => Cow::from(format!("{}", error)),
        };

        write!(f, "{}", msg)
    }
}

impl std::error::Error for SourceError {}

impl From<DeviceError> for SourceError {
    fn from(error: DeviceError) -> Self {
        SourceError::Device(error)
    }
}

impl From<OverrunError> for SourceError {
    fn from(error: OverrunError) -> Self {
        SourceError::Overrun(error)
    }
}

fn expired(start: Instant, duration: Option<Duration>) -> bool {
    match duration {
        Some(duration) => start.elapsed() >= duration,
        None => false,
    }
}

/// Capture loop for devices that hand back one fixed-size record per
/// read.
pub struct PolledSource<P: SampleProbe> {
    kind: SensorKind,
    probe: P,
    pair: Arc<DoubleBuffer>,
    counter: FrameCounter,
    pace: Option<Duration>,
}

impl<P: SampleProbe> PolledSource<P> {
    /// A source reading `probe` into `pair`. With `pace` set, the loop
    /// sleeps that long after each record; without it, the device's own
    /// blocking read is the throttle.
    pub fn new(
        kind: SensorKind,
        probe: P,
        pair: Arc<DoubleBuffer>,
        counter: FrameCounter,
        pace: Option<Duration>,
    ) -> Self {
        Self {
            kind,
            probe,
            pair,
            counter,
            pace,
        }
    }

    /// Captures until `duration` elapses (`None` runs until shutdown).
    pub fn run(
        &mut self,
        duration: Option<Duration>,
        shutdown: &Shutdown,
    ) -> Result<(), SourceError> {
        let mut record = vec![0u8; self.probe.record_len()];

        info!("{} | beginning capture", self.kind);
        let start = Instant::now();
        loop {
            if shutdown.is_set() || expired(start, duration) {
                break;
            }

            self.pair.maybe_swap();

            match self.probe.read_record(&mut record) {
                Ok(()) => {}
                // A quiet spell; go around and recheck the clock.
                Err(DeviceError::TimedOut) => continue,
                Err(error) => return Err(error.into()),
            }

            // A read that completes past the deadline belongs to the next
            // sample period, outside this recording.
            if expired(start, duration) {
                break;
            }

            self.pair.write(&record)?;
            self.counter.increment();

            if let Some(pace) = self.pace {
                spin_sleep::sleep(pace);
            }
        }

        info!("{} | captured frames: {}", self.kind, self.counter.count());
        Ok(())
    }
}

/// Capture loop for the world camera: fixed-size raw frames off the
/// camera's channel, plus the AGC feedback loop.
pub struct WorldCameraSource<C: FrameCamera> {
    camera: C,
    pair: Arc<DoubleBuffer>,
    counter: FrameCounter,
    settings: CameraSettings,
    agc: AgcConfig,
}

impl<C: FrameCamera> WorldCameraSource<C> {
    /// A source draining `camera` into `pair`, starting from the given
    /// capture settings.
    pub fn new(
        camera: C,
        pair: Arc<DoubleBuffer>,
        counter: FrameCounter,
        initial: CameraSettings,
        agc: AgcConfig,
    ) -> Self {
        Self {
            camera,
            pair,
            counter,
            settings: initial,
            agc,
        }
    }

    /// Captures until `duration` elapses, stopping the camera on the way
    /// out even when the loop fails.
    pub fn run(
        &mut self,
        duration: Option<Duration>,
        shutdown: &Shutdown,
    ) -> Result<(), SourceError> {
        let result = self.capture(duration, shutdown);
        self.camera.stop();
        if result.is_ok() {
            info!("world | captured frames: {}", self.counter.count());
        }
        result
    }

    fn capture(
        &mut self,
        duration: Option<Duration>,
        shutdown: &Shutdown,
    ) -> Result<(), SourceError> {
        let frames = self.camera.start()?;

        info!("world | beginning capture");
        let start = Instant::now();
        let mut last_adjustment = Instant::now();
        loop {
            if shutdown.is_set() || expired(start, duration) {
                break;
            }

            let frame = match frames.recv_timeout(FRAME_POLL) {
                Ok(frame) => frame,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(DeviceError::StreamClosed.into())
                }
            };

            self.pair.maybe_swap();
            self.pair.write(&frame.bytes)?;
            self.counter.increment();

            if self.agc.enabled && last_adjustment.elapsed() >= self.agc.period {
                let adjusted = agc(
                    mean_intensity(&frame.bytes),
                    self.settings.gain,
                    self.settings.exposure,
                    self.agc.speed_setting,
                    &self.agc.calibration,
                );
                self.settings.gain = adjusted.gain;
                self.settings.exposure = adjusted.exposure;
                self.camera.apply_settings(self.settings)?;
                last_adjustment = Instant::now();
            }
        }

        Ok(())
    }
}

/// Capture loop for the pupil camera. Compressed frames vary in size, so
/// the swap runs on frame count rather than fill level; the buffer is
/// provisioned for worst-case frames and the overrun check still guards
/// every write.
pub struct PupilCameraSource<C: FrameCamera> {
    camera: C,
    pair: Arc<DoubleBuffer>,
    counter: FrameCounter,
    frames_per_buffer: usize,
}

impl<C: FrameCamera> PupilCameraSource<C> {
    /// A source draining `camera` into `pair`, swapping every
    /// `frames_per_buffer` frames.
    pub fn new(
        camera: C,
        pair: Arc<DoubleBuffer>,
        counter: FrameCounter,
        frames_per_buffer: usize,
    ) -> Self {
        Self {
            camera,
            pair,
            counter,
            frames_per_buffer,
        }
    }

    /// Captures until `duration` elapses, stopping the camera on the way
    /// out even when the loop fails.
    pub fn run(
        &mut self,
        duration: Option<Duration>,
        shutdown: &Shutdown,
    ) -> Result<(), SourceError> {
        let result = self.capture(duration, shutdown);
        self.camera.stop();
        if result.is_ok() {
            info!("pupil | captured frames: {}", self.counter.count());
        }
        result
    }

    fn capture(
        &mut self,
        duration: Option<Duration>,
        shutdown: &Shutdown,
    ) -> Result<(), SourceError> {
        let frames = self.camera.start()?;

        info!("pupil | beginning capture");
        let start = Instant::now();
        let mut frames_in_buffer = 0usize;
        loop {
            if shutdown.is_set() || expired(start, duration) {
                break;
            }

            let frame = match frames.recv_timeout(FRAME_POLL) {
                Ok(frame) => frame,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(DeviceError::StreamClosed.into())
                }
            };

            if frames_in_buffer == self.frames_per_buffer {
                self.pair.swap();
                frames_in_buffer = 0;
            }

            self.pair.write(&frame.bytes)?;
            self.counter.increment();
            frames_in_buffer += 1;
        }

        Ok(())
    }
}

fn mean_intensity(bytes: &[u8]) -> f64 {
    if bytes.is_empty() {
        return 0.0;
    }
    let sum: u64 = bytes.iter().map(|&b| u64::from(b)).sum();
    sum as f64 / bytes.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::CameraFrame;
    use crate::dummy_devices::{DummyCamera, DummyProbe};
    use crate::telemetry::Telemetry;
    use std::sync::mpsc::{self, Receiver};

    fn counter() -> FrameCounter {
        Telemetry::new().counter(SensorKind::Spectrometer)
    }

    #[test]
    fn polled_source_fills_and_swaps() {
        // 4-byte records into 32-byte slots: a swap after eight records.
        let pair = Arc::new(DoubleBuffer::new(32));
        let frames = counter();
        let mut source = PolledSource::new(
            SensorKind::Spectrometer,
            DummyProbe::new(4, Some(Duration::from_millis(10))),
            Arc::clone(&pair),
            frames.clone(),
            None,
        );

        source
            .run(Some(Duration::from_millis(145)), &Shutdown::new())
            .unwrap();

        // ~14 records in 145 ms at 10 ms each; enough to fill the first
        // slot and swap exactly once, not enough to fill the second.
        let count = frames.count() as usize;
        assert!((9..=16).contains(&count), "captured {count} records");
        assert_eq!(pair.active_index(), 1);
        assert_eq!(pair.lock_slot(0).offset(), 32);
        assert_eq!(pair.lock_slot(1).offset(), (count - 8) * 4);
    }

    #[test]
    fn polled_source_overruns_when_rate_is_misdeclared() {
        // Slots sized for one record, but the protocol only swaps on the
        // check *before* a write; three rapid records must overrun.
        let pair = Arc::new(DoubleBuffer::new(3));
        let mut source = PolledSource::new(
            SensorKind::Sunglasses,
            DummyProbe::new(2, None),
            pair,
            counter(),
            None,
        );

        let err = source
            .run(Some(Duration::from_millis(50)), &Shutdown::new())
            .unwrap_err();
        assert!(matches!(err, SourceError::Overrun(_)));
    }

    #[test]
    fn shutdown_stops_a_source_promptly() {
        let pair = Arc::new(DoubleBuffer::new(1024));
        let shutdown = Shutdown::new();
        shutdown.trigger();
        let mut source = PolledSource::new(
            SensorKind::Spectrometer,
            DummyProbe::new(4, Some(Duration::from_secs(10))),
            pair,
            counter(),
            None,
        );

        // Pre-triggered shutdown: the loop must exit before ever reading.
        let start = Instant::now();
        source.run(None, &shutdown).unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn world_source_applies_agc_feedback() {
        let initial = CameraSettings {
            gain: 1.0,
            exposure: 100.0,
            frame_duration_us: 10_000,
        };
        // Dim scene: initial settings read far below target, so the AGC
        // must push exposure up.
        let camera = DummyCamera::new(100, 64, 0.1, initial);
        let settings = camera.settings_handle();

        let pair = Arc::new(DoubleBuffer::new(64 * 256));
        let frames = counter();
        let mut source = WorldCameraSource::new(
            camera,
            pair,
            frames.clone(),
            initial,
            AgcConfig {
                period: Duration::from_millis(50),
                ..Default::default()
            },
        );

        source
            .run(Some(Duration::from_secs(1)), &Shutdown::new())
            .unwrap();

        assert!(frames.count() > 10);
        let applied = settings.lock().unwrap();
        assert!(
            applied.exposure > initial.exposure,
            "AGC never raised exposure: {:?}",
            *applied
        );
    }

    /// A camera fed from a preloaded channel, for deterministic frame
    /// counts.
    struct ScriptedCamera {
        rx: Option<Receiver<CameraFrame>>,
    }

    impl FrameCamera for ScriptedCamera {
        fn start(&mut self) -> Result<Receiver<CameraFrame>, DeviceError> {
            Ok(self.rx.take().expect("started twice"))
        }

        fn apply_settings(&mut self, _settings: CameraSettings) -> Result<(), DeviceError> {
            Ok(())
        }

        fn stop(&mut self) {}
    }

    #[test]
    fn pupil_source_swaps_on_frame_count() {
        let (tx, rx) = mpsc::channel();
        // Six variable-size frames, two per buffer.
        for (sequence, len) in [3usize, 1, 4, 1, 5, 2].into_iter().enumerate() {
            tx.send(CameraFrame {
                bytes: vec![sequence as u8; len],
                sequence: sequence as u64,
            })
            .unwrap();
        }

        let pair = Arc::new(DoubleBuffer::new(16));
        let frames = counter();
        let mut source = PupilCameraSource::new(
            ScriptedCamera { rx: Some(rx) },
            Arc::clone(&pair),
            frames.clone(),
            2,
        );

        source
            .run(Some(Duration::from_millis(200)), &Shutdown::new())
            .unwrap();

        assert_eq!(frames.count(), 6);
        // Two swaps happened: frames 1-2 went to slot 0, frames 3-4 to
        // slot 1, and frames 5-6 back to slot 0. Nothing drained slot 0 in
        // between (no writer here), so its second window sits behind its
        // first — exactly the undrained-swap case the pair warns about.
        assert_eq!(pair.active_index(), 0);
        assert_eq!(
            pair.lock_slot(0).filled(),
            &[0, 0, 0, 1, 4, 4, 4, 4, 4, 5, 5]
        );
        assert_eq!(pair.lock_slot(1).filled(), &[2, 2, 2, 2, 3]);
    }
}
