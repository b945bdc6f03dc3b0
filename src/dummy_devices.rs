//! Synthetic devices for bench runs and tests.
//!
//! These stand in for hardware the same way a dummy data manager would:
//! each one runs the real trait the pipeline consumes, produces data at a
//! believable rate, and is controllable enough to exercise the interesting
//! paths (the AGC loop in particular responds to the settings the pipeline
//! applies). Camera capture stacks are external collaborators, so the
//! synthetic camera is also what the binary wires in for the camera slots.
//!
//! TODO: swap [`DummyCamera`] out of the binary's rig once a libcamera
//! capture backend exists for the world camera.

use crate::device::{CameraFrame, CameraSettings, DeviceError, FrameCamera, SampleProbe};
use rand::Rng;
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// A polled probe producing random records, optionally pacing itself like
/// a device that pushes data at a fixed rate.
pub struct DummyProbe {
    record_len: usize,
    interval: Option<Duration>,
    last_read: Option<Instant>,
}

impl DummyProbe {
    /// A probe producing `record_len`-byte records. With `interval` set,
    /// reads block until one interval has passed since the previous read,
    /// imitating a device-paced stream; the first record is immediate.
    pub fn new(record_len: usize, interval: Option<Duration>) -> Self {
        Self {
            record_len,
            interval,
            last_read: None,
        }
    }
}

impl SampleProbe for DummyProbe {
    fn record_len(&self) -> usize {
        self.record_len
    }

    fn read_record(&mut self, out: &mut [u8]) -> Result<(), DeviceError> {
        if let (Some(interval), Some(last_read)) = (self.interval, self.last_read) {
            let due = last_read + interval;
            let now = Instant::now();
            if due > now {
                spin_sleep::sleep(due - now);
            }
        }
        self.last_read = Some(Instant::now());
        rand::thread_rng().fill(out);
        Ok(())
    }
}

enum Signal {
    Stop,
}

/// A camera that renders flat frames from a toy exposure model: every
/// photosite reads `scene × gain × exposure`, clipped to 8 bits. Because
/// the model responds to [`apply_settings`](FrameCamera::apply_settings),
/// the AGC loop genuinely converges against it.
pub struct DummyCamera {
    fps: u32,
    frame_bytes: usize,
    scene: f64,
    settings: Arc<Mutex<CameraSettings>>,
    tx: Option<Sender<Signal>>,
    handle: Option<JoinHandle<()>>,
}

impl DummyCamera {
    /// A camera producing `frame_bytes`-byte frames at `fps`, lit by a
    /// scene of the given brightness (photosite value per unit of
    /// gain × exposure).
    pub fn new(fps: u32, frame_bytes: usize, scene: f64, initial: CameraSettings) -> Self {
        Self {
            fps,
            frame_bytes,
            scene,
            settings: Arc::new(Mutex::new(initial)),
            tx: None,
            handle: None,
        }
    }

    /// A handle on the live settings, for observing what the pipeline
    /// applied.
    pub fn settings_handle(&self) -> Arc<Mutex<CameraSettings>> {
        Arc::clone(&self.settings)
    }
}

impl FrameCamera for DummyCamera {
    fn start(&mut self) -> Result<Receiver<CameraFrame>, DeviceError> {
        let (frame_tx, frame_rx) = mpsc::channel();
        let (tx, rx) = mpsc::channel::<Signal>();
        let settings = Arc::clone(&self.settings);
        let frame_bytes = self.frame_bytes;
        let scene = self.scene;
        let frame_interval = Duration::from_secs_f64(1.0 / f64::from(self.fps));

        let handle = thread::spawn(move || {
            let mut sequence: u64 = 0;
            loop {
                match rx.try_recv() {
                    Ok(Signal::Stop) | Err(TryRecvError::Disconnected) => break,
                    Err(TryRecvError::Empty) => {}
                }

                let pixel = {
                    let current = settings.lock().unwrap();
                    (scene * current.gain * current.exposure).clamp(0.0, 255.0) as u8
                };
                let frame = CameraFrame {
                    bytes: vec![pixel; frame_bytes],
                    sequence,
                };
                sequence += 1;

                // The consumer hanging up is a normal end of capture.
                if frame_tx.send(frame).is_err() {
                    break;
                }

                spin_sleep::sleep(frame_interval);
            }
        });

        self.tx = Some(tx);
        self.handle = Some(handle);
        Ok(frame_rx)
    }

    fn apply_settings(&mut self, settings: CameraSettings) -> Result<(), DeviceError> {
        *self.settings.lock().unwrap() = settings;
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Signal::Stop);
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn probe_produces_records_at_the_requested_pace() {
        let mut probe = DummyProbe::new(4, Some(Duration::from_millis(20)));
        let mut record = [0u8; 4];

        // First record is immediate, the rest arrive one interval apart.
        let start = Instant::now();
        probe.read_record(&mut record).unwrap();
        assert!(start.elapsed() < Duration::from_millis(15));
        for _ in 0..3 {
            probe.read_record(&mut record).unwrap();
        }
        assert!(start.elapsed() >= Duration::from_millis(60));
    }

    #[test]
    fn camera_frames_follow_applied_settings() {
        let mut camera = DummyCamera::new(
            100,
            16,
            1.0,
            CameraSettings {
                gain: 1.0,
                exposure: 50.0,
                frame_duration_us: 10_000,
            },
        );
        let frames = camera.start().unwrap();

        let frame = frames.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(frame.bytes.len(), 16);
        assert!(frame.bytes.iter().all(|&p| p == 50));

        camera
            .apply_settings(CameraSettings {
                gain: 2.0,
                exposure: 100.0,
                frame_duration_us: 10_000,
            })
            .unwrap();

        // Within a few frames the new settings take hold.
        let mut brightened = false;
        for _ in 0..20 {
            let frame = frames.recv_timeout(Duration::from_secs(1)).unwrap();
            if frame.bytes.iter().all(|&p| p == 200) {
                brightened = true;
                break;
            }
        }
        assert!(brightened);

        camera.stop();
    }
}
