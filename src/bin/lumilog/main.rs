//! Command-line entry point for the wearable light logger recorder.

use clap::Parser;
use lumilog::{
    args::RecorderArgs,
    config::RecordingConfig,
    coordinator::{Coordinator, SensorRig},
    device::{CameraSettings, DeviceError, HallSensor, SerialSpectrometer},
    dummy_devices::DummyCamera,
};
use log::{error, info};

/// USB serial device the spectrometer chip enumerates as.
const SPECTROMETER_PORT: &str = "/dev/ttyACM0";

/// Nominal scene brightness for the synthetic cameras standing in for the
/// real capture stacks.
const SYNTHETIC_SCENE: f64 = 1.0;

fn main() {
    env_logger::init();
    let args = RecorderArgs::parse();

    let enabled = args.enabled_sensors();
    if !enabled.any() {
        eprintln!("at least one sensor must be enabled; see --help");
        std::process::exit(2);
    }

    let config = RecordingConfig::new(args.output_dir, args.duration, enabled);

    let rig = match open_rig(&config) {
        Ok(rig) => rig,
        Err(error) => {
            error!("device setup failed: {error}");
            std::process::exit(1);
        }
    };

    match Coordinator::new(config).record(rig) {
        Ok(summary) => {
            info!("recording complete: {} chunks written", summary.chunks_written);
            for sensor in &summary.report.sensors {
                if sensor.enabled {
                    info!("{} | {} frames", sensor.kind, sensor.captured_frames);
                }
            }
        }
        Err(error) => {
            error!("recording failed: {error}");
            std::process::exit(1);
        }
    }
}

/// Opens a device for every enabled sensor. Any open failure aborts the
/// run before a single thread spawns.
fn open_rig(config: &RecordingConfig) -> Result<SensorRig, DeviceError> {
    let mut rig = SensorRig::default();

    if config.enabled.spectrometer {
        info!("spectrometer | opening {SPECTROMETER_PORT}");
        rig.spectrometer = Some(Box::new(SerialSpectrometer::open(
            SPECTROMETER_PORT,
            config.spectrometer.record_bytes,
        )?));
    }

    if config.enabled.world {
        rig.world = Some(Box::new(DummyCamera::new(
            config.world.fps,
            config.world.frame_bytes(),
            SYNTHETIC_SCENE,
            CameraSettings {
                gain: config.world.initial_gain,
                exposure: config.world.initial_exposure,
                frame_duration_us: config.world.frame_duration_us,
            },
        )));
    }

    if config.enabled.pupil {
        rig.pupil = Some(Box::new(DummyCamera::new(
            config.pupil.fps,
            // Stay under the provisioned worst case like the real
            // compressed stream does.
            config.pupil.max_frame_bytes * 9 / 10,
            SYNTHETIC_SCENE,
            CameraSettings {
                gain: 1.0,
                exposure: 100.0,
                frame_duration_us: 1_000_000 / u64::from(config.pupil.fps),
            },
        )));
    }

    if config.enabled.sunglasses {
        info!("sunglasses | opening i2c bus");
        rig.sunglasses = Some(Box::new(HallSensor::open()?));
    }

    Ok(rig)
}
