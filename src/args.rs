// Commandline argument parser using clap for the lumilog recorder

use crate::config::EnabledSensors;
use clap::Parser;
use std::path::PathBuf;

/// Control arguments for one recording run of the wearable light logger.
#[derive(Debug, Parser, Clone)]
#[clap(version, about)]
pub struct RecorderArgs {
    /// The directory in which to output files. Does not need to exist
    #[arg(short = 'o', long = "output_dir")]
    pub output_dir: PathBuf,

    /// Duration of the recording to make, in seconds
    #[arg(short = 'd', long = "duration", value_parser = clap::value_parser!(u32).range(1..=86400))]
    pub duration: u32,

    /// Record from the spectrometer chip
    #[arg(short = 'm', long = "spectrometer")]
    pub spectrometer: bool,

    /// Record from the world camera
    #[arg(short = 'w', long = "world")]
    pub world: bool,

    /// Record from the pupil camera
    #[arg(short = 'p', long = "pupil")]
    pub pupil: bool,

    /// Record from the sunglasses sensor
    #[arg(short = 's', long = "sunglasses")]
    pub sunglasses: bool,
}

impl RecorderArgs {
    /// The sensor enable flags as the configuration wants them.
    pub fn enabled_sensors(&self) -> EnabledSensors {
        EnabledSensors {
            spectrometer: self.spectrometer,
            world: self.world,
            pupil: self.pupil,
            sunglasses: self.sunglasses,
        }
    }
}
