//! Lumilog is the host-side recorder for a wearable light logger: a small
//! head-mounted rig carrying an ambient light/IMU spectrometer chip, a
//! raw-sensor "world" camera, a "pupil" camera aimed at the wearer's eye,
//! and a magnetic sensor that reports whether the sunglasses flip is down.
//!
//! Each sensor is sampled continuously on its own thread into a pair of
//! pre-allocated byte buffers. While a sensor fills one buffer of its pair,
//! the writer thread drains the other: every buffer window (plus a short
//! grace period) the writer collects the matching buffer from every sensor —
//! one *generation* — and serializes the whole generation to a numbered
//! chunk file. The world camera additionally closes a feedback loop: frame
//! statistics feed an auto-gain controller whose corrected gain and exposure
//! are applied to subsequent captures.
//!
//! The [`coordinator`] module ties the pieces together; the `lumilog` binary
//! is a thin command-line wrapper around it.

#![warn(missing_docs)]
pub mod agc;
pub mod args;
pub mod chunk_format;
pub mod config;
pub mod coordinator;
pub mod device;
pub mod double_buffer;
pub mod downsample;
pub mod dummy_devices;
pub mod sources;
pub mod telemetry;
pub mod writer;
