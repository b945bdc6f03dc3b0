//! Auto-gain control for the raw world camera.
//!
//! The camera runs with its built-in auto-exposure disabled so that the
//! recorded photosite values stay radiometrically meaningful. In exchange,
//! the capture loop has to keep the sensor exposed itself: every adjustment
//! period it feeds the mean intensity of the latest frame through [`agc`]
//! and applies the corrected gain and exposure to subsequent captures.
//!
//! [`agc`] is a pure calculation. It never touches device state, so it can
//! be exercised exhaustively against a model of the sensor.

/// Calibrated limits for one camera, supplied by configuration.
///
/// Ranges are inclusive on both ends.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AgcCalibration {
    /// Mid-scale brightness the controller steers toward.
    pub target: f64,
    /// Valid analogue gain range, `[min, max]`.
    pub gain_range: [f64; 2],
    /// Valid exposure range in microseconds, `[min, max]`.
    pub exposure_range: [f64; 2],
    /// Range of the brightness signal itself, `[black, white]`.
    pub signal_range: [f64; 2],
    /// Margin within which two floating point results count as equal.
    pub precision_error_margin: f64,
}

impl Default for AgcCalibration {
    /// Calibration for the stock 8-bit world camera sensor. The exposure
    /// ceiling is the longest exposure that still sustains the configured
    /// frame rate.
    fn default() -> Self {
        Self {
            target: 127.0,
            gain_range: [1.0, 10.666],
            exposure_range: [37.0, 4839.0],
            signal_range: [0.0, 255.0],
            precision_error_margin: 0.025,
        }
    }
}

/// Corrected settings returned by [`agc`], to be applied by the caller.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Adjustment {
    /// Corrected analogue gain.
    pub gain: f64,
    /// Corrected exposure time in microseconds.
    pub exposure: f64,
}

enum CorrectionDirection {
    TurnDown,
    TurnUp,
}

/// Computes corrected gain and exposure from an observed brightness signal.
///
/// The controller prefers exposure when brightening and gain when
/// darkening, so that gain (which amplifies noise) stays as low as the
/// scene allows. `speed_setting` dampens the step size; it is raised to a
/// higher power — a larger step — when the signal is pegged at either end
/// of its range, and when the correction is already small.
///
/// Returns the inputs unchanged once the dampened correction lands exactly
/// on 1. Outputs are always inside the calibrated ranges.
pub fn agc(
    signal: f64,
    gain: f64,
    exposure: f64,
    speed_setting: f64,
    cal: &AgcCalibration,
) -> Adjustment {
    let mut correction = 1.0 + (cal.target - signal) / cal.target;

    let mut speed = speed_setting;

    // Escape saturation fast: a pegged signal carries no gradient, so take
    // big steps until the sensor comes off the rail.
    if (signal - cal.signal_range[0]).abs() <= cal.precision_error_margin
        || (signal - cal.signal_range[1]).abs() <= cal.precision_error_margin
    {
        speed = speed_setting * speed_setting * speed_setting;
    }

    // Converge fast once close to the target.
    if (correction - 1.0).abs() < 0.25 {
        speed = speed_setting * speed_setting;
    }

    correction = 1.0 + ((1.0 - speed) * (correction - 1.0));

    if correction == 1.0 {
        return Adjustment { gain, exposure };
    }

    let direction = if correction > 1.0 {
        CorrectionDirection::TurnUp
    } else {
        CorrectionDirection::TurnDown
    };
    let exposure_not_max = exposure < cal.exposure_range[1];
    let gain_not_min = gain > cal.gain_range[0];

    match direction {
        // Too dark: lengthen exposure first, only then raise gain.
        CorrectionDirection::TurnUp => {
            if exposure_not_max {
                Adjustment {
                    gain,
                    exposure: (exposure * correction)
                        .clamp(cal.exposure_range[0], cal.exposure_range[1]),
                }
            } else {
                Adjustment {
                    gain: (gain * correction).clamp(cal.gain_range[0], cal.gain_range[1]),
                    exposure,
                }
            }
        }
        // Too bright: back off gain first, only then shorten exposure.
        CorrectionDirection::TurnDown => {
            if gain_not_min {
                Adjustment {
                    gain: (gain * correction).clamp(cal.gain_range[0], cal.gain_range[1]),
                    exposure,
                }
            } else {
                Adjustment {
                    gain,
                    exposure: (exposure * correction)
                        .clamp(cal.exposure_range[0], cal.exposure_range[1]),
                }
            }
        }
    }
}
