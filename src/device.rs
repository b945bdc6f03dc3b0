//! Device seams between the capture pipeline and real hardware.
//!
//! The pipeline only ever talks to two shapes of device: polled probes
//! that hand back one fixed-size record per read ([`SampleProbe`]), and
//! cameras that push completed frames from their own capture context
//! ([`FrameCamera`]). Everything driver-specific stays behind these traits;
//! the thin backends that exist in-tree are the serial spectrometer link
//! and the I2C hall sensor. Camera capture stacks live out of tree — see
//! [`crate::dummy_devices`] for the synthetic stand-ins.

use nom::{
    bytes::streaming::{tag, take},
    sequence::delimited,
    IResult,
};
use serial2::SerialPort;
use std::error::Error;
use std::fmt;
use std::io::Read;
use std::path::Path;
use std::sync::mpsc::Receiver;
use std::time::Duration;

/// Byte opening every framed spectrometer record.
pub const RECORD_START: u8 = b'<';
/// Byte closing every framed spectrometer record.
pub const RECORD_END: u8 = b'>';

/// I2C address of the sunglasses hall sensor.
pub const SUNGLASSES_I2C_ADDR: u16 = 0x6b;
/// Register the sunglasses reading is fetched from.
pub const SUNGLASSES_READ_REG: u8 = 0x00;

static START_DELIM: [u8; 1] = [RECORD_START];
static END_DELIM: [u8; 1] = [RECORD_END];

/// Errors raised by device backends. All of these are fatal to a
/// recording: hardware that fails to open, disconnects, or desynchronizes
/// cannot be locally repaired mid-run.
#[derive(Debug)]
pub enum DeviceError {
    /// The serial port could not be opened or configured.
    SerialOpen(std::io::Error),

    /// A serial read failed or the device disappeared.
    SerialIo(std::io::Error),

    /// The I2C bus could not be opened or addressed.
    I2cOpen(rppal::i2c::Error),

    /// An I2C transfer failed.
    I2cIo(rppal::i2c::Error),

    /// A framed record did not close with the expected delimiter. This
    /// means the byte stream has desynchronized and every later read
    /// would be misaligned.
    Framing {
        /// The delimiter that should have closed the record.
        expected: u8,
        /// The byte found in its place.
        found: u8,
    },

    /// No record arrived within the device's read timeout. Callers treat
    /// this as "nothing yet" and poll again.
    TimedOut,

    /// The device's frame stream ended while the recording still wanted
    /// frames.
    StreamClosed,
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DeviceError::SerialOpen(error) => write!(f, "could not open serial port: {}", error),
            DeviceError::SerialIo(error) => write!(f, "serial read failed: {}", error),
            DeviceError::I2cOpen(error) => write!(f, "could not open i2c bus: {}", error),
            DeviceError::I2cIo(error) => write!(f, "i2c transfer failed: {}", error),
            DeviceError::Framing { expected, found } => write!(
                f,
                "record not closed by delimiter {:#04x}, found {:#04x}",
                expected, found
            ),
            DeviceError::TimedOut => write!(f, "no data within the read timeout"),
            DeviceError::StreamClosed => write!(f, "device frame stream closed"),
        }
    }
}

impl Error for DeviceError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            DeviceError::SerialOpen(error) | DeviceError::SerialIo(error) => Some(error),
            DeviceError::I2cOpen(error) | DeviceError::I2cIo(error) => Some(error),
            _ => None,
        }
    }
}

/// A polled device producing fixed-size records.
pub trait SampleProbe: Send {
    /// Size of every record this probe produces, in bytes.
    fn record_len(&self) -> usize;

    /// Reads the next record into `out`, which is exactly
    /// [`record_len`](Self::record_len) bytes. Blocks until a record
    /// arrives, the read times out ([`DeviceError::TimedOut`]), or the
    /// device fails.
    fn read_record(&mut self, out: &mut [u8]) -> Result<(), DeviceError>;
}

impl<P: SampleProbe + ?Sized> SampleProbe for Box<P> {
    fn record_len(&self) -> usize {
        (**self).record_len()
    }

    fn read_record(&mut self, out: &mut [u8]) -> Result<(), DeviceError> {
        (**self).read_record(out)
    }
}

/// One completed camera frame, delivered on the camera's channel.
///
/// Implementations must drop cancelled or failed captures before they
/// reach the channel; everything a source receives is a good frame.
#[derive(Debug, Clone)]
pub struct CameraFrame {
    /// The frame's raw bytes (mosaic photosites or a compressed image,
    /// depending on the camera).
    pub bytes: Vec<u8>,
    /// Driver-assigned capture sequence number. Gaps mean dropped frames.
    pub sequence: u64,
}

/// Capture settings applied to every subsequent frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraSettings {
    /// Analogue gain.
    pub gain: f64,
    /// Exposure time in microseconds.
    pub exposure: f64,
    /// Fixed frame duration in microseconds.
    pub frame_duration_us: u64,
}

/// A camera whose driver pushes completed frames from its own capture
/// thread. Starting the camera yields the receiving end of its frame
/// channel; settings updates take effect on later frames.
pub trait FrameCamera: Send {
    /// Begins streaming and returns the frame channel.
    fn start(&mut self) -> Result<Receiver<CameraFrame>, DeviceError>;

    /// Applies gain/exposure/frame-duration to subsequent captures.
    fn apply_settings(&mut self, settings: CameraSettings) -> Result<(), DeviceError>;

    /// Stops streaming and releases the device.
    fn stop(&mut self);
}

impl<C: FrameCamera + ?Sized> FrameCamera for Box<C> {
    fn start(&mut self) -> Result<Receiver<CameraFrame>, DeviceError> {
        (**self).start()
    }

    fn apply_settings(&mut self, settings: CameraSettings) -> Result<(), DeviceError> {
        (**self).apply_settings(settings)
    }

    fn stop(&mut self) {
        (**self).stop()
    }
}

fn framed_record(record_len: usize, input: &[u8]) -> IResult<&[u8], &[u8]> {
    delimited(tag(&START_DELIM[..]), take(record_len), tag(&END_DELIM[..]))(input)
}

/// Extracts delimiter-framed records from a raw byte stream.
///
/// The wire format is `<`, exactly `record_len` payload bytes, `>`. Bytes
/// before a start delimiter are transmission garbage (common right after
/// the device powers up) and are discarded quietly. A record that does not
/// close with the end delimiter is a fatal [`DeviceError::Framing`].
pub struct FramedRecordReader<R> {
    src: R,
    record_len: usize,
    pending: Vec<u8>,
}

impl<R: Read> FramedRecordReader<R> {
    /// Wraps a byte source producing `record_len`-byte framed records.
    pub fn new(src: R, record_len: usize) -> Self {
        Self {
            src,
            record_len,
            pending: Vec::new(),
        }
    }

    /// Reads the next well-framed record into `out`.
    pub fn read_record(&mut self, out: &mut [u8]) -> Result<(), DeviceError> {
        loop {
            // Drop any garbage in front of the next start delimiter.
            match self.pending.iter().position(|b| *b == RECORD_START) {
                Some(garbage) => {
                    self.pending.drain(..garbage);
                }
                None => self.pending.clear(),
            }

            if !self.pending.is_empty() {
                match framed_record(self.record_len, &self.pending) {
                    Ok((rest, record)) => {
                        out.copy_from_slice(record);
                        let consumed = self.pending.len() - rest.len();
                        self.pending.drain(..consumed);
                        return Ok(());
                    }
                    Err(nom::Err::Incomplete(_)) => {}
                    Err(_) => {
                        let found = self
                            .pending
                            .get(1 + self.record_len)
                            .copied()
                            .unwrap_or_default();
                        return Err(DeviceError::Framing {
                            expected: RECORD_END,
                            found,
                        });
                    }
                }
            }

            self.fill()?;
        }
    }

    fn fill(&mut self) -> Result<(), DeviceError> {
        let mut chunk = [0u8; 256];
        let count = self.src.read(&mut chunk).map_err(|error| {
            if matches!(
                error.kind(),
                std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
            ) {
                DeviceError::TimedOut
            } else {
                DeviceError::SerialIo(error)
            }
        })?;
        if count == 0 {
            return Err(DeviceError::StreamClosed);
        }
        self.pending.extend_from_slice(&chunk[..count]);
        Ok(())
    }
}

/// The spectrometer chip on its USB serial link.
///
/// The chip pushes one framed reading per sample period on its own; the
/// blocking read is the capture loop's natural throttle.
pub struct SerialSpectrometer {
    reader: FramedRecordReader<SerialPort>,
}

impl SerialSpectrometer {
    /// Opens and configures the serial link.
    pub fn open(path: impl AsRef<Path>, record_len: usize) -> Result<Self, DeviceError> {
        let mut port = SerialPort::open(path, 115200).map_err(DeviceError::SerialOpen)?;
        // Finite timeout so the capture loop can notice shutdown even when
        // the chip goes quiet.
        port.set_read_timeout(Duration::from_secs(1))
            .map_err(DeviceError::SerialOpen)?;

        Ok(Self {
            reader: FramedRecordReader::new(port, record_len),
        })
    }
}

impl SampleProbe for SerialSpectrometer {
    fn record_len(&self) -> usize {
        self.reader.record_len
    }

    fn read_record(&mut self, out: &mut [u8]) -> Result<(), DeviceError> {
        self.reader.read_record(out)
    }
}

/// The hall-effect sensor reporting the sunglasses flip position, read
/// over I2C. Each reading is the sensor's 12-bit signed ADC value stored
/// as a little-endian `i16`.
pub struct HallSensor {
    bus: rppal::i2c::I2c,
}

impl HallSensor {
    /// Opens the default I2C bus and addresses the sensor.
    pub fn open() -> Result<Self, DeviceError> {
        let mut bus = rppal::i2c::I2c::new().map_err(DeviceError::I2cOpen)?;
        bus.set_slave_address(SUNGLASSES_I2C_ADDR)
            .map_err(DeviceError::I2cOpen)?;
        Ok(Self { bus })
    }
}

impl SampleProbe for HallSensor {
    fn record_len(&self) -> usize {
        2
    }

    fn read_record(&mut self, out: &mut [u8]) -> Result<(), DeviceError> {
        let mut raw = [0u8; 2];
        self.bus
            .write_read(&[SUNGLASSES_READ_REG], &mut raw)
            .map_err(DeviceError::I2cIo)?;

        // The ADC value is 12 bits, sign-extended by hand.
        let mut adc = (((raw[0] & 0x0F) as i16) << 8) | raw[1] as i16;
        if adc > 2047 {
            adc -= 4096;
        }
        out.copy_from_slice(&adc.to_le_bytes());
        Ok(())
    }
}
