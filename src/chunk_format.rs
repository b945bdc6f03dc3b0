//! This module provides an API to read and write chunk files, the on-disk
//! format holding one buffer generation. A recording directory contains
//! `chunk_1.bin`, `chunk_2.bin`, … — one file per flushed generation. Each
//! file has the following structure:
//!
//! - First a header with the chunk's metadata:
//!   - The sequence number of the write that produced it
//!   - The ordered list of sensor kinds whose streams follow
//! - Then a separator, which is a byte of all 1s; `0xFF`.
//! - Finally one byte stream per sensor, each prefixed with its length as
//!   a little-endian `u64`. Disabled sensors appear as zero-length
//!   streams, so every chunk carries exactly the same stream layout.
//!
//! The header is encoded using [serde] and [ron]. In the file, it appears
//! as follows:
//!
//! ```text
//! (sequence:N,kinds:[Spectrometer,WorldCamera,PupilCamera,Sunglasses])
//! ```

use crate::config::SensorKind;
use serde::{Deserialize, Serialize};
use std::{
    borrow::Cow,
    fmt,
    fs::File,
    io::{Read, Write},
    path::Path,
};

/// This struct contains the header data for a chunk file.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
struct ChunkHeader {
    sequence: u32,
    kinds: Vec<SensorKind>,
}

/// A nice little error that we can return if things go wrong while
/// reading or writing a chunk file.
#[derive(Debug)]
pub enum ChunkFileError {
    /// Returned when trying to read a chunk file, but not able to find the
    /// delimiter between the header and the stream binary.
    NoDelimiter,

    /// Returned when a stream's length prefix promises more bytes than the
    /// file contains.
    TruncatedStream,

    /// Returned when io fails when reading or writing files.
    IoError(std::io::Error),

    /// Returned when serialization of the header fails.
    RonError(ron::Error),

    /// Returned when deserialization of the header fails.
    RonSpannedError(ron::de::SpannedError),
}

impl fmt::Display for ChunkFileError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use ChunkFileError as CFE;
        let msg = match self {
            CFE::NoDelimiter => Cow::from("no delimiter in chunk file"),
            CFE::TruncatedStream => Cow::from("stream shorter than its length prefix"),
            CFE::IoError(error) => Cow::from(format!("io error: {}", error)),
            CFE::RonError(error) => Cow::from(format!("ron error: {}", error)),
            CFE::RonSpannedError(error) => Cow::from(format!("ron spanning error: {}", error)),
        };

        write!(f, "{}", msg)
    }
}

impl std::error::Error for ChunkFileError {}

/// One deserialized chunk: a sequence number plus the per-sensor streams
/// in their on-disk order.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkFile {
    header: ChunkHeader,
    streams: Vec<Vec<u8>>,
}

impl ChunkFile {
    /// The write number that produced this chunk.
    pub fn sequence(&self) -> u32 {
        self.header.sequence
    }

    /// The streams in on-disk order, tagged with their sensor kinds.
    pub fn streams(&self) -> Vec<(SensorKind, &[u8])> {
        self.header
            .kinds
            .iter()
            .copied()
            .zip(self.streams.iter().map(|s| s.as_slice()))
            .collect()
    }

    /// The stream recorded for one sensor, if the chunk contains it.
    pub fn stream(&self, kind: SensorKind) -> Option<&[u8]> {
        self.header
            .kinds
            .iter()
            .position(|k| *k == kind)
            .map(|i| self.streams[i].as_slice())
    }

    /// Serializes one generation to the [`Write`]able object provided.
    /// `streams` borrows the buffers, so nothing is copied on the way out.
    pub fn write_streams(
        file: &mut impl Write,
        sequence: u32,
        streams: &[(SensorKind, &[u8])],
    ) -> Result<(), ChunkFileError> {
        let header = ChunkHeader {
            sequence,
            kinds: streams.iter().map(|(kind, _)| *kind).collect(),
        };
        let h_str = ron::ser::to_string(&header).map_err(ChunkFileError::RonError)?;

        file.write_all(h_str.as_bytes())
            .map_err(ChunkFileError::IoError)?;
        file.write_all(&[0xFF]).map_err(ChunkFileError::IoError)?;

        for (_, bytes) in streams {
            let len = bytes.len() as u64;
            file.write_all(&len.to_le_bytes())
                .map_err(ChunkFileError::IoError)?;
            file.write_all(bytes).map_err(ChunkFileError::IoError)?;
        }

        Ok(())
    }

    /// Reads a chunk back from the path provided.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ChunkFileError> {
        let mut handle = File::open(path).map_err(ChunkFileError::IoError)?;
        Self::from_file(&mut handle)
    }

    /// Reads a chunk back from the [`Read`]able object provided.
    pub fn from_file(file: &mut impl Read) -> Result<Self, ChunkFileError> {
        let mut raw = Vec::new();
        file.read_to_end(&mut raw).map_err(ChunkFileError::IoError)?;

        let delim_idx = raw
            .iter()
            .position(|b| *b == 0xFF)
            .ok_or(ChunkFileError::NoDelimiter)?;

        let (header_buf, streams_buf) = raw.split_at(delim_idx);
        let mut streams_buf = &streams_buf[1..];

        let header = ron::de::from_bytes::<ChunkHeader>(header_buf)
            .map_err(ChunkFileError::RonSpannedError)?;

        let mut streams = Vec::with_capacity(header.kinds.len());
        for _ in &header.kinds {
            if streams_buf.len() < 8 {
                return Err(ChunkFileError::TruncatedStream);
            }
            let (prefix, rest) = streams_buf.split_at(8);
            let len_bytes: [u8; 8] = prefix.try_into().map_err(|_| ChunkFileError::TruncatedStream)?;
            let len = u64::from_le_bytes(len_bytes) as usize;
            if rest.len() < len {
                return Err(ChunkFileError::TruncatedStream);
            }
            streams.push(rest[..len].to_vec());
            streams_buf = &rest[len..];
        }

        Ok(ChunkFile { header, streams })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn generation() -> Vec<(SensorKind, Vec<u8>)> {
        vec![
            (SensorKind::Spectrometer, vec![1, 2, 3, 4]),
            (SensorKind::WorldCamera, vec![0xFF; 32]),
            (SensorKind::PupilCamera, vec![]),
            (SensorKind::Sunglasses, vec![0x10, 0x00]),
        ]
    }

    fn borrowed(streams: &[(SensorKind, Vec<u8>)]) -> Vec<(SensorKind, &[u8])> {
        streams
            .iter()
            .map(|(kind, bytes)| (*kind, bytes.as_slice()))
            .collect()
    }

    #[test]
    fn write_and_read_cursor() {
        let streams = generation();
        let mut buf = Cursor::new(Vec::new());

        ChunkFile::write_streams(&mut buf, 7, &borrowed(&streams)).unwrap();
        buf.set_position(0);
        let read_back = ChunkFile::from_file(&mut buf).unwrap();

        assert_eq!(read_back.sequence(), 7);
        let read_streams = read_back.streams();
        assert_eq!(read_streams.len(), 4);
        for ((kind, bytes), (read_kind, read_bytes)) in streams.iter().zip(read_streams) {
            assert_eq!(*kind, read_kind);
            assert_eq!(bytes.as_slice(), read_bytes);
        }
    }

    #[test]
    fn write_and_read_path() {
        let tempfile = tempfile::NamedTempFile::new().unwrap();
        let streams = generation();

        let mut handle = File::create(tempfile.path()).unwrap();
        ChunkFile::write_streams(&mut handle, 1, &borrowed(&streams)).unwrap();
        drop(handle);

        let read_back = ChunkFile::from_path(tempfile.path()).unwrap();
        assert_eq!(read_back.sequence(), 1);
        assert_eq!(
            read_back.stream(SensorKind::Sunglasses),
            Some(&[0x10, 0x00][..])
        );
        assert_eq!(read_back.stream(SensorKind::PupilCamera), Some(&[][..]));
    }

    #[test]
    fn payload_bytes_may_contain_the_delimiter() {
        // The first 0xFF in the file must be the separator, never payload.
        let streams = vec![(SensorKind::WorldCamera, vec![0xFFu8, 0xFF, 0xFF])];
        let mut buf = Cursor::new(Vec::new());
        ChunkFile::write_streams(&mut buf, 2, &borrowed(&streams)).unwrap();
        buf.set_position(0);
        let read_back = ChunkFile::from_file(&mut buf).unwrap();
        assert_eq!(
            read_back.stream(SensorKind::WorldCamera),
            Some(&[0xFF, 0xFF, 0xFF][..])
        );
    }

    #[test]
    fn read_from_garbage_fails_cleanly() {
        let mut no_delim = Cursor::new(vec![b'(', b')']);
        assert!(matches!(
            ChunkFile::from_file(&mut no_delim),
            Err(ChunkFileError::NoDelimiter)
        ));

        // Valid header promising a stream the payload does not contain.
        let mut buf = Cursor::new(Vec::new());
        ChunkFile::write_streams(
            &mut buf,
            3,
            &[(SensorKind::Spectrometer, &[1, 2, 3, 4][..])],
        )
        .unwrap();
        let mut truncated = buf.into_inner();
        truncated.truncate(truncated.len() - 2);
        assert!(matches!(
            ChunkFile::from_file(&mut Cursor::new(truncated)),
            Err(ChunkFileError::TruncatedStream)
        ));
    }
}
