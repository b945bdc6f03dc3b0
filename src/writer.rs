//! The writer thread: drains whole buffer generations to chunk files.
//!
//! While the capture threads fill one slot of every pair, the writer owns
//! the other: once per buffer window — plus a grace period that lets
//! slower sensors finish landing their in-flight records — it locks the
//! matching slot of every pair (one *generation*), shrinks the world
//! camera stream through the downsample kernel, serializes the lot to
//! `chunk_<N>.bin`, and clears each slot for reuse. The loop structure
//! always owes one last generation when the recording duration expires,
//! so a final write happens on the way out.
//!
//! A chunk file that cannot be created ends the run: silently dropping a
//! window of data would be worse than aborting the recording.

use crate::chunk_format::{ChunkFile, ChunkFileError};
use crate::config::{SensorKind, WorldCameraConfig};
use crate::coordinator::Shutdown;
use crate::double_buffer::{DoubleBuffer, SampleBuffer};
use crate::downsample::{downsample, downsampled_len};
use log::info;
use std::borrow::Cow;
use std::fmt;
use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// How often the waiting loop rechecks the clock.
const WAIT_POLL: Duration = Duration::from_millis(10);

/// Raised when a generation cannot be flushed.
#[derive(Debug)]
pub enum WriteError {
    /// The chunk file could not be created.
    CreateFailed {
        /// The path that failed.
        path: PathBuf,
        /// The underlying failure.
        source: std::io::Error,
    },

    /// Serialization into an open chunk file failed.
    Chunk(ChunkFileError),
}

impl fmt::Display for WriteError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let msg = match self {
            WriteError::CreateFailed { path, source } => {
                Cow::from(format!("failed to create {}: {}", path.display(), source))
            }
            WriteError::Chunk(error) => Cow::from(format!("{}", error)),
        };

        write!(f, "{}", msg)
    }
}

impl std::error::Error for WriteError {}

impl From<ChunkFileError> for WriteError {
    fn from(error: ChunkFileError) -> Self {
        WriteError::Chunk(error)
    }
}

/// Which slot of every pair belongs to the numbered write: chunk 1 drains
/// the slot the producers filled first.
pub fn generation_slot(write_num: u32) -> usize {
    ((write_num as usize) + 1) % 2
}

/// One sensor's buffer pair as the writer sees it.
pub struct WriterChannel {
    /// Which sensor fills this pair.
    pub kind: SensorKind,
    /// The shared pair.
    pub pair: Arc<DoubleBuffer>,
}

/// In-place downsampling of the world camera stream before serialization.
///
/// The buffer holds whole raw frames back to back; each is downsampled
/// into a scratch region, then the shrunken stream replaces the buffer's
/// filled prefix. Capacity is untouched, so the slot refills to full size
/// on its next cycle.
pub struct DownsamplePass {
    rows: u16,
    cols: u16,
    factor: u8,
    frame_bytes: usize,
    scratch: Vec<u8>,
}

impl DownsamplePass {
    /// Sizes the pass for one buffer's worth of world frames.
    pub fn new(world: &WorldCameraConfig, frames_per_buffer: usize) -> Self {
        let shrunken = downsampled_len(world.rows, world.cols, world.downsample_factor);
        Self {
            rows: world.rows,
            cols: world.cols,
            factor: world.downsample_factor,
            frame_bytes: world.frame_bytes(),
            scratch: vec![0; frames_per_buffer * shrunken],
        }
    }

    fn apply(&mut self, buffer: &mut SampleBuffer) {
        let frames = buffer.offset() / self.frame_bytes;
        let shrunken = downsampled_len(self.rows, self.cols, self.factor);

        for frame in 0..frames {
            downsample(
                &buffer.filled()[frame * self.frame_bytes..(frame + 1) * self.frame_bytes],
                self.rows,
                self.cols,
                self.factor,
                &mut self.scratch[frame * shrunken..(frame + 1) * shrunken],
            );
        }

        buffer.replace_filled(&self.scratch[..frames * shrunken]);
    }
}

/// The writer's half of the capture pipeline.
pub struct Writer {
    output_dir: PathBuf,
    window: Duration,
    grace: Duration,
    channels: Vec<WriterChannel>,
    world_pass: Option<DownsamplePass>,
}

impl Writer {
    /// A writer flushing `channels` (in chunk stream order) into
    /// `output_dir`. `world_pass` is present when the world camera is
    /// active.
    pub fn new(
        output_dir: PathBuf,
        window: Duration,
        grace: Duration,
        channels: Vec<WriterChannel>,
        world_pass: Option<DownsamplePass>,
    ) -> Self {
        Self {
            output_dir,
            window,
            grace,
            channels,
            world_pass,
        }
    }

    /// Runs the flush loop until `duration` elapses, then performs the
    /// final write. Returns how many chunks were written.
    pub fn run(&mut self, duration: Duration, shutdown: &Shutdown) -> Result<u32, WriteError> {
        let start = Instant::now();
        let mut last_write = Instant::now();
        let mut write_num: u32 = 1;

        info!("writer | waiting for the first full window");
        loop {
            if shutdown.is_set() {
                info!("writer | shutdown requested, abandoning the run");
                return Ok(write_num - 1);
            }
            if start.elapsed() >= duration {
                break;
            }

            if last_write.elapsed() >= self.window + self.grace {
                self.flush_generation(write_num)?;
                last_write = Instant::now();
                write_num += 1;
            } else {
                thread::sleep(WAIT_POLL);
            }
        }

        // The wait loop only ever flushes after the *next* window has
        // begun, so the generation in flight when the duration expires is
        // still owed its write.
        self.flush_generation(write_num)?;
        Ok(write_num)
    }

    fn flush_generation(&mut self, write_num: u32) -> Result<(), WriteError> {
        let slot = generation_slot(write_num);
        let path = self.output_dir.join(format!("chunk_{write_num}.bin"));
        let started = Instant::now();
        info!("writer | writing chunk {write_num}");

        let mut file = File::create(&path).map_err(|source| WriteError::CreateFailed {
            path: path.clone(),
            source,
        })?;

        // Hold this generation's slot of every pair until it is on disk.
        let mut guards: Vec<_> = self
            .channels
            .iter()
            .map(|channel| channel.pair.lock_slot(slot))
            .collect();

        if let Some(pass) = &mut self.world_pass {
            for (channel, guard) in self.channels.iter().zip(guards.iter_mut()) {
                if channel.kind == SensorKind::WorldCamera {
                    pass.apply(guard);
                }
            }
        }

        let streams: Vec<(SensorKind, &[u8])> = self
            .channels
            .iter()
            .zip(guards.iter())
            .map(|(channel, guard)| (channel.kind, guard.filled()))
            .collect();
        ChunkFile::write_streams(&mut file, write_num, &streams)?;
        drop(streams);

        for guard in guards.iter_mut() {
            guard.clear();
        }
        drop(guards);

        info!(
            "writer | chunk {write_num} took {} ms",
            started.elapsed().as_millis()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SensorKind;

    fn channel(kind: SensorKind, capacity: usize) -> WriterChannel {
        WriterChannel {
            kind,
            pair: Arc::new(DoubleBuffer::new(capacity)),
        }
    }

    #[test]
    fn chunk_numbers_alternate_generation_slots() {
        assert_eq!(generation_slot(1), 0);
        assert_eq!(generation_slot(2), 1);
        assert_eq!(generation_slot(3), 0);
        assert_eq!(generation_slot(4), 1);
    }

    #[test]
    fn expired_duration_still_flushes_the_owed_generation() {
        let dir = tempfile::tempdir().unwrap();
        let spectro = channel(SensorKind::Spectrometer, 16);
        let glasses = channel(SensorKind::Sunglasses, 16);
        spectro.pair.write(&[1, 2, 3]).unwrap();
        glasses.pair.write(&[9]).unwrap();
        let spectro_pair = Arc::clone(&spectro.pair);

        let mut writer = Writer::new(
            dir.path().to_path_buf(),
            Duration::from_secs(5),
            Duration::from_secs(1),
            vec![spectro, glasses],
            None,
        );

        // Zero duration: the loop breaks immediately into the final write.
        let chunks = writer
            .run(Duration::from_secs(0), &Shutdown::new())
            .unwrap();
        assert_eq!(chunks, 1);

        let chunk = ChunkFile::from_path(dir.path().join("chunk_1.bin")).unwrap();
        assert_eq!(chunk.sequence(), 1);
        assert_eq!(chunk.stream(SensorKind::Spectrometer), Some(&[1, 2, 3][..]));
        assert_eq!(chunk.stream(SensorKind::Sunglasses), Some(&[9][..]));

        // The drained slot was handed back empty.
        assert_eq!(spectro_pair.lock_slot(0).offset(), 0);
    }

    #[test]
    fn shutdown_abandons_the_run_without_a_final_write() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = Writer::new(
            dir.path().to_path_buf(),
            Duration::from_secs(5),
            Duration::from_secs(1),
            vec![channel(SensorKind::Spectrometer, 16)],
            None,
        );

        let shutdown = Shutdown::new();
        shutdown.trigger();
        let chunks = writer.run(Duration::from_secs(60), &shutdown).unwrap();
        assert_eq!(chunks, 0);
        assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
    }

    #[test]
    fn missing_output_directory_is_fatal() {
        let mut writer = Writer::new(
            PathBuf::from("/nonexistent/lumilog-test"),
            Duration::from_secs(5),
            Duration::from_secs(1),
            vec![channel(SensorKind::Spectrometer, 16)],
            None,
        );
        let err = writer
            .run(Duration::from_secs(0), &Shutdown::new())
            .unwrap_err();
        assert!(matches!(err, WriteError::CreateFailed { .. }));
    }

    #[test]
    fn world_stream_is_downsampled_before_serialization() {
        let dir = tempfile::tempdir().unwrap();
        let world_config = WorldCameraConfig {
            fps: 2,
            rows: 4,
            cols: 4,
            downsample_factor: 1,
            ..Default::default()
        };

        // Two uniform 4x4 frames; each must shrink to a 2x2 frame.
        let world = channel(SensorKind::WorldCamera, 2 * 16);
        world.pair.write(&[10; 16]).unwrap();
        world.pair.write(&[20; 16]).unwrap();
        let world_pair = Arc::clone(&world.pair);

        let mut writer = Writer::new(
            dir.path().to_path_buf(),
            Duration::from_secs(5),
            Duration::from_secs(1),
            vec![world],
            Some(DownsamplePass::new(&world_config, 2)),
        );
        writer
            .run(Duration::from_secs(0), &Shutdown::new())
            .unwrap();

        let chunk = ChunkFile::from_path(dir.path().join("chunk_1.bin")).unwrap();
        let mut expected = vec![10u8; 4];
        expected.extend_from_slice(&[20; 4]);
        assert_eq!(chunk.stream(SensorKind::WorldCamera), Some(&expected[..]));

        // Capacity survived the in-place shrink, so the slot can hold
        // full-size frames again next cycle.
        let slot = world_pair.lock_slot(0);
        assert_eq!(slot.capacity(), 32);
        assert_eq!(slot.offset(), 0);
    }
}
