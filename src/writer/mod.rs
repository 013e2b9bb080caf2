// Media writer module
// Encodes a sequence of rendered frames into a timestamped container file

pub mod convert;
pub mod ffmpeg;

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum WriterError {
    #[error("Failed to initialize encoder sink: {0}")]
    InitError(String),
    #[error("Encoding failed: {0}")]
    EncodeError(String),
    #[error("Finalize failed: {0}")]
    FinalizeError(String),
}

/// Fixed 90 kHz stream clock. All sample times and durations are in these
/// ticks.
pub const TIME_BASE: i64 = 90_000;

#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Output file; the container format follows the extension.
    pub path: PathBuf,
    pub width: u32,
    pub height: u32,
    /// Target bitrate in bits per second.
    pub bitrate: u32,
    pub fps: u32,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("output.mp4"),
            width: 1920,
            height: 1080,
            bitrate: 8_000_000, // 8 Mbps
            fps: 30,
        }
    }
}

impl WriterConfig {
    /// Duration of one frame in [`TIME_BASE`] ticks.
    pub fn frame_duration(&self) -> i64 {
        if self.fps == 0 {
            0
        } else {
            TIME_BASE / self.fps as i64
        }
    }
}

/// The encoder sink: accepts raw BGRA samples and produces the muxed,
/// compressed container.
pub trait EncoderSink: Send {
    /// Configure the encoder and start the container. Must succeed before
    /// any sample is written.
    fn start(&mut self, config: &WriterConfig) -> Result<(), WriterError>;

    /// Submit one timed sample. `timestamp` and `duration` are in
    /// [`TIME_BASE`] ticks.
    fn write_sample(&mut self, bgra: &[u8], timestamp: i64, duration: i64)
    -> Result<(), WriterError>;

    /// Flush the encoder and close the container.
    fn finalize(&mut self) -> Result<(), WriterError>;
}

/// Writer lifecycle. Operations are only valid in specific states; anything
/// attempted in the wrong state fails without side effects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterState {
    /// Sink initialization failed; every write is refused.
    Uninitialized,
    Ready,
    /// Finalized. Terminal.
    Closed,
}

/// Encodes externally rendered frames into a compressed video file.
///
/// One writer per output file. Frames arrive CPU-mapped as RGBA; each
/// successful write appends exactly one frame interval to the stream, so N
/// writes at fps F produce an N/F-second container.
///
/// Encoding is synchronous and may stall the caller while the sink accepts
/// the sample; callers that need a non-blocking capture loop must offload
/// `write` to their own thread.
pub struct MediaWriter {
    config: WriterConfig,
    sink: Box<dyn EncoderSink>,
    state: WriterState,
    frame_duration: i64,
    next_timestamp: i64,
    frame_buffer: Vec<u8>,
}

impl MediaWriter {
    /// Writer with the default FFmpeg sink.
    pub fn create(config: WriterConfig) -> Self {
        Self::with_sink(config, Box::new(ffmpeg::FfmpegSink::new()))
    }

    /// Writer over a caller-supplied sink. The sink is started immediately;
    /// on failure the writer still exists but refuses every write.
    pub fn with_sink(config: WriterConfig, mut sink: Box<dyn EncoderSink>) -> Self {
        let state = match sink.start(&config) {
            Ok(()) => {
                log::info!(
                    "Media writer ready: {:?}, {}x{} @ {} fps, {} bps",
                    config.path,
                    config.width,
                    config.height,
                    config.fps,
                    config.bitrate
                );
                WriterState::Ready
            }
            Err(e) => {
                log::error!("Media writer failed to initialize: {}", e);
                WriterState::Uninitialized
            }
        };

        let frame_duration = config.frame_duration();
        Self {
            config,
            sink,
            state,
            frame_duration,
            next_timestamp: 0,
            frame_buffer: Vec::new(),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state == WriterState::Ready
    }

    pub fn state(&self) -> WriterState {
        self.state
    }

    /// Encode one RGBA frame. `flip` reverses the rows for renderers whose
    /// readback is bottom-up. Returns false, without advancing the stream
    /// clock, unless the writer is ready, the frame matches the configured
    /// size, and the sink accepts the sample.
    pub fn write(&mut self, rgba: &[u8], flip: bool) -> bool {
        if self.state != WriterState::Ready {
            return false;
        }

        let expected = self.config.width as usize * self.config.height as usize * 4;
        if rgba.len() != expected {
            log::warn!(
                "Dropping frame: got {} bytes, expected {} for {}x{}",
                rgba.len(),
                expected,
                self.config.width,
                self.config.height
            );
            return false;
        }

        let mut buffer = std::mem::take(&mut self.frame_buffer);
        convert::rgba_to_bgra(rgba, self.config.width, self.config.height, flip, &mut buffer);
        let result = self
            .sink
            .write_sample(&buffer, self.next_timestamp, self.frame_duration);
        self.frame_buffer = buffer;

        match result {
            Ok(()) => {
                self.next_timestamp += self.frame_duration;
                true
            }
            Err(e) => {
                log::warn!("Frame write failed: {}", e);
                false
            }
        }
    }

    /// Flush and close the container. Only the first call reaches the sink;
    /// the file is a valid, seekable container once this returns true. The
    /// writer refuses all further writes either way.
    pub fn finalize(&mut self) -> bool {
        if self.state != WriterState::Ready {
            return false;
        }
        self.state = WriterState::Closed;

        match self.sink.finalize() {
            Ok(()) => {
                log::info!(
                    "Media writer finalized: {:?} ({} ticks of video)",
                    self.config.path,
                    self.next_timestamp
                );
                true
            }
            Err(e) => {
                log::error!("Finalize failed: {}", e);
                false
            }
        }
    }
}

impl Drop for MediaWriter {
    fn drop(&mut self) {
        // A writer dropped while still ready closes its container so the
        // file on disk is not left truncated.
        if self.state == WriterState::Ready {
            self.finalize();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Default)]
    struct SinkLog {
        samples: Vec<(i64, i64)>,
        finalized: u32,
    }

    /// Sink that records everything and fails on request.
    struct RecordingSink {
        log: Arc<Mutex<SinkLog>>,
        fail_start: bool,
        fail_writes_remaining: u32,
    }

    impl RecordingSink {
        fn new(log: Arc<Mutex<SinkLog>>) -> Self {
            Self {
                log,
                fail_start: false,
                fail_writes_remaining: 0,
            }
        }
    }

    impl EncoderSink for RecordingSink {
        fn start(&mut self, _config: &WriterConfig) -> Result<(), WriterError> {
            if self.fail_start {
                Err(WriterError::InitError("start refused".to_string()))
            } else {
                Ok(())
            }
        }

        fn write_sample(
            &mut self,
            _bgra: &[u8],
            timestamp: i64,
            duration: i64,
        ) -> Result<(), WriterError> {
            if self.fail_writes_remaining > 0 {
                self.fail_writes_remaining -= 1;
                return Err(WriterError::EncodeError("sink not ready".to_string()));
            }
            self.log.lock().samples.push((timestamp, duration));
            Ok(())
        }

        fn finalize(&mut self) -> Result<(), WriterError> {
            self.log.lock().finalized += 1;
            Ok(())
        }
    }

    fn config(width: u32, height: u32, bitrate: u32, fps: u32) -> WriterConfig {
        WriterConfig {
            path: std::env::temp_dir().join("videobridge-writer-test.mp4"),
            width,
            height,
            bitrate,
            fps,
        }
    }

    fn frame(width: u32, height: u32) -> Vec<u8> {
        vec![0x7f; (width * height * 4) as usize]
    }

    #[test]
    fn test_write_before_ready_fails_without_side_effects() {
        let log = Arc::new(Mutex::new(SinkLog::default()));
        let mut sink = RecordingSink::new(log.clone());
        sink.fail_start = true;

        let mut writer = MediaWriter::with_sink(config(64, 64, 1_000_000, 30), Box::new(sink));
        assert!(!writer.is_ready());
        assert_eq!(writer.state(), WriterState::Uninitialized);

        assert!(!writer.write(&frame(64, 64), false));
        assert!(!writer.finalize());
        assert!(log.lock().samples.is_empty());
        assert_eq!(log.lock().finalized, 0);
    }

    #[test]
    fn test_failed_write_does_not_advance_stream_clock() {
        let log = Arc::new(Mutex::new(SinkLog::default()));
        let mut sink = RecordingSink::new(log.clone());
        sink.fail_writes_remaining = 2;

        let mut writer = MediaWriter::with_sink(config(64, 64, 1_000_000, 30), Box::new(sink));
        assert!(!writer.write(&frame(64, 64), false));
        assert!(!writer.write(&frame(64, 64), false));
        assert!(writer.write(&frame(64, 64), false));

        // The first accepted sample still starts at zero
        assert_eq!(log.lock().samples, vec![(0, 3000)]);
    }

    #[test]
    fn test_samples_are_spaced_by_exactly_one_frame_interval() {
        let log = Arc::new(Mutex::new(SinkLog::default()));
        let sink = RecordingSink::new(log.clone());
        let mut writer = MediaWriter::with_sink(config(64, 64, 1_000_000, 25), Box::new(sink));

        for _ in 0..10 {
            assert!(writer.write(&frame(64, 64), true));
        }

        let samples = log.lock().samples.clone();
        let duration = TIME_BASE / 25;
        assert_eq!(samples.len(), 10);
        for (n, (timestamp, sample_duration)) in samples.iter().enumerate() {
            assert_eq!(*timestamp, n as i64 * duration);
            assert_eq!(*sample_duration, duration);
        }
    }

    #[test]
    fn test_three_second_recording_scenario() {
        // 1280x720 at 6 Mbps / 30 fps, 90 frames = 3.0 seconds
        let log = Arc::new(Mutex::new(SinkLog::default()));
        let sink = RecordingSink::new(log.clone());
        let mut writer = MediaWriter::with_sink(config(1280, 720, 6_000_000, 30), Box::new(sink));

        let pixels = frame(1280, 720);
        for _ in 0..90 {
            assert!(writer.write(&pixels, true));
        }
        assert!(writer.finalize());

        {
            let log = log.lock();
            assert_eq!(log.samples.len(), 90);
            assert_eq!(log.finalized, 1);
            let last = log.samples.last().unwrap();
            // Last frame starts at 89/30 s; the stream ends at exactly 3.0 s
            assert_eq!(last.0, 89 * 3000);
            assert_eq!(last.0 + last.1, 3 * TIME_BASE);
        }

        // Writing after finalize must fail and leave the file untouched
        assert!(!writer.write(&pixels, true));
        assert_eq!(log.lock().samples.len(), 90);
    }

    #[test]
    fn test_finalize_reaches_sink_exactly_once() {
        let log = Arc::new(Mutex::new(SinkLog::default()));
        let sink = RecordingSink::new(log.clone());
        let mut writer = MediaWriter::with_sink(config(64, 64, 1_000_000, 30), Box::new(sink));

        assert!(writer.finalize());
        assert!(!writer.finalize());
        drop(writer);

        assert_eq!(log.lock().finalized, 1);
    }

    #[test]
    fn test_drop_while_ready_closes_the_container() {
        let log = Arc::new(Mutex::new(SinkLog::default()));
        let sink = RecordingSink::new(log.clone());
        let writer = MediaWriter::with_sink(config(64, 64, 1_000_000, 30), Box::new(sink));

        drop(writer);
        assert_eq!(log.lock().finalized, 1);
    }

    #[test]
    fn test_mismatched_frame_size_is_dropped() {
        let log = Arc::new(Mutex::new(SinkLog::default()));
        let sink = RecordingSink::new(log.clone());
        let mut writer = MediaWriter::with_sink(config(64, 64, 1_000_000, 30), Box::new(sink));

        assert!(!writer.write(&frame(32, 32), false));
        assert!(log.lock().samples.is_empty());
    }

    #[test]
    fn test_frame_duration_math() {
        assert_eq!(config(64, 64, 1, 30).frame_duration(), 3000);
        assert_eq!(config(64, 64, 1, 60).frame_duration(), 1500);
        assert_eq!(config(64, 64, 1, 0).frame_duration(), 0);
    }
}
