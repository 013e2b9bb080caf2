//! FFmpeg encoder sink
//!
//! H.264 via libx264, muxed into the container matching the output path's
//! extension (MP4 by default). One fixed encoder profile; callers wanting a
//! different codec supply their own [`EncoderSink`].

use std::sync::Once;

use ffmpeg_next as ffmpeg;
use ffmpeg_next::format::Pixel;
use ffmpeg_next::frame::Video as VideoFrame;
use ffmpeg_next::{Packet, Rational};

use super::{EncoderSink, TIME_BASE, WriterConfig, WriterError, convert};

static FFMPEG_INIT: Once = Once::new();

/// Initialize FFmpeg (call once)
fn init_ffmpeg() {
    FFMPEG_INIT.call_once(|| {
        ffmpeg::init().expect("Failed to initialize FFmpeg");
        if cfg!(debug_assertions) {
            ffmpeg::log::set_level(ffmpeg::log::Level::Info);
        }
    });
}

/// Encoder sink backed by FFmpeg's libx264 encoder and container muxers.
pub struct FfmpegSink {
    output: Option<ffmpeg::format::context::Output>,
    encoder: Option<ffmpeg::encoder::Video>,
    encoder_time_base: Rational,
    stream_time_base: Rational,
    width: u32,
    height: u32,
    frame_duration: i64,
}

impl FfmpegSink {
    pub fn new() -> Self {
        let time_base = Rational::new(1, TIME_BASE as i32);
        Self {
            output: None,
            encoder: None,
            encoder_time_base: time_base,
            stream_time_base: time_base,
            width: 0,
            height: 0,
            frame_duration: 0,
        }
    }

    /// Drain pending packets from the encoder into the muxer.
    fn write_packets(&mut self) -> Result<(), WriterError> {
        let (Some(encoder), Some(output)) = (self.encoder.as_mut(), self.output.as_mut()) else {
            return Ok(());
        };

        let mut packet = Packet::empty();
        while encoder.receive_packet(&mut packet).is_ok() {
            packet.set_stream(0);
            packet.set_duration(self.frame_duration);
            packet.rescale_ts(self.encoder_time_base, self.stream_time_base);

            // Some encoders leave DTS unset; the muxer refuses that
            if packet.dts().is_none() {
                if let Some(pts) = packet.pts() {
                    packet.set_dts(Some(pts));
                }
            }

            packet
                .write_interleaved(output)
                .map_err(|e| WriterError::EncodeError(format!("Failed to write packet: {}", e)))?;
        }

        Ok(())
    }
}

impl Default for FfmpegSink {
    fn default() -> Self {
        Self::new()
    }
}

impl EncoderSink for FfmpegSink {
    fn start(&mut self, config: &WriterConfig) -> Result<(), WriterError> {
        init_ffmpeg();

        if config.width == 0 || config.height == 0 || config.fps == 0 {
            return Err(WriterError::InitError(format!(
                "invalid encode target {}x{} @ {} fps",
                config.width, config.height, config.fps
            )));
        }
        if config.width % 2 != 0 || config.height % 2 != 0 {
            // YUV420 subsampling needs even dimensions
            return Err(WriterError::InitError(format!(
                "odd frame size {}x{} cannot be encoded as 4:2:0",
                config.width, config.height
            )));
        }

        let mut output = ffmpeg::format::output(&config.path).map_err(|e| {
            WriterError::InitError(format!("Failed to create output {:?}: {}", config.path, e))
        })?;

        let codec = ffmpeg::encoder::find_by_name("libx264")
            .ok_or_else(|| WriterError::InitError("libx264 encoder not found".to_string()))?;

        let context = ffmpeg::codec::context::Context::new_with_codec(codec);
        let mut encoder = context.encoder().video().map_err(|e| {
            WriterError::InitError(format!("Failed to create encoder context: {}", e))
        })?;

        encoder.set_width(config.width);
        encoder.set_height(config.height);
        encoder.set_format(Pixel::YUV420P);
        encoder.set_time_base(Rational::new(1, TIME_BASE as i32));
        encoder.set_frame_rate(Some(Rational::new(config.fps as i32, 1)));
        encoder.set_bit_rate(config.bitrate as usize);
        // One keyframe per second keeps the output seekable
        encoder.set_gop(config.fps);

        if output
            .format()
            .flags()
            .contains(ffmpeg::format::Flags::GLOBAL_HEADER)
        {
            encoder.set_flags(ffmpeg::codec::Flags::GLOBAL_HEADER);
        }

        let mut opts = ffmpeg::Dictionary::new();
        opts.set("preset", "medium");
        opts.set("profile", "high");

        let encoder = encoder
            .open_with(opts)
            .map_err(|e| WriterError::InitError(format!("Failed to open libx264: {}", e)))?;

        {
            let mut stream = output
                .add_stream(codec)
                .map_err(|e| WriterError::InitError(format!("Failed to add stream: {}", e)))?;
            stream.set_parameters(&encoder);
            stream.set_time_base(Rational::new(1, TIME_BASE as i32));
        }

        let mut container_opts = ffmpeg::Dictionary::new();
        // Move the moov atom to the front so the file is seekable
        container_opts.set("movflags", "faststart");

        output.write_header_with(container_opts).map_err(|e| {
            WriterError::InitError(format!("Failed to write container header: {}", e))
        })?;

        // The muxer may adjust the stream time base during write_header
        self.encoder_time_base = Rational::new(1, TIME_BASE as i32);
        self.stream_time_base = output
            .stream(0)
            .map(|s| s.time_base())
            .unwrap_or(self.encoder_time_base);
        self.width = config.width;
        self.height = config.height;
        self.frame_duration = config.frame_duration();
        self.output = Some(output);
        self.encoder = Some(encoder);

        log::info!(
            "FFmpeg sink started: libx264 {}x{} @ {} fps into {:?}",
            config.width,
            config.height,
            config.fps,
            config.path
        );

        Ok(())
    }

    fn write_sample(
        &mut self,
        bgra: &[u8],
        timestamp: i64,
        _duration: i64,
    ) -> Result<(), WriterError> {
        let yuv = convert::bgra_to_yuv420(bgra, self.width, self.height);

        let mut frame = VideoFrame::new(Pixel::YUV420P, self.width, self.height);
        fill_yuv_planes(&mut frame, &yuv, self.width, self.height);
        frame.set_pts(Some(timestamp));

        let encoder = self
            .encoder
            .as_mut()
            .ok_or_else(|| WriterError::EncodeError("sink not started".to_string()))?;
        encoder
            .send_frame(&frame)
            .map_err(|e| WriterError::EncodeError(format!("Failed to send frame: {}", e)))?;

        self.write_packets()
    }

    fn finalize(&mut self) -> Result<(), WriterError> {
        if let Some(encoder) = self.encoder.as_mut() {
            encoder
                .send_eof()
                .map_err(|e| WriterError::FinalizeError(format!("Failed to flush encoder: {}", e)))?;
        }
        self.write_packets()?;

        if let Some(output) = self.output.as_mut() {
            output
                .write_trailer()
                .map_err(|e| WriterError::FinalizeError(format!("Failed to write trailer: {}", e)))?;
        }

        self.encoder = None;
        self.output = None;
        Ok(())
    }
}

/// Copy contiguous YUV420 planes into an FFmpeg frame, respecting its row
/// strides.
fn fill_yuv_planes(frame: &mut VideoFrame, yuv: &[u8], width: u32, height: u32) {
    let w = width as usize;
    let h = height as usize;
    let y_size = w * h;
    let uv_w = w / 2;
    let uv_h = h / 2;
    let uv_size = uv_w * uv_h;

    let y_stride = frame.stride(0);
    for row in 0..h {
        let src = row * w;
        let dst = row * y_stride;
        frame.data_mut(0)[dst..dst + w].copy_from_slice(&yuv[src..src + w]);
    }

    let u_stride = frame.stride(1);
    for row in 0..uv_h {
        let src = y_size + row * uv_w;
        let dst = row * u_stride;
        frame.data_mut(1)[dst..dst + uv_w].copy_from_slice(&yuv[src..src + uv_w]);
    }

    let v_stride = frame.stride(2);
    for row in 0..uv_h {
        let src = y_size + uv_size + row * uv_w;
        let dst = row * v_stride;
        frame.data_mut(2)[dst..dst + uv_w].copy_from_slice(&yuv[src..src + uv_w]);
    }
}
