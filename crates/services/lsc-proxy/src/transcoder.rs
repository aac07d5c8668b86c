//! Command templates for the transcoder and the restreamer
//!
//! ffmpeg reads raw PCM and H.264 from the two FIFOs and pushes RTSP to
//! mediamtx, which serves it to pull clients.

use std::convert::Infallible;
use std::ffi::OsString;
use std::path::PathBuf;

use crate::config::Config;
use crate::supervisor::ProcessTemplate;

/// Video filter applied while flipped
pub const FLIP_FILTER: &str = "hflip,vflip";

/// ffmpeg descriptor
#[derive(Debug, Clone)]
pub struct TranscoderTemplate {
    program: PathBuf,
    audio_fifo: PathBuf,
    video_fifo: PathBuf,
    rtsp_url: String,
    flipped: bool,
}

impl TranscoderTemplate {
    pub fn new(
        program: impl Into<PathBuf>,
        audio_fifo: impl Into<PathBuf>,
        video_fifo: impl Into<PathBuf>,
        rtsp_url: impl Into<String>,
    ) -> Self {
        Self {
            program: program.into(),
            audio_fifo: audio_fifo.into(),
            video_fifo: video_fifo.into(),
            rtsp_url: rtsp_url.into(),
            flipped: false,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            &config.paths.ffmpeg,
            &config.paths.audio_fifo,
            &config.paths.video_fifo,
            &config.stream.rtsp_url,
        )
    }

    pub fn is_flipped(&self) -> bool {
        self.flipped
    }
}

impl ProcessTemplate for TranscoderTemplate {
    /// Desired flip state
    type Change = bool;

    fn name(&self) -> &str {
        "ffmpeg"
    }

    fn program(&self) -> PathBuf {
        self.program.clone()
    }

    fn args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = Vec::with_capacity(40);
        args.extend(["-re", "-hide_banner"].map(OsString::from));

        // 8 kHz mono s16le PCM
        args.extend(
            ["-thread_queue_size", "4096", "-f", "s16le", "-ar", "8000", "-ac", "1", "-i"]
                .map(OsString::from),
        );
        args.push(self.audio_fifo.clone().into_os_string());

        // Annex-B H.264
        args.extend(["-thread_queue_size", "4096", "-f", "h264", "-i"].map(OsString::from));
        args.push(self.video_fifo.clone().into_os_string());

        if self.flipped {
            args.extend(["-vf", FLIP_FILTER].map(OsString::from));
        }

        args.extend(
            [
                "-c:a",
                "aac",
                "-b:a",
                "32000",
                "-c:v",
                "libx264",
                "-preset",
                "ultrafast",
                "-tune",
                "zerolatency",
                "-async",
                "1",
                "-f",
                "rtsp",
                "-rtsp_transport",
                "tcp",
            ]
            .map(OsString::from),
        );
        args.push(OsString::from(&self.rtsp_url));
        args
    }

    fn apply(&mut self, flipped: bool) -> bool {
        if self.flipped == flipped {
            return false;
        }
        self.flipped = flipped;
        true
    }
}

/// mediamtx descriptor
#[derive(Debug, Clone)]
pub struct RestreamerTemplate {
    program: PathBuf,
    config_file: PathBuf,
}

impl RestreamerTemplate {
    pub fn new(program: impl Into<PathBuf>, config_file: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            config_file: config_file.into(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(&config.paths.mediamtx, &config.paths.mediamtx_config)
    }
}

impl ProcessTemplate for RestreamerTemplate {
    type Change = Infallible;

    fn name(&self) -> &str {
        "mediamtx"
    }

    fn program(&self) -> PathBuf {
        self.program.clone()
    }

    fn args(&self) -> Vec<OsString> {
        vec![self.config_file.clone().into_os_string()]
    }

    fn apply(&mut self, change: Infallible) -> bool {
        match change {}
    }
}
