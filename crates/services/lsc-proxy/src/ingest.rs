//! Frame ingestion loops
//!
//! One loop per media kind pulls from the device session and pushes into a
//! [`ByteSink`]. Pulls block inside the vendor SDK, so each loop runs on its
//! own OS thread and checks the [`ShutdownToken`] once per iteration.
//!
//! Per iteration:
//!
//! 1. ask the source whether it is ready (audio waits for a minimum backlog)
//! 2. pull one frame into a fixed-size buffer
//! 3. classify the pull; only `Data` reaches the sink, fatal statuses end
//!    the loop
//! 4. write the frame, applying the sink's [`RecoveryPolicy`] on failure

use lsc_tutk::{DeviceSession, FatalStatus, StreamStatus};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::shutdown::ShutdownToken;
use crate::sink::{ByteSink, RecoveryPolicy, SinkError};

/// Media carried by a loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Audio,
    Video,
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaKind::Audio => write!(f, "audio"),
            MediaKind::Video => write!(f, "video"),
        }
    }
}

/// Gate checked before every pull
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Pull now
    Ready,
    /// Not enough buffered yet; back off and ask again
    Wait,
    /// The source cannot deliver any more
    Stop(IngestExit),
}

/// Where frames come from
pub trait FrameSource: Send {
    fn kind(&self) -> MediaKind;

    fn ready(&mut self) -> Readiness {
        Readiness::Ready
    }

    /// Pull one frame into `buf`
    fn pull(&mut self, buf: &mut [u8]) -> StreamStatus;
}

/// Video frames from a device session
pub struct VideoSource {
    session: Arc<DeviceSession>,
}

impl VideoSource {
    pub fn new(session: Arc<DeviceSession>) -> Self {
        Self { session }
    }
}

impl FrameSource for VideoSource {
    fn kind(&self) -> MediaKind {
        MediaKind::Video
    }

    fn pull(&mut self, buf: &mut [u8]) -> StreamStatus {
        self.session.recv_video(buf)
    }
}

/// Audio sample batches from a device session
///
/// Pulls only once the SDK holds at least `low_watermark` frames, which
/// keeps the PCM stream from stuttering.
pub struct AudioSource {
    session: Arc<DeviceSession>,
    low_watermark: usize,
}

impl AudioSource {
    pub fn new(session: Arc<DeviceSession>, low_watermark: usize) -> Self {
        Self {
            session,
            low_watermark,
        }
    }
}

impl FrameSource for AudioSource {
    fn kind(&self) -> MediaKind {
        MediaKind::Audio
    }

    fn ready(&mut self) -> Readiness {
        match self.session.audio_backlog() {
            StreamStatus::Data(frames) if frames < self.low_watermark => Readiness::Wait,
            StreamStatus::Data(_) => Readiness::Ready,
            StreamStatus::Fatal(fatal) => Readiness::Stop(IngestExit::Session(fatal)),
            other => Readiness::Stop(IngestExit::Backlog(other)),
        }
    }

    fn pull(&mut self, buf: &mut [u8]) -> StreamStatus {
        self.session.recv_audio(buf)
    }
}

/// Why a loop stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestExit {
    /// Shutdown was requested
    Cancelled,
    /// The session reported a terminal status
    Session(FatalStatus),
    /// The audio backlog query failed
    Backlog(StreamStatus),
}

impl std::fmt::Display for IngestExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IngestExit::Cancelled => write!(f, "shutdown requested"),
            IngestExit::Session(fatal) => write!(f, "{}", fatal),
            IngestExit::Backlog(status) => write!(f, "audio backlog check failed ({:?})", status),
        }
    }
}

/// Loop tuning
#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Bytes per pull
    pub buf_size: usize,

    /// Sleep after a not-ready pull, a short backlog or a failed write
    pub backoff: Duration,

    pub recovery: RecoveryPolicy,
}

/// Counters reported when a loop exits
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestReport {
    pub kind: MediaKind,
    pub exit: IngestExit,
    pub frames_written: u64,
    pub bytes_written: u64,
    /// Lost or unrecognized pulls and frames discarded after a failed write
    pub frames_skipped: u64,
    /// Frames pulled while no reader was attached
    pub frames_dropped: u64,
    /// Sink reopens after a failed write
    pub recoveries: u64,
}

impl IngestReport {
    fn new(kind: MediaKind) -> Self {
        Self {
            kind,
            exit: IngestExit::Cancelled,
            frames_written: 0,
            bytes_written: 0,
            frames_skipped: 0,
            frames_dropped: 0,
            recoveries: 0,
        }
    }
}

/// Pulls from a [`FrameSource`] into a [`ByteSink`] until cancelled or the
/// session ends
pub struct IngestLoop<S, K> {
    source: S,
    sink: K,
    config: IngestConfig,
    shutdown: ShutdownToken,
    report: IngestReport,
    reader_missing: bool,
}

impl<S: FrameSource, K: ByteSink> IngestLoop<S, K> {
    pub fn new(source: S, sink: K, config: IngestConfig, shutdown: ShutdownToken) -> Self {
        let report = IngestReport::new(source.kind());
        Self {
            source,
            sink,
            config,
            shutdown,
            report,
            reader_missing: false,
        }
    }

    /// Run on a dedicated thread named after the media kind
    pub fn spawn(self) -> std::io::Result<JoinHandle<IngestReport>>
    where
        S: 'static,
        K: 'static,
    {
        std::thread::Builder::new()
            .name(format!("{}-ingest", self.source.kind()))
            .spawn(move || self.run())
    }

    /// Run on the current thread until the loop exits
    pub fn run(mut self) -> IngestReport {
        let kind = self.source.kind();
        tracing::info!("Start IPCAM {} stream...", kind);

        self.open_sink();
        let mut buf = vec![0u8; self.config.buf_size];

        let exit = loop {
            if self.shutdown.is_cancelled() {
                break IngestExit::Cancelled;
            }

            match self.source.ready() {
                Readiness::Ready => {}
                Readiness::Wait => {
                    self.backoff();
                    continue;
                }
                Readiness::Stop(exit) => break exit,
            }

            let len = match self.source.pull(&mut buf) {
                StreamStatus::Data(len) => len.min(buf.len()),
                StreamStatus::NoDataYet => {
                    self.backoff();
                    continue;
                }
                StreamStatus::FrameLost => {
                    self.report.frames_skipped += 1;
                    continue;
                }
                StreamStatus::Unrecognized(code) => {
                    tracing::warn!("[{}] unrecognized pull status {}, skipping frame", kind, code);
                    self.report.frames_skipped += 1;
                    self.backoff();
                    continue;
                }
                StreamStatus::Fatal(fatal) => {
                    tracing::warn!("[{}] {}", kind, fatal);
                    break IngestExit::Session(fatal);
                }
            };

            if self.shutdown.is_cancelled() {
                break IngestExit::Cancelled;
            }

            self.deliver(&buf[..len]);
        };

        self.sink.close();
        self.report.exit = exit;
        tracing::info!(
            frames_written = self.report.frames_written,
            bytes_written = self.report.bytes_written,
            frames_skipped = self.report.frames_skipped,
            frames_dropped = self.report.frames_dropped,
            recoveries = self.report.recoveries,
            "[receive_{}] thread exit: {}",
            kind,
            exit
        );
        self.report
    }

    fn deliver(&mut self, frame: &[u8]) {
        let kind = self.source.kind();

        if !self.sink.is_open() && !self.open_sink() {
            self.report.frames_dropped += 1;
            self.backoff();
            return;
        }

        match self.sink.write(frame) {
            Ok(written) => {
                self.report.frames_written += 1;
                self.report.bytes_written += written as u64;
            }
            Err(e) => {
                match self.config.recovery {
                    RecoveryPolicy::Reopen => {
                        tracing::warn!(
                            "[{}] write to {} failed: {}, reopening",
                            kind,
                            self.sink.target(),
                            e
                        );
                        self.sink.close();
                        self.report.recoveries += 1;
                        self.open_sink();
                    }
                    RecoveryPolicy::Discard => {
                        tracing::debug!("[{}] write failed: {}, frame discarded", kind, e);
                        self.report.frames_skipped += 1;
                    }
                }
                self.backoff();
            }
        }
    }

    /// Try to open the sink, logging the first failure of an outage only
    fn open_sink(&mut self) -> bool {
        let kind = self.source.kind();
        match self.sink.open() {
            Ok(()) => {
                tracing::info!("OK open {} fifo {}", kind, self.sink.target());
                self.reader_missing = false;
                true
            }
            Err(e @ SinkError::NoReader(_)) => {
                if !self.reader_missing {
                    tracing::info!("Waiting for {} consumer: {}", kind, e);
                    self.reader_missing = true;
                }
                false
            }
            Err(e) => {
                tracing::error!("Cannot open {} fifo: {}", kind, e);
                false
            }
        }
    }

    fn backoff(&self) {
        std::thread::sleep(self.config.backoff);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum SinkEvent {
        Open,
        Write(usize),
        Close,
    }

    /// Sink that records calls and fails the writes listed in `fail_writes`
    struct RecordingSink {
        events: Arc<parking_lot::Mutex<Vec<SinkEvent>>>,
        open: bool,
        fail_writes: VecDeque<bool>,
        refuse_opens: usize,
    }

    impl RecordingSink {
        fn new() -> (Self, Arc<parking_lot::Mutex<Vec<SinkEvent>>>) {
            let events = Arc::new(parking_lot::Mutex::new(Vec::new()));
            (
                Self {
                    events: events.clone(),
                    open: false,
                    fail_writes: VecDeque::new(),
                    refuse_opens: 0,
                },
                events,
            )
        }
    }

    impl ByteSink for RecordingSink {
        fn open(&mut self) -> Result<(), SinkError> {
            if self.refuse_opens > 0 {
                self.refuse_opens -= 1;
                return Err(SinkError::NoReader("test".to_string()));
            }
            self.open = true;
            self.events.lock().push(SinkEvent::Open);
            Ok(())
        }

        fn write(&mut self, bytes: &[u8]) -> Result<usize, SinkError> {
            if !self.open {
                return Err(SinkError::NotOpen);
            }
            if self.fail_writes.pop_front().unwrap_or(false) {
                return Err(SinkError::Disconnected);
            }
            self.events.lock().push(SinkEvent::Write(bytes.len()));
            Ok(bytes.len())
        }

        fn close(&mut self) {
            if self.open {
                self.events.lock().push(SinkEvent::Close);
            }
            self.open = false;
        }

        fn is_open(&self) -> bool {
            self.open
        }

        fn target(&self) -> String {
            "recording".to_string()
        }
    }

    /// Source replaying a fixed list of statuses, then reporting `RemoteClosed`
    struct ScriptSource {
        kind: MediaKind,
        pulls: VecDeque<StreamStatus>,
        readiness: VecDeque<Readiness>,
    }

    impl ScriptSource {
        fn video(pulls: Vec<StreamStatus>) -> Self {
            Self {
                kind: MediaKind::Video,
                pulls: pulls.into(),
                readiness: VecDeque::new(),
            }
        }
    }

    impl FrameSource for ScriptSource {
        fn kind(&self) -> MediaKind {
            self.kind
        }

        fn ready(&mut self) -> Readiness {
            self.readiness.pop_front().unwrap_or(Readiness::Ready)
        }

        fn pull(&mut self, buf: &mut [u8]) -> StreamStatus {
            let status = self
                .pulls
                .pop_front()
                .unwrap_or(StreamStatus::Fatal(FatalStatus::RemoteClosed));
            if let StreamStatus::Data(len) = status {
                buf[..len].fill(0xAB);
            }
            status
        }
    }

    fn config(recovery: RecoveryPolicy) -> IngestConfig {
        IngestConfig {
            buf_size: 8192,
            backoff: Duration::from_millis(1),
            recovery,
        }
    }

    fn writes(events: &[SinkEvent]) -> Vec<usize> {
        events
            .iter()
            .filter_map(|e| match e {
                SinkEvent::Write(n) => Some(*n),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_non_data_statuses_never_write() {
        let (sink, events) = RecordingSink::new();
        let source = ScriptSource::video(vec![
            StreamStatus::NoDataYet,
            StreamStatus::FrameLost,
            StreamStatus::Unrecognized(-20001),
            StreamStatus::Data(100),
            StreamStatus::FrameLost,
        ]);

        let report = IngestLoop::new(source, sink, config(RecoveryPolicy::Reopen), ShutdownToken::new()).run();

        assert_eq!(writes(&events.lock()), vec![100]);
        assert_eq!(report.frames_written, 1);
        assert_eq!(report.frames_skipped, 3);
        assert_eq!(report.exit, IngestExit::Session(FatalStatus::RemoteClosed));
    }

    #[test]
    fn test_fatal_status_ends_loop_immediately() {
        for fatal in [
            FatalStatus::RemoteClosed,
            FatalStatus::RemoteTimeout,
            FatalStatus::SessionInvalid,
        ] {
            let (sink, events) = RecordingSink::new();
            let source = ScriptSource::video(vec![
                StreamStatus::Fatal(fatal),
                StreamStatus::Data(10),
            ]);

            let report = IngestLoop::new(source, sink, config(RecoveryPolicy::Reopen), ShutdownToken::new()).run();

            assert_eq!(report.exit, IngestExit::Session(fatal));
            assert!(writes(&events.lock()).is_empty());
            assert_eq!(events.lock().last(), Some(&SinkEvent::Close));
        }
    }

    #[test]
    fn test_reopen_policy_reopens_before_next_write() {
        let (mut sink, events) = RecordingSink::new();
        sink.fail_writes = vec![true, false].into();
        let source = ScriptSource::video(vec![StreamStatus::Data(10), StreamStatus::Data(20)]);

        let report = IngestLoop::new(source, sink, config(RecoveryPolicy::Reopen), ShutdownToken::new()).run();

        assert_eq!(
            *events.lock(),
            vec![
                SinkEvent::Open,
                SinkEvent::Close,
                SinkEvent::Open,
                SinkEvent::Write(20),
                SinkEvent::Close,
            ]
        );
        assert_eq!(report.recoveries, 1);
        assert_eq!(report.exit, IngestExit::Session(FatalStatus::RemoteClosed));
    }

    #[test]
    fn test_discard_policy_keeps_handle() {
        let (mut sink, events) = RecordingSink::new();
        sink.fail_writes = vec![true, false].into();
        let source = ScriptSource::video(vec![StreamStatus::Data(10), StreamStatus::Data(20)]);

        let report = IngestLoop::new(source, sink, config(RecoveryPolicy::Discard), ShutdownToken::new()).run();

        assert_eq!(
            *events.lock(),
            vec![SinkEvent::Open, SinkEvent::Write(20), SinkEvent::Close]
        );
        assert_eq!(report.recoveries, 0);
        assert_eq!(report.frames_skipped, 1);
    }

    #[test]
    fn test_missing_reader_drops_frames_until_open() {
        let (mut sink, events) = RecordingSink::new();
        // Initial open plus the first delivery attempt fail
        sink.refuse_opens = 2;
        let source = ScriptSource::video(vec![StreamStatus::Data(10), StreamStatus::Data(20)]);

        let report = IngestLoop::new(source, sink, config(RecoveryPolicy::Reopen), ShutdownToken::new()).run();

        assert_eq!(writes(&events.lock()), vec![20]);
        assert_eq!(report.frames_dropped, 1);
    }

    #[test]
    fn test_wait_readiness_does_not_pull() {
        let (sink, events) = RecordingSink::new();
        let mut source = ScriptSource::video(vec![StreamStatus::Data(10)]);
        source.kind = MediaKind::Audio;
        source.readiness = vec![
            Readiness::Wait,
            Readiness::Wait,
            Readiness::Ready,
            Readiness::Stop(IngestExit::Backlog(StreamStatus::NoDataYet)),
        ]
        .into();

        let report = IngestLoop::new(source, sink, config(RecoveryPolicy::Discard), ShutdownToken::new()).run();

        assert_eq!(writes(&events.lock()), vec![10]);
        assert_eq!(report.kind, MediaKind::Audio);
        assert_eq!(report.exit, IngestExit::Backlog(StreamStatus::NoDataYet));
    }

    #[test]
    fn test_cancelled_before_start() {
        let (sink, events) = RecordingSink::new();
        let source = ScriptSource::video(vec![StreamStatus::Data(10)]);
        let shutdown = ShutdownToken::new();
        shutdown.cancel();

        let report = IngestLoop::new(source, sink, config(RecoveryPolicy::Reopen), shutdown).run();

        assert_eq!(report.exit, IngestExit::Cancelled);
        assert!(writes(&events.lock()).is_empty());
    }

    #[test]
    fn test_audio_waits_for_low_watermark() {
        use crate::config::{Config, StreamConfig};
        use lsc_tutk::testing::{Pull, ScriptedSdk, SdkCall};

        let settings = Config::from_yaml_str(
            "homeassistant_credentials:\n  enabled: false\n\
             tutk_credentials:\n  av_username: admin\n  av_password: admin\n",
        )
        .unwrap();
        let sdk = Arc::new(
            ScriptedSdk::new()
                .with_audio_backlog(vec![10, 49, 50, -20015])
                .with_audio(vec![Pull::Frame(vec![0x11; 512])]),
        );
        let params = settings.session_params("UID");
        let session = Arc::new(DeviceSession::connect(sdk.clone(), &params).unwrap());
        sdk.clear_calls();

        let (sink, events) = RecordingSink::new();
        let source = AudioSource::new(session.clone(), StreamConfig::default().audio_low_watermark);
        let report = IngestLoop::new(source, sink, config(RecoveryPolicy::Reopen), ShutdownToken::new()).run();

        assert_eq!(report.exit, IngestExit::Session(FatalStatus::RemoteClosed));
        assert_eq!(writes(&events.lock()), vec![512]);
        assert_eq!(
            sdk.calls(),
            vec![
                SdkCall::CheckAudioBuffer,
                SdkCall::CheckAudioBuffer,
                SdkCall::CheckAudioBuffer,
                SdkCall::RecvAudio,
                SdkCall::CheckAudioBuffer,
            ]
        );
    }

    #[test]
    fn test_spawned_loop_stops_on_cancel() {
        let (sink, _events) = RecordingSink::new();
        let mut source = ScriptSource::video(Vec::new());
        // Never ready, so the loop only exits through the token
        source.readiness = std::iter::repeat(Readiness::Wait).take(100_000).collect();
        let shutdown = ShutdownToken::new();

        let handle = IngestLoop::new(source, sink, config(RecoveryPolicy::Reopen), shutdown.clone())
            .spawn()
            .unwrap();
        std::thread::sleep(Duration::from_millis(20));
        shutdown.cancel();

        let report = handle.join().unwrap();
        assert_eq!(report.exit, IngestExit::Cancelled);
    }
}
