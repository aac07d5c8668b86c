//! Scripted in-memory SDK
//!
//! Replays queued frames and status codes and records every call, so the
//! relay can be exercised without a camera or the vendor library.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use parking_lot::Mutex;

use crate::sdk::{ClientStartParams, DeviceSdk};

/// One scripted pull result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pull {
    /// Deliver these bytes
    Frame(Vec<u8>),

    /// Return this raw status code
    Status(i32),
}

/// A recorded SDK call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SdkCall {
    IotcInitialize(u16),
    AvInitialize(i32),
    AllocateSessionId,
    ConnectByUid(String),
    ClientStart(i32),
    SendIoCtrl { io_type: u32, payload: Vec<u8> },
    RecvVideo,
    RecvAudio,
    CheckAudioBuffer,
    CleanVideoBuffer,
    CleanAudioBuffer,
    ClientStop(i32),
    CloseSession(i32),
    Deinitialize,
}

#[derive(Debug)]
struct Script {
    calls: Vec<SdkCall>,
    video: VecDeque<Pull>,
    audio: VecDeque<Pull>,
    audio_backlog: VecDeque<i32>,
    idle_backlog: i32,
    exhausted_code: i32,
    ioctrl_failures: HashMap<u32, i32>,
    ioctrl_latency: Duration,
    deinitialized: bool,
    used_after_deinitialize: bool,
    session_allocation: i32,
    connect: Option<i32>,
    client_start: i32,
}

/// In-memory [`DeviceSdk`]
#[derive(Debug)]
pub struct ScriptedSdk {
    script: Mutex<Script>,
}

impl Default for ScriptedSdk {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedSdk {
    /// Session id handed out by a successful connect
    pub const SESSION_ID: i32 = 5;

    /// A device that connects successfully and reports `RemoteClosed`
    /// once its frame queues run dry
    pub fn new() -> Self {
        Self {
            script: Mutex::new(Script {
                calls: Vec::new(),
                video: VecDeque::new(),
                audio: VecDeque::new(),
                audio_backlog: VecDeque::new(),
                idle_backlog: 100,
                exhausted_code: -20015,
                ioctrl_failures: HashMap::new(),
                ioctrl_latency: Duration::ZERO,
                deinitialized: false,
                used_after_deinitialize: false,
                session_allocation: 3,
                connect: None,
                client_start: 0,
            }),
        }
    }

    pub fn with_video(self, pulls: Vec<Pull>) -> Self {
        self.script.lock().video.extend(pulls);
        self
    }

    pub fn with_audio(self, pulls: Vec<Pull>) -> Self {
        self.script.lock().audio.extend(pulls);
        self
    }

    /// Values returned by successive `avCheckAudioBuf` calls before falling
    /// back to a comfortably full buffer
    pub fn with_audio_backlog(self, backlog: Vec<i32>) -> Self {
        self.script.lock().audio_backlog.extend(backlog);
        self
    }

    /// Code returned once a pull queue is empty
    pub fn when_exhausted(self, code: i32) -> Self {
        self.script.lock().exhausted_code = code;
        self
    }

    pub fn fail_session_allocation(self, code: i32) -> Self {
        self.script.lock().session_allocation = code;
        self
    }

    pub fn fail_connect(self, code: i32) -> Self {
        self.script.lock().connect = Some(code);
        self
    }

    pub fn fail_client_start(self, code: i32) -> Self {
        self.script.lock().client_start = code;
        self
    }

    /// Make every IOCTRL of `io_type` fail with `code`
    pub fn fail_ioctrl(self, io_type: u32, code: i32) -> Self {
        self.script.lock().ioctrl_failures.insert(io_type, code);
        self
    }

    /// Keep every IOCTRL call busy for `latency` after it is recorded
    pub fn with_ioctrl_latency(self, latency: Duration) -> Self {
        self.script.lock().ioctrl_latency = latency;
        self
    }

    /// Queue more video pulls on a live script
    pub fn push_video(&self, pull: Pull) {
        self.script.lock().video.push_back(pull);
    }

    /// Every call made so far, in order
    pub fn calls(&self) -> Vec<SdkCall> {
        self.script.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.script.lock().calls.clear();
    }

    /// Number of recorded calls matching `predicate`
    pub fn count(&self, predicate: impl Fn(&SdkCall) -> bool) -> usize {
        self.script.lock().calls.iter().filter(|c| predicate(c)).count()
    }

    /// IOCTRL types sent so far, in order
    pub fn ioctrl_types(&self) -> Vec<u32> {
        self.script
            .lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                SdkCall::SendIoCtrl { io_type, .. } => Some(*io_type),
                _ => None,
            })
            .collect()
    }

    /// Whether any stream call ran after `deinitialize`
    pub fn used_after_deinitialize(&self) -> bool {
        self.script.lock().used_after_deinitialize
    }

    fn record(&self, call: SdkCall) {
        let mut script = self.script.lock();
        script.touch();
        script.calls.push(call);
    }

    fn pull(&self, video: bool, buf: &mut [u8]) -> i32 {
        let mut script = self.script.lock();
        script.touch();
        script
            .calls
            .push(if video { SdkCall::RecvVideo } else { SdkCall::RecvAudio });
        let queue = if video {
            &mut script.video
        } else {
            &mut script.audio
        };
        match queue.pop_front() {
            Some(Pull::Frame(bytes)) => {
                let len = bytes.len().min(buf.len());
                buf[..len].copy_from_slice(&bytes[..len]);
                len as i32
            }
            Some(Pull::Status(code)) => code,
            None => script.exhausted_code,
        }
    }
}

impl Script {
    fn touch(&mut self) {
        if self.deinitialized {
            self.used_after_deinitialize = true;
        }
    }
}

impl DeviceSdk for ScriptedSdk {
    fn iotc_initialize(&self, udp_port: u16) -> i32 {
        let mut script = self.script.lock();
        script.deinitialized = false;
        script.calls.push(SdkCall::IotcInitialize(udp_port));
        0
    }

    fn av_initialize(&self, max_channels: i32) -> i32 {
        self.record(SdkCall::AvInitialize(max_channels));
        max_channels
    }

    fn allocate_session_id(&self) -> i32 {
        self.record(SdkCall::AllocateSessionId);
        self.script.lock().session_allocation
    }

    fn connect_by_uid(&self, uid: &str, _session_id: i32) -> i32 {
        self.record(SdkCall::ConnectByUid(uid.to_string()));
        self.script.lock().connect.unwrap_or(Self::SESSION_ID)
    }

    fn client_start(&self, session_id: i32, _params: &ClientStartParams) -> i32 {
        self.record(SdkCall::ClientStart(session_id));
        self.script.lock().client_start
    }

    fn send_ioctrl(&self, _av_index: i32, io_type: u32, payload: &[u8]) -> i32 {
        self.record(SdkCall::SendIoCtrl {
            io_type,
            payload: payload.to_vec(),
        });
        let latency = self.script.lock().ioctrl_latency;
        if !latency.is_zero() {
            std::thread::sleep(latency);
        }
        let mut script = self.script.lock();
        script.touch();
        script
            .ioctrl_failures
            .get(&io_type)
            .copied()
            .unwrap_or(0)
    }

    fn recv_video_frame(&self, _av_index: i32, buf: &mut [u8]) -> i32 {
        self.pull(true, buf)
    }

    fn recv_audio_frame(&self, _av_index: i32, buf: &mut [u8]) -> i32 {
        self.pull(false, buf)
    }

    fn check_audio_buffer(&self, _av_index: i32) -> i32 {
        let mut script = self.script.lock();
        script.touch();
        script.calls.push(SdkCall::CheckAudioBuffer);
        let idle = script.idle_backlog;
        script.audio_backlog.pop_front().unwrap_or(idle)
    }

    fn clean_video_buffer(&self, _av_index: i32) {
        self.record(SdkCall::CleanVideoBuffer);
    }

    fn clean_audio_buffer(&self, _av_index: i32) {
        self.record(SdkCall::CleanAudioBuffer);
    }

    fn client_stop(&self, av_index: i32) {
        self.record(SdkCall::ClientStop(av_index));
    }

    fn close_session(&self, session_id: i32) {
        self.record(SdkCall::CloseSession(session_id));
    }

    fn deinitialize(&self) {
        let mut script = self.script.lock();
        script.deinitialized = true;
        script.calls.push(SdkCall::Deinitialize);
    }
}
