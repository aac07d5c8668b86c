//! Integration tests for the LSC proxy
//!
//! The device side is scripted with `ScriptedSdk`; external processes are
//! stand-in shell scripts so no ffmpeg or mediamtx install is needed.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lsc_tutk::testing::{Pull, ScriptedSdk, SdkCall};
use lsc_tutk::{DeviceCommand, DeviceSession, FatalStatus, IoCtrlType};
use parking_lot::Mutex;

use lsc_proxy::bus::{BusError, MessageBus};
use lsc_proxy::config::{BusConfig, Config};
use lsc_proxy::controller::{SessionController, StopReason, CONFIGURE_SEQUENCE};
use lsc_proxy::dispatcher::{CommandDispatcher, DispatcherSettings};
use lsc_proxy::ingest::{IngestConfig, IngestExit, IngestLoop, VideoSource};
use lsc_proxy::shutdown::ShutdownToken;
use lsc_proxy::sink::{ensure_fifo, ByteSink, RecoveryPolicy, SinkError};
use lsc_proxy::state_store::StateStore;
use lsc_proxy::supervisor::{ProcessSupervisor, SupervisorSettings};
use lsc_proxy::toggle::{camera_toggles, SwitchState};
use lsc_proxy::transcoder::TranscoderTemplate;

const NO_DATA_YET: i32 = -20012;

/// Sink that records every write
#[derive(Clone, Default)]
struct MemorySink {
    writes: Arc<Mutex<Vec<Vec<u8>>>>,
    open: bool,
}

impl ByteSink for MemorySink {
    fn open(&mut self) -> Result<(), SinkError> {
        self.open = true;
        Ok(())
    }

    fn write(&mut self, bytes: &[u8]) -> Result<usize, SinkError> {
        if !self.open {
            return Err(SinkError::NotOpen);
        }
        self.writes.lock().push(bytes.to_vec());
        Ok(bytes.len())
    }

    fn close(&mut self) {
        self.open = false;
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn target(&self) -> String {
        "memory".to_string()
    }
}

#[derive(Default)]
struct RecordingBus {
    published: Mutex<Vec<(String, String)>>,
}

impl RecordingBus {
    fn published_to(&self, topic: &str) -> Vec<String> {
        self.published
            .lock()
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, p)| p.clone())
            .collect()
    }
}

#[async_trait]
impl MessageBus for RecordingBus {
    async fn subscribe(&self, _topic: &str) -> Result<(), BusError> {
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError> {
        self.published
            .lock()
            .push((topic.to_string(), String::from_utf8_lossy(&payload).into_owned()));
        Ok(())
    }
}

fn config(dir: &Path, fake_process: &Path) -> Config {
    let mut config = Config::from_yaml_str(
        r#"
homeassistant_credentials:
  enabled: false
tutk_credentials:
  av_username: admin
  av_password: admin
"#,
    )
    .unwrap();
    config.paths.video_fifo = dir.join("video_fifo");
    config.paths.audio_fifo = dir.join("audio_fifo");
    config.paths.states_dir = dir.join("states");
    config.paths.ffmpeg = fake_process.to_path_buf();
    config.paths.mediamtx = fake_process.to_path_buf();
    config.stream.restream_warmup_secs = 0;
    config.stream.audio_start_delay_secs = 0;
    config.stream.ingest_backoff_ms = 1;
    config.supervisor.stop_grace_ms = 500;
    config
}

/// A stand-in executable that ignores its arguments and idles
fn fake_process(dir: &Path) -> PathBuf {
    let path = dir.join("fake-process.sh");
    std::fs::write(&path, "#!/bin/sh\nexec sleep 30\n").unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn provision_fifos(config: &Config) {
    ensure_fifo(&config.paths.video_fifo).unwrap();
    ensure_fifo(&config.paths.audio_fifo).unwrap();
}

fn connect(sdk: Arc<ScriptedSdk>, config: &Config) -> Arc<DeviceSession> {
    Arc::new(DeviceSession::connect(sdk, &config.session_params("UID")).unwrap())
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[test]
fn test_video_frame_relayed_once_until_remote_close() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), Path::new("true"));
    let sdk = Arc::new(
        ScriptedSdk::new().with_video(vec![Pull::Status(NO_DATA_YET), Pull::Frame(vec![0x42; 4096])]),
    );
    let session = connect(sdk, &config);

    let sink = MemorySink::default();
    let report = IngestLoop::new(
        VideoSource::new(session),
        sink.clone(),
        IngestConfig {
            buf_size: config.stream.video_buf_size,
            backoff: Duration::from_millis(1),
            recovery: RecoveryPolicy::Reopen,
        },
        ShutdownToken::new(),
    )
    .run();

    let writes = sink.writes.lock();
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].len(), 4096);
    assert_eq!(report.exit, IngestExit::Session(FatalStatus::RemoteClosed));
    assert_eq!(report.frames_written, 1);
    assert_eq!(report.bytes_written, 4096);
}

#[tokio::test]
async fn test_flip_restarts_transcoder_only_on_change() {
    let dir = tempfile::tempdir().unwrap();
    let fake = fake_process(dir.path());
    let config = config(dir.path(), &fake);
    let sdk = Arc::new(ScriptedSdk::new());
    let session = connect(sdk, &config);

    let transcoder = ProcessSupervisor::new(
        TranscoderTemplate::from_config(&config),
        SupervisorSettings::from(&config.supervisor),
    );
    transcoder.spawn();
    wait_until(|| transcoder.is_running()).await;

    let toggles = camera_toggles(session, transcoder.clone());
    let flip = toggles.iter().find(|t| t.name() == "Flip").unwrap();

    flip.apply(SwitchState::On).await.unwrap();
    assert_eq!(transcoder.restart_count(), 1);
    assert!(transcoder.inspect(|t| t.is_flipped()));

    flip.apply(SwitchState::On).await.unwrap();
    assert_eq!(transcoder.restart_count(), 1);

    wait_until(|| transcoder.launch_count() == 2).await;
    let args: Vec<String> = transcoder
        .args()
        .iter()
        .map(|a| a.to_string_lossy().into_owned())
        .collect();
    assert!(args.windows(2).any(|w| w[0] == "-vf" && w[1] == "hflip,vflip"));

    transcoder.shutdown().await.unwrap();
    assert!(!transcoder.is_running());
}

#[tokio::test(start_paused = true)]
async fn test_night_vision_command_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), Path::new("true"));
    let sdk = Arc::new(ScriptedSdk::new());
    let session = connect(sdk.clone(), &config);
    sdk.clear_calls();

    let transcoder = ProcessSupervisor::new(
        TranscoderTemplate::from_config(&config),
        SupervisorSettings::default(),
    );
    let bus = Arc::new(RecordingBus::default());
    let dispatcher = CommandDispatcher::new(
        bus.clone(),
        camera_toggles(session, transcoder),
        StateStore::new(&config.paths.states_dir),
        DispatcherSettings::from(&BusConfig::default()),
    );
    dispatcher.on_connect().await.unwrap();

    let command = "homeassistant/switch/nightvision/set";
    assert!(dispatcher.handle_message(command, b"ON").await);
    assert!(dispatcher.handle_message(command, b"OFF").await);

    let gray_mode = IoCtrlType::SetGrayModeReq as u32;
    let payloads: Vec<Vec<u8>> = sdk
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            SdkCall::SendIoCtrl { io_type, payload } if io_type == gray_mode => Some(payload),
            _ => None,
        })
        .collect();
    assert_eq!(
        payloads,
        vec![
            DeviceCommand::EnableNightVision.payload(),
            DeviceCommand::DisableNightVision.payload()
        ]
    );
    assert_eq!(
        bus.published_to("homeassistant/switch/nightvision/state"),
        vec!["ON".to_string(), "OFF".to_string()]
    );
    let persisted = std::fs::read_to_string(config.paths.states_dir.join("nightvision")).unwrap();
    assert_eq!(persisted, "OFF");
}

#[tokio::test(start_paused = true)]
async fn test_discovery_announces_every_toggle() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), Path::new("true"));
    let session = connect(Arc::new(ScriptedSdk::new()), &config);
    let transcoder = ProcessSupervisor::new(
        TranscoderTemplate::from_config(&config),
        SupervisorSettings::default(),
    );
    let bus = Arc::new(RecordingBus::default());
    let dispatcher = CommandDispatcher::new(
        bus.clone(),
        camera_toggles(session, transcoder),
        StateStore::new(&config.paths.states_dir),
        DispatcherSettings::from(&config.bus),
    );

    dispatcher.on_connect().await.unwrap();

    for (name, icon) in [
        ("nightvision", "mdi:light-flood-down"),
        ("privacy", "mdi:eye-off"),
        ("flip", "mdi:flip-vertical"),
    ] {
        let configs = bus.published_to(&format!("homeassistant/switch/{}/config", name));
        assert!((1..=3).contains(&configs.len()), "{}: {:?}", name, configs);
        let payload: serde_json::Value = serde_json::from_str(&configs[0]).unwrap();
        assert_eq!(payload["icon"], icon);
        assert_eq!(payload["command_topic"], format!("homeassistant/switch/{}/set", name));
        assert_eq!(payload["state_on"], "ON");
    }
}

#[tokio::test]
async fn test_controller_runs_until_stream_ends() {
    let dir = tempfile::tempdir().unwrap();
    let fake = fake_process(dir.path());
    let config = config(dir.path(), &fake);
    provision_fifos(&config);
    let sdk = Arc::new(ScriptedSdk::new().with_video(vec![Pull::Frame(vec![1; 128])]));

    let controller = SessionController::connect(sdk.clone(), config, "UID").unwrap();
    controller.configure(&CONFIGURE_SEQUENCE).unwrap();
    let summary = tokio::time::timeout(Duration::from_secs(10), controller.run())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(summary.reason, StopReason::StreamEnded);
    let video = summary.video.unwrap();
    let audio = summary.audio.unwrap();
    assert_eq!(video.exit, IngestExit::Session(FatalStatus::RemoteClosed));
    assert_eq!(audio.exit, IngestExit::Session(FatalStatus::RemoteClosed));
    // Nobody reads the FIFOs, so the frame was pulled but not delivered
    assert_eq!(video.frames_written, 0);
    assert_eq!(video.frames_dropped, 1);

    let calls = sdk.calls();
    assert!(calls.contains(&SdkCall::ClientStop(0)));
    assert!(calls.contains(&SdkCall::CloseSession(ScriptedSdk::SESSION_ID)));
    assert_eq!(sdk.count(|c| *c == SdkCall::Deinitialize), 1);
    assert!(!sdk.used_after_deinitialize());
}

#[tokio::test]
async fn test_controller_stops_on_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let fake = fake_process(dir.path());
    let config = config(dir.path(), &fake);
    provision_fifos(&config);
    // Keep the device "live" by never running out of not-ready pulls
    let sdk = Arc::new(ScriptedSdk::new().when_exhausted(NO_DATA_YET));

    let controller = SessionController::connect(sdk.clone(), config, "UID").unwrap();
    let token = controller.shutdown_token();
    let run = tokio::spawn(controller.run());

    tokio::time::sleep(Duration::from_millis(200)).await;
    token.cancel();

    let summary = tokio::time::timeout(Duration::from_secs(10), run)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(summary.reason, StopReason::Interrupted);
    assert_eq!(summary.video.unwrap().exit, IngestExit::Cancelled);
    assert_eq!(sdk.count(|c| *c == SdkCall::Deinitialize), 1);
    assert!(!sdk.used_after_deinitialize());
}
