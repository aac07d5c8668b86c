//! Session lifecycle orchestration
//!
//! The [`SessionController`] owns the device session and brings the relay
//! up in a fixed order:
//!
//! ```text
//! connect ─▶ configure ─▶ restreamer ─▶ video loop ─▶ audio loop
//!                                          │
//!            dispatcher ◀─ transcoder ◀─ reclaimer
//! ```
//!
//! The ingestion loops are foreground work: the controller waits for both
//! to finish (or for shutdown) and joins them before releasing the session.
//! Everything else is background work that is stopped or abandoned.

use lsc_tutk::{DeviceCommand, DeviceSdk, DeviceSession, TutkError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::bus::BusError;
use crate::config::{Config, ConfigError};
use crate::dispatcher::{CommandDispatcher, DispatcherSettings};
use crate::ingest::{AudioSource, IngestConfig, IngestLoop, IngestReport, VideoSource};
use crate::mqtt::MqttBus;
use crate::reclaim::BufferReclaimer;
use crate::shutdown::ShutdownToken;
use crate::sink::FifoSink;
use crate::state_store::StateStore;
use crate::supervisor::{ProcessError, ProcessSupervisor, SupervisorSettings};
use crate::toggle::camera_toggles;
use crate::transcoder::{RestreamerTemplate, TranscoderTemplate};

/// Commands applied after connecting, in order
pub const CONFIGURE_SEQUENCE: [DeviceCommand; 4] = [
    DeviceCommand::DisableNightVision,
    DeviceCommand::SetHdQuality,
    DeviceCommand::StartCamera,
    DeviceCommand::StartAudio,
];

/// A configuration command was rejected
#[derive(Debug, thiserror::Error)]
#[error("configuration stage {index} ({stage}) failed: {source}")]
pub struct ConfigureError {
    /// The rejected command
    pub stage: DeviceCommand,

    /// Position of the command in the sequence
    pub index: usize,

    #[source]
    pub source: TutkError,
}

/// Error type for the controller
#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Connection failed: {0}")]
    Connect(#[from] TutkError),

    #[error(transparent)]
    Configure(#[from] ConfigureError),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error("Failed to start {what}: {source}")]
    Spawn {
        what: &'static str,
        #[source]
        source: std::io::Error,
    },
}

/// Why the relay stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Both ingestion loops ended on their own
    StreamEnded,
    /// Shutdown was requested from outside
    Interrupted,
}

/// Result of a completed run
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub reason: StopReason,
    pub video: Option<IngestReport>,
    pub audio: Option<IngestReport>,
}

enum Outcome {
    Stopped(StopReason),
    Failed(ControllerError),
}

/// Owns the device session and every loop that uses it
#[derive(Debug)]
pub struct SessionController {
    config: Config,
    session: Arc<DeviceSession>,
    shutdown: ShutdownToken,
}

impl SessionController {
    /// Connect to `uid` and start the AV client
    ///
    /// Blocks for as long as the SDK handshake takes.
    pub fn connect(
        sdk: Arc<dyn DeviceSdk>,
        config: Config,
        uid: &str,
    ) -> Result<Self, ControllerError> {
        let session = DeviceSession::connect(sdk, &config.session_params(uid))?;
        tracing::info!("Client started");
        Ok(Self {
            config,
            session: Arc::new(session),
            shutdown: ShutdownToken::new(),
        })
    }

    /// Token that stops the relay when cancelled
    pub fn shutdown_token(&self) -> ShutdownToken {
        self.shutdown.clone()
    }

    /// Send `commands` in order, stopping at the first rejection
    pub fn configure(&self, commands: &[DeviceCommand]) -> Result<(), ConfigureError> {
        for (index, &stage) in commands.iter().enumerate() {
            self.session
                .send_command(stage)
                .map_err(|source| ConfigureError {
                    stage,
                    index,
                    source,
                })?;
        }
        tracing::info!("IOCTRL commands sent successfully");
        Ok(())
    }

    /// Run the relay until the stream ends, shutdown is requested or a
    /// supervised process or the bus fails fatally
    pub async fn run(self) -> Result<RunSummary, ControllerError> {
        let config = &self.config;
        let token = self.shutdown.clone();
        let settings = SupervisorSettings::from(&config.supervisor);
        let (process_tx, mut process_failures) = mpsc::unbounded_channel();
        let (bus_tx, mut bus_failures) = mpsc::unbounded_channel::<BusError>();

        tracing::info!("Starting RTSP Server...");
        let restreamer = ProcessSupervisor::with_failure_channel(
            RestreamerTemplate::from_config(config),
            settings.clone(),
            process_tx.clone(),
        );
        restreamer.spawn();
        tokio::time::sleep(Duration::from_secs(config.stream.restream_warmup_secs)).await;

        tracing::info!("Starting video stream...");
        let video = match IngestLoop::new(
            VideoSource::new(self.session.clone()),
            FifoSink::new(&config.paths.video_fifo),
            IngestConfig {
                buf_size: config.stream.video_buf_size,
                backoff: config.stream.ingest_backoff(),
                recovery: config.stream.video_recovery,
            },
            token.clone(),
        )
        .spawn()
        {
            Ok(handle) => handle,
            Err(source) => {
                let _ = restreamer.shutdown().await;
                return Err(ControllerError::Spawn {
                    what: "video loop",
                    source,
                });
            }
        };

        tracing::info!("Starting audio stream...");
        let audio = match IngestLoop::new(
            AudioSource::new(self.session.clone(), config.stream.audio_low_watermark),
            FifoSink::new(&config.paths.audio_fifo),
            IngestConfig {
                buf_size: config.stream.audio_buf_size,
                backoff: config.stream.ingest_backoff(),
                recovery: config.stream.audio_recovery,
            },
            token.clone(),
        )
        .spawn()
        {
            Ok(handle) => handle,
            Err(source) => {
                token.cancel();
                let _ = join_loop(video).await;
                let _ = restreamer.shutdown().await;
                return Err(ControllerError::Spawn {
                    what: "audio loop",
                    source,
                });
            }
        };
        tokio::time::sleep(Duration::from_secs(config.stream.audio_start_delay_secs)).await;

        let reclaimer = BufferReclaimer::new(self.session.clone(), config.stream.reclaim_interval());
        tokio::spawn(reclaimer.run(token.clone()));

        tracing::info!("Starting ffmpeg...");
        let transcoder = ProcessSupervisor::with_failure_channel(
            TranscoderTemplate::from_config(config),
            settings,
            process_tx,
        );
        transcoder.spawn();

        let mut bus = None;
        match config.mqtt() {
            Ok(Some(mqtt)) => {
                tracing::info!("Starting MQTT...");
                let (client, connection) = MqttBus::new(&mqtt, &config.bus);
                let client = Arc::new(client);
                let (events_tx, events_rx) = mpsc::channel(64);

                let dispatcher = Arc::new(CommandDispatcher::new(
                    client.clone(),
                    camera_toggles(self.session.clone(), transcoder.clone()),
                    StateStore::new(&config.paths.states_dir),
                    DispatcherSettings::from(&config.bus),
                ));
                tokio::spawn(dispatcher.clone().run(events_rx, token.clone()));
                tokio::spawn(dispatcher.run_state_publisher(token.clone()));

                let shutdown = token.clone();
                tokio::spawn(async move {
                    if let Err(e) = connection.run(events_tx, shutdown).await {
                        let _ = bus_tx.send(e);
                    }
                });
                bus = Some(client);
            }
            Ok(None) => {}
            Err(e) => tracing::warn!("MQTT disabled: {}", e),
        }

        let mut video_task = tokio::task::spawn_blocking(move || video.join());
        let mut audio_task = tokio::task::spawn_blocking(move || audio.join());
        let mut video_report = None;
        let mut audio_report = None;
        let (mut video_done, mut audio_done) = (false, false);

        let outcome = loop {
            if video_done && audio_done {
                break Outcome::Stopped(StopReason::StreamEnded);
            }
            tokio::select! {
                joined = &mut video_task, if !video_done => {
                    video_done = true;
                    video_report = loop_report(joined);
                }
                joined = &mut audio_task, if !audio_done => {
                    audio_done = true;
                    audio_report = loop_report(joined);
                }
                _ = token.cancelled() => break Outcome::Stopped(StopReason::Interrupted),
                Some(e) = process_failures.recv() => break Outcome::Failed(e.into()),
                Some(e) = bus_failures.recv() => break Outcome::Failed(e.into()),
            }
        };

        match &outcome {
            Outcome::Stopped(StopReason::StreamEnded) => {
                tracing::info!("Both streams ended, shutting down")
            }
            Outcome::Stopped(StopReason::Interrupted) => tracing::info!("Gracefully shutting down"),
            Outcome::Failed(e) => tracing::error!("{}", e),
        }

        token.cancel();
        if let Some(client) = &bus {
            client.disconnect().await;
        }

        if !video_done {
            video_report = loop_report(video_task.await);
        }
        if !audio_done {
            audio_report = loop_report(audio_task.await);
        }

        let (transcoder_stop, restreamer_stop) =
            futures::future::join(transcoder.shutdown(), restreamer.shutdown()).await;
        for result in [transcoder_stop, restreamer_stop] {
            if let Err(e) = result {
                tracing::warn!("{}", e);
            }
        }
        self.session.release();

        match outcome {
            Outcome::Stopped(reason) => Ok(RunSummary {
                reason,
                video: video_report,
                audio: audio_report,
            }),
            Outcome::Failed(e) => Err(e),
        }
    }
}

type Joined = Result<std::thread::Result<IngestReport>, tokio::task::JoinError>;

/// Wait for an ingestion thread without blocking the runtime
async fn join_loop(handle: JoinHandle<IngestReport>) -> Option<IngestReport> {
    loop_report(tokio::task::spawn_blocking(move || handle.join()).await)
}

fn loop_report(joined: Joined) -> Option<IngestReport> {
    match joined {
        Ok(Ok(report)) => Some(report),
        Ok(Err(_)) => {
            tracing::error!("Ingestion thread panicked");
            None
        }
        Err(e) => {
            tracing::error!("Failed to join ingestion thread: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lsc_tutk::testing::{ScriptedSdk, SdkCall};

    fn config() -> Config {
        Config::from_yaml_str(
            r#"
homeassistant_credentials:
  enabled: false
tutk_credentials:
  av_username: admin
  av_password: admin
"#,
        )
        .unwrap()
    }

    #[test]
    fn test_configure_order() {
        let sdk = Arc::new(ScriptedSdk::new());
        let controller = SessionController::connect(sdk.clone(), config(), "UID").unwrap();
        sdk.clear_calls();

        controller.configure(&CONFIGURE_SEQUENCE).unwrap();

        assert_eq!(sdk.ioctrl_types(), vec![0x5000, 0x0320, 0x01FF, 0x0300]);
    }

    #[test]
    fn test_configure_stops_at_first_failure() {
        let sdk = Arc::new(ScriptedSdk::new().fail_ioctrl(0x01FF, -20000));
        let controller = SessionController::connect(sdk.clone(), config(), "UID").unwrap();

        let err = controller.configure(&CONFIGURE_SEQUENCE).unwrap_err();

        assert_eq!(err.stage, DeviceCommand::StartCamera);
        assert_eq!(err.index, 2);
        assert_eq!(sdk.ioctrl_types(), vec![0x5000, 0x0320, 0x01FF]);
    }

    #[test]
    fn test_connect_failure_is_reported() {
        let sdk = Arc::new(ScriptedSdk::new().fail_connect(-19));
        let err = SessionController::connect(sdk.clone(), config(), "UID").unwrap_err();

        assert!(matches!(err, ControllerError::Connect(TutkError::Connect(e)) if e.code() == -19));
        assert!(sdk.calls().contains(&SdkCall::Deinitialize));
    }
}
