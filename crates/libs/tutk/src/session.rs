//! Authenticated device session
//!
//! A [`DeviceSession`] owns one IOTC session handle and the AV client index
//! started on it. The pulling loops share it read-only through an `Arc`;
//! only the owner releases it.
//!
//! Every call into the SDK runs under a read guard on the session state and
//! [`DeviceSession::release`] takes the write guard, so teardown waits for
//! in-flight commands, pulls and buffer flushes to return.

use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard};

use crate::error::{IotcError, Result, TutkError};
use crate::ioctrl::DeviceCommand;
use crate::sdk::{ClientStartParams, DeviceSdk};
use crate::status::{FatalStatus, StatusCodes, StreamStatus};

/// Everything needed to bring a session up
#[derive(Debug, Clone)]
pub struct SessionParams {
    /// Device UID
    pub uid: String,

    /// Local UDP port for `IOTC_Initialize2` (0 picks any)
    pub udp_port: u16,

    /// Maximum number of AV channels for `avInitialize`
    pub max_av_channels: i32,

    /// AV client start parameters
    pub client: ClientStartParams,

    /// Status code table used to classify pulls
    pub codes: StatusCodes,
}

/// One authenticated connection to a camera
pub struct DeviceSession {
    sdk: Arc<dyn DeviceSdk>,
    uid: String,
    session_id: i32,
    av_index: i32,
    codes: StatusCodes,
    released: RwLock<bool>,
}

impl std::fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSession")
            .field("uid", &self.uid)
            .field("session_id", &self.session_id)
            .field("av_index", &self.av_index)
            .finish()
    }
}

impl DeviceSession {
    /// Initialize the SDK, connect to `params.uid` and start the AV client
    ///
    /// On failure every resource acquired so far is released again.
    pub fn connect(sdk: Arc<dyn DeviceSdk>, params: &SessionParams) -> Result<Self> {
        let code = sdk.iotc_initialize(params.udp_port);
        if code != 0 {
            return Err(TutkError::Initialize {
                module: "IOTC",
                code,
            });
        }

        let code = sdk.av_initialize(params.max_av_channels);
        if code < 0 {
            sdk.deinitialize();
            return Err(TutkError::Initialize { module: "AV", code });
        }

        let provisional_id = sdk.allocate_session_id();
        if provisional_id < 0 {
            sdk.deinitialize();
            return Err(TutkError::SessionAllocation(IotcError::new(provisional_id)));
        }

        tracing::info!("Connecting to device {}", params.uid);
        let session_id = sdk.connect_by_uid(&params.uid, provisional_id);
        if session_id < 0 {
            sdk.close_session(provisional_id);
            sdk.deinitialize();
            return Err(TutkError::Connect(IotcError::new(session_id)));
        }

        let av_index = sdk.client_start(session_id, &params.client);
        if av_index < 0 {
            sdk.close_session(session_id);
            sdk.deinitialize();
            return Err(TutkError::ClientStart { code: av_index });
        }

        tracing::info!(
            uid = %params.uid,
            session_id,
            av_index,
            "AV client started"
        );

        Ok(Self {
            sdk,
            uid: params.uid.clone(),
            session_id,
            av_index,
            codes: params.codes,
            released: RwLock::new(false),
        })
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn session_id(&self) -> i32 {
        self.session_id
    }

    pub fn av_index(&self) -> i32 {
        self.av_index
    }

    /// Read guard held across one SDK call, or `None` once released
    fn live(&self) -> Option<RwLockReadGuard<'_, bool>> {
        let guard = self.released.read();
        (!*guard).then_some(guard)
    }

    /// Send a device command over IOCTRL
    pub fn send_command(&self, command: DeviceCommand) -> Result<()> {
        let Some(_live) = self.live() else {
            return Err(TutkError::Released(self.session_id));
        };

        if command.flushes_buffers() {
            self.sdk.clean_audio_buffer(self.av_index);
            self.sdk.clean_video_buffer(self.av_index);
        }

        let code = self
            .sdk
            .send_ioctrl(self.av_index, command.io_type() as u32, &command.payload());
        if code < 0 {
            tracing::warn!("IOCTRL {} failed with status {}", command, code);
            return Err(TutkError::IoCtrl { command, code });
        }

        tracing::debug!("IOCTRL {} sent", command);
        Ok(())
    }

    /// Pull one video frame into `buf`
    ///
    /// A released session reports `SessionInvalid` without touching the SDK.
    pub fn recv_video(&self, buf: &mut [u8]) -> StreamStatus {
        self.classify_live(|| self.sdk.recv_video_frame(self.av_index, buf))
    }

    /// Pull one audio sample batch into `buf`
    pub fn recv_audio(&self, buf: &mut [u8]) -> StreamStatus {
        self.classify_live(|| self.sdk.recv_audio_frame(self.av_index, buf))
    }

    /// Number of audio frames buffered on the client side
    ///
    /// `StreamStatus::Data(n)` carries the frame count; negative SDK codes are
    /// classified like a pull.
    pub fn audio_backlog(&self) -> StreamStatus {
        self.classify_live(|| self.sdk.check_audio_buffer(self.av_index))
    }

    fn classify_live(&self, pull: impl FnOnce() -> i32) -> StreamStatus {
        match self.live() {
            Some(_live) => self.codes.classify(pull()),
            None => StreamStatus::Fatal(FatalStatus::SessionInvalid),
        }
    }

    /// Drop stale video frames held by the SDK
    pub fn clean_video_buffer(&self) {
        if let Some(_live) = self.live() {
            self.sdk.clean_video_buffer(self.av_index);
        }
    }

    /// Drop stale audio frames held by the SDK
    pub fn clean_audio_buffer(&self) {
        if let Some(_live) = self.live() {
            self.sdk.clean_audio_buffer(self.av_index);
        }
    }

    /// Whether [`release`](Self::release) already ran
    pub fn is_released(&self) -> bool {
        *self.released.read()
    }

    /// Stop the AV client, close the session and de-initialize the SDK
    ///
    /// Waits for in-flight SDK calls on this session. Runs at most once.
    pub fn release(&self) {
        let mut released = self.released.write();
        if *released {
            return;
        }
        *released = true;

        self.sdk.client_stop(self.av_index);
        self.sdk.close_session(self.session_id);
        self.sdk.deinitialize();
        tracing::info!("Device session {} released", self.session_id);
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sdk::Credentials;
    use crate::testing::{Pull, ScriptedSdk, SdkCall};
    use std::time::Duration;

    fn params() -> SessionParams {
        SessionParams {
            uid: "TESTUID0000000000001".to_string(),
            udp_port: 0,
            max_av_channels: 2,
            client: ClientStartParams {
                credentials: Credentials {
                    username: "admin".to_string(),
                    password: "secret".to_string(),
                },
                timeout_secs: 20,
                channel: 0,
            },
            codes: StatusCodes::default(),
        }
    }

    #[test]
    fn test_connect_sequence() {
        let sdk = Arc::new(ScriptedSdk::new());
        let session = DeviceSession::connect(sdk.clone(), &params()).unwrap();

        assert_eq!(session.uid(), "TESTUID0000000000001");
        assert!(session.av_index() >= 0);
        assert_eq!(
            sdk.calls(),
            vec![
                SdkCall::IotcInitialize(0),
                SdkCall::AvInitialize(2),
                SdkCall::AllocateSessionId,
                SdkCall::ConnectByUid("TESTUID0000000000001".to_string()),
                SdkCall::ClientStart(session.session_id()),
            ]
        );
    }

    #[test]
    fn test_connect_failure_releases_resources() {
        let sdk = Arc::new(ScriptedSdk::new().fail_connect(-10));
        let err = DeviceSession::connect(sdk.clone(), &params()).unwrap_err();

        match err {
            TutkError::Connect(e) => assert_eq!(e.code(), -10),
            other => panic!("Expected Connect error, got {:?}", other),
        }
        let calls = sdk.calls();
        assert!(calls.contains(&SdkCall::Deinitialize));
        assert!(!calls.iter().any(|c| matches!(c, SdkCall::ClientStart(_))));
    }

    #[test]
    fn test_session_table_exhaustion() {
        let sdk = Arc::new(ScriptedSdk::new().fail_session_allocation(-18));
        let err = DeviceSession::connect(sdk, &params()).unwrap_err();
        assert!(matches!(err, TutkError::SessionAllocation(e) if e.code() == -18));
    }

    #[test]
    fn test_start_camera_flushes_buffers_first() {
        let sdk = Arc::new(ScriptedSdk::new());
        let session = DeviceSession::connect(sdk.clone(), &params()).unwrap();
        sdk.clear_calls();

        session.send_command(DeviceCommand::StartCamera).unwrap();

        let calls = sdk.calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0], SdkCall::CleanAudioBuffer);
        assert_eq!(calls[1], SdkCall::CleanVideoBuffer);
        assert!(matches!(calls[2], SdkCall::SendIoCtrl { io_type: 0x01FF, .. }));
    }

    #[test]
    fn test_rejected_command_reports_which() {
        let sdk = Arc::new(ScriptedSdk::new().fail_ioctrl(0x0320, -20000));
        let session = DeviceSession::connect(sdk, &params()).unwrap();

        let err = session.send_command(DeviceCommand::SetHdQuality).unwrap_err();
        assert!(matches!(
            err,
            TutkError::IoCtrl {
                command: DeviceCommand::SetHdQuality,
                code: -20000
            }
        ));
    }

    #[test]
    fn test_pulls_are_classified() {
        let sdk = Arc::new(
            ScriptedSdk::new().with_video(vec![Pull::Status(-20012), Pull::Frame(vec![7; 16])]),
        );
        let session = DeviceSession::connect(sdk, &params()).unwrap();
        let mut buf = vec![0u8; 64];

        assert_eq!(session.recv_video(&mut buf), StreamStatus::NoDataYet);
        assert_eq!(session.recv_video(&mut buf), StreamStatus::Data(16));
        assert_eq!(&buf[..16], &[7; 16]);
        assert_eq!(
            session.recv_video(&mut buf),
            StreamStatus::Fatal(FatalStatus::RemoteClosed)
        );
    }

    #[test]
    fn test_commands_after_release_are_refused() {
        let sdk = Arc::new(ScriptedSdk::new());
        let session = DeviceSession::connect(sdk.clone(), &params()).unwrap();
        session.release();
        sdk.clear_calls();

        let err = session.send_command(DeviceCommand::StopCamera).unwrap_err();
        assert!(matches!(err, TutkError::Released(ScriptedSdk::SESSION_ID)));
        assert!(sdk.calls().is_empty());
    }

    #[test]
    fn test_release_waits_for_in_flight_command() {
        let sdk = Arc::new(ScriptedSdk::new().with_ioctrl_latency(Duration::from_millis(100)));
        let session = Arc::new(DeviceSession::connect(sdk.clone(), &params()).unwrap());
        sdk.clear_calls();

        let sender = {
            let session = session.clone();
            std::thread::spawn(move || session.send_command(DeviceCommand::SetHdQuality))
        };
        while sdk.count(|c| matches!(c, SdkCall::SendIoCtrl { .. })) == 0 {
            std::thread::sleep(Duration::from_millis(1));
        }
        std::thread::sleep(Duration::from_millis(20));

        session.release();

        assert!(sender.join().unwrap().is_ok());
        assert!(!sdk.used_after_deinitialize());
        assert_eq!(sdk.calls().last(), Some(&SdkCall::Deinitialize));
    }

    #[test]
    fn test_released_session_stops_pulling() {
        let sdk = Arc::new(ScriptedSdk::new().with_video(vec![Pull::Frame(vec![1; 8])]));
        let session = DeviceSession::connect(sdk.clone(), &params()).unwrap();
        session.release();
        sdk.clear_calls();

        let mut buf = vec![0u8; 16];
        assert_eq!(
            session.recv_video(&mut buf),
            StreamStatus::Fatal(FatalStatus::SessionInvalid)
        );
        session.clean_audio_buffer();
        assert!(sdk.calls().is_empty());
        assert!(!sdk.used_after_deinitialize());
    }

    #[test]
    fn test_release_runs_once_in_order() {
        let sdk = Arc::new(ScriptedSdk::new());
        let session = DeviceSession::connect(sdk.clone(), &params()).unwrap();
        sdk.clear_calls();

        session.release();
        session.release();
        drop(session);

        let av_index = 0;
        assert_eq!(
            sdk.calls(),
            vec![
                SdkCall::ClientStop(av_index),
                SdkCall::CloseSession(ScriptedSdk::SESSION_ID),
                SdkCall::Deinitialize,
            ]
        );
    }
}
