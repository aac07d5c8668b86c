//! Periodic device buffer reclamation
//!
//! The SDK keeps queuing frames while the pipes are congested, which shows
//! up as growing latency. Flushing its buffers every few seconds bounds
//! that lag at the cost of an occasional dropped frame.

use lsc_tutk::DeviceSession;
use std::sync::Arc;
use std::time::Duration;

use crate::shutdown::ShutdownToken;

/// Alternates video and audio buffer flushes on one session
pub struct BufferReclaimer {
    session: Arc<DeviceSession>,
    interval: Duration,
}

impl BufferReclaimer {
    pub fn new(session: Arc<DeviceSession>, interval: Duration) -> Self {
        Self { session, interval }
    }

    /// Sleep, flush video, sleep, flush audio, until shutdown or release
    pub async fn run(self, shutdown: ShutdownToken) {
        tracing::debug!("Buffer reclamation every {:?}", self.interval);

        loop {
            if !self.pause(&shutdown).await {
                break;
            }
            self.session.clean_video_buffer();

            if !self.pause(&shutdown).await {
                break;
            }
            self.session.clean_audio_buffer();
        }

        tracing::debug!("Buffer reclamation stopped");
    }

    /// Returns `false` when the loop should end instead of flushing
    async fn pause(&self, shutdown: &ShutdownToken) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(self.interval) => !self.session.is_released(),
            _ = shutdown.cancelled() => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lsc_tutk::testing::{ScriptedSdk, SdkCall};
    use lsc_tutk::{ClientStartParams, Credentials, SessionParams, StatusCodes};

    fn connect(sdk: Arc<ScriptedSdk>) -> Arc<DeviceSession> {
        let params = SessionParams {
            uid: "UID".to_string(),
            udp_port: 0,
            max_av_channels: 2,
            client: ClientStartParams {
                credentials: Credentials {
                    username: "admin".to_string(),
                    password: "admin".to_string(),
                },
                timeout_secs: 20,
                channel: 0,
            },
            codes: StatusCodes::default(),
        };
        Arc::new(DeviceSession::connect(sdk, &params).unwrap())
    }

    #[tokio::test(start_paused = true)]
    async fn test_flushes_alternate() {
        let sdk = Arc::new(ScriptedSdk::new());
        let session = connect(sdk.clone());
        sdk.clear_calls();
        let shutdown = ShutdownToken::new();

        let task = tokio::spawn(
            BufferReclaimer::new(session.clone(), Duration::from_secs(5)).run(shutdown.clone()),
        );

        tokio::time::sleep(Duration::from_millis(21_000)).await;
        shutdown.cancel();
        task.await.unwrap();

        assert_eq!(
            sdk.calls(),
            vec![
                SdkCall::CleanVideoBuffer,
                SdkCall::CleanAudioBuffer,
                SdkCall::CleanVideoBuffer,
                SdkCall::CleanAudioBuffer,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_after_release() {
        let sdk = Arc::new(ScriptedSdk::new());
        let session = connect(sdk.clone());
        session.release();
        sdk.clear_calls();

        BufferReclaimer::new(session, Duration::from_secs(5))
            .run(ShutdownToken::new())
            .await;

        assert!(sdk.calls().is_empty());
    }
}
