//! Remotely controllable device behaviors
//!
//! A [`DeviceToggle`] pairs a Home Assistant switch (name, topics, discovery
//! payload, current state) with a [`ToggleAction`] that performs the actual
//! change. Actions are wired when the toggle is registered.

use async_trait::async_trait;
use lsc_tutk::{DeviceCommand, DeviceSession, TutkError};
use serde::Serialize;
use std::sync::Arc;

use crate::config::DeviceInfo;
use crate::supervisor::{ProcessError, ProcessSupervisor};
use crate::transcoder::TranscoderTemplate;

/// Home Assistant component type of every toggle
pub const DEVICE_CLASS: &str = "switch";

/// Switch state vocabulary shared by the bus and the state files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SwitchState {
    On,
    Off,
}

impl SwitchState {
    /// Exact `ON` / `OFF`; anything else is not a state
    pub fn parse(payload: &str) -> Option<Self> {
        match payload {
            "ON" => Some(SwitchState::On),
            "OFF" => Some(SwitchState::Off),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SwitchState::On => "ON",
            SwitchState::Off => "OFF",
        }
    }
}

impl std::fmt::Display for SwitchState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error type for toggle actions
#[derive(Debug, thiserror::Error)]
pub enum ToggleError {
    #[error("device command failed: {0}")]
    Device(#[from] TutkError),

    #[error("transcoder reconfiguration failed: {0}")]
    Process(#[from] ProcessError),

    #[error("action task failed: {0}")]
    Join(String),
}

/// The on/off behavior behind a toggle
#[async_trait]
pub trait ToggleAction: Send + Sync {
    async fn enable(&self) -> Result<(), ToggleError>;

    async fn disable(&self) -> Result<(), ToggleError>;
}

/// Send a device command off the async runtime
async fn send_command(
    session: &Arc<DeviceSession>,
    command: DeviceCommand,
) -> Result<(), ToggleError> {
    let session = session.clone();
    tokio::task::spawn_blocking(move || session.send_command(command))
        .await
        .map_err(|e| ToggleError::Join(e.to_string()))??;
    Ok(())
}

/// Infrared night vision (gray mode)
pub struct NightVision {
    session: Arc<DeviceSession>,
}

impl NightVision {
    pub fn new(session: Arc<DeviceSession>) -> Self {
        Self { session }
    }
}

#[async_trait]
impl ToggleAction for NightVision {
    async fn enable(&self) -> Result<(), ToggleError> {
        send_command(&self.session, DeviceCommand::EnableNightVision).await
    }

    async fn disable(&self) -> Result<(), ToggleError> {
        send_command(&self.session, DeviceCommand::DisableNightVision).await
    }
}

/// Privacy mode: the camera stops streaming while enabled
pub struct Privacy {
    session: Arc<DeviceSession>,
}

impl Privacy {
    pub fn new(session: Arc<DeviceSession>) -> Self {
        Self { session }
    }
}

#[async_trait]
impl ToggleAction for Privacy {
    async fn enable(&self) -> Result<(), ToggleError> {
        send_command(&self.session, DeviceCommand::StopCamera).await
    }

    async fn disable(&self) -> Result<(), ToggleError> {
        send_command(&self.session, DeviceCommand::StartCamera).await
    }
}

/// Upside-down mounting: rotates the transcoded picture
pub struct Flip {
    transcoder: ProcessSupervisor<TranscoderTemplate>,
}

impl Flip {
    pub fn new(transcoder: ProcessSupervisor<TranscoderTemplate>) -> Self {
        Self { transcoder }
    }
}

#[async_trait]
impl ToggleAction for Flip {
    async fn enable(&self) -> Result<(), ToggleError> {
        self.transcoder.reconfigure(true).await?;
        Ok(())
    }

    async fn disable(&self) -> Result<(), ToggleError> {
        self.transcoder.reconfigure(false).await?;
        Ok(())
    }
}

/// Home Assistant MQTT discovery payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveryPayload {
    pub name: String,
    pub device_class: String,
    pub state_topic: String,
    pub command_topic: String,
    pub icon: String,
    pub unique_id: String,
    pub device: DiscoveryDevice,
    pub state_off: String,
    pub state_on: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveryDevice {
    pub identifiers: Vec<String>,
    pub manufacturer: String,
    pub model: String,
    pub name: String,
}

/// One registered switch
pub struct DeviceToggle {
    name: String,
    safe_name: String,
    icon: String,
    action: Box<dyn ToggleAction>,
    state: parking_lot::Mutex<SwitchState>,
}

impl std::fmt::Debug for DeviceToggle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceToggle")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

impl DeviceToggle {
    /// Create a toggle starting in the `OFF` state
    pub fn new(
        name: impl Into<String>,
        icon: impl Into<String>,
        action: Box<dyn ToggleAction>,
    ) -> Self {
        let name = name.into();
        let safe_name = name.replace(' ', "").to_lowercase();
        Self {
            name,
            safe_name,
            icon: icon.into(),
            action,
            state: parking_lot::Mutex::new(SwitchState::Off),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name without spaces, lowercased; used in topics and state files
    pub fn safe_name(&self) -> &str {
        &self.safe_name
    }

    fn topic(&self) -> String {
        format!("homeassistant/{}/{}", DEVICE_CLASS, self.safe_name)
    }

    pub fn config_topic(&self) -> String {
        format!("{}/config", self.topic())
    }

    pub fn state_topic(&self) -> String {
        format!("{}/state", self.topic())
    }

    pub fn command_topic(&self) -> String {
        format!("{}/set", self.topic())
    }

    pub fn state(&self) -> SwitchState {
        *self.state.lock()
    }

    pub fn discovery_payload(&self, device: &DeviceInfo) -> DiscoveryPayload {
        DiscoveryPayload {
            name: self.name.clone(),
            device_class: DEVICE_CLASS.to_string(),
            state_topic: self.state_topic(),
            command_topic: self.command_topic(),
            icon: self.icon.clone(),
            unique_id: format!("{}{}{}", self.safe_name, DEVICE_CLASS, device.identifier),
            device: DiscoveryDevice {
                identifiers: vec![device.identifier.clone()],
                manufacturer: device.manufacturer.clone(),
                model: device.model.clone(),
                name: device.name.clone(),
            },
            state_off: SwitchState::Off.as_str().to_string(),
            state_on: SwitchState::On.as_str().to_string(),
        }
    }

    /// Run the action for `target` and commit the state once it succeeded
    pub async fn apply(&self, target: SwitchState) -> Result<(), ToggleError> {
        match target {
            SwitchState::On => self.action.enable().await?,
            SwitchState::Off => self.action.disable().await?,
        }
        *self.state.lock() = target;
        tracing::info!("{} switched {}", self.name, target);
        Ok(())
    }
}

/// The switches exposed for an LSC indoor camera
pub fn camera_toggles(
    session: Arc<DeviceSession>,
    transcoder: ProcessSupervisor<TranscoderTemplate>,
) -> Vec<Arc<DeviceToggle>> {
    vec![
        Arc::new(DeviceToggle::new(
            "Night vision",
            "mdi:light-flood-down",
            Box::new(NightVision::new(session.clone())),
        )),
        Arc::new(DeviceToggle::new(
            "Privacy",
            "mdi:eye-off",
            Box::new(Privacy::new(session)),
        )),
        Arc::new(DeviceToggle::new(
            "Flip",
            "mdi:flip-vertical",
            Box::new(Flip::new(transcoder)),
        )),
    ]
}
