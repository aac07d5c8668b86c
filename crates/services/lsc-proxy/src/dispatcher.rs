//! Bus command dispatcher
//!
//! On every broker (re)connect the dispatcher subscribes to each toggle's
//! command topic, announces the toggles through Home Assistant discovery and
//! restores their persisted states. Inbound `ON`/`OFF` commands run the
//! matching action, then persist and publish the new state. A separate loop
//! republishes every state periodically so observers stay in sync.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::bus::{BusError, BusEvent, MessageBus};
use crate::config::{BusConfig, DeviceInfo};
use crate::shutdown::ShutdownToken;
use crate::state_store::StateStore;
use crate::toggle::{DeviceToggle, SwitchState};

/// Dispatcher tuning
#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    /// Discovery rounds per connect
    pub discovery_repeats: u32,

    /// Pause after each discovery round
    pub discovery_interval: Duration,

    pub state_publish_interval: Duration,

    pub device: DeviceInfo,
}

impl From<&BusConfig> for DispatcherSettings {
    fn from(config: &BusConfig) -> Self {
        Self {
            discovery_repeats: config.discovery_repeats,
            discovery_interval: Duration::from_millis(config.discovery_interval_ms),
            state_publish_interval: Duration::from_millis(config.state_publish_interval_ms),
            device: config.device.clone(),
        }
    }
}

/// Routes bus commands to registered toggles
pub struct CommandDispatcher<B> {
    bus: Arc<B>,
    toggles: Vec<Arc<DeviceToggle>>,
    by_command: HashMap<String, Arc<DeviceToggle>>,
    store: StateStore,
    settings: DispatcherSettings,
}

impl<B: MessageBus + 'static> CommandDispatcher<B> {
    pub fn new(
        bus: Arc<B>,
        toggles: Vec<Arc<DeviceToggle>>,
        store: StateStore,
        settings: DispatcherSettings,
    ) -> Self {
        let by_command = toggles
            .iter()
            .map(|t| (t.command_topic(), t.clone()))
            .collect();
        Self {
            bus,
            toggles,
            by_command,
            store,
            settings,
        }
    }

    pub fn toggles(&self) -> &[Arc<DeviceToggle>] {
        &self.toggles
    }

    /// Subscribe, announce and restore
    pub async fn on_connect(&self) -> Result<(), BusError> {
        for toggle in &self.toggles {
            self.bus.subscribe(&toggle.command_topic()).await?;
        }

        // Repeated because Home Assistant may still be subscribing
        for _ in 0..self.settings.discovery_repeats {
            for toggle in &self.toggles {
                let payload = serde_json::to_vec(&toggle.discovery_payload(&self.settings.device))?;
                self.bus.publish(&toggle.config_topic(), payload).await?;
            }
            tokio::time::sleep(self.settings.discovery_interval).await;
        }

        if let Err(e) = self.store.ensure_dir().await {
            tracing::warn!(
                "Cannot create state directory {}: {}",
                self.store.dir().display(),
                e
            );
            return Ok(());
        }

        tracing::info!("Retrieving last state from sensors");
        for toggle in &self.toggles {
            self.restore(toggle).await;
        }
        Ok(())
    }

    async fn restore(&self, toggle: &DeviceToggle) {
        let state = match self.store.load(toggle.safe_name()).await {
            Ok(Some(state)) => state,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!("Cannot read last state of {}: {}", toggle.name(), e);
                return;
            }
        };

        tracing::debug!("Restoring {} to {}", toggle.name(), state);
        if let Err(e) = toggle.apply(state).await {
            tracing::warn!("Failed to restore {} to {}: {}", toggle.name(), state, e);
        }
    }

    /// Handle one inbound message; returns whether it addressed a toggle
    pub async fn handle_message(&self, topic: &str, payload: &[u8]) -> bool {
        let Some(toggle) = self.by_command.get(topic) else {
            tracing::trace!("Ignoring message on {}", topic);
            return false;
        };

        let Some(target) = std::str::from_utf8(payload).ok().and_then(SwitchState::parse) else {
            tracing::warn!(
                "Ignoring unknown payload for {}: {:?}",
                toggle.name(),
                String::from_utf8_lossy(payload)
            );
            return true;
        };

        match toggle.apply(target).await {
            Ok(()) => {
                if let Err(e) = self.store.save(toggle.safe_name(), target).await {
                    tracing::warn!("Cannot persist state of {}: {}", toggle.name(), e);
                }
            }
            Err(e) => tracing::error!("Failed to switch {} {}: {}", toggle.name(), target, e),
        }

        // Publish whatever is committed, so a failed command reverts the UI
        if let Err(e) = self.publish_state(toggle).await {
            tracing::warn!("Failed to publish state of {}: {}", toggle.name(), e);
        }
        true
    }

    async fn publish_state(&self, toggle: &DeviceToggle) -> Result<(), BusError> {
        self.bus
            .publish(&toggle.state_topic(), toggle.state().as_str().as_bytes().to_vec())
            .await
    }

    /// Publish the current state of every toggle
    pub async fn publish_states(&self) -> Result<(), BusError> {
        for toggle in &self.toggles {
            self.publish_state(toggle).await?;
        }
        Ok(())
    }

    /// Consume bus events until shutdown or until the transport goes away
    pub async fn run(
        self: Arc<Self>,
        mut events: mpsc::Receiver<BusEvent>,
        shutdown: ShutdownToken,
    ) {
        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            match event {
                BusEvent::Connected => {
                    if let Err(e) = self.on_connect().await {
                        tracing::error!("Failed to set up toggles after connect: {}", e);
                    }
                }
                BusEvent::Message { topic, payload } => {
                    self.handle_message(&topic, &payload).await;
                }
            }
        }
        tracing::debug!("Command dispatcher stopped");
    }

    /// Republish every state on a fixed interval until shutdown
    pub async fn run_state_publisher(self: Arc<Self>, shutdown: ShutdownToken) {
        let mut ticker = tokio::time::interval(self.settings.state_publish_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.publish_states().await {
                        tracing::debug!("State publish failed: {}", e);
                    }
                }
            }
        }
    }
}
