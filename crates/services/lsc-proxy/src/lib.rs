//! LSC indoor camera proxy
//!
//! Pulls the camera's AV session over the vendor SDK and republishes it as
//! an RTSP stream:
//!
//! - Video and audio frames are relayed into named pipes by dedicated
//!   ingestion loops ([`ingest`])
//! - `ffmpeg` muxes the pipes and pushes to a local `mediamtx`, both kept
//!   alive by [`supervisor`]
//! - Night vision, privacy mode and image flip are exposed to Home Assistant
//!   as MQTT switches ([`dispatcher`], [`toggle`])
//!
//! [`controller::SessionController`] wires everything together.

pub mod bus;
pub mod config;
pub mod controller;
pub mod dispatcher;
pub mod ingest;
pub mod mqtt;
pub mod reclaim;
pub mod shutdown;
pub mod sink;
pub mod state_store;
pub mod supervisor;
pub mod toggle;
pub mod transcoder;

pub use config::Config;
pub use controller::{ControllerError, RunSummary, SessionController, StopReason};
pub use shutdown::ShutdownToken;
