//! Vendor IOTC/AV SDK boundary for LSC indoor cameras
//!
//! This crate wraps the proprietary peer-to-peer SDK the camera speaks:
//!
//! - [`NativeSdk`] opens `libIOTCAPIs_ALL` at runtime and exposes it through
//!   the [`DeviceSdk`] trait
//! - [`DeviceSession`] drives the connect, client start and release sequence
//!   and sends [`DeviceCommand`]s over IOCTRL
//! - [`StatusCodes`] classifies raw pull results into [`StreamStatus`]
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use lsc_tutk::{ClientStartParams, Credentials, DeviceSession, NativeSdk, SessionParams, StatusCodes};
//!
//! let sdk = Arc::new(NativeSdk::load("libs/x64/libIOTCAPIs_ALL.so")?);
//! let session = DeviceSession::connect(
//!     sdk,
//!     &SessionParams {
//!         uid: "ABCDEFGHIJKLMNOPQRST".to_string(),
//!         udp_port: 0,
//!         max_av_channels: 2,
//!         client: ClientStartParams {
//!             credentials: Credentials {
//!                 username: "admin".to_string(),
//!                 password: "admin".to_string(),
//!             },
//!             timeout_secs: 20,
//!             channel: 0,
//!         },
//!         codes: StatusCodes::default(),
//!     },
//! )?;
//! session.send_command(lsc_tutk::DeviceCommand::StartCamera)?;
//! # Ok::<(), lsc_tutk::TutkError>(())
//! ```

pub mod error;
pub mod ioctrl;
pub mod native;
pub mod sdk;
pub mod session;
pub mod status;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use error::{IotcError, IotcErrorKind, Result, TutkError};
pub use ioctrl::{DeviceCommand, IoCtrlType};
pub use native::NativeSdk;
pub use sdk::{ClientStartParams, Credentials, DeviceSdk};
pub use session::{DeviceSession, SessionParams};
pub use status::{FatalStatus, StatusCodes, StreamStatus};
