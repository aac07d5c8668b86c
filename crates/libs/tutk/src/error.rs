//! Error types for the device SDK boundary

use thiserror::Error;

use crate::ioctrl::DeviceCommand;

/// Result type for SDK operations
pub type Result<T> = std::result::Result<T, TutkError>;

/// Errors raised while talking to the vendor SDK
#[derive(Error, Debug)]
pub enum TutkError {
    /// The native library could not be loaded or is missing a symbol
    #[error("Failed to load SDK library '{path}': {message}")]
    Library { path: String, message: String },

    /// `IOTC_Initialize2` or `avInitialize` rejected the call
    #[error("SDK module '{module}' failed to initialize (code {code})")]
    Initialize { module: &'static str, code: i32 },

    /// No free slot in the session table
    #[error("Get session ID failed: {0}")]
    SessionAllocation(IotcError),

    /// The device could not be reached by UID
    #[error("Connect by UID failed: {0}")]
    Connect(IotcError),

    /// `avClientStart2` rejected the credentials or timed out
    #[error("avClientStart2 failed [{code}]")]
    ClientStart { code: i32 },

    /// The device refused an IOCTRL request
    #[error("IOCTRL {command} rejected (code {code})")]
    IoCtrl { command: DeviceCommand, code: i32 },

    /// The session was already released
    #[error("Session {0} already released")]
    Released(i32),
}

impl TutkError {
    /// Create a library load error with context
    pub fn library(path: impl Into<String>, message: impl ToString) -> Self {
        Self::Library {
            path: path.into(),
            message: message.to_string(),
        }
    }
}

/// Classified IOTC connection error
///
/// Wraps the raw code returned by the IOTC connect family and knows how to
/// explain it to the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IotcError {
    code: i32,
}

/// Class of an IOTC connection error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IotcErrorKind {
    /// Master server unreachable or hostname unresolvable
    MasterUnreachable,
    /// Local SDK state problem (already initialized, no mutex/thread, not initialized)
    SdkState,
    /// UID is not licensed, or its license lacks a required transport
    Unlicensed,
    /// Session handle is not valid
    InvalidSession,
    /// Session or channel table is full
    ResourceExhausted,
    /// Device not registered, not listening, or cannot reach the master
    DeviceUnavailable,
    /// Remote closed the session or stopped acknowledging
    RemoteDisconnected,
    /// Local network problem
    NetworkUnreachable,
    /// No usable LAN, P2P or relay path
    NoRoute,
    /// Any code outside the documented table
    Unknown,
}

impl IotcError {
    pub fn new(code: i32) -> Self {
        Self { code }
    }

    /// The raw vendor code
    pub fn code(&self) -> i32 {
        self.code
    }

    pub fn kind(&self) -> IotcErrorKind {
        match self.code {
            -1 | -2 => IotcErrorKind::MasterUnreachable,
            -3 | -4 | -5 | -12 | -26 => IotcErrorKind::SdkState,
            -10 | -40 => IotcErrorKind::Unlicensed,
            -14 => IotcErrorKind::InvalidSession,
            -18 | -31 => IotcErrorKind::ResourceExhausted,
            -19 | -24 | -32 | -33 => IotcErrorKind::DeviceUnavailable,
            -22 | -23 => IotcErrorKind::RemoteDisconnected,
            -41 => IotcErrorKind::NetworkUnreachable,
            -42 | -43 => IotcErrorKind::NoRoute,
            _ => IotcErrorKind::Unknown,
        }
    }

    /// Operator-facing explanation of the code
    pub fn hint(&self) -> &'static str {
        match self.code {
            -1 => "Master doesn't respond. Please check the network whether it could connect to the Internet.",
            -2 => "Can't resolve hostname.",
            -3 => "Already initialized.",
            -4 => "Can't create mutex.",
            -5 => "Can't create thread.",
            -10 => "This UID is unlicensed. Check your UID.",
            -12 => "Please initialize the IOTCAPI first.",
            -14 => "This SID is invalid. Please check it again.",
            -18 => "The amount of session reached the maximum. It cannot be connected unless the session is released.",
            -19 => "Device didn't register on the server, so we can't find the device. Please check the device again.",
            -22 => "Session is closed by remote, so we can't access. Please close it or establish the session again.",
            -23 => "We can't receive an acknowledgment character within a TIMEOUT. It might be that the session is disconnected by remote. Please check the network whether it is busy or not.",
            -24 => "Device doesn't listen or the sessions of the device reached the maximum. Please release the session and check the device whether it listens or not.",
            -26 => "Channel isn't on.",
            -31 => "All channels are occupied. Please release some channels.",
            -32 => "Device can't connect to the Master. Don't let the device use a proxy, close its firewall or open its TCP ports 80, 443, 8080, 8000, 21047.",
            -33 => "Device can't connect to the server by TCP. Don't let the server use a proxy, close its firewall or open its TCP ports 80, 443, 8080, 8000, 21047.",
            -40 => "This UID's license doesn't support TCP.",
            -41 => "Network is unreachable. Please check your network.",
            -42 => "Client can't connect to a device via Lan, P2P, and Relay mode.",
            -43 => "Server doesn't support UDP relay mode, so the client can't use UDP relay to connect to a device.",
            _ => "Unknown IOTC error.",
        }
    }
}

impl std::fmt::Display for IotcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[Error code: {}] {}", self.code, self.hint())
    }
}

impl std::error::Error for IotcError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_error_classes() {
        assert_eq!(IotcError::new(-10).kind(), IotcErrorKind::Unlicensed);
        assert_eq!(IotcError::new(-18).kind(), IotcErrorKind::ResourceExhausted);
        assert_eq!(IotcError::new(-41).kind(), IotcErrorKind::NetworkUnreachable);
        assert_eq!(IotcError::new(-90).kind(), IotcErrorKind::Unknown);
    }

    #[test]
    fn test_connect_error_display_carries_code_and_hint() {
        let err = TutkError::Connect(IotcError::new(-10));
        let text = err.to_string();
        assert!(text.contains("-10"));
        assert!(text.contains("unlicensed"));
    }
}
