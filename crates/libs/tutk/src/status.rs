//! Frame-pull status classification
//!
//! The AV receive calls return either a payload length or a negative vendor
//! code. Only a handful of those codes carry meaning for the relay, and the
//! relay cares about their class rather than the literal value. The literal
//! values live in [`StatusCodes`], which is injected wherever a raw code
//! needs classifying.

use serde::{Deserialize, Serialize};

/// Vendor status codes that the relay distinguishes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCodes {
    /// `AV_ER_DATA_NOREADY`
    #[serde(default = "default_data_not_ready")]
    pub data_not_ready: i32,

    /// `AV_ER_LOSED_THIS_FRAME`
    #[serde(default = "default_frame_lost")]
    pub frame_lost: i32,

    /// `AV_ER_SESSION_CLOSE_BY_REMOTE`
    #[serde(default = "default_closed_by_remote")]
    pub closed_by_remote: i32,

    /// `AV_ER_REMOTE_TIMEOUT_DISCONNECT`
    #[serde(default = "default_remote_timeout")]
    pub remote_timeout: i32,

    /// `IOTC_ER_INVALID_SID`
    #[serde(default = "default_invalid_sid")]
    pub invalid_sid: i32,
}

fn default_data_not_ready() -> i32 {
    -20012
}

fn default_frame_lost() -> i32 {
    -20014
}

fn default_closed_by_remote() -> i32 {
    -20015
}

fn default_remote_timeout() -> i32 {
    -20016
}

fn default_invalid_sid() -> i32 {
    -14
}

impl Default for StatusCodes {
    fn default() -> Self {
        Self {
            data_not_ready: default_data_not_ready(),
            frame_lost: default_frame_lost(),
            closed_by_remote: default_closed_by_remote(),
            remote_timeout: default_remote_timeout(),
            invalid_sid: default_invalid_sid(),
        }
    }
}

impl StatusCodes {
    /// Classify the return value of a frame or sample pull
    pub fn classify(&self, code: i32) -> StreamStatus {
        if code >= 0 {
            StreamStatus::Data(code as usize)
        } else if code == self.data_not_ready {
            StreamStatus::NoDataYet
        } else if code == self.frame_lost {
            StreamStatus::FrameLost
        } else if code == self.closed_by_remote {
            StreamStatus::Fatal(FatalStatus::RemoteClosed)
        } else if code == self.remote_timeout {
            StreamStatus::Fatal(FatalStatus::RemoteTimeout)
        } else if code == self.invalid_sid {
            StreamStatus::Fatal(FatalStatus::SessionInvalid)
        } else {
            StreamStatus::Unrecognized(code)
        }
    }
}

/// Outcome of a single frame or sample pull
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStatus {
    /// A payload of the given length was written into the caller's buffer
    Data(usize),

    /// Nothing buffered yet; retry after a short delay
    NoDataYet,

    /// The SDK dropped this frame; skip it
    FrameLost,

    /// The session can no longer deliver frames
    Fatal(FatalStatus),

    /// Negative code outside the known table; treated as a skipped frame
    Unrecognized(i32),
}

impl StreamStatus {
    /// Whether this status ends the pulling loop
    pub fn is_fatal(&self) -> bool {
        matches!(self, StreamStatus::Fatal(_))
    }
}

/// Terminal session conditions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalStatus {
    /// `AV_ER_SESSION_CLOSE_BY_REMOTE`
    RemoteClosed,

    /// `AV_ER_REMOTE_TIMEOUT_DISCONNECT`
    RemoteTimeout,

    /// `IOTC_ER_INVALID_SID`: the session cannot be used anymore
    SessionInvalid,
}

impl std::fmt::Display for FatalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FatalStatus::RemoteClosed => write!(f, "session closed by remote"),
            FatalStatus::RemoteTimeout => write!(f, "remote timeout disconnect"),
            FatalStatus::SessionInvalid => write!(f, "session can't be used anymore"),
        }
    }
}
