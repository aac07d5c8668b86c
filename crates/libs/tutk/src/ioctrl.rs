//! IOCTRL device commands
//!
//! Each logical command maps to a vendor IOCTRL type and a small fixed-layout
//! request struct. The layouts mirror the C structs the firmware expects, so
//! they are encoded in native byte order.

/// Vendor IOCTRL message types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum IoCtrlType {
    SetGrayModeReq = 0x5000,
    SetStreamCtrlReq = 0x0320,
    Start = 0x01FF,
    Stop = 0x02FF,
    AudioStart = 0x0300,
}

/// Logical device commands the relay issues
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceCommand {
    DisableNightVision,
    EnableNightVision,
    SetHdQuality,
    StartCamera,
    StopCamera,
    StartAudio,
}

/// Request body for `SetGrayModeReq`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
struct SetVideoModeReq {
    channel: u32,
    mode: u32,
}

/// Request body for `SetStreamCtrlReq`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
struct SetStreamCtrlReq {
    channel: u32,
    quality: u32,
}

/// Request body for `Start`, `Stop` and `AudioStart`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
struct AvStreamReq {
    channel: u32,
    reserved: [u8; 4],
}

impl DeviceCommand {
    pub fn io_type(&self) -> IoCtrlType {
        match self {
            DeviceCommand::DisableNightVision | DeviceCommand::EnableNightVision => {
                IoCtrlType::SetGrayModeReq
            }
            DeviceCommand::SetHdQuality => IoCtrlType::SetStreamCtrlReq,
            DeviceCommand::StartCamera => IoCtrlType::Start,
            DeviceCommand::StopCamera => IoCtrlType::Stop,
            DeviceCommand::StartAudio => IoCtrlType::AudioStart,
        }
    }

    /// Whether the device buffers must be flushed before sending
    pub fn flushes_buffers(&self) -> bool {
        matches!(self, DeviceCommand::StartCamera)
    }

    /// Encode the request body
    pub fn payload(&self) -> Vec<u8> {
        match self {
            // The firmware treats channel/mode 1 as "gray mode off"
            DeviceCommand::DisableNightVision => SetVideoModeReq { channel: 1, mode: 1 }.encode(),
            DeviceCommand::EnableNightVision => SetVideoModeReq { channel: 0, mode: 0 }.encode(),
            DeviceCommand::SetHdQuality => SetStreamCtrlReq {
                channel: 0,
                quality: 2,
            }
            .encode(),
            DeviceCommand::StartCamera | DeviceCommand::StopCamera | DeviceCommand::StartAudio => {
                AvStreamReq {
                    channel: 1,
                    reserved: [0; 4],
                }
                .encode()
            }
        }
    }
}

impl std::fmt::Display for DeviceCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DeviceCommand::DisableNightVision => "disable night vision",
            DeviceCommand::EnableNightVision => "enable night vision",
            DeviceCommand::SetHdQuality => "set HD quality",
            DeviceCommand::StartCamera => "start camera",
            DeviceCommand::StopCamera => "stop camera",
            DeviceCommand::StartAudio => "start audio",
        };
        f.write_str(name)
    }
}

impl SetVideoModeReq {
    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(std::mem::size_of::<Self>());
        out.extend_from_slice(&self.channel.to_ne_bytes());
        out.extend_from_slice(&self.mode.to_ne_bytes());
        out
    }
}

impl SetStreamCtrlReq {
    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(std::mem::size_of::<Self>());
        out.extend_from_slice(&self.channel.to_ne_bytes());
        out.extend_from_slice(&self.quality.to_ne_bytes());
        out
    }
}

impl AvStreamReq {
    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(std::mem::size_of::<Self>());
        out.extend_from_slice(&self.channel.to_ne_bytes());
        out.extend_from_slice(&self.reserved);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payloads_match_struct_sizes() {
        for command in [
            DeviceCommand::DisableNightVision,
            DeviceCommand::EnableNightVision,
            DeviceCommand::SetHdQuality,
            DeviceCommand::StartCamera,
            DeviceCommand::StopCamera,
            DeviceCommand::StartAudio,
        ] {
            assert_eq!(command.payload().len(), 8, "{command}");
        }
    }

    #[test]
    fn test_night_vision_modes() {
        let off = DeviceCommand::DisableNightVision.payload();
        assert_eq!(&off[0..4], &1u32.to_ne_bytes());
        assert_eq!(&off[4..8], &1u32.to_ne_bytes());

        let on = DeviceCommand::EnableNightVision.payload();
        assert_eq!(on, vec![0; 8]);
    }

    #[test]
    fn test_io_types() {
        assert_eq!(DeviceCommand::SetHdQuality.io_type() as u32, 0x0320);
        assert_eq!(DeviceCommand::StopCamera.io_type() as u32, 0x02FF);
        assert!(DeviceCommand::StartCamera.flushes_buffers());
        assert!(!DeviceCommand::StartAudio.flushes_buffers());
    }
}
