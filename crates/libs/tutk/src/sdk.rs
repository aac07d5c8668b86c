//! Raw SDK surface
//!
//! [`DeviceSdk`] mirrors the subset of the vendor C API the relay uses.
//! Return values are the raw vendor integers; [`crate::DeviceSession`]
//! turns them into typed results.

/// Credentials presented to `avClientStart2`
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Parameters for starting the AV client on a connected session
#[derive(Debug, Clone)]
pub struct ClientStartParams {
    /// AV login credentials
    pub credentials: Credentials,

    /// Handshake timeout in seconds
    pub timeout_secs: u32,

    /// IOTC channel carrying the AV stream
    pub channel: u8,
}

/// Vendor IOTC/AV API
///
/// Implementations must be callable from several threads at once: the
/// video and audio loops pull concurrently while the reclamation loop and
/// command handlers issue buffer resets and IOCTRL requests.
pub trait DeviceSdk: Send + Sync {
    /// `IOTC_Initialize2`
    fn iotc_initialize(&self, udp_port: u16) -> i32;

    /// `avInitialize`
    fn av_initialize(&self, max_channels: i32) -> i32;

    /// `IOTC_Get_SessionID`
    fn allocate_session_id(&self) -> i32;

    /// `IOTC_Connect_ByUID_Parallel`
    fn connect_by_uid(&self, uid: &str, session_id: i32) -> i32;

    /// `avClientStart2`, returns the AV index or a negative code
    fn client_start(&self, session_id: i32, params: &ClientStartParams) -> i32;

    /// `avSendIOCtrl`
    fn send_ioctrl(&self, av_index: i32, io_type: u32, payload: &[u8]) -> i32;

    /// `avRecvFrameData2`, returns the frame size or a negative code
    fn recv_video_frame(&self, av_index: i32, buf: &mut [u8]) -> i32;

    /// `avRecvAudioData`, returns the sample batch size or a negative code
    fn recv_audio_frame(&self, av_index: i32, buf: &mut [u8]) -> i32;

    /// `avCheckAudioBuf`, returns the number of buffered audio frames
    fn check_audio_buffer(&self, av_index: i32) -> i32;

    /// `avClientCleanVideoBuf`
    fn clean_video_buffer(&self, av_index: i32);

    /// `avClientCleanAudioBuf`
    fn clean_audio_buffer(&self, av_index: i32);

    /// `avClientStop`
    fn client_stop(&self, av_index: i32);

    /// `IOTC_Session_Close`
    fn close_session(&self, session_id: i32);

    /// `avDeInitialize` followed by `IOTC_DeInitialize`
    fn deinitialize(&self);
}
