//! Runtime-loaded binding to `libIOTCAPIs_ALL`
//!
//! The vendor ships the SDK as a prebuilt shared object, so it is opened
//! with `libloading` at startup instead of being linked at build time.

use std::ffi::{c_char, c_int, c_uint, CString};
use std::path::Path;

use libloading::Library;

use crate::error::{Result, TutkError};
use crate::sdk::{ClientStartParams, DeviceSdk};

/// Size of the vendor `FRAMEINFO_t` struct
const FRAME_INFO_SIZE: usize = 24;

type IotcInitialize2 = unsafe extern "C" fn(c_int) -> c_int;
type IotcDeInitialize = unsafe extern "C" fn() -> c_int;
type IotcGetSessionId = unsafe extern "C" fn() -> c_int;
type IotcConnectByUidParallel = unsafe extern "C" fn(*const c_char, c_int) -> c_int;
type IotcSessionClose = unsafe extern "C" fn(c_int);
type AvInitialize = unsafe extern "C" fn(c_int) -> c_int;
type AvDeInitialize = unsafe extern "C" fn() -> c_int;
type AvClientStart2 = unsafe extern "C" fn(
    c_int,
    *const c_char,
    *const c_char,
    c_int,
    *mut c_uint,
    c_int,
    *mut c_int,
) -> c_int;
type AvClientStop = unsafe extern "C" fn(c_int);
type AvSendIoCtrl = unsafe extern "C" fn(c_int, c_uint, *const c_char, c_int) -> c_int;
type AvRecvFrameData2 = unsafe extern "C" fn(
    c_int,
    *mut c_char,
    c_int,
    *mut c_int,
    *mut c_int,
    *mut c_char,
    c_int,
    *mut c_int,
    *mut c_uint,
) -> c_int;
type AvRecvAudioData =
    unsafe extern "C" fn(c_int, *mut c_char, c_int, *mut c_char, c_int, *mut c_uint) -> c_int;
type AvCheckAudioBuf = unsafe extern "C" fn(c_int) -> c_int;
type AvClientCleanBuf = unsafe extern "C" fn(c_int);

/// Resolved entry points
struct Symbols {
    iotc_initialize2: IotcInitialize2,
    iotc_deinitialize: IotcDeInitialize,
    iotc_get_session_id: IotcGetSessionId,
    iotc_connect_by_uid_parallel: IotcConnectByUidParallel,
    iotc_session_close: IotcSessionClose,
    av_initialize: AvInitialize,
    av_deinitialize: AvDeInitialize,
    av_client_start2: AvClientStart2,
    av_client_stop: AvClientStop,
    av_send_ioctrl: AvSendIoCtrl,
    av_recv_frame_data2: AvRecvFrameData2,
    av_recv_audio_data: AvRecvAudioData,
    av_check_audio_buf: AvCheckAudioBuf,
    av_client_clean_video_buf: AvClientCleanBuf,
    av_client_clean_audio_buf: AvClientCleanBuf,
}

/// Copy a function pointer out of the library
///
/// # Safety
/// `T` must match the C signature of `name`, and the returned pointer must
/// not outlive `library`.
unsafe fn resolve<T: Copy>(library: &Library, path: &Path, name: &str) -> Result<T> {
    library
        .get::<T>(name.as_bytes())
        .map(|symbol| *symbol)
        .map_err(|e| TutkError::library(path.display().to_string(), format!("{}: {}", name, e)))
}

impl Symbols {
    unsafe fn load(library: &Library, path: &Path) -> Result<Self> {
        Ok(Self {
            iotc_initialize2: resolve(library, path, "IOTC_Initialize2")?,
            iotc_deinitialize: resolve(library, path, "IOTC_DeInitialize")?,
            iotc_get_session_id: resolve(library, path, "IOTC_Get_SessionID")?,
            iotc_connect_by_uid_parallel: resolve(library, path, "IOTC_Connect_ByUID_Parallel")?,
            iotc_session_close: resolve(library, path, "IOTC_Session_Close")?,
            av_initialize: resolve(library, path, "avInitialize")?,
            av_deinitialize: resolve(library, path, "avDeInitialize")?,
            av_client_start2: resolve(library, path, "avClientStart2")?,
            av_client_stop: resolve(library, path, "avClientStop")?,
            av_send_ioctrl: resolve(library, path, "avSendIOCtrl")?,
            av_recv_frame_data2: resolve(library, path, "avRecvFrameData2")?,
            av_recv_audio_data: resolve(library, path, "avRecvAudioData")?,
            av_check_audio_buf: resolve(library, path, "avCheckAudioBuf")?,
            av_client_clean_video_buf: resolve(library, path, "avClientCleanVideoBuf")?,
            av_client_clean_audio_buf: resolve(library, path, "avClientCleanAudioBuf")?,
        })
    }
}

/// SDK backed by the vendor shared library
pub struct NativeSdk {
    symbols: Symbols,

    /// Keeps the resolved function pointers valid
    _library: Library,
}

impl NativeSdk {
    /// Open the shared library at `path` and resolve every entry point
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        tracing::debug!("Loading SDK library from {}", path.display());

        // SAFETY: loading runs the library's initializers; the vendor SDK has
        // no load-time side effects beyond its own static state.
        let library = unsafe { Library::new(path) }
            .map_err(|e| TutkError::library(path.display().to_string(), e))?;
        // SAFETY: the aliases above match the vendor headers, and the pointers
        // are stored next to the library that owns them.
        let symbols = unsafe { Symbols::load(&library, path)? };

        Ok(Self {
            symbols,
            _library: library,
        })
    }
}

fn buffer_len(buf: &[u8]) -> c_int {
    c_int::try_from(buf.len()).unwrap_or(c_int::MAX)
}

impl DeviceSdk for NativeSdk {
    fn iotc_initialize(&self, udp_port: u16) -> i32 {
        unsafe { (self.symbols.iotc_initialize2)(c_int::from(udp_port)) }
    }

    fn av_initialize(&self, max_channels: i32) -> i32 {
        unsafe { (self.symbols.av_initialize)(max_channels) }
    }

    fn allocate_session_id(&self) -> i32 {
        unsafe { (self.symbols.iotc_get_session_id)() }
    }

    fn connect_by_uid(&self, uid: &str, session_id: i32) -> i32 {
        let Ok(uid) = CString::new(uid) else {
            // An interior NUL can never be a valid UID
            return -10;
        };
        unsafe { (self.symbols.iotc_connect_by_uid_parallel)(uid.as_ptr(), session_id) }
    }

    fn client_start(&self, session_id: i32, params: &ClientStartParams) -> i32 {
        let (Ok(user), Ok(pass)) = (
            CString::new(params.credentials.username.as_str()),
            CString::new(params.credentials.password.as_str()),
        ) else {
            return -1;
        };
        let mut service_type: c_uint = 0;
        let mut resend: c_int = -1;
        unsafe {
            (self.symbols.av_client_start2)(
                session_id,
                user.as_ptr(),
                pass.as_ptr(),
                params.timeout_secs as c_int,
                &mut service_type,
                c_int::from(params.channel),
                &mut resend,
            )
        }
    }

    fn send_ioctrl(&self, av_index: i32, io_type: u32, payload: &[u8]) -> i32 {
        unsafe {
            (self.symbols.av_send_ioctrl)(
                av_index,
                io_type,
                payload.as_ptr() as *const c_char,
                buffer_len(payload),
            )
        }
    }

    fn recv_video_frame(&self, av_index: i32, buf: &mut [u8]) -> i32 {
        let mut frame_info = [0u8; FRAME_INFO_SIZE];
        let mut out_buf_size: c_int = 0;
        let mut out_frame_size: c_int = 0;
        let mut out_info_size: c_int = 0;
        let mut frame_no: c_uint = 0;
        unsafe {
            (self.symbols.av_recv_frame_data2)(
                av_index,
                buf.as_mut_ptr() as *mut c_char,
                buffer_len(buf),
                &mut out_buf_size,
                &mut out_frame_size,
                frame_info.as_mut_ptr() as *mut c_char,
                FRAME_INFO_SIZE as c_int,
                &mut out_info_size,
                &mut frame_no,
            )
        }
    }

    fn recv_audio_frame(&self, av_index: i32, buf: &mut [u8]) -> i32 {
        let mut frame_info = [0u8; FRAME_INFO_SIZE];
        let mut frame_no: c_uint = 0;
        unsafe {
            (self.symbols.av_recv_audio_data)(
                av_index,
                buf.as_mut_ptr() as *mut c_char,
                buffer_len(buf),
                frame_info.as_mut_ptr() as *mut c_char,
                FRAME_INFO_SIZE as c_int,
                &mut frame_no,
            )
        }
    }

    fn check_audio_buffer(&self, av_index: i32) -> i32 {
        unsafe { (self.symbols.av_check_audio_buf)(av_index) }
    }

    fn clean_video_buffer(&self, av_index: i32) {
        unsafe { (self.symbols.av_client_clean_video_buf)(av_index) }
    }

    fn clean_audio_buffer(&self, av_index: i32) {
        unsafe { (self.symbols.av_client_clean_audio_buf)(av_index) }
    }

    fn client_stop(&self, av_index: i32) {
        unsafe { (self.symbols.av_client_stop)(av_index) }
    }

    fn close_session(&self, session_id: i32) {
        unsafe { (self.symbols.iotc_session_close)(session_id) }
    }

    fn deinitialize(&self) {
        unsafe {
            (self.symbols.av_deinitialize)();
            (self.symbols.iotc_deinitialize)();
        }
    }
}
