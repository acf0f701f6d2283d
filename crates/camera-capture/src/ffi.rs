//! FFI bindings for the vendor stereo camera shim (libstereo_capture)

use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_void};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use tracing::warn;

use crate::driver::{CameraDriver, CameraHandle, GrabStatus};
use crate::frame::{DepthMap, ImageBuffer, View};
use crate::imu::TelemetrySample;
use crate::{
    CameraConfig, CameraError, Compression, DepthLevel, Resolution, SettingValue, VideoSetting,
    WriteParams,
};

/// Opaque SDK camera object
#[repr(C)]
pub struct StereoCamera {
    _private: [u8; 0],
}

/// C open parameters (matches stereo_capture.h)
#[repr(C)]
pub struct CStereoConfig {
    pub resolution: i32,
    pub fps: u32,
    pub depth_mode: i32,
}

/// C recording parameters
#[repr(C)]
pub struct CRecordingParams {
    pub path: *const c_char,
    pub compression: i32,
    pub target_fps: u32,
}

/// C image buffer, owned by the SDK until released
#[repr(C)]
pub struct CImage {
    pub data: *mut u8,
    pub size: usize,
    pub width: u32,
    pub height: u32,
    pub timestamp_ns: u64,
}

/// C depth buffer, owned by the SDK until released
#[repr(C)]
pub struct CDepth {
    pub data: *mut f32,
    pub len: usize,
    pub width: u32,
    pub height: u32,
}

/// C sensor reading
#[repr(C)]
#[derive(Default)]
pub struct CSensors {
    pub timestamp_ns: u64,
    pub rotation: [f32; 3],
    pub accel: [f32; 3],
    pub gyro: [f32; 3],
    pub mag: [f32; 3],
    pub pressure: f32,
    pub temperature: f32,
}

const GRAB_OK: i32 = 0;
const GRAB_CORRUPTED: i32 = 1;
const GRAB_END_OF_INPUT: i32 = 2;
const RECORD_BUSY: i32 = -2;

#[link(name = "stereo_capture")]
extern "C" {
    fn stereo_open(config: *const CStereoConfig) -> *mut StereoCamera;
    fn stereo_grab(cam: *mut StereoCamera) -> i32;
    fn stereo_retrieve_image(cam: *mut StereoCamera, view: i32) -> *mut CImage;
    fn stereo_retrieve_depth(cam: *mut StereoCamera) -> *mut CDepth;
    fn stereo_release_buffer(buffer: *mut c_void);
    fn stereo_enable_recording(cam: *mut StereoCamera, params: *const CRecordingParams) -> i32;
    fn stereo_pause_recording(cam: *mut StereoCamera, paused: i32);
    fn stereo_disable_recording(cam: *mut StereoCamera, path: *const c_char);
    fn stereo_sensors(cam: *mut StereoCamera, out: *mut CSensors) -> i32;
    fn stereo_get_setting(cam: *mut StereoCamera, setting: i32) -> i32;
    fn stereo_set_setting(cam: *mut StereoCamera, setting: i32, value: i32) -> i32;
    fn stereo_close(cam: *mut StereoCamera);
    fn stereo_last_error() -> *const c_char;
}

fn last_error() -> String {
    unsafe {
        let ptr = stereo_last_error();
        if ptr.is_null() {
            "unknown SDK error".to_string()
        } else {
            CStr::from_ptr(ptr).to_string_lossy().into_owned()
        }
    }
}

fn path_cstring(path: &Path) -> Result<CString, CameraError> {
    CString::new(path.as_os_str().as_bytes()).map_err(|e| CameraError::Write(e.to_string()))
}

fn resolution_code(resolution: Resolution) -> i32 {
    match resolution {
        Resolution::Hd2k => 0,
        Resolution::Hd1080 => 1,
        Resolution::Hd720 => 2,
        Resolution::Vga => 3,
    }
}

fn depth_code(depth: DepthLevel) -> i32 {
    match depth {
        DepthLevel::None => 0,
        DepthLevel::Performance => 1,
        DepthLevel::Quality => 2,
        DepthLevel::Ultra => 3,
        DepthLevel::NeuralLite => 4,
        DepthLevel::Neural => 5,
        DepthLevel::NeuralPlus => 6,
    }
}

fn setting_code(setting: VideoSetting) -> i32 {
    match setting {
        VideoSetting::Exposure => 0,
        VideoSetting::Gain => 1,
    }
}

/// SDK buffer released on drop
struct SdkBuffer<T> {
    ptr: *mut T,
}

impl<T> Drop for SdkBuffer<T> {
    fn drop(&mut self) {
        unsafe { stereo_release_buffer(self.ptr as *mut c_void) }
    }
}

/// Driver backed by the vendor SDK
#[derive(Debug, Default, Clone, Copy)]
pub struct VendorDriver;

impl CameraDriver for VendorDriver {
    fn open(&self, config: &CameraConfig) -> Result<Box<dyn CameraHandle>, CameraError> {
        let c_config = CStereoConfig {
            resolution: resolution_code(config.resolution),
            fps: config.fps,
            depth_mode: depth_code(config.depth),
        };
        let cam = unsafe { stereo_open(&c_config) };
        if cam.is_null() {
            return Err(CameraError::Open(last_error()));
        }
        Ok(Box::new(VendorHandle { cam }))
    }
}

/// Open SDK camera
pub struct VendorHandle {
    cam: *mut StereoCamera,
}

// The SDK camera object may move between threads as long as calls are
// serialized, which `CaptureDevice` ownership guarantees.
unsafe impl Send for VendorHandle {}

impl VendorHandle {
    fn ensure_open(&self) -> Result<(), CameraError> {
        if self.cam.is_null() {
            Err(CameraError::NotOpen)
        } else {
            Ok(())
        }
    }
}

impl CameraHandle for VendorHandle {
    fn grab(&mut self) -> GrabStatus {
        if self.cam.is_null() {
            return GrabStatus::TransientFailure("handle closed".into());
        }
        match unsafe { stereo_grab(self.cam) } {
            GRAB_OK => GrabStatus::Success,
            GRAB_CORRUPTED => GrabStatus::CorruptedFrame,
            GRAB_END_OF_INPUT => GrabStatus::EndOfInput,
            code => GrabStatus::TransientFailure(format!("{} ({})", last_error(), code)),
        }
    }

    fn retrieve_image(&mut self, view: View) -> Result<ImageBuffer, CameraError> {
        self.ensure_open()?;
        let code = match view {
            View::Left => 0,
            View::Right => 1,
        };
        let ptr = unsafe { stereo_retrieve_image(self.cam, code) };
        if ptr.is_null() {
            return Err(CameraError::Retrieve(last_error()));
        }
        let buffer = SdkBuffer { ptr };
        let image = unsafe { &*buffer.ptr };
        let data = unsafe { std::slice::from_raw_parts(image.data, image.size) }.to_vec();
        Ok(ImageBuffer::new(
            data,
            image.width,
            image.height,
            image.timestamp_ns,
        ))
    }

    fn retrieve_depth(&mut self) -> Result<DepthMap, CameraError> {
        self.ensure_open()?;
        let ptr = unsafe { stereo_retrieve_depth(self.cam) };
        if ptr.is_null() {
            return Err(CameraError::Retrieve(last_error()));
        }
        let buffer = SdkBuffer { ptr };
        let depth = unsafe { &*buffer.ptr };
        let values = unsafe { std::slice::from_raw_parts(depth.data, depth.len) }.to_vec();
        Ok(DepthMap::new(values, depth.width, depth.height))
    }

    fn enable_write(&mut self, params: &WriteParams) -> Result<(), CameraError> {
        self.ensure_open()?;
        let path = path_cstring(&params.path)?;
        let c_params = CRecordingParams {
            path: path.as_ptr(),
            compression: match params.compression {
                Compression::Lossless => 0,
                Compression::H264 => 1,
                Compression::H265 => 2,
            },
            target_fps: params.target_fps,
        };
        match unsafe { stereo_enable_recording(self.cam, &c_params) } {
            0 => Ok(()),
            RECORD_BUSY => Err(CameraError::WriteBusy),
            code => Err(CameraError::Write(format!("{} ({})", last_error(), code))),
        }
    }

    fn pause_write(&mut self, paused: bool) {
        if !self.cam.is_null() {
            unsafe { stereo_pause_recording(self.cam, i32::from(paused)) }
        }
    }

    fn disable_write(&mut self, path: &Path) {
        if self.cam.is_null() {
            return;
        }
        match path_cstring(path) {
            Ok(c_path) => unsafe { stereo_disable_recording(self.cam, c_path.as_ptr()) },
            Err(e) => warn!("Cannot disable write for {}: {}", path.display(), e),
        }
    }

    fn sensors(&mut self) -> Result<TelemetrySample, CameraError> {
        self.ensure_open()?;
        let mut out = CSensors::default();
        if unsafe { stereo_sensors(self.cam, &mut out) } != 0 {
            return Err(CameraError::Sensors(last_error()));
        }
        Ok(TelemetrySample {
            timestamp_ms: out.timestamp_ns / 1_000_000,
            rotation: out.rotation,
            accel: out.accel,
            gyro: out.gyro,
            mag: out.mag,
            pressure: out.pressure,
            temperature: out.temperature,
        })
    }

    fn setting(&self, setting: VideoSetting) -> Result<i32, CameraError> {
        self.ensure_open()?;
        Ok(unsafe { stereo_get_setting(self.cam, setting_code(setting)) })
    }

    fn set_setting(
        &mut self,
        setting: VideoSetting,
        value: SettingValue,
    ) -> Result<(), CameraError> {
        self.ensure_open()?;
        let ret = unsafe { stereo_set_setting(self.cam, setting_code(setting), value.as_raw()) };
        if ret != 0 {
            return Err(CameraError::Setting(last_error()));
        }
        Ok(())
    }

    fn close(&mut self) {
        if !self.cam.is_null() {
            unsafe { stereo_close(self.cam) };
            self.cam = std::ptr::null_mut();
        }
    }
}

impl Drop for VendorHandle {
    fn drop(&mut self) {
        self.close();
    }
}
