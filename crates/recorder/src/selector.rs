//! Ownership token for which camera handle may be grabbed

use std::sync::Arc;

use arc_swap::ArcSwap;
use camera_capture::CaptureDevice;
use parking_lot::Mutex;
use tracing::{debug, info};

/// A capture device shared behind its own lock
pub type SharedDevice = Arc<Mutex<CaptureDevice>>;

pub fn shared(device: CaptureDevice) -> SharedDevice {
    Arc::new(Mutex::new(device))
}

/// Selects the active device
///
/// Every grab, retrieve and write call goes through `active()`, so at any
/// instant exactly one device is the one being driven. A flip redirects all
/// callers on their next load. The optional standby device is held here
/// only while it is not active.
pub struct DeviceSelector {
    active: ArcSwap<Mutex<CaptureDevice>>,
    standby: Mutex<Option<SharedDevice>>,
}

impl DeviceSelector {
    pub fn new(device: CaptureDevice) -> Self {
        Self {
            active: ArcSwap::new(shared(device)),
            standby: Mutex::new(None),
        }
    }

    /// Device currently allowed to grab
    pub fn active(&self) -> SharedDevice {
        self.active.load_full()
    }

    /// Make `next` active, returning the previously active device
    pub fn flip(&self, next: SharedDevice) -> SharedDevice {
        let previous = self.active.swap(next);
        debug!("Active device switched");
        previous
    }

    pub fn take_standby(&self) -> Option<SharedDevice> {
        self.standby.lock().take()
    }

    pub fn set_standby(&self, device: SharedDevice) {
        if let Some(old) = self.standby.lock().replace(device) {
            old.lock().close();
        }
    }

    pub fn has_standby(&self) -> bool {
        self.standby.lock().is_some()
    }

    /// Close every device this selector holds
    pub fn close_all(&self) {
        if let Some(standby) = self.take_standby() {
            standby.lock().close();
        }
        self.active().lock().close();
        info!("All camera handles released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camera_capture::{CameraConfig, OpenRetry, SimConfig, SimulatedDriver};

    #[test]
    fn test_flip_and_standby() {
        let driver = SimulatedDriver::new(SimConfig {
            max_handles: 2,
            ..SimConfig::unpaced()
        });
        let retry = OpenRetry::default();
        let config = CameraConfig::default();
        let primary = CaptureDevice::open(&driver, &config, &retry, "primary").unwrap();
        let secondary = CaptureDevice::open(&driver, &config, &retry, "secondary").unwrap();

        let selector = DeviceSelector::new(primary);
        selector.set_standby(shared(secondary));
        assert!(selector.has_standby());

        let standby = selector.take_standby().unwrap();
        let old = selector.flip(standby);
        assert_eq!(old.lock().label(), "primary");
        assert_eq!(selector.active().lock().label(), "secondary");

        selector.set_standby(old);
        selector.close_all();
        assert_eq!(driver.state().open_handles(), 0);
    }
}
