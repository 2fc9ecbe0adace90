use crate::{CameraDevice, DeviceInfo, Resolution, SourceId};
use tracing::debug;

/// Probe consecutive device indices starting at 0 and stop at the first one
/// that fails to open (or at `max`).
pub fn enumerate_devices<D: CameraDevice>(max: SourceId, requested: Resolution) -> Vec<DeviceInfo> {
    let mut out = Vec::new();
    for index in 0..max {
        match D::open(index, requested) {
            Ok(dev) => out.push(DeviceInfo {
                index,
                backend: dev.backend_name().to_string(),
                resolution: dev.resolution(),
            }),
            Err(e) => {
                debug!(index, error = %e, "device probe stopped");
                break;
            }
        }
    }
    out
}
