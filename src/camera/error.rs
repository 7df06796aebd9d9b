use std::time::Duration;

use thiserror::Error;

use crate::camera::types::{CameraEye, DeviceId};

/// Why an opened camera stopped being usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SessionFault {
    #[error("camera disconnected")]
    Disconnected,

    #[error("camera in use")]
    InUse,

    #[error("maximum cameras in use")]
    MaxCamerasInUse,

    #[error("disabled by device policy")]
    Disabled,

    #[error("fatal (device)")]
    FatalDevice,

    #[error("fatal (service)")]
    FatalService,

    #[error("session configuration failed")]
    ConfigureFailed,

    #[error("unknown error code {0}")]
    Unknown(i32),
}

impl SessionFault {
    /// Map a platform device error code to a fault.
    ///
    /// Codes follow the camera service convention: 1 in use, 2 max in use,
    /// 3 disabled, 4 fatal device, 5 fatal service.
    pub fn from_code(code: i32) -> Self {
        match code {
            1 => Self::InUse,
            2 => Self::MaxCamerasInUse,
            3 => Self::Disabled,
            4 => Self::FatalDevice,
            5 => Self::FatalService,
            other => Self::Unknown(other),
        }
    }
}

/// Camera subsystem errors.
#[derive(Debug, Error)]
pub enum CameraError {
    #[error("no camera devices available")]
    NoDevices,

    #[error("no camera found for the {0} eye")]
    NoMatchingEndpoint(CameraEye),

    #[error("camera {0} does not report intrinsics")]
    MissingIntrinsics(DeviceId),

    #[error("camera session not initialised")]
    NotInitialized,

    #[error("camera permission denied")]
    PermissionDenied,

    #[error("timed out after {0:?} waiting for preview targets")]
    Timeout(Duration),

    #[error("camera session failed: {0}")]
    Session(SessionFault),

    #[error("device enumeration failed: {0}")]
    Enumeration(String),

    #[error("failed to open camera {id}: {reason}")]
    Open { id: DeviceId, reason: String },

    #[error("failed to configure capture session: {0}")]
    Configure(String),

    #[error("capture request failed: {0}")]
    Request(String),

    #[error("failed to start {name} thread: {reason}")]
    Thread { name: &'static str, reason: String },

    #[error("camera session disposed")]
    Disposed,
}

/// Convenience Result alias.
pub type Result<T> = std::result::Result<T, CameraError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fault_codes_map_to_named_faults() {
        assert_eq!(SessionFault::from_code(1), SessionFault::InUse);
        assert_eq!(SessionFault::from_code(4), SessionFault::FatalDevice);
        assert_eq!(SessionFault::from_code(42), SessionFault::Unknown(42));
    }

    #[test]
    fn errors_render_human_readable_messages() {
        let err = CameraError::NoMatchingEndpoint(CameraEye::Right);
        assert_eq!(err.to_string(), "no camera found for the right eye");

        let err = CameraError::Session(SessionFault::InUse);
        assert_eq!(err.to_string(), "camera session failed: camera in use");
    }
}
