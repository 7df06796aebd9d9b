//! Camera endpoint geometry.
//!
//! Turns the raw lens characteristics of the selected camera into the
//! head-relative pose and horizontal field of view that the placement layer
//! uses to line a preview panel up with the passthrough image.

use glam::{Quat, Vec2, Vec3};

use crate::camera::error::{CameraError, Result};
use crate::camera::types::{CameraDevice, CameraEye, DeviceId, Size};

const EPSILON: f32 = 1e-9;

/// Rigid transform relative to the head.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Pose {
    pub translation: Vec3,
    pub rotation: Quat,
}

/// Pinhole intrinsics of the selected camera.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Intrinsics {
    pub focal_length: Vec2,
    pub principal_point: Vec2,
    pub resolution: Size,
}

impl Intrinsics {
    /// Map a pixel coordinate to a unit direction in camera space.
    pub fn screen_point_to_ray(&self, point: Vec2) -> Vec3 {
        Vec3::new(
            (point.x - self.principal_point.x) / self.focal_length.x,
            ((self.resolution.height as f32 - point.y) - self.principal_point.y)
                / self.focal_length.y,
            1.0,
        )
        .normalize_or_zero()
    }

    /// Horizontal field of view in degrees, measured between the rays through
    /// the left and right edge midpoints.
    pub fn horizontal_fov(&self) -> f32 {
        let mid_y = self.resolution.height as f32 / 2.0;
        let left = self.screen_point_to_ray(Vec2::new(0.0, mid_y));
        let right = self.screen_point_to_ray(Vec2::new(self.resolution.width as f32, mid_y));
        left.angle_between(right).to_degrees()
    }
}

/// The camera the pipeline streams from. Computed once at initialisation.
#[derive(Debug, Clone, PartialEq)]
pub struct CameraEndpoint {
    pub id: DeviceId,
    pub eye: CameraEye,
    pub intrinsics: Intrinsics,
    pub translation: Vec3,
    pub rotation: Quat,
    /// Horizontal field of view in degrees.
    pub fov: f32,
}

impl CameraEndpoint {
    /// Derive the endpoint from a device's characteristics.
    pub fn from_device(device: &CameraDevice, eye: CameraEye) -> Result<Self> {
        let chars = &device.characteristics;
        let (Some(t), Some(r), Some(k), Some(resolution)) = (
            chars.lens_pose_translation,
            chars.lens_pose_rotation,
            chars.lens_intrinsic_calibration,
            chars.pre_correction_active_array,
        ) else {
            return Err(CameraError::MissingIntrinsics(device.id.clone()));
        };

        if k[0].abs() < EPSILON || k[1].abs() < EPSILON {
            return Err(CameraError::MissingIntrinsics(device.id.clone()));
        }

        // Lens pose is reported in the sensor frame; flip into the head frame
        // (z forward) and turn the image upright.
        let lens = Quat::from_xyzw(-r[0], -r[1], r[2], r[3]);
        let lens = if lens.length_squared() < EPSILON {
            Quat::IDENTITY
        } else {
            lens.normalize().inverse()
        };
        let rotation = lens * Quat::from_axis_angle(Vec3::X, 180f32.to_radians());

        let intrinsics = Intrinsics {
            focal_length: Vec2::new(k[0], k[1]),
            principal_point: Vec2::new(k[2], k[3]),
            resolution,
        };

        Ok(Self {
            id: device.id.clone(),
            eye,
            intrinsics,
            translation: Vec3::new(t[0], t[1], -t[2]),
            rotation,
            fov: intrinsics.horizontal_fov(),
        })
    }

    /// Pose of the camera relative to the head.
    pub fn head_to_camera_pose(&self) -> Pose {
        Pose {
            translation: self.translation,
            rotation: self.rotation,
        }
    }

    /// Sensor resolution, also the frame-reader output size.
    pub fn resolution(&self) -> Size {
        self.intrinsics.resolution
    }

    /// Point where the pinhole ray through `point` meets a plane `distance`
    /// metres in front of the camera.
    pub fn screen_point_to_point_on_view_plane(&self, point: Vec2, distance: f32) -> Option<Vec3> {
        let direction = self.intrinsics.screen_point_to_ray(point);
        ray_plane_intersection(
            Vec3::ZERO,
            direction,
            Vec3::Z * distance,
            Vec3::NEG_Z,
        )
    }
}

/// Distance at which a panel of `size` metres exactly fills `fov_degrees`.
pub fn panel_distance_for_size(fov_degrees: f32, size: f32) -> f32 {
    (size / 2.0) / (fov_degrees.to_radians() / 2.0).tan()
}

/// Intersect a ray with a plane. `None` when parallel or behind the origin.
pub fn ray_plane_intersection(
    origin: Vec3,
    direction: Vec3,
    plane_point: Vec3,
    plane_normal: Vec3,
) -> Option<Vec3> {
    if plane_normal.length_squared() < EPSILON * EPSILON
        || direction.length_squared() < EPSILON * EPSILON
    {
        return None;
    }

    let denom = plane_normal.dot(direction);
    if denom.abs() < EPSILON {
        return None;
    }

    let t = plane_normal.dot(plane_point - origin) / denom;
    if t < -EPSILON {
        return None;
    }

    Some(origin + direction * t)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::types::CameraCharacteristics;

    fn intrinsics(focal: f32) -> Intrinsics {
        Intrinsics {
            focal_length: Vec2::new(focal, focal),
            principal_point: Vec2::new(50.0, 50.0),
            resolution: Size::new(100, 100),
        }
    }

    fn device_with(chars: CameraCharacteristics) -> CameraDevice {
        CameraDevice {
            id: DeviceId::new("50"),
            name: "Left passthrough".to_string(),
            characteristics: chars,
        }
    }

    fn full_characteristics() -> CameraCharacteristics {
        CameraCharacteristics {
            source: Some(0),
            position: Some(0),
            lens_pose_translation: Some([-0.03, 0.01, 0.05]),
            lens_pose_rotation: Some([0.0, 0.0, 0.0, 1.0]),
            lens_intrinsic_calibration: Some([50.0, 50.0, 50.0, 50.0, 0.0]),
            pre_correction_active_array: Some(Size::new(100, 100)),
            output_sizes: vec![Size::new(100, 100)],
        }
    }

    fn assert_vec_eq(a: Vec3, b: Vec3) {
        assert!(a.abs_diff_eq(b, 1e-5), "{a:?} != {b:?}");
    }

    #[test]
    fn edge_rays_follow_pinhole_model() {
        let k = intrinsics(50.0);
        let left = k.screen_point_to_ray(Vec2::new(0.0, 50.0));
        let right = k.screen_point_to_ray(Vec2::new(100.0, 50.0));
        assert_vec_eq(left, Vec3::new(-1.0, 0.0, 1.0).normalize());
        assert_vec_eq(right, Vec3::new(1.0, 0.0, 1.0).normalize());
        assert!((k.horizontal_fov() - 90.0).abs() < 1e-3);
    }

    #[test]
    fn longer_focal_length_narrows_fov() {
        let k = intrinsics(100.0);
        let left = k.screen_point_to_ray(Vec2::new(0.0, 50.0));
        assert_vec_eq(left, Vec3::new(-0.5, 0.0, 1.0).normalize());

        let expected = 2.0 * 0.5f32.atan().to_degrees();
        assert!((k.horizontal_fov() - expected).abs() < 1e-3);
        // Deterministic across calls.
        assert_eq!(k.horizontal_fov(), k.horizontal_fov());
    }

    #[test]
    fn endpoint_flips_translation_z() {
        let device = device_with(full_characteristics());
        let endpoint = CameraEndpoint::from_device(&device, CameraEye::Left).unwrap();
        assert_vec_eq(endpoint.translation, Vec3::new(-0.03, 0.01, -0.05));
        assert!((endpoint.fov - 90.0).abs() < 1e-3);
        assert_eq!(endpoint.resolution(), Size::new(100, 100));
    }

    #[test]
    fn identity_lens_rotation_becomes_half_turn_about_x() {
        let device = device_with(full_characteristics());
        let endpoint = CameraEndpoint::from_device(&device, CameraEye::Left).unwrap();
        let [x, _, _, w] = endpoint.head_to_camera_pose().rotation.to_array();
        assert!(w.abs() < 1e-5);
        assert!((x.abs() - 1.0).abs() < 1e-5);
    }

    #[test]
    fn missing_calibration_is_an_error() {
        let mut chars = full_characteristics();
        chars.lens_intrinsic_calibration = None;
        let err = CameraEndpoint::from_device(&device_with(chars), CameraEye::Left).unwrap_err();
        assert!(matches!(err, CameraError::MissingIntrinsics(_)));
    }

    #[test]
    fn zero_focal_length_is_an_error() {
        let mut chars = full_characteristics();
        chars.lens_intrinsic_calibration = Some([0.0, 0.0, 50.0, 50.0, 0.0]);
        assert!(CameraEndpoint::from_device(&device_with(chars), CameraEye::Left).is_err());
    }

    #[test]
    fn centre_point_projects_straight_ahead() {
        let device = device_with(full_characteristics());
        let endpoint = CameraEndpoint::from_device(&device, CameraEye::Left).unwrap();
        let p = endpoint
            .screen_point_to_point_on_view_plane(Vec2::new(50.0, 50.0), 2.0)
            .unwrap();
        assert_vec_eq(p, Vec3::new(0.0, 0.0, 2.0));
    }

    #[test]
    fn camera_pose_maps_forward_to_head_space() {
        let device = device_with(full_characteristics());
        let endpoint = CameraEndpoint::from_device(&device, CameraEye::Left).unwrap();
        let pose = endpoint.head_to_camera_pose();
        // A half turn about x points the camera's forward axis backwards.
        assert_vec_eq(pose.rotation * Vec3::Z, Vec3::NEG_Z);
    }

    #[test]
    fn ray_parallel_to_plane_has_no_intersection() {
        let hit = ray_plane_intersection(
            Vec3::ZERO,
            Vec3::new(1.0, 0.0, 0.0),
            Vec3::new(0.0, 0.0, 1.0),
            Vec3::new(0.0, 0.0, -1.0),
        );
        assert!(hit.is_none());
    }

    #[test]
    fn panel_fills_ninety_degrees_at_half_its_width() {
        let d = panel_distance_for_size(90.0, 2.0);
        assert!((d - 1.0).abs() < 1e-5);
    }
}
