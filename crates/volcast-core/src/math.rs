use glam::{DMat4, DVec3};

use crate::types::{Camera, Plane};

/// Map a world-space plane into the local frame of `model` (local -> world).
/// The normal goes through the transpose of the linear part.
pub fn plane_to_local(plane: &Plane, model: &DMat4, inverse: &DMat4) -> Plane {
    Plane::new(
        inverse.transform_point3(plane.origin),
        model.transpose().transform_vector3(plane.normal),
    )
}

/// True when `model` keeps right-handed frames right-handed.
pub fn preserves_orientation(model: &DMat4) -> bool {
    model.determinant() >= 0.0
}

/// Length of each basis column of the linear part of `model`.
pub fn column_scales(model: &DMat4) -> DVec3 {
    DVec3::new(
        model.x_axis.truncate().length(),
        model.y_axis.truncate().length(),
        model.z_axis.truncate().length(),
    )
}

/// Smallest world-space voxel edge of a grid with `spacing` placed by `model`.
pub fn min_world_spacing(spacing: DVec3, model: &DMat4) -> f64 {
    (spacing * column_scales(model)).min_element()
}

/// Camera position and direction expressed in the frame of `inverse` (world -> local).
pub fn camera_to_local(camera: &Camera, inverse: &DMat4) -> (DVec3, DVec3) {
    let position = inverse.transform_point3(camera.position);
    let focal = inverse.transform_point3(camera.focal_point);
    (position, (focal - position).normalize_or_zero())
}

/// Right-handed view basis `(right, up, forward)` of a camera.
pub fn view_basis(camera: &Camera) -> (DVec3, DVec3, DVec3) {
    let forward = camera.direction();
    let right = forward.cross(camera.view_up).normalize_or_zero();
    let up = right.cross(forward);
    (right, up, forward)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plane_to_local_under_scale() {
        let model = DMat4::from_scale(DVec3::new(2.0, 1.0, 1.0));
        let inverse = model.inverse();
        let world = Plane::new(DVec3::new(4.0, 0.0, 0.0), DVec3::X);
        let local = plane_to_local(&world, &model, &inverse);
        assert!((local.origin.x - 2.0).abs() < 1e-12);
        // The point local x = 3 maps to world x = 6, on the kept side.
        assert!(local.evaluate(DVec3::new(3.0, 0.0, 0.0)) > 0.0);
        assert!(local.evaluate(DVec3::new(1.0, 0.0, 0.0)) < 0.0);
    }

    #[test]
    fn test_mirror_does_not_preserve_orientation() {
        assert!(preserves_orientation(&DMat4::IDENTITY));
        let mirror = DMat4::from_scale(DVec3::new(-1.0, 1.0, 1.0));
        assert!(!preserves_orientation(&mirror));
    }

    #[test]
    fn test_min_world_spacing() {
        let model = DMat4::from_scale(DVec3::new(3.0, 0.5, 1.0));
        let s = min_world_spacing(DVec3::new(1.0, 2.0, 4.0), &model);
        assert!((s - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_view_basis_is_orthonormal() {
        let camera = Camera {
            position: DVec3::new(0.0, 0.0, -10.0),
            focal_point: DVec3::ZERO,
            ..Camera::default()
        };
        let (right, up, forward) = view_basis(&camera);
        assert!((forward - DVec3::Z).length() < 1e-12);
        assert!(right.dot(up).abs() < 1e-12);
        assert!((up - DVec3::Y).length() < 1e-12);
    }
}
