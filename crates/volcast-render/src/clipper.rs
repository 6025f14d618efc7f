use glam::{DMat4, DVec3};
use volcast_core::constants::{
    CLIP_EPSILON, NEAR_PLANE_OFFSET, NEAR_PLANE_OFFSET_DIVISOR, WINDING_EPSILON,
};
use volcast_core::math::plane_to_local;
use volcast_core::types::{Bounds, Camera, Plane};

/// Convex proxy geometry of one block: its box cut by the near plane and the
/// clip planes, split into small triangles. Local space.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ClippedHull {
    /// Outward-wound triangles.
    pub triangles: Vec<[DVec3; 3]>,
    /// Faces of the clipped polyhedron before densification.
    pub faces: usize,
    /// Box the hull was cut from.
    pub bounds: Option<Bounds>,
    /// Local-space half-spaces the box was cut by.
    pub planes: Vec<Plane>,
}

impl ClippedHull {
    /// Hull of a block that is entirely clipped away.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.triangles.is_empty()
    }

    pub fn triangle_count(&self) -> u32 {
        self.triangles.len() as u32
    }

    /// Triangles ready for submission. A mirroring transform flips every
    /// triangle so that front faces still face the camera after projection.
    pub fn oriented_triangles(&self, preserves_orientation: bool) -> Vec<[DVec3; 3]> {
        if preserves_orientation {
            self.triangles.clone()
        } else {
            self.triangles.iter().map(|&[a, b, c]| [a, c, b]).collect()
        }
    }

    /// True when `p` lies inside the box and on the kept side of every plane.
    pub fn contains_point(&self, p: DVec3) -> bool {
        let Some(bounds) = self.bounds else {
            return false;
        };
        bounds.contains_point(p) && self.planes.iter().all(|plane| plane.evaluate(p) >= -CLIP_EPSILON)
    }

    /// Parametric interval of the ray `origin + t * dir` inside the hull, if any.
    pub fn ray_interval(&self, origin: DVec3, dir: DVec3) -> Option<(f64, f64)> {
        let bounds = self.bounds?;
        let mut t0 = f64::NEG_INFINITY;
        let mut t1 = f64::INFINITY;
        for axis in 0..3 {
            let o = origin[axis];
            let d = dir[axis];
            if d.abs() < f64::EPSILON {
                if o < bounds.min[axis] || o > bounds.max[axis] {
                    return None;
                }
                continue;
            }
            let a = (bounds.min[axis] - o) / d;
            let b = (bounds.max[axis] - o) / d;
            t0 = t0.max(a.min(b));
            t1 = t1.min(a.max(b));
        }
        for plane in &self.planes {
            let denom = plane.normal.dot(dir);
            let dist = plane.evaluate(origin);
            if denom.abs() < f64::EPSILON {
                if dist < 0.0 {
                    return None;
                }
                continue;
            }
            let t = -dist / denom;
            if denom > 0.0 {
                t0 = t0.max(t);
            } else {
                t1 = t1.min(t);
            }
        }
        (t0 < t1).then_some((t0, t1))
    }
}

/// Box tessellation, convex clip and densification.
pub trait HullBuilder {
    fn build(&self, bounds: &Bounds, planes: &[Plane], densify_levels: u32) -> ClippedHull;
}

/// Clips the six box faces plane by plane, capping every cut, then splits each
/// face into a centroid fan and each fan triangle into three again per extra level.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConvexHullBuilder;

impl HullBuilder for ConvexHullBuilder {
    fn build(&self, bounds: &Bounds, planes: &[Plane], densify_levels: u32) -> ClippedHull {
        if bounds.is_degenerate() {
            return ClippedHull::empty();
        }
        let tolerance = CLIP_EPSILON * bounds.size().max_element().max(1.0);

        let mut polygons = box_faces(bounds);
        for plane in planes {
            if plane.normal == DVec3::ZERO {
                continue;
            }
            polygons = clip_polyhedron(polygons, plane, tolerance);
            if polygons.is_empty() {
                return ClippedHull::empty();
            }
        }

        let vertex_count: usize = polygons.iter().map(Vec::len).sum();
        let centroid =
            polygons.iter().flatten().copied().sum::<DVec3>() / vertex_count.max(1) as f64;
        for polygon in polygons.iter_mut() {
            wind_outward(polygon, centroid);
        }

        let mut triangles = Vec::new();
        for polygon in &polygons {
            densify(polygon, densify_levels, &mut triangles);
        }

        ClippedHull {
            triangles,
            faces: polygons.len(),
            bounds: Some(*bounds),
            planes: planes.to_vec(),
        }
    }
}

/// Camera near plane in local space, pushed slightly into the view so that
/// the cap it cuts is never itself clipped by the projection.
pub fn near_plane(camera: &Camera, model: &DMat4, inverse: &DMat4) -> Plane {
    let [near, far] = camera.clipping_range;
    let offset = if NEAR_PLANE_OFFSET >= far - near {
        (far - near) / NEAR_PLANE_OFFSET_DIVISOR
    } else {
        NEAR_PLANE_OFFSET
    };
    let direction = camera.direction();
    let world = Plane::new(camera.position + direction * (near + offset), direction);
    plane_to_local(&world, model, inverse)
}

/// Hull of `bounds` cut by the near plane and every world-space clip plane.
pub fn clip_and_densify(
    builder: &dyn HullBuilder,
    bounds: &Bounds,
    clip_planes: &[Plane],
    camera: &Camera,
    model: &DMat4,
    inverse: &DMat4,
    densify_levels: u32,
) -> ClippedHull {
    let mut planes = Vec::with_capacity(clip_planes.len() + 1);
    planes.push(near_plane(camera, model, inverse));
    planes.extend(clip_planes.iter().map(|p| plane_to_local(p, model, inverse)));
    builder.build(bounds, &planes, densify_levels)
}

fn box_faces(b: &Bounds) -> Vec<Vec<DVec3>> {
    let corner = |x: usize, y: usize, z: usize| {
        DVec3::new(
            if x == 0 { b.min.x } else { b.max.x },
            if y == 0 { b.min.y } else { b.max.y },
            if z == 0 { b.min.z } else { b.max.z },
        )
    };
    vec![
        vec![corner(0, 0, 0), corner(0, 0, 1), corner(0, 1, 1), corner(0, 1, 0)],
        vec![corner(1, 0, 0), corner(1, 1, 0), corner(1, 1, 1), corner(1, 0, 1)],
        vec![corner(0, 0, 0), corner(1, 0, 0), corner(1, 0, 1), corner(0, 0, 1)],
        vec![corner(0, 1, 0), corner(0, 1, 1), corner(1, 1, 1), corner(1, 1, 0)],
        vec![corner(0, 0, 0), corner(0, 1, 0), corner(1, 1, 0), corner(1, 0, 0)],
        vec![corner(0, 0, 1), corner(1, 0, 1), corner(1, 1, 1), corner(0, 1, 1)],
    ]
}

fn clip_polyhedron(polygons: Vec<Vec<DVec3>>, plane: &Plane, tolerance: f64) -> Vec<Vec<DVec3>> {
    let cuts = polygons
        .iter()
        .flatten()
        .any(|&v| plane.evaluate(v) < -tolerance);
    if !cuts {
        return polygons;
    }

    let mut out = Vec::with_capacity(polygons.len() + 1);
    let mut cap_points = Vec::new();
    for polygon in &polygons {
        let clipped = clip_polygon(polygon, plane, tolerance);
        cap_points.extend(
            clipped
                .iter()
                .copied()
                .filter(|&v| plane.evaluate(v).abs() <= tolerance),
        );
        if clipped.len() >= 3 {
            out.push(clipped);
        }
    }

    if let Some(cap) = cap_polygon(cap_points, plane, tolerance) {
        out.push(cap);
    }
    out
}

fn clip_polygon(polygon: &[DVec3], plane: &Plane, tolerance: f64) -> Vec<DVec3> {
    let mut out = Vec::with_capacity(polygon.len() + 1);
    for (i, &current) in polygon.iter().enumerate() {
        let next = polygon[(i + 1) % polygon.len()];
        let dc = plane.evaluate(current);
        let dn = plane.evaluate(next);
        let current_in = dc >= -tolerance;
        let next_in = dn >= -tolerance;
        if current_in {
            out.push(current);
        }
        if current_in != next_in {
            let t = dc / (dc - dn);
            out.push(current + (next - current) * t);
        }
    }
    dedup_ring(&mut out, tolerance);
    out
}

fn cap_polygon(mut points: Vec<DVec3>, plane: &Plane, tolerance: f64) -> Option<Vec<DVec3>> {
    let mut unique: Vec<DVec3> = Vec::with_capacity(points.len());
    for p in points.drain(..) {
        if !unique.iter().any(|q| q.distance(p) <= tolerance) {
            unique.push(p);
        }
    }
    if unique.len() < 3 {
        return None;
    }

    let centre = unique.iter().copied().sum::<DVec3>() / unique.len() as f64;
    let u = plane.normal.any_orthonormal_vector();
    let v = plane.normal.cross(u);
    unique.sort_by(|a, b| {
        let da = *a - centre;
        let db = *b - centre;
        da.dot(v).atan2(da.dot(u)).total_cmp(&db.dot(v).atan2(db.dot(u)))
    });
    (polygon_normal(&unique).length() > tolerance * tolerance).then_some(unique)
}

fn dedup_ring(ring: &mut Vec<DVec3>, tolerance: f64) {
    ring.dedup_by(|a, b| a.distance(*b) <= tolerance);
    while ring.len() > 1 && ring[0].distance(ring[ring.len() - 1]) <= tolerance {
        ring.pop();
    }
}

/// Newell normal; its length is twice the polygon area.
fn polygon_normal(polygon: &[DVec3]) -> DVec3 {
    let mut n = DVec3::ZERO;
    for (i, &a) in polygon.iter().enumerate() {
        let b = polygon[(i + 1) % polygon.len()];
        n += a.cross(b);
    }
    n
}

fn wind_outward(polygon: &mut [DVec3], hull_centroid: DVec3) {
    let centre = polygon.iter().copied().sum::<DVec3>() / polygon.len() as f64;
    if polygon_normal(polygon).dot(centre - hull_centroid) < -WINDING_EPSILON {
        polygon.reverse();
    }
}

fn densify(polygon: &[DVec3], levels: u32, out: &mut Vec<[DVec3; 3]>) {
    if levels == 0 {
        for i in 1..polygon.len() - 1 {
            out.push([polygon[0], polygon[i], polygon[i + 1]]);
        }
        return;
    }
    let centre = polygon.iter().copied().sum::<DVec3>() / polygon.len() as f64;
    for (i, &a) in polygon.iter().enumerate() {
        let b = polygon[(i + 1) % polygon.len()];
        split_triangle([centre, a, b], levels - 1, out);
    }
}

fn split_triangle(tri: [DVec3; 3], levels: u32, out: &mut Vec<[DVec3; 3]>) {
    if levels == 0 {
        out.push(tri);
        return;
    }
    let [a, b, c] = tri;
    let centre = (a + b + c) / 3.0;
    split_triangle([centre, a, b], levels - 1, out);
    split_triangle([centre, b, c], levels - 1, out);
    split_triangle([centre, c, a], levels - 1, out);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_bounds() -> Bounds {
        Bounds::new(DVec3::ZERO, DVec3::ONE)
    }

    fn hull_volume(hull: &ClippedHull) -> f64 {
        // Divergence theorem over outward triangles.
        hull.triangles
            .iter()
            .map(|[a, b, c]| a.dot(b.cross(*c)) / 6.0)
            .sum()
    }

    #[test]
    fn test_unclipped_box_has_six_faces() {
        let hull = ConvexHullBuilder.build(&unit_bounds(), &[], 0);
        assert_eq!(hull.faces, 6);
        assert_eq!(hull.triangle_count(), 12);
        assert!((hull_volume(&hull) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_densify_levels_multiply_triangles() {
        assert_eq!(ConvexHullBuilder.build(&unit_bounds(), &[], 1).triangle_count(), 24);
        let hull = ConvexHullBuilder.build(&unit_bounds(), &[], 2);
        assert_eq!(hull.triangle_count(), 72);
        assert!((hull_volume(&hull) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_plane_cut_adds_cap() {
        let plane = Plane::new(DVec3::splat(0.5), DVec3::new(-1.0, 0.0, 0.0));
        let hull = ConvexHullBuilder.build(&unit_bounds(), &[plane], 0);
        assert_eq!(hull.faces, 6);
        assert!((hull_volume(&hull) - 0.5).abs() < 1e-12);
        assert!(hull.contains_point(DVec3::new(0.25, 0.5, 0.5)));
        assert!(!hull.contains_point(DVec3::new(0.75, 0.5, 0.5)));
    }

    #[test]
    fn test_corner_cut_yields_seven_faces() {
        // Keeps x + y + z >= 1, removing the corner at the origin.
        let plane = Plane::new(DVec3::new(1.0, 0.0, 0.0), DVec3::ONE);
        let hull = ConvexHullBuilder.build(&unit_bounds(), &[plane], 0);
        assert_eq!(hull.faces, 7);
        assert!((hull_volume(&hull) - (1.0 - 1.0 / 6.0)).abs() < 1e-12);
    }

    #[test]
    fn test_fully_clipped_box_is_empty() {
        let plane = Plane::new(DVec3::splat(2.0), DVec3::X);
        let hull = ConvexHullBuilder.build(&unit_bounds(), &[plane], 2);
        assert!(hull.is_empty());
        assert_eq!(hull.triangle_count(), 0);
        assert!(hull.ray_interval(DVec3::new(0.5, 0.5, -1.0), DVec3::Z).is_none());
    }

    #[test]
    fn test_degenerate_bounds_are_empty() {
        let flat = Bounds::new(DVec3::ZERO, DVec3::new(1.0, 1.0, 0.0));
        assert!(ConvexHullBuilder.build(&flat, &[], 2).is_empty());
    }

    #[test]
    fn test_mirrored_orientation_flips_triangles() {
        let hull = ConvexHullBuilder.build(&unit_bounds(), &[], 0);
        let flipped = hull.oriented_triangles(false);
        assert_eq!(flipped[0][1], hull.triangles[0][2]);
        assert_eq!(flipped[0][2], hull.triangles[0][1]);
    }

    #[test]
    fn test_near_plane_offset() {
        let camera = Camera {
            position: DVec3::new(0.5, 0.5, -10.0),
            focal_point: DVec3::new(0.5, 0.5, 0.0),
            clipping_range: [1.0, 20.0],
            ..Camera::default()
        };
        let plane = near_plane(&camera, &DMat4::IDENTITY, &DMat4::IDENTITY);
        assert!((plane.origin.z - (-10.0 + 1.001)).abs() < 1e-12);
        assert_eq!(plane.normal, DVec3::Z);

        let tight = Camera {
            clipping_range: [1.0, 1.0005],
            ..camera
        };
        let plane = near_plane(&tight, &DMat4::IDENTITY, &DMat4::IDENTITY);
        assert!((plane.origin.z - (-9.0 + 0.0005 / 1000.0)).abs() < 1e-12);
    }

    #[test]
    fn test_camera_inside_box_cuts_behind_the_near_plane() {
        let camera = Camera {
            position: DVec3::new(0.5, 0.5, 0.25),
            focal_point: DVec3::new(0.5, 0.5, 1.0),
            clipping_range: [0.25, 10.0],
            ..Camera::default()
        };
        let hull = clip_and_densify(
            &ConvexHullBuilder,
            &unit_bounds(),
            &[],
            &camera,
            &DMat4::IDENTITY,
            &DMat4::IDENTITY,
            0,
        );
        assert!((hull_volume(&hull) - (1.0 - 0.501)).abs() < 1e-9);
        let (t0, t1) = hull
            .ray_interval(DVec3::new(0.5, 0.5, -1.0), DVec3::Z)
            .expect("ray crosses hull");
        assert!((t0 - 1.501).abs() < 1e-9);
        assert!((t1 - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_world_clip_plane_is_taken_to_local_space() {
        let model = DMat4::from_scale(DVec3::splat(2.0));
        let inverse = model.inverse();
        let camera = Camera {
            position: DVec3::new(1.0, 1.0, -10.0),
            focal_point: DVec3::new(1.0, 1.0, 0.0),
            ..Camera::default()
        };
        // World x <= 1 is local x <= 0.5.
        let clip = Plane::new(DVec3::new(1.0, 0.0, 0.0), DVec3::new(-1.0, 0.0, 0.0));
        let hull = clip_and_densify(
            &ConvexHullBuilder,
            &unit_bounds(),
            &[clip],
            &camera,
            &model,
            &inverse,
            1,
        );
        assert!((hull_volume(&hull) - 0.5).abs() < 1e-12);
    }
}
