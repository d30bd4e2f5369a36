//! Analytic contact checking for simple shapes.

use hashbrown::HashMap;
use nalgebra::{Isometry3, Point3, Vector3};
use traj_types::{
    ContactRequest, ContactResult, ContactResultMap, ContactTestType, ContinuousCollisionType,
    ContinuousContactManager, DiscreteContactManager,
};

/// Collision geometry supported by the fixtures.
#[derive(Debug, Clone, PartialEq)]
pub enum Shape {
    /// An axis-aligned box; valid only for bodies that never rotate.
    AxisAlignedBox {
        /// Half extents along X, Y, Z.
        half_extents: Vector3<f64>,
    },
    /// A sphere, faithful under any rotation.
    Sphere {
        /// Sphere radius.
        radius: f64,
    },
}

impl Shape {
    /// Box from full extents.
    pub fn box_shape(x: f64, y: f64, z: f64) -> Self {
        Self::AxisAlignedBox {
            half_extents: Vector3::new(x / 2.0, y / 2.0, z / 2.0),
        }
    }

    /// Sphere from radius.
    pub fn sphere(radius: f64) -> Self {
        Self::Sphere { radius }
    }
}

struct Distance {
    distance: f64,
    point_a: Point3<f64>,
    point_b: Point3<f64>,
    /// Direction from shape A into shape B.
    normal: Vector3<f64>,
}

fn sphere_sphere(ca: Vector3<f64>, ra: f64, cb: Vector3<f64>, rb: f64) -> Distance {
    let d = cb - ca;
    let len = d.norm();
    let normal = if len > 1e-12 { d / len } else { Vector3::x() };
    Distance {
        distance: len - ra - rb,
        point_a: Point3::from(ca + normal * ra),
        point_b: Point3::from(cb - normal * rb),
        normal,
    }
}

fn sphere_box(ca: Vector3<f64>, ra: f64, cb: Vector3<f64>, hb: Vector3<f64>) -> Distance {
    let mut q = ca;
    for i in 0..3 {
        q[i] = ca[i].clamp(cb[i] - hb[i], cb[i] + hb[i]);
    }
    let delta = q - ca;
    let len = delta.norm();
    if len > 1e-12 {
        // Sphere center outside the box.
        let normal = delta / len;
        Distance {
            distance: len - ra,
            point_a: Point3::from(ca + normal * ra),
            point_b: Point3::from(q),
            normal,
        }
    } else {
        // Center inside: exit through the nearest face.
        let mut best_axis = 0;
        let mut best_depth = f64::INFINITY;
        for i in 0..3 {
            let depth = hb[i] - (ca[i] - cb[i]).abs();
            if depth < best_depth {
                best_depth = depth;
                best_axis = i;
            }
        }
        let side = if ca[best_axis] >= cb[best_axis] { 1.0 } else { -1.0 };
        let mut face = ca;
        face[best_axis] = cb[best_axis] + side * hb[best_axis];
        let mut normal = Vector3::zeros();
        normal[best_axis] = -side;
        Distance {
            distance: -best_depth - ra,
            point_a: Point3::from(ca - normal * ra),
            point_b: Point3::from(face),
            normal,
        }
    }
}

fn box_box(ca: Vector3<f64>, ha: Vector3<f64>, cb: Vector3<f64>, hb: Vector3<f64>) -> Distance {
    let d = cb - ca;
    let mut gaps = Vector3::zeros();
    let mut separated = false;
    for i in 0..3 {
        gaps[i] = d[i].abs() - (ha[i] + hb[i]);
        if gaps[i] > 0.0 {
            separated = true;
        }
    }

    // Midpoint of the per-axis interval overlap, used for witness points on
    // non-separating axes.
    let mid = |i: usize| -> f64 {
        let low = (ca[i] - ha[i]).max(cb[i] - hb[i]);
        let high = (ca[i] + ha[i]).min(cb[i] + hb[i]);
        (low + high) / 2.0
    };

    if separated {
        let mut positive = Vector3::zeros();
        for i in 0..3 {
            if gaps[i] > 0.0 {
                positive[i] = d[i].signum() * gaps[i];
            }
        }
        let distance = positive.norm();
        let normal = positive / distance;
        let mut pa = Point3::origin();
        let mut pb = Point3::origin();
        for i in 0..3 {
            if gaps[i] > 0.0 {
                pa[i] = ca[i] + d[i].signum() * ha[i];
                pb[i] = cb[i] - d[i].signum() * hb[i];
            } else {
                pa[i] = mid(i);
                pb[i] = mid(i);
            }
        }
        Distance {
            distance,
            point_a: pa,
            point_b: pb,
            normal,
        }
    } else {
        let mut best_axis = 0;
        for i in 1..3 {
            if gaps[i] > gaps[best_axis] {
                best_axis = i;
            }
        }
        let side = if d[best_axis] >= 0.0 { 1.0 } else { -1.0 };
        let mut normal = Vector3::zeros();
        normal[best_axis] = side;
        let mut pa = Point3::origin();
        let mut pb = Point3::origin();
        for i in 0..3 {
            if i == best_axis {
                pa[i] = ca[i] + side * ha[i];
                pb[i] = cb[i] - side * hb[i];
            } else {
                pa[i] = mid(i);
                pb[i] = mid(i);
            }
        }
        Distance {
            distance: gaps[best_axis],
            point_a: pa,
            point_b: pb,
            normal,
        }
    }
}

fn shape_distance(
    a: &Shape,
    ta: &Isometry3<f64>,
    b: &Shape,
    tb: &Isometry3<f64>,
) -> Distance {
    let ca = ta.translation.vector;
    let cb = tb.translation.vector;
    match (a, b) {
        (Shape::Sphere { radius: ra }, Shape::Sphere { radius: rb }) => {
            sphere_sphere(ca, *ra, cb, *rb)
        }
        (Shape::Sphere { radius: ra }, Shape::AxisAlignedBox { half_extents: hb }) => {
            sphere_box(ca, *ra, cb, *hb)
        }
        (Shape::AxisAlignedBox { half_extents: ha }, Shape::Sphere { radius: rb }) => {
            let flipped = sphere_box(cb, *rb, ca, *ha);
            Distance {
                distance: flipped.distance,
                point_a: flipped.point_b,
                point_b: flipped.point_a,
                normal: -flipped.normal,
            }
        }
        (
            Shape::AxisAlignedBox { half_extents: ha },
            Shape::AxisAlignedBox { half_extents: hb },
        ) => box_box(ca, *ha, cb, *hb),
    }
}

fn lerp_isometry(t0: &Isometry3<f64>, t1: &Isometry3<f64>, alpha: f64) -> Isometry3<f64> {
    let translation = t0.translation.vector * (1.0 - alpha) + t1.translation.vector * alpha;
    let rotation = t0.rotation.slerp(&t1.rotation, alpha);
    Isometry3::from_parts(translation.into(), rotation)
}

/// Analytic contact manager over named shapes.
///
/// Active objects are tested against every non-active object (no
/// self-collision pairs); continuous queries sample the cast uniformly and
/// keep the deepest sample. Implements both the discrete and continuous
/// manager interfaces.
pub struct FixtureContactManager {
    objects: Vec<(String, Shape)>,
    transforms: HashMap<String, (Isometry3<f64>, Isometry3<f64>)>,
    active: Vec<String>,
    margin: f64,
    cast_samples: usize,
}

impl FixtureContactManager {
    /// Create a manager over the given objects, all at the identity pose.
    pub fn new(objects: Vec<(String, Shape)>) -> Self {
        let transforms = objects
            .iter()
            .map(|(name, _)| (name.clone(), (Isometry3::identity(), Isometry3::identity())))
            .collect();
        Self {
            objects,
            transforms,
            active: Vec::new(),
            margin: 0.0,
            cast_samples: 11,
        }
    }

    /// Place a static object.
    pub fn set_static_transform(&mut self, name: &str, tf: Isometry3<f64>) {
        self.transforms
            .insert(name.to_owned(), (tf, tf));
    }

    fn shape_id(&self, name: &str) -> usize {
        self.objects
            .iter()
            .position(|(n, _)| n == name)
            .unwrap_or(usize::MAX)
    }

    fn is_active(&self, name: &str) -> bool {
        self.active.iter().any(|a| a == name)
    }

    fn pair_contact(
        &self,
        name_a: &str,
        shape_a: &Shape,
        name_b: &str,
        shape_b: &Shape,
        continuous: bool,
    ) -> Option<ContactResult> {
        let (a0, a1) = *self.transforms.get(name_a)?;
        let (b0, b1) = *self.transforms.get(name_b)?;

        let samples = if continuous { self.cast_samples } else { 1 };
        let mut best: Option<(usize, Distance, Isometry3<f64>, Isometry3<f64>)> = None;
        for k in 0..samples {
            let alpha = if samples == 1 {
                0.0
            } else {
                k as f64 / (samples - 1) as f64
            };
            let ta = lerp_isometry(&a0, &a1, alpha);
            let tb = lerp_isometry(&b0, &b1, alpha);
            let dist = shape_distance(shape_a, &ta, shape_b, &tb);
            let better = best
                .as_ref()
                .map_or(true, |(_, d, _, _)| dist.distance < d.distance);
            if better {
                best = Some((k, dist, ta, tb));
            }
        }
        let (k, dist, ta, tb) = best?;
        if dist.distance >= self.margin {
            return None;
        }

        let alpha = if samples == 1 {
            -1.0
        } else {
            k as f64 / (samples - 1) as f64
        };
        let cc_type_a = if !continuous {
            ContinuousCollisionType::None
        } else if k == 0 {
            ContinuousCollisionType::Time0
        } else if k == samples - 1 {
            ContinuousCollisionType::Time1
        } else {
            ContinuousCollisionType::Between
        };

        Some(ContactResult {
            distance: dist.distance,
            link_names: [name_a.to_owned(), name_b.to_owned()],
            shape_id: [self.shape_id(name_a), self.shape_id(name_b)],
            subshape_id: [0, 0],
            nearest_points: [dist.point_a, dist.point_b],
            nearest_points_local: [
                ta.inverse_transform_point(&dist.point_a),
                tb.inverse_transform_point(&dist.point_b),
            ],
            transform: [a0, b0],
            cc_transform: [a1, b1],
            normal: dist.normal,
            cc_time: [alpha, -1.0],
            cc_type: [cc_type_a, ContinuousCollisionType::None],
        })
    }

    fn test_pairs(&self, results: &mut ContactResultMap, request: &ContactRequest, continuous: bool) {
        for (name_a, shape_a) in &self.objects {
            if !self.is_active(name_a) {
                continue;
            }
            for (name_b, shape_b) in &self.objects {
                if name_a == name_b || self.is_active(name_b) {
                    continue;
                }
                if let Some(contact) =
                    self.pair_contact(name_a, shape_a, name_b, shape_b, continuous)
                {
                    results.add(contact);
                    if request.test_type == ContactTestType::First {
                        return;
                    }
                }
            }
        }
    }
}

impl DiscreteContactManager for FixtureContactManager {
    fn set_active_collision_objects(&mut self, names: &[String]) {
        self.active = names.to_vec();
    }

    fn set_default_collision_margin(&mut self, margin: f64) {
        self.margin = margin;
    }

    fn set_collision_object_transform(&mut self, link: &str, tf: &Isometry3<f64>) {
        self.transforms.insert(link.to_owned(), (*tf, *tf));
    }

    fn contact_test(&mut self, results: &mut ContactResultMap, request: &ContactRequest) {
        self.test_pairs(results, request, false);
    }
}

impl ContinuousContactManager for FixtureContactManager {
    fn set_active_collision_objects(&mut self, names: &[String]) {
        self.active = names.to_vec();
    }

    fn set_default_collision_margin(&mut self, margin: f64) {
        self.margin = margin;
    }

    fn set_collision_object_transform(&mut self, link: &str, tf: &Isometry3<f64>) {
        self.transforms.insert(link.to_owned(), (*tf, *tf));
    }

    fn set_collision_object_transforms(
        &mut self,
        link: &str,
        tf0: &Isometry3<f64>,
        tf1: &Isometry3<f64>,
    ) {
        self.transforms.insert(link.to_owned(), (*tf0, *tf1));
    }

    fn contact_test(&mut self, results: &mut ContactResultMap, request: &ContactRequest) {
        self.test_pairs(results, request, true);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Translation3;
    use nalgebra::UnitQuaternion;

    fn at(x: f64, y: f64, z: f64) -> Isometry3<f64> {
        Isometry3::from_parts(Translation3::new(x, y, z), UnitQuaternion::identity())
    }

    #[test]
    fn test_sphere_sphere_distance() {
        let a = Shape::sphere(0.5);
        let b = Shape::sphere(0.25);
        let d = shape_distance(&a, &at(0.0, 0.0, 0.0), &b, &at(2.0, 0.0, 0.0));
        assert_relative_eq!(d.distance, 1.25, epsilon = 1e-12);
        assert_relative_eq!(d.normal.x, 1.0, epsilon = 1e-12);
        assert_relative_eq!(d.point_a.x, 0.5, epsilon = 1e-12);
        assert_relative_eq!(d.point_b.x, 1.75, epsilon = 1e-12);
    }

    #[test]
    fn test_box_box_penetration() {
        let a = Shape::box_shape(1.0, 1.0, 1.0);
        let b = Shape::box_shape(1.0, 1.0, 1.0);
        let d = shape_distance(&a, &at(0.0, 0.0, 0.0), &b, &at(0.8, 0.0, 0.0));
        // Overlap of 0.2 along X.
        assert_relative_eq!(d.distance, -0.2, epsilon = 1e-12);
        assert_relative_eq!(d.normal.x, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_box_box_separation_is_euclidean() {
        let a = Shape::box_shape(2.0, 2.0, 2.0);
        let b = Shape::box_shape(2.0, 2.0, 2.0);
        let d = shape_distance(&a, &at(0.0, 0.0, 0.0), &b, &at(5.0, 5.0, 0.0));
        // Gaps of 3 on X and Y.
        assert_relative_eq!(d.distance, (18.0_f64).sqrt(), epsilon = 1e-12);
    }

    #[test]
    fn test_cast_catches_midpoint_sweep() {
        // A sphere sweeping across a box: endpoints clear, middle collides.
        let mut manager = FixtureContactManager::new(vec![
            ("ball".to_owned(), Shape::sphere(0.1)),
            ("wall".to_owned(), Shape::box_shape(0.5, 4.0, 4.0)),
        ]);
        ContinuousContactManager::set_active_collision_objects(
            &mut manager,
            &["ball".to_owned()],
        );
        ContinuousContactManager::set_default_collision_margin(&mut manager, 0.05);
        manager.set_static_transform("wall", at(0.0, 0.0, 0.0));
        manager.set_collision_object_transforms("ball", &at(-2.0, 0.0, 0.0), &at(2.0, 0.0, 0.0));

        let mut results = ContactResultMap::new();
        ContinuousContactManager::contact_test(
            &mut manager,
            &mut results,
            &ContactRequest::default(),
        );

        assert_eq!(results.len(), 1);
        let (_, contacts) = results.iter().next().unwrap();
        assert!(contacts[0].distance < 0.0);
        assert_eq!(contacts[0].cc_type[0], ContinuousCollisionType::Between);
    }

    #[test]
    fn test_discrete_misses_what_cast_catches() {
        let mut manager = FixtureContactManager::new(vec![
            ("ball".to_owned(), Shape::sphere(0.1)),
            ("wall".to_owned(), Shape::box_shape(0.5, 4.0, 4.0)),
        ]);
        DiscreteContactManager::set_active_collision_objects(&mut manager, &["ball".to_owned()]);
        DiscreteContactManager::set_default_collision_margin(&mut manager, 0.05);
        manager.set_static_transform("wall", at(0.0, 0.0, 0.0));
        DiscreteContactManager::set_collision_object_transform(
            &mut manager,
            "ball",
            &at(-2.0, 0.0, 0.0),
        );

        let mut results = ContactResultMap::new();
        DiscreteContactManager::contact_test(
            &mut manager,
            &mut results,
            &ContactRequest::default(),
        );
        assert!(results.is_empty());
    }
}
