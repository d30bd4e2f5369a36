//! Contact data model and contact-manager interfaces.
//!
//! Contact managers are the narrow seam between the optimizer and an
//! external collision checker. A discrete manager tests single poses; a
//! continuous manager tests a cast (swept) pose pair per link. Both write
//! their findings into a [`ContactResultMap`] keyed by link-name pair.

use std::collections::BTreeMap;

use nalgebra::{Isometry3, Point3, Vector3};

/// An ordered pair of link names identifying a contact pair.
///
/// Built with [`make_link_pair`] so lookups are order-insensitive.
pub type LinkPair = (String, String);

/// Build the canonical (lexicographically sorted) link pair key.
#[must_use]
pub fn make_link_pair(a: &str, b: &str) -> LinkPair {
    if a <= b {
        (a.to_owned(), b.to_owned())
    } else {
        (b.to_owned(), a.to_owned())
    }
}

/// How a contact relates to a continuous (cast) check's time span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ContinuousCollisionType {
    /// Not a continuous contact (discrete check).
    #[default]
    None,
    /// Contact occurs at the start of the cast.
    Time0,
    /// Contact occurs at the end of the cast.
    Time1,
    /// Contact occurs strictly inside the cast span.
    Between,
}

/// How many contacts the manager should report per pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ContactTestType {
    /// Stop at the first contact found.
    First,
    /// Report only the closest contact per pair.
    Closest,
    /// Report every contact found.
    #[default]
    All,
}

/// Parameters of a contact query.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ContactRequest {
    /// Which contacts to report.
    pub test_type: ContactTestType,
    /// Whether signed distances are required (not just boolean overlap).
    pub calculate_distance: bool,
}

impl Default for ContactRequest {
    fn default() -> Self {
        Self {
            test_type: ContactTestType::All,
            calculate_distance: true,
        }
    }
}

/// A single contact between two links.
///
/// Index `0`/`1` of the per-link arrays refer to link A and link B of the
/// pair. Continuous checks additionally populate the `cc_*` fields with the
/// cast-end transform and the normalized time of contact along the cast.
#[derive(Debug, Clone, PartialEq)]
pub struct ContactResult {
    /// Signed distance between the links (negative when penetrating).
    pub distance: f64,
    /// Names of the two links in contact.
    pub link_names: [String; 2],
    /// Collision shape id per link.
    pub shape_id: [usize; 2],
    /// Sub-shape id per link (mesh piece, compound child).
    pub subshape_id: [usize; 2],
    /// Closest point on each link, world frame.
    pub nearest_points: [Point3<f64>; 2],
    /// Closest point on each link, link-local frame.
    pub nearest_points_local: [Point3<f64>; 2],
    /// Link transform at the contact (t=0 transform for casts).
    pub transform: [Isometry3<f64>; 2],
    /// Link transform at the cast end (continuous checks only).
    pub cc_transform: [Isometry3<f64>; 2],
    /// Contact normal, world frame, pointing from link A into link B.
    pub normal: Vector3<f64>,
    /// Normalized time of contact along the cast, per link.
    pub cc_time: [f64; 2],
    /// Continuous-collision classification, per link.
    pub cc_type: [ContinuousCollisionType; 2],
}

impl Default for ContactResult {
    fn default() -> Self {
        Self {
            distance: f64::MAX,
            link_names: [String::new(), String::new()],
            shape_id: [0, 0],
            subshape_id: [0, 0],
            nearest_points: [Point3::origin(), Point3::origin()],
            nearest_points_local: [Point3::origin(), Point3::origin()],
            transform: [Isometry3::identity(), Isometry3::identity()],
            cc_transform: [Isometry3::identity(), Isometry3::identity()],
            normal: Vector3::zeros(),
            cc_time: [-1.0, -1.0],
            cc_type: [
                ContinuousCollisionType::None,
                ContinuousCollisionType::None,
            ],
        }
    }
}

/// Contacts grouped by link pair, iterated in a deterministic order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContactResultMap {
    pairs: BTreeMap<LinkPair, Vec<ContactResult>>,
}

impl ContactResultMap {
    /// Create an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a contact under its link-pair key.
    pub fn add(&mut self, result: ContactResult) {
        let key = make_link_pair(&result.link_names[0], &result.link_names[1]);
        self.pairs.entry(key).or_default().push(result);
    }

    /// Remove every contact while keeping allocated pair buckets.
    pub fn clear(&mut self) {
        self.pairs.clear();
    }

    /// True when no pair holds any contact.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pairs.values().all(Vec::is_empty)
    }

    /// Total number of contacts across all pairs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pairs.values().map(Vec::len).sum()
    }

    /// Iterate pairs in lexicographic key order.
    pub fn iter(&self) -> impl Iterator<Item = (&LinkPair, &Vec<ContactResult>)> {
        self.pairs.iter()
    }

    /// Apply `f` to each pair bucket; empty buckets are dropped afterwards.
    pub fn filter(&mut self, mut f: impl FnMut(&LinkPair, &mut Vec<ContactResult>)) {
        for (key, contacts) in &mut self.pairs {
            f(key, contacts);
        }
        self.pairs.retain(|_, contacts| !contacts.is_empty());
    }

    /// Merge `other` into `self`, applying `retime` to each contact first.
    pub fn merge_retimed(&mut self, other: Self, mut retime: impl FnMut(&mut ContactResult)) {
        for (key, contacts) in other.pairs {
            let bucket = self.pairs.entry(key).or_default();
            for mut contact in contacts {
                retime(&mut contact);
                bucket.push(contact);
            }
        }
    }
}

/// Contact manager testing single (discrete) poses.
pub trait DiscreteContactManager: Send {
    /// Restrict checking to the named collision objects.
    fn set_active_collision_objects(&mut self, names: &[String]);

    /// Set the distance below which contacts are reported.
    fn set_default_collision_margin(&mut self, margin: f64);

    /// Move one collision object to `tf`.
    fn set_collision_object_transform(&mut self, link: &str, tf: &Isometry3<f64>);

    /// Run the contact test, appending into `results`.
    fn contact_test(&mut self, results: &mut ContactResultMap, request: &ContactRequest);
}

/// Contact manager testing swept (cast) pose pairs.
pub trait ContinuousContactManager: Send {
    /// Restrict checking to the named collision objects.
    fn set_active_collision_objects(&mut self, names: &[String]);

    /// Set the distance below which contacts are reported.
    fn set_default_collision_margin(&mut self, margin: f64);

    /// Move one static collision object to `tf`.
    fn set_collision_object_transform(&mut self, link: &str, tf: &Isometry3<f64>);

    /// Set one object's cast span from `tf0` to `tf1`.
    fn set_collision_object_transforms(
        &mut self,
        link: &str,
        tf0: &Isometry3<f64>,
        tf1: &Isometry3<f64>,
    );

    /// Run the cast contact test, appending into `results`.
    fn contact_test(&mut self, results: &mut ContactResultMap, request: &ContactRequest);
}
