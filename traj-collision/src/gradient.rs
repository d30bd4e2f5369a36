//! Contact filtering, hashing, and gradient extraction.

use std::collections::BTreeMap;

use nalgebra::DVector;
use traj_types::{
    jacobian_change_ref_point, ContactResult, ContactResultMap, ContinuousCollisionType,
    JointGroup,
};

use crate::config::CollisionCoeffData;
use crate::results::{GradientResults, GradientResultsSet, LinkGradientResults, ShapeKey};

/// Normals shorter than this are treated as degenerate.
const NORMAL_EPS: f64 = 1e-10;

/// Cantor pairing of `(shape_id, subshape_id)` into one sub-shape key.
#[must_use]
pub fn cantor_hash(shape_id: usize, subshape_id: usize) -> u64 {
    let a = shape_id as u64;
    let b = subshape_id as u64;
    (a + b) * (a + b + 1) / 2 + b
}

/// True when every link's classification pins the contact to `at`.
fn contact_only_at(contact: &ContactResult, at: ContinuousCollisionType) -> bool {
    let mut any = false;
    for cc_type in &contact.cc_type {
        match *cc_type {
            ContinuousCollisionType::None => {}
            t if t == at => any = true,
            _ => return false,
        }
    }
    any
}

/// Drop contacts that cannot contribute to the optimization.
///
/// A contact is invalid when its distance clears `margin + margin_buffer`,
/// or when it occurs entirely at a trajectory state pinned by the problem.
pub fn remove_invalid_contacts(
    contacts: &mut Vec<ContactResult>,
    margin: f64,
    margin_buffer: f64,
    var0_fixed: bool,
    var1_fixed: bool,
) {
    contacts.retain(|c| {
        if c.distance >= margin + margin_buffer {
            return false;
        }
        if var0_fixed && contact_only_at(c, ContinuousCollisionType::Time0) {
            return false;
        }
        if var1_fixed && contact_only_at(c, ContinuousCollisionType::Time1) {
            return false;
        }
        true
    });
}

/// Extract gradient data for one contact between trajectory rows `x0`/`x1`.
///
/// For each link in the active group this computes the world-frame Jacobian
/// at the contact point, re-referenced from the link origin, and projects it
/// onto the contact normal: `g = sign * n^T * J[0..3]` with `sign = -1` for
/// link A and `+1` for link B. Cast contacts receive gradients at both
/// endpoints, weighted `1 - cc_time` at `t = 0` and `cc_time` at `t = 1`.
///
/// A degenerate normal yields a zero gradient while the contact's error is
/// retained.
#[must_use]
pub fn contact_gradient(
    manip: &dyn JointGroup,
    x0: &DVector<f64>,
    x1: &DVector<f64>,
    contact: &ContactResult,
    margin: f64,
    margin_buffer: f64,
) -> GradientResults {
    let dof = manip.num_joints();
    let mut results = GradientResults {
        error: margin - contact.distance,
        error_with_buffer: margin + margin_buffer - contact.distance,
        ..GradientResults::default()
    };

    for link in 0..2 {
        if !manip.is_active_link(&contact.link_names[link]) {
            continue;
        }

        let cc_type = contact.cc_type[link];
        let cc_time = contact.cc_time[link].clamp(0.0, 1.0);
        let q = match cc_type {
            ContinuousCollisionType::Time0 | ContinuousCollisionType::None => x0.clone(),
            ContinuousCollisionType::Time1 => x1.clone(),
            ContinuousCollisionType::Between => x0 + (x1 - x0) * cc_time,
        };
        let jacobian = manip.calc_jacobian(&q, &contact.link_names[link]);
        let sign = if link == 0 { -1.0 } else { 1.0 };

        let endpoints: &[bool] = if cc_type == ContinuousCollisionType::None {
            &[false]
        } else {
            &[false, true]
        };
        for &timestep1 in endpoints {
            let link_tf = if timestep1 {
                &contact.cc_transform[link]
            } else {
                &contact.transform[link]
            };
            let ref_point = link_tf.rotation * contact.nearest_points_local[link].coords;
            let mut jac = jacobian.clone();
            jacobian_change_ref_point(&mut jac, &ref_point);

            let mut gradient = DVector::zeros(dof);
            if contact.normal.norm() > NORMAL_EPS {
                for j in 0..dof {
                    gradient[j] = sign
                        * (contact.normal.x * jac[(0, j)]
                            + contact.normal.y * jac[(1, j)]
                            + contact.normal.z * jac[(2, j)]);
                }
            }

            let scale = if cc_type == ContinuousCollisionType::None {
                1.0
            } else if timestep1 {
                cc_time
            } else {
                1.0 - cc_time
            };

            let link_results = LinkGradientResults {
                has_gradient: true,
                gradient,
                translation_vector: sign * contact.normal,
                jacobian: jac,
                scale,
                cc_type,
            };
            if timestep1 {
                results.cc_gradients[link] = link_results;
            } else {
                results.gradients[link] = link_results;
            }
        }
    }

    results
}

/// Group a contact map's gradient results by `(pair, sub-shape pair)`.
pub(crate) fn aggregate_gradient_sets(
    contacts: &ContactResultMap,
    coeff_data: &CollisionCoeffData,
    is_continuous: bool,
    mut gradient_of: impl FnMut(&ContactResult) -> GradientResults,
) -> Vec<GradientResultsSet> {
    let mut sets = Vec::new();
    for (pair, bucket) in contacts.iter() {
        let coeff = coeff_data.pair_coeff(pair);
        let mut shape_groups: BTreeMap<ShapeKey, GradientResultsSet> = BTreeMap::new();
        for contact in bucket {
            let shape_key = (
                cantor_hash(contact.shape_id[0], contact.subshape_id[0]),
                cantor_hash(contact.shape_id[1], contact.subshape_id[1]),
            );
            let set = shape_groups.entry(shape_key).or_insert_with(|| {
                let mut set = GradientResultsSet::with_capacity(bucket.len());
                set.key = pair.clone();
                set.shape_key = shape_key;
                set.coeff = coeff;
                set.is_continuous = is_continuous;
                set
            });
            set.add(gradient_of(contact));
        }
        sets.extend(shape_groups.into_values());
    }
    sets
}

/// Order gradient sets by worst buffered error when they exceed the bound.
///
/// The error key depends on which trajectory rows are free: with both free
/// the combined max is used; with one row fixed only errors attributable to
/// the free row matter.
pub(crate) fn sort_gradient_sets(
    sets: &mut [GradientResultsSet],
    fixed: [bool; 2],
    bounds_size: usize,
) {
    if sets.len() <= bounds_size {
        return;
    }
    let key: fn(&GradientResultsSet) -> f64 = match fixed {
        [false, false] => GradientResultsSet::max_error_with_buffer,
        [true, false] => GradientResultsSet::max_error_with_buffer_t1,
        _ => GradientResultsSet::max_error_with_buffer_t0,
    };
    sets.sort_by(|a, b| {
        key(b)
            .partial_cmp(&key(a))
            .unwrap_or(std::cmp::Ordering::Equal)
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cantor_hash_unique_for_small_pairs() {
        let mut seen = std::collections::HashSet::new();
        for a in 0..20 {
            for b in 0..20 {
                assert!(seen.insert(cantor_hash(a, b)));
            }
        }
        // Known value: pi(2, 3) = 0.5 * 5 * 6 + 3 = 18.
        assert_eq!(cantor_hash(2, 3), 18);
    }

    #[test]
    fn test_remove_contacts_past_buffer() {
        let mut contacts = vec![
            ContactResult {
                distance: 0.1,
                ..ContactResult::default()
            },
            ContactResult {
                distance: 0.01,
                ..ContactResult::default()
            },
        ];
        remove_invalid_contacts(&mut contacts, 0.02, 0.05, false, false);
        assert_eq!(contacts.len(), 1);
        assert!((contacts[0].distance - 0.01).abs() < 1e-12);
    }

    #[test]
    fn test_remove_contacts_at_fixed_state() {
        let mut at_t0 = ContactResult::default();
        at_t0.distance = 0.0;
        at_t0.cc_type = [
            ContinuousCollisionType::Time0,
            ContinuousCollisionType::Time0,
        ];
        let mut between = ContactResult::default();
        between.distance = 0.0;
        between.cc_type = [
            ContinuousCollisionType::Between,
            ContinuousCollisionType::Between,
        ];

        let mut contacts = vec![at_t0.clone(), between.clone()];
        remove_invalid_contacts(&mut contacts, 0.02, 0.05, true, false);
        assert_eq!(contacts.len(), 1);
        assert_eq!(
            contacts[0].cc_type[0],
            ContinuousCollisionType::Between
        );

        // The same contact survives when nothing is fixed.
        let mut contacts = vec![at_t0, between];
        remove_invalid_contacts(&mut contacts, 0.02, 0.05, false, false);
        assert_eq!(contacts.len(), 2);
    }
}
