//! Sampled-state (discrete) collision evaluation between consecutive steps.

use std::sync::{Arc, Mutex};

use nalgebra::DVector;
use tracing::debug;
use traj_types::{
    interpolate, ContactResult, ContactResultMap, ContinuousCollisionType,
    DiscreteContactManager, Environment, JointGroup, TransformMap,
};

use crate::cache::{collision_hash, CollisionCache};
use crate::config::CollisionConfig;
use crate::continuous::{environment_only_links, lock_ignore_poison, next_epoch};
use crate::gradient::{
    aggregate_gradient_sets, contact_gradient, remove_invalid_contacts, sort_gradient_sets,
};
use crate::results::CollisionCacheData;
use crate::CollisionEvaluator;

/// Stamp a sampled contact with its normalized position along the span.
fn retime_sampled_contact(contact: &mut ContactResult, state: usize, last_state: usize) {
    let time = state as f64 / last_state as f64;
    let cc_type = if state == 0 {
        ContinuousCollisionType::Time0
    } else if state == last_state {
        ContinuousCollisionType::Time1
    } else {
        ContinuousCollisionType::Between
    };
    for link in 0..2 {
        contact.cc_time[link] = time;
        contact.cc_type[link] = cc_type;
        // No cast span: the end-of-span transform is the sampled transform.
        contact.cc_transform[link] = contact.transform[link];
    }
}

/// Discrete longest-valid-segment collision evaluator.
///
/// Samples `max(2, ceil(d / L) + 1)` states along the joint-space line
/// between two trajectory rows and runs a discrete contact test at each.
pub struct LvsDiscreteCollisionEvaluator {
    manip: Arc<dyn JointGroup>,
    env: Arc<dyn Environment>,
    config: CollisionConfig,
    cache: Arc<Mutex<CollisionCache>>,
    manager: Mutex<Box<dyn DiscreteContactManager>>,
    manip_active_links: Vec<String>,
    env_only_links: Vec<String>,
    dynamic_environment: bool,
    epoch: u64,
}

impl LvsDiscreteCollisionEvaluator {
    /// Create an evaluator over the given kinematic group and environment.
    #[must_use]
    pub fn new(
        manip: Arc<dyn JointGroup>,
        env: Arc<dyn Environment>,
        config: CollisionConfig,
        cache: Arc<Mutex<CollisionCache>>,
        dynamic_environment: bool,
    ) -> Self {
        let manip_active_links = manip.active_link_names().to_vec();
        let env_only_links = if dynamic_environment {
            environment_only_links(&manip_active_links, &env.active_link_names())
        } else {
            Vec::new()
        };

        let mut manager = env.discrete_contact_manager();
        manager.set_active_collision_objects(&manip_active_links);
        manager.set_default_collision_margin(config.margin + config.margin_buffer);

        Self {
            manip,
            env,
            config,
            cache,
            manager: Mutex::new(manager),
            manip_active_links,
            env_only_links,
            dynamic_environment,
            epoch: next_epoch(),
        }
    }

    fn state_at(&self, q: &DVector<f64>) -> TransformMap {
        if self.dynamic_environment {
            self.env.state(self.manip.joint_names(), q)
        } else {
            self.manip.calc_fwd_kin(q)
        }
    }

    fn calc_collisions(
        &self,
        x0: &DVector<f64>,
        x1: &DVector<f64>,
        fixed: [bool; 2],
        out: &mut ContactResultMap,
    ) {
        let mut manager = lock_ignore_poison(&self.manager);

        if !self.env_only_links.is_empty() {
            let state = self.state_at(x0);
            for link in &self.env_only_links {
                if let Some(tf) = state.get(link) {
                    manager.set_collision_object_transform(link, tf);
                }
            }
        }

        let dist = (x1 - x0).norm();
        let lvs = self.config.longest_valid_segment_length;
        let n = if dist > lvs {
            (dist / lvs).ceil() as usize + 1
        } else {
            2
        };
        let subtraj = interpolate(x0, x1, n);
        let last_state = n - 1;

        for i in 0..n {
            let s: DVector<f64> = subtraj.row(i).transpose();
            let state = self.state_at(&s);
            for link in &self.manip_active_links {
                if let Some(tf) = state.get(link) {
                    manager.set_collision_object_transform(link, tf);
                }
            }
            let mut contacts = ContactResultMap::new();
            manager.contact_test(&mut contacts, &self.config.contact_request);
            if contacts.is_empty() {
                continue;
            }

            let config = &self.config;
            contacts.filter(|pair, bucket| {
                if config.coeff_data.has_zero_coeff(pair) {
                    bucket.clear();
                    return;
                }
                for contact in bucket.iter_mut() {
                    retime_sampled_contact(contact, i, last_state);
                }
                remove_invalid_contacts(
                    bucket,
                    config.margin,
                    config.margin_buffer,
                    fixed[0],
                    fixed[1],
                );
            });
            out.merge_retimed(contacts, |_| {});
        }
    }
}

impl CollisionEvaluator for LvsDiscreteCollisionEvaluator {
    fn calc_collision_data(
        &self,
        x0: &DVector<f64>,
        x1: &DVector<f64>,
        fixed: [bool; 2],
        bounds_size: usize,
    ) -> Arc<CollisionCacheData> {
        let key = collision_hash(self.epoch, x0, x1);
        if let Some(hit) = lock_ignore_poison(&self.cache).get(key) {
            debug!(key, "discrete collision cache hit");
            return hit;
        }

        let mut contact_map = ContactResultMap::new();
        self.calc_collisions(x0, x1, fixed, &mut contact_map);

        // The flag is read by a downstream constraint selector; discrete
        // data is tagged continuous to match the selector's expectation.
        let mut sets = aggregate_gradient_sets(
            &contact_map,
            &self.config.coeff_data,
            true,
            |contact| {
                contact_gradient(
                    self.manip.as_ref(),
                    x0,
                    x1,
                    contact,
                    self.config.margin,
                    self.config.margin_buffer,
                )
            },
        );
        sort_gradient_sets(&mut sets, fixed, bounds_size);

        let data = Arc::new(CollisionCacheData {
            contact_results_map: contact_map,
            gradient_results_sets: sets,
        });
        lock_ignore_poison(&self.cache).put(key, Arc::clone(&data));
        data
    }

    fn config(&self) -> &CollisionConfig {
        &self.config
    }
}
