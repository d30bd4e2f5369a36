//! Swept-volume (cast) collision evaluation between consecutive steps.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use nalgebra::DVector;
use tracing::debug;
use traj_types::{
    interpolate, ContactResult, ContactResultMap, ContinuousCollisionType,
    ContinuousContactManager, Environment, JointGroup, TransformMap,
};

use crate::cache::{collision_hash, CollisionCache};
use crate::config::CollisionConfig;
use crate::gradient::{
    aggregate_gradient_sets, contact_gradient, remove_invalid_contacts, sort_gradient_sets,
};
use crate::results::CollisionCacheData;
use crate::CollisionEvaluator;

/// Monotonic id distinguishing evaluator instances in cache keys.
static EVALUATOR_EPOCH: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_epoch() -> u64 {
    EVALUATOR_EPOCH.fetch_add(1, Ordering::Relaxed)
}

pub(crate) fn lock_ignore_poison<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Links movable by the environment but not by the kinematic group.
pub(crate) fn environment_only_links(
    manip_links: &[String],
    env_links: &[String],
) -> Vec<String> {
    let mut diff: Vec<String> = env_links
        .iter()
        .filter(|l| !manip_links.contains(l))
        .cloned()
        .collect();
    diff.sort();
    diff
}

/// Map a contact's segment-local time onto the whole `[0, 1]` span.
fn retime_cast_contact(contact: &mut ContactResult, segment: usize, last_state: usize) {
    let dt = 1.0 / last_state as f64;
    for link in 0..2 {
        let local = match contact.cc_type[link] {
            ContinuousCollisionType::None => continue,
            ContinuousCollisionType::Time0 => 0.0,
            ContinuousCollisionType::Time1 => 1.0,
            ContinuousCollisionType::Between => contact.cc_time[link].clamp(0.0, 1.0),
        };
        let global = (segment as f64 + local) * dt;
        contact.cc_time[link] = global;
        contact.cc_type[link] = if global <= 0.0 {
            ContinuousCollisionType::Time0
        } else if global >= 1.0 - 1e-12 {
            ContinuousCollisionType::Time1
        } else {
            ContinuousCollisionType::Between
        };
    }
}

/// Continuous (cast) longest-valid-segment collision evaluator.
///
/// Between two trajectory rows the joint-space line is subdivided so no
/// sub-segment exceeds the configured longest valid segment length; each
/// sub-segment is checked with cast transforms `(FK(s_i), FK(s_{i+1}))`.
pub struct LvsContinuousCollisionEvaluator {
    manip: Arc<dyn JointGroup>,
    env: Arc<dyn Environment>,
    config: CollisionConfig,
    cache: Arc<Mutex<CollisionCache>>,
    manager: Mutex<Box<dyn ContinuousContactManager>>,
    manip_active_links: Vec<String>,
    env_only_links: Vec<String>,
    dynamic_environment: bool,
    epoch: u64,
}

impl LvsContinuousCollisionEvaluator {
    /// Create an evaluator over the given kinematic group and environment.
    ///
    /// With `dynamic_environment` set, links movable by the environment but
    /// outside the group have their transforms refreshed from the
    /// environment at each query's `x0`.
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

        let mut manager = env.continuous_contact_manager();
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

    fn filter_segment(
        &self,
        contacts: &mut ContactResultMap,
        segment: usize,
        last_state: usize,
        fixed: [bool; 2],
    ) {
        let config = &self.config;
        contacts.filter(|pair, bucket| {
            if config.coeff_data.has_zero_coeff(pair) {
                bucket.clear();
                return;
            }
            for contact in bucket.iter_mut() {
                retime_cast_contact(contact, segment, last_state);
            }
            remove_invalid_contacts(
                bucket,
                config.margin,
                config.margin_buffer,
                fixed[0],
                fixed[1],
            );
        });
    }

    fn calc_collisions(
        &self,
        x0: &DVector<f64>,
        x1: &DVector<f64>,
        fixed: [bool; 2],
        out: &mut ContactResultMap,
    ) {
        let mut manager = lock_ignore_poison(&self.manager);

        // Dynamic environment: stage obstacle transforms at the start state.
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
        if dist > lvs {
            let n = (dist / lvs).ceil() as usize + 1;
            let subtraj = interpolate(x0, x1, n);
            let last_state = n - 1;
            for i in 0..last_state {
                let s0: DVector<f64> = subtraj.row(i).transpose();
                let s1: DVector<f64> = subtraj.row(i + 1).transpose();
                let state0 = self.state_at(&s0);
                let state1 = self.state_at(&s1);
                for link in &self.manip_active_links {
                    if let (Some(tf0), Some(tf1)) = (state0.get(link), state1.get(link)) {
                        manager.set_collision_object_transforms(link, tf0, tf1);
                    }
                }
                let mut contacts = ContactResultMap::new();
                manager.contact_test(&mut contacts, &self.config.contact_request);
                if !contacts.is_empty() {
                    self.filter_segment(&mut contacts, i, last_state, fixed);
                    out.merge_retimed(contacts, |_| {});
                }
            }
        } else {
            let state0 = self.state_at(x0);
            let state1 = self.state_at(x1);
            for link in &self.manip_active_links {
                if let (Some(tf0), Some(tf1)) = (state0.get(link), state1.get(link)) {
                    manager.set_collision_object_transforms(link, tf0, tf1);
                }
            }
            let mut contacts = ContactResultMap::new();
            manager.contact_test(&mut contacts, &self.config.contact_request);
            if !contacts.is_empty() {
                self.filter_segment(&mut contacts, 0, 1, fixed);
                out.merge_retimed(contacts, |_| {});
            }
        }
    }
}

impl CollisionEvaluator for LvsContinuousCollisionEvaluator {
    fn calc_collision_data(
        &self,
        x0: &DVector<f64>,
        x1: &DVector<f64>,
        fixed: [bool; 2],
        bounds_size: usize,
    ) -> Arc<CollisionCacheData> {
        let key = collision_hash(self.epoch, x0, x1);
        if let Some(hit) = lock_ignore_poison(&self.cache).get(key) {
            debug!(key, "continuous collision cache hit");
            return hit;
        }

        let mut contact_map = ContactResultMap::new();
        self.calc_collisions(x0, x1, fixed, &mut contact_map);

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
