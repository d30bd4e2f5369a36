//! The process-wide term registry.
//!
//! Terms are keyed by their `type` string. The registry is created on first
//! use, pre-populated with the standard catalog, and never destroyed;
//! registration normally happens before any solving starts, so the lock is
//! read-mostly.

use std::collections::HashMap;
use std::sync::{OnceLock, RwLock, RwLockReadGuard, RwLockWriteGuard};

use traj_types::ConfigError;

use crate::info::TermInfo;

/// Builds a term info from its JSON parameters.
pub type TermFactory = fn(&serde_json::Value) -> Result<Box<dyn TermInfo>, ConfigError>;

static REGISTRY: OnceLock<RwLock<HashMap<String, TermFactory>>> = OnceLock::new();

fn deserialize_term<T>(value: &serde_json::Value) -> Result<Box<dyn TermInfo>, ConfigError>
where
    T: TermInfo + serde::de::DeserializeOwned + 'static,
{
    let info: T = serde_json::from_value(value.clone())
        .map_err(|e| ConfigError::invalid(format!("malformed term parameters: {e}")))?;
    Ok(Box::new(info))
}

fn standard_catalog() -> HashMap<String, TermFactory> {
    let mut map: HashMap<String, TermFactory> = HashMap::new();
    map.insert(
        "joint_pos".to_owned(),
        deserialize_term::<crate::joint_terms::JointPosTermInfo>,
    );
    map.insert(
        "joint_vel".to_owned(),
        deserialize_term::<crate::joint_terms::JointVelTermInfo>,
    );
    map.insert(
        "joint_acc".to_owned(),
        deserialize_term::<crate::joint_terms::JointAccTermInfo>,
    );
    map.insert(
        "joint_jerk".to_owned(),
        deserialize_term::<crate::joint_terms::JointJerkTermInfo>,
    );
    map.insert(
        "cart_pose".to_owned(),
        deserialize_term::<crate::cart_terms::CartPoseTermInfo>,
    );
    map.insert(
        "dyn_cart_pose".to_owned(),
        deserialize_term::<crate::cart_terms::DynamicCartPoseTermInfo>,
    );
    map.insert(
        "cart_vel".to_owned(),
        deserialize_term::<crate::cart_terms::CartVelTermInfo>,
    );
    map.insert(
        "total_time".to_owned(),
        deserialize_term::<crate::misc_terms::TotalTimeTermInfo>,
    );
    map.insert(
        "avoid_singularity".to_owned(),
        deserialize_term::<crate::misc_terms::AvoidSingularityTermInfo>,
    );
    map.insert(
        "collision".to_owned(),
        deserialize_term::<crate::collision_term::CollisionTermInfo>,
    );
    map
}

fn read_registry() -> RwLockReadGuard<'static, HashMap<String, TermFactory>> {
    registry()
        .read()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn write_registry() -> RwLockWriteGuard<'static, HashMap<String, TermFactory>> {
    registry()
        .write()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn registry() -> &'static RwLock<HashMap<String, TermFactory>> {
    REGISTRY.get_or_init(|| RwLock::new(standard_catalog()))
}

/// Register (or replace) a term type.
pub fn register_term(type_name: &str, factory: TermFactory) {
    write_registry().insert(type_name.to_owned(), factory);
}

/// Build a term info from its type string and JSON parameters.
pub fn term_from_config(
    type_name: &str,
    params: &serde_json::Value,
) -> Result<Box<dyn TermInfo>, ConfigError> {
    let factory = *read_registry()
        .get(type_name)
        .ok_or_else(|| ConfigError::UnknownTermType(type_name.to_owned()))?;
    factory(params)
}

/// Names of every registered term type, sorted.
#[must_use]
pub fn registered_term_names() -> Vec<String> {
    let mut names: Vec<String> = read_registry().keys().cloned().collect();
    names.sort();
    names
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_catalog_registered() {
        let names = registered_term_names();
        for expected in [
            "avoid_singularity",
            "cart_pose",
            "cart_vel",
            "collision",
            "dyn_cart_pose",
            "joint_acc",
            "joint_jerk",
            "joint_pos",
            "joint_vel",
            "total_time",
        ] {
            assert!(names.iter().any(|n| n == expected), "missing {expected}");
        }
    }

    #[test]
    fn test_unknown_term_type() {
        let err = term_from_config("warp_drive", &serde_json::json!({})).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownTermType(_)));
    }
}
