//! Collision-term configuration.

use hashbrown::{HashMap, HashSet};
use traj_types::{make_link_pair, ContactRequest, LinkPair};

/// Per-link-pair collision coefficients.
///
/// The coefficient scales a pair's contribution to collision costs and
/// constraints. Pairs with a zero coefficient are filtered out of contact
/// results entirely. Lookups are order-insensitive.
#[derive(Debug, Clone)]
pub struct CollisionCoeffData {
    /// Coefficient used when no pair-specific entry exists.
    default_coeff: f64,
    /// Pair-specific coefficients.
    lookup: HashMap<LinkPair, f64>,
    /// Pairs whose coefficient is exactly zero.
    zero_coeff_pairs: HashSet<LinkPair>,
}

impl CollisionCoeffData {
    /// Create with the given default coefficient.
    #[must_use]
    pub fn new(default_coeff: f64) -> Self {
        Self {
            default_coeff,
            lookup: HashMap::new(),
            zero_coeff_pairs: HashSet::new(),
        }
    }

    /// Set the coefficient for a pair. Order of the names does not matter.
    pub fn set_pair_coeff(&mut self, link_a: &str, link_b: &str, coeff: f64) {
        let key = make_link_pair(link_a, link_b);
        if coeff == 0.0 {
            self.zero_coeff_pairs.insert(key.clone());
        } else {
            self.zero_coeff_pairs.remove(&key);
        }
        self.lookup.insert(key, coeff);
    }

    /// Get a pair's coefficient, falling back to the default.
    #[must_use]
    pub fn pair_coeff(&self, pair: &LinkPair) -> f64 {
        self.lookup.get(pair).copied().unwrap_or(self.default_coeff)
    }

    /// Whether the pair is excluded via a zero coefficient.
    #[must_use]
    pub fn has_zero_coeff(&self, pair: &LinkPair) -> bool {
        self.zero_coeff_pairs.contains(pair)
    }
}

impl Default for CollisionCoeffData {
    fn default() -> Self {
        Self::new(1.0)
    }
}

/// Settings shared by the collision evaluators.
#[derive(Debug, Clone)]
pub struct CollisionConfig {
    /// When false, the term is skipped entirely at hatch time.
    pub enabled: bool,
    /// Contact query parameters handed to the contact manager.
    pub contact_request: ContactRequest,
    /// Contact distance below which a pair is in violation.
    pub margin: f64,
    /// Extra margin used for contact detection but not for the error.
    ///
    /// Contacts with `distance >= margin + margin_buffer` are discarded.
    pub margin_buffer: f64,
    /// Maximum joint-space distance between collision sub-states.
    pub longest_valid_segment_length: f64,
    /// Maximum number of gradient sets a constraint consumes.
    ///
    /// All contacts are still found; sets beyond this count are ordered by
    /// worst error and the surplus is ignored by fixed-size constraints.
    pub max_num_cnt: usize,
    /// Per-pair coefficients.
    pub coeff_data: CollisionCoeffData,
}

impl CollisionConfig {
    /// Create a config with the given margin and default coefficient.
    #[must_use]
    pub fn new(margin: f64, coeff: f64) -> Self {
        Self {
            coeff_data: CollisionCoeffData::new(coeff),
            margin,
            ..Self::default()
        }
    }
}

impl Default for CollisionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            contact_request: ContactRequest::default(),
            margin: 0.025,
            margin_buffer: 0.01,
            longest_valid_segment_length: 0.005,
            max_num_cnt: 3,
            coeff_data: CollisionCoeffData::default(),
        }
    }
}
