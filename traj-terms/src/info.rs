//! The term-info contract and shared validation helpers.

use nalgebra::DVector;
use traj_types::ConfigError;

use crate::problem::TrajProblem;

/// Whether a term is being hatched as a cost or as a constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TermKind {
    /// Penalized in the objective.
    Cost,
    /// Enforced through the constraint set.
    Constraint,
}

impl TermKind {
    /// Lowercase label for error messages.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Cost => "cost",
            Self::Constraint => "constraint",
        }
    }
}

/// The kinds a term supports, plus whether it needs the time column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TermKinds {
    /// May be added as a cost.
    pub cost: bool,
    /// May be added as a constraint.
    pub constraint: bool,
    /// Requires `basic_info.use_time`.
    pub uses_time: bool,
}

impl TermKinds {
    /// Cost and constraint, no time column.
    #[must_use]
    pub fn cost_and_constraint() -> Self {
        Self {
            cost: true,
            constraint: true,
            uses_time: false,
        }
    }

    /// Whether `kind` is supported.
    #[must_use]
    pub fn supports(&self, kind: TermKind) -> bool {
        match kind {
            TermKind::Cost => self.cost,
            TermKind::Constraint => self.constraint,
        }
    }
}

/// A declarative term that can hatch into concrete costs/constraints.
///
/// Implementations are plain data (deserializable from the problem
/// description); `hatch` binds them to trajectory cells on a
/// [`TrajProblem`] under construction.
pub trait TermInfo: Send + Sync {
    /// Instance name, used to label the hatched costs/constraints.
    fn name(&self) -> &str;

    /// The registry key of this term's type.
    fn type_name(&self) -> &'static str;

    /// Which kinds this term supports.
    fn supported_kinds(&self) -> TermKinds;

    /// Materialize the term onto the problem.
    fn hatch(&self, kind: TermKind, prob: &mut TrajProblem) -> Result<(), ConfigError>;

    /// Serialize the parameters back to their config form.
    fn to_config(&self) -> serde_json::Value;
}

impl std::fmt::Debug for dyn TermInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("dyn TermInfo")
            .field("name", &self.name())
            .field("type_name", &self.type_name())
            .finish()
    }
}

/// Broadcast a scalar-or-per-joint vector to exactly `dof` entries.
///
/// An empty vector yields `fill`; a single entry is broadcast; a `dof`-sized
/// vector is taken as-is; anything else is a size mismatch.
pub fn broadcast(
    values: &[f64],
    dof: usize,
    fill: f64,
    term: &str,
    field: &str,
) -> Result<DVector<f64>, ConfigError> {
    match values.len() {
        0 => Ok(DVector::from_element(dof, fill)),
        1 => Ok(DVector::from_element(dof, values[0])),
        n if n == dof => Ok(DVector::from_column_slice(values)),
        n => Err(ConfigError::SizeMismatch {
            term: term.to_owned(),
            field: field.to_owned(),
            expected: dof,
            actual: n,
        }),
    }
}

/// Resolve a `(first_step, last_step)` pair against the problem length.
///
/// `last_step < 0` means "the final step". The resolved range is inclusive
/// and must fit in `[0, n_steps - 1]` with `first <= last`.
pub fn resolve_step_range(
    first_step: i64,
    last_step: i64,
    n_steps: usize,
    term: &str,
) -> Result<(usize, usize), ConfigError> {
    let last = if last_step < 0 {
        n_steps as i64 - 1
    } else {
        last_step
    };
    if first_step < 0 || first_step > last || last >= n_steps as i64 {
        return Err(ConfigError::StepRangeOutOfBounds {
            term: term.to_owned(),
            first: first_step,
            last: last_step,
            n_steps,
        });
    }
    Ok((first_step as usize, last as usize))
}
