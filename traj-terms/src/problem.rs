//! Problem description and construction.

use std::sync::Arc;

use nalgebra::DVector;
use serde::{Deserialize, Serialize};
use tracing::debug;
use traj_qp::{ConstraintTerm, CostTerm, QpProblem};
use traj_sqp::SqpParams;
use traj_types::{interpolate, ConfigError, Environment, JointGroup, TrajArray};

use crate::info::{TermInfo, TermKind};
use crate::registry::term_from_config;

/// Which QP backend the solver should use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConvexSolverKind {
    /// The built-in dense ADMM backend.
    #[default]
    BuiltinAdmm,
}

/// Trajectory shape and variable-set options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BasicInfo {
    /// Number of time steps (rows of the trajectory matrix).
    pub n_steps: usize,
    /// Name of the kinematic group being planned for.
    pub manipulator: String,
    /// Time steps pinned to their initial values.
    pub fixed_timesteps: Vec<usize>,
    /// DOF columns pinned to their initial values at every step.
    pub fixed_dofs: Vec<usize>,
    /// QP backend selection.
    pub convex_solver: ConvexSolverKind,
    /// Append a `1/dt` column and let time vary.
    pub use_time: bool,
    /// Upper limit on the `1/dt` variables.
    pub dt_upper_lim: f64,
    /// Lower limit on the `1/dt` variables.
    pub dt_lower_lim: f64,
}

impl Default for BasicInfo {
    fn default() -> Self {
        Self {
            n_steps: 0,
            manipulator: String::new(),
            fixed_timesteps: Vec::new(),
            fixed_dofs: Vec::new(),
            convex_solver: ConvexSolverKind::BuiltinAdmm,
            use_time: false,
            dt_upper_lim: 1.0,
            dt_lower_lim: 1.0,
        }
    }
}

/// How the initial trajectory is generated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitMethod {
    /// Every row equals the current environment state.
    #[default]
    Stationary,
    /// Linear interpolation from the current state to `data[0]`.
    JointInterpolated,
    /// `data` is the full trajectory matrix.
    Given,
}

/// Initial-trajectory description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InitInfo {
    /// Generation method.
    pub method: InitMethod,
    /// Method-dependent data (goal row or full matrix).
    pub data: Vec<Vec<f64>>,
    /// Initial time step; the `1/dt` column starts at `1/dt`.
    pub dt: f64,
}

impl Default for InitInfo {
    fn default() -> Self {
        Self {
            method: InitMethod::Stationary,
            data: Vec::new(),
            dt: 1.0,
        }
    }
}

/// The full declarative problem description.
pub struct ProblemConstructionInfo {
    /// Trajectory shape and variable options.
    pub basic_info: BasicInfo,
    /// Solver parameters.
    pub opt_info: SqpParams,
    /// Terms added as costs.
    pub cost_infos: Vec<Box<dyn TermInfo>>,
    /// Terms added as constraints.
    pub cnt_infos: Vec<Box<dyn TermInfo>>,
    /// Initial-trajectory description.
    pub init_info: InitInfo,
}

impl std::fmt::Debug for ProblemConstructionInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProblemConstructionInfo")
            .field("basic_info", &self.basic_info)
            .field("opt_info", &self.opt_info)
            .field("cost_infos_count", &self.cost_infos.len())
            .field("cnt_infos_count", &self.cnt_infos.len())
            .field("init_info", &self.init_info)
            .finish()
    }
}

impl ProblemConstructionInfo {
    /// Parse a description from its JSON form.
    ///
    /// Term entries live under `"costs"` and `"constraints"`, each carrying
    /// a `"type"` key resolved through the registry.
    pub fn from_json(value: &serde_json::Value) -> Result<Self, ConfigError> {
        let basic_info = match value.get("basic_info") {
            Some(v) => serde_json::from_value(v.clone())
                .map_err(|e| ConfigError::invalid(format!("basic_info: {e}")))?,
            None => BasicInfo::default(),
        };
        let opt_info = match value.get("opt_info") {
            Some(v) => serde_json::from_value(v.clone())
                .map_err(|e| ConfigError::invalid(format!("opt_info: {e}")))?,
            None => SqpParams::default(),
        };
        let init_info = match value.get("init_info") {
            Some(v) => serde_json::from_value(v.clone())
                .map_err(|e| ConfigError::invalid(format!("init_info: {e}")))?,
            None => InitInfo::default(),
        };

        let parse_terms = |key: &str| -> Result<Vec<Box<dyn TermInfo>>, ConfigError> {
            let mut terms = Vec::new();
            if let Some(entries) = value.get(key).and_then(|v| v.as_array()) {
                for entry in entries {
                    let type_name = entry
                        .get("type")
                        .and_then(|t| t.as_str())
                        .ok_or_else(|| {
                            ConfigError::invalid(format!("{key} entry is missing \"type\""))
                        })?;
                    terms.push(term_from_config(type_name, entry)?);
                }
            }
            Ok(terms)
        };

        Ok(Self {
            basic_info,
            opt_info,
            cost_infos: parse_terms("costs")?,
            cnt_infos: parse_terms("constraints")?,
            init_info,
        })
    }

    /// Serialize the description back to JSON.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        let dump_terms = |terms: &[Box<dyn TermInfo>]| -> serde_json::Value {
            let entries: Vec<serde_json::Value> = terms
                .iter()
                .map(|info| {
                    let mut entry = info.to_config();
                    if let Some(obj) = entry.as_object_mut() {
                        obj.insert(
                            "type".to_owned(),
                            serde_json::Value::String(info.type_name().to_owned()),
                        );
                    }
                    entry
                })
                .collect();
            serde_json::Value::Array(entries)
        };

        serde_json::json!({
            "basic_info": self.basic_info,
            "opt_info": self.opt_info,
            "costs": dump_terms(&self.cost_infos),
            "constraints": dump_terms(&self.cnt_infos),
            "init_info": self.init_info,
        })
    }
}

/// A constructed, ready-to-solve trajectory problem.
///
/// Wraps the underlying [`QpProblem`] with the trajectory-matrix layout and
/// the shared kinematics/environment handles the hatched terms captured.
pub struct TrajProblem {
    qp: QpProblem,
    kin: Arc<dyn JointGroup>,
    env: Arc<dyn Environment>,
    init_traj: TrajArray,
    n_steps: usize,
    dof: usize,
    num_cols: usize,
    has_time: bool,
    fixed_timesteps: Vec<usize>,
    convex_solver: ConvexSolverKind,
}

impl std::fmt::Debug for TrajProblem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrajProblem")
            .field("n_steps", &self.n_steps)
            .field("dof", &self.dof)
            .field("num_cols", &self.num_cols)
            .field("has_time", &self.has_time)
            .field("fixed_timesteps", &self.fixed_timesteps)
            .field("convex_solver", &self.convex_solver)
            .finish()
    }
}

impl TrajProblem {
    /// The underlying QP problem.
    #[must_use]
    pub fn qp(&self) -> &QpProblem {
        &self.qp
    }

    /// Mutable access for the solver.
    pub fn qp_mut(&mut self) -> &mut QpProblem {
        &mut self.qp
    }

    /// The kinematic group the problem plans for.
    #[must_use]
    pub fn kin(&self) -> Arc<dyn JointGroup> {
        Arc::clone(&self.kin)
    }

    /// The environment the problem plans in.
    #[must_use]
    pub fn env(&self) -> Arc<dyn Environment> {
        Arc::clone(&self.env)
    }

    /// Number of time steps.
    #[must_use]
    pub fn n_steps(&self) -> usize {
        self.n_steps
    }

    /// Kinematic DOF (time column excluded).
    #[must_use]
    pub fn dof(&self) -> usize {
        self.dof
    }

    /// Whether the trajectory carries a `1/dt` column.
    #[must_use]
    pub fn has_time(&self) -> bool {
        self.has_time
    }

    /// The QP backend requested by the description.
    #[must_use]
    pub fn convex_solver(&self) -> ConvexSolverKind {
        self.convex_solver
    }

    /// The initial trajectory.
    #[must_use]
    pub fn init_traj(&self) -> &TrajArray {
        &self.init_traj
    }

    /// Flat variable index of cell `(t, j)`.
    #[must_use]
    pub fn var_index(&self, t: usize, j: usize) -> usize {
        t * self.num_cols + j
    }

    /// Flat variable index of step `t`'s `1/dt` cell.
    #[must_use]
    pub fn time_index(&self, t: usize) -> usize {
        t * self.num_cols + self.dof
    }

    /// Flat indices of step `t`'s joint cells.
    #[must_use]
    pub fn row_indices(&self, t: usize) -> Vec<usize> {
        (0..self.dof).map(|j| self.var_index(t, j)).collect()
    }

    /// Whether step `t` is pinned.
    #[must_use]
    pub fn is_fixed_timestep(&self, t: usize) -> bool {
        self.fixed_timesteps.contains(&t)
    }

    /// Add a hatched cost.
    pub fn add_cost(&mut self, cost: CostTerm) -> Result<(), ConfigError> {
        self.qp
            .add_cost(cost)
            .map_err(|e| ConfigError::invalid(e.to_string()))
    }

    /// Add a hatched constraint.
    pub fn add_constraint(&mut self, constraint: ConstraintTerm) -> Result<(), ConfigError> {
        self.qp
            .add_constraint(constraint)
            .map_err(|e| ConfigError::invalid(e.to_string()))
    }

    /// Reshape a flat variable vector into a trajectory matrix.
    #[must_use]
    pub fn to_traj_array(&self, x: &DVector<f64>) -> TrajArray {
        let mut traj = TrajArray::zeros(self.n_steps, self.num_cols);
        for t in 0..self.n_steps {
            for j in 0..self.num_cols {
                traj[(t, j)] = x[self.var_index(t, j)];
            }
        }
        traj
    }

    /// The current iterate as a trajectory matrix.
    #[must_use]
    pub fn current_traj(&self) -> TrajArray {
        self.to_traj_array(&self.qp.variable_values())
    }
}

fn generate_init_traj(
    basic_info: &BasicInfo,
    init_info: &InitInfo,
    env: &Arc<dyn Environment>,
    kin: &Arc<dyn JointGroup>,
) -> Result<TrajArray, ConfigError> {
    let n_steps = basic_info.n_steps;
    let dof = kin.num_joints();
    let current = env.current_joint_values(kin.joint_names());
    if current.len() != dof {
        return Err(ConfigError::invalid(format!(
            "environment reports {} joint values for a {dof}-DOF group",
            current.len()
        )));
    }

    let traj = match init_info.method {
        InitMethod::Stationary => {
            let mut traj = TrajArray::zeros(n_steps, dof);
            for t in 0..n_steps {
                for j in 0..dof {
                    traj[(t, j)] = current[j];
                }
            }
            traj
        }
        InitMethod::JointInterpolated => {
            let goal = init_info.data.first().ok_or_else(|| {
                ConfigError::invalid("joint_interpolated init requires a goal row in data")
            })?;
            if goal.len() != dof {
                return Err(ConfigError::SizeMismatch {
                    term: "init_info".to_owned(),
                    field: "data[0]".to_owned(),
                    expected: dof,
                    actual: goal.len(),
                });
            }
            interpolate(&current, &DVector::from_column_slice(goal), n_steps)
        }
        InitMethod::Given => {
            if init_info.data.len() != n_steps {
                return Err(ConfigError::SizeMismatch {
                    term: "init_info".to_owned(),
                    field: "data".to_owned(),
                    expected: n_steps,
                    actual: init_info.data.len(),
                });
            }
            let mut traj = TrajArray::zeros(n_steps, dof);
            for (t, row) in init_info.data.iter().enumerate() {
                if row.len() != dof {
                    return Err(ConfigError::SizeMismatch {
                        term: "init_info".to_owned(),
                        field: format!("data[{t}]"),
                        expected: dof,
                        actual: row.len(),
                    });
                }
                for j in 0..dof {
                    traj[(t, j)] = row[j];
                }
            }
            traj
        }
    };

    if !basic_info.use_time {
        return Ok(traj);
    }
    if init_info.dt <= 0.0 {
        return Err(ConfigError::invalid("init_info.dt must be positive"));
    }
    let mut timed = TrajArray::zeros(n_steps, dof + 1);
    for t in 0..n_steps {
        for j in 0..dof {
            timed[(t, j)] = traj[(t, j)];
        }
        timed[(t, dof)] = 1.0 / init_info.dt;
    }
    Ok(timed)
}

/// Validate a description and hatch every term into a solvable problem.
///
/// Construction is atomic: the first failing term aborts and nothing is
/// returned.
pub fn construct_problem(
    pci: &ProblemConstructionInfo,
    env: Arc<dyn Environment>,
    kin: Arc<dyn JointGroup>,
) -> Result<TrajProblem, ConfigError> {
    let basic = &pci.basic_info;
    if basic.n_steps == 0 {
        return Err(ConfigError::invalid("basic_info.n_steps must be positive"));
    }
    if basic.use_time && basic.dt_lower_lim > basic.dt_upper_lim {
        return Err(ConfigError::invalid(
            "dt_lower_lim must not exceed dt_upper_lim",
        ));
    }
    for &t in &basic.fixed_timesteps {
        if t >= basic.n_steps {
            return Err(ConfigError::invalid(format!(
                "fixed timestep {t} is out of range for {} steps",
                basic.n_steps
            )));
        }
    }
    let dof = kin.num_joints();
    for &j in &basic.fixed_dofs {
        if j >= dof {
            return Err(ConfigError::invalid(format!(
                "fixed dof {j} is out of range for a {dof}-DOF group"
            )));
        }
    }

    let init_traj = generate_init_traj(basic, &pci.init_info, &env, &kin)?;
    let num_cols = init_traj.ncols();

    let mut qp = QpProblem::new();
    let mut names = Vec::with_capacity(basic.n_steps * num_cols);
    let mut values = DVector::zeros(basic.n_steps * num_cols);
    for t in 0..basic.n_steps {
        for (j, joint) in kin.joint_names().iter().enumerate() {
            names.push(format!("{joint}_{t}"));
            values[t * num_cols + j] = init_traj[(t, j)];
        }
        if basic.use_time {
            names.push(format!("dt_inv_{t}"));
            values[t * num_cols + dof] = init_traj[(t, dof)];
        }
    }
    qp.add_variable_set(names, values)
        .map_err(|e| ConfigError::invalid(e.to_string()))?;

    for &t in &basic.fixed_timesteps {
        for j in 0..num_cols {
            qp.pin_variable(t * num_cols + j, init_traj[(t, j)]);
        }
    }
    for &j in &basic.fixed_dofs {
        for t in 0..basic.n_steps {
            qp.pin_variable(t * num_cols + j, init_traj[(t, j)]);
        }
    }
    if basic.use_time {
        for t in 0..basic.n_steps {
            qp.set_variable_limits(t * num_cols + dof, basic.dt_lower_lim, basic.dt_upper_lim);
        }
    }

    let mut prob = TrajProblem {
        qp,
        kin,
        env,
        init_traj,
        n_steps: basic.n_steps,
        dof,
        num_cols,
        has_time: basic.use_time,
        fixed_timesteps: basic.fixed_timesteps.clone(),
        convex_solver: basic.convex_solver,
    };

    for (infos, kind) in [
        (&pci.cost_infos, TermKind::Cost),
        (&pci.cnt_infos, TermKind::Constraint),
    ] {
        for info in infos.iter() {
            let kinds = info.supported_kinds();
            if !kinds.supports(kind) {
                return Err(ConfigError::unsupported_kind(info.name(), kind.label()));
            }
            if kinds.uses_time && !basic.use_time {
                return Err(ConfigError::MissingTimeColumn(info.name().to_owned()));
            }
            debug!(term = info.name(), kind = kind.label(), "hatching term");
            info.hatch(kind, &mut prob)?;
        }
    }

    prob.qp.setup();
    Ok(prob)
}
