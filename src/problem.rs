//! Declarative, validated container for a multistage decision problem.
//!
//! Problems are built stage by stage by the caller and handed to the optimizer
//! by value, after which they are never mutated.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::error::ModelError;
use crate::expr::{Constraint, LinExpr, RandomRef, VariableHandle};

static NEXT_PROBLEM_ID: AtomicU64 = AtomicU64::new(1);

/// Continuous decision variable owned by one stage
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Variable {
    pub stage: usize,
    pub name: String,
    pub lower: f64,
    pub upper: f64,
}

impl Variable {
    /// Constant-valued pseudo-variable (`lower == upper`)
    pub fn is_fixed(&self) -> bool {
        self.lower == self.upper
    }
}

#[derive(Debug, Clone)]
pub struct StagedConstraint {
    pub stage: usize,
    pub constraint: Constraint,
}

#[derive(Debug, Clone)]
pub struct ObjectiveTerm {
    pub stage: usize,
    pub expr: LinExpr,
}

#[derive(Debug)]
pub struct DecisionProblem {
    id: u64,
    variables: Vec<Variable>,
    index: HashMap<(usize, String), usize>,
    random_names: Vec<String>,
    constraints: Vec<StagedConstraint>,
    objective: Vec<ObjectiveTerm>,
}

impl Default for DecisionProblem {
    fn default() -> Self {
        Self::new()
    }
}

impl DecisionProblem {
    pub fn new() -> Self {
        Self {
            id: NEXT_PROBLEM_ID.fetch_add(1, Ordering::Relaxed),
            variables: Vec::new(),
            index: HashMap::new(),
            random_names: Vec::new(),
            constraints: Vec::new(),
            objective: Vec::new(),
        }
    }

    /// Declare a variable with the default bounds `[0, ∞)`.
    pub fn add_variable(&mut self, stage: usize, name: &str) -> Result<VariableHandle, ModelError> {
        self.add_variable_with_bounds(stage, name, 0.0, f64::INFINITY)
    }

    pub fn add_variable_with_bounds(
        &mut self,
        stage: usize,
        name: &str,
        lower: f64,
        upper: f64,
    ) -> Result<VariableHandle, ModelError> {
        if lower.is_nan() || upper.is_nan() || lower > upper || lower == f64::INFINITY || upper == f64::NEG_INFINITY {
            return Err(ModelError::InconsistentBounds {
                name: name.to_string(),
                lower,
                upper,
            });
        }
        let key = (stage, name.to_string());
        if self.index.contains_key(&key) {
            return Err(ModelError::DuplicateVariable {
                stage,
                name: name.to_string(),
            });
        }
        let index = self.variables.len();
        self.variables.push(Variable {
            stage,
            name: name.to_string(),
            lower,
            upper,
        });
        self.index.insert(key, index);
        Ok(VariableHandle {
            problem: self.id,
            index,
        })
    }

    /// Constant-valued pseudo-variable, used to seed stage-linking state.
    pub fn add_fixed(&mut self, stage: usize, name: &str, value: f64) -> Result<VariableHandle, ModelError> {
        if !value.is_finite() {
            return Err(ModelError::InconsistentBounds {
                name: name.to_string(),
                lower: value,
                upper: value,
            });
        }
        self.add_variable_with_bounds(stage, name, value, value)
    }

    /// Reference to the random variable `name`, declared on first use.
    pub fn random(&mut self, name: &str) -> RandomRef {
        let index = match self.random_names.iter().position(|n| n == name) {
            Some(index) => index,
            None => {
                self.random_names.push(name.to_string());
                self.random_names.len() - 1
            }
        };
        RandomRef {
            problem: self.id,
            index,
        }
    }

    /// Add a constraint enforced at the latest stage of its variables.
    pub fn add_constraint(&mut self, constraint: Constraint) -> Result<usize, ModelError> {
        let stage = self.infer_stage(&constraint.expr)?;
        self.add_constraint_at(stage, constraint)
    }

    pub fn add_constraint_at(&mut self, stage: usize, constraint: Constraint) -> Result<usize, ModelError> {
        self.check_expr(stage, &constraint.expr)?;
        self.constraints.push(StagedConstraint { stage, constraint });
        Ok(self.constraints.len() - 1)
    }

    /// Add a reward term collected at the latest stage of its variables.
    pub fn add_objective_term(&mut self, expr: impl Into<LinExpr>) -> Result<(), ModelError> {
        let expr = expr.into();
        let stage = self.infer_stage(&expr)?;
        self.add_objective_term_at(stage, expr)
    }

    pub fn add_objective_term_at(&mut self, stage: usize, expr: impl Into<LinExpr>) -> Result<(), ModelError> {
        let expr = expr.into();
        self.check_expr(stage, &expr)?;
        self.objective.push(ObjectiveTerm { stage, expr });
        Ok(())
    }

    pub fn variable(&self, stage: usize, name: &str) -> Option<VariableHandle> {
        self.index
            .get(&(stage, name.to_string()))
            .map(|&index| VariableHandle {
                problem: self.id,
                index,
            })
    }

    pub fn get(&self, handle: VariableHandle) -> Option<&Variable> {
        if handle.problem != self.id {
            return None;
        }
        self.variables.get(handle.index)
    }

    pub fn variables(&self) -> &[Variable] {
        &self.variables
    }

    pub fn variables_in_stage(&self, stage: usize) -> Vec<VariableHandle> {
        self.variables
            .iter()
            .enumerate()
            .filter(|(_, v)| v.stage == stage)
            .map(|(index, _)| VariableHandle {
                problem: self.id,
                index,
            })
            .collect()
    }

    pub fn random_names(&self) -> &[String] {
        &self.random_names
    }

    pub fn constraints(&self) -> &[StagedConstraint] {
        &self.constraints
    }

    pub fn objective_terms(&self) -> &[ObjectiveTerm] {
        &self.objective
    }

    pub fn num_stages(&self) -> usize {
        let var_stages = self.variables.iter().map(|v| v.stage);
        let con_stages = self.constraints.iter().map(|c| c.stage);
        let obj_stages = self.objective.iter().map(|o| o.stage);
        var_stages
            .chain(con_stages)
            .chain(obj_stages)
            .max()
            .map(|s| s + 1)
            .unwrap_or(0)
    }

    fn infer_stage(&self, expr: &LinExpr) -> Result<usize, ModelError> {
        let mut stage = None;
        for var in expr.variables() {
            let v = self.resolve(var)?;
            stage = Some(stage.map_or(v.stage, |s: usize| s.max(v.stage)));
        }
        stage.ok_or(ModelError::NoDecisionVariables)
    }

    fn resolve(&self, handle: VariableHandle) -> Result<&Variable, ModelError> {
        self.get(handle).ok_or_else(|| ModelError::UndeclaredVariable {
            handle: handle.to_string(),
        })
    }

    fn check_expr(&self, stage: usize, expr: &LinExpr) -> Result<(), ModelError> {
        for (var, coef) in expr.terms() {
            let v = self.resolve(*var)?;
            if v.stage > stage {
                return Err(ModelError::ForwardReference {
                    variable: v.name.clone(),
                    variable_stage: v.stage,
                    stage,
                });
            }
            let finite = coef.constant.is_finite() && coef.random.iter().all(|(_, w)| w.is_finite());
            if !finite {
                return Err(ModelError::InvalidParameter(format!(
                    "non-finite coefficient on '{}'",
                    v.name
                )));
            }
        }
        for r in expr.random_refs() {
            if r.problem != self.id || r.index >= self.random_names.len() {
                return Err(ModelError::UnknownRandomVariable(format!("#{}", r.index)));
            }
        }
        if !expr.constant_part().constant.is_finite() {
            return Err(ModelError::InvalidParameter("non-finite constant".to_string()));
        }
        Ok(())
    }

    pub(crate) fn layout(&self) -> StageLayout {
        StageLayout::build(self)
    }
}

/// Per-stage view derived from a problem: LP columns and stage-linking state.
#[derive(Debug, Clone)]
pub(crate) struct StageShape {
    /// Variable indices of this stage, in LP column order
    pub columns: Vec<usize>,
    /// State carried into this stage
    pub incoming: Vec<usize>,
    /// State carried out of this stage
    pub outgoing: Vec<usize>,
    pub constraints: Vec<usize>,
    pub objective: Vec<usize>,
    /// Display names for `incoming`, qualified with the stage on collisions
    pub incoming_labels: Vec<String>,
}

#[derive(Debug, Clone)]
pub(crate) struct StageLayout {
    pub stages: Vec<StageShape>,
}

impl StageLayout {
    fn build(problem: &DecisionProblem) -> Self {
        let num_stages = problem.num_stages();
        let vars = problem.variables();

        // last stage at which each variable is read
        let mut last_use: Vec<usize> = vars.iter().map(|v| v.stage).collect();
        for c in problem.constraints() {
            for var in c.constraint.expr.variables() {
                last_use[var.index] = last_use[var.index].max(c.stage);
            }
        }
        for o in problem.objective_terms() {
            for var in o.expr.variables() {
                last_use[var.index] = last_use[var.index].max(o.stage);
            }
        }

        let state_after = |t: usize| -> Vec<usize> {
            (0..vars.len())
                .filter(|&i| vars[i].stage <= t && last_use[i] > t)
                .collect()
        };

        let stages = (0..num_stages)
            .map(|t| {
                let incoming = if t == 0 { Vec::new() } else { state_after(t - 1) };
                let incoming_labels = incoming
                    .iter()
                    .map(|&i| {
                        let clash = incoming
                            .iter()
                            .any(|&j| j != i && vars[j].name == vars[i].name);
                        if clash {
                            format!("{}[{}]", vars[i].name, vars[i].stage)
                        } else {
                            vars[i].name.clone()
                        }
                    })
                    .collect();
                StageShape {
                    columns: (0..vars.len()).filter(|&i| vars[i].stage == t).collect(),
                    incoming,
                    outgoing: state_after(t),
                    constraints: problem
                        .constraints()
                        .iter()
                        .enumerate()
                        .filter(|(_, c)| c.stage == t)
                        .map(|(i, _)| i)
                        .collect(),
                    objective: problem
                        .objective_terms()
                        .iter()
                        .enumerate()
                        .filter(|(_, o)| o.stage == t)
                        .map(|(i, _)| i)
                        .collect(),
                    incoming_labels,
                }
            })
            .collect();

        Self { stages }
    }
}
