//! Multi-stage inventory control problem with uncertain demand.
//!
//! Each stage sells from stock on hand and buys for the next stage.

use serde::{Deserialize, Serialize};

use crate::error::ModelError;
use crate::problem::DecisionProblem;

/// Variable names used in every stage
pub const SELL: &str = "sell";
pub const BUY: &str = "buy";
pub const INVENTORY: &str = "inventory";
/// Fixed stage-0 variable holding the starting stock
pub const INITIAL_INVENTORY: &str = "initial_inventory";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InventoryParams {
    pub num_stages: usize,
    pub selling_price: f64,
    pub purchase_cost: f64,
    /// Cost per unit of end-of-stage inventory
    pub holding_cost: f64,
    /// Value per unit left over after the last stage
    pub liquidation_price: f64,
    pub initial_inventory: f64,
    /// Per-stage purchase limit
    pub max_purchase: Option<f64>,
    /// Process dimension driving demand
    pub demand: String,
}

impl Default for InventoryParams {
    fn default() -> Self {
        Self {
            num_stages: 4,
            selling_price: 5.0,
            purchase_cost: 2.0,
            holding_cost: 0.5,
            liquidation_price: 1.0,
            initial_inventory: 12.0,
            max_purchase: Some(50.0),
            demand: "demand".to_string(),
        }
    }
}

impl InventoryParams {
    pub fn validate(&self) -> Result<(), ModelError> {
        if self.num_stages == 0 {
            return Err(ModelError::InvalidParameter("num_stages must be positive".to_string()));
        }
        let prices = [
            ("selling_price", self.selling_price),
            ("purchase_cost", self.purchase_cost),
            ("holding_cost", self.holding_cost),
            ("liquidation_price", self.liquidation_price),
            ("initial_inventory", self.initial_inventory),
            ("max_purchase", self.max_purchase.unwrap_or(0.0)),
        ];
        for (name, value) in prices {
            if !value.is_finite() || value < 0.0 {
                return Err(ModelError::InvalidParameter(format!(
                    "{} must be finite and non-negative, got {}",
                    name, value
                )));
            }
        }
        Ok(())
    }

    /// Build the decision problem.
    ///
    /// Stage `t` has `sell`, `buy` and `inventory` with
    /// `sell ≤ demand`, `sell ≤ on hand` and `inventory = on hand + buy - sell`,
    /// where "on hand" is the previous stage's `inventory` (or the fixed
    /// `initial_inventory` at stage 0). Purchases arrive for the next stage.
    pub fn build_problem(&self) -> Result<DecisionProblem, ModelError> {
        self.validate()?;
        let mut problem = DecisionProblem::new();
        let demand = problem.random(&self.demand);
        let mut on_hand = problem.add_fixed(0, INITIAL_INVENTORY, self.initial_inventory)?;
        let last = self.num_stages - 1;

        for t in 0..self.num_stages {
            let sell = problem.add_variable(t, SELL)?;
            let buy = match self.max_purchase {
                Some(limit) => problem.add_variable_with_bounds(t, BUY, 0.0, limit)?,
                None => problem.add_variable(t, BUY)?,
            };
            let inventory = problem.add_variable(t, INVENTORY)?;

            problem.add_constraint(sell.leq(demand))?;
            problem.add_constraint(sell.leq(on_hand))?;
            problem.add_constraint(inventory.equals(on_hand + buy - sell))?;

            let end_value = if t == last {
                self.liquidation_price - self.holding_cost
            } else {
                -self.holding_cost
            };
            problem.add_objective_term(
                self.selling_price * sell - self.purchase_cost * buy + end_value * inventory,
            )?;

            on_hand = inventory;
        }
        Ok(problem)
    }
}
