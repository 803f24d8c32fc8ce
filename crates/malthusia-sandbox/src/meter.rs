//! The budget counter every checkpoint and cost-wrapped primitive debits.

use tracing::trace;

use crate::cost::multiply_cost;
use crate::error::{FatalKind, RaiseError, VmResult};
use crate::value::Value;

#[derive(Debug, Clone, Default)]
pub struct Meter {
    remaining: i64,
    /// Total charged since construction; survives refills.
    spent: u64,
}

impl Meter {
    pub fn new(budget: i64) -> Self {
        Self {
            remaining: budget,
            spent: 0,
        }
    }

    pub fn remaining(&self) -> i64 {
        self.remaining
    }

    pub fn spent(&self) -> u64 {
        self.spent
    }

    pub fn set_remaining(&mut self, budget: i64) {
        self.remaining = budget;
    }

    /// Debit `n` units. Reaching zero is fatal; the charged operation
    /// must not run.
    pub fn charge(&mut self, n: i64) -> VmResult<()> {
        if n < 0 {
            return Err(RaiseError::fatal(
                FatalKind::SystemError,
                format!("negative charge {n}"),
            ));
        }
        self.remaining = self.remaining.saturating_sub(n);
        self.spent = self.spent.saturating_add(n as u64);
        if self.remaining <= 0 {
            trace!(charged = n, "budget exhausted");
            return Err(RaiseError::fatal(
                FatalKind::OutOfBudget,
                format!("Ran out of bytecode. Remaining bytecode: {}", self.remaining),
            ));
        }
        Ok(())
    }

    /// Debit an unsigned cost from the cost model.
    pub fn charge_cost(&mut self, cost: u64) -> VmResult<()> {
        self.charge(i64::try_from(cost).unwrap_or(i64::MAX))
    }

    /// Charge `a * b` before it is evaluated.
    pub fn charge_multiply(&mut self, a: &Value, b: &Value) -> VmResult<()> {
        self.charge_cost(multiply_cost(a, b))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn charges_until_exhausted() {
        let mut meter = Meter::new(3);
        assert!(meter.charge(1).is_ok());
        assert!(meter.charge(1).is_ok());
        let err = meter.charge(1).unwrap_err();
        assert_eq!(err.fatal_kind(), Some(FatalKind::OutOfBudget));
        assert!(err.to_string().contains("Ran out of bytecode"));
        assert_eq!(meter.spent(), 3);
    }

    #[test]
    fn negative_charge_is_a_contract_violation() {
        let mut meter = Meter::new(100);
        let err = meter.charge(-1).unwrap_err();
        assert_eq!(err.fatal_kind(), Some(FatalKind::SystemError));
        assert_eq!(meter.remaining(), 100);
    }

    #[test]
    fn zero_charge_fails_on_empty_budget() {
        let mut meter = Meter::new(0);
        assert!(meter.charge(0).is_err());
    }

    #[test]
    fn huge_costs_saturate() {
        let mut meter = Meter::new(10);
        assert!(meter.charge_cost(u64::MAX).is_err());
        assert!(meter.remaining() < 0);
    }

    #[test]
    fn multiply_charges_by_size() {
        let mut meter = Meter::new(100);
        let xs = Value::list(vec![Value::Int(0); 10]);
        meter.charge_multiply(&xs, &Value::Int(5)).unwrap();
        assert_eq!(meter.remaining(), 50);
    }
}
