//! Cost & Budget Controller: per-phase spend accumulation and a hard ceiling.

use crate::phase::{Phase, PipelineState};
use rust_decimal::Decimal;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetStatus {
    Ok,
    Exceeded,
}

/// Tracks per-phase cost against `PipelineState.phase_costs`. Holds no state
/// of its own beyond which phases are currently open — the ledger itself
/// lives on `PipelineState` so it persists across resumes.
#[derive(Debug, Default)]
pub struct BudgetController {
    open_phases: HashMap<String, ()>,
}

impl BudgetController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_phase(&mut self, phase: Phase) {
        self.open_phases.insert(phase.as_str().to_string(), ());
    }

    /// Accumulates `cost` into `state.phase_costs[phase]` and recomputes
    /// `total_cost`. A phase ending without a matching `start_phase` is
    /// accepted as a one-shot phase rather than rejected.
    pub fn end_phase(&mut self, state: &mut PipelineState, phase: Phase, cost: Decimal) {
        debug_assert!(cost >= Decimal::ZERO, "builder cost must be non-negative");
        self.open_phases.remove(phase.as_str());
        let entry = state
            .phase_costs
            .entry(phase.as_str().to_string())
            .or_insert(Decimal::ZERO);
        *entry += cost;
        state.recompute_total_cost();
        state.touch();
    }

    /// `limit = None` always returns `Ok` — there is no ceiling to exceed.
    pub fn check_budget(&self, state: &PipelineState, limit: Option<Decimal>) -> BudgetStatus {
        match limit {
            None => BudgetStatus::Ok,
            Some(limit) if state.total_cost < limit => BudgetStatus::Ok,
            Some(_) => BudgetStatus::Exceeded,
        }
    }

    pub fn to_dict(state: &PipelineState) -> HashMap<String, Decimal> {
        state.phase_costs.clone()
    }

    pub fn from_dict(state: &mut PipelineState, dict: HashMap<String, Decimal>) {
        state.phase_costs = dict;
        state.recompute_total_cost();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn fresh_state() -> PipelineState {
        PipelineState::init("run-1", PathBuf::from("prd.md"))
    }

    #[test]
    fn end_phase_accumulates_into_total_cost() {
        let mut controller = BudgetController::new();
        let mut state = fresh_state();
        controller.start_phase(Phase::BuildersRunning);
        controller.end_phase(&mut state, Phase::BuildersRunning, Decimal::new(150, 2));
        assert_eq!(state.total_cost, Decimal::new(150, 2));
        assert_eq!(
            state.phase_costs.get("builders_running"),
            Some(&Decimal::new(150, 2))
        );
    }

    #[test]
    fn end_phase_without_start_is_accepted_as_one_shot() {
        let mut controller = BudgetController::new();
        let mut state = fresh_state();
        controller.end_phase(&mut state, Phase::Integrating, Decimal::new(50, 2));
        assert_eq!(state.total_cost, Decimal::new(50, 2));
    }

    #[test]
    fn zero_cost_is_recorded_not_collapsed_to_unstarted() {
        let mut controller = BudgetController::new();
        let mut state = fresh_state();
        controller.end_phase(&mut state, Phase::ContractsRegistering, Decimal::ZERO);
        assert_eq!(
            state.phase_costs.get("contracts_registering"),
            Some(&Decimal::ZERO)
        );
    }

    #[test]
    fn no_limit_never_halts() {
        let controller = BudgetController::new();
        let mut state = fresh_state();
        state.total_cost = Decimal::new(1_000_000, 2);
        assert_eq!(controller.check_budget(&state, None), BudgetStatus::Ok);
    }

    #[test]
    fn limit_exceeded_when_total_cost_reaches_limit() {
        let controller = BudgetController::new();
        let mut state = fresh_state();
        state.total_cost = Decimal::new(100, 2);
        assert_eq!(
            controller.check_budget(&state, Some(Decimal::new(100, 2))),
            BudgetStatus::Exceeded
        );
        assert_eq!(
            controller.check_budget(&state, Some(Decimal::new(101, 2))),
            BudgetStatus::Ok
        );
    }

    #[test]
    fn to_dict_from_dict_roundtrips() {
        let mut state = fresh_state();
        state
            .phase_costs
            .insert("architect_running".into(), Decimal::new(200, 2));
        state.recompute_total_cost();
        let dict = BudgetController::to_dict(&state);

        let mut restored = fresh_state();
        BudgetController::from_dict(&mut restored, dict);
        assert_eq!(restored.total_cost, state.total_cost);
    }
}
