//! Per-tick demand allocation
//!
//! Pure computation over a registry snapshot and the latest site power:
//! subtract non-charger loads from the site ceiling, then split the
//! remaining headroom across charging points proportionally to their
//! learned maxima.

use crate::config::ControlConfig;
use crate::state::{ChargerSnapshot, ChargerStatus};

/// Recomputed limits within this fraction of the applied limit are not
/// re-sent (unless the site is overloaded).
const RESEND_TOLERANCE: f64 = 0.01;

#[derive(Debug, Clone, PartialEq)]
pub struct ChargerLimit {
    pub charger_id: String,
    pub limit_w: f64,
}

/// Outcome of one allocation tick.
#[derive(Debug, Clone)]
pub struct AllocationPlan {
    pub site_power_w: f64,
    pub total_charger_demand_w: f64,
    /// Everything on the site meter that is not a charger ("house" load)
    pub non_charger_site_power_w: f64,
    pub available_for_group_w: f64,
    pub overload: bool,
    pub charging_count: usize,
    /// Connected chargers not currently charging
    pub waiting_count: usize,
    /// Limits that need to be pushed this tick
    pub limits: Vec<ChargerLimit>,
}

pub fn plan(
    site_power_w: f64,
    control: &ControlConfig,
    chargers: &[ChargerSnapshot],
) -> AllocationPlan {
    let charging: Vec<&ChargerSnapshot> = chargers
        .iter()
        .filter(|cp| cp.status == ChargerStatus::Charging)
        .collect();
    let connected_count = chargers
        .iter()
        .filter(|cp| cp.status != ChargerStatus::Offline)
        .count();

    let total_charger_demand_w: f64 = charging.iter().map(|cp| cp.current_power_w).sum();
    let non_charger_site_power_w = (site_power_w - total_charger_demand_w).max(0.0);
    let available_for_group_w = (control.max_total_power_w - non_charger_site_power_w).max(0.0);
    let overload = total_charger_demand_w > available_for_group_w;

    let total_learned_w: f64 = charging.iter().map(|cp| cp.learned_max_power_w).sum();

    let mut limits = Vec::new();
    if !charging.is_empty() && total_learned_w > 0.0 {
        for cp in &charging {
            let share = cp.learned_max_power_w / total_learned_w;
            let mut limit_w = available_for_group_w * share;
            limit_w = limit_w.max(control.min_charge_power_w);
            limit_w = limit_w.min(cp.learned_max_power_w);

            if (limit_w - cp.current_limit_w).abs() > limit_w * RESEND_TOLERANCE || overload {
                limits.push(ChargerLimit {
                    charger_id: cp.charger_id.clone(),
                    limit_w,
                });
            }
        }
    }

    AllocationPlan {
        site_power_w,
        total_charger_demand_w,
        non_charger_site_power_w,
        available_for_group_w,
        overload,
        charging_count: charging.len(),
        waiting_count: connected_count.saturating_sub(charging.len()),
        limits,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn charging(id: &str, power_w: f64, learned_w: f64, limit_w: f64) -> ChargerSnapshot {
        ChargerSnapshot {
            charger_id: id.to_string(),
            status: ChargerStatus::Charging,
            current_power_w: power_w,
            learned_max_power_w: learned_w,
            current_limit_w: limit_w,
        }
    }

    fn control() -> ControlConfig {
        ControlConfig::default()
    }

    #[test]
    fn proportional_split_under_overload() {
        let mut cfg = control();
        cfg.max_total_power_w = 30_000.0;
        let chargers = vec![
            charging("A", 25_000.0, 30_000.0, 30_000.0),
            charging("B", 7_500.0, 7_500.0, 7_500.0),
        ];

        let plan = plan(32_500.0, &cfg, &chargers);
        assert_eq!(plan.non_charger_site_power_w, 0.0);
        assert_eq!(plan.available_for_group_w, 30_000.0);
        assert!(plan.overload);
        assert_eq!(plan.limits.len(), 2);
        assert_eq!(plan.limits[0].charger_id, "A");
        assert!((plan.limits[0].limit_w - 24_000.0).abs() < 1e-6);
        assert_eq!(plan.limits[1].charger_id, "B");
        assert!((plan.limits[1].limit_w - 6_000.0).abs() < 1e-6);
    }

    #[test]
    fn house_load_shrinks_the_group_budget() {
        let cfg = control();
        let chargers = vec![charging("A", 0.0, 7_500.0, 7_500.0)];

        // 55 kW of non-charger load against a 60 kW site ceiling
        let plan = plan(55_000.0, &cfg, &chargers);
        assert_eq!(plan.non_charger_site_power_w, 55_000.0);
        assert_eq!(plan.available_for_group_w, 5_000.0);
        assert_eq!(plan.limits, vec![ChargerLimit { charger_id: "A".into(), limit_w: 5_000.0 }]);
    }

    #[test]
    fn floor_applies_before_learned_ceiling() {
        let cfg = control();
        // tiny share would fall below the floor; a small learned max caps it again
        let chargers = vec![
            charging("big", 20_000.0, 50_000.0, 50_000.0),
            charging("small", 900.0, 1_000.0, 1_000.0),
        ];
        let plan = plan(80_000.0, &cfg, &chargers);
        let small = plan
            .limits
            .iter()
            .find(|l| l.charger_id == "small")
            .unwrap();
        assert_eq!(small.limit_w, 1_000.0);
    }

    #[test]
    fn unchanged_limits_are_not_resent() {
        let cfg = control();
        // lone charger, plenty of headroom: limit stays at the learned max
        let chargers = vec![charging("A", 3_000.0, 7_500.0, 7_500.0)];
        let plan = plan(3_000.0, &cfg, &chargers);
        assert!(!plan.overload);
        assert!(plan.limits.is_empty());
    }

    #[test]
    fn overload_forces_resend_even_within_tolerance() {
        let mut cfg = control();
        cfg.max_total_power_w = 5_000.0;
        let chargers = vec![charging("A", 6_000.0, 7_500.0, 5_000.0)];
        let plan = plan(6_000.0, &cfg, &chargers);
        assert!(plan.overload);
        assert_eq!(plan.limits.len(), 1);
    }

    #[test]
    fn idle_or_offline_chargers_are_ignored() {
        let cfg = control();
        let mut idle = charging("idle", 0.0, 7_500.0, 7_500.0);
        idle.status = ChargerStatus::Available;
        let mut gone = charging("gone", 0.0, 7_500.0, 7_500.0);
        gone.status = ChargerStatus::Offline;

        let plan = plan(10_000.0, &cfg, &[idle, gone]);
        assert_eq!(plan.charging_count, 0);
        assert_eq!(plan.waiting_count, 1);
        assert!(plan.limits.is_empty());
    }

    proptest! {
        #[test]
        fn limits_respect_floor_and_learned_ceiling(
            site_power_w in 0.0f64..200_000.0,
            specs in prop::collection::vec((100.0f64..50_000.0, 0.0f64..50_000.0), 1..8),
        ) {
            let cfg = control();
            let chargers: Vec<ChargerSnapshot> = specs
                .iter()
                .enumerate()
                // absurd applied limit so every computed limit is emitted
                .map(|(i, (learned, power))| charging(&format!("CP-{i}"), *power, *learned, -1.0))
                .collect();

            let plan = plan(site_power_w, &cfg, &chargers);
            prop_assert_eq!(plan.limits.len(), chargers.len());

            let mut total = 0.0;
            for (limit, cp) in plan.limits.iter().zip(&chargers) {
                prop_assert!(limit.limit_w <= cp.learned_max_power_w + 1e-9);
                let floor = cfg.min_charge_power_w.min(cp.learned_max_power_w);
                prop_assert!(limit.limit_w >= floor - 1e-9);
                total += limit.limit_w;
            }

            // group budget is only ever exceeded by floor clamping
            let slack = chargers.len() as f64 * cfg.min_charge_power_w;
            prop_assert!(total <= plan.available_for_group_w + slack + 1e-6);
        }
    }
}
