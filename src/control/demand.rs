//! Demand-control loop
//!
//! Every tick: read the site meter, snapshot the registry, recompute the
//! per-charger caps, and push whatever changed. A failing tick is logged and
//! the loop carries on.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::bridge::LinkRegistry;
use crate::config::ControlConfig;
use crate::shutdown::ShutdownSignal;
use crate::state::{PendingRequests, SharedChargerRegistry, SitePowerFeed};

use super::allocator;
use super::commands::send_charging_profile;

pub struct DemandControlLoop {
    control: ControlConfig,
    registry: SharedChargerRegistry,
    site_power: Arc<SitePowerFeed>,
    downstream: Arc<LinkRegistry>,
    pending: Arc<PendingRequests>,
}

impl DemandControlLoop {
    pub fn new(
        control: ControlConfig,
        registry: SharedChargerRegistry,
        site_power: Arc<SitePowerFeed>,
        downstream: Arc<LinkRegistry>,
        pending: Arc<PendingRequests>,
    ) -> Self {
        Self {
            control,
            registry,
            site_power,
            downstream,
            pending,
        }
    }

    /// Spawn the loop. First tick comes after one full interval, giving
    /// chargers time to reconnect and report after a gateway restart.
    pub fn start(self, shutdown: ShutdownSignal) -> JoinHandle<()> {
        tokio::spawn(async move {
            let period = Duration::from_secs(self.control.demand_interval_secs);
            info!(interval_secs = self.control.demand_interval_secs, "Demand-control loop started");

            tokio::select! {
                _ = tokio::time::sleep(period) => {}
                _ = shutdown.notified().wait() => {
                    info!("Demand-control loop stopped");
                    return;
                }
            }

            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => self.tick(),
                    _ = shutdown.notified().wait() => break,
                }
            }
            info!("Demand-control loop stopped");
        })
    }

    fn tick(&self) {
        let site = self.site_power.current();
        let snapshot = self.registry.snapshot();
        let plan = allocator::plan(site.current_total_w, &self.control, &snapshot);

        info!(
            demand_w = plan.total_charger_demand_w,
            available_w = plan.available_for_group_w,
            charging = plan.charging_count,
            waiting = plan.waiting_count,
            site_w = plan.site_power_w,
            other_loads_w = plan.non_charger_site_power_w,
            "Demand check"
        );
        metrics::gauge!("gateway_charging_chargers").set(plan.charging_count as f64);
        metrics::gauge!("gateway_available_power_watts").set(plan.available_for_group_w);

        if plan.overload {
            warn!(
                demand_w = plan.total_charger_demand_w,
                available_w = plan.available_for_group_w,
                "Site overload; rebalancing chargers"
            );
        }

        if plan.limits.is_empty() {
            return;
        }

        info!(count = plan.limits.len(), "Pushing charging-profile updates");
        let mut applied = Vec::new();
        for limit in &plan.limits {
            match send_charging_profile(
                &self.downstream,
                &self.registry,
                &self.pending,
                &limit.charger_id,
                limit.limit_w,
            ) {
                Ok(_) => applied.push(format!("{}: {:.0}W", limit.charger_id, limit.limit_w)),
                Err(e) => warn!(
                    charger_id = limit.charger_id.as_str(),
                    error = %e,
                    "Could not push new limit"
                ),
            }
        }
        if !applied.is_empty() {
            info!(limits = applied.join(" | ").as_str(), "Limits applied");
        }
    }
}
