//! Meter-values trigger loop
//!
//! Chargers report meter values on their own schedule, which is too slow for
//! demand control. This loop asks every actively charging point for a fresh
//! reading once a minute.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::bridge::LinkRegistry;
use crate::shutdown::ShutdownSignal;
use crate::state::{PendingRequests, SharedChargerRegistry};

use super::commands::send_trigger_message;

pub struct MeterValuesTriggerLoop {
    interval_secs: u64,
    registry: SharedChargerRegistry,
    downstream: Arc<LinkRegistry>,
    pending: Arc<PendingRequests>,
}

impl MeterValuesTriggerLoop {
    pub fn new(
        interval_secs: u64,
        registry: SharedChargerRegistry,
        downstream: Arc<LinkRegistry>,
        pending: Arc<PendingRequests>,
    ) -> Self {
        Self {
            interval_secs,
            registry,
            downstream,
            pending,
        }
    }

    pub fn start(self, shutdown: ShutdownSignal) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(interval_secs = self.interval_secs, "Meter-values trigger loop started");
            let mut ticker = tokio::time::interval(Duration::from_secs(self.interval_secs));
            loop {
                tokio::select! {
                    _ = ticker.tick() => self.tick(),
                    _ = shutdown.notified().wait() => break,
                }
            }
            info!("Meter-values trigger loop stopped");
        })
    }

    fn tick(&self) {
        for charger_id in self.registry.charging_ids() {
            if let Err(e) = send_trigger_message(&self.downstream, &self.pending, &charger_id) {
                warn!(charger_id = charger_id.as_str(), error = %e, "TriggerMessage not sent");
            }
        }
    }
}
