//! Process-wide site power reading, fed by the facility meter

use std::sync::RwLock;

use chrono::{DateTime, Utc};

/// Most recent site-wide active power as reported by the energy meter.
#[derive(Debug, Clone, Copy, Default)]
pub struct SitePower {
    /// 0 until the first meter packet arrives
    pub current_total_w: f64,
    pub last_updated: Option<DateTime<Utc>>,
}

/// Written only by the meter HTTP handler, read by the demand loop.
#[derive(Debug, Default)]
pub struct SitePowerFeed {
    inner: RwLock<SitePower>,
}

impl SitePowerFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, watts: f64) {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        guard.current_total_w = watts;
        guard.last_updated = Some(Utc::now());
        drop(guard);
        metrics::gauge!("gateway_site_power_watts").set(watts);
    }

    pub fn current(&self) -> SitePower {
        *self.inner.read().unwrap_or_else(|e| e.into_inner())
    }
}
