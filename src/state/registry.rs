//! Charger registry — one shared record per charger ID
//!
//! Records are created on first connect and never removed; the dashmap's
//! per-entry locks make each update atomic, and every reader works on a
//! cloned snapshot so no entry lock is held across an await.

use std::sync::Arc;

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{error, info, warn};

use crate::ocpp::OcppFrame;

use super::charger::{
    active_import_watts, ChargerSnapshot, ChargerState, ChargerStatus, Peer, StateEffect,
};

pub struct ChargerRegistry {
    chargers: DashMap<String, ChargerState>,
    /// Per-charger store-and-forward bound; overflow drops from the tail
    buffer_max_frames: usize,
}

/// Shared, reference-counted charger registry
pub type SharedChargerRegistry = Arc<ChargerRegistry>;

impl ChargerRegistry {
    pub fn new(buffer_max_frames: usize) -> Self {
        Self {
            chargers: DashMap::new(),
            buffer_max_frames,
        }
    }

    /// Called when a downstream connection is accepted. Creates the record
    /// on first contact (seeded with `seed_max_power_w`); on reconnect the
    /// previously applied power limit is kept. Returns `true` for a charger
    /// never seen before.
    pub fn mark_connected(&self, charger_id: &str, seed_max_power_w: f64) -> bool {
        let now = Utc::now();
        let first_seen = match self.chargers.entry(charger_id.to_string()) {
            Entry::Occupied(mut entry) => {
                let state = entry.get_mut();
                state.status = ChargerStatus::Available;
                state.connected_at = Some(now);
                state.last_seen = Some(now);
                info!(
                    charger_id,
                    learned_max_w = state.learned_max_power_w,
                    kept_limit_w = state.current_limit_w,
                    "Charger reconnected; previous power limit kept"
                );
                false
            }
            Entry::Vacant(entry) => {
                let mut state = ChargerState::new(seed_max_power_w);
                state.connected_at = Some(now);
                state.last_seen = Some(now);
                entry.insert(state);
                info!(charger_id, seed_max_power_w, "New charger registered");
                true
            }
        };
        metrics::gauge!("gateway_known_chargers").set(self.chargers.len() as f64);
        first_seen
    }

    /// Downstream connection gone; the record stays, buffering for it.
    pub fn mark_offline(&self, charger_id: &str) {
        if let Some(mut state) = self.chargers.get_mut(charger_id) {
            state.status = ChargerStatus::Offline;
        }
    }

    pub fn touch(&self, charger_id: &str) {
        if let Some(mut state) = self.chargers.get_mut(charger_id) {
            state.last_seen = Some(Utc::now());
        }
    }

    /// Opportunistically digest a charger-originated frame: status changes,
    /// power readings, inference, peak learning. Returns the follow-up work
    /// for the connection handler; the frame itself is forwarded regardless.
    pub fn apply_frame(&self, charger_id: &str, frame: &OcppFrame) -> Vec<StateEffect> {
        let OcppFrame::Call {
            action, payload, ..
        } = frame
        else {
            return Vec::new();
        };

        match action.as_str() {
            "StatusNotification" => {
                let Some(raw) = payload.get("status").and_then(serde_json::Value::as_str) else {
                    return Vec::new();
                };
                let Some(new_status) = ChargerStatus::from_ocpp(raw) else {
                    warn!(charger_id, status = raw, "Unknown status in StatusNotification");
                    return Vec::new();
                };
                let Some(mut state) = self.chargers.get_mut(charger_id) else {
                    return Vec::new();
                };
                let old_status = state.status;
                let effect = state.apply_status(new_status);
                drop(state);

                info!(charger_id, from = %old_status, to = %new_status, "Status changed");
                if effect.is_some() {
                    info!(charger_id, "Charge session ended; lifting this charger's cap");
                }
                effect.into_iter().collect()
            }
            "MeterValues" => {
                let Some(watts) = active_import_watts(payload) else {
                    return Vec::new();
                };
                let Some(mut state) = self.chargers.get_mut(charger_id) else {
                    return Vec::new();
                };
                let old_status = state.status;
                let effects = state.apply_power_reading(watts);
                let new_status = state.status;
                drop(state);

                info!(charger_id, power_w = watts, "Power reading");
                if new_status != old_status {
                    warn!(
                        charger_id,
                        power_w = watts,
                        from = %old_status,
                        to = %new_status,
                        "Status inferred from power reading"
                    );
                }
                for effect in &effects {
                    if let StateEffect::LearnedNew { max_w } = effect {
                        warn!(charger_id, new_max_w = max_w, "New maximum power learned");
                    }
                }
                effects
            }
            _ => Vec::new(),
        }
    }

    /// Record the cap just pushed to a charger.
    pub fn set_current_limit(&self, charger_id: &str, limit_w: f64) {
        if let Some(mut state) = self.chargers.get_mut(charger_id) {
            state.current_limit_w = limit_w;
        }
    }

    pub fn learned_max(&self, charger_id: &str) -> Option<f64> {
        self.chargers
            .get(charger_id)
            .map(|state| state.learned_max_power_w)
    }

    /// Clone out every record for a control tick.
    pub fn snapshot(&self) -> Vec<ChargerSnapshot> {
        self.chargers
            .iter()
            .map(|entry| entry.value().snapshot(entry.key()))
            .collect()
    }

    pub fn charging_ids(&self) -> Vec<String> {
        self.chargers
            .iter()
            .filter(|entry| entry.status == ChargerStatus::Charging)
            .map(|entry| entry.key().clone())
            .collect()
    }

    // ── Store-and-forward buffer ───────────────────────────────

    pub fn buffer_frame(&self, charger_id: &str, peer: Peer, text: String) {
        match self.chargers.get_mut(charger_id) {
            Some(mut state) => {
                if !state.push_buffered(peer, text, self.buffer_max_frames) {
                    warn!(
                        charger_id,
                        max_frames = self.buffer_max_frames,
                        "Message buffer full; frame dropped"
                    );
                }
            }
            None => error!(charger_id, "No state record; frame dropped"),
        }
    }

    /// Front-insert for frames that must jump the queue (stop commands).
    pub fn buffer_frame_priority(&self, charger_id: &str, peer: Peer, text: String) {
        match self.chargers.get_mut(charger_id) {
            Some(mut state) => {
                if !state.push_buffered_front(peer, text, self.buffer_max_frames) {
                    warn!(
                        charger_id,
                        max_frames = self.buffer_max_frames,
                        "Message buffer full; newest ordinary frame evicted"
                    );
                }
            }
            None => error!(charger_id, "No state record; frame dropped"),
        }
    }

    /// Atomically drain the frames waiting for `peer`, in delivery order.
    pub fn take_buffered(&self, charger_id: &str, peer: Peer) -> Vec<String> {
        self.chargers
            .get_mut(charger_id)
            .map(|mut state| state.take_buffered(peer))
            .unwrap_or_default()
    }
}
