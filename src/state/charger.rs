//! Per-charger state record and the frame-driven update rules

use std::collections::VecDeque;
use std::fmt;

use chrono::{DateTime, Utc};
use serde_json::Value;

/// Power above which a charger is assumed to be charging regardless of its
/// reported status, and below which a reported `Charging` is assumed stale.
pub const POWER_INFERENCE_THRESHOLD_W: f64 = 500.0;

/// A reading must exceed the learned maximum by this factor before the
/// maximum is raised, so meter jitter does not inflate it.
pub const LEARNING_HEADROOM: f64 = 1.01;

/// OCPP 1.6 charge point status, plus the gateway-internal `Offline`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChargerStatus {
    Available,
    Preparing,
    Charging,
    SuspendedEv,
    SuspendedEvse,
    Finishing,
    Reserved,
    Unavailable,
    Faulted,
    /// Downstream WebSocket is gone; set by the gateway, never by the charger
    Offline,
}

impl ChargerStatus {
    /// Map the wire status string from a `StatusNotification` payload.
    pub fn from_ocpp(s: &str) -> Option<Self> {
        Some(match s {
            "Available" => Self::Available,
            "Preparing" => Self::Preparing,
            "Charging" => Self::Charging,
            "SuspendedEV" => Self::SuspendedEv,
            "SuspendedEVSE" => Self::SuspendedEvse,
            "Finishing" => Self::Finishing,
            "Reserved" => Self::Reserved,
            "Unavailable" => Self::Unavailable,
            "Faulted" => Self::Faulted,
            _ => return None,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Available => "Available",
            Self::Preparing => "Preparing",
            Self::Charging => "Charging",
            Self::SuspendedEv => "SuspendedEV",
            Self::SuspendedEvse => "SuspendedEVSE",
            Self::Finishing => "Finishing",
            Self::Reserved => "Reserved",
            Self::Unavailable => "Unavailable",
            Self::Faulted => "Faulted",
            Self::Offline => "Offline",
        }
    }
}

impl fmt::Display for ChargerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which peer a buffered frame is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Peer {
    /// The CSMS (charger-originated traffic)
    Upstream,
    /// The charger (CSMS-originated traffic)
    Downstream,
}

#[derive(Debug, Clone)]
pub struct BufferedFrame {
    pub peer: Peer,
    pub text: String,
}

/// Follow-up work a state update asks the connection handler to perform.
/// Returned instead of executed so no registry lock is held across I/O.
#[derive(Debug, Clone, PartialEq)]
pub enum StateEffect {
    /// Push a `SetChargingProfile` restoring this limit (a charge session
    /// ended; the demand loop may re-tighten on its next tick)
    RestoreCap { limit_w: f64 },
    /// The learned maximum grew; persist it
    LearnedNew { max_w: f64 },
}

/// Read-only copy of a charger record, taken per control tick.
#[derive(Debug, Clone)]
pub struct ChargerSnapshot {
    pub charger_id: String,
    pub status: ChargerStatus,
    pub current_power_w: f64,
    pub learned_max_power_w: f64,
    pub current_limit_w: f64,
}

/// One record per charger ID. Created on first connect, never destroyed;
/// reconnects reuse it (keeping the applied limit).
#[derive(Debug, Clone)]
pub struct ChargerState {
    pub status: ChargerStatus,
    pub current_power_w: f64,
    /// Monotonically non-decreasing observed peak, persisted
    pub learned_max_power_w: f64,
    /// Last cap pushed via `SetChargingProfile`
    pub current_limit_w: f64,
    /// Store-and-forward frames awaiting a peer connection
    pub buffer: VecDeque<BufferedFrame>,
    pub connected_at: Option<DateTime<Utc>>,
    pub last_seen: Option<DateTime<Utc>>,
}

impl ChargerState {
    pub fn new(seed_max_power_w: f64) -> Self {
        Self {
            status: ChargerStatus::Available,
            current_power_w: 0.0,
            learned_max_power_w: seed_max_power_w,
            current_limit_w: seed_max_power_w,
            buffer: VecDeque::new(),
            connected_at: None,
            last_seen: None,
        }
    }

    /// Adopt a reported status. A transition out of `Charging` (other than
    /// into `SuspendedEV`) means the session ended and the local cap is
    /// lifted back to the learned maximum.
    pub fn apply_status(&mut self, new_status: ChargerStatus) -> Option<StateEffect> {
        let old = self.status;
        self.status = new_status;
        if old == ChargerStatus::Charging
            && !matches!(
                new_status,
                ChargerStatus::Charging | ChargerStatus::SuspendedEv
            )
        {
            return Some(StateEffect::RestoreCap {
                limit_w: self.learned_max_power_w,
            });
        }
        None
    }

    /// Record a `Power.Active.Import` reading: status inference in both
    /// directions, then peak learning.
    pub fn apply_power_reading(&mut self, watts: f64) -> Vec<StateEffect> {
        let mut effects = Vec::new();
        self.current_power_w = watts;

        if watts > POWER_INFERENCE_THRESHOLD_W
            && !matches!(
                self.status,
                ChargerStatus::Charging | ChargerStatus::SuspendedEv | ChargerStatus::SuspendedEvse
            )
        {
            self.status = ChargerStatus::Charging;
        } else if watts <= POWER_INFERENCE_THRESHOLD_W && self.status == ChargerStatus::Charging {
            self.status = ChargerStatus::Available;
            effects.push(StateEffect::RestoreCap {
                limit_w: self.learned_max_power_w,
            });
        }

        if watts > self.learned_max_power_w * LEARNING_HEADROOM {
            self.learned_max_power_w = watts;
            self.current_limit_w = watts;
            effects.push(StateEffect::LearnedNew { max_w: watts });
        }

        effects
    }

    /// Append a frame for a disconnected peer. Returns `false` when the
    /// buffer is full and the frame was dropped.
    pub fn push_buffered(&mut self, peer: Peer, text: String, max_frames: usize) -> bool {
        if self.buffer.len() >= max_frames {
            return false;
        }
        self.buffer.push_back(BufferedFrame { peer, text });
        true
    }

    /// Insert a frame at the front of the buffer (stop commands jump the
    /// queue). When full, the newest ordinary frame makes room.
    pub fn push_buffered_front(&mut self, peer: Peer, text: String, max_frames: usize) -> bool {
        let mut evicted = false;
        if self.buffer.len() >= max_frames {
            self.buffer.pop_back();
            evicted = true;
        }
        self.buffer.push_front(BufferedFrame { peer, text });
        !evicted
    }

    /// Remove and return, in order, every buffered frame addressed to `peer`.
    pub fn take_buffered(&mut self, peer: Peer) -> Vec<String> {
        let mut taken = Vec::new();
        let mut kept = VecDeque::with_capacity(self.buffer.len());
        for frame in self.buffer.drain(..) {
            if frame.peer == peer {
                taken.push(frame.text);
            } else {
                kept.push_back(frame);
            }
        }
        self.buffer = kept;
        taken
    }

    pub fn snapshot(&self, charger_id: &str) -> ChargerSnapshot {
        ChargerSnapshot {
            charger_id: charger_id.to_string(),
            status: self.status,
            current_power_w: self.current_power_w,
            learned_max_power_w: self.learned_max_power_w,
            current_limit_w: self.current_limit_w,
        }
    }
}

/// Extract the first `Power.Active.Import` sample from a `MeterValues`
/// payload, converted to watts. A missing `value` field reads as 0 W.
pub fn active_import_watts(payload: &Value) -> Option<f64> {
    let samples = payload
        .get("meterValue")?
        .get(0)?
        .get("sampledValue")?
        .as_array()?;

    for sample in samples {
        if sample.get("measurand").and_then(Value::as_str) != Some("Power.Active.Import") {
            continue;
        }
        let mut watts = match sample.get("value") {
            None => 0.0,
            Some(v) => v
                .as_f64()
                .or_else(|| v.as_str().and_then(|s| s.trim().parse().ok()))?,
        };
        if sample.get("unit").and_then(Value::as_str) == Some("kW") {
            watts *= 1000.0;
        }
        return Some(watts);
    }
    None
}
