//! Gateway-originated OCPP calls
//!
//! The gateway speaks for itself only twice: `SetChargingProfile` to cap a
//! charger and `TriggerMessage` to ask for a meter reading. Each call gets a
//! fresh message ID tracked in the pending set, so the charger's answer is
//! consumed by the downstream parser instead of reaching the CSMS.

use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::bridge::LinkRegistry;
use crate::error::{GatewayError, GatewayResult};
use crate::ocpp::OcppFrame;
use crate::state::{ChargerRegistry, PendingRequests};

/// Fixed profile slot the gateway owns on every charger.
pub const CHARGING_PROFILE_ID: i64 = 9901;

/// Recurring daily schedules need an anchor; any past midnight works.
const CHARGING_SCHEDULE_START: &str = "2025-01-01T00:00:00Z";

fn round2(watts: f64) -> f64 {
    (watts * 100.0).round() / 100.0
}

/// Push a `ChargePointMaxProfile` capping `charger_id` at `limit_w` watts
/// (clamped to `[0, learned_max]`, rounded to two decimals). Returns the
/// tracked message ID.
pub fn send_charging_profile(
    downstream: &LinkRegistry,
    registry: &ChargerRegistry,
    pending: &PendingRequests,
    charger_id: &str,
    limit_w: f64,
) -> GatewayResult<String> {
    let ceiling = registry.learned_max(charger_id).unwrap_or(limit_w);
    let limit_w = round2(limit_w.clamp(0.0, ceiling.max(0.0)));

    let message_id = Uuid::new_v4().to_string();
    let payload = json!({
        "connectorId": 0,
        "csChargingProfiles": {
            "chargingProfileId": CHARGING_PROFILE_ID,
            "stackLevel": 1,
            "chargingProfilePurpose": "ChargePointMaxProfile",
            "chargingProfileKind": "Recurring",
            "recurrencyKind": "Daily",
            "chargingSchedule": {
                "duration": 86400,
                "startSchedule": CHARGING_SCHEDULE_START,
                "chargingRateUnit": "W",
                "chargingSchedulePeriod": [{"startPeriod": 0, "limit": limit_w}]
            }
        }
    });
    let frame = OcppFrame::call(&message_id, "SetChargingProfile", payload);

    pending.track(message_id.clone());
    match downstream.send_to(charger_id, frame.serialize()) {
        Ok(()) => {
            registry.set_current_limit(charger_id, limit_w);
            info!(charger_id, limit_w, "SetChargingProfile sent");
            Ok(message_id)
        }
        Err(_) => {
            pending.untrack(&message_id);
            warn!(charger_id, "Charger not connected; cannot set power limit");
            Err(GatewayError::NotConnected(charger_id.to_string()))
        }
    }
}

/// Ask a charger to report `MeterValues` now.
pub fn send_trigger_message(
    downstream: &LinkRegistry,
    pending: &PendingRequests,
    charger_id: &str,
) -> GatewayResult<String> {
    let message_id = Uuid::new_v4().to_string();
    let frame = OcppFrame::call(
        &message_id,
        "TriggerMessage",
        json!({"requestedMessage": "MeterValues"}),
    );

    pending.track(message_id.clone());
    match downstream.send_to(charger_id, frame.serialize()) {
        Ok(()) => {
            info!(charger_id, "Requesting MeterValues");
            Ok(message_id)
        }
        Err(_) => {
            pending.untrack(&message_id);
            Err(GatewayError::NotConnected(charger_id.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn wired() -> (
        LinkRegistry,
        ChargerRegistry,
        PendingRequests,
        mpsc::UnboundedReceiver<String>,
    ) {
        let links = LinkRegistry::new("downstream");
        let registry = ChargerRegistry::new(100);
        registry.mark_connected("CP-1", 7_500.0);
        let (tx, rx) = mpsc::unbounded_channel();
        links.register("CP-1", tx);
        (links, registry, PendingRequests::new(), rx)
    }

    #[test]
    fn charging_profile_is_clamped_tracked_and_recorded() {
        let (links, registry, pending, mut rx) = wired();

        let message_id =
            send_charging_profile(&links, &registry, &pending, "CP-1", 9_999.0).unwrap();
        assert!(pending.contains(&message_id));

        let frame = OcppFrame::parse(&rx.try_recv().unwrap()).unwrap();
        assert!(frame.is_call_for("SetChargingProfile"));
        assert_eq!(frame.unique_id(), message_id);
        let OcppFrame::Call { payload, .. } = frame else {
            unreachable!()
        };
        assert_eq!(payload["connectorId"], 0);
        let profile = &payload["csChargingProfiles"];
        assert_eq!(profile["chargingProfileId"], 9901);
        assert_eq!(profile["chargingProfilePurpose"], "ChargePointMaxProfile");
        let period = &profile["chargingSchedule"]["chargingSchedulePeriod"][0];
        // clamped to the learned maximum
        assert_eq!(period["limit"], 7_500.0);

        assert_eq!(registry.snapshot()[0].current_limit_w, 7_500.0);
    }

    #[test]
    fn limits_are_rounded_to_two_decimals() {
        let (links, registry, pending, mut rx) = wired();
        send_charging_profile(&links, &registry, &pending, "CP-1", 1234.56789).unwrap();

        let OcppFrame::Call { payload, .. } = OcppFrame::parse(&rx.try_recv().unwrap()).unwrap()
        else {
            unreachable!()
        };
        let limit =
            payload["csChargingProfiles"]["chargingSchedule"]["chargingSchedulePeriod"][0]["limit"]
                .as_f64()
                .unwrap();
        assert_eq!(limit, 1234.57);
    }

    #[test]
    fn disconnected_charger_leaves_no_pending_entry() {
        let links = LinkRegistry::new("downstream");
        let registry = ChargerRegistry::new(100);
        registry.mark_connected("CP-1", 7_500.0);
        let pending = PendingRequests::new();

        let result = send_charging_profile(&links, &registry, &pending, "CP-1", 5_000.0);
        assert!(matches!(result, Err(GatewayError::NotConnected(_))));
        assert!(pending.is_empty());
        // the limit bookkeeping only tracks caps actually delivered
        assert_eq!(registry.snapshot()[0].current_limit_w, 7_500.0);
    }

    #[test]
    fn trigger_message_requests_meter_values() {
        let (links, _registry, pending, mut rx) = wired();
        let message_id = send_trigger_message(&links, &pending, "CP-1").unwrap();

        let frame = OcppFrame::parse(&rx.try_recv().unwrap()).unwrap();
        assert!(frame.is_call_for("TriggerMessage"));
        assert_eq!(frame.unique_id(), message_id);
        let OcppFrame::Call { payload, .. } = frame else {
            unreachable!()
        };
        assert_eq!(payload["requestedMessage"], "MeterValues");
        assert!(pending.contains(&message_id));
    }
}
