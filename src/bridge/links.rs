//! Per-charger outbound frame channels
//!
//! Each live WebSocket (charger-facing or CSMS-facing) is represented by an
//! unbounded sender; the task that owns the socket pumps the receiver into
//! it. At most one link per charger per direction: re-registering drops the
//! old sender, which stops the old pump.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{info, warn};

pub struct Link {
    pub charger_id: String,
    sender: mpsc::UnboundedSender<String>,
    pub connected_at: DateTime<Utc>,
}

impl Link {
    fn new(charger_id: &str, sender: mpsc::UnboundedSender<String>) -> Self {
        Self {
            charger_id: charger_id.to_string(),
            sender,
            connected_at: Utc::now(),
        }
    }

    fn send(&self, frame: String) -> Result<(), String> {
        self.sender.send(frame).map_err(|e| e.0)
    }
}

/// One instance per direction: `downstream` delivers to chargers,
/// `upstream` delivers to the CSMS.
pub struct LinkRegistry {
    direction: &'static str,
    links: DashMap<String, Link>,
}

impl LinkRegistry {
    pub fn new(direction: &'static str) -> Self {
        Self {
            direction,
            links: DashMap::new(),
        }
    }

    pub fn register(&self, charger_id: &str, sender: mpsc::UnboundedSender<String>) {
        if self
            .links
            .insert(charger_id.to_string(), Link::new(charger_id, sender))
            .is_some()
        {
            warn!(
                charger_id,
                direction = self.direction,
                "Replacing an existing link; old sender dropped"
            );
        }
        info!(charger_id, direction = self.direction, "Link registered");
        self.update_gauge();
    }

    pub fn unregister(&self, charger_id: &str) {
        if self.links.remove(charger_id).is_some() {
            info!(charger_id, direction = self.direction, "Link unregistered");
        }
        self.update_gauge();
    }

    /// Deliver a frame to the charger's link. On failure (no link, or the
    /// owning pump has gone away) the frame is handed back for buffering.
    pub fn send_to(&self, charger_id: &str, frame: String) -> Result<(), String> {
        match self.links.get(charger_id) {
            Some(link) => link.send(frame),
            None => Err(frame),
        }
    }

    pub fn is_connected(&self, charger_id: &str) -> bool {
        self.links.contains_key(charger_id)
    }

    pub fn connected_ids(&self) -> Vec<String> {
        self.links.iter().map(|entry| entry.key().clone()).collect()
    }

    fn update_gauge(&self) {
        metrics::gauge!("gateway_active_links", "direction" => self.direction)
            .set(self.links.len() as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_without_link_returns_frame() {
        let links = LinkRegistry::new("downstream");
        assert_eq!(links.send_to("CP-1", "hello".into()), Err("hello".into()));
    }

    #[test]
    fn registered_link_receives_frames() {
        let links = LinkRegistry::new("downstream");
        let (tx, mut rx) = mpsc::unbounded_channel();
        links.register("CP-1", tx);

        assert!(links.is_connected("CP-1"));
        links.send_to("CP-1", "frame".into()).unwrap();
        assert_eq!(rx.try_recv().unwrap(), "frame");

        links.unregister("CP-1");
        assert!(!links.is_connected("CP-1"));
    }

    #[test]
    fn dropped_receiver_hands_frame_back() {
        let links = LinkRegistry::new("upstream");
        let (tx, rx) = mpsc::unbounded_channel();
        links.register("CP-1", tx);
        drop(rx);
        assert_eq!(links.send_to("CP-1", "frame".into()), Err("frame".into()));
    }
}
