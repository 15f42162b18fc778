//! Shared gateway state: charger records, site power, pending request IDs

pub mod charger;
pub mod pending;
pub mod registry;
pub mod site_power;

pub use charger::{ChargerSnapshot, ChargerState, ChargerStatus, Peer, StateEffect};
pub use pending::PendingRequests;
pub use registry::{ChargerRegistry, SharedChargerRegistry};
pub use site_power::{SitePower, SitePowerFeed};
