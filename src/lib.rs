//! # OCPP demand-control gateway
//!
//! Sits between a fleet of OCPP 1.6-J chargers (downstream) and a remote
//! CSMS (upstream), bridging traffic transparently in both directions while
//! keeping the whole site under its electrical supply limit:
//!
//! - **bridge**: per-charger WebSocket pair (server accept + CSMS dial) with
//!   store-and-forward buffering and stop-command priority
//! - **state**: charger records (status, power, learned peak, applied cap),
//!   the live site-power reading, and the gateway's pending request IDs
//! - **control**: periodic demand allocator and meter-values trigger loop
//! - **meter**: HTTP ingest for the facility energy meter
//! - **persistence**: the learned-peak-power file

pub mod bridge;
pub mod config;
pub mod control;
pub mod error;
pub mod meter;
pub mod ocpp;
pub mod persistence;
pub mod shutdown;
pub mod state;

pub use config::{default_config_path, AppConfig};
pub use error::{GatewayError, GatewayResult};
