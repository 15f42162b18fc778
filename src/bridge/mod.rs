//! The bidirectional OCPP bridge: downstream server, upstream client tasks,
//! and the per-charger outbound channels they share.

pub mod downstream;
pub mod links;
pub mod upstream;

pub use downstream::GatewayServer;
pub use links::LinkRegistry;
pub use upstream::{UpstreamClient, UpstreamTasks};
