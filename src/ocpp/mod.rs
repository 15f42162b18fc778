//! OCPP 1.6-J transport envelope

pub mod frame;

pub use frame::{FrameError, OcppFrame};
