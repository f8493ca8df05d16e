//! Client-facing protocol

pub mod control;

pub use control::{ControlCommand, OK_REPLY};
