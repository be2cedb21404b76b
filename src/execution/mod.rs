pub mod controller;

pub use controller::{ControllerError, ExitReason, PositionController};
