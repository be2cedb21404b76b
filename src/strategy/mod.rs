pub mod engine;

pub use engine::{EngineUpdate, SignalEngine};
