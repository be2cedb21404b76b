//! Automated EMA trend-reversal trading agent for USD-M futures.
//!
//! A resilient streaming connection (heartbeat, idle watchdog,
//! reconnect-with-backoff, subscription replay) feeds an ordered event queue
//! consumed by a single session task, which maintains incremental EMA5/EMA50
//! state, detects crossover and arc-reversal signals, and drives a race-free
//! single-position state machine against the exchange.

pub mod api;
pub mod config;
pub mod execution;
pub mod indicators;
pub mod models;
pub mod session;
pub mod strategy;
pub mod stream;
