//! # pvcontrol - PV Surplus Charge Controller
//!
//! Controls an EV wallbox so the car charges from photovoltaic surplus.
//! A periodic control loop reads the household energy meter and the wallbox,
//! meters the charged energy by source, converges the phase count through an
//! external phase-switching relay and computes the per-phase current
//! setpoint with hysteresis and debouncing.
//!
//! ## Architecture
//!
//! - `config`: JSON configuration with per-component sections
//! - `logging`: structured logging and tracing
//! - `metrics`: Prometheus collectors and exposition
//! - `service`: shared config/data cache with error counter
//! - `relay`: phase-switching relay variants (NO/NC wiring)
//! - `wallbox`: wallbox adapters (simulated, go-e HTTP)
//! - `meter`: household meter adapters
//! - `car`: car telemetry adapters, polled on a slower cadence
//! - `scheduler`: periodic task driver
//! - `controller`: the charge control loop
//! - `web`: REST API, metrics exposition and static UI serving

pub mod car;
pub mod config;
pub mod controller;
pub mod error;
pub mod logging;
pub mod meter;
pub mod metrics;
pub mod relay;
pub mod scheduler;
pub mod service;
pub mod wallbox;
pub mod web;

// Re-export commonly used types
pub use config::Config;
pub use controller::ChargeController;
pub use error::{PvControlError, Result};
