//! Prometheus metrics for a QKD link node.
//!
//! [`LinkMetrics`] mirrors the status board into gauges on every [`LinkMetrics::observe`] call and
//! counts restart requests as a [`qkd_core::Subscribe`]r of the controller's event bus.
//!
//! ## Metrics
//! - `qkd_link_connected` - Gauge
//! - `qkd_process_running{subsystem}` - Gauge
//! - `qkd_coincidences` / `qkd_accidentals` - Gauge, last matcher report
//! - `qkd_frequency_correction` - Gauge
//! - `qkd_servoed_qber` / `qkd_error_fraction` - Gauge
//! - `qkd_final_key_bits_total` - Gauge, cumulative since start
//! - `qkd_restarts_total{subsystem, reason}` - Counter
//!
//! ## HTTP Server
//! This crate does NOT serve `/metrics`; the agent's axum router encodes [`LinkMetrics::gather`]
//! with a [`TextEncoder`].

mod backend;
pub use backend::LinkMetrics;

pub use prometheus::{Encoder, Registry, TextEncoder};
