//! Observability for Session Gate.
//!
//! Provides metrics definitions and the Prometheus recorder.

pub mod metrics;
