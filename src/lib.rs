//! # Current Scan
//!
//! Bias-sweep current acquisition over GPIB. A bias voltage source and a
//! picoammeter are polled in a loop on a dedicated thread; queued voltage
//! setpoints are forwarded to the source one per cycle, and every cycle yields a
//! reading of the source's reported voltage and the measured current.
//!
//! ## Crate Structure
//!
//! - **`acquisition`**: the acquisition loop, its lifecycle, the pending setpoint
//!   queue and the event stream (`AcquisitionEvent`).
//! - **`config`**: figment-backed configuration (TOML file + `CURRENT_SCAN_*`
//!   environment variables) with validation.
//! - **`error`**: the `ScanError` enum used across the crate.
//! - **`instrument`**: the blocking transport seam (`Connector` / `Connection`),
//!   the `RateLimitedChannel` that enforces a minimum gap between requests, the
//!   source and meter drivers, a simulated bench, and the VISA transport
//!   (feature `instrument_visa`).
//! - **`plot`**: current-vs-time and current-vs-voltage traces for a front end.
//! - **`storage`**: CSV recording of readings (feature `storage_csv`).
//! - **`sweep`**: voltage sweep generation.
//! - **`tracing_init`**: tracing-subscriber setup.

pub mod acquisition;
pub mod config;
pub mod error;
pub mod instrument;
pub mod plot;
#[cfg(feature = "storage_csv")]
pub mod storage;
pub mod sweep;
pub mod tracing_init;
