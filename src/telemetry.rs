//! Telemetry metric name constants.
//!
//! Centralised metric names for labelguard operations. The host application
//! installs its own `metrics` recorder; without one, all metric calls are
//! no-ops.
//!
//! # Metric naming conventions
//!
//! All metrics are prefixed with `labelguard_`. Counters end in `_total`,
//! histograms use meaningful units (e.g. `_seconds`).
//!
//! # Common labels
//!
//! - `status`: lifecycle outcome ("completed", "cancelled", "failed")
//! - `outcome`: session outcome ("done", "cancelled", "not_active",
//!   "went_inactive", "engine_failure", "lifecycle_failure")
//! - `trigger`: what withdrew liveness or requested cancellation

/// Total artifact downloads that settled.
///
/// Labels: `status` ("completed" | "cancelled" | "failed").
pub const DOWNLOADS_TOTAL: &str = "labelguard_downloads_total";

/// Total artifact bytes written by the mirror fetcher.
pub const DOWNLOAD_BYTES_TOTAL: &str = "labelguard_download_bytes_total";

/// Total model loads that settled.
///
/// Labels: `status` ("completed" | "failed").
pub const LOADS_TOTAL: &str = "labelguard_loads_total";

/// Time spent materializing a model into memory, in seconds.
pub const LOAD_DURATION_SECONDS: &str = "labelguard_load_duration_seconds";

/// Total generation sessions that reached a terminal outcome.
///
/// Labels: `outcome`.
pub const SESSIONS_TOTAL: &str = "labelguard_sessions_total";

/// Total text fragments pulled from the generation engine.
pub const SESSION_FRAGMENTS_TOTAL: &str = "labelguard_session_fragments_total";

/// Total sessions cancelled by the coordinator.
///
/// Labels: `trigger`.
pub const CANCELLATIONS_TOTAL: &str = "labelguard_cancellations_total";
