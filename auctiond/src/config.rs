use std::path::PathBuf;

#[derive(Clone, Debug)]
pub struct AppConfig {
    /// Port the external HTTP transport mounts on. The core never binds it;
    /// it is surfaced here so one env contract covers the whole deployment.
    pub port: u16,

    /// Path of the durable JSON snapshot. Written atomically
    /// (temp file + rename) in the same directory.
    pub state_path: PathBuf,

    /// Bearer token the monitoring daemon must present on the telemetry
    /// sink. When unset, every telemetry push is rejected.
    pub monitor_token: Option<String>,

    /// Wipe all days (and their sample histograms) at boot.
    /// Accepted values: `1`, `true`, `yes`.
    pub force_reset: bool,

    // =========================
    // Release configuration
    // =========================
    /// Flat per-slot refund for bulk release, in credits.
    ///
    /// Deliberately much smaller than the 50% single-release refund:
    /// "drop my whole block" must not be a cheap way to speculate on
    /// future hours and bail out at low cost.
    pub bulk_release_refund: f64,

    // =========================
    // Session configuration
    // =========================
    /// Idle lifetime of a login session. Renewed on every authenticated use.
    pub session_ttl_hours: i64,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let port = std::env::var("PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(8000);

        let state_path = std::env::var("STATE_PATH")
            .unwrap_or_else(|_| "gpu_sched_state.json".to_string())
            .into();

        let monitor_token = std::env::var("GPU_MONITOR_TOKEN")
            .ok()
            .filter(|t| !t.is_empty());

        let force_reset = std::env::var("FORCE_RESET")
            .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);

        Self {
            port,
            state_path,
            monitor_token,
            force_reset,
            bulk_release_refund: 0.34,
            session_ttl_hours: 12,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            port: 8000,
            state_path: "gpu_sched_state.json".into(),
            monitor_token: None,
            force_reset: false,
            bulk_release_refund: 0.34,
            session_ttl_hours: 12,
        }
    }
}
