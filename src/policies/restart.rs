//! # Restart policy for the stream supervisor.
//!
//! [`RestartPolicy`] bounds how the supervisor restarts the encoder/browser pair:
//!
//! - `hard_limit`: the restart budget. When the fault counter has reached this value
//!   at the moment a restart is requested, the supervisor shuts down instead.
//! - `forced_interval`: period of the scheduled restart that bounds drift and leaks in the
//!   long-lived browser session (`None` disables it).
//!
//! ```text
//! fault ──► counter += 1 ──► restart requested
//!                               ├─ counter >= hard_limit ─► shutdown
//!                               ├─ sequence in flight    ─► rejected (false)
//!                               └─ otherwise             ─► restart, counter := 0
//! ```

use std::time::Duration;

/// Default restart budget.
pub const DEFAULT_RESTART_LIMIT: u32 = 5;

/// Default interval of the scheduled forced restart (48 hours).
pub const DEFAULT_FORCED_RESTART: Duration = Duration::from_secs(48 * 60 * 60);

/// Policy controlling restart budget and scheduled restarts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RestartPolicy {
    /// Fault count at which a restart request escalates to shutdown.
    pub hard_limit: u32,
    /// Period of the scheduled forced restart (`None` = disabled).
    pub forced_interval: Option<Duration>,
}

impl Default for RestartPolicy {
    /// `hard_limit = 5`, `forced_interval = 48h`.
    fn default() -> Self {
        Self {
            hard_limit: DEFAULT_RESTART_LIMIT,
            forced_interval: Some(DEFAULT_FORCED_RESTART),
        }
    }
}
