//! Logging setup for hosts that do not install their own subscriber

use crate::error::{SyncError, SyncResult};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Default filter when `RUST_LOG` is unset
pub const DEFAULT_DIRECTIVE: &str = "medsync_engine=info,sqlx=warn";

/// Install a global fmt subscriber.
///
/// `RUST_LOG` takes precedence over `default_directive`. Fails if a global
/// subscriber is already installed.
pub fn init_tracing(default_directive: &str) -> SyncResult<()> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(default_directive)
            .map_err(|e| SyncError::Configuration(format!("invalid log directive: {e}")))?,
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(true).with_level(true))
        .try_init()
        .map_err(|e| SyncError::Internal(format!("tracing already initialized: {e}")))
}
