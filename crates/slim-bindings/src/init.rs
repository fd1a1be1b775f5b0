//! Process-wide initialization.

use std::sync::Once;

use slim_session::{Result, SlimError};
use tracing::{debug, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

static CRYPTO_INIT: Once = Once::new();

/// Installs the `ring` provider as the process default for rustls. Later
/// calls do nothing.
pub fn initialize_crypto_provider() {
    CRYPTO_INIT.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            warn!("a rustls crypto provider was already installed");
        } else {
            debug!("rustls ring provider installed");
        }
    });
}

/// Installs a formatting subscriber filtered by `filter` (e.g. `"info"` or
/// `"slim_session=debug"`). Succeeds without effect if a subscriber is
/// already set.
pub fn initialize_tracing(filter: &str) -> Result<()> {
    let filter = EnvFilter::try_new(filter)
        .map_err(|e| SlimError::InvalidArgument(format!("invalid log filter: {}", e)))?;
    if tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(filter)
        .try_init()
        .is_err()
    {
        debug!("tracing subscriber already installed");
    }
    Ok(())
}
