use std::{sync::OnceLock, time::Duration};

use tracing::debug;

use crate::{Error, Result};

/// Install the process-wide rustls crypto provider once.
pub fn install_rustls_provider() {
    static PROVIDER_INSTALLED: OnceLock<()> = OnceLock::new();
    PROVIDER_INSTALLED.get_or_init(|| {
        if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
            // Another crate installed it first.
            debug!(existing_provider = ?e, "rustls CryptoProvider already installed");
        }
    });
}

/// Build the HTTP client shared by fetches and HTTP deliveries.
///
/// `read_timeout` bounds the gap between two chunks rather than the whole
/// transfer, so large files are not cut off.
pub fn build_client(connect_timeout: Duration, read_timeout: Duration) -> Result<reqwest::Client> {
    install_rustls_provider();

    reqwest::Client::builder()
        .user_agent(concat!("fileflow/", env!("CARGO_PKG_VERSION")))
        .connect_timeout(connect_timeout)
        .read_timeout(read_timeout)
        .pool_max_idle_per_host(8)
        .build()
        .map_err(|e| Error::config(format!("failed to build HTTP client: {e}")))
}
