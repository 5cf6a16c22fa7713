//! TLS client handshakes (rustls with the webpki root set).

use std::sync::{Arc, OnceLock};

use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;

use hbridge_common::{TransportError, TransportResult};

use crate::connection::BoxIo;

static CLIENT_CONFIG: OnceLock<Arc<ClientConfig>> = OnceLock::new();

fn client_config() -> TransportResult<Arc<ClientConfig>> {
    if let Some(config) = CLIENT_CONFIG.get() {
        return Ok(config.clone());
    }

    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let config = ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_safe_default_protocol_versions()?
        .with_root_certificates(roots)
        .with_no_client_auth();

    Ok(CLIENT_CONFIG.get_or_init(|| Arc::new(config)).clone())
}

/// Runs a TLS handshake for `host` over `io`.
pub(crate) async fn handshake(io: BoxIo, host: &str) -> TransportResult<BoxIo> {
    let name = ServerName::try_from(host.to_string())
        .map_err(|_| TransportError::InvalidServerName(host.to_string()))?;
    let connector = TlsConnector::from(client_config()?);
    let stream = connector.connect(name, io).await?;
    Ok(Box::new(stream))
}
