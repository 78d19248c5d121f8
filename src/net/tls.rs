//! TLS configuration from in-memory PEM material.

use std::io::{Error, ErrorKind};

use axum_server::tls_rustls::RustlsConfig;

use crate::config::TlsConfig;

/// Build the rustls configuration for the listener.
///
/// The PEM text is checked up front so a bad certificate or key is reported
/// by name instead of as a handshake failure later.
pub async fn load_tls_config(tls: &TlsConfig) -> Result<RustlsConfig, Error> {
    check_pem(tls)?;
    RustlsConfig::from_pem(tls.cert.clone().into_bytes(), tls.key.clone().into_bytes()).await
}

fn check_pem(tls: &TlsConfig) -> Result<(), Error> {
    let certs = rustls_pemfile::certs(&mut tls.cert.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| Error::new(ErrorKind::InvalidData, format!("Invalid certificate PEM: {e}")))?;
    if certs.is_empty() {
        return Err(Error::new(
            ErrorKind::InvalidData,
            "No certificate found in PEM data",
        ));
    }

    match rustls_pemfile::private_key(&mut tls.key.as_bytes()) {
        Ok(Some(_)) => Ok(()),
        Ok(None) => Err(Error::new(
            ErrorKind::InvalidData,
            "No private key found in PEM data",
        )),
        Err(e) => Err(Error::new(
            ErrorKind::InvalidData,
            format!("Invalid private key PEM: {e}"),
        )),
    }
}
