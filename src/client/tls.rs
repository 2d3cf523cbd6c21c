//! Process-wide TLS trust configuration for `wss` connections.
//!
//! The trust store may only be changed before the first connect in the
//! process; afterwards every setter fails with [`Error::AlreadyConnected`].

use std::io::BufReader;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio_tungstenite::Connector;

use crate::utils::error::{Error, Result};

struct TrustSettings {
    roots: Option<Vec<CertificateDer<'static>>>,
    trust_all: bool,
}

static TRUST: Mutex<TrustSettings> = Mutex::new(TrustSettings {
    roots: None,
    trust_all: false,
});
static CONNECTED: AtomicBool = AtomicBool::new(false);

/// Replaces the webpki roots with the certificates in `pem`.
pub fn set_trust_store(pem: &[u8]) -> Result<()> {
    ensure_not_connected()?;

    let certs = rustls_pemfile::certs(&mut BufReader::new(pem))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Tls(format!("unreadable PEM: {e}")))?;
    if certs.is_empty() {
        return Err(Error::Tls("no certificates found in PEM input".into()));
    }

    let mut trust = TRUST.lock().unwrap_or_else(PoisonError::into_inner);
    trust.roots = Some(certs);
    Ok(())
}

/// Skip server certificate verification entirely. Testing only.
pub fn set_trust_all(trust_all: bool) -> Result<()> {
    ensure_not_connected()?;
    if trust_all {
        tracing::warn!("server certificate verification disabled");
    }
    TRUST
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .trust_all = trust_all;
    Ok(())
}

fn ensure_not_connected() -> Result<()> {
    if CONNECTED.load(Ordering::SeqCst) {
        return Err(Error::AlreadyConnected);
    }
    Ok(())
}

/// Freezes the trust configuration.
pub(crate) fn mark_connected() {
    CONNECTED.store(true, Ordering::SeqCst);
}

pub(crate) fn connector() -> Result<Connector> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::Tls(e.to_string()))?;

    let trust = TRUST.lock().unwrap_or_else(PoisonError::into_inner);
    let config = if trust.trust_all {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate(provider)))
            .with_no_client_auth()
    } else {
        let mut roots = RootCertStore::empty();
        match &trust.roots {
            Some(certs) => {
                for cert in certs {
                    roots
                        .add(cert.clone())
                        .map_err(|e| Error::Tls(format!("invalid trust anchor: {e}")))?;
                }
            }
            None => roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
        }
        builder.with_root_certificates(roots).with_no_client_auth()
    };

    Ok(Connector::Rustls(Arc::new(config)))
}

#[derive(Debug)]
struct AcceptAnyCertificate(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
