//! TLS for `wss` targets.
//!
//! Two trust modes: the default validates the chain against the bundled
//! web PKI roots and checks the host name; pinned mode accepts exactly one
//! leaf certificate, compared byte for byte, and nothing else.

use crate::error::{NetworkErrorKind, TransportError, TransportResult};
use crate::stream::BoxedStream;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{ring, verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{CertificateError, ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::io;
use std::sync::Arc;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

/// Wraps `stream` in TLS for `host`.
pub(crate) async fn upgrade(
    stream: BoxedStream,
    host: &str,
    pinned: Option<&[u8]>,
) -> TransportResult<BoxedStream> {
    let config = client_config(pinned)?;
    let server_name = server_name(host)?;

    match TlsConnector::from(Arc::new(config))
        .connect(server_name, stream)
        .await
    {
        Ok(tls) => {
            debug!(host, pinned = pinned.is_some(), "TLS established");
            Ok(Box::new(tls))
        }
        Err(err) => {
            let err = classify(err, pinned.is_some());
            warn!(host, error = %err, "TLS handshake failed");
            Err(err)
        }
    }
}

fn client_config(pinned: Option<&[u8]>) -> TransportResult<ClientConfig> {
    let provider = Arc::new(ring::default_provider());
    let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()
        .map_err(|err| TransportError::network(NetworkErrorKind::TlsHandshakeFailed, err.to_string()))?;

    let config = match pinned {
        Some(der) => builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(PinnedCertVerifier {
                pinned: der.to_vec(),
                provider,
            }))
            .with_no_client_auth(),
        None => {
            let mut roots = RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            builder.with_root_certificates(roots).with_no_client_auth()
        }
    };
    Ok(config)
}

/// Maps a failed TLS handshake onto the transport's error kinds.
fn classify(err: io::Error, pinned: bool) -> TransportError {
    let Some(tls_error) = err
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<rustls::Error>())
    else {
        return TransportError::Io(err);
    };

    let kind = match tls_error {
        rustls::Error::InvalidCertificate(CertificateError::ApplicationVerificationFailure)
            if pinned =>
        {
            NetworkErrorKind::PinnedCertMismatch
        }
        rustls::Error::InvalidCertificate(CertificateError::NotValidForName) => {
            NetworkErrorKind::TlsCertNameMismatch
        }
        rustls::Error::InvalidCertificate(_) => NetworkErrorKind::TlsCertUntrusted,
        _ => NetworkErrorKind::TlsHandshakeFailed,
    };
    TransportError::network(kind, tls_error.to_string())
}

/// Accepts only the pinned leaf certificate.
///
/// Chain and host name are not checked; handshake signatures still are.
#[derive(Debug)]
struct PinnedCertVerifier {
    pinned: Vec<u8>,
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for PinnedCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        if end_entity.as_ref() == self.pinned.as_slice() {
            Ok(ServerCertVerified::assertion())
        } else {
            Err(rustls::Error::InvalidCertificate(
                CertificateError::ApplicationVerificationFailure,
            ))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Host names become DNS names; IP literals (bracket-less) become IP names.
fn server_name(host: &str) -> TransportResult<ServerName<'static>> {
    ServerName::try_from(host.to_string()).map_err(|err| {
        TransportError::network(NetworkErrorKind::InvalidUrl, format!("{host}: {err}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verifier(pinned: &[u8]) -> PinnedCertVerifier {
        PinnedCertVerifier {
            pinned: pinned.to_vec(),
            provider: Arc::new(ring::default_provider()),
        }
    }

    #[test]
    fn pinned_verifier_accepts_only_exact_bytes() {
        let v = verifier(b"certificate-bytes");
        let name = ServerName::try_from("db.example").unwrap();
        let now = UnixTime::now();

        let good = CertificateDer::from(b"certificate-bytes".to_vec());
        assert!(v.verify_server_cert(&good, &[], &name, &[], now).is_ok());

        let bad = CertificateDer::from(b"other-bytes".to_vec());
        assert!(v.verify_server_cert(&bad, &[], &name, &[], now).is_err());
    }

    #[test]
    fn ip_literals_become_ip_server_names() {
        assert!(matches!(server_name("::1").unwrap(), ServerName::IpAddress(_)));
        assert!(matches!(server_name("10.0.0.1").unwrap(), ServerName::IpAddress(_)));
        assert!(matches!(server_name("db.example").unwrap(), ServerName::DnsName(_)));
        assert!(server_name("[::1]").is_err());
    }

    #[test]
    fn both_trust_modes_build() {
        assert!(client_config(None).is_ok());
        assert!(client_config(Some(b"der")).is_ok());
    }

    #[test]
    fn classify_pin_mismatch() {
        let inner = rustls::Error::InvalidCertificate(CertificateError::ApplicationVerificationFailure);
        let err = classify(io::Error::new(io::ErrorKind::InvalidData, inner), true);
        assert!(matches!(
            err,
            TransportError::Network {
                kind: NetworkErrorKind::PinnedCertMismatch,
                ..
            }
        ));
    }

    #[test]
    fn classify_untrusted_and_plain_io() {
        let inner = rustls::Error::InvalidCertificate(CertificateError::UnknownIssuer);
        let err = classify(io::Error::new(io::ErrorKind::InvalidData, inner), false);
        assert!(matches!(
            err,
            TransportError::Network {
                kind: NetworkErrorKind::TlsCertUntrusted,
                ..
            }
        ));

        let err = classify(io::Error::from(io::ErrorKind::ConnectionReset), false);
        assert!(matches!(err, TransportError::Io(_)));
    }
}
