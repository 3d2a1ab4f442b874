use std::sync::Arc;

use parking_lot::Mutex;
use rustls::client::WebPkiServerVerifier;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};

/// Chain presented by the server during the most recent handshake, leaf first.
#[derive(Debug, Clone, Default)]
pub struct PresentedChain(Arc<Mutex<Vec<CertificateDer<'static>>>>);

impl PresentedChain {
    pub fn take(&self) -> Vec<CertificateDer<'static>> {
        std::mem::take(&mut *self.0.lock())
    }

    fn record(&self, end_entity: &CertificateDer<'_>, intermediates: &[CertificateDer<'_>]) {
        let mut chain = self.0.lock();
        chain.clear();
        chain.push(end_entity.clone().into_owned());
        chain.extend(intermediates.iter().map(|c| c.clone().into_owned()));
    }
}

#[derive(Debug)]
enum Policy {
    WebPki(Arc<WebPkiServerVerifier>),
    AcceptAny,
}

/// Certificate verifier that remembers what the server presented before
/// deciding on it, so a rejected certificate can still be reported.
#[derive(Debug)]
pub struct RecordingVerifier {
    policy: Policy,
    provider: Arc<CryptoProvider>,
    presented: PresentedChain,
}

impl RecordingVerifier {
    pub fn verifying(
        inner: Arc<WebPkiServerVerifier>,
        provider: Arc<CryptoProvider>,
        presented: PresentedChain,
    ) -> Self {
        Self {
            policy: Policy::WebPki(inner),
            provider,
            presented,
        }
    }

    /// Accepts any certificate. Handshake signatures are still checked
    /// against the presented key.
    pub fn accepting_any(provider: Arc<CryptoProvider>, presented: PresentedChain) -> Self {
        Self {
            policy: Policy::AcceptAny,
            provider,
            presented,
        }
    }
}

impl ServerCertVerifier for RecordingVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        self.presented.record(end_entity, intermediates);
        match &self.policy {
            Policy::WebPki(inner) => {
                inner.verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
            }
            Policy::AcceptAny => Ok(ServerCertVerified::assertion()),
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
