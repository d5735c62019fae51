use std::sync::Arc;

use parking_lot::Mutex;
use rustls::{
    DigitallySignedStruct, DistinguishedName, SignatureScheme,
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::{WebPkiSupportedAlgorithms, verify_tls12_signature, verify_tls13_signature},
    server::danger::{ClientCertVerified, ClientCertVerifier},
};
use rustls_pki_types::{CertificateDer, ServerName, UnixTime};

/// 握手中途截获的对端证书链，会话在“对端已认证”检查点取出。
#[derive(Debug, Default)]
pub(crate) struct PeerCapture {
    chain: Mutex<Option<Vec<CertificateDer<'static>>>>,
}

impl PeerCapture {
    fn record(&self, end_entity: &CertificateDer<'_>, intermediates: &[CertificateDer<'_>]) {
        let chain = std::iter::once(end_entity)
            .chain(intermediates)
            .map(|cert| cert.clone().into_owned())
            .collect();
        *self.chain.lock() = Some(chain);
    }

    pub(crate) fn chain(&self) -> Option<Vec<CertificateDer<'static>>> {
        self.chain.lock().clone()
    }

    pub(crate) fn is_captured(&self) -> bool {
        self.chain.lock().is_some()
    }
}

/// 客户端侧：只截获服务端证书链，链校验推迟到检查点由信任对象完成；握手签名仍照常校验。
#[derive(Debug)]
pub(crate) struct CapturingServerVerifier {
    capture: Arc<PeerCapture>,
    algorithms: WebPkiSupportedAlgorithms,
}

impl CapturingServerVerifier {
    pub(crate) fn new(capture: Arc<PeerCapture>, algorithms: WebPkiSupportedAlgorithms) -> Self {
        Self {
            capture,
            algorithms,
        }
    }
}

impl ServerCertVerifier for CapturingServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        self.capture.record(end_entity, intermediates);
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

/// 服务端侧：按 `verify-peer` 级别请求客户端证书并截获证书链。
#[derive(Debug)]
pub(crate) struct CapturingClientVerifier {
    capture: Arc<PeerCapture>,
    algorithms: WebPkiSupportedAlgorithms,
    offer: bool,
    mandatory: bool,
}

impl CapturingClientVerifier {
    pub(crate) fn new(
        capture: Arc<PeerCapture>,
        algorithms: WebPkiSupportedAlgorithms,
        offer: bool,
        mandatory: bool,
    ) -> Self {
        Self {
            capture,
            algorithms,
            offer,
            mandatory,
        }
    }
}

impl ClientCertVerifier for CapturingClientVerifier {
    fn offer_client_auth(&self) -> bool {
        self.offer
    }

    fn client_auth_mandatory(&self) -> bool {
        self.mandatory
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        self.capture.record(end_entity, intermediates);
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}
