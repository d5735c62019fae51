use std::sync::Arc;

use rustls::{
    CertificateError, RootCertStore,
    client::{WebPkiServerVerifier, danger::ServerCertVerifier},
    crypto::CryptoProvider,
    server::{VerifierBuilderError, WebPkiClientVerifier, danger::ClientCertVerifier},
};
use rustls_pki_types::{CertificateDer, CertificateRevocationListDer, ServerName, UnixTime};

use crate::{
    engine::{ERR_BAD_CONFIGURATION, EngineError, RevocationFlags, TrustObject, TrustPolicy},
    trust::TrustFailureCode,
};

/// 基于 webpki 的信任对象：对截获的对端证书链执行路径构建、有效期、吊销与主机名检查。
///
/// # 契约（What）
/// - 评估只使用本地锚点与 CRL，从不联网；
/// - 没有配置 CRL 时无法构造吊销策略（`revocation_policy` 返回 `None`）；
/// - `BasicX509` 策略不检查主机名，名称不匹配在该策略下被忽略。
pub(crate) struct RustlsTrust {
    provider: Arc<CryptoProvider>,
    roots: RootCertStore,
    crls: Vec<CertificateRevocationListDer<'static>>,
    chain: Vec<CertificateDer<'static>>,
    verifying_client: bool,
    policies: Vec<TrustPolicy>,
}

impl RustlsTrust {
    pub(crate) fn new(
        provider: Arc<CryptoProvider>,
        roots: RootCertStore,
        crls: Vec<CertificateRevocationListDer<'static>>,
        chain: Vec<CertificateDer<'static>>,
        verifying_client: bool,
    ) -> Self {
        Self {
            provider,
            roots,
            crls,
            chain,
            verifying_client,
            policies: vec![TrustPolicy::BasicX509],
        }
    }

    fn checked_host(&self) -> Option<&str> {
        self.policies.iter().find_map(|policy| match policy {
            TrustPolicy::Ssl { host, .. } if !host.is_empty() => Some(host.as_str()),
            _ => None,
        })
    }

    fn revocation(&self) -> Option<RevocationFlags> {
        self.policies.iter().find_map(|policy| match policy {
            TrustPolicy::Revocation(flags) => Some(*flags),
            _ => None,
        })
    }

    fn verify_client(
        &self,
        end_entity: &CertificateDer<'static>,
        intermediates: &[CertificateDer<'static>],
        now: UnixTime,
    ) -> Result<(), TrustFailureCode> {
        let mut builder = WebPkiClientVerifier::builder_with_provider(
            Arc::new(self.roots.clone()),
            Arc::clone(&self.provider),
        );
        if let Some(flags) = self.revocation() {
            builder = builder.with_crls(self.crls.iter().cloned());
            if !flags.use_any_available_method {
                builder = builder.only_check_end_entity_revocation();
            }
            if !flags.require_positive_response {
                builder = builder.allow_unknown_revocation_status();
            }
        }
        let verifier = builder.build().map_err(builder_failure)?;
        verifier
            .verify_client_cert(end_entity, intermediates, now)
            .map(|_| ())
            .map_err(|err| failure_code(&err))
    }

    fn verify_server(
        &self,
        end_entity: &CertificateDer<'static>,
        intermediates: &[CertificateDer<'static>],
        now: UnixTime,
    ) -> Result<(), TrustFailureCode> {
        let mut builder = WebPkiServerVerifier::builder_with_provider(
            Arc::new(self.roots.clone()),
            Arc::clone(&self.provider),
        );
        if let Some(flags) = self.revocation() {
            builder = builder.with_crls(self.crls.iter().cloned());
            if !flags.use_any_available_method {
                builder = builder.only_check_end_entity_revocation();
            }
            if !flags.require_positive_response {
                builder = builder.allow_unknown_revocation_status();
            }
        }
        let verifier = builder.build().map_err(builder_failure)?;

        let host = self.checked_host();
        let server_name = match host {
            Some(host) => ServerName::try_from(host.to_owned())
                .map_err(|_| TrustFailureCode::HostNameMismatch)?,
            None => ServerName::try_from("localhost").map_err(|_| TrustFailureCode::InvalidName)?,
        };
        match verifier.verify_server_cert(end_entity, intermediates, &server_name, &[], now) {
            Ok(_) => Ok(()),
            Err(rustls::Error::InvalidCertificate(
                CertificateError::NotValidForName | CertificateError::NotValidForNameContext { .. },
            )) if host.is_none() => Ok(()),
            Err(err) => Err(failure_code(&err)),
        }
    }
}

impl TrustObject for RustlsTrust {
    fn set_network_fetch_allowed(&mut self, _allowed: bool) -> Result<(), EngineError> {
        Ok(())
    }

    fn revocation_policy(&self, flags: RevocationFlags) -> Option<TrustPolicy> {
        if self.crls.is_empty() {
            return None;
        }
        Some(TrustPolicy::Revocation(flags))
    }

    fn set_policies(&mut self, policies: Vec<TrustPolicy>) -> Result<(), EngineError> {
        if policies.is_empty() {
            return Err(EngineError::new(
                ERR_BAD_CONFIGURATION,
                "at least one trust policy is required",
            ));
        }
        self.policies = policies;
        Ok(())
    }

    fn set_anchor_certificates(
        &mut self,
        anchors: &[CertificateDer<'static>],
        only: bool,
    ) -> Result<(), EngineError> {
        if only {
            self.roots = RootCertStore::empty();
        }
        for anchor in anchors {
            self.roots.add(anchor.clone()).map_err(|err| {
                EngineError::new(
                    ERR_BAD_CONFIGURATION,
                    format!("invalid anchor certificate: {err}"),
                )
            })?;
        }
        Ok(())
    }

    fn evaluate(&mut self) -> Result<(), TrustFailureCode> {
        let (end_entity, intermediates) = self
            .chain
            .split_first()
            .ok_or(TrustFailureCode::CreateChainFailed)?;
        if self.roots.is_empty() {
            return Err(TrustFailureCode::NotTrusted);
        }
        let now = UnixTime::now();
        if self.verifying_client {
            self.verify_client(end_entity, intermediates, now)
        } else {
            self.verify_server(end_entity, intermediates, now)
        }
    }

    fn certificates(&self) -> Vec<CertificateDer<'static>> {
        self.chain.clone()
    }
}

fn builder_failure(error: VerifierBuilderError) -> TrustFailureCode {
    match error {
        VerifierBuilderError::NoRootAnchors => TrustFailureCode::NotTrusted,
        VerifierBuilderError::InvalidCrl(_) => TrustFailureCode::IncompleteCertRevocationCheck,
        _ => TrustFailureCode::VerifyActionFailed,
    }
}

/// webpki 的校验失败到平台结果码的映射。
pub(crate) fn failure_code(error: &rustls::Error) -> TrustFailureCode {
    let rustls::Error::InvalidCertificate(error) = error else {
        return match error {
            rustls::Error::NoCertificatesPresented => TrustFailureCode::CreateChainFailed,
            _ => TrustFailureCode::Other(-1),
        };
    };
    match error {
        CertificateError::Expired | CertificateError::ExpiredContext { .. } => {
            TrustFailureCode::CertificateExpired
        }
        CertificateError::NotValidYet | CertificateError::NotValidYetContext { .. } => {
            TrustFailureCode::CertificateNotValidYet
        }
        CertificateError::Revoked => TrustFailureCode::CertificateRevoked,
        CertificateError::UnknownRevocationStatus
        | CertificateError::ExpiredRevocationList
        | CertificateError::ExpiredRevocationListContext { .. } => {
            TrustFailureCode::IncompleteCertRevocationCheck
        }
        CertificateError::UnknownIssuer => TrustFailureCode::NotTrusted,
        CertificateError::BadSignature => TrustFailureCode::InvalidSignature,
        CertificateError::NotValidForName | CertificateError::NotValidForNameContext { .. } => {
            TrustFailureCode::HostNameMismatch
        }
        CertificateError::InvalidPurpose | CertificateError::InvalidPurposeContext { .. } => {
            TrustFailureCode::InvalidExtendedKeyUsage
        }
        CertificateError::UnhandledCriticalExtension => {
            TrustFailureCode::UnknownCriticalExtensionFlag
        }
        CertificateError::BadEncoding => TrustFailureCode::InvalidCertificateRef,
        CertificateError::ApplicationVerificationFailure => TrustFailureCode::VerifyActionFailed,
        _ => TrustFailureCode::Other(-1),
    }
}
