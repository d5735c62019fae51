//! 证书信任评估与失败分类。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 平台评估结果码种类繁多且随引擎变化，上层只需要一个封闭的小分类 [`TrustError`]；
//! - 评估步骤的顺序固定，保证客户端与服务端两种角色得到一致的校验行为。
//!
//! ## 逻辑（How）
//! 1. 禁止评估过程联网补齐中间证书，信任结论必须确定且不阻塞；
//! 2. 开启证书名检查且主机名已知时使用绑定主机名的 TLS 策略，否则使用通用 X.509 策略；
//! 3. 吊销检查级别大于 0 时追加吊销策略（任意可用方式 + 要求肯定应答，仅缓存模式下再禁止联网），
//!    无法构造即为配置错误；
//! 4. 配置了固定信任锚点时，将其设为唯一锚点集合；
//! 5. 执行评估，失败码经 `From<TrustFailureCode>` 查表映射。
//!
//! ## 契约（What）
//! - `verify-peer = 0`：失败仅以 trace 级别记录，返回分类，连接以未验证状态继续；
//! - 其余级别：失败即为致命的 [`TransceiverError::Trust`]。

use std::fmt;

use crate::{
    TRACE_TARGET,
    config::VerifyPeer,
    engine::{RevocationFlags, SecureEngine, TrustObject, TrustPolicy},
    error::TransceiverError,
};

/// 信任评估结果的封闭分类。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum TrustError {
    NoError,
    ChainTooLong,
    HasNonSupportedCriticalExtension,
    HostNameMismatch,
    InvalidBasicConstraints,
    InvalidExtension,
    InvalidNameConstraints,
    InvalidPolicyConstraints,
    InvalidPurpose,
    InvalidSignature,
    InvalidTime,
    PartialChain,
    Revoked,
    RevocationStatusUnknown,
    UntrustedRoot,
    #[default]
    UnknownTrustFailure,
}

impl TrustError {
    pub fn is_ok(self) -> bool {
        self == Self::NoError
    }

    pub fn description(self) -> &'static str {
        match self {
            Self::NoError => "no error",
            Self::ChainTooLong => "the certificate chain length is greater than the specified maximum depth",
            Self::HasNonSupportedCriticalExtension => {
                "the certificate contains an unsupported critical extension"
            }
            Self::HostNameMismatch => "the host name does not match the certificate",
            Self::InvalidBasicConstraints => {
                "a CA certificate does not have valid basic constraints"
            }
            Self::InvalidExtension => "the certificate contains an invalid extension",
            Self::InvalidNameConstraints => "the certificate violates name constraints",
            Self::InvalidPolicyConstraints => "the certificate violates policy constraints",
            Self::InvalidPurpose => "the certificate is not valid for the requested usage",
            Self::InvalidSignature => "the certificate signature is invalid",
            Self::InvalidTime => "the certificate is expired or not yet valid",
            Self::PartialChain => "the certificate chain could not be built up to a trusted root",
            Self::Revoked => "the certificate has been revoked",
            Self::RevocationStatusUnknown => "the revocation status of the certificate is unknown",
            Self::UntrustedRoot => "the certificate chain terminates in an untrusted root",
            Self::UnknownTrustFailure => "unknown trust failure",
        }
    }
}

impl fmt::Display for TrustError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// 信任对象评估失败时报告的平台结果码。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TrustFailureCode {
    PathLengthConstraintExceeded,
    UnknownCrlExtension,
    UnknownCriticalExtensionFlag,
    HostNameMismatch,
    CodeSigningNoBasicConstraints,
    NoBasicConstraints,
    NoBasicConstraintsCa,
    MissingRequiredExtension,
    UnknownCertExtension,
    CertificateNameNotAllowed,
    InvalidName,
    CertificatePolicyNotAllowed,
    InvalidPolicyIdentifiers,
    InvalidCertificateRef,
    InvalidDigestAlgorithm,
    UnsupportedKeySize,
    InvalidExtendedKeyUsage,
    InvalidKeyUsageForPolicy,
    InvalidSignature,
    CertificateExpired,
    CertificateNotValidYet,
    CertificateValidityPeriodTooLong,
    CreateChainFailed,
    CertificateRevoked,
    IncompleteCertRevocationCheck,
    OcspNotTrustedToAnchor,
    NotTrusted,
    VerifyActionFailed,
    /// 未收录的平台码。
    Other(i64),
}

impl From<TrustFailureCode> for TrustError {
    fn from(code: TrustFailureCode) -> Self {
        use TrustFailureCode as C;
        match code {
            C::PathLengthConstraintExceeded => Self::ChainTooLong,
            C::UnknownCrlExtension | C::UnknownCriticalExtensionFlag => {
                Self::HasNonSupportedCriticalExtension
            }
            C::HostNameMismatch => Self::HostNameMismatch,
            C::CodeSigningNoBasicConstraints | C::NoBasicConstraints | C::NoBasicConstraintsCa => {
                Self::InvalidBasicConstraints
            }
            C::MissingRequiredExtension | C::UnknownCertExtension => Self::InvalidExtension,
            C::CertificateNameNotAllowed | C::InvalidName => Self::InvalidNameConstraints,
            C::CertificatePolicyNotAllowed
            | C::InvalidPolicyIdentifiers
            | C::InvalidCertificateRef
            | C::InvalidDigestAlgorithm
            | C::UnsupportedKeySize => Self::InvalidPolicyConstraints,
            C::InvalidExtendedKeyUsage | C::InvalidKeyUsageForPolicy => Self::InvalidPurpose,
            C::InvalidSignature => Self::InvalidSignature,
            C::CertificateExpired
            | C::CertificateNotValidYet
            | C::CertificateValidityPeriodTooLong => Self::InvalidTime,
            C::CreateChainFailed => Self::PartialChain,
            C::CertificateRevoked => Self::Revoked,
            C::IncompleteCertRevocationCheck | C::OcspNotTrustedToAnchor => {
                Self::RevocationStatusUnknown
            }
            C::NotTrusted | C::VerifyActionFailed => Self::UntrustedRoot,
            C::Other(_) => Self::UnknownTrustFailure,
        }
    }
}

/// 按固定顺序配置并评估信任对象，再套用执行策略。
///
/// 成功时返回 `TrustError::NoError`；`verify-peer = 0` 时失败分类同样以 `Ok` 返回。
pub(crate) fn evaluate_peer_trust(
    trust: &mut dyn TrustObject,
    engine: &dyn SecureEngine,
    host: &str,
) -> Result<TrustError, TransceiverError> {
    trust.set_network_fetch_allowed(false).map_err(|err| {
        TransceiverError::configuration(format!("unable to disable network fetch: {err}"))
    })?;

    let mut policies = Vec::with_capacity(2);
    if engine.check_cert_name() && !host.is_empty() {
        policies.push(TrustPolicy::Ssl {
            server: true,
            host: host.to_owned(),
        });
    } else {
        policies.push(TrustPolicy::BasicX509);
    }

    if engine.revocation_check() > 0 {
        let flags = RevocationFlags {
            use_any_available_method: true,
            require_positive_response: true,
            network_access_disabled: engine.revocation_check_cache_only(),
        };
        let policy = trust.revocation_policy(flags).ok_or_else(|| {
            TransceiverError::configuration("unable to create revocation policy")
        })?;
        policies.push(policy);
    }

    trust.set_policies(policies).map_err(|err| {
        TransceiverError::configuration(format!("unable to set trust policies: {err}"))
    })?;

    if let Some(anchors) = engine.certificate_authorities() {
        trust.set_anchor_certificates(anchors, true).map_err(|err| {
            TransceiverError::configuration(format!("unable to set anchor certificates: {err}"))
        })?;
    }

    let error = match trust.evaluate() {
        Ok(()) => return Ok(TrustError::NoError),
        Err(code) => TrustError::from(code),
    };
    enforce(engine, error)
}

/// 对非成功的分类套用 `verify-peer` 执行策略。
pub(crate) fn enforce(
    engine: &dyn SecureEngine,
    error: TrustError,
) -> Result<TrustError, TransceiverError> {
    if error.is_ok() {
        return Ok(error);
    }
    if engine.verify_peer() == VerifyPeer::Ignore {
        if engine.trace_level() >= 1 {
            tracing::trace!(
                target: TRACE_TARGET,
                category = engine.trace_category(),
                trust_error = ?error,
                "ignoring certificate verification failure: {error}"
            );
        }
        return Ok(error);
    }
    if engine.trace_level() >= 1 {
        tracing::debug!(
            target: TRACE_TARGET,
            category = engine.trace_category(),
            trust_error = ?error,
            "certificate verification failure: {error}"
        );
    }
    Err(TransceiverError::Trust {
        error,
        description: error.to_string(),
    })
}
