//! 基于 `rustls` 的默认安全引擎。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 为 [`SecureEngine`] 契约提供开箱即用的实现：`ring` 作为密码学后端，webpki 负责证书路径校验；
//! - 引擎进程级共享、只读，连接级状态全部位于 [`session`] 中。
//!
//! ## 契约（What）
//! - 入站会话必须配置服务端证书与私钥，否则 `new_context(true)` 返回配置错误；
//! - 配置了 `certificate-authorities` 时，这些证书既是信任根，也是评估时的唯一锚点；
//! - 吊销检查只使用随引擎提供的 CRL，没有 CRL 时吊销策略视为无法构造。
//!
//! ## 风险与权衡（Trade-offs）
//! - 不附带系统信任库；未配置任何信任根时，所有对端证书都会评估为 `UntrustedRoot`。

mod session;
mod trust;
mod verifier;

use std::{fmt, path::Path, sync::Arc};

use rustls::{CipherSuite, RootCertStore, crypto::CryptoProvider};
use rustls_pki_types::{
    CertificateDer, CertificateRevocationListDer, PrivateKeyDer, pem::PemObject,
};

use self::session::RustlsSession;
use crate::{
    TRACE_TARGET,
    config::SecureEngineConfig,
    engine::{CertificateVerifier, CipherSuiteId, SecureEngine, SecureSession},
    error::TransceiverError,
};

/// 本地身份：证书链与私钥。
struct Identity {
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
}

/// 引擎与其创建的所有会话共享的只读状态。
pub(crate) struct EngineShared {
    config: SecureEngineConfig,
    provider: Arc<CryptoProvider>,
    roots: RootCertStore,
    authorities: Option<Vec<CertificateDer<'static>>>,
    crls: Vec<CertificateRevocationListDer<'static>>,
    identity: Option<Identity>,
}

/// [`RustlsEngine`] 的构造器。
///
/// 显式传入的凭据优先；未传入时按配置中的 PEM 路径加载。
pub struct RustlsEngineBuilder {
    config: SecureEngineConfig,
    identity: Option<Identity>,
    authorities: Option<Vec<CertificateDer<'static>>>,
    trusted_roots: Vec<CertificateDer<'static>>,
    crls: Vec<CertificateRevocationListDer<'static>>,
    verifier: Option<Arc<dyn CertificateVerifier>>,
}

impl RustlsEngineBuilder {
    pub fn new(config: SecureEngineConfig) -> Self {
        Self {
            config,
            identity: None,
            authorities: None,
            trusted_roots: Vec::new(),
            crls: Vec::new(),
            verifier: None,
        }
    }

    /// 本地证书链（叶证书在前）与私钥。
    pub fn with_identity(
        mut self,
        chain: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    ) -> Self {
        self.identity = Some(Identity { chain, key });
        self
    }

    /// 固定信任锚点：评估时只信任这些证书。
    pub fn with_certificate_authorities(
        mut self,
        authorities: impl IntoIterator<Item = CertificateDer<'static>>,
    ) -> Self {
        self.authorities = Some(authorities.into_iter().collect());
        self
    }

    /// 非独占的信任根，与固定锚点同时存在时只在锚点之外补充。
    pub fn with_trusted_roots(
        mut self,
        roots: impl IntoIterator<Item = CertificateDer<'static>>,
    ) -> Self {
        self.trusted_roots.extend(roots);
        self
    }

    pub fn with_crls(
        mut self,
        crls: impl IntoIterator<Item = CertificateRevocationListDer<'static>>,
    ) -> Self {
        self.crls.extend(crls);
        self
    }

    /// 握手完成后调用的应用层校验器。
    pub fn with_certificate_verifier(
        mut self,
        verifier: impl CertificateVerifier + 'static,
    ) -> Self {
        self.verifier = Some(Arc::new(verifier));
        self
    }

    pub fn build(self) -> Result<RustlsEngine, TransceiverError> {
        let Self {
            config,
            identity,
            authorities,
            trusted_roots,
            crls,
            verifier,
        } = self;
        config
            .validate()
            .map_err(|err| TransceiverError::configuration(err.to_string()))?;

        let authorities = match (authorities, config.certificate_authorities()) {
            (Some(authorities), _) => Some(authorities),
            (None, Some(path)) => Some(load_certificates(path)?),
            (None, None) => None,
        };
        let identity = match (identity, config.cert_file(), config.key_file()) {
            (Some(identity), _, _) => Some(identity),
            (None, Some(cert_file), Some(key_file)) => Some(Identity {
                chain: load_certificates(cert_file)?,
                key: PrivateKeyDer::from_pem_file(key_file).map_err(|err| {
                    TransceiverError::configuration(format!(
                        "unable to load private key `{}`: {err}",
                        key_file.display()
                    ))
                })?,
            }),
            _ => None,
        };

        let mut roots = RootCertStore::empty();
        for cert in authorities.iter().flatten().chain(&trusted_roots) {
            roots.add(cert.clone()).map_err(|err| {
                TransceiverError::configuration(format!("invalid trust anchor: {err}"))
            })?;
        }

        tracing::debug!(
            target: TRACE_TARGET,
            category = config.trace_category(),
            roots = roots.len(),
            crls = crls.len(),
            has_identity = identity.is_some(),
            "rustls secure engine initialized"
        );

        Ok(RustlsEngine {
            shared: Arc::new(EngineShared {
                config,
                provider: Arc::new(rustls::crypto::ring::default_provider()),
                roots,
                authorities,
                crls,
                identity,
            }),
            verifier,
        })
    }
}

impl fmt::Debug for RustlsEngineBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RustlsEngineBuilder")
            .field("config", &self.config)
            .field("has_identity", &self.identity.is_some())
            .finish_non_exhaustive()
    }
}

fn load_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>, TransceiverError> {
    let describe = |err: rustls_pki_types::pem::Error| {
        TransceiverError::configuration(format!(
            "unable to load certificates `{}`: {err}",
            path.display()
        ))
    };
    CertificateDer::pem_file_iter(path)
        .map_err(describe)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(describe)
}

/// 基于 `rustls` 与 `ring` 的安全引擎。
pub struct RustlsEngine {
    shared: Arc<EngineShared>,
    verifier: Option<Arc<dyn CertificateVerifier>>,
}

impl RustlsEngine {
    pub fn builder(config: SecureEngineConfig) -> RustlsEngineBuilder {
        RustlsEngineBuilder::new(config)
    }
}

impl fmt::Debug for RustlsEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RustlsEngine")
            .field("config", &self.shared.config)
            .finish_non_exhaustive()
    }
}

impl SecureEngine for RustlsEngine {
    fn config(&self) -> &SecureEngineConfig {
        &self.shared.config
    }

    fn new_context(&self, incoming: bool) -> Result<Box<dyn SecureSession>, TransceiverError> {
        if incoming && self.shared.identity.is_none() {
            return Err(TransceiverError::configuration(
                "incoming connections require a server certificate and private key",
            ));
        }
        Ok(Box::new(RustlsSession::new(
            Arc::clone(&self.shared),
            incoming,
        )))
    }

    fn certificate_authorities(&self) -> Option<&[CertificateDer<'static>]> {
        self.shared.authorities.as_deref()
    }

    fn cipher_name(&self, cipher: CipherSuiteId) -> String {
        format!("{:?}", CipherSuite::from(cipher))
    }

    fn certificate_verifier(&self) -> Option<&dyn CertificateVerifier> {
        self.verifier.as_deref()
    }
}
