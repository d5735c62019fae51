use std::{borrow::Cow, fmt, ops::RangeInclusive};

use rustls_pki_types::CertificateDer;

use crate::{
    config::{SecureEngineConfig, VerifyPeer},
    error::TransceiverError,
    info::SecureConnectionInfo,
    trust::TrustFailureCode,
};

/// 协商出的密码套件标识（IANA 编号）。
pub type CipherSuiteId = u16;

/// 引擎保留的协议错误码区间，落入此区间的失败映射为协议错误。
pub const PROTOCOL_ERROR_RANGE: RangeInclusive<i32> = -9849..=-9800;

pub const ERR_PROTOCOL: i32 = -9800;
pub const ERR_NEGOTIATION: i32 = -9801;
pub const ERR_FATAL_ALERT: i32 = -9802;
pub const ERR_BAD_CERTIFICATE: i32 = -9808;
pub const ERR_INTERNAL: i32 = -9810;
pub const ERR_DECRYPTION: i32 = -9845;
pub const ERR_BAD_CONFIGURATION: i32 = -9848;

/// 会话状态机。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum SessionState {
    #[default]
    Idle,
    Handshake,
    Connected,
    Closed,
    Aborted,
}

impl SessionState {
    /// 握手仍需推进。
    pub fn is_handshaking(self) -> bool {
        matches!(self, Self::Idle | Self::Handshake)
    }
}

/// 引擎报告的失败：数值码加诊断文本。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EngineError {
    code: i32,
    detail: Cow<'static, str>,
}

impl EngineError {
    pub fn new(code: i32, detail: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code,
            detail: detail.into(),
        }
    }

    /// 以 OS 错误码表示的失败。
    pub fn os(errno: i32) -> Self {
        Self::new(errno, "operating system error")
    }

    pub fn code(&self) -> i32 {
        self.code
    }

    pub fn is_protocol(&self) -> bool {
        PROTOCOL_ERROR_RANGE.contains(&self.code)
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {})", self.detail, self.code)
    }
}

impl std::error::Error for EngineError {}

/// 每次引擎调用的结果。
///
/// `PeerAuthCompleted` 是握手中的检查点：对端证书链已到达，收发器须在此执行信任评估后再次调用握手。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EngineStatus {
    Success,
    WouldBlock,
    PeerAuthCompleted,
    ClosedGraceful,
    ClosedAbort,
    BadCertificate,
    Failure(EngineError),
}

impl EngineStatus {
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::ClosedGraceful | Self::ClosedAbort)
    }

    /// 失败状态对应的引擎错误；`BadCertificate` 归入保留区间。
    pub fn to_engine_error(&self) -> Option<EngineError> {
        match self {
            Self::Failure(error) => Some(error.clone()),
            Self::BadCertificate => Some(EngineError::new(
                ERR_BAD_CERTIFICATE,
                "bad certificate format",
            )),
            _ => None,
        }
    }
}

impl fmt::Display for EngineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => f.write_str("success"),
            Self::WouldBlock => f.write_str("would block"),
            Self::PeerAuthCompleted => f.write_str("peer authentication completed"),
            Self::ClosedGraceful => f.write_str("connection closed gracefully"),
            Self::ClosedAbort => f.write_str("connection closed abortively"),
            Self::BadCertificate => f.write_str("bad certificate"),
            Self::Failure(error) => fmt::Display::fmt(error, f),
        }
    }
}

/// I/O 桥一次原始读写的结局。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IoStatus {
    Complete,
    WouldBlock,
    Closed,
    Os(i32),
}

/// 原始读写的字节数与结局。`WouldBlock` 时 `moved` 可以大于零。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Transfer {
    pub moved: usize,
    pub status: IoStatus,
}

impl Transfer {
    pub fn complete(moved: usize) -> Self {
        Self {
            moved,
            status: IoStatus::Complete,
        }
    }

    pub fn would_block(moved: usize) -> Self {
        Self {
            moved,
            status: IoStatus::WouldBlock,
        }
    }

    pub fn closed(moved: usize) -> Self {
        Self {
            moved,
            status: IoStatus::Closed,
        }
    }

    pub fn os(moved: usize, errno: i32) -> Self {
        Self {
            moved,
            status: IoStatus::Os(errno),
        }
    }
}

/// 引擎读写原始（密文）字节的通道。
///
/// 收发器在每次引擎调用时传入一个绑定到当前委托的实现，引擎不得跨调用保存它。
pub trait RawIo {
    fn pull(&mut self, buf: &mut [u8]) -> Transfer;

    fn push(&mut self, buf: &[u8]) -> Transfer;
}

/// 协商出的协议版本。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ProtocolVersion {
    Ssl2,
    Ssl3,
    Tls10,
    Tls11,
    Tls12,
    Tls13,
    #[default]
    Unknown,
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ssl2 => "SSL 2.0",
            Self::Ssl3 => "SSL 3.0",
            Self::Tls10 => "TLS 1.0",
            Self::Tls11 => "TLS 1.1",
            Self::Tls12 => "TLS 1.2",
            Self::Tls13 => "TLS 1.3",
            Self::Unknown => "unknown",
        })
    }
}

/// 吊销检查策略的选项。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct RevocationFlags {
    pub use_any_available_method: bool,
    pub require_positive_response: bool,
    pub network_access_disabled: bool,
}

/// 信任评估策略。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TrustPolicy {
    /// TLS 策略：`server` 表示评估的是服务端证书，`host` 为空时不检查主机名。
    Ssl { server: bool, host: String },
    /// 仅做 X.509 基本校验，不检查主机名与用途。
    BasicX509,
    Revocation(RevocationFlags),
}

/// 对端证书链的信任评估对象。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 把“网络取数开关、策略组合、锚点集合、执行评估”拆成离散步骤，
///   由 [`crate::trust`] 按固定顺序驱动，评估结果统一映射为 [`TrustFailureCode`]。
///
/// ## 契约（What）
/// - `revocation_policy` 返回 `None` 表示当前引擎无法构造该吊销策略，调用方视为配置错误；
/// - `set_anchor_certificates(.., true)` 之后只信任给定锚点；
/// - `evaluate` 成功返回 `Ok(())`，失败返回平台结果码；
/// - `certificates` 返回对端链（叶证书在前）。
pub trait TrustObject: Send {
    fn set_network_fetch_allowed(&mut self, allowed: bool) -> Result<(), EngineError>;

    fn revocation_policy(&self, flags: RevocationFlags) -> Option<TrustPolicy>;

    fn set_policies(&mut self, policies: Vec<TrustPolicy>) -> Result<(), EngineError>;

    fn set_anchor_certificates(
        &mut self,
        anchors: &[CertificateDer<'static>],
        only: bool,
    ) -> Result<(), EngineError>;

    fn evaluate(&mut self) -> Result<(), TrustFailureCode>;

    fn certificates(&self) -> Vec<CertificateDer<'static>>;
}

/// 单条连接上的 TLS 会话。
///
/// # 教案级注释
///
/// ## 契约（What）
/// - 每个推进方法都接收 `io`，引擎经由它读写密文；`io` 报告 `WouldBlock` 时，
///   引擎返回 [`EngineStatus::WouldBlock`]，已处理的字节数仍如实返回；
/// - `handshake` 在对端证书链可用时返回一次 [`EngineStatus::PeerAuthCompleted`]；
/// - `copy_peer_trust`：`Ok(None)` 表示对端没有出示证书，`Err(BadCertificate)` 表示证书无法解析；
/// - `write` 返回已接收的明文字节数；`read` 返回已解密并拷贝的明文字节数；
/// - `buffered_read_size` 报告引擎内已解密但尚未取走的字节数。
pub trait SecureSession: Send {
    fn session_state(&self) -> SessionState;

    fn set_peer_domain_name(&mut self, host: &str) -> Result<(), EngineError>;

    fn handshake(&mut self, io: &mut dyn RawIo) -> EngineStatus;

    fn copy_peer_trust(&mut self) -> Result<Option<Box<dyn TrustObject>>, EngineStatus>;

    fn write(&mut self, io: &mut dyn RawIo, data: &[u8]) -> (usize, EngineStatus);

    fn read(&mut self, io: &mut dyn RawIo, buf: &mut [u8]) -> (usize, EngineStatus);

    fn buffered_read_size(&mut self) -> Result<usize, EngineError>;

    fn negotiated_cipher(&self) -> Option<CipherSuiteId>;

    fn negotiated_protocol(&self) -> ProtocolVersion;

    /// 尽力发送关闭通知；失败被忽略。
    fn close(&mut self, io: &mut dyn RawIo);
}

/// 应用提供的连接级证书校验器。
pub trait CertificateVerifier: Send + Sync {
    fn verify(&self, info: &SecureConnectionInfo) -> bool;
}

impl<F> CertificateVerifier for F
where
    F: Fn(&SecureConnectionInfo) -> bool + Send + Sync,
{
    fn verify(&self, info: &SecureConnectionInfo) -> bool {
        self(info)
    }
}

/// 进程级的安全引擎：持有配置与凭据，为每条连接创建会话。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 收发器只依赖此契约，具体 TLS 实现（默认 `rustls`）可替换，测试可注入脚本化引擎；
/// - 配置访问器均有默认实现，直接读取 [`SecureEngineConfig`]。
///
/// ## 契约（What）
/// - 实现必须 `Send + Sync`：同一引擎被多条连接共享；
/// - `new_context` 失败即为配置错误；
/// - `verify_peer_hook` 在握手完成后调用，拒绝时返回 [`TransceiverError::Security`]。
pub trait SecureEngine: Send + Sync {
    fn config(&self) -> &SecureEngineConfig;

    fn new_context(&self, incoming: bool) -> Result<Box<dyn SecureSession>, TransceiverError>;

    /// 已配置的信任锚点；`Some` 时评估只信任这些锚点。
    fn certificate_authorities(&self) -> Option<&[CertificateDer<'static>]>;

    fn cipher_name(&self, cipher: CipherSuiteId) -> String;

    fn certificate_verifier(&self) -> Option<&dyn CertificateVerifier> {
        None
    }

    fn check_cert_name(&self) -> bool {
        self.config().check_cert_name()
    }

    fn revocation_check(&self) -> u32 {
        self.config().revocation_check()
    }

    fn revocation_check_cache_only(&self) -> bool {
        self.config().revocation_check_cache_only()
    }

    fn verify_peer(&self) -> VerifyPeer {
        self.config().verify_peer()
    }

    fn server_name_indication(&self) -> bool {
        self.config().server_name_indication()
    }

    fn trace_level(&self) -> u8 {
        self.config().trace_level()
    }

    fn security_trace_level(&self) -> u8 {
        self.config().security_trace_level()
    }

    fn trace_category(&self) -> &str {
        self.config().trace_category()
    }

    fn verify_depth_max(&self) -> u32 {
        self.config().verify_depth_max()
    }

    /// 握手完成后的应用层校验：证书链长度上限，然后是应用校验器。
    fn verify_peer_hook(
        &self,
        host: &str,
        info: &SecureConnectionInfo,
        description: &str,
    ) -> Result<(), TransceiverError> {
        let depth_max = self.verify_depth_max();
        if depth_max > 0 && info.certs.len() > depth_max as usize {
            return Err(TransceiverError::security(format!(
                "length of peer's certificate chain ({}) exceeds maximum of {depth_max}\n{description}",
                info.certs.len()
            )));
        }
        if let Some(verifier) = self.certificate_verifier()
            && !verifier.verify(info)
        {
            let peer = if host.is_empty() { "peer" } else { host };
            return Err(TransceiverError::security(format!(
                "application certificate verifier rejected {peer}\n{description}"
            )));
        }
        Ok(())
    }
}
