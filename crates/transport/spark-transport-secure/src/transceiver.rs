use std::{borrow::Cow, net::IpAddr, sync::Arc};

use rustls_pki_types::CertificateDer;

use crate::{
    TRACE_TARGET,
    bridge::{IoBridge, WantFlags},
    buffer::{ReadBuf, SocketOperation, WriteBuf},
    config::VerifyPeer,
    delegate::TransportDelegate,
    engine::{EngineStatus, SecureEngine, SecureSession, TrustObject},
    error::{HANDSHAKE, OperationKind, READ, TransceiverError, WRITE},
    info::SecureConnectionInfo,
    trust::{self, TrustError},
};

/// 有真实描述符时的分包下限。
const MIN_PACKET_SIZE: usize = 512;
/// 无描述符（内存传输等）时的固定分包大小。
const FALLBACK_PACKET_SIZE: usize = 128 * 1024;

/// 收发器对外可见的生命周期阶段。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TransceiverState {
    NotConnected,
    Handshaking,
    Established,
    /// 握手失败后的终止态：此后的 `initialize`/`read`/`write` 一律报错，只允许 `close`。
    Failed,
    Closed,
}

/// 安全通道收发器：在明文委托之上驱动 TLS 握手、信任评估与记录层读写。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 所属连接反复调用 `initialize` 直至返回 [`SocketOperation::None`]，之后以 `read`/`write`
///   搬运明文；任何“需要等待”都以就绪请求返回，从不阻塞；
/// - 收发器独占委托与会话，状态不跨线程共享，因此内部没有任何锁。
///
/// ## 逻辑（How）
/// - 握手前：委托自身的 `initialize` 完成后记为 `connected`，并据描述符推导分包大小；
/// - 握手：首次调用时惰性创建会话（出站且启用 SNI、主机名非 IP 时设置对端域名），
///   在“对端已认证”检查点调用 [`trust`] 评估，再继续推进；
/// - 握手后：快照证书链与密码套件，调用引擎的应用层校验钩子，可选输出一行摘要；
/// - 写：按 `max_send_packet_size` 分包；引擎部分接收后阻塞时，已接收的字节数记入 `buffered`，
///   下一次 `write` 先以零长度写入排空，再把游标推进恰好 `buffered` 字节；
/// - 读：开始前清除委托的读就绪标记，结束后若引擎仍缓存明文则重新置位。
///
/// ## 契约（What）
/// - `buffered` 为 0 或等于最近一次部分接收的字节数，非零时不接受新字节；
/// - `certs` 仅在进入 `Established` 后填充；`verified == (trust_error == Some(NoError))`；
/// - `close` 幂等：释放信任对象与会话，并至多一次转发给委托；
/// - 握手路径上的任何错误都使收发器进入 `Failed`，被拒绝的会话不会再被推进。
///
/// ## 风险与权衡（Trade-offs）
/// - 握手前的读写原样透传给委托；
/// - 不实现超时，由所属连接通过就绪轮询治理。
pub struct Transceiver<D> {
    engine: Arc<dyn SecureEngine>,
    delegate: D,
    incoming: bool,
    host: String,
    adapter_name: String,
    session: Option<Box<dyn SecureSession>>,
    trust: Option<Box<dyn TrustObject>>,
    connected: bool,
    established: bool,
    failed: bool,
    closed: bool,
    flags: WantFlags,
    buffered: usize,
    max_send_packet_size: usize,
    max_recv_packet_size: usize,
    cipher: String,
    certs: Vec<Arc<CertificateDer<'static>>>,
    trust_error: Option<TrustError>,
}

impl<D: TransportDelegate> Transceiver<D> {
    /// `host_or_adapter_name`：出站连接为目标主机名，入站连接为对象适配器名。
    pub fn new(
        engine: Arc<dyn SecureEngine>,
        delegate: D,
        host_or_adapter_name: impl Into<String>,
        incoming: bool,
    ) -> Self {
        let name = host_or_adapter_name.into();
        let (host, adapter_name) = if incoming {
            (String::new(), name)
        } else {
            (name, String::new())
        };
        Self {
            engine,
            delegate,
            incoming,
            host,
            adapter_name,
            session: None,
            trust: None,
            connected: false,
            established: false,
            failed: false,
            closed: false,
            flags: WantFlags::default(),
            buffered: 0,
            max_send_packet_size: FALLBACK_PACKET_SIZE,
            max_recv_packet_size: FALLBACK_PACKET_SIZE,
            cipher: String::new(),
            certs: Vec::new(),
            trust_error: None,
        }
    }

    pub fn outgoing(engine: Arc<dyn SecureEngine>, delegate: D, host: impl Into<String>) -> Self {
        Self::new(engine, delegate, host, false)
    }

    pub fn incoming(
        engine: Arc<dyn SecureEngine>,
        delegate: D,
        adapter_name: impl Into<String>,
    ) -> Self {
        Self::new(engine, delegate, adapter_name, true)
    }

    /// 推进连接建立与 TLS 握手；返回 `None` 表示通道已可用。
    pub fn initialize(
        &mut self,
        read: &mut ReadBuf<'_>,
        write: &mut WriteBuf<'_>,
    ) -> Result<SocketOperation, TransceiverError> {
        if self.closed {
            return Err(TransceiverError::ConnectionLost { errno: None });
        }
        if !self.connected {
            let operation = self
                .delegate
                .initialize(read, write)
                .map_err(TransceiverError::from_delegate)?;
            if operation != SocketOperation::None {
                return Ok(operation);
            }
            self.connected = true;
            self.derive_packet_sizes();
        }
        self.ensure_not_failed(HANDSHAKE)?;
        if self.established {
            return Ok(SocketOperation::None);
        }
        let result = self.advance_handshake();
        if result.is_err() {
            self.failed = true;
        }
        result
    }

    fn advance_handshake(&mut self) -> Result<SocketOperation, TransceiverError> {
        if self.session.is_none() {
            let session = self.open_session()?;
            self.session = Some(session);
        }

        let operation = self.handshake()?;
        if operation != SocketOperation::None {
            return Ok(operation);
        }
        self.complete_handshake()?;
        Ok(SocketOperation::None)
    }

    fn ensure_not_failed(&self, kind: OperationKind) -> Result<(), TransceiverError> {
        if self.failed {
            return Err(TransceiverError::protocol(
                kind,
                format!("handshake already failed\n{}", self.delegate.describe()),
            ));
        }
        Ok(())
    }

    fn derive_packet_sizes(&mut self) {
        if self.delegate.descriptor().is_some() {
            self.max_send_packet_size = self
                .delegate
                .send_buffer_size()
                .unwrap_or(0)
                .max(MIN_PACKET_SIZE);
            self.max_recv_packet_size = self
                .delegate
                .recv_buffer_size()
                .unwrap_or(0)
                .max(MIN_PACKET_SIZE);
        } else {
            self.max_send_packet_size = FALLBACK_PACKET_SIZE;
            self.max_recv_packet_size = FALLBACK_PACKET_SIZE;
        }
    }

    fn open_session(&self) -> Result<Box<dyn SecureSession>, TransceiverError> {
        let mut session = self.engine.new_context(self.incoming)?;
        let send_sni = !self.incoming
            && self.engine.server_name_indication()
            && !self.host.is_empty()
            && self.host.parse::<IpAddr>().is_err();
        if send_sni {
            session.set_peer_domain_name(&self.host).map_err(|err| {
                TransceiverError::security(format!(
                    "setting SNI host failed `{}'\n{err}",
                    self.host
                ))
            })?;
        }
        Ok(session)
    }

    fn handshake(&mut self) -> Result<SocketOperation, TransceiverError> {
        let Self {
            engine,
            delegate,
            session: Some(session),
            trust,
            flags,
            incoming,
            host,
            trust_error,
            ..
        } = self
        else {
            return Err(TransceiverError::protocol(
                HANDSHAKE,
                "secure session is not available",
            ));
        };
        let engine: &dyn SecureEngine = &**engine;
        let role = role(*incoming);

        while session.session_state().is_handshaking() {
            let mut io = IoBridge::new(&mut *delegate, &mut *flags);
            let failure = match session.handshake(&mut io) {
                EngineStatus::Success => break,
                EngineStatus::WouldBlock => {
                    return flags.readiness().ok_or_else(|| {
                        TransceiverError::protocol(
                            HANDSHAKE,
                            format!(
                                "engine blocked without a pending readiness request for new {role} connection\n{}",
                                delegate.describe()
                            ),
                        )
                    });
                }
                status if status.is_closed() => {
                    return Err(TransceiverError::ConnectionLost { errno: None });
                }
                EngineStatus::PeerAuthCompleted => match session.copy_peer_trust() {
                    Ok(None) | Err(EngineStatus::BadCertificate)
                        if *incoming && engine.verify_peer() == VerifyPeer::Request =>
                    {
                        if engine.trace_level() >= 1 {
                            tracing::debug!(
                                target: TRACE_TARGET,
                                category = engine.trace_category(),
                                "client did not present a certificate, continuing unverified"
                            );
                        }
                        continue;
                    }
                    Ok(Some(mut object)) => {
                        let outcome = trust::evaluate_peer_trust(object.as_mut(), engine, host);
                        *trust_error = recorded(&outcome);
                        outcome?;
                        *trust = Some(object);
                        continue;
                    }
                    Ok(None) => {
                        let outcome = trust::enforce(engine, TrustError::UnknownTrustFailure);
                        *trust_error = recorded(&outcome);
                        outcome?;
                        continue;
                    }
                    Err(status) => status,
                },
                other => other,
            };
            return Err(TransceiverError::protocol(
                HANDSHAKE,
                format!(
                    "new {role} connection\n{}\n{failure}",
                    delegate.describe()
                ),
            ));
        }
        Ok(SocketOperation::None)
    }

    fn complete_handshake(&mut self) -> Result<(), TransceiverError> {
        let certs: Vec<_> = self
            .trust
            .as_ref()
            .map(|trust| trust.certificates().into_iter().map(Arc::new).collect())
            .unwrap_or_default();
        let (cipher, protocol) = match self.session.as_ref() {
            Some(session) => (
                session
                    .negotiated_cipher()
                    .map(|id| self.engine.cipher_name(id))
                    .unwrap_or_default(),
                session.negotiated_protocol(),
            ),
            None => Default::default(),
        };

        // 钩子拒绝时不得留下“已建立”的痕迹，快照只在通过后提交。
        let info = SecureConnectionInfo {
            cipher: cipher.clone(),
            certs: certs.clone(),
            ..self.info()
        };
        self.engine
            .verify_peer_hook(&self.host, &info, &self.describe())?;
        self.cipher = cipher;
        self.certs = certs;
        self.established = true;

        if self.engine.security_trace_level() >= 1 {
            let role = role(self.incoming);
            let transport = self.describe();
            if self.cipher.is_empty() {
                tracing::info!(
                    target: TRACE_TARGET,
                    category = self.engine.trace_category(),
                    cipher = "unknown",
                    %transport,
                    "SSL summary for {role} connection"
                );
            } else {
                tracing::info!(
                    target: TRACE_TARGET,
                    category = self.engine.trace_category(),
                    cipher = %self.cipher,
                    %protocol,
                    %transport,
                    "SSL summary for {role} connection"
                );
            }
        }
        Ok(())
    }

    /// 写出 `buf` 的剩余部分；握手前原样透传给委托。
    pub fn write(&mut self, buf: &mut WriteBuf<'_>) -> Result<SocketOperation, TransceiverError> {
        if !self.connected {
            return self
                .delegate
                .write(buf)
                .map_err(TransceiverError::from_delegate);
        }
        self.ensure_not_failed(WRITE)?;
        if buf.is_complete() {
            return Ok(SocketOperation::None);
        }
        let Self {
            delegate,
            session: Some(session),
            flags,
            buffered,
            max_send_packet_size,
            ..
        } = self
        else {
            return Err(TransceiverError::protocol(
                WRITE,
                "secure session is not available",
            ));
        };

        let mut packet_size = buf.remaining().min(*max_send_packet_size);
        while !buf.is_complete() {
            let mut io = IoBridge::new(&mut *delegate, &mut *flags);
            let (processed, status) = if *buffered > 0 {
                session.write(&mut io, &[])
            } else {
                session.write(&mut io, &buf.unwritten()[..packet_size])
            };
            match status {
                EngineStatus::Success => {}
                EngineStatus::WouldBlock => {
                    if *buffered == 0 {
                        *buffered = processed;
                    }
                    return Ok(SocketOperation::Write);
                }
                other => return Err(record_failure(WRITE, other)),
            }

            if *buffered > 0 {
                buf.advance(*buffered);
                *buffered = 0;
            } else {
                buf.advance(processed);
            }
            packet_size = packet_size.min(buf.remaining());
        }
        Ok(SocketOperation::None)
    }

    /// 把明文读入 `buf` 的未填充部分；握手前原样透传给委托。
    pub fn read(&mut self, buf: &mut ReadBuf<'_>) -> Result<SocketOperation, TransceiverError> {
        if !self.connected {
            return self
                .delegate
                .read(buf)
                .map_err(TransceiverError::from_delegate);
        }
        self.ensure_not_failed(READ)?;
        if buf.is_complete() {
            return Ok(SocketOperation::None);
        }
        let Self {
            delegate,
            session: Some(session),
            flags,
            max_recv_packet_size,
            ..
        } = self
        else {
            return Err(TransceiverError::protocol(
                READ,
                "secure session is not available",
            ));
        };

        delegate.set_ready(SocketOperation::Read, false);

        let mut packet_size = buf.remaining().min(*max_recv_packet_size);
        while !buf.is_complete() {
            let mut io = IoBridge::new(&mut *delegate, &mut *flags);
            let (processed, status) =
                session.read(&mut io, &mut buf.unfilled_mut()[..packet_size]);
            match status {
                EngineStatus::Success => {}
                EngineStatus::WouldBlock => {
                    buf.advance(processed);
                    return Ok(SocketOperation::Read);
                }
                other => return Err(record_failure(READ, other)),
            }
            buf.advance(processed);
            packet_size = packet_size.min(buf.remaining());
        }

        // 引擎内仍有已解密的明文时，重新置位读就绪，避免调用方空等 OS 事件。
        let pending = session
            .buffered_read_size()
            .map_err(|err| TransceiverError::Socket { errno: err.code() })?;
        delegate.set_ready(SocketOperation::Read, pending > 0);
        Ok(SocketOperation::None)
    }

    /// 连接关闭的等待策略：主动关闭方等待对端关闭底层连接，被动方立即关闭。
    pub fn closing(&self, initiator: bool) -> SocketOperation {
        if initiator {
            SocketOperation::Read
        } else {
            SocketOperation::None
        }
    }

    /// 释放信任对象与会话，并关闭委托；重复调用无副作用。
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.trust = None;
        if let Some(mut session) = self.session.take() {
            let mut io = IoBridge::new(&mut self.delegate, &mut self.flags);
            session.close(&mut io);
        }
        self.delegate.close();
    }

    pub fn info(&self) -> SecureConnectionInfo {
        SecureConnectionInfo {
            underlying: self.delegate.info(),
            incoming: self.incoming,
            adapter_name: self.adapter_name.clone(),
            host: if self.incoming {
                String::new()
            } else {
                self.host.clone()
            },
            cipher: self.cipher.clone(),
            certs: self.certs.clone(),
            verified: self.verified(),
            trust_error: self.trust_error,
        }
    }

    pub fn state(&self) -> TransceiverState {
        if self.closed {
            TransceiverState::Closed
        } else if self.failed {
            TransceiverState::Failed
        } else if self.established {
            TransceiverState::Established
        } else if self.session.is_some() {
            TransceiverState::Handshaking
        } else {
            TransceiverState::NotConnected
        }
    }

    pub fn protocol(&self) -> &'static str {
        "ssl"
    }

    pub fn describe(&self) -> Cow<'_, str> {
        self.delegate.describe()
    }

    pub fn set_buffer_size(&mut self, rcv_size: Option<usize>, snd_size: Option<usize>) {
        self.delegate.set_buffer_size(rcv_size, snd_size);
    }

    pub fn is_incoming(&self) -> bool {
        self.incoming
    }

    pub fn verified(&self) -> bool {
        self.trust_error == Some(TrustError::NoError)
    }

    pub fn trust_error(&self) -> Option<TrustError> {
        self.trust_error
    }

    pub fn cipher(&self) -> &str {
        &self.cipher
    }

    pub fn certificates(&self) -> &[Arc<CertificateDer<'static>>] {
        &self.certs
    }

    pub fn max_send_packet_size(&self) -> usize {
        self.max_send_packet_size
    }

    pub fn max_recv_packet_size(&self) -> usize {
        self.max_recv_packet_size
    }

    pub fn delegate(&self) -> &D {
        &self.delegate
    }
}

fn role(incoming: bool) -> &'static str {
    if incoming { "incoming" } else { "outgoing" }
}

/// 评估结果中应记录的信任分类；严格策略下的失败同样记录。
fn recorded(outcome: &Result<TrustError, TransceiverError>) -> Option<TrustError> {
    match outcome {
        Ok(error) => Some(*error),
        Err(err) => err.trust_error(),
    }
}

/// 把记录层读写失败映射为致命错误。
///
/// 写路径只把优雅关闭视为连接丢失，异常关闭落入保留区间按协议错误处理；读路径两者都视为连接丢失。
fn record_failure(kind: OperationKind, status: EngineStatus) -> TransceiverError {
    match status {
        EngineStatus::ClosedGraceful => TransceiverError::ConnectionLost { errno: None },
        EngineStatus::ClosedAbort if kind.code == READ.code => {
            TransceiverError::ConnectionLost { errno: None }
        }
        EngineStatus::ClosedAbort => {
            TransceiverError::protocol(kind, "connection closed abortively")
        }
        other => match other.to_engine_error() {
            Some(error) if error.is_protocol() => TransceiverError::protocol(kind, error.to_string()),
            Some(error) => TransceiverError::from_os_error(error.code()),
            None => TransceiverError::protocol(kind, format!("unexpected engine status: {other}")),
        },
    }
}
