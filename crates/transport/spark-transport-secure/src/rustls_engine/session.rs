use std::{
    io::{self, Read, Write},
    sync::Arc,
};

use rustls::{ClientConfig, ClientConnection, Connection, ServerConfig, ServerConnection};
use rustls_pki_types::{IpAddr, Ipv4Addr, ServerName};

use super::{
    EngineShared,
    trust::RustlsTrust,
    verifier::{CapturingClientVerifier, CapturingServerVerifier, PeerCapture},
};
use crate::{
    config::VerifyPeer,
    engine::{
        CipherSuiteId, ERR_BAD_CERTIFICATE, ERR_BAD_CONFIGURATION, ERR_DECRYPTION,
        ERR_FATAL_ALERT, ERR_INTERNAL, ERR_NEGOTIATION, ERR_PROTOCOL, EngineError, EngineStatus,
        IoStatus, ProtocolVersion, RawIo, SecureSession, SessionState, TrustObject,
    },
    error::UNKNOWN_OS_ERROR,
};

/// `rustls` 连接之上的逐步推进会话。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - `rustls` 本身不做 I/O，会话通过 `read_tls`/`write_tls` 与收发器传入的 [`RawIo`] 交换密文，
///   把“等待方向”原样交还调用方；
/// - 对端证书链由截获式校验器记录，`process_new_packets` 之后若发现新链，
///   立即以 [`EngineStatus::PeerAuthCompleted`] 暂停，让收发器先完成信任评估。
///
/// ## 逻辑（How）
/// - 连接在首次握手时惰性创建，这样 `set_peer_domain_name` 可以在创建之前生效；
/// - 握手循环：先冲刷待发记录，再判断是否完成，最后读入并处理新记录；
/// - 处理失败时尽力发出告警记录后返回失败。
///
/// ## 风险与权衡（Trade-offs）
/// - 写入时先冲刷旧记录再接收新明文，接收后再冲刷一次；第二次冲刷阻塞时，
///   已接收的字节数随 `WouldBlock` 一起返回，由收发器记为剩余量。
pub(crate) struct RustlsSession {
    shared: Arc<EngineShared>,
    incoming: bool,
    server_name: Option<ServerName<'static>>,
    capture: Arc<PeerCapture>,
    connection: Option<Connection>,
    state: SessionState,
    checkpoint_reported: bool,
}

impl RustlsSession {
    pub(crate) fn new(shared: Arc<EngineShared>, incoming: bool) -> Self {
        Self {
            shared,
            incoming,
            server_name: None,
            capture: Arc::new(PeerCapture::default()),
            connection: None,
            state: SessionState::Idle,
            checkpoint_reported: false,
        }
    }

    fn open(&self) -> Result<Connection, rustls::Error> {
        let provider = Arc::clone(&self.shared.provider);
        let algorithms = provider.signature_verification_algorithms;
        if self.incoming {
            let identity = self.shared.identity.as_ref().ok_or_else(|| {
                rustls::Error::General("no server certificate configured".into())
            })?;
            let verify_peer = self.shared.config.verify_peer();
            let verifier = Arc::new(CapturingClientVerifier::new(
                Arc::clone(&self.capture),
                algorithms,
                verify_peer != VerifyPeer::Ignore,
                verify_peer == VerifyPeer::Require,
            ));
            let config = ServerConfig::builder_with_provider(provider)
                .with_safe_default_protocol_versions()?
                .with_client_cert_verifier(verifier)
                .with_single_cert(identity.chain.clone(), identity.key.clone_key())?;
            Ok(Connection::Server(ServerConnection::new(Arc::new(config))?))
        } else {
            let verifier = Arc::new(CapturingServerVerifier::new(
                Arc::clone(&self.capture),
                algorithms,
            ));
            let builder = ClientConfig::builder_with_provider(provider)
                .with_safe_default_protocol_versions()?
                .dangerous()
                .with_custom_certificate_verifier(verifier);
            let config = match self.shared.identity.as_ref() {
                Some(identity) => builder
                    .with_client_auth_cert(identity.chain.clone(), identity.key.clone_key())?,
                None => builder.with_no_client_auth(),
            };
            // 未设置 SNI 时以未指定地址占位，ClientHello 不会携带 server_name 扩展。
            let name = self
                .server_name
                .clone()
                .unwrap_or(ServerName::IpAddress(IpAddr::V4(Ipv4Addr::from([0, 0, 0, 0]))));
            Ok(Connection::Client(ClientConnection::new(
                Arc::new(config),
                name,
            )?))
        }
    }
}

impl SecureSession for RustlsSession {
    fn session_state(&self) -> SessionState {
        self.state
    }

    fn set_peer_domain_name(&mut self, host: &str) -> Result<(), EngineError> {
        let name = ServerName::try_from(host.to_owned()).map_err(|err| {
            EngineError::new(ERR_BAD_CONFIGURATION, format!("invalid server name: {err}"))
        })?;
        self.server_name = Some(name);
        Ok(())
    }

    fn handshake(&mut self, io: &mut dyn RawIo) -> EngineStatus {
        if self.connection.is_none() {
            match self.open() {
                Ok(connection) => self.connection = Some(connection),
                Err(err) => {
                    self.state = SessionState::Aborted;
                    return EngineStatus::Failure(engine_error(&err));
                }
            }
        }
        let Some(connection) = self.connection.as_mut() else {
            return EngineStatus::Failure(EngineError::new(ERR_INTERNAL, "connection missing"));
        };
        self.state = SessionState::Handshake;

        loop {
            if let Some(status) = flush(connection, io) {
                return status;
            }
            if !connection.is_handshaking() {
                self.state = SessionState::Connected;
                return EngineStatus::Success;
            }
            match fill(connection, io) {
                Fill::Data => {}
                Fill::Eof => {
                    self.state = SessionState::Aborted;
                    return EngineStatus::ClosedAbort;
                }
                Fill::Stalled(status) => return status,
            }
            if let Err(err) = connection.process_new_packets() {
                let _ = flush(connection, io);
                self.state = SessionState::Aborted;
                return EngineStatus::Failure(engine_error(&err));
            }
            if !self.checkpoint_reported && self.capture.is_captured() {
                self.checkpoint_reported = true;
                return EngineStatus::PeerAuthCompleted;
            }
        }
    }

    fn copy_peer_trust(&mut self) -> Result<Option<Box<dyn TrustObject>>, EngineStatus> {
        let Some(chain) = self.capture.chain() else {
            return Ok(None);
        };
        if chain.is_empty() {
            return Err(EngineStatus::BadCertificate);
        }
        Ok(Some(Box::new(RustlsTrust::new(
            Arc::clone(&self.shared.provider),
            self.shared.roots.clone(),
            self.shared.crls.clone(),
            chain,
            self.incoming,
        ))))
    }

    fn write(&mut self, io: &mut dyn RawIo, data: &[u8]) -> (usize, EngineStatus) {
        let Some(connection) = self.connection.as_mut() else {
            return (0, not_connected());
        };
        if let Some(status) = flush(connection, io) {
            return (0, status);
        }
        if data.is_empty() {
            return (0, EngineStatus::Success);
        }
        let accepted = match connection.writer().write(data) {
            Ok(accepted) => accepted,
            Err(err) => return (0, EngineStatus::Failure(io_error(&err))),
        };
        match flush(connection, io) {
            Some(status) => (accepted, status),
            None => (accepted, EngineStatus::Success),
        }
    }

    fn read(&mut self, io: &mut dyn RawIo, buf: &mut [u8]) -> (usize, EngineStatus) {
        let Some(connection) = self.connection.as_mut() else {
            return (0, not_connected());
        };
        loop {
            match connection.reader().read(buf) {
                Ok(0) if !buf.is_empty() => {
                    self.state = SessionState::Closed;
                    return (0, EngineStatus::ClosedGraceful);
                }
                Ok(read) => return (read, EngineStatus::Success),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
                    self.state = SessionState::Aborted;
                    return (0, EngineStatus::ClosedAbort);
                }
                Err(err) => return (0, EngineStatus::Failure(io_error(&err))),
            }
            match fill(connection, io) {
                Fill::Data | Fill::Eof => {}
                Fill::Stalled(status) => return (0, status),
            }
            if let Err(err) = connection.process_new_packets() {
                let _ = flush(connection, io);
                self.state = SessionState::Aborted;
                return (0, EngineStatus::Failure(engine_error(&err)));
            }
        }
    }

    fn buffered_read_size(&mut self) -> Result<usize, EngineError> {
        let Some(connection) = self.connection.as_mut() else {
            return Ok(0);
        };
        connection
            .process_new_packets()
            .map(|state| state.plaintext_bytes_to_read())
            .map_err(|err| engine_error(&err))
    }

    fn negotiated_cipher(&self) -> Option<CipherSuiteId> {
        self.connection
            .as_ref()?
            .negotiated_cipher_suite()
            .map(|suite| u16::from(suite.suite()))
    }

    fn negotiated_protocol(&self) -> ProtocolVersion {
        let Some(version) = self
            .connection
            .as_ref()
            .and_then(|connection| connection.protocol_version())
        else {
            return ProtocolVersion::Unknown;
        };
        match version {
            rustls::ProtocolVersion::SSLv2 => ProtocolVersion::Ssl2,
            rustls::ProtocolVersion::SSLv3 => ProtocolVersion::Ssl3,
            rustls::ProtocolVersion::TLSv1_0 => ProtocolVersion::Tls10,
            rustls::ProtocolVersion::TLSv1_1 => ProtocolVersion::Tls11,
            rustls::ProtocolVersion::TLSv1_2 => ProtocolVersion::Tls12,
            rustls::ProtocolVersion::TLSv1_3 => ProtocolVersion::Tls13,
            _ => ProtocolVersion::Unknown,
        }
    }

    fn close(&mut self, io: &mut dyn RawIo) {
        if let Some(connection) = self.connection.as_mut() {
            connection.send_close_notify();
            let _ = flush(connection, io);
        }
        self.state = SessionState::Closed;
    }
}

/// 冲刷待发记录；返回 `Some` 表示无法继续（阻塞、关闭或失败）。
fn flush(connection: &mut Connection, io: &mut dyn RawIo) -> Option<EngineStatus> {
    while connection.wants_write() {
        let mut push = Push {
            io: &mut *io,
            blocked: false,
        };
        match connection.write_tls(&mut push) {
            Ok(_) if push.blocked => return Some(EngineStatus::WouldBlock),
            Ok(_) => {}
            Err(err) => return Some(stall(&err)),
        }
    }
    None
}

enum Fill {
    Data,
    Eof,
    Stalled(EngineStatus),
}

/// 读入一批密文记录。
fn fill(connection: &mut Connection, io: &mut dyn RawIo) -> Fill {
    let mut pull = Pull { io: &mut *io };
    match connection.read_tls(&mut pull) {
        Ok(0) => Fill::Eof,
        Ok(_) => Fill::Data,
        Err(err) => Fill::Stalled(stall(&err)),
    }
}

fn stall(error: &io::Error) -> EngineStatus {
    match error.kind() {
        io::ErrorKind::WouldBlock => EngineStatus::WouldBlock,
        io::ErrorKind::BrokenPipe => EngineStatus::ClosedAbort,
        _ => EngineStatus::Failure(io_error(error)),
    }
}

fn io_error(error: &io::Error) -> EngineError {
    match error.raw_os_error() {
        Some(errno) => EngineError::os(errno),
        None => EngineError::new(UNKNOWN_OS_ERROR, error.to_string()),
    }
}

fn not_connected() -> EngineStatus {
    EngineStatus::Failure(EngineError::new(
        ERR_INTERNAL,
        "handshake has not been started",
    ))
}

/// `rustls` 错误到保留区间错误码的映射。
fn engine_error(error: &rustls::Error) -> EngineError {
    let code = match error {
        rustls::Error::InvalidCertificate(_) | rustls::Error::NoCertificatesPresented => {
            ERR_BAD_CERTIFICATE
        }
        rustls::Error::AlertReceived(_) => ERR_FATAL_ALERT,
        rustls::Error::DecryptError => ERR_DECRYPTION,
        rustls::Error::PeerIncompatible(_) => ERR_NEGOTIATION,
        rustls::Error::General(_) => ERR_INTERNAL,
        _ => ERR_PROTOCOL,
    };
    EngineError::new(code, error.to_string())
}

/// `io::Write` 适配：把 `write_tls` 的输出交给 [`RawIo::push`]。
struct Push<'a> {
    io: &'a mut dyn RawIo,
    blocked: bool,
}

impl Write for Push<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.blocked {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let transfer = self.io.push(buf);
        match transfer.status {
            IoStatus::Complete if transfer.moved == 0 && !buf.is_empty() => {
                Err(io::ErrorKind::WriteZero.into())
            }
            IoStatus::Complete => Ok(transfer.moved),
            IoStatus::WouldBlock => {
                self.blocked = true;
                if transfer.moved > 0 {
                    Ok(transfer.moved)
                } else {
                    Err(io::ErrorKind::WouldBlock.into())
                }
            }
            IoStatus::Closed => Err(io::ErrorKind::BrokenPipe.into()),
            IoStatus::Os(errno) => Err(io::Error::from_raw_os_error(errno)),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// `io::Read` 适配：`read_tls` 经由 [`RawIo::pull`] 取得密文，对端关闭表现为 EOF。
struct Pull<'a> {
    io: &'a mut dyn RawIo,
}

impl Read for Pull<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let transfer = self.io.pull(buf);
        match transfer.status {
            IoStatus::Complete | IoStatus::Closed => Ok(transfer.moved),
            IoStatus::WouldBlock if transfer.moved > 0 => Ok(transfer.moved),
            IoStatus::WouldBlock => Err(io::ErrorKind::WouldBlock.into()),
            IoStatus::Os(errno) => Err(io::Error::from_raw_os_error(errno)),
        }
    }
}
