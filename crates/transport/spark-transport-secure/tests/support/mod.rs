//! 集成测试共享的夹具：内存管道委托、脚本化引擎与 rcgen 证书。
//!
//! # 教案式说明
//! - **Why**：收发器的难点在于“部分进度 + 就绪方向”的组合，夹具需要能任意切分与暂停字节流，
//!   并能脱离真实 TLS 精确编排引擎返回值；
//! - **How**：管道两端共享 `Rc<RefCell<_>>` 缓冲，按 `fragment` 切分、按 `stall_every` 注入空转；
//!   脚本化引擎把每次调用记录进 `Arc<Mutex<Script>>`，测试结束后断言调用序列；
//! - **What**：所有夹具仅供测试使用，`expect` 失败即视为夹具自身缺陷。

#![allow(dead_code)]

use std::{
    borrow::Cow,
    cell::{Cell, RefCell},
    collections::VecDeque,
    io,
    rc::Rc,
    sync::{Arc, Mutex, OnceLock},
};

use rcgen::{
    BasicConstraints, CertificateParams, CertificateRevocationListParams, DnType, IsCa, KeyIdMethod,
    KeyPair, RevocationReason, RevokedCertParams, SerialNumber, date_time_ymd,
};
use rustls_pki_types::{
    CertificateDer, CertificateRevocationListDer, PrivateKeyDer, PrivatePkcs8KeyDer,
};
use spark_transport_secure::{
    CipherSuiteId, EngineError, EngineStatus, ProtocolVersion, RawIo, ReadBuf, RevocationFlags,
    SecureEngine, SecureEngineConfig, SecureSession, SessionState, SocketOperation, Transceiver,
    TransceiverError, TransportDelegate, TransportInfo, TrustFailureCode, TrustObject, TrustPolicy,
    WriteBuf,
};

/// 驱动循环的上限，超过即认为状态机没有收敛。
pub const MAX_STEPS: usize = 200_000;

#[derive(Default)]
struct Channel {
    bytes: VecDeque<u8>,
    closed: bool,
}

/// 内存管道的一端。
pub struct PipeEnd {
    name: &'static str,
    inbound: Rc<RefCell<Channel>>,
    outbound: Rc<RefCell<Channel>>,
    fragment: usize,
    stall_every: Option<usize>,
    calls: usize,
    pending_connect: usize,
    descriptor: Option<u64>,
    send_buffer: Option<usize>,
    recv_buffer: Option<usize>,
    pub read_ready: Rc<Cell<Option<bool>>>,
    pub closes: Rc<Cell<usize>>,
    pub buffer_sizes: Rc<Cell<(Option<usize>, Option<usize>)>>,
}

/// 创建一对相连的管道端点；`fragment` 为单次移动的最大字节数。
pub fn pipe(fragment: usize) -> (PipeEnd, PipeEnd) {
    let a_to_b = Rc::new(RefCell::new(Channel::default()));
    let b_to_a = Rc::new(RefCell::new(Channel::default()));
    let end = |name, inbound, outbound| PipeEnd {
        name,
        inbound,
        outbound,
        fragment: fragment.max(1),
        stall_every: None,
        calls: 0,
        pending_connect: 0,
        descriptor: None,
        send_buffer: None,
        recv_buffer: None,
        read_ready: Rc::new(Cell::new(None)),
        closes: Rc::new(Cell::new(0)),
        buffer_sizes: Rc::new(Cell::new((None, None))),
    };
    (
        end("client", Rc::clone(&b_to_a), Rc::clone(&a_to_b)),
        end("server", a_to_b, b_to_a),
    )
}

impl PipeEnd {
    /// 每第 `n` 次读写调用不移动任何字节、直接报告需要等待。
    pub fn with_stalls(mut self, n: usize) -> Self {
        self.stall_every = (n > 0).then_some(n);
        self
    }

    /// 模拟真实套接字：存在描述符并报告内核缓冲区大小。
    pub fn with_socket(mut self, send: Option<usize>, recv: Option<usize>) -> Self {
        self.descriptor = Some(7);
        self.send_buffer = send;
        self.recv_buffer = recv;
        self
    }

    /// 委托自身的连接建立需要先报告 `n` 次写等待。
    pub fn with_pending_connect(mut self, n: usize) -> Self {
        self.pending_connect = n;
        self
    }

    /// 直接向对端注入原始字节（模拟握手前的明文协议）。
    pub fn inject_inbound(&self, bytes: &[u8]) {
        self.inbound.borrow_mut().bytes.extend(bytes);
    }

    pub fn outbound_len(&self) -> usize {
        self.outbound.borrow().bytes.len()
    }

    pub fn drain_outbound(&self) -> Vec<u8> {
        self.outbound.borrow_mut().bytes.drain(..).collect()
    }

    fn stalled(&mut self) -> bool {
        self.calls += 1;
        matches!(self.stall_every, Some(n) if self.calls % n == 0)
    }
}

impl TransportDelegate for PipeEnd {
    fn initialize(
        &mut self,
        _read: &mut ReadBuf<'_>,
        _write: &mut WriteBuf<'_>,
    ) -> io::Result<SocketOperation> {
        if self.pending_connect > 0 {
            self.pending_connect -= 1;
            return Ok(SocketOperation::Write);
        }
        Ok(SocketOperation::None)
    }

    fn read(&mut self, buf: &mut ReadBuf<'_>) -> io::Result<SocketOperation> {
        if self.stalled() {
            return Ok(SocketOperation::Read);
        }
        let mut channel = self.inbound.borrow_mut();
        if channel.bytes.is_empty() && channel.closed {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        let n = self.fragment.min(buf.remaining()).min(channel.bytes.len());
        for (slot, byte) in buf.unfilled_mut()[..n].iter_mut().zip(channel.bytes.drain(..n)) {
            *slot = byte;
        }
        buf.advance(n);
        Ok(if buf.is_complete() {
            SocketOperation::None
        } else {
            SocketOperation::Read
        })
    }

    fn write(&mut self, buf: &mut WriteBuf<'_>) -> io::Result<SocketOperation> {
        if self.stalled() {
            return Ok(SocketOperation::Write);
        }
        let mut channel = self.outbound.borrow_mut();
        if channel.closed {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        let n = self.fragment.min(buf.remaining());
        channel.bytes.extend(&buf.unwritten()[..n]);
        buf.advance(n);
        Ok(if buf.is_complete() {
            SocketOperation::None
        } else {
            SocketOperation::Write
        })
    }

    fn descriptor(&self) -> Option<u64> {
        self.descriptor
    }

    fn send_buffer_size(&self) -> Option<usize> {
        self.send_buffer
    }

    fn recv_buffer_size(&self) -> Option<usize> {
        self.recv_buffer
    }

    fn set_ready(&mut self, operation: SocketOperation, ready: bool) {
        if operation == SocketOperation::Read {
            self.read_ready.set(Some(ready));
        }
    }

    fn set_buffer_size(&mut self, rcv_size: Option<usize>, snd_size: Option<usize>) {
        self.buffer_sizes.set((rcv_size, snd_size));
    }

    fn close(&mut self) {
        self.closes.set(self.closes.get() + 1);
        self.outbound.borrow_mut().closed = true;
    }

    fn describe(&self) -> Cow<'_, str> {
        Cow::Owned(format!("pipe {}", self.name))
    }

    fn info(&self) -> TransportInfo {
        TransportInfo {
            description: format!("pipe {}", self.name),
            rcv_size: self.recv_buffer,
            snd_size: self.send_buffer,
            ..TransportInfo::default()
        }
    }
}

/// 以空缓冲区调用一次 `initialize`。
pub fn step<D: TransportDelegate>(
    transceiver: &mut Transceiver<D>,
) -> Result<SocketOperation, TransceiverError> {
    let mut read_storage = [0u8; 0];
    let write_storage = [0u8; 0];
    transceiver.initialize(
        &mut ReadBuf::new(&mut read_storage),
        &mut WriteBuf::new(&write_storage),
    )
}

/// 交替推进两端握手，任一端失败后立即关闭该端，另一端继续推进直到完成或失败。
pub fn drive_handshake<A: TransportDelegate, B: TransportDelegate>(
    client: &mut Transceiver<A>,
    server: &mut Transceiver<B>,
) -> (Result<(), TransceiverError>, Result<(), TransceiverError>) {
    let mut client_result = None;
    let mut server_result = None;
    for _ in 0..MAX_STEPS {
        if client_result.is_none() {
            match step(client) {
                Ok(SocketOperation::None) => client_result = Some(Ok(())),
                Ok(_) => {}
                Err(err) => {
                    client.close();
                    client_result = Some(Err(err));
                }
            }
        }
        if server_result.is_none() {
            match step(server) {
                Ok(SocketOperation::None) => server_result = Some(Ok(())),
                Ok(_) => {}
                Err(err) => {
                    server.close();
                    server_result = Some(Err(err));
                }
            }
        }
        if let (Some(_), Some(_)) = (&client_result, &server_result) {
            break;
        }
    }
    match (client_result, server_result) {
        (Some(client), Some(server)) => (client, server),
        _ => panic!("handshake did not converge within {MAX_STEPS} steps"),
    }
}

/// 把 `payload` 从 `writer` 传到 `reader`，返回读端收到的字节。
pub fn transfer<A: TransportDelegate, B: TransportDelegate>(
    writer: &mut Transceiver<A>,
    reader: &mut Transceiver<B>,
    payload: &[u8],
) -> Result<Vec<u8>, TransceiverError> {
    let mut received = vec![0u8; payload.len()];
    let mut written = 0;
    let mut read = 0;
    for _ in 0..MAX_STEPS {
        if written < payload.len() {
            let mut buf = WriteBuf::with_position(payload, written);
            writer.write(&mut buf)?;
            written = buf.position();
        }
        if read < received.len() {
            let mut buf = ReadBuf::with_position(&mut received, read);
            reader.read(&mut buf)?;
            read = buf.position();
        }
        if written == payload.len() && read == received.len() {
            return Ok(received);
        }
    }
    panic!("transfer did not converge within {MAX_STEPS} steps");
}

/// 服务端叶证书的固定序列号，吊销列表按它登记。
const SERVER_SERIAL: [u8; 2] = [0x5e, 0xed];

/// 测试用 PKI：两个互不相关的 CA，由第一个 CA 签发的服务端/客户端证书，以及两份 CRL。
pub struct TestPki {
    pub ca: CertificateDer<'static>,
    pub rogue_ca: CertificateDer<'static>,
    /// 由测试 CA 签发、吊销服务端证书的 CRL。
    pub server_revoked_crl: CertificateRevocationListDer<'static>,
    /// 由无关 CA 签发的 CRL，对测试 CA 签发的证书给不出任何结论。
    pub rogue_crl: CertificateRevocationListDer<'static>,
    pub server_chain: Vec<CertificateDer<'static>>,
    server_key: Vec<u8>,
    pub client_chain: Vec<CertificateDer<'static>>,
    client_key: Vec<u8>,
}

impl TestPki {
    pub fn server_key(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.server_key.clone()))
    }

    pub fn client_key(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.client_key.clone()))
    }
}

fn certificate_authority(common_name: &str) -> anyhow::Result<(rcgen::Certificate, KeyPair)> {
    let mut params = CertificateParams::new(Vec::<String>::new())?;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params
        .distinguished_name
        .push(DnType::CommonName, common_name);
    let key = KeyPair::generate()?;
    let cert = params.self_signed(&key)?;
    Ok((cert, key))
}

fn issue(
    names: &[&str],
    serial: Option<&[u8]>,
    issuer: &rcgen::Certificate,
    issuer_key: &KeyPair,
) -> anyhow::Result<(CertificateDer<'static>, Vec<u8>)> {
    let mut params =
        CertificateParams::new(names.iter().map(|name| name.to_string()).collect::<Vec<_>>())?;
    params.serial_number = serial.map(SerialNumber::from_slice);
    let key = KeyPair::generate()?;
    let cert = params.signed_by(&key, issuer, issuer_key)?;
    Ok((cert.der().clone(), key.serialize_der()))
}

fn revocation_list(
    revoked: &[&[u8]],
    issuer: &rcgen::Certificate,
    issuer_key: &KeyPair,
) -> anyhow::Result<CertificateRevocationListDer<'static>> {
    let params = CertificateRevocationListParams {
        this_update: date_time_ymd(2024, 1, 1),
        next_update: date_time_ymd(2099, 1, 1),
        crl_number: SerialNumber::from_slice(&[1]),
        issuing_distribution_point: None,
        revoked_certs: revoked
            .iter()
            .map(|serial| RevokedCertParams {
                serial_number: SerialNumber::from_slice(serial),
                revocation_time: date_time_ymd(2024, 1, 1),
                reason_code: Some(RevocationReason::KeyCompromise),
                invalidity_date: None,
            })
            .collect(),
        key_identifier_method: KeyIdMethod::Sha256,
    };
    let crl = params.signed_by(issuer, issuer_key)?;
    Ok(crl.der().clone())
}

fn generate_pki() -> anyhow::Result<TestPki> {
    let (ca, ca_key) = certificate_authority("spark secure test ca")?;
    let (rogue_ca, rogue_key) = certificate_authority("spark secure rogue ca")?;
    let (server_cert, server_key) = issue(&["localhost"], Some(&SERVER_SERIAL), &ca, &ca_key)?;
    let (client_cert, client_key) = issue(&["client.spark.test"], None, &ca, &ca_key)?;
    Ok(TestPki {
        ca: ca.der().clone(),
        rogue_ca: rogue_ca.der().clone(),
        server_revoked_crl: revocation_list(&[&SERVER_SERIAL], &ca, &ca_key)?,
        rogue_crl: revocation_list(&[], &rogue_ca, &rogue_key)?,
        server_chain: vec![server_cert],
        server_key,
        client_chain: vec![client_cert],
        client_key,
    })
}

/// 证书生成较慢，整个测试进程共享一份。
pub fn pki() -> &'static TestPki {
    static PKI: OnceLock<TestPki> = OnceLock::new();
    PKI.get_or_init(|| generate_pki().expect("rcgen 应能生成测试证书"))
}

/// 脚本化引擎的共享剧本与调用记录。
#[derive(Default)]
pub struct Script {
    pub handshake: VecDeque<EngineStatus>,
    pub peer_trust: Option<Result<Option<TrustScript>, EngineStatus>>,
    pub writes: VecDeque<(usize, EngineStatus)>,
    pub write_log: Vec<usize>,
    pub plaintext: VecDeque<u8>,
    pub reads: VecDeque<EngineStatus>,
    pub buffered_after_read: usize,
    pub peer_domain: Option<String>,
    pub session_closes: usize,
    pub trust_log: TrustLog,
    pub cipher: Option<CipherSuiteId>,
}

/// 信任对象在评估前收到的配置。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TrustLog {
    pub network_fetch: Option<bool>,
    pub policies: Vec<TrustPolicy>,
    pub anchors: Option<(usize, bool)>,
    pub evaluated: bool,
}

/// 信任对象的行为。
#[derive(Clone, Debug)]
pub struct TrustScript {
    pub outcome: Result<(), TrustFailureCode>,
    pub revocation_buildable: bool,
    pub certificates: Vec<CertificateDer<'static>>,
}

impl TrustScript {
    pub fn passing() -> Self {
        Self {
            outcome: Ok(()),
            revocation_buildable: true,
            certificates: vec![CertificateDer::from(vec![0x30, 0x03, 0x02, 0x01, 0x01])],
        }
    }

    pub fn failing(code: TrustFailureCode) -> Self {
        Self {
            outcome: Err(code),
            ..Self::passing()
        }
    }
}

pub type SharedScript = Arc<Mutex<Script>>;

pub struct ScriptedEngine {
    config: SecureEngineConfig,
    authorities: Option<Vec<CertificateDer<'static>>>,
    pub script: SharedScript,
}

impl ScriptedEngine {
    pub fn new(config: SecureEngineConfig) -> Self {
        Self {
            config,
            authorities: None,
            script: SharedScript::default(),
        }
    }

    pub fn with_authorities(mut self, authorities: Vec<CertificateDer<'static>>) -> Self {
        self.authorities = Some(authorities);
        self
    }

    pub fn edit(&self, f: impl FnOnce(&mut Script)) {
        f(&mut self.script.lock().expect("剧本锁未中毒"));
    }
}

impl SecureEngine for ScriptedEngine {
    fn config(&self) -> &SecureEngineConfig {
        &self.config
    }

    fn new_context(&self, _incoming: bool) -> Result<Box<dyn SecureSession>, TransceiverError> {
        Ok(Box::new(ScriptedSession {
            script: Arc::clone(&self.script),
            state: SessionState::Idle,
        }))
    }

    fn certificate_authorities(&self) -> Option<&[CertificateDer<'static>]> {
        self.authorities.as_deref()
    }

    fn cipher_name(&self, cipher: CipherSuiteId) -> String {
        format!("SCRIPTED_{cipher:04X}")
    }
}

struct ScriptedSession {
    script: SharedScript,
    state: SessionState,
}

impl ScriptedSession {
    fn script(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().expect("剧本锁未中毒")
    }
}

impl SecureSession for ScriptedSession {
    fn session_state(&self) -> SessionState {
        self.state
    }

    fn set_peer_domain_name(&mut self, host: &str) -> Result<(), EngineError> {
        self.script().peer_domain = Some(host.to_owned());
        Ok(())
    }

    fn handshake(&mut self, _io: &mut dyn RawIo) -> EngineStatus {
        self.state = SessionState::Handshake;
        let status = self
            .script()
            .handshake
            .pop_front()
            .unwrap_or(EngineStatus::Success);
        match status {
            EngineStatus::Success => self.state = SessionState::Connected,
            EngineStatus::Failure(_) | EngineStatus::ClosedAbort | EngineStatus::ClosedGraceful => {
                self.state = SessionState::Aborted
            }
            _ => {}
        }
        status
    }

    fn copy_peer_trust(&mut self) -> Result<Option<Box<dyn TrustObject>>, EngineStatus> {
        let peer = self.script().peer_trust.clone().unwrap_or(Ok(None));
        peer.map(|trust| {
            trust.map(|behaviour| {
                Box::new(ScriptedTrust {
                    behaviour,
                    script: Arc::clone(&self.script),
                }) as Box<dyn TrustObject>
            })
        })
    }

    fn write(&mut self, _io: &mut dyn RawIo, data: &[u8]) -> (usize, EngineStatus) {
        let mut script = self.script();
        script.write_log.push(data.len());
        match script.writes.pop_front() {
            Some((accepted, status)) => (accepted.min(data.len()), status),
            None => (data.len(), EngineStatus::Success),
        }
    }

    fn read(&mut self, _io: &mut dyn RawIo, buf: &mut [u8]) -> (usize, EngineStatus) {
        let mut script = self.script();
        if let Some(status) = script.reads.pop_front() {
            return (0, status);
        }
        if script.plaintext.is_empty() {
            return (0, EngineStatus::WouldBlock);
        }
        let n = buf.len().min(script.plaintext.len());
        for (slot, byte) in buf[..n].iter_mut().zip(script.plaintext.drain(..n)) {
            *slot = byte;
        }
        (n, EngineStatus::Success)
    }

    fn buffered_read_size(&mut self) -> Result<usize, EngineError> {
        Ok(self.script().buffered_after_read)
    }

    fn negotiated_cipher(&self) -> Option<CipherSuiteId> {
        self.script().cipher
    }

    fn negotiated_protocol(&self) -> ProtocolVersion {
        ProtocolVersion::Tls13
    }

    fn close(&mut self, _io: &mut dyn RawIo) {
        self.script().session_closes += 1;
        self.state = SessionState::Closed;
    }
}

struct ScriptedTrust {
    behaviour: TrustScript,
    script: SharedScript,
}

impl ScriptedTrust {
    fn log(&self, f: impl FnOnce(&mut TrustLog)) {
        f(&mut self.script.lock().expect("剧本锁未中毒").trust_log);
    }
}

impl TrustObject for ScriptedTrust {
    fn set_network_fetch_allowed(&mut self, allowed: bool) -> Result<(), EngineError> {
        self.log(|log| log.network_fetch = Some(allowed));
        Ok(())
    }

    fn revocation_policy(&self, flags: RevocationFlags) -> Option<TrustPolicy> {
        self.behaviour
            .revocation_buildable
            .then_some(TrustPolicy::Revocation(flags))
    }

    fn set_policies(&mut self, policies: Vec<TrustPolicy>) -> Result<(), EngineError> {
        self.log(|log| log.policies = policies);
        Ok(())
    }

    fn set_anchor_certificates(
        &mut self,
        anchors: &[CertificateDer<'static>],
        only: bool,
    ) -> Result<(), EngineError> {
        self.log(|log| log.anchors = Some((anchors.len(), only)));
        Ok(())
    }

    fn evaluate(&mut self) -> Result<(), TrustFailureCode> {
        self.log(|log| log.evaluated = true);
        self.behaviour.outcome
    }

    fn certificates(&self) -> Vec<CertificateDer<'static>> {
        self.behaviour.certificates.clone()
    }
}

/// 以脚本化引擎创建收发器，并返回剧本句柄。
pub fn scripted_transceiver(
    engine: ScriptedEngine,
    delegate: PipeEnd,
    incoming: bool,
) -> (Transceiver<PipeEnd>, SharedScript) {
    let script = Arc::clone(&engine.script);
    let engine: Arc<dyn SecureEngine> = Arc::new(engine);
    let name = if incoming { "adapter" } else { "localhost" };
    (Transceiver::new(engine, delegate, name, incoming), script)
}
