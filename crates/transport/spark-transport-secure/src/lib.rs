#![doc = r#"
# spark-transport-secure

## 设计动机（Why）
- **安全通道**：在非阻塞、就绪驱动的明文字节传输之上叠加 TLS 握手与证书信任评估，供 RPC 连接的 I/O 路径使用；
- **同步引擎 × 非阻塞传输**：TLS 引擎以同步、逐步推进的方式读写原始字节，而底层传输只能报告“部分进度 + 就绪方向”，
  本 crate 负责把两者缝合，所有“需要等待”的情况都化为 [`SocketOperation`] 返回给调用方的 reactor；
- **可运维性**：平台信任评估结果被映射为封闭的 [`TrustError`] 分类，校验策略对客户端/服务端一致生效。

## 核心契约（What）
- [`Transceiver`]：安全通道收发器，暴露 `initialize`/`read`/`write`/`closing`/`close`/`info`；
- [`TransportDelegate`]：外部提供的明文非阻塞传输；
- [`SecureEngine`] / [`SecureSession`] / [`TrustObject`]：TLS 引擎与信任评估的可替换契约；
- [`TransceiverError`]：致命错误分类（配置/连接丢失/协议/套接字/信任/安全），`WouldBlock` 不属于错误。

## 实现策略（How）
- I/O 桥（`bridge` 模块）以显式上下文的形式传入每一次引擎调用，取代“回调通过裸指针找回宿主对象”的约定；
- 握手状态机在“对端已认证”检查点暂停，执行信任评估后再继续推进；
- 部分写入的剩余字节以显式字段 `buffered` 建模，必须以零长度写入排空后才能接受新数据；
- 默认特性 `rustls-engine` 提供基于 `rustls` 的引擎实现。

## 风险与考量（Trade-offs）
- 单线程、协作式模型：状态由所属连接独占，不做内部加锁；
- 不实现任何超时，超时由所属连接通过就绪轮询自行治理。
"#]
#![deny(unsafe_code)]
#![allow(clippy::result_large_err)]

mod bridge;
pub mod buffer;
pub mod config;
pub mod delegate;
pub mod engine;
pub mod error;
pub mod info;
mod reload;
mod transceiver;
pub mod trust;

#[cfg(feature = "rustls-engine")]
pub mod rustls_engine;

pub use buffer::{ReadBuf, SocketOperation, WriteBuf};
pub use config::{ConfigError, SecureEngineConfig, VerifyPeer};
pub use delegate::{TransportDelegate, TransportInfo};
pub use engine::{
    CertificateVerifier, CipherSuiteId, EngineError, EngineStatus, IoStatus, ProtocolVersion,
    RawIo, RevocationFlags, SecureEngine, SecureSession, SessionState, Transfer, TrustObject,
    TrustPolicy,
};
pub use error::TransceiverError;
pub use info::SecureConnectionInfo;
pub use reload::EngineSwap;
pub use transceiver::{Transceiver, TransceiverState};
pub use trust::{TrustError, TrustFailureCode};

#[cfg(feature = "rustls-engine")]
pub use rustls_engine::{RustlsEngine, RustlsEngineBuilder};

/// `tracing` 事件统一使用的 target，引擎的追踪类别以字段形式附加。
pub(crate) const TRACE_TARGET: &str = "spark_transport_secure";
