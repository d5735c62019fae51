use std::{borrow::Cow, io};

use thiserror::Error;

use crate::trust::TrustError;

/// 安全传输错误映射模块。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 将引擎状态码、委托 `io::Error` 与信任评估结果统一映射为一个封闭的致命错误分类，
///   便于所属连接做出“关闭/告警”的决策，而无需解析引擎细节；
/// - 每个变体携带稳定错误码（`spark.transport.secure.*`），供日志与运维脚本检索。
///
/// ## 逻辑（How）
/// - `OperationKind` 描述一类操作（握手/读/写）的错误码与文案前缀；
/// - `from_os_error` 依据 errno 区分“连接丢失”与一般套接字故障；
/// - `from_delegate` 处理握手前透传路径上委托返回的 `io::Error`。
///
/// ## 契约（What）
/// - `WouldBlock` 永远不是错误，它以 [`SocketOperation`](crate::SocketOperation) 返回；
/// - 所有错误都在检测到它的调用中同步返回，本层不做内部重试。
#[derive(Clone, Copy, Debug)]
pub(crate) struct OperationKind {
    pub code: &'static str,
    pub message: &'static str,
}

pub(crate) const HANDSHAKE: OperationKind = OperationKind {
    code: "spark.transport.secure.handshake_failed",
    message: "ssl error occurred during handshake",
};

pub(crate) const READ: OperationKind = OperationKind {
    code: "spark.transport.secure.read_failed",
    message: "error during read",
};

pub(crate) const WRITE: OperationKind = OperationKind {
    code: "spark.transport.secure.write_failed",
    message: "error during write",
};

/// 无法取得原始 OS 错误码时使用的兜底值（EIO）。
pub(crate) const UNKNOWN_OS_ERROR: i32 = 5;

const CONFIGURATION_CODE: &str = "spark.transport.secure.configuration";
const CONNECTION_LOST_CODE: &str = "spark.transport.secure.connection_lost";
const SOCKET_CODE: &str = "spark.transport.secure.socket_failed";
const TRUST_CODE: &str = "spark.transport.secure.trust_failed";
const SECURITY_CODE: &str = "spark.transport.secure.security_failed";

/// 收发器的致命错误。
#[derive(Debug, Error)]
pub enum TransceiverError {
    /// 策略构造失败（例如无法构建吊销检查策略），立即致命、不重试。
    #[error("secure transport configuration failure: {reason}")]
    Configuration { reason: Cow<'static, str> },

    /// 对端优雅/异常关闭，或 OS 层面的连接重置。
    #[error("connection lost{}", describe_errno(.errno))]
    ConnectionLost { errno: Option<i32> },

    /// 引擎在保留错误码区间内报告的握手或记录层错误。
    #[error("{detail}")]
    Protocol { code: &'static str, detail: String },

    /// 其余 OS 层错误。
    #[error("socket failure: {}", describe_os_error(.errno))]
    Socket { errno: i32 },

    /// 严格策略下证书校验失败。
    #[error("certificate verification failure: {description}")]
    Trust { error: TrustError, description: String },

    /// 应用层对端校验（链长度上限、自定义校验器）拒绝了连接。
    #[error("security failure: {reason}")]
    Security { reason: String },
}

fn describe_errno(errno: &Option<i32>) -> String {
    match errno {
        Some(code) => format!(": {}", describe_os_error(code)),
        None => String::new(),
    }
}

fn describe_os_error(errno: &i32) -> io::Error {
    io::Error::from_raw_os_error(*errno)
}

impl TransceiverError {
    /// 稳定错误码。
    pub fn code(&self) -> &'static str {
        match self {
            Self::Configuration { .. } => CONFIGURATION_CODE,
            Self::ConnectionLost { .. } => CONNECTION_LOST_CODE,
            Self::Protocol { code, .. } => *code,
            Self::Socket { .. } => SOCKET_CODE,
            Self::Trust { .. } => TRUST_CODE,
            Self::Security { .. } => SECURITY_CODE,
        }
    }

    pub fn is_connection_lost(&self) -> bool {
        matches!(self, Self::ConnectionLost { .. })
    }

    /// 信任失败时返回对应分类。
    pub fn trust_error(&self) -> Option<TrustError> {
        match self {
            Self::Trust { error, .. } => Some(*error),
            _ => None,
        }
    }

    pub(crate) fn configuration(reason: impl Into<Cow<'static, str>>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    pub(crate) fn protocol(kind: OperationKind, detail: impl Into<String>) -> Self {
        Self::Protocol {
            code: kind.code,
            detail: format!("{}:\n{}", kind.message, detail.into()),
        }
    }

    pub(crate) fn security(reason: impl Into<String>) -> Self {
        Self::Security {
            reason: reason.into(),
        }
    }

    /// 依据 errno 区分连接丢失与一般套接字故障。
    pub(crate) fn from_os_error(errno: i32) -> Self {
        if is_connection_lost_kind(io::Error::from_raw_os_error(errno).kind()) {
            Self::ConnectionLost { errno: Some(errno) }
        } else {
            Self::Socket { errno }
        }
    }

    /// 映射握手前透传路径上的委托错误。
    pub(crate) fn from_delegate(error: io::Error) -> Self {
        if is_connection_lost_kind(error.kind()) {
            Self::ConnectionLost {
                errno: error.raw_os_error(),
            }
        } else {
            Self::Socket {
                errno: error.raw_os_error().unwrap_or(UNKNOWN_OS_ERROR),
            }
        }
    }
}

pub(crate) fn is_connection_lost_kind(kind: io::ErrorKind) -> bool {
    use io::ErrorKind;
    matches!(
        kind,
        ErrorKind::UnexpectedEof
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::NotConnected
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_errno_is_connection_lost() {
        let reset = io::Error::from(io::ErrorKind::ConnectionReset);
        let err = TransceiverError::from_delegate(reset);
        assert!(err.is_connection_lost());
        assert_eq!(err.code(), "spark.transport.secure.connection_lost");
    }

    #[test]
    fn unrelated_delegate_error_is_socket_failure() {
        let err = TransceiverError::from_delegate(io::Error::other("boom"));
        match err {
            TransceiverError::Socket { errno } => assert_eq!(errno, UNKNOWN_OS_ERROR),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn protocol_failure_keeps_operation_prefix() {
        let err = TransceiverError::protocol(WRITE, "bad record mac");
        assert_eq!(err.code(), WRITE.code);
        assert!(err.to_string().starts_with("error during write:"));
    }
}
