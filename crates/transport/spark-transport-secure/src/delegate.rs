use std::{borrow::Cow, io};

use crate::buffer::{ReadBuf, SocketOperation, WriteBuf};

/// 明文非阻塞字节传输的委托契约。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 收发器只关心“字节能否立即移动”以及“需要等待哪个方向”，具体的套接字、代理或内存管道由外部实现；
/// - 握手前（`connected == false`）的读写原样透传给委托，TLS 之前的字节不经过引擎。
///
/// ## 契约（What）
/// - `read`/`write`：尽量推进游标；返回 [`SocketOperation::None`] 表示缓冲区已耗尽，
///   返回 `Read`/`Write` 表示需等待对应方向就绪（游标保留已移动的字节数）；
/// - 对端关闭以 `UnexpectedEof`/`ConnectionReset`/`ConnectionAborted`/`BrokenPipe`/`NotConnected`
///   表达，其余错误应携带原始 OS 错误码（`io::Error::raw_os_error`）；
/// - `descriptor`：存在真实描述符时返回 `Some`，决定收发器的分包策略；
/// - `set_ready`：更新原生就绪标记，读取路径借此提示“引擎内仍有可读明文”。
///
/// ## 风险与权衡（Trade-offs）
/// - 方法均为同步非阻塞调用，实现不得在内部等待；
/// - `close` 由收发器保证至多调用一次。
pub trait TransportDelegate {
    /// TLS 之前的连接建立步骤（如 TCP 连接完成、代理握手），默认立即完成。
    fn initialize(
        &mut self,
        _read: &mut ReadBuf<'_>,
        _write: &mut WriteBuf<'_>,
    ) -> io::Result<SocketOperation> {
        Ok(SocketOperation::None)
    }

    fn read(&mut self, buf: &mut ReadBuf<'_>) -> io::Result<SocketOperation>;

    fn write(&mut self, buf: &mut WriteBuf<'_>) -> io::Result<SocketOperation>;

    /// 原生描述符；内存传输等无描述符实现返回 `None`。
    fn descriptor(&self) -> Option<u64>;

    /// 内核发送缓冲区大小，查询失败时返回 `None`。
    fn send_buffer_size(&self) -> Option<usize>;

    /// 内核接收缓冲区大小，查询失败时返回 `None`。
    fn recv_buffer_size(&self) -> Option<usize>;

    /// 设置原生就绪标记。
    fn set_ready(&mut self, operation: SocketOperation, ready: bool);

    fn set_buffer_size(&mut self, _rcv_size: Option<usize>, _snd_size: Option<usize>) {}

    fn close(&mut self);

    /// 可读描述，用于日志与协议错误诊断。
    fn describe(&self) -> Cow<'_, str>;

    fn info(&self) -> TransportInfo;
}

/// 底层传输的连接信息快照。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TransportInfo {
    pub description: String,
    pub local_address: Option<String>,
    pub remote_address: Option<String>,
    pub rcv_size: Option<usize>,
    pub snd_size: Option<usize>,
}
