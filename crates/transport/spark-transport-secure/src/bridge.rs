//! TLS 引擎与明文委托之间的 I/O 桥。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 引擎以同步方式拉取/推送密文，委托则只能报告“部分进度 + 等待方向”；
//!   桥把委托结果翻译为 [`Transfer`]，并把等待方向记录在连接私有的 [`WantFlags`] 中；
//! - 桥在每次引擎调用时以显式参数传入，引擎无需也无法跨调用找回宿主对象。
//!
//! ## 契约（What）
//! - 新建的桥不携带任何等待方向；`pull`/`push` 先清除自身方向的标记，再在临时游标上调用委托；
//! - 委托返回等待方向：回写实际移动的字节数并置位该方向的标记（另一方向随之清除），结局为 `WouldBlock`；
//! - 对端关闭：`Closed`；其余错误：原始 OS 错误码，缺失时使用 EIO；
//! - 桥从不向引擎传播错误值以外的东西。

use std::io;

use crate::{
    buffer::{ReadBuf, SocketOperation, WriteBuf},
    delegate::TransportDelegate,
    engine::{IoStatus, RawIo, Transfer},
    error::{UNKNOWN_OS_ERROR, is_connection_lost_kind},
};

/// 握手循环与 I/O 桥共享的等待方向标记。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct WantFlags {
    pub read: bool,
    pub write: bool,
}

impl WantFlags {
    /// 引擎报告 would-block 后应返回给 reactor 的就绪请求；两个标记都未置位时返回 `None`。
    pub fn readiness(&self) -> Option<SocketOperation> {
        debug_assert!(
            !(self.read && self.write),
            "engine blocked on both directions at once"
        );
        if self.read {
            Some(SocketOperation::Read)
        } else if self.write {
            Some(SocketOperation::Write)
        } else {
            None
        }
    }

    /// 记录最近一次阻塞的方向；引擎只会等待一个方向，另一方向的旧标记随之失效。
    fn block(&mut self, operation: SocketOperation) {
        self.read = operation == SocketOperation::Read;
        self.write = operation == SocketOperation::Write;
    }
}

pub(crate) struct IoBridge<'a, D: ?Sized> {
    delegate: &'a mut D,
    flags: &'a mut WantFlags,
}

impl<'a, D: TransportDelegate + ?Sized> IoBridge<'a, D> {
    /// 每次引擎调用构造一个新桥；上一次调用遗留的等待方向在此清除。
    pub fn new(delegate: &'a mut D, flags: &'a mut WantFlags) -> Self {
        *flags = WantFlags::default();
        Self { delegate, flags }
    }
}

fn failure(moved: usize, error: &io::Error) -> Transfer {
    if error.kind() == io::ErrorKind::WouldBlock {
        Transfer::would_block(moved)
    } else if is_connection_lost_kind(error.kind()) {
        Transfer::closed(moved)
    } else {
        Transfer::os(moved, error.raw_os_error().unwrap_or(UNKNOWN_OS_ERROR))
    }
}

impl<D: TransportDelegate + ?Sized> RawIo for IoBridge<'_, D> {
    fn pull(&mut self, buf: &mut [u8]) -> Transfer {
        self.flags.read = false;
        let mut view = ReadBuf::new(buf);
        let transfer = match self.delegate.read(&mut view) {
            Ok(SocketOperation::None) => Transfer::complete(view.position()),
            Ok(_) => Transfer::would_block(view.position()),
            Err(error) => failure(view.position(), &error),
        };
        if transfer.status == IoStatus::WouldBlock {
            self.flags.block(SocketOperation::Read);
        }
        transfer
    }

    fn push(&mut self, buf: &[u8]) -> Transfer {
        self.flags.write = false;
        let mut view = WriteBuf::new(buf);
        let transfer = match self.delegate.write(&mut view) {
            Ok(SocketOperation::None) => Transfer::complete(view.position()),
            Ok(_) => Transfer::would_block(view.position()),
            Err(error) => failure(view.position(), &error),
        };
        if transfer.status == IoStatus::WouldBlock {
            self.flags.block(SocketOperation::Write);
        }
        transfer
    }
}
