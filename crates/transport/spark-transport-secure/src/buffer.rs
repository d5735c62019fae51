//! 读写游标与就绪请求。

/// 返回给调用方 reactor 的就绪请求。
///
/// - `None`：操作已完成，无需等待；
/// - `Read`/`Write`：需等待对应方向就绪后重新调用同一操作。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum SocketOperation {
    #[default]
    None,
    Read,
    Write,
}

/// 借用的可写缓冲区，附带“已填充”游标。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 非阻塞读取可能只填充一部分缓冲区，游标记录进度，便于在下一次就绪后从断点继续；
/// - 同一类型既用于调用方的应用缓冲区，也用于 I/O 桥在引擎缓冲区上构造的临时视图。
///
/// ## 契约（What）
/// - `position() <= len()` 恒成立；`advance` 超出剩余长度时饱和到末尾；
/// - `is_complete()` 为真表示缓冲区已填满，读取操作应返回 [`SocketOperation::None`]。
#[derive(Debug)]
pub struct ReadBuf<'a> {
    bytes: &'a mut [u8],
    pos: usize,
}

impl<'a> ReadBuf<'a> {
    /// 从头开始填充。
    pub fn new(bytes: &'a mut [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    /// 在已部分填充的缓冲区上恢复游标，`pos` 超出长度时截断到末尾。
    pub fn with_position(bytes: &'a mut [u8], pos: usize) -> Self {
        let pos = pos.min(bytes.len());
        Self { bytes, pos }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    pub fn is_complete(&self) -> bool {
        self.pos == self.bytes.len()
    }

    /// 已填充部分。
    pub fn filled(&self) -> &[u8] {
        &self.bytes[..self.pos]
    }

    /// 尚未填充的部分。
    pub fn unfilled_mut(&mut self) -> &mut [u8] {
        &mut self.bytes[self.pos..]
    }

    pub fn advance(&mut self, n: usize) {
        self.pos = self.pos.saturating_add(n).min(self.bytes.len());
    }
}

/// 借用的只读缓冲区，附带“已消费”游标，语义与 [`ReadBuf`] 对称。
#[derive(Debug)]
pub struct WriteBuf<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> WriteBuf<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    /// 在已部分写出的缓冲区上恢复游标。
    pub fn with_position(bytes: &'a [u8], pos: usize) -> Self {
        let pos = pos.min(bytes.len());
        Self { bytes, pos }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    pub fn is_complete(&self) -> bool {
        self.pos == self.bytes.len()
    }

    /// 已写出的前缀。
    pub fn written(&self) -> &'a [u8] {
        &self.bytes[..self.pos]
    }

    /// 尚未写出的部分。
    pub fn unwritten(&self) -> &'a [u8] {
        &self.bytes[self.pos..]
    }

    pub fn advance(&mut self, n: usize) {
        self.pos = self.pos.saturating_add(n).min(self.bytes.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_buf_advance_saturates_at_end() {
        let mut storage = [0u8; 8];
        let mut buf = ReadBuf::new(&mut storage);
        buf.unfilled_mut()[..3].copy_from_slice(b"abc");
        buf.advance(3);
        assert_eq!(buf.filled(), b"abc");
        assert_eq!(buf.remaining(), 5);
        buf.advance(100);
        assert!(buf.is_complete());
        assert_eq!(buf.position(), 8);
    }

    #[test]
    fn write_buf_resume_clamps_position() {
        let payload = b"hello";
        let buf = WriteBuf::with_position(payload, 42);
        assert!(buf.is_complete());
        let mut buf = WriteBuf::with_position(payload, 2);
        assert_eq!(buf.unwritten(), b"llo");
        buf.advance(1);
        assert_eq!(buf.written(), b"hel");
    }
}
