use std::{fmt, sync::Arc};

use arc_swap::ArcSwap;

use crate::engine::SecureEngine;

/// 安全引擎的热更新容器。
///
/// # 设计动机（Why）
/// - **证书热更**：凭据或校验策略变化时，新连接应立即使用新引擎，而进行中的连接不受影响；
/// - **模式选择**：`ArcSwap` 读无锁、写常数时间，构成 RCU 式的配置广播。
///
/// # 核心契约（What）
/// - `snapshot`/`engine` 返回的 `Arc` 在后续 `replace` 之后依然有效，收发器创建时取一次快照并独占持有；
/// - `replace` 对后续快照立即可见，并返回旧引擎供调用方审计或回收。
///
/// # 风险提示（Trade-offs & Gotchas）
/// - 高频替换会同时存活多个引擎实例，内存峰值取决于仍在运行的旧连接数量。
pub struct EngineSwap<E> {
    inner: Arc<ArcSwap<E>>,
}

impl<E> Clone for EngineSwap<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E: SecureEngine + 'static> EngineSwap<E> {
    pub fn new(initial: Arc<E>) -> Self {
        Self {
            inner: Arc::new(ArcSwap::new(initial)),
        }
    }

    #[inline]
    pub fn from_engine(initial: E) -> Self {
        Self::new(Arc::new(initial))
    }

    /// 当前引擎的具体类型快照。
    #[inline]
    pub fn snapshot(&self) -> Arc<E> {
        self.inner.load_full()
    }

    /// 当前引擎的快照，已擦除为收发器使用的 trait 对象。
    #[inline]
    pub fn engine(&self) -> Arc<dyn SecureEngine> {
        self.inner.load_full()
    }

    #[inline]
    pub fn replace(&self, next: Arc<E>) -> Arc<E> {
        self.inner.swap(next)
    }
}

impl<E> fmt::Debug for EngineSwap<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineSwap").finish_non_exhaustive()
    }
}
