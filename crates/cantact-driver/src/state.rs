//! 接口生命周期状态与健康标志

use arc_swap::ArcSwapOption;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use tracing::error;

/// 接口生命周期
///
/// ```text
/// Stopped --start()--> Started --stop()--> Stopped
///    任意状态 --close()--> Closed（终态）
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum LifecycleState {
    /// 初始状态，可修改配置
    #[default]
    Stopped = 0,
    /// 接收泵运行中，配置锁定
    Started = 1,
    /// 传输已释放，不可恢复
    Closed = 2,
}

impl LifecycleState {
    /// 无效值按 Closed 处理
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Stopped,
            1 => Self::Started,
            _ => Self::Closed,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn is_started(self) -> bool {
        self == Self::Started
    }

    pub fn is_closed(self) -> bool {
        self == Self::Closed
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Started => write!(f, "started"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// 生命周期状态（原子版本，接收路径无锁读取）
#[derive(Debug)]
pub struct AtomicLifecycle {
    inner: AtomicU8,
}

impl AtomicLifecycle {
    pub fn new(state: LifecycleState) -> Self {
        Self {
            inner: AtomicU8::new(state.as_u8()),
        }
    }

    pub fn get(&self, ordering: Ordering) -> LifecycleState {
        LifecycleState::from_u8(self.inner.load(ordering))
    }

    pub fn set(&self, state: LifecycleState, ordering: Ordering) {
        self.inner.store(state.as_u8(), ordering);
    }
}

impl Default for AtomicLifecycle {
    fn default() -> Self {
        Self::new(LifecycleState::default())
    }
}

/// 设备健康状态
///
/// 接收泵检测到设备断开、或 `stop()` 等不到接收泵退出时标记为不健康。
/// 不健康是粘滞的，只能重新打开设备恢复。
#[derive(Debug)]
pub struct Health {
    healthy: AtomicBool,
    last_error: ArcSwapOption<String>,
}

impl Default for Health {
    fn default() -> Self {
        Self {
            healthy: AtomicBool::new(true),
            last_error: ArcSwapOption::empty(),
        }
    }
}

impl Health {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    /// 记录最近一次错误（不改变健康状态）
    pub fn record_error(&self, message: impl Into<String>) {
        self.last_error.store(Some(Arc::new(message.into())));
    }

    pub fn mark_unhealthy(&self, message: impl Into<String>) {
        let message = message.into();
        error!("Interface marked unhealthy: {}", message);
        self.record_error(message);
        self.healthy.store(false, Ordering::Release);
    }

    pub fn last_error(&self) -> Option<Arc<String>> {
        self.last_error.load_full()
    }
}
