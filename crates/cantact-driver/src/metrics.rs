//! 驱动运行指标
//!
//! 原子计数器，接收泵和调用方线程无锁更新，任何线程都可以读取快照。

use std::sync::atomic::{AtomicU64, Ordering};

/// 驱动实时指标
///
/// # 使用示例
///
/// ```rust
/// use cantact_driver::DriverMetrics;
/// use std::sync::atomic::Ordering;
///
/// let metrics = DriverMetrics::new();
/// metrics.rx_frames.fetch_add(1, Ordering::Relaxed);
///
/// let snapshot = metrics.snapshot();
/// assert_eq!(snapshot.rx_frames, 1);
/// ```
#[derive(Debug, Default)]
pub struct DriverMetrics {
    /// 入队的总线接收帧数（含回环帧）
    pub rx_frames: AtomicU64,

    /// 因接收队列满被丢弃的条目数
    pub rx_dropped: AtomicU64,

    /// 设备回显（本地发送确认）数
    pub rx_echoes: AtomicU64,

    /// 错误帧数
    pub rx_error_frames: AtomicU64,

    /// 无法解码而丢弃的报告数
    pub rx_protocol_errors: AtomicU64,

    /// 接收路径上的传输错误数
    pub rx_io_errors: AtomicU64,

    /// 设备报告的接收溢出次数
    ///
    /// 持续增长说明主机读取速度跟不上总线负载。
    pub rx_overflows: AtomicU64,

    /// 成功写出的帧数
    pub tx_frames: AtomicU64,

    /// 设备发送缓冲区满的次数
    pub tx_queue_full: AtomicU64,
}

impl DriverMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            rx_frames: self.rx_frames.load(Ordering::Relaxed),
            rx_dropped: self.rx_dropped.load(Ordering::Relaxed),
            rx_echoes: self.rx_echoes.load(Ordering::Relaxed),
            rx_error_frames: self.rx_error_frames.load(Ordering::Relaxed),
            rx_protocol_errors: self.rx_protocol_errors.load(Ordering::Relaxed),
            rx_io_errors: self.rx_io_errors.load(Ordering::Relaxed),
            rx_overflows: self.rx_overflows.load(Ordering::Relaxed),
            tx_frames: self.tx_frames.load(Ordering::Relaxed),
            tx_queue_full: self.tx_queue_full.load(Ordering::Relaxed),
        }
    }

    /// 重置所有计数器
    pub fn reset(&self) {
        self.rx_frames.store(0, Ordering::Relaxed);
        self.rx_dropped.store(0, Ordering::Relaxed);
        self.rx_echoes.store(0, Ordering::Relaxed);
        self.rx_error_frames.store(0, Ordering::Relaxed);
        self.rx_protocol_errors.store(0, Ordering::Relaxed);
        self.rx_io_errors.store(0, Ordering::Relaxed);
        self.rx_overflows.store(0, Ordering::Relaxed);
        self.tx_frames.store(0, Ordering::Relaxed);
        self.tx_queue_full.store(0, Ordering::Relaxed);
    }
}

/// 指标快照
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MetricsSnapshot {
    pub rx_frames: u64,
    pub rx_dropped: u64,
    pub rx_echoes: u64,
    pub rx_error_frames: u64,
    pub rx_protocol_errors: u64,
    pub rx_io_errors: u64,
    pub rx_overflows: u64,
    pub tx_frames: u64,
    pub tx_queue_full: u64,
}

impl MetricsSnapshot {
    /// 接收丢弃率（百分比），没有接收时为 0.0
    pub fn rx_drop_rate(&self) -> f64 {
        let total = self.rx_frames + self.rx_error_frames;
        if total == 0 {
            return 0.0;
        }
        (self.rx_dropped as f64 / total as f64) * 100.0
    }
}
