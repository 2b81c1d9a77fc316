//! 接收队列
//!
//! 接收泵（唯一生产者）与 `recv` 调用方（多个消费者）之间的有界 FIFO。
//! 生产者永远不阻塞：队列满时按 `OverflowPolicy` 丢弃。

use crate::config::OverflowPolicy;
use cantact_protocol::{BusError, Frame};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// 取消令牌的检查间隔
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// 队列条目：帧或总线错误（保持二者之间的先后顺序）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueItem {
    Frame(Frame),
    Error(BusError),
}

/// `push` 的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// 队列满，队首条目被挤出
    DroppedOldest,
    /// 队列满，新条目被丢弃
    DroppedNewest,
    /// 队列已关闭
    Closed,
}

impl PushOutcome {
    pub fn is_drop(&self) -> bool {
        matches!(self, PushOutcome::DroppedOldest | PushOutcome::DroppedNewest)
    }
}

/// `pop` 的失败原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PopError {
    /// 队列已关闭且为空
    Closed,
    /// 取消令牌被触发
    Cancelled,
}

/// 取消令牌
///
/// 克隆共享同一个标志，可以交给信号处理线程。
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// 复位，令牌可再次使用
    pub fn reset(&self) {
        self.cancelled.store(false, Ordering::Release);
    }
}

struct QueueState {
    items: VecDeque<QueueItem>,
    open: bool,
}

/// 有界接收队列
pub struct ReceiveQueue {
    state: Mutex<QueueState>,
    available: Condvar,
    capacity: usize,
    policy: OverflowPolicy,
}

impl ReceiveQueue {
    /// 创建时为关闭状态，`open()` 后才接受条目
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity),
                open: false,
            }),
            available: Condvar::new(),
            capacity,
            policy,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }

    pub fn open(&self) {
        self.state.lock().open = true;
    }

    /// 关闭并唤醒所有等待者；已入队的条目仍可取出
    pub fn close(&self) {
        self.state.lock().open = false;
        self.available.notify_all();
    }

    pub fn clear(&self) {
        self.state.lock().items.clear();
    }

    /// 入队（不阻塞）
    pub fn push(&self, item: QueueItem) -> PushOutcome {
        let mut state = self.state.lock();
        if !state.open {
            return PushOutcome::Closed;
        }
        let outcome = if state.items.len() < self.capacity {
            PushOutcome::Queued
        } else {
            match self.policy {
                OverflowPolicy::DropOldest => {
                    state.items.pop_front();
                    PushOutcome::DroppedOldest
                },
                OverflowPolicy::DropNewest => return PushOutcome::DroppedNewest,
            }
        };
        state.items.push_back(item);
        drop(state);
        self.available.notify_one();
        outcome
    }

    /// 非阻塞出队
    pub fn try_pop(&self) -> Option<QueueItem> {
        self.state.lock().items.pop_front()
    }

    /// 等待一个条目，最多 `timeout`；超时返回 `Ok(None)`
    ///
    /// `timeout` 为零时只检查一次。提供 `cancel` 时每 10ms 检查一次令牌。
    pub fn pop(
        &self,
        timeout: Duration,
        cancel: Option<&CancelToken>,
    ) -> Result<Option<QueueItem>, PopError> {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.state.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                return Ok(Some(item));
            }
            if !state.open {
                return Err(PopError::Closed);
            }
            if cancel.is_some_and(CancelToken::is_cancelled) {
                return Err(PopError::Cancelled);
            }

            let remaining = match deadline {
                Some(deadline) => deadline.saturating_duration_since(Instant::now()),
                None => Duration::MAX,
            };
            if remaining.is_zero() {
                return Ok(None);
            }
            let wait = if cancel.is_some() {
                remaining.min(CANCEL_POLL_INTERVAL)
            } else {
                remaining
            };
            self.available.wait_for(&mut state, wait);
        }
    }
}
