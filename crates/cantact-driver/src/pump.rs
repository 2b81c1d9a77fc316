//! 接收泵
//!
//! `Started` 期间运行在独立线程上，持续读取批量 IN 报告并分类：
//! - 接收帧：打时间戳后入队
//! - 错误帧：作为 `QueueItem::Error` 入队，保持与帧的先后顺序
//! - 回显：计数；回环通道上的回显作为 `is_loopback` 帧入队
//!
//! 解码失败只计数丢弃；连续传输错误达到阈值（或设备断开）时，
//! 泵标记接口不健康、关闭队列并退出。

use crate::metrics::DriverMetrics;
use crate::queue::{QueueItem, ReceiveQueue};
use crate::state::Health;
use cantact_protocol::{BusErrorKind, DeviceEvent};
use cantact_usb::DeviceCommands;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{JoinHandle, spawn};
use std::time::{Duration, Instant};
use tracing::{debug, error, trace, warn};

/// 带超时的线程 join
pub(crate) trait JoinTimeout {
    fn join_timeout(self, timeout: Duration) -> std::thread::Result<()>;
}

impl<T: Send + 'static> JoinTimeout for JoinHandle<T> {
    fn join_timeout(self, timeout: Duration) -> std::thread::Result<()> {
        let (tx, rx) = crossbeam_channel::bounded(1);

        // 看门狗线程代为 join，超时后它继续等待，由进程退出回收
        spawn(move || {
            let _ = tx.send(self.join());
        });

        match rx.recv_timeout(timeout) {
            Ok(join_result) => join_result.map(|_| ()),
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => Err(Box::new(
                std::io::Error::new(std::io::ErrorKind::TimedOut, "Thread join timeout"),
            )),
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => Err(Box::new(
                std::io::Error::new(std::io::ErrorKind::ConnectionReset, "Watchdog thread lost"),
            )),
        }
    }
}

/// 会话时钟
///
/// 设备时间戳是 32 位 µs 计数，约 71.6 分钟回绕一次；这里展开成单调的
/// `Duration`。没有硬件时间戳时使用 `start()` 以来的主机单调时间。
#[derive(Debug)]
pub(crate) struct SessionClock {
    started_at: Instant,
    last_raw: Option<u32>,
    wraps: u64,
    /// 已发出的最大时间戳，保证单调
    last_stamp: Duration,
}

impl SessionClock {
    pub(crate) fn new() -> Self {
        Self {
            started_at: Instant::now(),
            last_raw: None,
            wraps: 0,
            last_stamp: Duration::ZERO,
        }
    }

    pub(crate) fn stamp(&mut self, device_us: Option<u32>) -> Duration {
        let stamp = match device_us {
            Some(raw) => {
                if let Some(last) = self.last_raw
                    && raw < last
                {
                    self.wraps += 1;
                    trace!("Device timestamp wrapped ({} -> {})", last, raw);
                }
                self.last_raw = Some(raw);
                Duration::from_micros((self.wraps << 32) + u64::from(raw))
            },
            None => self.started_at.elapsed(),
        };
        self.last_stamp = self.last_stamp.max(stamp);
        self.last_stamp
    }
}

/// 接收泵的共享上下文
pub(crate) struct PumpContext {
    pub commands: Arc<DeviceCommands>,
    pub queue: Arc<ReceiveQueue>,
    pub metrics: Arc<DriverMetrics>,
    pub health: Arc<Health>,
    /// 下标为通道号；回环通道的回显作为帧交付
    pub loopback: Vec<bool>,
    pub read_timeout: Duration,
    pub max_consecutive_io_errors: u32,
}

impl PumpContext {
    fn push(&self, item: QueueItem) {
        if self.queue.push(item).is_drop() {
            self.metrics.rx_dropped.fetch_add(1, Ordering::Relaxed);
            trace!("Receive queue full, entry dropped");
        }
    }

    fn is_loopback(&self, channel: u8) -> bool {
        self.loopback.get(channel as usize).copied().unwrap_or(false)
    }
}

/// 接收循环
///
/// `is_running` 被清除后在一个 `read_timeout` 内退出。
pub(crate) fn rx_loop(ctx: PumpContext, is_running: Arc<AtomicBool>) {
    let mut clock = SessionClock::new();
    let mut consecutive_errors = 0u32;
    debug!("Receive pump started");

    loop {
        // Acquire: 看到 false 时必须同时看到 stop() 之前的写入
        if !is_running.load(Ordering::Acquire) {
            trace!("Receive pump: is_running flag is false, exiting");
            break;
        }

        let report = match ctx.commands.read_report(ctx.read_timeout) {
            Ok(report) => {
                consecutive_errors = 0;
                report
            },
            Err(e) if e.is_timeout() => {
                consecutive_errors = 0;
                continue;
            },
            Err(e) => {
                ctx.metrics.rx_io_errors.fetch_add(1, Ordering::Relaxed);
                consecutive_errors += 1;
                if e.is_fatal() || consecutive_errors >= ctx.max_consecutive_io_errors {
                    error!(
                        "Receive pump: device lost after {} consecutive error(s): {}",
                        consecutive_errors, e
                    );
                    ctx.health
                        .mark_unhealthy(format!("receive path failed: {e}"));
                    ctx.queue.close();
                    is_running.store(false, Ordering::Release);
                    break;
                }
                warn!("Receive pump: transient I/O error: {}", e);
                ctx.health.record_error(e.to_string());
                continue;
            },
        };

        // 读超时：没有数据
        if report.is_empty() {
            continue;
        }

        let event = match ctx.commands.decode_report(report) {
            Ok(event) => event,
            Err(e) => {
                ctx.metrics.rx_protocol_errors.fetch_add(1, Ordering::Relaxed);
                warn!("Receive pump: dropping malformed report: {}", e);
                continue;
            },
        };

        let meta = *event.meta();
        if meta.overflow {
            ctx.metrics.rx_overflows.fetch_add(1, Ordering::Relaxed);
            warn!("Device RX overflow on channel {}", event.channel());
        }
        let timestamp = clock.stamp(meta.timestamp_us);

        match event {
            DeviceEvent::ReceivedFrame { frame, .. } => {
                trace!(
                    "RX channel {} id 0x{:X} len {}",
                    frame.channel, frame.id, frame.len
                );
                ctx.push(QueueItem::Frame(frame.with_timestamp(timestamp)));
                ctx.metrics.rx_frames.fetch_add(1, Ordering::Relaxed);
            },
            DeviceEvent::ErrorStatus { error, .. } => {
                match error.kind {
                    BusErrorKind::BusOff => error!("{}", error),
                    BusErrorKind::ErrorPassive | BusErrorKind::Warning => warn!("{}", error),
                    BusErrorKind::Protocol => debug!("{}", error),
                }
                ctx.push(QueueItem::Error(error));
                ctx.metrics.rx_error_frames.fetch_add(1, Ordering::Relaxed);
            },
            DeviceEvent::CommandAck { echo_id, frame, .. } => {
                ctx.metrics.rx_echoes.fetch_add(1, Ordering::Relaxed);
                trace!("TX echo {} on channel {}", echo_id, frame.channel);
                if ctx.is_loopback(frame.channel) {
                    let mut frame = frame.with_timestamp(timestamp);
                    frame.is_loopback = true;
                    ctx.push(QueueItem::Frame(frame));
                    ctx.metrics.rx_frames.fetch_add(1, Ordering::Relaxed);
                }
            },
        }
    }

    debug!("Receive pump stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OverflowPolicy;
    use bytes::Bytes;
    use cantact_protocol::Frame;
    use cantact_protocol::gs_usb::*;
    use cantact_usb::{ChannelStart, MockTransport, Transport, TransportError};
    use std::thread;

    #[test]
    fn test_clock_unwraps_device_time() {
        let mut clock = SessionClock::new();
        assert_eq!(clock.stamp(Some(100)), Duration::from_micros(100));
        assert_eq!(clock.stamp(Some(u32::MAX)), Duration::from_micros(u32::MAX as u64));
        let wrapped = clock.stamp(Some(5));
        assert_eq!(wrapped, Duration::from_micros((1u64 << 32) + 5));
        assert!(wrapped > Duration::from_micros(u32::MAX as u64));
    }

    #[test]
    fn test_clock_host_time_is_monotonic() {
        let mut clock = SessionClock::new();
        let first = clock.stamp(None);
        let second = clock.stamp(None);
        assert!(second >= first);
    }

    #[test]
    fn test_join_timeout() {
        let quick = thread::spawn(|| {});
        assert!(quick.join_timeout(Duration::from_secs(1)).is_ok());

        let slow = thread::spawn(|| thread::sleep(Duration::from_millis(500)));
        assert!(slow.join_timeout(Duration::from_millis(10)).is_err());
    }

    struct Fixture {
        mock: Arc<MockTransport>,
        queue: Arc<ReceiveQueue>,
        metrics: Arc<DriverMetrics>,
        health: Arc<Health>,
        is_running: Arc<AtomicBool>,
        handle: Option<JoinHandle<()>>,
    }

    impl Fixture {
        fn start(flags: u32, loopback: bool) -> Self {
            let mock = Arc::new(MockTransport::new());
            let commands =
                Arc::new(DeviceCommands::probe(mock.clone(), Duration::from_millis(100)).unwrap());
            commands.set_bitrate(0, 500_000).unwrap();
            commands.start(&[ChannelStart { channel: 0, flags }]).unwrap();

            let queue = Arc::new(ReceiveQueue::new(16, OverflowPolicy::DropOldest));
            queue.open();
            let metrics = Arc::new(DriverMetrics::new());
            let health = Arc::new(Health::new());
            let is_running = Arc::new(AtomicBool::new(true));
            let ctx = PumpContext {
                commands,
                queue: queue.clone(),
                metrics: metrics.clone(),
                health: health.clone(),
                loopback: vec![loopback, false],
                read_timeout: Duration::from_millis(5),
                max_consecutive_io_errors: 3,
            };
            let running = is_running.clone();
            let handle = thread::spawn(move || rx_loop(ctx, running));
            Self {
                mock,
                queue,
                metrics,
                health,
                is_running,
                handle: Some(handle),
            }
        }

        fn pop(&self) -> Option<QueueItem> {
            self.queue.pop(Duration::from_secs(1), None).unwrap_or(None)
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            self.is_running.store(false, Ordering::Release);
            if let Some(handle) = self.handle.take() {
                let _ = handle.join_timeout(Duration::from_secs(2));
            }
        }
    }

    #[test]
    fn test_received_frames_are_timestamped() {
        let fixture = Fixture::start(GS_CAN_MODE_HW_TIMESTAMP, false);
        fixture.mock.set_clock(1_000);
        let frame = Frame::new_standard(0, 0x123, &[1, 2, 3]).unwrap();
        fixture.mock.inject_frame(&frame);
        fixture.mock.inject_frame(&frame);

        let Some(QueueItem::Frame(first)) = fixture.pop() else {
            panic!("expected a frame");
        };
        let Some(QueueItem::Frame(second)) = fixture.pop() else {
            panic!("expected a frame");
        };
        assert_eq!(first, frame);
        assert_eq!(first.timestamp, Some(Duration::from_micros(1_000)));
        assert_eq!(second.timestamp, Some(Duration::from_micros(1_100)));
        assert_eq!(fixture.metrics.snapshot().rx_frames, 2);
    }

    #[test]
    fn test_bus_error_is_queued() {
        let fixture = Fixture::start(0, false);
        fixture.mock.inject_bus_error(0, CAN_ERR_CRTL_TX_BUS_OFF, 0);
        match fixture.pop() {
            Some(QueueItem::Error(error)) => assert!(error.is_bus_off()),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(fixture.metrics.snapshot().rx_error_frames, 1);
    }

    #[test]
    fn test_malformed_report_is_dropped() {
        let fixture = Fixture::start(0, false);
        fixture.mock.inject_report(Bytes::from_static(&[0xFF; 5]));
        let frame = Frame::new_standard(0, 0x42, &[]).unwrap();
        fixture.mock.inject_frame(&frame);

        assert_eq!(fixture.pop(), Some(QueueItem::Frame(frame)));
        assert_eq!(fixture.metrics.snapshot().rx_protocol_errors, 1);
        assert!(fixture.health.is_healthy());
    }

    #[test]
    fn test_echo_only_delivered_in_loopback() {
        let fixture = Fixture::start(GS_CAN_MODE_LOOP_BACK, true);
        let frame = Frame::new_extended(0, 0xC0FFEE, &[0, 25, 0, 1, 3, 1, 4, 1]).unwrap();
        let report = cantact_protocol::HostFrame::from_frame(&frame, 3).to_bytes(false);
        fixture.mock.write(&report, Duration::from_millis(10)).unwrap();

        match fixture.pop() {
            Some(QueueItem::Frame(rx)) => {
                assert_eq!(rx, frame);
                assert!(rx.is_loopback);
            },
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(fixture.metrics.snapshot().rx_echoes, 1);
    }

    #[test]
    fn test_repeated_io_errors_stop_the_pump() {
        let fixture = Fixture::start(0, false);
        for _ in 0..3 {
            fixture.mock.inject_read_error(TransportError::Io("pipe error".into()));
        }
        assert_eq!(
            fixture.queue.pop(Duration::from_secs(2), None),
            Err(crate::queue::PopError::Closed)
        );
        assert!(!fixture.health.is_healthy());
        assert!(!fixture.is_running.load(Ordering::Acquire));
        assert_eq!(fixture.metrics.snapshot().rx_io_errors, 3);
    }

    #[test]
    fn test_single_io_error_is_absorbed() {
        let fixture = Fixture::start(0, false);
        fixture.mock.inject_read_error(TransportError::Stall);
        let frame = Frame::new_standard(0, 0x7, &[7]).unwrap();
        fixture.mock.inject_frame(&frame);
        assert_eq!(fixture.pop(), Some(QueueItem::Frame(frame)));
        assert!(fixture.health.is_healthy());
    }
}
