//! CAN 接口（对外 API）
//!
//! 缓冲通道配置，`start()` 时一次性下发给设备并启动接收泵；
//! `stop()` 停止接收泵并复位设备，配置表保留；`close()` 释放传输，不可恢复。

use crate::config::{ChannelConfig, DriverConfig};
use crate::error::{ConfigurationError, DriverError};
use crate::metrics::{DriverMetrics, MetricsSnapshot};
use crate::pump::{JoinTimeout, PumpContext, rx_loop};
use crate::queue::{CancelToken, PopError, QueueItem, ReceiveQueue};
use crate::state::{AtomicLifecycle, Health, LifecycleState};
use cantact_protocol::{DeviceBitTiming, Frame};
use cantact_usb::{
    ChannelStart, CommandError, DeviceCapabilities, DeviceCommands, DeviceIdentity, Transport,
};
use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// 一次 `Started` 会话的运行时资源
struct Session {
    is_running: Arc<AtomicBool>,
    rx_thread: JoinHandle<()>,
}

struct Inner {
    /// 下标为通道号
    channels: Vec<ChannelConfig>,
    session: Option<Session>,
}

/// gs_usb CAN 接口
///
/// 所有方法都是 `&self`，可以放进 `Arc` 在多个线程间共享：
/// 并发的 `send` 由传输层的写锁串行化，`recv` 可以在多个线程上同时调用。
///
/// # 示例
///
/// ```rust,no_run
/// use cantact_driver::{Frame, InterfaceBuilder};
/// use std::time::Duration;
///
/// let interface = InterfaceBuilder::new().build()?;
/// interface.set_bitrate(0, 500_000)?;
/// interface.set_enabled(0, true)?;
/// interface.start()?;
///
/// let frame = Frame::new_extended(0, 0xC0FFEE, &[0, 25, 0, 1, 3, 1, 4, 1])?;
/// interface.send(&frame)?;
///
/// while let Some(frame) = interface.recv(Duration::from_millis(100))? {
///     println!("{:?}", frame);
/// }
/// interface.stop()?;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub struct Interface {
    commands: Arc<DeviceCommands>,
    config: DriverConfig,
    inner: RwLock<Inner>,
    lifecycle: AtomicLifecycle,
    queue: Arc<ReceiveQueue>,
    metrics: Arc<DriverMetrics>,
    health: Arc<Health>,
}

impl Interface {
    /// 打开第一个找到的适配器（默认配置）
    #[cfg(feature = "usb")]
    pub fn open() -> Result<Self, DriverError> {
        crate::InterfaceBuilder::new().build()
    }

    /// 在给定传输上探测设备并创建接口
    pub fn with_transport(
        transport: Arc<dyn Transport>,
        config: DriverConfig,
    ) -> Result<Self, DriverError> {
        config.validate()?;
        let commands = DeviceCommands::probe(transport, config.ack_timeout)?;
        let channel_count = commands.capabilities().channel_count as usize;
        info!(
            "Opened {} ({} channel(s))",
            commands.identity(),
            channel_count
        );

        Ok(Self {
            queue: Arc::new(ReceiveQueue::new(
                config.queue_capacity,
                config.overflow_policy,
            )),
            commands: Arc::new(commands),
            config,
            inner: RwLock::new(Inner {
                channels: vec![ChannelConfig::default(); channel_count],
                session: None,
            }),
            lifecycle: AtomicLifecycle::new(LifecycleState::Stopped),
            metrics: Arc::new(DriverMetrics::new()),
            health: Arc::new(Health::new()),
        })
    }

    // ============================================================
    // 通道配置（仅 Stopped 状态）
    // ============================================================

    /// 修改一个通道的配置；校验失败时原配置不变
    fn configure<F>(&self, channel: u8, update: F) -> Result<(), DriverError>
    where
        F: FnOnce(&mut ChannelConfig, &DeviceCapabilities) -> Result<(), ConfigurationError>,
    {
        let mut inner = self.inner.write();
        match self.lifecycle.get(Ordering::Acquire) {
            LifecycleState::Closed => return Err(DriverError::InterfaceClosed),
            LifecycleState::Started => return Err(ConfigurationError::AlreadyStarted.into()),
            LifecycleState::Stopped => {},
        }
        let count = inner.channels.len() as u8;
        let slot = inner
            .channels
            .get_mut(channel as usize)
            .ok_or(ConfigurationError::InvalidChannel { channel, count })?;

        let mut updated = *slot;
        update(&mut updated, self.commands.capabilities())?;
        *slot = updated;
        debug!("Channel {} configured: {:?}", channel, updated);
        Ok(())
    }

    /// 设置仲裁段波特率（bps），清除原始位定时
    ///
    /// 波特率为 0 或设备时钟无法满足时返回 `ConfigurationError::InvalidBitrate`。
    pub fn set_bitrate(&self, channel: u8, bitrate: u32) -> Result<(), DriverError> {
        self.configure(channel, |config, caps| {
            let invalid = ConfigurationError::InvalidBitrate { channel, bitrate };
            if bitrate == 0 {
                return Err(invalid);
            }
            DeviceBitTiming::for_bitrate(bitrate, &caps.limits).map_err(|_| invalid)?;
            config.bitrate = Some(bitrate);
            config.bit_timing = None;
            Ok(())
        })
    }

    /// 直接指定位定时（高级用法），优先于 `set_bitrate`
    pub fn set_bit_timing(&self, channel: u8, timing: DeviceBitTiming) -> Result<(), DriverError> {
        self.configure(channel, |config, caps| {
            if !caps.limits.check(&timing) {
                return Err(ConfigurationError::InvalidTiming(channel));
            }
            config.bit_timing = Some(timing);
            Ok(())
        })
    }

    pub fn set_enabled(&self, channel: u8, enabled: bool) -> Result<(), DriverError> {
        self.configure(channel, |config, _| {
            config.enabled = enabled;
            Ok(())
        })
    }

    /// 设备内部回环：发送的帧作为 `is_loopback` 帧从 `recv` 返回
    pub fn set_loopback(&self, channel: u8, enabled: bool) -> Result<(), DriverError> {
        self.configure(channel, |config, caps| {
            if enabled && !caps.supports_loopback() {
                return Err(ConfigurationError::Unsupported {
                    channel,
                    feature: "loopback",
                });
            }
            config.loopback = enabled;
            Ok(())
        })
    }

    /// 只听模式
    pub fn set_monitor(&self, channel: u8, enabled: bool) -> Result<(), DriverError> {
        self.configure(channel, |config, caps| {
            if enabled && !caps.supports_listen_only() {
                return Err(ConfigurationError::Unsupported {
                    channel,
                    feature: "listen-only",
                });
            }
            config.monitor = enabled;
            Ok(())
        })
    }

    pub fn set_one_shot(&self, channel: u8, enabled: bool) -> Result<(), DriverError> {
        self.configure(channel, |config, caps| {
            if enabled && !caps.supports_one_shot() {
                return Err(ConfigurationError::Unsupported {
                    channel,
                    feature: "one-shot",
                });
            }
            config.one_shot = enabled;
            Ok(())
        })
    }

    pub fn set_fd(&self, channel: u8, enabled: bool) -> Result<(), DriverError> {
        self.configure(channel, |config, caps| {
            if enabled && !caps.supports_fd() {
                return Err(ConfigurationError::Unsupported {
                    channel,
                    feature: "CAN FD",
                });
            }
            config.fd = enabled;
            Ok(())
        })
    }

    /// CAN FD 数据段波特率
    pub fn set_data_bitrate(&self, channel: u8, bitrate: u32) -> Result<(), DriverError> {
        self.configure(channel, |config, caps| {
            if !caps.supports_fd() {
                return Err(ConfigurationError::Unsupported {
                    channel,
                    feature: "CAN FD",
                });
            }
            let invalid = ConfigurationError::InvalidBitrate { channel, bitrate };
            if bitrate == 0 {
                return Err(invalid);
            }
            DeviceBitTiming::for_bitrate(bitrate, &caps.limits).map_err(|_| invalid)?;
            config.data_bitrate = Some(bitrate);
            Ok(())
        })
    }

    // ============================================================
    // 生命周期
    // ============================================================

    /// 下发配置、启动通道和接收泵
    ///
    /// 失败时接口保持 `Stopped`，设备上没有任何通道处于启动状态。
    pub fn start(&self) -> Result<(), DriverError> {
        let result = self.start_session();
        self.track(result)
    }

    fn start_session(&self) -> Result<(), DriverError> {
        let mut inner = self.inner.write();
        match self.lifecycle.get(Ordering::Acquire) {
            LifecycleState::Closed => return Err(DriverError::InterfaceClosed),
            LifecycleState::Started => return Err(ConfigurationError::AlreadyStarted.into()),
            LifecycleState::Stopped => {},
        }
        if !self.health.is_healthy() {
            return Err(DriverError::DeviceDisconnected);
        }

        let enabled: Vec<(u8, ChannelConfig)> = inner
            .channels
            .iter()
            .enumerate()
            .filter(|(_, config)| config.enabled)
            .map(|(channel, config)| (channel as u8, *config))
            .collect();
        if enabled.is_empty() {
            return Err(ConfigurationError::NoChannelsEnabled.into());
        }
        for (channel, config) in &enabled {
            if !config.has_timing() {
                return Err(ConfigurationError::MissingBitrate(*channel).into());
            }
            if config.fd && config.data_bitrate.is_none() {
                return Err(ConfigurationError::MissingDataBitrate(*channel).into());
            }
        }

        // 定时先全部下发，再逐个 START（由命令层保证原子性）
        for (channel, config) in &enabled {
            if let Some(timing) = config.bit_timing {
                self.commands.set_bit_timing(*channel, &timing)?;
            } else if let Some(bitrate) = config.bitrate {
                self.commands.set_bitrate(*channel, bitrate)?;
            }
            if config.fd
                && let Some(data_bitrate) = config.data_bitrate
            {
                self.commands.set_data_bitrate(*channel, data_bitrate)?;
            }
        }
        let capabilities = self.commands.capabilities();
        let starts: Vec<ChannelStart> = enabled
            .iter()
            .map(|(channel, config)| ChannelStart {
                channel: *channel,
                flags: config.mode_flags(capabilities),
            })
            .collect();
        self.commands.start(&starts)?;

        self.queue.clear();
        self.queue.open();
        let is_running = Arc::new(AtomicBool::new(true));
        let ctx = PumpContext {
            commands: self.commands.clone(),
            queue: self.queue.clone(),
            metrics: self.metrics.clone(),
            health: self.health.clone(),
            loopback: inner
                .channels
                .iter()
                .map(|config| config.enabled && config.loopback)
                .collect(),
            read_timeout: self.config.read_timeout,
            max_consecutive_io_errors: self.config.max_consecutive_io_errors,
        };
        let running = is_running.clone();
        let spawned = std::thread::Builder::new()
            .name("cantact-rx".to_string())
            .spawn(move || rx_loop(ctx, running));
        let rx_thread = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                self.queue.close();
                if let Err(stop_err) = self.commands.stop() {
                    warn!("Device reset after failed start: {}", stop_err);
                }
                return Err(DriverError::Device(format!(
                    "failed to spawn receive pump: {e}"
                )));
            },
        };

        inner.session = Some(Session {
            is_running,
            rx_thread,
        });
        self.lifecycle.set(LifecycleState::Started, Ordering::Release);
        info!(
            "Interface started on channel(s) {:?}",
            starts.iter().map(|s| s.channel).collect::<Vec<_>>()
        );
        Ok(())
    }

    /// 停止接收泵并复位设备上的所有通道，配置保留
    ///
    /// 接收泵在 `stop_grace` 内没有退出时仍然返回，接口被标记为不健康。
    /// 已停止时是空操作。
    pub fn stop(&self) -> Result<(), DriverError> {
        let result = {
            let mut inner = self.inner.write();
            match self.lifecycle.get(Ordering::Acquire) {
                LifecycleState::Closed => Err(DriverError::InterfaceClosed),
                LifecycleState::Stopped => Ok(()),
                LifecycleState::Started => self.stop_session(&mut inner),
            }
        };
        self.track(result)
    }

    fn stop_session(&self, inner: &mut Inner) -> Result<(), DriverError> {
        if let Some(session) = inner.session.take() {
            // Release: 确保接收泵看到之前的所有写入
            session.is_running.store(false, Ordering::Release);
            if session.rx_thread.join_timeout(self.config.stop_grace).is_err() {
                self.health.mark_unhealthy(format!(
                    "receive pump did not exit within {:?}",
                    self.config.stop_grace
                ));
            }
        }

        // 先切换状态再关闭队列，被唤醒的接收者看到的是 Stopped
        self.lifecycle.set(LifecycleState::Stopped, Ordering::Release);
        self.queue.close();
        self.queue.clear();

        let result = self.commands.stop().map_err(DriverError::from);
        match &result {
            Ok(()) => info!("Interface stopped"),
            Err(e) => warn!("Interface stopped, device reset failed: {}", e),
        }
        result
    }

    /// 释放传输（不可恢复）
    ///
    /// 运行中会先停止；设备复位失败只记录，不影响关闭。
    pub fn close(&self) -> Result<(), DriverError> {
        let mut inner = self.inner.write();
        match self.lifecycle.get(Ordering::Acquire) {
            LifecycleState::Closed => return Err(DriverError::InterfaceClosed),
            LifecycleState::Started => {
                if let Err(e) = self.stop_session(&mut inner) {
                    self.health.record_error(e.to_string());
                }
            },
            LifecycleState::Stopped => {},
        }
        self.lifecycle.set(LifecycleState::Closed, Ordering::Release);
        self.queue.close();
        self.commands.close();
        info!("Interface closed");
        Ok(())
    }

    // ============================================================
    // 收发
    // ============================================================

    /// 发送一帧
    ///
    /// 返回时帧已进入设备发送缓冲区（本地排队），不代表总线已发送。
    /// 设备缓冲区满时返回 `QueueFull`。
    pub fn send(&self, frame: &Frame) -> Result<(), DriverError> {
        let result = self.send_frame(frame);
        self.track(result)
    }

    fn send_frame(&self, frame: &Frame) -> Result<(), DriverError> {
        // 读锁：防止发送过程中被 stop/close
        let _inner = self.inner.read();
        self.ensure_started()?;

        match self.commands.send_frame(frame) {
            Ok(_) => {
                self.metrics.tx_frames.fetch_add(1, Ordering::Relaxed);
                Ok(())
            },
            Err(CommandError::QueueFull) => {
                self.metrics.tx_queue_full.fetch_add(1, Ordering::Relaxed);
                Err(DriverError::QueueFull)
            },
            Err(e) => {
                let e = DriverError::from(e);
                if e == DriverError::DeviceDisconnected {
                    self.health.mark_unhealthy("transmit path: device disconnected");
                }
                Err(e)
            },
        }
    }

    /// 等待一帧，最多 `timeout`；超时返回 `Ok(None)`
    ///
    /// `timeout` 为零时只检查一次队列。接收泵上报的总线错误以 `Err(Bus)` 返回，
    /// 与帧保持先后顺序。
    pub fn recv(&self, timeout: Duration) -> Result<Option<Frame>, DriverError> {
        self.receive(timeout, None)
    }

    /// 毫秒版本的 `recv`；负值返回 `InvalidArgument`
    pub fn recv_ms(&self, timeout_ms: i64) -> Result<Option<Frame>, DriverError> {
        let timeout_ms = u64::try_from(timeout_ms).map_err(|_| {
            DriverError::InvalidArgument(format!("negative receive timeout: {timeout_ms} ms"))
        })?;
        self.recv(Duration::from_millis(timeout_ms))
    }

    /// 可取消的 `recv`：令牌触发后返回 `Err(Interrupted)`，队列和传输状态不受影响
    pub fn recv_cancellable(
        &self,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<Option<Frame>, DriverError> {
        self.receive(timeout, Some(cancel))
    }

    fn receive(
        &self,
        timeout: Duration,
        cancel: Option<&CancelToken>,
    ) -> Result<Option<Frame>, DriverError> {
        self.ensure_started()?;
        match self.queue.pop(timeout, cancel) {
            Ok(Some(QueueItem::Frame(frame))) => Ok(Some(frame)),
            Ok(Some(QueueItem::Error(error))) => Err(DriverError::Bus(error)),
            Ok(None) => Ok(None),
            Err(PopError::Cancelled) => Err(DriverError::Interrupted),
            Err(PopError::Closed) => Err(self.ensure_started().err().unwrap_or(DriverError::NotStarted)),
        }
    }

    /// 收发前的状态检查
    fn ensure_started(&self) -> Result<(), DriverError> {
        match self.lifecycle.get(Ordering::Acquire) {
            LifecycleState::Closed => Err(DriverError::InterfaceClosed),
            _ if !self.health.is_healthy() => Err(DriverError::DeviceDisconnected),
            LifecycleState::Stopped => Err(DriverError::NotStarted),
            LifecycleState::Started => Ok(()),
        }
    }

    fn ensure_open(&self) -> Result<(), DriverError> {
        if self.lifecycle.get(Ordering::Acquire).is_closed() {
            Err(DriverError::InterfaceClosed)
        } else {
            Ok(())
        }
    }

    /// 记录最近一次错误
    fn track<T>(&self, result: Result<T, DriverError>) -> Result<T, DriverError> {
        if let Err(e) = &result {
            self.health.record_error(e.to_string());
        }
        result
    }

    // ============================================================
    // 状态查询
    // ============================================================

    pub fn state(&self) -> LifecycleState {
        self.lifecycle.get(Ordering::Acquire)
    }

    pub fn channel_count(&self) -> u8 {
        self.commands.capabilities().channel_count
    }

    pub fn channel_config(&self, channel: u8) -> Result<ChannelConfig, DriverError> {
        let inner = self.inner.read();
        inner.channels.get(channel as usize).copied().ok_or_else(|| {
            ConfigurationError::InvalidChannel {
                channel,
                count: inner.channels.len() as u8,
            }
            .into()
        })
    }

    /// 所有通道的配置（下标为通道号）
    pub fn channels(&self) -> Vec<ChannelConfig> {
        self.inner.read().channels.clone()
    }

    pub fn capabilities(&self) -> &DeviceCapabilities {
        self.commands.capabilities()
    }

    pub fn identity(&self) -> DeviceIdentity {
        self.commands.identity()
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// 设备断开或接收泵卡死后为 false，需要重新打开设备
    pub fn is_healthy(&self) -> bool {
        self.health.is_healthy()
    }

    pub fn last_error(&self) -> Option<Arc<String>> {
        self.health.last_error()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn reset_metrics(&self) {
        self.metrics.reset();
    }

    /// 接收队列中待取的条目数
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// 设备时钟（µs，32 位回绕）
    pub fn device_timestamp(&self) -> Result<u32, DriverError> {
        self.ensure_open()?;
        self.commands.device_timestamp().map_err(DriverError::from)
    }

    /// 点亮/关闭识别 LED
    pub fn identify(&self, on: bool) -> Result<(), DriverError> {
        self.ensure_open()?;
        self.commands.identify(on).map_err(DriverError::from)
    }
}

impl Drop for Interface {
    fn drop(&mut self) {
        if !self.state().is_closed()
            && let Err(e) = self.close()
        {
            error!("Failed to close interface on drop: {}", e);
        }
    }
}
