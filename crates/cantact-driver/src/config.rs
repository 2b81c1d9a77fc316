//! 驱动配置与通道配置

use crate::error::ConfigurationError;
use cantact_protocol::DeviceBitTiming;
use cantact_protocol::gs_usb::*;
use cantact_usb::DeviceCapabilities;
use std::time::Duration;

/// 接收队列满时的处理策略
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum OverflowPolicy {
    /// 丢弃队首（最旧）的条目，新条目入队
    #[default]
    DropOldest,
    /// 丢弃新到达的条目
    DropNewest,
}

/// 驱动运行参数
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DriverConfig {
    /// 接收队列容量（条目数）
    pub queue_capacity: usize,
    pub overflow_policy: OverflowPolicy,
    /// 接收泵单次读取的超时，决定 `stop()` 的响应速度
    pub read_timeout: Duration,
    /// 控制传输和发送的超时
    pub ack_timeout: Duration,
    /// 连续 I/O 错误达到该值后，接收泵认定设备已断开
    pub max_consecutive_io_errors: u32,
    /// `stop()` 等待接收泵退出的时长
    pub stop_grace: Duration,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            overflow_policy: OverflowPolicy::DropOldest,
            read_timeout: Duration::from_millis(50),
            ack_timeout: Duration::from_millis(1000),
            max_consecutive_io_errors: 3,
            stop_grace: Duration::from_secs(2),
        }
    }
}

impl DriverConfig {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.queue_capacity == 0 {
            return Err(ConfigurationError::InvalidDriverConfig(
                "queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.max_consecutive_io_errors == 0 {
            return Err(ConfigurationError::InvalidDriverConfig(
                "max_consecutive_io_errors must be at least 1".to_string(),
            ));
        }
        if self.read_timeout.is_zero() {
            return Err(ConfigurationError::InvalidDriverConfig(
                "read_timeout must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// 单个通道的缓冲配置（`start()` 时下发）
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ChannelConfig {
    /// 仲裁段波特率（bps）
    pub bitrate: Option<u32>,
    pub enabled: bool,
    /// 设备内部回环
    pub loopback: bool,
    /// 只听模式（不应答、不发送）
    pub monitor: bool,
    pub fd: bool,
    /// CAN FD 数据段波特率
    pub data_bitrate: Option<u32>,
    /// 发送失败不重传
    pub one_shot: bool,
    /// 原始位定时，优先于 `bitrate`
    pub bit_timing: Option<DeviceBitTiming>,
}

impl ChannelConfig {
    /// 是否已配置仲裁段定时
    pub fn has_timing(&self) -> bool {
        self.bitrate.is_some() || self.bit_timing.is_some()
    }

    /// 该通道的 MODE START 标志
    pub fn mode_flags(&self, capabilities: &DeviceCapabilities) -> u32 {
        let mut flags = 0;
        if self.loopback {
            flags |= GS_CAN_MODE_LOOP_BACK;
        }
        if self.monitor {
            flags |= GS_CAN_MODE_LISTEN_ONLY;
        }
        if self.one_shot {
            flags |= GS_CAN_MODE_ONE_SHOT;
        }
        if self.fd {
            flags |= GS_CAN_MODE_FD;
        }
        if capabilities.supports_hw_timestamp() {
            flags |= GS_CAN_MODE_HW_TIMESTAMP;
        }
        flags
    }
}
