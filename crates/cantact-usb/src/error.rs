//! USB 层错误类型

use cantact_protocol::ProtocolError;
use thiserror::Error;

/// 传输层错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// 没有匹配的适配器
    #[error("Device not found")]
    DeviceNotFound,

    /// 接口已被其他进程占用
    #[error("Device busy (claimed by another process)")]
    DeviceBusy,

    /// 权限不足（udev 规则 / 驱动）
    #[error("Access denied")]
    AccessDenied,

    /// 设备已拔出
    #[error("Device disconnected")]
    Disconnected,

    /// 传输超时
    #[error("Transfer timeout")]
    Timeout,

    /// 控制端点 STALL：设备拒绝了请求
    #[error("Request rejected by device (pipe stall)")]
    Stall,

    /// 传输句柄已关闭
    #[error("Transport closed")]
    Closed,

    /// 控制 IN 应答长度不足
    #[error("Invalid response from device: expected {expected} bytes, got {actual}")]
    InvalidResponse { expected: usize, actual: usize },

    /// libusb 返回的其他错误
    #[cfg(feature = "usb")]
    #[error("USB error: {0}")]
    Usb(rusb::Error),

    /// 与后端无关的传输失败
    #[error("USB I/O error: {0}")]
    Io(String),
}

impl TransportError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Timeout)
    }

    /// 不可恢复：必须重新打开设备
    pub fn is_fatal(&self) -> bool {
        matches!(self, TransportError::Disconnected | TransportError::Closed)
    }
}

#[cfg(feature = "usb")]
impl From<rusb::Error> for TransportError {
    fn from(e: rusb::Error) -> Self {
        match e {
            rusb::Error::NotFound => TransportError::DeviceNotFound,
            rusb::Error::Busy => TransportError::DeviceBusy,
            rusb::Error::Access => TransportError::AccessDenied,
            rusb::Error::NoDevice => TransportError::Disconnected,
            rusb::Error::Timeout => TransportError::Timeout,
            rusb::Error::Pipe => TransportError::Stall,
            other => TransportError::Usb(other),
        }
    }
}

/// 设备命令错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Invalid channel {channel} (device has {count})")]
    InvalidChannel { channel: u8, count: u8 },

    /// 求解失败或设备拒绝
    #[error("Invalid bitrate {bitrate} bps on channel {channel}")]
    InvalidBitrate { channel: u8, bitrate: u32 },

    #[error("Bit timing outside device limits on channel {0}")]
    InvalidTiming(u8),

    #[error("No channels enabled")]
    NoChannelsEnabled,

    #[error("Channel {0} is not enabled")]
    ChannelNotEnabled(u8),

    /// 设备发送缓冲区已满（背压）
    #[error("Device TX queue full")]
    QueueFull,

    #[error("Unsupported by device: {0}")]
    Unsupported(&'static str),

    /// 设备上报的硬件故障
    #[error("Device error: {0}")]
    Device(String),
}

impl CommandError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, CommandError::Transport(e) if e.is_fatal())
    }
}
