//! 驱动层错误类型定义

use cantact_protocol::{BusError, ProtocolError};
use cantact_usb::{CommandError, TransportError};
use thiserror::Error;

/// 配置错误（同步返回给调用方）
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("Invalid bitrate {bitrate} bps on channel {channel}")]
    InvalidBitrate { channel: u8, bitrate: u32 },

    #[error("Bit timing outside device limits on channel {0}")]
    InvalidTiming(u8),

    #[error("Invalid channel {channel} (device has {count})")]
    InvalidChannel { channel: u8, count: u8 },

    #[error("No channels enabled")]
    NoChannelsEnabled,

    #[error("Channel {0} is enabled but has no bitrate")]
    MissingBitrate(u8),

    #[error("Channel {0} runs CAN FD but has no data bitrate")]
    MissingDataBitrate(u8),

    /// 启动后配置不可修改
    #[error("Configuration is locked while the interface is started")]
    AlreadyStarted,

    #[error("Channel {channel}: {feature} is not supported by the device")]
    Unsupported { channel: u8, feature: &'static str },

    #[error("Invalid driver config: {0}")]
    InvalidDriverConfig(String),
}

/// 驱动层错误类型
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DriverError {
    #[error("Device not found")]
    DeviceNotFound,

    #[error("Device busy (claimed by another process)")]
    DeviceBusy,

    #[error("Access denied to USB device")]
    AccessDenied,

    /// 传输层错误（可能是暂时性的）
    #[error("I/O error: {0}")]
    Io(TransportError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Channel {0} is not enabled")]
    ChannelNotEnabled(u8),

    /// 设备发送缓冲区已满（背压）
    #[error("Device TX queue full")]
    QueueFull,

    /// 致命：需要重新打开设备
    #[error("Device disconnected")]
    DeviceDisconnected,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Interface closed")]
    InterfaceClosed,

    /// 接收泵上报的总线错误状态
    #[error("Bus error: {0}")]
    Bus(BusError),

    /// 设备报告的硬件故障
    #[error("Device error: {0}")]
    Device(String),

    #[error("Interface not started")]
    NotStarted,

    /// `recv_cancellable` 被取消
    #[error("Interrupted")]
    Interrupted,
}

impl DriverError {
    /// 是否需要重新打开设备
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DriverError::DeviceDisconnected
                | DriverError::InterfaceClosed
                | DriverError::DeviceNotFound
        )
    }
}

impl From<TransportError> for DriverError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::DeviceNotFound => DriverError::DeviceNotFound,
            TransportError::DeviceBusy => DriverError::DeviceBusy,
            TransportError::AccessDenied => DriverError::AccessDenied,
            TransportError::Disconnected | TransportError::Closed => {
                DriverError::DeviceDisconnected
            },
            other => DriverError::Io(other),
        }
    }
}

impl From<CommandError> for DriverError {
    fn from(e: CommandError) -> Self {
        match e {
            CommandError::Transport(e) => e.into(),
            CommandError::Protocol(e) => DriverError::Protocol(e),
            CommandError::InvalidChannel { channel, count } => {
                ConfigurationError::InvalidChannel { channel, count }.into()
            },
            CommandError::InvalidBitrate { channel, bitrate } => {
                ConfigurationError::InvalidBitrate { channel, bitrate }.into()
            },
            CommandError::InvalidTiming(channel) => ConfigurationError::InvalidTiming(channel).into(),
            CommandError::NoChannelsEnabled => ConfigurationError::NoChannelsEnabled.into(),
            CommandError::ChannelNotEnabled(channel) => DriverError::ChannelNotEnabled(channel),
            CommandError::QueueFull => DriverError::QueueFull,
            CommandError::Unsupported(feature) => DriverError::Device(format!("unsupported: {feature}")),
            CommandError::Device(message) => DriverError::Device(message),
        }
    }
}
