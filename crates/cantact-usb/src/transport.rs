//! 传输层抽象
//!
//! `Transport` 是唯一接触线缆的组件：控制传输承载命令，批量端点承载帧报告。

use crate::error::TransportError;
use bytes::Bytes;
use cantact_protocol::{CommandAck, CommandPacket, Request};
use std::fmt;
use std::time::Duration;

/// 已知的适配器 VID/PID
pub const KNOWN_DEVICES: &[(u16, u16, DeviceVariant)] = &[
    (0x1D50, 0x606F, DeviceVariant::Cantact),
    (0x1209, 0x2323, DeviceVariant::CandleLight),
    (0x1CD2, 0x606F, DeviceVariant::CanextFd),
    (0x16D0, 0x10B8, DeviceVariant::CanDebuggerFd),
];

/// 适配器型号（打开时按 VID/PID 确定一次）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceVariant {
    /// CANtact / 通用 gs_usb 固件
    Cantact,
    CandleLight,
    /// CES CANext FD
    CanextFd,
    /// ABE CANdebugger FD
    CanDebuggerFd,
    /// Mock 或未知设备
    Other,
}

impl DeviceVariant {
    pub fn from_ids(vendor_id: u16, product_id: u16) -> Option<Self> {
        KNOWN_DEVICES
            .iter()
            .find(|(vid, pid, _)| *vid == vendor_id && *pid == product_id)
            .map(|(_, _, variant)| *variant)
    }
}

/// 稳定的硬件标识（不使用全局索引）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub vendor_id: u16,
    pub product_id: u16,
    pub bus: u8,
    pub address: u8,
    pub serial_number: Option<String>,
    pub variant: DeviceVariant,
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:04x} bus {} addr {}",
            self.vendor_id, self.product_id, self.bus, self.address
        )?;
        if let Some(serial) = &self.serial_number {
            write!(f, " serial {}", serial)?;
        }
        Ok(())
    }
}

/// 设备选择条件
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum DeviceSelector {
    /// 第一个可用的适配器
    #[default]
    Any,
    /// 按 USB 序列号（大小写敏感）
    Serial(String),
    /// 按 USB 总线号/地址
    BusAddress { bus: u8, address: u8 },
}

impl DeviceSelector {
    pub fn matches(&self, identity: &DeviceIdentity) -> bool {
        match self {
            DeviceSelector::Any => true,
            DeviceSelector::Serial(serial) => {
                identity.serial_number.as_deref() == Some(serial.as_str())
            },
            DeviceSelector::BusAddress { bus, address } => {
                identity.bus == *bus && identity.address == *address
            },
        }
    }
}

/// USB 传输抽象
///
/// 实现必须是 `Send + Sync`：接收泵线程读取的同时，调用方线程可以发送和下发命令。
/// 写路径（批量 OUT 和控制传输）由实现内部串行化。
pub trait Transport: Send + Sync {
    /// 下发一条控制命令（host → device），返回设备应答
    fn command(&self, packet: &CommandPacket, timeout: Duration)
    -> Result<CommandAck, TransportError>;

    /// 查询（device → host），返回恰好 `len` 字节
    fn query(
        &self,
        request: Request,
        channel: u16,
        len: usize,
        timeout: Duration,
    ) -> Result<Bytes, TransportError>;

    /// 写一帧发送报告
    fn write(&self, data: &[u8], timeout: Duration) -> Result<(), TransportError>;

    /// 读一帧入站报告，超时返回空 `Bytes`
    fn read(&self, timeout: Duration) -> Result<Bytes, TransportError>;

    /// 重新同步（USB reset + 重新 claim + 清端点 halt）
    fn reset(&self) -> Result<(), TransportError>;

    /// 释放设备，之后所有操作返回 `Closed`
    fn close(&self);

    fn identity(&self) -> DeviceIdentity;
}
