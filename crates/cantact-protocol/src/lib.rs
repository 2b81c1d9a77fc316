//! # CANtact Protocol
//!
//! gs_usb 系列 USB-CAN 适配器的线协议定义（无硬件依赖）
//!
//! ## 模块
//!
//! - `frame`: 通用 CAN / CAN FD 帧类型
//! - `gs_usb`: 协议常量和控制请求载荷
//! - `host_frame`: 批量端点上的帧报告编解码
//! - `command`: 控制命令包与应答
//! - `report`: 入站报告分类（`decode_report`）
//! - `timing`: 位定时求解
//!
//! ## 字节序
//!
//! 整个设备族统一使用 little-endian。

pub mod command;
pub mod frame;
pub mod gs_usb;
pub mod host_frame;
pub mod report;
pub mod timing;

pub use command::{CommandAck, CommandPacket, Request};
pub use frame::{Frame, dlc_to_len, len_to_dlc};
pub use host_frame::HostFrame;
pub use gs_usb::{DeviceBitTiming, DeviceCapability, DeviceInfo, DeviceMode};
pub use report::{BusError, BusErrorKind, DeviceEvent, ReportMeta, decode_report};
pub use timing::TimingLimits;

use thiserror::Error;

/// 协议层错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Truncated payload: expected at least {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("CAN ID 0x{id:X} does not fit a {} identifier", if *.extended { "29-bit" } else { "11-bit" })]
    InvalidId { id: u32, extended: bool },

    #[error("Invalid data length {len} for a {} frame", if *.fd { "CAN FD" } else { "classic CAN" })]
    InvalidLength { len: usize, fd: bool },

    #[error("Invalid DLC: {0}")]
    InvalidDlc(u8),

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Unsupported bitrate {bitrate} bps for a {fclk} Hz CAN clock")]
    InvalidBitrate { bitrate: u32, fclk: u32 },

    #[error("Ack mismatch: sent request {expected}, device acknowledged {actual}")]
    AckMismatch { expected: u8, actual: u8 },
}
