//! 入站报告分类
//!
//! 批量 IN 端点上的每次传输是一帧报告，分为三类：
//! - 总线上收到的帧（`echo_id == 0xFFFFFFFF`）
//! - 错误帧（`can_id` 带 `CAN_ERR_FLAG`）
//! - 我方发送帧的本地回显（其余 `echo_id`）

use crate::ProtocolError;
use crate::frame::Frame;
use crate::gs_usb::*;
use crate::host_frame::HostFrame;
use bytes::Bytes;
use std::fmt;

/// 错误帧严重程度（高到低）
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum BusErrorKind {
    /// 协议错误（位错误、格式错误等），控制器仍在线
    Protocol,
    /// 错误计数超过 96
    Warning,
    /// 错误计数超过 127
    ErrorPassive,
    /// 控制器已离线
    BusOff,
}

/// 设备上报的总线错误状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BusError {
    pub channel: u8,
    pub kind: BusErrorKind,
    /// 错误帧的 CAN ID（错误类别位，不含 `CAN_ERR_FLAG`）
    pub class: u32,
    /// Controller Error Status (`data[1]`)
    pub controller: u8,
    /// Protocol Error Type (`data[2]`)
    pub protocol: u8,
}

impl BusError {
    /// 按 Linux `can/error.h` 布局解析错误帧
    pub fn from_host_frame(frame: &HostFrame) -> Self {
        let class = frame.can_id & CAN_ERR_MASK;
        let controller = frame.data[1];
        let protocol = frame.data[2];

        let kind = if class & CAN_ERR_BUSOFF != 0
            || controller & (CAN_ERR_CRTL_TX_BUS_OFF | CAN_ERR_CRTL_RX_BUS_OFF) != 0
        {
            BusErrorKind::BusOff
        } else if controller & (CAN_ERR_CRTL_RX_PASSIVE | CAN_ERR_CRTL_TX_PASSIVE) != 0 {
            BusErrorKind::ErrorPassive
        } else if controller & (CAN_ERR_CRTL_RX_WARNING | CAN_ERR_CRTL_TX_WARNING) != 0 {
            BusErrorKind::Warning
        } else {
            BusErrorKind::Protocol
        };

        Self {
            channel: frame.channel,
            kind,
            class,
            controller,
            protocol,
        }
    }

    pub fn is_bus_off(&self) -> bool {
        self.kind == BusErrorKind::BusOff
    }

    pub fn is_error_passive(&self) -> bool {
        self.kind == BusErrorKind::ErrorPassive
    }

    pub fn is_warning(&self) -> bool {
        self.kind == BusErrorKind::Warning
    }

    /// 格式错误，通常是波特率不匹配
    pub fn is_form_error(&self) -> bool {
        self.protocol & CAN_ERR_PROT_FORM != 0
    }
}

impl fmt::Display for BusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            BusErrorKind::BusOff => "bus-off",
            BusErrorKind::ErrorPassive => "error passive",
            BusErrorKind::Warning => "error warning",
            BusErrorKind::Protocol => "protocol error",
        };
        write!(
            f,
            "channel {} {} (class 0x{:X}, controller 0x{:02X}, protocol 0x{:02X})",
            self.channel, kind, self.class, self.controller, self.protocol
        )
    }
}

/// 报告的附加信息
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReportMeta {
    /// 设备时间戳（µs，32 位回绕），未启用硬件时间戳时为 None
    pub timestamp_us: Option<u32>,
    /// 设备侧接收缓冲区溢出
    pub overflow: bool,
}

/// 解码后的入站报告
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceEvent {
    /// 总线上收到的帧
    ReceivedFrame { frame: Frame, meta: ReportMeta },
    /// 错误帧
    ErrorStatus { error: BusError, meta: ReportMeta },
    /// 本地发送确认（设备回显）
    CommandAck {
        echo_id: u32,
        frame: Frame,
        meta: ReportMeta,
    },
}

impl DeviceEvent {
    pub fn meta(&self) -> &ReportMeta {
        match self {
            DeviceEvent::ReceivedFrame { meta, .. }
            | DeviceEvent::ErrorStatus { meta, .. }
            | DeviceEvent::CommandAck { meta, .. } => meta,
        }
    }

    pub fn channel(&self) -> u8 {
        match self {
            DeviceEvent::ReceivedFrame { frame, .. } | DeviceEvent::CommandAck { frame, .. } => {
                frame.channel
            },
            DeviceEvent::ErrorStatus { error, .. } => error.channel,
        }
    }
}

/// 解析一帧入站报告
///
/// 截断或字段非法返回 `ProtocolError`；调用方（接收泵）记录后丢弃，继续读取。
/// 报告之后的多余字节被忽略。
pub fn decode_report(bytes: Bytes, hw_timestamp: bool) -> Result<DeviceEvent, ProtocolError> {
    let host = HostFrame::unpack_from_bytes(bytes, hw_timestamp)?;
    let meta = ReportMeta {
        timestamp_us: hw_timestamp.then_some(host.timestamp_us),
        overflow: host.has_overflow(),
    };

    if host.is_error_frame() {
        return Ok(DeviceEvent::ErrorStatus {
            error: BusError::from_host_frame(&host),
            meta,
        });
    }

    let frame = host.to_frame()?;
    if host.is_rx_frame() {
        Ok(DeviceEvent::ReceivedFrame { frame, meta })
    } else {
        Ok(DeviceEvent::CommandAck {
            echo_id: host.echo_id,
            frame,
            meta,
        })
    }
}
