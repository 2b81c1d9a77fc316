//! gs_usb 协议定义
//!
//! 包含协议常量和控制请求的载荷结构体（经典 CAN 与 CAN FD）。
//! 所有多字节字段统一使用 little-endian。

use crate::ProtocolError;

// 控制请求（bRequest）
pub const GS_USB_BREQ_HOST_FORMAT: u8 = 0;
pub const GS_USB_BREQ_BITTIMING: u8 = 1;
pub const GS_USB_BREQ_MODE: u8 = 2;
pub const GS_USB_BREQ_BERR: u8 = 3;
pub const GS_USB_BREQ_BT_CONST: u8 = 4;
pub const GS_USB_BREQ_DEVICE_CONFIG: u8 = 5;
/// 设备时钟（u32，微秒）
pub const GS_USB_BREQ_TIMESTAMP: u8 = 6;
pub const GS_USB_BREQ_IDENTIFY: u8 = 7;
/// CAN FD 数据段位定时
pub const GS_USB_BREQ_DATA_BITTIMING: u8 = 8;

/// HOST_FORMAT 握手值
pub const GS_USB_HOST_FORMAT: u32 = 0x0000_BEEF;

/// bmRequestType：主机到设备 | Vendor | Interface
pub const GS_USB_REQ_OUT: u8 = 0x41;
/// bmRequestType：设备到主机 | Vendor | Interface
pub const GS_USB_REQ_IN: u8 = 0xC1;

// MODE 请求的 mode 字段
pub const GS_CAN_MODE_RESET: u32 = 0;
pub const GS_CAN_MODE_START: u32 = 1;

// MODE 请求的 flags 字段
pub const GS_CAN_MODE_LISTEN_ONLY: u32 = 1 << 0;
pub const GS_CAN_MODE_LOOP_BACK: u32 = 1 << 1;
/// 单次发送，失败不重传
pub const GS_CAN_MODE_ONE_SHOT: u32 = 1 << 3;
pub const GS_CAN_MODE_HW_TIMESTAMP: u32 = 1 << 4;
pub const GS_CAN_MODE_FD: u32 = 1 << 8;

// BT_CONST.feature：与模式位同位
pub const GS_CAN_FEATURE_LISTEN_ONLY: u32 = 1 << 0;
pub const GS_CAN_FEATURE_LOOP_BACK: u32 = 1 << 1;
pub const GS_CAN_FEATURE_TRIPLE_SAMPLE: u32 = 1 << 2;
pub const GS_CAN_FEATURE_ONE_SHOT: u32 = 1 << 3;
pub const GS_CAN_FEATURE_HW_TIMESTAMP: u32 = 1 << 4;
pub const GS_CAN_FEATURE_IDENTIFY: u32 = 1 << 5;
pub const GS_CAN_FEATURE_FD: u32 = 1 << 8;

// can_id 高位标志与掩码（SocketCAN 布局）
pub const CAN_EFF_FLAG: u32 = 0x8000_0000;
pub const CAN_RTR_FLAG: u32 = 0x4000_0000;
pub const CAN_ERR_FLAG: u32 = 0x2000_0000;
pub const CAN_SFF_MASK: u32 = 0x0000_07FF;
pub const CAN_EFF_MASK: u32 = 0x1FFF_FFFF;
pub const CAN_ERR_MASK: u32 = 0x1FFF_FFFF;

/// 接收帧的 echo_id；其他值为本机发送帧的回显
pub const GS_USB_RX_ECHO_ID: u32 = 0xFFFF_FFFF;
/// 回显 ID 的取值范围（0..GS_USB_MAX_ECHO_ID 循环使用）
pub const GS_USB_MAX_ECHO_ID: u32 = 64;

pub const CAN_MAX_DLEN: usize = 8;
pub const CANFD_MAX_DLEN: usize = 64;

/// gs_host_frame 头部大小（echo_id + can_id + dlc + channel + flags + reserved）
pub const GS_USB_HEADER_SIZE: usize = 12;
pub const GS_USB_FRAME_SIZE: usize = GS_USB_HEADER_SIZE + CAN_MAX_DLEN;
/// 经典帧 + 4 字节硬件时间戳
pub const GS_USB_FRAME_SIZE_HW_TIMESTAMP: usize = GS_USB_FRAME_SIZE + 4;
pub const GS_USB_FD_FRAME_SIZE: usize = GS_USB_HEADER_SIZE + CANFD_MAX_DLEN;

// gs_host_frame.flags
pub const GS_CAN_FLAG_OVERFLOW: u8 = 1 << 0;
pub const GS_CAN_FLAG_FD: u8 = 1 << 1;
/// 数据段切换波特率
pub const GS_CAN_FLAG_BRS: u8 = 1 << 2;
pub const GS_CAN_FLAG_ESI: u8 = 1 << 3;

// 错误帧（与 Linux can/error.h 一致）

/// 错误帧 ID 中的 bus-off 位
pub const CAN_ERR_BUSOFF: u32 = 0x0000_0040;

// data[1]：控制器状态，括号内为触发条件
pub const CAN_ERR_CRTL_RX_WARNING: u8 = 0x04; // REC > 96
pub const CAN_ERR_CRTL_TX_WARNING: u8 = 0x08; // TEC > 96
pub const CAN_ERR_CRTL_RX_PASSIVE: u8 = 0x10; // REC > 127
pub const CAN_ERR_CRTL_TX_PASSIVE: u8 = 0x20; // TEC > 127
pub const CAN_ERR_CRTL_TX_BUS_OFF: u8 = 0x40;
pub const CAN_ERR_CRTL_RX_BUS_OFF: u8 = 0x80;

/// data[2]：格式错误，通常是波特率不匹配
pub const CAN_ERR_PROT_FORM: u8 = 0x02;

fn read_u32_le(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

fn ensure_len(data: &[u8], expected: usize) -> Result<(), ProtocolError> {
    if data.len() < expected {
        return Err(ProtocolError::Truncated {
            expected,
            actual: data.len(),
        });
    }
    Ok(())
}

// 控制请求载荷

/// CAN 位定时配置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceBitTiming {
    pub prop_seg: u32,
    pub phase_seg1: u32,
    pub phase_seg2: u32,
    pub sjw: u32,
    pub brp: u32,
}

impl DeviceBitTiming {
    pub const SIZE: usize = 20;

    pub fn new(prop_seg: u32, phase_seg1: u32, phase_seg2: u32, sjw: u32, brp: u32) -> Self {
        Self {
            prop_seg,
            phase_seg1,
            phase_seg2,
            sjw,
            brp,
        }
    }

    /// 每个位包含的时间量子数（含同步段）
    pub fn quanta_per_bit(&self) -> u32 {
        1u32
            .saturating_add(self.prop_seg)
            .saturating_add(self.phase_seg1)
            .saturating_add(self.phase_seg2)
    }

    /// 给定 CAN 时钟下的实际波特率
    pub fn bitrate(&self, fclk_can: u32) -> u32 {
        let divisor = self.brp.saturating_mul(self.quanta_per_bit());
        if divisor == 0 { 0 } else { fclk_can / divisor }
    }

    pub fn pack(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.prop_seg.to_le_bytes());
        buf[4..8].copy_from_slice(&self.phase_seg1.to_le_bytes());
        buf[8..12].copy_from_slice(&self.phase_seg2.to_le_bytes());
        buf[12..16].copy_from_slice(&self.sjw.to_le_bytes());
        buf[16..20].copy_from_slice(&self.brp.to_le_bytes());
        buf
    }
}

/// 设备模式配置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceMode {
    /// GS_CAN_MODE_START / GS_CAN_MODE_RESET
    pub mode: u32,
    pub flags: u32,
}

impl DeviceMode {
    pub const SIZE: usize = 8;

    pub fn new(mode: u32, flags: u32) -> Self {
        Self { mode, flags }
    }

    pub fn start(flags: u32) -> Self {
        Self::new(GS_CAN_MODE_START, flags)
    }

    pub fn reset() -> Self {
        Self::new(GS_CAN_MODE_RESET, 0)
    }

    pub fn pack(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.mode.to_le_bytes());
        buf[4..8].copy_from_slice(&self.flags.to_le_bytes());
        buf
    }

    pub fn unpack(data: &[u8]) -> Result<Self, ProtocolError> {
        ensure_len(data, Self::SIZE)?;
        Ok(Self {
            mode: read_u32_le(data, 0),
            flags: read_u32_le(data, 4),
        })
    }
}

/// 设备能力（位定时约束和功能标志）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceCapability {
    pub feature: u32,  // 功能标志位
    pub fclk_can: u32, // CAN 时钟频率（Hz）
    pub tseg1_min: u32,
    pub tseg1_max: u32,
    pub tseg2_min: u32,
    pub tseg2_max: u32,
    pub sjw_max: u32,
    pub brp_min: u32,
    pub brp_max: u32,
    pub brp_inc: u32,
}

impl DeviceCapability {
    pub const SIZE: usize = 40;

    /// 解析 BT_CONST 应答（40 字节）
    pub fn unpack(data: &[u8]) -> Result<Self, ProtocolError> {
        ensure_len(data, Self::SIZE)?;
        Ok(Self {
            feature: read_u32_le(data, 0),
            fclk_can: read_u32_le(data, 4),
            tseg1_min: read_u32_le(data, 8),
            tseg1_max: read_u32_le(data, 12),
            tseg2_min: read_u32_le(data, 16),
            tseg2_max: read_u32_le(data, 20),
            sjw_max: read_u32_le(data, 24),
            brp_min: read_u32_le(data, 28),
            brp_max: read_u32_le(data, 32),
            brp_inc: read_u32_le(data, 36),
        })
    }

    pub fn pack(&self) -> [u8; Self::SIZE] {
        let fields = [
            self.feature,
            self.fclk_can,
            self.tseg1_min,
            self.tseg1_max,
            self.tseg2_min,
            self.tseg2_max,
            self.sjw_max,
            self.brp_min,
            self.brp_max,
            self.brp_inc,
        ];
        let mut buf = [0u8; Self::SIZE];
        for (chunk, value) in buf.chunks_exact_mut(4).zip(fields) {
            chunk.copy_from_slice(&value.to_le_bytes());
        }
        buf
    }

    pub fn supports(&self, feature: u32) -> bool {
        self.feature & feature == feature
    }
}

/// 设备信息（固件版本、通道数等）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceInfo {
    pub icount: u8,      // 通道数 - 1
    pub sw_version: u32, // 固件版本
    pub hw_version: u32, // 硬件版本
}

impl DeviceInfo {
    pub const SIZE: usize = 12;

    pub fn unpack(data: &[u8]) -> Result<Self, ProtocolError> {
        ensure_len(data, Self::SIZE)?;
        Ok(Self {
            icount: data[3],
            sw_version: read_u32_le(data, 4),
            hw_version: read_u32_le(data, 8),
        })
    }

    pub fn pack(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[3] = self.icount;
        buf[4..8].copy_from_slice(&self.sw_version.to_le_bytes());
        buf[8..12].copy_from_slice(&self.hw_version.to_le_bytes());
        buf
    }

    pub fn channel_count(&self) -> u8 {
        self.icount.saturating_add(1)
    }
}
