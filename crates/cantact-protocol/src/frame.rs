//! 通用 CAN / CAN FD 帧
//!
//! `Frame` 是协议层和驱动层之间传递的唯一帧类型，发送和接收共用。

use crate::ProtocolError;
use crate::gs_usb::{CAN_EFF_MASK, CAN_MAX_DLEN, CAN_SFF_MASK, CANFD_MAX_DLEN};
use std::time::Duration;

/// DLC (0-15) 到 CAN FD 数据长度的映射表
const DLC_TO_LEN: [u8; 16] = [0, 1, 2, 3, 4, 5, 6, 7, 8, 12, 16, 20, 24, 32, 48, 64];

/// 把 DLC 转换为数据长度
///
/// 经典 CAN 下 DLC 9..=15 仍表示 8 字节。
pub fn dlc_to_len(dlc: u8, fd: bool) -> Result<usize, ProtocolError> {
    if dlc > 15 {
        return Err(ProtocolError::InvalidDlc(dlc));
    }
    let len = DLC_TO_LEN[dlc as usize] as usize;
    Ok(if fd { len } else { len.min(CAN_MAX_DLEN) })
}

/// 把数据长度转换为 DLC，长度必须是 DLC 表中的值
pub fn len_to_dlc(len: usize) -> Option<u8> {
    DLC_TO_LEN
        .iter()
        .position(|&l| l as usize == len)
        .map(|dlc| dlc as u8)
}

/// CAN 帧（经典 CAN 或 CAN FD）
///
/// - **Copy**：固定 64 字节数据区，无堆分配
/// - **相等性**：只比较总线上可见的内容（通道、ID、标志、有效数据），
///   忽略 `timestamp`、`is_loopback`、`esi` 以及数据区未使用的尾部
///
/// ```rust
/// use cantact_protocol::Frame;
///
/// let frame = Frame::new_extended(0, 0xC0FFEE, &[0, 25, 0, 1, 3, 1, 4, 1]).unwrap();
/// assert_eq!(frame.id, 0xC0FFEE);
/// assert_eq!(frame.data(), &[0, 25, 0, 1, 3, 1, 4, 1]);
/// assert!(frame.timestamp.is_none());
/// ```
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Frame {
    /// 物理通道号
    pub channel: u8,
    /// CAN ID（11-bit 或 29-bit，不含标志位）
    pub id: u32,
    /// 是否为扩展帧（29-bit ID）
    pub is_extended: bool,
    /// 远程帧：不携带数据，`len` 为请求的长度
    pub is_remote: bool,
    /// CAN FD 帧
    pub is_fd: bool,
    /// Bit rate switch（仅 FD）
    pub brs: bool,
    /// Error state indicator（仅 FD，接收侧元数据）
    pub esi: bool,
    /// 本帧是设备对我方发送帧的回环回显
    pub is_loopback: bool,
    /// 有效数据长度
    pub len: u8,
    #[cfg_attr(feature = "serde", serde(with = "data_serde"))]
    pub data: [u8; CANFD_MAX_DLEN],
    /// 接收时间（本次会话内单调递增），发送帧为 None
    pub timestamp: Option<Duration>,
}

impl Default for Frame {
    fn default() -> Self {
        Self {
            channel: 0,
            id: 0,
            is_extended: false,
            is_remote: false,
            is_fd: false,
            brs: false,
            esi: false,
            is_loopback: false,
            len: 0,
            data: [0u8; CANFD_MAX_DLEN],
            timestamp: None,
        }
    }
}

impl Frame {
    /// 创建标准帧（11-bit ID）
    pub fn new_standard(channel: u8, id: u32, data: &[u8]) -> Result<Self, ProtocolError> {
        Self::build(channel, id, false, data, false)
    }

    /// 创建扩展帧（29-bit ID）
    pub fn new_extended(channel: u8, id: u32, data: &[u8]) -> Result<Self, ProtocolError> {
        Self::build(channel, id, true, data, false)
    }

    /// 创建远程帧，`len` 为请求的数据长度（0-8）
    pub fn new_remote(
        channel: u8,
        id: u32,
        is_extended: bool,
        len: u8,
    ) -> Result<Self, ProtocolError> {
        let frame = Self {
            channel,
            id,
            is_extended,
            is_remote: true,
            len,
            ..Self::default()
        };
        frame.validate()?;
        Ok(frame)
    }

    /// 创建 CAN FD 帧，数据长度必须落在 DLC 表上
    pub fn new_fd(
        channel: u8,
        id: u32,
        is_extended: bool,
        data: &[u8],
        brs: bool,
    ) -> Result<Self, ProtocolError> {
        let mut frame = Self::build(channel, id, is_extended, data, true)?;
        frame.brs = brs;
        Ok(frame)
    }

    fn build(
        channel: u8,
        id: u32,
        is_extended: bool,
        data: &[u8],
        is_fd: bool,
    ) -> Result<Self, ProtocolError> {
        let max = if is_fd { CANFD_MAX_DLEN } else { CAN_MAX_DLEN };
        if data.len() > max {
            return Err(ProtocolError::InvalidLength {
                len: data.len(),
                fd: is_fd,
            });
        }
        let mut frame = Self {
            channel,
            id,
            is_extended,
            is_fd,
            len: data.len() as u8,
            ..Self::default()
        };
        frame.data[..data.len()].copy_from_slice(data);
        frame.validate()?;
        Ok(frame)
    }

    /// 检查帧不变量：ID 位宽、数据长度、FD 专属标志
    pub fn validate(&self) -> Result<(), ProtocolError> {
        let mask = if self.is_extended {
            CAN_EFF_MASK
        } else {
            CAN_SFF_MASK
        };
        if self.id & !mask != 0 {
            return Err(ProtocolError::InvalidId {
                id: self.id,
                extended: self.is_extended,
            });
        }

        let len = self.len as usize;
        if self.is_fd {
            if len_to_dlc(len).is_none() {
                return Err(ProtocolError::InvalidLength { len, fd: true });
            }
            if self.is_remote {
                return Err(ProtocolError::InvalidFrame(
                    "CAN FD has no remote frames".to_string(),
                ));
            }
        } else {
            if len > CAN_MAX_DLEN {
                return Err(ProtocolError::InvalidLength { len, fd: false });
            }
            if self.brs || self.esi {
                return Err(ProtocolError::InvalidFrame(
                    "BRS/ESI flags require a CAN FD frame".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// 有效数据切片（远程帧为空）
    pub fn data(&self) -> &[u8] {
        if self.is_remote {
            &[]
        } else {
            &self.data[..(self.len as usize).min(CANFD_MAX_DLEN)]
        }
    }

    /// 当前长度对应的 DLC
    pub fn dlc(&self) -> u8 {
        len_to_dlc(self.len as usize).unwrap_or(self.len.min(CAN_MAX_DLEN as u8))
    }

    pub fn with_timestamp(mut self, timestamp: Duration) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

impl PartialEq for Frame {
    fn eq(&self, other: &Self) -> bool {
        self.channel == other.channel
            && self.id == other.id
            && self.is_extended == other.is_extended
            && self.is_remote == other.is_remote
            && self.is_fd == other.is_fd
            && self.brs == other.brs
            && self.len == other.len
            && self.data() == other.data()
    }
}

impl Eq for Frame {}

#[cfg(feature = "serde")]
mod data_serde {
    use super::CANFD_MAX_DLEN;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8; CANFD_MAX_DLEN], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_bytes(data)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; CANFD_MAX_DLEN], D::Error> {
        let bytes = Vec::<u8>::deserialize(d)?;
        if bytes.len() > CANFD_MAX_DLEN {
            return Err(serde::de::Error::invalid_length(
                bytes.len(),
                &"at most 64 bytes",
            ));
        }
        let mut data = [0u8; CANFD_MAX_DLEN];
        data[..bytes.len()].copy_from_slice(&bytes);
        Ok(data)
    }
}
