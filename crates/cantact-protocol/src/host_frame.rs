//! gs_host_frame 编码/解码
//!
//! 批量端点上的帧报告格式，经典 CAN（8 字节数据区）和 CAN FD（64 字节数据区）共用。
//! 完全使用 `bytes` 手动打包/解包，不依赖结构体内存布局。

use crate::frame::{Frame, dlc_to_len};
use crate::gs_usb::*;
use crate::ProtocolError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// 线上的一帧报告
#[derive(Debug, Clone, Copy)]
pub struct HostFrame {
    pub echo_id: u32, // 0xFFFFFFFF = RX，其余为 TX 回显
    pub can_id: u32,  // CAN ID（带 EFF/RTR/ERR 标志）
    pub can_dlc: u8,
    pub channel: u8,
    pub flags: u8, // GS_CAN_FLAG_*
    pub reserved: u8,
    pub data: [u8; CANFD_MAX_DLEN],
    /// Hardware timestamp in microseconds (0 if not available)
    pub timestamp_us: u32,
}

impl Default for HostFrame {
    fn default() -> Self {
        Self {
            echo_id: GS_USB_RX_ECHO_ID,
            can_id: 0,
            can_dlc: 0,
            channel: 0,
            flags: 0,
            reserved: 0,
            data: [0u8; CANFD_MAX_DLEN],
            timestamp_us: 0,
        }
    }
}

impl HostFrame {
    /// 由待发送的 `Frame` 构造发送报告
    pub fn from_frame(frame: &Frame, echo_id: u32) -> Self {
        let mut can_id = frame.id;
        if frame.is_extended {
            can_id |= CAN_EFF_FLAG;
        }
        if frame.is_remote {
            can_id |= CAN_RTR_FLAG;
        }

        let mut flags = 0;
        if frame.is_fd {
            flags |= GS_CAN_FLAG_FD;
            if frame.brs {
                flags |= GS_CAN_FLAG_BRS;
            }
        }

        let mut data = [0u8; CANFD_MAX_DLEN];
        let payload = frame.data();
        data[..payload.len()].copy_from_slice(payload);

        Self {
            echo_id,
            can_id,
            can_dlc: frame.dlc(),
            channel: frame.channel,
            flags,
            reserved: 0,
            data,
            timestamp_us: 0,
        }
    }

    pub fn is_fd(&self) -> bool {
        self.flags & GS_CAN_FLAG_FD != 0
    }

    /// 数据区大小：FD 为 64 字节，经典 CAN 为 8 字节
    pub fn data_area(&self) -> usize {
        if self.is_fd() {
            CANFD_MAX_DLEN
        } else {
            CAN_MAX_DLEN
        }
    }

    /// 线上长度
    pub fn wire_size(&self, hw_timestamp: bool) -> usize {
        GS_USB_HEADER_SIZE + self.data_area() + if hw_timestamp { 4 } else { 0 }
    }

    /// Pack frame into BytesMut
    ///
    /// * `hw_timestamp` - 是否附带时间戳字段
    pub fn pack_to(&self, buf: &mut BytesMut, hw_timestamp: bool) {
        buf.reserve(self.wire_size(hw_timestamp));
        buf.put_u32_le(self.echo_id);
        buf.put_u32_le(self.can_id);
        buf.put_u8(self.can_dlc);
        buf.put_u8(self.channel);
        buf.put_u8(self.flags);
        buf.put_u8(self.reserved);
        buf.put_slice(&self.data[..self.data_area()]);

        if hw_timestamp {
            buf.put_u32_le(self.timestamp_us);
        }
    }

    pub fn to_bytes(&self, hw_timestamp: bool) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.wire_size(hw_timestamp));
        self.pack_to(&mut buf, hw_timestamp);
        buf.freeze()
    }

    /// Unpack from Bytes
    ///
    /// FD 标志决定数据区大小；超出报告长度的尾部字节被忽略。
    pub fn unpack_from_bytes(mut data: Bytes, hw_timestamp: bool) -> Result<Self, ProtocolError> {
        if data.len() < GS_USB_HEADER_SIZE {
            return Err(ProtocolError::Truncated {
                expected: GS_USB_HEADER_SIZE,
                actual: data.len(),
            });
        }

        let mut frame = HostFrame {
            echo_id: data.get_u32_le(),
            can_id: data.get_u32_le(),
            can_dlc: data.get_u8(),
            channel: data.get_u8(),
            flags: data.get_u8(),
            reserved: data.get_u8(),
            ..Self::default()
        };

        let area = frame.data_area();
        let remaining = area + if hw_timestamp { 4 } else { 0 };
        if data.len() < remaining {
            return Err(ProtocolError::Truncated {
                expected: GS_USB_HEADER_SIZE + remaining,
                actual: GS_USB_HEADER_SIZE + data.len(),
            });
        }

        data.copy_to_slice(&mut frame.data[..area]);
        if hw_timestamp {
            frame.timestamp_us = data.get_u32_le();
        }

        Ok(frame)
    }

    /// Check if this is an RX frame (from CAN bus)
    pub fn is_rx_frame(&self) -> bool {
        self.echo_id == GS_USB_RX_ECHO_ID
    }

    /// Check if this is a TX echo (confirmation)
    pub fn is_tx_echo(&self) -> bool {
        !self.is_rx_frame()
    }

    pub fn is_error_frame(&self) -> bool {
        self.can_id & CAN_ERR_FLAG != 0
    }

    /// Check for buffer overflow
    pub fn has_overflow(&self) -> bool {
        self.flags & GS_CAN_FLAG_OVERFLOW != 0
    }

    /// 转换为 `Frame`（不含时间戳，由接收泵补齐）
    pub fn to_frame(&self) -> Result<Frame, ProtocolError> {
        let is_fd = self.is_fd();
        let is_extended = self.can_id & CAN_EFF_FLAG != 0;
        let is_remote = self.can_id & CAN_RTR_FLAG != 0;
        let id = if is_extended {
            self.can_id & CAN_EFF_MASK
        } else {
            self.can_id & CAN_SFF_MASK
        };

        let len = dlc_to_len(self.can_dlc, is_fd)?;

        let mut frame = Frame {
            channel: self.channel,
            id,
            is_extended,
            is_remote: is_remote && !is_fd,
            is_fd,
            brs: is_fd && self.flags & GS_CAN_FLAG_BRS != 0,
            esi: is_fd && self.flags & GS_CAN_FLAG_ESI != 0,
            len: len as u8,
            ..Frame::default()
        };
        if !frame.is_remote {
            frame.data[..len].copy_from_slice(&self.data[..len]);
        }
        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_classic() {
        let frame = Frame::new_standard(0, 0x123, &[0x01, 0x02, 0x03, 0x04]).unwrap();
        let host = HostFrame::from_frame(&frame, 0);

        let mut buf = BytesMut::new();
        host.pack_to(&mut buf, false);

        assert_eq!(buf.len(), GS_USB_FRAME_SIZE);
        assert_eq!(buf[0..4], [0, 0, 0, 0]); // echo_id
        assert_eq!(buf[4..8], [0x23, 0x01, 0, 0]); // can_id (little-endian)
        assert_eq!(buf[8], 4); // can_dlc
        assert_eq!(buf[9], 0); // channel
        assert_eq!(buf[10], 0); // flags
        assert_eq!(buf[12..16], [0x01, 0x02, 0x03, 0x04]);
    }

    #[test]
    fn test_pack_extended_remote() {
        let frame = Frame::new_remote(1, 0x12345678, true, 2).unwrap();
        let bytes = HostFrame::from_frame(&frame, 5).to_bytes(true);

        assert_eq!(bytes.len(), GS_USB_FRAME_SIZE_HW_TIMESTAMP);
        let can_id = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        assert_eq!(can_id & CAN_EFF_FLAG, CAN_EFF_FLAG);
        assert_eq!(can_id & CAN_RTR_FLAG, CAN_RTR_FLAG);
        assert_eq!(can_id & CAN_EFF_MASK, 0x12345678);
        assert_eq!(bytes[8], 2);
        assert_eq!(bytes[9], 1);
    }

    #[test]
    fn test_pack_fd() {
        let frame = Frame::new_fd(0, 0x42, false, &[0xAB; 32], true).unwrap();
        let bytes = HostFrame::from_frame(&frame, 1).to_bytes(false);

        assert_eq!(bytes.len(), GS_USB_FD_FRAME_SIZE);
        assert_eq!(bytes[8], 13); // DLC 13 = 32 bytes
        assert_eq!(bytes[10], GS_CAN_FLAG_FD | GS_CAN_FLAG_BRS);
        assert_eq!(bytes[12..44], [0xAB; 32]);
        assert_eq!(bytes[44..76], [0u8; 32]);
    }

    #[test]
    fn test_unpack_rx_with_timestamp() {
        let mut data = vec![0u8; GS_USB_FRAME_SIZE_HW_TIMESTAMP];
        data[0..4].copy_from_slice(&GS_USB_RX_ECHO_ID.to_le_bytes());
        data[4..8].copy_from_slice(&0x123u32.to_le_bytes());
        data[8] = 3;
        data[9] = 1;
        data[12..15].copy_from_slice(&[9, 8, 7]);
        data[20..24].copy_from_slice(&123_456u32.to_le_bytes());

        let host = HostFrame::unpack_from_bytes(Bytes::from(data), true).unwrap();
        assert!(host.is_rx_frame());
        assert_eq!(host.timestamp_us, 123_456);

        let frame = host.to_frame().unwrap();
        assert_eq!(frame.channel, 1);
        assert_eq!(frame.id, 0x123);
        assert_eq!(frame.data(), &[9, 8, 7]);
    }

    #[test]
    fn test_unpack_ignores_trailing_bytes() {
        let frame = Frame::new_standard(0, 0x7FF, &[1, 2]).unwrap();
        let mut buf = BytesMut::new();
        HostFrame::from_frame(&frame, GS_USB_RX_ECHO_ID).pack_to(&mut buf, false);
        buf.put_slice(&[0xEE; 12]);

        let host = HostFrame::unpack_from_bytes(buf.freeze(), false).unwrap();
        assert_eq!(host.to_frame().unwrap(), frame);
    }

    #[test]
    fn test_unpack_truncated() {
        let err = HostFrame::unpack_from_bytes(Bytes::from_static(&[0u8; 8]), false).unwrap_err();
        assert!(matches!(err, ProtocolError::Truncated { expected: 12, .. }));

        // 头部完整但缺少时间戳
        let err =
            HostFrame::unpack_from_bytes(Bytes::from(vec![0u8; GS_USB_FRAME_SIZE]), true)
                .unwrap_err();
        assert_eq!(
            err,
            ProtocolError::Truncated {
                expected: GS_USB_FRAME_SIZE_HW_TIMESTAMP,
                actual: GS_USB_FRAME_SIZE
            }
        );
    }

    #[test]
    fn test_unpack_fd_needs_full_data_area() {
        let mut data = vec![0u8; GS_USB_FRAME_SIZE];
        data[10] = GS_CAN_FLAG_FD;
        let err = HostFrame::unpack_from_bytes(Bytes::from(data), false).unwrap_err();
        assert!(matches!(err, ProtocolError::Truncated { expected: 76, .. }));
    }

    #[test]
    fn test_classic_dlc_above_eight_clamps() {
        let mut host = HostFrame {
            can_id: 0x10,
            can_dlc: 12,
            ..HostFrame::default()
        };
        host.data[..8].copy_from_slice(&[1; 8]);
        let frame = host.to_frame().unwrap();
        assert_eq!(frame.len, 8);

        host.can_dlc = 16;
        assert_eq!(host.to_frame(), Err(ProtocolError::InvalidDlc(16)));
    }
}
