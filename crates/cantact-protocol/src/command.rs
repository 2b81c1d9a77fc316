//! 控制命令包
//!
//! 命令包头：命令 ID（`bRequest`）、通道（`wValue`）、载荷长度（`wLength`），
//! 后跟请求相关的载荷。应答回显命令 ID。

use crate::ProtocolError;
use crate::gs_usb::*;
use bytes::Bytes;

/// 控制请求（命令 ID 在同一设备族内稳定）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Request {
    HostFormat = GS_USB_BREQ_HOST_FORMAT,
    BitTiming = GS_USB_BREQ_BITTIMING,
    Mode = GS_USB_BREQ_MODE,
    Berr = GS_USB_BREQ_BERR,
    BtConst = GS_USB_BREQ_BT_CONST,
    DeviceConfig = GS_USB_BREQ_DEVICE_CONFIG,
    Timestamp = GS_USB_BREQ_TIMESTAMP,
    Identify = GS_USB_BREQ_IDENTIFY,
    DataBitTiming = GS_USB_BREQ_DATA_BITTIMING,
}

impl Request {
    pub fn id(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for Request {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            GS_USB_BREQ_HOST_FORMAT => Request::HostFormat,
            GS_USB_BREQ_BITTIMING => Request::BitTiming,
            GS_USB_BREQ_MODE => Request::Mode,
            GS_USB_BREQ_BERR => Request::Berr,
            GS_USB_BREQ_BT_CONST => Request::BtConst,
            GS_USB_BREQ_DEVICE_CONFIG => Request::DeviceConfig,
            GS_USB_BREQ_TIMESTAMP => Request::Timestamp,
            GS_USB_BREQ_IDENTIFY => Request::Identify,
            GS_USB_BREQ_DATA_BITTIMING => Request::DataBitTiming,
            other => {
                return Err(ProtocolError::InvalidFrame(format!(
                    "unknown request id {other}"
                )));
            },
        })
    }
}

/// 主机到设备的命令
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandPacket {
    pub request: Request,
    pub channel: u16,
    pub payload: Bytes,
}

impl CommandPacket {
    pub fn new(request: Request, channel: u16, payload: impl Into<Bytes>) -> Self {
        Self {
            request,
            channel,
            payload: payload.into(),
        }
    }

    /// HOST_FORMAT 握手（字节序协商）
    pub fn host_format() -> Self {
        Self::new(
            Request::HostFormat,
            1,
            GS_USB_HOST_FORMAT.to_le_bytes().to_vec(),
        )
    }

    pub fn bit_timing(channel: u16, timing: &DeviceBitTiming) -> Self {
        Self::new(Request::BitTiming, channel, timing.pack().to_vec())
    }

    pub fn data_bit_timing(channel: u16, timing: &DeviceBitTiming) -> Self {
        Self::new(Request::DataBitTiming, channel, timing.pack().to_vec())
    }

    pub fn mode(channel: u16, mode: DeviceMode) -> Self {
        Self::new(Request::Mode, channel, mode.pack().to_vec())
    }

    pub fn identify(channel: u16, on: bool) -> Self {
        Self::new(
            Request::Identify,
            channel,
            u32::from(on).to_le_bytes().to_vec(),
        )
    }

    /// 载荷长度（`wLength`）
    pub fn len(&self) -> u16 {
        self.payload.len() as u16
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// 对应的应答
    pub fn ack(&self) -> CommandAck {
        CommandAck {
            request: self.request.id(),
            channel: self.channel,
            len: self.len(),
        }
    }
}

/// 设备应答：回显命令 ID 和实际传输的载荷长度
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandAck {
    pub request: u8,
    pub channel: u16,
    pub len: u16,
}

impl CommandAck {
    /// 校验应答与请求匹配，不匹配说明与设备失步
    pub fn verify(&self, packet: &CommandPacket) -> Result<(), ProtocolError> {
        if self.request != packet.request.id() {
            return Err(ProtocolError::AckMismatch {
                expected: packet.request.id(),
                actual: self.request,
            });
        }
        if self.len != packet.len() {
            return Err(ProtocolError::Truncated {
                expected: packet.len() as usize,
                actual: self.len as usize,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_ids_stable() {
        for id in 0u8..=8 {
            let request = Request::try_from(id).unwrap();
            assert_eq!(request.id(), id);
        }
        assert!(Request::try_from(9).is_err());
    }

    #[test]
    fn test_host_format_packet() {
        let packet = CommandPacket::host_format();
        assert_eq!(packet.request, Request::HostFormat);
        assert_eq!(packet.payload.as_ref(), &[0xEF, 0xBE, 0x00, 0x00]);
        assert_eq!(packet.len(), 4);
    }

    #[test]
    fn test_mode_packet() {
        let packet = CommandPacket::mode(1, DeviceMode::start(GS_CAN_MODE_LOOP_BACK));
        assert_eq!(packet.channel, 1);
        assert_eq!(packet.len(), DeviceMode::SIZE as u16);
        assert_eq!(packet.payload.as_ref(), &[1, 0, 0, 0, 2, 0, 0, 0]);
    }

    #[test]
    fn test_identify_packet() {
        assert_eq!(
            CommandPacket::identify(0, true).payload.as_ref(),
            &[1, 0, 0, 0]
        );
        assert_eq!(
            CommandPacket::identify(0, false).payload.as_ref(),
            &[0, 0, 0, 0]
        );
    }

    #[test]
    fn test_ack_verify() {
        let packet = CommandPacket::bit_timing(0, &DeviceBitTiming::new(1, 12, 2, 1, 6));
        assert!(packet.ack().verify(&packet).is_ok());

        let wrong = CommandAck {
            request: GS_USB_BREQ_MODE,
            ..packet.ack()
        };
        assert_eq!(
            wrong.verify(&packet),
            Err(ProtocolError::AckMismatch {
                expected: GS_USB_BREQ_BITTIMING,
                actual: GS_USB_BREQ_MODE
            })
        );

        let short = CommandAck {
            len: 10,
            ..packet.ack()
        };
        assert!(matches!(
            short.verify(&packet),
            Err(ProtocolError::Truncated { .. })
        ));
    }
}
