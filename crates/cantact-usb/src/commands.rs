//! 设备命令协议
//!
//! 把配置意图翻译成 gs_usb 控制请求，校验设备应答，并负责发送帧的编码。

use crate::error::{CommandError, TransportError};
use crate::transport::{DeviceIdentity, DeviceVariant, Transport};
use bytes::Bytes;
use cantact_protocol::gs_usb::*;
use cantact_protocol::{
    CommandPacket, DeviceEvent, Frame, HostFrame, ProtocolError, Request, TimingLimits,
    decode_report,
};
use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// 打开时解析一次的设备能力
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCapabilities {
    pub variant: DeviceVariant,
    pub channel_count: u8,
    /// 固件版本（命令集版本）
    pub sw_version: u32,
    pub hw_version: u32,
    pub fclk_can: u32,
    pub limits: TimingLimits,
    /// GS_CAN_FEATURE_* 位
    pub features: u32,
}

impl DeviceCapabilities {
    pub fn from_device(
        variant: DeviceVariant,
        info: &DeviceInfo,
        capability: &DeviceCapability,
    ) -> Self {
        Self {
            variant,
            channel_count: info.channel_count(),
            sw_version: info.sw_version,
            hw_version: info.hw_version,
            fclk_can: capability.fclk_can,
            limits: TimingLimits::from(capability),
            features: capability.feature,
        }
    }

    fn has(&self, feature: u32) -> bool {
        self.features & feature == feature
    }

    pub fn supports_fd(&self) -> bool {
        self.has(GS_CAN_FEATURE_FD)
    }

    pub fn supports_loopback(&self) -> bool {
        self.has(GS_CAN_FEATURE_LOOP_BACK)
    }

    pub fn supports_listen_only(&self) -> bool {
        self.has(GS_CAN_FEATURE_LISTEN_ONLY)
    }

    pub fn supports_hw_timestamp(&self) -> bool {
        self.has(GS_CAN_FEATURE_HW_TIMESTAMP)
    }

    pub fn supports_identify(&self) -> bool {
        self.has(GS_CAN_FEATURE_IDENTIFY)
    }

    pub fn supports_one_shot(&self) -> bool {
        self.has(GS_CAN_FEATURE_ONE_SHOT)
    }

    pub fn supports_triple_sample(&self) -> bool {
        self.has(GS_CAN_FEATURE_TRIPLE_SAMPLE)
    }
}

/// 一个待启动通道的模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelStart {
    pub channel: u8,
    /// GS_CAN_MODE_* 标志
    pub flags: u32,
}

/// gs_usb 命令协议
pub struct DeviceCommands {
    transport: Arc<dyn Transport>,
    capabilities: DeviceCapabilities,
    ack_timeout: Duration,
    /// 已启动通道的模式标志，下标为通道号
    started: RwLock<Vec<Option<u32>>>,
    next_echo_id: AtomicU32,
    hw_timestamp: AtomicBool,
}

impl DeviceCommands {
    /// HOST_FORMAT 握手后查询 DEVICE_CONFIG 和 BT_CONST
    pub fn probe(
        transport: Arc<dyn Transport>,
        ack_timeout: Duration,
    ) -> Result<Self, CommandError> {
        // 部分固件不支持 HOST_FORMAT，失败不影响后续流程
        if let Err(e) = transport.command(&CommandPacket::host_format(), ack_timeout) {
            trace!("HOST_FORMAT ignored by device: {}", e);
        }

        let info = transport.query(
            Request::DeviceConfig,
            0,
            DeviceInfo::SIZE,
            ack_timeout,
        )?;
        let info = DeviceInfo::unpack(&info)?;
        let capability =
            transport.query(Request::BtConst, 0, DeviceCapability::SIZE, ack_timeout)?;
        let capability = DeviceCapability::unpack(&capability)?;

        let variant = transport.identity().variant;
        let capabilities = DeviceCapabilities::from_device(variant, &info, &capability);
        debug!(
            "Probed {:?}: {} channel(s), fclk {} Hz, features 0x{:08x}, fw {}",
            capabilities.variant,
            capabilities.channel_count,
            capabilities.fclk_can,
            capabilities.features,
            capabilities.sw_version
        );

        Ok(Self {
            started: RwLock::new(vec![None; capabilities.channel_count as usize]),
            transport,
            capabilities,
            ack_timeout,
            next_echo_id: AtomicU32::new(0),
            hw_timestamp: AtomicBool::new(false),
        })
    }

    pub fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    pub fn identity(&self) -> DeviceIdentity {
        self.transport.identity()
    }

    /// 当前会话是否带硬件时间戳
    pub fn hw_timestamp(&self) -> bool {
        self.hw_timestamp.load(Ordering::Acquire)
    }

    pub fn check_channel(&self, channel: u8) -> Result<(), CommandError> {
        if channel >= self.capabilities.channel_count {
            return Err(CommandError::InvalidChannel {
                channel,
                count: self.capabilities.channel_count,
            });
        }
        Ok(())
    }

    /// 下发命令并校验应答；应答命令 ID 不匹配说明失步，复位传输后返回错误
    fn send_command(&self, packet: &CommandPacket) -> Result<(), CommandError> {
        let ack = self.transport.command(packet, self.ack_timeout)?;
        if let Err(e) = ack.verify(packet) {
            if matches!(e, ProtocolError::AckMismatch { .. }) {
                warn!("Command desynchronised ({}), resetting transport", e);
                if let Err(reset_err) = self.transport.reset() {
                    warn!("Transport reset failed: {}", reset_err);
                }
            }
            return Err(e.into());
        }
        trace!("Command {:?} acknowledged", packet.request);
        Ok(())
    }

    /// 求解位定时并下发 BITTIMING
    pub fn set_bitrate(&self, channel: u8, bitrate: u32) -> Result<DeviceBitTiming, CommandError> {
        self.check_channel(channel)?;
        let timing = DeviceBitTiming::for_bitrate(bitrate, &self.capabilities.limits)
            .map_err(|_| CommandError::InvalidBitrate { channel, bitrate })?;
        self.set_bit_timing(channel, &timing).map_err(|e| match e {
            CommandError::InvalidTiming(_) => CommandError::InvalidBitrate { channel, bitrate },
            other => other,
        })?;
        Ok(timing)
    }

    /// 下发原始位定时
    pub fn set_bit_timing(&self, channel: u8, timing: &DeviceBitTiming) -> Result<(), CommandError> {
        self.check_channel(channel)?;
        if !self.capabilities.limits.check(timing) {
            return Err(CommandError::InvalidTiming(channel));
        }
        match self.send_command(&CommandPacket::bit_timing(channel as u16, timing)) {
            Err(CommandError::Transport(TransportError::Stall)) => {
                Err(CommandError::InvalidTiming(channel))
            },
            other => other,
        }?;
        trace!(
            "Channel {} bit timing: prop_seg={}, phase_seg1={}, phase_seg2={}, sjw={}, brp={}",
            channel, timing.prop_seg, timing.phase_seg1, timing.phase_seg2, timing.sjw, timing.brp
        );
        Ok(())
    }

    /// CAN FD 数据段波特率
    pub fn set_data_bitrate(
        &self,
        channel: u8,
        bitrate: u32,
    ) -> Result<DeviceBitTiming, CommandError> {
        self.check_channel(channel)?;
        if !self.capabilities.supports_fd() {
            return Err(CommandError::Unsupported("CAN FD"));
        }
        let timing = DeviceBitTiming::for_bitrate(bitrate, &self.capabilities.limits)
            .map_err(|_| CommandError::InvalidBitrate { channel, bitrate })?;
        match self.send_command(&CommandPacket::data_bit_timing(channel as u16, &timing)) {
            Err(CommandError::Transport(TransportError::Stall)) => {
                Err(CommandError::InvalidBitrate { channel, bitrate })
            },
            other => other,
        }?;
        Ok(timing)
    }

    /// gs_usb 没有单独的使能命令：使能由 START 携带，禁用即对该通道 MODE RESET
    pub fn set_enabled(&self, channel: u8, enabled: bool) -> Result<(), CommandError> {
        self.check_channel(channel)?;
        if !enabled {
            self.reset_channel(channel)?;
        }
        Ok(())
    }

    fn reset_channel(&self, channel: u8) -> Result<(), CommandError> {
        let result = self.send_command(&CommandPacket::mode(channel as u16, DeviceMode::reset()));
        if let Some(slot) = self.started.write().get_mut(channel as usize) {
            *slot = None;
        }
        result
    }

    /// 过滤掉设备不支持的模式位（模式位与功能位位置相同）
    fn effective_flags(&self, flags: u32) -> u32 {
        flags & self.capabilities.features
    }

    /// 依次启动各通道；任一通道被拒绝时复位已启动的通道，设备回到全停止状态
    pub fn start(&self, channels: &[ChannelStart]) -> Result<(), CommandError> {
        if channels.is_empty() {
            return Err(CommandError::NoChannelsEnabled);
        }
        for start in channels {
            self.check_channel(start.channel)?;
        }

        let mut started = Vec::with_capacity(channels.len());
        for start in channels {
            let flags = self.effective_flags(start.flags);
            let packet = CommandPacket::mode(start.channel as u16, DeviceMode::start(flags));
            if let Err(e) = self.send_command(&packet) {
                warn!("Channel {} failed to start: {}", start.channel, e);
                let running = self.rollback(&started);
                if !running.is_empty() {
                    return Err(CommandError::Device(format!(
                        "channel {} failed to start ({}), channels {:?} still running",
                        start.channel, e, running
                    )));
                }
                return Err(match e {
                    CommandError::Transport(TransportError::Stall) => CommandError::Device(
                        format!("channel {} rejected START", start.channel),
                    ),
                    other => other,
                });
            }
            if let Some(slot) = self.started.write().get_mut(start.channel as usize) {
                *slot = Some(flags);
            }
            started.push((start.channel, flags));
            debug!("Channel {} started with flags 0x{:08x}", start.channel, flags);
        }

        let hw_timestamp = self
            .started
            .read()
            .iter()
            .flatten()
            .any(|flags| flags & GS_CAN_MODE_HW_TIMESTAMP != 0);
        self.hw_timestamp.store(hw_timestamp, Ordering::Release);
        Ok(())
    }

    /// 复位本次已启动的通道，返回复位失败（仍在运行）的通道
    fn rollback(&self, started: &[(u8, u32)]) -> Vec<u8> {
        let mut running = Vec::new();
        for &(channel, flags) in started {
            if let Err(e) = self.reset_channel(channel) {
                warn!("Channel {} failed to reset during rollback: {}", channel, e);
                if let Some(slot) = self.started.write().get_mut(channel as usize) {
                    *slot = Some(flags);
                }
                running.push(channel);
            }
        }
        running
    }

    /// 对每个通道下发 MODE RESET，返回第一个错误
    pub fn stop(&self) -> Result<(), CommandError> {
        let mut first_error = None;
        for channel in 0..self.capabilities.channel_count {
            if let Err(e) = self.reset_channel(channel)
                && first_error.is_none()
            {
                first_error = Some(e);
            }
        }
        self.hw_timestamp.store(false, Ordering::Release);
        debug!("All channels reset");
        first_error.map_or(Ok(()), Err)
    }

    /// 通道当前的模式标志（未启动为 None）
    pub fn channel_mode(&self, channel: u8) -> Option<u32> {
        self.started.read().get(channel as usize).copied().flatten()
    }

    /// 编码并写出一帧，返回分配的回显 ID
    ///
    /// 只等待批量 OUT 完成（设备本地排队），不等待总线发送确认。
    pub fn send_frame(&self, frame: &Frame) -> Result<u32, CommandError> {
        frame.validate()?;
        self.check_channel(frame.channel)?;
        let Some(flags) = self.channel_mode(frame.channel) else {
            return Err(CommandError::ChannelNotEnabled(frame.channel));
        };
        if frame.is_fd && flags & GS_CAN_MODE_FD == 0 {
            return Err(CommandError::Unsupported("CAN FD frame on a classic channel"));
        }

        let echo_id = self.next_echo_id.fetch_add(1, Ordering::Relaxed) % GS_USB_MAX_ECHO_ID;
        let report = HostFrame::from_frame(frame, echo_id).to_bytes(false);
        match self.transport.write(&report, self.ack_timeout) {
            Ok(()) => {
                trace!(
                    "TX channel {} id 0x{:X} len {} echo {}",
                    frame.channel, frame.id, frame.len, echo_id
                );
                Ok(echo_id)
            },
            Err(TransportError::Timeout) => Err(CommandError::QueueFull),
            Err(e) => Err(e.into()),
        }
    }

    /// 读一帧原始报告，超时返回空
    pub fn read_report(&self, timeout: Duration) -> Result<Bytes, TransportError> {
        self.transport.read(timeout)
    }

    /// 按当前会话的时间戳模式解码报告
    pub fn decode_report(&self, report: Bytes) -> Result<DeviceEvent, ProtocolError> {
        decode_report(report, self.hw_timestamp())
    }

    /// 设备时钟（µs，32 位回绕）
    pub fn device_timestamp(&self) -> Result<u32, CommandError> {
        let data = self.transport.query(Request::Timestamp, 0, 4, self.ack_timeout)?;
        let bytes: [u8; 4] = data.get(..4).and_then(|b| b.try_into().ok()).ok_or(
            ProtocolError::Truncated {
                expected: 4,
                actual: data.len(),
            },
        )?;
        Ok(u32::from_le_bytes(bytes))
    }

    /// 点亮/关闭识别 LED
    pub fn identify(&self, on: bool) -> Result<(), CommandError> {
        if !self.capabilities.supports_identify() {
            return Err(CommandError::Unsupported("identify"));
        }
        self.send_command(&CommandPacket::identify(0, on))
    }

    pub fn close(&self) {
        self.transport.close();
    }
}
