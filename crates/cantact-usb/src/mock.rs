//! 进程内模拟设备
//!
//! 行为对齐 gs_usb 固件：按通道维护模式，每个发送帧产生一条回显，
//! 开启硬件时间戳时报告附带 32 位微秒时间戳。另外可以注入报告和各类故障。

use crate::error::TransportError;
use crate::transport::{DeviceIdentity, DeviceVariant, Transport};
use bytes::Bytes;
use cantact_protocol::gs_usb::*;
use cantact_protocol::{CommandAck, CommandPacket, Frame, HostFrame, Request};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tracing::trace;

/// 每条报告推进的模拟时钟（µs）
const CLOCK_STEP_US: u32 = 100;

/// candleLight（STM32F072）的 BT_CONST
pub fn candlelight_capability() -> DeviceCapability {
    DeviceCapability {
        feature: GS_CAN_FEATURE_LISTEN_ONLY
            | GS_CAN_FEATURE_LOOP_BACK
            | GS_CAN_FEATURE_TRIPLE_SAMPLE
            | GS_CAN_FEATURE_ONE_SHOT
            | GS_CAN_FEATURE_HW_TIMESTAMP
            | GS_CAN_FEATURE_IDENTIFY,
        fclk_can: 48_000_000,
        tseg1_min: 1,
        tseg1_max: 16,
        tseg2_min: 1,
        tseg2_max: 8,
        sjw_max: 4,
        brp_min: 1,
        brp_max: 1024,
        brp_inc: 1,
    }
}

#[derive(Debug, Clone, Default)]
struct MockChannel {
    started: bool,
    flags: u32,
    timing: Option<DeviceBitTiming>,
    data_timing: Option<DeviceBitTiming>,
}

#[derive(Debug)]
struct MockState {
    capability: DeviceCapability,
    info: DeviceInfo,
    channels: Vec<MockChannel>,
    commands: Vec<CommandPacket>,
    written: Vec<Frame>,
    rejected: HashSet<Request>,
    reject_start: HashSet<u16>,
    reject_reset: HashSet<u16>,
    ack_override: Option<u8>,
    tx_full: bool,
    read_faults: VecDeque<TransportError>,
    read_delay: Option<Duration>,
    resets: usize,
}

/// 模拟 gs_usb 适配器
pub struct MockTransport {
    state: Mutex<MockState>,
    reports_tx: Sender<Bytes>,
    reports_rx: Receiver<Bytes>,
    clock_us: AtomicU32,
    closed: AtomicBool,
    identity: DeviceIdentity,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    /// 双通道 candleLight
    pub fn new() -> Self {
        let (reports_tx, reports_rx) = crossbeam_channel::unbounded();
        Self {
            state: Mutex::new(MockState {
                capability: candlelight_capability(),
                info: DeviceInfo {
                    icount: 1,
                    sw_version: 2,
                    hw_version: 1,
                },
                channels: vec![MockChannel::default(); 2],
                commands: Vec::new(),
                written: Vec::new(),
                rejected: HashSet::new(),
                reject_start: HashSet::new(),
                reject_reset: HashSet::new(),
                ack_override: None,
                tx_full: false,
                read_faults: VecDeque::new(),
                read_delay: None,
                resets: 0,
            }),
            reports_tx,
            reports_rx,
            clock_us: AtomicU32::new(0),
            closed: AtomicBool::new(false),
            identity: DeviceIdentity {
                vendor_id: 0x1209,
                product_id: 0x2323,
                bus: 0,
                address: 0,
                serial_number: Some("MOCK0001".to_string()),
                variant: DeviceVariant::Other,
            },
        }
    }

    pub fn with_channels(self, count: u8) -> Self {
        {
            let mut state = self.state.lock();
            let count = count.max(1);
            state.info.icount = count - 1;
            state.channels = vec![MockChannel::default(); count as usize];
        }
        self
    }

    pub fn with_capability(self, capability: DeviceCapability) -> Self {
        self.state.lock().capability = capability;
        self
    }

    /// 增加 CAN FD 支持
    pub fn with_fd(self) -> Self {
        self.state.lock().capability.feature |= GS_CAN_FEATURE_FD;
        self
    }

    pub fn with_serial(mut self, serial: &str) -> Self {
        self.identity.serial_number = Some(serial.to_string());
        self
    }

    // ------------------------------------------------------------------
    // 注入
    // ------------------------------------------------------------------

    /// 注入原始报告字节
    pub fn inject_report(&self, report: Bytes) {
        let _ = self.reports_tx.send(report);
    }

    /// 注入一帧总线接收帧
    pub fn inject_frame(&self, frame: &Frame) {
        let mut host = HostFrame::from_frame(frame, GS_USB_RX_ECHO_ID);
        host.timestamp_us = self.tick();
        let hw_timestamp = self.channel_hw_timestamp(frame.channel);
        self.inject_report(host.to_bytes(hw_timestamp));
    }

    /// 注入一条错误帧（`controller` = data[1]，`protocol` = data[2]）
    pub fn inject_bus_error(&self, channel: u8, controller: u8, protocol: u8) {
        let mut host = HostFrame {
            can_id: CAN_ERR_FLAG,
            can_dlc: 8,
            channel,
            timestamp_us: self.tick(),
            ..HostFrame::default()
        };
        if controller & (CAN_ERR_CRTL_TX_BUS_OFF | CAN_ERR_CRTL_RX_BUS_OFF) != 0 {
            host.can_id |= CAN_ERR_BUSOFF;
        }
        host.data[1] = controller;
        host.data[2] = protocol;
        let hw_timestamp = self.channel_hw_timestamp(channel);
        self.inject_report(host.to_bytes(hw_timestamp));
    }

    /// 下一次 `read` 返回该错误
    pub fn inject_read_error(&self, error: TransportError) {
        self.state.lock().read_faults.push_back(error);
    }

    /// 模拟卡死的 I/O：每次 `read` 先阻塞指定时长
    pub fn set_read_delay(&self, delay: Option<Duration>) {
        self.state.lock().read_delay = delay;
    }

    /// 设备对该请求返回 STALL
    pub fn reject(&self, request: Request) {
        self.state.lock().rejected.insert(request);
    }

    /// 该通道的 MODE START 被拒绝（例如总线接线故障）
    pub fn reject_start(&self, channel: u16) {
        self.state.lock().reject_start.insert(channel);
    }

    /// 该通道的 MODE RESET 被拒绝，通道保持运行
    pub fn reject_reset(&self, channel: u16) {
        self.state.lock().reject_reset.insert(channel);
    }

    /// 应答回显错误的命令 ID（模拟失步）
    pub fn set_ack_override(&self, request: Option<u8>) {
        self.state.lock().ack_override = request;
    }

    /// 设备发送缓冲区已满：批量 OUT 超时
    pub fn set_tx_full(&self, full: bool) {
        self.state.lock().tx_full = full;
    }

    pub fn set_clock(&self, us: u32) {
        self.clock_us.store(us, Ordering::SeqCst);
    }

    // ------------------------------------------------------------------
    // 观察
    // ------------------------------------------------------------------

    pub fn commands(&self) -> Vec<CommandPacket> {
        self.state.lock().commands.clone()
    }

    pub fn commands_of(&self, request: Request) -> Vec<CommandPacket> {
        self.state
            .lock()
            .commands
            .iter()
            .filter(|c| c.request == request)
            .cloned()
            .collect()
    }

    pub fn clear_commands(&self) {
        self.state.lock().commands.clear();
    }

    /// 设备收到的发送帧
    pub fn written_frames(&self) -> Vec<Frame> {
        self.state.lock().written.clone()
    }

    pub fn started_channels(&self) -> Vec<u8> {
        self.state
            .lock()
            .channels
            .iter()
            .enumerate()
            .filter(|(_, c)| c.started)
            .map(|(i, _)| i as u8)
            .collect()
    }

    /// 已启动通道的模式标志
    pub fn channel_flags(&self, channel: u8) -> Option<u32> {
        let state = self.state.lock();
        state
            .channels
            .get(channel as usize)
            .filter(|c| c.started)
            .map(|c| c.flags)
    }

    pub fn bit_timing(&self, channel: u8) -> Option<DeviceBitTiming> {
        self.state
            .lock()
            .channels
            .get(channel as usize)
            .and_then(|c| c.timing)
    }

    pub fn data_bit_timing(&self, channel: u8) -> Option<DeviceBitTiming> {
        self.state
            .lock()
            .channels
            .get(channel as usize)
            .and_then(|c| c.data_timing)
    }

    pub fn reset_count(&self) -> usize {
        self.state.lock().resets
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn pending_reports(&self) -> usize {
        self.reports_rx.len()
    }

    fn tick(&self) -> u32 {
        self.clock_us.fetch_add(CLOCK_STEP_US, Ordering::SeqCst)
    }

    fn channel_hw_timestamp(&self, channel: u8) -> bool {
        self.channel_flags(channel)
            .is_some_and(|flags| flags & GS_CAN_MODE_HW_TIMESTAMP != 0)
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.is_closed() {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }

    fn apply_command(state: &mut MockState, packet: &CommandPacket) -> Result<(), TransportError> {
        let channel = state
            .channels
            .get_mut(packet.channel as usize)
            .ok_or(TransportError::Stall);
        match packet.request {
            Request::HostFormat => Ok(()),
            Request::Identify => {
                if state.capability.supports(GS_CAN_FEATURE_IDENTIFY) {
                    Ok(())
                } else {
                    Err(TransportError::Stall)
                }
            },
            Request::BitTiming | Request::DataBitTiming => {
                let channel = channel?;
                let p = &packet.payload;
                if p.len() < DeviceBitTiming::SIZE {
                    return Err(TransportError::Stall);
                }
                let word = |i: usize| u32::from_le_bytes([p[i], p[i + 1], p[i + 2], p[i + 3]]);
                let timing = DeviceBitTiming::new(word(0), word(4), word(8), word(12), word(16));
                if packet.request == Request::BitTiming {
                    channel.timing = Some(timing);
                } else {
                    channel.data_timing = Some(timing);
                }
                Ok(())
            },
            Request::Mode => {
                let mode = DeviceMode::unpack(&packet.payload).map_err(|_| TransportError::Stall)?;
                let reject_start = state.reject_start.contains(&packet.channel);
                let reject_reset = state.reject_reset.contains(&packet.channel);
                let channel = channel?;
                if mode.mode == GS_CAN_MODE_START {
                    if reject_start || channel.timing.is_none() {
                        return Err(TransportError::Stall);
                    }
                    channel.started = true;
                    channel.flags = mode.flags;
                } else if reject_reset {
                    return Err(TransportError::Stall);
                } else {
                    channel.started = false;
                    channel.flags = 0;
                }
                Ok(())
            },
            _ => Err(TransportError::Stall),
        }
    }
}

impl Transport for MockTransport {
    fn command(
        &self,
        packet: &CommandPacket,
        _timeout: Duration,
    ) -> Result<CommandAck, TransportError> {
        self.ensure_open()?;
        let mut state = self.state.lock();
        state.commands.push(packet.clone());
        if state.rejected.contains(&packet.request) {
            return Err(TransportError::Stall);
        }
        Self::apply_command(&mut state, packet)?;

        let mut ack = packet.ack();
        if let Some(request) = state.ack_override {
            ack.request = request;
        }
        trace!("Mock command {:?} channel {}", packet.request, packet.channel);
        Ok(ack)
    }

    fn query(
        &self,
        request: Request,
        _channel: u16,
        len: usize,
        _timeout: Duration,
    ) -> Result<Bytes, TransportError> {
        self.ensure_open()?;
        let state = self.state.lock();
        if state.rejected.contains(&request) {
            return Err(TransportError::Stall);
        }
        let payload = match request {
            Request::BtConst => state.capability.pack().to_vec(),
            Request::DeviceConfig => state.info.pack().to_vec(),
            Request::Timestamp => self.clock_us.load(Ordering::SeqCst).to_le_bytes().to_vec(),
            _ => return Err(TransportError::Stall),
        };
        if payload.len() < len {
            return Err(TransportError::InvalidResponse {
                expected: len,
                actual: payload.len(),
            });
        }
        Ok(Bytes::from(payload).slice(..len))
    }

    fn write(&self, data: &[u8], _timeout: Duration) -> Result<(), TransportError> {
        self.ensure_open()?;
        let host = HostFrame::unpack_from_bytes(Bytes::copy_from_slice(data), false)
            .map_err(|e| TransportError::Io(e.to_string()))?;

        let hw_timestamp = {
            let mut state = self.state.lock();
            if state.tx_full {
                return Err(TransportError::Timeout);
            }
            let Some(channel) = state.channels.get(host.channel as usize) else {
                return Err(TransportError::Io(format!("no channel {}", host.channel)));
            };
            if !channel.started {
                // 未启动的通道：固件直接丢弃
                return Ok(());
            }
            let hw_timestamp = channel.flags & GS_CAN_MODE_HW_TIMESTAMP != 0;
            if let Ok(frame) = host.to_frame() {
                state.written.push(frame);
            }
            hw_timestamp
        };

        // 回显（本地发送确认）
        let mut echo = host;
        echo.timestamp_us = self.tick();
        self.inject_report(echo.to_bytes(hw_timestamp));
        Ok(())
    }

    fn read(&self, timeout: Duration) -> Result<Bytes, TransportError> {
        self.ensure_open()?;
        let delay = {
            let mut state = self.state.lock();
            if let Some(fault) = state.read_faults.pop_front() {
                return Err(fault);
            }
            state.read_delay
        };
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        match self.reports_rx.recv_timeout(timeout) {
            Ok(report) => Ok(report),
            Err(RecvTimeoutError::Timeout) => Ok(Bytes::new()),
            Err(RecvTimeoutError::Disconnected) => Err(TransportError::Disconnected),
        }
    }

    fn reset(&self) -> Result<(), TransportError> {
        self.ensure_open()?;
        let mut state = self.state.lock();
        state.resets += 1;
        state.ack_override = None;
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn identity(&self) -> DeviceIdentity {
        self.identity.clone()
    }
}
