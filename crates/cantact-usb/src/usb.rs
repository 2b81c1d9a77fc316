//! rusb 后端
//!
//! 负责设备枚举、接口 claim/release、控制传输和批量传输。

use crate::error::TransportError;
use crate::transport::{DeviceIdentity, DeviceSelector, DeviceVariant, Transport};
use bytes::{Bytes, BytesMut};
use cantact_protocol::gs_usb::{GS_USB_REQ_IN, GS_USB_REQ_OUT};
use cantact_protocol::{CommandAck, CommandPacket, Request};
use parking_lot::{Mutex, RwLock};
use rusb::{Device, DeviceHandle, GlobalContext};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// 单次批量 IN 读取的缓冲区（高速端点最大包长）
const READ_BUFFER_SIZE: usize = 512;

/// 基于 libusb 的 gs_usb 传输
///
/// 每个实例独占一个适配器的接口 0；多个适配器可以各自打开一个实例。
pub struct UsbTransport {
    /// reset/close 需要 `&mut`，其余传输只读共享
    handle: RwLock<DeviceHandle<GlobalContext>>,
    identity: DeviceIdentity,
    interface_number: u8,
    endpoint_in: u8,
    endpoint_out: u8,
    /// 串行化批量 OUT 和控制传输
    write_lock: Mutex<()>,
    claimed: AtomicBool,
    closed: AtomicBool,
}

impl UsbTransport {
    /// 列出所有已连接的适配器（不 claim）
    pub fn list() -> Result<Vec<DeviceIdentity>, TransportError> {
        let mut identities = Vec::new();
        for device in rusb::devices()?.iter() {
            let Ok(desc) = device.device_descriptor() else {
                continue;
            };
            let Some(variant) = DeviceVariant::from_ids(desc.vendor_id(), desc.product_id())
            else {
                continue;
            };
            // 序列号需要打开设备才能读取，打不开时保留空值
            let serial_number = device
                .open()
                .ok()
                .and_then(|handle| Self::read_serial(&handle, &desc));
            identities.push(Self::identity_of(&device, &desc, variant, serial_number));
        }
        Ok(identities)
    }

    /// 打开第一个匹配选择条件的适配器并 claim 接口
    ///
    /// 任何失败路径上已 claim 的接口都会在 Drop 中释放。
    pub fn open(selector: &DeviceSelector) -> Result<Self, TransportError> {
        let mut last_error = None;

        for device in rusb::devices()?.iter() {
            let Ok(desc) = device.device_descriptor() else {
                continue;
            };
            let Some(variant) = DeviceVariant::from_ids(desc.vendor_id(), desc.product_id())
            else {
                continue;
            };
            if let DeviceSelector::BusAddress { bus, address } = selector
                && (device.bus_number() != *bus || device.address() != *address)
            {
                continue;
            }

            let handle = match device.open() {
                Ok(handle) => handle,
                Err(e) => {
                    debug!("Cannot open {:04x}:{:04x}: {}", desc.vendor_id(), desc.product_id(), e);
                    last_error = Some(TransportError::from(e));
                    continue;
                },
            };

            let serial_number = Self::read_serial(&handle, &desc);
            let identity = Self::identity_of(&device, &desc, variant, serial_number);
            if !selector.matches(&identity) {
                continue;
            }

            let Some((endpoint_in, endpoint_out)) = Self::find_bulk_endpoints(&device) else {
                debug!("{} has no bulk endpoint pair, skipping", identity);
                continue;
            };

            let mut transport = UsbTransport {
                handle: RwLock::new(handle),
                identity,
                interface_number: 0,
                endpoint_in,
                endpoint_out,
                write_lock: Mutex::new(()),
                claimed: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            };

            match transport.prepare_interface() {
                Ok(()) => {
                    transport.clear_usb_endpoints();
                    debug!("Opened {}", transport.identity);
                    return Ok(transport);
                },
                Err(e) => {
                    warn!("Cannot claim {}: {}", transport.identity, e);
                    last_error = Some(e);
                },
            }
        }

        Err(last_error.unwrap_or(TransportError::DeviceNotFound))
    }

    fn identity_of(
        device: &Device<GlobalContext>,
        desc: &rusb::DeviceDescriptor,
        variant: DeviceVariant,
        serial_number: Option<String>,
    ) -> DeviceIdentity {
        DeviceIdentity {
            vendor_id: desc.vendor_id(),
            product_id: desc.product_id(),
            bus: device.bus_number(),
            address: device.address(),
            serial_number,
            variant,
        }
    }

    fn read_serial(
        handle: &DeviceHandle<GlobalContext>,
        desc: &rusb::DeviceDescriptor,
    ) -> Option<String> {
        match desc.serial_number_string_index() {
            Some(idx) if idx != 0 => handle.read_string_descriptor_ascii(idx).ok(),
            _ => None,
        }
    }

    /// 查找 Bulk IN/OUT 端点
    fn find_bulk_endpoints(device: &Device<GlobalContext>) -> Option<(u8, u8)> {
        let config = device.config_descriptor(0).ok()?;
        let interface = config.interfaces().next()?.descriptors().next()?;

        let mut endpoint_in = None;
        let mut endpoint_out = None;
        for endpoint in interface.endpoint_descriptors() {
            if endpoint.transfer_type() == rusb::TransferType::Bulk {
                match endpoint.direction() {
                    rusb::Direction::In => endpoint_in = Some(endpoint.address()),
                    rusb::Direction::Out => endpoint_out = Some(endpoint.address()),
                }
            }
        }

        Some((endpoint_in?, endpoint_out?))
    }

    /// detach 内核驱动，claim 接口
    ///
    /// 必须先 claim 再 reset，否则部分平台（macOS）会崩溃。
    fn prepare_interface(&mut self) -> Result<(), TransportError> {
        if self.claimed.load(Ordering::Acquire) {
            return Ok(());
        }
        let interface = self.interface_number;
        let handle = self.handle.get_mut();

        #[cfg(any(target_os = "linux", target_os = "macos"))]
        {
            if handle.kernel_driver_active(interface).unwrap_or(false) {
                handle.detach_kernel_driver(interface)?;
            }
        }

        handle.claim_interface(interface)?;
        self.claimed.store(true, Ordering::Release);

        if let Err(e) = handle.reset() {
            trace!("Device reset failed (may be normal): {}", e);
        }
        std::thread::sleep(Duration::from_millis(100));
        Ok(())
    }

    /// 清除端点 Halt 状态并复位 Data Toggle
    ///
    /// 异常退出或超时后，主机和设备的 Data Toggle 可能不同步，设备会静默丢弃数据包。
    fn clear_usb_endpoints(&self) {
        let handle = self.handle.read();
        if let Err(e) = handle.clear_halt(self.endpoint_in) {
            trace!("Failed to clear halt on IN endpoint: {}", e);
        }
        if let Err(e) = handle.clear_halt(self.endpoint_out) {
            trace!("Failed to clear halt on OUT endpoint: {}", e);
        }
        std::thread::sleep(Duration::from_millis(10));
    }

    fn release_interface(&self, handle: &mut DeviceHandle<GlobalContext>) {
        if self.claimed.swap(false, Ordering::AcqRel) {
            // 设备可能已断开，忽略错误
            let _ = handle.release_interface(self.interface_number);
            trace!("USB interface released");
        }
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }
}

impl Transport for UsbTransport {
    fn command(
        &self,
        packet: &CommandPacket,
        timeout: Duration,
    ) -> Result<CommandAck, TransportError> {
        self.ensure_open()?;
        let _guard = self.write_lock.lock();
        let written = self.handle.read().write_control(
            GS_USB_REQ_OUT,
            packet.request.id(),
            packet.channel,
            u16::from(self.interface_number),
            &packet.payload,
            timeout,
        )?;
        trace!(
            "Control OUT {:?} channel {} ({} bytes)",
            packet.request, packet.channel, written
        );
        Ok(CommandAck {
            request: packet.request.id(),
            channel: packet.channel,
            len: written as u16,
        })
    }

    fn query(
        &self,
        request: Request,
        channel: u16,
        len: usize,
        timeout: Duration,
    ) -> Result<Bytes, TransportError> {
        self.ensure_open()?;
        let mut buf = BytesMut::zeroed(len);
        let read = {
            let _guard = self.write_lock.lock();
            self.handle.read().read_control(
                GS_USB_REQ_IN,
                request.id(),
                channel,
                u16::from(self.interface_number),
                &mut buf,
                timeout,
            )?
        };
        if read < len {
            return Err(TransportError::InvalidResponse {
                expected: len,
                actual: read,
            });
        }
        Ok(buf.freeze())
    }

    /// 批量 OUT 超时后端点可能进入 STALL，先清除 halt 再返回
    fn write(&self, data: &[u8], timeout: Duration) -> Result<(), TransportError> {
        self.ensure_open()?;
        let _guard = self.write_lock.lock();
        let handle = self.handle.read();
        match handle.write_bulk(self.endpoint_out, data, timeout) {
            Ok(_) => Ok(()),
            Err(rusb::Error::Timeout) => {
                if let Err(clear_err) = handle.clear_halt(self.endpoint_out) {
                    warn!("Failed to clear endpoint halt after timeout: {}", clear_err);
                }
                Err(TransportError::Timeout)
            },
            Err(e) => Err(e.into()),
        }
    }

    fn read(&self, timeout: Duration) -> Result<Bytes, TransportError> {
        self.ensure_open()?;
        let mut buf = BytesMut::zeroed(READ_BUFFER_SIZE);
        match self.handle.read().read_bulk(self.endpoint_in, &mut buf, timeout) {
            Ok(len) => {
                buf.truncate(len);
                Ok(buf.freeze())
            },
            Err(rusb::Error::Timeout) => Ok(Bytes::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn reset(&self) -> Result<(), TransportError> {
        self.ensure_open()?;
        warn!("Resynchronising {}", self.identity);
        {
            let mut handle = self.handle.write();
            self.release_interface(&mut handle);
            handle.reset()?;
            handle.claim_interface(self.interface_number)?;
            self.claimed.store(true, Ordering::Release);
        }
        self.clear_usb_endpoints();
        Ok(())
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut handle = self.handle.write();
        self.release_interface(&mut handle);
        debug!("Closed {}", self.identity);
    }

    fn identity(&self) -> DeviceIdentity {
        self.identity.clone()
    }
}

impl Drop for UsbTransport {
    fn drop(&mut self) {
        let claimed = self.claimed.load(Ordering::Acquire);
        if claimed {
            let _ = self.handle.get_mut().release_interface(self.interface_number);
            self.claimed.store(false, Ordering::Release);
            trace!("USB interface released");
        }
    }
}
