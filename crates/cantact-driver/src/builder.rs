//! Builder 模式实现
//!
//! 提供链式构造 `Interface` 实例的便捷方式。

use crate::config::{DriverConfig, OverflowPolicy};
use crate::error::DriverError;
use crate::interface::Interface;
use cantact_usb::{DeviceSelector, Transport};
use std::sync::Arc;
use tracing::debug;

/// Interface Builder（链式构造）
///
/// # Example
///
/// ```no_run
/// use cantact_driver::{DriverConfig, InterfaceBuilder};
///
/// // 第一个找到的适配器
/// let interface = InterfaceBuilder::new().build().unwrap();
///
/// // 按序列号选择适配器，自定义接收队列
/// let config = DriverConfig {
///     queue_capacity: 4096,
///     ..Default::default()
/// };
/// let interface = InterfaceBuilder::new()
///     .serial_number("0038004B5646500620373832")
///     .driver_config(config)
///     .build()
///     .unwrap();
/// ```
pub struct InterfaceBuilder {
    /// 适配器选择条件（序列号或总线地址，从不使用全局索引）
    selector: DeviceSelector,
    config: DriverConfig,
    /// 显式注入的传输（测试或自定义后端）
    transport: Option<Arc<dyn Transport>>,
}

impl Default for InterfaceBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl InterfaceBuilder {
    pub fn new() -> Self {
        Self {
            selector: DeviceSelector::Any,
            config: DriverConfig::default(),
            transport: None,
        }
    }

    /// 按 USB 序列号选择适配器
    ///
    /// 同时连接多个适配器时，序列号是稳定的区分方式。
    pub fn serial_number(mut self, serial: impl Into<String>) -> Self {
        self.selector = DeviceSelector::Serial(serial.into());
        self
    }

    /// 按 USB 总线号和设备地址选择适配器（重新插拔后会变化）
    pub fn bus_address(mut self, bus: u8, address: u8) -> Self {
        self.selector = DeviceSelector::BusAddress { bus, address };
        self
    }

    pub fn selector(mut self, selector: DeviceSelector) -> Self {
        self.selector = selector;
        self
    }

    pub fn driver_config(mut self, config: DriverConfig) -> Self {
        self.config = config;
        self
    }

    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.config.queue_capacity = capacity;
        self
    }

    pub fn overflow_policy(mut self, policy: OverflowPolicy) -> Self {
        self.config.overflow_policy = policy;
        self
    }

    /// 使用给定的传输，忽略选择条件
    ///
    /// # Example
    ///
    /// ```ignore
    /// use cantact_driver::InterfaceBuilder;
    /// use cantact_usb::MockTransport;
    /// use std::sync::Arc;
    ///
    /// let interface = InterfaceBuilder::new()
    ///     .transport(Arc::new(MockTransport::new()))
    ///     .build()
    ///     .unwrap();
    /// ```
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// 打开设备、探测能力并创建接口
    pub fn build(self) -> Result<Interface, DriverError> {
        self.config.validate()?;
        let transport = match self.transport {
            Some(transport) => transport,
            None => open_usb(&self.selector)?,
        };
        debug!("Building interface for {}", transport.identity());
        Interface::with_transport(transport, self.config)
    }
}

#[cfg(feature = "usb")]
fn open_usb(selector: &DeviceSelector) -> Result<Arc<dyn Transport>, DriverError> {
    let transport = cantact_usb::UsbTransport::open(selector)?;
    Ok(Arc::new(transport))
}

#[cfg(not(feature = "usb"))]
fn open_usb(selector: &DeviceSelector) -> Result<Arc<dyn Transport>, DriverError> {
    tracing::warn!(
        "USB backend disabled at compile time, cannot open {:?}",
        selector
    );
    Err(DriverError::DeviceNotFound)
}
