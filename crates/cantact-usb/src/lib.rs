//! # CANtact USB Layer
//!
//! gs_usb 适配器的传输层和设备命令协议。
//!
//! - `transport`: `Transport` trait、设备标识和选择条件
//! - `usb`: 基于 rusb 的实现（feature `usb`，默认启用）
//! - `mock`: 进程内模拟设备（feature `mock`）
//! - `commands`: 命令协议（`DeviceCommands`）

pub mod commands;
pub mod error;
pub mod transport;

#[cfg(feature = "usb")]
pub mod usb;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use commands::{ChannelStart, DeviceCapabilities, DeviceCommands};
pub use error::{CommandError, TransportError};
pub use transport::{DeviceIdentity, DeviceSelector, DeviceVariant, KNOWN_DEVICES, Transport};

#[cfg(feature = "usb")]
pub use usb::UsbTransport;

#[cfg(any(test, feature = "mock"))]
pub use mock::MockTransport;
