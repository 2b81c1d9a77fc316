//! # CANtact Driver
//!
//! gs_usb 多通道 USB CAN 适配器的主机侧驱动。
//!
//! ## 模块
//!
//! - `interface`: 对外 API（`Interface`）和生命周期状态机
//! - `builder`: 链式构造（`InterfaceBuilder`）
//! - `pump`: 接收泵线程
//! - `queue`: 有界接收队列和取消令牌
//! - `config`: 驱动参数和通道配置
//! - `metrics`: 原子计数器
//! - `state`: 生命周期与健康状态
//! - `error`: 错误类型
//!
//! ## 示例
//!
//! ```rust,no_run
//! use cantact_driver::{Frame, InterfaceBuilder};
//! use std::time::Duration;
//!
//! let interface = InterfaceBuilder::new().build()?;
//! interface.set_bitrate(0, 500_000)?;
//! interface.set_enabled(0, true)?;
//! interface.set_loopback(0, true)?;
//! interface.start()?;
//!
//! interface.send(&Frame::new_standard(0, 0x123, &[1, 2, 3])?)?;
//! if let Some(frame) = interface.recv(Duration::from_millis(10))? {
//!     assert!(frame.is_loopback);
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

mod builder;
pub mod config;
pub mod error;
mod interface;
pub mod metrics;
mod pump;
pub mod queue;
pub mod state;

pub use builder::InterfaceBuilder;
pub use config::{ChannelConfig, DriverConfig, OverflowPolicy};
pub use error::{ConfigurationError, DriverError};
pub use interface::Interface;
pub use metrics::{DriverMetrics, MetricsSnapshot};
pub use queue::{CancelToken, QueueItem, ReceiveQueue};
pub use state::LifecycleState;

// 常用协议类型
pub use cantact_protocol::{BusError, BusErrorKind, DeviceBitTiming, Frame};
pub use cantact_usb::{DeviceCapabilities, DeviceIdentity, DeviceSelector, Transport};
