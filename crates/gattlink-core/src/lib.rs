//! Gattlink Core Library
//!
//! 扫码获得服务 UUID 后，通过 BLE GATT 与外设收发文本消息的会话核心。
//!
//! # 模块
//!
//! - **ble**: Identifier 编解码、传输层抽象、扫描协调、btleplug 实现
//! - **session**: 连接状态机、消息通道、会话入口
//! - **config**: 会话参数和客户端设置
//!
//! # 使用示例
//!
//! ```ignore
//! use gattlink_core::{BtleplugTransport, Identifier, Session, SessionConfig};
//!
//! // 1. 解析二维码内容
//! let id = Identifier::parse("0000ffe0-0000-1000-8000-00805f9b34fb")?;
//!
//! // 2. 创建会话并连接（扫描 -> 连接 -> 发现服务 -> 订阅通知）
//! let transport = Arc::new(BtleplugTransport::new().await?);
//! let session = Session::create(id, transport, SessionConfig::default());
//! let mut events = session.connect().await?;
//!
//! // 3. Ready 之后收发消息
//! session.send_message("hello")?;
//!
//! // 4. 断开
//! session.disconnect().await;
//! ```

pub mod ble;
pub mod config;
pub mod session;

// BLE re-exports
pub use ble::{
    BleTransport, BtleplugTransport, ConnectionHandle, Identifier, IdentifierError,
    PeripheralCandidate, ScanCoordinator, ScanError, ServiceInfo, TransportError, TransportEvent,
    WriteMode,
};

// Config re-exports
pub use config::{ClientSettings, ConfigError, SessionConfig};

// Session re-exports
pub use session::{
    Direction, FailureReason, Message, MessageLog, Session, SessionError, SessionEvent,
    SessionEvents, State,
};
