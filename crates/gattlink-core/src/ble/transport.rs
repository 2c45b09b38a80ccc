//! 平台 BLE 传输边界
//!
//! 会话层只通过 [`BleTransport`] 访问系统蓝牙栈。所有操作都是异步的，
//! 连接建立后的通知与断开事件通过 [`TransportEvent`] 通道推送。

use crate::ble::Identifier;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc;

/// 扫描中发现的外设
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeripheralCandidate {
    /// 平台地址（不透明字符串）
    pub address: String,
    pub name: Option<String>,
    /// 广播中携带的服务 UUID
    pub services: Vec<Identifier>,
    pub rssi: Option<i16>,
}

impl PeripheralCandidate {
    pub fn advertises(&self, target: &Identifier) -> bool {
        self.services.contains(target)
    }
}

impl fmt::Display for PeripheralCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} ({})", name, self.address)?,
            None => write!(f, "{}", self.address)?,
        }
        if let Some(rssi) = self.rssi {
            write!(f, " rssi={}", rssi)?;
        }
        Ok(())
    }
}

/// 已建立连接的句柄
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionHandle(String);

impl ConnectionHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn id(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 服务发现结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    pub uuid: Identifier,
    pub characteristics: Vec<Identifier>,
}

/// GATT 写入方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    #[default]
    WithResponse,
    WithoutResponse,
}

/// 传输层推送的异步事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Notification {
        characteristic: Identifier,
        payload: Vec<u8>,
    },
    /// 连接已断开（主动或被动）
    Disconnected,
}

/// 传输层错误
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("No Bluetooth adapters found")]
    NoAdapter,

    #[error("Unknown peripheral: {0}")]
    UnknownPeripheral(String),

    #[error("Characteristic not found: {0}")]
    CharacteristicNotFound(Identifier),

    #[error("Not connected")]
    NotConnected,

    #[error("Platform error: {0}")]
    Platform(String),
}

/// 系统蓝牙栈的能力集合
///
/// 实现必须可以被多个任务并发调用；会话层保证同一连接上同时最多只有一个写入。
#[async_trait]
pub trait BleTransport: Send + Sync + 'static {
    /// 开始按服务 UUID 过滤的广播扫描，返回候选设备通道
    async fn start_scan(
        &self,
        filter: Identifier,
    ) -> Result<mpsc::Receiver<PeripheralCandidate>, TransportError>;

    /// 停止扫描，重复调用无副作用
    async fn stop_scan(&self) -> Result<(), TransportError>;

    /// 连接外设，之后的通知和断开事件写入 `events`
    async fn connect(
        &self,
        candidate: &PeripheralCandidate,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<ConnectionHandle, TransportError>;

    async fn discover_services(
        &self,
        handle: &ConnectionHandle,
    ) -> Result<Vec<ServiceInfo>, TransportError>;

    async fn set_notify(
        &self,
        handle: &ConnectionHandle,
        service: Identifier,
        characteristic: Identifier,
        enabled: bool,
    ) -> Result<(), TransportError>;

    async fn write(
        &self,
        handle: &ConnectionHandle,
        service: Identifier,
        characteristic: Identifier,
        payload: &[u8],
        mode: WriteMode,
    ) -> Result<(), TransportError>;

    async fn read(
        &self,
        handle: &ConnectionHandle,
        service: Identifier,
        characteristic: Identifier,
    ) -> Result<Vec<u8>, TransportError>;

    async fn disconnect(&self, handle: &ConnectionHandle) -> Result<(), TransportError>;
}
