//! 会话配置和持久化
//!
//! 只持久化设置（上次扫描的标识、超时等），从不保存会话消息。

use log::debug;

use crate::ble::{Identifier, WriteMode};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// 单个会话的运行参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// 扫描超时（秒）
    pub scan_timeout_secs: u64,
    /// 连接超时（秒）
    pub connect_timeout_secs: u64,
    pub write_mode: WriteMode,
    /// 特征 UUID；未设置时与扫描得到的服务 UUID 相同
    #[serde(skip_serializing_if = "Option::is_none")]
    pub characteristic: Option<Identifier>,
    /// 事件通道容量
    pub event_buffer: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            scan_timeout_secs: 10,
            connect_timeout_secs: 15,
            write_mode: WriteMode::WithResponse,
            characteristic: None,
            event_buffer: 64,
        }
    }
}

/// 超时按整秒保存：不足一秒的部分向上取整，最少 1 秒
fn whole_secs(timeout: Duration) -> u64 {
    let secs = timeout.as_secs() + u64::from(timeout.subsec_nanos() > 0);
    secs.max(1)
}

impl SessionConfig {
    /// 配置文件中的 0 按 1 秒处理
    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.scan_timeout_secs.max(1))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }

    pub fn with_scan_timeout(mut self, timeout: Duration) -> Self {
        self.scan_timeout_secs = whole_secs(timeout);
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_secs = whole_secs(timeout);
        self
    }

    pub fn with_characteristic(mut self, characteristic: Identifier) -> Self {
        self.characteristic = Some(characteristic);
        self
    }

    /// 实际使用的特征 UUID
    pub fn characteristic_for(&self, service: Identifier) -> Identifier {
        self.characteristic.unwrap_or(service)
    }
}

/// 命令行客户端设置
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    /// 上次扫描得到的标识
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_identifier: Option<Identifier>,
    pub session: SessionConfig,
}

impl ClientSettings {
    /// 获取配置文件路径
    pub fn config_path() -> PathBuf {
        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("gattlink");
        config_dir.join("settings.toml")
    }

    /// 加载设置（如果文件不存在则使用默认值）
    pub fn load() -> Self {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(path: &Path) -> Self {
        if path.exists() {
            match fs::read_to_string(path) {
                Ok(content) => match toml::from_str(&content) {
                    Ok(settings) => {
                        debug!("Loaded settings from {:?}", path);
                        return settings;
                    }
                    Err(e) => {
                        log::warn!("Failed to parse settings: {}, using defaults", e);
                    }
                },
                Err(e) => {
                    log::warn!("Failed to read settings file: {}, using defaults", e);
                }
            }
        }
        Self::default()
    }

    /// 保存设置
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        debug!("Saved settings to {:?}", path);
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialize(#[from] toml::ser::Error),
}
