//! Identifier 编解码
//!
//! 将二维码扫描得到的文本解析为 128-bit 服务/特征 UUID。
//!
//! 接受的格式（大小写不敏感）：
//! - 32 位十六进制：`0000180d00001000800000805f9b34fb`
//! - 标准 8-4-4-4-12 分组：`0000180D-0000-1000-8000-00805F9B34FB`
//!
//! 其他任何输入（花括号、`urn:uuid:` 前缀、首尾空白、长度不符）都会被拒绝，
//! 绝不截断或补零。

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// 蓝牙 SIG 基准 UUID: 0000xxxx-0000-1000-8000-00805f9b34fb
const BLUETOOTH_BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5f9b_34fb;

/// 标准分组长度
const GROUPS: [usize; 5] = [8, 4, 4, 4, 12];

/// 解析失败
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid identifier {input:?}: {reason}")]
pub struct IdentifierError {
    pub input: String,
    pub reason: &'static str,
}

impl IdentifierError {
    fn new(input: &str, reason: &'static str) -> Self {
        Self {
            input: input.to_string(),
            reason,
        }
    }
}

/// 128-bit 服务/特征标识
///
/// 显示形式为小写带连字符的规范格式。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Identifier(Uuid);

impl Identifier {
    /// 解析扫描得到的文本
    pub fn parse(text: &str) -> Result<Self, IdentifierError> {
        let digits: String = match text.len() {
            32 => text.to_string(),
            36 => {
                let groups: Vec<&str> = text.split('-').collect();
                if groups.len() != GROUPS.len()
                    || groups.iter().zip(GROUPS).any(|(g, len)| g.len() != len)
                {
                    return Err(IdentifierError::new(
                        text,
                        "hyphens must follow the 8-4-4-4-12 pattern",
                    ));
                }
                groups.concat()
            }
            _ => {
                return Err(IdentifierError::new(
                    text,
                    "expected 32 hex digits, optionally hyphenated",
                ));
            }
        };

        if !digits.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(IdentifierError::new(text, "contains non-hex characters"));
        }

        let value = u128::from_str_radix(&digits, 16)
            .map_err(|_| IdentifierError::new(text, "contains non-hex characters"))?;
        Ok(Self(Uuid::from_u128(value)))
    }

    /// 从 16-bit SIG 短 UUID 构造（如心率服务 0x180D）
    pub const fn from_short(short: u16) -> Self {
        Self(Uuid::from_u128(BLUETOOTH_BASE_UUID | ((short as u128) << 96)))
    }

    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for Identifier {
    type Err = IdentifierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Identifier {
    type Error = IdentifierError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Identifier> for String {
    fn from(id: Identifier) -> Self {
        id.to_string()
    }
}

impl From<Uuid> for Identifier {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl From<Identifier> for Uuid {
    fn from(id: Identifier) -> Self {
        id.0
    }
}
