//! 套接字配置。
//!
//! 配置以 TOML 片段描述，未出现的字段回落到默认值：
//!
//! ```toml
//! read_chunk = 16384
//! write_coalesce = 4096
//! ```

use serde::Deserialize;
use thiserror::Error;

/// 默认单次原始读取上限。
pub const DEFAULT_READ_CHUNK: usize = 16 * 1024;

/// [`StreamSocket`](crate::StreamSocket) 的运行参数。
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct SocketConfig {
    /// 单次原始读取的字节上限；读满即视为“很可能还有数据”。
    pub read_chunk: usize,
    /// 刷写前合并线路队列队首小元素的目标大小，`0` 表示不合并。
    pub write_coalesce: usize,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            read_chunk: DEFAULT_READ_CHUNK,
            write_coalesce: 0,
        }
    }
}

/// 配置解析失败。
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid socket config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("read_chunk must be greater than zero")]
    ZeroReadChunk,
}

impl SocketConfig {
    pub fn with_read_chunk(mut self, read_chunk: usize) -> Self {
        self.read_chunk = read_chunk;
        self
    }

    pub fn with_write_coalesce(mut self, target: usize) -> Self {
        self.write_coalesce = target;
        self
    }

    /// 从 TOML 文本加载并校验配置。
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: SocketConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.read_chunk == 0 {
            return Err(ConfigError::ZeroReadChunk);
        }
        Ok(())
    }
}
