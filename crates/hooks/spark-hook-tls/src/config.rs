use serde::Deserialize;
use thiserror::Error;

/// rustls 单条记录可承载的最大明文长度。
pub const MAX_RECORD_PLAINTEXT: usize = 16 * 1024;

/// 线路队列默认高水位：四条满载记录。
pub const DEFAULT_WIRE_HIGH_WATER: usize = 4 * MAX_RECORD_PLAINTEXT;

/// TLS Hook 的策略参数。
///
/// ```toml
/// allow_renegotiation = false
/// record_coalesce = 16384
/// wire_high_water = 65536
/// ```
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct TlsHookConfig {
    /// 是否接受已打开会话上的对端重协商；默认拒绝。
    pub allow_renegotiation: bool,
    /// 每次加密前合并发送队列队首小元素的目标大小。
    pub record_coalesce: usize,
    /// 线路队列中未发出的密文达到该字节数后暂停加密，明文留在上层队列等待下一次写。
    pub wire_high_water: usize,
}

impl Default for TlsHookConfig {
    fn default() -> Self {
        Self {
            allow_renegotiation: false,
            record_coalesce: MAX_RECORD_PLAINTEXT,
            wire_high_water: DEFAULT_WIRE_HIGH_WATER,
        }
    }
}

#[derive(Debug, Error)]
pub enum TlsConfigError {
    #[error("invalid tls hook config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("record_coalesce must be between 1 and {max}, got {0}", max = MAX_RECORD_PLAINTEXT)]
    RecordCoalesce(usize),
    #[error("wire_high_water must be non-zero")]
    ZeroHighWater,
}

impl TlsHookConfig {
    pub fn allow_renegotiation(mut self, allow: bool) -> Self {
        self.allow_renegotiation = allow;
        self
    }

    pub fn with_record_coalesce(mut self, target: usize) -> Self {
        self.record_coalesce = target;
        self
    }

    pub fn with_wire_high_water(mut self, bytes: usize) -> Self {
        self.wire_high_water = bytes;
        self
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, TlsConfigError> {
        let config: TlsHookConfig = toml::from_str(raw)?;
        if config.record_coalesce == 0 || config.record_coalesce > MAX_RECORD_PLAINTEXT {
            return Err(TlsConfigError::RecordCoalesce(config.record_coalesce));
        }
        if config.wire_high_water == 0 {
            return Err(TlsConfigError::ZeroHighWater);
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renegotiation_is_off_by_default() {
        let config = TlsHookConfig::from_toml_str("").expect("empty config");
        assert!(!config.allow_renegotiation);
        assert_eq!(config.record_coalesce, MAX_RECORD_PLAINTEXT);
        assert_eq!(config.wire_high_water, DEFAULT_WIRE_HIGH_WATER);
    }

    #[test]
    fn oversized_coalesce_target_is_rejected() {
        let err = TlsHookConfig::from_toml_str("record_coalesce = 70000").unwrap_err();
        assert!(matches!(err, TlsConfigError::RecordCoalesce(70000)));
    }

    #[test]
    fn zero_high_water_is_rejected() {
        let err = TlsHookConfig::from_toml_str("wire_high_water = 0").unwrap_err();
        assert!(matches!(err, TlsConfigError::ZeroHighWater));
    }
}
