use std::{
    collections::BTreeMap,
    fmt,
    net::IpAddr,
    str::FromStr,
    time::Duration,
};

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use serde::Deserialize;
use thiserror::Error;

/// 建立后应用消息的帧类型，握手完成后固定不变。
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FrameMode {
    /// opcode 0x1，出站数据会被整理为合法 UTF-8。
    Text,
    /// opcode 0x2，出站数据原样发送。
    Binary,
}

/// WebSocket Hook 的策略参数。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 升级阶段的所有放行决策（来源、代理、子协议、请求大小）集中在一个可从 TOML 载入的结构里，
///   运维可以在不改代码的前提下收紧策略。
///
/// ## 契约（What）
/// - `allowed_origins`：`Origin` 白名单，glob 语法（`*`、`?`、`[...]`、`{a,b}`），不区分大小写；
/// - `allow_missing_origin`：未携带 `Origin` 的连接（非浏览器客户端）是否放行，默认放行；
/// - `proxy_ranges`：受信代理网段（CIDR）；对端落在其中时以 `proxy_header` 的值作为真实地址；
/// - `subprotocols`：子协议令牌到帧类型的映射；`default_mode` 为 `None` 时未协商成功即拒绝；
/// - `min_ping_interval_ms`：相邻 ping/pong 的最小间隔，`0` 表示不限制；
/// - `max_request_size`：升级请求头块的上限，超出以 HTTP 431 拒绝；
/// - `user_facing`：面向用户的连接收到 pong 时刷新活跃时间。
///
/// ```toml
/// allowed_origins = ["https://*.example.org"]
/// allow_missing_origin = false
/// proxy_ranges = ["10.0.0.0/8"]
/// proxy_header = "X-Real-IP"
/// default_mode = "text"
/// min_ping_interval_ms = 1000
///
/// [subprotocols]
/// "binary.example.org" = "binary"
/// "text.example.org" = "text"
/// ```
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct WebSocketConfig {
    pub allowed_origins: OriginAllowList,
    pub allow_missing_origin: bool,
    pub proxy_ranges: Vec<ProxyRange>,
    pub proxy_header: String,
    pub subprotocols: BTreeMap<String, FrameMode>,
    pub default_mode: Option<FrameMode>,
    pub min_ping_interval_ms: u64,
    pub max_request_size: usize,
    pub user_facing: bool,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            allowed_origins: OriginAllowList::default(),
            allow_missing_origin: true,
            proxy_ranges: Vec::new(),
            proxy_header: "X-Real-IP".to_string(),
            subprotocols: BTreeMap::new(),
            default_mode: Some(FrameMode::Text),
            min_ping_interval_ms: 1000,
            max_request_size: 8 * 1024,
            user_facing: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum WebSocketConfigError {
    #[error("invalid websocket hook config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("max_request_size must be non-zero")]
    ZeroRequestSize,
    #[error("proxy_header must not be empty when proxy_ranges are configured")]
    EmptyProxyHeader,
    #[error("invalid origin pattern: {0}")]
    InvalidOrigin(#[from] globset::Error),
}

impl WebSocketConfig {
    /// 追加一条 `Origin` 模式；模式无法编译时返回错误。
    pub fn allow_origin(mut self, pattern: impl Into<String>) -> Result<Self, WebSocketConfigError> {
        self.allowed_origins.push(pattern)?;
        Ok(self)
    }

    pub fn allow_missing_origin(mut self, allow: bool) -> Self {
        self.allow_missing_origin = allow;
        self
    }

    pub fn trust_proxy(mut self, range: ProxyRange) -> Self {
        self.proxy_ranges.push(range);
        self
    }

    pub fn with_proxy_header(mut self, header: impl Into<String>) -> Self {
        self.proxy_header = header.into();
        self
    }

    pub fn with_subprotocol(mut self, token: impl Into<String>, mode: FrameMode) -> Self {
        self.subprotocols.insert(token.into(), mode);
        self
    }

    pub fn with_default_mode(mut self, mode: Option<FrameMode>) -> Self {
        self.default_mode = mode;
        self
    }

    pub fn with_min_ping_interval(mut self, interval: Duration) -> Self {
        self.min_ping_interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_max_request_size(mut self, size: usize) -> Self {
        self.max_request_size = size;
        self
    }

    pub fn user_facing(mut self, user_facing: bool) -> Self {
        self.user_facing = user_facing;
        self
    }

    pub fn min_ping_interval(&self) -> Duration {
        Duration::from_millis(self.min_ping_interval_ms)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, WebSocketConfigError> {
        let config: WebSocketConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), WebSocketConfigError> {
        if self.max_request_size == 0 {
            return Err(WebSocketConfigError::ZeroRequestSize);
        }
        if !self.proxy_ranges.is_empty() && self.proxy_header.trim().is_empty() {
            return Err(WebSocketConfigError::EmptyProxyHeader);
        }
        Ok(())
    }

    /// `Origin` 是否命中白名单。
    pub fn origin_allowed(&self, origin: &str) -> bool {
        self.allowed_origins.is_match(origin)
    }

    /// 对端地址是否属于受信代理。
    pub fn is_trusted_proxy(&self, addr: IpAddr) -> bool {
        self.proxy_ranges.iter().any(|range| range.contains(addr))
    }
}

/// 受信代理网段，形如 `10.0.0.0/8` 或 `2001:db8::/32`；省略前缀长度表示单个地址。
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(try_from = "String")]
pub struct ProxyRange {
    network: IpAddr,
    prefix: u8,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid proxy range `{0}`")]
pub struct InvalidProxyRange(String);

impl ProxyRange {
    pub fn contains(&self, addr: IpAddr) -> bool {
        match (self.network, addr) {
            (IpAddr::V4(network), IpAddr::V4(addr)) => {
                let mask = prefix_mask_u32(self.prefix);
                u32::from(network) & mask == u32::from(addr) & mask
            }
            (IpAddr::V6(network), IpAddr::V6(addr)) => {
                let mask = prefix_mask_u128(self.prefix);
                u128::from(network) & mask == u128::from(addr) & mask
            }
            _ => false,
        }
    }
}

fn prefix_mask_u32(prefix: u8) -> u32 {
    match prefix {
        0 => 0,
        p => u32::MAX << (32 - u32::from(p.min(32))),
    }
}

fn prefix_mask_u128(prefix: u8) -> u128 {
    match prefix {
        0 => 0,
        p => u128::MAX << (128 - u32::from(p.min(128))),
    }
}

impl FromStr for ProxyRange {
    type Err = InvalidProxyRange;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidProxyRange(raw.to_string());
        let (addr, prefix) = match raw.trim().split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (raw.trim(), None),
        };
        let network: IpAddr = addr.parse().map_err(|_| invalid())?;
        let max = if network.is_ipv4() { 32 } else { 128 };
        let prefix = match prefix {
            Some(prefix) => prefix.parse::<u8>().map_err(|_| invalid())?,
            None => max,
        };
        if prefix > max {
            return Err(invalid());
        }
        Ok(Self { network, prefix })
    }
}

impl TryFrom<String> for ProxyRange {
    type Error = InvalidProxyRange;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        raw.parse()
    }
}

impl fmt::Display for ProxyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

/// `Origin` 白名单。
///
/// 原始模式与编译后的 [`GlobSet`] 一起保存，追加模式时整体重建，
/// 因此握手路径上只做一次集合匹配。
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(try_from = "Vec<String>")]
pub struct OriginAllowList {
    patterns: Vec<String>,
    set: GlobSet,
}

impl OriginAllowList {
    pub fn new<I, S>(patterns: I) -> Result<Self, globset::Error>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let patterns: Vec<String> = patterns.into_iter().map(Into::into).collect();
        let set = compile_origins(&patterns)?;
        Ok(Self { patterns, set })
    }

    pub fn push(&mut self, pattern: impl Into<String>) -> Result<(), globset::Error> {
        let mut patterns = self.patterns.clone();
        patterns.push(pattern.into());
        self.set = compile_origins(&patterns)?;
        self.patterns = patterns;
        Ok(())
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn is_match(&self, origin: &str) -> bool {
        self.set.is_match(origin)
    }
}

impl PartialEq for OriginAllowList {
    fn eq(&self, other: &Self) -> bool {
        self.patterns == other.patterns
    }
}

impl Eq for OriginAllowList {}

impl TryFrom<Vec<String>> for OriginAllowList {
    type Error = globset::Error;

    fn try_from(patterns: Vec<String>) -> Result<Self, Self::Error> {
        Self::new(patterns)
    }
}

fn compile_origins(patterns: &[String]) -> Result<GlobSet, globset::Error> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(GlobBuilder::new(pattern).case_insensitive(true).build()?);
    }
    builder.build()
}
