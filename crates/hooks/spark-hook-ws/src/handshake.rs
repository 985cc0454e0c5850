//! HTTP/1.1 升级握手（RFC 6455 §4.2）。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 升级请求是浏览器与服务端之间唯一的明文 HTTP 交互；在这里完成请求校验、来源放行、
//!   代理地址替换与子协议协商，失败时给出带状态码的 HTTP 响应，而不是直接断开。
//!
//! ## 逻辑（How）
//! 1. [`UpgradeRequest::parse`] 解析请求行与头部（头名不区分大小写）；
//! 2. [`UpgradeRequest::validate`] 检查 `GET`、`Upgrade`、`Connection`、版本 13 与 16 字节的 base64 密钥；
//! 3. [`check_origin`] → 代理替换（由 Hook 完成，需要套接字地址）→ [`negotiate`]；
//! 4. [`compute_accept_key`] 计算 `Sec-WebSocket-Accept`，[`switching_protocols`] 生成 101 响应。
//!
//! ## 契约（What）
//! - 所有失败都落在 [`UpgradeError`]，其 `status` 决定 HTTP 响应码（400/403/431）。

use base64::Engine;
use sha1::{Digest, Sha1};
use spark_sockio::{ErrorKind, SocketError};
use thiserror::Error;

use crate::config::{FrameMode, WebSocketConfig};

/// RFC 6455 用于计算 `Sec-WebSocket-Accept` 的固定 GUID。
const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

pub const UPGRADE_REJECTED_CODE: &str = "spark.hook.ws.upgrade_rejected";
pub const ORIGIN_REJECTED_CODE: &str = "spark.hook.ws.origin_rejected";

/// 升级失败的原因。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum UpgradeError {
    #[error("malformed upgrade request: {0}")]
    Malformed(&'static str),
    #[error("missing or invalid `{0}` header")]
    MissingHeader(&'static str),
    #[error("unsupported websocket version `{0}`")]
    UnsupportedVersion(String),
    #[error("Sec-WebSocket-Key must be 16 base64-encoded bytes")]
    InvalidKey,
    #[error("origin `{0}` is not allowed")]
    OriginNotAllowed(String),
    #[error("connections without an Origin header are not allowed")]
    MissingOrigin,
    #[error("trusted proxy sent no usable `{0}` header")]
    ProxyHeader(String),
    #[error("no supported subprotocol was offered")]
    NoSubprotocol,
    #[error("upgrade request exceeds {0} bytes")]
    RequestTooLarge(usize),
}

impl UpgradeError {
    /// 对应的 HTTP 状态码。
    pub fn status(&self) -> u16 {
        match self {
            UpgradeError::OriginNotAllowed(_) | UpgradeError::MissingOrigin => 403,
            UpgradeError::RequestTooLarge(_) => 431,
            _ => 400,
        }
    }

    fn reason(&self) -> &'static str {
        match self.status() {
            403 => "Forbidden",
            431 => "Request Header Fields Too Large",
            _ => "Bad Request",
        }
    }

    /// 被拒绝时回送给客户端的 HTTP 响应。
    pub fn response(&self) -> String {
        let body = self.to_string();
        format!(
            "HTTP/1.1 {} {}\r\nConnection: close\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\r\n{}",
            self.status(),
            self.reason(),
            body.len(),
            body
        )
    }

    pub fn into_socket_error(self) -> SocketError {
        let (code, kind) = match self {
            UpgradeError::OriginNotAllowed(_) | UpgradeError::MissingOrigin => {
                (ORIGIN_REJECTED_CODE, ErrorKind::Security)
            }
            _ => (UPGRADE_REJECTED_CODE, ErrorKind::ProtocolViolation),
        };
        SocketError::new(code, kind, self.to_string()).with_cause(self)
    }
}

/// 查找头块结尾（`\r\n\r\n` 之后的位置）。
pub fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|window| window == b"\r\n\r\n")
        .map(|index| index + 4)
}

/// 已解析的升级请求。
#[derive(Debug, Clone)]
pub struct UpgradeRequest {
    pub method: String,
    pub path: String,
    pub version: String,
    headers: Vec<(String, String)>,
}

impl UpgradeRequest {
    pub fn parse(block: &[u8]) -> Result<Self, UpgradeError> {
        let text = std::str::from_utf8(block)
            .map_err(|_| UpgradeError::Malformed("request is not valid UTF-8"))?;
        let mut lines = text.split("\r\n");
        let request_line = lines
            .next()
            .ok_or(UpgradeError::Malformed("empty request"))?;
        let mut parts = request_line.split_ascii_whitespace();
        let (Some(method), Some(path), Some(version), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(UpgradeError::Malformed("bad request line"));
        };

        let mut headers = Vec::new();
        for line in lines.take_while(|line| !line.is_empty()) {
            let (name, value) = line
                .split_once(':')
                .ok_or(UpgradeError::Malformed("header line without a colon"))?;
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }

        Ok(Self {
            method: method.to_string(),
            path: path.to_string(),
            version: version.to_string(),
            headers,
        })
    }

    /// 头部值（名称不区分大小写，取第一次出现）。
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// 校验 RFC 6455 必需字段，返回客户端密钥。
    pub fn validate(&self) -> Result<&str, UpgradeError> {
        if self.method != "GET" {
            return Err(UpgradeError::Malformed("request method must be GET"));
        }
        if self.version != "HTTP/1.1" {
            return Err(UpgradeError::Malformed("request must use HTTP/1.1"));
        }
        if !self.header_has_token("Upgrade", "websocket") {
            return Err(UpgradeError::MissingHeader("Upgrade"));
        }
        if !self.header_has_token("Connection", "upgrade") {
            return Err(UpgradeError::MissingHeader("Connection"));
        }
        match self.header("Sec-WebSocket-Version") {
            Some("13") => {}
            Some(other) => return Err(UpgradeError::UnsupportedVersion(other.to_string())),
            None => return Err(UpgradeError::MissingHeader("Sec-WebSocket-Version")),
        }
        let key = self
            .header("Sec-WebSocket-Key")
            .ok_or(UpgradeError::MissingHeader("Sec-WebSocket-Key"))?;
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(key)
            .map_err(|_| UpgradeError::InvalidKey)?;
        if decoded.len() != 16 {
            return Err(UpgradeError::InvalidKey);
        }
        Ok(key)
    }

    fn header_has_token(&self, name: &str, token: &str) -> bool {
        self.header(name).is_some_and(|value| {
            value
                .split(',')
                .any(|item| item.trim().eq_ignore_ascii_case(token))
        })
    }
}

/// 来源放行：有 `Origin` 时必须命中白名单，没有时取决于 `allow_missing_origin`。
pub fn check_origin(config: &WebSocketConfig, origin: Option<&str>) -> Result<(), UpgradeError> {
    match origin {
        Some(origin) if config.origin_allowed(origin) => Ok(()),
        Some(origin) => Err(UpgradeError::OriginNotAllowed(origin.to_string())),
        None if config.allow_missing_origin => Ok(()),
        None => Err(UpgradeError::MissingOrigin),
    }
}

/// 协商结果。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Negotiated {
    pub mode: FrameMode,
    /// 需要在 101 响应中回显的子协议；使用默认模式时为空。
    pub protocol: Option<String>,
}

/// 选择客户端列表中第一个已知的子协议，否则回落到默认模式。
pub fn negotiate(config: &WebSocketConfig, offered: Option<&str>) -> Result<Negotiated, UpgradeError> {
    let chosen = offered.into_iter().flat_map(|list| list.split(',')).find_map(|token| {
        let token = token.trim();
        config
            .subprotocols
            .get(token)
            .map(|mode| (token.to_string(), *mode))
    });
    match (chosen, config.default_mode) {
        (Some((protocol, mode)), _) => Ok(Negotiated {
            mode,
            protocol: Some(protocol),
        }),
        (None, Some(mode)) => Ok(Negotiated {
            mode,
            protocol: None,
        }),
        (None, None) => Err(UpgradeError::NoSubprotocol),
    }
}

/// `base64(SHA-1(key + GUID))`。
pub fn compute_accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

/// 成功升级的 101 响应。
pub fn switching_protocols(accept: &str, protocol: Option<&str>) -> String {
    let mut response = format!(
        "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: {accept}\r\n"
    );
    if let Some(protocol) = protocol {
        response.push_str("Sec-WebSocket-Protocol: ");
        response.push_str(protocol);
        response.push_str("\r\n");
    }
    response.push_str("\r\n");
    response
}
