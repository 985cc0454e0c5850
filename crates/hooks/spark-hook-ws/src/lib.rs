#![doc = r#"
# spark-hook-ws

## 设计动机（Why）
- **浏览器接入**：让基于 `\r\n` 分行的文本协议经由 RFC 6455 WebSocket 对浏览器客户端开放，
  应用层读写的仍是普通的行；
- **入口策略**：升级阶段集中执行来源白名单、受信代理地址替换与子协议协商。

## 核心契约（What）
- [`WebSocketHook`]：实现 [`spark_sockio::Hook`]，升级完成前 `is_ready` 为假；
- [`WebSocketConfig`]：可从 TOML 载入的策略参数；
- 违规以 WebSocket 关闭码结束连接：未掩码帧与 ping/pong 洪泛为 1008，非最小长度编码、
  分片或超长的控制帧、未知 opcode 为 1002，64 位长度为 1009；
- 升级失败回送 HTTP 400/403/431 响应。

## 实现策略（How）
- [`handshake`] 解析与校验升级请求，`Sec-WebSocket-Accept` 由 `sha1` + `base64` 计算；
- [`frame`] 负责帧头解析与服务端方向的帧编码，帧级状态只存在于接收缓冲中。

## 风险与考量（Trade-offs）
- 只实现服务端角色；出站帧不加掩码；
- 出站按换行拆分成帧，不支持跨行的单条二进制消息。
"#]

mod config;
pub mod frame;
pub mod handshake;
mod hook;

pub use config::{
    FrameMode, InvalidProxyRange, OriginAllowList, ProxyRange, WebSocketConfig, WebSocketConfigError,
};
pub use frame::FrameError;
pub use handshake::UpgradeError;
pub use hook::{WebSocketHook, WsState};
