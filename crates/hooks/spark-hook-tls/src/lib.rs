#![doc = r#"
# spark-hook-tls

## 设计动机（Why）
- **安全入口**：在 `spark-sockio` 的非阻塞流水线上终结 TLS，对上层 Hook 与应用呈现明文字节流；
- **状态可审计**：握手状态机 `None → Handshaking → Open` 与对端证书摘要（DN、指纹、信任与有效期标记）
  对外可见，供访问控制与审计日志使用；
- **热更新**：依托 `ArcSwap` 在不中断现有连接的情况下替换证书或密码套件配置。

## 核心契约（What）
- [`TlsProfile`]：管理层，持有 rustls 配置、Hook 策略与 [`SessionRegistry`]，为每个连接创建 [`TlsHook`]；
- [`TlsHook`]：实现 [`spark_sockio::Hook`]，握手完成前 `is_ready` 为假；
- [`TlsSession`]：加密会话抽象，默认实现 [`RustlsSession`]；
- 错误分类遵循 `Security`（证书/握手违规、被拒绝的重协商）、`ProtocolViolation`（畸形记录）、
  `PeerClosed`（`close_notify`）与 `Local`。

## 实现策略（How）
- 记录层加解密完全交给 `rustls`；本 crate 只负责状态迁移、就绪请求与证书摘要；
- 握手回调经由 [`HandshakeObserver`] 按会话标识查表，而非在会话中保存指向 Hook 的指针；
- 证书摘要使用 `x509-parser` 解析，指纹使用 `sha2`/`sha1` 计算。

## 风险与考量（Trade-offs）
- rustls 本身不会发起重协商；重协商拒绝路径通过自定义 [`TlsSession`] 覆盖；
- 登记表基于 `Rc`，档案只能在创建它的事件循环线程上使用。
"#]

mod cert;
mod config;
pub mod error;
mod hook;
mod profile;
mod registry;
mod session;

pub use cert::{CertificateSummary, PeerTrust};
pub use config::{DEFAULT_WIRE_HIGH_WATER, MAX_RECORD_PLAINTEXT, TlsConfigError, TlsHookConfig};
pub use error::TlsHookError;
pub use hook::{Side, TlsHook};
pub use profile::{HotReloadingConfig, TlsProfile};
pub use registry::{HandshakeEvent, HandshakeObserver, SessionId, SessionRegistry, TlsState};
pub use session::{RustlsSession, TlsSession};
