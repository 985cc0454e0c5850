use std::{fmt, sync::Arc};

use arc_swap::ArcSwap;
use rustls::{ClientConfig, ServerConfig};

use crate::{
    config::TlsHookConfig,
    error::TlsHookError,
    hook::{Side, TlsHook},
    registry::{HandshakeObserver, SessionRegistry},
    session::{RustlsSession, TlsSession},
};

/// rustls 配置的热更新容器。
///
/// # 设计动机（Why）
/// - 证书轮换时不应中断既有连接：新会话读取最新快照，旧会话继续持有各自的 `Arc`；
/// - 读路径无锁、写路径常数时间，适合由证书管理线程写入、事件循环线程读取。
///
/// # 契约（What）
/// - [`snapshot`](Self::snapshot)：返回当前配置的共享快照，不随后续替换而失效；
/// - [`replace`](Self::replace)：原子替换并返回旧配置，立即对后续会话可见。
pub struct HotReloadingConfig<C> {
    inner: Arc<ArcSwap<C>>,
}

impl<C> Clone for HotReloadingConfig<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C> HotReloadingConfig<C> {
    pub fn new(initial: Arc<C>) -> Self {
        Self {
            inner: Arc::new(ArcSwap::new(initial)),
        }
    }

    #[inline]
    pub fn from_config(initial: C) -> Self {
        Self::new(Arc::new(initial))
    }

    #[inline]
    pub fn snapshot(&self) -> Arc<C> {
        self.inner.load_full()
    }

    #[inline]
    pub fn replace(&self, next: Arc<C>) -> Arc<C> {
        self.inner.swap(next)
    }
}

impl<C> fmt::Debug for HotReloadingConfig<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HotReloadingConfig").finish_non_exhaustive()
    }
}

/// TLS Hook 的管理层：持有 rustls 配置、Hook 策略与会话登记表，负责为每个连接创建 Hook。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 会话登记表归属于管理层而非 Hook：加密会话的握手回调经由会话标识查表，
///   不需要回指 Hook；
/// - 每个事件循环持有一个档案；rustls 配置容器可在多个档案之间克隆共享。
///
/// ## 契约（What）
/// - [`server_hook`](Self::server_hook) / [`client_hook`](Self::client_hook)：以当前配置快照创建 Hook；
/// - [`hook_with_session`](Self::hook_with_session)：注入自定义会话（测试或替代实现）。
pub struct TlsProfile {
    server: Option<HotReloadingConfig<ServerConfig>>,
    client: Option<HotReloadingConfig<ClientConfig>>,
    config: TlsHookConfig,
    registry: SessionRegistry,
}

impl TlsProfile {
    pub fn new(config: TlsHookConfig) -> Self {
        Self {
            server: None,
            client: None,
            config,
            registry: SessionRegistry::new(),
        }
    }

    pub fn with_server_config(mut self, server: HotReloadingConfig<ServerConfig>) -> Self {
        self.server = Some(server);
        self
    }

    pub fn with_client_config(mut self, client: HotReloadingConfig<ClientConfig>) -> Self {
        self.client = Some(client);
        self
    }

    pub fn hook_config(&self) -> &TlsHookConfig {
        &self.config
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn server_config(&self) -> Option<&HotReloadingConfig<ServerConfig>> {
        self.server.as_ref()
    }

    pub fn client_config(&self) -> Option<&HotReloadingConfig<ClientConfig>> {
        self.client.as_ref()
    }

    /// 为入站连接创建服务端 Hook。
    pub fn server_hook(&self) -> Result<TlsHook, TlsHookError> {
        let server = self.server.as_ref().ok_or(TlsHookError::MissingConfig("server"))?;
        let snapshot = server.snapshot();
        self.try_hook_with_session(Side::Server, |observer| {
            let session: Box<dyn TlsSession> = Box::new(RustlsSession::server(snapshot, observer)?);
            Ok(session)
        })
    }

    /// 为出站连接创建客户端 Hook，`server_name` 用于 SNI 与证书校验。
    pub fn client_hook(&self, server_name: &str) -> Result<TlsHook, TlsHookError> {
        let client = self.client.as_ref().ok_or(TlsHookError::MissingConfig("client"))?;
        let snapshot = client.snapshot();
        self.try_hook_with_session(Side::Client, |observer| {
            let session: Box<dyn TlsSession> =
                Box::new(RustlsSession::client(snapshot, server_name, observer)?);
            Ok(session)
        })
    }

    /// 以调用方提供的会话创建 Hook；会话应通过传入的观察者报告握手开始。
    pub fn hook_with_session(
        &self,
        side: Side,
        make: impl FnOnce(HandshakeObserver) -> Box<dyn TlsSession>,
    ) -> TlsHook {
        let id = self.registry.register(self.config.allow_renegotiation);
        let session = make(self.registry.observer(id));
        TlsHook::new(id, side, self.registry.clone(), session, self.config.clone())
    }

    fn try_hook_with_session(
        &self,
        side: Side,
        make: impl FnOnce(HandshakeObserver) -> Result<Box<dyn TlsSession>, TlsHookError>,
    ) -> Result<TlsHook, TlsHookError> {
        let id = self.registry.register(self.config.allow_renegotiation);
        match make(self.registry.observer(id)) {
            Ok(session) => Ok(TlsHook::new(
                id,
                side,
                self.registry.clone(),
                session,
                self.config.clone(),
            )),
            Err(err) => {
                self.registry.remove(id);
                Err(err)
            }
        }
    }
}

impl fmt::Debug for TlsProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsProfile")
            .field("config", &self.config)
            .field("sessions", &self.registry.len())
            .finish_non_exhaustive()
    }
}
