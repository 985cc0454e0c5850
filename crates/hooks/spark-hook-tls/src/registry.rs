//! 会话登记表：以稳定的会话标识查找 TLS 会话状态。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 加密会话在握手开始时需要通知所属 Hook；若把 Hook 指针塞进会话，
//!   会话与 Hook 的生命周期便互相牵制。改为由管理层（[`TlsProfile`](crate::TlsProfile)）
//!   持有登记表，会话只持有 [`HandshakeObserver`]（会话标识 + 登记表句柄）。
//!
//! ## 逻辑（How）
//! - 状态机的权威状态保存在登记表条目中，Hook 每一步先查表再动作；
//! - 观察者在 `Open` 状态下收到新的握手开始：允许重协商则回到 `Handshaking`，
//!   否则强制回到 `None` 并打上“已拒绝”标记，由 Hook 在下一步丢弃会话并失败。
//!
//! ## 契约（What）
//! - 登记表只在事件循环线程上使用，内部为 `Rc<RefCell<_>>`；
//! - 查找不到的会话（Hook 已释放）对观察者而言是空操作。

use std::{cell::RefCell, collections::HashMap, fmt, rc::Rc};

use tracing::{debug, warn};

/// 会话的稳定标识，在同一登记表内唯一。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tls#{}", self.0)
    }
}

/// TLS Hook 的状态。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TlsState {
    /// 尚未开始握手，或握手失败、重协商被拒绝后的终点。
    None,
    Handshaking,
    Open,
}

/// 观察者对一次握手开始的处理结果。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakeEvent {
    /// 首次握手。
    Started,
    /// 已允许的重协商。
    Renegotiating,
    /// 未允许的重协商，会话已被标记为关闭。
    Rejected,
    /// 会话已不在登记表中。
    Unknown,
}

#[derive(Debug)]
struct SessionEntry {
    state: TlsState,
    allow_renegotiation: bool,
    renegotiation_rejected: bool,
    handshakes: u32,
}

#[derive(Debug, Default)]
struct RegistryInner {
    next_id: u64,
    sessions: HashMap<SessionId, SessionEntry>,
}

/// 会话登记表句柄，克隆后共享同一张表。
#[derive(Clone, Debug, Default)]
pub struct SessionRegistry {
    inner: Rc<RefCell<RegistryInner>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记新会话，初始状态为 [`TlsState::None`]。
    pub fn register(&self, allow_renegotiation: bool) -> SessionId {
        let mut inner = self.inner.borrow_mut();
        inner.next_id += 1;
        let id = SessionId(inner.next_id);
        inner.sessions.insert(
            id,
            SessionEntry {
                state: TlsState::None,
                allow_renegotiation,
                renegotiation_rejected: false,
                handshakes: 0,
            },
        );
        id
    }

    pub fn observer(&self, id: SessionId) -> HandshakeObserver {
        HandshakeObserver {
            id,
            registry: self.clone(),
        }
    }

    pub fn state(&self, id: SessionId) -> Option<TlsState> {
        self.inner.borrow().sessions.get(&id).map(|entry| entry.state)
    }

    pub(crate) fn set_state(&self, id: SessionId, state: TlsState) {
        if let Some(entry) = self.inner.borrow_mut().sessions.get_mut(&id) {
            entry.state = state;
        }
    }

    /// 会话是否因未允许的重协商而被强制关闭。
    pub fn renegotiation_rejected(&self, id: SessionId) -> bool {
        self.inner
            .borrow()
            .sessions
            .get(&id)
            .is_some_and(|entry| entry.renegotiation_rejected)
    }

    /// 会话至今开始过的握手次数。
    pub fn handshakes(&self, id: SessionId) -> u32 {
        self.inner
            .borrow()
            .sessions
            .get(&id)
            .map_or(0, |entry| entry.handshakes)
    }

    pub fn remove(&self, id: SessionId) {
        self.inner.borrow_mut().sessions.remove(&id);
    }

    pub fn len(&self) -> usize {
        self.inner.borrow().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.borrow().sessions.is_empty()
    }

    fn handshake_started(&self, id: SessionId) -> HandshakeEvent {
        let mut inner = self.inner.borrow_mut();
        let Some(entry) = inner.sessions.get_mut(&id) else {
            return HandshakeEvent::Unknown;
        };
        entry.handshakes += 1;
        match entry.state {
            TlsState::Open if entry.allow_renegotiation => {
                debug!(session = %id, "renegotiation accepted");
                entry.state = TlsState::Handshaking;
                HandshakeEvent::Renegotiating
            }
            TlsState::Open => {
                warn!(session = %id, "peer-initiated renegotiation rejected");
                entry.state = TlsState::None;
                entry.renegotiation_rejected = true;
                HandshakeEvent::Rejected
            }
            TlsState::None | TlsState::Handshaking => {
                entry.state = TlsState::Handshaking;
                HandshakeEvent::Started
            }
        }
    }
}

/// 交给加密会话的回调句柄：握手开始时经由会话标识查表，而不是回指 Hook。
#[derive(Clone, Debug)]
pub struct HandshakeObserver {
    id: SessionId,
    registry: SessionRegistry,
}

impl HandshakeObserver {
    pub fn session_id(&self) -> SessionId {
        self.id
    }

    /// 会话报告一次握手开始。
    pub fn handshake_started(&self) -> HandshakeEvent {
        self.registry.handshake_started(self.id)
    }
}
