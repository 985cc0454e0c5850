//! Hook 契约：拦截并变换套接字读写路径的协议层。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 明文行协议、TLS、WebSocket 等协议需要按任意顺序叠加；链式引擎只依赖本模块的
//!   [`Hook`] 接口，新增协议无需改动引擎。
//!
//! ## 契约（What）
//! - [`Hook::decode`]：消费自身接收缓冲 `input`，把应用字节追加到调用方给出的 `output`；
//!   需要回送的协议字节（握手、pong、升级响应）写入 `reply`，即本 Hook 自己的发送队列；
//! - [`Hook::encode`]：消费上层队列 `input`，把编码后的字节推入本 Hook 的 `output` 队列；
//! - [`Hook::is_ready`]：握手/升级完全结束前必须返回 `false`，不得以“尚未出错”代替；
//! - [`Hook::on_close`]：关闭时按头到尾的顺序调用恰好一次，此时描述符仍然打开。
//!
//! ## 注意事项（Trade-offs）
//! - 缓冲区由链上的槽位持有并以参数传入，Hook 自身只保存协议状态；
//!   这样引擎可以用 `split_at_mut` 同时借出相邻两层的缓冲。

use std::{any::Any, net::SocketAddr, time::Instant};

use bytes::BytesMut;
use tracing::warn;

use crate::{
    error::SocketError,
    reactor::{Interest, Reactor, Token},
    send_queue::SendQueue,
};

/// 解码步骤的结果。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecodeOutcome {
    /// 数据不足或仅推进了内部状态，不是错误。
    NoProgress,
    /// 向 `output` 追加了应用字节。
    Produced,
    /// 协议违规或关闭，本轮不再读取；Hook 应已通过 [`HookContext::fail`] 记录原因。
    Fatal,
}

/// 编码步骤的结果。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EncodeOutcome {
    /// 暂时无法接收上层数据（握手未完成、传输拥塞），上层数据原样保留。
    Blocked,
    /// 已推进，下一层以本层队列为输入。
    Progress,
    /// 致命错误，套接字进入终态。
    Fatal,
}

/// Hook 在一次读写步骤中可使用的套接字能力。
///
/// 上下文只借出套接字的局部状态（错误槽、地址、活跃时间）以及反应器，
/// Hook 无法触碰描述符或其它 Hook 的缓冲。
pub struct HookContext<'a> {
    token: Token,
    reactor: &'a mut dyn Reactor,
    error: &'a mut Option<SocketError>,
    remote: &'a mut Option<SocketAddr>,
    last_activity: &'a mut Instant,
    now: Instant,
}

impl<'a> HookContext<'a> {
    pub(crate) fn new(
        token: Token,
        reactor: &'a mut dyn Reactor,
        error: &'a mut Option<SocketError>,
        remote: &'a mut Option<SocketAddr>,
        last_activity: &'a mut Instant,
    ) -> Self {
        Self {
            token,
            reactor,
            error,
            remote,
            last_activity,
            now: Instant::now(),
        }
    }

    pub fn token(&self) -> Token {
        self.token
    }

    /// 向反应器登记下一次需要的就绪通知。
    pub fn request(&mut self, interest: Interest) {
        self.reactor.request(self.token, interest);
    }

    /// 设置终态错误；已有错误时保留第一个。
    pub fn fail(&mut self, error: SocketError) {
        if self.error.is_none() {
            warn!(token = self.token.0, code = error.code(), "socket entered terminal state: {error}");
            *self.error = Some(error);
        }
    }

    pub fn has_failed(&self) -> bool {
        self.error.is_some()
    }

    pub fn error(&self) -> Option<&SocketError> {
        self.error.as_ref()
    }

    /// 当前对外可见的对端地址。
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        *self.remote
    }

    /// 替换对外可见的对端地址（例如受信代理转发的真实客户端地址）。
    pub fn set_remote_addr(&mut self, addr: SocketAddr) {
        *self.remote = Some(addr);
    }

    /// 本次步骤开始的时刻。
    pub fn now(&self) -> Instant {
        self.now
    }

    /// 刷新套接字的活跃时间，供外部空闲计时器使用。
    pub fn touch(&mut self) {
        *self.last_activity = self.now;
    }
}

/// 可叠加的协议层。
pub trait Hook: Any {
    /// 用于日志的短名称。
    fn name(&self) -> &'static str;

    /// 握手/升级是否已完成。
    fn is_ready(&self) -> bool;

    /// 即使所有队列为空，Hook 自身是否仍有字节要写（例如客户端握手的首个消息）。
    fn wants_write(&self) -> bool {
        false
    }

    fn decode(
        &mut self,
        ctx: &mut HookContext<'_>,
        input: &mut BytesMut,
        output: &mut BytesMut,
        reply: &mut SendQueue,
    ) -> DecodeOutcome;

    fn encode(
        &mut self,
        ctx: &mut HookContext<'_>,
        input: &mut SendQueue,
        output: &mut SendQueue,
    ) -> EncodeOutcome;

    /// 关闭通知；接收与 `encode` 相同的队列对，可先封装上层残留数据再追加告别消息。
    fn on_close(&mut self, ctx: &mut HookContext<'_>, input: &mut SendQueue, output: &mut SendQueue);
}

impl dyn Hook {
    pub fn downcast_ref<T: Hook>(&self) -> Option<&T> {
        (self as &dyn Any).downcast_ref::<T>()
    }

    pub fn downcast_mut<T: Hook>(&mut self) -> Option<&mut T> {
        (self as &mut dyn Any).downcast_mut::<T>()
    }
}
