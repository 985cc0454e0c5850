use std::{io, net::SocketAddr, time::Instant};

use bytes::BytesMut;
use tracing::{debug, trace};

use crate::{
    chain::HookChain,
    config::SocketConfig,
    descriptor::Descriptor,
    error::{self, ErrorKind, HOOK_ABORTED, SocketError},
    hook::{DecodeOutcome, EncodeOutcome, Hook, HookContext},
    reactor::{Interest, Reactor, Readiness, Token},
    send_queue::SendQueue,
};

/// 单次 vectored 写最多携带的缓冲个数（Linux `IOV_MAX`）。
pub const MAX_IOV: usize = 1024;

/// 应用侧回调。
///
/// 套接字在 [`StreamSocket::on_event`] 中调用它们；回调内可以直接读取
/// [`StreamSocket::recvq_mut`] 并通过 [`StreamSocket::write_data`] 回写。
pub trait StreamHandler {
    /// 顶层接收缓冲中有新的应用字节。
    fn on_data(&mut self, socket: &mut StreamSocket, reactor: &mut dyn Reactor);

    /// 套接字进入终态；每个套接字至多调用一次，之后套接字会被关闭。
    fn on_error(&mut self, socket: &mut StreamSocket, reactor: &mut dyn Reactor) {
        let _ = (socket, reactor);
    }
}

/// 带缓冲的流式套接字，持有描述符、顶层缓冲与 Hook 链。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 把“部分读写、would-block、满额读取后的快速重读”这些非阻塞细节集中在一处，
///   任意组合的 Hook 链只需关心编解码；
/// - 错误一经设置即为终态，上层以 [`error`](Self::error) 判断存活，不需要了解 Hook 内部。
///
/// ## 契约（What）
/// - [`do_read`](Self::do_read) / [`do_write`](Self::do_write)：驱动读写路径；
/// - [`write_data`](Self::write_data)：应用入队待发字节；
/// - [`close`](Self::close)：幂等；Hook 按头到尾收到一次通知后再释放描述符；
/// - [`close_when_drained`](Self::close_when_drained)：半关闭，待所有队列清空后关闭。
///
/// ## 注意事项（Trade-offs）
/// - 仅在单个事件循环线程上使用，内部不加锁；
/// - 读缓冲按 `read_chunk` 预先清零扩展，换取无 `unsafe` 的实现。
pub struct StreamSocket {
    token: Token,
    fd: Option<Box<dyn Descriptor>>,
    config: SocketConfig,
    recvq: BytesMut,
    sendq: SendQueue,
    chain: HookChain,
    error: Option<SocketError>,
    error_reported: bool,
    closing: bool,
    closed: bool,
    read_blocked: bool,
    remote: Option<SocketAddr>,
    last_activity: Instant,
}

/// 一次原始读取的结果。
enum RawRead {
    Data(usize),
    WouldBlock,
}

impl StreamSocket {
    pub fn new(token: Token, fd: impl Descriptor + 'static, config: SocketConfig) -> Self {
        let remote = fd.peer_addr();
        Self {
            token,
            fd: Some(Box::new(fd)),
            config,
            recvq: BytesMut::new(),
            sendq: SendQueue::new(),
            chain: HookChain::new(),
            error: None,
            error_reported: false,
            closing: false,
            closed: false,
            read_blocked: false,
            remote,
            last_activity: Instant::now(),
        }
    }

    /// 向反应器登记读兴趣。
    pub fn register(&mut self, reactor: &mut dyn Reactor) -> io::Result<()> {
        reactor.register(self.token, Interest::WANT_EDGE_READ | Interest::WANT_NO_WRITE)
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn config(&self) -> &SocketConfig {
        &self.config
    }

    /// 挂载 Hook：无 Hook 时成为链头，否则追加到链尾（靠近线路）。
    pub fn attach_hook(&mut self, hook: impl Hook) {
        self.chain.attach(Box::new(hook));
    }

    pub fn hooks(&self) -> &HookChain {
        &self.chain
    }

    pub fn find_hook<T: Hook>(&self) -> Option<&T> {
        self.chain.find::<T>()
    }

    pub fn find_hook_mut<T: Hook>(&mut self) -> Option<&mut T> {
        self.chain.find_mut::<T>()
    }

    /// 所有 Hook 完成握手/升级且套接字仍然健康。
    pub fn is_established(&self) -> bool {
        self.error.is_none() && !self.closed && self.chain.is_ready()
    }

    pub fn error(&self) -> Option<&SocketError> {
        self.error.as_ref()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// 是否处于“待发送完毕后关闭”的半关闭状态。
    pub fn is_closing(&self) -> bool {
        self.closing
    }

    /// 最近一次原始读取是否返回 would-block。
    pub fn read_blocked(&self) -> bool {
        self.read_blocked
    }

    /// 对外可见的对端地址；受信代理场景下可能被 Hook 替换。
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    pub fn recvq(&self) -> &BytesMut {
        &self.recvq
    }

    pub fn recvq_mut(&mut self) -> &mut BytesMut {
        &mut self.recvq
    }

    /// 取走顶层接收缓冲中的全部字节。
    pub fn take_received(&mut self) -> BytesMut {
        self.recvq.split()
    }

    pub fn sendq(&self) -> &SendQueue {
        &self.sendq
    }

    /// 入队待发送的应用字节并请求一次尝试写。
    ///
    /// 终态或半关闭的套接字静默丢弃新数据。
    pub fn write_data(&mut self, reactor: &mut dyn Reactor, data: impl Into<bytes::Bytes>) {
        if self.error.is_some() || self.closed || self.closing {
            return;
        }
        self.sendq.push_back(data);
        reactor.request(self.token, Interest::ADD_TRIAL_WRITE);
    }

    /// 驱动读路径。
    pub fn do_read(&mut self, reactor: &mut dyn Reactor) -> DecodeOutcome {
        if self.error.is_some() || self.closed {
            return DecodeOutcome::Fatal;
        }
        let Some(fd) = self.fd.as_deref_mut() else {
            return DecodeOutcome::Fatal;
        };

        let dest = match self.chain.wire_recvq() {
            Some(buffer) => buffer,
            None => &mut self.recvq,
        };
        let raw = raw_read(fd, self.token, reactor, self.config.read_chunk, dest);
        let read = match raw {
            Ok(RawRead::Data(read)) => {
                self.read_blocked = false;
                read
            }
            Ok(RawRead::WouldBlock) => {
                self.read_blocked = true;
                return DecodeOutcome::NoProgress;
            }
            Err(err) => {
                self.set_error(err);
                return DecodeOutcome::Fatal;
            }
        };

        if self.chain.is_empty() {
            return if read > 0 {
                DecodeOutcome::Produced
            } else {
                DecodeOutcome::NoProgress
            };
        }

        let mut ctx = HookContext::new(
            self.token,
            reactor,
            &mut self.error,
            &mut self.remote,
            &mut self.last_activity,
        );
        let outcome = self.chain.decode_upward(&mut ctx, &mut self.recvq);
        if outcome == DecodeOutcome::Fatal && self.error.is_none() {
            self.set_error(SocketError::new(
                HOOK_ABORTED,
                ErrorKind::ProtocolViolation,
                "hook aborted the read path",
            ));
        }
        if self.error.is_some() {
            return DecodeOutcome::Fatal;
        }
        outcome
    }

    /// 驱动写路径。
    pub fn do_write(&mut self, reactor: &mut dyn Reactor) {
        if self.error.is_some() || self.closed || self.fd.is_none() {
            return;
        }
        if self.sendq.is_empty() && !self.chain.has_pending_output() {
            if self.closing {
                self.close(reactor);
            }
            return;
        }

        if !self.chain.is_empty() {
            let mut ctx = HookContext::new(
                self.token,
                reactor,
                &mut self.error,
                &mut self.remote,
                &mut self.last_activity,
            );
            let outcome = self.chain.encode_downward(&mut ctx, &mut self.sendq);
            if outcome == EncodeOutcome::Fatal {
                if self.error.is_none() {
                    self.set_error(SocketError::new(
                        HOOK_ABORTED,
                        ErrorKind::ProtocolViolation,
                        "hook aborted the write path",
                    ));
                }
                return;
            }
            if self.error.is_some() {
                return;
            }
        }

        let Some(fd) = self.fd.as_deref_mut() else {
            return;
        };
        let wire = self.chain.wire_sendq(&mut self.sendq);
        if let Err(err) = flush_queue(fd, self.token, reactor, wire, self.config.write_coalesce) {
            self.set_error(err);
            return;
        }

        if self.closing && self.sendq.is_empty() && !self.chain.has_pending_output() {
            self.close(reactor);
        }
    }

    /// 处理一次反应器事件。
    pub fn on_event(
        &mut self,
        reactor: &mut dyn Reactor,
        readiness: Readiness,
        handler: &mut dyn StreamHandler,
    ) {
        if self.closed {
            return;
        }
        match readiness {
            Readiness::Read => {
                self.do_read(reactor);
                if !self.recvq.is_empty() {
                    handler.on_data(self, reactor);
                }
            }
            Readiness::Write => self.do_write(reactor),
            Readiness::Error(err) => self.set_error(error::map_io_error(error::POLL, err)),
        }

        if self.error.is_some() && !self.error_reported {
            self.error_reported = true;
            handler.on_error(self, reactor);
            self.close(reactor);
        }
    }

    /// 待所有队列清空后关闭；若已无待发数据则立即关闭。
    pub fn close_when_drained(&mut self, reactor: &mut dyn Reactor) {
        if self.closed {
            return;
        }
        self.closing = true;
        if self.sendq.is_empty() && !self.chain.has_pending_output() {
            self.close(reactor);
        } else {
            reactor.request(self.token, Interest::ADD_TRIAL_WRITE);
        }
    }

    /// 关闭套接字，幂等。
    ///
    /// 1. 头到尾通知每个 Hook 一次（描述符仍打开，可排队关闭帧等告别消息）；
    /// 2. 尽力刷写一次线路队列，忽略错误；
    /// 3. 注销反应器并释放描述符。
    pub fn close(&mut self, reactor: &mut dyn Reactor) {
        if self.closed {
            return;
        }
        self.closed = true;

        if !self.chain.is_empty() {
            let mut ctx = HookContext::new(
                self.token,
                reactor,
                &mut self.error,
                &mut self.remote,
                &mut self.last_activity,
            );
            self.chain.notify_close(&mut ctx, &mut self.sendq);
        }

        if let Some(mut fd) = self.fd.take() {
            let wire = self.chain.wire_sendq(&mut self.sendq);
            if !wire.is_empty() {
                let slices = wire.io_slices(MAX_IOV);
                let _ = fd.send_vectored(&slices);
            }
            reactor.deregister(self.token);
            if let Err(err) = fd.shutdown() {
                trace!(token = self.token.0, "shutdown failed during close: {err}");
            }
        }
        debug!(token = self.token.0, "socket closed");
    }

    fn set_error(&mut self, err: SocketError) {
        if self.error.is_none() {
            debug!(token = self.token.0, code = err.code(), "socket error: {err}");
            self.error = Some(err);
        }
    }
}

impl Drop for StreamSocket {
    fn drop(&mut self) {
        if let Some(mut fd) = self.fd.take() {
            let _ = fd.shutdown();
        }
    }
}

/// 一次非阻塞接收，直接追加到 `dest`。
fn raw_read(
    fd: &mut dyn Descriptor,
    token: Token,
    reactor: &mut dyn Reactor,
    chunk: usize,
    dest: &mut BytesMut,
) -> error::Result<RawRead> {
    let start = dest.len();
    dest.resize(start + chunk, 0);
    let result = loop {
        match fd.recv(&mut dest[start..]) {
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            other => break other,
        }
    };
    match result {
        Ok(0) => {
            dest.truncate(start);
            Err(error::peer_closed("connection closed by peer"))
        }
        Ok(read) => {
            dest.truncate(start + read);
            let interest = if read == chunk {
                Interest::WANT_FAST_READ | Interest::ADD_TRIAL_READ
            } else {
                Interest::WANT_FAST_READ
            };
            reactor.request(token, interest);
            trace!(token = token.0, bytes = read, "raw read");
            Ok(RawRead::Data(read))
        }
        Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
            dest.truncate(start);
            reactor.request(token, Interest::READ_WILL_BLOCK);
            Ok(RawRead::WouldBlock)
        }
        Err(err) => {
            dest.truncate(start);
            Err(error::map_io_error(error::RECV, err))
        }
    }
}

/// 以 vectored 写刷出 `queue`，直到清空或内核返回 would-block。
fn flush_queue(
    fd: &mut dyn Descriptor,
    token: Token,
    reactor: &mut dyn Reactor,
    queue: &mut SendQueue,
    coalesce: usize,
) -> error::Result<()> {
    while !queue.is_empty() {
        if coalesce > 0 {
            queue.coalesce_front(coalesce);
        }
        let result = {
            let slices = queue.io_slices(MAX_IOV);
            fd.send_vectored(&slices)
        };
        match result {
            Ok(0) => {
                reactor.request(token, Interest::WRITE_WILL_BLOCK | Interest::WANT_SINGLE_WRITE);
                return Ok(());
            }
            Ok(written) => {
                trace!(token = token.0, bytes = written, "writev");
                queue.erase_front(written);
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                reactor.request(token, Interest::WRITE_WILL_BLOCK | Interest::WANT_SINGLE_WRITE);
                return Ok(());
            }
            Err(err) => return Err(error::map_io_error(error::SEND, err)),
        }
    }
    reactor.request(token, Interest::WANT_NO_WRITE);
    Ok(())
}
