//! 测试桩：内存描述符与记录型反应器，供集成测试与嵌入方复用。
//!
//! # 设计背景（Why）
//! - 流水线对内核只有“非阻塞读 / vectored 写 / 关闭”三个需求，用内存实现即可精确构造
//!   部分写、would-block、逐字节到达等在真实网络上难以稳定复现的场景；
//! - Hook crate 的测试需要同一套桩对象，统一出口避免各处重复定义。
//!
//! # 使用方式（How）
//! - [`MemoryDescriptor::pair`] 返回描述符与控制句柄 [`MemoryPeer`]，两者共享 `Rc<RefCell<_>>` 状态；
//!   描述符交给 [`StreamSocket`](crate::StreamSocket)，测试通过句柄注入入站字节、取走出站字节；
//! - [`RecordingReactor`] 记录每一次兴趣登记，测试据此断言读写请求的精确组合。
//!
//! # 风险与权衡（Trade-offs）
//! - 基于 `Rc`，仅能在单线程中使用，这与流水线自身的线程模型一致。

use std::{
    cell::RefCell,
    collections::VecDeque,
    io::{self, IoSlice},
    net::SocketAddr,
    rc::Rc,
};

use crate::{
    descriptor::Descriptor,
    reactor::{Interest, Reactor, Token},
};

#[derive(Debug, Default)]
struct MemoryState {
    inbound: VecDeque<u8>,
    inbound_closed: bool,
    outbound: Vec<u8>,
    write_budget: Option<usize>,
    read_limit: Option<usize>,
    next_recv_error: Option<io::ErrorKind>,
    next_send_error: Option<io::ErrorKind>,
    shutdowns: usize,
    recv_calls: usize,
    send_calls: usize,
}

/// 内存中的非阻塞描述符。
#[derive(Debug)]
pub struct MemoryDescriptor {
    state: Rc<RefCell<MemoryState>>,
    peer_addr: Option<SocketAddr>,
}

/// [`MemoryDescriptor`] 的控制句柄，扮演“线路另一端”。
#[derive(Clone, Debug)]
pub struct MemoryPeer {
    state: Rc<RefCell<MemoryState>>,
}

impl MemoryDescriptor {
    pub fn pair() -> (MemoryDescriptor, MemoryPeer) {
        let state = Rc::new(RefCell::new(MemoryState::default()));
        (
            MemoryDescriptor {
                state: Rc::clone(&state),
                peer_addr: None,
            },
            MemoryPeer { state },
        )
    }

    /// 设置 [`Descriptor::peer_addr`] 返回的对端地址。
    pub fn with_peer_addr(mut self, addr: SocketAddr) -> Self {
        self.peer_addr = Some(addr);
        self
    }
}

impl Descriptor for MemoryDescriptor {
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state.borrow_mut();
        state.recv_calls += 1;
        if let Some(kind) = state.next_recv_error.take() {
            return Err(io::Error::new(kind, "injected recv failure"));
        }
        if state.inbound.is_empty() {
            return if state.inbound_closed {
                Ok(0)
            } else {
                Err(io::ErrorKind::WouldBlock.into())
            };
        }
        let limit = state.read_limit.unwrap_or(usize::MAX);
        let count = buf.len().min(limit).min(state.inbound.len());
        for (slot, byte) in buf.iter_mut().zip(state.inbound.drain(..count)) {
            *slot = byte;
        }
        Ok(count)
    }

    fn send_vectored(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        let mut state = self.state.borrow_mut();
        state.send_calls += 1;
        if let Some(kind) = state.next_send_error.take() {
            return Err(io::Error::new(kind, "injected send failure"));
        }
        let mut budget = state.write_budget.unwrap_or(usize::MAX);
        if budget == 0 {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let mut written = 0;
        for buf in bufs {
            let take = buf.len().min(budget);
            state.outbound.extend_from_slice(&buf[..take]);
            written += take;
            budget -= take;
            if budget == 0 {
                break;
            }
        }
        if let Some(remaining) = state.write_budget.as_mut() {
            *remaining -= written;
        }
        Ok(written)
    }

    fn shutdown(&mut self) -> io::Result<()> {
        self.state.borrow_mut().shutdowns += 1;
        Ok(())
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }
}

impl MemoryPeer {
    /// 注入入站字节。
    pub fn feed(&self, data: &[u8]) {
        self.state.borrow_mut().inbound.extend(data.iter().copied());
    }

    /// 入站方向有序关闭：缓冲读尽后 `recv` 返回 `Ok(0)`。
    pub fn close_input(&self) {
        self.state.borrow_mut().inbound_closed = true;
    }

    /// 取走描述符至今写出的全部字节。
    pub fn take_output(&self) -> Vec<u8> {
        std::mem::take(&mut self.state.borrow_mut().outbound)
    }

    /// 限制后续可写出的总字节数，`None` 表示不限；额度耗尽后写返回 would-block。
    pub fn set_write_budget(&self, budget: Option<usize>) {
        self.state.borrow_mut().write_budget = budget;
    }

    /// 限制单次 `recv` 返回的字节数。
    pub fn set_read_limit(&self, limit: Option<usize>) {
        self.state.borrow_mut().read_limit = limit;
    }

    pub fn fail_next_recv(&self, kind: io::ErrorKind) {
        self.state.borrow_mut().next_recv_error = Some(kind);
    }

    pub fn fail_next_send(&self, kind: io::ErrorKind) {
        self.state.borrow_mut().next_send_error = Some(kind);
    }

    pub fn pending_input(&self) -> usize {
        self.state.borrow().inbound.len()
    }

    pub fn shutdown_count(&self) -> usize {
        self.state.borrow().shutdowns
    }

    pub fn recv_calls(&self) -> usize {
        self.state.borrow().recv_calls
    }

    pub fn send_calls(&self) -> usize {
        self.state.borrow().send_calls
    }
}

/// 记录所有登记动作的反应器。
#[derive(Debug, Default)]
pub struct RecordingReactor {
    registered: Vec<(Token, Interest)>,
    requests: Vec<(Token, Interest)>,
    deregistered: Vec<Token>,
}

impl RecordingReactor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn registered(&self) -> &[(Token, Interest)] {
        &self.registered
    }

    pub fn requests(&self) -> &[(Token, Interest)] {
        &self.requests
    }

    pub fn last_request(&self) -> Option<Interest> {
        self.requests.last().map(|(_, interest)| *interest)
    }

    /// 是否有任意一次请求包含 `interest` 的全部位。
    pub fn saw(&self, interest: Interest) -> bool {
        self.requests.iter().any(|(_, seen)| seen.contains(interest))
    }

    pub fn deregistered(&self) -> &[Token] {
        &self.deregistered
    }

    pub fn clear(&mut self) {
        self.requests.clear();
    }
}

impl Reactor for RecordingReactor {
    fn register(&mut self, token: Token, interest: Interest) -> io::Result<()> {
        self.registered.push((token, interest));
        Ok(())
    }

    fn request(&mut self, token: Token, interest: Interest) {
        self.requests.push((token, interest));
    }

    fn deregister(&mut self, token: Token) {
        self.deregistered.push(token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_budget_produces_partial_writes_then_would_block() {
        let (mut fd, peer) = MemoryDescriptor::pair();
        peer.set_write_budget(Some(3));
        let written = fd
            .send_vectored(&[IoSlice::new(b"ab"), IoSlice::new(b"cd")])
            .expect("partial write");
        assert_eq!(written, 3);
        assert_eq!(peer.take_output(), b"abc");
        let err = fd.send_vectored(&[IoSlice::new(b"d")]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn empty_input_blocks_until_closed() {
        let (mut fd, peer) = MemoryDescriptor::pair();
        let mut buf = [0u8; 4];
        assert_eq!(
            fd.recv(&mut buf).unwrap_err().kind(),
            io::ErrorKind::WouldBlock
        );
        peer.feed(b"xy");
        peer.close_input();
        assert_eq!(fd.recv(&mut buf).expect("data"), 2);
        assert_eq!(fd.recv(&mut buf).expect("eof"), 0);
    }
}
