//! `StreamSocket` 读写路径与 Hook 链的集成测试。
//!
//! 测试以内存描述符驱动，覆盖：原始读取的兴趣登记、逐字节到达与整块到达的解码等价性、
//! 部分写与 would-block、背压、关闭幂等与关闭通知顺序。

use std::{cell::RefCell, io, rc::Rc};

use bytes::{Buf, BufMut, BytesMut};
use spark_sockio::{
    DecodeOutcome, EncodeOutcome, ErrorKind, Hook, HookContext, Interest, Readiness, SendQueue,
    SocketConfig, SocketError, StreamHandler, StreamSocket, Token,
    test_stubs::{MemoryDescriptor, MemoryPeer, RecordingReactor},
};

/// 以 2 字节大端长度前缀封装每个发送元素。
struct LengthPrefixHook;

impl Hook for LengthPrefixHook {
    fn name(&self) -> &'static str {
        "length-prefix"
    }

    fn is_ready(&self) -> bool {
        true
    }

    fn decode(
        &mut self,
        _ctx: &mut HookContext<'_>,
        input: &mut BytesMut,
        output: &mut BytesMut,
        _reply: &mut SendQueue,
    ) -> DecodeOutcome {
        let mut produced = false;
        while input.len() >= 2 {
            let len = u16::from_be_bytes([input[0], input[1]]) as usize;
            if input.len() < 2 + len {
                break;
            }
            input.advance(2);
            output.extend_from_slice(&input.split_to(len));
            produced = true;
        }
        if produced {
            DecodeOutcome::Produced
        } else {
            DecodeOutcome::NoProgress
        }
    }

    fn encode(
        &mut self,
        _ctx: &mut HookContext<'_>,
        input: &mut SendQueue,
        output: &mut SendQueue,
    ) -> EncodeOutcome {
        while let Some(element) = input.pop_front() {
            for chunk in element.chunks(u16::MAX as usize) {
                let mut framed = BytesMut::with_capacity(2 + chunk.len());
                framed.put_u16(chunk.len() as u16);
                framed.extend_from_slice(chunk);
                output.push_back(framed.freeze());
            }
        }
        EncodeOutcome::Progress
    }

    fn on_close(&mut self, _ctx: &mut HookContext<'_>, _input: &mut SendQueue, _output: &mut SendQueue) {}
}

/// 按字节异或固定密钥，输入输出长度一致。
struct XorHook(u8);

impl Hook for XorHook {
    fn name(&self) -> &'static str {
        "xor"
    }

    fn is_ready(&self) -> bool {
        true
    }

    fn decode(
        &mut self,
        _ctx: &mut HookContext<'_>,
        input: &mut BytesMut,
        output: &mut BytesMut,
        _reply: &mut SendQueue,
    ) -> DecodeOutcome {
        if input.is_empty() {
            return DecodeOutcome::NoProgress;
        }
        output.extend(input.split().iter().map(|byte| byte ^ self.0));
        DecodeOutcome::Produced
    }

    fn encode(
        &mut self,
        _ctx: &mut HookContext<'_>,
        input: &mut SendQueue,
        output: &mut SendQueue,
    ) -> EncodeOutcome {
        while let Some(element) = input.pop_front() {
            let masked: Vec<u8> = element.iter().map(|byte| byte ^ self.0).collect();
            output.push_back(masked);
        }
        EncodeOutcome::Progress
    }

    fn on_close(&mut self, _ctx: &mut HookContext<'_>, _input: &mut SendQueue, _output: &mut SendQueue) {}
}

/// 打开前拒收上层数据的闸门，模拟尚未完成握手的协议层。
#[derive(Default)]
struct GateHook {
    open: bool,
}

impl Hook for GateHook {
    fn name(&self) -> &'static str {
        "gate"
    }

    fn is_ready(&self) -> bool {
        self.open
    }

    fn decode(
        &mut self,
        _ctx: &mut HookContext<'_>,
        input: &mut BytesMut,
        output: &mut BytesMut,
        _reply: &mut SendQueue,
    ) -> DecodeOutcome {
        if !self.open || input.is_empty() {
            return DecodeOutcome::NoProgress;
        }
        output.extend_from_slice(&input.split());
        DecodeOutcome::Produced
    }

    fn encode(
        &mut self,
        _ctx: &mut HookContext<'_>,
        input: &mut SendQueue,
        output: &mut SendQueue,
    ) -> EncodeOutcome {
        if !self.open {
            return EncodeOutcome::Blocked;
        }
        output.append(input);
        EncodeOutcome::Progress
    }

    fn on_close(&mut self, _ctx: &mut HookContext<'_>, _input: &mut SendQueue, _output: &mut SendQueue) {}
}

/// 记录关闭通知的 Hook，并在关闭时写出告别字节。
struct CloseProbe {
    label: &'static str,
    log: Rc<RefCell<Vec<&'static str>>>,
}

impl Hook for CloseProbe {
    fn name(&self) -> &'static str {
        self.label
    }

    fn is_ready(&self) -> bool {
        true
    }

    fn decode(
        &mut self,
        _ctx: &mut HookContext<'_>,
        input: &mut BytesMut,
        output: &mut BytesMut,
        _reply: &mut SendQueue,
    ) -> DecodeOutcome {
        if input.is_empty() {
            return DecodeOutcome::NoProgress;
        }
        output.extend_from_slice(&input.split());
        DecodeOutcome::Produced
    }

    fn encode(
        &mut self,
        _ctx: &mut HookContext<'_>,
        input: &mut SendQueue,
        output: &mut SendQueue,
    ) -> EncodeOutcome {
        output.append(input);
        EncodeOutcome::Progress
    }

    fn on_close(&mut self, _ctx: &mut HookContext<'_>, input: &mut SendQueue, output: &mut SendQueue) {
        self.log.borrow_mut().push(self.label);
        output.append(input);
        output.push_back(self.label.as_bytes().to_vec());
    }
}

/// 收到 `!` 即判定协议违规。
struct TripwireHook;

impl Hook for TripwireHook {
    fn name(&self) -> &'static str {
        "tripwire"
    }

    fn is_ready(&self) -> bool {
        true
    }

    fn decode(
        &mut self,
        ctx: &mut HookContext<'_>,
        input: &mut BytesMut,
        output: &mut BytesMut,
        _reply: &mut SendQueue,
    ) -> DecodeOutcome {
        if input.contains(&b'!') {
            ctx.fail(SocketError::protocol("spark.test.tripwire", 1002, "tripwire hit"));
            return DecodeOutcome::Fatal;
        }
        if input.is_empty() {
            return DecodeOutcome::NoProgress;
        }
        output.extend_from_slice(&input.split());
        DecodeOutcome::Produced
    }

    fn encode(
        &mut self,
        _ctx: &mut HookContext<'_>,
        input: &mut SendQueue,
        output: &mut SendQueue,
    ) -> EncodeOutcome {
        output.append(input);
        EncodeOutcome::Progress
    }

    fn on_close(&mut self, _ctx: &mut HookContext<'_>, _input: &mut SendQueue, _output: &mut SendQueue) {}
}

#[derive(Default)]
struct Collector {
    data: Vec<u8>,
    errors: Vec<ErrorKind>,
}

impl StreamHandler for Collector {
    fn on_data(&mut self, socket: &mut StreamSocket, _reactor: &mut dyn spark_sockio::Reactor) {
        self.data.extend_from_slice(&socket.take_received());
    }

    fn on_error(&mut self, socket: &mut StreamSocket, _reactor: &mut dyn spark_sockio::Reactor) {
        if let Some(err) = socket.error() {
            self.errors.push(err.kind());
        }
    }
}

fn socket_with(config: SocketConfig) -> (StreamSocket, MemoryPeer) {
    let (fd, peer) = MemoryDescriptor::pair();
    (StreamSocket::new(Token(7), fd, config), peer)
}

fn layered_chain(socket: &mut StreamSocket) {
    socket.attach_hook(LengthPrefixHook);
    socket.attach_hook(XorHook(0x5a));
    socket.attach_hook(LengthPrefixHook);
}

/// 经 `layered_chain` 编码后的线路字节。
fn encode_through_chain(messages: &[&[u8]]) -> Vec<u8> {
    let mut reactor = RecordingReactor::new();
    let (mut sender, peer) = socket_with(SocketConfig::default());
    layered_chain(&mut sender);
    for message in messages {
        sender.write_data(&mut reactor, message.to_vec());
    }
    sender.do_write(&mut reactor);
    peer.take_output()
}

fn drain_reads(socket: &mut StreamSocket, reactor: &mut RecordingReactor, peer: &MemoryPeer) -> Vec<u8> {
    while peer.pending_input() > 0 {
        socket.do_read(reactor);
        assert!(socket.error().is_none(), "unexpected error: {:?}", socket.error());
    }
    socket.take_received().to_vec()
}

#[test]
fn full_size_read_requests_fast_and_trial_read() {
    let mut reactor = RecordingReactor::new();
    let (mut socket, peer) = socket_with(SocketConfig::default().with_read_chunk(4));

    peer.feed(b"abcd");
    assert_eq!(socket.do_read(&mut reactor), DecodeOutcome::Produced);
    assert_eq!(
        reactor.last_request(),
        Some(Interest::WANT_FAST_READ | Interest::ADD_TRIAL_READ)
    );

    peer.feed(b"ef");
    assert_eq!(socket.do_read(&mut reactor), DecodeOutcome::Produced);
    assert_eq!(reactor.last_request(), Some(Interest::WANT_FAST_READ));
    assert_eq!(&socket.take_received()[..], b"abcdef");
}

#[test]
fn would_block_is_not_an_error() {
    let mut reactor = RecordingReactor::new();
    let (mut socket, _peer) = socket_with(SocketConfig::default());

    assert_eq!(socket.do_read(&mut reactor), DecodeOutcome::NoProgress);
    assert!(socket.read_blocked());
    assert!(socket.error().is_none());
    assert_eq!(reactor.last_request(), Some(Interest::READ_WILL_BLOCK));
}

#[test]
fn interrupted_recv_is_retried() {
    let mut reactor = RecordingReactor::new();
    let (mut socket, peer) = socket_with(SocketConfig::default());
    peer.feed(b"x");
    peer.fail_next_recv(io::ErrorKind::Interrupted);

    assert_eq!(socket.do_read(&mut reactor), DecodeOutcome::Produced);
    assert_eq!(peer.recv_calls(), 2);
}

#[test]
fn zero_byte_read_is_an_orderly_close() {
    let mut reactor = RecordingReactor::new();
    let mut handler = Collector::default();
    let (mut socket, peer) = socket_with(SocketConfig::default());
    peer.feed(b"bye");
    peer.close_input();

    socket.on_event(&mut reactor, Readiness::Read, &mut handler);
    assert_eq!(handler.data, b"bye");
    assert!(socket.error().is_none());

    socket.on_event(&mut reactor, Readiness::Read, &mut handler);
    assert_eq!(handler.errors, vec![ErrorKind::PeerClosed]);
    assert!(socket.is_closed());
    assert_eq!(reactor.deregistered(), &[Token(7)]);
    assert_eq!(peer.shutdown_count(), 1);
}

#[test]
fn other_recv_failures_keep_the_os_text() {
    let mut reactor = RecordingReactor::new();
    let (mut socket, peer) = socket_with(SocketConfig::default());
    peer.fail_next_recv(io::ErrorKind::PermissionDenied);

    assert_eq!(socket.do_read(&mut reactor), DecodeOutcome::Fatal);
    let err = socket.error().expect("terminal error");
    assert_eq!(err.kind(), ErrorKind::Local);
    assert!(err.message().contains("injected recv failure"));
}

#[test]
fn byte_at_a_time_matches_single_fragment() {
    let wire = encode_through_chain(&[b"hello", b"", b"layered world", &[0u8; 300]]);
    assert!(!wire.is_empty());

    let mut reactor = RecordingReactor::new();
    let (mut whole, whole_peer) = socket_with(SocketConfig::default());
    layered_chain(&mut whole);
    whole_peer.feed(&wire);
    let expected = drain_reads(&mut whole, &mut reactor, &whole_peer);

    let (mut trickle, trickle_peer) = socket_with(SocketConfig::default());
    layered_chain(&mut trickle);
    trickle_peer.set_read_limit(Some(1));
    trickle_peer.feed(&wire);
    let trickled = drain_reads(&mut trickle, &mut reactor, &trickle_peer);

    assert_eq!(trickled, expected);
    let mut original = b"hellolayered world".to_vec();
    original.extend_from_slice(&[0u8; 300]);
    assert_eq!(expected, original);
}

#[test]
fn round_trip_through_three_hooks() {
    let messages: [&[u8]; 3] = [b"alpha", b"beta", b"gamma\r\n"];
    let wire = encode_through_chain(&messages);
    assert_ne!(&wire[..], b"alphabetagamma\r\n");

    let mut reactor = RecordingReactor::new();
    let (mut receiver, peer) = socket_with(SocketConfig::default());
    layered_chain(&mut receiver);
    peer.feed(&wire);
    assert_eq!(drain_reads(&mut receiver, &mut reactor, &peer), messages.concat());
}

#[test]
fn partial_write_keeps_the_unsent_tail() {
    let mut reactor = RecordingReactor::new();
    let (mut socket, peer) = socket_with(SocketConfig::default());
    peer.set_write_budget(Some(5));

    socket.write_data(&mut reactor, &b"hello"[..]);
    socket.write_data(&mut reactor, &b" world"[..]);
    assert_eq!(reactor.last_request(), Some(Interest::ADD_TRIAL_WRITE));
    socket.do_write(&mut reactor);

    assert_eq!(peer.take_output(), b"hello");
    assert_eq!(socket.sendq().bytes(), 6);
    assert_eq!(
        reactor.last_request(),
        Some(Interest::WRITE_WILL_BLOCK | Interest::WANT_SINGLE_WRITE)
    );

    peer.set_write_budget(None);
    socket.do_write(&mut reactor);
    assert_eq!(peer.take_output(), b" world");
    assert!(socket.sendq().is_empty());
    assert_eq!(reactor.last_request(), Some(Interest::WANT_NO_WRITE));
}

#[test]
fn blocked_hook_retains_upper_data() {
    let mut reactor = RecordingReactor::new();
    let (mut socket, peer) = socket_with(SocketConfig::default());
    socket.attach_hook(GateHook::default());

    socket.write_data(&mut reactor, &b"queued"[..]);
    socket.do_write(&mut reactor);
    assert!(peer.take_output().is_empty());
    assert_eq!(socket.sendq().bytes(), 6);
    assert!(!socket.is_established());

    socket.find_hook_mut::<GateHook>().expect("gate").open = true;
    assert!(socket.is_established());
    socket.do_write(&mut reactor);
    assert_eq!(peer.take_output(), b"queued");
    assert!(socket.sendq().is_empty());
}

#[test]
fn blocked_tail_keeps_middle_hook_output() {
    let mut reactor = RecordingReactor::new();
    let (mut socket, peer) = socket_with(SocketConfig::default());
    socket.attach_hook(LengthPrefixHook);
    socket.attach_hook(GateHook::default());

    socket.write_data(&mut reactor, &b"abc"[..]);
    socket.do_write(&mut reactor);
    assert!(peer.take_output().is_empty());
    assert!(socket.sendq().is_empty());

    socket.find_hook_mut::<GateHook>().expect("gate").open = true;
    socket.do_write(&mut reactor);
    assert_eq!(peer.take_output(), b"\x00\x03abc");
}

#[test]
fn hook_violation_is_terminal_and_reported_once() {
    let mut reactor = RecordingReactor::new();
    let mut handler = Collector::default();
    let (mut socket, peer) = socket_with(SocketConfig::default());
    socket.attach_hook(TripwireHook);

    peer.feed(b"ok");
    socket.on_event(&mut reactor, Readiness::Read, &mut handler);
    peer.feed(b"bad!");
    socket.on_event(&mut reactor, Readiness::Read, &mut handler);
    socket.on_event(&mut reactor, Readiness::Read, &mut handler);

    assert_eq!(handler.data, b"ok");
    assert_eq!(handler.errors, vec![ErrorKind::ProtocolViolation]);
    let err = socket.error().expect("terminal");
    assert_eq!(err.code(), "spark.test.tripwire");
    assert_eq!(err.close_code(), Some(1002));

    socket.write_data(&mut reactor, &b"ignored"[..]);
    assert!(socket.sendq().is_empty());
}

#[test]
fn readiness_error_is_local_failure() {
    let mut reactor = RecordingReactor::new();
    let mut handler = Collector::default();
    let (mut socket, _peer) = socket_with(SocketConfig::default());

    socket.on_event(
        &mut reactor,
        Readiness::Error(io::Error::other("SO_ERROR")),
        &mut handler,
    );
    assert_eq!(handler.errors, vec![ErrorKind::Local]);
    assert!(socket.is_closed());
}

#[test]
fn closing_twice_notifies_hooks_once() {
    let mut reactor = RecordingReactor::new();
    let log = Rc::new(RefCell::new(Vec::new()));
    let (mut socket, peer) = socket_with(SocketConfig::default());
    socket.attach_hook(CloseProbe {
        label: "head",
        log: Rc::clone(&log),
    });
    socket.attach_hook(CloseProbe {
        label: "tail",
        log: Rc::clone(&log),
    });

    socket.close(&mut reactor);
    socket.close(&mut reactor);
    drop(socket);

    assert_eq!(*log.borrow(), vec!["head", "tail"]);
    assert_eq!(peer.take_output(), b"headtail");
    assert_eq!(peer.shutdown_count(), 1);
    assert_eq!(reactor.deregistered().len(), 1);
}

#[test]
fn close_when_drained_waits_for_pending_bytes() {
    let mut reactor = RecordingReactor::new();
    let (mut socket, peer) = socket_with(SocketConfig::default());
    peer.set_write_budget(Some(0));

    socket.write_data(&mut reactor, &b"last words"[..]);
    socket.do_write(&mut reactor);
    socket.close_when_drained(&mut reactor);
    assert!(socket.is_closing());
    assert!(!socket.is_closed());

    socket.write_data(&mut reactor, &b"too late"[..]);
    peer.set_write_budget(None);
    socket.do_write(&mut reactor);
    assert_eq!(peer.take_output(), b"last words");
    assert!(socket.is_closed());
}

#[test]
fn close_when_drained_with_nothing_pending_closes_now() {
    let mut reactor = RecordingReactor::new();
    let (mut socket, peer) = socket_with(SocketConfig::default());
    socket.close_when_drained(&mut reactor);
    assert!(socket.is_closed());
    assert_eq!(peer.shutdown_count(), 1);
}

#[test]
fn attach_order_and_lookup() {
    let (mut socket, _peer) = socket_with(SocketConfig::default());
    socket.attach_hook(XorHook(1));
    socket.attach_hook(GateHook::default());

    let names: Vec<_> = socket.hooks().hooks().map(|hook| hook.name()).collect();
    assert_eq!(names, vec!["xor", "gate"]);
    assert_eq!(socket.find_hook::<XorHook>().map(|hook| hook.0), Some(1));
    assert!(socket.find_hook::<LengthPrefixHook>().is_none());
}

#[test]
fn remote_address_comes_from_the_descriptor() {
    let addr = "192.0.2.10:4455".parse().expect("addr");
    let (fd, _peer) = MemoryDescriptor::pair();
    let socket = StreamSocket::new(Token(1), fd.with_peer_addr(addr), SocketConfig::default());
    assert_eq!(socket.remote_addr(), Some(addr));
}

#[test]
fn write_coalescing_merges_small_elements() {
    let mut reactor = RecordingReactor::new();
    let (mut socket, peer) = socket_with(SocketConfig::default().with_write_coalesce(64));
    for chunk in [&b"a"[..], b"b", b"c", b"d"] {
        socket.write_data(&mut reactor, chunk);
    }
    socket.do_write(&mut reactor);
    assert_eq!(peer.take_output(), b"abcd");
    assert_eq!(peer.send_calls(), 1);
}
