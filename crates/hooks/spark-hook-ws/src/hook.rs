use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Instant,
};

use bytes::{Buf, BytesMut};
use spark_sockio::{
    DecodeOutcome, EncodeOutcome, Hook, HookContext, Interest, SendQueue, error::peer_closed,
};
use tracing::{debug, info, warn};

use crate::{
    config::{FrameMode, WebSocketConfig},
    frame::{self, FrameError, FrameHeader},
    handshake::{self, UpgradeError, UpgradeRequest},
};

/// 升级状态。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WsState {
    AwaitingRequest,
    Established,
}

/// WebSocket 服务端 Hook。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 让面向行协议的应用无感知地接入浏览器客户端：入站每条消息以 `\r\n` 结尾交给上层，
///   出站按换行拆分、逐条成帧；
/// - 协议违规要带着正确的关闭码结束连接，关闭时回送一次关闭帧。
///
/// ## 逻辑（How）
/// - `AwaitingRequest`：缓冲至头块完整（空行结束）之前不产生任何输出；头块超过
///   `max_request_size` 以 431 拒绝；校验通过后写入 101 响应并进入 `Established`，
///   同一批字节中紧随其后的帧继续解码；
/// - `Established`：逐帧解析，帧未到齐时保留在接收缓冲中等待下一次读；数据帧剥离 CR/LF，
///   FIN 时补一个 `\r\n`；ping 回 pong，pong 在面向用户的连接上刷新活跃时间，
///   两者都受最小间隔约束。
///
/// ## 契约（What）
/// - 解码过程中的帧级状态只存在于接收缓冲中，因此任意分片方式得到的输出相同；
/// - `on_close` 仅在已建立时发送一次关闭帧：因协议违规关闭时携带该关闭码，否则载荷为空。
pub struct WebSocketHook {
    config: Arc<WebSocketConfig>,
    state: WsState,
    mode: FrameMode,
    protocol: Option<String>,
    last_control: Option<Instant>,
    violation: Option<u16>,
    close_sent: bool,
}

impl WebSocketHook {
    pub fn new(config: impl Into<Arc<WebSocketConfig>>) -> Self {
        let config = config.into();
        let mode = config.default_mode.unwrap_or(FrameMode::Text);
        Self {
            config,
            state: WsState::AwaitingRequest,
            mode,
            protocol: None,
            last_control: None,
            violation: None,
            close_sent: false,
        }
    }

    pub fn state(&self) -> WsState {
        self.state
    }

    /// 协商后的帧类型；升级完成前为默认值。
    pub fn mode(&self) -> FrameMode {
        self.mode
    }

    /// 回显给客户端的子协议。
    pub fn protocol(&self) -> Option<&str> {
        self.protocol.as_deref()
    }

    fn upgrade(
        &mut self,
        ctx: &mut HookContext<'_>,
        input: &mut BytesMut,
        reply: &mut SendQueue,
    ) -> Result<bool, UpgradeError> {
        let limit = self.config.max_request_size;
        let end = match handshake::find_header_end(input) {
            Some(end) if end <= limit => end,
            Some(_) => return Err(UpgradeError::RequestTooLarge(limit)),
            None if input.len() > limit => return Err(UpgradeError::RequestTooLarge(limit)),
            None => return Ok(false),
        };
        let block = input.split_to(end);
        let request = UpgradeRequest::parse(&block)?;
        let key = request.validate()?;
        handshake::check_origin(&self.config, request.header("Origin"))?;
        self.apply_proxy(ctx, &request)?;
        let negotiated = handshake::negotiate(&self.config, request.header("Sec-WebSocket-Protocol"))?;

        let accept = handshake::compute_accept_key(key);
        reply.push_back(handshake::switching_protocols(&accept, negotiated.protocol.as_deref()));
        self.mode = negotiated.mode;
        self.protocol = negotiated.protocol;
        self.state = WsState::Established;
        info!(
            token = ctx.token().0,
            path = %request.path,
            mode = ?self.mode,
            protocol = self.protocol.as_deref().unwrap_or("-"),
            "websocket upgrade complete"
        );
        ctx.request(Interest::ADD_TRIAL_WRITE);
        Ok(true)
    }

    /// 对端属于受信代理时，以代理头中最后一个地址替换对外可见地址。
    fn apply_proxy(&self, ctx: &mut HookContext<'_>, request: &UpgradeRequest) -> Result<(), UpgradeError> {
        let Some(remote) = ctx.remote_addr() else {
            return Ok(());
        };
        if !self.config.is_trusted_proxy(remote.ip()) {
            return Ok(());
        }
        let header = &self.config.proxy_header;
        let real: IpAddr = request
            .header(header)
            .and_then(|value| value.rsplit(',').next())
            .and_then(|last| last.trim().parse().ok())
            .ok_or_else(|| UpgradeError::ProxyHeader(header.clone()))?;
        let visible = SocketAddr::new(real, remote.port());
        debug!(token = ctx.token().0, proxy = %remote, client = %visible, "websocket client address taken from trusted proxy");
        ctx.set_remote_addr(visible);
        Ok(())
    }

    fn reject(&mut self, ctx: &mut HookContext<'_>, reply: &mut SendQueue, err: UpgradeError) -> DecodeOutcome {
        warn!(token = ctx.token().0, status = err.status(), "websocket upgrade rejected: {err}");
        reply.push_back(err.response());
        ctx.request(Interest::ADD_TRIAL_WRITE);
        ctx.fail(err.into_socket_error());
        DecodeOutcome::Fatal
    }

    fn violate(&mut self, ctx: &mut HookContext<'_>, err: FrameError) -> DecodeOutcome {
        self.violation = Some(err.close_code());
        ctx.fail(err.into_socket_error());
        DecodeOutcome::Fatal
    }

    /// ping/pong 间隔检查，并记录本次到达时间。
    fn check_control_rate(&mut self, now: Instant) -> Result<(), FrameError> {
        let min = self.config.min_ping_interval();
        if let Some(last) = self.last_control {
            if !min.is_zero() && now.saturating_duration_since(last) < min {
                return Err(FrameError::ControlFlood);
            }
        }
        self.last_control = Some(now);
        Ok(())
    }

    fn decode_frames(
        &mut self,
        ctx: &mut HookContext<'_>,
        input: &mut BytesMut,
        output: &mut BytesMut,
        reply: &mut SendQueue,
    ) -> DecodeOutcome {
        let before = output.len();
        loop {
            let header: FrameHeader = match frame::parse_header(input) {
                Ok(Some(header)) => header,
                Ok(None) => break,
                Err(err) => return self.violate(ctx, err),
            };
            if input.len() < header.frame_len() {
                break;
            }
            let mut payload = input.split_to(header.frame_len());
            payload.advance(header.header_len);
            frame::unmask(&mut payload, header.mask);

            match header.opcode {
                frame::OPCODE_PING => {
                    if let Err(err) = self.check_control_rate(ctx.now()) {
                        return self.violate(ctx, err);
                    }
                    reply.push_back(frame::encode_frame(frame::OPCODE_PONG, &payload));
                    ctx.request(Interest::ADD_TRIAL_WRITE);
                }
                frame::OPCODE_PONG => {
                    if let Err(err) = self.check_control_rate(ctx.now()) {
                        return self.violate(ctx, err);
                    }
                    if self.config.user_facing {
                        ctx.touch();
                    }
                }
                frame::OPCODE_CLOSE => {
                    debug!(token = ctx.token().0, "websocket close frame received");
                    ctx.fail(peer_closed("websocket close frame"));
                    return DecodeOutcome::Fatal;
                }
                _ => {
                    output.extend(payload.iter().copied().filter(|&b| b != b'\r' && b != b'\n'));
                    if header.fin {
                        output.extend_from_slice(b"\r\n");
                    }
                }
            }
        }
        if output.len() > before {
            DecodeOutcome::Produced
        } else {
            DecodeOutcome::NoProgress
        }
    }

    /// 把上层队列中的每一行单独成帧。
    fn frame_lines(&self, input: &mut SendQueue, output: &mut SendQueue) {
        if input.is_empty() {
            return;
        }
        let data = input.to_vec();
        input.clear();
        let opcode = match self.mode {
            FrameMode::Text => frame::OPCODE_TEXT,
            FrameMode::Binary => frame::OPCODE_BINARY,
        };
        for line in data.split(|&b| b == b'\n') {
            let line: Vec<u8> = line.iter().copied().filter(|&b| b != b'\r').collect();
            if line.is_empty() {
                continue;
            }
            let payload = match self.mode {
                FrameMode::Text => String::from_utf8_lossy(&line).into_owned().into_bytes(),
                FrameMode::Binary => line,
            };
            output.push_back(frame::encode_frame(opcode, &payload));
        }
    }
}

impl Hook for WebSocketHook {
    fn name(&self) -> &'static str {
        "websocket"
    }

    fn is_ready(&self) -> bool {
        self.state == WsState::Established
    }

    fn decode(
        &mut self,
        ctx: &mut HookContext<'_>,
        input: &mut BytesMut,
        output: &mut BytesMut,
        reply: &mut SendQueue,
    ) -> DecodeOutcome {
        if self.state == WsState::AwaitingRequest {
            match self.upgrade(ctx, input, reply) {
                Ok(true) => {}
                Ok(false) => return DecodeOutcome::NoProgress,
                Err(err) => return self.reject(ctx, reply, err),
            }
        }
        self.decode_frames(ctx, input, output, reply)
    }

    fn encode(
        &mut self,
        _ctx: &mut HookContext<'_>,
        input: &mut SendQueue,
        output: &mut SendQueue,
    ) -> EncodeOutcome {
        if self.state != WsState::Established {
            return EncodeOutcome::Blocked;
        }
        self.frame_lines(input, output);
        EncodeOutcome::Progress
    }

    fn on_close(&mut self, ctx: &mut HookContext<'_>, input: &mut SendQueue, output: &mut SendQueue) {
        if self.close_sent || self.state != WsState::Established {
            return;
        }
        self.close_sent = true;
        if !ctx.has_failed() {
            self.frame_lines(input, output);
        }
        let payload = self
            .violation
            .map(|code| code.to_be_bytes().to_vec())
            .unwrap_or_default();
        output.push_back(frame::encode_frame(frame::OPCODE_CLOSE, &payload));
    }
}
