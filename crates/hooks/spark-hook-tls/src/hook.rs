use std::time::SystemTime;

use bytes::BytesMut;
use spark_sockio::{
    DecodeOutcome, EncodeOutcome, Hook, HookContext, Interest, SendQueue, error::OperationKind,
};
use tracing::{debug, info, trace, warn};

use crate::{
    cert::CertificateSummary,
    config::TlsHookConfig,
    error::{self, TlsHookError},
    registry::{SessionId, SessionRegistry, TlsState},
    session::TlsSession,
};

/// 会话所处的一端。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Side {
    Server,
    Client,
}

/// TLS 终结 Hook。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 在非阻塞流水线上完成握手、记录层加解密与 `close_notify`，对上层呈现明文字节流；
/// - 握手状态机必须精确报告下一次需要的就绪（读或写，不能同时请求两者），
///   并在已打开的会话上拒绝未允许的重协商。
///
/// ## 逻辑（How）
/// - 状态 `None → Handshaking → Open` 保存在 [`SessionRegistry`] 中，由会话的握手回调与本 Hook 共同推进；
/// - 握手步骤在读写两条路径上都会执行，直到会话报告握手结束；
/// - 每一步先检查登记表：若重协商已被拒绝，立即丢弃会话并以安全错误失败，
///   之后的任何步骤都只会看到“会话已关闭”，不会触碰已释放的会话；
/// - 加密前将发送队列队首的小元素合并到 `record_coalesce` 字节，减少记录数；
/// - 线路队列积压达到 `wire_high_water` 后暂停加密，未发送数据留在上层队列。
///
/// ## 契约（What）
/// - `is_ready`：仅在状态为 `Open` 且会话仍存活时为真；
/// - `certificate`：握手完成时同步生成的对端证书摘要，之后不可变；
/// - `on_close`：会话打开时发送一次 `close_notify`；只要失败不是由 TLS 层自身造成
///   （例如上层 Hook 因协议违规终止连接），就先封装上层残留的告别数据。
pub struct TlsHook {
    id: SessionId,
    side: Side,
    registry: SessionRegistry,
    session: Option<Box<dyn TlsSession>>,
    config: TlsHookConfig,
    certificate: Option<CertificateSummary>,
    summarised: bool,
    close_sent: bool,
    failed: bool,
}

impl TlsHook {
    pub(crate) fn new(
        id: SessionId,
        side: Side,
        registry: SessionRegistry,
        session: Box<dyn TlsSession>,
        config: TlsHookConfig,
    ) -> Self {
        Self {
            id,
            side,
            registry,
            session: Some(session),
            config,
            certificate: None,
            summarised: false,
            close_sent: false,
            failed: false,
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.id
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn state(&self) -> TlsState {
        self.registry.state(self.id).unwrap_or(TlsState::None)
    }

    /// 对端证书摘要；对端未出示证书（如未要求客户端认证的服务端）时为 `None`。
    pub fn certificate(&self) -> Option<&CertificateSummary> {
        self.certificate.as_ref()
    }

    pub fn server_name(&self) -> Option<String> {
        self.session.as_ref().and_then(|session| session.server_name())
    }

    pub fn alpn_protocol(&self) -> Option<Vec<u8>> {
        self.session.as_ref().and_then(|session| session.alpn_protocol())
    }

    /// 会话是否已被丢弃（重协商被拒绝或握手失败）。
    pub fn is_shut_down(&self) -> bool {
        self.session.is_none()
    }

    /// 检查重协商标记；会话被拒绝或已丢弃时记录错误并返回 `false`。
    fn session_alive(&mut self, ctx: &mut HookContext<'_>) -> bool {
        if self.registry.renegotiation_rejected(self.id) {
            if self.session.take().is_some() {
                warn!(session = %self.id, token = ctx.token().0, "tls session discarded after rejected renegotiation");
            }
            self.failed = true;
            ctx.fail(
                TlsHookError::RenegotiationRejected(self.id).into_socket_error(error::HANDSHAKE),
            );
            return false;
        }
        if self.session.is_none() {
            self.failed = true;
            ctx.fail(TlsHookError::SessionShutDown(self.id).into_socket_error(error::HANDSHAKE));
            return false;
        }
        true
    }

    /// 握手失败：状态回到 `None`，尽力发出告警记录后丢弃会话。
    fn abort(&mut self, ctx: &mut HookContext<'_>, output: &mut SendQueue, err: TlsHookError, op: OperationKind) {
        self.failed = true;
        self.registry.set_state(self.id, TlsState::None);
        if let Some(mut session) = self.session.take() {
            let _ = session.drain_records(output);
        }
        ctx.fail(err.into_socket_error(op));
    }

    /// 推进握手。返回 `Ok(true)` 表示会话已打开。
    fn drive_handshake(
        &mut self,
        ctx: &mut HookContext<'_>,
        output: &mut SendQueue,
    ) -> Result<bool, TlsHookError> {
        let Some(session) = self.session.as_mut() else {
            return Err(TlsHookError::SessionShutDown(self.id));
        };
        session.drain_records(output)?;
        if session.is_handshaking() {
            if output.is_empty() {
                ctx.request(Interest::WANT_POLL_READ);
            } else {
                ctx.request(Interest::ADD_TRIAL_WRITE);
            }
            return Ok(false);
        }
        if self.registry.renegotiation_rejected(self.id) {
            return Err(TlsHookError::RenegotiationRejected(self.id));
        }

        self.registry.set_state(self.id, TlsState::Open);
        if !self.summarised {
            self.summarised = true;
            self.certificate = session.peer_certificates().first().map(|leaf| {
                CertificateSummary::from_der(leaf, session.peer_trust(), SystemTime::now())
            });
        }
        let sni = session.server_name();
        info!(
            session = %self.id,
            token = ctx.token().0,
            side = ?self.side,
            sni = sni.as_deref().unwrap_or("-"),
            "tls handshake complete"
        );
        ctx.request(Interest::ADD_TRIAL_WRITE);
        Ok(true)
    }
}

impl Hook for TlsHook {
    fn name(&self) -> &'static str {
        "tls"
    }

    fn is_ready(&self) -> bool {
        self.session.is_some() && self.state() == TlsState::Open
    }

    fn wants_write(&self) -> bool {
        self.session.as_ref().is_some_and(|session| session.wants_write())
            && !self.registry.renegotiation_rejected(self.id)
    }

    fn decode(
        &mut self,
        ctx: &mut HookContext<'_>,
        input: &mut BytesMut,
        output: &mut BytesMut,
        reply: &mut SendQueue,
    ) -> DecodeOutcome {
        if !self.session_alive(ctx) {
            return DecodeOutcome::Fatal;
        }
        let Some(session) = self.session.as_mut() else {
            return DecodeOutcome::Fatal;
        };

        let mut plaintext = BytesMut::new();
        if let Err(err) = session.feed(input, &mut plaintext) {
            let op = if self.state() == TlsState::Open {
                error::READ
            } else {
                error::HANDSHAKE
            };
            self.abort(ctx, reply, err, op);
            return DecodeOutcome::Fatal;
        }
        // 回调可能在本次喂入期间发生，拒绝后本批明文一律丢弃。
        if !self.session_alive(ctx) {
            return DecodeOutcome::Fatal;
        }

        if self.state() != TlsState::Open {
            if let Err(err) = self.drive_handshake(ctx, reply) {
                self.abort(ctx, reply, err, error::HANDSHAKE);
                return DecodeOutcome::Fatal;
            }
        } else if let Some(session) = self.session.as_mut() {
            // 会话票据、密钥更新等握手后消息。
            let before = reply.len();
            if let Err(err) = session.drain_records(reply) {
                self.abort(ctx, reply, err, error::READ);
                return DecodeOutcome::Fatal;
            }
            if reply.len() > before {
                ctx.request(Interest::ADD_TRIAL_WRITE);
            }
        }

        let produced = !plaintext.is_empty();
        if produced {
            output.extend_from_slice(&plaintext);
        }

        if self.session.as_ref().is_some_and(|session| session.peer_closed()) {
            debug!(session = %self.id, token = ctx.token().0, "tls close_notify received");
            self.failed = true;
            ctx.fail(
                TlsHookError::from(rustls::Error::AlertReceived(
                    rustls::AlertDescription::CloseNotify,
                ))
                .into_socket_error(error::READ),
            );
            return DecodeOutcome::Fatal;
        }

        if produced {
            DecodeOutcome::Produced
        } else {
            DecodeOutcome::NoProgress
        }
    }

    fn encode(
        &mut self,
        ctx: &mut HookContext<'_>,
        input: &mut SendQueue,
        output: &mut SendQueue,
    ) -> EncodeOutcome {
        if !self.session_alive(ctx) {
            return EncodeOutcome::Fatal;
        }

        if self.state() != TlsState::Open {
            match self.drive_handshake(ctx, output) {
                Ok(true) => {}
                Ok(false) => return EncodeOutcome::Blocked,
                Err(err) => {
                    self.abort(ctx, output, err, error::HANDSHAKE);
                    return EncodeOutcome::Fatal;
                }
            }
        }

        let Some(session) = self.session.as_mut() else {
            return EncodeOutcome::Fatal;
        };
        let high_water = self.config.wire_high_water;
        input.coalesce_front(self.config.record_coalesce);
        let mut result = session.drain_records(output);
        while result.is_ok() && output.bytes() < high_water {
            let Some(front) = input.front() else {
                break;
            };
            match session.encrypt(front) {
                Ok(0) => break,
                Ok(accepted) => {
                    input.erase_front(accepted);
                    result = session.drain_records(output);
                }
                Err(err) => result = Err(err),
            }
        }
        if let Err(err) = result {
            self.abort(ctx, output, err, error::WRITE);
            return EncodeOutcome::Fatal;
        }
        if input.is_empty() {
            return EncodeOutcome::Progress;
        }
        ctx.request(Interest::ADD_TRIAL_WRITE);
        if output.bytes() >= high_water {
            trace!(session = %self.id, queued = output.bytes(), "tls wire queue above high-water mark");
            EncodeOutcome::Blocked
        } else {
            // 会话缓冲已满，待线路队列刷出后再继续。
            EncodeOutcome::Progress
        }
    }

    fn on_close(&mut self, _ctx: &mut HookContext<'_>, input: &mut SendQueue, output: &mut SendQueue) {
        if self.close_sent || self.state() != TlsState::Open {
            return;
        }
        let Some(session) = self.session.as_mut() else {
            return;
        };
        self.close_sent = true;
        if !self.failed {
            while let Some(front) = input.front() {
                match session.encrypt(front) {
                    Ok(accepted) if accepted > 0 => input.erase_front(accepted),
                    _ => break,
                }
            }
        }
        session.send_close_notify();
        if let Err(err) = session.drain_records(output) {
            debug!(session = %self.id, "close_notify not delivered: {err}");
        }
    }
}

impl Drop for TlsHook {
    fn drop(&mut self) {
        self.registry.remove(self.id);
    }
}
