use std::io;

use rustls::{AlertDescription, Error as RustlsError};
use spark_sockio::{
    ErrorKind, SocketError,
    error::{OperationKind, PEER_CLOSED},
};
use thiserror::Error;

use crate::registry::SessionId;

/// TLS Hook 错误映射模块。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 将 `rustls`/IO 层的错误统一映射到流水线的 [`ErrorKind`]，上层据此区分安全事件、
///   对端关闭与本地故障，而无需解析底层库细节；
/// - 提供稳定错误码与文案，日志与告警可按码聚合。
///
/// ## 逻辑（How）
/// - [`OperationKind`] 描述一类操作（握手/读/写）的错误码与默认文案；
/// - [`TlsHookError::into_socket_error`] 根据错误来源推导 [`ErrorKind`]；
/// - `categorize_rustls_error` / `alert_to_kind` 将具体错误细分为 `Security`、
///   `ProtocolViolation`、`PeerClosed` 或 `Local`。
///
/// ## 风险与权衡（Trade-offs）
/// - `rustls::Error::General` 等泛型错误归为 `Local`，避免误报安全事件；
/// - 未穷举的 Alert 归为 `Security`：握手阶段收到的异常告警通常意味着协商被对端否决。
#[derive(Debug, Error)]
pub enum TlsHookError {
    /// 握手或记录层协商失败。
    #[error("tls protocol error: {0}")]
    Rustls(#[from] RustlsError),
    /// 会话缓冲读写失败。
    #[error("tls buffer error: {0}")]
    Io(#[from] io::Error),
    /// 已打开的会话收到未允许的重协商。
    #[error("renegotiation rejected for {0}")]
    RenegotiationRejected(SessionId),
    /// 会话已被丢弃，不能再驱动读写。
    #[error("tls session for {0} has been shut down")]
    SessionShutDown(SessionId),
    #[error("invalid tls server name: {0}")]
    InvalidServerName(String),
    /// 档案中缺少对应方向的 rustls 配置。
    #[error("tls profile has no {0} configuration")]
    MissingConfig(&'static str),
}

pub const HANDSHAKE: OperationKind = OperationKind {
    code: "spark.hook.tls.handshake_failed",
    message: "tls handshake",
};

pub const READ: OperationKind = OperationKind {
    code: "spark.hook.tls.read_failed",
    message: "tls read",
};

pub const WRITE: OperationKind = OperationKind {
    code: "spark.hook.tls.write_failed",
    message: "tls write",
};

pub const RENEGOTIATION_REJECTED: &str = "spark.hook.tls.renegotiation_rejected";
pub const SESSION_SHUT_DOWN: &str = "spark.hook.tls.session_shut_down";

impl TlsHookError {
    /// 转换为套接字终态错误，保留原始错误作为 `source`。
    pub fn into_socket_error(self, op: OperationKind) -> SocketError {
        let (code, kind) = match &self {
            TlsHookError::Rustls(error) => {
                let kind = categorize_rustls_error(error);
                (code_for(kind, op), kind)
            }
            TlsHookError::Io(error) => {
                let kind = categorize_io_error(error);
                (code_for(kind, op), kind)
            }
            TlsHookError::RenegotiationRejected(_) => (RENEGOTIATION_REJECTED, ErrorKind::Security),
            TlsHookError::SessionShutDown(_) => (SESSION_SHUT_DOWN, ErrorKind::Security),
            TlsHookError::InvalidServerName(_) | TlsHookError::MissingConfig(_) => {
                (op.code, ErrorKind::Local)
            }
        };
        let message = format!("{}: {}", op.message, self);
        SocketError::new(code, kind, message).with_cause(self)
    }
}

fn code_for(kind: ErrorKind, op: OperationKind) -> &'static str {
    if kind == ErrorKind::PeerClosed {
        PEER_CLOSED
    } else {
        op.code
    }
}

fn categorize_rustls_error(error: &RustlsError) -> ErrorKind {
    use RustlsError::*;
    match error {
        InappropriateMessage { .. }
        | InappropriateHandshakeMessage { .. }
        | InvalidMessage(_)
        | PeerMisbehaved(_)
        | PeerSentOversizedRecord => ErrorKind::ProtocolViolation,
        DecryptError
        | EncryptError
        | InvalidEncryptedClientHello(_)
        | NoCertificatesPresented
        | InvalidCertificate(_)
        | InvalidCertRevocationList(_)
        | UnsupportedNameType
        | NoApplicationProtocol
        | PeerIncompatible(_) => ErrorKind::Security,
        AlertReceived(alert) => alert_to_kind(alert),
        _ => ErrorKind::Local,
    }
}

fn alert_to_kind(alert: &AlertDescription) -> ErrorKind {
    use AlertDescription::*;
    match alert {
        CloseNotify | UserCanceled => ErrorKind::PeerClosed,
        DecodeError | UnexpectedMessage | RecordOverflow | IllegalParameter => {
            ErrorKind::ProtocolViolation
        }
        _ => ErrorKind::Security,
    }
}

fn categorize_io_error(error: &io::Error) -> ErrorKind {
    if let Some(source) = error.get_ref()
        && let Some(rustls_error) = source.downcast_ref::<RustlsError>()
    {
        return categorize_rustls_error(rustls_error);
    }
    match error.kind() {
        io::ErrorKind::UnexpectedEof
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe => ErrorKind::PeerClosed,
        _ => ErrorKind::Local,
    }
}
