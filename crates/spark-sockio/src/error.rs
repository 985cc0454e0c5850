use std::{borrow::Cow, error::Error as StdError, fmt, io};

/// 套接字流水线的终态错误。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 套接字一旦出错即进入终态，上层只需判断“是否存活”，无需理解各个 Hook 的内部状态；
/// - 稳定错误码（`spark.sockio.*`、`spark.hook.*`）让日志与告警可以按码聚合，而不是解析文案。
///
/// ## 契约（What）
/// - `code`：`'static` 稳定错误码；
/// - `kind`：错误分类，见 [`ErrorKind`]；
/// - `close_code`：若协议定义了关闭码（如 WebSocket 1002/1008/1009），在此携带；
/// - `cause`：可选底层原因，经由 [`std::error::Error::source`] 暴露。
///
/// ## 注意事项（Trade-offs）
/// - 不实现 `Clone`：底层原因是装箱的 trait 对象；需要复制时请只取 `code`/`message`。
#[derive(Debug)]
pub struct SocketError {
    code: &'static str,
    kind: ErrorKind,
    message: Cow<'static, str>,
    close_code: Option<u16>,
    cause: Option<ErrorCause>,
}

/// 底层原因，保持 `Send + Sync` 以便跨越日志与诊断边界。
pub type ErrorCause = Box<dyn StdError + Send + Sync + 'static>;

/// 本 crate 统一的返回值别名，默认错误类型为 [`SocketError`]。
pub type Result<T, E = SocketError> = std::result::Result<T, E>;

/// 终态错误的分类。
///
/// - `PeerClosed`：对端有序关闭（零字节读、关闭帧、连接复位），属于正常结束而非异常；
/// - `ProtocolViolation`：畸形帧、非最小长度编码、未掩码帧等；
/// - `Security`：握手失败、被拒绝的重协商等安全事件；
/// - `Local`：其余系统调用失败，原始错误文本保留在消息中。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    PeerClosed,
    ProtocolViolation,
    Security,
    Local,
}

impl SocketError {
    /// 构造终态错误。
    pub fn new(code: &'static str, kind: ErrorKind, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code,
            kind,
            message: message.into(),
            close_code: None,
            cause: None,
        }
    }

    /// 以协议违规分类构造错误，并附带协议关闭码。
    pub fn protocol(
        code: &'static str,
        close_code: u16,
        message: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self::new(code, ErrorKind::ProtocolViolation, message).with_close_code(close_code)
    }

    /// 附带协议关闭码。
    pub fn with_close_code(mut self, close_code: u16) -> Self {
        self.close_code = Some(close_code);
        self
    }

    /// 附带底层原因。
    pub fn with_cause(mut self, cause: impl StdError + Send + Sync + 'static) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    pub fn code(&self) -> &'static str {
        self.code
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn close_code(&self) -> Option<u16> {
        self.close_code
    }

    /// 对端有序关闭不是异常，调用方可据此降低日志级别。
    pub fn is_peer_close(&self) -> bool {
        self.kind == ErrorKind::PeerClosed
    }
}

impl fmt::Display for SocketError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl StdError for SocketError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.cause
            .as_ref()
            .map(|boxed| boxed.as_ref() as &(dyn StdError + 'static))
    }
}

/// 描述一次底层操作对应的稳定错误码与默认文案。
#[derive(Clone, Copy, Debug)]
pub struct OperationKind {
    pub code: &'static str,
    pub message: &'static str,
}

pub const RECV: OperationKind = OperationKind {
    code: "spark.sockio.recv_failed",
    message: "socket recv",
};

pub const SEND: OperationKind = OperationKind {
    code: "spark.sockio.send_failed",
    message: "socket writev",
};

pub const POLL: OperationKind = OperationKind {
    code: "spark.sockio.poll_error",
    message: "socket readiness error",
};

pub const PEER_CLOSED: &str = "spark.sockio.peer_closed";
pub const HOOK_ABORTED: &str = "spark.sockio.hook_aborted";

/// 将系统调用错误映射为终态错误，原始文本保留在消息中。
pub fn map_io_error(kind: OperationKind, error: io::Error) -> SocketError {
    let category = categorize_io_error(&error);
    let code = if category == ErrorKind::PeerClosed {
        PEER_CLOSED
    } else {
        kind.code
    };
    SocketError::new(code, category, format!("{}: {}", kind.message, error)).with_cause(error)
}

/// 零字节读：对端有序关闭。
pub fn peer_closed(reason: &'static str) -> SocketError {
    SocketError::new(PEER_CLOSED, ErrorKind::PeerClosed, reason)
}

fn categorize_io_error(error: &io::Error) -> ErrorKind {
    use io::ErrorKind as Io;
    match error.kind() {
        Io::ConnectionReset | Io::ConnectionAborted | Io::BrokenPipe | Io::UnexpectedEof => {
            ErrorKind::PeerClosed
        }
        _ => ErrorKind::Local,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_keep_their_text_and_source() {
        let err = map_io_error(RECV, io::Error::other("disk on fire"));
        assert_eq!(err.code(), RECV.code);
        assert_eq!(err.kind(), ErrorKind::Local);
        assert!(err.message().contains("disk on fire"));
        assert!(err.source().is_some());
    }

    #[test]
    fn connection_reset_is_a_peer_close() {
        let err = map_io_error(SEND, io::Error::from(io::ErrorKind::ConnectionReset));
        assert!(err.is_peer_close());
        assert_eq!(err.code(), PEER_CLOSED);
    }

    #[test]
    fn display_prefixes_the_code() {
        let err = SocketError::protocol("spark.test.bad", 1002, "bad frame");
        assert_eq!(err.to_string(), "[spark.test.bad] bad frame");
        assert_eq!(err.close_code(), Some(1002));
    }
}
