//! RFC 6455 帧头解析与服务端帧编码。
//!
//! # 教案级总览
//! - **定位 (Why)**：Hook 在非阻塞读路径上一次只能看到部分字节，因此解析拆成两步：
//!   先从缓冲前缀解析帧头（不足则返回 `None`，不消费任何字节），再由调用方在整帧到齐后切出载荷；
//! - **契约 (What)**：服务端只接受带掩码的客户端帧；长度仅支持 7 位内联与 16 位扩展两种编码，
//!   非最小编码与 64 位长度分别以 1002、1009 拒绝；控制帧必须 FIN 且载荷不超过 125 字节；
//! - **风险提示**：校验顺序固定为“掩码 → opcode → 控制帧约束 → 长度”，保证同一非法帧无论以何种
//!   分片到达都得到相同的关闭码。

use spark_sockio::SocketError;
use thiserror::Error;

pub const FLAG_FIN: u8 = 0x80;
pub const FLAG_MASK: u8 = 0x80;
pub const OPCODE_CONTINUATION: u8 = 0x0;
pub const OPCODE_TEXT: u8 = 0x1;
pub const OPCODE_BINARY: u8 = 0x2;
pub const OPCODE_CLOSE: u8 = 0x8;
pub const OPCODE_PING: u8 = 0x9;
pub const OPCODE_PONG: u8 = 0xA;

/// 协议错误（RFC 6455 §7.4.1）。
pub const CLOSE_PROTOCOL_ERROR: u16 = 1002;
/// 策略违规。
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;
/// 消息过大。
pub const CLOSE_MESSAGE_TOO_BIG: u16 = 1009;

const MAX_CONTROL_PAYLOAD: usize = 125;

/// 已解析的帧头。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameHeader {
    pub fin: bool,
    pub opcode: u8,
    pub mask: [u8; 4],
    /// 帧头字节数（含扩展长度与掩码键）。
    pub header_len: usize,
    pub payload_len: usize,
}

impl FrameHeader {
    pub fn frame_len(&self) -> usize {
        self.header_len + self.payload_len
    }

    pub fn is_control(&self) -> bool {
        self.opcode & 0x08 != 0
    }
}

/// 帧级协议违规，每一种都对应一个 WebSocket 关闭码。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("client frame with opcode {opcode:#x} is not masked")]
    Unmasked { opcode: u8 },
    #[error("unsupported opcode {opcode:#x}")]
    UnsupportedOpcode { opcode: u8 },
    #[error("control frame opcode {opcode:#x} must not be fragmented")]
    FragmentedControl { opcode: u8 },
    #[error("control frame payload of {len} bytes exceeds 125")]
    ControlTooLong { len: usize },
    #[error("payload length {len} uses a non-minimal 16-bit encoding")]
    NonMinimalLength { len: usize },
    #[error("64-bit payload lengths are not accepted")]
    LengthTooLarge,
    #[error("ping/pong frames arrive faster than the configured minimum interval")]
    ControlFlood,
}

pub const PROTOCOL_ERROR_CODE: &str = "spark.hook.ws.protocol_error";
pub const POLICY_VIOLATION_CODE: &str = "spark.hook.ws.policy_violation";
pub const MESSAGE_TOO_BIG_CODE: &str = "spark.hook.ws.message_too_big";

impl FrameError {
    pub fn close_code(&self) -> u16 {
        match self {
            FrameError::Unmasked { .. } | FrameError::ControlFlood => CLOSE_POLICY_VIOLATION,
            FrameError::LengthTooLarge => CLOSE_MESSAGE_TOO_BIG,
            FrameError::UnsupportedOpcode { .. }
            | FrameError::FragmentedControl { .. }
            | FrameError::ControlTooLong { .. }
            | FrameError::NonMinimalLength { .. } => CLOSE_PROTOCOL_ERROR,
        }
    }

    pub fn into_socket_error(self) -> SocketError {
        let close_code = self.close_code();
        let code = match close_code {
            CLOSE_POLICY_VIOLATION => POLICY_VIOLATION_CODE,
            CLOSE_MESSAGE_TOO_BIG => MESSAGE_TOO_BIG_CODE,
            _ => PROTOCOL_ERROR_CODE,
        };
        SocketError::protocol(code, close_code, self.to_string()).with_cause(self)
    }
}

/// 从缓冲前缀解析帧头；字节不足时返回 `Ok(None)`。
pub fn parse_header(buf: &[u8]) -> Result<Option<FrameHeader>, FrameError> {
    let [first, second, ..] = *buf else {
        return Ok(None);
    };
    let fin = first & FLAG_FIN != 0;
    let opcode = first & 0x0F;
    if second & FLAG_MASK == 0 {
        return Err(FrameError::Unmasked { opcode });
    }
    match opcode {
        OPCODE_CONTINUATION | OPCODE_TEXT | OPCODE_BINARY => {}
        OPCODE_CLOSE | OPCODE_PING | OPCODE_PONG => {
            if !fin {
                return Err(FrameError::FragmentedControl { opcode });
            }
        }
        _ => return Err(FrameError::UnsupportedOpcode { opcode }),
    }

    let (payload_len, mut offset) = match second & 0x7F {
        127 => return Err(FrameError::LengthTooLarge),
        126 => {
            let [_, _, hi, lo, ..] = *buf else {
                return Ok(None);
            };
            let len = usize::from(u16::from_be_bytes([hi, lo]));
            if len <= MAX_CONTROL_PAYLOAD {
                return Err(FrameError::NonMinimalLength { len });
            }
            (len, 4)
        }
        inline => (usize::from(inline), 2),
    };
    if opcode & 0x08 != 0 && payload_len > MAX_CONTROL_PAYLOAD {
        return Err(FrameError::ControlTooLong { len: payload_len });
    }

    let Some(key) = buf.get(offset..offset + 4) else {
        return Ok(None);
    };
    let mask = [key[0], key[1], key[2], key[3]];
    offset += 4;
    Ok(Some(FrameHeader {
        fin,
        opcode,
        mask,
        header_len: offset,
        payload_len,
    }))
}

/// 原地解掩码。
pub fn unmask(payload: &mut [u8], mask: [u8; 4]) {
    for (index, byte) in payload.iter_mut().enumerate() {
        *byte ^= mask[index % 4];
    }
}

/// 编码一条不带掩码的单帧消息（服务端方向）。
pub fn encode_frame(opcode: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(10 + payload.len());
    frame.push(FLAG_FIN | opcode);
    encode_length(payload.len(), &mut frame);
    frame.extend_from_slice(payload);
    frame
}

/// 写入 WebSocket 长度字段（含扩展长度）。
fn encode_length(len: usize, out: &mut Vec<u8>) {
    if len <= MAX_CONTROL_PAYLOAD {
        out.push(len as u8);
    } else if len <= u16::MAX as usize {
        out.push(126);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        out.push(127);
        out.extend_from_slice(&(len as u64).to_be_bytes());
    }
}
