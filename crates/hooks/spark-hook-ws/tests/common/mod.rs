//! WebSocket 集成测试共用的客户端帧构造与响应解析辅助函数。

#![allow(dead_code)]

pub mod tls;

use std::net::SocketAddr;

use spark_hook_ws::{WebSocketConfig, WebSocketHook, frame::FLAG_FIN};
use spark_sockio::{
    SocketConfig, StreamSocket, Token,
    test_stubs::{MemoryDescriptor, MemoryPeer},
};

pub const CLIENT_KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";
pub const EXPECTED_ACCEPT: &str = "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=";
const MASK: [u8; 4] = [0x37, 0xfa, 0x21, 0x3d];

/// 构造升级请求，`extra` 为附加头部行（每行以 `\r\n` 结尾）。
pub fn upgrade_request(extra: &str) -> Vec<u8> {
    format!(
        "GET /ws HTTP/1.1\r\nHost: irc.example.org\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Key: {CLIENT_KEY}\r\nSec-WebSocket-Version: 13\r\n{extra}\r\n"
    )
    .into_bytes()
}

/// 客户端方向的带掩码帧；`first` 为首字节（FIN 位 + opcode）。
pub fn client_frame(first: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = vec![first];
    if payload.len() <= 125 {
        frame.push(0x80 | payload.len() as u8);
    } else {
        frame.push(0x80 | 126);
        frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    }
    frame.extend_from_slice(&MASK);
    frame.extend(
        payload
            .iter()
            .enumerate()
            .map(|(index, byte)| byte ^ MASK[index % 4]),
    );
    frame
}

/// 单帧完整消息。
pub fn fin_frame(opcode: u8, payload: &[u8]) -> Vec<u8> {
    client_frame(FLAG_FIN | opcode, payload)
}

/// 拆出 HTTP 响应头块与其后的字节。
pub fn split_response(bytes: &[u8]) -> (String, Vec<u8>) {
    let end = bytes
        .windows(4)
        .position(|window| window == b"\r\n\r\n")
        .map(|index| index + 4)
        .expect("response head must be complete");
    (
        String::from_utf8_lossy(&bytes[..end]).into_owned(),
        bytes[end..].to_vec(),
    )
}

/// 解析服务端发出的（不带掩码的）帧序列，返回 `(opcode, payload)`。
pub fn server_frames(mut bytes: &[u8]) -> Vec<(u8, Vec<u8>)> {
    let mut frames = Vec::new();
    while !bytes.is_empty() {
        assert_eq!(bytes[0] & 0x80, 0x80, "server frames are never fragmented");
        assert_eq!(bytes[1] & 0x80, 0, "server frames are never masked");
        let opcode = bytes[0] & 0x0F;
        let (len, offset) = match bytes[1] & 0x7F {
            126 => (usize::from(u16::from_be_bytes([bytes[2], bytes[3]])), 4),
            127 => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&bytes[2..10]);
                (u64::from_be_bytes(raw) as usize, 10)
            }
            len => (usize::from(len), 2),
        };
        frames.push((opcode, bytes[offset..offset + len].to_vec()));
        bytes = &bytes[offset + len..];
    }
    frames
}

pub fn ws_socket(config: WebSocketConfig) -> (StreamSocket, MemoryPeer) {
    let (fd, peer) = MemoryDescriptor::pair();
    let mut socket = StreamSocket::new(Token(7), fd, SocketConfig::default());
    socket.attach_hook(WebSocketHook::new(config));
    (socket, peer)
}

pub fn ws_socket_from(config: WebSocketConfig, addr: SocketAddr) -> (StreamSocket, MemoryPeer) {
    let (fd, peer) = MemoryDescriptor::pair();
    let mut socket = StreamSocket::new(Token(8), fd.with_peer_addr(addr), SocketConfig::default());
    socket.attach_hook(WebSocketHook::new(config));
    (socket, peer)
}
