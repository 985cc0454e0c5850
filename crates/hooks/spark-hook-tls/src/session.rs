//! 加密会话抽象。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - Hook 只负责状态机与流水线交互，记录层加解密交给会话；
//! - 以 trait 隔离具体实现：生产环境使用 [`RustlsSession`]，测试可注入脚本化会话，
//!   复现 rustls 本身不会发起的重协商等场景。
//!
//! ## 契约（What）
//! - [`TlsSession::feed`]：尽量消费 `input` 中的密文，把解出的明文追加到 `plaintext`；
//! - [`TlsSession::drain_records`]：取出会话待发送的全部记录；
//! - [`TlsSession::encrypt`]：接受至多 `data.len()` 字节明文，返回实际接受的字节数；
//! - 握手开始（包括重协商）必须经由构造时拿到的 [`HandshakeObserver`] 报告。

use std::{
    io::{Read, Write},
    sync::Arc,
};

use bytes::{Buf, BytesMut};
use rustls::{ClientConfig, ClientConnection, Connection, ServerConfig, ServerConnection};
use rustls_pki_types::ServerName;
use spark_sockio::SendQueue;

use crate::{cert::PeerTrust, error::TlsHookError, registry::HandshakeObserver};

/// TLS Hook 驱动的加密会话。
pub trait TlsSession {
    fn feed(&mut self, input: &mut BytesMut, plaintext: &mut BytesMut) -> Result<(), TlsHookError>;

    fn drain_records(&mut self, output: &mut SendQueue) -> Result<(), TlsHookError>;

    fn encrypt(&mut self, data: &[u8]) -> Result<usize, TlsHookError>;

    fn wants_write(&self) -> bool;

    fn is_handshaking(&self) -> bool;

    /// 对端已发送 `close_notify`。
    fn peer_closed(&self) -> bool;

    fn send_close_notify(&mut self);

    /// 对端证书链（叶子在前），DER 编码。
    fn peer_certificates(&self) -> Vec<Vec<u8>>;

    fn peer_trust(&self) -> PeerTrust;

    /// 服务端：客户端请求的 SNI；客户端：连接时使用的服务器名。
    fn server_name(&self) -> Option<String>;

    fn alpn_protocol(&self) -> Option<Vec<u8>>;
}

/// 基于 `rustls::Connection` 的会话实现。
///
/// rustls 不支持重协商：TLS 1.3 没有该机制，TLS 1.2 的重协商请求会被以 `no_renegotiation`
/// 告警拒绝，因此本实现只会报告一次握手开始。
pub struct RustlsSession {
    conn: Connection,
    observer: HandshakeObserver,
    requested_name: Option<String>,
    started: bool,
    peer_closed: bool,
}

impl RustlsSession {
    pub fn server(config: Arc<ServerConfig>, observer: HandshakeObserver) -> Result<Self, TlsHookError> {
        let conn = ServerConnection::new(config)?;
        Ok(Self {
            conn: conn.into(),
            observer,
            requested_name: None,
            started: false,
            peer_closed: false,
        })
    }

    pub fn client(
        config: Arc<ClientConfig>,
        server_name: &str,
        observer: HandshakeObserver,
    ) -> Result<Self, TlsHookError> {
        let name = ServerName::try_from(server_name.to_owned())
            .map_err(|_| TlsHookError::InvalidServerName(server_name.to_owned()))?;
        let conn = ClientConnection::new(config, name)?;
        Ok(Self {
            conn: conn.into(),
            observer,
            requested_name: Some(server_name.to_owned()),
            started: false,
            peer_closed: false,
        })
    }

    fn note_start(&mut self) {
        if !self.started && self.conn.is_handshaking() {
            self.started = true;
            self.observer.handshake_started();
        }
    }
}

impl TlsSession for RustlsSession {
    fn feed(&mut self, input: &mut BytesMut, plaintext: &mut BytesMut) -> Result<(), TlsHookError> {
        self.note_start();
        while !input.is_empty() && !self.peer_closed {
            let mut reader: &[u8] = &input[..];
            let read = self.conn.read_tls(&mut reader)?;
            input.advance(read);

            let state = self.conn.process_new_packets()?;
            let pending = state.plaintext_bytes_to_read();
            if pending > 0 {
                let start = plaintext.len();
                plaintext.resize(start + pending, 0);
                self.conn.reader().read_exact(&mut plaintext[start..])?;
            }
            if state.peer_has_closed() {
                self.peer_closed = true;
            }
            if read == 0 {
                break;
            }
        }
        Ok(())
    }

    fn drain_records(&mut self, output: &mut SendQueue) -> Result<(), TlsHookError> {
        self.note_start();
        while self.conn.wants_write() {
            let mut records = Vec::new();
            let written = self.conn.write_tls(&mut records)?;
            if written == 0 {
                break;
            }
            output.push_back(records);
        }
        Ok(())
    }

    fn encrypt(&mut self, data: &[u8]) -> Result<usize, TlsHookError> {
        Ok(self.conn.writer().write(data)?)
    }

    fn wants_write(&self) -> bool {
        self.conn.wants_write()
    }

    fn is_handshaking(&self) -> bool {
        self.conn.is_handshaking()
    }

    fn peer_closed(&self) -> bool {
        self.peer_closed
    }

    fn send_close_notify(&mut self) {
        self.conn.send_close_notify();
    }

    fn peer_certificates(&self) -> Vec<Vec<u8>> {
        self.conn
            .peer_certificates()
            .map(|chain| chain.iter().map(|der| der.as_ref().to_vec()).collect())
            .unwrap_or_default()
    }

    fn peer_trust(&self) -> PeerTrust {
        // rustls 只在校验器接受证书链后才完成握手。
        if !self.conn.is_handshaking() && self.conn.peer_certificates().is_some() {
            PeerTrust::Verified
        } else {
            PeerTrust::Unverified
        }
    }

    fn server_name(&self) -> Option<String> {
        match &self.conn {
            Connection::Server(server) => server.server_name().map(str::to_owned),
            Connection::Client(_) => self.requested_name.clone(),
        }
    }

    fn alpn_protocol(&self) -> Option<Vec<u8>> {
        self.conn.alpn_protocol().map(<[u8]>::to_vec)
    }
}
