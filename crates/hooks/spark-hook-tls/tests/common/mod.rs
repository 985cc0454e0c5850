//! TLS 集成测试共用的证书与套接字泵辅助函数。

#![allow(dead_code)]

use std::sync::{Arc, Once};

use anyhow::Context;
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use rustls::{
    ClientConfig, RootCertStore, ServerConfig,
    pki_types::{CertificateDer, PrivateKeyDer},
};
use spark_sockio::{
    SocketConfig, StreamSocket, Token,
    test_stubs::{MemoryDescriptor, MemoryPeer, RecordingReactor},
};

/// 确保 AWS-LC 作为 rustls 的进程级加密后端，可被多次调用。
pub fn ensure_crypto_provider() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        // 其它测试可能已经安装过，重复安装的错误可以忽略。
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    });
}

/// 生成自签名服务端配置，并返回证书 DER 以供客户端信任。
pub fn generate_server_config(common_name: &str) -> anyhow::Result<(Arc<ServerConfig>, Vec<u8>)> {
    ensure_crypto_provider();

    let mut params =
        CertificateParams::new(vec![common_name.to_string()]).context("构造证书参数失败")?;
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    params.distinguished_name = dn;

    let key_pair = KeyPair::generate().context("生成证书私钥失败")?;
    let certificate = params.self_signed(&key_pair).context("签发自签名证书失败")?;
    let cert_der = certificate.der().to_vec();

    let private_key = PrivateKeyDer::try_from(key_pair.serialize_der())
        .map_err(|err| anyhow::anyhow!("解析私钥失败: {err}"))?;
    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![CertificateDer::from(cert_der.clone())], private_key)
        .context("构建服务端 TLS 配置失败")?;
    Ok((Arc::new(config), cert_der))
}

/// 构造仅信任指定证书的客户端配置；`None` 表示不信任任何证书。
pub fn build_client_config(certificate: Option<&[u8]>) -> anyhow::Result<Arc<ClientConfig>> {
    ensure_crypto_provider();
    let mut roots = RootCertStore::empty();
    if let Some(der) = certificate {
        roots
            .add(CertificateDer::from(der.to_vec()))
            .context("将证书写入 Root Store 失败")?;
    }
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

pub struct Endpoint {
    pub socket: StreamSocket,
    pub peer: MemoryPeer,
}

pub fn endpoint(token: usize) -> Endpoint {
    let (fd, peer) = MemoryDescriptor::pair();
    Endpoint {
        socket: StreamSocket::new(Token(token), fd, SocketConfig::default()),
        peer,
    }
}

/// 在两个端点之间搬运线路字节，直到双方都没有新输出。
pub fn pump(a: &mut Endpoint, b: &mut Endpoint, reactor: &mut RecordingReactor) {
    for _ in 0..64 {
        a.socket.do_write(reactor);
        b.socket.do_write(reactor);
        let a_to_b = a.peer.take_output();
        let b_to_a = b.peer.take_output();
        if a_to_b.is_empty() && b_to_a.is_empty() {
            return;
        }
        if !a_to_b.is_empty() {
            b.peer.feed(&a_to_b);
            drain_input(b, reactor);
        }
        if !b_to_a.is_empty() {
            a.peer.feed(&b_to_a);
            drain_input(a, reactor);
        }
    }
}

fn drain_input(end: &mut Endpoint, reactor: &mut RecordingReactor) {
    while end.peer.pending_input() > 0 && end.socket.error().is_none() {
        end.socket.do_read(reactor);
    }
}
