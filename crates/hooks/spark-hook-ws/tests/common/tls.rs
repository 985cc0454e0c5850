//! WebSocket-over-TLS 测试所需的自签名证书与 rustls 配置。

use std::sync::{Arc, Once};

use anyhow::Context;
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use rustls::{
    ClientConfig, RootCertStore, ServerConfig,
    pki_types::{CertificateDer, PrivateKeyDer},
};

pub fn ensure_crypto_provider() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    });
}

/// 生成 `localhost` 自签名证书，返回服务端配置与仅信任该证书的客户端配置。
pub fn config_pair() -> anyhow::Result<(Arc<ServerConfig>, Arc<ClientConfig>)> {
    ensure_crypto_provider();
    let mut params =
        CertificateParams::new(vec!["localhost".to_string()]).context("构造证书参数失败")?;
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "localhost");
    params.distinguished_name = dn;
    let key_pair = KeyPair::generate().context("生成证书私钥失败")?;
    let certificate = params.self_signed(&key_pair).context("签发自签名证书失败")?;
    let cert_der = CertificateDer::from(certificate.der().to_vec());

    let private_key = PrivateKeyDer::try_from(key_pair.serialize_der())
        .map_err(|err| anyhow::anyhow!("解析私钥失败: {err}"))?;
    let server = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert_der.clone()], private_key)
        .context("构建服务端 TLS 配置失败")?;

    let mut roots = RootCertStore::empty();
    roots.add(cert_der).context("将证书写入 Root Store 失败")?;
    let client = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok((Arc::new(server), Arc::new(client)))
}
