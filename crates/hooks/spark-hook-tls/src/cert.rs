//! 对端证书摘要。
//!
//! 握手完成时同步生成一次，此后不可变；供审计日志与访问控制读取。

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use x509_parser::prelude::{FromDer, X509Certificate};

/// 加密会话对对端证书链的信任结论。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum PeerTrust {
    /// 证书链已由会话的校验器接受。
    Verified,
    /// 会话未校验或校验器未给出结论。
    Unverified,
    /// 证书已被吊销。
    Revoked,
}

/// 对端叶子证书的摘要。
///
/// # 契约（What）
/// - `subject` / `issuer`：RFC 4514 风格的可分辨名称；
/// - `sha256_fingerprint` / `sha1_fingerprint`：DER 编码的小写十六进制摘要；
/// - `trusted`：证书链已被校验器接受；`self_signed`：主体与签发者相同；
/// - `expired` / `not_yet_valid`：以生成摘要时的墙钟对比有效期；
/// - `invalid`：证书无法解析，或当前时刻不在有效期内；
/// - `error`：解析失败时的原因。
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CertificateSummary {
    pub subject: String,
    pub issuer: String,
    pub sha256_fingerprint: String,
    pub sha1_fingerprint: String,
    pub trusted: bool,
    pub self_signed: bool,
    pub invalid: bool,
    pub revoked: bool,
    pub expired: bool,
    pub not_yet_valid: bool,
    pub activation: Option<SystemTime>,
    pub expiration: Option<SystemTime>,
    pub error: Option<String>,
}

impl CertificateSummary {
    /// 由 DER 编码的叶子证书生成摘要。
    pub fn from_der(der: &[u8], trust: PeerTrust, now: SystemTime) -> Self {
        let mut summary = CertificateSummary {
            subject: String::new(),
            issuer: String::new(),
            sha256_fingerprint: hex::encode(Sha256::digest(der)),
            sha1_fingerprint: hex::encode(Sha1::digest(der)),
            trusted: trust == PeerTrust::Verified,
            self_signed: false,
            invalid: false,
            revoked: trust == PeerTrust::Revoked,
            expired: false,
            not_yet_valid: false,
            activation: None,
            expiration: None,
            error: None,
        };

        let cert = match X509Certificate::from_der(der) {
            Ok((_, cert)) => cert,
            Err(err) => {
                summary.invalid = true;
                summary.trusted = false;
                summary.error = Some(err.to_string());
                return summary;
            }
        };

        summary.subject = cert.subject().to_string();
        summary.issuer = cert.issuer().to_string();
        summary.self_signed = cert.subject().as_raw() == cert.issuer().as_raw();

        let not_before = cert.validity().not_before.timestamp();
        let not_after = cert.validity().not_after.timestamp();
        summary.activation = Some(unix_to_system(not_before));
        summary.expiration = Some(unix_to_system(not_after));

        let now = system_to_unix(now);
        summary.not_yet_valid = now < not_before;
        summary.expired = now > not_after;
        summary.invalid = summary.expired || summary.not_yet_valid;
        summary
    }

    /// 证书可被信任且处于有效期内。
    pub fn is_acceptable(&self) -> bool {
        self.trusted && !self.invalid && !self.revoked
    }
}

fn unix_to_system(seconds: i64) -> SystemTime {
    if seconds >= 0 {
        UNIX_EPOCH + Duration::from_secs(seconds.unsigned_abs())
    } else {
        UNIX_EPOCH - Duration::from_secs(seconds.unsigned_abs())
    }
}

fn system_to_unix(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(after) => i64::try_from(after.as_secs()).unwrap_or(i64::MAX),
        Err(before) => i64::try_from(before.duration().as_secs()).map_or(i64::MIN, |secs| -secs),
    }
}
