use std::sync::Arc;

use rustls_pki_types::CertificateDer;

use crate::{delegate::TransportInfo, trust::TrustError};

/// 安全连接的信息快照，由 [`Transceiver::info`](crate::Transceiver::info) 生成。
///
/// - `host`：出站连接为目标主机名，入站连接为空；
/// - `certs`：对端证书链（叶证书在前），握手完成后才会填充，每张证书独立持有；
/// - `verified == (trust_error == Some(TrustError::NoError))`；
/// - `trust_error` 为 `None` 表示尚未执行信任评估。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SecureConnectionInfo {
    pub underlying: TransportInfo,
    pub incoming: bool,
    pub adapter_name: String,
    pub host: String,
    pub cipher: String,
    pub certs: Vec<Arc<CertificateDer<'static>>>,
    pub verified: bool,
    pub trust_error: Option<TrustError>,
}

impl SecureConnectionInfo {
    /// 叶证书（对端自身证书）。
    pub fn peer_certificate(&self) -> Option<&CertificateDer<'static>> {
        self.certs.first().map(Arc::as_ref)
    }
}
