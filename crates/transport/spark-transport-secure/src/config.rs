use std::{
    borrow::Cow,
    fs, io,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 对端证书校验级别。
///
/// - `Ignore`（0）：校验失败只记录日志，连接以“未验证”状态继续；
/// - `Request`（1）：服务端请求但不强制客户端证书，提供的证书仍须通过校验；
/// - `Require`（2）：必须提供并通过校验。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum VerifyPeer {
    Ignore,
    Request,
    #[default]
    Require,
}

impl VerifyPeer {
    pub fn level(self) -> u8 {
        u8::from(self)
    }
}

impl TryFrom<u8> for VerifyPeer {
    type Error = ConfigError;

    fn try_from(level: u8) -> Result<Self, Self::Error> {
        match level {
            0 => Ok(Self::Ignore),
            1 => Ok(Self::Request),
            2 => Ok(Self::Require),
            other => Err(ConfigError::Invalid(Cow::Owned(format!(
                "verify-peer must be 0, 1 or 2 (got {other})"
            )))),
        }
    }
}

impl From<VerifyPeer> for u8 {
    fn from(value: VerifyPeer) -> Self {
        match value {
            VerifyPeer::Ignore => 0,
            VerifyPeer::Request => 1,
            VerifyPeer::Require => 2,
        }
    }
}

/// 配置加载错误。
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read secure transport configuration `{}`: {source}", path.display())]
    Io { path: PathBuf, source: io::Error },
    #[error("failed to parse secure transport configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to render secure transport configuration: {0}")]
    Render(#[from] toml::ser::Error),
    #[error("invalid secure transport configuration: {0}")]
    Invalid(Cow<'static, str>),
}

/// 安全引擎的校验策略与追踪配置。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 把“校验级别、证书名检查、吊销检查、SNI、追踪级别”等旋钮集中为一份只读快照，
///   进程内所有收发器共享，建立后不再修改；
/// - 以 TOML 作为外部表示，键名使用 kebab-case，便于运维直接编写。
///
/// ## 契约（What）
/// - 缺省值：`verify-peer = 2`、`check-cert-name = false`、`revocation-check = 0`、
///   `server-name-indication = true`、`verify-depth-max = 3`、`trace-category = "Security"`；
/// - `verify-depth-max = 0` 表示不限制证书链长度；
/// - 未知键会被拒绝，避免拼写错误悄悄失效。
///
/// ## 风险与权衡（Trade-offs）
/// - 证书/私钥仅以路径形式出现，实际加载由具体引擎负责；
/// - `validate` 只检查组合约束，不访问文件系统。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct SecureEngineConfig {
    verify_peer: VerifyPeer,
    check_cert_name: bool,
    revocation_check: u32,
    revocation_check_cache_only: bool,
    server_name_indication: bool,
    verify_depth_max: u32,
    trace_level: u8,
    security_trace_level: u8,
    trace_category: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    certificate_authorities: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cert_file: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    key_file: Option<PathBuf>,
}

impl Default for SecureEngineConfig {
    fn default() -> Self {
        Self {
            verify_peer: VerifyPeer::Require,
            check_cert_name: false,
            revocation_check: 0,
            revocation_check_cache_only: false,
            server_name_indication: true,
            verify_depth_max: 3,
            trace_level: 0,
            security_trace_level: 0,
            trace_category: String::from("Security"),
            certificate_authorities: None,
            cert_file: None,
            key_file: None,
        }
    }
}

impl SecureEngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// 从 TOML 文本解析并校验。
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// 从文件加载并校验。
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let source = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&source)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string(self)?)
    }

    /// 检查字段之间的组合约束。
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.key_file.is_some() != self.cert_file.is_some() {
            return Err(ConfigError::Invalid(Cow::Borrowed(
                "cert-file and key-file must be configured together",
            )));
        }
        if self.revocation_check_cache_only && self.revocation_check == 0 {
            return Err(ConfigError::Invalid(Cow::Borrowed(
                "revocation-check-cache-only requires revocation-check > 0",
            )));
        }
        if self.trace_category.trim().is_empty() {
            return Err(ConfigError::Invalid(Cow::Borrowed(
                "trace-category must not be empty",
            )));
        }
        Ok(())
    }

    pub fn verify_peer(&self) -> VerifyPeer {
        self.verify_peer
    }

    pub fn check_cert_name(&self) -> bool {
        self.check_cert_name
    }

    pub fn revocation_check(&self) -> u32 {
        self.revocation_check
    }

    pub fn revocation_check_cache_only(&self) -> bool {
        self.revocation_check_cache_only
    }

    pub fn server_name_indication(&self) -> bool {
        self.server_name_indication
    }

    pub fn verify_depth_max(&self) -> u32 {
        self.verify_depth_max
    }

    pub fn trace_level(&self) -> u8 {
        self.trace_level
    }

    pub fn security_trace_level(&self) -> u8 {
        self.security_trace_level
    }

    pub fn trace_category(&self) -> &str {
        &self.trace_category
    }

    pub fn certificate_authorities(&self) -> Option<&Path> {
        self.certificate_authorities.as_deref()
    }

    pub fn cert_file(&self) -> Option<&Path> {
        self.cert_file.as_deref()
    }

    pub fn key_file(&self) -> Option<&Path> {
        self.key_file.as_deref()
    }

    pub fn with_verify_peer(mut self, verify_peer: VerifyPeer) -> Self {
        self.verify_peer = verify_peer;
        self
    }

    pub fn with_check_cert_name(mut self, enabled: bool) -> Self {
        self.check_cert_name = enabled;
        self
    }

    pub fn with_revocation_check(mut self, level: u32, cache_only: bool) -> Self {
        self.revocation_check = level;
        self.revocation_check_cache_only = cache_only;
        self
    }

    pub fn with_server_name_indication(mut self, enabled: bool) -> Self {
        self.server_name_indication = enabled;
        self
    }

    pub fn with_verify_depth_max(mut self, depth: u32) -> Self {
        self.verify_depth_max = depth;
        self
    }

    pub fn with_trace_level(mut self, level: u8) -> Self {
        self.trace_level = level;
        self
    }

    pub fn with_security_trace_level(mut self, level: u8) -> Self {
        self.security_trace_level = level;
        self
    }

    pub fn with_trace_category(mut self, category: impl Into<String>) -> Self {
        self.trace_category = category.into();
        self
    }

    pub fn with_certificate_authorities(mut self, path: impl Into<PathBuf>) -> Self {
        self.certificate_authorities = Some(path.into());
        self
    }

    pub fn with_identity_files(
        mut self,
        cert_file: impl Into<PathBuf>,
        key_file: impl Into<PathBuf>,
    ) -> Self {
        self.cert_file = Some(cert_file.into());
        self.key_file = Some(key_file.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_documented_values() {
        let config = SecureEngineConfig::from_toml_str("").expect("empty config parses");
        assert_eq!(config.verify_peer(), VerifyPeer::Require);
        assert!(!config.check_cert_name());
        assert!(config.server_name_indication());
        assert_eq!(config.verify_depth_max(), 3);
        assert_eq!(config.trace_category(), "Security");
    }

    #[test]
    fn parses_kebab_case_keys() {
        let config = SecureEngineConfig::from_toml_str(
            r#"
            verify-peer = 1
            check-cert-name = true
            revocation-check = 1
            revocation-check-cache-only = true
            trace-level = 2
            "#,
        )
        .expect("config parses");
        assert_eq!(config.verify_peer(), VerifyPeer::Request);
        assert!(config.check_cert_name());
        assert_eq!(config.revocation_check(), 1);
        assert!(config.revocation_check_cache_only());
        assert_eq!(config.trace_level(), 2);
    }

    #[test]
    fn rejects_out_of_range_verify_peer() {
        let err = SecureEngineConfig::from_toml_str("verify-peer = 3").unwrap_err();
        assert!(err.to_string().contains("verify-peer"), "{err}");
    }

    #[test]
    fn rejects_unknown_keys() {
        assert!(matches!(
            SecureEngineConfig::from_toml_str("verify-pear = 1"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn rejects_key_without_certificate() {
        let err = SecureEngineConfig::from_toml_str(r#"key-file = "server.key""#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn toml_rendering_parses_back() {
        let config = SecureEngineConfig::new()
            .with_verify_peer(VerifyPeer::Ignore)
            .with_identity_files("server.pem", "server.key");
        let rendered = config.to_toml_string().expect("renders");
        assert_eq!(
            SecureEngineConfig::from_toml_str(&rendered).expect("parses back"),
            config
        );
    }
}
