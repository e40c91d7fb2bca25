use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

/// Application-level constants
pub const APP_NAME: &str = "PathoLens";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default HTTP port (overridable via `PORT`).
pub const DEFAULT_PORT: u16 = 8000;

/// Maximum accepted upload body (50 MB, multipart overhead included).
pub const MAX_UPLOAD_BYTES: usize = 50 * 1024 * 1024;

const ENV_PORT: &str = "PORT";
const ENV_HOST: &str = "PATHOLENS_HOST";
const ENV_MODELS_DIR: &str = "PATHOLENS_MODELS_DIR";
const ENV_BACKEND: &str = "PATHOLENS_BACKEND";

/// Default tracing filter when `RUST_LOG` is unset.
pub fn default_log_filter() -> &'static str {
    "patholens=info,tower_http=warn"
}

/// Get the application data directory.
/// ~/PathoLens/ on all platforms, falling back to the working directory
/// when no home directory can be resolved (containers, service accounts).
pub fn app_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_NAME)
}

/// Get the models directory (ONNX encoders, tokenizers).
pub fn models_dir() -> PathBuf {
    app_data_dir().join("models")
}

/// Which inference backend the registry instantiates engines with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// ONNX Runtime encoders read from the models directory.
    Onnx,
    /// Deterministic in-process model, no artifacts required.
    Mock,
}

impl Backend {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "onnx" => Some(Self::Onnx),
            "mock" => Some(Self::Mock),
            _ => None,
        }
    }

    /// Backend used when nothing is configured.
    pub fn default_for_build() -> Self {
        if cfg!(feature = "onnx") {
            Self::Onnx
        } else {
            Self::Mock
        }
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Onnx => write!(f, "onnx"),
            Self::Mock => write!(f, "mock"),
        }
    }
}

/// Runtime configuration for the HTTP service.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: IpAddr,
    pub port: u16,
    pub models_dir: PathBuf,
    pub backend: Backend,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            models_dir: models_dir(),
            backend: Backend::default_for_build(),
        }
    }
}

impl ServerConfig {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    /// Build configuration from process environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup.
    ///
    /// Unparseable values are ignored (with a warning) and the default kept.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(raw) = lookup(ENV_PORT) {
            match raw.trim().parse::<u16>() {
                Ok(port) => config.port = port,
                Err(_) => tracing::warn!(value = %raw, "Ignoring invalid {ENV_PORT}"),
            }
        }

        if let Some(raw) = lookup(ENV_HOST) {
            match raw.trim().parse::<IpAddr>() {
                Ok(host) => config.host = host,
                Err(_) => tracing::warn!(value = %raw, "Ignoring invalid {ENV_HOST}"),
            }
        }

        if let Some(raw) = lookup(ENV_MODELS_DIR) {
            if !raw.trim().is_empty() {
                config.models_dir = PathBuf::from(raw.trim());
            }
        }

        if let Some(raw) = lookup(ENV_BACKEND) {
            match Backend::parse(&raw) {
                Some(backend) => config.backend = backend,
                None => tracing::warn!(value = %raw, "Ignoring invalid {ENV_BACKEND}"),
            }
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn models_dir_under_app_data() {
        let models = models_dir();
        assert!(models.starts_with(app_data_dir()));
        assert!(models.ends_with("models"));
    }

    #[test]
    fn app_name_is_patholens() {
        assert_eq!(APP_NAME, "PathoLens");
    }

    #[test]
    fn app_version_matches_cargo() {
        assert_eq!(APP_VERSION, "0.3.0");
    }

    #[test]
    fn empty_environment_uses_defaults() {
        let config = ServerConfig::from_lookup(lookup_from(&[]));
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.host, IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        assert_eq!(config.backend, Backend::default_for_build());
    }

    #[test]
    fn environment_overrides_apply() {
        let config = ServerConfig::from_lookup(lookup_from(&[
            ("PORT", "9100"),
            ("PATHOLENS_HOST", "127.0.0.1"),
            ("PATHOLENS_MODELS_DIR", "/srv/models"),
            ("PATHOLENS_BACKEND", "mock"),
        ]));
        assert_eq!(config.port, 9100);
        assert_eq!(config.host, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(config.models_dir, PathBuf::from("/srv/models"));
        assert_eq!(config.backend, Backend::Mock);
    }

    #[test]
    fn explicit_onnx_request_is_kept() {
        let config = ServerConfig::from_lookup(lookup_from(&[("PATHOLENS_BACKEND", "onnx")]));
        assert_eq!(config.backend, Backend::Onnx);
    }

    #[test]
    fn invalid_values_keep_defaults() {
        let config = ServerConfig::from_lookup(lookup_from(&[
            ("PORT", "not-a-port"),
            ("PATHOLENS_HOST", "nowhere"),
            ("PATHOLENS_BACKEND", "cuda"),
        ]));
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.host, IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        assert_eq!(config.backend, Backend::default_for_build());
    }

    #[test]
    fn socket_addr_combines_host_and_port() {
        let config = ServerConfig::from_lookup(lookup_from(&[
            ("PORT", "8123"),
            ("PATHOLENS_HOST", "127.0.0.1"),
        ]));
        assert_eq!(config.socket_addr().to_string(), "127.0.0.1:8123");
        assert_eq!(Backend::Mock.to_string(), "mock");
    }

    #[test]
    fn default_log_filter_targets_crate() {
        assert!(default_log_filter().starts_with("patholens="));
    }
}
