use std::env;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::de::DeserializeOwned;
use serde::Deserialize;

/// Gateway configuration, with compiled-in defaults for every field so the
/// binary runs without a config file.
#[derive(Debug, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub upstream: Upstream,
    #[serde(default)]
    pub listen: Listen,
    #[serde(default)]
    pub session: SessionService,
    #[serde(default)]
    pub capture: Capture,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            upstream: Upstream::default(),
            listen: Listen::default(),
            session: SessionService::default(),
            capture: Capture::default(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct Upstream {
    #[serde(default = "default_upstream_host")]
    pub host: String,
    #[serde(default = "default_upstream_port")]
    pub port: u16,
}

impl Default for Upstream {
    fn default() -> Self {
        Self {
            host: default_upstream_host(),
            port: default_upstream_port(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct Listen {
    #[serde(default = "default_proxy_listen")]
    pub proxy: String,
    #[serde(default = "default_session_listen")]
    pub session: String,
}

impl Default for Listen {
    fn default() -> Self {
        Self {
            proxy: default_proxy_listen(),
            session: default_session_listen(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SessionService {
    #[serde(default = "default_join_url")]
    pub join_url: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for SessionService {
    fn default() -> Self {
        Self {
            join_url: default_join_url(),
            user_agent: default_user_agent(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct Capture {
    #[serde(default = "default_capture_dir")]
    pub dir: PathBuf,
}

impl Default for Capture {
    fn default() -> Self {
        Self {
            dir: default_capture_dir(),
        }
    }
}

fn default_upstream_host() -> String {
    "2b2t.org".to_string()
}

fn default_upstream_port() -> u16 {
    25565
}

fn default_proxy_listen() -> String {
    "0.0.0.0:25565".to_string()
}

fn default_session_listen() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_join_url() -> String {
    "https://sessionserver.mojang.com/session/minecraft/join".to_string()
}

fn default_user_agent() -> String {
    "Java/1.6.0_27".to_string()
}

fn default_capture_dir() -> PathBuf {
    PathBuf::from("saved")
}

const CONFIG_FILE: &str = "gateway.toml";

impl GatewayConfig {
    /// Loads `gateway.toml` if one can be found, defaults otherwise.
    pub fn load() -> anyhow::Result<Self> {
        match ConfigLoader::resolve_path(CONFIG_FILE) {
            Some(path) => ConfigLoader::parse_from_path(&path),
            None => Ok(Self::default()),
        }
    }
}

/// Minimal config loader for the gateway binary.
///
/// Search order:
/// 1) `MCGATE_CONFIG_DIR/<relative_path>`
/// 2) `./<relative_path>`
/// 3) `<crate_root>/../config/<relative_path>` (repo-local convenience)
pub struct ConfigLoader;

impl ConfigLoader {
    pub fn parse_from_path<T: DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config at {}", path.display()))?;
        Self::parse_from_string(text)
    }

    pub fn parse_from_string<T: DeserializeOwned>(text: String) -> anyhow::Result<T> {
        toml::from_str(&text).with_context(|| "Failed to parse TOML")
    }

    fn resolve_path(relative_path: &str) -> Option<PathBuf> {
        let rel = Path::new(relative_path);

        if let Some(root) = env::var_os("MCGATE_CONFIG_DIR") {
            let candidate = PathBuf::from(root).join(rel);
            if candidate.is_file() {
                return Some(candidate);
            }
        }

        if let Ok(cwd) = env::current_dir() {
            let candidate = cwd.join(rel);
            if candidate.is_file() {
                return Some(candidate);
            }
        }

        // Repo convenience: <repo_root>/config/<relative_path>.
        // This crate typically lives at <repo_root>/crates/gateway.
        let candidate = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .ancestors()
            .nth(2)?
            .join("config")
            .join(rel);
        if candidate.is_file() {
            return Some(candidate);
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_compiled_in_values() {
        let config = GatewayConfig::default();
        assert_eq!(config.upstream.host, "2b2t.org");
        assert_eq!(config.upstream.port, 25565);
        assert_eq!(config.listen.proxy, "0.0.0.0:25565");
        assert_eq!(config.listen.session, "127.0.0.1:8080");
        assert_eq!(
            config.session.join_url,
            "https://sessionserver.mojang.com/session/minecraft/join"
        );
        assert_eq!(config.capture.dir, PathBuf::from("saved"));
    }

    #[test]
    fn partial_toml_fills_the_rest_with_defaults() {
        let text = r#"
[upstream]
host = "mc.example.net"

[listen]
session = "127.0.0.1:9090"
"#;
        let config: GatewayConfig = ConfigLoader::parse_from_string(text.to_string()).unwrap();
        assert_eq!(config.upstream.host, "mc.example.net");
        assert_eq!(config.upstream.port, 25565);
        assert_eq!(config.listen.proxy, "0.0.0.0:25565");
        assert_eq!(config.listen.session, "127.0.0.1:9090");
    }
}
