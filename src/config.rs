use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

pub const CUSTOM_TOKEN_HEADER: &str = "x-zai-token";
pub const DEFAULT_SIGNING_SECRET: &str = "junjie";

/// How `<details>` markers in the thinking channel are presented to callers.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ThinkTagsMode {
    #[default]
    Strip,
    Think,
    Raw,
}

impl ThinkTagsMode {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "think" => ThinkTagsMode::Think,
            "raw" => ThinkTagsMode::Raw,
            "strip" => ThinkTagsMode::Strip,
            other => {
                tracing::warn!(value = other, "unknown THINK_TAGS_MODE, using strip");
                ThinkTagsMode::Strip
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub listen: String,
    pub upstream_url: String,
    pub origin_base: String,
    pub api_key: String,
    pub static_token: Option<String>,
    pub model_name: String,
    pub debug_mode: bool,
    pub default_stream: bool,
    pub dashboard_enabled: bool,
    pub enable_thinking: bool,
    pub think_tags_mode: ThinkTagsMode,
    pub signing_secret: Option<String>,
    pub register_enabled: bool,
    pub register_db_path: String,
    pub anon_token_enabled: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl GatewayConfig {
    /// Reads the process environment, falling back to values from `.env.local`
    /// and then `.env`. Variables set in the environment always win.
    pub fn from_env() -> Self {
        let mut file_values: HashMap<String, String> = HashMap::new();
        for path in [".env.local", ".env"] {
            for (key, value) in read_env_file(Path::new(path)) {
                file_values.entry(key).or_insert(value);
            }
        }
        Self::from_lookup(|key| {
            std::env::var(key)
                .ok()
                .filter(|v| !v.is_empty())
                .or_else(|| file_values.get(key).cloned())
        })
    }

    pub fn from_map(values: &HashMap<String, String>) -> Self {
        Self::from_lookup(|key| values.get(key).cloned())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let get_or = |key: &str, default: &str| get(key).unwrap_or_else(|| default.to_string());
        let flag = |key: &str, default: bool| match get(key) {
            Some(v) => v == "true",
            None => default,
        };

        let origin_base = get_or("ORIGIN_BASE", "https://chat.z.ai")
            .trim_end_matches('/')
            .to_string();
        let upstream_url = get("UPSTREAM_URL")
            .unwrap_or_else(|| format!("{origin_base}/api/chat/completions"));
        let port = get_or("PORT", "9090");
        let register_enabled = match get("REGISTER_ENABLED") {
            Some(v) => v == "true" || v == "1",
            None => true,
        };

        Self {
            listen: listen_address(&port),
            upstream_url,
            origin_base,
            api_key: get_or("DEFAULT_KEY", "sk-your-key"),
            static_token: get("ZAI_TOKEN"),
            model_name: get_or("MODEL_NAME", "GLM-4.6"),
            debug_mode: flag("DEBUG_MODE", true),
            default_stream: flag("DEFAULT_STREAM", true),
            dashboard_enabled: flag("DASHBOARD_ENABLED", true),
            enable_thinking: flag("ENABLE_THINKING", false),
            think_tags_mode: get("THINK_TAGS_MODE")
                .map(|v| ThinkTagsMode::parse(&v))
                .unwrap_or_default(),
            signing_secret: get("ZAI_SIGNING_SECRET"),
            register_enabled,
            register_db_path: get_or("REGISTER_DB_PATH", "./data/zai2api.db"),
            anon_token_enabled: flag("ANON_TOKEN_ENABLED", true),
        }
    }

    pub fn signing_secret(&self) -> &str {
        self.signing_secret
            .as_deref()
            .unwrap_or(DEFAULT_SIGNING_SECRET)
    }

    pub fn anonymous_auth_url(&self) -> String {
        format!("{}/api/v1/auths/", self.origin_base)
    }

    pub fn models_url(&self) -> String {
        format!("{}/api/models", self.origin_base)
    }

    pub fn host(&self) -> &str {
        self.origin_base
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(&self.origin_base)
    }
}

fn listen_address(port: &str) -> String {
    let port = port.trim();
    match port.strip_prefix(':') {
        Some(bare) => format!("0.0.0.0:{bare}"),
        None if port.contains(':') => port.to_string(),
        None => format!("0.0.0.0:{port}"),
    }
}

/// Reads `KEY=VALUE` pairs from a dotenv-style file. A missing file yields nothing.
pub fn read_env_file(path: &Path) -> Vec<(String, String)> {
    match std::fs::read_to_string(path) {
        Ok(content) => parse_env_lines(&content),
        Err(_) => Vec::new(),
    }
}

fn parse_env_lines(content: &str) -> Vec<(String, String)> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with(pairs: &[(&str, &str)]) -> GatewayConfig {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        GatewayConfig::from_map(&map)
    }

    #[test]
    fn defaults_target_public_endpoint() {
        let cfg = GatewayConfig::default();
        assert_eq!(cfg.listen, "0.0.0.0:9090");
        assert_eq!(cfg.upstream_url, "https://chat.z.ai/api/chat/completions");
        assert_eq!(cfg.model_name, "GLM-4.6");
        assert_eq!(cfg.api_key, "sk-your-key");
        assert!(cfg.default_stream);
        assert!(!cfg.enable_thinking);
        assert_eq!(cfg.think_tags_mode, ThinkTagsMode::Strip);
        assert_eq!(cfg.signing_secret(), DEFAULT_SIGNING_SECRET);
        assert!(cfg.static_token.is_none());
    }

    #[test]
    fn port_with_leading_colon_is_tolerated() {
        assert_eq!(config_with(&[("PORT", ":8081")]).listen, "0.0.0.0:8081");
        assert_eq!(
            config_with(&[("PORT", "127.0.0.1:7000")]).listen,
            "127.0.0.1:7000"
        );
    }

    #[test]
    fn origin_base_drives_derived_urls() {
        let cfg = config_with(&[("ORIGIN_BASE", "http://127.0.0.1:4000/")]);
        assert_eq!(cfg.upstream_url, "http://127.0.0.1:4000/api/chat/completions");
        assert_eq!(cfg.anonymous_auth_url(), "http://127.0.0.1:4000/api/v1/auths/");
        assert_eq!(cfg.models_url(), "http://127.0.0.1:4000/api/models");
        assert_eq!(cfg.host(), "127.0.0.1:4000");
    }

    #[test]
    fn register_flag_accepts_numeric_true() {
        assert!(config_with(&[("REGISTER_ENABLED", "1")]).register_enabled);
        assert!(!config_with(&[("REGISTER_ENABLED", "no")]).register_enabled);
    }

    #[test]
    fn unknown_think_mode_falls_back_to_strip() {
        assert_eq!(ThinkTagsMode::parse("THINK"), ThinkTagsMode::Think);
        assert_eq!(ThinkTagsMode::parse("raw"), ThinkTagsMode::Raw);
        assert_eq!(ThinkTagsMode::parse("bogus"), ThinkTagsMode::Strip);
    }

    #[test]
    fn env_lines_skip_comments_and_blank_lines() {
        let parsed = parse_env_lines("# comment\n\nA=1\n B = two \nbroken\n");
        assert_eq!(
            parsed,
            vec![
                ("A".to_string(), "1".to_string()),
                ("B".to_string(), "two".to_string())
            ]
        );
    }
}
