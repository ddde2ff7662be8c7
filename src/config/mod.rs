use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

const CONFIG_PATH: &str = "config/global.toml";
const DEFAULT_LIST_PATH: &str = "servers.json";
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_PROBE_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_COMPLETION_HOLD_MS: u64 = 2_000;

#[derive(Deserialize, Debug, Clone, Default)]
pub struct GlobalConfig {
    pub list_path: Option<String>,
    pub probe: Option<ProbeSection>,
    pub sort: Option<SortSection>,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct ProbeSection {
    pub connect_timeout_ms: Option<u64>,  // 프로브당 연결 타임아웃
    pub probe_timeout_ms: Option<u64>,    // 프로브당 전체 타임아웃 (카운트다운 기준)
    pub max_concurrency: Option<usize>,   // 동시 프로브 상한 덮어쓰기 (1..=32)
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct SortSection {
    pub default_criterion: Option<String>,  // "latency" | "players"
    pub completion_hold_ms: Option<u64>,
}

impl GlobalConfig {
    pub fn load() -> anyhow::Result<Self> {
        let s = std::fs::read_to_string(CONFIG_PATH).unwrap_or_default();
        let cfg: Self = toml::from_str(&s).unwrap_or_default();
        Ok(cfg)
    }

    pub fn list_file(&self) -> PathBuf {
        self.list_path.as_deref().unwrap_or(DEFAULT_LIST_PATH).into()
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(
            self.probe
                .as_ref()
                .and_then(|p| p.connect_timeout_ms)
                .unwrap_or(DEFAULT_CONNECT_TIMEOUT_MS),
        )
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(
            self.probe
                .as_ref()
                .and_then(|p| p.probe_timeout_ms)
                .unwrap_or(DEFAULT_PROBE_TIMEOUT_MS),
        )
    }

    pub fn max_concurrency(&self) -> Option<usize> {
        self.probe
            .as_ref()
            .and_then(|p| p.max_concurrency)
            .map(|n| n.clamp(1, 32))
    }

    pub fn default_criterion_key(&self) -> Option<&str> {
        self.sort.as_ref().and_then(|s| s.default_criterion.as_deref())
    }

    pub fn completion_hold(&self) -> Duration {
        Duration::from_millis(
            self.sort
                .as_ref()
                .and_then(|s| s.completion_hold_ms)
                .unwrap_or(DEFAULT_COMPLETION_HOLD_MS),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = GlobalConfig::default();
        assert_eq!(cfg.list_file(), PathBuf::from("servers.json"));
        assert_eq!(cfg.connect_timeout(), Duration::from_secs(5));
        assert_eq!(cfg.probe_timeout(), Duration::from_secs(30));
        assert_eq!(cfg.completion_hold(), Duration::from_secs(2));
        assert!(cfg.max_concurrency().is_none());
        assert!(cfg.default_criterion_key().is_none());
    }

    #[test]
    fn test_parse_full_config() {
        let raw = r#"
            list_path = "data/servers.json"

            [probe]
            connect_timeout_ms = 3000
            probe_timeout_ms = 15000
            max_concurrency = 8

            [sort]
            default_criterion = "players"
            completion_hold_ms = 500
        "#;
        let cfg: GlobalConfig = toml::from_str(raw).unwrap();
        assert_eq!(cfg.list_file(), PathBuf::from("data/servers.json"));
        assert_eq!(cfg.connect_timeout(), Duration::from_secs(3));
        assert_eq!(cfg.probe_timeout(), Duration::from_secs(15));
        assert_eq!(cfg.max_concurrency(), Some(8));
        assert_eq!(cfg.default_criterion_key(), Some("players"));
        assert_eq!(cfg.completion_hold(), Duration::from_millis(500));
    }

    #[test]
    fn test_concurrency_clamped() {
        let raw = "[probe]\nmax_concurrency = 500\n";
        let cfg: GlobalConfig = toml::from_str(raw).unwrap();
        assert_eq!(cfg.max_concurrency(), Some(32));
    }
}
