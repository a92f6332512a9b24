use figment::Figment;
use figment::providers::Env;
use serde::Deserialize;
use std::path::{Path, PathBuf};

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 8045;
const DEFAULT_TIMEOUT_MS: u64 = 180_000;
const DEFAULT_DATA_DIR: &str = "./data";
const DEFAULT_ACCOUNTS_FILE: &str = "./data/accounts.json";
const DEFAULT_CYCLE_INTERVAL_MS: u64 = 100;
const DEFAULT_IDLE_CYCLE_INTERVAL_MS: u64 = 1_000;
const DEFAULT_IDLE_AFTER_SECONDS: u64 = 60;
const DEFAULT_RESULT_IDLE_TTL_SECONDS: u64 = 1_800;
const DEFAULT_TOKEN_RATE_LIMIT_MULTIPLIER: f64 = 1.0;

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,

    pub timeout_ms: u64,
    pub backend_api_key: String,

    pub data_dir: String,
    pub accounts_file: String,

    pub token_rate_limit_multiplier: f64,
    pub cycle_interval_ms: u64,
    pub idle_cycle_interval_ms: u64,
    pub idle_after_seconds: u64,
    pub result_idle_ttl_seconds: u64,

    pub quota_peers: Vec<String>,

    pub debug: String,
}

#[derive(Debug, Default, Deserialize)]
struct RawEnv {
    #[serde(alias = "HOST")]
    host: Option<String>,
    #[serde(alias = "PORT")]
    port: Option<u16>,

    #[serde(alias = "TIMEOUT")]
    timeout: Option<u64>,
    #[serde(alias = "BACKEND_API_KEY")]
    backend_api_key: Option<String>,

    #[serde(alias = "DATA_DIR")]
    data_dir: Option<String>,
    #[serde(alias = "ACCOUNTS_FILE")]
    accounts_file: Option<String>,

    #[serde(alias = "TOKEN_RATE_LIMIT_MULTIPLIER")]
    token_rate_limit_multiplier: Option<f64>,
    #[serde(alias = "CYCLE_INTERVAL_MS")]
    cycle_interval_ms: Option<u64>,
    #[serde(alias = "IDLE_CYCLE_INTERVAL_MS")]
    idle_cycle_interval_ms: Option<u64>,
    #[serde(alias = "IDLE_AFTER_SECONDS")]
    idle_after_seconds: Option<u64>,
    #[serde(alias = "RESULT_IDLE_TTL_SECONDS")]
    result_idle_ttl_seconds: Option<u64>,

    #[serde(alias = "QUOTA_PEERS")]
    quota_peers: Option<String>,

    #[serde(alias = "DEBUG")]
    debug: Option<String>,
}

impl Config {
    pub fn load() -> Self {
        load_dotenv();

        let raw = Figment::from(Env::raw())
            .extract::<RawEnv>()
            .unwrap_or_default();

        Self {
            host: raw.host.unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: raw.port.unwrap_or(DEFAULT_PORT),
            timeout_ms: raw.timeout.unwrap_or(DEFAULT_TIMEOUT_MS),
            backend_api_key: raw.backend_api_key.unwrap_or_default(),
            data_dir: raw.data_dir.unwrap_or_else(|| DEFAULT_DATA_DIR.to_string()),
            accounts_file: raw
                .accounts_file
                .unwrap_or_else(|| DEFAULT_ACCOUNTS_FILE.to_string()),
            token_rate_limit_multiplier: raw
                .token_rate_limit_multiplier
                .filter(|m| m.is_finite() && *m > 0.0)
                .unwrap_or(DEFAULT_TOKEN_RATE_LIMIT_MULTIPLIER),
            cycle_interval_ms: raw.cycle_interval_ms.unwrap_or(DEFAULT_CYCLE_INTERVAL_MS),
            idle_cycle_interval_ms: raw
                .idle_cycle_interval_ms
                .unwrap_or(DEFAULT_IDLE_CYCLE_INTERVAL_MS),
            idle_after_seconds: raw.idle_after_seconds.unwrap_or(DEFAULT_IDLE_AFTER_SECONDS),
            result_idle_ttl_seconds: raw
                .result_idle_ttl_seconds
                .unwrap_or(DEFAULT_RESULT_IDLE_TTL_SECONDS),
            quota_peers: parse_peer_list(raw.quota_peers.as_deref()),
            debug: raw.debug.unwrap_or_else(|| "off".to_string()),
        }
    }

    pub fn quota_store_path(&self) -> PathBuf {
        Path::new(&self.data_dir).join("quota-store.json")
    }
}

/// 后端账号配置（accounts.json 中的一项）。
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountConfig {
    pub name: String,
    pub endpoint: String,
    #[serde(default)]
    pub deployments: Vec<DeploymentConfig>,
}

/// 模型部署配置：速率限制均以“每分钟”为单位配置，
/// 实际窗口由 renewal period 决定（必须能整除 60）。
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentConfig {
    pub name: String,
    pub model_name: String,
    #[serde(default)]
    pub model_version: String,
    #[serde(default)]
    pub can_do_embeddings: bool,
    #[serde(default)]
    pub can_do_completions: bool,
    pub token_rate_limit: u32,
    pub token_rate_renewal_period_seconds: u32,
    pub request_rate_limit: u32,
    pub request_rate_renewal_period_seconds: u32,
}

/// 读取 accounts.json。文件不存在时返回空列表（允许纯配额模式运行）。
pub fn load_accounts(path: &str) -> anyhow::Result<Vec<AccountConfig>> {
    let path = Path::new(path);
    if !path.is_file() {
        return Ok(Vec::new());
    }
    let content = std::fs::read_to_string(path)?;
    let accounts: Vec<AccountConfig> = serde_json::from_str(&content)?;
    Ok(accounts)
}

fn parse_peer_list(value: Option<&str>) -> Vec<String> {
    let Some(value) = value else {
        return Vec::new();
    };
    value
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| p.trim_end_matches('/').to_string())
        .collect()
}

fn load_dotenv() {
    let Some(dotenv_path) = find_dotenv_path() else {
        return;
    };

    let Ok(file) = std::fs::File::open(&dotenv_path) else {
        return;
    };

    let reader = std::io::BufReader::new(file);
    for line in std::io::BufRead::lines(reader).map_while(Result::ok) {
        let Some((key, value)) = parse_dotenv_line(&line) else {
            continue;
        };
        // Rust 2024：修改进程环境变量在并发场景下可能触发 UB，因此 API 为 unsafe。
        // 这里在启动阶段加载 .env，且未并发访问环境变量，符合使用前提。
        unsafe {
            std::env::set_var(key, value);
        }
    }
}

fn find_dotenv_path() -> Option<PathBuf> {
    let cwd = std::env::current_dir().ok()?;
    let mut dir: &Path = cwd.as_path();

    loop {
        let candidate = dir.join(".env");
        if candidate.is_file() {
            return Some(candidate);
        }

        // 避免跨越仓库根目录：发现 Cargo.toml 或 .git 即停止向上寻找。
        if dir.join("Cargo.toml").is_file() || dir.join(".git").is_dir() {
            return None;
        }

        let Some(parent) = dir.parent() else {
            break;
        };
        if parent == dir {
            break;
        }
        dir = parent;
    }

    None
}

fn parse_dotenv_line(line: &str) -> Option<(String, String)> {
    let mut line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }

    if let Some(rest) = line.strip_prefix("export ") {
        line = rest.trim_start();
    }

    let eq_idx = line.find('=')?;
    if eq_idx == 0 {
        return None;
    }

    let key = line[..eq_idx].trim();
    if key.is_empty() {
        return None;
    }

    let mut raw = line[eq_idx + 1..].trim();
    if raw.is_empty() {
        return Some((key.to_string(), String::new()));
    }

    let bytes = raw.as_bytes();
    if bytes.len() >= 2 {
        let first = bytes[0];
        let last = bytes[bytes.len() - 1];
        if (first == b'"' && last == b'"') || (first == b'\'' && last == b'\'') {
            raw = &raw[1..raw.len() - 1];
            return Some((key.to_string(), raw.to_string()));
        }
    }

    raw = strip_inline_comment(raw);
    Some((key.to_string(), raw.trim().to_string()))
}

fn strip_inline_comment(value: &str) -> &str {
    let bytes = value.as_bytes();
    for i in 0..bytes.len() {
        if bytes[i] != b'#' {
            continue;
        }
        if i == 0 || bytes[i - 1] == b' ' || bytes[i - 1] == b'\t' {
            return value[..i].trim_end();
        }
    }
    value
}
