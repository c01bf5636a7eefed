use crate::error::AppError;
use clap::Parser;
use figment::Figment;
use figment::providers::Env;
use reqwest::Url;
use serde::{Deserialize, Deserializer};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_API_URL: &str = "https://api.github.com/";
const DEFAULT_LISTEN: &str = "127.0.0.1:44879";
const DEFAULT_CACHE_DIR: &str = "./data/cache";
const DEFAULT_CACHE_CAPACITY: u64 = 10_000;
const DEFAULT_RATE_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    Memory,
    File,
}

impl StorageKind {
    fn parse(s: &str) -> Result<Self, AppError> {
        match s.trim().to_lowercase().as_str() {
            "" | "memory" | "mem" => Ok(Self::Memory),
            "file" | "disk" => Ok(Self::File),
            other => Err(AppError::config(format!("未知的缓存后端: {other}"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub api_url: Url,
    pub listen: SocketAddr,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,

    pub storage: StorageKind,
    pub cache_dir: PathBuf,
    pub cache_capacity: u64,

    pub auth_token: Vec<String>,
    pub auth_oauth: Vec<String>,
    pub auth_app: Vec<String>,

    pub rph: u64,
    pub rate_interval: Duration,
    pub timeout_ms: u64,
    pub proxy: String,
    pub shutdown_timeout: Duration,

    pub debug: String,
}

/// 命令行参数；未给出的项回落到环境变量，再回落到默认值。
#[derive(Debug, Default, Parser)]
#[command(name = "ghproxy", version, about = "GitHub API 多凭证负载均衡代理")]
pub struct Cli {
    /// 上游 GitHub API 地址
    #[arg(long)]
    url: Option<String>,
    /// 监听地址
    #[arg(long)]
    listen: Option<String>,
    #[arg(long)]
    tls_cert: Option<PathBuf>,
    #[arg(long)]
    tls_key: Option<PathBuf>,

    /// 缓存后端：memory / file
    #[arg(long)]
    storage: Option<String>,
    #[arg(long)]
    cache_dir: Option<PathBuf>,
    #[arg(long)]
    cache_capacity: Option<u64>,

    /// 个人令牌：`token` 或 `id:token`，可重复或逗号分隔
    #[arg(long, value_delimiter = ',')]
    auth_token: Vec<String>,
    /// OAuth 应用：`client_id:client_secret`
    #[arg(long, value_delimiter = ',')]
    auth_oauth: Vec<String>,
    /// GitHub App：`app_id:installation_id:private_key`（私钥为 PEM 内容或文件路径）
    #[arg(long, value_delimiter = ',')]
    auth_app: Vec<String>,

    /// 每个凭证每小时最多请求数，0 为不限
    #[arg(long)]
    rph: Option<u64>,
    /// 配额轮询间隔，如 60s / 5m
    #[arg(long)]
    rate_interval: Option<String>,
    /// 上游请求超时（毫秒），0 为不限
    #[arg(long)]
    timeout: Option<u64>,
    #[arg(long)]
    proxy: Option<String>,
    #[arg(long)]
    shutdown_timeout: Option<String>,

    /// 日志等级：off / low / medium / high
    #[arg(long)]
    debug: Option<String>,
}

/// 环境变量原始值。figment 会把 `60`、`true` 之类解析成数字或布尔，字符串字段统一宽松接收。
#[derive(Debug, Default, Deserialize)]
struct RawEnv {
    #[serde(alias = "API_URL", default, deserialize_with = "lossy_string")]
    api_url: Option<String>,
    #[serde(alias = "LISTEN", default, deserialize_with = "lossy_string")]
    listen: Option<String>,
    #[serde(alias = "TLS_CERT", default, deserialize_with = "lossy_string")]
    tls_cert: Option<String>,
    #[serde(alias = "TLS_KEY", default, deserialize_with = "lossy_string")]
    tls_key: Option<String>,

    #[serde(alias = "STORAGE", default, deserialize_with = "lossy_string")]
    storage: Option<String>,
    #[serde(alias = "CACHE_DIR", default, deserialize_with = "lossy_string")]
    cache_dir: Option<String>,
    #[serde(alias = "CACHE_CAPACITY")]
    cache_capacity: Option<u64>,

    #[serde(alias = "AUTH_TOKEN", default, deserialize_with = "lossy_string")]
    auth_token: Option<String>,
    #[serde(alias = "AUTH_OAUTH", default, deserialize_with = "lossy_string")]
    auth_oauth: Option<String>,
    #[serde(alias = "AUTH_APP", default, deserialize_with = "lossy_string")]
    auth_app: Option<String>,

    #[serde(alias = "RPH")]
    rph: Option<u64>,
    #[serde(alias = "RATE_INTERVAL", default, deserialize_with = "lossy_string")]
    rate_interval: Option<String>,
    #[serde(alias = "TIMEOUT")]
    timeout: Option<u64>,
    #[serde(alias = "PROXY", default, deserialize_with = "lossy_string")]
    proxy: Option<String>,
    #[serde(alias = "SHUTDOWN_TIMEOUT", default, deserialize_with = "lossy_string")]
    shutdown_timeout: Option<String>,

    #[serde(alias = "DEBUG", default, deserialize_with = "lossy_string")]
    debug: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Scalar {
    Str(String),
    Int(i64),
    Uint(u64),
    Float(f64),
    Bool(bool),
}

fn lossy_string<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    Ok(Option::<Scalar>::deserialize(d)?.map(|v| match v {
        Scalar::Str(s) => s,
        Scalar::Int(n) => n.to_string(),
        Scalar::Uint(n) => n.to_string(),
        Scalar::Float(n) => n.to_string(),
        Scalar::Bool(b) => b.to_string(),
    }))
}

impl Config {
    pub fn load() -> Result<Self, AppError> {
        load_dotenv();

        let raw = Figment::from(Env::raw())
            .extract::<RawEnv>()
            .map_err(|e| AppError::config(format!("读取环境变量失败: {e}")))?;

        Self::resolve(Cli::parse(), raw)
    }

    fn resolve(cli: Cli, raw: RawEnv) -> Result<Self, AppError> {
        let api_url = cli
            .url
            .or(raw.api_url)
            .unwrap_or_else(|| DEFAULT_API_URL.to_string());
        let listen = cli
            .listen
            .or(raw.listen)
            .unwrap_or_else(|| DEFAULT_LISTEN.to_string());

        let rate_interval = match cli.rate_interval.or(raw.rate_interval) {
            Some(v) => parse_duration(&v)?,
            None => DEFAULT_RATE_INTERVAL,
        };
        if rate_interval.is_zero() {
            return Err(AppError::config("RATE_INTERVAL 不能为 0"));
        }
        let shutdown_timeout = match cli.shutdown_timeout.or(raw.shutdown_timeout) {
            Some(v) => parse_duration(&v)?,
            None => DEFAULT_SHUTDOWN_TIMEOUT,
        };

        let cfg = Self {
            api_url: parse_api_url(&api_url)?,
            listen: listen
                .trim()
                .parse()
                .map_err(|e| AppError::config(format!("监听地址无效 {listen}: {e}")))?,
            tls_cert: cli.tls_cert.or(raw.tls_cert.map(PathBuf::from)),
            tls_key: cli.tls_key.or(raw.tls_key.map(PathBuf::from)),
            storage: StorageKind::parse(cli.storage.or(raw.storage).as_deref().unwrap_or(""))?,
            cache_dir: cli
                .cache_dir
                .or(raw.cache_dir.map(PathBuf::from))
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CACHE_DIR)),
            cache_capacity: cli
                .cache_capacity
                .or(raw.cache_capacity)
                .unwrap_or(DEFAULT_CACHE_CAPACITY),
            auth_token: pick_list(cli.auth_token, raw.auth_token),
            auth_oauth: pick_list(cli.auth_oauth, raw.auth_oauth),
            auth_app: pick_list(cli.auth_app, raw.auth_app),
            rph: cli.rph.or(raw.rph).unwrap_or(0),
            rate_interval,
            timeout_ms: cli.timeout.or(raw.timeout).unwrap_or(0),
            proxy: cli.proxy.or(raw.proxy).unwrap_or_default(),
            shutdown_timeout,
            debug: cli
                .debug
                .or(raw.debug)
                .unwrap_or_else(|| "off".to_string()),
        };

        if cfg.tls_cert.is_some() != cfg.tls_key.is_some() {
            return Err(AppError::config("TLS_CERT 与 TLS_KEY 必须同时设置"));
        }

        Ok(cfg)
    }

    pub fn tls_enabled(&self) -> bool {
        self.tls_cert.is_some() && self.tls_key.is_some()
    }

    pub fn has_credentials(&self) -> bool {
        !(self.auth_token.is_empty() && self.auth_oauth.is_empty() && self.auth_app.is_empty())
    }

    pub fn log_level(&self) -> crate::logging::LogLevel {
        crate::logging::LogLevel::parse(&self.debug)
    }
}

/// 上游地址统一以 `/` 结尾，路径拼接与 Link 改写都依赖这一点。
fn parse_api_url(raw: &str) -> Result<Url, AppError> {
    let mut url = Url::parse(raw.trim())
        .map_err(|e| AppError::config(format!("上游地址无效 {raw}: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(AppError::config(format!("上游地址必须是 http(s): {raw}")));
    }
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

/// 命令行给出时完全覆盖环境变量，不做合并。
fn pick_list(cli: Vec<String>, env: Option<String>) -> Vec<String> {
    let items = if cli.is_empty() {
        env.map(|v| v.split(',').map(str::to_string).collect())
            .unwrap_or_default()
    } else {
        cli
    };
    items
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// 解析 `250ms` / `30s` / `5m` / `1h`，纯数字按秒处理。
pub fn parse_duration(raw: &str) -> Result<Duration, AppError> {
    let s = raw.trim();
    let invalid = || AppError::config(format!("时长格式无效: {raw}"));

    let (num, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => s.split_at(idx),
        None => (s, "s"),
    };
    let n: u64 = num.parse().map_err(|_| invalid())?;

    match unit {
        "ms" => Ok(Duration::from_millis(n)),
        "s" => Ok(Duration::from_secs(n)),
        "m" => n.checked_mul(60).map(Duration::from_secs).ok_or_else(invalid),
        "h" => n.checked_mul(3600).map(Duration::from_secs).ok_or_else(invalid),
        _ => Err(invalid()),
    }
}

fn load_dotenv() {
    let Some(dotenv_path) = find_dotenv_path() else {
        return;
    };
    if let Err(e) = dotenvy::from_path(&dotenv_path) {
        eprintln!("加载 {} 失败: {e}", dotenv_path.display());
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

        // 发现 Cargo.toml 或 .git 即停止向上寻找。
        if dir.join("Cargo.toml").is_file() || dir.join(".git").is_dir() {
            return None;
        }

        let parent = dir.parent()?;
        if parent == dir {
            return None;
        }
        dir = parent;
    }
}
