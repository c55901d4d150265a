//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `RESEARCHER__*` 覆盖（双下划线表示嵌套，如 `RESEARCHER__LLM__DEFAULT_MODEL=gemma2-9b-it`）。
//! 各 API Key 未在配置中给出时，回退到常用环境变量（GROQ_API_KEY / SERPER_API_KEY / API_KEY）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub llm: LlmSection,
    pub search: SearchSection,
    pub pipeline: PipelineSection,
    pub history: HistorySection,
    pub web: WebSection,
}

/// [llm] 段：OpenAI 兼容端点、模型白名单、节流与重试
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    pub base_url: String,
    pub api_key: Option<String>,
    /// 请求未指定模型或模型不在白名单时使用
    pub default_model: String,
    pub available_models: Vec<String>,
    pub request_timeout_secs: u64,
    /// 两次请求开始之间的最小间隔（毫秒，全局共享）
    pub rate_limit_delay_ms: u64,
    /// 429 时的最大尝试次数
    pub max_retries: u32,
    /// 服务端未给出 Retry-After 时的等待秒数
    pub retry_delay_secs: f64,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            base_url: "https://api.groq.com/openai/v1".to_string(),
            api_key: None,
            default_model: "llama3-70b-8192".to_string(),
            available_models: vec![
                "deepseek-r1-distill-llama-70b".to_string(),
                "llama3-70b-8192".to_string(),
                "mistral-saba-24b".to_string(),
                "gemma2-9b-it".to_string(),
            ],
            request_timeout_secs: 30,
            rate_limit_delay_ms: 1000,
            max_retries: 3,
            retry_delay_secs: 5.0,
        }
    }
}

impl LlmSection {
    /// 配置中的 api_key 优先，否则读 GROQ_API_KEY
    pub fn resolved_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .or_else(|| std::env::var("GROQ_API_KEY").ok())
    }

    pub fn rate_limit_delay(&self) -> Duration {
        Duration::from_millis(self.rate_limit_delay_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs_f64(self.retry_delay_secs.max(0.0))
    }
}

/// [search] 段：Serper 端点、结果数、超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SearchSection {
    pub base_url: String,
    pub api_key: Option<String>,
    pub max_results: usize,
    pub timeout_secs: u64,
}

impl Default for SearchSection {
    fn default() -> Self {
        Self {
            base_url: "https://google.serper.dev".to_string(),
            api_key: None,
            max_results: 5,
            timeout_secs: 15,
        }
    }
}

impl SearchSection {
    pub fn resolved_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .or_else(|| std::env::var("SERPER_API_KEY").ok())
    }
}

/// [pipeline] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineSection {
    /// 每条规划查询取回的结果上限
    pub max_results_per_query: usize,
    /// 模型网关返回失败文本（如 "HTTP Error: ..."）时是否让当前阶段失败
    pub treat_failure_text_as_error: bool,
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            max_results_per_query: 5,
            treat_failure_text_as_error: false,
        }
    }
}

/// 历史存储后端
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HistoryBackend {
    #[default]
    Memory,
    Sqlite,
}

/// [history] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HistorySection {
    pub backend: HistoryBackend,
    pub sqlite_path: PathBuf,
}

impl Default for HistorySection {
    fn default() -> Self {
        Self {
            backend: HistoryBackend::Memory,
            sqlite_path: PathBuf::from("data/history.db"),
        }
    }
}

/// [web] 段：监听地址、API Key、CORS 来源
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebSection {
    pub host: String,
    pub port: u16,
    pub api_key: Option<String>,
    pub allowed_origins: Vec<String>,
}

impl Default for WebSection {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
            api_key: None,
            allowed_origins: vec![
                "http://localhost:3000".to_string(),
                "http://127.0.0.1:3000".to_string(),
            ],
        }
    }
}

impl WebSection {
    pub fn resolved_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .or_else(|| std::env::var("API_KEY").ok())
    }
}

/// 从 config 目录加载配置，环境变量 RESEARCHER__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 RESEARCHER__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("RESEARCHER")
            .separator("__")
            .try_parsing(true)
            .list_separator(",")
            .with_list_parse_key("llm.available_models")
            .with_list_parse_key("web.allowed_origins"),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
