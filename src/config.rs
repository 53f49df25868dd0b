//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `TWIN__*` 覆盖（双下划线表示嵌套，如 `TWIN__LLM__PROVIDER=mock`）。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub router: RouterSection,
    pub stream: StreamSection,
    pub checkpoint: CheckpointSection,
    pub web: WebSection,
}

/// [app] 段：应用名
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppSection {
    pub name: Option<String>,
}

/// [llm] 段：后端选择与超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// 后端：openai / mock；无 API Key 时自动退回 mock
    pub provider: String,
    pub model: String,
    /// OpenAI 兼容端点（DeepSeek、自建代理等）
    pub base_url: Option<String>,
    pub timeouts: LlmTimeoutsSection,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            base_url: None,
            timeouts: LlmTimeoutsSection::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmTimeoutsSection {
    /// 单次补全请求超时（秒）
    pub request: u64,
}

impl Default for LlmTimeoutsSection {
    fn default() -> Self {
        Self { request: 60 }
    }
}

/// [router] 段：阶段执行上限、超时与重试
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RouterSection {
    /// 单轮阶段执行次数上限，超出即视为路由异常并终止
    pub max_iterations: u32,
    /// 单阶段执行截止（秒），超时按可重试失败处理
    pub stage_timeout_secs: u64,
    /// 可重试失败的最大重试次数
    pub max_retries: u32,
    /// 重试退避基数（毫秒），按尝试次数线性递增
    pub retry_backoff_ms: u64,
    /// Responder 内工具调用的往返轮数上限
    pub max_tool_rounds: u32,
}

impl Default for RouterSection {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            stage_timeout_secs: 30,
            max_retries: 2,
            retry_backoff_ms: 500,
            max_tool_rounds: 4,
        }
    }
}

/// [stream] 段：事件通道缓冲
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StreamSection {
    /// 路由器到传输层的有界缓冲；写满时阶段管线暂停而非丢弃
    pub buffer_size: usize,
}

impl Default for StreamSection {
    fn default() -> Self {
        Self { buffer_size: 64 }
    }
}

/// [checkpoint] 段：线程快照目录，未设置时用内存存储
#[derive(Debug, Clone, Deserialize, Default)]
pub struct CheckpointSection {
    pub dir: Option<PathBuf>,
}

/// [web] 段：监听端口与可选的 API 令牌
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebSection {
    pub port: u16,
    /// 设置后所有接口要求 `Authorization: Bearer <token>`
    pub api_token: Option<String>,
}

impl Default for WebSection {
    fn default() -> Self {
        Self {
            port: 8080,
            api_token: None,
        }
    }
}

/// 从 config 目录加载配置，环境变量 TWIN__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 TWIN__*（双下划线表示嵌套键）
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
        config::Environment::with_prefix("TWIN")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
