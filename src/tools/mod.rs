//! 档案工具：Responder 可调用的外部内容查询边界
//!
//! 档案内容的存取是外部协作方，这里只定义接口与执行器；内置一个静态实现供离线运行与测试。
//! 未知工具与超时返回错误结果而非崩溃，结果写回消息日志并推送事件。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::core::ToolCallStatus;
use crate::llm::ToolSpec;

/// 档案查询能力：name/description/parameters 构成暴露给模型的声明
#[async_trait]
pub trait ProfileTool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// 参数的 JSON Schema
    fn parameters(&self) -> serde_json::Value;
    async fn call(&self, args: &serde_json::Value) -> Result<String, String>;
}

/// 工具执行器：按名分发并套超时
pub struct ToolExecutor {
    tools: HashMap<String, Arc<dyn ProfileTool>>,
    timeout: Duration,
}

impl ToolExecutor {
    pub fn new(timeout_secs: u64) -> Self {
        Self {
            tools: HashMap::new(),
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    pub fn register(&mut self, tool: impl ProfileTool + 'static) {
        self.tools.insert(tool.name().to_string(), Arc::new(tool));
    }

    /// 暴露给模型的工具声明列表
    pub fn specs(&self) -> Vec<ToolSpec> {
        let mut specs: Vec<ToolSpec> = self
            .tools
            .values()
            .map(|t| ToolSpec {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters(),
            })
            .collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// 执行一次调用；未知工具与超时作为 Error 结果返回，不向上抛
    pub async fn execute(&self, name: &str, args: &serde_json::Value) -> (ToolCallStatus, String) {
        let Some(tool) = self.tools.get(name) else {
            return (
                ToolCallStatus::Error,
                format!("unknown tool: {}", name),
            );
        };

        match tokio::time::timeout(self.timeout, tool.call(args)).await {
            Ok(Ok(result)) => (ToolCallStatus::Complete, result),
            Ok(Err(e)) => (ToolCallStatus::Error, e),
            Err(_) => (
                ToolCallStatus::Error,
                format!("tool {} timed out after {:?}", name, self.timeout),
            ),
        }
    }
}

/// 静态档案查询：按 section 返回预置内容；生产环境由外部内容服务的适配实现替换
pub struct StaticProfileTool {
    sections: HashMap<String, String>,
}

impl StaticProfileTool {
    pub fn new(sections: HashMap<String, String>) -> Self {
        Self { sections }
    }
}

impl Default for StaticProfileTool {
    fn default() -> Self {
        let mut sections = HashMap::new();
        sections.insert(
            "experience".to_string(),
            "Senior engineer, 6 years across backend services and developer tooling.".to_string(),
        );
        sections.insert(
            "skills".to_string(),
            "Rust, TypeScript, Tokio, PostgreSQL, distributed systems.".to_string(),
        );
        sections.insert(
            "projects".to_string(),
            "A streaming conversation service, an open-source task runner, this portfolio.".to_string(),
        );
        sections.insert(
            "contact".to_string(),
            "Reachable through the contact form on this site.".to_string(),
        );
        Self { sections }
    }
}

#[async_trait]
impl ProfileTool for StaticProfileTool {
    fn name(&self) -> &str {
        "profile_lookup"
    }

    fn description(&self) -> &str {
        "Look up a section of the portfolio owner's profile (experience, skills, projects, contact)"
    }

    fn parameters(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "section": {
                    "type": "string",
                    "enum": ["experience", "skills", "projects", "contact"]
                }
            },
            "required": ["section"]
        })
    }

    async fn call(&self, args: &serde_json::Value) -> Result<String, String> {
        let section = args
            .get("section")
            .and_then(|v| v.as_str())
            .ok_or_else(|| "missing required argument: section".to_string())?;
        self.sections
            .get(section)
            .cloned()
            .ok_or_else(|| format!("no such profile section: {}", section))
    }
}

/// 默认执行器：注册静态档案工具
pub fn default_executor(timeout_secs: u64) -> ToolExecutor {
    let mut executor = ToolExecutor::new(timeout_secs);
    executor.register(StaticProfileTool::default());
    executor
}
