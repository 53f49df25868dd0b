//! 错误分类：阶段失败、轮失败与检查点错误
//!
//! 阶段内失败按可重试性就地重试；跨轮边界的错误以 error 事件上报客户端，状态保持最后一次成功检查点。

use thiserror::Error;

use crate::llm::LlmError;

/// 阶段失败：外部调用（LLM / 工具）未能产出结果，带可重试分类
#[derive(Error, Debug)]
pub enum StageFailure {
    #[error("LLM call failed: {0}")]
    Llm(#[from] LlmError),

    #[error("stage deadline exceeded ({0}s)")]
    Timeout(u64),

    #[error("structured output did not match expected schema: {0}")]
    Malformed(String),

    #[error("tool round limit exhausted without a final answer")]
    ToolRoundsExhausted,
}

impl StageFailure {
    /// 是否值得在本阶段内重试
    pub fn retryable(&self) -> bool {
        match self {
            StageFailure::Llm(e) => e.retryable(),
            StageFailure::Timeout(_) => true,
            StageFailure::Malformed(_) => true,
            StageFailure::ToolRoundsExhausted => false,
        }
    }
}

/// 轮失败：一轮无法完成；上报客户端后会话停留在最后一次成功保存的状态
#[derive(Error, Debug)]
pub enum TurnError {
    #[error("stage {stage} failed after {attempts} attempt(s): {source}")]
    StageExhausted {
        stage: &'static str,
        attempts: u32,
        #[source]
        source: StageFailure,
    },

    /// 路由器在无 assistant 输出时走到了停机分支，属内部缺陷信号
    #[error("router halted with no assistant output (routing inconsistency)")]
    RoutingInconsistency,

    #[error("iteration ceiling {0} exceeded, aborting turn")]
    IterationCeiling(u32),

    #[error("turn cancelled by client")]
    Cancelled,

    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),
}

impl TurnError {
    /// 错误码（error 事件的 code 字段）
    pub fn code(&self) -> &'static str {
        match self {
            TurnError::StageExhausted { .. } => "stage_failed",
            TurnError::RoutingInconsistency => "routing_inconsistency",
            TurnError::IterationCeiling(_) => "iteration_ceiling",
            TurnError::Cancelled => "cancelled",
            TurnError::Checkpoint(_) => "checkpoint_failed",
        }
    }
}

/// 检查点存储错误
#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}
