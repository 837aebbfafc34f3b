//! 部署相关领域模型
//!
//! Deployment 记录、状态、日志记录以及规范化的日志信封

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::env::constants::MAX_ERROR_MESSAGE_CHARS;

/// 操作类型
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Create,
    Reboot,
    Destroy,
    Refresh,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Create => "create",
            OperationType::Reboot => "reboot",
            OperationType::Destroy => "destroy",
            OperationType::Refresh => "refresh",
        }
    }

    /// 是否走完整的 plan 流程（否则只使用 applying 子集）
    pub fn uses_plan(&self) -> bool {
        matches!(self, OperationType::Create)
    }
}

/// 部署状态
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentState {
    Queued,
    Planning,
    AwaitingApproval,
    Applying,
    Succeeded,
    Failed,
    Cancelled,
}

impl DeploymentState {
    /// 转换为字符串
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentState::Queued => "queued",
            DeploymentState::Planning => "planning",
            DeploymentState::AwaitingApproval => "awaiting_approval",
            DeploymentState::Applying => "applying",
            DeploymentState::Succeeded => "succeeded",
            DeploymentState::Failed => "failed",
            DeploymentState::Cancelled => "cancelled",
        }
    }

    /// 是否为终态
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeploymentState::Succeeded | DeploymentState::Failed | DeploymentState::Cancelled
        )
    }

    /// 状态在生命周期中的位置，终态之间同级
    pub(crate) fn rank(&self) -> u8 {
        match self {
            DeploymentState::Queued => 0,
            DeploymentState::Planning => 1,
            DeploymentState::AwaitingApproval => 2,
            DeploymentState::Applying => 3,
            DeploymentState::Succeeded | DeploymentState::Failed | DeploymentState::Cancelled => 4,
        }
    }
}

impl std::fmt::Display for DeploymentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 部署记录
///
/// 每次 create / reboot / destroy 请求创建一条，永久保留用于审计
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Deployment {
    pub id: String,
    pub resource_id: String,
    pub operation: OperationType,
    pub state: DeploymentState,
    pub workspace_id: Option<String>,
    pub initiator: String,
    /// 是否需要人工审批 plan 后才能 apply
    #[serde(default)]
    pub requires_approval: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub plan_summary: Option<String>,
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,
    pub error_message: Option<String>,
    /// 持久化的日志历史
    #[serde(default)]
    pub logs: LogEnvelope,
}

impl Deployment {
    /// 创建新的排队中部署
    pub fn new(
        resource_id: impl Into<String>,
        operation: OperationType,
        workspace_id: Option<String>,
        initiator: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            resource_id: resource_id.into(),
            operation,
            state: DeploymentState::Queued,
            workspace_id,
            initiator: initiator.into(),
            requires_approval: false,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            plan_summary: None,
            outputs: BTreeMap::new(),
            error_message: None,
            logs: LogEnvelope::default(),
        }
    }

    pub fn with_approval(mut self, requires_approval: bool) -> Self {
        self.requires_approval = requires_approval;
        self
    }

    /// 记录错误信息（按字符截断）
    pub fn set_error(&mut self, message: &str) {
        self.error_message = Some(bound_message(message, MAX_ERROR_MESSAGE_CHARS));
    }
}

/// 截断过长的消息，保留字符边界
pub fn bound_message(message: &str, max_chars: usize) -> String {
    if message.chars().count() <= max_chars {
        return message.to_string();
    }
    let mut bounded: String = message.chars().take(max_chars).collect();
    bounded.push_str("…[truncated]");
    bounded
}

/// 日志级别
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// 日志记录
///
/// `seq` 由 LogBroadcastRegistry 在发布时分配，发布后不可变
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct LogRecord {
    pub seq: u64,
    pub level: LogLevel,
    pub source: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl LogRecord {
    /// 创建未发布的日志记录
    pub fn new(level: LogLevel, source: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            seq: 0,
            level,
            source: source.into(),
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn info(source: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(LogLevel::Info, source, message)
    }

    pub fn warn(source: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(LogLevel::Warn, source, message)
    }

    pub fn error(source: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(LogLevel::Error, source, message)
    }
}

/// 当前日志信封版本
pub const LOG_ENVELOPE_VERSION: u32 = 1;

/// 日志信封校验错误
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum LogEnvelopeError {
    #[error("log record has no sequence number")]
    Unsequenced,
    #[error("log sequence gap: expected {expected}, got {got}")]
    Gap { expected: u64, got: u64 },
    #[error("unsupported log envelope version {0}")]
    Version(u32),
}

/// 规范化的日志历史信封
///
/// 写入时校验：序号从 1 开始连续递增，已存在的序号被忽略（允许重复追加）
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct LogEnvelope {
    pub version: u32,
    pub records: Vec<LogRecord>,
}

impl Default for LogEnvelope {
    fn default() -> Self {
        Self {
            version: LOG_ENVELOPE_VERSION,
            records: Vec::new(),
        }
    }
}

impl LogEnvelope {
    /// 最后一条记录的序号，空时为 0
    pub fn last_seq(&self) -> u64 {
        self.records.last().map_or(0, |r| r.seq)
    }

    /// 追加记录，返回实际追加的条数
    pub fn append(&mut self, records: &[LogRecord]) -> Result<usize, LogEnvelopeError> {
        if self.version != LOG_ENVELOPE_VERSION {
            return Err(LogEnvelopeError::Version(self.version));
        }

        // 先整体校验，避免部分写入
        let mut expected = self.last_seq() + 1;
        for record in records {
            if record.seq == 0 {
                return Err(LogEnvelopeError::Unsequenced);
            }
            if record.seq < expected {
                continue;
            }
            if record.seq != expected {
                return Err(LogEnvelopeError::Gap {
                    expected,
                    got: record.seq,
                });
            }
            expected += 1;
        }

        let last = self.last_seq();
        let before = self.records.len();
        let mut cursor = last;
        for record in records {
            if record.seq > cursor {
                self.records.push(record.clone());
                cursor = record.seq;
            }
        }
        Ok(self.records.len() - before)
    }

    /// 序号大于 `after` 的记录
    pub fn since(&self, after: u64) -> impl Iterator<Item = &LogRecord> {
        self.records.iter().filter(move |r| r.seq > after)
    }
}
