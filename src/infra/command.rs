//! Provisioning 工具执行器
//!
//! 在一个工作区租约上运行 provisioning 工具（Terraform/OpenTofu 兼容 CLI）的子命令：
//! - stdout/stderr 逐行分级后实时写入日志 sink
//! - 每个子命令独立超时
//! - 捕获 plan 摘要与错误行尾部作为失败信息
//! - 凭据只通过子进程环境变量传递

use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{error, info, warn};

use crate::config::env::constants::ERROR_TAIL_LINES;
use crate::domain::{LogLevel, LogRecord, ProviderVariables};
use crate::error::OrchestrationError;
use crate::infra::vault::CredentialBundle;
use crate::infra::workspace::{write_variables_file, WorkspaceLease, PLAN_FILE, VARIABLES_FILE};

/// 日志输出目标
pub trait LogSink: Send + Sync {
    fn emit(&self, record: LogRecord);
}

/// 工具探测结果
#[derive(Clone, Debug)]
pub struct ToolStatus {
    pub binary: String,
    pub path: Option<PathBuf>,
}

impl ToolStatus {
    pub fn available(&self) -> bool {
        self.path.is_some()
    }
}

/// 启动时探测工具是否可用
pub fn detect_tool(binary: &str) -> ToolStatus {
    match which::which(binary) {
        Ok(path) => {
            info!(binary = %binary, path = %path.display(), "Provisioning tool detected");
            ToolStatus {
                binary: binary.to_string(),
                path: Some(path),
            }
        }
        Err(e) => {
            warn!(binary = %binary, error = %e, "Provisioning tool not found, running in degraded mode");
            ToolStatus {
                binary: binary.to_string(),
                path: None,
            }
        }
    }
}

/// 单次子命令的执行结果
#[derive(Debug, Default)]
pub struct RunOutcome {
    pub success: bool,
    pub exit_code: Option<i32>,
    /// 失败信息（错误行尾部，或退出码说明）
    pub error: Option<String>,
    pub plan_summary: Option<String>,
    captured: Vec<String>,
}

/// plan 结果
#[derive(Debug)]
pub struct PlanOutcome {
    pub success: bool,
    pub plan_artifact: Option<PathBuf>,
    pub summary: Option<String>,
    pub error: Option<String>,
}

/// apply / refresh 结果
#[derive(Debug)]
pub struct ApplyOutcome {
    pub success: bool,
    pub outputs: BTreeMap<String, String>,
    pub error: Option<String>,
}

/// 工具执行器
///
/// 持有工作区租约，`&mut self` 保证同一执行器上子命令串行
pub struct ProvisioningRunner {
    program: PathBuf,
    lease: WorkspaceLease,
    env: Vec<(String, String)>,
    timeout: Duration,
}

impl ProvisioningRunner {
    pub fn new(tool: &ToolStatus, lease: WorkspaceLease, timeout: Duration) -> Result<Self, OrchestrationError> {
        let program = tool
            .path
            .clone()
            .ok_or_else(|| OrchestrationError::ToolUnavailable(tool.binary.clone()))?;
        Ok(Self {
            program,
            lease,
            env: Vec::new(),
            timeout,
        })
    }

    /// 设置凭据环境变量
    pub fn with_credentials(mut self, env_vars: &[&str], creds: &CredentialBundle) -> Self {
        for key in env_vars {
            self.env.push((key.to_string(), creds.api_token.clone()));
        }
        self
    }

    pub fn workspace_id(&self) -> &str {
        self.lease.workspace_id()
    }

    pub fn dir(&self) -> &Path {
        self.lease.dir()
    }

    pub async fn init(&mut self, sink: Arc<dyn LogSink>) -> Result<RunOutcome, OrchestrationError> {
        self.run("init", &[], sink, false).await
    }

    /// 写入变量文件后执行 plan，成功时产出 plan 文件
    pub async fn plan(&mut self, vars: &ProviderVariables, sink: Arc<dyn LogSink>) -> Result<PlanOutcome, OrchestrationError> {
        write_variables_file(self.dir(), vars).await?;

        let out_arg = format!("-out={}", PLAN_FILE);
        let var_file = format!("-var-file={}", VARIABLES_FILE);
        let outcome = self.run("plan", &[&out_arg, &var_file], sink, false).await?;

        let artifact = self.dir().join(PLAN_FILE);
        let plan_artifact = if outcome.success && tokio::fs::try_exists(&artifact).await.unwrap_or(false) {
            Some(artifact)
        } else {
            None
        };

        Ok(PlanOutcome {
            success: outcome.success,
            plan_artifact,
            summary: outcome.plan_summary,
            error: outcome.error,
        })
    }

    /// 执行 apply
    ///
    /// 有 plan 文件时只应用该 plan；否则按最后写入的变量文件重新 apply
    pub async fn apply(&mut self, plan_artifact: Option<&Path>, sink: Arc<dyn LogSink>) -> Result<ApplyOutcome, OrchestrationError> {
        let var_file = format!("-var-file={}", VARIABLES_FILE);
        let args: Vec<String> = match plan_artifact {
            Some(plan) => vec![plan.display().to_string()],
            None => vec!["-auto-approve".to_string(), var_file],
        };
        let args: Vec<&str> = args.iter().map(String::as_str).collect();

        let outcome = self.run("apply", &args, Arc::clone(&sink), false).await?;
        self.finish_with_outputs(outcome, sink).await
    }

    pub async fn destroy(&mut self, sink: Arc<dyn LogSink>) -> Result<RunOutcome, OrchestrationError> {
        let var_file = format!("-var-file={}", VARIABLES_FILE);
        self.run("destroy", &["-auto-approve", &var_file], sink, false).await
    }

    /// 刷新状态并读取输出
    pub async fn refresh(&mut self, sink: Arc<dyn LogSink>) -> Result<ApplyOutcome, OrchestrationError> {
        let var_file = format!("-var-file={}", VARIABLES_FILE);
        let outcome = self.run("refresh", &[&var_file], Arc::clone(&sink), false).await?;
        self.finish_with_outputs(outcome, sink).await
    }

    /// `output -json` 解析为扁平键值；输出格式异常时返回空 map
    pub async fn outputs(&mut self, sink: Arc<dyn LogSink>) -> Result<BTreeMap<String, String>, OrchestrationError> {
        let outcome = self.run("output", &["-json"], sink, true).await?;
        if !outcome.success {
            return Ok(BTreeMap::new());
        }
        Ok(parse_outputs(&outcome.captured.join("\n")))
    }

    async fn finish_with_outputs(&mut self, outcome: RunOutcome, sink: Arc<dyn LogSink>) -> Result<ApplyOutcome, OrchestrationError> {
        if !outcome.success {
            return Ok(ApplyOutcome {
                success: false,
                outputs: BTreeMap::new(),
                error: outcome.error,
            });
        }
        let outputs = self.outputs(sink).await?;
        Ok(ApplyOutcome {
            success: true,
            outputs,
            error: None,
        })
    }

    /// 执行子命令并流式输出日志
    ///
    /// `capture_stdout` 为 true 时 stdout 不写入日志，而是收集后返回
    async fn run(
        &mut self,
        subcommand: &str,
        args: &[&str],
        sink: Arc<dyn LogSink>,
        capture_stdout: bool,
    ) -> Result<RunOutcome, OrchestrationError> {
        let workspace_id = self.lease.workspace_id().to_string();
        info!(workspace_id = %workspace_id, subcommand = %subcommand, "Running provisioning tool");
        sink.emit(LogRecord::info(
            "orchestrator",
            format!("$ {} {} {}", self.program.display(), subcommand, args.join(" ")),
        ));

        // output 不接受 -input 参数
        let common: &[&str] = if subcommand == "output" {
            &["-no-color"]
        } else {
            &["-input=false", "-no-color"]
        };

        let mut child = Command::new(&self.program)
            .arg(subcommand)
            .args(common)
            .args(args)
            .current_dir(self.lease.dir())
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .env("TF_IN_AUTOMATION", "1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    OrchestrationError::ToolUnavailable(self.program.display().to_string())
                } else {
                    OrchestrationError::workspace_io(self.lease.dir(), e)
                }
            })?;

        let source = format!("tool:{}", subcommand);
        let stdout_task = child.stdout.take().map(|stdout| {
            tokio::spawn(stream_lines(stdout, source.clone(), Arc::clone(&sink), capture_stdout))
        });
        let stderr_task = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(stream_lines(stderr, source.clone(), Arc::clone(&sink), false)));

        // 等待命令完成，支持超时
        let status = tokio::select! {
            _ = tokio::time::sleep(self.timeout) => {
                error!(workspace_id = %workspace_id, subcommand = %subcommand, "Command timed out after {:?}", self.timeout);
                let _ = child.kill().await;
                None
            }
            status = child.wait() => {
                Some(status.map_err(|e| OrchestrationError::workspace_io(self.lease.dir(), e))?)
            }
        };

        let tasks = [stdout_task, stderr_task].into_iter().flatten();
        let Some(status) = status else {
            // 孙进程可能仍持有管道，不再等待读取任务
            for task in tasks {
                task.abort();
            }
            let message = format!("{} exceeded timeout of {}s", subcommand, self.timeout.as_secs());
            sink.emit(LogRecord::error("orchestrator", message.clone()));
            return Err(OrchestrationError::Timeout(message));
        };

        // 等待日志读取完成
        let mut summary = StreamSummary::default();
        for task in tasks {
            if let Ok(part) = task.await {
                summary.merge(part);
            }
        }

        let success = status.success();
        let error = if success {
            None
        } else if summary.error_tail.is_empty() {
            Some(format!("{} exited with {}", subcommand, status))
        } else {
            Some(Vec::from(summary.error_tail).join("\n"))
        };

        if !success {
            warn!(workspace_id = %workspace_id, subcommand = %subcommand, status = %status, "Provisioning tool failed");
        }

        Ok(RunOutcome {
            success,
            exit_code: status.code(),
            error,
            plan_summary: summary.plan_summary,
            captured: summary.captured,
        })
    }
}

/// 单个输出流的汇总
#[derive(Default)]
struct StreamSummary {
    captured: Vec<String>,
    error_tail: VecDeque<String>,
    plan_summary: Option<String>,
}

impl StreamSummary {
    fn push_error(&mut self, line: &str) {
        if self.error_tail.len() >= ERROR_TAIL_LINES {
            self.error_tail.pop_front();
        }
        self.error_tail.push_back(line.to_string());
    }

    fn merge(&mut self, other: StreamSummary) {
        self.captured.extend(other.captured);
        for line in other.error_tail {
            self.push_error(&line);
        }
        if self.plan_summary.is_none() {
            self.plan_summary = other.plan_summary;
        }
    }
}

async fn stream_lines<R>(reader: R, source: String, sink: Arc<dyn LogSink>, capture: bool) -> StreamSummary
where
    R: AsyncRead + Unpin,
{
    let mut summary = StreamSummary::default();
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                warn!(source = %source, error = %e, "Failed to read tool output");
                break;
            }
        }

        // 非 UTF-8 输出按有损方式解码，保证管道被读到 EOF
        let line = String::from_utf8_lossy(&buf)
            .trim_end_matches(&['\n', '\r'][..])
            .to_string();
        if capture {
            summary.captured.push(line);
            continue;
        }

        let level = classify_line(&line);
        if level == LogLevel::Error {
            summary.push_error(line.trim_start_matches(&['│', '╷', '╵', ' '][..]));
        }
        if summary.plan_summary.is_none() {
            summary.plan_summary = extract_plan_summary(&line);
        }
        if !line.trim().is_empty() {
            sink.emit(LogRecord::new(level, source.clone(), line));
        }
    }
    summary
}

fn error_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\b(error|fatal|panic)\b|\bfailed\b").expect("valid error regex"))
}

fn warn_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\b(warn|warning|deprecated)\b").expect("valid warn regex"))
}

fn plan_summary_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(Plan: \d+ to add, \d+ to change, \d+ to destroy\.?|No changes\.)")
            .expect("valid plan summary regex")
    })
}

/// 按模式对输出行分级
pub fn classify_line(line: &str) -> LogLevel {
    if error_regex().is_match(line) {
        LogLevel::Error
    } else if warn_regex().is_match(line) {
        LogLevel::Warn
    } else {
        LogLevel::Info
    }
}

pub fn extract_plan_summary(line: &str) -> Option<String> {
    plan_summary_regex()
        .find(line)
        .map(|m| m.as_str().to_string())
}

#[derive(Deserialize)]
struct OutputEntry {
    value: serde_json::Value,
    #[serde(default)]
    sensitive: bool,
}

/// 解析 `output -json`
///
/// 字符串值原样保留，其他值保留 JSON 文本；敏感输出被遮蔽。格式异常时返回空 map。
pub fn parse_outputs(raw: &str) -> BTreeMap<String, String> {
    let Ok(entries) = serde_json::from_str::<BTreeMap<String, OutputEntry>>(raw) else {
        return BTreeMap::new();
    };
    entries
        .into_iter()
        .map(|(key, entry)| {
            let value = if entry.sensitive {
                "(sensitive)".to_string()
            } else {
                match entry.value {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                }
            };
            (key, value)
        })
        .collect()
}

/// 以 `output -json` 的格式序列化键值
pub fn serialize_outputs(outputs: &BTreeMap<String, String>) -> String {
    let entries: serde_json::Map<String, serde_json::Value> = outputs
        .iter()
        .map(|(key, value)| {
            (
                key.clone(),
                serde_json::json!({ "sensitive": false, "type": "string", "value": value }),
            )
        })
        .collect();
    serde_json::Value::Object(entries).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct CollectingSink(Mutex<Vec<LogRecord>>);

    impl LogSink for CollectingSink {
        fn emit(&self, record: LogRecord) {
            self.0.lock().unwrap().push(record);
        }
    }

    impl CollectingSink {
        fn messages(&self) -> Vec<String> {
            self.0.lock().unwrap().iter().map(|r| r.message.clone()).collect()
        }
    }

    #[test]
    fn test_classify_line() {
        assert_eq!(classify_line("│ Error: Invalid provider configuration"), LogLevel::Error);
        assert_eq!(classify_line("Warning: Argument is deprecated"), LogLevel::Warn);
        assert_eq!(classify_line("digitalocean_droplet.this: Creating..."), LogLevel::Info);
        // 资源计数里的 "0 to destroy" 不算错误
        assert_eq!(classify_line("Plan: 1 to add, 0 to change, 0 to destroy."), LogLevel::Info);
    }

    #[test]
    fn test_extract_plan_summary() {
        assert_eq!(
            extract_plan_summary("Plan: 2 to add, 1 to change, 0 to destroy."),
            Some("Plan: 2 to add, 1 to change, 0 to destroy.".to_string())
        );
        assert_eq!(
            extract_plan_summary("No changes. Your infrastructure matches the configuration."),
            Some("No changes.".to_string())
        );
        assert_eq!(extract_plan_summary("Refreshing state..."), None);
    }

    #[test]
    fn test_outputs_round_trip() {
        let mut outputs = BTreeMap::new();
        outputs.insert("ipv4_address".to_string(), "203.0.113.10".to_string());
        outputs.insert("tags".to_string(), "[\"a\",\"b\"]".to_string());
        outputs.insert("empty".to_string(), String::new());

        assert_eq!(parse_outputs(&serialize_outputs(&outputs)), outputs);
    }

    #[test]
    fn test_parse_outputs_non_string_and_sensitive() {
        let raw = r#"{
            "port": {"sensitive": false, "type": "number", "value": 22},
            "ips": {"sensitive": false, "type": ["list", "string"], "value": ["10.0.0.1"]},
            "root_password": {"sensitive": true, "type": "string", "value": "hunter2"}
        }"#;
        let outputs = parse_outputs(raw);
        assert_eq!(outputs["port"], "22");
        assert_eq!(outputs["ips"], "[\"10.0.0.1\"]");
        assert_eq!(outputs["root_password"], "(sensitive)");
    }

    #[test]
    fn test_parse_outputs_malformed_is_empty() {
        assert!(parse_outputs("").is_empty());
        assert!(parse_outputs("not json").is_empty());
        assert!(parse_outputs("[1,2,3]").is_empty());
        assert!(parse_outputs(r#"{"a": {"no_value": 1}}"#).is_empty());
        // 同一输入结果稳定
        assert_eq!(parse_outputs("{oops"), parse_outputs("{oops"));
    }

    #[cfg(unix)]
    mod subprocess {
        use super::*;
        use crate::infra::workspace::WorkspaceManager;
        use crate::testing::{Behavior, FakeTool};

        async fn runner(dir: &tempfile::TempDir, tool: &FakeTool, timeout: Duration) -> ProvisioningRunner {
            let script = tool.install();
            let workspaces = WorkspaceManager::new(dir.path().join("workspaces"), dir.path().join("modules"));
            workspaces.ensure("ws-1").await.unwrap();
            let lease = workspaces.acquire("ws-1").await.unwrap();
            let status = ToolStatus {
                binary: "fake".into(),
                path: Some(script),
            };
            ProvisioningRunner::new(&status, lease, timeout).unwrap()
        }

        fn hetzner_vars() -> ProviderVariables {
            let resource = crate::domain::Resource::new(
                "web-1",
                crate::domain::ProviderKind::Hetzner,
                "acct",
                "fsn1",
                "cx22",
                "ubuntu-24.04",
            );
            ProviderVariables::translate(&crate::domain::TranslationInput {
                resource: &resource,
                firewall: None,
                bootstrap: None,
                callback_url: "",
            })
            .unwrap()
        }

        #[tokio::test]
        async fn test_plan_then_apply_with_outputs() {
            let dir = tempfile::tempdir().unwrap();
            let tool = FakeTool::new(dir.path());
            let mut runner = runner(&dir, &tool, Duration::from_secs(10)).await;
            let sink = Arc::new(CollectingSink::default());

            let plan = runner.plan(&hetzner_vars(), sink.clone()).await.unwrap();
            assert!(plan.success);
            assert_eq!(plan.summary.as_deref(), Some("Plan: 1 to add, 0 to change, 0 to destroy."));
            let artifact = plan.plan_artifact.expect("plan artifact");
            assert!(runner.dir().join(VARIABLES_FILE).exists());

            let apply = runner.apply(Some(&artifact), sink.clone()).await.unwrap();
            assert!(apply.success);
            assert_eq!(apply.outputs.get("ipv4_address").map(String::as_str), Some("203.0.113.10"));

            assert_eq!(tool.calls(), vec!["plan", "apply", "output"]);
            assert!(sink.messages().iter().any(|m| m.contains("Apply complete!")));
        }

        #[tokio::test]
        async fn test_failure_captures_error_tail() {
            let dir = tempfile::tempdir().unwrap();
            let tool = FakeTool::new(dir.path()).on(
                "destroy",
                Behavior::fail(&["│ Error: droplet is locked", "│ retry later"]),
            );
            let mut runner = runner(&dir, &tool, Duration::from_secs(10)).await;
            let sink = Arc::new(CollectingSink::default());

            let outcome = runner.destroy(sink.clone()).await.unwrap();
            assert!(!outcome.success);
            assert_eq!(outcome.exit_code, Some(1));
            assert_eq!(outcome.error.as_deref(), Some("Error: droplet is locked"));

            let records = sink.0.lock().unwrap();
            assert!(records
                .iter()
                .any(|r| r.level == LogLevel::Error && r.message.contains("droplet is locked")));
        }

        #[tokio::test]
        async fn test_invalid_utf8_line_does_not_stop_reader() {
            let dir = tempfile::tempdir().unwrap();
            let tool = FakeTool::new(dir.path()).on(
                "init",
                Behavior::ok(&["Terraform has been successfully initialized!"]).printing("\\377\\376 provider banner"),
            );
            let mut runner = runner(&dir, &tool, Duration::from_secs(10)).await;
            let sink = Arc::new(CollectingSink::default());

            let outcome = runner.init(sink.clone()).await.unwrap();
            assert!(outcome.success);

            let messages = sink.messages();
            assert!(messages.iter().any(|m| m.ends_with("provider banner") && m.contains('\u{FFFD}')));
            assert!(messages.iter().any(|m| m == "Terraform has been successfully initialized!"));
        }

        #[tokio::test]
        async fn test_timeout() {
            let dir = tempfile::tempdir().unwrap();
            let tool = FakeTool::new(dir.path()).on("init", Behavior::ok(&["slow"]).sleeping(5.0));
            let mut runner = runner(&dir, &tool, Duration::from_millis(200)).await;

            let result = runner.init(Arc::new(CollectingSink::default())).await;
            assert!(matches!(result, Err(OrchestrationError::Timeout(_))));
        }

        #[tokio::test]
        async fn test_credentials_reach_child_env_only() {
            let dir = tempfile::tempdir().unwrap();
            let tool = FakeTool::new(dir.path());
            let runner = runner(&dir, &tool, Duration::from_secs(10)).await;
            let mut runner = runner.with_credentials(&["HCLOUD_TOKEN"], &CredentialBundle::new("secret-token"));
            let sink = Arc::new(CollectingSink::default());

            runner.plan(&hetzner_vars(), sink.clone()).await.unwrap();

            assert!(sink.messages().iter().any(|m| m == "credentials present"));
            assert!(sink.messages().iter().all(|m| !m.contains("secret-token")));
            let vars = std::fs::read_to_string(runner.dir().join(VARIABLES_FILE)).unwrap();
            assert!(!vars.contains("secret-token"));
        }

        #[tokio::test]
        async fn test_missing_binary_is_tool_unavailable() {
            let status = ToolStatus {
                binary: "definitely-not-a-real-tool-12345".into(),
                path: None,
            };
            let dir = tempfile::tempdir().unwrap();
            let workspaces = WorkspaceManager::new(dir.path(), dir.path());
            let lease = workspaces.acquire("ws-1").await.unwrap();
            assert!(matches!(
                ProvisioningRunner::new(&status, lease, Duration::from_secs(1)),
                Err(OrchestrationError::ToolUnavailable(_))
            ));
            assert!(!detect_tool("definitely-not-a-real-tool-12345").available());
        }
    }
}
