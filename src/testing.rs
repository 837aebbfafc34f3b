//! 测试辅助：用 shell 脚本模拟 provisioning 工具

use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// 单个子命令的模拟行为
#[derive(Clone, Default)]
pub struct Behavior {
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
    /// 以 printf 格式输出的原始行，可含八进制转义
    pub raw_stdout: Vec<String>,
    pub exit_code: i32,
    pub sleep_secs: Option<f32>,
}

impl Behavior {
    pub fn ok(lines: &[&str]) -> Self {
        Self {
            stdout: lines.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn fail(stderr: &[&str]) -> Self {
        Self {
            stderr: stderr.iter().map(|s| s.to_string()).collect(),
            exit_code: 1,
            ..Default::default()
        }
    }

    pub fn printing(mut self, format: &str) -> Self {
        self.raw_stdout.push(format.to_string());
        self
    }

    pub fn sleeping(mut self, secs: f32) -> Self {
        self.sleep_secs = Some(secs);
        self
    }
}

/// 模拟工具
///
/// 每次调用把子命令名追加到 calls.log；若调用时另一个调用仍在同一工作区运行，
/// 追加一行 OVERLAP。
pub struct FakeTool {
    root: PathBuf,
    behaviors: HashMap<String, Behavior>,
}

impl FakeTool {
    pub fn new(root: &Path) -> Self {
        let mut behaviors = HashMap::new();
        behaviors.insert("init".to_string(), Behavior::ok(&["Terraform has been successfully initialized!"]));
        behaviors.insert(
            "plan".to_string(),
            Behavior::ok(&["Plan: 1 to add, 0 to change, 0 to destroy."]),
        );
        behaviors.insert(
            "apply".to_string(),
            Behavior::ok(&["Apply complete! Resources: 1 added, 0 changed, 0 destroyed."]),
        );
        behaviors.insert(
            "destroy".to_string(),
            Behavior::ok(&["Destroy complete! Resources: 1 destroyed."]),
        );
        behaviors.insert("refresh".to_string(), Behavior::ok(&["Refreshing state..."]));
        behaviors.insert(
            "output".to_string(),
            Behavior::ok(&[r#"{"id":{"sensitive":false,"type":"string","value":"4242"},"ipv4_address":{"sensitive":false,"type":"string","value":"203.0.113.10"}}"#]),
        );
        Self {
            root: root.to_path_buf(),
            behaviors,
        }
    }

    pub fn on(mut self, subcommand: &str, behavior: Behavior) -> Self {
        self.behaviors.insert(subcommand.to_string(), behavior);
        self
    }

    pub fn calls_path(&self) -> PathBuf {
        self.root.join("calls.log")
    }

    /// 已记录的调用
    pub fn calls(&self) -> Vec<String> {
        std::fs::read_to_string(self.calls_path())
            .map(|s| s.lines().map(|l| l.to_string()).collect())
            .unwrap_or_default()
    }

    /// 生成可执行脚本，返回路径
    #[cfg(unix)]
    pub fn install(&self) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let calls = self.calls_path();
        let mut script = String::from("#!/bin/sh\n");
        script.push_str(&format!(
            "if [ -e .running ]; then echo OVERLAP >> '{}'; fi\ntouch .running\necho \"$1\" >> '{}'\n",
            calls.display(),
            calls.display()
        ));
        script.push_str("if [ -n \"$DIGITALOCEAN_TOKEN$HCLOUD_TOKEN\" ]; then echo \"credentials present\" >&2; fi\n");
        script.push_str("case \"$1\" in\n");
        for (subcommand, behavior) in &self.behaviors {
            script.push_str(&format!("  {})\n", subcommand));
            if let Some(secs) = behavior.sleep_secs {
                script.push_str(&format!("    sleep {}\n", secs));
            }
            for format in &behavior.raw_stdout {
                script.push_str(&format!("    printf '{}\\n'\n", format));
            }
            for line in &behavior.stdout {
                script.push_str(&format!("    echo '{}'\n", line));
            }
            for line in &behavior.stderr {
                script.push_str(&format!("    echo '{}' >&2\n", line));
            }
            if subcommand == "plan" && behavior.exit_code == 0 {
                script.push_str("    touch tfplan\n");
            }
            script.push_str(&format!("    rm -f .running\n    exit {}\n    ;;\n", behavior.exit_code));
        }
        script.push_str("esac\nrm -f .running\nexit 0\n");

        let path = self.root.join("fake-tool.sh");
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }
}
