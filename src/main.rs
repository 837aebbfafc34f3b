//! XJP Provision Agent - 云资源编排代理
//!
//! Usage:
//! - Normal mode: `xjp-provision-agent`
//! - With custom port: `xjp-provision-agent --port 19999`
//! - With custom data dir: `xjp-provision-agent --data-dir /var/lib/xjp-provision`

use std::path::PathBuf;

use xjp_provision_agent::RuntimeConfig;

/// 解析命令行参数
fn parse_args() -> RuntimeConfig {
    let args: Vec<String> = std::env::args().collect();
    let mut config = RuntimeConfig::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--port" if i + 1 < args.len() => {
                config.port_override = args[i + 1].parse().ok();
                if config.port_override.is_none() {
                    eprintln!("Invalid port: {}", args[i + 1]);
                    std::process::exit(2);
                }
                i += 2;
            }
            "--data-dir" if i + 1 < args.len() => {
                config.data_dir = Some(PathBuf::from(&args[i + 1]));
                i += 2;
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            other => {
                eprintln!("Ignoring unknown argument: {}", other);
                i += 1;
            }
        }
    }

    config
}

fn print_help() {
    println!("XJP Provision Agent - 云资源编排代理");
    println!();
    println!("USAGE:");
    println!("    xjp-provision-agent [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("    --port <PORT>        Override the listening port");
    println!("    --data-dir <DIR>     Override the data directory");
    println!("    -h, --help           Print help information");
    println!();
    println!("ENVIRONMENT:");
    println!("    PROVISION_AGENT_API_KEY   API key for mutating endpoints");
    println!("    XJP_DATA_DIR              Data directory (default ./data)");
    println!("    PROVISION_TOOL_BINARY     Provisioning tool binary (default terraform)");
    println!("    RUST_LOG                  Log filter (default info)");
}

fn main() {
    let config = parse_args();

    let rt = tokio::runtime::Runtime::new().expect("Failed to create runtime");
    if let Err(e) = rt.block_on(xjp_provision_agent::init_and_run_agent_with_config(config)) {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
