//! Gattlink CLI
//!
//! 扫码得到外设的服务 UUID 后，在终端里与其收发文本消息

mod chat;
mod events;
mod probe;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use gattlink_core::{BtleplugTransport, ClientSettings, Identifier, Session, SessionConfig};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "gattlink", version, about = "BLE GATT 文本消息客户端")]
struct Cli {
    /// 输出调试日志
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 解析二维码内容，输出规范形式的 UUID
    Parse {
        /// 二维码中的文本
        token: String,
    },
    /// 连接外设并交互式收发消息
    Chat {
        /// 目标服务 UUID (默认: 上次使用的)
        #[arg(short, long)]
        id: Option<String>,
        /// 扫描超时时间 (秒)
        #[arg(short, long)]
        timeout: Option<u64>,
        /// 以 JSON 行输出事件
        #[arg(long)]
        json: bool,
    },
    /// 连接 -> 读取 -> 写入 -> 等待一条通知 -> 断开
    Probe {
        /// 目标服务 UUID (默认: 上次使用的)
        #[arg(short, long)]
        id: Option<String>,
        /// 写入的文本
        #[arg(short, long, default_value = "ping")]
        message: String,
    },
    /// 查看或修改设置
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// 显示当前设置
    Show,
    /// 设置默认的目标 UUID
    SetId { token: String },
}

fn init_logging(verbose: bool) {
    // 桥接 log crate（gattlink-core 使用）到 tracing
    let _ = tracing_log::LogTracer::init();

    let default = if verbose {
        "info,gattlink_core=debug"
    } else {
        "warn"
    };
    // 日志写到 stderr，stdout 留给消息
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

/// `--id` 优先，否则使用设置中保存的上次标识
fn resolve_identifier(id: Option<&str>, settings: &ClientSettings) -> Result<Identifier> {
    match id {
        Some(token) => Ok(Identifier::parse(token)?),
        None => settings
            .last_identifier
            .context("No identifier given and none saved; pass --id <UUID>"),
    }
}

async fn open_session(identifier: Identifier, config: SessionConfig) -> Result<Session> {
    let transport = BtleplugTransport::new()
        .await
        .context("Failed to open Bluetooth adapter")?;
    Ok(Session::create(identifier, Arc::new(transport), config))
}

fn remember(settings: &mut ClientSettings, identifier: Identifier) {
    if settings.last_identifier == Some(identifier) {
        return;
    }
    settings.last_identifier = Some(identifier);
    if let Err(e) = settings.save() {
        tracing::warn!("Failed to save settings: {}", e);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut settings = ClientSettings::load();

    match cli.command {
        Commands::Parse { token } => {
            let identifier = Identifier::parse(&token)?;
            println!("{}", identifier);
        }
        Commands::Chat { id, timeout, json } => {
            let identifier = resolve_identifier(id.as_deref(), &settings)?;
            let mut config = settings.session.clone();
            if let Some(secs) = timeout {
                config = config.with_scan_timeout(Duration::from_secs(secs));
            }

            let session = open_session(identifier, config).await?;
            let connected = chat::run(&session, json).await?;
            if connected {
                remember(&mut settings, identifier);
            }
        }
        Commands::Probe { id, message } => {
            let identifier = resolve_identifier(id.as_deref(), &settings)?;
            let session = open_session(identifier, settings.session.clone()).await?;
            probe::run(&session, &message).await?;
            remember(&mut settings, identifier);
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                println!("# {}", ClientSettings::config_path().display());
                print!("{}", toml::to_string_pretty(&settings)?);
            }
            ConfigAction::SetId { token } => {
                let identifier = Identifier::parse(&token)?;
                settings.last_identifier = Some(identifier);
                settings.save()?;
                println!("✅ 默认目标: {}", identifier);
            }
        },
    }

    Ok(())
}
