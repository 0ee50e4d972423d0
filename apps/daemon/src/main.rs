//! drivenet 守护进程主入口
//!
//! ```bash
//! # 单机模式，虚拟驱动
//! drivenetd --serialnumber DN-0001
//!
//! # 读取配置文件并进入主机模式
//! drivenetd --config drivenet.toml --mode master
//! ```

mod daemon;

use anyhow::{Context, Result};
use clap::Parser;
use daemon::{Daemon, DaemonConfig, local_driver};
use drivenet_driver::DriverKind;
use drivenet_machine::{Machine, MachineSettings, ModeRequest, NetworkDriverFactory, TomlConfig, load_slaves};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// drivenet 守护进程
///
/// 把本机驱动器作为网络上的一台机器，响应键值读写与模式切换
#[derive(Parser, Debug)]
#[command(name = "drivenetd")]
#[command(about = "drivenet daemon - networked motor drive with master/slave coordination", long_about = None)]
#[command(version)]
struct Args {
    /// 配置文件（TOML）
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// 覆盖 [machine] serialnumber
    #[arg(long)]
    serialnumber: Option<String>,

    /// 覆盖 [machine] port
    #[arg(short, long)]
    port: Option<u16>,

    /// 覆盖 [machine] address（对外公布的 ip:port）
    #[arg(long)]
    address: Option<String>,

    /// 启动后切换到的模式: standalone | master | "slave <ip:port>"
    #[arg(short, long)]
    mode: Option<String>,

    /// 本机驱动类型: virtual | osc | serial
    #[arg(long, default_value = "virtual")]
    drive: String,

    /// 本机驱动地址（osc 为 ip[:port]，serial 为设备文件）
    #[arg(long)]
    drive_address: Option<String>,

    /// 发现广播周期（秒），0 表示只在启动时广播
    #[arg(long, default_value = "5")]
    discovery_interval: u64,
}

fn main() -> Result<()> {
    // 初始化日志
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("drivenetd=info,drivenet_machine=info")),
        )
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => TomlConfig::load(path).with_context(|| format!("failed to load {}", path.display()))?,
        None => TomlConfig::new(),
    };
    if let Some(serial) = &args.serialnumber {
        config.set("machine", "serialnumber", serial);
    }
    if let Some(port) = args.port {
        config.set("machine", "port", &port.to_string());
    }
    if let Some(address) = &args.address {
        config.set("machine", "address", address);
    }

    let initial_mode = args
        .mode
        .as_deref()
        .map(str::parse::<ModeRequest>)
        .transpose()
        .context("invalid --mode")?;

    let settings = MachineSettings::from_config(&config)?;
    let slaves = load_slaves(&config)?;
    let kind: DriverKind = args.drive.parse()?;
    let driver = local_driver(kind, args.drive_address.as_deref(), &settings)?;
    let machine = Arc::new(Machine::new(settings, slaves, driver, Arc::new(NetworkDriverFactory))?);

    let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded(1);
    ctrlc::set_handler(move || {
        let _ = shutdown_tx.try_send(());
    })
    .context("failed to set signal handler")?;

    let mut daemon = Daemon::new(
        machine,
        DaemonConfig {
            initial_mode,
            discovery_interval: (args.discovery_interval > 0)
                .then(|| Duration::from_secs(args.discovery_interval)),
        },
    )?;

    info!(
        serial = daemon.machine().serialnumber(),
        address = %daemon.machine().address(),
        drive = %kind,
        "drivenetd started, press Ctrl+C to stop"
    );
    daemon.run(shutdown_rx)
}
