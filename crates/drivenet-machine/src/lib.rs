//! # drivenet Machine Layer
//!
//! 机器层：单机 / 主机 / 从机三种工作模式，以及主机对从机的协调控制。
//!
//! ## 核心组件
//!
//! - [`Machine`]: 键值路由、模式转换、从机表、在线机器表
//! - [`SlaveSession`]: 每台从机一个会话（桥接线程 + 巡检线程 + 推送缓存 + 熔断器）
//! - [`MasterLoop`]: 主机协调循环（保护间隔读取 → 变换 → 变化抑制推送）
//! - [`Watchdog`]: 从机模式下的命令超时看门狗
//! - [`Discovery`] / [`AliveRegistry`]: 广播发现与在线机器表
//! - [`Responder`]: 网络请求响应线程
//!
//! ## 快速开始
//!
//! ```rust,no_run
//! use drivenet_machine::{Machine, ModeRequest, NetworkDriverFactory, TomlConfig};
//! use drivenet_driver::VirtualDriver;
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = TomlConfig::load("drivenet.toml")?;
//! let machine = Machine::from_config(
//!     &config,
//!     Arc::new(VirtualDriver::new()),
//!     Arc::new(NetworkDriverFactory),
//! )?;
//! machine.set_operating_mode(ModeRequest::Master)?;
//! # Ok(())
//! # }
//! ```

pub mod circuit;
pub mod config;
pub mod discovery;
mod error;
pub mod factory;
pub mod guard;
pub mod machine;
pub mod master;
pub mod mode;
pub mod registry;
pub mod responder;
pub mod session;
pub mod slave;
pub mod submode;
pub mod transform;
pub mod watchdog;

pub use circuit::{CircuitBreaker, FatalEvent};
pub use config::{ConfigStore, DEFAULT_PORT, MachineSettings, TomlConfig, load_slaves};
pub use discovery::{AliveMachine, AliveRegistry, Announcement, Discovery, parse_alive};
pub use error::{
    ConfigError, DatastoreError, MachineError, SlaveMachineError, TransformError,
};
pub use factory::{DriverFactory, LoopbackDriverFactory, NetworkDriverFactory};
pub use guard::GuardedValues;
pub use machine::Machine;
pub use master::{CycleReport, MasterLoop, SlaveTable};
pub use mode::{Mode, ModeKind, ModeRequest};
pub use registry::{KeyDescriptor, KeyRegistry, Resolver};
pub use responder::Responder;
pub use session::{SessionSettings, SessionStats, SlaveSession};
pub use slave::Slave;
pub use submode::Submode;
pub use transform::{Transform, TransformTable};
pub use watchdog::{Watchdog, WatchdogAction, WatchdogState};
