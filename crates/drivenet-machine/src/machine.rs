//! 机器对象
//!
//! [`Machine`] 是机器层的唯一入口：
//!
//! - 按命名空间路由的键值读写（`machine:<key>` 经键注册表，`drive:<key>` 直达本地驱动）
//! - 工作模式转换（单机 / 主机 / 从机）
//! - 静态从机表的增删改
//! - 在线机器表（发现应答、数据文件）
//!
//! # 锁顺序
//!
//! `mode` → `slaves` → 会话表。所有修改会话表的路径都持有 `mode` 锁，
//! 因此会话表只需 `ArcSwap` 提供无锁快照，不需要 RCU。

use crate::circuit::FatalEvent;
use crate::config::{ConfigStore, MachineSettings, load_slaves};
use crate::discovery::{AliveRegistry, Announcement, parse_alive};
use crate::error::MachineError;
use crate::factory::{DriverFactory, resolve_address};
use crate::guard::GuardedValues;
use crate::master::SlaveTable;
use crate::mode::{MasterMode, Mode, ModeKind, ModeRequest, SlaveMode, StandaloneMode};
use crate::registry::{KeyRegistry, Resolver};
use crate::session::{SessionSettings, SlaveSession};
use crate::slave::Slave;
use crate::submode::Submode;
use crate::transform::TransformTable;
use arc_swap::ArcSwap;
use drivenet_driver::{Driver, DriverKind, Value};
use drivenet_protocol::Message;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tracing::{debug, info, warn};

pub const MACHINE_NAMESPACE: &str = "machine";
pub const DRIVE_NAMESPACE: &str = "drive";
const OPERATING_MODE: &str = "operating_mode";

/// 拆分 `namespace:key`
fn split_key(key: &str) -> Result<(&str, &str), MachineError> {
    match key.split_once(':') {
        Some((ns @ (MACHINE_NAMESPACE | DRIVE_NAMESPACE), rest)) if !rest.is_empty() => Ok((ns, rest)),
        _ => Err(MachineError::InvalidKey(key.to_string())),
    }
}

pub struct Machine {
    settings: MachineSettings,
    driver: Arc<dyn Driver>,
    factory: Arc<dyn DriverFactory>,
    registry: KeyRegistry,
    mode: Mutex<Box<dyn Mode>>,
    slaves: RwLock<Vec<Slave>>,
    sessions: Arc<ArcSwap<SlaveTable>>,
    alive: Arc<AliveRegistry>,
    fatal: Arc<FatalEvent>,
    guard: Arc<Mutex<GuardedValues>>,
    is_shutdown: AtomicBool,
}

impl Machine {
    /// 创建机器（单机模式）并连接本地驱动
    pub fn new(
        settings: MachineSettings,
        slaves: Vec<Slave>,
        driver: Arc<dyn Driver>,
        factory: Arc<dyn DriverFactory>,
    ) -> Result<Self, MachineError> {
        driver.connect()?;
        let registry = KeyRegistry::new(&driver.attribute_map());
        let alive = Arc::new(AliveRegistry::new(settings.alive_ttl));

        if let Some(path) = &settings.datastore {
            match alive.load(path, Instant::now()) {
                Ok(0) => {},
                Ok(count) => info!(count, path = %path.display(), "alive machines restored"),
                Err(e) => warn!(path = %path.display(), error = %e, "ignoring unreadable datastore"),
            }
        }

        info!(
            serial = %settings.serialnumber,
            address = %settings.advertised_address(),
            slaves = slaves.len(),
            "machine ready"
        );
        Ok(Self {
            guard: Arc::new(Mutex::new(GuardedValues::new(settings.guard_interval))),
            settings,
            driver,
            factory,
            registry,
            mode: Mutex::new(Box::new(StandaloneMode)),
            slaves: RwLock::new(slaves),
            sessions: Arc::new(ArcSwap::from_pointee(SlaveTable::new())),
            alive,
            fatal: Arc::new(FatalEvent::new()),
            is_shutdown: AtomicBool::new(false),
        })
    }

    /// 从配置存储创建
    pub fn from_config(
        config: &dyn ConfigStore,
        driver: Arc<dyn Driver>,
        factory: Arc<dyn DriverFactory>,
    ) -> Result<Self, MachineError> {
        let settings = MachineSettings::from_config(config)?;
        let slaves = load_slaves(config)?;
        Self::new(settings, slaves, driver, factory)
    }

    pub fn settings(&self) -> &MachineSettings {
        &self.settings
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    pub fn registry(&self) -> &KeyRegistry {
        &self.registry
    }

    pub fn serialnumber(&self) -> &str {
        &self.settings.serialnumber
    }

    /// 对外公布的地址
    pub fn address(&self) -> String {
        self.settings.advertised_address()
    }

    pub fn alive(&self) -> &Arc<AliveRegistry> {
        &self.alive
    }

    // ==================== 键值读写 ====================

    /// 读取命名空间键
    pub fn get(&self, key: &str) -> Result<Value, MachineError> {
        let (namespace, rest) = split_key(key)?;
        if namespace == DRIVE_NAMESPACE {
            return Ok(self.driver.get(rest)?);
        }

        let descriptor = self.registry.check_read(rest)?;
        match descriptor.resolver {
            Resolver::Driver => Ok(self.driver.get(rest)?),
            Resolver::Direct => self.direct_value(rest),
        }
    }

    fn direct_value(&self, key: &str) -> Result<Value, MachineError> {
        match key {
            "serialnumber" => Ok(Value::from(self.settings.serialnumber.as_str())),
            "address" => Ok(Value::from(self.address())),
            OPERATING_MODE => Ok(Value::from(self.mode_kind().as_str())),
            "master" => Ok(Value::from(self.master().unwrap_or_default())),
            _ => Err(MachineError::UnknownKey(key.to_string())),
        }
    }

    /// 写入命名空间键（外部命令）
    ///
    /// `machine:operating_mode` 触发模式转换；其它 `machine:` 键先通知当前模式
    /// （从机模式下复位看门狗），写入驱动后再交给模式转发。`drive:` 键直接写驱动。
    pub fn set(&self, key: &str, value: Value) -> Result<(), MachineError> {
        let (namespace, rest) = split_key(key)?;
        if namespace == DRIVE_NAMESPACE {
            return Ok(self.driver.set(rest, value)?);
        }

        let mode = self.mode.lock();
        let (descriptor, value) = self.registry.check_write(rest, value)?;

        if rest == OPERATING_MODE {
            mode.before_write(rest)?;
            drop(mode);
            let request: ModeRequest = value.as_str().unwrap_or_default().parse()?;
            return self.set_operating_mode(request);
        }
        if descriptor.resolver == Resolver::Direct {
            return Err(MachineError::ReadOnly(rest.to_string()));
        }

        mode.before_write(rest)?;
        self.driver.set(rest, value.clone())?;
        mode.after_write(rest, &value);
        Ok(())
    }

    // ==================== 工作模式 ====================

    pub fn mode_kind(&self) -> ModeKind {
        self.mode.lock().kind()
    }

    /// 从机模式下的主机地址
    pub fn master(&self) -> Option<String> {
        self.mode.lock().master().map(str::to_string)
    }

    /// 从机模式下看门狗是否已触发
    pub fn watchdog_tripped(&self) -> bool {
        self.mode
            .lock()
            .watchdog()
            .is_some_and(|w| w.is_tripped())
    }

    /// 模式转换
    ///
    /// # 错误
    /// - `MachineError::NoSlaves`: 进入主机模式时没有可解析的从机
    /// - `MachineError::MissingMaster`: 进入从机模式时没有主机地址
    /// - 会话启动失败时已启动的会话全部停止
    ///
    /// 出错时模式保持不变。转换到当前模式不做任何事。
    pub fn set_operating_mode(&self, request: ModeRequest) -> Result<(), MachineError> {
        let mut mode = self.mode.lock();
        let current = mode.kind();

        if current == request.kind() {
            let same_master = match &request {
                ModeRequest::Slave { master: Some(m) } => mode.master() == Some(m.as_str()),
                _ => true,
            };
            if same_master {
                info!(mode = %current, "already in requested mode");
                return Ok(());
            }
        }

        let next: Box<dyn Mode> = match request {
            ModeRequest::Standalone => {
                mode.shutdown();
                Box::new(StandaloneMode)
            },
            ModeRequest::Slave { master } => {
                let master = master.ok_or(MachineError::MissingMaster)?;
                resolve_address(&master, self.settings.port)?;
                mode.shutdown();
                Box::new(SlaveMode::start(
                    self.driver.clone(),
                    master,
                    self.settings.slave_timeout,
                ))
            },
            ModeRequest::Master => {
                let table = self.build_sessions()?;
                mode.shutdown();
                self.fatal.clear();
                self.guard.lock().clear();
                self.sessions.store(Arc::new(table));
                for session in self.sessions.load().values() {
                    self.enslave(session);
                }
                Box::new(MasterMode::start(
                    self.driver.clone(),
                    self.sessions.clone(),
                    self.guard.clone(),
                    self.fatal.clone(),
                    self.settings.slave_refresh_interval,
                ))
            },
        };

        info!(from = %current, to = %next.kind(), "operating mode changed");
        *mode = next;
        Ok(())
    }

    /// 为所有可解析的从机建立并启动会话；任何一个失败则全部回滚
    fn build_sessions(&self) -> Result<SlaveTable, MachineError> {
        let resolved: Vec<Slave> = {
            let mut slaves = self.slaves.write();
            for slave in slaves.iter_mut() {
                if slave.address().is_none()
                    && let Some(found) = slave.serialnumber().and_then(|s| self.alive.find_by_serial(s))
                {
                    *slave = slave.clone().with_address(found.address.to_string());
                }
            }
            slaves.iter().filter(|s| s.address().is_some()).cloned().collect()
        };
        if resolved.is_empty() {
            return Err(MachineError::NoSlaves);
        }

        let mut table = SlaveTable::new();
        for slave in resolved {
            match self.start_session(slave) {
                Ok(session) => {
                    table.insert(session.slave().identity().to_string(), session);
                },
                Err(e) => {
                    for session in table.values() {
                        session.exit();
                    }
                    return Err(e);
                },
            }
        }
        Ok(table)
    }

    fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            refresh_interval: self.settings.slave_refresh_interval,
            request_timeout: self.settings.request_timeout,
            bridge_poll_interval: self.settings.bridge_poll_interval,
            keepalive_interval: self.settings.keepalive_interval,
            error_threshold: self.settings.error_threshold,
            ..SessionSettings::default()
        }
    }

    fn start_session(&self, slave: Slave) -> Result<Arc<SlaveSession>, MachineError> {
        let driver = self.factory.create(&slave, &self.settings)?;
        let session = SlaveSession::new(slave, driver, self.session_settings(), self.fatal.clone());
        session.start()?;
        Ok(session)
    }

    /// 通知从机跟随本机
    fn enslave(&self, session: &SlaveSession) {
        let request = ModeRequest::slave(self.address()).to_string();
        let key = format!("{MACHINE_NAMESPACE}:{OPERATING_MODE}");
        if let Err(e) = session.set_to_remote_detached(&key, Value::Str(request)) {
            warn!(slave = %session.slave(), error = %e, "failed to enslave");
        }
    }

    // ==================== 从机表 ====================

    pub fn slaves(&self) -> Vec<Slave> {
        self.slaves.read().clone()
    }

    pub fn sessions(&self) -> Vec<Arc<SlaveSession>> {
        self.sessions.load().values().cloned().collect()
    }

    /// 按序列号或地址查找会话
    pub fn session(&self, id: &str) -> Option<Arc<SlaveSession>> {
        self.sessions
            .load()
            .values()
            .find(|s| s.slave().matches(id))
            .cloned()
    }

    /// 添加从机；主机模式下立即建立会话并通知从机
    pub fn add_slave(
        &self,
        kind: DriverKind,
        address: &str,
        submode: Submode,
        transforms: TransformTable,
    ) -> Result<Slave, MachineError> {
        let mode = self.mode.lock();
        let slave = Slave::new(kind, address, submode).with_transforms(transforms);
        {
            let mut slaves = self.slaves.write();
            if slaves.iter().any(|s| s.matches(address)) {
                return Err(MachineError::SlaveExists(slave.to_string()));
            }
            slaves.push(slave.clone());
        }

        if mode.kind() == ModeKind::Master {
            match self.start_session(slave.clone()) {
                Ok(session) => {
                    self.enslave(&session);
                    self.insert_session(session);
                },
                Err(e) => {
                    self.slaves.write().retain(|s| !s.matches(address));
                    warn!(%slave, error = %e, "failed to attach slave");
                    return Err(e);
                },
            }
        }
        info!(%slave, submode = %slave.submode(), "slave added");
        Ok(slave)
    }

    /// 按序列号或地址移除从机，停止其会话
    pub fn remove_slave(&self, id: &str) -> Result<Slave, MachineError> {
        let _mode = self.mode.lock();
        let removed = {
            let mut slaves = self.slaves.write();
            let index = slaves
                .iter()
                .position(|s| s.matches(id))
                .ok_or_else(|| MachineError::SlaveNotFound(id.to_string()))?;
            slaves.remove(index)
        };

        for session in self.take_sessions(|s| s.matches(id)) {
            session.exit();
        }
        info!(slave = %removed, "slave removed");
        Ok(removed)
    }

    /// 修改从机子模式（替换从机记录）
    pub fn set_slave_submode(&self, id: &str, submode: Submode) -> Result<Slave, MachineError> {
        let _mode = self.mode.lock();
        let updated = {
            let mut slaves = self.slaves.write();
            let slave = slaves
                .iter_mut()
                .find(|s| s.matches(id))
                .ok_or_else(|| MachineError::SlaveNotFound(id.to_string()))?;
            *slave = slave.clone().with_submode(submode);
            slave.clone()
        };
        if let Some(session) = self.session(id) {
            session.replace_slave(updated.clone());
        }
        Ok(updated)
    }

    fn insert_session(&self, session: Arc<SlaveSession>) {
        let mut table = SlaveTable::clone(&self.sessions.load());
        table.insert(session.slave().identity().to_string(), session);
        self.sessions.store(Arc::new(table));
    }

    fn take_sessions(&self, predicate: impl Fn(&Slave) -> bool) -> Vec<Arc<SlaveSession>> {
        let mut table = SlaveTable::clone(&self.sessions.load());
        let keys: Vec<String> = table
            .iter()
            .filter(|(_, s)| predicate(&s.slave()))
            .map(|(k, _)| k.clone())
            .collect();
        let taken = keys.iter().filter_map(|k| table.remove(k)).collect();
        self.sessions.store(Arc::new(table));
        taken
    }

    // ==================== 在线机器 ====================

    /// 处理 `/alive` 通告
    ///
    /// 更新在线机器表；按序列号配置的从机获得新地址，主机模式下随即建立（或重建）会话。
    /// 返回解析出的通告，不是 `/alive` 消息时返回 `None`。
    pub fn update_alive_machines(&self, msg: &Message) -> Option<Announcement> {
        let announcement = parse_alive(msg)?;
        if announcement.serialnumber == self.settings.serialnumber {
            return Some(announcement);
        }

        if self.alive.upsert(&announcement, Instant::now()) {
            self.save_datastore();
        }

        let mode = self.mode.lock();
        let address = announcement.address.to_string();
        let attached: Vec<(Slave, bool)> = {
            let mut slaves = self.slaves.write();
            slaves
                .iter_mut()
                .filter(|s| s.serialnumber() == Some(announcement.serialnumber.as_str()))
                .map(|slave| {
                    let moved = slave.address() != Some(address.as_str());
                    if moved {
                        *slave = slave.clone().with_address(address.clone());
                    }
                    (slave.clone(), moved)
                })
                .collect()
        };

        if mode.kind() == ModeKind::Master {
            for (slave, moved) in attached {
                let serial = announcement.serialnumber.as_str();
                if !moved && self.session(serial).is_some() {
                    continue;
                }
                for stale in self.take_sessions(|s| s.matches(serial)) {
                    stale.exit();
                }
                match self.start_session(slave.clone()) {
                    Ok(session) => {
                        info!(%slave, "discovered slave attached");
                        self.enslave(&session);
                        self.insert_session(session);
                    },
                    Err(e) => warn!(%slave, error = %e, "failed to attach discovered slave"),
                }
            }
        }
        Some(announcement)
    }

    fn save_datastore(&self) {
        let Some(path) = &self.settings.datastore else {
            return;
        };
        if let Err(e) = self.alive.save(path) {
            warn!(path = %path.display(), error = %e, "failed to save datastore");
        }
    }

    // ==================== 致命事件 ====================

    pub fn is_fatal(&self) -> bool {
        self.fatal.is_set()
    }

    pub fn fatal_reason(&self) -> Option<String> {
        self.fatal.reason()
    }

    /// 清除致命事件并复位所有会话的熔断器
    pub fn clear_fatal(&self) {
        self.fatal.clear();
        for session in self.sessions.load().values() {
            session.reset_errors();
        }
    }

    /// 回到单机模式、保存在线机器表、断开本地驱动（幂等）
    pub fn shutdown(&self) {
        if self.is_shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        {
            let mut mode = self.mode.lock();
            mode.shutdown();
            *mode = Box::new(StandaloneMode);
        }
        self.save_datastore();
        self.driver.exit();
        debug!(serial = %self.settings.serialnumber, "machine shut down");
    }
}

impl Drop for Machine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
