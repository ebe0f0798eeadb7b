use alloc::{string::String, sync::Arc, vec::Vec};

use defines::error::{errno, KResult};
use klocks::SpinMutex;

use crate::{Device, Io};

struct Entry {
    name: String,
    instno: usize,
    device: Arc<dyn Device>,
}

/// 设备名到设备的表。同名设备按登记顺序从 0 开始编号
pub struct DeviceRegistry {
    entries: SpinMutex<Vec<Entry>>,
}

/// 内核全局的设备表
pub static DEVICES: DeviceRegistry = DeviceRegistry::new();

impl DeviceRegistry {
    pub const fn new() -> Self {
        Self {
            entries: SpinMutex::new(Vec::new()),
        }
    }

    /// 登记设备，返回它在同名设备中的实例号
    pub fn register(&self, name: &str, device: Arc<dyn Device>) -> usize {
        let mut entries = self.entries.lock();
        let instno = entries.iter().filter(|e| e.name == name).count();
        entries.push(Entry {
            name: String::from(name),
            instno,
            device,
        });
        log::trace!("device {name}{instno} registered");
        instno
    }

    pub fn open(&self, name: &str, instno: usize) -> KResult<Arc<dyn Io>> {
        let device = self
            .entries
            .lock()
            .iter()
            .find(|e| e.name == name && e.instno == instno)
            .map(|e| Arc::clone(&e.device))
            .ok_or(errno::ENODEV)?;
        // 打开设备可能会操作中断控制器，不要持着表锁
        device.open()
    }

    /// 名为 `name` 的设备数量
    pub fn count(&self, name: &str) -> usize {
        self.entries.lock().iter().filter(|e| e.name == name).count()
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
