//! VirtIO-MMIO 传输层，见 VirtIO 1.2 §4.2.2

use core::{cell::UnsafeCell, mem::offset_of, ptr::NonNull};

use defines::error::{errno, KResult};

use crate::{
    select_features, BlkConfig, DeviceStatus, DeviceType, Features, InterruptStatus,
    VirtioTransport,
};

const MAGIC_VALUE: u32 = 0x7472_6976;
const MMIO_VERSION: u32 = 2;

#[repr(transparent)]
struct Reg(UnsafeCell<u32>);

impl Reg {
    #[inline]
    fn read(&self) -> u32 {
        unsafe { self.0.get().read_volatile() }
    }

    #[inline]
    fn write(&self, value: u32) {
        unsafe { self.0.get().write_volatile(value) }
    }
}

/// 寄存器布局
#[repr(C)]
struct MmioRegs {
    magic: Reg,
    version: Reg,
    device_id: Reg,
    vendor_id: Reg,
    device_features: Reg,
    device_features_sel: Reg,
    _reserved0: [u32; 2],
    driver_features: Reg,
    driver_features_sel: Reg,
    _reserved1: [u32; 2],
    queue_sel: Reg,
    queue_num_max: Reg,
    queue_num: Reg,
    _reserved2: [u32; 2],
    queue_ready: Reg,
    _reserved3: [u32; 2],
    queue_notify: Reg,
    _reserved4: [u32; 3],
    interrupt_status: Reg,
    interrupt_ack: Reg,
    _reserved5: [u32; 2],
    status: Reg,
    _reserved6: [u32; 3],
    queue_desc_low: Reg,
    queue_desc_high: Reg,
    _reserved7: [u32; 2],
    queue_driver_low: Reg,
    queue_driver_high: Reg,
    _reserved8: [u32; 2],
    queue_device_low: Reg,
    queue_device_high: Reg,
    _reserved9: [u32; 6],
    queue_reset: Reg,
    _reserved10: [u32; 14],
    config_generation: Reg,
    /// 设备相关的配置空间，块设备只用到前 32 字节
    config: [Reg; 8],
}

const _: () = {
    assert!(offset_of!(MmioRegs, device_id) == 0x008);
    assert!(offset_of!(MmioRegs, device_features_sel) == 0x014);
    assert!(offset_of!(MmioRegs, driver_features) == 0x020);
    assert!(offset_of!(MmioRegs, queue_sel) == 0x030);
    assert!(offset_of!(MmioRegs, queue_num) == 0x038);
    assert!(offset_of!(MmioRegs, queue_ready) == 0x044);
    assert!(offset_of!(MmioRegs, queue_notify) == 0x050);
    assert!(offset_of!(MmioRegs, interrupt_status) == 0x060);
    assert!(offset_of!(MmioRegs, interrupt_ack) == 0x064);
    assert!(offset_of!(MmioRegs, status) == 0x070);
    assert!(offset_of!(MmioRegs, queue_desc_low) == 0x080);
    assert!(offset_of!(MmioRegs, queue_driver_low) == 0x090);
    assert!(offset_of!(MmioRegs, queue_device_low) == 0x0a0);
    assert!(offset_of!(MmioRegs, queue_reset) == 0x0c0);
    assert!(offset_of!(MmioRegs, config_generation) == 0x0fc);
    assert!(offset_of!(MmioRegs, config) == 0x100);
};

pub struct MmioTransport {
    regs: NonNull<MmioRegs>,
}

// 寄存器本身就是给多方并发访问的
unsafe impl Send for MmioTransport {}
unsafe impl Sync for MmioTransport {}

impl MmioTransport {
    /// 检查 `base` 处是否有一个 v2 的 VirtIO-MMIO 设备。空槽位（Device ID 为 0）返回 `None`
    ///
    /// # Safety
    ///
    /// `base` 必须是映射好的 VirtIO-MMIO 寄存器块
    pub unsafe fn new(base: usize) -> Option<Self> {
        let regs = NonNull::new(base as *mut MmioRegs)?;
        let this = Self { regs };
        let r = this.regs();
        if r.magic.read() != MAGIC_VALUE {
            warn!("virtio-mmio at {base:#x}: bad magic {:#x}", r.magic.read());
            return None;
        }
        if r.version.read() != MMIO_VERSION {
            warn!("virtio-mmio at {base:#x}: unsupported version {}", r.version.read());
            return None;
        }
        if r.device_id.read() == 0 {
            return None;
        }
        debug!(
            "virtio-mmio at {base:#x}: device {:?}, vendor {:#x}",
            this.device_type(),
            r.vendor_id.read()
        );
        Some(this)
    }

    #[inline]
    fn regs(&self) -> &MmioRegs {
        unsafe { self.regs.as_ref() }
    }

    /// 读 64 位以内的配置字段要用 generation 保证读到的是一致的快照
    fn read_config<T>(&self, f: impl Fn(&[Reg; 8]) -> T) -> T {
        let r = self.regs();
        loop {
            let before = r.config_generation.read();
            let value = f(&r.config);
            if r.config_generation.read() == before {
                return value;
            }
        }
    }
}

impl VirtioTransport for MmioTransport {
    fn device_type(&self) -> DeviceType {
        DeviceType::from(self.regs().device_id.read())
    }

    fn status(&self) -> DeviceStatus {
        DeviceStatus::from_bits_retain(self.regs().status.read())
    }

    fn set_status(&self, status: DeviceStatus) {
        self.regs().status.write(status.bits());
    }

    fn negotiate_features(&self, wanted: Features, needed: Features) -> KResult<Features> {
        let r = self.regs();
        r.device_features_sel.write(0);
        let low = r.device_features.read() as u64;
        r.device_features_sel.write(1);
        let high = r.device_features.read() as u64;
        let offered = Features::from_bits_retain(high << 32 | low);

        let Some(accepted) = select_features(offered, wanted, needed) else {
            debug!("device offers {offered:?}, needs {needed:?}");
            return Err(errno::UNSUPPORTED);
        };
        r.driver_features_sel.write(0);
        r.driver_features.write(accepted.bits() as u32);
        r.driver_features_sel.write(1);
        r.driver_features.write((accepted.bits() >> 32) as u32);

        self.add_status(DeviceStatus::FEATURES_OK);
        if !self.status().contains(DeviceStatus::FEATURES_OK) {
            return Err(errno::UNSUPPORTED);
        }
        Ok(accepted)
    }

    fn read_blk_config(&self) -> BlkConfig {
        self.read_config(|c| {
            let geometry = c[4].read();
            let topology = c[6].read();
            BlkConfig {
                capacity: (c[1].read() as u64) << 32 | c[0].read() as u64,
                size_max: c[2].read(),
                seg_max: c[3].read(),
                cylinders: geometry as u16,
                heads: (geometry >> 16) as u8,
                sectors: (geometry >> 24) as u8,
                blk_size: c[5].read(),
                physical_block_exp: topology as u8,
                alignment_offset: (topology >> 8) as u8,
                min_io_size: (topology >> 16) as u16,
                opt_io_size: c[7].read(),
            }
        })
    }

    fn attach_queue(&self, qid: u16, size: u16, desc: usize, used: usize, avail: usize) {
        let r = self.regs();
        r.queue_sel.write(qid as u32);
        let max = r.queue_num_max.read();
        if max < size as u32 {
            warn!("virtqueue {qid}: size {size} exceeds device maximum {max}");
        }
        r.queue_num.write(size as u32);
        r.queue_desc_low.write(desc as u32);
        r.queue_desc_high.write((desc as u64 >> 32) as u32);
        r.queue_driver_low.write(avail as u32);
        r.queue_driver_high.write((avail as u64 >> 32) as u32);
        r.queue_device_low.write(used as u32);
        r.queue_device_high.write((used as u64 >> 32) as u32);
    }

    fn enable_queue(&self, qid: u16) {
        let r = self.regs();
        r.queue_sel.write(qid as u32);
        r.queue_ready.write(1);
    }

    fn reset_queue(&self, qid: u16) {
        let r = self.regs();
        r.queue_sel.write(qid as u32);
        r.queue_reset.write(1);
        // 设备完成重置后读回 0
        while r.queue_reset.read() != 0 {
            core::hint::spin_loop();
        }
    }

    fn notify_avail(&self, qid: u16) {
        self.regs().queue_notify.write(qid as u32);
    }

    fn interrupt_status(&self) -> InterruptStatus {
        InterruptStatus::from_bits_retain(self.regs().interrupt_status.read())
    }

    fn ack_interrupt(&self, status: InterruptStatus) {
        self.regs().interrupt_ack.write(status.bits());
    }
}

#[cfg(test)]
mod tests {
    use core::mem::size_of;

    use super::*;

    /// 一块假的寄存器内存，只能检查驱动写进去的值
    fn fake_regs(device_id: u32) -> Box<[u32; size_of::<MmioRegs>() / 4]> {
        let mut mem = Box::new([0u32; size_of::<MmioRegs>() / 4]);
        mem[0] = MAGIC_VALUE;
        mem[1] = MMIO_VERSION;
        mem[2] = device_id;
        mem
    }

    #[test]
    fn probe_checks_header() {
        let mut mem = fake_regs(2);
        let t = unsafe { MmioTransport::new(mem.as_mut_ptr() as usize) }.unwrap();
        assert_eq!(t.device_type(), DeviceType::Block);

        let mut empty = fake_regs(0);
        assert!(unsafe { MmioTransport::new(empty.as_mut_ptr() as usize) }.is_none());

        let mut legacy = fake_regs(2);
        legacy[1] = 1;
        assert!(unsafe { MmioTransport::new(legacy.as_mut_ptr() as usize) }.is_none());

        let mut garbage = fake_regs(2);
        garbage[0] = 0xdead_beef;
        assert!(unsafe { MmioTransport::new(garbage.as_mut_ptr() as usize) }.is_none());
    }

    #[test]
    fn queue_registers() {
        let mut mem = fake_regs(2);
        let t = unsafe { MmioTransport::new(mem.as_mut_ptr() as usize) }.unwrap();
        t.attach_queue(0, 4, 0x1_8000_1000, 0x8000_3000, 0x8000_2000);
        t.enable_queue(0);
        t.notify_avail(0);
        t.set_status(DeviceStatus::ACKNOWLEDGE);
        t.add_status(DeviceStatus::DRIVER);
        drop(t);
        assert_eq!(mem[0x038 / 4], 4);
        assert_eq!(mem[0x080 / 4], 0x8000_1000);
        assert_eq!(mem[0x084 / 4], 1);
        assert_eq!(mem[0x090 / 4], 0x8000_2000);
        assert_eq!(mem[0x0a0 / 4], 0x8000_3000);
        assert_eq!(mem[0x044 / 4], 1);
        assert_eq!(mem[0x070 / 4], 3);
    }

    #[test]
    fn config_space() {
        let mut mem = fake_regs(2);
        mem[0x100 / 4] = 16;
        mem[0x104 / 4] = 1;
        mem[0x114 / 4] = 4096;
        mem[0x118 / 4] = 3 | 8 << 16;
        let t = unsafe { MmioTransport::new(mem.as_mut_ptr() as usize) }.unwrap();
        let config = t.read_blk_config();
        assert_eq!(config.capacity, (1 << 32) + 16);
        assert_eq!(config.blk_size, 4096);
        assert_eq!(config.physical_block_exp, 3);
        assert_eq!(config.min_io_size, 8);
    }

    #[test]
    fn negotiation_writes_accepted_words() {
        let mut mem = fake_regs(2);
        // 假内存不区分 sel，高低两个字读到的都是这个值
        mem[0x010 / 4] = 1 << 28 | 1 << 6 | 1;
        let t = unsafe { MmioTransport::new(mem.as_mut_ptr() as usize) }.unwrap();
        let accepted = t
            .negotiate_features(Features::BLK_BLK_SIZE, Features::INDIRECT_DESC)
            .unwrap();
        assert!(accepted.contains(Features::INDIRECT_DESC | Features::BLK_BLK_SIZE));
        assert!(t.status().contains(DeviceStatus::FEATURES_OK));
        assert_eq!(
            t.negotiate_features(Features::empty(), Features::RING_RESET),
            Err(errno::UNSUPPORTED)
        );
    }
}
