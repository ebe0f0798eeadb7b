//! 驱动的聚合，负责启动时的初始化和外部中断的入口

#![cfg_attr(not(test), no_std)]

extern crate alloc;
#[macro_use]
extern crate log;

use alloc::sync::Arc;

use defines::config::{
    PLIC_BASE, VIRTIO_FIRST_IRQ, VIRTIO_MMIO_BASE, VIRTIO_MMIO_COUNT, VIRTIO_MMIO_STRIDE,
};
use hal::{DeviceRegistry, IrqControl, DEVICES};
use klocks::Lazy;
use qemu_block::VirtioBlk;
use qemu_plic::{Interrupts, MmioPlic, Plic};
use virtio_glue::{DeviceStatus, DeviceType, MmioTransport, VirtioTransport};

pub use qemu_block::BLK_DEVICE_NAME;

pub static INTERRUPTS: Lazy<Arc<Interrupts<MmioPlic>>> =
    Lazy::new(|| Arc::new(Interrupts::new(Plic::new(unsafe { MmioPlic::new(PLIC_BASE) }))));

pub fn init() {
    simple_logger::init(&sbi_console::SBI_CONSOLE);
    INTERRUPTS.init();

    let intc: Arc<dyn IrqControl> = Arc::clone(&*INTERRUPTS) as _;
    let attached = attach_all(probe_virtio_mmio(), intc, &DEVICES);
    info!("{attached} block device(s) attached");

    #[cfg(any(target_arch = "riscv32", target_arch = "riscv64"))]
    unsafe {
        riscv::register::sie::set_sext();
    }
}

/// QEMU `virt` 上有设备的 VirtIO MMIO 槽位，以及它们的中断号
fn probe_virtio_mmio() -> impl Iterator<Item = (MmioTransport, u32)> {
    (0..VIRTIO_MMIO_COUNT).filter_map(|slot| {
        let base = VIRTIO_MMIO_BASE + slot * VIRTIO_MMIO_STRIDE;
        let transport = unsafe { MmioTransport::new(base) }?;
        Some((transport, VIRTIO_FIRST_IRQ + slot as u32))
    })
}

/// 把其中的块设备重置后挂载到 `registry`，返回成功的数量。失败的设备会被跳过
pub fn attach_all<T: VirtioTransport + 'static>(
    devices: impl IntoIterator<Item = (T, u32)>,
    intc: Arc<dyn IrqControl>,
    registry: &DeviceRegistry,
) -> usize {
    let mut attached = 0;
    for (transport, irq) in devices {
        let device_type = transport.device_type();
        if device_type != DeviceType::Block {
            trace!("skip virtio {device_type:?} with irq {irq}");
            continue;
        }
        transport.set_status(DeviceStatus::empty());
        transport.add_status(DeviceStatus::ACKNOWLEDGE);
        match VirtioBlk::attach(transport, irq, Arc::clone(&intc), registry) {
            Ok(_) => attached += 1,
            Err(e) => warn!("virtio block device with irq {irq} is not attached: {e:?}"),
        }
    }
    attached
}

/// 外部中断的入口，处理完所有待处理的中断
pub fn interrupt_handler() {
    while INTERRUPTS.handle_external().is_some() {}
}

#[cfg(test)]
mod tests {
    use alloc::sync::Arc;
    use std::{
        sync::atomic::{AtomicBool, Ordering},
        thread,
    };

    use defines::ioctl::{IOCTL_GETLEN, IOCTL_SETPOS};
    use hal::{DeviceRegistry, IrqControl};
    use qemu_plic::{Interrupts, Plic, SimPlic};
    use virtio_glue::{DeviceType, Features, SimBlkDevice};

    use super::{attach_all, BLK_DEVICE_NAME};

    fn dispatcher() -> (SimPlic, Arc<Interrupts<SimPlic>>) {
        let plic = SimPlic::new();
        let intc = Arc::new(Interrupts::new(Plic::new(plic.clone())));
        intc.init();
        (plic, intc)
    }

    #[test]
    fn attaches_block_devices_only() {
        let (_plic, intc) = dispatcher();
        let registry = DeviceRegistry::new();
        let devices = vec![
            (SimBlkDevice::new(16, 512), 1),
            (SimBlkDevice::new(16, 512).with_device_type(DeviceType::Network), 2),
            (SimBlkDevice::new(16, 512).with_feature_mask(!Features::RING_RESET), 3),
            (SimBlkDevice::new(8, 512), 4),
        ];
        let intc: Arc<dyn IrqControl> = intc;
        assert_eq!(attach_all(devices, intc, &registry), 2);
        assert_eq!(registry.count(BLK_DEVICE_NAME), 2);

        let mut len = 0;
        let blk1 = registry.open(BLK_DEVICE_NAME, 1).unwrap();
        blk1.ioctl(IOCTL_GETLEN, Some(&mut len)).unwrap();
        assert_eq!(len, 8 * 512);
        assert!(registry.open(BLK_DEVICE_NAME, 2).is_err());
    }

    #[test]
    fn end_to_end_through_dispatcher() {
        const IRQ: u32 = 3;
        let (plic, intc) = dispatcher();
        let dev = SimBlkDevice::new(16, 512);
        dev.set_deferred(true);
        {
            // 设备只负责拉高中断线，由下面的“hart”线程陷入处理
            let plic = plic.clone();
            dev.set_irq_callback(move || plic.raise(IRQ));
        }
        let registry = DeviceRegistry::new();
        let control: Arc<dyn IrqControl> = Arc::clone(&intc) as _;
        assert_eq!(attach_all([(dev.clone(), IRQ)], control, &registry), 1);

        let stop = Arc::new(AtomicBool::new(false));
        let hart = {
            let stop = Arc::clone(&stop);
            let intc = Arc::clone(&intc);
            thread::spawn(move || {
                let mut handled = 0;
                while !stop.load(Ordering::Acquire) {
                    match intc.handle_external() {
                        Some(source) => {
                            assert_eq!(source, IRQ);
                            handled += 1;
                        }
                        None => thread::yield_now(),
                    }
                }
                handled
            })
        };

        let io = registry.open(BLK_DEVICE_NAME, 0).unwrap();
        let data: Vec<u8> = (0..1536).map(|i| (i % 251) as u8).collect();
        assert_eq!(smol::block_on(io.write(&data)), Ok(1536));
        io.close();

        let io = registry.open(BLK_DEVICE_NAME, 0).unwrap();
        let mut pos = 0;
        io.ioctl(IOCTL_SETPOS, Some(&mut pos)).unwrap();
        let mut back = vec![0; 1536];
        assert_eq!(smol::block_on(io.read(&mut back)), Ok(1536));
        assert_eq!(back, data);
        assert_eq!(&dev.storage()[..1536], &data[..]);

        stop.store(true, Ordering::Release);
        let handled = hart.join().unwrap();
        assert!(handled > 0);
        assert!(!plic.is_in_service(IRQ));
    }
}
