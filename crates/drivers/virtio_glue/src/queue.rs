//! split virtqueue 的内存布局，见 VirtIO 1.2 §2.7
//!
//! 这些内存会被设备并发读写，所以只通过裸指针访问，不长期持有引用

use alloc::alloc::{alloc_zeroed, dealloc, handle_alloc_error, Layout};
use core::{mem::size_of, ptr::NonNull};

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};

/// 描述符表、avail ring、used ring 的对齐要求里最大的是 16
pub const DMA_ALIGN: usize = 16;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct DescFlags: u16 {
        const NEXT = 1;
        const WRITE = 2;
        const INDIRECT = 4;
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct Descriptor {
    pub addr: u64,
    pub len: u32,
    pub flags: u16,
    pub next: u16,
}

const _: () = assert!(size_of::<Descriptor>() == 16);

impl Descriptor {
    pub fn new(addr: usize, len: u32, flags: DescFlags, next: u16) -> Self {
        Self {
            addr: addr as u64,
            len,
            flags: flags.bits(),
            next,
        }
    }

    pub fn flags(&self) -> DescFlags {
        DescFlags::from_bits_retain(self.flags)
    }
}

#[repr(C)]
#[derive(Debug)]
pub struct AvailRing<const N: usize> {
    pub flags: u16,
    pub idx: u16,
    pub ring: [u16; N],
    pub used_event: u16,
}

unsafe impl<const N: usize> Zeroable for AvailRing<N> {}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct UsedElem {
    pub id: u32,
    pub len: u32,
}

#[repr(C)]
#[derive(Debug)]
pub struct UsedRing<const N: usize> {
    pub flags: u16,
    pub idx: u16,
    pub ring: [UsedElem; N],
    pub avail_event: u16,
}

unsafe impl<const N: usize> Zeroable for UsedRing<N> {}

fn dma_layout(size: usize, align: usize) -> Layout {
    match Layout::from_size_align(size.max(1), align.max(DMA_ALIGN)) {
        Ok(layout) => layout,
        Err(_) => handle_alloc_error(Layout::new::<u8>()),
    }
}

/// 一个清零后交给设备的 `T`
pub struct Dma<T> {
    ptr: NonNull<T>,
}

unsafe impl<T: Send> Send for Dma<T> {}
unsafe impl<T: Send> Sync for Dma<T> {}

impl<T: Zeroable> Dma<T> {
    pub fn zeroed() -> Self {
        let layout = dma_layout(size_of::<T>(), core::mem::align_of::<T>());
        let ptr = unsafe { alloc_zeroed(layout) };
        let Some(ptr) = NonNull::new(ptr.cast::<T>()) else {
            handle_alloc_error(layout)
        };
        Self { ptr }
    }
}

impl<T> Dma<T> {
    #[inline]
    pub fn as_ptr(&self) -> *mut T {
        self.ptr.as_ptr()
    }

    /// 交给设备的地址。内核恒等映射，虚拟地址即物理地址
    #[inline]
    pub fn addr(&self) -> usize {
        self.ptr.as_ptr() as usize
    }
}

impl<T> Drop for Dma<T> {
    fn drop(&mut self) {
        let layout = dma_layout(size_of::<T>(), core::mem::align_of::<T>());
        unsafe { dealloc(self.ptr.as_ptr().cast(), layout) }
    }
}

/// 一段清零后交给设备的字节缓冲区
pub struct DmaBuffer {
    ptr: NonNull<u8>,
    len: usize,
}

unsafe impl Send for DmaBuffer {}
unsafe impl Sync for DmaBuffer {}

impl DmaBuffer {
    pub fn new(len: usize) -> Self {
        let layout = dma_layout(len, DMA_ALIGN);
        let ptr = unsafe { alloc_zeroed(layout) };
        let Some(ptr) = NonNull::new(ptr) else {
            handle_alloc_error(layout)
        };
        Self { ptr, len }
    }

    #[inline]
    pub fn addr(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// 从 `offset` 开始拷出 `dst.len()` 字节
    pub fn read_at(&self, offset: usize, dst: &mut [u8]) {
        assert!(offset + dst.len() <= self.len);
        unsafe {
            core::ptr::copy_nonoverlapping(self.ptr.as_ptr().add(offset), dst.as_mut_ptr(), dst.len());
        }
    }

    /// 从 `offset` 开始写入 `src`
    pub fn write_at(&self, offset: usize, src: &[u8]) {
        assert!(offset + src.len() <= self.len);
        unsafe {
            core::ptr::copy_nonoverlapping(src.as_ptr(), self.ptr.as_ptr().add(offset), src.len());
        }
    }
}

impl Drop for DmaBuffer {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr.as_ptr(), dma_layout(self.len, DMA_ALIGN)) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_layout() {
        // avail: flags, idx, ring[4], used_event
        assert_eq!(size_of::<AvailRing<4>>(), 2 * (2 + 4 + 1));
        // used: flags, idx, ring[4] (8 字节对齐到 4), avail_event
        assert_eq!(core::mem::offset_of!(UsedRing<4>, ring), 4);
        assert_eq!(core::mem::offset_of!(UsedRing<4>, avail_event), 4 + 4 * 8);
    }

    #[test]
    fn dma_is_zeroed_and_aligned() {
        let ring = Dma::<UsedRing<4>>::zeroed();
        assert_eq!(ring.addr() % DMA_ALIGN, 0);
        assert_eq!(unsafe { (*ring.as_ptr()).idx }, 0);

        let buf = DmaBuffer::new(512);
        assert_eq!(buf.addr() % DMA_ALIGN, 0);
        let mut out = [0xffu8; 8];
        buf.read_at(504, &mut out);
        assert_eq!(out, [0; 8]);
        buf.write_at(2, b"blk");
        buf.read_at(0, &mut out[..5]);
        assert_eq!(&out[..5], b"\0\0blk");
    }
}
