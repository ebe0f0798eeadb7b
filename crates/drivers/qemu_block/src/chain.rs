use core::mem::size_of;

use virtio_glue::{DescFlags, Descriptor};

use crate::{BlkReqHeader, BlkReqType};

/// 构造描述符链需要的地址，都是设备可见的地址
#[derive(Clone, Copy, Debug)]
pub struct ChainAddrs {
    /// 描述符表，前 1 项是头部，后 3 项是 indirect 表
    pub table: usize,
    pub header: usize,
    pub data: usize,
    pub status: usize,
    pub block_size: u32,
}

/// 构造一个请求的描述符链
///
/// 第 0 项是 INDIRECT 头部，指向第 1..=3 项组成的 indirect 表。
/// 表内的 `next` 是表内下标，所以最后一项的 0 不会被当作链接
pub fn build_chain(op: BlkReqType, addrs: &ChainAddrs) -> [Descriptor; 4] {
    const DESC_SIZE: usize = size_of::<Descriptor>();
    let data_flags = match op {
        BlkReqType::In => DescFlags::NEXT | DescFlags::WRITE,
        BlkReqType::Out => DescFlags::NEXT,
    };
    [
        Descriptor::new(
            addrs.table + DESC_SIZE,
            3 * DESC_SIZE as u32,
            DescFlags::INDIRECT,
            0,
        ),
        Descriptor::new(
            addrs.header,
            size_of::<BlkReqHeader>() as u32,
            DescFlags::NEXT,
            1,
        ),
        Descriptor::new(addrs.data, addrs.block_size, data_flags, 2),
        Descriptor::new(addrs.status, 1, DescFlags::WRITE, 0),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    const ADDRS: ChainAddrs = ChainAddrs {
        table: 0x8000_0000,
        header: 0x8000_1000,
        data: 0x8000_2000,
        status: 0x8000_3000,
        block_size: 512,
    };

    #[test]
    fn read_chain() {
        let chain = build_chain(BlkReqType::In, &ADDRS);
        assert_eq!(chain[0], Descriptor::new(0x8000_0010, 48, DescFlags::INDIRECT, 0));
        assert_eq!(chain[1], Descriptor::new(0x8000_1000, 16, DescFlags::NEXT, 1));
        assert_eq!(
            chain[2],
            Descriptor::new(0x8000_2000, 512, DescFlags::NEXT | DescFlags::WRITE, 2)
        );
        assert_eq!(chain[3], Descriptor::new(0x8000_3000, 1, DescFlags::WRITE, 0));
    }

    #[test]
    fn write_chain_data_is_device_readable() {
        let chain = build_chain(BlkReqType::Out, &ChainAddrs { block_size: 4096, ..ADDRS });
        assert_eq!(chain[2].flags(), DescFlags::NEXT);
        assert_eq!(chain[2].len, 4096);
        // 只有数据描述符随方向变化
        let read = build_chain(BlkReqType::In, &ChainAddrs { block_size: 4096, ..ADDRS });
        assert_eq!(chain[..2], read[..2]);
        assert_eq!(chain[3], read[3]);
    }
}
