//! Block device and cache laws: read/write counters, cache hits, range
//! boundaries, write-back behaviour.

use minikern::errno::{Errno, KResult};
use minikern::ext4::{BlockDev, BlockIo};

/// RAM-backed physical block transport.
struct MemIo {
    data: Vec<u8>,
    bsize: usize,
}

impl MemIo {
    fn new(bsize: usize, bcnt: usize) -> Self {
        MemIo {
            data: vec![0; bsize * bcnt],
            bsize,
        }
    }
}

impl BlockIo for MemIo {
    fn bread(&mut self, buf: &mut [u8], pba: u64, count: u32) -> KResult<()> {
        let start = pba as usize * self.bsize;
        let len = count as usize * self.bsize;
        buf[..len].copy_from_slice(&self.data[start..start + len]);
        Ok(())
    }

    fn bwrite(&mut self, buf: &[u8], pba: u64, count: u32) -> KResult<()> {
        let start = pba as usize * self.bsize;
        let len = count as usize * self.bsize;
        self.data[start..start + len].copy_from_slice(&buf[..len]);
        Ok(())
    }
}

fn device(bsize: usize, bcnt: usize, slots: usize) -> BlockDev {
    BlockDev::new(
        Box::new(MemIo::new(bsize, bcnt)),
        bsize as u32,
        bcnt as u64,
        slots,
    )
    .unwrap()
}

#[test]
fn one_read_zero_writes_then_cache_hit() {
    let mut bdev = device(512, 32, 8);

    let block = bdev.block_get(7).unwrap();
    assert_eq!(bdev.bread_ctr, 1);
    bdev.block_set(block).unwrap();
    assert_eq!(bdev.bwrite_ctr, 0);

    let block = bdev.block_get(7).unwrap();
    assert_eq!(bdev.bread_ctr, 1, "second get must hit the cache");
    bdev.block_set(block).unwrap();
    assert_eq!(bdev.bwrite_ctr, 0);
}

#[test]
fn get_at_block_count_is_erange() {
    let mut bdev = device(512, 16, 4);
    assert_eq!(bdev.block_get(16).unwrap_err(), Errno::Range);
    let block = bdev.block_get(15).unwrap();
    bdev.block_set(block).unwrap();
}

#[test]
fn cache_full_of_referenced_blocks_is_enomem_not_deadlock() {
    let mut bdev = device(512, 16, 3);
    let a = bdev.block_get(0).unwrap();
    let b = bdev.block_get(1).unwrap();
    let c = bdev.block_get(2).unwrap();
    assert_eq!(bdev.block_get(3).unwrap_err(), Errno::NoMem);
    bdev.block_set(a).unwrap();
    bdev.block_set(b).unwrap();
    bdev.block_set(c).unwrap();
    let block = bdev.block_get(3).unwrap();
    bdev.block_set(block).unwrap();
}

#[test]
fn byte_write_then_read_is_idempotent() {
    let mut bdev = device(512, 16, 4);
    let payload: Vec<u8> = (0..2000u32).map(|i| (i % 251) as u8).collect();

    bdev.write_bytes(123, &payload).unwrap();
    let mut first = vec![0u8; payload.len()];
    bdev.read_bytes(123, &mut first).unwrap();
    assert_eq!(first, payload);

    // Writing back what was read changes nothing.
    bdev.write_bytes(123, &first).unwrap();
    let mut second = vec![0u8; payload.len()];
    bdev.read_bytes(123, &mut second).unwrap();
    assert_eq!(second, payload);
}

#[test]
fn byte_range_overflow_is_einval() {
    let mut bdev = device(512, 8, 4);
    let total = 512 * 8;
    let mut buf = vec![0u8; 32];
    assert_eq!(
        bdev.read_bytes(total - 16, &mut buf).unwrap_err(),
        Errno::Inval
    );
    assert_eq!(
        bdev.write_bytes(total - 16, &buf).unwrap_err(),
        Errno::Inval
    );
    assert!(bdev.read_bytes(total - 32, &mut buf).is_ok());
}

#[test]
fn dirty_block_reaches_device_without_write_back() {
    let mut bdev = device(512, 8, 4);
    let mut block = bdev.block_get(2).unwrap();
    bdev.block_data_mut(&block)[0] = 0x5A;
    block.dirty = true;
    bdev.block_set(block).unwrap();
    assert_eq!(bdev.bwrite_ctr, 1);

    let block = bdev.block_get(2).unwrap();
    assert_eq!(bdev.block_data(&block)[0], 0x5A);
    bdev.block_set(block).unwrap();
}

#[test]
fn write_back_nesting_delays_until_depth_zero() {
    let mut bdev = device(512, 8, 4);
    bdev.cache_write_back(true).unwrap();
    bdev.cache_write_back(true).unwrap();

    let mut block = bdev.block_get(1).unwrap();
    bdev.block_data_mut(&block)[10] = 0xEE;
    block.dirty = true;
    bdev.block_set(block).unwrap();
    assert_eq!(bdev.bwrite_ctr, 0);

    bdev.cache_write_back(false).unwrap();
    assert_eq!(bdev.bwrite_ctr, 0, "still nested");
    bdev.cache_write_back(false).unwrap();
    assert_eq!(bdev.bwrite_ctr, 1, "flushed on depth zero");
}

#[test]
fn logical_blocks_span_physical_blocks() {
    let mut bdev = device(512, 64, 4);
    bdev.set_lb_size(2048).unwrap();
    assert_eq!(bdev.lb_size(), 2048);
    assert_eq!(bdev.lb_count(), 16);
    assert_eq!(bdev.block_get(16).unwrap_err(), Errno::Range);

    let mut block = bdev.block_get(3).unwrap();
    let data = bdev.block_data_mut(&block);
    assert_eq!(data.len(), 2048);
    data[2047] = 0x77;
    block.dirty = true;
    bdev.block_set(block).unwrap();

    // The last byte of logical block 3 is physical byte 4*2048 - 1.
    let mut byte = [0u8; 1];
    bdev.read_bytes(4 * 2048 - 1, &mut byte).unwrap();
    assert_eq!(byte[0], 0x77);
}

#[test]
fn set_lb_size_requires_multiple_of_physical() {
    let mut bdev = device(512, 16, 4);
    assert_eq!(bdev.set_lb_size(768).unwrap_err(), Errno::Inval);
    assert!(bdev.set_lb_size(1024).is_ok());
}
