//! Block device: a seekable byte store viewed as fixed-size logical blocks,
//! cached with write-back and delayed free.
//!
//! The logical block size must be a positive integer multiple of the
//! physical block size; for a logical block `lba`,
//! `pba = lba * (lg_bsize / ph_bsize)` and one logical block covers
//! `lg_bsize / ph_bsize` physical blocks.

use log::debug;

use super::bcache::Bcache;
use crate::errno::{Errno, KResult};

/// Raw physical-block transport under a [`BlockDev`].
pub trait BlockIo: Send {
    /// Read `count` physical blocks starting at `pba` into `buf`.
    fn bread(&mut self, buf: &mut [u8], pba: u64, count: u32) -> KResult<()>;

    /// Write `count` physical blocks starting at `pba` from `buf`.
    fn bwrite(&mut self, buf: &[u8], pba: u64, count: u32) -> KResult<()>;
}

/// Handle to a pinned cache block, returned by [`BlockDev::block_get`].
#[derive(Debug)]
pub struct Block {
    pub(crate) cache_id: usize,
    /// Logical block id.
    pub lb_id: u64,
    /// Set by the holder when it modified the data.
    pub dirty: bool,
}

/// A cached logical-block view over a [`BlockIo`].
pub struct BlockDev {
    io: Box<dyn BlockIo>,
    ph_bsize: u32,
    ph_bcnt: u64,
    lg_bsize: u32,
    lg_bcnt: u64,
    ph_bbuf: Box<[u8]>,
    bc: Bcache,
    cache_write_back: u32,
    /// Physical reads issued through the block paths.
    pub bread_ctr: u64,
    /// Physical writes issued through the block paths.
    pub bwrite_ctr: u64,
}

impl std::fmt::Debug for BlockDev {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockDev")
            .field("ph_bsize", &self.ph_bsize)
            .field("ph_bcnt", &self.ph_bcnt)
            .field("lg_bsize", &self.lg_bsize)
            .field("lg_bcnt", &self.lg_bcnt)
            .field("cache_write_back", &self.cache_write_back)
            .finish_non_exhaustive()
    }
}

impl BlockDev {
    /// Build a device of `ph_bcnt` physical blocks of `ph_bsize` bytes with
    /// a cache of `cache_slots` logical blocks. The logical block size
    /// starts equal to the physical one; see [`BlockDev::set_lb_size`].
    pub fn new(
        io: Box<dyn BlockIo>,
        ph_bsize: u32,
        ph_bcnt: u64,
        cache_slots: usize,
    ) -> KResult<Self> {
        if ph_bsize == 0 || cache_slots == 0 {
            return Err(Errno::Inval);
        }
        let mut bounce = Vec::new();
        bounce
            .try_reserve_exact(ph_bsize as usize)
            .map_err(|_| Errno::NoMem)?;
        bounce.resize(ph_bsize as usize, 0);
        Ok(BlockDev {
            io,
            ph_bsize,
            ph_bcnt,
            lg_bsize: ph_bsize,
            lg_bcnt: ph_bcnt,
            ph_bbuf: bounce.into_boxed_slice(),
            bc: Bcache::new(cache_slots, ph_bsize as usize)?,
            cache_write_back: 0,
            bread_ctr: 0,
            bwrite_ctr: 0,
        })
    }

    /// Switch to logical blocks of `lg_bsize` bytes; must be a multiple of
    /// the physical block size. Rebuilds the cache for the new item size.
    pub fn set_lb_size(&mut self, lg_bsize: u32) -> KResult<()> {
        if lg_bsize == 0 || lg_bsize % self.ph_bsize != 0 {
            return Err(Errno::Inval);
        }
        self.lg_bsize = lg_bsize;
        self.lg_bcnt = self.ph_bcnt * u64::from(self.ph_bsize) / u64::from(lg_bsize);
        self.bc = Bcache::new(self.bc.len(), lg_bsize as usize)?;
        Ok(())
    }

    /// Logical block size in bytes.
    pub fn lb_size(&self) -> u32 {
        self.lg_bsize
    }

    /// Number of logical blocks.
    pub fn lb_count(&self) -> u64 {
        self.lg_bcnt
    }

    /// Total device capacity in bytes.
    pub fn size_bytes(&self) -> u64 {
        self.ph_bcnt * u64::from(self.ph_bsize)
    }

    fn pba_of(&self, lba: u64) -> (u64, u32) {
        let per = self.lg_bsize / self.ph_bsize;
        (lba * u64::from(per), per)
    }

    /// Pin the logical block `lba` in the cache, reading it from the device
    /// if it was not resident.
    pub fn block_get(&mut self, lba: u64) -> KResult<Block> {
        if lba >= self.lg_bcnt {
            return Err(Errno::Range);
        }

        // A full cache under write-back is drained one delayed slot at a
        // time: flush the least recently used idle delayed slot.
        if self.bc.is_full() && self.cache_write_back > 0 {
            if let Some(victim) = self.bc.eviction_candidate() {
                let victim_lba = self.bc.slot(victim).lba;
                let (pba, per) = self.pba_of(victim_lba);
                let data = self.bc.slot(victim).data.clone();
                self.io.bwrite(&data, pba, per)?;
                self.bwrite_ctr += 1;
                self.bc.delayed_written(victim);
                debug!("blockdev: evicted delayed block {victim_lba}");
            }
        }

        let (cache_id, is_new) = self.bc.alloc(lba)?;
        if !is_new {
            return Ok(Block {
                cache_id,
                lb_id: lba,
                dirty: false,
            });
        }

        let (pba, per) = self.pba_of(lba);
        let slot = self.bc.slot_mut(cache_id);
        let mut data = std::mem::take(&mut slot.data);
        let read = self.io.bread(&mut data, pba, per);
        let slot = self.bc.slot_mut(cache_id);
        slot.data = data;
        match read {
            Ok(()) => {
                self.bread_ctr += 1;
                Ok(Block {
                    cache_id,
                    lb_id: lba,
                    dirty: false,
                })
            }
            Err(err) => {
                self.bc.invalidate(cache_id);
                Err(err)
            }
        }
    }

    /// Unpin a block previously returned by [`BlockDev::block_get`],
    /// writing it out according to the write-back mode.
    pub fn block_set(&mut self, block: Block) -> KResult<()> {
        let slot_dirty = self.bc.slot(block.cache_id).dirty;
        if !block.dirty && !slot_dirty {
            self.bc.free(block.cache_id, false);
            return Ok(());
        }

        if self.cache_write_back > 0 {
            self.bc.slot_mut(block.cache_id).dirty = true;
            self.bc.free(block.cache_id, true);
            return Ok(());
        }

        if self.bc.slot(block.cache_id).refctr > 1 {
            self.bc.slot_mut(block.cache_id).dirty = true;
            self.bc.free(block.cache_id, false);
            return Ok(());
        }

        let (pba, per) = self.pba_of(block.lb_id);
        let data = self.bc.slot(block.cache_id).data.clone();
        match self.io.bwrite(&data, pba, per) {
            Ok(()) => {
                self.bwrite_ctr += 1;
                self.bc.slot_mut(block.cache_id).dirty = false;
                self.bc.free(block.cache_id, false);
                Ok(())
            }
            Err(err) => {
                // The slot stays dirty so a later retry can still flush it.
                self.bc.slot_mut(block.cache_id).dirty = true;
                self.bc.free(block.cache_id, false);
                Err(err)
            }
        }
    }

    /// Borrow a pinned block's data.
    pub fn block_data(&self, block: &Block) -> &[u8] {
        &self.bc.slot(block.cache_id).data
    }

    /// Borrow a pinned block's data mutably; the caller must mark the
    /// handle dirty for the change to reach the device.
    pub fn block_data_mut(&mut self, block: &Block) -> &mut [u8] {
        &mut self.bc.slot_mut(block.cache_id).data
    }

    /// Read `count` logical blocks into `buf`, bypassing the cache.
    pub fn blocks_get_direct(&mut self, buf: &mut [u8], lba: u64, count: u32) -> KResult<()> {
        let (pba, per) = self.pba_of(lba);
        self.bread_ctr += 1;
        self.io.bread(buf, pba, per * count)
    }

    /// Write `count` logical blocks from `buf`, bypassing the cache.
    pub fn blocks_set_direct(&mut self, buf: &[u8], lba: u64, count: u32) -> KResult<()> {
        let (pba, per) = self.pba_of(lba);
        self.bwrite_ctr += 1;
        self.io.bwrite(buf, pba, per * count)
    }

    /// Read `buf.len()` bytes from byte offset `off`.
    ///
    /// Unaligned head and tail go through the single-block bounce buffer;
    /// the aligned middle reads straight into `buf`.
    pub fn read_bytes(&mut self, off: u64, buf: &mut [u8]) -> KResult<()> {
        let len = buf.len() as u64;
        if off.checked_add(len).is_none_or(|end| end > self.size_bytes()) {
            return Err(Errno::Inval);
        }

        let ph = u64::from(self.ph_bsize);
        let mut block_idx = off / ph;
        let mut p = 0usize;
        let mut remaining = buf.len();

        let unalg = (off % ph) as usize;
        if unalg > 0 {
            let rlen = (self.ph_bsize as usize - unalg).min(remaining);
            self.io.bread(&mut self.ph_bbuf, block_idx, 1)?;
            buf[..rlen].copy_from_slice(&self.ph_bbuf[unalg..unalg + rlen]);
            p += rlen;
            remaining -= rlen;
            block_idx += 1;
        }

        let middle = remaining / self.ph_bsize as usize;
        if middle > 0 {
            let bytes = middle * self.ph_bsize as usize;
            self.io.bread(&mut buf[p..p + bytes], block_idx, middle as u32)?;
            p += bytes;
            remaining -= bytes;
            block_idx += middle as u64;
        }

        if remaining > 0 {
            self.io.bread(&mut self.ph_bbuf, block_idx, 1)?;
            buf[p..].copy_from_slice(&self.ph_bbuf[..remaining]);
        }
        Ok(())
    }

    /// Write `buf` at byte offset `off`.
    ///
    /// Unaligned head and tail are read-modify-write through the bounce
    /// buffer; the aligned middle writes straight from `buf`.
    pub fn write_bytes(&mut self, off: u64, buf: &[u8]) -> KResult<()> {
        let len = buf.len() as u64;
        if off.checked_add(len).is_none_or(|end| end > self.size_bytes()) {
            return Err(Errno::Inval);
        }

        let ph = u64::from(self.ph_bsize);
        let mut block_idx = off / ph;
        let mut p = 0usize;
        let mut remaining = buf.len();

        let unalg = (off % ph) as usize;
        if unalg > 0 {
            let wlen = (self.ph_bsize as usize - unalg).min(remaining);
            self.io.bread(&mut self.ph_bbuf, block_idx, 1)?;
            self.ph_bbuf[unalg..unalg + wlen].copy_from_slice(&buf[..wlen]);
            self.io.bwrite(&self.ph_bbuf, block_idx, 1)?;
            p += wlen;
            remaining -= wlen;
            block_idx += 1;
        }

        let middle = remaining / self.ph_bsize as usize;
        if middle > 0 {
            let bytes = middle * self.ph_bsize as usize;
            self.io.bwrite(&buf[p..p + bytes], block_idx, middle as u32)?;
            p += bytes;
            remaining -= bytes;
            block_idx += middle as u64;
        }

        if remaining > 0 {
            self.io.bread(&mut self.ph_bbuf, block_idx, 1)?;
            self.ph_bbuf[..remaining].copy_from_slice(&buf[p..]);
            self.io.bwrite(&self.ph_bbuf, block_idx, 1)?;
        }
        Ok(())
    }

    /// Run `f` over a pinned block's data, releasing it clean.
    pub fn with_block<R>(&mut self, lba: u64, f: impl FnOnce(&[u8]) -> R) -> KResult<R> {
        let block = self.block_get(lba)?;
        let result = f(self.block_data(&block));
        self.block_set(block)?;
        Ok(result)
    }

    /// Run `f` over a pinned block's data mutably, releasing it dirty.
    pub fn with_block_mut<R>(&mut self, lba: u64, f: impl FnOnce(&mut [u8]) -> R) -> KResult<R> {
        let mut block = self.block_get(lba)?;
        let result = f(self.block_data_mut(&block));
        block.dirty = true;
        self.block_set(block)?;
        Ok(result)
    }

    /// Nestable write-back toggle. Enabling increments the depth; disabling
    /// decrements it, and on the transition to zero every free-delayed idle
    /// slot is flushed to the device.
    pub fn cache_write_back(&mut self, enable: bool) -> KResult<()> {
        if enable {
            self.cache_write_back += 1;
            return Ok(());
        }
        if self.cache_write_back > 0 {
            self.cache_write_back -= 1;
        }
        if self.cache_write_back == 0 {
            for id in self.bc.delayed_idle() {
                let lba = self.bc.slot(id).lba;
                let (pba, per) = self.pba_of(lba);
                let data = self.bc.slot(id).data.clone();
                self.io.bwrite(&data, pba, per)?;
                self.bwrite_ctr += 1;
                self.bc.delayed_written(id);
            }
        }
        Ok(())
    }

    /// Current write-back nesting depth.
    pub fn write_back_depth(&self) -> u32 {
        self.cache_write_back
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// RAM-backed transport used across the block tests.
    pub(crate) struct MemIo {
        pub(crate) data: Vec<u8>,
        pub(crate) bsize: usize,
        pub(crate) reads: Arc<AtomicU64>,
        pub(crate) writes: Arc<AtomicU64>,
    }

    impl MemIo {
        pub(crate) fn new(bsize: usize, bcnt: usize) -> Self {
            MemIo {
                data: vec![0; bsize * bcnt],
                bsize,
                reads: Arc::new(AtomicU64::new(0)),
                writes: Arc::new(AtomicU64::new(0)),
            }
        }
    }

    impl BlockIo for MemIo {
        fn bread(&mut self, buf: &mut [u8], pba: u64, count: u32) -> KResult<()> {
            let start = pba as usize * self.bsize;
            let len = count as usize * self.bsize;
            buf[..len].copy_from_slice(&self.data[start..start + len]);
            self.reads.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }

        fn bwrite(&mut self, buf: &[u8], pba: u64, count: u32) -> KResult<()> {
            let start = pba as usize * self.bsize;
            let len = count as usize * self.bsize;
            self.data[start..start + len].copy_from_slice(&buf[..len]);
            self.writes.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }

    fn device(bsize: usize, bcnt: usize, slots: usize) -> BlockDev {
        BlockDev::new(Box::new(MemIo::new(bsize, bcnt)), bsize as u32, bcnt as u64, slots)
            .unwrap()
    }

    #[test]
    fn get_set_get_hits_cache() {
        let mut bdev = device(512, 16, 4);
        let b = bdev.block_get(5).unwrap();
        assert_eq!(bdev.bread_ctr, 1);
        bdev.block_set(b).unwrap();
        assert_eq!(bdev.bwrite_ctr, 0);
        let b = bdev.block_get(5).unwrap();
        assert_eq!(bdev.bread_ctr, 1);
        bdev.block_set(b).unwrap();
    }

    #[test]
    fn out_of_range_get_is_erange() {
        let mut bdev = device(512, 8, 4);
        assert_eq!(bdev.block_get(8).unwrap_err(), Errno::Range);
        assert!(bdev.block_get(7).is_ok());
    }

    #[test]
    fn full_cache_of_pinned_blocks_is_enomem() {
        let mut bdev = device(512, 16, 2);
        let _a = bdev.block_get(0).unwrap();
        let _b = bdev.block_get(1).unwrap();
        assert_eq!(bdev.block_get(2).unwrap_err(), Errno::NoMem);
    }

    #[test]
    fn byte_paths_round_trip_unaligned() {
        let mut bdev = device(512, 8, 4);
        let payload: Vec<u8> = (0..1000).map(|i| (i % 251) as u8).collect();
        bdev.write_bytes(300, &payload).unwrap();
        let mut back = vec![0; payload.len()];
        bdev.read_bytes(300, &mut back).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn byte_paths_check_range() {
        let mut bdev = device(512, 4, 2);
        let mut buf = [0u8; 16];
        assert_eq!(
            bdev.read_bytes(512 * 4 - 8, &mut buf).unwrap_err(),
            Errno::Inval
        );
        assert!(bdev.read_bytes(512 * 4 - 16, &mut buf).is_ok());
    }

    #[test]
    fn write_back_defers_and_flushes_on_zero_depth() {
        let mut bdev = device(512, 8, 4);
        bdev.cache_write_back(true).unwrap();
        let mut b = bdev.block_get(3).unwrap();
        bdev.block_data_mut(&b)[0] = 0xAB;
        b.dirty = true;
        bdev.block_set(b).unwrap();
        assert_eq!(bdev.bwrite_ctr, 0);
        bdev.cache_write_back(false).unwrap();
        assert_eq!(bdev.bwrite_ctr, 1);
        let b = bdev.block_get(3).unwrap();
        assert_eq!(bdev.block_data(&b)[0], 0xAB);
        bdev.block_set(b).unwrap();
    }
}
