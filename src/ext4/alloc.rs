//! Block and inode allocation over the per-group bitmaps.

use super::Ext4;
use crate::errno::{Errno, KResult};

fn find_clear_bit(bitmap: &[u8], limit: usize) -> Option<usize> {
    for (byte_idx, byte) in bitmap.iter().enumerate() {
        if *byte == 0xFF {
            continue;
        }
        for bit in 0..8 {
            let idx = byte_idx * 8 + bit;
            if idx >= limit {
                return None;
            }
            if byte & (1 << bit) == 0 {
                return Some(idx);
            }
        }
    }
    None
}

fn set_bit(bitmap: &mut [u8], idx: usize) {
    bitmap[idx / 8] |= 1 << (idx % 8);
}

fn clear_bit(bitmap: &mut [u8], idx: usize) {
    bitmap[idx / 8] &= !(1 << (idx % 8));
}

impl Ext4 {
    /// Allocate one block, zero it, and account for it.
    pub(crate) fn alloc_block(&mut self) -> KResult<u32> {
        let bpg = self.sb.blocks_per_group.get();
        let first = self.sb.first_data_block.get();
        let total = self.sb.blocks_count.get();

        for group in 0..self.groups.len() {
            if self.groups[group].free_blocks_count.get() == 0 {
                continue;
            }
            let base = first + group as u32 * bpg;
            let limit = (total - base).min(bpg) as usize;
            let bitmap_block = u64::from(self.groups[group].block_bitmap.get());
            let found = self.bdev.with_block_mut(bitmap_block, |data| {
                find_clear_bit(data, limit).inspect(|&idx| set_bit(data, idx))
            })?;
            if let Some(idx) = found {
                let blk = base + idx as u32;
                let gd = &mut self.groups[group];
                gd.free_blocks_count
                    .set(gd.free_blocks_count.get() - 1);
                self.sb
                    .free_blocks_count
                    .set(self.sb.free_blocks_count.get() - 1);
                // Fresh blocks start zeroed; indirect blocks rely on it.
                self.bdev
                    .with_block_mut(u64::from(blk), |data| data.fill(0))?;
                return Ok(blk);
            }
        }
        Err(Errno::NoSpc)
    }

    /// Return a block to its group's bitmap.
    pub(crate) fn free_block(&mut self, blk: u32) -> KResult<()> {
        let bpg = self.sb.blocks_per_group.get();
        let first = self.sb.first_data_block.get();
        if blk < first || blk >= self.sb.blocks_count.get() {
            return Err(Errno::Inval);
        }
        let group = ((blk - first) / bpg) as usize;
        let idx = ((blk - first) % bpg) as usize;
        let bitmap_block = u64::from(self.groups[group].block_bitmap.get());
        self.bdev
            .with_block_mut(bitmap_block, |data| clear_bit(data, idx))?;
        let gd = &mut self.groups[group];
        gd.free_blocks_count
            .set(gd.free_blocks_count.get() + 1);
        self.sb
            .free_blocks_count
            .set(self.sb.free_blocks_count.get() + 1);
        Ok(())
    }

    /// Allocate an inode number.
    pub(crate) fn alloc_inode(&mut self, is_dir: bool) -> KResult<u32> {
        let ipg = self.sb.inodes_per_group.get();
        for group in 0..self.groups.len() {
            if self.groups[group].free_inodes_count.get() == 0 {
                continue;
            }
            let bitmap_block = u64::from(self.groups[group].inode_bitmap.get());
            let found = self.bdev.with_block_mut(bitmap_block, |data| {
                find_clear_bit(data, ipg as usize).inspect(|&idx| set_bit(data, idx))
            })?;
            if let Some(idx) = found {
                let ino = group as u32 * ipg + idx as u32 + 1;
                let gd = &mut self.groups[group];
                gd.free_inodes_count
                    .set(gd.free_inodes_count.get() - 1);
                if is_dir {
                    gd.used_dirs_count.set(gd.used_dirs_count.get() + 1);
                }
                self.sb
                    .free_inodes_count
                    .set(self.sb.free_inodes_count.get() - 1);
                return Ok(ino);
            }
        }
        Err(Errno::NoSpc)
    }

    /// Return an inode number to its group's bitmap.
    pub(crate) fn free_inode(&mut self, ino: u32, is_dir: bool) -> KResult<()> {
        if ino == 0 || ino > self.sb.inodes_count.get() {
            return Err(Errno::Inval);
        }
        let ipg = self.sb.inodes_per_group.get();
        let group = ((ino - 1) / ipg) as usize;
        let idx = ((ino - 1) % ipg) as usize;
        let bitmap_block = u64::from(self.groups[group].inode_bitmap.get());
        self.bdev
            .with_block_mut(bitmap_block, |data| clear_bit(data, idx))?;
        let gd = &mut self.groups[group];
        gd.free_inodes_count
            .set(gd.free_inodes_count.get() + 1);
        if is_dir {
            gd.used_dirs_count
                .set(gd.used_dirs_count.get().saturating_sub(1));
        }
        self.sb
            .free_inodes_count
            .set(self.sb.free_inodes_count.get() + 1);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bit_scan_finds_first_clear() {
        let mut bitmap = vec![0xFFu8, 0b0000_0111, 0];
        assert_eq!(find_clear_bit(&bitmap, 24), Some(11));
        set_bit(&mut bitmap, 11);
        assert_eq!(find_clear_bit(&bitmap, 24), Some(12));
        clear_bit(&mut bitmap, 11);
        assert_eq!(find_clear_bit(&bitmap, 24), Some(11));
        assert_eq!(find_clear_bit(&[0xFF], 8), None);
    }

    #[test]
    fn bit_scan_respects_limit() {
        let bitmap = vec![0xFFu8, 0x0F];
        assert_eq!(find_clear_bit(&bitmap, 12), None);
        assert_eq!(find_clear_bit(&bitmap, 13), Some(12));
    }
}
