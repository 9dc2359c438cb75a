//! Inode table access and the classic direct/indirect block map.

use zerocopy::{FromBytes, IntoBytes};

use super::Ext4;
use super::layout::{self, RawInode};
use crate::errno::{Errno, KResult};

impl Ext4 {
    /// Byte offset of `ino`'s slot in its group's inode table.
    fn inode_offset(&self, ino: u32) -> KResult<u64> {
        if ino == 0 || ino > self.sb.inodes_count.get() {
            return Err(Errno::NoEnt);
        }
        let index = ino - 1;
        let group = (index / self.sb.inodes_per_group.get()) as usize;
        let slot = index % self.sb.inodes_per_group.get();
        let gd = self.groups.get(group).ok_or(Errno::Io)?;
        let table = u64::from(gd.inode_table.get()) * u64::from(self.block_size);
        Ok(table + u64::from(slot) * u64::from(self.inode_size))
    }

    pub(crate) fn read_inode(&mut self, ino: u32) -> KResult<RawInode> {
        let offset = self.inode_offset(ino)?;
        let mut raw = [0u8; 128];
        self.bdev.read_bytes(offset, &mut raw)?;
        RawInode::read_from_bytes(&raw[..]).map_err(|_| Errno::Io)
    }

    pub(crate) fn write_inode(&mut self, ino: u32, node: &RawInode) -> KResult<()> {
        let offset = self.inode_offset(ino)?;
        self.bdev.write_bytes(offset, node.as_bytes())
    }

    /// Pointers per indirect block.
    fn ptrs_per_block(&self) -> u64 {
        u64::from(self.block_size / 4)
    }

    /// Map a file block index to a volume block, optionally allocating the
    /// data block and any missing indirect blocks.
    ///
    /// Returns `None` for a hole when not allocating.
    pub(crate) fn map_block(
        &mut self,
        node: &mut RawInode,
        file_block: u64,
        allocate: bool,
    ) -> KResult<Option<u32>> {
        let ptrs = self.ptrs_per_block();
        let direct = layout::DIRECT_BLOCKS as u64;

        if file_block < direct {
            let idx = file_block as usize;
            let mut blk = node.block[idx].get();
            if blk == 0 {
                if !allocate {
                    return Ok(None);
                }
                blk = self.alloc_data_block(node)?;
                node.block[idx].set(blk);
            }
            return Ok(Some(blk));
        }

        let file_block = file_block - direct;
        if file_block < ptrs {
            let ind = self.map_via(node, layout::IND_BLOCK, allocate)?;
            let Some(ind) = ind else { return Ok(None) };
            return self.map_in_indirect(node, ind, file_block, allocate);
        }

        let file_block = file_block - ptrs;
        if file_block < ptrs * ptrs {
            let dind = self.map_via(node, layout::DIND_BLOCK, allocate)?;
            let Some(dind) = dind else { return Ok(None) };
            let ind =
                self.map_in_indirect(node, dind, file_block / ptrs, allocate)?;
            let Some(ind) = ind else { return Ok(None) };
            return self.map_in_indirect(node, ind, file_block % ptrs, allocate);
        }

        // Files needing the triple-indirect tree exceed what this port
        // supports.
        Err(Errno::NoSpc)
    }

    /// Read or allocate the top-level indirect pointer at `slot`.
    fn map_via(
        &mut self,
        node: &mut RawInode,
        slot: usize,
        allocate: bool,
    ) -> KResult<Option<u32>> {
        let mut blk = node.block[slot].get();
        if blk == 0 {
            if !allocate {
                return Ok(None);
            }
            blk = self.alloc_meta_block(node)?;
            node.block[slot].set(blk);
        }
        Ok(Some(blk))
    }

    /// Read or allocate the pointer at `index` inside indirect block `ind`.
    fn map_in_indirect(
        &mut self,
        node: &mut RawInode,
        ind: u32,
        index: u64,
        allocate: bool,
    ) -> KResult<Option<u32>> {
        let offset = index as usize * 4;
        let existing = self.bdev.with_block(u64::from(ind), |data| {
            u32::from_le_bytes([
                data[offset],
                data[offset + 1],
                data[offset + 2],
                data[offset + 3],
            ])
        })?;
        if existing != 0 {
            return Ok(Some(existing));
        }
        if !allocate {
            return Ok(None);
        }
        let blk = self.alloc_data_block(node)?;
        self.bdev.with_block_mut(u64::from(ind), |data| {
            data[offset..offset + 4].copy_from_slice(&blk.to_le_bytes());
        })?;
        Ok(Some(blk))
    }

    fn alloc_data_block(&mut self, node: &mut RawInode) -> KResult<u32> {
        let blk = self.alloc_block()?;
        node.blocks
            .set(node.blocks.get() + self.block_size / 512);
        Ok(blk)
    }

    fn alloc_meta_block(&mut self, node: &mut RawInode) -> KResult<u32> {
        self.alloc_data_block(node)
    }

    /// Copy `buf.len()` bytes of file content starting at `pos`; holes read
    /// as zeros.
    pub(crate) fn inode_read_range(
        &mut self,
        node: &RawInode,
        pos: u64,
        buf: &mut [u8],
    ) -> KResult<()> {
        let bs = u64::from(self.block_size);
        let mut node = node.clone();
        let mut done = 0usize;
        while done < buf.len() {
            let off = pos + done as u64;
            let in_block = (off % bs) as usize;
            let chunk = (bs as usize - in_block).min(buf.len() - done);
            match self.map_block(&mut node, off / bs, false)? {
                Some(blk) => {
                    self.bdev.with_block(u64::from(blk), |data| {
                        buf[done..done + chunk]
                            .copy_from_slice(&data[in_block..in_block + chunk]);
                    })?;
                }
                None => buf[done..done + chunk].fill(0),
            }
            done += chunk;
        }
        Ok(())
    }

    /// Write `buf` at `pos`, allocating blocks on demand.
    pub(crate) fn inode_write_range(
        &mut self,
        node: &mut RawInode,
        pos: u64,
        buf: &[u8],
    ) -> KResult<()> {
        let bs = u64::from(self.block_size);
        let mut done = 0usize;
        while done < buf.len() {
            let off = pos + done as u64;
            let in_block = (off % bs) as usize;
            let chunk = (bs as usize - in_block).min(buf.len() - done);
            let blk = self
                .map_block(node, off / bs, true)?
                .ok_or(Errno::Io)?;
            self.bdev.with_block_mut(u64::from(blk), |data| {
                data[in_block..in_block + chunk].copy_from_slice(&buf[done..done + chunk]);
            })?;
            done += chunk;
        }
        Ok(())
    }

    /// Free every data and indirect block an inode owns.
    pub(crate) fn inode_free_blocks(&mut self, node: &mut RawInode) -> KResult<()> {
        for idx in 0..layout::DIRECT_BLOCKS {
            let blk = node.block[idx].get();
            if blk != 0 {
                self.free_block(blk)?;
                node.block[idx].set(0);
            }
        }

        let ind = node.block[layout::IND_BLOCK].get();
        if ind != 0 {
            self.free_indirect(ind, 1)?;
            node.block[layout::IND_BLOCK].set(0);
        }
        let dind = node.block[layout::DIND_BLOCK].get();
        if dind != 0 {
            self.free_indirect(dind, 2)?;
            node.block[layout::DIND_BLOCK].set(0);
        }
        node.blocks.set(0);
        Ok(())
    }

    /// Free an indirect tree of the given depth (1 = pointers to data).
    fn free_indirect(&mut self, blk: u32, depth: u32) -> KResult<()> {
        let ptrs = self.ptrs_per_block() as usize;
        let entries = self.bdev.with_block(u64::from(blk), |data| {
            let mut entries = Vec::with_capacity(ptrs);
            for i in 0..ptrs {
                let p = u32::from_le_bytes([
                    data[i * 4],
                    data[i * 4 + 1],
                    data[i * 4 + 2],
                    data[i * 4 + 3],
                ]);
                if p != 0 {
                    entries.push(p);
                }
            }
            entries
        })?;
        for p in entries {
            if depth > 1 {
                self.free_indirect(p, depth - 1)?;
            } else {
                self.free_block(p)?;
            }
        }
        self.free_block(blk)
    }
}
