//! Linear directories: iteration, insert with record splitting, removal by
//! record merge.

use zerocopy::{FromBytes, IntoBytes};

use super::Ext4;
use super::layout::{self, DIR_ENTRY_HEAD, DirEntryHead, RawInode, dir_entry_size};
use crate::errno::{Errno, KResult};

impl Ext4 {
    /// All entries of a directory, including `.` and `..`.
    pub(crate) fn dir_entries(
        &mut self,
        node: &RawInode,
    ) -> KResult<Vec<(String, u32, u8)>> {
        let bs = u64::from(self.block_size);
        let size = u64::from(node.size.get());
        let mut node = node.clone();
        let mut entries = Vec::new();

        let mut block_index = 0u64;
        while block_index * bs < size {
            let Some(blk) = self.map_block(&mut node, block_index, false)? else {
                block_index += 1;
                continue;
            };
            let data = self
                .bdev
                .with_block(u64::from(blk), |data| data.to_vec())?;
            let mut offset = 0usize;
            while offset + DIR_ENTRY_HEAD <= data.len() {
                let head =
                    DirEntryHead::read_from_bytes(&data[offset..offset + DIR_ENTRY_HEAD])
                        .map_err(|_| Errno::Io)?;
                let rec_len = head.rec_len.get() as usize;
                if rec_len < DIR_ENTRY_HEAD || offset + rec_len > data.len() {
                    return Err(Errno::Io);
                }
                if head.inode.get() != 0 {
                    let name_end = offset + DIR_ENTRY_HEAD + head.name_len as usize;
                    if name_end > data.len() {
                        return Err(Errno::Io);
                    }
                    let name = String::from_utf8_lossy(
                        &data[offset + DIR_ENTRY_HEAD..name_end],
                    )
                    .into_owned();
                    entries.push((name, head.inode.get(), head.file_type));
                }
                offset += rec_len;
            }
            block_index += 1;
        }
        Ok(entries)
    }

    /// Find `name` in the directory; returns the target inode.
    pub(crate) fn dir_find(&mut self, node: &RawInode, name: &str) -> KResult<Option<u32>> {
        Ok(self
            .dir_entries(node)?
            .into_iter()
            .find(|(n, _, _)| n == name)
            .map(|(_, ino, _)| ino))
    }

    /// Whether the directory holds only `.` and `..`.
    pub(crate) fn dir_is_empty(&mut self, node: &RawInode) -> KResult<bool> {
        Ok(self
            .dir_entries(node)?
            .iter()
            .all(|(n, _, _)| n == "." || n == ".."))
    }

    /// Write a fresh directory block containing `.` and `..`.
    pub(crate) fn dir_init(&mut self, ino: u32, parent_ino: u32) -> KResult<()> {
        let bs = self.block_size as usize;
        let mut node = self.read_inode(ino)?;
        let blk = self
            .map_block(&mut node, 0, true)?
            .ok_or(Errno::Io)?;

        let mut block = vec![0u8; bs];
        let dot = DirEntryHead {
            inode: ino.into(),
            rec_len: (dir_entry_size(1) as u16).into(),
            name_len: 1,
            file_type: layout::FT_DIR,
        };
        block[..DIR_ENTRY_HEAD].copy_from_slice(dot.as_bytes());
        block[DIR_ENTRY_HEAD] = b'.';

        let dotdot_off = dir_entry_size(1);
        let dotdot = DirEntryHead {
            inode: parent_ino.into(),
            rec_len: ((bs - dotdot_off) as u16).into(),
            name_len: 2,
            file_type: layout::FT_DIR,
        };
        block[dotdot_off..dotdot_off + DIR_ENTRY_HEAD].copy_from_slice(dotdot.as_bytes());
        block[dotdot_off + DIR_ENTRY_HEAD] = b'.';
        block[dotdot_off + DIR_ENTRY_HEAD + 1] = b'.';

        self.bdev
            .with_block_mut(u64::from(blk), |data| data.copy_from_slice(&block))?;
        node.size.set(self.block_size);
        self.write_inode(ino, &node)?;
        Ok(())
    }

    /// Insert `name -> ino` into directory `dir_ino`, splitting an entry
    /// with enough slack or appending a new block.
    pub(crate) fn dir_insert(
        &mut self,
        dir_ino: u32,
        name: &str,
        ino: u32,
        file_type: u8,
    ) -> KResult<()> {
        if name.is_empty() || name.len() > 255 {
            return Err(Errno::Inval);
        }
        let needed = dir_entry_size(name.len());
        let bs = self.block_size as usize;
        let mut node = self.read_inode(dir_ino)?;
        let size = u64::from(node.size.get());
        let block_count = size / u64::from(self.block_size);

        for block_index in 0..block_count {
            let Some(blk) = self.map_block(&mut node, block_index, false)? else {
                continue;
            };
            let inserted = self.bdev.with_block_mut(u64::from(blk), |data| {
                try_insert_in_block(data, name, ino, file_type, needed)
            })?;
            if inserted? {
                let now = self.now();
                node.mtime.set(now);
                self.write_inode(dir_ino, &node)?;
                return Ok(());
            }
        }

        // No slack anywhere: append a block holding just this entry.
        let blk = self
            .map_block(&mut node, block_count, true)?
            .ok_or(Errno::Io)?;
        let head = DirEntryHead {
            inode: ino.into(),
            rec_len: (bs as u16).into(),
            name_len: name.len() as u8,
            file_type,
        };
        self.bdev.with_block_mut(u64::from(blk), |data| {
            data.fill(0);
            data[..DIR_ENTRY_HEAD].copy_from_slice(head.as_bytes());
            data[DIR_ENTRY_HEAD..DIR_ENTRY_HEAD + name.len()]
                .copy_from_slice(name.as_bytes());
        })?;
        node.size.set((size + u64::from(self.block_size)) as u32);
        node.mtime.set(self.now());
        self.write_inode(dir_ino, &node)?;
        Ok(())
    }

    /// Remove `name` from directory `dir_ino` by merging its record into
    /// the previous entry (or clearing the inode field at block start).
    pub(crate) fn dir_remove(&mut self, dir_ino: u32, name: &str) -> KResult<()> {
        let bs = u64::from(self.block_size);
        let mut node = self.read_inode(dir_ino)?;
        let size = u64::from(node.size.get());
        let block_count = size / bs;

        for block_index in 0..block_count {
            let Some(blk) = self.map_block(&mut node, block_index, false)? else {
                continue;
            };
            let removed = self.bdev.with_block_mut(u64::from(blk), |data| {
                try_remove_in_block(data, name)
            })?;
            if removed? {
                node.mtime.set(self.now());
                self.write_inode(dir_ino, &node)?;
                return Ok(());
            }
        }
        Err(Errno::NoEnt)
    }

    /// Point a directory's `..` entry at `parent_ino` (rename across
    /// directories).
    pub(crate) fn dir_set_dotdot(&mut self, dir_ino: u32, parent_ino: u32) -> KResult<()> {
        let mut node = self.read_inode(dir_ino)?;
        let blk = self
            .map_block(&mut node, 0, false)?
            .ok_or(Errno::Io)?;
        let patched = self.bdev.with_block_mut(u64::from(blk), |data| {
            let first = DirEntryHead::read_from_bytes(&data[..DIR_ENTRY_HEAD])
                .map_err(|_| Errno::Io)?;
            let second_off = first.rec_len.get() as usize;
            if second_off + DIR_ENTRY_HEAD > data.len() {
                return Err(Errno::Io);
            }
            let mut second =
                DirEntryHead::read_from_bytes(&data[second_off..second_off + DIR_ENTRY_HEAD])
                    .map_err(|_| Errno::Io)?;
            second.inode.set(parent_ino);
            data[second_off..second_off + DIR_ENTRY_HEAD]
                .copy_from_slice(second.as_bytes());
            Ok(())
        })?;
        patched
    }
}

fn try_insert_in_block(
    data: &mut [u8],
    name: &str,
    ino: u32,
    file_type: u8,
    needed: usize,
) -> KResult<bool> {
    let mut offset = 0usize;
    while offset + DIR_ENTRY_HEAD <= data.len() {
        let head = DirEntryHead::read_from_bytes(&data[offset..offset + DIR_ENTRY_HEAD])
            .map_err(|_| Errno::Io)?;
        let rec_len = head.rec_len.get() as usize;
        if rec_len < DIR_ENTRY_HEAD || offset + rec_len > data.len() {
            return Err(Errno::Io);
        }

        let used = if head.inode.get() == 0 {
            0
        } else {
            dir_entry_size(head.name_len as usize)
        };

        if rec_len >= used + needed {
            let (entry_off, entry_len) = if used == 0 {
                (offset, rec_len)
            } else {
                // Shrink the existing record and claim the slack.
                let mut shrunk = head.clone();
                shrunk.rec_len.set(used as u16);
                data[offset..offset + DIR_ENTRY_HEAD].copy_from_slice(shrunk.as_bytes());
                (offset + used, rec_len - used)
            };
            let entry = DirEntryHead {
                inode: ino.into(),
                rec_len: (entry_len as u16).into(),
                name_len: name.len() as u8,
                file_type,
            };
            data[entry_off..entry_off + DIR_ENTRY_HEAD].copy_from_slice(entry.as_bytes());
            data[entry_off + DIR_ENTRY_HEAD..entry_off + DIR_ENTRY_HEAD + name.len()]
                .copy_from_slice(name.as_bytes());
            return Ok(true);
        }
        offset += rec_len;
    }
    Ok(false)
}

fn try_remove_in_block(data: &mut [u8], name: &str) -> KResult<bool> {
    let mut offset = 0usize;
    let mut prev: Option<usize> = None;
    while offset + DIR_ENTRY_HEAD <= data.len() {
        let head = DirEntryHead::read_from_bytes(&data[offset..offset + DIR_ENTRY_HEAD])
            .map_err(|_| Errno::Io)?;
        let rec_len = head.rec_len.get() as usize;
        if rec_len < DIR_ENTRY_HEAD || offset + rec_len > data.len() {
            return Err(Errno::Io);
        }
        if head.inode.get() != 0 {
            let name_end = offset + DIR_ENTRY_HEAD + head.name_len as usize;
            if name_end <= data.len()
                && &data[offset + DIR_ENTRY_HEAD..name_end] == name.as_bytes()
            {
                match prev {
                    Some(prev_off) => {
                        let mut prev_head = DirEntryHead::read_from_bytes(
                            &data[prev_off..prev_off + DIR_ENTRY_HEAD],
                        )
                        .map_err(|_| Errno::Io)?;
                        prev_head
                            .rec_len
                            .set((prev_head.rec_len.get() as usize + rec_len) as u16);
                        data[prev_off..prev_off + DIR_ENTRY_HEAD]
                            .copy_from_slice(prev_head.as_bytes());
                    }
                    None => {
                        let mut cleared = head.clone();
                        cleared.inode.set(0);
                        data[offset..offset + DIR_ENTRY_HEAD]
                            .copy_from_slice(cleared.as_bytes());
                    }
                }
                return Ok(true);
            }
        }
        prev = Some(offset);
        offset += rec_len;
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_block(bs: usize) -> Vec<u8> {
        let mut data = vec![0u8; bs];
        let head = DirEntryHead {
            inode: 0.into(),
            rec_len: (bs as u16).into(),
            name_len: 0,
            file_type: 0,
        };
        data[..DIR_ENTRY_HEAD].copy_from_slice(head.as_bytes());
        data
    }

    #[test]
    fn insert_then_remove_round_trips() {
        let mut data = fresh_block(512);
        assert!(try_insert_in_block(&mut data, "alpha", 12, layout::FT_REG_FILE, dir_entry_size(5)).unwrap());
        assert!(try_insert_in_block(&mut data, "beta", 13, layout::FT_DIR, dir_entry_size(4)).unwrap());
        assert!(try_remove_in_block(&mut data, "alpha").unwrap());
        assert!(!try_remove_in_block(&mut data, "alpha").unwrap());
        assert!(try_remove_in_block(&mut data, "beta").unwrap());
    }

    #[test]
    fn full_block_rejects_insert() {
        let mut data = fresh_block(24);
        assert!(try_insert_in_block(&mut data, "a", 1, layout::FT_REG_FILE, dir_entry_size(1)).unwrap());
        assert!(try_insert_in_block(&mut data, "b", 2, layout::FT_REG_FILE, dir_entry_size(1)).unwrap());
        assert!(!try_insert_in_block(&mut data, "cc", 3, layout::FT_REG_FILE, dir_entry_size(2)).unwrap());
    }
}
