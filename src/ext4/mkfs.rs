//! Volume formatter: lays down a rev-1 volume with 1 KiB blocks that
//! [`super::Ext4::mount`] accepts.

use zerocopy::{FromZeros, IntoBytes};

use super::blockdev::BlockDev;
use super::layout::{self, DirEntryHead, GroupDesc, RawInode, Superblock, dir_entry_size};
use crate::errno::{Errno, KResult};
use crate::sync::KClock;

const BLOCK_SIZE: u32 = 1024;
const INODE_SIZE: u32 = 128;
/// Bits in a one-block bitmap.
const BLOCKS_PER_GROUP: u32 = BLOCK_SIZE * 8;
const RESERVED_INODES: u32 = 10;

/// Format the device as an empty volume with a bare root directory.
pub fn mkfs(bdev: &mut BlockDev, clock: KClock) -> KResult<()> {
    let total_bytes = bdev.size_bytes();
    let blocks_count = (total_bytes / u64::from(BLOCK_SIZE)) as u32;
    // Room for the boot block, superblock, descriptors, bitmaps, a minimal
    // inode table and some data.
    if blocks_count < 64 {
        return Err(Errno::Inval);
    }
    bdev.set_lb_size(BLOCK_SIZE)?;

    let first_data_block = 1u32;
    let group_count = (blocks_count - first_data_block).div_ceil(BLOCKS_PER_GROUP);
    let gd_blocks = (group_count * 32).div_ceil(BLOCK_SIZE);

    // One eighth of the blocks as inodes, rounded to fill whole table
    // blocks, at least enough for the reserved set.
    let inodes_per_block = BLOCK_SIZE / INODE_SIZE;
    let ipg_raw = (BLOCKS_PER_GROUP / 8).max(RESERVED_INODES + 6);
    let inodes_per_group = ipg_raw.div_ceil(inodes_per_block) * inodes_per_block;
    let itable_blocks = inodes_per_group / inodes_per_block;

    let now = clock.seconds() as u32;
    let mut groups: Vec<GroupDesc> = Vec::with_capacity(group_count as usize);

    // Per-group layout: [sb copy + gd copies] bitmap, bitmap, inode table.
    let mut total_free_blocks = 0u32;
    for g in 0..group_count {
        let base = first_data_block + g * BLOCKS_PER_GROUP;
        let meta = 1 + gd_blocks; // superblock (copy) + descriptor table
        let block_bitmap = base + meta;
        let inode_bitmap = block_bitmap + 1;
        let inode_table = inode_bitmap + 1;
        let data_start = inode_table + itable_blocks;

        let group_blocks = (blocks_count - base).min(BLOCKS_PER_GROUP);
        let overhead = data_start - base;
        if group_blocks <= overhead {
            return Err(Errno::Inval);
        }
        let free = group_blocks - overhead;
        total_free_blocks += free;

        let mut gd = GroupDesc::new_zeroed();
        gd.block_bitmap.set(block_bitmap);
        gd.inode_bitmap.set(inode_bitmap);
        gd.inode_table.set(inode_table);
        gd.free_blocks_count.set(free as u16);
        gd.free_inodes_count.set(inodes_per_group as u16);
        groups.push(gd);

        // Block bitmap: overhead blocks used, the tail past the group end
        // marked used so the allocator never hands them out.
        let mut bitmap = vec![0u8; BLOCK_SIZE as usize];
        for bit in 0..overhead as usize {
            bitmap[bit / 8] |= 1 << (bit % 8);
        }
        for bit in group_blocks as usize..BLOCKS_PER_GROUP as usize {
            bitmap[bit / 8] |= 1 << (bit % 8);
        }
        write_block(bdev, block_bitmap, &bitmap)?;

        // Inode bitmap: tail past inodes_per_group marked used.
        let mut ibitmap = vec![0u8; BLOCK_SIZE as usize];
        for bit in inodes_per_group as usize..(BLOCK_SIZE as usize * 8) {
            ibitmap[bit / 8] |= 1 << (bit % 8);
        }
        write_block(bdev, inode_bitmap, &ibitmap)?;

        // Zeroed inode table.
        let zero = vec![0u8; BLOCK_SIZE as usize];
        for b in 0..itable_blocks {
            write_block(bdev, inode_table + b, &zero)?;
        }
    }

    // Reserve inodes 1..=10 and set up the root directory in group 0.
    {
        let gd = &mut groups[0];
        let mut ibitmap = vec![0u8; BLOCK_SIZE as usize];
        bdev.read_bytes(
            u64::from(gd.inode_bitmap.get()) * u64::from(BLOCK_SIZE),
            &mut ibitmap,
        )?;
        for bit in 0..RESERVED_INODES as usize {
            ibitmap[bit / 8] |= 1 << (bit % 8);
        }
        write_block(bdev, gd.inode_bitmap.get(), &ibitmap)?;
        gd.free_inodes_count
            .set(gd.free_inodes_count.get() - RESERVED_INODES as u16);
        gd.used_dirs_count.set(1);
    }

    // Root directory: one data block holding "." and "..".
    let root_block = {
        let gd = &mut groups[0];
        let base = first_data_block;
        let data_start = gd.inode_table.get() + itable_blocks;
        let bit = (data_start - base) as usize;
        let mut bitmap = vec![0u8; BLOCK_SIZE as usize];
        bdev.read_bytes(
            u64::from(gd.block_bitmap.get()) * u64::from(BLOCK_SIZE),
            &mut bitmap,
        )?;
        bitmap[bit / 8] |= 1 << (bit % 8);
        write_block(bdev, gd.block_bitmap.get(), &bitmap)?;
        gd.free_blocks_count.set(gd.free_blocks_count.get() - 1);
        total_free_blocks -= 1;
        data_start
    };

    let mut root_data = vec![0u8; BLOCK_SIZE as usize];
    let dot = DirEntryHead {
        inode: layout::ROOT_INO.into(),
        rec_len: (dir_entry_size(1) as u16).into(),
        name_len: 1,
        file_type: layout::FT_DIR,
    };
    root_data[..layout::DIR_ENTRY_HEAD].copy_from_slice(dot.as_bytes());
    root_data[layout::DIR_ENTRY_HEAD] = b'.';
    let dd_off = dir_entry_size(1);
    let dotdot = DirEntryHead {
        inode: layout::ROOT_INO.into(),
        rec_len: ((BLOCK_SIZE as usize - dd_off) as u16).into(),
        name_len: 2,
        file_type: layout::FT_DIR,
    };
    root_data[dd_off..dd_off + layout::DIR_ENTRY_HEAD].copy_from_slice(dotdot.as_bytes());
    root_data[dd_off + layout::DIR_ENTRY_HEAD] = b'.';
    root_data[dd_off + layout::DIR_ENTRY_HEAD + 1] = b'.';
    write_block(bdev, root_block, &root_data)?;

    let mut root = RawInode::new_zeroed();
    root.mode.set(layout::S_IFDIR | 0o755);
    root.links_count.set(2);
    root.size.set(BLOCK_SIZE);
    root.blocks.set(BLOCK_SIZE / 512);
    root.atime.set(now);
    root.ctime.set(now);
    root.mtime.set(now);
    root.block[0].set(root_block);
    let itable = groups[0].inode_table.get();
    let root_offset = u64::from(itable) * u64::from(BLOCK_SIZE)
        + u64::from(layout::ROOT_INO - 1) * u64::from(INODE_SIZE);
    bdev.write_bytes(root_offset, root.as_bytes())?;

    // Superblock.
    let mut sb = Superblock::new_zeroed();
    sb.inodes_count.set(inodes_per_group * group_count);
    sb.blocks_count.set(blocks_count);
    sb.free_blocks_count.set(total_free_blocks);
    sb.free_inodes_count
        .set(inodes_per_group * group_count - RESERVED_INODES);
    sb.first_data_block.set(first_data_block);
    sb.log_block_size.set(0);
    sb.log_frag_size.set(0);
    sb.blocks_per_group.set(BLOCKS_PER_GROUP);
    sb.frags_per_group.set(BLOCKS_PER_GROUP);
    sb.inodes_per_group.set(inodes_per_group);
    sb.wtime.set(now);
    sb.max_mnt_count.set(0xFFFF);
    sb.magic.set(layout::EXT_MAGIC);
    sb.state.set(layout::STATE_VALID);
    sb.errors.set(1);
    sb.rev_level.set(1);
    sb.first_ino.set(layout::FIRST_INO);
    sb.inode_size.set(INODE_SIZE as u16);
    sb.feature_incompat.set(layout::INCOMPAT_FILETYPE);
    sb.lastcheck.set(now);
    bdev.write_bytes(layout::SUPERBLOCK_OFFSET, sb.as_bytes())?;

    // Group descriptor table in the block after the superblock.
    let mut gd_raw = Vec::with_capacity(groups.len() * 32);
    for gd in &groups {
        gd_raw.extend_from_slice(gd.as_bytes());
    }
    let gd_offset = u64::from(first_data_block + 1) * u64::from(BLOCK_SIZE);
    bdev.write_bytes(gd_offset, &gd_raw)?;
    Ok(())
}

fn write_block(bdev: &mut BlockDev, block: u32, data: &[u8]) -> KResult<()> {
    bdev.write_bytes(u64::from(block) * u64::from(BLOCK_SIZE), data)
}
