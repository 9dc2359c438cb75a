//! On-disk structures of the ext family (rev 1 layout).
//!
//! All fields are little-endian. The superblock lives at byte offset 1024;
//! block group descriptors follow in the block after it.

use zerocopy::little_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Superblock magic.
pub(crate) const EXT_MAGIC: u16 = 0xEF53;

/// Byte offset of the superblock.
pub(crate) const SUPERBLOCK_OFFSET: u64 = 1024;

/// Inode number of the root directory.
pub(crate) const ROOT_INO: u32 = 2;

/// First inode available for regular allocation (rev 1).
pub(crate) const FIRST_INO: u32 = 11;

/// Direct block pointers per inode.
pub(crate) const DIRECT_BLOCKS: usize = 12;
/// Index of the single-indirect pointer.
pub(crate) const IND_BLOCK: usize = 12;
/// Index of the double-indirect pointer.
pub(crate) const DIND_BLOCK: usize = 13;

/// Required feature we implement: typed directory entries.
pub(crate) const INCOMPAT_FILETYPE: u32 = 0x0002;
/// Compat feature that flips the mount read-only: a journal is present.
pub(crate) const COMPAT_HAS_JOURNAL: u32 = 0x0004;

/// `s_state` value for a cleanly unmounted volume.
pub(crate) const STATE_VALID: u16 = 1;

/// Directory entry file types.
pub(crate) const FT_REG_FILE: u8 = 1;
/// Directory.
pub(crate) const FT_DIR: u8 = 2;

/// Mode bits for the node kind.
pub(crate) const S_IFREG: u16 = 0x8000;
/// Directory kind bits.
pub(crate) const S_IFDIR: u16 = 0x4000;
/// Kind mask.
pub(crate) const S_IFMT: u16 = 0xF000;

/// The superblock (first 1024 bytes of the structure; the rest of the
/// on-disk block is reserved padding).
#[derive(Debug, Clone, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub(crate) struct Superblock {
    pub(crate) inodes_count: U32,
    pub(crate) blocks_count: U32,
    pub(crate) r_blocks_count: U32,
    pub(crate) free_blocks_count: U32,
    pub(crate) free_inodes_count: U32,
    pub(crate) first_data_block: U32,
    pub(crate) log_block_size: U32,
    pub(crate) log_frag_size: U32,
    pub(crate) blocks_per_group: U32,
    pub(crate) frags_per_group: U32,
    pub(crate) inodes_per_group: U32,
    pub(crate) mtime: U32,
    pub(crate) wtime: U32,
    pub(crate) mnt_count: U16,
    pub(crate) max_mnt_count: U16,
    pub(crate) magic: U16,
    pub(crate) state: U16,
    pub(crate) errors: U16,
    pub(crate) minor_rev_level: U16,
    pub(crate) lastcheck: U32,
    pub(crate) checkinterval: U32,
    pub(crate) creator_os: U32,
    pub(crate) rev_level: U32,
    pub(crate) def_resuid: U16,
    pub(crate) def_resgid: U16,
    // Rev 1 extensions.
    pub(crate) first_ino: U32,
    pub(crate) inode_size: U16,
    pub(crate) block_group_nr: U16,
    pub(crate) feature_compat: U32,
    pub(crate) feature_incompat: U32,
    pub(crate) feature_ro_compat: U32,
    pub(crate) uuid: [u8; 16],
    pub(crate) volume_name: [u8; 16],
    pub(crate) last_mounted: [u8; 64],
    pub(crate) algo_bitmap: U32,
    pub(crate) prealloc_blocks: u8,
    pub(crate) prealloc_dir_blocks: u8,
    pub(crate) reserved_gdt_blocks: U16,
}

impl Superblock {
    /// Block size in bytes.
    pub(crate) fn block_size(&self) -> u32 {
        1024 << self.log_block_size.get()
    }

    /// Number of block groups.
    pub(crate) fn group_count(&self) -> u32 {
        let blocks = self.blocks_count.get() - self.first_data_block.get();
        blocks.div_ceil(self.blocks_per_group.get())
    }
}

/// One block group descriptor (32 bytes).
#[derive(Debug, Clone, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub(crate) struct GroupDesc {
    pub(crate) block_bitmap: U32,
    pub(crate) inode_bitmap: U32,
    pub(crate) inode_table: U32,
    pub(crate) free_blocks_count: U16,
    pub(crate) free_inodes_count: U16,
    pub(crate) used_dirs_count: U16,
    pub(crate) pad: U16,
    pub(crate) reserved: [u8; 12],
}

/// On-disk inode (the leading 128 bytes; larger inode sizes pad behind it).
#[derive(Debug, Clone, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub(crate) struct RawInode {
    pub(crate) mode: U16,
    pub(crate) uid: U16,
    pub(crate) size: U32,
    pub(crate) atime: U32,
    pub(crate) ctime: U32,
    pub(crate) mtime: U32,
    pub(crate) dtime: U32,
    pub(crate) gid: U16,
    pub(crate) links_count: U16,
    pub(crate) blocks: U32,
    pub(crate) flags: U32,
    pub(crate) osd1: U32,
    pub(crate) block: [U32; 15],
    pub(crate) generation: U32,
    pub(crate) file_acl: U32,
    pub(crate) size_high: U32,
    pub(crate) faddr: U32,
    pub(crate) osd2: [u8; 12],
}

impl RawInode {
    /// Whether the inode is a directory.
    pub(crate) fn is_dir(&self) -> bool {
        self.mode.get() & S_IFMT == S_IFDIR
    }

    /// Whether the inode is a regular file.
    pub(crate) fn is_regular(&self) -> bool {
        self.mode.get() & S_IFMT == S_IFREG
    }
}

/// Fixed head of a directory entry; the name follows it.
#[derive(Debug, Clone, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub(crate) struct DirEntryHead {
    pub(crate) inode: U32,
    pub(crate) rec_len: U16,
    pub(crate) name_len: u8,
    pub(crate) file_type: u8,
}

/// Byte size of [`DirEntryHead`].
pub(crate) const DIR_ENTRY_HEAD: usize = 8;

/// Space a directory entry with an `n`-byte name occupies (4-byte aligned).
pub(crate) fn dir_entry_size(name_len: usize) -> usize {
    (DIR_ENTRY_HEAD + name_len + 3) & !3
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn struct_sizes_match_the_layout() {
        assert_eq!(std::mem::size_of::<GroupDesc>(), 32);
        assert_eq!(std::mem::size_of::<RawInode>(), 128);
        assert_eq!(std::mem::size_of::<DirEntryHead>(), DIR_ENTRY_HEAD);
        // The superblock structure covers the rev-1 prefix.
        assert!(std::mem::size_of::<Superblock>() <= 1024);
    }

    #[test]
    fn dir_entry_sizes_are_aligned() {
        assert_eq!(dir_entry_size(1), 12);
        assert_eq!(dir_entry_size(4), 12);
        assert_eq!(dir_entry_size(5), 16);
        assert_eq!(dir_entry_size(255), 264);
    }

    #[test]
    fn block_size_follows_the_shift() {
        let (mut sb, _) = Superblock::read_from_prefix(&[0u8; 1024][..]).unwrap();
        assert_eq!(sb.block_size(), 1024);
        sb.log_block_size = 2.into();
        assert_eq!(sb.block_size(), 4096);
    }
}
