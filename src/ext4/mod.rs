//! A compact ext-family library: the rev-1 layout (superblock, block
//! groups, bitmaps, inode tables, classic block maps, linear directories)
//! over the cached block device in [`blockdev`].
//!
//! Volumes carrying incompatible features we do not implement refuse to
//! mount; a volume with a journal is mounted read-only rather than risk
//! replaying state we cannot interpret.

use log::{debug, warn};
use zerocopy::{FromBytes, FromZeros, IntoBytes};

use crate::errno::{Errno, KResult};
use crate::sync::KClock;

pub mod blockdev;
pub mod mkfs;

mod alloc;
mod bcache;
mod dir;
mod inode;
mod layout;

pub use blockdev::{Block, BlockDev, BlockIo};
pub use mkfs::mkfs;

use layout::{GroupDesc, RawInode, Superblock};

/// A mounted ext volume.
pub struct Ext4 {
    pub(crate) bdev: BlockDev,
    pub(crate) sb: Superblock,
    pub(crate) groups: Vec<GroupDesc>,
    pub(crate) block_size: u32,
    pub(crate) inode_size: u32,
    read_only: bool,
    clock: KClock,
}

impl std::fmt::Debug for Ext4 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ext4")
            .field("block_size", &self.block_size)
            .field("read_only", &self.read_only)
            .finish_non_exhaustive()
    }
}

/// Metadata the library reports for one inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InodeInfo {
    /// Inode number.
    pub ino: u32,
    /// Size in bytes.
    pub size: u64,
    /// Whether the inode is a directory.
    pub is_dir: bool,
    /// Permission bits.
    pub mode: u16,
    /// Owner uid.
    pub uid: u16,
    /// Owner gid.
    pub gid: u16,
    /// Creation time.
    pub ctime: u32,
    /// Modification time.
    pub mtime: u32,
}

/// One directory listing row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirRow {
    /// Entry name.
    pub name: String,
    /// Target inode.
    pub ino: u32,
    /// Whether the target is a directory.
    pub is_dir: bool,
}

impl Ext4 {
    /// Mount the volume on `bdev`.
    ///
    /// `read_only` disables every mutating operation; it is also forced on
    /// when the volume carries a journal.
    pub fn mount(mut bdev: BlockDev, clock: KClock, read_only: bool) -> KResult<Self> {
        let mut raw = [0u8; 1024];
        bdev.read_bytes(layout::SUPERBLOCK_OFFSET, &mut raw)?;
        let (sb, _) = Superblock::read_from_prefix(&raw[..]).map_err(|_| Errno::Io)?;

        if sb.magic.get() != layout::EXT_MAGIC {
            return Err(Errno::Inval);
        }
        if sb.rev_level.get() > 1 {
            return Err(Errno::NotSup);
        }
        let incompat = sb.feature_incompat.get();
        if incompat & !layout::INCOMPAT_FILETYPE != 0 {
            warn!("ext4: unsupported incompat features {incompat:#x}");
            return Err(Errno::NotSup);
        }
        let mut read_only = read_only;
        if sb.feature_compat.get() & layout::COMPAT_HAS_JOURNAL != 0 {
            warn!("ext4: journalled volume, forcing read-only mount");
            read_only = true;
        }

        let block_size = sb.block_size();
        bdev.set_lb_size(block_size)?;

        let inode_size = if sb.rev_level.get() == 0 {
            128
        } else {
            u32::from(sb.inode_size.get())
        };
        if inode_size < 128 {
            return Err(Errno::Io);
        }

        // Group descriptor table sits in the block after the superblock.
        let group_count = sb.group_count() as usize;
        let gd_offset =
            u64::from(sb.first_data_block.get() + 1) * u64::from(block_size);
        let mut groups = Vec::with_capacity(group_count);
        let mut gd_raw = vec![0u8; group_count * 32];
        bdev.read_bytes(gd_offset, &mut gd_raw)?;
        for chunk in gd_raw.chunks_exact(32) {
            let gd = GroupDesc::read_from_bytes(chunk).map_err(|_| Errno::Io)?;
            groups.push(gd);
        }

        debug!(
            "ext4: mounted, {} blocks of {block_size} bytes, {group_count} group(s)",
            sb.blocks_count.get()
        );
        Ok(Ext4 {
            bdev,
            sb,
            groups,
            block_size,
            inode_size,
            read_only,
            clock,
        })
    }

    /// Whether mutating operations are refused.
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// The underlying block device, for cache control and counters.
    pub fn bdev_mut(&mut self) -> &mut BlockDev {
        &mut self.bdev
    }

    pub(crate) fn now(&self) -> u32 {
        self.clock.seconds() as u32
    }

    pub(crate) fn check_writable(&self) -> KResult<()> {
        if self.read_only {
            Err(Errno::Rofs)
        } else {
            Ok(())
        }
    }

    /// Write the superblock and the group descriptor table back out.
    pub(crate) fn flush_meta(&mut self) -> KResult<()> {
        if self.read_only {
            return Ok(());
        }
        let sb_bytes = self.sb.as_bytes().to_vec();
        self.bdev
            .write_bytes(layout::SUPERBLOCK_OFFSET, &sb_bytes)?;
        let gd_offset =
            u64::from(self.sb.first_data_block.get() + 1) * u64::from(self.block_size);
        let mut gd_raw = Vec::with_capacity(self.groups.len() * 32);
        for gd in &self.groups {
            gd_raw.extend_from_slice(gd.as_bytes());
        }
        self.bdev.write_bytes(gd_offset, &gd_raw)?;
        Ok(())
    }

    /// Resolve `path` (absolute, `/`-separated) to an inode number.
    pub fn lookup_path(&mut self, path: &str) -> KResult<u32> {
        let mut ino = layout::ROOT_INO;
        for component in crate::vfs::path::components(path) {
            let node = self.read_inode(ino)?;
            if !node.is_dir() {
                return Err(Errno::NotDir);
            }
            ino = self
                .dir_find(&node, component)?
                .ok_or(Errno::NoEnt)?;
        }
        Ok(ino)
    }

    /// Metadata for `ino`.
    pub fn inode_info(&mut self, ino: u32) -> KResult<InodeInfo> {
        let node = self.read_inode(ino)?;
        Ok(InodeInfo {
            ino,
            size: u64::from(node.size.get()),
            is_dir: node.is_dir(),
            mode: node.mode.get() & 0o7777,
            uid: node.uid.get(),
            gid: node.gid.get(),
            ctime: node.ctime.get(),
            mtime: node.mtime.get(),
        })
    }

    /// Create an empty regular file at `path`; parents must exist.
    pub fn create_file(&mut self, path: &str, mode: u16) -> KResult<u32> {
        self.check_writable()?;
        let (dir_path, name) = crate::vfs::path::split_last(path).ok_or(Errno::Inval)?;
        let dir_ino = self.lookup_path(dir_path)?;
        let dir_node = self.read_inode(dir_ino)?;
        if !dir_node.is_dir() {
            return Err(Errno::NotDir);
        }
        if self.dir_find(&dir_node, name)?.is_some() {
            return Err(Errno::Exist);
        }

        let ino = self.alloc_inode(false)?;
        let now = self.now();
        let mut node = zeroed_inode();
        node.mode
            .set(layout::S_IFREG | (mode & 0o7777));
        node.links_count.set(1);
        node.ctime.set(now);
        node.mtime.set(now);
        node.atime.set(now);
        self.write_inode(ino, &node)?;
        self.dir_insert(dir_ino, name, ino, layout::FT_REG_FILE)?;
        self.flush_meta()?;
        Ok(ino)
    }

    /// Create a directory at `path`.
    pub fn make_dir(&mut self, path: &str, mode: u16) -> KResult<()> {
        self.check_writable()?;
        let (dir_path, name) = crate::vfs::path::split_last(path).ok_or(Errno::Inval)?;
        let parent_ino = self.lookup_path(dir_path)?;
        let parent = self.read_inode(parent_ino)?;
        if !parent.is_dir() {
            return Err(Errno::NotDir);
        }
        if self.dir_find(&parent, name)?.is_some() {
            return Err(Errno::Exist);
        }

        let ino = self.alloc_inode(true)?;
        let now = self.now();
        let mut node = zeroed_inode();
        node.mode.set(layout::S_IFDIR | (mode & 0o7777));
        node.links_count.set(2);
        node.ctime.set(now);
        node.mtime.set(now);
        node.atime.set(now);
        self.write_inode(ino, &node)?;
        self.dir_init(ino, parent_ino)?;
        self.dir_insert(parent_ino, name, ino, layout::FT_DIR)?;

        let mut parent = self.read_inode(parent_ino)?;
        parent
            .links_count
            .set(parent.links_count.get() + 1);
        parent.mtime.set(now);
        self.write_inode(parent_ino, &parent)?;
        self.flush_meta()?;
        Ok(())
    }

    /// Read from a regular file; returns the byte count, 0 at end of file.
    pub fn read_at(&mut self, ino: u32, pos: u64, buf: &mut [u8]) -> KResult<usize> {
        let node = self.read_inode(ino)?;
        if node.is_dir() {
            return Err(Errno::IsDir);
        }
        let size = u64::from(node.size.get());
        if pos >= size {
            return Ok(0);
        }
        let n = ((size - pos) as usize).min(buf.len());
        self.inode_read_range(&node, pos, &mut buf[..n])?;
        Ok(n)
    }

    /// Write to a regular file, extending it as needed.
    pub fn write_at(&mut self, ino: u32, pos: u64, buf: &[u8]) -> KResult<usize> {
        self.check_writable()?;
        if buf.is_empty() {
            return Ok(0);
        }
        let mut node = self.read_inode(ino)?;
        if node.is_dir() {
            return Err(Errno::IsDir);
        }
        self.inode_write_range(&mut node, pos, buf)?;
        let end = pos + buf.len() as u64;
        if end > u64::from(node.size.get()) {
            node.size.set(end as u32);
        }
        let now = self.now();
        node.mtime.set(now);
        self.write_inode(ino, &node)?;
        self.flush_meta()?;
        Ok(buf.len())
    }

    /// Truncate a regular file to zero length, freeing its blocks.
    pub fn truncate(&mut self, ino: u32) -> KResult<()> {
        self.check_writable()?;
        let mut node = self.read_inode(ino)?;
        if !node.is_regular() {
            return Err(Errno::IsDir);
        }
        self.inode_free_blocks(&mut node)?;
        node.size.set(0);
        node.mtime.set(self.now());
        self.write_inode(ino, &node)?;
        self.flush_meta()?;
        Ok(())
    }

    /// List a directory.
    pub fn list_dir(&mut self, ino: u32) -> KResult<Vec<DirRow>> {
        let node = self.read_inode(ino)?;
        if !node.is_dir() {
            return Err(Errno::NotDir);
        }
        let mut rows = Vec::new();
        for (name, child_ino, file_type) in self.dir_entries(&node)? {
            if name == "." || name == ".." {
                continue;
            }
            rows.push(DirRow {
                name,
                ino: child_ino,
                is_dir: file_type == layout::FT_DIR,
            });
        }
        Ok(rows)
    }

    /// Remove a file or an empty directory.
    pub fn remove(&mut self, path: &str) -> KResult<()> {
        self.check_writable()?;
        let (dir_path, name) = crate::vfs::path::split_last(path).ok_or(Errno::Inval)?;
        let parent_ino = self.lookup_path(dir_path)?;
        let parent = self.read_inode(parent_ino)?;
        let ino = self.dir_find(&parent, name)?.ok_or(Errno::NoEnt)?;
        let mut node = self.read_inode(ino)?;

        if node.is_dir() {
            if !self.dir_is_empty(&node)? {
                return Err(Errno::NotEmpty);
            }
            self.inode_free_blocks(&mut node)?;
            self.dir_remove(parent_ino, name)?;
            node.links_count.set(0);
            node.dtime.set(self.now());
            self.write_inode(ino, &node)?;
            self.free_inode(ino, true)?;
            let mut parent = self.read_inode(parent_ino)?;
            parent
                .links_count
                .set(parent.links_count.get().saturating_sub(1));
            self.write_inode(parent_ino, &parent)?;
        } else {
            self.dir_remove(parent_ino, name)?;
            let links = node.links_count.get().saturating_sub(1);
            node.links_count.set(links);
            if links == 0 {
                self.inode_free_blocks(&mut node)?;
                node.dtime.set(self.now());
                self.write_inode(ino, &node)?;
                self.free_inode(ino, false)?;
            } else {
                self.write_inode(ino, &node)?;
            }
        }
        self.flush_meta()?;
        Ok(())
    }

    /// Rename/move within the volume. The destination must not exist.
    pub fn rename(&mut self, old_path: &str, new_path: &str) -> KResult<()> {
        self.check_writable()?;
        let (old_dir_path, old_name) =
            crate::vfs::path::split_last(old_path).ok_or(Errno::Inval)?;
        let (new_dir_path, new_name) =
            crate::vfs::path::split_last(new_path).ok_or(Errno::Inval)?;

        let old_parent = self.lookup_path(old_dir_path)?;
        let new_parent = self.lookup_path(new_dir_path)?;
        let old_parent_node = self.read_inode(old_parent)?;
        let new_parent_node = self.read_inode(new_parent)?;
        if !new_parent_node.is_dir() {
            return Err(Errno::NotDir);
        }
        let ino = self
            .dir_find(&old_parent_node, old_name)?
            .ok_or(Errno::NoEnt)?;
        if self.dir_find(&new_parent_node, new_name)?.is_some() {
            return Err(Errno::Exist);
        }

        let node = self.read_inode(ino)?;
        let file_type = if node.is_dir() {
            layout::FT_DIR
        } else {
            layout::FT_REG_FILE
        };
        self.dir_insert(new_parent, new_name, ino, file_type)?;
        self.dir_remove(old_parent, old_name)?;

        if node.is_dir() && old_parent != new_parent {
            self.dir_set_dotdot(ino, new_parent)?;
            let mut old = self.read_inode(old_parent)?;
            old.links_count.set(old.links_count.get().saturating_sub(1));
            self.write_inode(old_parent, &old)?;
            let mut new = self.read_inode(new_parent)?;
            new.links_count.set(new.links_count.get() + 1);
            self.write_inode(new_parent, &new)?;
        }
        self.flush_meta()?;
        Ok(())
    }

    /// Set permission bits.
    pub fn chmod(&mut self, ino: u32, mode: u16) -> KResult<()> {
        self.check_writable()?;
        let mut node = self.read_inode(ino)?;
        let kind = node.mode.get() & layout::S_IFMT;
        node.mode.set(kind | (mode & 0o7777));
        node.ctime.set(self.now());
        self.write_inode(ino, &node)?;
        self.flush_meta()
    }

    /// Set ownership.
    pub fn chown(&mut self, ino: u32, uid: u16, gid: u16) -> KResult<()> {
        self.check_writable()?;
        let mut node = self.read_inode(ino)?;
        node.uid.set(uid);
        node.gid.set(gid);
        node.ctime.set(self.now());
        self.write_inode(ino, &node)?;
        self.flush_meta()
    }

    /// Volume totals for `statfs`.
    pub fn volume_info(&self) -> (u32, u64, u64, u64, u64) {
        (
            self.block_size,
            u64::from(self.sb.blocks_count.get()),
            u64::from(self.sb.free_blocks_count.get()),
            u64::from(self.sb.inodes_count.get()),
            u64::from(self.sb.free_inodes_count.get()),
        )
    }

    /// Flush metadata and every delayed cache block to the device.
    pub fn sync(&mut self) -> KResult<()> {
        self.flush_meta()?;
        // Draining the write-back depth flushes delayed slots.
        if self.bdev.write_back_depth() > 0 {
            self.bdev.cache_write_back(false)?;
            self.bdev.cache_write_back(true)?;
        }
        Ok(())
    }

    /// Unmount: flush everything and mark the superblock clean.
    pub fn unmount(&mut self) -> KResult<()> {
        if !self.read_only {
            self.sb.state.set(layout::STATE_VALID);
            self.sb.wtime.set(self.now());
            self.flush_meta()?;
        }
        while self.bdev.write_back_depth() > 0 {
            self.bdev.cache_write_back(false)?;
        }
        Ok(())
    }
}

pub(crate) fn zeroed_inode() -> RawInode {
    RawInode::new_zeroed()
}
