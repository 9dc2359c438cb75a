//! `fatfs`: FAT12/16/32 with long file names, on a source file opened
//! through the VFS.
//!
//! One mutex guards each volume; every public entry point takes it. A
//! single sector window per volume buffers FAT and directory sectors and is
//! written back before the window moves; file data bypasses the window.
//! Long-name lookup is case-insensitive via the bundled code-page table;
//! creation produces an LFN chain plus an 8.3 alias.

use std::collections::HashMap;
use std::sync::Arc;

use log::debug;
use zerocopy::{FromBytes, FromZeros, IntoBytes};

use crate::errno::{Errno, KResult};
use crate::fs::{
    DirEntry, DirStream, FileHandle, FileSystem, FileType, FsContext, OpenFlags, Stat, StatFs,
};
use crate::sync::{KClock, KMutex};
use crate::vfs::{Fd, Vfs, Whence, path};

mod codepage;
mod layout;
mod mkfs;

pub use mkfs::mkfs;

use layout::{
    ATTR_ARCHIVE, ATTR_DIRECTORY, ATTR_LONG_NAME, ATTR_MASK, ATTR_VOLUME_ID, BpbCommon,
    Bpb32Tail, DirEntryRaw, ENTRY_END, ENTRY_FREE, LFN_CHARS, LFN_LAST, LfnEntryRaw,
    sfn_checksum,
};

/// Backend constructor registered under the name `"fatfs"`.
pub fn init(ctx: &FsContext) -> KResult<Box<dyn FileSystem>> {
    if ctx.source.is_empty() {
        return Err(Errno::Inval);
    }
    let mode = if ctx.options.read_only { "r" } else { "r+" };
    let src_fd = ctx.vfs.open(&ctx.source, mode)?;
    match Volume::mount(ctx.vfs.clone(), src_fd, ctx.options.read_only, ctx.clock) {
        Ok(volume) => {
            debug!(
                "fatfs: mounted {:?} as {:?} (cp{})",
                ctx.source,
                volume.fat_type,
                codepage::CODE_PAGE
            );
            Ok(Box::new(FatFs {
                state: KMutex::new(volume),
            }))
        }
        Err(err) => {
            let _ = ctx.vfs.close(src_fd);
            Err(err)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FatType {
    Fat12,
    Fat16,
    Fat32,
}

/// Which directory an operation works in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DirRef {
    /// The fixed FAT12/16 root area.
    Root,
    /// A cluster-chained directory (including the FAT32 root).
    Cluster(u32),
}

/// Location of one 32-byte directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DirLoc {
    sector: u64,
    offset: usize,
}

#[derive(Debug, Clone)]
struct OpenedFat {
    loc: DirLoc,
    sclust: u32,
    size: u32,
    flags: OpenFlags,
}

struct Volume {
    vfs: Arc<Vfs>,
    src_fd: Fd,
    read_only: bool,
    clock: KClock,
    fat_type: FatType,
    ssize: u32,
    csize: u32,
    n_fats: u8,
    fatbase: u64,
    fsize: u32,
    rootbase: u64,
    root_entries: u32,
    root_clus: u32,
    database: u64,
    max_clust: u32,
    window: Vec<u8>,
    winsect: u64,
    wflag: bool,
    opened: HashMap<u64, OpenedFat>,
    next_fh: u64,
}

/// The FAT backend instance.
pub struct FatFs {
    state: KMutex<Volume>,
}

impl std::fmt::Debug for FatFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FatFs").finish_non_exhaustive()
    }
}

const NO_SECTOR: u64 = u64::MAX;
const DIR_ENTRY_SIZE: usize = 32;

impl Volume {
    fn mount(vfs: Arc<Vfs>, src_fd: Fd, read_only: bool, clock: KClock) -> KResult<Self> {
        let mut boot = [0u8; 512];
        vfs.lseek(src_fd, 0, Whence::Set)?;
        read_exact(&vfs, src_fd, &mut boot)?;

        if u16::from_le_bytes([boot[510], boot[511]]) != layout::BOOT_SIGNATURE {
            return Err(Errno::Inval);
        }
        let (bpb, _) = BpbCommon::read_from_prefix(&boot[..]).map_err(|_| Errno::Io)?;
        let ssize = u32::from(bpb.bytes_per_sec.get());
        if !(512..=4096).contains(&ssize) || !ssize.is_power_of_two() {
            return Err(Errno::Inval);
        }
        let csize = u32::from(bpb.sec_per_clus);
        if csize == 0 || !csize.is_power_of_two() {
            return Err(Errno::Inval);
        }

        let fatsz = if bpb.fatsz16.get() != 0 {
            u32::from(bpb.fatsz16.get())
        } else {
            let (tail, _) = Bpb32Tail::read_from_prefix(&boot[36..]).map_err(|_| Errno::Io)?;
            tail.fatsz32.get()
        };
        let tot_sec = if bpb.tot_sec16.get() != 0 {
            u32::from(bpb.tot_sec16.get())
        } else {
            bpb.tot_sec32.get()
        };
        let rsvd = u32::from(bpb.rsvd_sec_cnt.get());
        let n_fats = bpb.num_fats;
        let root_entries = u32::from(bpb.root_ent_cnt.get());
        let root_dir_sectors = (root_entries * 32).div_ceil(ssize);

        let sysect = rsvd + u32::from(n_fats) * fatsz + root_dir_sectors;
        if tot_sec <= sysect {
            return Err(Errno::Inval);
        }
        let n_clust = (tot_sec - sysect) / csize;
        let fat_type = if n_clust < 4085 {
            FatType::Fat12
        } else if n_clust < 65525 {
            FatType::Fat16
        } else {
            FatType::Fat32
        };
        let root_clus = if fat_type == FatType::Fat32 {
            let (tail, _) = Bpb32Tail::read_from_prefix(&boot[36..]).map_err(|_| Errno::Io)?;
            tail.root_clus.get()
        } else {
            0
        };

        Ok(Volume {
            vfs,
            src_fd,
            read_only,
            clock,
            fat_type,
            ssize,
            csize,
            n_fats,
            fatbase: u64::from(rsvd),
            fsize: fatsz,
            rootbase: u64::from(rsvd + u32::from(n_fats) * fatsz),
            root_entries,
            root_clus,
            database: u64::from(sysect),
            max_clust: n_clust + 2,
            window: vec![0; ssize as usize],
            winsect: NO_SECTOR,
            wflag: false,
            opened: HashMap::new(),
            next_fh: 1,
        })
    }

    fn check_writable(&self) -> KResult<()> {
        if self.read_only {
            Err(Errno::Rofs)
        } else {
            Ok(())
        }
    }

    // ---- raw disk access ------------------------------------------------

    fn disk_read(&self, buf: &mut [u8], sector: u64) -> KResult<()> {
        self.vfs
            .lseek(self.src_fd, (sector * u64::from(self.ssize)) as i64, Whence::Set)?;
        read_exact(&self.vfs, self.src_fd, buf)
    }

    fn disk_write(&self, buf: &[u8], sector: u64) -> KResult<()> {
        self.vfs
            .lseek(self.src_fd, (sector * u64::from(self.ssize)) as i64, Whence::Set)?;
        write_all(&self.vfs, self.src_fd, buf)
    }

    /// Flush the sector window if dirty. A window inside the first FAT is
    /// mirrored to the other copies.
    fn sync_window(&mut self) -> KResult<()> {
        if !self.wflag || self.winsect == NO_SECTOR {
            return Ok(());
        }
        let window = std::mem::take(&mut self.window);
        let result = (|| {
            self.disk_write(&window, self.winsect)?;
            let fat_end = self.fatbase + u64::from(self.fsize);
            if self.winsect >= self.fatbase && self.winsect < fat_end {
                for copy in 1..u64::from(self.n_fats) {
                    self.disk_write(&window, self.winsect + copy * u64::from(self.fsize))?;
                }
            }
            Ok(())
        })();
        self.window = window;
        result?;
        self.wflag = false;
        Ok(())
    }

    /// Re-aim the window at `sector`, flushing it first if needed.
    fn move_window(&mut self, sector: u64) -> KResult<()> {
        if self.winsect == sector {
            return Ok(());
        }
        self.sync_window()?;
        let mut window = std::mem::take(&mut self.window);
        let result = self.disk_read(&mut window, sector);
        self.window = window;
        result?;
        self.winsect = sector;
        Ok(())
    }

    // ---- FAT ------------------------------------------------------------

    fn fat_byte(&mut self, offset: u64) -> KResult<u8> {
        let sector = self.fatbase + offset / u64::from(self.ssize);
        self.move_window(sector)?;
        Ok(self.window[(offset % u64::from(self.ssize)) as usize])
    }

    fn set_fat_byte(&mut self, offset: u64, value: u8, mask: u8) -> KResult<()> {
        let sector = self.fatbase + offset / u64::from(self.ssize);
        self.move_window(sector)?;
        let idx = (offset % u64::from(self.ssize)) as usize;
        self.window[idx] = (self.window[idx] & !mask) | (value & mask);
        self.wflag = true;
        Ok(())
    }

    fn get_fat(&mut self, clust: u32) -> KResult<u32> {
        if clust < 2 || clust >= self.max_clust {
            return Err(Errno::Io);
        }
        match self.fat_type {
            FatType::Fat12 => {
                let off = u64::from(clust) + u64::from(clust / 2);
                let lo = self.fat_byte(off)?;
                let hi = self.fat_byte(off + 1)?;
                let val = u16::from_le_bytes([lo, hi]);
                Ok(u32::from(if clust & 1 == 0 {
                    val & 0x0FFF
                } else {
                    val >> 4
                }))
            }
            FatType::Fat16 => {
                let off = u64::from(clust) * 2;
                let lo = self.fat_byte(off)?;
                let hi = self.fat_byte(off + 1)?;
                Ok(u32::from(u16::from_le_bytes([lo, hi])))
            }
            FatType::Fat32 => {
                let off = u64::from(clust) * 4;
                let mut bytes = [0u8; 4];
                for (i, b) in bytes.iter_mut().enumerate() {
                    *b = self.fat_byte(off + i as u64)?;
                }
                Ok(u32::from_le_bytes(bytes) & 0x0FFF_FFFF)
            }
        }
    }

    fn put_fat(&mut self, clust: u32, value: u32) -> KResult<()> {
        if clust < 2 || clust >= self.max_clust {
            return Err(Errno::Io);
        }
        match self.fat_type {
            FatType::Fat12 => {
                let off = u64::from(clust) + u64::from(clust / 2);
                if clust & 1 == 0 {
                    self.set_fat_byte(off, value as u8, 0xFF)?;
                    self.set_fat_byte(off + 1, (value >> 8) as u8, 0x0F)?;
                } else {
                    self.set_fat_byte(off, (value << 4) as u8, 0xF0)?;
                    self.set_fat_byte(off + 1, (value >> 4) as u8, 0xFF)?;
                }
                Ok(())
            }
            FatType::Fat16 => {
                let off = u64::from(clust) * 2;
                self.set_fat_byte(off, value as u8, 0xFF)?;
                self.set_fat_byte(off + 1, (value >> 8) as u8, 0xFF)
            }
            FatType::Fat32 => {
                let off = u64::from(clust) * 4;
                for i in 0..4 {
                    self.set_fat_byte(off + i, (value >> (8 * i)) as u8, 0xFF)?;
                }
                Ok(())
            }
        }
    }

    fn is_eoc(&self, value: u32) -> bool {
        match self.fat_type {
            FatType::Fat12 => value >= 0xFF8,
            FatType::Fat16 => value >= 0xFFF8,
            FatType::Fat32 => value >= 0x0FFF_FFF8,
        }
    }

    fn eoc(&self) -> u32 {
        match self.fat_type {
            FatType::Fat12 => 0xFFF,
            FatType::Fat16 => 0xFFFF,
            FatType::Fat32 => 0x0FFF_FFFF,
        }
    }

    fn next_cluster(&mut self, clust: u32) -> KResult<Option<u32>> {
        let value = self.get_fat(clust)?;
        if value == 0 || self.is_eoc(value) {
            Ok(None)
        } else {
            Ok(Some(value))
        }
    }

    fn clust_to_sector(&self, clust: u32) -> u64 {
        self.database + u64::from(clust - 2) * u64::from(self.csize)
    }

    fn cluster_bytes(&self) -> u32 {
        self.csize * self.ssize
    }

    /// Allocate a free cluster, link it behind `prev`, optionally zero it.
    fn alloc_cluster(&mut self, prev: Option<u32>, zero: bool) -> KResult<u32> {
        for clust in 2..self.max_clust {
            if self.get_fat(clust)? == 0 {
                self.put_fat(clust, self.eoc())?;
                if let Some(prev) = prev {
                    self.put_fat(prev, clust)?;
                }
                if zero {
                    let zeros = vec![0u8; self.ssize as usize];
                    let base = self.clust_to_sector(clust);
                    self.sync_window()?;
                    // The zeroing bypasses the window; drop it if it was
                    // aimed inside this cluster.
                    if self.winsect >= base && self.winsect < base + u64::from(self.csize) {
                        self.winsect = NO_SECTOR;
                    }
                    for s in 0..u64::from(self.csize) {
                        self.disk_write(&zeros, base + s)?;
                    }
                }
                return Ok(clust);
            }
        }
        Err(Errno::NoSpc)
    }

    fn free_chain(&mut self, mut clust: u32) -> KResult<()> {
        while clust >= 2 && clust < self.max_clust {
            let next = self.get_fat(clust)?;
            self.put_fat(clust, 0)?;
            if next == 0 || self.is_eoc(next) {
                break;
            }
            clust = next;
        }
        Ok(())
    }

    // ---- directory entries ---------------------------------------------

    /// Location of entry `idx` of `dir`, allocating a fresh cluster when
    /// `grow` is set and the chain ends exactly there.
    fn dir_entry_loc(&mut self, dir: DirRef, idx: u32, grow: bool) -> KResult<Option<DirLoc>> {
        let per_sector = self.ssize / DIR_ENTRY_SIZE as u32;
        match dir {
            DirRef::Root => {
                if idx >= self.root_entries {
                    return Ok(None);
                }
                Ok(Some(DirLoc {
                    sector: self.rootbase + u64::from(idx / per_sector),
                    offset: ((idx % per_sector) * DIR_ENTRY_SIZE as u32) as usize,
                }))
            }
            DirRef::Cluster(start) => {
                if start < 2 {
                    return Ok(None);
                }
                let per_cluster = per_sector * self.csize;
                let mut clust = start;
                let mut remaining = idx / per_cluster;
                while remaining > 0 {
                    match self.next_cluster(clust)? {
                        Some(next) => clust = next,
                        None if grow => {
                            clust = self.alloc_cluster(Some(clust), true)?;
                        }
                        None => return Ok(None),
                    }
                    remaining -= 1;
                }
                let within = idx % per_cluster;
                Ok(Some(DirLoc {
                    sector: self.clust_to_sector(clust) + u64::from(within / per_sector),
                    offset: ((within % per_sector) * DIR_ENTRY_SIZE as u32) as usize,
                }))
            }
        }
    }

    fn read_raw_entry(&mut self, loc: DirLoc) -> KResult<DirEntryRaw> {
        self.move_window(loc.sector)?;
        DirEntryRaw::read_from_bytes(&self.window[loc.offset..loc.offset + DIR_ENTRY_SIZE])
            .map_err(|_| Errno::Io)
    }

    fn write_raw_entry(&mut self, loc: DirLoc, bytes: &[u8]) -> KResult<()> {
        self.move_window(loc.sector)?;
        self.window[loc.offset..loc.offset + DIR_ENTRY_SIZE].copy_from_slice(bytes);
        self.wflag = true;
        Ok(())
    }

    /// Scan a directory, yielding `(lfn-or-sfn name, entry, loc, first_idx)`
    /// per live entry. `first_idx` is the index of the first LFN entry of
    /// the chain (or of the entry itself).
    fn scan_dir(&mut self, dir: DirRef) -> KResult<Vec<ScannedEntry>> {
        let mut out = Vec::new();
        let mut lfn_units: Vec<u16> = Vec::new();
        let mut lfn_start: Option<u32> = None;
        let mut lfn_chksum = 0u8;

        let mut idx = 0u32;
        loop {
            let Some(loc) = self.dir_entry_loc(dir, idx, false)? else {
                break;
            };
            let entry = self.read_raw_entry(loc)?;
            let first = entry.name[0];
            if first == ENTRY_END {
                break;
            }
            if first == ENTRY_FREE {
                lfn_start = None;
                lfn_units.clear();
                idx += 1;
                continue;
            }
            if entry.attr & ATTR_MASK == ATTR_LONG_NAME {
                let lfn = LfnEntryRaw::read_from_bytes(entry.as_bytes())
                    .map_err(|_| Errno::Io)?;
                if lfn.ord & LFN_LAST != 0 {
                    let count = (lfn.ord & !LFN_LAST) as usize;
                    lfn_units = vec![0u16; count * LFN_CHARS];
                    lfn_start = Some(idx);
                    lfn_chksum = lfn.chksum;
                }
                let ord = (lfn.ord & !LFN_LAST) as usize;
                if ord >= 1 && ord * LFN_CHARS <= lfn_units.len() && lfn.chksum == lfn_chksum
                {
                    lfn_units[(ord - 1) * LFN_CHARS..ord * LFN_CHARS]
                        .copy_from_slice(&lfn.units());
                } else {
                    lfn_start = None;
                    lfn_units.clear();
                }
                idx += 1;
                continue;
            }

            let long_name = match lfn_start {
                Some(_) if sfn_checksum(&entry.name) == lfn_chksum => {
                    let end = lfn_units
                        .iter()
                        .position(|&u| u == 0)
                        .unwrap_or(lfn_units.len());
                    String::from_utf16(&lfn_units[..end]).ok()
                }
                _ => None,
            };
            let name = long_name.unwrap_or_else(|| format_sfn(&entry.name));
            out.push(ScannedEntry {
                name,
                entry,
                loc,
                first_idx: lfn_start.unwrap_or(idx),
                idx,
            });
            lfn_start = None;
            lfn_units.clear();
            idx += 1;
        }
        Ok(out)
    }

    /// Find `name` in `dir`, matching the long name case-insensitively and
    /// the 8.3 alias through the code page.
    fn dir_find(&mut self, dir: DirRef, name: &str) -> KResult<Option<ScannedEntry>> {
        let scanned = self.scan_dir(dir)?;
        Ok(scanned.into_iter().find(|e| {
            if e.entry.attr & ATTR_VOLUME_ID != 0 {
                return false;
            }
            names_equal(&e.name, name)
                || codepage::eq_ignore_case(format_sfn(&e.entry.name).as_bytes(), name.as_bytes())
        }))
    }

    /// Resolve the directory containing `p`'s leaf, plus the leaf name.
    fn resolve_parent<'p>(&mut self, p: &'p str) -> KResult<(DirRef, &'p str)> {
        let (dir_path, name) = path::split_last(p).ok_or(Errno::Inval)?;
        let dir = self.resolve_dir(dir_path)?;
        Ok((dir, name))
    }

    /// Resolve a path that must denote a directory.
    fn resolve_dir(&mut self, p: &str) -> KResult<DirRef> {
        let mut dir = self.root_ref();
        for component in path::components(p) {
            let entry = self
                .dir_find(dir, component)?
                .ok_or(Errno::NoEnt)?;
            if !entry.entry.is_dir() {
                return Err(Errno::NotDir);
            }
            dir = self.child_dir_ref(entry.entry.first_cluster());
        }
        Ok(dir)
    }

    fn root_ref(&self) -> DirRef {
        match self.fat_type {
            FatType::Fat32 => DirRef::Cluster(self.root_clus),
            _ => DirRef::Root,
        }
    }

    /// Cluster 0 in an entry (".." of a first-level directory) means the
    /// root.
    fn child_dir_ref(&self, clust: u32) -> DirRef {
        if clust == 0 {
            self.root_ref()
        } else {
            DirRef::Cluster(clust)
        }
    }

    /// Insert an entry for `name` into `dir`: LFN chain plus 8.3 alias.
    /// Returns the location of the short entry.
    fn dir_register(
        &mut self,
        dir: DirRef,
        name: &str,
        attr: u8,
        sclust: u32,
        size: u32,
    ) -> KResult<DirLoc> {
        if name.is_empty() || name.len() > 255 {
            return Err(Errno::Inval);
        }
        let existing = self.scan_dir(dir)?;
        let (sfn, lossy) = make_sfn(name, &existing)?;
        let needs_lfn = lossy || format_sfn(&sfn) != name;
        let lfn_count = if needs_lfn {
            name.encode_utf16().count().div_ceil(LFN_CHARS) as u32
        } else {
            0
        };
        let total = lfn_count + 1;

        // First run of `total` consecutive free slots.
        let start = self.find_free_run(dir, total)?;

        if needs_lfn {
            let units: Vec<u16> = name.encode_utf16().collect();
            let chksum = sfn_checksum(&sfn);
            for seq in 0..lfn_count {
                let ord = lfn_count - seq;
                let mut lfn = LfnEntryRaw::new_zeroed();
                lfn.ord = ord as u8 | if seq == 0 { LFN_LAST } else { 0 };
                lfn.attr = ATTR_LONG_NAME;
                lfn.chksum = chksum;
                let mut chunk = [0xFFFFu16; LFN_CHARS];
                let base = (ord - 1) as usize * LFN_CHARS;
                for (i, slot) in chunk.iter_mut().enumerate() {
                    let pos = base + i;
                    if pos < units.len() {
                        *slot = units[pos];
                    } else if pos == units.len() {
                        *slot = 0;
                    }
                }
                lfn.set_units(&chunk);
                let loc = self
                    .dir_entry_loc(dir, start + seq, true)?
                    .ok_or(Errno::NoSpc)?;
                self.write_raw_entry(loc, lfn.as_bytes())?;
            }
        }

        let mut entry = DirEntryRaw::new_zeroed();
        entry.name = sfn;
        entry.attr = attr;
        entry.set_first_cluster(sclust);
        entry.file_size.set(size);
        let (date, time) = self.fat_datetime();
        entry.crt_date.set(date);
        entry.crt_time.set(time);
        entry.wrt_date.set(date);
        entry.wrt_time.set(time);
        let loc = self
            .dir_entry_loc(dir, start + lfn_count, true)?
            .ok_or(Errno::NoSpc)?;
        self.write_raw_entry(loc, entry.as_bytes())?;
        Ok(loc)
    }

    /// Index of the first run of `count` consecutive free entries,
    /// extending cluster directories as needed.
    fn find_free_run(&mut self, dir: DirRef, count: u32) -> KResult<u32> {
        let mut run_start = 0u32;
        let mut run_len = 0u32;
        let mut idx = 0u32;
        loop {
            let Some(loc) = self.dir_entry_loc(dir, idx, true)? else {
                // Fixed root exhausted.
                return Err(Errno::NoSpc);
            };
            let first = {
                self.move_window(loc.sector)?;
                self.window[loc.offset]
            };
            if first == ENTRY_FREE || first == ENTRY_END {
                if run_len == 0 {
                    run_start = idx;
                }
                run_len += 1;
                if run_len == count {
                    return Ok(run_start);
                }
            } else {
                run_len = 0;
            }
            idx += 1;
        }
    }

    /// Mark an entry and its LFN chain free.
    fn dir_unregister(&mut self, dir: DirRef, found: &ScannedEntry) -> KResult<()> {
        for idx in found.first_idx..=found.idx {
            let loc = self
                .dir_entry_loc(dir, idx, false)?
                .ok_or(Errno::Io)?;
            self.move_window(loc.sector)?;
            self.window[loc.offset] = ENTRY_FREE;
            self.wflag = true;
        }
        Ok(())
    }

    /// Whether a directory holds anything besides `.` and `..`.
    fn dir_has_entries(&mut self, dir: DirRef) -> KResult<bool> {
        Ok(self
            .scan_dir(dir)?
            .iter()
            .any(|e| e.name != "." && e.name != ".." && e.entry.attr & ATTR_VOLUME_ID == 0))
    }

    // ---- file data ------------------------------------------------------

    /// Walk `hops` links down the chain from `clust`, extending it when
    /// `grow` is set.
    fn chain_skip(&mut self, mut clust: u32, hops: u32, grow: bool) -> KResult<Option<u32>> {
        for _ in 0..hops {
            match self.next_cluster(clust)? {
                Some(next) => clust = next,
                None if grow => clust = self.alloc_cluster(Some(clust), false)?,
                None => return Ok(None),
            }
        }
        Ok(Some(clust))
    }

    fn read_file(&mut self, opened: &OpenedFat, pos: u64, buf: &mut [u8]) -> KResult<usize> {
        let size = u64::from(opened.size);
        if pos >= size || opened.sclust < 2 {
            return Ok(0);
        }
        let n = ((size - pos) as usize).min(buf.len());
        let cb = u64::from(self.cluster_bytes());

        let mut done = 0usize;
        while done < n {
            let off = pos + done as u64;
            let Some(clust) = self.chain_skip(opened.sclust, (off / cb) as u32, false)? else {
                break;
            };
            let within = (off % cb) as usize;
            let chunk = (cb as usize - within).min(n - done);
            let byte = self.clust_to_sector(clust) * u64::from(self.ssize) + within as u64;
            self.vfs.lseek(self.src_fd, byte as i64, Whence::Set)?;
            read_exact(&self.vfs, self.src_fd, &mut buf[done..done + chunk])?;
            done += chunk;
        }
        Ok(done)
    }

    fn write_file(&mut self, opened: &mut OpenedFat, pos: u64, buf: &[u8]) -> KResult<usize> {
        self.check_writable()?;
        if buf.is_empty() {
            return Ok(0);
        }
        let cb = u64::from(self.cluster_bytes());
        if opened.sclust < 2 {
            opened.sclust = self.alloc_cluster(None, false)?;
        }

        let mut done = 0usize;
        while done < buf.len() {
            let off = pos + done as u64;
            let clust = self
                .chain_skip(opened.sclust, (off / cb) as u32, true)?
                .ok_or(Errno::Io)?;
            let within = (off % cb) as usize;
            let chunk = (cb as usize - within).min(buf.len() - done);
            // Data bypasses the window; flush it so FAT/dir state hits the
            // disk in order.
            self.sync_window()?;
            let byte = self.clust_to_sector(clust) * u64::from(self.ssize) + within as u64;
            self.vfs.lseek(self.src_fd, byte as i64, Whence::Set)?;
            write_all(&self.vfs, self.src_fd, &buf[done..done + chunk])?;
            done += chunk;
        }

        let end = pos + buf.len() as u64;
        if end > u64::from(opened.size) {
            opened.size = end as u32;
        }
        self.update_entry(opened)?;
        Ok(buf.len())
    }

    /// Push an opened file's size and first cluster into its directory
    /// entry.
    fn update_entry(&mut self, opened: &OpenedFat) -> KResult<()> {
        let mut entry = self.read_raw_entry(opened.loc)?;
        entry.file_size.set(opened.size);
        entry.set_first_cluster(opened.sclust);
        entry.attr |= ATTR_ARCHIVE;
        let (date, time) = self.fat_datetime();
        entry.wrt_date.set(date);
        entry.wrt_time.set(time);
        let loc = opened.loc;
        self.write_raw_entry(loc, entry.as_bytes())
    }

    /// Encode the kernel uptime as a FAT date/time pair (epoch 1980).
    fn fat_datetime(&self) -> (u16, u16) {
        let secs = self.clock.seconds();
        let days = secs / 86400;
        let day_secs = secs % 86400;
        let year = (days / 336).min(127) as u16;
        let month = ((days / 28) % 12 + 1) as u16;
        let day = (days % 28 + 1) as u16;
        let date = (year << 9) | (month << 5) | day;
        let time = ((day_secs / 3600) as u16) << 11
            | (((day_secs / 60) % 60) as u16) << 5
            | ((day_secs % 60) / 2) as u16;
        (date, time)
    }

    fn entry_stat(&self, entry: &DirEntryRaw) -> Stat {
        let mut st = Stat::of_kind(if entry.is_dir() {
            FileType::Directory
        } else {
            FileType::Regular
        });
        st.size = u64::from(entry.file_size.get());
        st.mode = if entry.attr & layout::ATTR_READ_ONLY != 0 {
            0o444
        } else {
            0o666
        };
        st
    }

    fn sync_all(&mut self) -> KResult<()> {
        self.sync_window()?;
        self.vfs.flush(self.src_fd)
    }
}

#[derive(Debug, Clone)]
struct ScannedEntry {
    name: String,
    entry: DirEntryRaw,
    loc: DirLoc,
    first_idx: u32,
    idx: u32,
}

fn names_equal(a: &str, b: &str) -> bool {
    a.len() == b.len()
        && a.chars()
            .zip(b.chars())
            .all(|(x, y)| x.eq_ignore_ascii_case(&y))
}

/// Render an 8.3 name as `NAME.EXT`.
fn format_sfn(name: &[u8; 11]) -> String {
    let base: Vec<u8> = name[..8]
        .iter()
        .copied()
        .take_while(|&c| c != b' ')
        .collect();
    let ext: Vec<u8> = name[8..]
        .iter()
        .copied()
        .take_while(|&c| c != b' ')
        .collect();
    let mut out = String::from_utf8_lossy(&base).into_owned();
    if !ext.is_empty() {
        out.push('.');
        out.push_str(&String::from_utf8_lossy(&ext));
    }
    out
}

/// Build an 8.3 alias for `name`, adding a `~n` tail on loss or collision.
fn make_sfn(name: &str, existing: &[ScannedEntry]) -> KResult<([u8; 11], bool)> {
    let (base_str, ext_str) = match name.rfind('.') {
        Some(dot) if dot > 0 => (&name[..dot], &name[dot + 1..]),
        _ => (name, ""),
    };

    fn encode(src: &str, max: usize) -> (Vec<u8>, bool) {
        let mut out = Vec::new();
        let mut lossy = false;
        for ch in src.chars() {
            if out.len() >= max {
                lossy = true;
                break;
            }
            let b = if ch.is_ascii() {
                codepage::to_upper(ch as u8)
            } else {
                lossy = true;
                b'_'
            };
            if b == b' ' || b == b'.' {
                lossy = true;
                continue;
            }
            let legal =
                b.is_ascii_alphanumeric() || b >= 0x80 || b"$%'-_@~`!(){}^#&".contains(&b);
            out.push(if legal {
                b
            } else {
                lossy = true;
                b'_'
            });
        }
        (out, lossy)
    }

    let (base, base_lossy) = encode(base_str, 8);
    let (ext, ext_lossy) = encode(ext_str, 3);
    if base.is_empty() {
        return Err(Errno::Inval);
    }
    let lossy = base_lossy || ext_lossy;

    let mut sfn = [b' '; 11];
    sfn[..base.len()].copy_from_slice(&base);
    sfn[8..8 + ext.len()].copy_from_slice(&ext);

    let collides = |sfn: &[u8; 11]| existing.iter().any(|e| e.entry.name == *sfn);
    if !lossy && !collides(&sfn) {
        return Ok((sfn, false));
    }

    for n in 1..100u32 {
        let tail = format!("~{n}");
        let keep = (8 - tail.len()).min(base.len());
        let mut candidate = [b' '; 11];
        candidate[..keep].copy_from_slice(&base[..keep]);
        candidate[keep..keep + tail.len()].copy_from_slice(tail.as_bytes());
        candidate[8..8 + ext.len()].copy_from_slice(&ext);
        if !collides(&candidate) {
            return Ok((candidate, true));
        }
    }
    Err(Errno::Exist)
}

fn read_exact(vfs: &Arc<Vfs>, fd: Fd, buf: &mut [u8]) -> KResult<()> {
    let mut done = 0;
    while done < buf.len() {
        let n = vfs.read(fd, &mut buf[done..])?;
        if n == 0 {
            return Err(Errno::Io);
        }
        done += n;
    }
    Ok(())
}

fn write_all(vfs: &Arc<Vfs>, fd: Fd, buf: &[u8]) -> KResult<()> {
    let mut done = 0;
    while done < buf.len() {
        let n = vfs.write(fd, &buf[done..])?;
        if n == 0 {
            return Err(Errno::Io);
        }
        done += n;
    }
    Ok(())
}

impl FileSystem for FatFs {
    fn release(&self) -> KResult<()> {
        let mut vol = self.state.force_lock();
        if !vol.opened.is_empty() {
            return Err(Errno::Busy);
        }
        vol.sync_all()?;
        let (vfs, fd) = (vol.vfs.clone(), vol.src_fd);
        drop(vol);
        vfs.close(fd)
    }

    fn open(&self, p: &str, flags: OpenFlags) -> KResult<FileHandle> {
        let mut vol = self.state.force_lock();
        if path::components(p).next().is_none() {
            return Err(Errno::IsDir);
        }
        let (dir, name) = vol.resolve_parent(p)?;

        let opened = match vol.dir_find(dir, name)? {
            Some(found) if found.entry.is_dir() => return Err(Errno::IsDir),
            Some(found) => {
                if path::wants_directory(p) {
                    return Err(Errno::NotDir);
                }
                let mut opened = OpenedFat {
                    loc: found.loc,
                    sclust: found.entry.first_cluster(),
                    size: found.entry.file_size.get(),
                    flags,
                };
                if flags.contains(OpenFlags::TRUNC) {
                    vol.check_writable()?;
                    if opened.sclust >= 2 {
                        let sclust = opened.sclust;
                        vol.free_chain(sclust)?;
                    }
                    opened.sclust = 0;
                    opened.size = 0;
                    vol.update_entry(&opened)?;
                }
                opened
            }
            None if flags.contains(OpenFlags::CREATE) => {
                vol.check_writable()?;
                if path::wants_directory(p) {
                    return Err(Errno::NotDir);
                }
                let loc = vol.dir_register(dir, name, ATTR_ARCHIVE, 0, 0)?;
                OpenedFat {
                    loc,
                    sclust: 0,
                    size: 0,
                    flags,
                }
            }
            None => return Err(Errno::NoEnt),
        };

        let fh = vol.next_fh;
        vol.next_fh += 1;
        vol.opened.insert(fh, opened);
        Ok(FileHandle(fh))
    }

    fn close(&self, fh: FileHandle, force: bool) -> KResult<()> {
        let mut vol = self.state.force_lock();
        let opened = vol.opened.remove(&fh.0).ok_or(Errno::BadF)?;
        if force {
            // Teardown path: drop the handle without touching the device.
            return Ok(());
        }
        if opened.flags.writable() && !vol.read_only {
            vol.update_entry(&opened)?;
        }
        vol.sync_window()
    }

    fn read(&self, fh: FileHandle, buf: &mut [u8], pos: u64) -> KResult<usize> {
        let mut vol = self.state.force_lock();
        let opened = vol.opened.get(&fh.0).ok_or(Errno::BadF)?.clone();
        vol.read_file(&opened, pos, buf)
    }

    fn write(&self, fh: FileHandle, buf: &[u8], pos: u64) -> KResult<usize> {
        let mut vol = self.state.force_lock();
        let mut opened = vol.opened.get(&fh.0).ok_or(Errno::BadF)?.clone();
        let n = vol.write_file(&mut opened, pos, buf)?;
        vol.opened.insert(fh.0, opened);
        Ok(n)
    }

    fn flush(&self, fh: FileHandle) -> KResult<()> {
        let mut vol = self.state.force_lock();
        let opened = vol.opened.get(&fh.0).ok_or(Errno::BadF)?.clone();
        if opened.flags.writable() && !vol.read_only {
            vol.update_entry(&opened)?;
        }
        vol.sync_all()
    }

    fn fstat(&self, fh: FileHandle) -> KResult<Stat> {
        let vol = self.state.force_lock();
        let opened = vol.opened.get(&fh.0).ok_or(Errno::BadF)?;
        let mut st = Stat::of_kind(FileType::Regular);
        st.size = u64::from(opened.size);
        st.mode = 0o666;
        Ok(st)
    }

    fn mkdir(&self, p: &str, _mode: u32) -> KResult<()> {
        let mut vol = self.state.force_lock();
        vol.check_writable()?;
        let (dir, name) = vol.resolve_parent(p)?;
        if vol.dir_find(dir, name)?.is_some() {
            return Err(Errno::Exist);
        }

        let clust = vol.alloc_cluster(None, true)?;
        // "." and ".." entries open every FAT directory.
        let mut dot = DirEntryRaw::new_zeroed();
        dot.name = *b".          ";
        dot.attr = ATTR_DIRECTORY;
        dot.set_first_cluster(clust);
        let mut dotdot = DirEntryRaw::new_zeroed();
        dotdot.name = *b"..         ";
        dotdot.attr = ATTR_DIRECTORY;
        let parent_clust = match dir {
            DirRef::Root => 0,
            DirRef::Cluster(c) if vol.fat_type == FatType::Fat32 && c == vol.root_clus => 0,
            DirRef::Cluster(c) => c,
        };
        dotdot.set_first_cluster(parent_clust);

        let base = vol.clust_to_sector(clust);
        vol.move_window(base)?;
        vol.window[..DIR_ENTRY_SIZE].copy_from_slice(dot.as_bytes());
        vol.window[DIR_ENTRY_SIZE..2 * DIR_ENTRY_SIZE].copy_from_slice(dotdot.as_bytes());
        vol.wflag = true;

        vol.dir_register(dir, name, ATTR_DIRECTORY, clust, 0)?;
        vol.sync_window()
    }

    fn opendir(&self, p: &str) -> KResult<Box<dyn DirStream>> {
        let mut vol = self.state.force_lock();
        let dir = vol.resolve_dir(p)?;
        let entries = vol
            .scan_dir(dir)?
            .into_iter()
            .filter(|e| {
                e.entry.attr & ATTR_VOLUME_ID == 0 && e.name != "." && e.name != ".."
            })
            .map(|e| DirEntry {
                name: e.name,
                file_type: if e.entry.is_dir() {
                    FileType::Directory
                } else {
                    FileType::Regular
                },
                size: u64::from(e.entry.file_size.get()),
            })
            .collect();
        Ok(Box::new(FatDirStream { entries, cursor: 0 }))
    }

    fn remove(&self, p: &str) -> KResult<()> {
        let mut vol = self.state.force_lock();
        vol.check_writable()?;
        let (dir, name) = vol.resolve_parent(p)?;
        let found = vol.dir_find(dir, name)?.ok_or(Errno::NoEnt)?;

        if found.entry.is_dir() {
            let child = vol.child_dir_ref(found.entry.first_cluster());
            if vol.dir_has_entries(child)? {
                return Err(Errno::NotEmpty);
            }
        } else if path::wants_directory(p) {
            return Err(Errno::NotDir);
        }

        let first = found.entry.first_cluster();
        if first >= 2 {
            vol.free_chain(first)?;
        }
        vol.dir_unregister(dir, &found)?;
        vol.sync_window()
    }

    fn rename(&self, old_path: &str, new_path: &str) -> KResult<()> {
        let mut vol = self.state.force_lock();
        vol.check_writable()?;
        let (old_dir, old_name) = vol.resolve_parent(old_path)?;
        let found = vol.dir_find(old_dir, old_name)?.ok_or(Errno::NoEnt)?;
        let (new_dir, new_name) = vol.resolve_parent(new_path)?;
        if vol.dir_find(new_dir, new_name)?.is_some() {
            return Err(Errno::Exist);
        }

        vol.dir_register(
            new_dir,
            new_name,
            found.entry.attr,
            found.entry.first_cluster(),
            found.entry.file_size.get(),
        )?;
        // Re-locate the old entry: registering may have moved the window
        // or grown the directory, but entry indices are stable.
        let stale = vol.dir_find(old_dir, old_name)?.ok_or(Errno::Io)?;
        vol.dir_unregister(old_dir, &stale)?;

        if found.entry.is_dir() && old_dir != new_dir {
            // Point the moved directory's ".." at its new parent.
            let child_clust = found.entry.first_cluster();
            let parent_clust = match new_dir {
                DirRef::Root => 0,
                DirRef::Cluster(c) if vol.fat_type == FatType::Fat32 && c == vol.root_clus => 0,
                DirRef::Cluster(c) => c,
            };
            if child_clust >= 2 {
                let sector = vol.clust_to_sector(child_clust);
                vol.move_window(sector)?;
                let mut dotdot = DirEntryRaw::read_from_bytes(
                    &vol.window[DIR_ENTRY_SIZE..2 * DIR_ENTRY_SIZE],
                )
                .map_err(|_| Errno::Io)?;
                if &dotdot.name[..2] == b".." {
                    dotdot.set_first_cluster(parent_clust);
                    vol.window[DIR_ENTRY_SIZE..2 * DIR_ENTRY_SIZE]
                        .copy_from_slice(dotdot.as_bytes());
                    vol.wflag = true;
                }
            }
        }
        vol.sync_window()
    }

    fn chmod(&self, p: &str, mode: u32) -> KResult<()> {
        let mut vol = self.state.force_lock();
        vol.check_writable()?;
        let (dir, name) = vol.resolve_parent(p)?;
        let found = vol.dir_find(dir, name)?.ok_or(Errno::NoEnt)?;
        let mut entry = found.entry.clone();
        // Only the read-only attribute maps onto FAT.
        if mode & 0o200 == 0 {
            entry.attr |= layout::ATTR_READ_ONLY;
        } else {
            entry.attr &= !layout::ATTR_READ_ONLY;
        }
        vol.write_raw_entry(found.loc, entry.as_bytes())?;
        vol.sync_window()
    }

    fn stat(&self, p: &str) -> KResult<Stat> {
        let mut vol = self.state.force_lock();
        if path::components(p).next().is_none() {
            let mut st = Stat::of_kind(FileType::Directory);
            st.mode = 0o777;
            return Ok(st);
        }
        let (dir, name) = vol.resolve_parent(p)?;
        let found = vol.dir_find(dir, name)?.ok_or(Errno::NoEnt)?;
        if path::wants_directory(p) && !found.entry.is_dir() {
            return Err(Errno::NotDir);
        }
        Ok(vol.entry_stat(&found.entry))
    }

    fn statfs(&self) -> KResult<StatFs> {
        let mut vol = self.state.force_lock();
        let mut free = 0u64;
        for clust in 2..vol.max_clust {
            if vol.get_fat(clust)? == 0 {
                free += 1;
            }
        }
        Ok(StatFs {
            bsize: vol.cluster_bytes(),
            blocks: u64::from(vol.max_clust - 2),
            bfree: free,
            files: 0,
            ffree: 0,
            fsname: "fatfs",
        })
    }

    fn sync(&self) -> KResult<()> {
        let mut vol = self.state.force_lock();
        vol.sync_all()
    }
}

struct FatDirStream {
    entries: Vec<DirEntry>,
    cursor: usize,
}

impl DirStream for FatDirStream {
    fn next_entry(&mut self) -> KResult<Option<DirEntry>> {
        let entry = self.entries.get(self.cursor).cloned();
        if entry.is_some() {
            self.cursor += 1;
        }
        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sfn_formatting_round_trips() {
        assert_eq!(format_sfn(b"FOO     TXT"), "FOO.TXT");
        assert_eq!(format_sfn(b"NOEXT      "), "NOEXT");
    }

    #[test]
    fn sfn_generation_uppercases_and_tags_lossy_names() {
        let (sfn, lossy) = make_sfn("readme.txt", &[]).unwrap();
        assert_eq!(&sfn, b"README  TXT");
        assert!(!lossy);

        let (sfn, lossy) = make_sfn("a long file name.text", &[]).unwrap();
        assert!(lossy);
        assert_eq!(&sfn[8..], b"TEX");
        assert!(sfn[..8].iter().any(|&c| c == b'~'));
    }

    #[test]
    fn lossless_short_names_need_no_lfn() {
        let (sfn, lossy) = make_sfn("UPPER.TXT", &[]).unwrap();
        assert!(!lossy);
        assert_eq!(format_sfn(&sfn), "UPPER.TXT");
    }
}
