//! `devfs`: device drivers and pipes in a flat namespace.
//!
//! Every entry is either a driver link (a [`Driver`] vtable plus handle) or
//! a pipe. Directories cannot be created (`EPERM`). The opened-file count is
//! maintained under the devfs mutex and gates whether the instance may be
//! released.

use std::collections::HashMap;
use std::sync::Arc;

use log::debug;

use crate::errno::{Errno, KResult};
use crate::fs::{
    DirEntry, DirStream, Driver, FileHandle, FileSystem, FileType, FsContext, OpenFlags, Stat,
    StatFs,
};
use crate::pipe::Pipe;
use crate::sync::{KClock, KMutex};
use crate::vfs::path;

/// Lock probe timeout on the instance mutex during release.
const RELEASE_TIMEOUT_MS: u32 = 100;

/// Backend constructor registered under the name `"devfs"`.
pub fn init(ctx: &FsContext) -> KResult<Box<dyn FileSystem>> {
    Ok(Box::new(Devfs::new(ctx.clock, ctx.pipe_capacity)))
}

#[derive(Debug, Clone)]
enum DevNode {
    Driver(Arc<dyn Driver>),
    Pipe(Pipe),
}

#[derive(Debug)]
struct Entry {
    name: String,
    node: DevNode,
    mode: u32,
    uid: u32,
    gid: u32,
    ctime: u64,
}

#[derive(Debug)]
struct DevfsState {
    entries: Vec<Entry>,
    opened: HashMap<u64, OpenedDev>,
    next_fh: u64,
    opened_count: u32,
}

#[derive(Debug, Clone)]
struct OpenedDev {
    node: DevNode,
    flags: OpenFlags,
}

/// The device file system.
#[derive(Debug)]
pub struct Devfs {
    state: KMutex<DevfsState>,
    clock: KClock,
    pipe_capacity: usize,
}

impl Devfs {
    /// Create an empty device namespace.
    pub fn new(clock: KClock, pipe_capacity: usize) -> Self {
        Devfs {
            state: KMutex::new(DevfsState {
                entries: Vec::new(),
                opened: HashMap::new(),
                next_fh: 1,
                opened_count: 0,
            }),
            clock,
            pipe_capacity,
        }
    }
}

/// A devfs path is `/` or a single `/name` component.
fn entry_name(p: &str) -> KResult<&str> {
    let trimmed = p.trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(Errno::IsDir);
    }
    let name = trimmed.strip_prefix('/').ok_or(Errno::Inval)?;
    if name.contains('/') {
        return Err(Errno::NoEnt);
    }
    if name.len() > path::MAX_COMPONENT_LEN {
        return Err(Errno::NameTooLong);
    }
    // "/name/" requires a directory, and devfs has none below the root.
    if p.ends_with('/') {
        return Err(Errno::NotDir);
    }
    Ok(name)
}

impl DevfsState {
    fn find(&self, name: &str) -> KResult<&Entry> {
        self.entries
            .iter()
            .find(|e| e.name == name)
            .ok_or(Errno::NoEnt)
    }

    fn find_mut(&mut self, name: &str) -> KResult<&mut Entry> {
        self.entries
            .iter_mut()
            .find(|e| e.name == name)
            .ok_or(Errno::NoEnt)
    }

    fn insert(&mut self, name: &str, node: DevNode, now: u64) -> KResult<()> {
        if self.entries.iter().any(|e| e.name == name) {
            return Err(Errno::Exist);
        }
        self.entries.push(Entry {
            name: name.to_string(),
            node,
            mode: 0o666,
            uid: 0,
            gid: 0,
            ctime: now,
        });
        Ok(())
    }
}

fn stat_of(node: &DevNode, mode: u32, uid: u32, gid: u32, ctime: u64) -> KResult<Stat> {
    let mut st = match node {
        DevNode::Driver(driver) => {
            let ds = driver.stat()?;
            let mut st = Stat::of_kind(FileType::Device);
            st.size = ds.size;
            st.dev = u32::from(ds.major) << 8 | u32::from(ds.minor);
            st
        }
        DevNode::Pipe(pipe) => {
            let mut st = Stat::of_kind(FileType::Pipe);
            st.size = pipe.len() as u64;
            st
        }
    };
    st.mode = mode;
    st.uid = uid;
    st.gid = gid;
    st.ctime = ctime;
    st.mtime = ctime;
    Ok(st)
}

impl FileSystem for Devfs {
    fn release(&self) -> KResult<()> {
        let state = self.state.lock(RELEASE_TIMEOUT_MS)?;
        if state.opened_count != 0 {
            return Err(Errno::Busy);
        }
        for entry in &state.entries {
            if let DevNode::Pipe(pipe) = &entry.node {
                pipe.close();
            }
        }
        Ok(())
    }

    fn open(&self, p: &str, flags: OpenFlags) -> KResult<FileHandle> {
        let name = entry_name(p)?;
        let mut state = self.state.force_lock();
        let node = state.find(name)?.node.clone();
        if let DevNode::Driver(driver) = &node {
            driver.open(flags)?;
        }
        state.opened_count += 1;
        let fh = state.next_fh;
        state.next_fh += 1;
        state.opened.insert(fh, OpenedDev { node, flags });
        debug!("devfs: open {name:?} -> fh {fh}");
        Ok(FileHandle(fh))
    }

    fn close(&self, fh: FileHandle, force: bool) -> KResult<()> {
        let opened = {
            let mut state = self.state.force_lock();
            state.opened.remove(&fh.0).ok_or(Errno::BadF)?
        };
        let result = match &opened.node {
            DevNode::Driver(driver) => driver.close(force),
            DevNode::Pipe(pipe) => {
                // Closing the writing side ends the stream: readers drain
                // what is buffered and then observe EOF.
                if opened.flags.writable() || force {
                    pipe.close();
                }
                Ok(())
            }
        };
        let mut state = self.state.force_lock();
        state.opened_count -= 1;
        result
    }

    fn read(&self, fh: FileHandle, buf: &mut [u8], pos: u64) -> KResult<usize> {
        let opened = {
            let state = self.state.force_lock();
            state.opened.get(&fh.0).ok_or(Errno::BadF)?.clone()
        };
        // Queue and driver I/O run without the devfs mutex; both may block.
        match &opened.node {
            DevNode::Driver(driver) => driver.read(buf, pos),
            DevNode::Pipe(pipe) => {
                if opened.flags.contains(OpenFlags::NONBLOCK) {
                    pipe.read_nonblocking(buf)
                } else {
                    pipe.read(buf)
                }
            }
        }
    }

    fn write(&self, fh: FileHandle, buf: &[u8], pos: u64) -> KResult<usize> {
        let opened = {
            let state = self.state.force_lock();
            state.opened.get(&fh.0).ok_or(Errno::BadF)?.clone()
        };
        match &opened.node {
            DevNode::Driver(driver) => driver.write(buf, pos),
            DevNode::Pipe(pipe) => {
                if opened.flags.contains(OpenFlags::NONBLOCK) {
                    pipe.write_nonblocking(buf)
                } else {
                    pipe.write(buf)
                }
            }
        }
    }

    fn ioctl(&self, fh: FileHandle, cmd: u32, arg: &mut [u8]) -> KResult<i32> {
        let opened = {
            let state = self.state.force_lock();
            state.opened.get(&fh.0).ok_or(Errno::BadF)?.clone()
        };
        match &opened.node {
            DevNode::Driver(driver) => driver.ioctl(cmd, arg),
            DevNode::Pipe(_) => Err(Errno::NotSup),
        }
    }

    fn flush(&self, fh: FileHandle) -> KResult<()> {
        let opened = {
            let state = self.state.force_lock();
            state.opened.get(&fh.0).ok_or(Errno::BadF)?.clone()
        };
        match &opened.node {
            DevNode::Driver(driver) => driver.flush(),
            DevNode::Pipe(_) => Ok(()),
        }
    }

    fn fstat(&self, fh: FileHandle) -> KResult<Stat> {
        let state = self.state.force_lock();
        let opened = state.opened.get(&fh.0).ok_or(Errno::BadF)?;
        stat_of(&opened.node, 0o666, 0, 0, 0)
    }

    fn mkdir(&self, _path: &str, _mode: u32) -> KResult<()> {
        Err(Errno::Perm)
    }

    fn mknod(&self, p: &str, driver: Arc<dyn Driver>) -> KResult<()> {
        let name = entry_name(p)?;
        let mut state = self.state.force_lock();
        state.insert(name, DevNode::Driver(driver), self.clock.seconds())
    }

    fn mkfifo(&self, p: &str) -> KResult<()> {
        let name = entry_name(p)?;
        let mut state = self.state.force_lock();
        state.insert(
            name,
            DevNode::Pipe(Pipe::new(self.pipe_capacity)),
            self.clock.seconds(),
        )
    }

    fn opendir(&self, p: &str) -> KResult<Box<dyn DirStream>> {
        if !p.trim_end_matches('/').is_empty() {
            // Only the root exists; anything else is a leaf or missing.
            let name = p.trim_end_matches('/').trim_start_matches('/');
            let state = self.state.force_lock();
            return match state.find(name) {
                Ok(_) => Err(Errno::NotDir),
                Err(err) => Err(err),
            };
        }
        let state = self.state.force_lock();
        let entries = state
            .entries
            .iter()
            .map(|e| {
                let (file_type, size) = match &e.node {
                    DevNode::Driver(driver) => (
                        FileType::Device,
                        driver.stat().map(|ds| ds.size).unwrap_or(0),
                    ),
                    DevNode::Pipe(pipe) => (FileType::Pipe, pipe.len() as u64),
                };
                DirEntry {
                    name: e.name.clone(),
                    file_type,
                    size,
                }
            })
            .collect();
        Ok(Box::new(DevDirStream { entries, cursor: 0 }))
    }

    fn remove(&self, p: &str) -> KResult<()> {
        let name = entry_name(p)?;
        let mut state = self.state.force_lock();
        let idx = state
            .entries
            .iter()
            .position(|e| e.name == name)
            .ok_or(Errno::NoEnt)?;
        let entry = state.entries.remove(idx);
        if let DevNode::Pipe(pipe) = entry.node {
            pipe.close();
        }
        Ok(())
    }

    fn chmod(&self, p: &str, mode: u32) -> KResult<()> {
        let name = entry_name(p)?;
        let mut state = self.state.force_lock();
        state.find_mut(name)?.mode = mode & 0o7777;
        Ok(())
    }

    fn chown(&self, p: &str, uid: u32, gid: u32) -> KResult<()> {
        let name = entry_name(p)?;
        let mut state = self.state.force_lock();
        let entry = state.find_mut(name)?;
        entry.uid = uid;
        entry.gid = gid;
        Ok(())
    }

    fn stat(&self, p: &str) -> KResult<Stat> {
        if p.trim_end_matches('/').is_empty() {
            let mut st = Stat::of_kind(FileType::Directory);
            st.mode = 0o755;
            return Ok(st);
        }
        let name = p.trim_end_matches('/').trim_start_matches('/');
        if p.ends_with('/') {
            // Every named entry is a leaf.
            let state = self.state.force_lock();
            return match state.find(name) {
                Ok(_) => Err(Errno::NotDir),
                Err(err) => Err(err),
            };
        }
        let state = self.state.force_lock();
        let entry = state.find(name)?;
        stat_of(&entry.node, entry.mode, entry.uid, entry.gid, entry.ctime)
    }

    fn statfs(&self) -> KResult<StatFs> {
        let state = self.state.force_lock();
        Ok(StatFs {
            bsize: 1,
            blocks: 0,
            bfree: 0,
            files: state.entries.len() as u64,
            ffree: 0,
            fsname: "devfs",
        })
    }
}

struct DevDirStream {
    entries: Vec<DirEntry>,
    cursor: usize,
}

impl DirStream for DevDirStream {
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
    use crate::fs::lfs::NullDevice;
    use std::thread;

    fn fresh() -> Devfs {
        Devfs::new(KClock::start(), 16)
    }

    #[test]
    fn null_device_round_trip() {
        let fs = fresh();
        fs.mknod("/null", Arc::new(NullDevice)).unwrap();
        let fh = fs
            .open("/null", OpenFlags::READ | OpenFlags::WRITE)
            .unwrap();
        assert_eq!(fs.write(fh, b"x", 0).unwrap(), 1);
        let mut buf = [0u8; 1];
        assert_eq!(fs.read(fh, &mut buf, 0).unwrap(), 0);
        fs.close(fh, false).unwrap();
    }

    #[test]
    fn mkdir_is_not_permitted() {
        let fs = fresh();
        assert_eq!(fs.mkdir("/sub", 0o755).unwrap_err(), Errno::Perm);
    }

    #[test]
    fn release_refuses_while_files_open() {
        let fs = fresh();
        fs.mkfifo("/p").unwrap();
        let fh = fs.open("/p", OpenFlags::READ).unwrap();
        assert_eq!(fs.release().unwrap_err(), Errno::Busy);
        fs.close(fh, false).unwrap();
        fs.release().unwrap();
    }

    #[test]
    fn pipe_fstat_reports_queue_depth() {
        let fs = fresh();
        fs.mkfifo("/p").unwrap();
        let w = fs.open("/p", OpenFlags::WRITE).unwrap();
        fs.write(w, b"abc", 0).unwrap();
        assert_eq!(fs.fstat(w).unwrap().size, 3);
        assert_eq!(fs.stat("/p").unwrap().size, 3);
        fs.close(w, false).unwrap();
    }

    #[test]
    fn pipe_blocks_reader_until_writer_arrives() {
        let fs = Arc::new(fresh());
        fs.mkfifo("/p").unwrap();
        let r = fs.open("/p", OpenFlags::READ).unwrap();
        let reader_fs = fs.clone();
        let reader = thread::spawn(move || {
            let mut buf = [0u8; 5];
            let n = reader_fs.read(r, &mut buf, 0).unwrap();
            (n, buf)
        });
        let w = fs.open("/p", OpenFlags::WRITE).unwrap();
        fs.write(w, b"hello", 0).unwrap();
        let (n, buf) = reader.join().unwrap();
        assert_eq!(n, 5);
        assert_eq!(&buf, b"hello");
        fs.close(w, false).unwrap();
        fs.close(r, false).unwrap();
    }
}
