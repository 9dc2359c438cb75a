//! `lfs`: the RAM-resident little file system.
//!
//! An in-memory hierarchical store. Nodes are tagged as directory, regular
//! file, pipe or device link; directory nodes keep an ordered child list
//! with linear lookup. The whole tree sits behind one recursive mutex.
//!
//! Regular file bytes live in a growable buffer; writes past end extend it
//! and surface [`Errno::NoSpc`] when the allocator refuses or the mount's
//! `size=` cap would be exceeded. Removing a node that is still open
//! detaches it from its parent and frees it on the last close.

use std::collections::HashMap;
use std::sync::Arc;

use log::debug;

use crate::errno::{Errno, KResult};
use crate::fs::{
    DeviceStat, DirEntry, DirStream, Driver, FileHandle, FileSystem, FileType, FsContext,
    OpenFlags, Stat, StatFs,
};
use crate::pipe::Pipe;
use crate::sync::{KClock, KRecursiveMutex};
use crate::vfs::path;

const ROOT_NODE: usize = 0;

/// Backend constructor registered under the name `"lfs"`.
pub fn init(ctx: &FsContext) -> KResult<Box<dyn FileSystem>> {
    let mut fs = Lfs::new(ctx.clock, ctx.options.size_limit);
    fs.pipe_capacity = ctx.pipe_capacity;
    Ok(Box::new(fs))
}

#[derive(Debug)]
enum NodeKind {
    Dir { children: Vec<(String, usize)> },
    File { data: Vec<u8> },
    Pipe(Pipe),
    Device(Arc<dyn Driver>),
}

#[derive(Debug)]
struct Node {
    kind: NodeKind,
    mode: u32,
    uid: u32,
    gid: u32,
    ctime: u64,
    mtime: u64,
    open_count: u32,
    detached: bool,
}

impl Node {
    fn new(kind: NodeKind, mode: u32, now: u64) -> Self {
        Node {
            kind,
            mode,
            uid: 0,
            gid: 0,
            ctime: now,
            mtime: now,
            open_count: 0,
            detached: false,
        }
    }

    fn file_type(&self) -> FileType {
        match self.kind {
            NodeKind::Dir { .. } => FileType::Directory,
            NodeKind::File { .. } => FileType::Regular,
            NodeKind::Pipe(_) => FileType::Pipe,
            NodeKind::Device(_) => FileType::Device,
        }
    }
}

#[derive(Debug, Clone)]
struct OpenedFile {
    node: usize,
    flags: OpenFlags,
}

#[derive(Debug)]
struct LfsState {
    nodes: Vec<Option<Node>>,
    opened: HashMap<u64, OpenedFile>,
    next_fh: u64,
    used_bytes: u64,
}

/// The RAM tree file system.
#[derive(Debug)]
pub struct Lfs {
    state: KRecursiveMutex<LfsState>,
    clock: KClock,
    size_limit: Option<u64>,
    pipe_capacity: usize,
}

impl Lfs {
    /// Create an empty tree rooted at `/`.
    pub fn new(clock: KClock, size_limit: Option<u64>) -> Self {
        let root = Node::new(NodeKind::Dir { children: Vec::new() }, 0o777, clock.seconds());
        Lfs {
            state: KRecursiveMutex::new(LfsState {
                nodes: vec![Some(root)],
                opened: HashMap::new(),
                next_fh: 1,
                used_bytes: 0,
            }),
            clock,
            size_limit,
            pipe_capacity: crate::pipe::DEFAULT_PIPE_CAPACITY,
        }
    }
}

impl LfsState {
    fn node(&self, id: usize) -> KResult<&Node> {
        self.nodes.get(id).and_then(Option::as_ref).ok_or(Errno::NoEnt)
    }

    fn node_mut(&mut self, id: usize) -> KResult<&mut Node> {
        self.nodes
            .get_mut(id)
            .and_then(Option::as_mut)
            .ok_or(Errno::NoEnt)
    }

    /// Walk `path` from the root; components resolve through ordered child
    /// lists with linear search.
    fn lookup(&self, path: &str) -> KResult<usize> {
        let mut current = ROOT_NODE;
        for component in path::components(path) {
            let node = self.node(current)?;
            match &node.kind {
                NodeKind::Dir { children } => {
                    current = children
                        .iter()
                        .find(|(name, _)| name == component)
                        .map(|(_, id)| *id)
                        .ok_or(Errno::NoEnt)?;
                }
                _ => return Err(Errno::NotDir),
            }
        }
        if path::wants_directory(path) && !matches!(self.node(current)?.kind, NodeKind::Dir { .. })
        {
            return Err(Errno::NotDir);
        }
        Ok(current)
    }

    /// Resolve the parent directory of `path` and the final component name.
    fn lookup_parent<'p>(&self, path: &'p str) -> KResult<(usize, &'p str)> {
        let (dir, name) = path::split_last(path).ok_or(Errno::Inval)?;
        let parent = self.lookup(dir)?;
        if !matches!(self.node(parent)?.kind, NodeKind::Dir { .. }) {
            return Err(Errno::NotDir);
        }
        Ok((parent, name))
    }

    fn insert_child(&mut self, parent: usize, name: &str, node: Node) -> KResult<usize> {
        if name.len() > path::MAX_COMPONENT_LEN {
            return Err(Errno::NameTooLong);
        }
        let exists = match &self.node(parent)?.kind {
            NodeKind::Dir { children } => children.iter().any(|(n, _)| n == name),
            _ => return Err(Errno::NotDir),
        };
        if exists {
            return Err(Errno::Exist);
        }
        let id = match self.nodes.iter().position(Option::is_none) {
            Some(free) => {
                self.nodes[free] = Some(node);
                free
            }
            None => {
                self.nodes.push(Some(node));
                self.nodes.len() - 1
            }
        };
        if let NodeKind::Dir { children } = &mut self.node_mut(parent)?.kind {
            children.push((name.to_string(), id));
        }
        Ok(id)
    }

    fn free_node(&mut self, id: usize) {
        if let Some(node) = self.nodes[id].take() {
            match node.kind {
                NodeKind::File { data } => self.used_bytes -= data.len() as u64,
                NodeKind::Pipe(pipe) => pipe.close(),
                _ => {}
            }
        }
    }

    fn open_count(&self, id: usize) -> u32 {
        self.node(id).map(|n| n.open_count).unwrap_or(0)
    }
}

impl FileSystem for Lfs {
    fn open(&self, path: &str, flags: OpenFlags) -> KResult<FileHandle> {
        let guard = self.state.force_lock();
        let mut state = guard.borrow_mut();

        let node_id = match state.lookup(path) {
            Ok(id) => id,
            Err(Errno::NoEnt) if flags.contains(OpenFlags::CREATE) => {
                if path::wants_directory(path) {
                    return Err(Errno::NotDir);
                }
                let (parent, name) = state.lookup_parent(path)?;
                let node = Node::new(
                    NodeKind::File { data: Vec::new() },
                    0o666,
                    self.clock.seconds(),
                );
                state.insert_child(parent, name, node)?
            }
            Err(err) => return Err(err),
        };

        // Device opens run the driver hook while the tree lock is held;
        // drivers must not block in open.
        let now = self.clock.seconds();
        let mut released = 0u64;
        {
            let node = state.node_mut(node_id)?;
            match &mut node.kind {
                NodeKind::Dir { .. } => return Err(Errno::IsDir),
                NodeKind::File { data } => {
                    if flags.contains(OpenFlags::TRUNC) {
                        released = data.len() as u64;
                        data.clear();
                        data.shrink_to_fit();
                        node.mtime = now;
                    }
                }
                NodeKind::Pipe(_) => {}
                NodeKind::Device(driver) => {
                    let driver = driver.clone();
                    driver.open(flags)?;
                }
            }
        }
        state.used_bytes -= released;

        let node = state.node_mut(node_id)?;
        node.open_count += 1;
        let fh = state.next_fh;
        state.next_fh += 1;
        state.opened.insert(fh, OpenedFile { node: node_id, flags });
        debug!("lfs: open {path:?} -> fh {fh}");
        Ok(FileHandle(fh))
    }

    fn close(&self, fh: FileHandle, force: bool) -> KResult<()> {
        let guard = self.state.force_lock();
        let mut state = guard.borrow_mut();
        let opened = state.opened.remove(&fh.0).ok_or(Errno::BadF)?;

        match &state.node(opened.node)?.kind {
            NodeKind::Device(driver) => {
                let driver = driver.clone();
                driver.close(force)?;
            }
            NodeKind::Pipe(pipe) => {
                // Closing the writing side ends the stream for readers.
                if opened.flags.writable() || force {
                    pipe.close();
                }
            }
            _ => {}
        }

        let node = state.node_mut(opened.node)?;
        node.open_count -= 1;
        if node.open_count == 0 && node.detached {
            state.free_node(opened.node);
        }
        Ok(())
    }

    fn read(&self, fh: FileHandle, buf: &mut [u8], pos: u64) -> KResult<usize> {
        let (target, flags) = {
            let guard = self.state.force_lock();
            let state = guard.borrow_mut();
            let opened = state.opened.get(&fh.0).ok_or(Errno::BadF)?.clone();
            match &state.node(opened.node)?.kind {
                NodeKind::File { data } => {
                    let pos = pos.min(data.len() as u64) as usize;
                    let n = (data.len() - pos).min(buf.len());
                    buf[..n].copy_from_slice(&data[pos..pos + n]);
                    return Ok(n);
                }
                NodeKind::Pipe(pipe) => (Io::Pipe(pipe.clone()), opened.flags),
                NodeKind::Device(driver) => (Io::Device(driver.clone()), opened.flags),
                NodeKind::Dir { .. } => return Err(Errno::IsDir),
            }
        };
        // Pipe and driver reads may block; the tree lock is released first.
        match target {
            Io::Pipe(pipe) => {
                if flags.contains(OpenFlags::NONBLOCK) {
                    return pipe.read_nonblocking(buf);
                }
                pipe.read(buf)
            }
            Io::Device(driver) => driver.read(buf, pos),
        }
    }

    fn write(&self, fh: FileHandle, buf: &[u8], pos: u64) -> KResult<usize> {
        enum Written {
            Bytes(u64),
            Blocking(Io),
        }

        let (outcome, flags) = {
            let guard = self.state.force_lock();
            let mut state = guard.borrow_mut();
            let opened = state.opened.get(&fh.0).ok_or(Errno::BadF)?.clone();
            let now = self.clock.seconds();
            let limit = self.size_limit;
            let used = state.used_bytes;
            let outcome = {
                let node = state.node_mut(opened.node)?;
                match &mut node.kind {
                    NodeKind::File { data } => {
                        let end = pos as usize + buf.len();
                        let growth = end.saturating_sub(data.len()) as u64;
                        if let Some(limit) = limit {
                            if used + growth > limit {
                                return Err(Errno::NoSpc);
                            }
                        }
                        if growth > 0 {
                            data.try_reserve(growth as usize).map_err(|_| Errno::NoSpc)?;
                            data.resize(end, 0);
                        }
                        data[pos as usize..end].copy_from_slice(buf);
                        node.mtime = now;
                        Written::Bytes(growth)
                    }
                    NodeKind::Pipe(pipe) => Written::Blocking(Io::Pipe(pipe.clone())),
                    NodeKind::Device(driver) => Written::Blocking(Io::Device(driver.clone())),
                    NodeKind::Dir { .. } => return Err(Errno::IsDir),
                }
            };
            if let Written::Bytes(growth) = outcome {
                state.used_bytes += growth;
                return Ok(buf.len());
            }
            (outcome, opened.flags)
        };
        // Pipe and driver writes may block; the tree lock is released first.
        match outcome {
            Written::Blocking(Io::Pipe(pipe)) => {
                if flags.contains(OpenFlags::NONBLOCK) {
                    return pipe.write_nonblocking(buf);
                }
                pipe.write(buf)
            }
            Written::Blocking(Io::Device(driver)) => driver.write(buf, pos),
            Written::Bytes(_) => unreachable!(),
        }
    }

    fn ioctl(&self, fh: FileHandle, cmd: u32, arg: &mut [u8]) -> KResult<i32> {
        let driver = {
            let guard = self.state.force_lock();
            let state = guard.borrow_mut();
            let opened = state.opened.get(&fh.0).ok_or(Errno::BadF)?.clone();
            match &state.node(opened.node)?.kind {
                NodeKind::Device(driver) => driver.clone(),
                _ => return Err(Errno::NotSup),
            }
        };
        driver.ioctl(cmd, arg)
    }

    fn flush(&self, fh: FileHandle) -> KResult<()> {
        let driver = {
            let guard = self.state.force_lock();
            let state = guard.borrow_mut();
            let opened = state.opened.get(&fh.0).ok_or(Errno::BadF)?.clone();
            match &state.node(opened.node)?.kind {
                NodeKind::Device(driver) => driver.clone(),
                _ => return Ok(()),
            }
        };
        driver.flush()
    }

    fn fstat(&self, fh: FileHandle) -> KResult<Stat> {
        let guard = self.state.force_lock();
        let state = guard.borrow_mut();
        let opened = state.opened.get(&fh.0).ok_or(Errno::BadF)?;
        stat_node(state.node(opened.node)?)
    }

    fn mkdir(&self, path: &str, mode: u32) -> KResult<()> {
        let guard = self.state.force_lock();
        let mut state = guard.borrow_mut();
        let (parent, name) = state.lookup_parent(path)?;
        let node = Node::new(
            NodeKind::Dir { children: Vec::new() },
            mode & 0o7777,
            self.clock.seconds(),
        );
        state.insert_child(parent, name, node).map(|_| ())
    }

    fn mknod(&self, path: &str, driver: Arc<dyn Driver>) -> KResult<()> {
        let guard = self.state.force_lock();
        let mut state = guard.borrow_mut();
        let (parent, name) = state.lookup_parent(path)?;
        let node = Node::new(NodeKind::Device(driver), 0o666, self.clock.seconds());
        state.insert_child(parent, name, node).map(|_| ())
    }

    fn mkfifo(&self, path: &str) -> KResult<()> {
        let guard = self.state.force_lock();
        let mut state = guard.borrow_mut();
        let (parent, name) = state.lookup_parent(path)?;
        let node = Node::new(
            NodeKind::Pipe(Pipe::new(self.pipe_capacity)),
            0o666,
            self.clock.seconds(),
        );
        state.insert_child(parent, name, node).map(|_| ())
    }

    fn opendir(&self, path: &str) -> KResult<Box<dyn DirStream>> {
        let guard = self.state.force_lock();
        let state = guard.borrow_mut();
        let node_id = state.lookup(path)?;
        let entries = match &state.node(node_id)?.kind {
            NodeKind::Dir { children } => children
                .iter()
                .filter_map(|(name, id)| {
                    let child = state.node(*id).ok()?;
                    Some(DirEntry {
                        name: name.clone(),
                        file_type: child.file_type(),
                        size: node_size(child),
                    })
                })
                .collect(),
            _ => return Err(Errno::NotDir),
        };
        Ok(Box::new(LfsDirStream { entries, cursor: 0 }))
    }

    fn remove(&self, path: &str) -> KResult<()> {
        let guard = self.state.force_lock();
        let mut state = guard.borrow_mut();
        let target = state.lookup(path)?;
        if target == ROOT_NODE {
            return Err(Errno::Perm);
        }
        match &state.node(target)?.kind {
            NodeKind::Dir { children } => {
                if !children.is_empty() {
                    return Err(Errno::NotEmpty);
                }
            }
            _ if path::wants_directory(path) => return Err(Errno::NotDir),
            _ => {}
        }

        let (parent, name) = state.lookup_parent(path)?;
        if let NodeKind::Dir { children } = &mut state.node_mut(parent)?.kind {
            children.retain(|(n, _)| n != name);
        }
        if state.open_count(target) > 0 {
            state.node_mut(target)?.detached = true;
        } else {
            state.free_node(target);
        }
        Ok(())
    }

    fn rename(&self, old_path: &str, new_path: &str) -> KResult<()> {
        match (path::split_last(old_path), path::split_last(new_path)) {
            (Some(_), Some(_)) => {}
            _ => return Err(Errno::Inval),
        }
        if path::wants_directory(old_path) || path::wants_directory(new_path) {
            return Err(Errno::Inval);
        }

        let guard = self.state.force_lock();
        let mut state = guard.borrow_mut();
        let target = state.lookup(old_path)?;
        let (new_parent, new_name) = state.lookup_parent(new_path)?;
        if new_name.len() > path::MAX_COMPONENT_LEN {
            return Err(Errno::NameTooLong);
        }
        if state.lookup(new_path).is_ok() {
            return Err(Errno::Exist);
        }

        let (old_parent, old_name) = state.lookup_parent(old_path)?;
        if let NodeKind::Dir { children } = &mut state.node_mut(old_parent)?.kind {
            children.retain(|(n, _)| n != old_name);
        }
        if let NodeKind::Dir { children } = &mut state.node_mut(new_parent)?.kind {
            children.push((new_name.to_string(), target));
        }
        Ok(())
    }

    fn chmod(&self, path: &str, mode: u32) -> KResult<()> {
        let guard = self.state.force_lock();
        let mut state = guard.borrow_mut();
        let target = state.lookup(path)?;
        state.node_mut(target)?.mode = mode & 0o7777;
        Ok(())
    }

    fn chown(&self, path: &str, uid: u32, gid: u32) -> KResult<()> {
        let guard = self.state.force_lock();
        let mut state = guard.borrow_mut();
        let target = state.lookup(path)?;
        let node = state.node_mut(target)?;
        node.uid = uid;
        node.gid = gid;
        Ok(())
    }

    fn stat(&self, path: &str) -> KResult<Stat> {
        let guard = self.state.force_lock();
        let state = guard.borrow_mut();
        let target = state.lookup(path)?;
        stat_node(state.node(target)?)
    }

    fn statfs(&self) -> KResult<StatFs> {
        let guard = self.state.force_lock();
        let state = guard.borrow_mut();
        let files = state.nodes.iter().filter(|n| n.is_some()).count() as u64;
        Ok(StatFs {
            bsize: 1,
            blocks: self.size_limit.unwrap_or(state.used_bytes),
            bfree: self
                .size_limit
                .map(|limit| limit.saturating_sub(state.used_bytes))
                .unwrap_or(0),
            files,
            ffree: 0,
            fsname: "lfs",
        })
    }
}

enum Io {
    Pipe(Pipe),
    Device(Arc<dyn Driver>),
}

fn node_size(node: &Node) -> u64 {
    match &node.kind {
        NodeKind::File { data } => data.len() as u64,
        NodeKind::Pipe(pipe) => pipe.len() as u64,
        _ => 0,
    }
}

fn stat_node(node: &Node) -> KResult<Stat> {
    let dev = match &node.kind {
        NodeKind::Device(driver) => {
            let ds = driver.stat()?;
            u32::from(ds.major) << 8 | u32::from(ds.minor)
        }
        _ => 0,
    };
    Ok(Stat {
        size: node_size(node),
        file_type: node.file_type(),
        mode: node.mode,
        uid: node.uid,
        gid: node.gid,
        dev,
        ctime: node.ctime,
        mtime: node.mtime,
    })
}

struct LfsDirStream {
    entries: Vec<DirEntry>,
    cursor: usize,
}

impl DirStream for LfsDirStream {
    fn next_entry(&mut self) -> KResult<Option<DirEntry>> {
        let entry = self.entries.get(self.cursor).cloned();
        if entry.is_some() {
            self.cursor += 1;
        }
        Ok(entry)
    }
}

/// `/dev/null`-style sink driver, handy for wiring program stdio.
#[derive(Debug, Default)]
pub struct NullDevice;

impl Driver for NullDevice {
    fn open(&self, _flags: OpenFlags) -> KResult<()> {
        Ok(())
    }

    fn close(&self, _force: bool) -> KResult<()> {
        Ok(())
    }

    fn read(&self, _buf: &mut [u8], _pos: u64) -> KResult<usize> {
        Ok(0)
    }

    fn write(&self, buf: &[u8], _pos: u64) -> KResult<usize> {
        Ok(buf.len())
    }

    fn stat(&self) -> KResult<DeviceStat> {
        Ok(DeviceStat {
            major: 1,
            minor: 3,
            size: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh() -> Lfs {
        Lfs::new(KClock::start(), None)
    }

    #[test]
    fn create_write_read_round_trip() {
        let fs = fresh();
        let fh = fs
            .open("/note", OpenFlags::READ | OpenFlags::WRITE | OpenFlags::CREATE)
            .unwrap();
        assert_eq!(fs.write(fh, b"payload", 0).unwrap(), 7);
        let mut buf = [0u8; 7];
        assert_eq!(fs.read(fh, &mut buf, 0).unwrap(), 7);
        assert_eq!(&buf, b"payload");
        assert_eq!(fs.fstat(fh).unwrap().size, 7);
        fs.close(fh, false).unwrap();
    }

    #[test]
    fn mkdir_then_opendir_is_empty_and_removable() {
        let fs = fresh();
        fs.mkdir("/tmp", 0o755).unwrap();
        let mut dir = fs.opendir("/tmp").unwrap();
        assert!(dir.next_entry().unwrap().is_none());
        fs.remove("/tmp").unwrap();
        assert_eq!(fs.stat("/tmp").unwrap_err(), Errno::NoEnt);
    }

    #[test]
    fn remove_refuses_non_empty_directory() {
        let fs = fresh();
        fs.mkdir("/d", 0o755).unwrap();
        let fh = fs
            .open("/d/f", OpenFlags::WRITE | OpenFlags::CREATE)
            .unwrap();
        fs.close(fh, false).unwrap();
        assert_eq!(fs.remove("/d").unwrap_err(), Errno::NotEmpty);
        fs.remove("/d/f").unwrap();
        fs.remove("/d").unwrap();
    }

    #[test]
    fn rename_back_and_forth_restores_tree() {
        let fs = fresh();
        let fh = fs
            .open("/a", OpenFlags::WRITE | OpenFlags::CREATE)
            .unwrap();
        fs.write(fh, b"x", 0).unwrap();
        fs.close(fh, false).unwrap();

        fs.rename("/a", "/b").unwrap();
        assert_eq!(fs.stat("/a").unwrap_err(), Errno::NoEnt);
        fs.rename("/b", "/a").unwrap();
        assert_eq!(fs.stat("/a").unwrap().size, 1);
    }

    #[test]
    fn size_cap_rejects_whole_write() {
        let fs = Lfs::new(KClock::start(), Some(4));
        let fh = fs
            .open("/f", OpenFlags::WRITE | OpenFlags::CREATE)
            .unwrap();
        assert_eq!(fs.write(fh, b"1234", 0).unwrap(), 4);
        assert_eq!(fs.write(fh, b"5", 4).unwrap_err(), Errno::NoSpc);
        assert_eq!(fs.fstat(fh).unwrap().size, 4);
        fs.close(fh, false).unwrap();
    }

    #[test]
    fn open_directory_fails_isdir() {
        let fs = fresh();
        fs.mkdir("/d", 0o755).unwrap();
        assert_eq!(fs.open("/d", OpenFlags::READ).unwrap_err(), Errno::IsDir);
    }

    #[test]
    fn trailing_slash_requires_directory() {
        let fs = fresh();
        let fh = fs
            .open("/f", OpenFlags::WRITE | OpenFlags::CREATE)
            .unwrap();
        fs.close(fh, false).unwrap();
        assert_eq!(fs.stat("/f/").unwrap_err(), Errno::NotDir);
    }

    #[test]
    fn removed_while_open_file_survives_until_close() {
        let fs = fresh();
        let fh = fs
            .open("/f", OpenFlags::READ | OpenFlags::WRITE | OpenFlags::CREATE)
            .unwrap();
        fs.write(fh, b"live", 0).unwrap();
        fs.remove("/f").unwrap();
        assert_eq!(fs.stat("/f").unwrap_err(), Errno::NoEnt);
        let mut buf = [0u8; 4];
        assert_eq!(fs.read(fh, &mut buf, 0).unwrap(), 4);
        assert_eq!(&buf, b"live");
        fs.close(fh, false).unwrap();
    }
}
