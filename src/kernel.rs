//! The kernel singleton.
//!
//! Created once at boot and handed around as an `Arc`; it owns the VFS, the
//! boot clock, the file system type registry and the process table. There is
//! no file-level mutable state anywhere in the crate, so every public entry
//! point goes through a [`Kernel`] reference.

use std::sync::Arc;

use log::info;

use crate::errno::{Errno, KResult, set_last_error};
use crate::fs::FsType;
use crate::runtime::{ProcTable, ProgramDesc};
use crate::sync::{KClock, KMutex};
use crate::vfs::{Vfs, path};

/// Boot-time configuration.
///
/// Setters return the previous value on success; on a rejected argument they
/// return the nearest value that would succeed.
#[derive(Debug, Clone, Copy)]
pub struct KernelConfig {
    max_path_len: usize,
    pipe_capacity: usize,
    bcache_slots: usize,
}

impl Default for KernelConfig {
    fn default() -> Self {
        KernelConfig {
            max_path_len: path::MAX_PATH_LEN,
            pipe_capacity: crate::pipe::DEFAULT_PIPE_CAPACITY,
            bcache_slots: 8,
        }
    }
}

impl KernelConfig {
    /// Set the maximum accepted path length in bytes.
    ///
    /// # Errors
    /// If the argument is out of range, returns the nearest value which will
    /// succeed.
    pub fn set_max_path_len(&mut self, value: usize) -> Result<usize, usize> {
        if value < 2 {
            return Err(2);
        }
        let previous = self.max_path_len;
        self.max_path_len = value;
        Ok(previous)
    }

    /// Set the byte capacity of newly created pipes.
    ///
    /// # Errors
    /// If the argument is zero, returns the nearest value which will succeed.
    pub fn set_pipe_capacity(&mut self, value: usize) -> Result<usize, usize> {
        if value == 0 {
            return Err(1);
        }
        let previous = self.pipe_capacity;
        self.pipe_capacity = value;
        Ok(previous)
    }

    /// Set the number of slots in each mounted volume's block cache.
    ///
    /// # Errors
    /// If the argument is zero, returns the nearest value which will succeed.
    pub fn set_bcache_slots(&mut self, value: usize) -> Result<usize, usize> {
        if value == 0 {
            return Err(1);
        }
        let previous = self.bcache_slots;
        self.bcache_slots = value;
        Ok(previous)
    }

    /// Maximum accepted path length in bytes.
    pub fn max_path_len(&self) -> usize {
        self.max_path_len
    }

    /// Byte capacity of newly created pipes.
    pub fn pipe_capacity(&self) -> usize {
        self.pipe_capacity
    }

    /// Slots in each mounted volume's block cache.
    pub fn bcache_slots(&self) -> usize {
        self.bcache_slots
    }
}

/// The kernel: VFS, clock, registries, process table.
#[derive(Debug)]
pub struct Kernel {
    vfs: Arc<Vfs>,
    clock: KClock,
    fs_types: KMutex<Vec<FsType>>,
    programs: KMutex<Vec<ProgramDesc>>,
    pub(crate) procs: ProcTable,
    config: KernelConfig,
}

impl Kernel {
    /// Boot a kernel with the given configuration and no registered file
    /// system types.
    pub fn new(config: KernelConfig) -> Arc<Self> {
        let clock = KClock::start();
        let kernel = Arc::new(Kernel {
            vfs: Vfs::new(clock, &config),
            clock,
            fs_types: KMutex::new(Vec::new()),
            programs: KMutex::new(Vec::new()),
            procs: ProcTable::new(),
            config,
        });
        info!("kernel: boot");
        kernel
    }

    /// Boot with defaults and the four stock backends registered.
    pub fn with_default_fs() -> Arc<Self> {
        let kernel = Kernel::new(KernelConfig::default());
        for fstype in [
            FsType {
                name: "lfs",
                init: crate::fs::lfs::init,
            },
            FsType {
                name: "devfs",
                init: crate::fs::devfs::init,
            },
            FsType {
                name: "fatfs",
                init: crate::fs::fatfs::init,
            },
            FsType {
                name: "ext4fs",
                init: crate::fs::ext4fs::init,
            },
        ] {
            kernel
                .register_fs(fstype)
                .expect("stock backend names are unique");
        }
        kernel
    }

    /// Register a file system type so `mount` can find it by name.
    pub fn register_fs(&self, fstype: FsType) -> KResult<()> {
        let mut types = self.fs_types.force_lock();
        if types.iter().any(|t| t.name == fstype.name) {
            return Err(Errno::Exist);
        }
        types.push(fstype);
        Ok(())
    }

    /// Register the compile-time program table `spawn` looks names up in.
    pub fn register_programs(&self, programs: &'static [ProgramDesc]) -> KResult<()> {
        let mut table = self.programs.force_lock();
        for desc in programs {
            if table.iter().any(|p| p.name == desc.name) {
                return Err(Errno::Exist);
            }
            table.push(*desc);
        }
        Ok(())
    }

    pub(crate) fn program(&self, name: &str) -> Option<ProgramDesc> {
        let table = self.programs.force_lock();
        table.iter().find(|p| p.name == name).copied()
    }

    /// The VFS root.
    pub fn vfs(&self) -> &Arc<Vfs> {
        &self.vfs
    }

    /// The boot clock.
    pub fn clock(&self) -> KClock {
        self.clock
    }

    /// The boot configuration.
    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// Mount a registered file system type at `mount_point`.
    pub fn mount(&self, fsname: &str, source: &str, mount_point: &str, opts: &str) -> KResult<()> {
        let fstype = {
            let types = self.fs_types.force_lock();
            types
                .iter()
                .find(|t| t.name == fsname)
                .copied()
                .ok_or(Errno::NoEnt)?
        };
        self.vfs
            .mount(fstype, source, mount_point, opts)
            .map_err(set_last_error)
    }

    /// Unmount the file system at `mount_point`.
    pub fn umount(&self, mount_point: &str) -> KResult<()> {
        self.vfs.umount(mount_point).map_err(set_last_error)
    }

    /// Resolve `p` against the current task's working directory.
    ///
    /// Absolute paths pass through unchanged; relative ones are joined onto
    /// the cwd of the calling program (or `/` outside any program).
    pub fn absolutize(&self, p: &str) -> String {
        if p.starts_with('/') {
            return p.to_string();
        }
        let cwd = crate::runtime::current()
            .map(|proc| proc.cwd())
            .unwrap_or_else(|| "/".to_string());
        if cwd.ends_with('/') {
            format!("{cwd}{p}")
        } else {
            format!("{cwd}/{p}")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_setters_follow_previous_or_nearest() {
        let mut config = KernelConfig::default();
        assert_eq!(config.set_max_path_len(1), Err(2));
        assert_eq!(config.set_max_path_len(64), Ok(path::MAX_PATH_LEN));
        assert_eq!(config.max_path_len(), 64);
        assert_eq!(config.set_pipe_capacity(0), Err(1));
        assert_eq!(config.set_bcache_slots(4), Ok(8));
    }

    #[test]
    fn register_fs_rejects_duplicates() {
        let kernel = Kernel::with_default_fs();
        let dup = FsType {
            name: "lfs",
            init: crate::fs::lfs::init,
        };
        assert_eq!(kernel.register_fs(dup).unwrap_err(), Errno::Exist);
    }

    #[test]
    fn mount_of_unregistered_type_fails() {
        let kernel = Kernel::new(KernelConfig::default());
        assert_eq!(
            kernel.mount("lfs", "", "/", "").unwrap_err(),
            Errno::NoEnt
        );
    }
}
