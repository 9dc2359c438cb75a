//! End-to-end scenarios over the mount tree: lfs as root, devfs beneath it,
//! descriptor lifecycle, and the documented failure modes.

use std::sync::Arc;

use minikern::fs::lfs::NullDevice;
use minikern::vfs::path::{MAX_COMPONENT_LEN, MAX_PATH_LEN};
use minikern::{Errno, Kernel, Whence};

fn boot() -> Arc<Kernel> {
    let _ = env_logger::builder().is_test(true).try_init();
    let kernel = Kernel::with_default_fs();
    kernel.mount("lfs", "", "/", "").unwrap();
    kernel
}

#[test]
fn null_device_scenario() {
    let kernel = boot();
    let vfs = kernel.vfs();

    vfs.mkdir("/dev", 0o755).unwrap();
    kernel.mount("devfs", "", "/dev", "").unwrap();
    vfs.mknod("/dev/null", Arc::new(NullDevice)).unwrap();

    let fd = vfs.open("/dev/null", "r+").unwrap();
    assert_eq!(vfs.write(fd, b"x").unwrap(), 1);
    let mut buf = [0u8; 1];
    assert_eq!(vfs.read(fd, &mut buf).unwrap(), 0);
    assert!(vfs.is_eof(fd).unwrap());
    vfs.close(fd).unwrap();

    kernel.umount("/dev").unwrap();
    kernel.umount("/").unwrap();
    assert_eq!(vfs.mount_count(), 0);
}

#[test]
fn write_seek_read_round_trip() {
    let kernel = boot();
    let vfs = kernel.vfs();

    let fd = vfs.open("/data", "w+").unwrap();
    assert_eq!(vfs.write(fd, b"payload bytes").unwrap(), 13);
    assert_eq!(vfs.lseek(fd, 0, Whence::Set).unwrap(), 0);
    let mut buf = vec![0u8; 13];
    assert_eq!(vfs.read(fd, &mut buf).unwrap(), 13);
    assert_eq!(&buf, b"payload bytes");
    vfs.close(fd).unwrap();
}

#[test]
fn mkdir_opendir_rmdir_cycle() {
    let kernel = boot();
    let vfs = kernel.vfs();

    vfs.mkdir("/work", 0o755).unwrap();
    let dir = vfs.opendir("/work").unwrap();
    assert!(vfs.readdir(dir).unwrap().is_none());
    vfs.closedir(dir).unwrap();
    vfs.remove("/work").unwrap();
    assert_eq!(vfs.stat("/work").unwrap_err(), Errno::NoEnt);
}

#[test]
fn rename_twice_restores_the_tree() {
    let kernel = boot();
    let vfs = kernel.vfs();

    let fd = vfs.open("/a", "w").unwrap();
    vfs.write(fd, b"1").unwrap();
    vfs.close(fd).unwrap();

    vfs.rename("/a", "/b").unwrap();
    vfs.rename("/b", "/a").unwrap();
    assert_eq!(vfs.stat("/a").unwrap().size, 1);
    assert_eq!(vfs.stat("/b").unwrap_err(), Errno::NoEnt);
}

#[test]
fn cross_mount_rename_is_refused() {
    let kernel = boot();
    let vfs = kernel.vfs();
    vfs.mkdir("/dev", 0o755).unwrap();
    kernel.mount("devfs", "", "/dev", "").unwrap();

    let fd = vfs.open("/f", "w").unwrap();
    vfs.close(fd).unwrap();
    assert_eq!(vfs.rename("/f", "/dev/f").unwrap_err(), Errno::XDev);
}

#[test]
fn path_length_boundary() {
    let kernel = boot();
    let vfs = kernel.vfs();

    // Build a path of exactly MAX_PATH_LEN bytes out of short components.
    let mut p = String::new();
    while p.len() + 2 <= MAX_PATH_LEN {
        p.push_str("/x");
    }
    while p.len() < MAX_PATH_LEN {
        p.push('y');
    }
    assert_eq!(p.len(), MAX_PATH_LEN);
    // The leaf's parents do not exist: the shape is accepted, the lookup
    // fails.
    assert_eq!(vfs.open(&p, "r").unwrap_err(), Errno::NoEnt);

    let over = format!("{p}z");
    assert_eq!(vfs.open(&over, "r").unwrap_err(), Errno::NameTooLong);

    let long_component = format!("/{}", "c".repeat(MAX_COMPONENT_LEN + 1));
    assert_eq!(vfs.open(&long_component, "r").unwrap_err(), Errno::NameTooLong);
}

#[test]
fn full_lfs_reports_enospc_with_no_partial_write() {
    let kernel = Kernel::with_default_fs();
    kernel.mount("lfs", "", "/", "size=8").unwrap();
    let vfs = kernel.vfs();

    let fd = vfs.open("/f", "w").unwrap();
    assert_eq!(vfs.write(fd, b"12345678").unwrap(), 8);
    assert_eq!(vfs.write(fd, b"9").unwrap_err(), Errno::NoSpc);
    assert_eq!(vfs.fstat(fd).unwrap().size, 8);
    vfs.close(fd).unwrap();
}

#[test]
fn double_close_is_detected() {
    let kernel = boot();
    let vfs = kernel.vfs();

    let fd = vfs.open("/f", "w").unwrap();
    vfs.close(fd).unwrap();
    assert_eq!(vfs.close(fd).unwrap_err(), Errno::BadF);
    // The table survives: other descriptors keep working.
    let fd2 = vfs.open("/g", "w").unwrap();
    vfs.write(fd2, b"ok").unwrap();
    vfs.close(fd2).unwrap();
}

#[test]
fn mount_at_missing_directory_leaves_table_unchanged() {
    let kernel = boot();
    assert_eq!(
        kernel.mount("devfs", "", "/nosuch", "").unwrap_err(),
        Errno::NoEnt
    );
    assert_eq!(kernel.vfs().mount_count(), 1);
    assert_eq!(kernel.vfs().getmntent(0).unwrap().fsname, "lfs");
    assert_eq!(kernel.vfs().getmntent(1).unwrap_err(), Errno::NoEnt);
}

#[test]
fn mount_at_file_is_notdir_and_duplicate_is_busy() {
    let kernel = boot();
    let vfs = kernel.vfs();
    let fd = vfs.open("/blob", "w").unwrap();
    vfs.close(fd).unwrap();
    assert_eq!(
        kernel.mount("devfs", "", "/blob", "").unwrap_err(),
        Errno::NotDir
    );
    vfs.mkdir("/dev", 0o755).unwrap();
    kernel.mount("devfs", "", "/dev", "").unwrap();
    assert_eq!(
        kernel.mount("devfs", "", "/dev", "").unwrap_err(),
        Errno::Busy
    );
}

#[test]
fn umount_with_open_file_is_busy() {
    let kernel = boot();
    let vfs = kernel.vfs();

    let fd = vfs.open("/held", "w").unwrap();
    assert_eq!(kernel.umount("/").unwrap_err(), Errno::Busy);
    vfs.close(fd).unwrap();
    kernel.umount("/").unwrap();
}

#[test]
fn umount_with_nested_mount_is_busy() {
    let kernel = boot();
    let vfs = kernel.vfs();
    vfs.mkdir("/dev", 0o755).unwrap();
    kernel.mount("devfs", "", "/dev", "").unwrap();

    assert_eq!(kernel.umount("/").unwrap_err(), Errno::Busy);
    kernel.umount("/dev").unwrap();
    kernel.umount("/").unwrap();
}

#[test]
fn unknown_open_mode_is_invalid() {
    let kernel = boot();
    assert_eq!(kernel.vfs().open("/f", "x").unwrap_err(), Errno::Inval);
    assert_eq!(kernel.vfs().open("/f", "rw").unwrap_err(), Errno::Inval);
    assert!(kernel.vfs().open("/f", "wb").is_ok());
}

#[test]
fn read_requires_read_access() {
    let kernel = boot();
    let vfs = kernel.vfs();
    let fd = vfs.open("/f", "w").unwrap();
    let mut buf = [0u8; 1];
    assert_eq!(vfs.read(fd, &mut buf).unwrap_err(), Errno::Acces);
    vfs.close(fd).unwrap();

    let fd = vfs.open("/f", "r").unwrap();
    assert_eq!(vfs.write(fd, b"z").unwrap_err(), Errno::Acces);
    vfs.close(fd).unwrap();
}

#[test]
fn append_mode_writes_at_end() {
    let kernel = boot();
    let vfs = kernel.vfs();

    let fd = vfs.open("/log", "w").unwrap();
    vfs.write(fd, b"one").unwrap();
    vfs.close(fd).unwrap();

    let fd = vfs.open("/log", "a").unwrap();
    vfs.write(fd, b"two").unwrap();
    vfs.close(fd).unwrap();

    let fd = vfs.open("/log", "r").unwrap();
    let mut buf = vec![0u8; 6];
    assert_eq!(vfs.read(fd, &mut buf).unwrap(), 6);
    assert_eq!(&buf, b"onetwo");
    vfs.close(fd).unwrap();
}

#[test]
fn statfs_reports_backend_names() {
    let kernel = boot();
    let vfs = kernel.vfs();
    vfs.mkdir("/dev", 0o755).unwrap();
    kernel.mount("devfs", "", "/dev", "").unwrap();

    assert_eq!(vfs.statfs("/").unwrap().fsname, "lfs");
    assert_eq!(vfs.statfs("/dev").unwrap().fsname, "devfs");
    assert_eq!(vfs.statfs("/dev/whatever").unwrap().fsname, "devfs");
}

#[test]
fn remove_of_a_mount_point_is_busy() {
    let kernel = boot();
    let vfs = kernel.vfs();
    vfs.mkdir("/dev", 0o755).unwrap();
    kernel.mount("devfs", "", "/dev", "").unwrap();
    assert_eq!(vfs.remove("/dev").unwrap_err(), Errno::Busy);
}

#[test]
fn chmod_chown_round_trip() {
    let kernel = boot();
    let vfs = kernel.vfs();
    let fd = vfs.open("/f", "w").unwrap();
    vfs.close(fd).unwrap();

    vfs.chmod("/f", 0o640).unwrap();
    vfs.chown("/f", 7, 42).unwrap();
    let st = vfs.stat("/f").unwrap();
    assert_eq!(st.mode, 0o640);
    assert_eq!(st.uid, 7);
    assert_eq!(st.gid, 42);
}

#[test]
fn readdir_lists_created_entries() {
    let kernel = boot();
    let vfs = kernel.vfs();
    vfs.mkdir("/d", 0o755).unwrap();
    let fd = vfs.open("/d/file", "w").unwrap();
    vfs.write(fd, b"abc").unwrap();
    vfs.close(fd).unwrap();
    vfs.mkfifo("/d/queue").unwrap();

    let dir = vfs.opendir("/d").unwrap();
    let mut names = Vec::new();
    while let Some(entry) = vfs.readdir(dir).unwrap() {
        names.push((entry.name, entry.file_type, entry.size));
    }
    vfs.closedir(dir).unwrap();

    assert_eq!(names.len(), 2);
    assert_eq!(names[0].0, "file");
    assert_eq!(names[0].2, 3);
    assert_eq!(names[1].0, "queue");
}
