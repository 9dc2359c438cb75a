//! ext4fs end to end: format a memory-backed file, mount it, push data
//! through, remount read-only, and verify bit-exact contents.

use std::sync::Arc;

use minikern::fs::ext4fs;
use minikern::{Errno, Kernel, Whence};

const IMAGE: &str = "/disk.img";
const IMAGE_BYTES: u64 = 4 * 1024 * 1024;

fn boot_with_image() -> Arc<Kernel> {
    let _ = env_logger::builder().is_test(true).try_init();
    let kernel = Kernel::with_default_fs();
    kernel.mount("lfs", "", "/", "").unwrap();
    ext4fs::mkfs(kernel.vfs(), IMAGE, IMAGE_BYTES).unwrap();
    kernel.vfs().mkdir("/mnt", 0o755).unwrap();
    kernel
}

#[test]
fn format_mount_write_remount_read() {
    let kernel = boot_with_image();
    let vfs = kernel.vfs();
    kernel.mount("ext4fs", IMAGE, "/mnt", "").unwrap();

    // One mebibyte of 0xA5 exercises the double-indirect map.
    let pattern = vec![0xA5u8; 1024 * 1024];
    let fd = vfs.open("/mnt/f", "w").unwrap();
    let mut written = 0;
    while written < pattern.len() {
        written += vfs.write(fd, &pattern[written..]).unwrap();
    }
    vfs.close(fd).unwrap();
    kernel.umount("/mnt").unwrap();

    kernel.mount("ext4fs", IMAGE, "/mnt", "ro").unwrap();
    let fd = vfs.open("/mnt/f", "r").unwrap();
    assert_eq!(vfs.fstat(fd).unwrap().size, pattern.len() as u64);
    let mut back = vec![0u8; pattern.len()];
    let mut read = 0;
    while read < back.len() {
        let n = vfs.read(fd, &mut back[read..]).unwrap();
        assert!(n > 0);
        read += n;
    }
    assert_eq!(back, pattern);
    vfs.close(fd).unwrap();

    // The read-only mount refuses mutation.
    assert_eq!(vfs.open("/mnt/new", "w").unwrap_err(), Errno::Rofs);
    kernel.umount("/mnt").unwrap();
    kernel.umount("/").unwrap();
}

#[test]
fn directories_and_listing_survive_remount() {
    let kernel = boot_with_image();
    let vfs = kernel.vfs();
    kernel.mount("ext4fs", IMAGE, "/mnt", "").unwrap();

    vfs.mkdir("/mnt/sub", 0o750).unwrap();
    let fd = vfs.open("/mnt/sub/inner.txt", "w").unwrap();
    vfs.write(fd, b"persisted").unwrap();
    vfs.close(fd).unwrap();
    kernel.umount("/mnt").unwrap();

    kernel.mount("ext4fs", IMAGE, "/mnt", "").unwrap();
    let st = vfs.stat("/mnt/sub").unwrap();
    assert!(st.is_dir());
    assert_eq!(st.mode, 0o750);

    let dir = vfs.opendir("/mnt/sub").unwrap();
    let entry = vfs.readdir(dir).unwrap().unwrap();
    assert_eq!(entry.name, "inner.txt");
    assert_eq!(entry.size, 9);
    assert!(vfs.readdir(dir).unwrap().is_none());
    vfs.closedir(dir).unwrap();
    kernel.umount("/mnt").unwrap();
}

#[test]
fn remove_and_rename_on_disk() {
    let kernel = boot_with_image();
    let vfs = kernel.vfs();
    kernel.mount("ext4fs", IMAGE, "/mnt", "").unwrap();

    let fd = vfs.open("/mnt/a", "w").unwrap();
    vfs.write(fd, b"x").unwrap();
    vfs.close(fd).unwrap();

    vfs.rename("/mnt/a", "/mnt/b").unwrap();
    assert_eq!(vfs.stat("/mnt/a").unwrap_err(), Errno::NoEnt);
    vfs.rename("/mnt/b", "/mnt/a").unwrap();
    assert_eq!(vfs.stat("/mnt/a").unwrap().size, 1);

    vfs.mkdir("/mnt/d", 0o755).unwrap();
    let fd = vfs.open("/mnt/d/inner", "w").unwrap();
    vfs.close(fd).unwrap();
    assert_eq!(vfs.remove("/mnt/d").unwrap_err(), Errno::NotEmpty);
    vfs.remove("/mnt/d/inner").unwrap();
    vfs.remove("/mnt/d").unwrap();
    vfs.remove("/mnt/a").unwrap();

    let dir = vfs.opendir("/mnt").unwrap();
    assert!(vfs.readdir(dir).unwrap().is_none());
    vfs.closedir(dir).unwrap();
    kernel.umount("/mnt").unwrap();
}

#[test]
fn truncate_frees_space() {
    let kernel = boot_with_image();
    let vfs = kernel.vfs();
    kernel.mount("ext4fs", IMAGE, "/mnt", "").unwrap();

    let free_before = vfs.statfs("/mnt").unwrap().bfree;
    let fd = vfs.open("/mnt/big", "w").unwrap();
    vfs.write(fd, &vec![1u8; 256 * 1024]).unwrap();
    vfs.close(fd).unwrap();
    let free_mid = vfs.statfs("/mnt").unwrap().bfree;
    assert!(free_mid < free_before);

    let fd = vfs.open("/mnt/big", "w").unwrap();
    vfs.close(fd).unwrap();
    assert_eq!(vfs.stat("/mnt/big").unwrap().size, 0);
    let free_after = vfs.statfs("/mnt").unwrap().bfree;
    assert!(free_after > free_mid);
    assert_eq!(vfs.statfs("/mnt").unwrap().fsname, "ext4fs");
    kernel.umount("/mnt").unwrap();
}

#[test]
fn seek_and_sparse_reads() {
    let kernel = boot_with_image();
    let vfs = kernel.vfs();
    kernel.mount("ext4fs", IMAGE, "/mnt", "").unwrap();

    let fd = vfs.open("/mnt/sparse", "w+").unwrap();
    vfs.lseek(fd, 10_000, Whence::Set).unwrap();
    vfs.write(fd, b"tail").unwrap();
    vfs.lseek(fd, 0, Whence::Set).unwrap();
    let mut head = [0xFFu8; 16];
    assert_eq!(vfs.read(fd, &mut head).unwrap(), 16);
    assert_eq!(head, [0u8; 16], "holes read as zeros");
    vfs.lseek(fd, 10_000, Whence::Set).unwrap();
    let mut tail = [0u8; 4];
    assert_eq!(vfs.read(fd, &mut tail).unwrap(), 4);
    assert_eq!(&tail, b"tail");
    vfs.close(fd).unwrap();
    kernel.umount("/mnt").unwrap();
}
