//! fatfs end to end: format an image on the RAM tree, mount it, exercise
//! long names, aliases, directories, and persistence across remounts.

use std::sync::Arc;

use minikern::fs::fatfs;
use minikern::{Errno, Kernel};

const IMAGE: &str = "/fat.img";

fn boot_with_image(bytes: u64) -> Arc<Kernel> {
    let _ = env_logger::builder().is_test(true).try_init();
    let kernel = Kernel::with_default_fs();
    kernel.mount("lfs", "", "/", "").unwrap();
    fatfs::mkfs(kernel.vfs(), IMAGE, bytes).unwrap();
    kernel.vfs().mkdir("/mnt", 0o755).unwrap();
    kernel
}

#[test]
fn create_write_read_with_long_names() {
    let kernel = boot_with_image(1024 * 1024);
    let vfs = kernel.vfs();
    kernel.mount("fatfs", IMAGE, "/mnt", "").unwrap();

    let fd = vfs.open("/mnt/a long file name.text", "w").unwrap();
    vfs.write(fd, b"fat payload").unwrap();
    vfs.close(fd).unwrap();

    // Long-name lookup is case-insensitive.
    let fd = vfs.open("/mnt/A Long File NAME.text", "r").unwrap();
    let mut buf = vec![0u8; 11];
    assert_eq!(vfs.read(fd, &mut buf).unwrap(), 11);
    assert_eq!(&buf, b"fat payload");
    vfs.close(fd).unwrap();

    let dir = vfs.opendir("/mnt").unwrap();
    let entry = vfs.readdir(dir).unwrap().unwrap();
    assert_eq!(entry.name, "a long file name.text");
    assert_eq!(entry.size, 11);
    vfs.closedir(dir).unwrap();
    kernel.umount("/mnt").unwrap();
}

#[test]
fn contents_survive_remount() {
    let kernel = boot_with_image(1024 * 1024);
    let vfs = kernel.vfs();
    kernel.mount("fatfs", IMAGE, "/mnt", "").unwrap();

    let payload: Vec<u8> = (0..40_000u32).map(|i| (i % 253) as u8).collect();
    let fd = vfs.open("/mnt/blob.bin", "w").unwrap();
    let mut written = 0;
    while written < payload.len() {
        written += vfs.write(fd, &payload[written..]).unwrap();
    }
    vfs.close(fd).unwrap();
    kernel.umount("/mnt").unwrap();

    kernel.mount("fatfs", IMAGE, "/mnt", "").unwrap();
    let fd = vfs.open("/mnt/blob.bin", "r").unwrap();
    assert_eq!(vfs.fstat(fd).unwrap().size, payload.len() as u64);
    let mut back = vec![0u8; payload.len()];
    let mut read = 0;
    while read < back.len() {
        let n = vfs.read(fd, &mut back[read..]).unwrap();
        assert!(n > 0);
        read += n;
    }
    assert_eq!(back, payload);
    vfs.close(fd).unwrap();
    kernel.umount("/mnt").unwrap();
}

#[test]
fn directories_and_removal() {
    let kernel = boot_with_image(512 * 1024);
    let vfs = kernel.vfs();
    kernel.mount("fatfs", IMAGE, "/mnt", "").unwrap();

    vfs.mkdir("/mnt/docs", 0o755).unwrap();
    let fd = vfs.open("/mnt/docs/readme.md", "w").unwrap();
    vfs.write(fd, b"# hi").unwrap();
    vfs.close(fd).unwrap();

    assert_eq!(vfs.remove("/mnt/docs").unwrap_err(), Errno::NotEmpty);
    vfs.remove("/mnt/docs/readme.md").unwrap();
    vfs.remove("/mnt/docs").unwrap();
    assert_eq!(vfs.stat("/mnt/docs").unwrap_err(), Errno::NoEnt);
    kernel.umount("/mnt").unwrap();
}

#[test]
fn rename_back_and_forth() {
    let kernel = boot_with_image(512 * 1024);
    let vfs = kernel.vfs();
    kernel.mount("fatfs", IMAGE, "/mnt", "").unwrap();

    let fd = vfs.open("/mnt/original name.txt", "w").unwrap();
    vfs.write(fd, b"abc").unwrap();
    vfs.close(fd).unwrap();

    vfs.rename("/mnt/original name.txt", "/mnt/renamed.txt").unwrap();
    assert_eq!(vfs.stat("/mnt/original name.txt").unwrap_err(), Errno::NoEnt);
    vfs.rename("/mnt/renamed.txt", "/mnt/original name.txt").unwrap();
    assert_eq!(vfs.stat("/mnt/original name.txt").unwrap().size, 3);
    kernel.umount("/mnt").unwrap();
}

#[test]
fn short_alias_resolves_alongside_long_name() {
    let kernel = boot_with_image(512 * 1024);
    let vfs = kernel.vfs();
    kernel.mount("fatfs", IMAGE, "/mnt", "").unwrap();

    let fd = vfs.open("/mnt/longish-name.txt", "w").unwrap();
    vfs.write(fd, b"z").unwrap();
    vfs.close(fd).unwrap();

    // The generated 8.3 alias carries a numeric tail.
    let st = vfs.stat("/mnt/LONGIS~1.TXT").unwrap();
    assert_eq!(st.size, 1);
    kernel.umount("/mnt").unwrap();
}

#[test]
fn read_only_mount_refuses_writes() {
    let kernel = boot_with_image(512 * 1024);
    let vfs = kernel.vfs();
    kernel.mount("fatfs", IMAGE, "/mnt", "").unwrap();
    let fd = vfs.open("/mnt/keep", "w").unwrap();
    vfs.write(fd, b"kept").unwrap();
    vfs.close(fd).unwrap();
    kernel.umount("/mnt").unwrap();

    kernel.mount("fatfs", IMAGE, "/mnt", "ro").unwrap();
    assert_eq!(vfs.open("/mnt/new", "w").unwrap_err(), Errno::Rofs);
    let fd = vfs.open("/mnt/keep", "r").unwrap();
    let mut buf = [0u8; 4];
    assert_eq!(vfs.read(fd, &mut buf).unwrap(), 4);
    assert_eq!(&buf, b"kept");
    vfs.close(fd).unwrap();
    assert_eq!(vfs.statfs("/mnt").unwrap().fsname, "fatfs");
    kernel.umount("/mnt").unwrap();
}

#[test]
fn truncate_reuses_clusters() {
    let kernel = boot_with_image(256 * 1024);
    let vfs = kernel.vfs();
    kernel.mount("fatfs", IMAGE, "/mnt", "").unwrap();

    let fd = vfs.open("/mnt/f", "w").unwrap();
    vfs.write(fd, &vec![7u8; 32 * 1024]).unwrap();
    vfs.close(fd).unwrap();
    let free_mid = vfs.statfs("/mnt").unwrap().bfree;

    let fd = vfs.open("/mnt/f", "w").unwrap();
    vfs.close(fd).unwrap();
    let free_after = vfs.statfs("/mnt").unwrap().bfree;
    assert!(free_after > free_mid);
    assert_eq!(vfs.stat("/mnt/f").unwrap().size, 0);
    kernel.umount("/mnt").unwrap();
}
