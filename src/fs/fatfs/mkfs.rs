//! FAT volume formatter.
//!
//! Lays the canonical layout onto a VFS file: boot sector with the BPB
//! fields at their documented offsets, the FAT copies, and the root
//! directory. The FAT width is chosen from the cluster count exactly as the
//! mount side determines it.

use std::sync::Arc;

use zerocopy::{FromZeros, IntoBytes};

use super::layout::{BOOT_SIGNATURE, Bpb16Tail, Bpb32Tail, BpbCommon};
use crate::errno::{Errno, KResult};
use crate::vfs::{Vfs, Whence};

const SSIZE: usize = 512;
const N_FATS: u8 = 2;
const ROOT_ENTRIES: u16 = 512;
const MEDIA: u8 = 0xF8;

/// Create (or extend) the file at `source` to `bytes` and format it.
pub fn mkfs(vfs: &Arc<Vfs>, source: &str, bytes: u64) -> KResult<()> {
    if bytes < 64 * 1024 {
        return Err(Errno::Inval);
    }
    let fd = vfs.open(source, "w+")?;
    let result = format(vfs, fd, bytes);
    let close = vfs.close(fd);
    result?;
    close
}

fn format(vfs: &Arc<Vfs>, fd: crate::vfs::Fd, bytes: u64) -> KResult<()> {
    // Give the file its full extent so later sector reads never hit EOF.
    vfs.lseek(fd, bytes as i64 - 1, Whence::Set)?;
    vfs.write(fd, &[0u8])?;

    let total_sectors = (bytes / SSIZE as u64) as u32;
    let mut csize = 1u32;
    while total_sectors / csize > 65_000 && csize < 128 {
        csize *= 2;
    }

    // Fixed-point pass: FAT width follows the cluster count, which depends
    // on the FAT size.
    let mut fat_bits = 16u32;
    let mut fatsz = 1u32;
    let mut rsvd = 1u32;
    let mut root_sectors = u32::from(ROOT_ENTRIES) * 32 / SSIZE as u32;
    for _ in 0..4 {
        let data = total_sectors
            .saturating_sub(rsvd + u32::from(N_FATS) * fatsz + root_sectors);
        let n_clust = data / csize;
        fat_bits = if n_clust < 4085 {
            12
        } else if n_clust < 65525 {
            16
        } else {
            32
        };
        (rsvd, root_sectors) = if fat_bits == 32 { (32, 0) } else { (1, root_sectors) };
        let needed = ((u64::from(n_clust) + 2) * u64::from(fat_bits) / 8)
            .div_ceil(SSIZE as u64) as u32;
        if needed == fatsz {
            break;
        }
        fatsz = needed.max(1);
    }

    let mut boot = vec![0u8; SSIZE];
    let mut bpb = BpbCommon::new_zeroed();
    bpb.jmp_boot = [0xEB, 0x3C, 0x90];
    bpb.oem_name = *b"MINIKERN";
    bpb.bytes_per_sec.set(SSIZE as u16);
    bpb.sec_per_clus = csize as u8;
    bpb.rsvd_sec_cnt.set(rsvd as u16);
    bpb.num_fats = N_FATS;
    bpb.media = MEDIA;
    bpb.sec_per_trk.set(63);
    bpb.num_heads.set(255);
    if fat_bits == 32 {
        bpb.root_ent_cnt.set(0);
        bpb.fatsz16.set(0);
    } else {
        bpb.root_ent_cnt.set(ROOT_ENTRIES);
        bpb.fatsz16.set(fatsz as u16);
    }
    if total_sectors < 0x10000 && fat_bits != 32 {
        bpb.tot_sec16.set(total_sectors as u16);
    } else {
        bpb.tot_sec32.set(total_sectors);
    }
    boot[..36].copy_from_slice(bpb.as_bytes());

    let vol_id = (bytes as u32).wrapping_mul(0x9E37_79B9);
    if fat_bits == 32 {
        let mut tail = Bpb32Tail::new_zeroed();
        tail.fatsz32.set(fatsz);
        tail.root_clus.set(2);
        tail.fs_info.set(1);
        tail.bk_boot_sec.set(6);
        tail.boot_sig = 0x29;
        tail.vol_id.set(vol_id);
        tail.vol_lab = *b"NO NAME    ";
        tail.fil_sys_type = *b"FAT32   ";
        boot[36..36 + 54].copy_from_slice(tail.as_bytes());
    } else {
        let mut tail = Bpb16Tail::new_zeroed();
        tail.drv_num = 0x80;
        tail.boot_sig = 0x29;
        tail.vol_id.set(vol_id);
        tail.vol_lab = *b"NO NAME    ";
        tail.fil_sys_type = if fat_bits == 12 {
            *b"FAT12   "
        } else {
            *b"FAT16   "
        };
        boot[36..36 + 26].copy_from_slice(tail.as_bytes());
    }
    boot[510..512].copy_from_slice(&BOOT_SIGNATURE.to_le_bytes());
    write_sector(vfs, fd, 0, &boot)?;

    // FAT copies: media entry, end-of-chain entry, and for FAT32 the root
    // directory cluster.
    let mut fat0 = vec![0u8; SSIZE];
    match fat_bits {
        12 => {
            fat0[0] = MEDIA;
            fat0[1] = 0xFF;
            fat0[2] = 0xFF;
        }
        16 => {
            fat0[..2].copy_from_slice(&(0xFF00u16 | u16::from(MEDIA)).to_le_bytes());
            fat0[2..4].copy_from_slice(&0xFFFFu16.to_le_bytes());
        }
        _ => {
            fat0[..4].copy_from_slice(&(0x0FFF_FF00u32 | u32::from(MEDIA)).to_le_bytes());
            fat0[4..8].copy_from_slice(&0x0FFF_FFFFu32.to_le_bytes());
            fat0[8..12].copy_from_slice(&0x0FFF_FFFFu32.to_le_bytes());
        }
    }
    let zero = vec![0u8; SSIZE];
    for copy in 0..u32::from(N_FATS) {
        let base = rsvd + copy * fatsz;
        write_sector(vfs, fd, base, &fat0)?;
        for s in 1..fatsz {
            write_sector(vfs, fd, base + s, &zero)?;
        }
    }

    let root_base = rsvd + u32::from(N_FATS) * fatsz;
    if fat_bits == 32 {
        // FSInfo sector with unknown free count.
        let mut fsinfo = vec![0u8; SSIZE];
        fsinfo[0..4].copy_from_slice(&0x4161_5252u32.to_le_bytes());
        fsinfo[484..488].copy_from_slice(&0x6141_7272u32.to_le_bytes());
        fsinfo[488..492].copy_from_slice(&0xFFFF_FFFFu32.to_le_bytes());
        fsinfo[492..496].copy_from_slice(&0xFFFF_FFFFu32.to_le_bytes());
        fsinfo[508..512].copy_from_slice(&0xAA55_0000u32.to_le_bytes());
        write_sector(vfs, fd, 1, &fsinfo)?;
        // Root directory: cluster 2 zeroed.
        for s in 0..csize {
            write_sector(vfs, fd, root_base + s, &zero)?;
        }
    } else {
        for s in 0..root_sectors {
            write_sector(vfs, fd, root_base + s, &zero)?;
        }
    }
    vfs.flush(fd)
}

fn write_sector(
    vfs: &Arc<Vfs>,
    fd: crate::vfs::Fd,
    sector: u32,
    data: &[u8],
) -> KResult<()> {
    vfs.lseek(fd, i64::from(sector) * SSIZE as i64, Whence::Set)?;
    let mut done = 0;
    while done < data.len() {
        let n = vfs.write(fd, &data[done..])?;
        if n == 0 {
            return Err(Errno::Io);
        }
        done += n;
    }
    Ok(())
}
