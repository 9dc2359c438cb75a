//! FAT on-disk structures: boot sector fields, directory entries, long
//! file name entries.

use zerocopy::little_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Boot sector signature at offset 510.
pub(crate) const BOOT_SIGNATURE: u16 = 0xAA55;

/// Directory entry attribute bits.
pub(crate) const ATTR_READ_ONLY: u8 = 0x01;
pub(crate) const ATTR_HIDDEN: u8 = 0x02;
pub(crate) const ATTR_SYSTEM: u8 = 0x04;
pub(crate) const ATTR_VOLUME_ID: u8 = 0x08;
pub(crate) const ATTR_DIRECTORY: u8 = 0x10;
pub(crate) const ATTR_ARCHIVE: u8 = 0x20;
/// The long-name marker: read-only + hidden + system + volume id.
pub(crate) const ATTR_LONG_NAME: u8 =
    ATTR_READ_ONLY | ATTR_HIDDEN | ATTR_SYSTEM | ATTR_VOLUME_ID;
pub(crate) const ATTR_MASK: u8 = 0x3F;

/// First byte of a free directory entry.
pub(crate) const ENTRY_FREE: u8 = 0xE5;
/// First byte marking the end of a directory.
pub(crate) const ENTRY_END: u8 = 0x00;

/// Ordinal flag on the last (highest) LFN entry of a chain.
pub(crate) const LFN_LAST: u8 = 0x40;
/// UTF-16 units carried per LFN entry.
pub(crate) const LFN_CHARS: usize = 13;

/// Shared head of every FAT boot sector (bytes 0..36).
#[derive(Debug, Clone, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub(crate) struct BpbCommon {
    pub jmp_boot: [u8; 3],
    pub oem_name: [u8; 8],
    pub bytes_per_sec: U16,
    pub sec_per_clus: u8,
    pub rsvd_sec_cnt: U16,
    pub num_fats: u8,
    pub root_ent_cnt: U16,
    pub tot_sec16: U16,
    pub media: u8,
    pub fatsz16: U16,
    pub sec_per_trk: U16,
    pub num_heads: U16,
    pub hidd_sec: U32,
    pub tot_sec32: U32,
}

/// FAT12/16 tail (bytes 36..62).
#[derive(Debug, Clone, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub(crate) struct Bpb16Tail {
    pub drv_num: u8,
    pub reserved1: u8,
    pub boot_sig: u8,
    pub vol_id: U32,
    pub vol_lab: [u8; 11],
    pub fil_sys_type: [u8; 8],
}

/// FAT32 tail (bytes 36..90).
#[derive(Debug, Clone, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub(crate) struct Bpb32Tail {
    pub fatsz32: U32,
    pub ext_flags: U16,
    pub fs_ver: U16,
    pub root_clus: U32,
    pub fs_info: U16,
    pub bk_boot_sec: U16,
    pub reserved: [u8; 12],
    pub drv_num: u8,
    pub reserved1: u8,
    pub boot_sig: u8,
    pub vol_id: U32,
    pub vol_lab: [u8; 11],
    pub fil_sys_type: [u8; 8],
}

/// One 32-byte short directory entry.
#[derive(Debug, Clone, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub(crate) struct DirEntryRaw {
    pub name: [u8; 11],
    pub attr: u8,
    pub nt_res: u8,
    pub crt_time_tenth: u8,
    pub crt_time: U16,
    pub crt_date: U16,
    pub lst_acc_date: U16,
    pub fst_clus_hi: U16,
    pub wrt_time: U16,
    pub wrt_date: U16,
    pub fst_clus_lo: U16,
    pub file_size: U32,
}

impl DirEntryRaw {
    pub(crate) fn first_cluster(&self) -> u32 {
        u32::from(self.fst_clus_hi.get()) << 16 | u32::from(self.fst_clus_lo.get())
    }

    pub(crate) fn set_first_cluster(&mut self, clust: u32) {
        self.fst_clus_hi.set((clust >> 16) as u16);
        self.fst_clus_lo.set(clust as u16);
    }

    pub(crate) fn is_dir(&self) -> bool {
        self.attr & ATTR_DIRECTORY != 0
    }
}

/// One 32-byte long-file-name entry.
#[derive(Debug, Clone, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub(crate) struct LfnEntryRaw {
    pub ord: u8,
    pub name1: [U16; 5],
    pub attr: u8,
    pub entry_type: u8,
    pub chksum: u8,
    pub name2: [U16; 6],
    pub fst_clus_lo: U16,
    pub name3: [U16; 2],
}

impl LfnEntryRaw {
    /// The 13 UTF-16 units of this entry, in name order.
    pub(crate) fn units(&self) -> [u16; LFN_CHARS] {
        let mut units = [0u16; LFN_CHARS];
        for (i, u) in self.name1.iter().enumerate() {
            units[i] = u.get();
        }
        for (i, u) in self.name2.iter().enumerate() {
            units[5 + i] = u.get();
        }
        for (i, u) in self.name3.iter().enumerate() {
            units[11 + i] = u.get();
        }
        units
    }

    /// Fill the name fields from `units`.
    pub(crate) fn set_units(&mut self, units: &[u16; LFN_CHARS]) {
        for (i, u) in units.iter().take(5).enumerate() {
            self.name1[i].set(*u);
        }
        for (i, u) in units.iter().skip(5).take(6).enumerate() {
            self.name2[i].set(*u);
        }
        for (i, u) in units.iter().skip(11).enumerate() {
            self.name3[i].set(*u);
        }
    }
}

/// Checksum of an 8.3 name, stored in each LFN entry of its chain.
pub(crate) fn sfn_checksum(name: &[u8; 11]) -> u8 {
    let mut sum = 0u8;
    for c in name {
        sum = (sum >> 1) | (sum << 7);
        sum = sum.wrapping_add(*c);
    }
    sum
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn struct_sizes_match_the_layout() {
        assert_eq!(std::mem::size_of::<BpbCommon>(), 36);
        assert_eq!(std::mem::size_of::<Bpb16Tail>(), 26);
        assert_eq!(std::mem::size_of::<Bpb32Tail>(), 54);
        assert_eq!(std::mem::size_of::<DirEntryRaw>(), 32);
        assert_eq!(std::mem::size_of::<LfnEntryRaw>(), 32);
    }

    #[test]
    fn checksum_matches_the_documented_algorithm() {
        // Reference value computed with the canonical rotate-add loop.
        let name = *b"FOO     TXT";
        let mut expect = 0u8;
        for c in name {
            expect = ((expect & 1) << 7)
                .wrapping_add(expect >> 1)
                .wrapping_add(c);
        }
        assert_eq!(sfn_checksum(&name), expect);
    }

    #[test]
    fn lfn_units_round_trip() {
        let mut entry = LfnEntryRaw {
            ord: 1 | LFN_LAST,
            name1: Default::default(),
            attr: ATTR_LONG_NAME,
            entry_type: 0,
            chksum: 0,
            name2: Default::default(),
            fst_clus_lo: 0.into(),
            name3: Default::default(),
        };
        let mut units = [0xFFFFu16; LFN_CHARS];
        for (i, u) in "hello.rs".encode_utf16().enumerate() {
            units[i] = u;
        }
        units[8] = 0;
        entry.set_units(&units);
        assert_eq!(entry.units(), units);
    }
}
