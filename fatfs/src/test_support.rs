//! Test fixtures: minimal FAT volume images laid out on a RAM disk so
//! the driver can be exercised end to end without real media.

use alloc::sync::Arc;
use alloc::vec;

use onyx_block::RamDisk;

use crate::volume::{MountOptions, Volume};

pub(crate) const SS: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FatKind {
    Fat12,
    Fat16,
    Fat32,
}

fn st16(img: &mut [u8], off: usize, v: u16) {
    img[off..off + 2].copy_from_slice(&v.to_le_bytes());
}

fn st32(img: &mut [u8], off: usize, v: u32) {
    img[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

/// Builds a freshly formatted volume with exactly `nclst` data clusters
/// of one sector each, at sector `base` of the image.
fn build_volume(img: &mut [u8], base: usize, kind: FatKind, nclst: u32) {
    let (rsvd, n_fats, root_ents): (u32, u32, u32) = match kind {
        FatKind::Fat32 => (32, 1, 0),
        _ => (1, 2, 512),
    };
    let fat_bytes = match kind {
        FatKind::Fat12 => (nclst + 2) * 3 / 2 + ((nclst + 2) & 1),
        FatKind::Fat16 => (nclst + 2) * 2,
        FatKind::Fat32 => (nclst + 2) * 4,
    };
    let fsize = (fat_bytes + SS as u32 - 1) / SS as u32;
    let root_sects = root_ents * 32 / SS as u32;
    let tsect = rsvd + n_fats * fsize + root_sects + nclst;

    let bs = base * SS;
    let boot = &mut img[bs..bs + SS];
    boot[0..3].copy_from_slice(&[0xEB, 0xFE, 0x90]);
    boot[3..11].copy_from_slice(b"ONYX1.0 ");
    st16(boot, 11, SS as u16);
    boot[13] = 1; /* sectors per cluster */
    st16(boot, 14, rsvd as u16);
    boot[16] = n_fats as u8;
    st16(boot, 17, root_ents as u16);
    if tsect < 0x10000 {
        st16(boot, 19, tsect as u16);
    } else {
        st32(boot, 32, tsect);
    }
    boot[21] = 0xF8; /* media descriptor */
    match kind {
        FatKind::Fat32 => {
            st32(boot, 36, fsize);
            st32(boot, 44, 2); /* root directory cluster */
            st16(boot, 48, 1); /* FSINFO sector */
            st32(boot, 67, 0x1234_5678);
            boot[82..90].copy_from_slice(b"FAT32   ");
        }
        FatKind::Fat16 => {
            st16(boot, 22, fsize as u16);
            st32(boot, 39, 0x1234_5678);
            boot[54..62].copy_from_slice(b"FAT16   ");
        }
        FatKind::Fat12 => {
            st16(boot, 22, fsize as u16);
            st32(boot, 39, 0x1234_5678);
            boot[54..62].copy_from_slice(b"FAT12   ");
        }
    }
    st16(boot, 510, 0xAA55);

    // Seed the reserved FAT entries (and the FAT32 root chain) into
    // every FAT copy.
    for n in 0..n_fats {
        let fb = (base as u32 + rsvd + n * fsize) as usize * SS;
        match kind {
            FatKind::Fat12 => {
                img[fb..fb + 3].copy_from_slice(&[0xF8, 0xFF, 0xFF]);
            }
            FatKind::Fat16 => {
                img[fb..fb + 4].copy_from_slice(&[0xF8, 0xFF, 0xFF, 0xFF]);
            }
            FatKind::Fat32 => {
                st32(img, fb, 0x0FFF_FFF8);
                st32(img, fb + 4, 0x0FFF_FFFF);
                st32(img, fb + 8, 0x0FFF_FFFF); /* root directory EOC */
            }
        }
    }

    if kind == FatKind::Fat32 {
        // FSINFO with warm hints: the root cluster is allocated.
        let fi = (base + 1) * SS;
        st32(img, fi, 0x4161_5252);
        st32(img, fi + 484, 0x6141_7272);
        st32(img, fi + 488, nclst - 1);
        st32(img, fi + 492, 3);
        st16(img, fi + 510, 0xAA55);
    }
}

fn volume_sectors(kind: FatKind, nclst: u32) -> u32 {
    let (rsvd, n_fats, root_ents): (u32, u32, u32) = match kind {
        FatKind::Fat32 => (32, 1, 0),
        _ => (1, 2, 512),
    };
    let fat_bytes = match kind {
        FatKind::Fat12 => (nclst + 2) * 3 / 2 + ((nclst + 2) & 1),
        FatKind::Fat16 => (nclst + 2) * 2,
        FatKind::Fat32 => (nclst + 2) * 4,
    };
    let fsize = (fat_bytes + SS as u32 - 1) / SS as u32;
    rsvd + n_fats * fsize + root_ents * 32 / SS as u32 + nclst
}

/// A superfloppy image: the boot sector is sector 0.
pub(crate) fn mkfat(kind: FatKind, nclst: u32) -> Arc<RamDisk> {
    let tsect = volume_sectors(kind, nclst) as usize;
    let mut img = vec![0u8; tsect * SS];
    build_volume(&mut img, 0, kind, nclst);
    Arc::new(RamDisk::from_image(SS, img))
}

/// An MBR-partitioned image with one FAT partition at `part_base`.
pub(crate) fn mkfat_mbr(kind: FatKind, nclst: u32, part_base: u32) -> Arc<RamDisk> {
    let psects = volume_sectors(kind, nclst);
    let mut img = vec![0u8; (part_base + psects) as usize * SS];

    // Partition entry 0: bootable, type FAT, starting at part_base.
    img[446] = 0x80;
    img[446 + 4] = 0x01;
    st32(&mut img, 446 + 8, part_base);
    st32(&mut img, 446 + 12, psects);
    st16(&mut img, 510, 0xAA55);

    build_volume(&mut img, part_base as usize, kind, nclst);
    Arc::new(RamDisk::from_image(SS, img))
}

/// Mounts an image read/write with the default options.
pub(crate) fn mount_img(disk: Arc<RamDisk>) -> Volume {
    Volume::mount(disk, MountOptions::default()).expect("test image mounts")
}
