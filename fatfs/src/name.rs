//! # Name Codec
//!
//! Conversion between long filenames, their UCS-2 on-disk segments, and
//! 8.3 short names. A long name is stored as up to 20 supplementary
//! directory entries preceding the short entry, bottom first, each
//! carrying 13 characters and a checksum of the short name tying the
//! sequence together.

use crate::codepage::CodePage;
use crate::dir::Dir;
use crate::offsets::*;
use crate::{attr, ld_word, st_word, FatError, DDE, LLE, MAX_LFN, NDDE};

/// Index of the name status byte in the short-name buffer.
pub(crate) const NS: usize = 11;
/// Out of 8.3 format; a numbered short name is required.
pub(crate) const NS_LOSS: u8 = 0x01;
/// LFN entries must be created for this name.
pub(crate) const NS_LFN: u8 = 0x02;
/// Last segment of the path.
pub(crate) const NS_LAST: u8 = 0x04;
/// Name body is all lower case (NT flag).
pub(crate) const NS_BODY: u8 = 0x08;
/// Name extension is all lower case (NT flag).
pub(crate) const NS_EXT: u8 = 0x10;

/// Character slot offsets inside an LFN directory entry.
pub(crate) const LFN_OFS: [usize; 13] = [1, 3, 5, 7, 9, 14, 16, 18, 20, 22, 24, 28, 30];

/// Characters rejected in long names.
const ILLEGAL_LFN: &str = "\"*:<>?|/\\";
/// Characters legal in long names but not in short names.
const ILLEGAL_SFN: &str = "+,;=[]";

/// Wide character upper-casing. Characters whose upper case is not a
/// single UCS-2 character are left as they are.
pub(crate) fn wupper(w: u16) -> u16 {
    match char::from_u32(w as u32) {
        Some(c) => {
            let mut up = c.to_uppercase();
            match (up.next(), up.next()) {
                (Some(u), None) if (u as u32) <= 0xFFFF => u as u16,
                _ => w,
            }
        }
        None => w,
    }
}

/// Computes the checksum of a short name that ties LFN segments to it.
pub(crate) fn sum_sfn(name: &[u8]) -> u8 {
    let mut sum = 0u8;
    for &c in &name[..11] {
        sum = (sum >> 1).wrapping_add(sum << 7).wrapping_add(c);
    }
    sum
}

/// Compares the accumulated long name against one LFN entry.
pub(crate) fn cmp_lfn(lfn: &[u16], ent: &[u8]) -> bool {
    let ord = (ent[LDIR_ORD] & !LLE) as usize;
    if ord == 0 {
        return false;
    }

    let mut i = (ord - 1) * 13;
    let mut wc: u16 = 1;
    for s in 0..13 {
        let uc = ld_word(&ent[LFN_OFS[s]..]);
        if wc != 0 {
            if i >= MAX_LFN {
                return false;
            }
            wc = wupper(uc);
            if wc != wupper(lfn[i]) {
                return false;
            }
            i += 1;
        } else if uc != 0xFFFF {
            return false; /* filler must be 0xFFFF */
        }
    }

    if ent[LDIR_ORD] & LLE != 0 && wc != 0 && lfn[i] != 0 {
        // Last segment matched but the names differ in length.
        return false;
    }

    true
}

/// Extracts the characters of one LFN entry into the name buffer.
pub(crate) fn pick_lfn(lfn: &mut [u16], ent: &[u8]) -> bool {
    let ord = (ent[LDIR_ORD] & 0x3F) as usize;
    if ord == 0 {
        return false;
    }

    let mut i = (ord - 1) * 13;
    let mut wc: u16 = 1;
    for s in 0..13 {
        let uc = ld_word(&ent[LFN_OFS[s]..]);
        if wc != 0 {
            if i >= MAX_LFN {
                return false;
            }
            lfn[i] = uc;
            wc = uc;
            i += 1;
        } else if uc != 0xFFFF {
            return false;
        }
    }

    if ent[LDIR_ORD] & LLE != 0 {
        if i >= MAX_LFN {
            return false;
        }
        lfn[i] = 0;
    }

    true
}

/// Fills one LFN entry with 13 characters of the name, the ordinal, and
/// the short-name checksum. Sets the last-entry flag on the topmost
/// segment.
pub(crate) fn fit_lfn(lfn: &[u16], ent: &mut [u8], ord: u8, sum: u8) {
    ent[LDIR_CHKSUM] = sum;
    ent[LDIR_ATTR] = attr::AM_LFN;
    ent[LDIR_TYPE] = 0;
    st_word(&mut ent[LDIR_FST_CLUS_LO..], 0);

    let mut i = (ord as usize - 1) * 13;
    let mut wc: u16 = 0;
    for s in 0..13 {
        if wc != 0xFFFF {
            wc = lfn[i];
            i += 1;
        }
        st_word(&mut ent[LFN_OFS[s]..], wc);
        if wc == 0 {
            wc = 0xFFFF; /* pad after the terminator */
        }
    }

    let mut ord = ord;
    if wc == 0xFFFF || lfn[i] == 0 {
        ord |= LLE;
    }
    ent[LDIR_ORD] = ord;
}

/// Generates a numbered short name `~N` for a colliding long name. After
/// five collisions the tail switches to a CRC of the long name so the
/// search does not degenerate.
pub(crate) fn gen_numname(dst: &mut [u8; 12], src: &[u8; 12], lfn: &[u16], seq: u32) {
    dst[..11].copy_from_slice(&src[..11]);

    let mut seq = seq;
    if seq > 5 {
        // Many collisions: derive the tail from a CRC of the long name.
        let mut sr = seq;
        let mut k = 0;
        while lfn[k] != 0 {
            let mut wc = lfn[k] as u32;
            k += 1;
            for _ in 0..16 {
                sr = (sr << 1) + (wc & 1);
                wc >>= 1;
                if sr & 0x10000 != 0 {
                    sr ^= 0x11021;
                }
            }
        }
        seq = sr;
    }

    // itoa, hexadecimal, built backwards.
    let mut ns = [0u8; 8];
    let mut i = 7usize;
    loop {
        let mut c = (seq % 16) as u8 + b'0';
        if c > b'9' {
            c += 7;
        }
        ns[i] = c;
        i -= 1;
        seq /= 16;
        if seq == 0 {
            break;
        }
    }
    ns[i] = b'~';

    // Append the tail over the name body.
    let mut j = 0;
    while j < i && dst[j] != b' ' {
        j += 1;
    }
    loop {
        dst[j] = if i < 8 {
            let c = ns[i];
            i += 1;
            c
        } else {
            b' '
        };
        j += 1;
        if j >= 8 {
            break;
        }
    }
}

/// Builds the object name in directory form from one path component:
/// the long name in the directory's LFN buffer and the 8.3 short name
/// with its status byte in the short-name buffer.
pub(crate) fn create_name(dp: &mut Dir, cp: &CodePage, name: &str) -> Result<(), FatError> {
    // Create the LFN in UCS-2.
    let mut di = 0usize;
    for ch in name.chars() {
        let w = ch as u32;
        if w < 0x20 || w == 0x7F || w > 0xFFFF {
            return Err(FatError::InvalidName);
        }
        if w < 0x80 && ILLEGAL_LFN.contains(ch) {
            return Err(FatError::InvalidName);
        }
        if di >= MAX_LFN {
            return Err(FatError::InvalidName);
        }
        dp.lfn[di] = w as u16;
        di += 1;
    }

    let mut cf = NS_LAST;

    while di > 0 {
        // Strip trailing spaces and dots.
        let w = dp.lfn[di - 1];
        if w != b' ' as u16 && w != b'.' as u16 {
            break;
        }
        di -= 1;
    }
    if di == 0 {
        return Err(FatError::InvalidName);
    }
    dp.lfn[di] = 0;
    let lfn_len = di;

    // Create the SFN in directory form.
    dp.fname = [b' '; 12];
    dp.fname[NS] = 0;
    let mut si = 0usize;
    while si < lfn_len && (dp.lfn[si] == b' ' as u16 || dp.lfn[si] == b'.' as u16) {
        si += 1; /* strip leading spaces and dots */
    }
    if si > 0 {
        cf |= NS_LOSS | NS_LFN;
    }
    let mut di = lfn_len;
    while di > 0 && dp.lfn[di - 1] != b'.' as u16 {
        di -= 1; /* di: start of the extension (0 if none) */
    }

    let mut b = 0u32;
    let mut i = 0usize;
    let mut ni = 8usize;
    loop {
        let mut w = if si <= lfn_len { dp.lfn[si] } else { 0 };
        si += 1;
        if w == 0 {
            break;
        }

        if w == b' ' as u16 || (w == b'.' as u16 && si != di) {
            // Embedded spaces and dots are dropped from the short form.
            cf |= NS_LOSS | NS_LFN;
            continue;
        }

        if i >= ni || si == di {
            // Extension boundary or section overflow.
            if ni == 11 {
                cf |= NS_LOSS | NS_LFN;
                break;
            }
            if si != di {
                cf |= NS_LOSS | NS_LFN;
            }
            if si > di {
                break; /* no extension */
            }
            si = di;
            i = 8;
            ni = 11;
            b <<= 2;
            continue;
        }

        if w >= 0x80 {
            // Extended character: to upper-cased OEM.
            w = match char::from_u32(w as u32).and_then(|c| cp.unicode_to_oem(c)) {
                Some(oem) => cp.upper_ext(oem) as u16,
                None => 0,
            };
            cf |= NS_LFN;
        }

        if w == 0 || ILLEGAL_SFN.contains((w as u8) as char) {
            w = b'_' as u16;
            cf |= NS_LOSS | NS_LFN; /* lossy conversion */
        } else if (w as u8).is_ascii_uppercase() {
            b |= 2;
        } else if (w as u8).is_ascii_lowercase() {
            b |= 1;
            w -= 0x20;
        }
        dp.fname[i] = w as u8;
        i += 1;
    }

    if dp.fname[0] == DDE {
        dp.fname[0] = NDDE; /* 0xE5 is the deleted mark on disk */
    }

    if ni == 8 {
        b <<= 2;
    }
    if (b & 0x0C) == 0x0C || (b & 0x03) == 0x03 {
        // Mixed case in one section always needs an LFN entry.
        cf |= NS_LFN;
    }
    if cf & NS_LFN == 0 {
        // Record all-lower-case sections in the NT reserved bits.
        if (b & 0x03) == 0x01 {
            cf |= NS_EXT;
        }
        if (b & 0x0C) == 0x04 {
            cf |= NS_BODY;
        }
    }

    dp.fname[NS] = cf;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codepage::CP437;

    fn name_of(n: &str) -> ([u8; 12], alloc::vec::Vec<u16>) {
        let mut dp = Dir::new(0);
        create_name(&mut dp, &CP437, n).unwrap();
        (dp.fname, dp.lfn.clone())
    }

    #[test]
    fn test_plain_83_name() {
        let (fname, _) = name_of("HELLO.TXT");
        assert_eq!(&fname[..11], b"HELLO   TXT");
        assert_eq!(fname[NS] & (NS_LOSS | NS_LFN), 0);
    }

    #[test]
    fn test_lower_case_sets_nt_bits() {
        let (fname, _) = name_of("hello.txt");
        assert_eq!(&fname[..11], b"HELLO   TXT");
        assert_eq!(fname[NS] & NS_LFN, 0);
        assert!(fname[NS] & NS_BODY != 0);
        assert!(fname[NS] & NS_EXT != 0);
    }

    #[test]
    fn test_mixed_case_needs_lfn() {
        let (fname, _) = name_of("Hello.txt");
        assert_eq!(&fname[..11], b"HELLO   TXT");
        assert!(fname[NS] & NS_LFN != 0);
        assert_eq!(fname[NS] & NS_LOSS, 0);
    }

    #[test]
    fn test_long_name_is_lossy() {
        let (fname, _) = name_of("My Long Name.txt");
        assert_eq!(&fname[..11], b"MYLONGNATXT");
        assert!(fname[NS] & NS_LOSS != 0);
        assert!(fname[NS] & NS_LFN != 0);
    }

    #[test]
    fn test_illegal_characters() {
        let mut dp = Dir::new(0);
        assert_eq!(
            create_name(&mut dp, &CP437, "bad:name").unwrap_err(),
            FatError::InvalidName
        );
        assert_eq!(
            create_name(&mut dp, &CP437, "...").unwrap_err(),
            FatError::InvalidName
        );
        // SFN-illegal but LFN-legal characters are replaced, not rejected.
        create_name(&mut dp, &CP437, "a+b").unwrap();
        assert_eq!(&dp.fname[..11], b"A_B        ");
        assert!(dp.fname[NS] & NS_LOSS != 0);
    }

    #[test]
    fn test_deleted_mark_first_byte() {
        // A first byte of 0xE5 must not collide with the deleted mark;
        // σ converts to 0xE5 in CP437.
        let mut dp = Dir::new(0);
        create_name(&mut dp, &CP437, "σx").unwrap();
        assert_eq!(dp.fname[0], NDDE);
    }

    #[test]
    fn test_numbered_names() {
        let (base, lfn) = name_of("My Long Name.txt");
        let mut n1 = [0u8; 12];
        let mut n2 = [0u8; 12];
        gen_numname(&mut n1, &base, &lfn, 1);
        gen_numname(&mut n2, &base, &lfn, 2);
        assert_eq!(&n1[..11], b"MYLONG~1TXT");
        assert_eq!(&n2[..11], b"MYLONG~2TXT");

        // Beyond five collisions the tail is CRC-derived.
        let mut n7 = [0u8; 12];
        gen_numname(&mut n7, &base, &lfn, 7);
        assert_eq!(n7[..11].iter().filter(|&&c| c == b'~').count(), 1);
        assert_ne!(&n7[..11], &n2[..11]);
        assert_eq!(&n7[8..11], b"TXT");
    }

    #[test]
    fn test_sfn_checksum() {
        // Reference value computed with the rotate-right recurrence.
        let sum = sum_sfn(b"MYLONG~1TXT");
        let mut expect = 0u8;
        for &c in b"MYLONG~1TXT" {
            expect = (expect >> 1).wrapping_add(expect << 7).wrapping_add(c);
        }
        assert_eq!(sum, expect);
    }

    #[test]
    fn test_fit_pick_roundtrip() {
        let (fname, lfn) = name_of("My Long Name.txt");
        let sum = sum_sfn(&fname);

        // "My Long Name.txt" is 16 chars: two LFN entries.
        let mut e1 = [0u8; 32];
        let mut e2 = [0u8; 32];
        fit_lfn(&lfn, &mut e2, 2, sum);
        fit_lfn(&lfn, &mut e1, 1, sum);
        assert!(e2[LDIR_ORD] & LLE != 0);
        assert_eq!(e1[LDIR_ORD], 1);
        assert_eq!(e1[LDIR_CHKSUM], sum);

        let mut picked = alloc::vec![0u16; MAX_LFN + 1];
        assert!(pick_lfn(&mut picked, &e1));
        assert!(pick_lfn(&mut picked, &e2));
        let got: alloc::string::String = picked
            .iter()
            .take_while(|&&w| w != 0)
            .map(|&w| char::from_u32(w as u32).unwrap())
            .collect();
        assert_eq!(got, "My Long Name.txt");

        assert!(cmp_lfn(&lfn, &e1));
        assert!(cmp_lfn(&lfn, &e2));
    }
}
