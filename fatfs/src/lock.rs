//! # Open-file Lock Table
//!
//! A fixed-capacity table of open objects keyed by volume, directory
//! cluster, and entry index. The counter encodes the open state: 0 is
//! free, 1..=0xFF is the reader count, 0x100 marks a writer. At most one
//! writer may hold an object and no new opener is admitted while a
//! writer is present.
//!
//! The table is global, but every mutation happens while the caller
//! holds the owning volume's mutex.

use spin::Mutex;

use crate::dir::DirPos;
use crate::FatError;

/// Capacity of the lock table; bounds concurrent opens across volumes.
pub const FS_LOCK: usize = 32;

/// Writer marker in the counter.
const CTR_WRITE: u16 = 0x100;

#[derive(Clone, Copy)]
struct FileSem {
    /// Owning volume mount id; 0 marks a blank entry
    vol: u32,
    /// Directory start cluster of the object
    clu: u32,
    /// Directory index of the object
    idx: u16,
    /// Open counter
    ctr: u16,
}

const BLANK: FileSem = FileSem {
    vol: 0,
    clu: 0,
    idx: 0,
    ctr: 0,
};

static FILES: Mutex<[FileSem; FS_LOCK]> = Mutex::new([BLANK; FS_LOCK]);

/// Checks whether the object can be accessed.
/// `acc` is the desired access: 0 read, 1 write, 2 delete/rename.
pub(crate) fn chk_lock(vol: u32, pos: &DirPos, acc: i32) -> Result<(), FatError> {
    let files = FILES.lock();

    let mut blank = false;
    let mut found = None;
    for sem in files.iter() {
        if sem.vol != 0 {
            if sem.vol == vol && sem.clu == pos.sclust && sem.idx == pos.index {
                found = Some(sem);
                break;
            }
        } else {
            blank = true;
        }
    }

    match found {
        None => {
            // Not opened. A new open will need a blank entry.
            if blank || acc == 2 {
                Ok(())
            } else {
                Err(FatError::TooManyOpenFiles)
            }
        }
        Some(sem) => {
            // Opened. Reject a writer, and any open against a writer.
            if acc != 0 || sem.ctr == CTR_WRITE {
                Err(FatError::Locked)
            } else {
                Ok(())
            }
        }
    }
}

/// True if a blank entry is available for a new object.
pub(crate) fn enq_lock() -> bool {
    FILES.lock().iter().any(|sem| sem.vol == 0)
}

/// Registers or bumps the open counter of an object and returns its slot
/// number plus one. Returns 0 on an access violation or a full table.
pub(crate) fn inc_lock(vol: u32, pos: &DirPos, acc: i32) -> usize {
    let mut files = FILES.lock();

    let mut i = files
        .iter()
        .position(|sem| sem.vol == vol && sem.clu == pos.sclust && sem.idx == pos.index);

    if i.is_none() {
        // Not opened: register the object in a blank slot.
        let blank = match files.iter().position(|sem| sem.vol == 0) {
            Some(b) => b,
            None => return 0,
        };
        files[blank] = FileSem {
            vol,
            clu: pos.sclust,
            idx: pos.index,
            ctr: 0,
        };
        i = Some(blank);
    }

    let i = i.unwrap();
    if acc != 0 && files[i].ctr != 0 {
        return 0; /* access violation */
    }

    files[i].ctr = if acc != 0 { CTR_WRITE } else { files[i].ctr + 1 };

    i + 1
}

/// Decrements the open counter of slot `i` (as returned by `inc_lock`).
pub(crate) fn dec_lock(i: usize) -> Result<(), FatError> {
    if i == 0 || i > FS_LOCK {
        return Err(FatError::IntErr);
    }
    let mut files = FILES.lock();
    let sem = &mut files[i - 1];

    let mut n = sem.ctr;
    if n == CTR_WRITE {
        n = 0;
    }
    if n > 0 {
        n -= 1;
    }
    sem.ctr = n;
    if n == 0 {
        sem.vol = 0; /* free the slot */
    }

    Ok(())
}

/// Clears every slot owned by a volume. Called on mount and unmount.
pub(crate) fn clear_lock(vol: u32) {
    let mut files = FILES.lock();
    for sem in files.iter_mut() {
        if sem.vol == vol {
            sem.vol = 0;
            sem.ctr = 0;
        }
    }
}

/// Reader/writer counter of an object, for diagnostics and tests.
pub(crate) fn lock_count(vol: u32, pos: &DirPos) -> u16 {
    FILES
        .lock()
        .iter()
        .find(|sem| sem.vol == vol && sem.clu == pos.sclust && sem.idx == pos.index)
        .map(|sem| sem.ctr)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pos(idx: u16) -> DirPos {
        DirPos { sclust: 7, index: idx }
    }

    // Distinct volume ids per test keep the global table disjoint when
    // the harness runs tests in parallel.

    #[test]
    fn test_reader_counting() {
        let vol = 0xA001;
        let p = pos(1);
        chk_lock(vol, &p, 0).unwrap();
        let s1 = inc_lock(vol, &p, 0);
        let s2 = inc_lock(vol, &p, 0);
        assert_eq!(s1, s2);
        assert_eq!(lock_count(vol, &p), 2);

        dec_lock(s1).unwrap();
        assert_eq!(lock_count(vol, &p), 1);
        dec_lock(s2).unwrap();
        assert_eq!(lock_count(vol, &p), 0);
    }

    #[test]
    fn test_writer_exclusion() {
        let vol = 0xA002;
        let p = pos(2);
        let s = inc_lock(vol, &p, 1);
        assert!(s != 0);
        assert_eq!(lock_count(vol, &p), CTR_WRITE);

        // No opener of any kind is admitted against a writer.
        assert_eq!(chk_lock(vol, &p, 0), Err(FatError::Locked));
        assert_eq!(chk_lock(vol, &p, 1), Err(FatError::Locked));
        assert_eq!(inc_lock(vol, &p, 1), 0);

        dec_lock(s).unwrap();
        assert_eq!(lock_count(vol, &p), 0);
    }

    #[test]
    fn test_no_writer_against_readers() {
        let vol = 0xA003;
        let p = pos(3);
        let s = inc_lock(vol, &p, 0);
        assert_eq!(chk_lock(vol, &p, 1), Err(FatError::Locked));
        assert_eq!(chk_lock(vol, &p, 2), Err(FatError::Locked));
        dec_lock(s).unwrap();
    }

    #[test]
    fn test_clear_lock_drops_volume_slots() {
        let vol = 0xA004;
        let s = inc_lock(vol, &pos(4), 0);
        assert!(s != 0);
        clear_lock(vol);
        assert_eq!(lock_count(vol, &pos(4)), 0);
    }

    #[test]
    fn test_dec_lock_bad_index() {
        assert_eq!(dec_lock(0), Err(FatError::IntErr));
        assert_eq!(dec_lock(FS_LOCK + 1), Err(FatError::IntErr));
    }
}
