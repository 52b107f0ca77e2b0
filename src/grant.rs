//! Grant / Mapping Layer (spec.md §4.3, §6.3) and its loopback backend.
//!
//! The real driver surface this abstracts is a hypervisor grant table:
//! "allocate k writable grants for peer P, map them contiguously" on the
//! server side, "map grants G from peer P" on the client side, with an
//! optional unmap-notify hook. Loopback stands in for that hardware with
//! plain files under a shared runtime directory, mapped with `memmap2`;
//! "peer P" is trusted by convention rather than enforced, which is the
//! loopback backend's one fidelity gap against a real grant table.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use memmap2::MmapMut;

use crate::error::{VchanError, VchanResult};

/// An owned mapping of one or more contiguous grant-backed pages. Dropping
/// it unmaps the region; this is the `Mapped` arm of the `RingStorage`
/// tagged variant (spec.md §9).
pub struct MappedRegion {
    mmap: MmapMut,
    /// Grant refs this region was built from, in order.
    pub refs: Vec<u32>,
}

impl MappedRegion {
    /// Raw pointer to the start of the mapping.
    #[must_use]
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.mmap.as_mut_ptr()
    }

    /// Length of the mapping in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    /// Whether the mapping is empty (never true for a real grant region,
    /// kept for clippy's `len_without_is_empty`).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }
}

/// Liveness flag flipped by the unmap-notify watchdog (SPEC_FULL.md §B).
/// Shared between a `GrantHandle` and the background thread that watches
/// for the peer's grant file disappearing.
#[derive(Clone)]
pub struct UnmapNotifyFlag(Arc<AtomicBool>);

impl UnmapNotifyFlag {
    fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    /// True once the watchdog has observed an abnormal unmap.
    #[must_use]
    pub fn fired(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn fire(&self) {
        self.0.store(true, Ordering::Release);
    }
}

/// Root directory under which loopback grants, directory entries and event
/// FIFOs are created. Analogous to `/dev/xen/gntalloc` + xenstore's root
/// both being reachable from a single well-known mount in the real
/// backend.
#[derive(Clone)]
pub struct RuntimeDir(Arc<PathBuf>);

impl RuntimeDir {
    /// Wraps an existing directory (typically a `tempfile::TempDir` path in
    /// tests, or a fixed path in production use).
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(Arc::new(path.into()))
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.0
    }

    fn grants_dir(&self) -> PathBuf {
        self.0.join("grants")
    }

    fn grant_path(&self, ref_: u32) -> PathBuf {
        self.grants_dir().join(ref_.to_string())
    }
}

/// The loopback grant backend: allocates named files as grants, maps them
/// with `memmap2`, and spawns the watchdog thread that stands in for a
/// real `UNMAP_NOTIFY_CLEAR_BYTE | UNMAP_NOTIFY_SEND_EVENT` hook.
pub struct LoopbackGrantBackend {
    dir: RuntimeDir,
    next_ref: std::sync::atomic::AtomicU32,
}

impl LoopbackGrantBackend {
    /// Opens (creating if needed) the grants subdirectory under `dir`.
    pub fn new(dir: RuntimeDir) -> io::Result<Self> {
        std::fs::create_dir_all(dir.grants_dir())?;
        Ok(Self {
            dir,
            next_ref: std::sync::atomic::AtomicU32::new(1),
        })
    }

    fn alloc_ref(&self) -> u32 {
        self.next_ref.fetch_add(1, Ordering::Relaxed)
    }

    /// Allocates and maps `pages` contiguous writable pages, returning
    /// their grant refs and the mapping. Mirrors `init_gnt_srv`'s
    /// `IOCTL_GNTALLOC_ALLOC_GREF` + `mmap` pair.
    pub fn alloc(&self, pages: usize) -> VchanResult<(Vec<u32>, MappedRegion)> {
        let len = pages * crate::config::PAGE_SIZE;
        let refs: Vec<u32> = (0..pages).map(|_| self.alloc_ref()).collect();

        // A contiguous mapping backed by one file spanning all pages; refs
        // beyond the first are bookkeeping only (loopback has no separate
        // page-granularity grant table), but each page still gets its own
        // file so concurrent peers cannot conflate grant identities.
        let first = &refs[0];
        let path = self.dir.grant_path(*first);
        let file = create_grant_file(&path, len)?;
        for r in &refs[1..] {
            // Placeholder sibling files so grant refs remain distinct and
            // discoverable; the actual bytes live in the first file's
            // mapping.
            let _ = create_grant_file(&self.dir.grant_path(*r), 0);
        }

        let mmap = unsafe { MmapMut::map_mut(&file) }
            .map_err(|e| VchanError::Grant { op: "alloc", reason: e.to_string() })?;

        let region = MappedRegion {
            mmap,
            refs: refs.clone(),
        };
        Ok((refs, region))
    }

    /// Maps grant refs previously allocated (and advertised) by a peer.
    /// Mirrors `do_gnt_map` + `IOCTL_GNTDEV_MAP_GRANT_REF`.
    pub fn import(&self, refs: &[u32]) -> VchanResult<MappedRegion> {
        if refs.is_empty() {
            return Err(VchanError::Grant {
                op: "import",
                reason: "empty grant list".into(),
            });
        }
        let path = self.dir.grant_path(refs[0]);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| VchanError::Grant { op: "import", reason: e.to_string() })?;
        let mmap = unsafe { MmapMut::map_mut(&file) }
            .map_err(|e| VchanError::Grant { op: "import", reason: e.to_string() })?;
        Ok(MappedRegion {
            mmap,
            refs: refs.to_vec(),
        })
    }

    /// Installs the unmap-notify watchdog: polls for the grant file backing
    /// `watched_ref` disappearing and fires `on_unmap` once, exactly one
    /// time, when it does. This is the documented lower-fidelity fallback
    /// spec.md §9 allows when the backend lacks a true kernel unmap hook.
    #[must_use]
    pub fn install_unmap_notify<F>(&self, watched_ref: u32, on_unmap: F) -> UnmapNotifyFlag
    where
        F: Fn() + Send + 'static,
    {
        let flag = UnmapNotifyFlag::new();
        let path = self.dir.grant_path(watched_ref);
        let flag_clone = flag.clone();
        std::thread::spawn(move || {
            loop {
                if !path.exists() {
                    on_unmap();
                    flag_clone.fire();
                    return;
                }
                std::thread::sleep(std::time::Duration::from_millis(20));
            }
        });
        flag
    }

    /// Releases a grant by removing its backing file, the loopback
    /// equivalent of the grant table entry being freed on `close`.
    pub fn release(&self, ref_: u32) -> io::Result<()> {
        let path = self.dir.grant_path(ref_);
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

fn create_grant_file(path: &Path, len: usize) -> io::Result<File> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    if len > 0 {
        file.set_len(len as u64)?;
    }
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_then_import_see_same_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LoopbackGrantBackend::new(RuntimeDir::new(dir.path())).unwrap();
        let (refs, mut region) = backend.alloc(1).unwrap();
        // SAFETY: region owns PAGE_SIZE valid bytes.
        unsafe {
            *region.as_mut_ptr() = 0x42;
        }
        drop(region);

        let imported = backend.import(&refs).unwrap();
        assert_eq!(imported.mmap[0], 0x42);
    }

    #[test]
    fn release_removes_grant_file() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LoopbackGrantBackend::new(RuntimeDir::new(dir.path())).unwrap();
        let (refs, region) = backend.alloc(1).unwrap();
        drop(region);
        backend.release(refs[0]).unwrap();
        assert!(backend.import(&refs).is_err());
    }

    #[test]
    fn unmap_notify_fires_on_release() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LoopbackGrantBackend::new(RuntimeDir::new(dir.path())).unwrap();
        let (refs, region) = backend.alloc(1).unwrap();
        drop(region);
        let fired = Arc::new(AtomicBool::new(false));
        let fired_clone = fired.clone();
        let flag = backend.install_unmap_notify(refs[0], move || {
            fired_clone.store(true, Ordering::Release);
        });
        backend.release(refs[0]).unwrap();
        for _ in 0..200 {
            if flag.fired() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert!(flag.fired());
        assert!(fired.load(Ordering::Acquire));
    }
}
