//! Directory Handshake (spec.md §4.4, §6.2) and its loopback backend.
//!
//! The real directory is a hypervisor-backed hierarchical key/value store
//! (xenstore); the server publishes `ring-ref` and `event-channel` under
//! `data/vchan/<devno>/` with peer-read permission, and the client reads
//! them from the server's subtree. Loopback stands this up with flat
//! files under `<runtime>/data/vchan/<devno>/`, written as decimal ASCII
//! with no trailing newline per §6.2, with Unix file modes approximating
//! (not enforcing — loopback has a single Unix user) the owner-full/
//! peer-read/others-none permission triple.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;

use crate::error::{VchanError, VchanResult};
use crate::grant::RuntimeDir;

const RING_REF_KEY: &str = "ring-ref";
const EVENT_CHANNEL_KEY: &str = "event-channel";

/// Owner-full, peer-read, others-none: the closest a single-user loopback
/// host can get to the real permission triple.
const ENTRY_MODE: u32 = 0o640;

fn device_dir(dir: &RuntimeDir, devno: u32) -> PathBuf {
    dir.path().join("data").join("vchan").join(devno.to_string())
}

/// Server-side directory publication.
pub struct DirectoryServer {
    dir: PathBuf,
}

impl DirectoryServer {
    /// Creates (or reuses) `data/vchan/<devno>/` under the runtime dir.
    pub fn new(runtime: &RuntimeDir, devno: u32) -> VchanResult<Self> {
        let dir = device_dir(runtime, devno);
        fs::create_dir_all(&dir).map_err(VchanError::Io)?;
        Ok(Self { dir })
    }

    /// Publishes both handshake entries. Must happen only after grant
    /// allocation and event binding have both succeeded (spec.md §4.3
    /// step ordering): the client must never observe a published ring-ref
    /// for a page that isn't fully initialized yet.
    pub fn publish(&self, ring_ref: u32, event_port: u32) -> VchanResult<()> {
        write_entry(&self.dir.join(RING_REF_KEY), ring_ref)?;
        write_entry(&self.dir.join(EVENT_CHANNEL_KEY), event_port)?;
        Ok(())
    }

    /// Removes both entries, called during close so a later server
    /// restart on the same device number doesn't see stale data.
    pub fn withdraw(&self) {
        let _ = fs::remove_file(self.dir.join(RING_REF_KEY));
        let _ = fs::remove_file(self.dir.join(EVENT_CHANNEL_KEY));
    }
}

fn write_entry(path: &std::path::Path, value: u32) -> VchanResult<()> {
    fs::write(path, value.to_string()).map_err(VchanError::Io)?;
    let perms = fs::Permissions::from_mode(ENTRY_MODE);
    fs::set_permissions(path, perms).map_err(VchanError::Io)?;
    Ok(())
}

/// Client-side directory lookup.
pub struct DirectoryClient;

impl DirectoryClient {
    /// Reads both entries for `devno`. Aborts if either is missing or
    /// parses to zero, matching `libvchan_client_init`'s handshake
    /// validation.
    pub fn read(runtime: &RuntimeDir, devno: u32) -> VchanResult<(u32, u32)> {
        let dir = device_dir(runtime, devno);
        let ring_ref = read_entry(&dir, RING_REF_KEY, devno)?;
        let event_port = read_entry(&dir, EVENT_CHANNEL_KEY, devno)?;
        Ok((ring_ref, event_port))
    }
}

fn read_entry(dir: &std::path::Path, key: &'static str, devno: u32) -> VchanResult<u32> {
    let path = dir.join(key);
    let raw = fs::read_to_string(&path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            VchanError::DirectoryLookup {
                devno,
                reason: "entry missing",
            }
        } else {
            VchanError::Io(e)
        }
    })?;
    let value: u32 = raw.trim().parse().map_err(|_| VchanError::DirectoryLookup {
        devno,
        reason: "entry not a valid integer",
    })?;
    if value == 0 {
        return Err(VchanError::DirectoryLookup {
            devno,
            reason: "entry is zero",
        });
    }
    Ok(value)
}
