//! Event Notifier (spec.md §4.2) and its loopback backend.
//!
//! The real backend is a hypervisor event channel: `bind_server`/
//! `bind_client` obtain ports, `notify` fires an `ioctl`, `wait` blocks on
//! a read of the bound event fd. Loopback stands this up with a pair of
//! named FIFOs under the runtime directory, one per direction, so two
//! endpoints in the same host (even across processes) can wake each
//! other without a hypervisor.
//!
//! `wait`'s contract is preserved across backends even though the
//! mechanics differ: the original reads a 4-byte port value from the
//! event fd and immediately writes it back to re-arm (matching the kernel
//! driver's level-to-edge convention). A FIFO has no such re-arm step —
//! each written byte is consumed exactly once — so the loopback `wait`
//! only performs the read half; there is nothing to write back because
//! the FIFO is already armed for the next `notify`.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::fs::FileTypeExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};

use crate::error::{VchanError, VchanResult};
use crate::grant::RuntimeDir;

/// A bound event port, analogous to the integer the hypervisor hands back
/// from `IOCTL_EVTCHN_BIND_UNBOUND_PORT`/`IOCTL_EVTCHN_BIND_INTERDOMAIN`.
/// Published through the directory handshake as decimal ASCII.
pub type EventPort = u32;

/// Loopback event channel: a pair of FIFOs under `<runtime>/events/<devno>`,
/// one carrying server->client wakeups and the other client->server.
pub struct LoopbackEventChannel {
    /// The fd this side reads from to `wait`.
    read_fifo: File,
    /// The fd this side writes to to `notify`.
    write_fifo: File,
    port: EventPort,
}

fn events_dir(dir: &RuntimeDir, devno: u32) -> PathBuf {
    dir.path().join("events").join(devno.to_string())
}

fn ensure_fifo(path: &Path) -> io::Result<()> {
    if path.exists() {
        return Ok(());
    }
    // SAFETY: mkfifo is a plain syscall; failure is surfaced via errno.
    let c_path = std::ffi::CString::new(path.as_os_str().as_encoded_bytes()).unwrap();
    let rc = unsafe { libc::mkfifo(c_path.as_ptr(), 0o600) };
    if rc != 0 {
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::AlreadyExists {
            return Err(err);
        }
    }
    Ok(())
}

impl LoopbackEventChannel {
    /// Server side: creates both FIFOs for `devno` and binds port 1 for
    /// the server->client direction (mirrors `init_evt_srv`'s unbound-port
    /// allocation).
    pub fn bind_server(dir: &RuntimeDir, devno: u32) -> VchanResult<Self> {
        let edir = events_dir(dir, devno);
        std::fs::create_dir_all(&edir).map_err(VchanError::Io)?;
        let to_client = edir.join("to-client");
        let to_server = edir.join("to-server");
        ensure_fifo(&to_client).map_err(VchanError::Io)?;
        ensure_fifo(&to_server).map_err(VchanError::Io)?;

        let write_fifo = open_fifo_nonblocking_write(&to_client)?;
        let read_fifo = open_fifo_read(&to_server)?;

        Ok(Self {
            read_fifo,
            write_fifo,
            port: 1,
        })
    }

    /// Client side: binds against the server's already-created FIFOs
    /// (mirrors `init_evt_cli`'s `IOCTL_EVTCHN_BIND_INTERDOMAIN`).
    pub fn bind_client(dir: &RuntimeDir, devno: u32, remote_port: EventPort) -> VchanResult<Self> {
        let edir = events_dir(dir, devno);
        let to_client = edir.join("to-client");
        let to_server = edir.join("to-server");

        let read_fifo = open_fifo_read(&to_client)?;
        let write_fifo = open_fifo_nonblocking_write(&to_server)?;

        Ok(Self {
            read_fifo,
            write_fifo,
            port: remote_port,
        })
    }

    /// Port this side is bound to (purely informational for loopback,
    /// since FIFOs carry no port number on the wire).
    #[must_use]
    pub fn port(&self) -> EventPort {
        self.port
    }

    /// An independent handle to this side's outbound fifo, for the
    /// unmap-notify watchdog thread to fire a wake-up without needing
    /// shared access to the whole `LoopbackEventChannel`.
    pub fn try_clone_notifier(&self) -> io::Result<File> {
        self.write_fifo.try_clone()
    }

    /// Fires one wake-up for the peer.
    pub fn notify(&mut self) -> VchanResult<()> {
        self.write_fifo
            .write_all(&[1u8])
            .map_err(VchanError::Io)?;
        Ok(())
    }

    /// Blocks until a wake-up arrives. Spurious wake-ups are acceptable
    /// per spec.md §4.2; the loopback backend never produces any, but
    /// callers must not depend on that.
    pub fn wait(&mut self) -> VchanResult<()> {
        let mut buf = [0u8; 1];
        self.read_fifo.read_exact(&mut buf).map_err(VchanError::Io)?;
        Ok(())
    }

    /// Raw fd a caller can fold into their own `select`/`poll` loop.
    #[must_use]
    pub fn fd_for_select(&self) -> RawFd {
        self.read_fifo.as_raw_fd()
    }
}

fn open_fifo_read(path: &Path) -> VchanResult<File> {
    OpenOptions::new()
        .read(true)
        .write(true) // keep a writer open so reads never see EOF between notifies
        .open(path)
        .map_err(VchanError::Io)
}

fn open_fifo_nonblocking_write(path: &Path) -> VchanResult<File> {
    OpenOptions::new()
        .write(true)
        .read(true)
        .open(path)
        .map_err(VchanError::Io)
}

/// Confirms a path really is the FIFO loopback expects, used by tests and
/// by defensive setup code that re-attaches to an existing runtime dir.
#[must_use]
pub fn is_fifo(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|m| m.file_type().is_fifo())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_client_notify_roundtrip() {
        let dir = RuntimeDir::new(tempfile::tempdir().unwrap().into_path());
        let mut server = LoopbackEventChannel::bind_server(&dir, 0).unwrap();
        let mut client = LoopbackEventChannel::bind_client(&dir, 0, server.port()).unwrap();

        server.notify().unwrap();
        client.wait().unwrap();

        client.notify().unwrap();
        server.wait().unwrap();
    }

    #[test]
    fn fifo_paths_are_real_fifos() {
        let dir = RuntimeDir::new(tempfile::tempdir().unwrap().into_path());
        let _server = LoopbackEventChannel::bind_server(&dir, 3).unwrap();
        let edir = events_dir(&dir, 3);
        assert!(is_fifo(&edir.join("to-client")));
        assert!(is_fifo(&edir.join("to-server")));
    }
}
