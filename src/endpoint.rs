//! Endpoint control record, lifecycle and the four I/O primitives
//! (spec.md §3.2, §3.3, §4.5, §4.6).

use std::io::Write as _;
use std::sync::atomic::Ordering;

use crate::config::{self, MAX_ORDER, MIN_ORDER};
use crate::directory::{DirectoryClient, DirectoryServer};
use crate::error::{VchanError, VchanResult};
use crate::grant::{LoopbackGrantBackend, MappedRegion, RuntimeDir, UnmapNotifyFlag};
use crate::notifier::LoopbackEventChannel;
use crate::page::{
    cli_live, srv_live, RingIndices, SharedPage, DEBUG_MAGIC_CLIENT, DEBUG_MAGIC_SERVER,
};
use crate::ring::{Ring, RingStorage};

/// Which side of the channel this endpoint is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The side that allocated and exported the shared page.
    Server {
        /// Whether the server survives a client disconnect (`is_open`
        /// keeps reporting true so a new client may attach).
        persist: bool,
    },
    /// The side that imported the shared page.
    Client,
}

/// Coarse view of the state machine in spec.md §4.5. Derived from the
/// liveness bytes and ring occupancy rather than tracked separately, so it
/// can never drift from the ground truth on the shared page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    /// Server has initialized the page; no client has attached yet.
    SrvWaitClient,
    /// Both sides are live.
    Connected,
    /// Peer's liveness byte observed 0 but this ring still has data to
    /// drain.
    HalfClosed,
    /// Peer closed and this ring (if any) has drained.
    Closed,
}

/// An owned endpoint: either a server or a client half of one vchan.
pub struct Endpoint {
    role: Role,
    peer: u32,
    devno: u32,
    blocking: bool,
    page: SharedPage,
    /// Keeps the shared page's mapping alive; `page` points into this.
    page_region: Option<MappedRegion>,
    /// Ring this side reads from. `None` only after `close`.
    read: Option<Ring>,
    /// Ring this side writes to. `None` only after `close`.
    write: Option<Ring>,
    events: Option<LoopbackEventChannel>,
    grants: LoopbackGrantBackend,
    runtime: RuntimeDir,
    directory: Option<DirectoryServer>,
    page_ref: u32,
    unmap_watch: Option<UnmapNotifyFlag>,
    closed: bool,
}

fn validate_orders(left_order: u16, right_order: u16) -> VchanResult<()> {
    for order in [left_order, right_order] {
        if !(MIN_ORDER..=MAX_ORDER).contains(&order) {
            return Err(VchanError::InvalidOrder("order out of 10..=24 range"));
        }
    }
    if left_order == right_order && left_order < 12 {
        return Err(VchanError::InvalidOrder(
            "both rings request the same small order",
        ));
    }
    Ok(())
}

fn ring_in_page_offset(order: u16) -> Option<usize> {
    match order {
        10 => Some(config::SMALL_RING_OFFSET),
        11 => Some(config::LARGE_RING_OFFSET),
        _ => None,
    }
}

/// Allocates storage for a server-owned ring: in-page for order 10/11,
/// otherwise fresh grants written into the header's grant list starting
/// at `grant_start`.
fn alloc_ring_storage(
    grants: &LoopbackGrantBackend,
    page: &SharedPage,
    order: u16,
    grant_start: usize,
) -> VchanResult<(*mut u8, RingStorage)> {
    if let Some(offset) = ring_in_page_offset(order) {
        // SAFETY: offset + (1 << order) <= PAGE_SIZE for order 10/11.
        let ptr = unsafe { page.base_ptr().add(offset) };
        return Ok((ptr, RingStorage::InPage { offset }));
    }
    let pages = config::pages_for_order(order);
    let (refs, mut region) = grants.alloc(pages)?;
    page.write_grants(grant_start, &refs);
    let ptr = region.as_mut_ptr();
    Ok((ptr, RingStorage::Mapped { handle: region }))
}

/// Imports storage for a client-side ring, mirroring
/// [`alloc_ring_storage`] but reading refs back out of the header instead
/// of allocating fresh ones.
fn import_ring_storage(
    grants: &LoopbackGrantBackend,
    page: &SharedPage,
    order: u16,
    grant_start: usize,
) -> VchanResult<(*mut u8, RingStorage)> {
    if let Some(offset) = ring_in_page_offset(order) {
        // SAFETY: see alloc_ring_storage.
        let ptr = unsafe { page.base_ptr().add(offset) };
        return Ok((ptr, RingStorage::InPage { offset }));
    }
    let pages = config::pages_for_order(order);
    let refs = page.read_grants(grant_start, pages);
    let mut region = grants.import(&refs)?;
    let ptr = region.as_mut_ptr();
    Ok((ptr, RingStorage::Mapped { handle: region }))
}

impl Endpoint {
    /// Server side of `server-init(peer, devno, read_min, write_min)`
    /// (spec.md §4.3, §4.4). `runtime` selects the loopback backend's
    /// shared directory; a deployment with a real grant/event/xenstore
    /// backend would not need this parameter.
    pub fn server_init(
        runtime: RuntimeDir,
        peer: u32,
        devno: u32,
        read_min: usize,
        write_min: usize,
        persist: bool,
    ) -> VchanResult<Self> {
        let orders = config::negotiate_server_orders(read_min, write_min)?;
        let grants = LoopbackGrantBackend::new(runtime.clone()).map_err(VchanError::Io)?;

        // Steps 1-2: allocate and map the shared page.
        let (page_refs, mut page_region) = grants.alloc(1)?;
        let page_ref = page_refs[0];
        let page = unsafe { SharedPage::new(page_region.as_mut_ptr()) };
        page.zero();

        // Step 3: populate the header.
        {
            let hdr = page.header();
            hdr.left_order.store(orders.read_order, Ordering::Relaxed);
            hdr.right_order.store(orders.write_order, Ordering::Relaxed);
            hdr.cli_live
                .store(cli_live::NOT_YET_CONNECTED, Ordering::Release);
            hdr.srv_live.store(srv_live::CONNECTED, Ordering::Release);
            hdr.debug.store(DEBUG_MAGIC_SERVER, Ordering::Release);
        }

        let mut events = LoopbackEventChannel::bind_server(&runtime, devno)?;
        let event_port = events.port();

        // Step 4: unmap-notify hook on srv_live, installed before the
        // directory is published so a client can never race ahead of it.
        let notify_file = events.try_clone_notifier().map_err(VchanError::Io)?;
        let base_addr = page.base_ptr() as usize;
        let unmap_watch = grants.install_unmap_notify(page_ref, move || {
            // SAFETY: base_addr was derived from a live mapping owned by
            // this endpoint; the watchdog only ever fires while that
            // mapping is still valid memory (it may be logically closed,
            // but the pages remain mapped until Endpoint::close unmaps
            // them).
            let page = unsafe { SharedPage::new(base_addr as *mut u8) };
            page.header()
                .srv_live
                .store(srv_live::CLOSED, Ordering::Release);
            let mut f = &notify_file;
            let _ = f.write_all(&[1u8]);
        });

        // Steps 5-6: place the two rings.
        let pages_left = config::pages_for_order(orders.read_order);
        let (left_ptr, left_storage) =
            alloc_ring_storage(&grants, &page, orders.read_order, 0)?;
        let (right_ptr, right_storage) =
            alloc_ring_storage(&grants, &page, orders.write_order, pages_left)?;

        let left_indices: *const RingIndices = &page.header().left;
        let right_indices: *const RingIndices = &page.header().right;
        // SAFETY: left_ptr/right_ptr and left_indices/right_indices all
        // point into memory owned by page_region or the grant regions
        // just allocated, both of which this Endpoint keeps alive.
        let read = unsafe { Ring::new(left_indices, left_ptr, orders.read_order, left_storage) };
        let write =
            unsafe { Ring::new(right_indices, right_ptr, orders.write_order, right_storage) };

        // Step 7 (directory publication) happens last, only once
        // everything above has succeeded.
        let directory = DirectoryServer::new(&runtime, devno)?;
        directory.publish(page_ref, event_port)?;

        Ok(Self {
            role: Role::Server { persist },
            peer,
            devno,
            blocking: true,
            page,
            page_region: Some(page_region),
            read: Some(read),
            write: Some(write),
            events: Some(events),
            grants,
            runtime,
            directory: Some(directory),
            page_ref,
            unmap_watch: Some(unmap_watch),
            closed: false,
        })
    }

    /// Client side of `client-init(peer, devno)` (spec.md §4.3, §4.4).
    pub fn client_init(runtime: RuntimeDir, peer: u32, devno: u32) -> VchanResult<Self> {
        let grants = LoopbackGrantBackend::new(runtime.clone()).map_err(VchanError::Io)?;
        let (ring_ref, event_port) = DirectoryClient::read(&runtime, devno)?;

        let mut page_region = grants.import(&[ring_ref])?;
        let page = unsafe { SharedPage::new(page_region.as_mut_ptr()) };

        let (left_order, right_order) = {
            let hdr = page.header();
            (
                hdr.left_order.load(Ordering::Acquire),
                hdr.right_order.load(Ordering::Acquire),
            )
        };
        validate_orders(left_order, right_order)?;

        let mut events = LoopbackEventChannel::bind_client(&runtime, devno, event_port)?;

        let notify_file = events.try_clone_notifier().map_err(VchanError::Io)?;
        let base_addr = page.base_ptr() as usize;
        let unmap_watch = grants.install_unmap_notify(ring_ref, move || {
            // SAFETY: see server_init's unmap-notify closure.
            let page = unsafe { SharedPage::new(base_addr as *mut u8) };
            page.header()
                .cli_live
                .store(cli_live::CLOSED, Ordering::Release);
            let mut f = &notify_file;
            let _ = f.write_all(&[1u8]);
        });

        let pages_left = config::pages_for_order(left_order);
        let (left_ptr, left_storage) = import_ring_storage(&grants, &page, left_order, 0)?;
        let (right_ptr, right_storage) =
            import_ring_storage(&grants, &page, right_order, pages_left)?;

        let left_indices: *const RingIndices = &page.header().left;
        let right_indices: *const RingIndices = &page.header().right;
        // Client writes left, reads right.
        // SAFETY: see server_init.
        let write = unsafe { Ring::new(left_indices, left_ptr, left_order, left_storage) };
        let read = unsafe { Ring::new(right_indices, right_ptr, right_order, right_storage) };

        {
            let hdr = page.header();
            hdr.cli_live.store(cli_live::CONNECTED, Ordering::Release);
            hdr.debug.store(DEBUG_MAGIC_CLIENT, Ordering::Release);
        }

        Ok(Self {
            role: Role::Client,
            peer,
            devno,
            blocking: true,
            page,
            page_region: Some(page_region),
            read: Some(read),
            write: Some(write),
            events: Some(events),
            grants,
            runtime,
            directory: None,
            page_ref: ring_ref,
            unmap_watch: Some(unmap_watch),
            closed: false,
        })
    }

    /// Sets the blocking flag (default: on). Spec.md §3.2 lists this as a
    /// per-endpoint field the caller configures.
    pub fn set_blocking(&mut self, blocking: bool) {
        self.blocking = blocking;
    }

    #[must_use]
    pub fn devno(&self) -> u32 {
        self.devno
    }

    /// The peer domain id this endpoint was constructed against.
    #[must_use]
    pub fn peer(&self) -> u32 {
        self.peer
    }

    #[must_use]
    pub fn runtime(&self) -> &RuntimeDir {
        &self.runtime
    }

    /// `is-open`: server — `persist || cli_live != 0`; client — `srv_live
    /// != 0`. The value 2 ("not yet connected") counts as open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        if self.closed {
            return false;
        }
        match self.role {
            Role::Server { persist } => {
                persist || self.page.header().cli_live.load(Ordering::Acquire) != 0
            }
            Role::Client => self.page.header().srv_live.load(Ordering::Acquire) != 0,
        }
    }

    /// Coarse state-machine view (spec.md §4.5).
    #[must_use]
    pub fn state(&self) -> EndpointState {
        if self.closed {
            return EndpointState::Closed;
        }
        match self.role {
            Role::Server { .. } => match self.page.header().cli_live.load(Ordering::Acquire) {
                cli_live::NOT_YET_CONNECTED => EndpointState::SrvWaitClient,
                cli_live::CONNECTED => EndpointState::Connected,
                _ if self.read_ring().occupancy() > 0 => EndpointState::HalfClosed,
                _ => EndpointState::Closed,
            },
            Role::Client => {
                if self.page.header().srv_live.load(Ordering::Acquire) != 0 {
                    EndpointState::Connected
                } else if self.read_ring().occupancy() > 0 {
                    EndpointState::HalfClosed
                } else {
                    EndpointState::Closed
                }
            }
        }
    }

    fn read_ring(&self) -> &Ring {
        self.read.as_ref().expect("endpoint not closed")
    }

    fn write_ring(&self) -> &Ring {
        self.write.as_ref().expect("endpoint not closed")
    }

    /// Bytes immediately available to read. Always 0 once closed.
    #[must_use]
    pub fn data_ready(&self) -> usize {
        if self.closed {
            return 0;
        }
        self.read_ring().occupancy() as usize
    }

    /// Bytes immediately available to write. Always 0 once closed.
    #[must_use]
    pub fn buffer_space(&self) -> usize {
        if self.closed {
            return 0;
        }
        self.write_ring().space() as usize
    }

    fn notify(&mut self) -> VchanResult<()> {
        match self.events.as_mut() {
            Some(events) => events.notify(),
            None => Ok(()),
        }
    }

    /// Blocks until a wake-up arrives (spec.md §4.2).
    pub fn wait(&mut self) -> VchanResult<()> {
        match self.events.as_mut() {
            Some(events) => events.wait(),
            None => Err(VchanError::PeerClosed),
        }
    }

    /// Raw fd for integrating with an external readiness loop. Returns -1
    /// once the endpoint has been closed.
    #[must_use]
    pub fn fd_for_select(&self) -> std::os::unix::io::RawFd {
        self.events
            .as_ref()
            .map_or(-1, LoopbackEventChannel::fd_for_select)
    }

    /// `packet-send`: exact-size, atomic transfer.
    pub fn packet_send(&mut self, data: &[u8]) -> VchanResult<usize> {
        if self.closed {
            return Err(VchanError::PeerClosed);
        }
        let n = data.len();
        self.write_ring().check_packet_size(n)?;
        loop {
            if !self.is_open() {
                return Err(VchanError::PeerClosed);
            }
            if n <= self.write_ring().space() as usize {
                self.write_ring().push(data);
                self.notify()?;
                return Ok(n);
            }
            if !self.blocking {
                return Ok(0);
            }
            self.wait()?;
        }
    }

    /// `stream-write`: best-effort transfer.
    pub fn stream_write(&mut self, data: &[u8]) -> VchanResult<usize> {
        if !self.is_open() {
            return Err(VchanError::PeerClosed);
        }
        if !self.blocking {
            let n = data.len().min(self.write_ring().space() as usize);
            if n > 0 {
                self.write_ring().push(&data[..n]);
                self.notify()?;
            }
            return Ok(n);
        }
        let mut written = 0usize;
        while written < data.len() {
            if !self.is_open() {
                return Err(VchanError::PeerClosed);
            }
            let space = self.write_ring().space() as usize;
            if space == 0 {
                self.wait()?;
                continue;
            }
            let chunk = (data.len() - written).min(space);
            self.write_ring().push(&data[written..written + chunk]);
            self.notify()?;
            written += chunk;
        }
        Ok(written)
    }

    /// `packet-recv`: exact-size, atomic transfer.
    pub fn packet_recv(&mut self, out: &mut [u8]) -> VchanResult<usize> {
        if self.closed {
            return Ok(0);
        }
        let n = out.len();
        self.read_ring().check_packet_size(n)?;
        loop {
            if self.read_ring().occupancy() as usize >= n {
                self.read_ring().pop(out);
                self.notify()?;
                return Ok(n);
            }
            if !self.is_open() {
                return Ok(0);
            }
            if !self.blocking {
                return Ok(0);
            }
            self.wait()?;
        }
    }

    /// `stream-read`: best-effort transfer.
    pub fn stream_read(&mut self, out: &mut [u8]) -> VchanResult<usize> {
        if self.closed {
            return Ok(0);
        }
        loop {
            let ready = self.read_ring().occupancy() as usize;
            if ready > 0 {
                let n = out.len().min(ready);
                self.read_ring().pop(&mut out[..n]);
                self.notify()?;
                return Ok(n);
            }
            if !self.is_open() {
                return Ok(0);
            }
            if !self.blocking {
                return Ok(0);
            }
            self.wait()?;
        }
    }

    /// Idempotent close (spec.md §4.6): flips own liveness byte, fires one
    /// final notification, unmaps the shared page and any separately
    /// mapped ring buffers, closes the event channel, and withdraws the
    /// directory entries if this was the server.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        // Step 1: flip own liveness byte.
        match self.role {
            Role::Server { .. } => self
                .page
                .header()
                .srv_live
                .store(srv_live::CLOSED, Ordering::Release),
            Role::Client => self
                .page
                .header()
                .cli_live
                .store(cli_live::CLOSED, Ordering::Release),
        }

        // Step 2: one final notification.
        if let Some(events) = self.events.as_mut() {
            let _ = events.notify();
        }

        // Step 3: unmap the shared page and, if separately mapped, each
        // ring buffer (in that order, matching libvchan_close). Dropping
        // each `Ring` drops its `RingStorage`, which unmaps a `Mapped`
        // region or is a no-op for `InPage`.
        self.page_region = None;
        self.read = None;
        self.write = None;

        // Step 4: close the event fd.
        self.events = None;

        if let Role::Server { persist: false } = self.role {
            if let Some(dir) = self.directory.take() {
                dir.withdraw();
            }
            let _ = self.grants.release(self.page_ref);
        }
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.close();
    }
}
