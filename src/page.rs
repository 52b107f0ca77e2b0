//! The shared control page: bit-exact layout per spec.md §3.1 and §6.1.

use crate::config::PAGE_SIZE;

/// `debug` value written by the server once the header is fully populated.
pub const DEBUG_MAGIC_SERVER: u16 = 0xABCD;
/// `debug` value written by the client once it has attached.
pub const DEBUG_MAGIC_CLIENT: u16 = 0xABCE;

/// Client liveness states (the `cli_live` byte).
pub mod cli_live {
    /// Channel closed.
    pub const CLOSED: u8 = 0;
    /// Client attached and connected.
    pub const CONNECTED: u8 = 1;
    /// Server has initialized the page but no client has attached yet.
    pub const NOT_YET_CONNECTED: u8 = 2;
}

/// Server liveness states (the `srv_live` byte).
pub mod srv_live {
    /// Channel closed.
    pub const CLOSED: u8 = 0;
    /// Server connected.
    pub const CONNECTED: u8 = 1;
}

/// One ring's free-running producer/consumer counters, as they sit on the
/// shared page. Naturally aligned so loads and stores are atomic at the
/// hardware level (spec.md §5, §9 "no torn index").
#[repr(C)]
#[derive(Debug)]
pub struct RingIndices {
    /// Bytes consumed by the reading side.
    pub cons: std::sync::atomic::AtomicU32,
    /// Bytes produced by the writing side.
    pub prod: std::sync::atomic::AtomicU32,
}

/// The fixed header at the front of the shared page (spec.md §3.1).
///
/// Field order and sizes must match the table exactly: independently
/// compiled peers interoperate only because both sides agree on this
/// layout. `grants` is the flexible array tail (spec.md §9); it is not part
/// of this struct's `size_of` — callers index past the header with
/// [`SharedPage::grants`].
#[repr(C)]
#[derive(Debug)]
pub struct SharedPageHeader {
    /// `left` ring: client writes, server reads.
    pub left: RingIndices,
    /// `right` ring: server writes, client reads.
    pub right: RingIndices,
    /// log2 size of the left ring, 10..24. Immutable after setup.
    pub left_order: std::sync::atomic::AtomicU16,
    /// log2 size of the right ring, 10..24. Immutable after setup.
    pub right_order: std::sync::atomic::AtomicU16,
    /// 0 = closed, 1 = connected, 2 = not yet connected. Written by client
    /// and by the unmap-notify hook; always read as a volatile single byte.
    pub cli_live: std::sync::atomic::AtomicU8,
    /// 0 = closed, 1 = connected. Written by server and by the unmap-notify
    /// hook.
    pub srv_live: std::sync::atomic::AtomicU8,
    /// Debug magic: 0xABCD after server init, 0xABCE after client attach.
    pub debug: std::sync::atomic::AtomicU16,
}

/// Byte offset of each header field, asserted below against the table in
/// spec.md §3.1.
pub const OFFSET_LEFT_CONS: usize = 0;
pub const OFFSET_LEFT_PROD: usize = 4;
pub const OFFSET_RIGHT_CONS: usize = 8;
pub const OFFSET_RIGHT_PROD: usize = 12;
pub const OFFSET_LEFT_ORDER: usize = 16;
pub const OFFSET_RIGHT_ORDER: usize = 18;
pub const OFFSET_CLI_LIVE: usize = 20;
pub const OFFSET_SRV_LIVE: usize = 21;
pub const OFFSET_DEBUG: usize = 22;
/// Offset where the trailing `grants[]` array begins.
pub const OFFSET_GRANTS: usize = 24;

const _LAYOUT_ASSERT: () = {
    assert!(std::mem::offset_of!(SharedPageHeader, left) == OFFSET_LEFT_CONS);
    assert!(
        std::mem::offset_of!(SharedPageHeader, left) + 4 == OFFSET_LEFT_PROD
    );
    assert!(std::mem::offset_of!(SharedPageHeader, right) == OFFSET_RIGHT_CONS);
    assert!(
        std::mem::offset_of!(SharedPageHeader, right) + 4 == OFFSET_RIGHT_PROD
    );
    assert!(std::mem::offset_of!(SharedPageHeader, left_order) == OFFSET_LEFT_ORDER);
    assert!(std::mem::offset_of!(SharedPageHeader, right_order) == OFFSET_RIGHT_ORDER);
    assert!(std::mem::offset_of!(SharedPageHeader, cli_live) == OFFSET_CLI_LIVE);
    assert!(std::mem::offset_of!(SharedPageHeader, srv_live) == OFFSET_SRV_LIVE);
    assert!(std::mem::offset_of!(SharedPageHeader, debug) == OFFSET_DEBUG);
    assert!(std::mem::size_of::<SharedPageHeader>() == OFFSET_GRANTS);
};

/// Number of `u32` grant-ref slots that fit after the header in one page.
pub const MAX_GRANT_SLOTS: usize = (PAGE_SIZE - OFFSET_GRANTS) / 4;

/// A typed view over the shared page: the fixed header plus the trailing
/// grant-ref array (spec.md §9 "Flexible array tail"). Rust has no C99
/// flexible array members, so the tail is modeled as pointer arithmetic
/// past the header rather than a real trailing field.
pub struct SharedPage {
    base: *mut u8,
}

// SAFETY: callers are responsible for ensuring `base` points at a valid,
// `PAGE_SIZE`-byte mapping for the lifetime of this value; the shared page
// is, by construction, concurrently written by another process, which is
// exactly what every accessor here treats as a volatile load/store via the
// atomic types above.
unsafe impl Send for SharedPage {}
unsafe impl Sync for SharedPage {}

impl SharedPage {
    /// Wraps a raw pointer to the start of a mapped, `PAGE_SIZE`-byte shared
    /// page. The pointer must remain valid for as long as the returned
    /// `SharedPage` is used.
    ///
    /// # Safety
    ///
    /// `base` must point to at least `PAGE_SIZE` bytes of valid, writable
    /// memory, aligned to the header's alignment requirement, for the
    /// entire lifetime of this value.
    #[must_use]
    pub unsafe fn new(base: *mut u8) -> Self {
        Self { base }
    }

    /// The fixed header.
    #[must_use]
    pub fn header(&self) -> &SharedPageHeader {
        // SAFETY: constructor contract guarantees `base` is valid for
        // `PAGE_SIZE` bytes, which is >= size_of::<SharedPageHeader>().
        unsafe { &*self.base.cast::<SharedPageHeader>() }
    }

    /// Raw base pointer, for handing to the ring engine when a ring lives
    /// in-page.
    #[must_use]
    pub fn base_ptr(&self) -> *mut u8 {
        self.base
    }

    /// Pointer to the `index`-th grant-ref slot in the trailing array.
    /// Caller must ensure `index < MAX_GRANT_SLOTS`.
    #[must_use]
    pub fn grant_slot(&self, index: usize) -> *mut u32 {
        debug_assert!(index < MAX_GRANT_SLOTS);
        // SAFETY: offset stays within the page for index < MAX_GRANT_SLOTS.
        unsafe { self.base.add(OFFSET_GRANTS + index * 4).cast::<u32>() }
    }

    /// Reads `count` grant refs starting at `start`.
    #[must_use]
    pub fn read_grants(&self, start: usize, count: usize) -> Vec<u32> {
        (start..start + count)
            .map(|i| {
                // SAFETY: slot pointer is valid per grant_slot's contract;
                // the value was written by setup before this side could
                // observe the page at all.
                unsafe { std::ptr::read_volatile(self.grant_slot(i)) }
            })
            .collect()
    }

    /// Writes `refs` into the grant array starting at `start`.
    pub fn write_grants(&self, start: usize, refs: &[u32]) {
        for (i, r) in refs.iter().enumerate() {
            // SAFETY: see read_grants.
            unsafe { std::ptr::write_volatile(self.grant_slot(start + i), *r) };
        }
    }

    /// Zeroes the entire page, used before the server populates the header.
    pub fn zero(&self) {
        // SAFETY: base is valid for PAGE_SIZE bytes per constructor contract.
        unsafe { std::ptr::write_bytes(self.base, 0, PAGE_SIZE) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_size_matches_grants_offset() {
        assert_eq!(std::mem::size_of::<SharedPageHeader>(), OFFSET_GRANTS);
    }

    #[test]
    fn max_grant_slots_fits_one_page() {
        assert_eq!(OFFSET_GRANTS + MAX_GRANT_SLOTS * 4, PAGE_SIZE);
    }

    #[test]
    fn zero_and_roundtrip_grants() {
        let mut buf = vec![0u8; PAGE_SIZE];
        let page = unsafe { SharedPage::new(buf.as_mut_ptr()) };
        page.zero();
        page.write_grants(0, &[7, 42, 1000]);
        assert_eq!(page.read_grants(0, 3), vec![7, 42, 1000]);
    }

    #[test]
    fn header_field_roundtrip() {
        let mut buf = vec![0u8; PAGE_SIZE];
        let page = unsafe { SharedPage::new(buf.as_mut_ptr()) };
        page.zero();
        let hdr = page.header();
        hdr.left_order
            .store(12, std::sync::atomic::Ordering::Relaxed);
        hdr.debug
            .store(DEBUG_MAGIC_SERVER, std::sync::atomic::Ordering::Relaxed);
        assert_eq!(hdr.left_order.load(std::sync::atomic::Ordering::Relaxed), 12);
        assert_eq!(
            hdr.debug.load(std::sync::atomic::Ordering::Relaxed),
            DEBUG_MAGIC_SERVER
        );
    }
}
