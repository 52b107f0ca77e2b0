//! Lock-free SPSC ring engine (spec.md §4.1).
//!
//! # MEMORY ORDERING & SYNCHRONIZATION STRATEGY
//!
//! Each ring is written by exactly one side and read by the other. The
//! shared state is a pair of free-running 32-bit counters (`prod`, `cons`)
//! living on the common page, plus the ring bytes themselves (either
//! in-page or in a separately mapped region). Correctness rests on three
//! things: a power-of-two ring size so index masking is exact, the
//! counters being naturally aligned so single-word loads/stores are atomic
//! at the hardware level, and the fence discipline below.
//!
//! | Event                          | Ordering |
//! |---------------------------------|----------|
//! | data write -> `prod` update     | Release  |
//! | `prod` update -> notification   | Release  |
//! | `cons`/`prod` read -> data read  | Acquire  |
//! | data read -> `cons` update      | Release  |
//!
//! On x86/TSO this collapses to a compiler barrier between the copy and
//! the counter update; on weakly-ordered architectures the `Release`/
//! `Acquire` below compile to real fences. We use `Ordering::Release` for
//! every counter store and `Ordering::Acquire` for every counter load that
//! gates a data access, which is sufficient and portable.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::{VchanError, VchanResult};
use crate::page::RingIndices;

/// Where a ring's byte buffer actually lives (spec.md §9 "Raw memory
/// aliasing"). Determines whether `Drop`/close needs to unmap anything.
pub enum RingStorage {
    /// The ring lives inside the shared control page at a fixed offset
    /// (order 10 -> 1024, order 11 -> 2048). Nothing to unmap separately.
    InPage {
        /// Byte offset within the shared page.
        offset: usize,
    },
    /// The ring lives in its own mapped region, imported or allocated via
    /// the grant layer.
    Mapped {
        /// Owned mapping; dropping it unmaps the region.
        handle: crate::grant::MappedRegion,
    },
}

/// One side's view of a single ring: the shared counters plus the raw byte
/// buffer, sized `1 << order`.
pub struct Ring {
    indices: *const RingIndices,
    buffer: *mut u8,
    order: u16,
    storage: RingStorage,
}

// SAFETY: a `Ring` is only ever driven from one producer thread and one
// consumer thread, each on a different process image; within this process
// it is owned by exactly one `Endpoint`, matching spec.md §5's
// single-thread-per-side model. The raw pointers target either the shared
// page (itself `Send + Sync`, see page.rs) or a `MappedRegion`.
unsafe impl Send for Ring {}

impl Ring {
    /// Size of the ring in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        1usize << self.order
    }

    fn mask(&self) -> u32 {
        (self.size() - 1) as u32
    }

    /// Builds a ring view over counters at `indices` and a buffer at
    /// `buffer`, owning `storage` for later teardown.
    ///
    /// # Safety
    ///
    /// `indices` must point at a valid `RingIndices` for the lifetime of
    /// this value, and `buffer` must point at `1 << order` valid,
    /// writable bytes disjoint from every other concurrently-accessed
    /// region.
    #[must_use]
    pub unsafe fn new(
        indices: *const RingIndices,
        buffer: *mut u8,
        order: u16,
        storage: RingStorage,
    ) -> Self {
        Self {
            indices,
            buffer,
            order,
            storage,
        }
    }

    fn indices(&self) -> &RingIndices {
        // SAFETY: constructor contract.
        unsafe { &*self.indices }
    }

    /// Bytes currently queued (producer's view: `prod - cons`).
    #[must_use]
    pub fn occupancy(&self) -> u32 {
        let prod = self.indices().prod.load(Ordering::Acquire);
        let cons = self.indices().cons.load(Ordering::Acquire);
        prod.wrapping_sub(cons)
    }

    /// Free space available to a producer.
    #[must_use]
    pub fn space(&self) -> u32 {
        self.size() as u32 - self.occupancy()
    }

    fn copy_wrapping(&self, dst_base: u32, src: &[u8]) {
        let n = src.len();
        let mask = self.mask();
        let idx = (dst_base & mask) as usize;
        let avail_contig = self.size() - idx;
        let first = n.min(avail_contig);
        // SAFETY: buffer has `self.size()` valid bytes; idx + first <=
        // self.size() by construction of avail_contig.
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), self.buffer.add(idx), first);
        }
        if first < n {
            let rest = n - first;
            // SAFETY: rest <= self.size() - first-wrap portion; we only get
            // here if n > avail_contig, i.e. the remainder fits from the
            // start of the ring because n <= self.size() is a caller
            // precondition enforced by push().
            unsafe {
                std::ptr::copy_nonoverlapping(
                    src.as_ptr().add(first),
                    self.buffer,
                    rest,
                );
            }
        }
    }

    fn copy_from_wrapping(&self, src_base: u32, dst: &mut [u8]) {
        let n = dst.len();
        let mask = self.mask();
        let idx = (src_base & mask) as usize;
        let avail_contig = self.size() - idx;
        let first = n.min(avail_contig);
        // SAFETY: symmetric to copy_wrapping.
        unsafe {
            std::ptr::copy_nonoverlapping(self.buffer.add(idx), dst.as_mut_ptr(), first);
        }
        if first < n {
            let rest = n - first;
            // SAFETY: see copy_wrapping.
            unsafe {
                std::ptr::copy_nonoverlapping(self.buffer, dst.as_mut_ptr().add(first), rest);
            }
        }
    }

    /// Pushes `data` into the ring. Precondition: `data.len() <= space()`.
    /// Performs the wrap-around copy, then a release-order store of the
    /// new `prod`. Caller is responsible for notifying the peer afterward.
    pub fn push(&self, data: &[u8]) {
        debug_assert!(data.len() as u32 <= self.space());
        let prod = self.indices().prod.load(Ordering::Relaxed);
        self.copy_wrapping(prod, data);
        self.indices()
            .prod
            .store(prod.wrapping_add(data.len() as u32), Ordering::Release);
    }

    /// Pops `out.len()` bytes from the ring. Precondition:
    /// `out.len() <= occupancy()`. Performs an acquire-order load of
    /// `prod`, the wrap-around copy, then a release-order store of the new
    /// `cons`. Caller is responsible for notifying the peer afterward.
    pub fn pop(&self, out: &mut [u8]) {
        debug_assert!(out.len() as u32 <= self.occupancy());
        // Acquire load pairs with the producer's release store of `prod`,
        // making the data it guards visible before we copy it out.
        let _prod = self.indices().prod.load(Ordering::Acquire);
        let cons = self.indices().cons.load(Ordering::Relaxed);
        self.copy_from_wrapping(cons, out);
        self.indices()
            .cons
            .store(cons.wrapping_add(out.len() as u32), Ordering::Release);
    }

    /// Validates a caller-requested transfer size against the ring's total
    /// capacity, the check every packet-mode primitive must perform before
    /// looping (spec.md §4.5: "Error if `n > ring_size`").
    pub fn check_packet_size(&self, n: usize) -> VchanResult<()> {
        if n > self.size() {
            return Err(VchanError::PacketTooLarge {
                requested: n,
                ring_size: self.size(),
            });
        }
        Ok(())
    }

    /// Raw pointer to the underlying indices, used by code that needs
    /// direct atomic access (e.g. reading the peer's counters for
    /// diagnostics).
    #[must_use]
    pub fn indices_ptr(&self) -> *const RingIndices {
        self.indices
    }

    /// Storage backing this ring, consulted during teardown.
    #[must_use]
    pub fn storage(&self) -> &RingStorage {
        &self.storage
    }
}

/// Standalone counter pair used for unit/property testing the ring engine
/// without a shared page.
#[cfg(test)]
pub(crate) struct TestRing {
    indices: Box<RingIndices>,
    order: u16,
    buf: Vec<u8>,
}

#[cfg(test)]
impl TestRing {
    fn new(order: u16) -> Self {
        let indices = Box::new(RingIndices {
            cons: AtomicU32::new(0),
            prod: AtomicU32::new(0),
        });
        let buf = vec![0u8; 1usize << order];
        Self { indices, order, buf }
    }

    fn ring(&mut self) -> Ring {
        let storage = RingStorage::InPage { offset: 0 };
        // SAFETY: indices/buf outlive the returned Ring within this test.
        unsafe { Ring::new(&*self.indices, self.buf.as_mut_ptr(), self.order, storage) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn push_pop_roundtrip() {
        let mut t = TestRing::new(12);
        let ring = t.ring();
        let data = b"hello, vchan";
        ring.push(data);
        assert_eq!(ring.occupancy(), data.len() as u32);
        let mut out = vec![0u8; data.len()];
        ring.pop(&mut out);
        assert_eq!(&out, data);
        assert_eq!(ring.occupancy(), 0);
    }

    #[test]
    fn wrap_around_push_pop() {
        let mut t = TestRing::new(10); // 1024-byte ring
        let ring = t.ring();
        // Prime prod/cons near the wrap boundary.
        let prime = vec![0xAAu8; 1000];
        ring.push(&prime);
        let mut sink = vec![0u8; 1000];
        ring.pop(&mut sink);
        // prod == cons == 1000 now; next push straddles the wrap.
        let payload: Vec<u8> = (0..100u8).collect();
        ring.push(&payload);
        let mut out = vec![0u8; 100];
        ring.pop(&mut out);
        assert_eq!(out, payload);
    }

    #[test]
    fn check_packet_size_rejects_oversized() {
        let mut t = TestRing::new(10);
        let ring = t.ring();
        assert!(ring.check_packet_size(1024).is_ok());
        assert!(ring.check_packet_size(1025).is_err());
    }

    proptest! {
        #[test]
        fn occupancy_bound_holds(ops in prop::collection::vec(0u8..=1, 1..500)) {
            let mut t = TestRing::new(10);
            let ring = t.ring();
            let size = ring.size() as u32;
            let mut queued: usize = 0;
            for op in ops {
                if op == 0 {
                    let space = ring.space() as usize;
                    let n = space.min(37);
                    if n > 0 {
                        let data = vec![1u8; n];
                        ring.push(&data);
                        queued += n;
                    }
                } else {
                    let occ = ring.occupancy() as usize;
                    let n = occ.min(23);
                    if n > 0 {
                        let mut out = vec![0u8; n];
                        ring.pop(&mut out);
                        queued -= n;
                    }
                }
                let occ = ring.occupancy();
                prop_assert!(occ <= size);
                prop_assert_eq!(occ as usize, queued);
            }
        }

        #[test]
        fn fifo_order_preserved(chunks in prop::collection::vec(prop::collection::vec(any::<u8>(), 1..50), 1..40)) {
            let mut t = TestRing::new(12);
            let ring = t.ring();
            let mut expected = Vec::new();
            let mut actual = Vec::new();
            for chunk in &chunks {
                // Keep within capacity by draining fully each iteration.
                ring.push(chunk);
                expected.extend_from_slice(chunk);
                let mut out = vec![0u8; chunk.len()];
                ring.pop(&mut out);
                actual.extend_from_slice(&out);
            }
            prop_assert_eq!(actual, expected);
        }

        #[test]
        fn wrap_idempotence(k in 0usize..1024, n in 1usize..1024) {
            // A push of n bytes at prod mod S == k with k + n > S must
            // match two pushes of (S-k) then (n-(S-k)) for occupancy <= S.
            let size = 1024usize;
            prop_assume!(k + n <= size * 2);
            prop_assume!(k < size);
            let single_t_order = 10u16;

            let mut t1 = TestRing::new(single_t_order);
            let ring1 = t1.ring();
            if k > 0 {
                let filler = vec![0u8; k];
                ring1.push(&filler);
                let mut sink = vec![0u8; k];
                ring1.pop(&mut sink);
            }
            let n_clamped = n.min(size);
            if n_clamped > (size - (ring1.indices().prod.load(Ordering::Relaxed) as usize & (size - 1))) {
                // would wrap
                let payload: Vec<u8> = (0..n_clamped).map(|i| i as u8).collect();
                if n_clamped as u32 <= ring1.space() {
                    ring1.push(&payload);

                    let mut t2 = TestRing::new(single_t_order);
                    let ring2 = t2.ring();
                    if k > 0 {
                        let filler = vec![0u8; k];
                        ring2.push(&filler);
                        let mut sink = vec![0u8; k];
                        ring2.pop(&mut sink);
                    }
                    let first = size - k;
                    let (a, b) = payload.split_at(first.min(payload.len()));
                    if !a.is_empty() {
                        ring2.push(a);
                    }
                    if !b.is_empty() {
                        ring2.push(b);
                    }

                    let mut out1 = vec![0u8; n_clamped];
                    ring1.pop(&mut out1);
                    let mut out2 = vec![0u8; n_clamped];
                    ring2.pop(&mut out2);
                    prop_assert_eq!(out1, out2);
                }
            }
        }
    }
}
