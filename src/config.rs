//! Ring-order negotiation (spec.md §3.1 placement policy, §8 scenarios 5-6).

/// 4 KiB, the size of the shared control page (spec.md §3.1).
pub const PAGE_SIZE: usize = 4096;

/// `log2(PAGE_SIZE)`.
pub const PAGE_SHIFT: u32 = 12;

/// Smallest legal ring order: a 1 KiB ring living at offset 1024 in the page.
pub const MIN_ORDER: u16 = 10;

/// Largest legal ring order (spec.md §4.3/§4.4: `10 ≤ order ≤ 24`).
pub const MAX_ORDER: u16 = 24;

/// Byte offset of the in-page ring for `order == 10`.
pub const SMALL_RING_OFFSET: usize = 1024;

/// Byte offset of the in-page ring for `order == 11`.
pub const LARGE_RING_OFFSET: usize = 2048;

/// Above this many requested bytes a ring no longer fits in-page.
const MAX_SMALL_RING: usize = 1024;
/// Above this many requested bytes a ring no longer fits in the 2048 slot.
const MAX_LARGE_RING: usize = 2048;

/// Ceiling on a single ring's byte size, matching `original_source/init.c`'s
/// `MAX_RING_SIZE`: beyond this the grant list would no longer fit in the
/// shared page alongside the header.
pub const MAX_RING_SIZE: usize = 256 * PAGE_SIZE;

/// The two ring orders chosen for a server-side vchan, before any grants are
/// allocated.
///
/// Mirrors `libvchan_server_init`'s order-selection block: first each side's
/// minimum requested size is rounded up to a page-aligned order with
/// [`min_order`], then the in-page placement policy may shrink one or both
/// orders down to 10 or 11 to save a grant. At most one ring may end up at
/// order 10 (spec.md §3.1's uniqueness constraint).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingOrders {
    /// Order of the ring the server writes and the client reads (`right`).
    pub read_order: u16,
    /// Order of the ring the client writes and the server reads (`left`).
    pub write_order: u16,
}

/// Rounds a byte size up to the smallest ring order `o` with `size <= 1 <<
/// o`, never going below a full page (`PAGE_SHIFT`). This is the fallback
/// used once a ring can no longer be placed in-page.
#[must_use]
pub fn min_order(size: usize) -> u16 {
    let mut order = PAGE_SHIFT;
    while size > (1usize << order) {
        order += 1;
    }
    order as u16
}

/// Negotiates ring orders for `server_init(read_min, write_min)`.
///
/// `read_min` is the minimum size of the ring the server reads from (the
/// "left" ring, client-write/server-read); `write_min` is the minimum size
/// of the ring the server writes to ("right", server-write/client-read).
///
/// # Errors
///
/// Returns an error if either minimum exceeds [`MAX_RING_SIZE`].
pub fn negotiate_server_orders(
    read_min: usize,
    write_min: usize,
) -> Result<RingOrders, crate::VchanError> {
    if read_min > MAX_RING_SIZE || write_min > MAX_RING_SIZE {
        return Err(crate::VchanError::RingTooLarge {
            requested: read_min.max(write_min),
            max: MAX_RING_SIZE,
        });
    }

    let mut read_order = min_order(read_min);
    let mut write_order = min_order(write_min);

    // In-page placement: save a grant whenever a ring's minimum fits the
    // 1024 or 2048 byte slot. Only one side may claim the 1024 slot.
    if read_min <= MAX_SMALL_RING && write_min <= MAX_LARGE_RING {
        read_order = 10;
        write_order = 11;
    } else if read_min <= MAX_LARGE_RING && write_min <= MAX_SMALL_RING {
        read_order = 11;
        write_order = 10;
    } else if read_min <= MAX_LARGE_RING {
        read_order = 11;
    } else if write_min <= MAX_LARGE_RING {
        write_order = 11;
    }

    Ok(RingOrders {
        read_order,
        write_order,
    })
}

/// Number of pages a ring of the given order occupies outside the shared
/// page, or 0 if it lives in-page (order 10 or 11).
#[must_use]
pub fn pages_for_order(order: u16) -> usize {
    if order < PAGE_SHIFT as u16 {
        0
    } else {
        1usize << (order - PAGE_SHIFT as u16)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn min_order_rounds_up_to_page() {
        assert_eq!(min_order(1), PAGE_SHIFT as u16);
        assert_eq!(min_order(4096), 12);
        assert_eq!(min_order(4097), 13);
        assert_eq!(min_order(8192), 13);
    }

    #[test]
    fn in_page_both_small_promotes_one() {
        // spec.md §8 scenario 6: both 1024 -> one promoted to 11.
        let orders = negotiate_server_orders(1024, 1024).unwrap();
        assert_eq!(orders.read_order, 10);
        assert_eq!(orders.write_order, 11);
    }

    #[test]
    fn in_page_mixed_sizes() {
        // spec.md §8 scenario 5: read=1024, write=2048 -> (10, 11).
        let orders = negotiate_server_orders(1024, 2048).unwrap();
        assert_eq!(orders.read_order, 10);
        assert_eq!(orders.write_order, 11);
    }

    #[test]
    fn large_rings_use_min_order() {
        let orders = negotiate_server_orders(4096, 4096).unwrap();
        assert_eq!(orders.read_order, 12);
        assert_eq!(orders.write_order, 12);
    }

    #[test]
    fn oversized_ring_rejected() {
        assert!(negotiate_server_orders(MAX_RING_SIZE + 1, 4096).is_err());
    }

    #[test]
    fn pages_for_order_in_page_is_zero() {
        assert_eq!(pages_for_order(10), 0);
        assert_eq!(pages_for_order(11), 0);
        assert_eq!(pages_for_order(12), 1);
        assert_eq!(pages_for_order(13), 2);
    }
}
