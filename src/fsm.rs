//! Pool-style bookkeeping over the free-space treap: writers check bundles
//! of free spans out, shrink them, and hand the tails back.

use parking_lot::{Condvar, Mutex};
use tracing::trace;

use crate::error::{Result, TalusError};
use crate::treap::{FreeSpan, FreeTreap};

/// Outcome of a successful reservation.
pub enum Reservation {
    /// A single free span already covers the request; no records move.
    Ready(FreeSpan),
    /// The request needs several spans fused. The caller must acquire
    /// exclusive buffer access and then call [`FreeSpaceManager::take_fused`];
    /// until it does, no other reservation is granted.
    Fuse,
}

/// Owns the free-space treap, the pool-tracked byte total, and the count of
/// bundles currently checked out to writers.
///
/// `total_free` counts bytes in the treap only; bytes riding in a checked-out
/// bundle rejoin the total when the writer restores the tail.
///
/// Fused reservations are two-phase: `reserve` hands out a ticket once no
/// other bundle is in flight, and the spans themselves are only picked by
/// `take_fused` after the caller holds the buffer exclusively. Picking them
/// earlier would let a concurrent `free` or writer land new spans between the
/// bundle's members, and the compaction walk would then misparse the bytes
/// sitting in its gaps.
pub struct FreeSpaceManager {
    state: Mutex<State>,
    returned: Condvar,
}

struct State {
    treap: FreeTreap,
    total_free: u64,
    extracted: u64,
    fusing: bool,
}

impl FreeSpaceManager {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                treap: FreeTreap::new(),
                total_free: 0,
                extracted: 0,
                fusing: false,
            }),
            returned: Condvar::new(),
        }
    }

    /// Inserts a freed span, merging with abutting neighbours, and wakes
    /// anyone waiting for space.
    pub fn add(&self, span: FreeSpan) -> Result<()> {
        if span.size() == 0 {
            return Err(TalusError::Invalid("empty free span"));
        }
        let mut state = self.state.lock();
        state.treap.insert(span);
        state.total_free += span.size();
        trace!(start = span.start, end = span.end, "fsm.add");
        drop(state);
        self.returned.notify_all();
        Ok(())
    }

    /// Reserves at least `required` bytes of free space for a writer.
    ///
    /// When the largest single span suffices it is extracted from the
    /// highest-gravity fitting site and returned directly. Otherwise, if the
    /// pool total suffices and nothing else is in flight, a fuse ticket is
    /// issued. If neither holds but other writers still hold extracted space
    /// (or a fuse is pending), the call blocks until they finish; only a
    /// provably unsatisfiable request fails with `NotEnoughSpace`.
    pub fn reserve(&self, required: u64) -> Result<Reservation> {
        debug_assert!(required > 0, "zero-sized reservation");
        let mut state = self.state.lock();
        loop {
            if !state.fusing && state.treap.max_size() >= required {
                let node = state.treap.greatest_gravity(required).ok_or(
                    TalusError::Corruption("free-space index empty with nonzero total"),
                )?;
                let (spans, taken) = state.treap.take_fitting(node, required);
                debug_assert_eq!(spans.len(), 1);
                state.total_free -= taken;
                state.extracted += 1;
                trace!(required, taken, "fsm.reserve.single");
                return Ok(Reservation::Ready(spans[0]));
            }
            if !state.fusing && state.extracted == 0 && state.total_free >= required {
                state.fusing = true;
                trace!(required, total = state.total_free, "fsm.reserve.fuse");
                return Ok(Reservation::Fuse);
            }
            if state.extracted == 0 && !state.fusing {
                return Err(TalusError::NotEnoughSpace);
            }
            self.returned.wait(&mut state);
        }
    }

    /// Redeems a fuse ticket: extracts the highest-gravity span and enough of
    /// its in-order neighbours to cover `required`, in ascending address
    /// order. The caller must hold the buffer exclusively, so the spans and
    /// the records between them cannot move underneath the compaction.
    pub fn take_fused(&self, required: u64) -> Result<Vec<FreeSpan>> {
        let mut state = self.state.lock();
        debug_assert!(state.fusing, "fused extraction without a ticket");
        debug_assert_eq!(state.extracted, 0, "fused extraction with bundles in flight");
        let node = match state.treap.greatest_gravity(0) {
            Some(node) => node,
            None => {
                // the ticket must not outlive a failed extraction, or every
                // later reservation parks on the condvar forever
                state.fusing = false;
                drop(state);
                self.returned.notify_all();
                return Err(TalusError::Corruption(
                    "free-space index empty with nonzero total",
                ));
            }
        };
        let (spans, taken) = state.treap.take_fitting(node, required);
        state.total_free -= taken;
        state.extracted += 1;
        state.fusing = false;
        trace!(required, taken, bundle = spans.len(), "fsm.take_fused");
        drop(state);
        self.returned.notify_all();
        Ok(spans)
    }

    /// Returns the unconsumed tail of a previously extracted bundle. An empty
    /// tail is legal (the write fit exactly); a restore without a matching
    /// extract is a façade bug.
    pub fn restore(&self, span: FreeSpan) -> Result<()> {
        let mut state = self.state.lock();
        if state.extracted == 0 {
            return Err(TalusError::Corruption(
                "free span returned without a matching extraction",
            ));
        }
        state.extracted -= 1;
        if span.size() > 0 {
            state.treap.insert(span);
            state.total_free += span.size();
        }
        trace!(start = span.start, size = span.size(), "fsm.restore");
        drop(state);
        self.returned.notify_all();
        Ok(())
    }

    /// Pool-tracked free byte count, observed only once every in-flight
    /// extraction has been returned.
    pub fn total_free_space(&self) -> u64 {
        let mut state = self.state.lock();
        while state.extracted > 0 || state.fusing {
            self.returned.wait(&mut state);
        }
        state.total_free
    }
}

impl Default for FreeSpaceManager {
    fn default() -> Self {
        Self::new()
    }
}
