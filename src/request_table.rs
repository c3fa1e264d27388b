//! Request table (C2, spec.md §4.2).
//!
//! Fixed-capacity, open-addressed table keyed by the (possibly
//! rewritten) DNS transaction id. Capacity is a prime (default 499)
//! so linear probing spreads evenly. A freed slot is represented as
//! `None`; probing walks straight through `None` slots (they are
//! simply non-matches) and only terminates on a full wrap around the
//! starting bucket, which is what makes lazy eviction and immediate
//! slot reuse safe without a separate tombstone marker.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use rand::Rng;

/// Default table capacity. Must stay prime for probing to spread evenly.
pub const DEFAULT_CAPACITY: usize = 499;

/// How long an in-flight request may sit unanswered before its slot is
/// eligible for eviction by a later `insert`. Eviction is lazy: it only
/// happens when a new request probes into a stale slot.
pub const MAX_TIME: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// Queued, waiting for a peer to become `CONNECTED`.
    Waiting,
    /// Written to an upstream peer, awaiting its response.
    Sent,
}

/// A single in-flight query.
pub struct Slot {
    pub client: SocketAddr,
    /// The transaction id the client actually sent; restored on the way out.
    pub rid: u16,
    /// The id currently occupying this slot, possibly rewritten to avoid
    /// a collision with another client's in-flight id.
    pub id: u16,
    /// Wire bytes ready to hand to a peer verbatim: a 2-byte big-endian
    /// length prefix followed by the DNS message (with `id` already
    /// patched into its transaction-id field).
    pub buf: Vec<u8>,
    pub state: RequestState,
    pub arrival: Instant,
}

pub enum InsertOutcome {
    Inserted(usize),
    /// A request with the same id from the same client is already in flight.
    DuplicateDropped,
    /// The table is saturated (every slot in the probe chain is live and
    /// none of them matched).
    TableFull,
}

pub struct RequestTable {
    slots: Vec<Option<Slot>>,
}

impl RequestTable {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "request table capacity must be nonzero");
        Self {
            slots: (0..capacity).map(|_| None).collect(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Inserts a freshly-arrived UDP query. `id` is the client's wire
    /// transaction id (`rid == id` on entry); `buf` already carries the
    /// 2-byte length prefix and the id at wire offset 2. On collision
    /// with a different client's in-flight id, `id` is rewritten to a
    /// fresh uniformly-random nonzero value and the rewrite is patched
    /// into `buf` before the slot is claimed, so the original `rid` can
    /// later restore the client-visible id.
    pub fn insert(
        &mut self,
        client: SocketAddr,
        mut id: u16,
        rid: u16,
        mut buf: Vec<u8>,
        now: Instant,
        rng: &mut impl Rng,
    ) -> InsertOutcome {
        let n = self.slots.len();
        let mut pos = (id as usize) % n;
        let mut start = pos;

        loop {
            match &self.slots[pos] {
                None => break,
                Some(slot) if slot.id == id => {
                    if slot.client == client {
                        return InsertOutcome::DuplicateDropped;
                    }
                    id = loop {
                        let candidate = rng.random_range(1..=u16::MAX);
                        if candidate != 0 {
                            break candidate;
                        }
                    };
                    pos = (id as usize) % n;
                    start = pos;
                    continue;
                }
                Some(slot) if now.saturating_duration_since(slot.arrival) > MAX_TIME => break,
                _ => {
                    pos = (pos + 1) % n;
                    if pos == start {
                        return InsertOutcome::TableFull;
                    }
                }
            }
        }

        buf[2] = (id >> 8) as u8;
        buf[3] = (id & 0xff) as u8;

        self.slots[pos] = Some(Slot {
            client,
            rid,
            id,
            buf,
            state: RequestState::Waiting,
            arrival: now,
        });

        InsertOutcome::Inserted(pos)
    }

    /// Linear-probe lookup matching on exact `id`. Probing wraps and
    /// terminates after a full cycle; freed (`None`) slots along the
    /// way are skipped, not treated as chain terminators.
    pub fn find(&self, id: u16) -> Option<usize> {
        let n = self.slots.len();
        let start = (id as usize) % n;
        let mut pos = start;

        loop {
            if let Some(slot) = &self.slots[pos] {
                if slot.id == id {
                    return Some(pos);
                }
            }
            pos = (pos + 1) % n;
            if pos == start {
                return None;
            }
        }
    }

    pub fn get(&self, index: usize) -> Option<&Slot> {
        self.slots[index].as_ref()
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Slot> {
        self.slots[index].as_mut()
    }

    /// Frees a slot. No compaction: a following `insert` may claim it
    /// immediately, and in-flight lookups keep working because `find`
    /// treats `None` as "not this one," not as a search boundary.
    pub fn release(&mut self, index: usize) {
        self.slots[index] = None;
    }

    /// All slots currently in `Waiting` state, oldest first by index —
    /// used by `handle_outstanding` when a peer transitions to `CONNECTED`.
    pub fn waiting(&self) -> impl Iterator<Item = usize> + '_ {
        self.slots.iter().enumerate().filter_map(|(i, s)| {
            s.as_ref()
                .filter(|s| s.state == RequestState::Waiting)
                .map(|_| i)
        })
    }
}
