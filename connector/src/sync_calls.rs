//! The synchronous call table (spec §3, §4.5): handle allocation, the
//! per-slot state machine, and timed blocking for one in-flight call per
//! caller thread.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use connector_wire::Message;

use crate::error::ConnectorError;

const STATE_IDLE: u32 = 0;
const STATE_MSG_PRE: u32 = 1;
const STATE_MSG_OK: u32 = 2;
const STATE_WAITING: u32 = 3;
const STATE_DONE: u32 = 4;

const SEQ_WORD_BITS: u32 = 29;
const SEQ_WORD_MASK: u32 = (1 << SEQ_WORD_BITS) - 1;

/// Handle-encoding scheme, selected per slot by the slot id's own magnitude
/// (spec §3: "the three handle encodings are selected by the slot id's
/// magnitude") rather than once for the whole table — a lower id gets more
/// sequence bits, trading id range for better wrap-detection on calls that
/// reuse low-numbered slots heavily. Each scheme reserves a single one-hot
/// tag bit (29, 30, or 31) and packs `id` then `seq` into the bits below it,
/// mirroring `CSynchronousCallSlot::GetHandle`/`CSynchronousCalls::
/// PostAndRelease`'s per-slot branch on `m_nIdentifier` and its cascading
/// `0x80000000`/`0x40000000`/`0x20000000` tag check on delivery.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandleScheme {
    /// 10-bit id, 19-bit sequence (tag bit 29) — ids `0..0x400`.
    Narrow,
    /// 16-bit id, 14-bit sequence (tag bit 30) — ids `0x400..0x10000`.
    Medium,
    /// 20-bit id, 11-bit sequence (tag bit 31) — ids `0x10000..0x100000`.
    Wide,
}

impl HandleScheme {
    fn tag_bit(self) -> u32 {
        match self {
            HandleScheme::Narrow => 29,
            HandleScheme::Medium => 30,
            HandleScheme::Wide => 31,
        }
    }

    pub fn id_bits(self) -> u32 {
        match self {
            HandleScheme::Narrow => 10,
            HandleScheme::Medium => 16,
            HandleScheme::Wide => 20,
        }
    }

    pub fn seq_bits(self) -> u32 {
        match self {
            HandleScheme::Narrow => 19,
            HandleScheme::Medium => 14,
            HandleScheme::Wide => 11,
        }
    }

    fn id_mask(self) -> u32 {
        (1u32 << self.id_bits()) - 1
    }

    fn seq_mask(self) -> u32 {
        (1u32 << self.seq_bits()) - 1
    }

    /// The scheme a slot with this id is encoded under — the narrowest one
    /// whose id range covers it. `None` if `id` exceeds even `Wide`'s range.
    fn for_id(id: u32) -> Option<HandleScheme> {
        if id < (1 << HandleScheme::Narrow.id_bits()) {
            Some(HandleScheme::Narrow)
        } else if id < (1 << HandleScheme::Medium.id_bits()) {
            Some(HandleScheme::Medium)
        } else if id < (1 << HandleScheme::Wide.id_bits()) {
            Some(HandleScheme::Wide)
        } else {
            None
        }
    }

    /// The widest id any scheme can address; a table's slot capacity is
    /// clamped to this so `for_id` never fails for a slot the table itself
    /// handed out.
    fn widest_id_range() -> usize {
        1usize << HandleScheme::Wide.id_bits()
    }

    fn encode(self, id: u32, seq: u32) -> u32 {
        (1 << self.tag_bit()) | ((id & self.id_mask()) << self.seq_bits()) | (seq & self.seq_mask())
    }

    /// Decodes `handle` by checking the one-hot tag bits from bit 31 down to
    /// bit 29, the same order `CSynchronousCalls::PostAndRelease` checks
    /// `0x80000000`, then `0x40000000`, then `0x20000000`.
    fn decode_any(handle: u32) -> Option<(HandleScheme, u32, u32)> {
        for scheme in [HandleScheme::Wide, HandleScheme::Medium, HandleScheme::Narrow] {
            if (handle >> scheme.tag_bit()) & 1 == 1 {
                let id = (handle >> scheme.seq_bits()) & scheme.id_mask();
                let seq = handle & scheme.seq_mask();
                return Some((scheme, id, seq));
            }
        }
        None
    }
}

fn pack_word(state: u32, seq: u32) -> u32 {
    (state << SEQ_WORD_BITS) | (seq & SEQ_WORD_MASK)
}

fn word_state(word: u32) -> u32 {
    word >> SEQ_WORD_BITS
}

fn word_seq(word: u32) -> u32 {
    word & SEQ_WORD_MASK
}

struct Slot {
    word: AtomicU32,
    inbox: Mutex<Option<Message>>,
    sem_mutex: Mutex<bool>,
    sem_cond: Condvar,
}

impl Slot {
    fn new() -> Self {
        Self {
            word: AtomicU32::new(pack_word(STATE_IDLE, 0)),
            inbox: Mutex::new(None),
            sem_mutex: Mutex::new(false),
            sem_cond: Condvar::new(),
        }
    }

    fn current_seq(&self) -> u32 {
        word_seq(self.word.load(Ordering::Acquire))
    }

    fn try_transition(&self, from_state: u32, seq: u32, to_state: u32) -> bool {
        let from = pack_word(from_state, seq);
        let to = pack_word(to_state, seq);
        self.word
            .compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn signal(&self) {
        let mut signaled = self.sem_mutex.lock().unwrap();
        *signaled = true;
        self.sem_cond.notify_one();
    }

    fn drain(&self) {
        *self.sem_mutex.lock().unwrap() = false;
    }

    /// Blocks until signaled or `deadline` elapses; consumes the signal on
    /// a true return.
    fn wait_signal(&self, deadline: Duration) -> bool {
        let deadline_at = Instant::now() + deadline;
        let mut signaled = self.sem_mutex.lock().unwrap();
        loop {
            if *signaled {
                *signaled = false;
                return true;
            }
            let remaining = deadline_at.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            let (guard, result) = self.sem_cond.wait_timeout(signaled, remaining).unwrap();
            signaled = guard;
            if result.timed_out() && !*signaled {
                return false;
            }
        }
    }
}

struct TableInner {
    slots: Vec<Arc<Slot>>,
    free_list: Vec<usize>,
}

/// The table's unit of synchronous-call bookkeeping, borrowed out by
/// [`SyncCallTable::acquire`] and returned by dropping it (which performs
/// the same bookkeeping as an explicit [`SlotHandle::release`]).
pub struct SlotHandle {
    table: Arc<SyncCallTable>,
    id: u32,
    slot: Arc<Slot>,
}

impl SlotHandle {
    pub fn handle(&self) -> u32 {
        let scheme = HandleScheme::for_id(self.id)
            .expect("slot id is bounded by the table's clamp to the widest handle scheme");
        scheme.encode(self.id, self.slot.current_seq())
    }

    /// Returns the slot to the table's free list. Equivalent to dropping
    /// the handle; kept as an explicit method because callers that want to
    /// release promptly (rather than waiting on scope exit) read better
    /// calling it directly.
    pub fn release(self) {
        drop(self)
    }
}

impl Drop for SlotHandle {
    fn drop(&mut self) {
        self.table.release_slot(self.id, &self.slot);
    }
}

pub struct SyncCallTable {
    inner: Mutex<TableInner>,
    max_capacity: usize,
    growth_increment: usize,
}

impl SyncCallTable {
    /// `max_capacity` is clamped to the widest handle scheme's id range
    /// (`Wide`, 20 bits): a slot id beyond that has no encoding to pack it
    /// into, so the table must never hand one out.
    pub fn new(initial_capacity: usize, max_capacity: usize) -> Arc<Self> {
        let scheme_ceiling = HandleScheme::widest_id_range();
        let max_capacity = if max_capacity > scheme_ceiling {
            tracing::warn!(
                requested = max_capacity,
                ceiling = scheme_ceiling,
                "clamping max_slot_capacity to the widest handle scheme's id range"
            );
            scheme_ceiling
        } else {
            max_capacity
        };
        let growth_increment = initial_capacity.max(16);
        let initial = Self::build_slots(initial_capacity.min(max_capacity));
        Arc::new(Self {
            inner: Mutex::new(TableInner {
                free_list: (0..initial.len()).collect(),
                slots: initial,
            }),
            max_capacity,
            growth_increment,
        })
    }

    fn build_slots(n: usize) -> Vec<Arc<Slot>> {
        (0..n).map(|_| Arc::new(Slot::new())).collect()
    }

    pub fn acquire(self: &Arc<Self>) -> Result<SlotHandle, ConnectorError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.free_list.is_empty() {
            if inner.slots.len() >= self.max_capacity {
                return Err(ConnectorError::OutOfMemory);
            }
            let start = inner.slots.len();
            let end = (start + self.growth_increment).min(self.max_capacity);
            for _ in start..end {
                inner.slots.push(Arc::new(Slot::new()));
            }
            inner.free_list.extend(start..end);
        }
        let id = inner.free_list.pop().expect("just ensured non-empty");
        let slot = Arc::clone(&inner.slots[id]);
        drop(inner);
        Ok(SlotHandle {
            table: Arc::clone(self),
            id: id as u32,
            slot,
        })
    }

    /// Decodes `handle` (trying each scheme's tag bit, widest first) and
    /// posts `message` to the matching slot, dropping it silently if the
    /// handle is stale, out of range, or matches no known encoding.
    pub fn deliver(&self, handle: u32, message: Message) {
        let Some((_scheme, id, seq)) = HandleScheme::decode_any(handle) else {
            tracing::debug!(handle, "dropping delivery: handle matches no known tag bit");
            return;
        };
        let slot = {
            let inner = self.inner.lock().unwrap();
            match inner.slots.get(id as usize) {
                Some(slot) => Arc::clone(slot),
                None => {
                    tracing::warn!(id, "dropping delivery: slot id out of range");
                    return;
                }
            }
        };
        self.deliver_to_slot(&slot, seq, message);
    }

    fn deliver_to_slot(&self, slot: &Slot, seq: u32, message: Message) {
        if slot.current_seq() != seq {
            tracing::debug!("dropping delivery: stale sequence");
            return;
        }
        loop {
            let word = slot.word.load(Ordering::Acquire);
            match word_state(word) {
                STATE_IDLE => {
                    if slot.try_transition(STATE_IDLE, seq, STATE_MSG_PRE) {
                        *slot.inbox.lock().unwrap() = Some(message);
                        slot.try_transition(STATE_MSG_PRE, seq, STATE_MSG_OK);
                        return;
                    }
                }
                STATE_WAITING => {
                    if slot.try_transition(STATE_WAITING, seq, STATE_MSG_PRE) {
                        *slot.inbox.lock().unwrap() = Some(message);
                        slot.try_transition(STATE_MSG_PRE, seq, STATE_MSG_OK);
                        slot.signal();
                        return;
                    }
                }
                STATE_MSG_PRE => std::hint::spin_loop(),
                STATE_MSG_OK | STATE_DONE => {
                    tracing::debug!("dropping duplicate delivery");
                    return;
                }
                other => {
                    tracing::error!(state = other, "slot word in an unreachable state");
                    return;
                }
            }
        }
    }

    /// Parks on `handle`'s slot until a reply arrives, `timeout` elapses,
    /// or the client stops being RUNNING.
    pub fn wait(&self, handle: &SlotHandle, timeout: Duration, client_running: bool) -> Result<Message, ConnectorError> {
        let seq = handle.slot.current_seq();
        if !client_running {
            return Err(ConnectorError::NotConnected);
        }
        if !handle.slot.try_transition(STATE_IDLE, seq, STATE_WAITING) {
            // A delivery already raced ahead of us into MSG_OK between
            // acquire and wait; take it directly instead of blocking.
            if handle.slot.try_transition(STATE_MSG_OK, seq, STATE_DONE) {
                return Ok(handle.slot.inbox.lock().unwrap().take().expect("MSG_OK implies a stored message"));
            }
            return Err(ConnectorError::SlotInvalid);
        }

        if handle.slot.wait_signal(timeout) {
            let word = handle.slot.word.load(Ordering::Acquire);
            if word_state(word) != STATE_MSG_OK || word_seq(word) != seq {
                // Woken by signal_all_semaphores on the way out of RUNNING,
                // not by a delivery.
                return Err(ConnectorError::TransportClosed);
            }
            return if handle.slot.try_transition(STATE_MSG_OK, seq, STATE_DONE) {
                Ok(handle.slot.inbox.lock().unwrap().take().expect("MSG_OK implies a stored message"))
            } else {
                Err(ConnectorError::SlotInvalid)
            };
        }

        if handle.slot.try_transition(STATE_WAITING, seq, STATE_IDLE) {
            return Err(ConnectorError::Timeout);
        }
        // Lost the race back to IDLE: a delivery landed right at the
        // deadline. Drain the stray signal so the next `wait` isn't
        // pre-signaled (spec §4.5's tie-break), then take the message if
        // it is actually there.
        handle.slot.drain();
        let word = handle.slot.word.load(Ordering::Acquire);
        if word_state(word) == STATE_MSG_OK && word_seq(word) == seq && handle.slot.try_transition(STATE_MSG_OK, seq, STATE_DONE) {
            return Ok(handle.slot.inbox.lock().unwrap().take().expect("MSG_OK implies a stored message"));
        }
        Err(ConnectorError::TransportClosed)
    }

    fn release_slot(&self, id: u32, slot: &Slot) {
        let word = slot.word.load(Ordering::Acquire);
        let seq = word_seq(word);
        if matches!(word_state(word), STATE_MSG_OK | STATE_DONE) {
            *slot.inbox.lock().unwrap() = None;
        }
        let scheme = HandleScheme::for_id(id)
            .expect("slot id is bounded by the table's clamp to the widest handle scheme");
        let next_seq = seq.wrapping_add(1) & scheme.seq_mask();
        let wrap_log_threshold = 1u32 << scheme.seq_bits().saturating_sub(8).max(1);
        if next_seq != 0 && next_seq % wrap_log_threshold == 0 {
            tracing::warn!(
                slot_id = id,
                sequence = next_seq,
                "slot sequence crossed a wrap-warning threshold; check for a long-lived leaked handle"
            );
        }
        slot.word.store(pack_word(STATE_IDLE, next_seq), Ordering::Release);
        slot.drain();
        self.inner.lock().unwrap().free_list.push(id as usize);
    }

    /// Clears any stale signal on every slot; called on RUNNING entry so a
    /// signal from a previous run isn't observed as an immediate wakeup.
    pub fn clear_all_semaphores(&self) {
        for slot in &self.inner.lock().unwrap().slots {
            slot.drain();
        }
    }

    /// Wakes every blocked waiter with a defined `TransportClosed`
    /// condition; called on RUNNING exit.
    pub fn signal_all_semaphores(&self) {
        for slot in &self.inner.lock().unwrap().slots {
            slot.signal();
        }
    }
}
