//! Bounded, allocation-free holding pen for the rank-local particle set.
//!
//! All storage is one block of slots chained into two index-linked
//! stacks: a free stack and the active list. Capacity equals the global
//! spawn total (worst case every particle walks onto one rank), so
//! running out of slots is a bookkeeping bug, not a runtime condition.

/// Sentinel index terminating both stacks.
const NIL: u32 = u32::MAX;

#[derive(Debug)]
struct Slot<T> {
    next: u32,
    item: Option<T>,
}

#[derive(Debug)]
pub struct ParticlePool<T> {
    slots: Vec<Slot<T>>,
    free_head: u32,
    head: u32,
    len: usize,
}

impl<T> ParticlePool<T> {
    /// Allocates `capacity` slots up front and chains them into the free
    /// stack. No further allocation happens for the life of the pool.
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "particle pool needs at least one slot");
        assert!(capacity < NIL as usize, "particle pool capacity {} too large", capacity);
        let mut slots = Vec::with_capacity(capacity);
        for i in 0..capacity {
            let next = if i + 1 < capacity { (i + 1) as u32 } else { NIL };
            slots.push(Slot { next, item: None });
        }
        Self {
            slots,
            free_head: 0,
            head: NIL,
            len: 0,
        }
    }

    /// O(1): pops a slot off the free stack and links it in as the new
    /// list head.
    pub fn push_front(&mut self, item: T) {
        assert!(
            self.free_head != NIL,
            "particle pool overflow: capacity {} exceeded",
            self.slots.len()
        );
        let index = self.free_head;
        let slot = &mut self.slots[index as usize];
        self.free_head = slot.next;
        slot.item = Some(item);
        slot.next = self.head;
        self.head = index;
        self.len += 1;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Starts a forward walk from the list head. The cursor keeps a
    /// trailing predecessor index so the current element can be unlinked
    /// in O(1) without restarting the walk.
    pub fn cursor(&mut self) -> Cursor<'_, T> {
        Cursor {
            current: self.head,
            prev: NIL,
            pool: self,
        }
    }
}

/// Forward walk over the active list with in-place removal.
///
/// `remove` returns the current item and leaves the cursor on the
/// element that followed it; `advance` keeps the element and steps past
/// it. Exactly one of the two must be called per yielded element.
#[derive(Debug)]
pub struct Cursor<'a, T> {
    pool: &'a mut ParticlePool<T>,
    prev: u32,
    current: u32,
}

impl<'a, T> Cursor<'a, T> {
    /// Mutable access to the element under the cursor, or `None` once
    /// the walk has passed the end of the list.
    pub fn current_mut(&mut self) -> Option<&mut T> {
        if self.current == NIL {
            return None;
        }
        self.pool.slots[self.current as usize].item.as_mut()
    }

    pub fn advance(&mut self) {
        if self.current == NIL {
            return;
        }
        self.prev = self.current;
        self.current = self.pool.slots[self.current as usize].next;
    }

    /// Unlinks the current element, returns it to the caller and its slot
    /// to the free stack. The walk resumes at the successor.
    pub fn remove(&mut self) -> T {
        let index = self.current;
        assert!(index != NIL, "cursor removal past the end of the pool");
        let next = self.pool.slots[index as usize].next;
        if self.prev == NIL {
            self.pool.head = next;
        } else {
            self.pool.slots[self.prev as usize].next = next;
        }
        let slot = &mut self.pool.slots[index as usize];
        let item = slot
            .item
            .take()
            .expect("active pool slot holds no item");
        slot.next = self.pool.free_head;
        self.pool.free_head = index;
        self.pool.len -= 1;
        self.current = next;
        item
    }
}
