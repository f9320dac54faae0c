//! # Cache Pages
//!
//! One cached unit and the arena that holds a cache's pages in LRU order.
//!
//! Pages live in a slot arena and are linked into a doubly linked list by
//! slot index, least recently used at the head. Slot indices stay stable
//! for the life of a page, so the key map and the address map can refer to
//! pages by [`SlotId`] while the list is reordered underneath them.

use alloc::vec::Vec;

use bitflags::bitflags;
use helix_memory::{PageHandle, VirtualAddress};

use crate::checksum::calculate_checksum;

// =============================================================================
// Page Flags
// =============================================================================

bitflags! {
    /// Per-page state bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PageFlags: u8 {
        /// A write-back is queued or running; the stored checksum is stale
        /// until the dispatcher re-baselines it
        const CHECKSUM_IN_FLUX = 1 << 0;
        /// Page belongs to a multi-page insert
        const BULK = 1 << 1;
    }
}

// =============================================================================
// Cache Page
// =============================================================================

/// Arena slot index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct SlotId(u32);

impl SlotId {
    #[inline]
    fn index(self) -> usize {
        self.0 as usize
    }
}

/// One cached page
#[derive(Debug)]
pub struct CachePage {
    /// Cache key
    key: u64,
    /// Unique within the cache, never reused
    serial: u64,
    /// Address handed to clients
    location: VirtualAddress,
    /// Backing frame
    frame: PageHandle,
    /// Outstanding holders
    refcount: u32,
    /// Last known clean checksum
    checksum: u16,
    /// State bits
    flags: PageFlags,
    /// Manager tick of the last insert or lookup
    last_touched: u64,
    /// Towards least recently used
    prev: Option<SlotId>,
    /// Towards most recently used
    next: Option<SlotId>,
}

impl CachePage {
    /// New page with one holder and an uncomputed (zero) checksum
    pub(crate) fn new(
        key: u64,
        serial: u64,
        location: VirtualAddress,
        frame: PageHandle,
        now: u64,
    ) -> Self {
        Self {
            key,
            serial,
            location,
            frame,
            refcount: 1,
            checksum: 0,
            flags: PageFlags::empty(),
            last_touched: now,
            prev: None,
            next: None,
        }
    }

    /// Cache key
    pub fn key(&self) -> u64 {
        self.key
    }

    /// Insertion serial
    ///
    /// A key evicted and inserted again gets a new serial even when it lands
    /// at the same address.
    pub fn serial(&self) -> u64 {
        self.serial
    }

    /// Address handed to clients
    pub fn location(&self) -> VirtualAddress {
        self.location
    }

    /// Backing frame
    pub fn frame(&self) -> &PageHandle {
        &self.frame
    }

    /// Outstanding holders
    pub fn refcount(&self) -> u32 {
        self.refcount
    }

    /// Stored checksum
    pub fn checksum(&self) -> u16 {
        self.checksum
    }

    /// State bits
    pub fn flags(&self) -> PageFlags {
        self.flags
    }

    /// Whether a write-back for this page is in flight
    pub fn checksum_in_flux(&self) -> bool {
        self.flags.contains(PageFlags::CHECKSUM_IN_FLUX)
    }

    /// Manager tick of the last insert or lookup
    pub fn last_touched(&self) -> u64 {
        self.last_touched
    }

    /// Checksum of the current contents
    pub fn calculate_checksum(&self) -> u16 {
        calculate_checksum(self.frame.bytes())
    }

    /// Compare the current contents against the stored checksum
    ///
    /// Returns true if unchanged. With `replace` the fresh checksum becomes
    /// the stored one whatever the verdict.
    pub fn verify_checksum(&mut self, replace: bool) -> bool {
        let current = self.calculate_checksum();
        let unchanged = current == self.checksum;
        if replace {
            self.checksum = current;
        }
        unchanged
    }

    /// Whether eviction would lose data the backing store has not seen
    pub fn is_dirty(&self) -> bool {
        self.checksum_in_flux() || self.calculate_checksum() != self.checksum
    }

    pub(crate) fn set_checksum(&mut self, checksum: u16) {
        self.checksum = checksum;
    }

    pub(crate) fn set_flags(&mut self, flags: PageFlags, value: bool) {
        self.flags.set(flags, value);
    }

    pub(crate) fn touch(&mut self, now: u64) {
        self.last_touched = now;
    }

    pub(crate) fn acquire(&mut self) {
        self.refcount += 1;
    }

    /// Drop one holder; false if there was none
    pub(crate) fn release(&mut self) -> bool {
        match self.refcount.checked_sub(1) {
            Some(n) => {
                self.refcount = n;
                true
            },
            None => false,
        }
    }

    pub(crate) fn into_frame(self) -> PageHandle {
        self.frame
    }
}

// =============================================================================
// Page Arena
// =============================================================================

enum Slot {
    Occupied(CachePage),
    Vacant(Option<SlotId>),
}

/// Pages of one cache, in LRU order
pub(crate) struct PageArena {
    slots: Vec<Slot>,
    /// Vacant slot free list
    free: Option<SlotId>,
    /// Least recently used
    head: Option<SlotId>,
    /// Most recently used
    tail: Option<SlotId>,
    len: usize,
}

impl PageArena {
    pub(crate) const fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: None,
            head: None,
            tail: None,
            len: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn get(&self, id: SlotId) -> Option<&CachePage> {
        match self.slots.get(id.index()) {
            Some(Slot::Occupied(page)) => Some(page),
            _ => None,
        }
    }

    pub(crate) fn get_mut(&mut self, id: SlotId) -> Option<&mut CachePage> {
        match self.slots.get_mut(id.index()) {
            Some(Slot::Occupied(page)) => Some(page),
            _ => None,
        }
    }

    fn page_mut(&mut self, id: SlotId) -> &mut CachePage {
        match &mut self.slots[id.index()] {
            Slot::Occupied(page) => page,
            Slot::Vacant(_) => unreachable!("PageArena: linked slot {:?} is vacant", id),
        }
    }

    /// Store a page as most recently used
    pub(crate) fn insert(&mut self, page: CachePage) -> SlotId {
        let id = match self.free {
            Some(id) => {
                self.free = match self.slots[id.index()] {
                    Slot::Vacant(next) => next,
                    Slot::Occupied(_) => unreachable!("PageArena: free slot {:?} occupied", id),
                };
                self.slots[id.index()] = Slot::Occupied(page);
                id
            },
            None => {
                let id = SlotId(self.slots.len() as u32);
                self.slots.push(Slot::Occupied(page));
                id
            },
        };
        self.len += 1;
        self.link_tail(id);
        id
    }

    /// Take a page out of the arena
    pub(crate) fn remove(&mut self, id: SlotId) -> CachePage {
        self.unlink(id);
        let slot = core::mem::replace(&mut self.slots[id.index()], Slot::Vacant(self.free));
        self.free = Some(id);
        self.len -= 1;
        match slot {
            Slot::Occupied(page) => page,
            Slot::Vacant(_) => unreachable!("PageArena: removed vacant slot {:?}", id),
        }
    }

    /// Mark a page most recently used
    pub(crate) fn promote(&mut self, id: SlotId) {
        if self.tail != Some(id) {
            self.unlink(id);
            self.link_tail(id);
        }
    }

    fn link_tail(&mut self, id: SlotId) {
        let old_tail = self.tail;
        {
            let page = self.page_mut(id);
            page.prev = old_tail;
            page.next = None;
        }
        match old_tail {
            Some(t) => self.page_mut(t).next = Some(id),
            None => self.head = Some(id),
        }
        self.tail = Some(id);
    }

    fn unlink(&mut self, id: SlotId) {
        let (prev, next) = {
            let page = self.page_mut(id);
            (page.prev.take(), page.next.take())
        };
        match prev {
            Some(p) => self.page_mut(p).next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.page_mut(n).prev = prev,
            None => self.tail = prev,
        }
    }

    /// Pages from least to most recently used
    pub(crate) fn lru(&self) -> LruIter<'_> {
        LruIter {
            arena: self,
            cursor: self.head,
        }
    }

    /// Every page, in slot order
    pub(crate) fn pages_mut(&mut self) -> impl Iterator<Item = &mut CachePage> {
        self.slots.iter_mut().filter_map(|slot| match slot {
            Slot::Occupied(page) => Some(page),
            Slot::Vacant(_) => None,
        })
    }

    /// Remove every page
    pub(crate) fn drain(&mut self) -> Vec<CachePage> {
        let pages = core::mem::take(&mut self.slots)
            .into_iter()
            .filter_map(|slot| match slot {
                Slot::Occupied(page) => Some(page),
                Slot::Vacant(_) => None,
            })
            .collect();
        self.free = None;
        self.head = None;
        self.tail = None;
        self.len = 0;
        pages
    }
}

/// Iterator over an arena in LRU order
pub(crate) struct LruIter<'a> {
    arena: &'a PageArena,
    cursor: Option<SlotId>,
}

impl<'a> Iterator for LruIter<'a> {
    type Item = (SlotId, &'a CachePage);

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.cursor?;
        let page = self.arena.get(id)?;
        self.cursor = page.next;
        Some((id, page))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use helix_memory::{HeapFrameAllocator, PageAllocator, PAGE_SIZE};
    use std::vec::Vec;

    fn page(frames: &HeapFrameAllocator, key: u64) -> CachePage {
        let frame = frames.allocate().unwrap();
        CachePage::new(key, key, VirtualAddress::new(key * PAGE_SIZE as u64), frame, 0)
    }

    fn order(arena: &PageArena) -> Vec<u64> {
        arena.lru().map(|(_, p)| p.key()).collect()
    }

    fn free_all(frames: &HeapFrameAllocator, arena: &mut PageArena) {
        for p in arena.drain() {
            frames.free(p.into_frame());
        }
    }

    #[test]
    fn test_insert_order_and_promote() {
        let frames = HeapFrameAllocator::new();
        let mut arena = PageArena::new();
        let a = arena.insert(page(&frames, 1));
        arena.insert(page(&frames, 2));
        let c = arena.insert(page(&frames, 3));
        assert_eq!(order(&arena), [1, 2, 3]);

        arena.promote(a);
        assert_eq!(order(&arena), [2, 3, 1]);

        // Promoting the tail is a no-op
        arena.promote(a);
        assert_eq!(order(&arena), [2, 3, 1]);

        arena.promote(c);
        assert_eq!(order(&arena), [2, 1, 3]);

        free_all(&frames, &mut arena);
    }

    #[test]
    fn test_remove_and_slot_reuse() {
        let frames = HeapFrameAllocator::new();
        let mut arena = PageArena::new();
        let a = arena.insert(page(&frames, 1));
        let b = arena.insert(page(&frames, 2));
        arena.insert(page(&frames, 3));

        let removed = arena.remove(b);
        assert_eq!(removed.key(), 2);
        frames.free(removed.into_frame());
        assert_eq!(order(&arena), [1, 3]);
        assert!(arena.get(b).is_none());

        // The vacated slot is reused
        let d = arena.insert(page(&frames, 4));
        assert_eq!(d, b);
        assert_eq!(order(&arena), [1, 3, 4]);

        frames.free(arena.remove(a).into_frame());
        assert_eq!(order(&arena), [3, 4]);
        assert_eq!(arena.len(), 2);

        free_all(&frames, &mut arena);
        assert_eq!(arena.len(), 0);
        assert_eq!(frames.outstanding(), 0);
    }

    #[test]
    fn test_verify_checksum() {
        let frames = HeapFrameAllocator::new();
        let mut p = page(&frames, 7);
        assert!(p.verify_checksum(false));
        assert!(!p.is_dirty());

        p.frame().fill(0xAA);
        assert!(p.is_dirty());
        assert!(!p.verify_checksum(false));
        assert!(!p.verify_checksum(true));
        assert!(p.verify_checksum(false));
        assert!(!p.is_dirty());

        p.set_flags(PageFlags::CHECKSUM_IN_FLUX, true);
        assert!(p.is_dirty());

        frames.free(p.into_frame());
    }

    #[test]
    fn test_refcount() {
        let frames = HeapFrameAllocator::new();
        let mut p = page(&frames, 1);
        p.acquire();
        assert_eq!(p.refcount(), 2);
        assert!(p.release());
        assert!(p.release());
        assert!(!p.release());
        assert_eq!(p.refcount(), 0);
        frames.free(p.into_frame());
    }
}
