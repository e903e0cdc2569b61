use super::connection::Connection;
use parking_lot::Mutex;
use std::sync::Arc;

/// Stable reference to one slot of a [`GroupNode`] member list.
///
/// The generation changes whenever the slot is freed, so a handle kept past
/// its member's removal is detected instead of unlinking a newer member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemberHandle {
    index: usize,
    generation: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GroupError {
    #[error("group {0} was dropped")]
    Dropped(u64),
    #[error("stale member handle {handle:?} for group {group_id}")]
    StaleHandle { group_id: u64, handle: MemberHandle },
    #[error("group {group_id} member list corrupted: {detail}")]
    Corrupted { group_id: u64, detail: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    Remaining(usize),
    /// The last member left; the node is now dropped.
    Emptied,
}

struct Entry {
    conn: Arc<Connection>,
    prev: Option<usize>,
    next: Option<usize>,
}

struct Slot {
    generation: u64,
    entry: Option<Entry>,
}

#[derive(Default)]
struct MemberList {
    slots: Vec<Slot>,
    free: Vec<usize>,
    head: Option<usize>,
    online: usize,
    dropped: bool,
}

impl MemberList {
    fn entry(&self, index: usize) -> Option<&Entry> {
        self.slots.get(index).and_then(|slot| slot.entry.as_ref())
    }

    fn entry_mut(&mut self, index: usize) -> Option<&mut Entry> {
        self.slots.get_mut(index).and_then(|slot| slot.entry.as_mut())
    }

    fn allocate(&mut self) -> usize {
        if let Some(index) = self.free.pop() {
            return index;
        }
        self.slots.push(Slot {
            generation: 0,
            entry: None,
        });
        self.slots.len() - 1
    }

    /// Walk from head, bounded by the slot count so corruption cannot spin.
    fn walk(&self, mut visit: impl FnMut(&Entry)) {
        let mut cursor = self.head;
        let mut steps = 0;
        while let Some(index) = cursor {
            if steps > self.slots.len() {
                tracing::error!("member list walk exceeded {} slots", self.slots.len());
                return;
            }
            let Some(entry) = self.entry(index) else {
                return;
            };
            visit(entry);
            cursor = entry.next;
            steps += 1;
        }
    }
}

/// Online membership of one group within one bucket.
///
/// Members form a doubly linked list threaded through an arena of slots.
/// Splicing only takes this node's lock, so membership changes on different
/// groups never contend.
pub struct GroupNode {
    group_id: u64,
    list: Mutex<MemberList>,
}

impl GroupNode {
    pub fn new(group_id: u64) -> Self {
        Self {
            group_id,
            list: Mutex::new(MemberList::default()),
        }
    }

    pub fn group_id(&self) -> u64 {
        self.group_id
    }

    pub fn online_count(&self) -> usize {
        self.list.lock().online
    }

    pub fn is_dropped(&self) -> bool {
        self.list.lock().dropped
    }

    /// Splice `conn` in at the head of the list.
    pub fn put(&self, conn: Arc<Connection>) -> Result<MemberHandle, GroupError> {
        let mut guard = self.list.lock();
        let list = &mut *guard;
        if list.dropped {
            return Err(GroupError::Dropped(self.group_id));
        }
        let index = list.allocate();
        let old_head = list.head;
        if let Some(head) = old_head {
            if let Some(entry) = list.entry_mut(head) {
                entry.prev = Some(index);
            }
        }
        let slot = &mut list.slots[index];
        slot.entry = Some(Entry {
            conn,
            prev: None,
            next: old_head,
        });
        let handle = MemberHandle {
            index,
            generation: slot.generation,
        };
        list.head = Some(index);
        list.online += 1;
        Ok(handle)
    }

    /// Unlink the member behind `handle`.
    ///
    /// Neighbour links are checked before anything is written, so an
    /// inconsistent list aborts the removal and leaves the list untouched.
    pub fn remove(&self, handle: MemberHandle) -> Result<Removal, GroupError> {
        let mut guard = self.list.lock();
        let list = &mut *guard;
        let live = list
            .slots
            .get(handle.index)
            .is_some_and(|slot| slot.generation == handle.generation && slot.entry.is_some());
        if !live {
            return Err(GroupError::StaleHandle {
                group_id: self.group_id,
                handle,
            });
        }
        let (prev, next) = match list.entry(handle.index) {
            Some(entry) => (entry.prev, entry.next),
            None => (None, None),
        };
        match prev {
            Some(p) if list.entry(p).and_then(|e| e.next) != Some(handle.index) => {
                return Err(self.corrupted(format!(
                    "slot {p} does not point forward to {}",
                    handle.index
                )));
            }
            None if list.head != Some(handle.index) => {
                return Err(self.corrupted(format!(
                    "slot {} has no prev but is not head",
                    handle.index
                )));
            }
            _ => {}
        }
        if let Some(n) = next {
            if list.entry(n).and_then(|e| e.prev) != Some(handle.index) {
                return Err(self.corrupted(format!(
                    "slot {n} does not point back to {}",
                    handle.index
                )));
            }
        }

        match prev {
            Some(p) => {
                if let Some(entry) = list.entry_mut(p) {
                    entry.next = next;
                }
            }
            None => list.head = next,
        }
        if let Some(n) = next {
            if let Some(entry) = list.entry_mut(n) {
                entry.prev = prev;
            }
        }
        let slot = &mut list.slots[handle.index];
        slot.entry = None;
        slot.generation = slot.generation.wrapping_add(1);
        list.free.push(handle.index);
        list.online -= 1;
        if list.online == 0 {
            list.dropped = true;
            return Ok(Removal::Emptied);
        }
        Ok(Removal::Remaining(list.online))
    }

    /// Visit every member while holding the node lock. `visit` must not block.
    pub fn for_each_member(&self, mut visit: impl FnMut(&Arc<Connection>)) {
        self.list.lock().walk(|entry| visit(&entry.conn));
    }

    pub fn members(&self) -> Vec<Arc<Connection>> {
        let mut members = Vec::new();
        self.for_each_member(|conn| members.push(conn.clone()));
        members
    }

    fn corrupted(&self, detail: String) -> GroupError {
        GroupError::Corrupted {
            group_id: self.group_id,
            detail,
        }
    }

    /// Check that the list is acyclic, doubly consistent and counted.
    #[cfg(test)]
    pub(crate) fn verify(&self) -> Result<(), String> {
        let list = self.list.lock();
        let mut seen = std::collections::HashSet::new();
        let mut prev = None;
        let mut cursor = list.head;
        while let Some(index) = cursor {
            if !seen.insert(index) {
                return Err(format!("cycle at slot {index}"));
            }
            let entry = list
                .entry(index)
                .ok_or_else(|| format!("dangling link to slot {index}"))?;
            if entry.prev != prev {
                return Err(format!("slot {index} prev {:?} != {prev:?}", entry.prev));
            }
            prev = Some(index);
            cursor = entry.next;
        }
        let occupied = list.slots.iter().filter(|slot| slot.entry.is_some()).count();
        if seen.len() != list.online || occupied != list.online {
            return Err(format!(
                "online {} but linked {} occupied {occupied}",
                list.online,
                seen.len()
            ));
        }
        Ok(())
    }
}
