//! The priority tree itself: an arena of `TNode`s linked by index, plus the
//! scheduling operations that keep each node's position in its parent's
//! heap consistent with `cycle` (virtual finish time) and `active`.
//!
//! The tree is conceptually an intrusive n-ary tree with back-pointers, the
//! way nghttp3's `nghttp3_tnode` is, but raw parent/child/sibling pointers
//! into a moving arena don't fit the borrow checker; nodes are instead
//! addressed by [`NodeKey`], a `Copy` index into `Arena`'s backing `Vec`,
//! the same arena-of-indices trick `oar3-rust`'s scheduling tree reaches
//! for (it leans on `slab_tree` rather than raw pointers for the same
//! reason).

use crate::http::priority::error::SchedulerError;
use crate::http::priority::nid::NodeId;
use crate::http::priority::pq::{HeapContext, MinHeap};

/// `delta`, expressed in 1/256ths of a byte-weighted unit, above which a
/// single `schedule` call clamps and carries the remainder forward as
/// `pending_penalty` rather than letting one write starve a whole
/// connection's cycle ordering for `2^24` virtual-time units.
pub const MAX_CYCLE_GAP: u64 = (1u64 << 24) * 256 + 255;

/// Opaque handle into an [`Arena`]. Stable across insertions and removals
/// of *other* nodes; invalid (and must not be dereferenced) once the node
/// it names has been freed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeKey(usize);

struct TNode {
    nid: NodeId,
    seq: u64,
    weight: u16,
    cycle: u64,
    pending_penalty: u64,
    active: bool,
    parent: Option<NodeKey>,
    first_child: Option<NodeKey>,
    next_sibling: Option<NodeKey>,
    num_children: u32,
    /// Children of this node that are schedulable, ordered by `cycle`.
    pq: MinHeap<NodeKey>,
    /// This node's own slot index in its *parent's* `pq`, if it is
    /// currently schedulable there.
    pe: Option<usize>,
}

enum Slot {
    Occupied(TNode),
    Vacant(Option<usize>),
}

/// Owns every tnode on a connection, including the root.
pub struct Arena {
    slots: Vec<Slot>,
    free_head: Option<usize>,
    next_seq: u64,
    root: NodeKey,
}

impl HeapContext<NodeKey> for Arena {
    fn less(&self, a: NodeKey, b: NodeKey) -> bool {
        let na = self.get(a);
        let nb = self.get(b);
        (na.cycle, na.seq) < (nb.cycle, nb.seq)
    }

    fn set_pos(&mut self, handle: NodeKey, pos: usize) {
        self.get_mut(handle).pe = Some(pos);
    }
}

impl Arena {
    pub fn new() -> Self {
        let root = TNode {
            nid: NodeId::ROOT,
            seq: 0,
            weight: 16,
            cycle: 0,
            pending_penalty: 0,
            active: false,
            parent: None,
            first_child: None,
            next_sibling: None,
            num_children: 0,
            pq: MinHeap::new(),
            pe: None,
        };
        Arena { slots: vec![Slot::Occupied(root)], free_head: None, next_seq: 1, root: NodeKey(0) }
    }

    pub fn root(&self) -> NodeKey {
        self.root
    }

    fn get(&self, key: NodeKey) -> &TNode {
        match &self.slots[key.0] {
            Slot::Occupied(node) => node,
            Slot::Vacant(_) => panic!("use of a freed priority tree node"),
        }
    }

    fn get_mut(&mut self, key: NodeKey) -> &mut TNode {
        match &mut self.slots[key.0] {
            Slot::Occupied(node) => node,
            Slot::Vacant(_) => panic!("use of a freed priority tree node"),
        }
    }

    pub fn nid(&self, key: NodeKey) -> NodeId {
        self.get(key).nid
    }

    pub fn weight(&self, key: NodeKey) -> u16 {
        self.get(key).weight
    }

    pub fn set_weight(&mut self, key: NodeKey, weight: u16) {
        self.get_mut(key).weight = clamp_weight(weight);
    }

    pub fn cycle(&self, key: NodeKey) -> u64 {
        self.get(key).cycle
    }

    pub fn is_active(&self, key: NodeKey) -> bool {
        self.get(key).active
    }

    pub fn parent_of(&self, key: NodeKey) -> Option<NodeKey> {
        self.get(key).parent
    }

    pub fn num_children(&self, key: NodeKey) -> u32 {
        self.get(key).num_children
    }

    /// True iff `key` currently occupies a slot in its parent's heap, i.e.
    /// it would be visited by `get_next` on some walk from the root.
    pub fn is_scheduled(&self, key: NodeKey) -> bool {
        self.get(key).pe.is_some()
    }

    /// True iff `key` has at least one schedulable child (active, or with
    /// a schedulable descendant of its own).
    pub fn has_active_descendant(&self, key: NodeKey) -> bool {
        !self.get(key).pq.is_empty()
    }

    fn alloc(&mut self, nid: NodeId, weight: u16) -> Result<NodeKey, SchedulerError> {
        let node = TNode {
            nid,
            seq: self.next_seq,
            weight: clamp_weight(weight),
            cycle: 0,
            pending_penalty: 0,
            active: false,
            parent: None,
            first_child: None,
            next_sibling: None,
            num_children: 0,
            pq: MinHeap::new(),
            pe: None,
        };
        let key = match self.free_head {
            Some(idx) => {
                let next_free = match &self.slots[idx] {
                    Slot::Vacant(next) => *next,
                    Slot::Occupied(_) => unreachable!("free list points at an occupied slot"),
                };
                self.free_head = next_free;
                self.slots[idx] = Slot::Occupied(node);
                NodeKey(idx)
            }
            None => {
                self.slots.try_reserve(1).map_err(|_| SchedulerError::OutOfMemory)?;
                self.slots.push(Slot::Occupied(node));
                NodeKey(self.slots.len() - 1)
            }
        };
        self.next_seq += 1;
        Ok(key)
    }

    /// Allocates a new node for `nid` and links it under `parent`.
    pub fn create_node(
        &mut self,
        nid: NodeId,
        weight: u16,
        parent: NodeKey,
    ) -> Result<NodeKey, SchedulerError> {
        let key = self.alloc(nid, weight)?;
        self.insert(key, parent);
        log::debug!("created {:?} weight={} under {:?}", nid, self.weight(key), self.nid(parent));
        Ok(key)
    }

    /// Links an already-allocated, parentless `node` in as a child of
    /// `parent`. Does not touch scheduling state.
    fn insert(&mut self, node: NodeKey, parent: NodeKey) {
        debug_assert!(self.get(node).parent.is_none());
        let old_first = self.get(parent).first_child;
        self.get_mut(node).parent = Some(parent);
        self.get_mut(node).next_sibling = old_first;
        self.get_mut(parent).first_child = Some(node);
        self.get_mut(parent).num_children += 1;
    }

    fn unlink_child(&mut self, parent: NodeKey, node: NodeKey) {
        let mut cur = self.get(parent).first_child;
        let mut prev: Option<NodeKey> = None;
        while let Some(c) = cur {
            if c == node {
                let next = self.get(c).next_sibling;
                match prev {
                    Some(p) => self.get_mut(p).next_sibling = next,
                    None => self.get_mut(parent).first_child = next,
                }
                return;
            }
            prev = Some(c);
            cur = self.get(c).next_sibling;
        }
    }

    /// Detaches `node` from its parent (and from the parent's heap, if it
    /// was scheduled there). If the parent thereby loses its own last
    /// reason to be schedulable, the parent is unscheduled from *its*
    /// parent in turn, and so on up the tree.
    pub fn remove(&mut self, node: NodeKey) {
        let parent = match self.get(node).parent {
            Some(p) => p,
            None => return,
        };
        self.unlink_child(parent, node);
        self.get_mut(parent).num_children -= 1;
        if self.get(node).pe.is_some() {
            self.heap_remove(parent, node);
        }
        self.get_mut(node).parent = None;
        self.get_mut(node).next_sibling = None;
        log::debug!("removed {:?} from {:?}", self.nid(node), self.nid(parent));
        if self.get(parent).pq.is_empty() && !self.get(parent).active {
            self.unschedule(parent);
        }
    }

    /// Removes `node` from the tree and returns its slot to the free list.
    /// `node` must already have no children (callers that squash a node's
    /// subtree reattach the children elsewhere first).
    pub fn remove_and_free(&mut self, node: NodeKey) {
        self.remove(node);
        debug_assert_eq!(self.get(node).num_children, 0);
        let idx = node.0;
        self.slots[idx] = Slot::Vacant(self.free_head);
        self.free_head = Some(idx);
    }

    fn heap_push(&mut self, parent: NodeKey, child: NodeKey) -> Result<(), SchedulerError> {
        let mut heap = std::mem::take(&mut self.get_mut(parent).pq);
        if heap.try_reserve(1).is_err() {
            self.get_mut(parent).pq = heap;
            return Err(SchedulerError::OutOfMemory);
        }
        heap.push(child, self);
        self.get_mut(parent).pq = heap;
        Ok(())
    }

    fn heap_remove(&mut self, parent: NodeKey, node: NodeKey) {
        let pos = match self.get(node).pe {
            Some(p) => p,
            None => return,
        };
        let mut heap = std::mem::take(&mut self.get_mut(parent).pq);
        heap.remove_at(pos, self);
        self.get_mut(parent).pq = heap;
        self.get_mut(node).pe = None;
    }

    /// Registers `node`, the uncontested minimum child of `parent`, or
    /// folds `nwrite` bytes into `node`'s own accounting and reinserts it.
    /// `mark_active` distinguishes a real write (caller-driven `schedule`)
    /// from bookkeeping propagation up the ancestor chain, which must not
    /// make an otherwise-idle ancestor look active (see `propagate_schedulable`).
    /// Reserves the parent heap slot up front so a failed allocation leaves
    /// `node`'s cycle, penalty and active bit untouched.
    fn schedule_in(
        &mut self,
        node: NodeKey,
        parent: NodeKey,
        nwrite: u64,
        mark_active: bool,
    ) -> Result<(), SchedulerError> {
        self.get_mut(parent).pq.try_reserve(1).map_err(|_| SchedulerError::OutOfMemory)?;
        if self.get(node).pe.is_some() {
            self.heap_remove(parent, node);
        }
        let weight = self.get(node).weight as u64;
        let pending = self.get(node).pending_penalty;
        let mut delta = nwrite.saturating_mul(256) / weight + pending;
        let penalty = if delta > MAX_CYCLE_GAP {
            let p = delta - MAX_CYCLE_GAP;
            delta = MAX_CYCLE_GAP;
            p
        } else {
            0
        };
        self.get_mut(node).pending_penalty = penalty;

        let parent_min = self.get(parent).pq.top().map(|h| self.get(h).cycle);
        let node_cycle = self.get(node).cycle;
        let base = parent_min.map_or(node_cycle, |c| c.max(node_cycle));
        self.get_mut(node).cycle = base + delta;
        if mark_active {
            self.get_mut(node).active = true;
        }
        self.heap_push(parent, node)
    }

    /// Marks `node` active after it has written (or been granted)
    /// `nwrite` bytes, updates its virtual-time `cycle`, and makes sure
    /// every ancestor up to the root reflects that this subtree is
    /// non-empty.
    pub fn schedule(&mut self, node: NodeKey, nwrite: u64) -> Result<(), SchedulerError> {
        if node == self.root {
            return Ok(());
        }
        let parent = self.get(node).parent.expect("non-root node always has a parent");
        self.schedule_in(node, parent, nwrite, true)?;
        log::trace!("schedule {:?} nwrite={} cycle={}", self.nid(node), nwrite, self.cycle(node));
        self.propagate_schedulable(parent)
    }

    /// Walks upward from `ancestor`, registering each node into its own
    /// parent's heap if it is schedulable (active, or has a schedulable
    /// child) but not yet registered there. Stops as soon as it finds an
    /// ancestor that is already registered, since everything above that
    /// point already reflects a non-empty subtree. `active` is left
    /// untouched at every level this walk visits: an internal node becomes
    /// schedulable because a descendant is active, not because it is.
    fn propagate_schedulable(&mut self, mut ancestor: NodeKey) -> Result<(), SchedulerError> {
        loop {
            if ancestor == self.root {
                return Ok(());
            }
            if self.get(ancestor).pe.is_some() {
                return Ok(());
            }
            let parent = self.get(ancestor).parent.expect("non-root node always has a parent");
            self.schedule_in(ancestor, parent, 0, false)?;
            ancestor = parent;
        }
    }

    /// Clears `node`'s own `active` bit and, if it now has nothing left
    /// to offer (not active, no schedulable child), removes it from its
    /// parent's heap; this can cascade upward through placeholders that
    /// only existed to shape a now-empty subtree.
    pub fn unschedule(&mut self, mut node: NodeKey) {
        loop {
            if node == self.root {
                return;
            }
            let parent = self.get(node).parent.expect("non-root node always has a parent");
            if self.get(node).pe.is_some() {
                self.heap_remove(parent, node);
            }
            self.get_mut(node).active = false;
            log::trace!("unschedule {:?}", self.nid(node));
            if self.get(parent).pq.is_empty() && !self.get(parent).active {
                node = parent;
            } else {
                return;
            }
        }
    }

    /// Descends from `node` following `pq.top()` until it reaches a node
    /// whose own `pq` is empty. That node is guaranteed to be active,
    /// unless the descent never moved at all (an empty root), in which
    /// case there is nothing to write and this returns `None`.
    pub fn get_next(&self, node: NodeKey) -> Option<NodeId> {
        let mut cur = node;
        loop {
            match self.get(cur).pq.top() {
                Some(next) => cur = next,
                None => {
                    if cur == self.root {
                        return None;
                    }
                    return Some(self.get(cur).nid);
                }
            }
        }
    }

    /// Walks `node`'s ancestor chain looking for `target`. Used to detect
    /// whether a `PRIORITY` frame's new dependency is a descendant of its
    /// subject (which would otherwise create a cycle).
    pub fn find_ascendant(&self, node: NodeKey, target: NodeId) -> Option<NodeKey> {
        let mut cur = self.get(node).parent;
        while let Some(c) = cur {
            if self.get(c).nid == target {
                return Some(c);
            }
            cur = self.get(c).parent;
        }
        None
    }

    /// Reassigns `node`'s parent to `new_parent`, preserving `cycle` and
    /// `pending_penalty` and keeping old and new parents' scheduling state
    /// consistent. Used both by ordinary `PRIORITY` reparenting and by the
    /// cycle-avoiding swap in the scheduler driver.
    pub fn reparent(&mut self, node: NodeKey, new_parent: NodeKey) -> Result<(), SchedulerError> {
        let was_active = self.get(node).active;
        let has_active_desc = !self.get(node).pq.is_empty();
        self.remove(node);
        self.insert(node, new_parent);
        if was_active || has_active_desc {
            self.schedule_in(node, new_parent, 0, was_active)?;
            self.propagate_schedulable(new_parent)?;
        }
        Ok(())
    }

    /// Redistributes `node`'s children onto `node`'s own parent with
    /// rescaled weights, then removes `node` itself. Used when a stream
    /// ends without the peer having reassigned its dependents: its
    /// share degrades into its children instead of vanishing.
    pub fn squash(&mut self, node: NodeKey) -> Result<(), SchedulerError> {
        let parent = self.get(node).parent.expect("squash target must be a non-root node");
        let node_weight = self.get(node).weight as u32;

        let mut children = Vec::new();
        let mut cur = self.get(node).first_child;
        while let Some(c) = cur {
            children.push(c);
            cur = self.get(c).next_sibling;
        }

        self.get_mut(parent)
            .pq
            .try_reserve(children.len())
            .map_err(|_| SchedulerError::OutOfMemory)?;

        for child in children {
            let child_weight = self.get(child).weight as u32;
            let new_weight = squash_weight(child_weight, node_weight);
            let was_active = self.get(child).active;
            let has_active_desc = !self.get(child).pq.is_empty();
            self.remove(child);
            self.insert(child, parent);
            self.get_mut(child).weight = new_weight;
            if was_active || has_active_desc {
                self.schedule_in(child, parent, 0, was_active)?;
                self.propagate_schedulable(parent)?;
            }
            log::debug!(
                "squash: {:?} reparented onto {:?} weight={}",
                self.nid(child),
                self.nid(parent),
                new_weight
            );
        }

        self.remove_and_free(node);
        Ok(())
    }
}

impl Default for Arena {
    fn default() -> Self {
        Self::new()
    }
}

fn clamp_weight(weight: u16) -> u16 {
    weight.clamp(1, 256)
}

/// `(child.weight * node.weight + 128) / 256`, rounded half up, floored at
/// 1: a child inherits a share of its removed parent's weight proportional
/// to the share it already held among its siblings.
fn squash_weight(child_weight: u32, node_weight: u32) -> u16 {
    let scaled = (child_weight * node_weight + 128) / 256;
    scaled.clamp(1, 256) as u16
}
