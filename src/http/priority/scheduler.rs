//! The connection-facing driver: translates stream lifecycle events and
//! decoded `PRIORITY` frames into operations on the [`Arena`], and answers
//! "what should I write next".

use std::collections::HashMap;

use crate::http::frame::{ElemDepType, PriElemType, PriorityFrame};
use crate::http::priority::error::SchedulerError;
use crate::http::priority::nid::{NodeId, NodeKind};
use crate::http::priority::tnode::{Arena, NodeKey};

/// Where a `PRIORITY` frame arrived from. `PriElemType::Current` is only
/// meaningful on `Stream`, where it names the stream carrying the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameSource {
    Control,
    Stream(i64),
}

/// Connection-wide limits the scheduler enforces on frame contents.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    /// Number of placeholders the peer negotiated; placeholder ids outside
    /// `[0, num_placeholders)` are rejected as `InvalidTarget`.
    pub num_placeholders: u32,
    /// Largest request or push stream id the peer may legally reference.
    pub max_stream_id: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig { num_placeholders: 0, max_stream_id: i64::MAX }
    }
}

/// Owns a connection's priority tree and the id-to-node lookup over it.
pub struct Scheduler {
    arena: Arena,
    config: SchedulerConfig,
    index: HashMap<NodeId, NodeKey>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        let arena = Arena::new();
        let mut index = HashMap::new();
        index.insert(NodeId::ROOT, arena.root());
        Scheduler { arena, config, index }
    }

    fn resolve(&self, nid: NodeId) -> Option<NodeKey> {
        self.index.get(&nid).copied()
    }

    /// Resolves `nid` to a node, auto-creating it parked under the root
    /// with the default weight if nothing has named it yet. Covers a
    /// `PRIORITY` frame that depends on (or reprioritizes) a stream that
    /// has not been opened yet; its real position is filled in once it is.
    fn resolve_or_create(&mut self, nid: NodeId) -> Result<NodeKey, SchedulerError> {
        if let Some(key) = self.resolve(nid) {
            return Ok(key);
        }
        if nid.kind == NodeKind::Placeholder {
            self.validate_placeholder_id(nid.id)?;
        }
        let root = self.arena.root();
        let key = self.arena.create_node(nid, 16, root)?;
        self.index.insert(nid, key);
        Ok(key)
    }

    fn validate_stream_id(&self, id: i64) -> Result<(), SchedulerError> {
        if id < 0 || id > self.config.max_stream_id {
            Err(SchedulerError::InvalidTarget)
        } else {
            Ok(())
        }
    }

    fn validate_placeholder_id(&self, id: i64) -> Result<(), SchedulerError> {
        if id < 0 || id as u64 >= self.config.num_placeholders as u64 {
            Err(SchedulerError::InvalidTarget)
        } else {
            Ok(())
        }
    }

    /// Registers a newly opened stream, push, or placeholder at the given
    /// default dependency and weight. If a `PRIORITY` frame already
    /// forward-referenced `nid` (see `resolve_or_create`), that explicit
    /// priority takes precedence and this call is a no-op: the node
    /// already exists and already sits where the frame put it.
    pub fn on_create(&mut self, nid: NodeId, dep: NodeId, weight: u16) -> Result<(), SchedulerError> {
        if self.index.contains_key(&nid) {
            log::debug!("on_create {:?}: already forward-referenced, keeping its priority", nid);
            return Ok(());
        }
        let dep_key = self.resolve_or_create(dep)?;
        let key = self.arena.create_node(nid, weight, dep_key)?;
        self.index.insert(nid, key);
        log::debug!("on_create {:?} dep={:?} weight={}", nid, dep, weight);
        Ok(())
    }

    fn pri_elem_id(&self, frame: &PriorityFrame, source: FrameSource) -> Result<NodeId, SchedulerError> {
        match frame.pri_elem_type {
            PriElemType::Current => match source {
                FrameSource::Stream(id) => {
                    self.validate_stream_id(id)?;
                    Ok(NodeId::stream(id))
                }
                // `current` names "the stream this frame arrived on"; the
                // control stream has no such referent.
                FrameSource::Control => Err(SchedulerError::MalformedPriority),
            },
            PriElemType::Request => {
                // only `current` may name a request stream's own frame.
                if matches!(source, FrameSource::Stream(_)) {
                    return Err(SchedulerError::MalformedPriority);
                }
                let id = frame.pri_elem_id.ok_or(SchedulerError::MalformedPriority)?;
                self.validate_stream_id(id)?;
                Ok(NodeId::stream(id))
            }
            PriElemType::Push => {
                if matches!(source, FrameSource::Stream(_)) {
                    return Err(SchedulerError::MalformedPriority);
                }
                let id = frame.pri_elem_id.ok_or(SchedulerError::MalformedPriority)?;
                self.validate_stream_id(id)?;
                Ok(NodeId::push(id))
            }
            PriElemType::Placeholder => {
                if matches!(source, FrameSource::Stream(_)) {
                    return Err(SchedulerError::MalformedPriority);
                }
                let id = frame.pri_elem_id.ok_or(SchedulerError::MalformedPriority)?;
                self.validate_placeholder_id(id)?;
                Ok(NodeId::placeholder(id))
            }
        }
    }

    fn dep_elem_id(&self, frame: &PriorityFrame) -> Result<NodeId, SchedulerError> {
        match frame.elem_dep_type {
            ElemDepType::Root => Ok(NodeId::ROOT),
            ElemDepType::Request => {
                let id = frame.elem_dep_id.ok_or(SchedulerError::MalformedPriority)?;
                self.validate_stream_id(id)?;
                Ok(NodeId::stream(id))
            }
            ElemDepType::Push => {
                let id = frame.elem_dep_id.ok_or(SchedulerError::MalformedPriority)?;
                self.validate_stream_id(id)?;
                Ok(NodeId::push(id))
            }
            ElemDepType::Placeholder => {
                let id = frame.elem_dep_id.ok_or(SchedulerError::MalformedPriority)?;
                self.validate_placeholder_id(id)?;
                Ok(NodeId::placeholder(id))
            }
        }
    }

    /// Validates and applies a decoded `PRIORITY` frame.
    pub fn handle_priority_frame(
        &mut self,
        source: FrameSource,
        frame: &PriorityFrame,
    ) -> Result<(), SchedulerError> {
        let subject = self.pri_elem_id(frame, source)?;
        let new_dep = self.dep_elem_id(frame)?;
        self.on_priority(subject, new_dep, frame.weight_value())
    }

    /// Reparents `subject` onto `new_dep` with the given weight. If
    /// `new_dep` is currently a descendant of `subject`, `new_dep` is
    /// lifted into `subject`'s old slot first so the move can never leave
    /// a cycle in the tree.
    pub fn on_priority(
        &mut self,
        subject: NodeId,
        new_dep: NodeId,
        weight: u16,
    ) -> Result<(), SchedulerError> {
        if subject == new_dep || subject.is_root() {
            return Err(SchedulerError::MalformedPriority);
        }

        let subject_key = self.resolve_or_create(subject)?;
        let new_dep_key = self.resolve_or_create(new_dep)?;

        if self.arena.find_ascendant(new_dep_key, subject).is_some() {
            let old_parent = self
                .arena
                .parent_of(subject_key)
                .expect("subject is non-root and therefore has a parent");
            log::warn!(
                "priority cycle averted: {:?} would become its own descendant via {:?}; swapping {:?} into its old slot first",
                subject, new_dep, new_dep
            );
            self.arena.reparent(new_dep_key, old_parent)?;
        }

        self.arena.reparent(subject_key, new_dep_key)?;
        self.arena.set_weight(subject_key, weight);
        log::debug!("reprioritized {:?} onto {:?} weight={}", subject, new_dep, weight);
        Ok(())
    }

    /// Records that `nid` has written `nwritten` bytes, advancing its
    /// virtual-time `cycle` and marking it active.
    pub fn on_write(&mut self, nid: NodeId, nwritten: u64) -> Result<(), SchedulerError> {
        let key = self.resolve(nid).ok_or(SchedulerError::InvalidTarget)?;
        log::trace!("on_write {:?} nwritten={}", nid, nwritten);
        self.arena.schedule(key, nwritten)
    }

    /// Marks `nid` idle without removing it from the tree (it has nothing
    /// to write right now, but may again later).
    pub fn on_idle(&mut self, nid: NodeId) -> Result<(), SchedulerError> {
        let key = self.resolve(nid).ok_or(SchedulerError::InvalidTarget)?;
        self.arena.unschedule(key);
        Ok(())
    }

    /// A stream, push, or placeholder is gone for good. If it still has
    /// dependents, its weighted share degrades into them (`squash`)
    /// rather than disappearing outright.
    pub fn on_stream_end(&mut self, nid: NodeId) -> Result<(), SchedulerError> {
        let key = match self.resolve(nid) {
            Some(key) => key,
            None => return Ok(()),
        };
        self.arena.unschedule(key);
        if self.arena.num_children(key) > 0 {
            self.arena.squash(key)?;
        } else {
            self.arena.remove_and_free(key);
        }
        self.index.remove(&nid);
        log::debug!("on_stream_end {:?}", nid);
        Ok(())
    }

    /// The id of the stream that should write next, or `None` if nothing
    /// on the connection is schedulable.
    pub fn pick_next(&self) -> Option<NodeId> {
        self.arena.get_next(self.arena.root())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::frame::{ElemDepType, PriElemType, PriorityFrame};

    fn frame(
        pri_elem_type: PriElemType,
        pri_elem_id: Option<i64>,
        elem_dep_type: ElemDepType,
        elem_dep_id: Option<i64>,
        weight: u8,
    ) -> PriorityFrame {
        PriorityFrame { pri_elem_type, elem_dep_type, pri_elem_id, elem_dep_id, weight }
    }

    #[test]
    fn default_priority_is_root_dependent_and_schedulable() {
        let mut sched = Scheduler::new(SchedulerConfig::default());
        sched.on_create(NodeId::stream(1), NodeId::ROOT, 16).unwrap();
        assert_eq!(sched.pick_next(), None);
        sched.on_write(NodeId::stream(1), 100).unwrap();
        assert_eq!(sched.pick_next(), Some(NodeId::stream(1)));
    }

    #[test]
    fn priority_frame_on_not_yet_created_stream_is_remembered() {
        let mut sched = Scheduler::new(SchedulerConfig::default());
        let f = frame(PriElemType::Request, Some(5), ElemDepType::Root, None, 31);
        sched.handle_priority_frame(FrameSource::Control, &f).unwrap();
        sched.on_create(NodeId::stream(5), NodeId::ROOT, 16).unwrap();
        sched.on_write(NodeId::stream(5), 10).unwrap();
        assert_eq!(sched.pick_next(), Some(NodeId::stream(5)));
    }

    #[test]
    fn reprioritizing_onto_a_descendant_avoids_a_cycle() {
        let mut sched = Scheduler::new(SchedulerConfig::default());
        sched.on_create(NodeId::stream(1), NodeId::ROOT, 16).unwrap();
        sched.on_create(NodeId::stream(2), NodeId::stream(1), 16).unwrap();
        // 2 currently depends on 1; now make 1 depend on 2.
        sched.on_priority(NodeId::stream(1), NodeId::stream(2), 16).unwrap();

        let one = *sched.index.get(&NodeId::stream(1)).unwrap();
        let two = *sched.index.get(&NodeId::stream(2)).unwrap();
        // 1 now depends on 2, and 2 was lifted into 1's old slot (root).
        assert_eq!(sched.arena.parent_of(one), Some(two));
        assert_eq!(sched.arena.parent_of(two), Some(sched.arena.root()));
    }

    #[test]
    fn self_dependency_is_rejected() {
        let mut sched = Scheduler::new(SchedulerConfig::default());
        sched.on_create(NodeId::stream(1), NodeId::ROOT, 16).unwrap();
        let err = sched.on_priority(NodeId::stream(1), NodeId::stream(1), 16).unwrap_err();
        assert_eq!(err, SchedulerError::MalformedPriority);
    }

    #[test]
    fn current_on_control_stream_is_rejected() {
        let mut sched = Scheduler::new(SchedulerConfig::default());
        let f = frame(PriElemType::Current, None, ElemDepType::Root, None, 16);
        let err = sched.handle_priority_frame(FrameSource::Control, &f).unwrap_err();
        assert_eq!(err, SchedulerError::MalformedPriority);
    }

    #[test]
    fn current_on_its_own_stream_is_accepted() {
        let mut sched = Scheduler::new(SchedulerConfig::default());
        sched.on_create(NodeId::stream(7), NodeId::ROOT, 16).unwrap();
        let f = frame(PriElemType::Current, None, ElemDepType::Root, None, 200);
        sched.handle_priority_frame(FrameSource::Stream(7), &f).unwrap();
    }

    #[test]
    fn request_on_a_request_stream_is_rejected() {
        let mut sched = Scheduler::new(SchedulerConfig::default());
        sched.on_create(NodeId::stream(7), NodeId::ROOT, 16).unwrap();
        let f = frame(PriElemType::Request, Some(99), ElemDepType::Root, None, 16);
        let err = sched.handle_priority_frame(FrameSource::Stream(7), &f).unwrap_err();
        assert_eq!(err, SchedulerError::MalformedPriority);
    }

    #[test]
    fn placeholder_beyond_negotiated_count_is_invalid() {
        let config = SchedulerConfig { num_placeholders: 2, max_stream_id: i64::MAX };
        let mut sched = Scheduler::new(config);
        let f = frame(PriElemType::Placeholder, Some(5), ElemDepType::Root, None, 16);
        let err = sched.handle_priority_frame(FrameSource::Control, &f).unwrap_err();
        assert_eq!(err, SchedulerError::InvalidTarget);
    }

    #[test]
    fn push_id_beyond_max_stream_id_is_invalid() {
        let config = SchedulerConfig { num_placeholders: 0, max_stream_id: 10 };
        let mut sched = Scheduler::new(config);
        let subject_oob = frame(PriElemType::Push, Some(11), ElemDepType::Root, None, 16);
        let err = sched.handle_priority_frame(FrameSource::Control, &subject_oob).unwrap_err();
        assert_eq!(err, SchedulerError::InvalidTarget);

        sched.on_create(NodeId::stream(1), NodeId::ROOT, 16).unwrap();
        let dep_oob = frame(PriElemType::Request, Some(1), ElemDepType::Push, Some(11), 16);
        let err = sched.handle_priority_frame(FrameSource::Control, &dep_oob).unwrap_err();
        assert_eq!(err, SchedulerError::InvalidTarget);
    }

    #[test]
    fn stream_end_squashes_weight_into_surviving_children() {
        let mut sched = Scheduler::new(SchedulerConfig::default());
        sched.on_create(NodeId::stream(1), NodeId::ROOT, 32).unwrap();
        sched.on_create(NodeId::stream(2), NodeId::stream(1), 16).unwrap();
        sched.on_write(NodeId::stream(2), 10).unwrap();
        sched.on_stream_end(NodeId::stream(1)).unwrap();
        assert_eq!(sched.pick_next(), Some(NodeId::stream(2)));
    }

    #[test]
    fn stream_end_without_children_frees_the_node() {
        let mut sched = Scheduler::new(SchedulerConfig::default());
        sched.on_create(NodeId::stream(1), NodeId::ROOT, 16).unwrap();
        sched.on_write(NodeId::stream(1), 10).unwrap();
        sched.on_stream_end(NodeId::stream(1)).unwrap();
        assert_eq!(sched.pick_next(), None);
    }
}
