// A "priority tree" orders every stream on a connection into an n-ary tree
// under a single root, and decides which active stream gets to write next.
//
// The tree is shaped by PRIORITY frames from the peer:
//
//   - A stream depends on another stream, a placeholder, or the root.
//   - A weight in [1, 256] controls how a stream shares bandwidth with its
//     siblings once their common parent is otherwise blocked.
//   - Reprioritizing a stream onto one of its own descendants does not
//     create a cycle: the descendant is lifted into the stream's old slot
//     first (see `scheduler::Scheduler::on_priority` for the swap).
//   - A stream's weighted share degrades gracefully into its children's
//     once the stream itself closes without reassigning its dependents
//     (`squash`), rather than dropping its subtree's priority entirely.
//
// Picking the next stream to write is then a matter of descending the tree
// via each level's highest-priority (lowest virtual-time `cycle`) child,
// which is what the per-node heap in `tnode` exists to make O(log n).

pub mod error;
pub mod nid;
pub mod pq;
pub mod scheduler;
pub mod tnode;
