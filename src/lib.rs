//! A weighted priority tree scheduler for HTTP/3 streams.
//!
//! An HTTP/3 connection multiplexes many streams over a single QUIC
//! connection; at any moment several of them may have bytes ready to send.
//! This crate decides, in constant time amortized over the life of a
//! connection, which one goes next. It does so with a tree of priority
//! nodes (`tnode`s) mirroring the dependency structure a peer expresses
//! through `PRIORITY` frames, with weighted fair sharing among siblings
//! driven by a virtual-time "cycle" accumulated from bytes written.
//!
//! Frame parsing, QPACK, and connection I/O are not this crate's concern;
//! see [`http::frame`] for the narrow decoded-frame contract it does
//! depend on, and [`http::priority::scheduler`] for the entry points a
//! connection calls into.

pub mod http;

pub use http::frame::{ElemDepType, PriElemType, PriorityFrame};
pub use http::priority::error::SchedulerError;
pub use http::priority::nid::{NodeId, NodeKind};
pub use http::priority::scheduler::{FrameSource, Scheduler, SchedulerConfig};
