//! The decoded form of the HTTP/3 `PRIORITY` frame.
//!
//! Everything upstream of this module — varint decoding, frame-length
//! framing, QPACK — belongs to the frame decoder, not to this crate. What
//! the decoder hands over once it has parsed a `PRIORITY` frame off the
//! wire is exactly the [`PriorityFrame`] below.

/// What kind of entity the frame's *subject* element names.
///
/// `Current` is only legal when the frame arrives on the stream it
/// reprioritizes (a request stream naming itself); it is illegal on the
/// control stream, where every `PRIORITY` frame must name its subject
/// explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PriElemType {
    Request,
    Push,
    Placeholder,
    Current,
}

/// What kind of entity the frame's *dependency* element names.
///
/// `Root` carries no id: it means "depend directly on the connection
/// root", i.e. no reprioritization relative to any other stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElemDepType {
    Request,
    Push,
    Placeholder,
    Root,
}

/// Decoded `PRIORITY` frame payload.
///
/// `pri_elem_id` is `None` iff `pri_elem_type == Current`; `elem_dep_id` is
/// `None` iff `elem_dep_type == Root`. `weight` is the raw wire byte `w`;
/// the actual weight is `w + 1`, giving the `[1, 256]` range — use
/// [`PriorityFrame::weight_value`] rather than reading the field directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriorityFrame {
    pub pri_elem_type: PriElemType,
    pub elem_dep_type: ElemDepType,
    pub pri_elem_id: Option<i64>,
    pub elem_dep_id: Option<i64>,
    pub weight: u8,
}

impl PriorityFrame {
    /// The weight in `[1, 256]` this frame requests, decoded from the raw
    /// wire byte (`weight + 1`).
    pub fn weight_value(&self) -> u16 {
        self.weight as u16 + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weight_value_decodes_plus_one() {
        let frame = PriorityFrame {
            pri_elem_type: PriElemType::Current,
            elem_dep_type: ElemDepType::Root,
            pri_elem_id: None,
            elem_dep_id: None,
            weight: 0,
        };
        assert_eq!(frame.weight_value(), 1);

        let frame = PriorityFrame { weight: 255, ..frame };
        assert_eq!(frame.weight_value(), 256);
    }
}
