//! HTTP/3 application-layer pieces that touch stream priority.

pub mod frame;
pub mod priority;
