//! Input shaping: turn oversized documents into provider-ready payloads.

pub mod pages;
pub mod windowing;

pub use pages::{ChunkError, ChunkRange, PageMapping, PageResolution};
pub use windowing::{shape_transcript, ShapeError, ShapeMode, ShapedTranscript, WindowOptions};
