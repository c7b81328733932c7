//! The ascii-chat video pipeline: pixel quantization, per-row glyph + ANSI
//! rendering, whole-frame assembly, and terminal capability detection.

pub mod caps;
pub mod frame;
pub mod quant;
pub mod render;
pub mod term;
