//! Terminal codec and format descriptors.
//!
//! These form the negotiable capability space: a [TermCodec] names a color
//! depth, a [TermFormat] the cell grid and rendering knobs. The closed set
//! of codec × renderer combinations is dispatched as tagged variants, never
//! trait objects.

use std::fmt;
use std::str::FromStr;

/// Color depth of the remote terminal, best to worst.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TermCodec {
    Truecolor,
    C256,
    C16,
    Mono,
}

impl TermCodec {
    /// Capability tag used in SDP rtpmap lines.
    pub fn sdp_token(self) -> &'static str {
        match self {
            TermCodec::Truecolor => "ACIP-TC",
            TermCodec::C256 => "ACIP-256",
            TermCodec::C16 => "ACIP-16",
            TermCodec::Mono => "ACIP-MONO",
        }
    }

    pub fn from_sdp_token(token: &str) -> Option<Self> {
        match token {
            "ACIP-TC" => Some(TermCodec::Truecolor),
            "ACIP-256" => Some(TermCodec::C256),
            "ACIP-16" => Some(TermCodec::C16),
            "ACIP-MONO" => Some(TermCodec::Mono),
            _ => None,
        }
    }

    /// Positional payload-type mapping: 96..=99.
    pub fn from_payload_type(pt: u8) -> Option<Self> {
        match pt {
            96 => Some(TermCodec::Truecolor),
            97 => Some(TermCodec::C256),
            98 => Some(TermCodec::C16),
            99 => Some(TermCodec::Mono),
            _ => None,
        }
    }
}

impl fmt::Display for TermCodec {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            TermCodec::Truecolor => "truecolor",
            TermCodec::C256 => "256color",
            TermCodec::C16 => "16color",
            TermCodec::Mono => "mono",
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RendererKind {
    Block,
    HalfBlock,
    Braille,
}

impl RendererKind {
    pub fn wire_name(self) -> &'static str {
        match self {
            RendererKind::Block => "block",
            RendererKind::HalfBlock => "halfblock",
            RendererKind::Braille => "braille",
        }
    }

    /// Pixel rows consumed per terminal cell row.
    pub fn rows_per_cell(self) -> usize {
        match self {
            RendererKind::Block => 1,
            RendererKind::HalfBlock => 2,
            RendererKind::Braille => 4,
        }
    }

    /// Pixel columns consumed per terminal cell.
    pub fn cols_per_cell(self) -> usize {
        match self {
            RendererKind::Block | RendererKind::HalfBlock => 1,
            RendererKind::Braille => 2,
        }
    }
}

impl FromStr for RendererKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        match s {
            "block" => Ok(RendererKind::Block),
            "halfblock" => Ok(RendererKind::HalfBlock),
            "braille" => Ok(RendererKind::Braille),
            _ => Err(()),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Charset {
    Ascii,
    Utf8,
    Utf8Wide,
}

impl Charset {
    pub fn wire_name(self) -> &'static str {
        match self {
            Charset::Ascii => "ascii",
            Charset::Utf8 => "utf8",
            Charset::Utf8Wide => "utf8_wide",
        }
    }
}

impl FromStr for Charset {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        match s {
            "ascii" => Ok(Charset::Ascii),
            "utf8" => Ok(Charset::Utf8),
            "utf8_wide" => Ok(Charset::Utf8Wide),
            _ => Err(()),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Compression {
    None,
    Rle,
    Zstd,
}

impl Compression {
    pub fn wire_name(self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Rle => "rle",
            Compression::Zstd => "zstd",
        }
    }
}

impl FromStr for Compression {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        match s {
            "none" => Ok(Compression::None),
            "rle" => Ok(Compression::Rle),
            "zstd" => Ok(Compression::Zstd),
            _ => Err(()),
        }
    }
}

/// Cell grid and rendering knobs for one capability. A zero width/height
/// means "unspecified" in override contexts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TermFormat {
    pub width: u16,
    pub height: u16,
    pub renderer: RendererKind,
    pub charset: Charset,
    pub compression: Compression,
    pub csi_rep: bool,
}

impl Default for TermFormat {
    fn default() -> Self {
        TermFormat {
            width: 0,
            height: 0,
            renderer: RendererKind::Block,
            charset: Charset::Ascii,
            compression: Compression::None,
            csi_rep: false,
        }
    }
}

/// One negotiable (codec, format) pair; the SDP "custom codec" unit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Capability {
    pub codec: TermCodec,
    pub format: TermFormat,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} {}x{} {} {} {}{}",
            self.codec,
            self.format.width,
            self.format.height,
            self.format.renderer.wire_name(),
            self.format.charset.wire_name(),
            self.format.compression.wire_name(),
            if self.format.csi_rep { " +rep" } else { "" },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sdp_token_roundtrip() {
        for codec in [TermCodec::Truecolor, TermCodec::C256, TermCodec::C16, TermCodec::Mono].iter() {
            assert_eq!(TermCodec::from_sdp_token(codec.sdp_token()), Some(*codec));
        }
        assert_eq!(TermCodec::from_sdp_token("H264"), None);
    }

    #[test]
    fn payload_type_positions() {
        assert_eq!(TermCodec::from_payload_type(96), Some(TermCodec::Truecolor));
        assert_eq!(TermCodec::from_payload_type(97), Some(TermCodec::C256));
        assert_eq!(TermCodec::from_payload_type(98), Some(TermCodec::C16));
        assert_eq!(TermCodec::from_payload_type(99), Some(TermCodec::Mono));
        assert_eq!(TermCodec::from_payload_type(100), None);
    }

    #[test]
    fn wire_name_roundtrip() {
        for r in [RendererKind::Block, RendererKind::HalfBlock, RendererKind::Braille].iter() {
            assert_eq!(r.wire_name().parse(), Ok(*r));
        }
        for c in [Charset::Ascii, Charset::Utf8, Charset::Utf8Wide].iter() {
            assert_eq!(c.wire_name().parse(), Ok(*c));
        }
        for c in [Compression::None, Compression::Rle, Compression::Zstd].iter() {
            assert_eq!(c.wire_name().parse(), Ok(*c));
        }
    }
}
