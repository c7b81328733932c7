//! Terminal capability detection.
//!
//! Color depth comes from `COLORTERM`/`TERM`, the charset from `LANG`, and
//! the cell grid from a `TIOCGWINSZ` ioctl on the controlling TTY (80x24
//! when there is none). The result is an ordered best-to-worst capability
//! preference vector, always terminated by monochrome.

use std::env;

use log::debug;

use crate::caps::{Capability, Charset, Compression, RendererKind, TermCodec, TermFormat};

/// Best color depth the environment advertises. `COLORTERM` naming
/// truecolor wins; otherwise `TERM` substrings decide.
pub fn classify_color(colorterm: Option<&str>, term: Option<&str>) -> TermCodec {
    if let Some(ct) = colorterm {
        if ct.contains("truecolor") || ct.contains("24bit") {
            return TermCodec::Truecolor;
        }
    }
    if let Some(t) = term {
        if t.contains("256color") {
            return TermCodec::C256;
        }
        if t.contains("color") || t.contains("xterm") {
            return TermCodec::C16;
        }
    }
    TermCodec::Mono
}

pub fn classify_charset(lang: Option<&str>) -> Charset {
    match lang {
        Some(l) => {
            let l = l.to_ascii_uppercase();
            if l.contains("UTF-8") || l.contains("UTF8") {
                Charset::Utf8
            } else {
                Charset::Ascii
            }
        }
        None => Charset::Ascii,
    }
}

/// The xterm family implements ECMA-48 REP; most other emulators don't
/// admit to it.
pub fn classify_csi_rep(term: Option<&str>) -> bool {
    term.map_or(false, |t| t.contains("xterm"))
}

#[cfg(unix)]
mod ioctl {
    use nix::ioctl_read_bad;
    use nix::libc;

    // TIOCGWINSZ predates the encoded-ioctl convention, hence _bad.
    ioctl_read_bad!(tiocgwinsz, libc::TIOCGWINSZ, libc::winsize);
}

#[cfg(unix)]
fn tty_size() -> Option<(u16, u16)> {
    use nix::libc;

    let mut ws = libc::winsize {
        ws_row: 0,
        ws_col: 0,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    // Safety: the generated wrapper only writes the winsize out-parameter.
    match unsafe { ioctl::tiocgwinsz(libc::STDOUT_FILENO, &mut ws) } {
        Ok(_) if ws.ws_col > 0 && ws.ws_row > 0 => Some((ws.ws_col, ws.ws_row)),
        _ => None,
    }
}

#[cfg(not(unix))]
fn tty_size() -> Option<(u16, u16)> {
    None
}

/// (cols, rows) of the controlling TTY, or the classic 80x24.
pub fn detect_size() -> (u16, u16) {
    tty_size().unwrap_or((80, 24))
}

/// Builds the ordered preference vector for a detected environment.
pub fn build_preferences(
    codec: TermCodec,
    charset: Charset,
    size: (u16, u16),
    csi_rep: bool,
) -> Vec<Capability> {
    let ladder: &[TermCodec] = match codec {
        TermCodec::Truecolor => &[
            TermCodec::Truecolor,
            TermCodec::C256,
            TermCodec::C16,
            TermCodec::Mono,
        ],
        TermCodec::C256 => &[TermCodec::C256, TermCodec::C16, TermCodec::Mono],
        TermCodec::C16 => &[TermCodec::C16, TermCodec::Mono],
        TermCodec::Mono => &[TermCodec::Mono],
    };
    let renderer = if charset == Charset::Ascii {
        RendererKind::Block
    } else {
        RendererKind::HalfBlock
    };
    ladder
        .iter()
        .map(|&codec| {
            let mono = codec == TermCodec::Mono;
            Capability {
                codec,
                format: TermFormat {
                    width: size.0,
                    height: size.1,
                    renderer: if mono { RendererKind::Block } else { renderer },
                    charset: if mono { Charset::Ascii } else { charset },
                    compression: Compression::None,
                    csi_rep,
                },
            }
        })
        .collect()
}

/// Probes the local environment and TTY.
pub fn detect() -> Vec<Capability> {
    let colorterm = env::var("COLORTERM").ok();
    let term = env::var("TERM").ok();
    let lang = env::var("LANG").ok();
    let codec = classify_color(colorterm.as_deref(), term.as_deref());
    let charset = classify_charset(lang.as_deref());
    let size = detect_size();
    let csi_rep = classify_csi_rep(term.as_deref());
    debug!(
        "terminal probe: codec={} charset={} size={}x{} csi_rep={}",
        codec,
        charset.wire_name(),
        size.0,
        size.1,
        csi_rep
    );
    build_preferences(codec, charset, size, csi_rep)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn color_classification() {
        assert_eq!(classify_color(Some("truecolor"), None), TermCodec::Truecolor);
        assert_eq!(classify_color(Some("24bit"), Some("vt100")), TermCodec::Truecolor);
        assert_eq!(classify_color(None, Some("xterm-256color")), TermCodec::C256);
        assert_eq!(classify_color(None, Some("screen-256color")), TermCodec::C256);
        assert_eq!(classify_color(None, Some("xterm")), TermCodec::C16);
        assert_eq!(classify_color(None, Some("ansi-color")), TermCodec::C16);
        assert_eq!(classify_color(None, Some("vt100")), TermCodec::Mono);
        assert_eq!(classify_color(None, None), TermCodec::Mono);
    }

    #[test]
    fn charset_classification() {
        assert_eq!(classify_charset(Some("en_US.UTF-8")), Charset::Utf8);
        assert_eq!(classify_charset(Some("C.utf8")), Charset::Utf8);
        assert_eq!(classify_charset(Some("C")), Charset::Ascii);
        assert_eq!(classify_charset(None), Charset::Ascii);
    }

    #[test]
    fn csi_rep_classification() {
        assert!(classify_csi_rep(Some("xterm-256color")));
        assert!(!classify_csi_rep(Some("screen")));
        assert!(!classify_csi_rep(None));
    }

    #[test]
    fn preference_ladders_end_in_mono() {
        for &codec in &[
            TermCodec::Truecolor,
            TermCodec::C256,
            TermCodec::C16,
            TermCodec::Mono,
        ] {
            let prefs = build_preferences(codec, Charset::Utf8, (100, 40), true);
            assert_eq!(prefs.first().unwrap().codec, codec);
            assert_eq!(prefs.last().unwrap().codec, TermCodec::Mono);
            // Strictly decreasing quality, no duplicates.
            for pair in prefs.windows(2) {
                assert_ne!(pair[0].codec, pair[1].codec);
            }
        }
    }

    #[test]
    fn preference_formats() {
        let prefs = build_preferences(TermCodec::Truecolor, Charset::Utf8, (132, 50), true);
        assert_eq!(prefs.len(), 4);
        let best = &prefs[0];
        assert_eq!(best.format.width, 132);
        assert_eq!(best.format.height, 50);
        assert_eq!(best.format.renderer, RendererKind::HalfBlock);
        assert_eq!(best.format.charset, Charset::Utf8);
        assert!(best.format.csi_rep);
        // The mono terminator is plain ASCII blocks.
        let mono = prefs.last().unwrap();
        assert_eq!(mono.format.renderer, RendererKind::Block);
        assert_eq!(mono.format.charset, Charset::Ascii);
    }

    #[test]
    fn ascii_environment_prefers_block() {
        let prefs = build_preferences(TermCodec::C256, Charset::Ascii, (80, 24), false);
        assert!(prefs.iter().all(|c| c.format.renderer == RendererKind::Block));
    }
}
