//! Per-row glyph and ANSI-escape emission.
//!
//! Four variants (foreground ramp, background block, halfblock pairs,
//! braille tiles) share one output-side run-length encoder: consecutive
//! cells with identical (style, glyph) collapse into a single style change
//! plus either a CSI REP sequence or literal repeats. Every write is
//! bounds-checked against the destination; when the pending block doesn't
//! fit, the renderer reports a short write and the caller grows the
//! destination and retries the row.

use crate::caps::TermCodec;
use crate::quant::{ansi16, dither256, luma, xterm256, Rgb};

/// Monotone luminance ramp for foreground glyph modes, darkest first.
pub const ASCII_RAMP: &[u8] = b"   ...',;:clodxkO0KXNWM";

/// Runs shorter than this are cheaper as literal bytes than as CSI REP.
pub const REP_MIN_RUN: usize = 3;

/// On/off cut for monochrome halfblock and braille dots.
const LUMA_THRESHOLD: u8 = 128;

/// The destination is too small for the pending output. Grow and retry;
/// rendering a row is pure, so the retry is exact.
#[derive(Debug, PartialEq, Eq)]
pub struct ShortWrite;

#[derive(Clone, Copy, Debug)]
pub struct RowOptions {
    pub codec: TermCodec,
    /// Paint cell backgrounds (block mode) instead of foreground glyphs.
    pub background: bool,
    /// Terminal understands `ESC [ Pn b` (ECMA-48 REP).
    pub csi_rep: bool,
    /// Minimum run length before REP is worth emitting.
    pub rep_min_run: usize,
    /// Ordered dithering before 256-color quantization. Ignored for other
    /// codecs.
    pub dither: bool,
}

impl RowOptions {
    pub fn new(codec: TermCodec) -> Self {
        RowOptions {
            codec,
            background: false,
            csi_rep: false,
            rep_min_run: REP_MIN_RUN,
            dither: true,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ColorSpec {
    Rgb(u8, u8, u8),
    Idx(u8),
    Ansi(u8),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Style {
    fg: Option<ColorSpec>,
    bg: Option<ColorSpec>,
}

impl Style {
    const NONE: Style = Style { fg: None, bg: None };
}

struct Run {
    style: Style,
    glyph: char,
    count: usize,
}

/// Output-side RLE driver shared by all renderer variants.
struct RleEmitter<'a> {
    out: &'a mut [u8],
    pos: usize,
    run: Option<Run>,
    /// Style of the last flushed output; `None` until the first flush.
    last_style: Option<Style>,
    csi_rep: bool,
    rep_min_run: usize,
}

impl<'a> RleEmitter<'a> {
    fn new(out: &'a mut [u8], csi_rep: bool, rep_min_run: usize) -> Self {
        RleEmitter {
            out,
            pos: 0,
            run: None,
            last_style: None,
            csi_rep,
            rep_min_run,
        }
    }

    fn push(&mut self, style: Style, glyph: char) -> Result<(), ShortWrite> {
        if let Some(run) = &mut self.run {
            if run.style == style && run.glyph == glyph {
                run.count += 1;
                return Ok(());
            }
        }
        self.flush()?;
        self.run = Some(Run {
            style,
            glyph,
            count: 1,
        });
        Ok(())
    }

    /// Writes at most one style change and one glyph-plus-repeat block,
    /// clearing the run. A zero-length run writes nothing.
    fn flush(&mut self) -> Result<(), ShortWrite> {
        let run = match self.run.take() {
            Some(r) => r,
            None => return Ok(()),
        };
        self.write_style(run.style)?;
        let mut gbuf = [0u8; 4];
        let glyph = run.glyph.encode_utf8(&mut gbuf).as_bytes();
        if self.csi_rep && run.count >= self.rep_min_run {
            self.write_bytes(glyph)?;
            self.write_seq(format_args!("\x1b[{}b", run.count - 1))?;
        } else {
            for _ in 0..run.count {
                self.write_bytes(glyph)?;
            }
        }
        Ok(())
    }

    fn finish(mut self) -> Result<usize, ShortWrite> {
        self.flush()?;
        Ok(self.pos)
    }

    fn write_style(&mut self, style: Style) -> Result<(), ShortWrite> {
        let fg_changed = self.last_style.map(|s| s.fg) != Some(style.fg);
        let bg_changed = self.last_style.map(|s| s.bg) != Some(style.bg);
        if fg_changed {
            if let Some(c) = style.fg {
                self.write_color(c, true)?;
            }
        }
        if bg_changed {
            if let Some(c) = style.bg {
                self.write_color(c, false)?;
            }
        }
        self.last_style = Some(style);
        Ok(())
    }

    fn write_color(&mut self, color: ColorSpec, fg: bool) -> Result<(), ShortWrite> {
        match color {
            ColorSpec::Rgb(r, g, b) => self.write_seq(format_args!(
                "\x1b[{};2;{};{};{}m",
                if fg { 38 } else { 48 },
                r,
                g,
                b
            )),
            ColorSpec::Idx(n) => {
                self.write_seq(format_args!("\x1b[{};5;{}m", if fg { 38 } else { 48 }, n))
            }
            ColorSpec::Ansi(n) => {
                let n = u16::from(n);
                let code = match (fg, n < 8) {
                    (true, true) => 30 + n,
                    (true, false) => 90 + n - 8,
                    (false, true) => 40 + n,
                    (false, false) => 100 + n - 8,
                };
                self.write_seq(format_args!("\x1b[{}m", code))
            }
        }
    }

    fn write_seq(&mut self, args: std::fmt::Arguments) -> Result<(), ShortWrite> {
        use std::io::Write;
        let mut tmp = [0u8; 24];
        let n = {
            let mut cursor = std::io::Cursor::new(&mut tmp[..]);
            // The longest sequence emitted here is 19 bytes.
            cursor.write_fmt(args).map_err(|_| ShortWrite)?;
            cursor.position() as usize
        };
        self.write_bytes(&tmp[..n])
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), ShortWrite> {
        if bytes.len() > self.out.len() - self.pos {
            return Err(ShortWrite);
        }
        self.out[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
        Ok(())
    }
}

fn color_of(opts: &RowOptions, px: Rgb, x: u32, y: u32) -> Option<ColorSpec> {
    match opts.codec {
        TermCodec::Truecolor => Some(ColorSpec::Rgb(px.r, px.g, px.b)),
        TermCodec::C256 => Some(ColorSpec::Idx(if opts.dither {
            dither256(px, x, y)
        } else {
            xterm256(px.r, px.g, px.b)
        })),
        TermCodec::C16 => Some(ColorSpec::Ansi(ansi16(px.r, px.g, px.b))),
        TermCodec::Mono => None,
    }
}

fn ramp_glyph(l: u8) -> char {
    ASCII_RAMP[usize::from(l) * (ASCII_RAMP.len() - 1) / 255] as char
}

/// Renders one pixel row as foreground ramp glyphs, or as background-painted
/// blocks when `opts.background` is set (monochrome always uses the ramp:
/// there is no background to paint). `y` is the absolute pixel row, used
/// only for dither seeding. Returns the bytes written.
pub fn render_row(
    pixels: &[Rgb],
    y: u32,
    out: &mut [u8],
    opts: &RowOptions,
) -> Result<usize, ShortWrite> {
    let mut e = RleEmitter::new(out, opts.csi_rep, opts.rep_min_run);
    let background = opts.background && opts.codec != TermCodec::Mono;
    for (x, px) in pixels.iter().enumerate() {
        let x = x as u32;
        if background {
            let style = Style {
                fg: None,
                bg: color_of(opts, *px, x, y),
            };
            e.push(style, ' ')?;
        } else {
            let style = Style {
                fg: color_of(opts, *px, x, y),
                bg: None,
            };
            e.push(style, ramp_glyph(luma(px.r, px.g, px.b)))?;
        }
    }
    e.finish()
}

/// Renders a pair of pixel rows as one row of `'▀'` cells: foreground takes
/// the top pixel, background the bottom. Monochrome falls back to the four
/// half-block glyphs chosen by per-half luminance threshold. A missing
/// bottom pixel (odd image height) counts as black.
pub fn render_halfblock_row(
    top: &[Rgb],
    bottom: &[Rgb],
    y: u32,
    out: &mut [u8],
    opts: &RowOptions,
) -> Result<usize, ShortWrite> {
    let mut e = RleEmitter::new(out, opts.csi_rep, opts.rep_min_run);
    for (x, t) in top.iter().enumerate() {
        let x = x as u32;
        let b = bottom.get(x as usize).copied().unwrap_or(Rgb::BLACK);
        if opts.codec == TermCodec::Mono {
            let glyph = match (
                luma(t.r, t.g, t.b) >= LUMA_THRESHOLD,
                luma(b.r, b.g, b.b) >= LUMA_THRESHOLD,
            ) {
                (false, false) => ' ',
                (true, false) => '\u{2580}',
                (false, true) => '\u{2584}',
                (true, true) => '\u{2588}',
            };
            e.push(Style::NONE, glyph)?;
        } else {
            let style = Style {
                fg: color_of(opts, *t, x, y),
                bg: color_of(opts, b, x, y + 1),
            };
            e.push(style, '\u{2580}')?;
        }
    }
    e.finish()
}

/// Braille dot bit for (column dx, row dy) within a 2x4 tile, per the
/// U+2800 block layout.
const BRAILLE_DOTS: [[u32; 4]; 2] = [[0x01, 0x02, 0x04, 0x40], [0x08, 0x10, 0x20, 0x80]];

/// Renders four pixel rows as one row of braille cells: each 2x4 pixel tile
/// maps to U+2800..=U+28FF by per-dot luminance threshold. The foreground
/// color is the average of the lit dots' pixels (whole-tile average when no
/// dot is lit). Missing pixels at the right or bottom edge count as black.
pub fn render_braille_row(
    rows: [&[Rgb]; 4],
    y: u32,
    out: &mut [u8],
    opts: &RowOptions,
) -> Result<usize, ShortWrite> {
    let width = rows[0].len();
    let mut e = RleEmitter::new(out, opts.csi_rep, opts.rep_min_run);
    let mut cx = 0;
    while cx < width {
        let mut bits = 0u32;
        let mut lit = (0u32, 0u32, 0u32, 0u32);
        let mut all = (0u32, 0u32, 0u32, 0u32);
        for dx in 0..2usize {
            for (dy, row) in rows.iter().enumerate() {
                let px = row.get(cx + dx).copied().unwrap_or(Rgb::BLACK);
                all = (
                    all.0 + u32::from(px.r),
                    all.1 + u32::from(px.g),
                    all.2 + u32::from(px.b),
                    all.3 + 1,
                );
                if luma(px.r, px.g, px.b) >= LUMA_THRESHOLD {
                    bits |= BRAILLE_DOTS[dx][dy];
                    lit = (
                        lit.0 + u32::from(px.r),
                        lit.1 + u32::from(px.g),
                        lit.2 + u32::from(px.b),
                        lit.3 + 1,
                    );
                }
            }
        }
        let glyph = std::char::from_u32(0x2800 + bits).expect("braille block scalar");
        let style = if opts.codec == TermCodec::Mono {
            Style::NONE
        } else {
            let (r, g, b, n) = if lit.3 > 0 { lit } else { all };
            let avg = Rgb::new((r / n) as u8, (g / n) as u8, (b / n) as u8);
            Style {
                fg: color_of(opts, avg, cx as u32, y),
                bg: None,
            }
        };
        e.push(style, glyph)?;
        cx += 2;
    }
    e.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(codec: TermCodec) -> RowOptions {
        let mut o = RowOptions::new(codec);
        o.dither = false;
        o
    }

    fn row(px: Rgb, n: usize) -> Vec<Rgb> {
        vec![px; n]
    }

    #[test]
    fn empty_row_writes_nothing() {
        let mut out = [0u8; 64];
        let n = render_row(&[], 0, &mut out, &opts(TermCodec::Truecolor)).unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn truecolor_run_with_csi_rep() {
        let pixels = row(Rgb::new(200, 10, 10), 10);
        let mut o = opts(TermCodec::Truecolor);
        o.csi_rep = true;
        let mut out = [0u8; 64];
        let n = render_row(&pixels, 0, &mut out, &o).unwrap();
        assert_eq!(&out[..n], b"\x1b[38;2;200;10;10m.\x1b[9b" as &[u8]);
    }

    #[test]
    fn truecolor_run_without_csi_rep() {
        let pixels = row(Rgb::new(200, 10, 10), 10);
        let mut out = [0u8; 64];
        let n = render_row(&pixels, 0, &mut out, &opts(TermCodec::Truecolor)).unwrap();
        assert_eq!(&out[..n], b"\x1b[38;2;200;10;10m.........." as &[u8]);
    }

    #[test]
    fn short_runs_stay_literal() {
        let pixels = row(Rgb::new(200, 10, 10), 2);
        let mut o = opts(TermCodec::Truecolor);
        o.csi_rep = true;
        let mut out = [0u8; 64];
        let n = render_row(&pixels, 0, &mut out, &o).unwrap();
        assert_eq!(&out[..n], b"\x1b[38;2;200;10;10m.." as &[u8]);

        let pixels = row(Rgb::new(200, 10, 10), 3);
        let n = render_row(&pixels, 0, &mut out, &o).unwrap();
        assert_eq!(&out[..n], b"\x1b[38;2;200;10;10m.\x1b[2b" as &[u8]);
    }

    #[test]
    fn exact_capacity_fills_and_one_short_fails() {
        let pixels = row(Rgb::new(200, 10, 10), 10);
        let mut o = opts(TermCodec::Truecolor);
        o.csi_rep = true;
        let needed = 17 + 1 + 4;
        let mut out = vec![0u8; needed];
        assert_eq!(render_row(&pixels, 0, &mut out, &o), Ok(needed));
        let mut short = vec![0u8; needed - 1];
        assert_eq!(render_row(&pixels, 0, &mut short, &o), Err(ShortWrite));
    }

    #[test]
    fn style_change_reemits_escape() {
        let pixels = vec![
            Rgb::new(255, 0, 0),
            Rgb::new(255, 0, 0),
            Rgb::new(0, 0, 255),
        ];
        let mut out = [0u8; 64];
        let n = render_row(&pixels, 0, &mut out, &opts(TermCodec::Truecolor)).unwrap();
        assert_eq!(
            &out[..n],
            b"\x1b[38;2;255;0;0m''\x1b[38;2;0;0;255m " as &[u8]
        );
    }

    #[test]
    fn palette_256_escapes() {
        let pixels = row(Rgb::new(255, 0, 0), 1);
        let mut out = [0u8; 64];
        let n = render_row(&pixels, 0, &mut out, &opts(TermCodec::C256)).unwrap();
        assert_eq!(&out[..n], b"\x1b[38;5;196m'" as &[u8]);
    }

    #[test]
    fn ansi16_escapes() {
        let pixels = row(Rgb::new(255, 70, 70), 1);
        let mut out = [0u8; 64];
        let n = render_row(&pixels, 0, &mut out, &opts(TermCodec::C16)).unwrap();
        assert_eq!(&out[..n], b"\x1b[91m'" as &[u8]);

        let pixels = row(Rgb::new(0, 0, 160), 1);
        let n = render_row(&pixels, 0, &mut out, &opts(TermCodec::C16)).unwrap();
        assert_eq!(&out[..n], b"\x1b[34m " as &[u8]);
    }

    #[test]
    fn mono_has_no_escapes() {
        let pixels = vec![Rgb::new(255, 255, 255), Rgb::BLACK, Rgb::new(128, 128, 128)];
        let mut out = [0u8; 64];
        let n = render_row(&pixels, 0, &mut out, &opts(TermCodec::Mono)).unwrap();
        assert_eq!(&out[..n], b"M l" as &[u8]);
    }

    #[test]
    fn background_block_mode() {
        let pixels = row(Rgb::new(1, 2, 3), 3);
        let mut o = opts(TermCodec::Truecolor);
        o.background = true;
        let mut out = [0u8; 64];
        let n = render_row(&pixels, 0, &mut out, &o).unwrap();
        assert_eq!(&out[..n], b"\x1b[48;2;1;2;3m   " as &[u8]);
    }

    #[test]
    fn halfblock_pairs() {
        let top = row(Rgb::new(255, 0, 0), 2);
        let bottom = row(Rgb::new(0, 0, 255), 2);
        let mut out = [0u8; 64];
        let n =
            render_halfblock_row(&top, &bottom, 0, &mut out, &opts(TermCodec::Truecolor)).unwrap();
        let mut expected = Vec::new();
        expected.extend_from_slice(b"\x1b[38;2;255;0;0m\x1b[48;2;0;0;255m");
        expected.extend_from_slice("\u{2580}\u{2580}".as_bytes());
        assert_eq!(&out[..n], &expected[..]);
    }

    #[test]
    fn halfblock_mono_thresholds() {
        let white = Rgb::new(255, 255, 255);
        let top = vec![white, Rgb::BLACK, white, Rgb::BLACK];
        let bottom = vec![white, white, Rgb::BLACK, Rgb::BLACK];
        let mut out = [0u8; 64];
        let n = render_halfblock_row(&top, &bottom, 0, &mut out, &opts(TermCodec::Mono)).unwrap();
        assert_eq!(&out[..n], "\u{2588}\u{2584}\u{2580} ".as_bytes());
    }

    #[test]
    fn halfblock_missing_bottom_is_black() {
        let top = row(Rgb::new(255, 255, 255), 1);
        let mut out = [0u8; 64];
        let n = render_halfblock_row(&top, &[], 0, &mut out, &opts(TermCodec::Mono)).unwrap();
        assert_eq!(&out[..n], "\u{2580}".as_bytes());
    }

    #[test]
    fn braille_left_column() {
        let white = Rgb::new(255, 255, 255);
        let rows = [
            vec![white, Rgb::BLACK],
            vec![white, Rgb::BLACK],
            vec![white, Rgb::BLACK],
            vec![white, Rgb::BLACK],
        ];
        let mut out = [0u8; 64];
        let n = render_braille_row(
            [&rows[0], &rows[1], &rows[2], &rows[3]],
            0,
            &mut out,
            &opts(TermCodec::Mono),
        )
        .unwrap();
        // Dots 1,2,3,7: U+2847.
        assert_eq!(&out[..n], "\u{2847}".as_bytes());
    }

    #[test]
    fn braille_full_and_empty_tiles() {
        let white = Rgb::new(255, 255, 255);
        let full = vec![white, white];
        let empty = vec![Rgb::BLACK, Rgb::BLACK];
        let mut out = [0u8; 64];
        let n = render_braille_row(
            [&full, &full, &full, &full],
            0,
            &mut out,
            &opts(TermCodec::Mono),
        )
        .unwrap();
        assert_eq!(&out[..n], "\u{28ff}".as_bytes());
        let n = render_braille_row(
            [&empty, &empty, &empty, &empty],
            0,
            &mut out,
            &opts(TermCodec::Mono),
        )
        .unwrap();
        assert_eq!(&out[..n], "\u{2800}".as_bytes());
    }

    #[test]
    fn braille_lit_average_color() {
        let red = Rgb::new(200, 0, 0);
        let rows = [
            vec![red, Rgb::BLACK],
            vec![red, Rgb::BLACK],
            vec![red, Rgb::BLACK],
            vec![red, Rgb::BLACK],
        ];
        let mut out = [0u8; 64];
        let n = render_braille_row(
            [&rows[0], &rows[1], &rows[2], &rows[3]],
            0,
            &mut out,
            &opts(TermCodec::Truecolor),
        )
        .unwrap();
        let mut expected = Vec::new();
        expected.extend_from_slice(b"\x1b[38;2;200;0;0m");
        expected.extend_from_slice("\u{2847}".as_bytes());
        assert_eq!(&out[..n], &expected[..]);
    }

    #[test]
    fn rep_threshold_is_configurable() {
        let pixels = row(Rgb::new(200, 10, 10), 2);
        let mut o = opts(TermCodec::Truecolor);
        o.csi_rep = true;
        o.rep_min_run = 2;
        let mut out = [0u8; 64];
        let n = render_row(&pixels, 0, &mut out, &o).unwrap();
        assert_eq!(&out[..n], b"\x1b[38;2;200;10;10m.\x1b[1b" as &[u8]);
    }
}
