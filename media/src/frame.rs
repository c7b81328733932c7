//! Whole-frame assembly: an RGB image in, a rendered byte stream out.
//!
//! Each terminal row is rendered into a buffer-pool scratch allocation and
//! appended to the frame buffer; a short write from the row renderer grows
//! the scratch and retries (row rendering is pure, so the retry is exact).

use std::sync::Arc;

use bytes::{BufMut, BytesMut};

use base::pool::BufferPool;
use base::Error;

use crate::caps::{Capability, Charset, RendererKind};
use crate::quant::Rgb;
use crate::render::{self, RowOptions, ShortWrite};

/// Row-major 8-bit RGB image. Produced by capture, consumed once by the
/// render pipeline.
#[derive(Clone, Debug)]
pub struct RgbImage {
    width: usize,
    height: usize,
    pixels: Vec<Rgb>,
}

impl RgbImage {
    pub fn new(width: usize, height: usize) -> Self {
        RgbImage {
            width,
            height,
            pixels: vec![Rgb::BLACK; width * height],
        }
    }

    pub fn from_pixels(width: usize, height: usize, pixels: Vec<Rgb>) -> Result<Self, Error> {
        if pixels.len() != width * height {
            return Err(Error::InvalidParam(format!(
                "{}x{} image needs {} pixels, got {}",
                width,
                height,
                width * height,
                pixels.len()
            )));
        }
        Ok(RgbImage {
            width,
            height,
            pixels,
        })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn row(&self, y: usize) -> &[Rgb] {
        &self.pixels[y * self.width..(y + 1) * self.width]
    }

    pub fn pixel(&self, x: usize, y: usize) -> Rgb {
        self.pixels[y * self.width + x]
    }

    pub fn set_pixel(&mut self, x: usize, y: usize, px: Rgb) {
        self.pixels[y * self.width + x] = px;
    }

    /// Nearest-neighbor resample to the target pixel grid. An empty source
    /// yields a black target.
    pub fn scale_to(&self, width: usize, height: usize) -> RgbImage {
        let mut out = RgbImage::new(width, height);
        if self.width == 0 || self.height == 0 {
            return out;
        }
        for y in 0..height {
            let sy = y * self.height / height;
            for x in 0..width {
                let sx = x * self.width / width;
                out.pixels[y * width + x] = self.pixels[sy * self.width + sx];
            }
        }
        out
    }
}

/// Upper bound on one rendered row; growth past this is a bug, not load.
const MAX_ROW_BYTES: usize = 1 << 20;

/// Renders frames for one negotiated capability.
pub struct FrameRenderer {
    pool: Arc<BufferPool>,
    opts: RowOptions,
    renderer: RendererKind,
    cols: usize,
    rows: usize,
}

impl FrameRenderer {
    pub fn new(cap: &Capability, pool: Arc<BufferPool>) -> Result<FrameRenderer, Error> {
        if cap.format.width == 0 || cap.format.height == 0 {
            return Err(Error::InvalidParam(format!(
                "can't render to a {}x{} terminal",
                cap.format.width, cap.format.height
            )));
        }
        // Halfblock and braille glyphs don't exist in a pure-ASCII charset.
        let renderer = match (cap.format.renderer, cap.format.charset) {
            (RendererKind::HalfBlock, Charset::Ascii) | (RendererKind::Braille, Charset::Ascii) => {
                RendererKind::Block
            }
            (r, _) => r,
        };
        let mut opts = RowOptions::new(cap.codec);
        opts.csi_rep = cap.format.csi_rep;
        Ok(FrameRenderer {
            pool,
            opts,
            renderer,
            cols: usize::from(cap.format.width),
            rows: usize::from(cap.format.height),
        })
    }

    /// Paint cell backgrounds instead of foreground ramp glyphs (block
    /// renderer only).
    pub fn set_background(&mut self, on: bool) {
        self.opts.background = on;
    }

    pub fn cell_size(&self) -> (usize, usize) {
        (self.cols, self.rows)
    }

    /// Renders one frame: cursor-home prefix, then every cell row followed
    /// by a reset and CRLF.
    pub fn render(&self, img: &RgbImage) -> Result<BytesMut, Error> {
        let rows_per_cell = self.renderer.rows_per_cell();
        let cols_per_cell = self.renderer.cols_per_cell();
        let scaled = img.scale_to(self.cols * cols_per_cell, self.rows * rows_per_cell);

        let mut out = BytesMut::with_capacity(self.cols * self.rows * 4 + 16);
        out.put_slice(b"\x1b[H");
        let mut scratch = self.pool.alloc(self.cols * 8 + 32);
        for cell_y in 0..self.rows {
            let y0 = cell_y * rows_per_cell;
            loop {
                let result = match self.renderer {
                    RendererKind::Block => {
                        render::render_row(scaled.row(y0), y0 as u32, &mut scratch, &self.opts)
                    }
                    RendererKind::HalfBlock => render::render_halfblock_row(
                        scaled.row(y0),
                        scaled.row(y0 + 1),
                        y0 as u32,
                        &mut scratch,
                        &self.opts,
                    ),
                    RendererKind::Braille => render::render_braille_row(
                        [
                            scaled.row(y0),
                            scaled.row(y0 + 1),
                            scaled.row(y0 + 2),
                            scaled.row(y0 + 3),
                        ],
                        y0 as u32,
                        &mut scratch,
                        &self.opts,
                    ),
                };
                match result {
                    Ok(n) => {
                        out.put_slice(&scratch[..n]);
                        break;
                    }
                    Err(ShortWrite) => {
                        let bigger = scratch.len() * 2;
                        if bigger > MAX_ROW_BYTES {
                            return Err(Error::ResourceExhausted(format!(
                                "row of {} cells exceeds {} bytes",
                                self.cols, MAX_ROW_BYTES
                            )));
                        }
                        scratch = self.pool.alloc(bigger);
                    }
                }
            }
            out.put_slice(b"\x1b[0m\r\n");
        }
        Ok(out)
    }
}
