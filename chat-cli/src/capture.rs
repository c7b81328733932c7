//! Deterministic test-pattern source standing in for the webcam capture
//! backends.

use media::frame::RgbImage;
use media::quant::Rgb;

const BAR_COLORS: [Rgb; 8] = [
    Rgb { r: 255, g: 255, b: 255 },
    Rgb { r: 255, g: 255, b: 0 },
    Rgb { r: 0, g: 255, b: 255 },
    Rgb { r: 0, g: 255, b: 0 },
    Rgb { r: 255, g: 0, b: 255 },
    Rgb { r: 255, g: 0, b: 0 },
    Rgb { r: 0, g: 0, b: 255 },
    Rgb { r: 0, g: 0, b: 0 },
];

/// Color bars over a scrolling gradient. Frame `n` is a pure function of
/// `n`, which keeps end-to-end runs reproducible.
pub struct TestPattern {
    width: usize,
    height: usize,
    tick: u32,
}

impl TestPattern {
    pub fn new(width: usize, height: usize) -> Self {
        TestPattern {
            width,
            height,
            tick: 0,
        }
    }

    pub fn next_frame(&mut self) -> RgbImage {
        let t = self.tick;
        self.tick = self.tick.wrapping_add(1);
        let mut img = RgbImage::new(self.width, self.height);
        let bar_rows = self.height / 4;
        for y in 0..self.height {
            for x in 0..self.width {
                let px = if y < bar_rows {
                    BAR_COLORS[(x * BAR_COLORS.len() / self.width.max(1)).min(7)]
                } else {
                    let r = ((x * 255 / self.width.max(1)) as u32 + t * 3) % 256;
                    let g = (y * 255 / self.height.max(1)) as u32;
                    let b = ((x + y) as u32 * 2 + t * 5) % 256;
                    Rgb::new(r as u8, g as u8, b as u8)
                };
                img.set_pixel(x, y, px);
            }
        }
        img
    }
}
