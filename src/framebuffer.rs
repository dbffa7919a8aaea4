//! 1-bit frame buffer for the e-paper panel.
//!
//! Rows are packed MSB-first, `(width + 7) / 8` bytes per row, with a set bit
//! meaning black ink. That is also the layout of a binary PBM (`P4`) file, so
//! a rendered frame can be written out unchanged for inspection.

use embedded_graphics::pixelcolor::BinaryColor;
use embedded_graphics::prelude::*;
use std::convert::Infallible;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

pub struct FrameBuffer {
    width: u32,
    height: u32,
    bits: Vec<u8>,
}

impl FrameBuffer {
    pub fn new(width: u32, height: u32) -> Self {
        let bytes_per_row = width.div_ceil(8);
        Self {
            width,
            height,
            bits: vec![0x00; (bytes_per_row * height) as usize], // White
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn clear(&mut self, color: BinaryColor) {
        self.bits.fill(if color.is_on() { 0xFF } else { 0x00 });
    }

    fn locate(&self, x: u32, y: u32) -> Option<(usize, u8)> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let bytes_per_row = self.width.div_ceil(8);
        Some(((y * bytes_per_row + x / 8) as usize, 0x80 >> (x % 8)))
    }

    pub fn set_pixel(&mut self, x: u32, y: u32, color: BinaryColor) {
        if let Some((index, mask)) = self.locate(x, y) {
            if color.is_on() {
                self.bits[index] |= mask;
            } else {
                self.bits[index] &= !mask;
            }
        }
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<BinaryColor> {
        self.locate(x, y)
            .map(|(index, mask)| BinaryColor::from(self.bits[index] & mask != 0))
    }

    /// Number of black pixels, ignoring row padding.
    pub fn black_pixels(&self) -> u32 {
        let mut count = 0;
        for y in 0..self.height {
            for x in 0..self.width {
                if self.pixel(x, y) == Some(BinaryColor::On) {
                    count += 1;
                }
            }
        }
        count
    }

    /// Write the frame as a binary PBM file.
    pub fn write_pbm(&self, path: &Path) -> io::Result<()> {
        let mut out = BufWriter::new(File::create(path)?);
        write!(out, "P4\n{} {}\n", self.width, self.height)?;
        out.write_all(&self.bits)?;
        out.flush()
    }
}

impl OriginDimensions for FrameBuffer {
    fn size(&self) -> Size {
        Size::new(self.width, self.height)
    }
}

impl DrawTarget for FrameBuffer {
    type Color = BinaryColor;
    type Error = Infallible;

    fn draw_iter<I>(&mut self, pixels: I) -> Result<(), Self::Error>
    where
        I: IntoIterator<Item = Pixel<Self::Color>>,
    {
        for Pixel(point, color) in pixels {
            if point.x >= 0 && point.y >= 0 {
                self.set_pixel(point.x as u32, point.y as u32, color);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embedded_graphics::primitives::{PrimitiveStyle, Rectangle};
    use tempfile::NamedTempFile;

    #[test]
    fn test_pixels_pack_msb_first() {
        let mut fb = FrameBuffer::new(10, 2);
        fb.set_pixel(0, 0, BinaryColor::On);
        fb.set_pixel(9, 1, BinaryColor::On);
        assert_eq!(fb.bits, vec![0x80, 0x00, 0x00, 0x40]);
        assert_eq!(fb.black_pixels(), 2);

        // Out of range is ignored
        fb.set_pixel(10, 0, BinaryColor::On);
        assert_eq!(fb.black_pixels(), 2);
    }

    #[test]
    fn test_draws_primitives() {
        let mut fb = FrameBuffer::new(16, 16);
        Rectangle::new(Point::new(2, 2), Size::new(4, 3))
            .into_styled(PrimitiveStyle::with_fill(BinaryColor::On))
            .draw(&mut fb)
            .unwrap();
        assert_eq!(fb.black_pixels(), 12);
        assert_eq!(fb.pixel(2, 2), Some(BinaryColor::On));
        assert_eq!(fb.pixel(6, 2), Some(BinaryColor::Off));
    }

    #[test]
    fn test_writes_pbm() {
        let mut fb = FrameBuffer::new(8, 1);
        fb.clear(BinaryColor::On);
        let file = NamedTempFile::new().unwrap();
        fb.write_pbm(file.path()).unwrap();
        assert_eq!(std::fs::read(file.path()).unwrap(), b"P4\n8 1\n\xFF");
    }
}
