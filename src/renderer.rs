//! # Frame Rendering
//!
//! The boundary between the wake cycle and the panel: the cycle hands over
//! either a staged image or an [`ErrorDescriptor`], plus a status line, and the
//! renderer produces pixels.
//!
//! [`FrameRenderer`] draws into a [`FrameBuffer`] with `embedded-graphics` and
//! writes the result as a PBM file, which is what the host build uses in place
//! of the e-paper panel.
//!
//! Images are reduced to 1 bit by luminance threshold:
//! - `.bin`: one grey byte per pixel, row-major
//! - `.bmp`: uncompressed 1, 8, 24 or 32 bits per pixel, bottom-up or top-down

use crate::battery::BatteryInfo;
use crate::error::{ErrorDescriptor, FrameError};
use crate::framebuffer::FrameBuffer;
use crate::stager::{ImageKind, StagedFile};
use crate::weather::WeatherRecord;
use chrono::NaiveDateTime;
use embedded_graphics::{
    mono_font::{
        ascii::{FONT_10X20, FONT_6X10},
        MonoTextStyle,
    },
    pixelcolor::BinaryColor,
    prelude::*,
    primitives::{PrimitiveStyle, Rectangle},
    text::{Alignment, Text},
};
use log::{debug, info};
use std::fs;
use std::path::PathBuf;

/// Grey levels below this become black.
const THRESHOLD: u8 = 128;

const STATUS_BAR_HEIGHT: u32 = 14;

/// Information drawn along the top edge of every frame.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusLine {
    pub timestamp: Option<NaiveDateTime>,
    pub battery: BatteryInfo,
    pub weather: Option<WeatherRecord>,
}

impl StatusLine {
    pub fn text(&self) -> String {
        let mut parts = Vec::new();
        match self.timestamp {
            Some(t) => parts.push(t.format("%a %-d %b %H:%M").to_string()),
            None => parts.push("--:--".to_string()),
        }
        if self.battery.is_present() {
            parts.push(format!("{}%", self.battery.percent));
        }
        if let Some(weather) = &self.weather {
            parts.push(format!("{} {}", weather.temperature_label(), weather.description));
        }
        parts.join("  ")
    }
}

/// Consumer of a finished wake cycle.
pub trait Renderer {
    fn render_image(&mut self, staged: &StagedFile, status: &StatusLine) -> Result<(), FrameError>;
    fn render_error(
        &mut self,
        error: &ErrorDescriptor,
        status: &StatusLine,
    ) -> Result<(), FrameError>;
}

/// Draw the status bar: white text on a black band.
pub fn draw_status<D>(display: &mut D, status: &StatusLine)
where
    D: DrawTarget<Color = BinaryColor> + OriginDimensions,
{
    let width = display.size().width;
    Rectangle::new(Point::zero(), Size::new(width, STATUS_BAR_HEIGHT))
        .into_styled(PrimitiveStyle::with_fill(BinaryColor::On))
        .draw(display)
        .ok();

    let style = MonoTextStyle::new(&FONT_6X10, BinaryColor::Off);
    Text::new(&status.text(), Point::new(2, 10), style)
        .draw(display)
        .ok();
}

/// Draw the error screen for `error`.
pub fn draw_error_screen<D>(display: &mut D, error: &ErrorDescriptor, status: &StatusLine)
where
    D: DrawTarget<Color = BinaryColor> + OriginDimensions,
{
    display.clear(BinaryColor::Off).ok();
    let size = display.size();
    let center = Point::new(size.width as i32 / 2, size.height as i32 / 2);

    let title = MonoTextStyle::new(&FONT_10X20, BinaryColor::On);
    Text::with_alignment(&error.message, center, title, Alignment::Center)
        .draw(display)
        .ok();

    let detail = MonoTextStyle::new(&FONT_6X10, BinaryColor::On);
    Text::with_alignment(
        &error.kind.to_string(),
        center + Point::new(0, 24),
        detail,
        Alignment::Center,
    )
    .draw(display)
    .ok();

    // Frame around the message
    Rectangle::with_center(center + Point::new(0, 4), Size::new(size.width * 3 / 4, 72))
        .into_styled(PrimitiveStyle::with_stroke(BinaryColor::On, 2))
        .draw(display)
        .ok();

    draw_status(display, status);
}

/// Blit an 8-bit grey raster, clipped to the buffer.
pub fn draw_raster(fb: &mut FrameBuffer, data: &[u8], width: u32, height: u32) {
    for (i, &grey) in data.iter().enumerate().take((width * height) as usize) {
        let x = i as u32 % width;
        let y = i as u32 / width;
        fb.set_pixel(x, y, BinaryColor::from(grey < THRESHOLD));
    }
}

fn le_u16(data: &[u8], at: usize) -> Option<u16> {
    Some(u16::from_le_bytes(data.get(at..at + 2)?.try_into().ok()?))
}

fn le_u32(data: &[u8], at: usize) -> Option<u32> {
    Some(u32::from_le_bytes(data.get(at..at + 4)?.try_into().ok()?))
}

fn luma(r: u8, g: u8, b: u8) -> u8 {
    ((r as u32 * 299 + g as u32 * 587 + b as u32 * 114) / 1000) as u8
}

/// Decode an uncompressed bitmap into the buffer.
pub fn draw_bitmap(fb: &mut FrameBuffer, data: &[u8]) -> Result<(), FrameError> {
    let corrupted = |what: &str| FrameError::FileCorrupted(format!("bitmap {what}"));

    let data_offset = le_u32(data, 10).ok_or_else(|| corrupted("header truncated"))? as usize;
    let dib_size = le_u32(data, 14).ok_or_else(|| corrupted("header truncated"))? as usize;
    let width = le_u32(data, 18).ok_or_else(|| corrupted("header truncated"))? as i32;
    let height = le_u32(data, 22).ok_or_else(|| corrupted("header truncated"))? as i32;
    let bpp = le_u16(data, 28).ok_or_else(|| corrupted("header truncated"))?;
    let compression = le_u32(data, 30).unwrap_or(0);

    if width <= 0 || height == 0 {
        return Err(corrupted("has no pixels"));
    }
    if !(compression == 0 || (compression == 3 && bpp == 32)) {
        return Err(FrameError::RenderFailed(format!(
            "compressed bitmap (method {compression}) not supported"
        )));
    }

    let palette: Vec<u8> = if bpp <= 8 {
        let start = 14 + dib_size;
        (0..1usize << bpp)
            .map(|i| {
                data.get(start + i * 4..start + i * 4 + 3)
                    .map(|bgr| luma(bgr[2], bgr[1], bgr[0]))
                    .unwrap_or(if i == 0 { 0 } else { 255 })
            })
            .collect()
    } else {
        Vec::new()
    };

    let width = width as u32;
    let rows = height.unsigned_abs();
    let bottom_up = height > 0;
    let stride = ((width * bpp as u32 + 31) / 32 * 4) as usize;

    for row in 0..rows {
        let start = data_offset + row as usize * stride;
        let line = data
            .get(start..start + stride)
            .ok_or_else(|| corrupted("pixel data truncated"))?;
        let y = if bottom_up { rows - 1 - row } else { row };

        for x in 0..width {
            let xi = x as usize;
            let grey = match bpp {
                1 => palette[((line[xi / 8] >> (7 - xi % 8)) & 1) as usize],
                8 => palette[line[xi] as usize],
                24 => luma(line[xi * 3 + 2], line[xi * 3 + 1], line[xi * 3]),
                32 => luma(line[xi * 4 + 2], line[xi * 4 + 1], line[xi * 4]),
                other => {
                    return Err(FrameError::RenderFailed(format!(
                        "{other} bits per pixel not supported"
                    )))
                }
            };
            fb.set_pixel(x, y, BinaryColor::from(grey < THRESHOLD));
        }
    }
    Ok(())
}

/// Renders into a frame buffer and writes it out as PBM.
pub struct FrameRenderer {
    buffer: FrameBuffer,
    output: PathBuf,
    image_width: u32,
    image_height: u32,
}

impl FrameRenderer {
    pub fn new(
        width: u32,
        height: u32,
        image_width: u32,
        image_height: u32,
        output: impl Into<PathBuf>,
    ) -> Self {
        Self {
            buffer: FrameBuffer::new(width, height),
            output: output.into(),
            image_width,
            image_height,
        }
    }

    pub fn buffer(&self) -> &FrameBuffer {
        &self.buffer
    }

    fn flush(&self) -> Result<(), FrameError> {
        self.buffer
            .write_pbm(&self.output)
            .map_err(|e| FrameError::RenderFailed(format!("{}: {}", self.output.display(), e)))?;
        info!(
            "Frame written to {} ({} black pixels)",
            self.output.display(),
            self.buffer.black_pixels()
        );
        Ok(())
    }
}

impl Renderer for FrameRenderer {
    fn render_image(&mut self, staged: &StagedFile, status: &StatusLine) -> Result<(), FrameError> {
        let data = fs::read(&staged.path)
            .map_err(|e| FrameError::open_failed(staged.path.display(), e))?;
        debug!("Rendering {} ({} bytes)", staged.path.display(), data.len());

        self.buffer.clear(BinaryColor::Off);
        match staged.kind {
            ImageKind::BinaryRaster => {
                draw_raster(&mut self.buffer, &data, self.image_width, self.image_height)
            }
            ImageKind::Bitmap => draw_bitmap(&mut self.buffer, &data)?,
        }
        draw_status(&mut self.buffer, status);
        self.flush()
    }

    fn render_error(
        &mut self,
        error: &ErrorDescriptor,
        status: &StatusLine,
    ) -> Result<(), FrameError> {
        info!("Rendering error screen: {}", error);
        draw_error_screen(&mut self.buffer, error, status);
        self.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use embedded_graphics::mock_display::MockDisplay;
    use tempfile::tempdir;

    fn status() -> StatusLine {
        StatusLine {
            timestamp: NaiveDate::from_ymd_opt(2024, 5, 1)
                .unwrap()
                .and_hms_opt(8, 5, 0),
            battery: BatteryInfo::from_mv(3840),
            weather: None,
        }
    }

    #[test]
    fn test_status_text() {
        assert_eq!(status().text(), "Wed 1 May 08:05  50%");

        let offline = StatusLine {
            timestamp: None,
            battery: BatteryInfo::external_power(),
            weather: None,
        };
        assert_eq!(offline.text(), "--:--");
    }

    #[test]
    fn test_status_bar_draws() {
        let mut display = MockDisplay::<BinaryColor>::new();
        display.set_allow_overdraw(true);
        display.set_allow_out_of_bounds_drawing(true);
        draw_status(&mut display, &status());
        assert_eq!(display.affected_area().top_left, Point::zero());
        assert_eq!(display.get_pixel(Point::new(0, 0)), Some(BinaryColor::On));
    }

    #[test]
    fn test_raster_threshold() {
        let mut fb = FrameBuffer::new(4, 1);
        draw_raster(&mut fb, &[0, 127, 128, 255], 4, 1);
        assert_eq!(fb.pixel(0, 0), Some(BinaryColor::On));
        assert_eq!(fb.pixel(1, 0), Some(BinaryColor::On));
        assert_eq!(fb.pixel(2, 0), Some(BinaryColor::Off));
        assert_eq!(fb.pixel(3, 0), Some(BinaryColor::Off));
    }

    #[test]
    fn test_bottom_up_24bit_bitmap() {
        // 2x2, 24 bpp, stride 8 bytes
        let mut data = vec![0u8; 54 + 16];
        data[0] = b'B';
        data[1] = b'M';
        data[10..14].copy_from_slice(&54u32.to_le_bytes());
        data[14..18].copy_from_slice(&40u32.to_le_bytes());
        data[18..22].copy_from_slice(&2i32.to_le_bytes());
        data[22..26].copy_from_slice(&2i32.to_le_bytes());
        data[28..30].copy_from_slice(&24u16.to_le_bytes());
        // First stored row is the bottom row: white, black
        data[54..57].copy_from_slice(&[255, 255, 255]);
        // Second stored row is the top row: black, white
        data[62 + 3..62 + 6].copy_from_slice(&[255, 255, 255]);

        let mut fb = FrameBuffer::new(2, 2);
        draw_bitmap(&mut fb, &data).unwrap();
        assert_eq!(fb.pixel(0, 0), Some(BinaryColor::On));
        assert_eq!(fb.pixel(1, 0), Some(BinaryColor::Off));
        assert_eq!(fb.pixel(0, 1), Some(BinaryColor::Off));
        assert_eq!(fb.pixel(1, 1), Some(BinaryColor::On));
    }

    #[test]
    fn test_truncated_bitmap_is_corrupted() {
        let mut data = vec![0u8; 60];
        data[10..14].copy_from_slice(&54u32.to_le_bytes());
        data[14..18].copy_from_slice(&40u32.to_le_bytes());
        data[18..22].copy_from_slice(&100i32.to_le_bytes());
        data[22..26].copy_from_slice(&100i32.to_le_bytes());
        data[28..30].copy_from_slice(&24u16.to_le_bytes());
        let mut fb = FrameBuffer::new(100, 100);
        assert!(matches!(
            draw_bitmap(&mut fb, &data),
            Err(FrameError::FileCorrupted(_))
        ));
    }

    #[test]
    fn test_error_screen_written() {
        let dir = tempdir().unwrap();
        let out = dir.path().join("frame.pbm");
        let mut renderer = FrameRenderer::new(200, 120, 200, 120, &out);

        let descriptor = ErrorDescriptor::from_error(FrameError::FileEmpty);
        renderer.render_error(&descriptor, &status()).unwrap();

        let pbm = fs::read(&out).unwrap();
        assert!(pbm.starts_with(b"P4\n200 120\n"));
        assert!(renderer.buffer().black_pixels() > 0);
    }
}
