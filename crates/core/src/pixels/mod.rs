//! LED matrix addressing on top of the output channel.

use std::sync::Arc;

use crate::{
    link::{OutputChannel, OutputFrame},
    Result,
};

/// Colour of a lit column in the volume meter.
pub const METER_COLOR: u32 = 0x11_11_11;

/// Dimensions of the LED matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridLayout {
    pub width: usize,
    pub height: usize,
}

impl GridLayout {
    /// Layout of a `width` x `height` matrix wired row by row.
    pub fn new(width: usize, height: usize) -> Self {
        Self { width, height }
    }

    /// Row-major linear index of `(x, y)`.
    pub fn index(&self, x: usize, y: usize) -> usize {
        y * self.width + x
    }

    pub fn pixel_count(&self) -> usize {
        self.width * self.height
    }
}

/// Turns pixel writes into frames on an [`OutputChannel`]. Holds no pixel
/// state of its own.
#[derive(Debug, Clone)]
pub struct PixelSurface {
    channel: Arc<OutputChannel>,
}

impl PixelSurface {
    pub fn new(channel: Arc<OutputChannel>) -> Self {
        Self { channel }
    }

    pub fn channel(&self) -> &Arc<OutputChannel> {
        &self.channel
    }

    /// Queues one SET_PIXEL frame. Fails for indices or colours the wire
    /// format cannot carry; nothing is queued then.
    pub fn set_pixel(&self, index: usize, color: u32) -> Result<()> {
        self.channel.enqueue(OutputFrame::set_pixel(index, color)?);
        Ok(())
    }

    /// [`PixelSurface::set_pixel`] addressed by grid position.
    pub fn set_xy(&self, layout: &GridLayout, x: usize, y: usize, color: u32) -> Result<()> {
        self.set_pixel(layout.index(x, y), color)
    }

    /// Queues a FLUSH so the firmware latches the pixels written so far.
    pub fn flush(&self) {
        self.channel.enqueue(OutputFrame::Flush);
    }
}

/// Lights a number of columns proportional to `volume` across the whole
/// grid. Does not flush.
pub fn render_volume_meter(surface: &PixelSurface, layout: &GridLayout, volume: f32) -> Result<()> {
    let lit = (volume.clamp(0.0, 1.0) * layout.width as f32) as usize;
    for y in 0..layout.height {
        for x in 0..layout.width {
            let color = if x < lit { METER_COLOR } else { 0 };
            surface.set_xy(layout, x, y, color)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::MemoryLink;

    fn surface() -> (PixelSurface, MemoryLink) {
        let link = MemoryLink::new();
        let channel = Arc::new(OutputChannel::new(link.clone(), false));
        channel.start().unwrap();
        (PixelSurface::new(channel), link)
    }

    #[test]
    fn translates_writes_immediately() {
        let (surface, link) = surface();
        surface.set_pixel(4, 0xFF0000).unwrap();
        surface.flush();
        assert_eq!(surface.channel().pending(), 3);

        surface.channel().drain().unwrap();
        let frames = OutputFrame::decode_session(&link.bytes()).unwrap();
        assert_eq!(
            frames,
            vec![
                OutputFrame::Start,
                OutputFrame::SetPixel {
                    index: 4,
                    color: 0xFF0000
                },
                OutputFrame::Flush,
            ]
        );
    }

    #[test]
    fn volume_meter_lights_leading_columns() {
        let (surface, link) = surface();
        let layout = GridLayout::new(4, 2);
        render_volume_meter(&surface, &layout, 0.5).unwrap();
        surface.channel().drain().unwrap();

        let frames = OutputFrame::decode_session(&link.bytes()).unwrap();
        let lit: Vec<u16> = frames
            .iter()
            .filter_map(|frame| match frame {
                OutputFrame::SetPixel { index, color } if *color == METER_COLOR => Some(*index),
                _ => None,
            })
            .collect();
        assert_eq!(frames.len(), 1 + layout.pixel_count());
        assert_eq!(lit, vec![0, 1, 4, 5]);
    }

    #[test]
    fn rejects_pixels_beyond_the_wire_range() {
        let (surface, _link) = surface();
        assert!(surface.set_pixel(crate::link::MAX_PIXEL_INDEX + 1, 0).is_err());
    }
}
