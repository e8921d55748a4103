//! Decoded video frames.
//!
//! Every backend hands frames to the recorder as tightly packed RGB24 buffers, so
//! sinks never need to know which decoder produced them.

use anyhow::{anyhow, Result};

/// Bytes per pixel of the interchange format (RGB24).
pub const BYTES_PER_PIXEL: usize = 3;

/// A decoded RGB24 frame.
pub struct VideoFrame {
    data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl VideoFrame {
    pub fn new(data: Vec<u8>, width: u32, height: u32) -> Result<Self> {
        let expected = expected_len(width, height);
        if data.len() != expected {
            return Err(anyhow!(
                "frame buffer is {} bytes, expected {} for {}x{} RGB24",
                data.len(),
                expected,
                width,
                height
            ));
        }
        Ok(Self {
            data,
            width,
            height,
        })
    }

    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    pub fn row(&self, index: usize) -> Option<&[u8]> {
        let row_bytes = self.width as usize * BYTES_PER_PIXEL;
        let start = index.checked_mul(row_bytes)?;
        self.data.get(start..start + row_bytes)
    }
}

fn expected_len(width: u32, height: u32) -> usize {
    width as usize * height as usize * BYTES_PER_PIXEL
}

/// Copies a possibly padded plane into a packed RGB24 buffer.
pub(crate) fn pack_rows(data: &[u8], stride: usize, width: u32, height: u32) -> Result<Vec<u8>> {
    let row_bytes = width as usize * BYTES_PER_PIXEL;
    if stride == row_bytes && data.len() >= row_bytes * height as usize {
        return Ok(data[..row_bytes * height as usize].to_vec());
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        let end = start + row_bytes;
        pixels.extend_from_slice(
            data.get(start..end)
                .ok_or_else(|| anyhow!("frame row {} is out of bounds", row))?,
        );
    }
    Ok(pixels)
}
