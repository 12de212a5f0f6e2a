//! CPU-side image buffers: the uncompressed RGBA scratch image shared by a
//! render-target pool slot, and the mipmapped block-compressed result
//! image owned by each composite texture.

pub mod compress;

use crate::key::CompositeFormat;

/// Bytes per pixel of the uncompressed scratch format (RGBA8).
pub const SCRATCH_BPP: usize = 4;

/// An uncompressed RGBA8 pixel buffer.
#[derive(Debug, Clone)]
pub struct RawImage {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl RawImage {
    /// Allocate a zeroed image.
    #[must_use]
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data: vec![0; width as usize * height as usize * SCRATCH_BPP],
        }
    }

    /// Width in pixels.
    #[must_use]
    pub const fn width(&self) -> u32 {
        self.width
    }

    /// Height in pixels.
    #[must_use]
    pub const fn height(&self) -> u32 {
        self.height
    }

    /// The full pixel buffer, row-major RGBA8.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Mutable access to the full pixel buffer.
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// One row of pixels.
    #[must_use]
    pub fn row(&self, y: u32) -> &[u8] {
        let stride = self.width as usize * SCRATCH_BPP;
        let start = y as usize * stride;
        &self.data[start..start + stride]
    }

    /// Read one pixel, clamping coordinates to the image bounds.
    #[must_use]
    pub fn pixel_clamped(&self, x: u32, y: u32) -> [u8; 4] {
        let x = x.min(self.width.saturating_sub(1)) as usize;
        let y = y.min(self.height.saturating_sub(1)) as usize;
        let off = (y * self.width as usize + x) * SCRATCH_BPP;
        [
            self.data[off],
            self.data[off + 1],
            self.data[off + 2],
            self.data[off + 3],
        ]
    }

    /// Generate the full mip chain below this image, halving each axis
    /// (2×2 box filter) down to 1×1. The returned vector does not include
    /// the base level.
    #[must_use]
    pub fn mip_chain(&self) -> Vec<Self> {
        let mut chain: Vec<Self> = Vec::new();
        loop {
            let src = chain.last().unwrap_or(self);
            if src.width <= 1 && src.height <= 1 {
                break;
            }
            let next = src.downsample();
            chain.push(next);
        }
        chain
    }

    /// Produce the next mip level via a 2×2 box filter.
    #[must_use]
    fn downsample(&self) -> Self {
        let w = (self.width / 2).max(1);
        let h = (self.height / 2).max(1);
        let mut out = Self::new(w, h);
        for y in 0..h {
            for x in 0..w {
                let mut acc = [0u32; 4];
                for (dx, dy) in [(0, 0), (1, 0), (0, 1), (1, 1)] {
                    let p = self.pixel_clamped(x * 2 + dx, y * 2 + dy);
                    for (a, c) in acc.iter_mut().zip(p) {
                        *a += u32::from(c);
                    }
                }
                let off = ((y * w + x) as usize) * SCRATCH_BPP;
                for (i, a) in acc.iter().enumerate() {
                    out.data[off + i] = (a / 4) as u8;
                }
            }
        }
        out
    }
}

/// Number of mip levels for a `size`×`size` base image, down to 1×1.
#[must_use]
pub const fn mip_count(size: u32) -> u32 {
    if size == 0 {
        0
    } else {
        32 - size.leading_zeros()
    }
}

/// Size in bytes of one block-compressed mip level.
#[must_use]
pub const fn compressed_mip_bytes(
    format: CompositeFormat,
    width: u32,
    height: u32,
) -> usize {
    let bx = width.div_ceil(4) as usize;
    let by = height.div_ceil(4) as usize;
    bx * by * format.block_bytes()
}

/// A mipmapped, block-compressed image: the persistent CPU-side copy of
/// one composite texture's final output.
#[derive(Debug, Clone)]
pub struct CompressedImage {
    format: CompositeFormat,
    width: u32,
    height: u32,
    mips: Vec<Vec<u8>>,
}

impl CompressedImage {
    /// Allocate a zeroed image with the full mip chain for the given base
    /// dimensions. A zeroed image is the "blank" result a consumer sees
    /// before the first generation completes.
    #[must_use]
    pub fn with_layout(format: CompositeFormat, width: u32, height: u32) -> Self {
        let levels = mip_count(width.max(height));
        let mut mips = Vec::with_capacity(levels as usize);
        for level in 0..levels {
            let w = (width >> level).max(1);
            let h = (height >> level).max(1);
            mips.push(vec![0; compressed_mip_bytes(format, w, h)]);
        }
        Self {
            format,
            width,
            height,
            mips,
        }
    }

    /// Output compression format.
    #[must_use]
    pub const fn format(&self) -> CompositeFormat {
        self.format
    }

    /// Base level width in pixels.
    #[must_use]
    pub const fn width(&self) -> u32 {
        self.width
    }

    /// Base level height in pixels.
    #[must_use]
    pub const fn height(&self) -> u32 {
        self.height
    }

    /// Number of mip levels.
    #[must_use]
    pub fn mip_levels(&self) -> u32 {
        self.mips.len() as u32
    }

    /// The compressed bytes of one mip level.
    #[must_use]
    pub fn mip(&self, level: u32) -> &[u8] {
        &self.mips[level as usize]
    }

    /// Replace the bytes of one mip level. The replacement must match the
    /// level's layout size exactly; mismatches are ignored with a warning
    /// since a wrong-size upload would corrupt the texture.
    pub fn set_mip(&mut self, level: u32, bytes: Vec<u8>) {
        let Some(slot) = self.mips.get_mut(level as usize) else {
            log::warn!("set_mip: level {level} out of range");
            return;
        };
        if slot.len() != bytes.len() {
            log::warn!(
                "set_mip: level {level} size mismatch ({} != {})",
                bytes.len(),
                slot.len()
            );
            return;
        }
        *slot = bytes;
    }

    /// Total size of all mip levels in bytes.
    #[must_use]
    pub fn total_bytes(&self) -> usize {
        self.mips.iter().map(Vec::len).sum()
    }

    /// Copy all mip levels, tightly packed largest-first, into `dest`.
    /// Returns false (leaving `dest` untouched past the copied prefix) if
    /// `dest` is too small.
    pub fn write_packed(&self, dest: &mut [u8]) -> bool {
        if dest.len() < self.total_bytes() {
            return false;
        }
        let mut off = 0;
        for mip in &self.mips {
            dest[off..off + mip.len()].copy_from_slice(mip);
            off += mip.len();
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mip_count_down_to_one() {
        assert_eq!(mip_count(1), 1);
        assert_eq!(mip_count(4), 3);
        assert_eq!(mip_count(256), 9);
        assert_eq!(mip_count(2048), 12);
    }

    #[test]
    fn mip_chain_halves_to_one() {
        let img = RawImage::new(16, 16);
        let chain = img.mip_chain();
        let dims: Vec<(u32, u32)> =
            chain.iter().map(|m| (m.width(), m.height())).collect();
        assert_eq!(dims, vec![(8, 8), (4, 4), (2, 2), (1, 1)]);
    }

    #[test]
    fn box_filter_averages() {
        let mut img = RawImage::new(2, 2);
        // Two black, two white pixels
        img.data_mut()[0..4].copy_from_slice(&[255, 255, 255, 255]);
        img.data_mut()[4..8].copy_from_slice(&[255, 255, 255, 255]);
        let chain = img.mip_chain();
        assert_eq!(chain.len(), 1);
        assert_eq!(chain[0].pixel_clamped(0, 0), [127, 127, 127, 127]);
    }

    #[test]
    fn compressed_layout_block_math() {
        // 8x8 DXT5: mips 8,4,2,1 -> 4,1,1,1 blocks of 16 bytes
        let img = CompressedImage::with_layout(CompositeFormat::Dxt5, 8, 8);
        assert_eq!(img.mip_levels(), 4);
        assert_eq!(img.mip(0).len(), 4 * 16);
        assert_eq!(img.mip(1).len(), 16);
        assert_eq!(img.mip(3).len(), 16);
        assert_eq!(img.total_bytes(), (4 + 1 + 1 + 1) * 16);

        // Sub-block mips still occupy one full block
        let tiny = CompressedImage::with_layout(CompositeFormat::Dxt1, 2, 2);
        assert_eq!(tiny.mip_levels(), 2);
        assert_eq!(tiny.mip(0).len(), 8);
    }

    #[test]
    fn write_packed_concatenates_mips() {
        let img = CompressedImage::with_layout(CompositeFormat::Dxt1, 4, 4);
        let mut dest = vec![0xFF; img.total_bytes()];
        assert!(img.write_packed(&mut dest));
        assert!(dest.iter().all(|&b| b == 0));

        let mut short = vec![0u8; 1];
        assert!(!img.write_packed(&mut short));
    }
}
