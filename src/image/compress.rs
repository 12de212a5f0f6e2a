//! DXT1/DXT5 (BC1/BC3) block compression of RGBA8 images.
//!
//! A fast bounding-box encoder: per 4×4 block, endpoints are the
//! component-wise min/max colors (inset slightly to reduce error), and each
//! pixel snaps to the nearest entry of the interpolated palette. Quality is
//! a step below exhaustive cluster-fit encoders but runs comfortably on the
//! generation worker thread.

use crate::image::RawImage;
use crate::key::CompositeFormat;

/// Compress one image into a tightly packed buffer of 4×4 blocks in
/// row-major block order.
#[must_use]
pub fn compress_image(src: &RawImage, format: CompositeFormat) -> Vec<u8> {
    let bx = src.width().div_ceil(4);
    let by = src.height().div_ceil(4);
    let mut out =
        Vec::with_capacity(bx as usize * by as usize * format.block_bytes());
    let mut block = [[0u8; 4]; 16];
    for block_y in 0..by {
        for block_x in 0..bx {
            fetch_block(src, block_x * 4, block_y * 4, &mut block);
            match format {
                CompositeFormat::Dxt1 => encode_color_block(&block, &mut out),
                CompositeFormat::Dxt5 => {
                    encode_alpha_block(&block, &mut out);
                    encode_color_block(&block, &mut out);
                }
            }
        }
    }
    out
}

/// Copy a 4×4 pixel block, clamping reads at the image edge so partial
/// blocks repeat their border pixels.
fn fetch_block(src: &RawImage, x0: u32, y0: u32, block: &mut [[u8; 4]; 16]) {
    for dy in 0..4 {
        for dx in 0..4 {
            block[(dy * 4 + dx) as usize] =
                src.pixel_clamped(x0 + dx, y0 + dy);
        }
    }
}

fn to_565(c: [u8; 3]) -> u16 {
    (u16::from(c[0] >> 3) << 11)
        | (u16::from(c[1] >> 2) << 5)
        | u16::from(c[2] >> 3)
}

fn from_565(c: u16) -> [i32; 3] {
    let r = i32::from((c >> 11) & 0x1F);
    let g = i32::from((c >> 5) & 0x3F);
    let b = i32::from(c & 0x1F);
    // Expand to 8-bit with bit replication
    [(r << 3) | (r >> 2), (g << 2) | (g >> 4), (b << 3) | (b >> 2)]
}

fn color_distance_sq(a: [i32; 3], b: [i32; 3]) -> i32 {
    let dr = a[0] - b[0];
    let dg = a[1] - b[1];
    let db = a[2] - b[2];
    dr * dr + dg * dg + db * db
}

/// Encode the 8-byte BC1 color half of a block (also the full DXT1 block).
/// Always emits four-color mode; the 1-bit-alpha three-color mode is never
/// used since composite sources are fully opaque in RGB.
fn encode_color_block(block: &[[u8; 4]; 16], out: &mut Vec<u8>) {
    let (mut lo, mut hi) = ([255u8; 3], [0u8; 3]);
    for px in block {
        for i in 0..3 {
            lo[i] = lo[i].min(px[i]);
            hi[i] = hi[i].max(px[i]);
        }
    }
    // Inset the bounding box by 1/16th of its extent
    for i in 0..3 {
        let inset = (hi[i] - lo[i]) / 16;
        lo[i] += inset;
        hi[i] -= inset;
    }

    let mut c0 = to_565(hi);
    let mut c1 = to_565(lo);
    if c0 < c1 {
        std::mem::swap(&mut c0, &mut c1);
    }
    out.extend_from_slice(&c0.to_le_bytes());
    out.extend_from_slice(&c1.to_le_bytes());

    if c0 == c1 {
        // Flat block: every pixel selects endpoint 0
        out.extend_from_slice(&[0; 4]);
        return;
    }

    let e0 = from_565(c0);
    let e1 = from_565(c1);
    let palette = [
        e0,
        e1,
        [
            (2 * e0[0] + e1[0]) / 3,
            (2 * e0[1] + e1[1]) / 3,
            (2 * e0[2] + e1[2]) / 3,
        ],
        [
            (e0[0] + 2 * e1[0]) / 3,
            (e0[1] + 2 * e1[1]) / 3,
            (e0[2] + 2 * e1[2]) / 3,
        ],
    ];

    let mut bits = 0u32;
    for (n, px) in block.iter().enumerate() {
        let c = [i32::from(px[0]), i32::from(px[1]), i32::from(px[2])];
        let mut best = 0u32;
        let mut best_d = i32::MAX;
        for (idx, pal) in palette.iter().enumerate() {
            let d = color_distance_sq(c, *pal);
            if d < best_d {
                best_d = d;
                best = idx as u32;
            }
        }
        bits |= best << (n * 2);
    }
    out.extend_from_slice(&bits.to_le_bytes());
}

/// Encode the 8-byte BC3 interpolated-alpha half of a DXT5 block.
fn encode_alpha_block(block: &[[u8; 4]; 16], out: &mut Vec<u8>) {
    let mut lo = 255u8;
    let mut hi = 0u8;
    for px in block {
        lo = lo.min(px[3]);
        hi = hi.max(px[3]);
    }
    // Eight-alpha mode requires a0 > a1
    let (a0, a1) = (hi, lo);
    out.push(a0);
    out.push(a1);

    if a0 == a1 {
        out.extend_from_slice(&[0; 6]);
        return;
    }

    let mut palette = [0i32; 8];
    palette[0] = i32::from(a0);
    palette[1] = i32::from(a1);
    for i in 0..6 {
        // alpha_i = ((6 - i) * a0 + (i + 1) * a1) / 7 for codes 2..=7
        palette[i + 2] = ((6 - i as i32) * i32::from(a0)
            + (i as i32 + 1) * i32::from(a1))
            / 7;
    }

    let mut bits = 0u64;
    for (n, px) in block.iter().enumerate() {
        let a = i32::from(px[3]);
        let mut best = 0u64;
        let mut best_d = i32::MAX;
        for (idx, pal) in palette.iter().enumerate() {
            let d = (a - pal).abs();
            if d < best_d {
                best_d = d;
                best = idx as u64;
            }
        }
        bits |= best << (n * 3);
    }
    out.extend_from_slice(&bits.to_le_bytes()[..6]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::compressed_mip_bytes;

    fn solid_image(w: u32, h: u32, color: [u8; 4]) -> RawImage {
        let mut img = RawImage::new(w, h);
        for px in img.data_mut().chunks_exact_mut(4) {
            px.copy_from_slice(&color);
        }
        img
    }

    #[test]
    fn output_sizes_match_block_math() {
        for (w, h) in [(4, 4), (8, 8), (2, 2), (6, 10)] {
            let img = solid_image(w, h, [10, 20, 30, 255]);
            for format in [CompositeFormat::Dxt1, CompositeFormat::Dxt5] {
                let bytes = compress_image(&img, format);
                assert_eq!(
                    bytes.len(),
                    compressed_mip_bytes(format, w, h),
                    "{format:?} {w}x{h}"
                );
            }
        }
    }

    #[test]
    fn solid_block_uses_single_index() {
        let img = solid_image(4, 4, [200, 100, 50, 255]);
        let bytes = compress_image(&img, CompositeFormat::Dxt1);
        // Endpoints equal, all selector bits zero
        assert_eq!(bytes[0..2], bytes[2..4]);
        assert_eq!(&bytes[4..8], &[0, 0, 0, 0]);
    }

    #[test]
    fn dxt1_endpoints_cover_extremes() {
        let mut img = solid_image(4, 4, [0, 0, 0, 255]);
        img.data_mut()[0..4].copy_from_slice(&[255, 255, 255, 255]);
        let bytes = compress_image(&img, CompositeFormat::Dxt1);
        let c0 = u16::from_le_bytes([bytes[0], bytes[1]]);
        let c1 = u16::from_le_bytes([bytes[2], bytes[3]]);
        assert!(c0 > c1);
        // The white pixel (index 0 in the block) maps to endpoint c0
        let bits = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        assert_eq!(bits & 0b11, 0);
    }

    #[test]
    fn dxt5_alpha_endpoints_and_codes() {
        let mut img = solid_image(4, 4, [0, 0, 0, 0]);
        img.data_mut()[3] = 255; // first pixel opaque
        let bytes = compress_image(&img, CompositeFormat::Dxt5);
        assert_eq!(bytes[0], 255); // a0 = max
        assert_eq!(bytes[1], 0); // a1 = min
        // First pixel's 3-bit code selects a0 (code 0)
        assert_eq!(bytes[2] & 0b111, 0);
        // Remaining pixels select a1 (code 1)
        assert_eq!((bytes[2] >> 3) & 0b111, 1);
    }

    #[test]
    fn opaque_alpha_is_flat() {
        let img = solid_image(8, 4, [1, 2, 3, 255]);
        let bytes = compress_image(&img, CompositeFormat::Dxt5);
        // Two blocks of 16 bytes; each alpha half is 255,255 then zero codes
        for block in bytes.chunks_exact(16) {
            assert_eq!(block[0], 255);
            assert_eq!(block[1], 255);
            assert_eq!(&block[2..8], &[0, 0, 0, 0, 0, 0]);
        }
    }
}
