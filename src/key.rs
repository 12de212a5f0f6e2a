//! Composite texture identity: size/format classes, material parameter
//! slots, and the cache key.

use serde::{Deserialize, Serialize};

/// Power-of-two size class for a composite texture, stored as the exponent
/// so picmip reduction is a shift.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
pub enum TextureSize {
    /// 128 × 128.
    Size128,
    /// 256 × 256.
    Size256,
    /// 512 × 512.
    Size512,
    /// 1024 × 1024.
    Size1024,
    /// 2048 × 2048.
    Size2048,
}

impl TextureSize {
    /// The power-of-two exponent for this class (`pixels() == 1 << exponent()`).
    #[must_use]
    pub const fn exponent(self) -> u32 {
        match self {
            Self::Size128 => 7,
            Self::Size256 => 8,
            Self::Size512 => 9,
            Self::Size1024 => 10,
            Self::Size2048 => 11,
        }
    }

    /// Edge length in pixels.
    #[must_use]
    pub const fn pixels(self) -> u32 {
        1 << self.exponent()
    }
}

/// Block-compressed output format for the published result texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompositeFormat {
    /// BC1: opaque RGB, 8 bytes per 4×4 block.
    Dxt1,
    /// BC3: RGBA with interpolated alpha, 16 bytes per 4×4 block.
    Dxt5,
}

impl CompositeFormat {
    /// Bytes per 4×4 block.
    #[must_use]
    pub const fn block_bytes(self) -> usize {
        match self {
            Self::Dxt1 => 8,
            Self::Dxt5 => 16,
        }
    }
}

/// Which material parameter the composite texture is bound to on the
/// consuming material.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MaterialParamId {
    /// The base diffuse/albedo map (sRGB).
    BaseDiffuse,
    /// The tangent-space bump map (linear).
    BumpMap,
    /// The packed masks map (linear).
    Masks,
}

impl MaterialParamId {
    /// Short identifier used in generated texture names.
    #[must_use]
    pub const fn ident(self) -> &'static str {
        match self {
            Self::BaseDiffuse => "diffuse",
            Self::BumpMap => "bump",
            Self::Masks => "masks",
        }
    }
}

/// Smallest size a picmip-reduced composite may reach: one DXT block.
pub const MIN_ACTUAL_SIZE: u32 = 4;

/// Immutable identity of one composite texture request. Two live
/// [`CompositeTexture`](crate::texture::CompositeTexture) instances never
/// share an equal `(key, comparison blob)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CompositeKey {
    /// Material parameter slot the result feeds.
    pub material_param: MaterialParamId,
    /// Requested size class before picmip reduction.
    pub size: TextureSize,
    /// Output compression format.
    pub format: CompositeFormat,
    /// Whether the result texture samples as sRGB.
    pub srgb: bool,
    /// Skip picmip reduction for this texture.
    pub ignore_picmip: bool,
}

impl CompositeKey {
    /// Edge length in pixels after applying the global picmip level.
    ///
    /// Recomputed on every regeneration since the global setting can
    /// change between generations. Clamped so the result never drops
    /// below one DXT block.
    #[must_use]
    pub fn actual_size(&self, picmip: u32) -> u32 {
        if self.ignore_picmip {
            return self.size.pixels();
        }
        (self.size.pixels() >> picmip).max(MIN_ACTUAL_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_classes_are_powers_of_two() {
        assert_eq!(TextureSize::Size128.pixels(), 128);
        assert_eq!(TextureSize::Size2048.pixels(), 2048);
        assert_eq!(
            1 << TextureSize::Size512.exponent(),
            TextureSize::Size512.pixels()
        );
    }

    #[test]
    fn picmip_reduces_actual_size() {
        let key = CompositeKey {
            material_param: MaterialParamId::BaseDiffuse,
            size: TextureSize::Size1024,
            format: CompositeFormat::Dxt5,
            srgb: true,
            ignore_picmip: false,
        };
        assert_eq!(key.actual_size(0), 1024);
        assert_eq!(key.actual_size(2), 256);
        // Never below one block
        assert_eq!(key.actual_size(30), MIN_ACTUAL_SIZE);
    }

    #[test]
    fn ignore_picmip_keeps_full_size() {
        let key = CompositeKey {
            material_param: MaterialParamId::Masks,
            size: TextureSize::Size256,
            format: CompositeFormat::Dxt1,
            srgb: false,
            ignore_picmip: true,
        };
        assert_eq!(key.actual_size(3), 256);
    }
}
