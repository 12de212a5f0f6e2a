//! Adapter between a finished composite texture and the texture system's
//! lazy-regeneration callback.
//!
//! When the consumer of a published texture asks for its bits (a device
//! reset, a quality change), the adapter copies the already-computed
//! compressed image into the destination; if the composite's inputs have
//! changed since that image was produced, it additionally flags the
//! texture so the generator's next sweep re-queues it.

use std::sync::Arc;

use crate::texture::CompositeTexture;
use crate::visuals::VisualsDataProcessor;

/// Regeneration callback target for one published composite texture.
pub struct CompositeTextureResult {
    texture: Arc<CompositeTexture>,
    processor: Arc<dyn VisualsDataProcessor>,
}

impl CompositeTextureResult {
    /// Wrap a composite texture for registration with the texture system.
    #[must_use]
    pub fn new(
        texture: Arc<CompositeTexture>,
        processor: Arc<dyn VisualsDataProcessor>,
    ) -> Self {
        Self { texture, processor }
    }

    /// The wrapped composite texture.
    #[must_use]
    pub fn texture(&self) -> &Arc<CompositeTexture> {
        &self.texture
    }

    /// Fill `dest` with the texture's current compressed bits (all mip
    /// levels, packed). Before the first generation completes, or if the
    /// generation degraded, `dest` is zero-filled, so the consumer always
    /// gets a valid blank image. If the composite's inputs no longer match
    /// the bits delivered, the texture is flagged for regeneration.
    ///
    /// Returns whether real (non-blank) bits were delivered.
    pub fn regenerate_bits(&self, dest: &mut [u8]) -> bool {
        let delivered = self.texture.copy_result(dest);
        if delivered
            && !self
                .texture
                .matches(self.texture.key(), &self.processor.comparison_blob())
        {
            log::debug!(
                "composite texture {} inputs changed; requesting regeneration",
                self.texture.name()
            );
            self.texture.request_regenerate();
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{
        CompositeFormat, CompositeKey, MaterialParamId, TextureSize,
    };
    use crate::visuals::MaterialDesc;

    struct BlobProcessor(Vec<u8>);

    impl VisualsDataProcessor for BlobProcessor {
        fn material_desc(&self, _param: MaterialParamId) -> MaterialDesc {
            MaterialDesc::default()
        }

        fn comparison_blob(&self) -> Vec<u8> {
            self.0.clone()
        }
    }

    #[test]
    fn blank_bits_before_completion() {
        let processor: Arc<dyn VisualsDataProcessor> =
            Arc::new(BlobProcessor(b"seed1".to_vec()));
        let key = CompositeKey {
            material_param: MaterialParamId::BaseDiffuse,
            size: TextureSize::Size128,
            format: CompositeFormat::Dxt1,
            srgb: true,
            ignore_picmip: false,
        };
        let texture = Arc::new(CompositeTexture::new(
            key,
            Arc::clone(&processor),
            "composite_result_test".into(),
            0,
        ));
        let result =
            CompositeTextureResult::new(Arc::clone(&texture), processor);

        let mut dest = vec![0x55; 128];
        assert!(!result.regenerate_bits(&mut dest));
        assert!(dest.iter().all(|&b| b == 0));
        assert!(!texture.needs_regenerate());
    }
}
