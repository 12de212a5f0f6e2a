//! The seam between game/content code and the generation pipeline: a
//! visuals-data processor turns item state (paint kit, wear, seed) into a
//! compositing-material description and a comparison blob.

use std::fmt;

use crate::key::MaterialParamId;

/// One source texture referenced by a compositing material: the shader
/// parameter it binds to (`$basetexture`-style name) and the asset path to
/// load asynchronously.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceTextureRef {
    /// Shader parameter name, e.g. `$basetexture` or `$patterntexture`.
    pub param: String,
    /// Asset path of the texture to load.
    pub path: String,
}

/// A generated compositing-material description: the shader to run and the
/// keyvalues feeding it. Used only transiently while rendering one
/// composite into a pooled render target.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MaterialDesc {
    /// Shader name.
    pub shader: String,
    /// Source textures the shader samples and blends.
    pub textures: Vec<SourceTextureRef>,
    /// Scalar shader parameters (pattern scale, rotation, wear, ...).
    pub params: Vec<(String, f32)>,
}

impl MaterialDesc {
    /// Whether the description references anything renderable at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.shader.is_empty() || self.textures.is_empty()
    }
}

impl fmt::Display for MaterialDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} textures)", self.shader, self.textures.len())
    }
}

/// Produces compositing-material descriptions and the comparison blob for
/// one item's visual state.
///
/// The blob is an opaque byte sequence covering every input that feeds the
/// composite; the generator uses byte equality for cache lookup and for
/// detecting that an already-published texture has gone stale.
pub trait VisualsDataProcessor: Send + Sync {
    /// Build the compositing-material description for one material
    /// parameter slot.
    fn material_desc(&self, param: MaterialParamId) -> MaterialDesc;

    /// The current comparison blob. Must change whenever any composite
    /// input changes, and only then.
    fn comparison_blob(&self) -> Vec<u8>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_descriptions_are_detected() {
        assert!(MaterialDesc::default().is_empty());
        let desc = MaterialDesc {
            shader: "weapon_composite".into(),
            textures: vec![SourceTextureRef {
                param: "$basetexture".into(),
                path: "weapons/ak47_base".into(),
            }],
            params: Vec::new(),
        };
        assert!(!desc.is_empty());
    }
}
