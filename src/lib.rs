// -- Lint policy ---------------------------------------------------------
// This is the single source of truth for crate-wide lints.

// Broad lint groups
#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![deny(clippy::nursery)]
// Documentation
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(rustdoc::private_intra_doc_links)]
#![deny(rustdoc::bare_urls)]
// No panicking in library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::todo)]
#![deny(clippy::unimplemented)]
// No debug/print artifacts
#![deny(clippy::dbg_macro)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
// Import hygiene
#![deny(clippy::wildcard_imports)]
// Function signature hygiene
#![deny(clippy::fn_params_excessive_bools)]
// Clone / pass-by-value hygiene
#![deny(clippy::needless_pass_by_value)]
#![deny(clippy::implicit_clone)]
// String hygiene
#![deny(clippy::inefficient_to_string)]
#![deny(clippy::redundant_closure_for_method_calls)]
#![deny(clippy::manual_string_new)]
#![deny(clippy::str_to_string)]
// Cargo lints (warn, not deny since cargo lints can be noisy)
#![warn(clippy::cargo)]
// Unused / redundant code
#![deny(unused_results)]
#![deny(unused_qualifications)]
// Cast hygiene
#![deny(trivial_casts)]
#![deny(trivial_numeric_casts)]
// Pixel/block math truncations are intentional throughout
#![allow(clippy::cast_possible_truncation)]

//! Asynchronous composite texture generation built on wgpu.
//!
//! Weft synthesizes derived textures (custom-skinned weapon or character
//! surfaces) by rendering a generated compositing material into a pooled
//! offscreen render target, reading the pixels back asynchronously,
//! compressing them into a mipmapped DXT image, and publishing the result
//! as an ordinary sampleable texture, without ever stalling the render
//! thread.
//!
//! # Key entry points
//!
//! - [`generator::CompositeTextureGenerator`] - the orchestrator; call
//!   [`process`](generator::CompositeTextureGenerator::process) once per
//!   rendered frame
//! - [`texture::CompositeTexture`] - one requested derived texture and its
//!   generation state machine
//! - [`visuals::VisualsDataProcessor`] - the seam through which game code
//!   describes what to composite
//! - [`options::GeneratorOptions`] - runtime configuration (pool size
//!   classes, picmip, worker timing)
//!
//! # Architecture
//!
//! The generator runs one background worker thread that advances the
//! CPU-only pipeline stages (source-texture load checks, readback polling,
//! mip generation, block compression) for whichever texture it has pulled
//! off the work queue. The main thread advances the GPU-owning stages
//! (material creation, offscreen render, readback issue, finalize) at a
//! rate of at most one step of one texture per frame. The two sides meet
//! only at each texture's stage field; see [`texture::Stage`] for the
//! fixed pipeline order.

pub mod device;
pub mod error;
pub mod generator;
pub mod gpu;
pub mod image;
pub mod key;
pub mod options;
pub mod pool;
pub mod result;
pub mod texture;
pub mod visuals;

pub use error::WeftError;
pub use generator::{CompositeTextureGenerator, CompositeTextureInfo};
pub use key::{CompositeFormat, CompositeKey, MaterialParamId, TextureSize};
pub use options::GeneratorOptions;
pub use texture::{CompositeTexture, Stage};
