//! Narrow capability traits over the external rendering device and texture
//! manager.
//!
//! The pipeline never talks to a GPU API directly; it drives these traits.
//! [`crate::gpu::WgpuDevice`] is the production implementation, and tests
//! inject fakes — in particular fake [`WaitHandle`]s, so every stage of the
//! pipeline runs identically without real GPU objects.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::WeftError;
use crate::image::{CompressedImage, RawImage};
use crate::key::CompositeFormat;
use crate::visuals::MaterialDesc;

/// Outcome of one bounded wait on a readback handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadbackPoll {
    /// The associated GPU work has signaled completion.
    Ready,
    /// Still in flight; poll again.
    Pending,
}

/// A manually-signaled completion handle for asynchronous GPU work.
///
/// The generation worker polls these with a bounded timeout and loops, so
/// thread shutdown can always interrupt promptly; implementations must
/// never block longer than the passed timeout.
pub trait WaitHandle: Send + Sync {
    /// Wait up to `timeout` for the work to complete.
    fn wait_for(&self, timeout: Duration) -> ReadbackPoll;
}

/// A [`WaitHandle`] backed by a shared atomic flag. The device side stores
/// `true` when the GPU signals; the polling side spins in bounded slices.
#[derive(Debug, Clone, Default)]
pub struct FlagWait {
    flag: Arc<AtomicBool>,
}

impl FlagWait {
    /// Create an unsignaled handle.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The flag the device side signals through.
    #[must_use]
    pub fn signal(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.flag)
    }
}

impl WaitHandle for FlagWait {
    fn wait_for(&self, timeout: Duration) -> ReadbackPoll {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            if self.flag.load(Ordering::Acquire) {
                return ReadbackPoll::Ready;
            }
            if std::time::Instant::now() >= deadline {
                return ReadbackPoll::Pending;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}

/// Identifies one pooled render target owned by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RenderTargetId(pub u32);

/// Identifies one instantiated compositing material.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MaterialId(pub u32);

/// Identifies one published (sampleable) result texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResultTextureId(pub u32);

/// The CPU-side scratch image paired with a pooled render target, shared
/// between the device (which fills it during readback) and the worker
/// (which compresses from it).
pub type SharedScratch = Arc<Mutex<RawImage>>;

/// A source texture handle with a poll-only loaded flag.
///
/// The generation worker polls [`is_loaded`](Self::is_loaded) without
/// touching the texture manager; a load that never completes is
/// indistinguishable from one still in flight.
#[derive(Debug, Clone)]
pub struct SourceTexture {
    path: String,
    loaded: Arc<AtomicBool>,
}

impl SourceTexture {
    /// Create a handle whose loaded state is driven through `loaded`.
    #[must_use]
    pub fn new(path: String, loaded: Arc<AtomicBool>) -> Self {
        Self { path, loaded }
    }

    /// Asset path this handle refers to.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Non-blocking: has the asynchronous load finished?
    #[must_use]
    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::Acquire)
    }
}

/// The rendering device and material system, as consumed by the pipeline.
///
/// Every method is main-thread-only; the worker thread never holds a
/// reference to the device, only to [`WaitHandle`]s it returned.
pub trait RenderDevice {
    /// Create an offscreen render target of `size`×`size` pixels.
    ///
    /// # Errors
    ///
    /// Returns [`WeftError::Device`] if the target cannot be allocated.
    fn create_render_target(
        &mut self,
        name: &str,
        size: u32,
        srgb: bool,
    ) -> Result<RenderTargetId, WeftError>;

    /// Destroy a render target created by this device.
    fn destroy_render_target(&mut self, target: RenderTargetId);

    /// Instantiate a compositing material from its description and the
    /// already-loaded source textures it samples.
    ///
    /// # Errors
    ///
    /// Returns [`WeftError::MaterialCreation`] when instantiation yields
    /// the error material (missing shader, unresolved source texture).
    fn create_material(
        &mut self,
        desc: &MaterialDesc,
        sources: &[SourceTexture],
    ) -> Result<MaterialId, WeftError>;

    /// Destroy a compositing material.
    fn destroy_material(&mut self, material: MaterialId);

    /// Render a full-screen quad with `material` into `target` at the
    /// target's native resolution.
    fn render_composite(&mut self, material: MaterialId, target: RenderTargetId);

    /// Issue a non-blocking asynchronous pixel read from `target`. The
    /// returned handle signals once the GPU has finished the copy.
    fn read_render_target(&mut self, target: RenderTargetId) -> Box<dyn WaitHandle>;

    /// Finalize a previously issued read: start the transfer of the pixels
    /// into `dest`. The returned handle signals once `dest` holds the
    /// target's contents.
    fn resolve_readback(
        &mut self,
        target: RenderTargetId,
        dest: &SharedScratch,
    ) -> Box<dyn WaitHandle>;

    /// Create the published result texture game code will sample.
    ///
    /// # Errors
    ///
    /// Returns [`WeftError::Device`] if the texture cannot be created.
    fn create_result_texture(
        &mut self,
        name: &str,
        format: CompositeFormat,
        size: u32,
        srgb: bool,
    ) -> Result<ResultTextureId, WeftError>;

    /// Destroy a published result texture.
    fn destroy_result_texture(&mut self, texture: ResultTextureId);

    /// Upload a compressed image (all mip levels) into a result texture.
    fn upload_compressed(&mut self, texture: ResultTextureId, image: &CompressedImage);

    /// Pump device-side completion callbacks. Called once per frame from
    /// the main thread; wait handles only observe flags flipped here or on
    /// GPU-driven threads.
    fn poll_events(&mut self);
}

/// The external texture manager: find-or-load with an asynchronous
/// download flag.
pub trait TextureManager {
    /// Begin (or join) an asynchronous load of `path`, returning a handle
    /// whose loaded flag flips when the download finishes.
    fn find_or_load_async(&mut self, path: &str) -> SourceTexture;

    /// Release a handle obtained from
    /// [`find_or_load_async`](Self::find_or_load_async).
    fn release(&mut self, texture: &SourceTexture);
}
