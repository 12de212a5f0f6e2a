//! One requested composite texture and its generation state machine.
//!
//! A `CompositeTexture` walks a fixed, ordered pipeline. Main-thread-owned
//! stages (material creation, offscreen render, readback issue, cleanup,
//! finalize) are advanced only from [`crate::generator::CompositeTextureGenerator::process`];
//! worker-owned stages (source-load polling, readback waits, mip
//! generation and compression) are advanced only from
//! [`generation_step`](CompositeTexture::generation_step). No stage is
//! advanced by both sides; the interior mutex exists for memory safety,
//! not for step arbitration.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::device::{
    MaterialId, ReadbackPoll, RenderDevice, ResultTextureId, SourceTexture,
    TextureManager, WaitHandle,
};
use crate::image::{compress::compress_image, CompressedImage, RawImage};
use crate::key::CompositeKey;
use crate::pool::{RenderTargetPool, SlotRef};
use crate::visuals::{MaterialDesc, VisualsDataProcessor};

/// Position of one composite texture in its generation pipeline. Stages
/// advance strictly in declaration order; the only backward move is a full
/// reset to [`NotStarted`](Stage::NotStarted), and the only skip is the
/// degraded jump straight to [`Complete`](Stage::Complete).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    /// Created; nothing requested yet.
    NotStarted,
    /// Source-texture load requests have been issued.
    AsyncTextureLoad,
    /// Polling until every source texture reports load-complete.
    WaitingForAsyncTextureLoadFinish,
    /// Needs a render-target pool slot and result buffers.
    NeedsInit,
    /// Needs the compositing material instantiated.
    NeedsCompositingMaterial,
    /// Ready for the main thread to render the composite.
    WaitingForRenderToRt,
    /// Rendered; one frame interposed before the readback is issued so
    /// the GPU pipeline can drain.
    RenderedToRt,
    /// Ready for the main thread to issue the asynchronous pixel read.
    WaitingForReadRt,
    /// Readback issued; worker polls its wait handle.
    RequestedRead,
    /// Ready for the main thread to issue the get-result call.
    WaitingForGetResult,
    /// Get-result issued; worker polls the second wait handle.
    RequestedGetResult,
    /// Scratch pixels are authoritative; worker compresses them.
    CopyToVtfComplete,
    /// Ready for the main thread to release the material and sources.
    WaitingForMaterialCleanup,
    /// Terminal: the result image is authoritative.
    Complete,
}

/// Mutable generation state, shared between the main thread and the
/// worker behind a mutex.
struct GenState {
    stage: Stage,
    /// Bumped on every reset so a stale worker step can detect it.
    generation: u64,
    actual_size: u32,
    blob: Vec<u8>,
    desc: Option<MaterialDesc>,
    sources: Vec<SourceTexture>,
    slot: Option<SlotRef>,
    material: Option<MaterialId>,
    result_image: Option<CompressedImage>,
    result_texture: Option<ResultTextureId>,
    read_wait: Option<Arc<dyn WaitHandle>>,
    result_wait: Option<Arc<dyn WaitHandle>>,
}

impl GenState {
    fn advance(&mut self, next: Stage) {
        debug_assert!(
            next >= self.stage || next == Stage::NotStarted,
            "stage must not move backward"
        );
        log::trace!("stage {:?} -> {next:?}", self.stage);
        self.stage = next;
    }

    /// Non-fatal failure: drop transient resources and complete degraded.
    fn degrade(&mut self, name: &str, reason: &str) {
        log::warn!("composite texture {name}: {reason}; completing without a result");
        self.slot = None;
        self.read_wait = None;
        self.result_wait = None;
        self.advance(Stage::Complete);
    }
}

/// One requested derived texture: its identity, pipeline stage, and the
/// resources it transiently or permanently owns.
pub struct CompositeTexture {
    key: CompositeKey,
    name: String,
    processor: Arc<dyn VisualsDataProcessor>,
    state: Mutex<GenState>,
    finalized: AtomicBool,
    regen_requested: AtomicBool,
}

impl CompositeTexture {
    /// Create a texture in [`Stage::NotStarted`], capturing the current
    /// comparison blob and picmip-adjusted size.
    #[must_use]
    pub fn new(
        key: CompositeKey,
        processor: Arc<dyn VisualsDataProcessor>,
        name: String,
        picmip: u32,
    ) -> Self {
        let blob = processor.comparison_blob();
        Self {
            key,
            name,
            processor,
            state: Mutex::new(GenState {
                stage: Stage::NotStarted,
                generation: 0,
                actual_size: key.actual_size(picmip),
                blob,
                desc: None,
                sources: Vec::new(),
                slot: None,
                material: None,
                result_image: None,
                result_texture: None,
                read_wait: None,
                result_wait: None,
            }),
            finalized: AtomicBool::new(false),
            regen_requested: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, GenState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The immutable request key.
    #[must_use]
    pub const fn key(&self) -> &CompositeKey {
        &self.key
    }

    /// The generated texture name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current pipeline stage.
    #[must_use]
    pub fn stage(&self) -> Stage {
        self.lock().stage
    }

    /// Picmip-adjusted edge length for the current generation.
    #[must_use]
    pub fn actual_size(&self) -> u32 {
        self.lock().actual_size
    }

    /// The published result texture, once created.
    #[must_use]
    pub fn result_texture(&self) -> Option<ResultTextureId> {
        self.lock().result_texture
    }

    /// Name of the pool slot currently borrowed, if any.
    #[must_use]
    pub fn acquired_slot_name(&self) -> Option<String> {
        self.lock()
            .slot
            .as_ref()
            .map(|s| s.slot().name().to_owned())
    }

    /// Exact `(key, comparison blob)` match against a fresh request.
    #[must_use]
    pub fn matches(&self, key: &CompositeKey, blob: &[u8]) -> bool {
        self.key == *key && self.lock().blob == blob
    }

    // -- predicates ------------------------------------------------------

    /// The pipeline has reached its terminal stage.
    #[must_use]
    pub fn generation_complete(&self) -> bool {
        self.stage() == Stage::Complete
    }

    /// The finished result has been uploaded to the published texture.
    #[must_use]
    pub fn is_finalized(&self) -> bool {
        self.finalized.load(Ordering::Acquire)
    }

    /// Complete but not yet uploaded.
    #[must_use]
    pub fn needs_finalize(&self) -> bool {
        self.generation_complete() && !self.is_finalized()
    }

    /// Waiting for the main thread's offscreen render.
    #[must_use]
    pub fn needs_render(&self) -> bool {
        self.stage() == Stage::WaitingForRenderToRt
    }

    /// Waiting for the main thread to issue the pixel readback.
    #[must_use]
    pub fn needs_read_rt(&self) -> bool {
        self.stage() == Stage::WaitingForReadRt
    }

    /// The inputs that produced the published result have changed.
    #[must_use]
    pub fn needs_regenerate(&self) -> bool {
        if self.regen_requested.load(Ordering::Acquire) {
            return true;
        }
        self.is_finalized() && self.lock().blob != self.processor.comparison_blob()
    }

    /// Flag this texture for regeneration on the next generator sweep.
    /// Used by the result adapter when a consumer observes stale inputs.
    pub fn request_regenerate(&self) {
        self.regen_requested.store(true, Ordering::Release);
    }

    /// Copy the finished compressed bits (all mips, packed) into `dest`.
    /// Returns false and zero-fills when no result exists yet or `dest`
    /// has the wrong size, so a consumer always sees a valid blank.
    pub fn copy_result(&self, dest: &mut [u8]) -> bool {
        let state = self.lock();
        match &state.result_image {
            Some(image) if self.is_finalized() => image.write_packed(dest),
            _ => {
                dest.fill(0);
                false
            }
        }
    }

    // -- main-thread steps -----------------------------------------------

    /// `NOT_STARTED`: build the material description and issue async load
    /// requests for every source texture it references.
    pub fn do_async_texture_load(&self, textures: &mut dyn TextureManager) {
        let mut state = self.lock();
        if state.stage != Stage::NotStarted {
            return;
        }
        let desc = self.processor.material_desc(self.key.material_param);
        if desc.is_empty() {
            state.degrade(&self.name, "empty compositing material description");
            return;
        }
        state.sources = desc
            .textures
            .iter()
            .map(|t| textures.find_or_load_async(&t.path))
            .collect();
        state.desc = Some(desc);
        state.advance(Stage::AsyncTextureLoad);
    }

    /// `NEEDS_INIT`: acquire a pool slot sized for the current generation
    /// and (re)create the result buffers to match the slot's mip chain.
    /// Allocation failure completes the texture degraded, not fatally.
    pub fn init_resources(
        &self,
        pool: &RenderTargetPool,
        device: &mut dyn RenderDevice,
    ) {
        let mut state = self.lock();
        if state.stage != Stage::NeedsInit {
            return;
        }
        let Some(slot) = pool.acquire(state.actual_size) else {
            state.degrade(&self.name, "no render target pool slot available");
            return;
        };
        let size = slot.slot().pixel_size();

        let dims_changed = state
            .result_image
            .as_ref()
            .is_none_or(|img| img.width() != size);
        if dims_changed {
            if let Some(old) = state.result_texture.take() {
                device.destroy_result_texture(old);
            }
            match device.create_result_texture(
                &self.name,
                self.key.format,
                size,
                self.key.srgb,
            ) {
                Ok(texture) => state.result_texture = Some(texture),
                Err(e) => {
                    drop(slot);
                    state.degrade(
                        &self.name,
                        &format!("result texture creation failed: {e}"),
                    );
                    return;
                }
            }
        }
        state.result_image =
            Some(CompressedImage::with_layout(self.key.format, size, size));
        state.slot = Some(slot);
        state.advance(Stage::NeedsCompositingMaterial);
    }

    /// `NEEDS_COMPOSITING_MATERIAL`: instantiate the generated material.
    /// An error material completes the texture degraded.
    pub fn create_compositing_material(&self, device: &mut dyn RenderDevice) {
        let mut state = self.lock();
        if state.stage != Stage::NeedsCompositingMaterial {
            return;
        }
        let Some(desc) = state.desc.clone() else {
            state.degrade(&self.name, "missing material description");
            return;
        };
        match device.create_material(&desc, &state.sources) {
            Ok(material) => {
                state.material = Some(material);
                state.advance(Stage::WaitingForRenderToRt);
            }
            Err(e) => {
                state.degrade(
                    &self.name,
                    &format!("compositing material instantiation failed: {e}"),
                );
            }
        }
    }

    /// `WAITING_FOR_RENDER_TO_RT`: render the full-screen composite into
    /// the borrowed render target at its native resolution.
    pub fn render_to_rt(&self, device: &mut dyn RenderDevice) {
        let mut state = self.lock();
        if state.stage != Stage::WaitingForRenderToRt {
            return;
        }
        let target = state.slot.as_ref().map(|s| s.slot().target());
        match (state.material, target) {
            (Some(material), Some(target)) => {
                device.render_composite(material, target);
                state.advance(Stage::RenderedToRt);
            }
            _ => state.degrade(&self.name, "render resources missing"),
        }
    }

    /// `RENDERED_TO_RT`: interpose exactly one frame before issuing the
    /// readback so the GPU pipeline drains.
    pub fn advance_to_read_rt(&self) {
        let mut state = self.lock();
        if state.stage == Stage::RenderedToRt {
            state.advance(Stage::WaitingForReadRt);
        }
    }

    /// `WAITING_FOR_READ_RT`: issue the non-blocking asynchronous pixel
    /// read and hold its wait handle for the worker to poll.
    pub fn read_rt(&self, device: &mut dyn RenderDevice) {
        let mut state = self.lock();
        if state.stage != Stage::WaitingForReadRt {
            return;
        }
        let Some(target) = state.slot.as_ref().map(|s| s.slot().target())
        else {
            state.degrade(&self.name, "pool slot lost before readback");
            return;
        };
        let wait = device.read_render_target(target);
        state.read_wait = Some(Arc::from(wait));
        state.advance(Stage::RequestedRead);
    }

    /// `WAITING_FOR_GETRESULT`: issue the get-result call that moves the
    /// pixels into the slot's scratch image.
    pub fn get_read_rt_result(&self, device: &mut dyn RenderDevice) {
        let mut state = self.lock();
        if state.stage != Stage::WaitingForGetResult {
            return;
        }
        let Some((target, scratch)) = state
            .slot
            .as_ref()
            .map(|s| (s.slot().target(), s.slot().scratch()))
        else {
            state.degrade(&self.name, "pool slot lost before get-result");
            return;
        };
        let wait = device.resolve_readback(target, &scratch);
        state.result_wait = Some(Arc::from(wait));
        state.advance(Stage::RequestedGetResult);
    }

    /// `WAITING_FOR_MATERIAL_CLEANUP`: release the compositing material
    /// and every preloaded source texture.
    pub fn cleanup_compositing_material(
        &self,
        device: &mut dyn RenderDevice,
        textures: &mut dyn TextureManager,
    ) {
        let mut state = self.lock();
        if state.stage != Stage::WaitingForMaterialCleanup {
            return;
        }
        if let Some(material) = state.material.take() {
            device.destroy_material(material);
        }
        for source in state.sources.drain(..) {
            textures.release(&source);
        }
        state.desc = None;
        state.advance(Stage::Complete);
    }

    /// `COMPLETE`: upload the result image into the published texture.
    /// With `release_result` set, the CPU-side copy is freed afterwards
    /// (platforms where the GPU copy is the sole consumer).
    pub fn finalize(&self, device: &mut dyn RenderDevice, release_result: bool) {
        {
            let mut state = self.lock();
            if state.stage != Stage::Complete {
                return;
            }
            if let (Some(texture), Some(image)) =
                (state.result_texture, state.result_image.as_ref())
            {
                device.upload_compressed(texture, image);
                log::debug!(
                    "composite texture {} finalized ({} bytes)",
                    self.name,
                    image.total_bytes()
                );
            }
            if release_result {
                state.result_image = None;
            }
        }
        self.finalized.store(true, Ordering::Release);
    }

    // -- worker steps ----------------------------------------------------

    /// Advance one CPU-only stage if one is due. Readback polls are
    /// bounded by `readback_wait`; the call never blocks longer. Returns
    /// whether any stage advanced.
    pub fn generation_step(&self, readback_wait: Duration) -> bool {
        let stage = self.stage();
        match stage {
            Stage::AsyncTextureLoad => {
                let mut state = self.lock();
                if state.stage == Stage::AsyncTextureLoad {
                    state.advance(Stage::WaitingForAsyncTextureLoadFinish);
                    return true;
                }
                false
            }
            Stage::WaitingForAsyncTextureLoadFinish => {
                let mut state = self.lock();
                if state.stage == Stage::WaitingForAsyncTextureLoadFinish
                    && state.sources.iter().all(SourceTexture::is_loaded)
                {
                    state.advance(Stage::NeedsInit);
                    return true;
                }
                false
            }
            Stage::RequestedRead => self.poll_wait(
                readback_wait,
                |state| state.read_wait.clone(),
                |state| {
                    state.read_wait = None;
                    state.advance(Stage::WaitingForGetResult);
                },
            ),
            Stage::RequestedGetResult => self.poll_wait(
                readback_wait,
                |state| state.result_wait.clone(),
                |state| {
                    state.result_wait = None;
                    state.advance(Stage::CopyToVtfComplete);
                },
            ),
            Stage::CopyToVtfComplete => self.compress_scratch(),
            _ => false,
        }
    }

    /// Poll a wait handle without holding the state lock, then advance
    /// under the lock if the handle signaled and no reset intervened.
    fn poll_wait(
        &self,
        timeout: Duration,
        get: impl Fn(&GenState) -> Option<Arc<dyn WaitHandle>>,
        advance: impl FnOnce(&mut GenState),
    ) -> bool {
        let (wait, generation) = {
            let state = self.lock();
            (get(&state), state.generation)
        };
        let Some(wait) = wait else { return false };
        if wait.wait_for(timeout) == ReadbackPoll::Pending {
            return false;
        }
        let mut state = self.lock();
        if state.generation != generation {
            return false;
        }
        advance(&mut state);
        true
    }

    /// `COPY_TO_VTF_COMPLETE`: release the render-target borrow, build
    /// the full mip chain from the scratch image, and block-compress every
    /// level into the result image. Runs entirely on the worker; the state
    /// lock is dropped for the duration of the compression.
    fn compress_scratch(&self) -> bool {
        let (slot, generation) = {
            let mut state = self.lock();
            if state.stage != Stage::CopyToVtfComplete {
                return false;
            }
            let Some(slot) = state.slot.take() else {
                state.degrade(&self.name, "pool slot lost before compression");
                return true;
            };
            (slot, state.generation)
        };

        let format = self.key.format;
        let compressed = {
            let scratch = slot.slot().scratch();
            let guard =
                scratch.lock().unwrap_or_else(PoisonError::into_inner);
            compress_chain(&guard, format)
        };
        // Slot borrow ends here; the render target returns to the pool
        // before the (still scratch-free) state update below.
        drop(slot);

        let mut state = self.lock();
        if state.generation != generation || state.stage != Stage::CopyToVtfComplete
        {
            // Reset raced the compression; discard the stale output.
            return false;
        }
        if let Some(image) = state.result_image.as_mut() {
            for (level, bytes) in compressed.into_iter().enumerate() {
                image.set_mip(level as u32, bytes);
            }
        }
        state.advance(Stage::WaitingForMaterialCleanup);
        true
    }

    // -- lifecycle -------------------------------------------------------

    /// Reset to [`Stage::NotStarted`] for a fresh generation pass,
    /// releasing any resources still held from the prior one and
    /// recapturing `actual_size` and the comparison blob.
    pub fn force_regenerate(
        &self,
        device: &mut dyn RenderDevice,
        textures: &mut dyn TextureManager,
        picmip: u32,
    ) {
        let mut state = self.lock();
        if let Some(material) = state.material.take() {
            device.destroy_material(material);
        }
        for source in state.sources.drain(..) {
            textures.release(&source);
        }
        state.desc = None;
        state.slot = None;
        state.read_wait = None;
        state.result_wait = None;
        state.generation += 1;
        state.actual_size = self.key.actual_size(picmip);
        state.blob = self.processor.comparison_blob();
        state.advance(Stage::NotStarted);
        self.finalized.store(false, Ordering::Release);
        self.regen_requested.store(false, Ordering::Release);
    }

    /// Release everything this texture owns. Called by the generator when
    /// the texture is destroyed or at shutdown.
    pub fn release_resources(
        &self,
        device: &mut dyn RenderDevice,
        textures: &mut dyn TextureManager,
    ) {
        let mut state = self.lock();
        if let Some(material) = state.material.take() {
            device.destroy_material(material);
        }
        for source in state.sources.drain(..) {
            textures.release(&source);
        }
        if let Some(texture) = state.result_texture.take() {
            device.destroy_result_texture(texture);
        }
        state.desc = None;
        state.slot = None;
        state.read_wait = None;
        state.result_wait = None;
        state.result_image = None;
    }
}

/// Compress the base level and its full mip chain.
fn compress_chain(
    base: &RawImage,
    format: crate::key::CompositeFormat,
) -> Vec<Vec<u8>> {
    let mut levels = vec![compress_image(base, format)];
    for mip in base.mip_chain() {
        levels.push(compress_image(&mip, format));
    }
    levels
}
