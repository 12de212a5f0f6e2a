//! The composite texture generator: owns the render-target pool, the
//! pending/ready texture lists, the work queue, and the background
//! generation worker thread.
//!
//! One generator exists per process, constructed by the render subsystem's
//! startup code and passed by reference to anything that requests
//! composites. [`process`](CompositeTextureGenerator::process) must be
//! called once per rendered frame; it performs at most one main-thread
//! stage step of one texture per call so composite generation never causes
//! a frame-time spike.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use crate::device::{RenderDevice, TextureManager};
use crate::error::WeftError;
use crate::key::{CompositeFormat, CompositeKey, MaterialParamId, TextureSize};
use crate::options::GeneratorOptions;
use crate::pool::RenderTargetPool;
use crate::texture::{CompositeTexture, Stage};
use crate::visuals::VisualsDataProcessor;

/// One composite texture request, grouping the visuals processor with the
/// parameters that form the cache key.
#[derive(Clone)]
pub struct CompositeTextureInfo {
    /// Produces the compositing-material description and comparison blob.
    pub processor: Arc<dyn VisualsDataProcessor>,
    /// Material parameter slot the result feeds.
    pub material_param: MaterialParamId,
    /// Requested size class.
    pub size: TextureSize,
    /// Output compression format.
    pub format: CompositeFormat,
    /// Whether the result samples as sRGB.
    pub srgb: bool,
    /// Skip global picmip reduction.
    pub ignore_picmip: bool,
}

impl CompositeTextureInfo {
    fn key(&self) -> CompositeKey {
        CompositeKey {
            material_param: self.material_param,
            size: self.size,
            format: self.format,
            srgb: self.srgb,
            ignore_picmip: self.ignore_picmip,
        }
    }
}

/// Requests flowing to the generation worker thread.
enum WorkRequest {
    /// Step this texture's CPU-only stages until it completes.
    Generate(Arc<CompositeTexture>),
    /// Exit the worker loop.
    Shutdown,
}

/// The orchestrator. See the module docs for threading rules.
pub struct CompositeTextureGenerator {
    device: Box<dyn RenderDevice>,
    textures: Box<dyn TextureManager>,
    options: GeneratorOptions,
    pool: RenderTargetPool,
    pending: Vec<Arc<CompositeTexture>>,
    ready: Vec<Arc<CompositeTexture>>,
    work_tx: mpsc::Sender<WorkRequest>,
    worker: Option<std::thread::JoinHandle<()>>,
    exit: Arc<AtomicBool>,
    next_texture_id: u64,
}

impl CompositeTextureGenerator {
    /// Allocate the render-target pool and start the worker thread.
    ///
    /// # Errors
    ///
    /// Returns [`WeftError::Device`] if the pool cannot be allocated, or
    /// [`WeftError::ThreadSpawn`] if the worker fails to start.
    pub fn new(
        mut device: Box<dyn RenderDevice>,
        textures: Box<dyn TextureManager>,
        options: GeneratorOptions,
    ) -> Result<Self, WeftError> {
        let pool =
            RenderTargetPool::init(device.as_mut(), &options.pool_sizes, true)?;

        let (work_tx, work_rx) = mpsc::channel::<WorkRequest>();
        let exit = Arc::new(AtomicBool::new(false));
        let worker_exit = Arc::clone(&exit);
        let step = Duration::from_millis(options.worker_poll_ms);
        let queue_wait = Duration::from_millis(options.queue_wait_ms);
        let readback_wait = Duration::from_millis(options.readback_wait_ms);

        let worker = std::thread::Builder::new()
            .name("composite-gen".into())
            .spawn(move || {
                worker_loop(&work_rx, &worker_exit, step, queue_wait, readback_wait);
            })
            .map_err(WeftError::ThreadSpawn)?;

        Ok(Self {
            device,
            textures,
            options,
            pool,
            pending: Vec::new(),
            ready: Vec::new(),
            work_tx,
            worker: Some(worker),
            exit,
            next_texture_id: 0,
        })
    }

    /// The active configuration.
    #[must_use]
    pub const fn options(&self) -> &GeneratorOptions {
        &self.options
    }

    /// Number of textures still generating.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Number of complete, in-use textures.
    #[must_use]
    pub fn ready_count(&self) -> usize {
        self.ready.len()
    }

    /// Look up or create the composite texture for `info`.
    ///
    /// A hit returns the existing instance immediately regardless of its
    /// pipeline progress — mid-generation textures are usable; they sample
    /// the last completed result or a blank. A miss with `allow_create`
    /// builds a new texture, appends it to the pending list, and hands it
    /// to the worker; the returned handle is not yet valid for sampling.
    pub fn get_composite_texture(
        &mut self,
        info: &CompositeTextureInfo,
        allow_create: bool,
    ) -> Option<Arc<CompositeTexture>> {
        let key = info.key();
        let blob = info.processor.comparison_blob();
        let found = self
            .ready
            .iter()
            .chain(self.pending.iter())
            .find(|t| t.matches(&key, &blob));
        if let Some(texture) = found {
            return Some(Arc::clone(texture));
        }
        if !allow_create {
            return None;
        }

        if info.processor.material_desc(key.material_param).is_empty() {
            log::warn!(
                "composite texture request for {:?} has no material description",
                key.material_param
            );
            return None;
        }

        self.next_texture_id += 1;
        let name = format!(
            "composite_{}_{}",
            key.material_param.ident(),
            self.next_texture_id
        );
        let texture = Arc::new(CompositeTexture::new(
            key,
            Arc::clone(&info.processor),
            name,
            self.options.picmip,
        ));
        log::debug!("composite texture {} queued", texture.name());
        self.pending.push(Arc::clone(&texture));
        self.enqueue(Arc::clone(&texture));
        Some(texture)
    }

    /// Request a fresh generation pass for an existing texture. Returns
    /// whether the texture is managed by this generator.
    pub fn force_regenerate(&mut self, texture: &Arc<CompositeTexture>) -> bool {
        if let Some(pos) =
            self.ready.iter().position(|t| Arc::ptr_eq(t, texture))
        {
            let entry = self.ready.remove(pos);
            self.reset_texture(&entry);
            self.pending.push(Arc::clone(&entry));
            self.enqueue(entry);
            return true;
        }
        if self.pending.iter().any(|t| Arc::ptr_eq(t, texture)) {
            // Mid-generation reset: the worker picks the restart up on its
            // next step. If it already finished and moved on, hand the
            // texture back to it.
            let was_complete = texture.generation_complete();
            self.reset_texture(texture);
            if was_complete {
                self.enqueue(Arc::clone(texture));
            }
            return true;
        }
        false
    }

    /// Advance the pipeline one frame: pump device events, perform at most
    /// one main-thread stage step of one pending texture, promote
    /// finalized textures to ready, and sweep ready textures for
    /// regeneration or release. Returns whether any work was performed.
    pub fn process(&mut self) -> bool {
        self.device.poll_events();

        let mut worked = false;
        for i in (0..self.pending.len()).rev() {
            let texture = Arc::clone(&self.pending[i]);
            if self.step_pending(&texture) {
                worked = true;
                // One main-thread GPU step per frame
                break;
            }
        }

        self.promote_finalized();
        self.sweep_ready();
        worked
    }

    /// Perform the main-thread action the texture's stage calls for, if
    /// any. Worker-owned stages return false without touching the texture.
    fn step_pending(&mut self, texture: &Arc<CompositeTexture>) -> bool {
        match texture.stage() {
            Stage::Complete => {
                if texture.needs_finalize() {
                    texture.finalize(
                        self.device.as_mut(),
                        self.options.release_result_after_upload,
                    );
                    return true;
                }
                false
            }
            Stage::NotStarted => {
                texture.do_async_texture_load(self.textures.as_mut());
                true
            }
            Stage::NeedsInit => {
                texture.init_resources(&self.pool, self.device.as_mut());
                true
            }
            Stage::NeedsCompositingMaterial => {
                texture.create_compositing_material(self.device.as_mut());
                true
            }
            Stage::WaitingForRenderToRt => {
                texture.render_to_rt(self.device.as_mut());
                true
            }
            Stage::RenderedToRt => {
                texture.advance_to_read_rt();
                true
            }
            Stage::WaitingForReadRt => {
                texture.read_rt(self.device.as_mut());
                true
            }
            Stage::WaitingForGetResult => {
                texture.get_read_rt_result(self.device.as_mut());
                true
            }
            Stage::WaitingForMaterialCleanup => {
                texture.cleanup_compositing_material(
                    self.device.as_mut(),
                    self.textures.as_mut(),
                );
                true
            }
            _ => false,
        }
    }

    /// Move completed-and-finalized textures from pending to ready.
    fn promote_finalized(&mut self) {
        let mut i = 0;
        while i < self.pending.len() {
            if self.pending[i].is_finalized() {
                let texture = self.pending.remove(i);
                log::debug!("composite texture {} ready", texture.name());
                self.ready.push(texture);
            } else {
                i += 1;
            }
        }
    }

    /// Re-queue ready textures whose inputs changed; destroy ready
    /// textures nothing references anymore.
    fn sweep_ready(&mut self) {
        let mut i = 0;
        while i < self.ready.len() {
            let texture = Arc::clone(&self.ready[i]);
            if texture.needs_regenerate() {
                let _ = self.ready.remove(i);
                self.reset_texture(&texture);
                log::debug!(
                    "composite texture {} inputs changed; regenerating",
                    texture.name()
                );
                self.pending.push(Arc::clone(&texture));
                self.enqueue(texture);
                continue;
            }
            // Two references: the ready list and our local clone. Anything
            // beyond that is an outside consumer keeping the texture alive.
            if Arc::strong_count(&texture) == 2 {
                let released = self.ready.remove(i);
                log::debug!(
                    "composite texture {} unreferenced; releasing",
                    released.name()
                );
                released
                    .release_resources(self.device.as_mut(), self.textures.as_mut());
                continue;
            }
            i += 1;
        }
    }

    fn reset_texture(&mut self, texture: &Arc<CompositeTexture>) {
        texture.force_regenerate(
            self.device.as_mut(),
            self.textures.as_mut(),
            self.options.picmip,
        );
    }

    fn enqueue(&self, texture: Arc<CompositeTexture>) {
        if self.work_tx.send(WorkRequest::Generate(texture)).is_err() {
            log::warn!("composite work queue disconnected");
        }
    }

    /// Stop the worker thread, release every outstanding texture, and
    /// free the render-target pool. Textures left mid-generation are
    /// abandoned; their resources are torn down here, not by the worker.
    pub fn shutdown(&mut self) {
        self.exit.store(true, Ordering::Release);
        let _ = self.work_tx.send(WorkRequest::Shutdown);
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
        let outstanding: Vec<Arc<CompositeTexture>> = self
            .pending
            .drain(..)
            .chain(self.ready.drain(..))
            .collect();
        for texture in outstanding {
            texture.release_resources(self.device.as_mut(), self.textures.as_mut());
        }
        self.pool.shutdown(self.device.as_mut());
    }
}

impl Drop for CompositeTextureGenerator {
    fn drop(&mut self) {
        if self.worker.is_some() {
            self.shutdown();
        }
    }
}

/// Worker thread main loop: pop one texture, step its CPU-only stages
/// until generation completes, then wait (without touching GPU resources)
/// for the main thread to finalize it before pulling the next entry. The
/// finalize gate bounds peak memory to one in-flight result at a time.
fn worker_loop(
    work_rx: &mpsc::Receiver<WorkRequest>,
    exit: &AtomicBool,
    step: Duration,
    queue_wait: Duration,
    readback_wait: Duration,
) {
    log::debug!("composite generation worker started");
    loop {
        let request = match work_rx.recv_timeout(queue_wait) {
            Ok(request) => request,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                if exit.load(Ordering::Acquire) {
                    break;
                }
                continue;
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        };
        let texture = match request {
            WorkRequest::Generate(texture) => texture,
            WorkRequest::Shutdown => break,
        };

        while !exit.load(Ordering::Acquire) && !texture.generation_complete() {
            if !texture.generation_step(readback_wait) {
                std::thread::sleep(step);
            }
        }
        // A reset (forced regeneration) un-completes the texture and
        // re-queues it, so stop waiting for finalize in that case too.
        while !exit.load(Ordering::Acquire)
            && texture.generation_complete()
            && !texture.is_finalized()
        {
            std::thread::sleep(step);
        }
    }
    log::debug!("composite generation worker exiting");
}
