//! Shared render-target pool: a small fixed set of power-of-two offscreen
//! targets, each paired with one CPU-side scratch image of the same size.
//!
//! At most one in-flight generation borrows a given slot at a time. Slots
//! are acquired on the main thread; the worker releases its borrow with a
//! single atomic store when compression finishes, so no lock is needed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::device::{RenderDevice, RenderTargetId, SharedScratch};
use crate::error::WeftError;
use crate::image::RawImage;

/// One pool entry: a device render target plus its shared scratch image.
#[derive(Debug)]
pub struct PoolSlot {
    name: String,
    pixel_size: u32,
    srgb: bool,
    available: AtomicBool,
    target: RenderTargetId,
    scratch: SharedScratch,
}

impl PoolSlot {
    /// Slot name, used for logging and diagnostics.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Edge length of the render target in pixels.
    #[must_use]
    pub const fn pixel_size(&self) -> u32 {
        self.pixel_size
    }

    /// Whether the render target samples as sRGB.
    #[must_use]
    pub const fn srgb(&self) -> bool {
        self.srgb
    }

    /// The device render target backing this slot.
    #[must_use]
    pub const fn target(&self) -> RenderTargetId {
        self.target
    }

    /// The scratch image shared with the device readback path.
    #[must_use]
    pub fn scratch(&self) -> SharedScratch {
        Arc::clone(&self.scratch)
    }
}

/// An exclusive borrow of one pool slot. Dropping it returns the slot to
/// the pool; the drop may happen on the worker thread.
#[derive(Debug)]
pub struct SlotRef {
    slot: Arc<PoolSlot>,
}

impl SlotRef {
    /// The borrowed slot.
    #[must_use]
    pub fn slot(&self) -> &PoolSlot {
        &self.slot
    }
}

impl Drop for SlotRef {
    fn drop(&mut self) {
        log::trace!("releasing pool slot {}", self.slot.name);
        self.slot.available.store(true, Ordering::Release);
    }
}

/// The fixed set of shared render-target slots, held largest to smallest.
pub struct RenderTargetPool {
    slots: Vec<Arc<PoolSlot>>,
}

impl RenderTargetPool {
    /// Allocate one render target + scratch image per size class.
    /// `sizes` is sorted descending internally so acquisition scans
    /// largest to smallest.
    ///
    /// # Errors
    ///
    /// Returns [`WeftError::Device`] if any render target cannot be
    /// created; targets created so far are destroyed again.
    pub fn init(
        device: &mut dyn RenderDevice,
        sizes: &[u32],
        srgb: bool,
    ) -> Result<Self, WeftError> {
        let mut ordered: Vec<u32> = sizes.to_vec();
        ordered.sort_unstable_by(|a, b| b.cmp(a));
        ordered.dedup();

        let mut slots = Vec::with_capacity(ordered.len());
        for size in ordered {
            let name = format!("_rt_composite_{size}");
            match device.create_render_target(&name, size, srgb) {
                Ok(target) => {
                    log::debug!("pool: created {name}");
                    slots.push(Arc::new(PoolSlot {
                        name,
                        pixel_size: size,
                        srgb,
                        available: AtomicBool::new(true),
                        target,
                        scratch: Arc::new(Mutex::new(RawImage::new(size, size))),
                    }));
                }
                Err(e) => {
                    for slot in &slots {
                        device.destroy_render_target(slot.target);
                    }
                    return Err(e);
                }
            }
        }
        Ok(Self { slots })
    }

    /// Borrow a slot for a `size`×`size` composite: the exact-size slot if
    /// available, else the smallest available slot strictly larger than
    /// requested, never undersized. Main thread only.
    #[must_use]
    pub fn acquire(&self, size: u32) -> Option<SlotRef> {
        let mut fallback: Option<&Arc<PoolSlot>> = None;
        // Slots are ordered largest to smallest, so the last oversized
        // available slot seen is the smallest sufficient one.
        for slot in &self.slots {
            if !slot.available.load(Ordering::Acquire) {
                continue;
            }
            if slot.pixel_size == size {
                return self.try_take(slot);
            }
            if slot.pixel_size > size {
                fallback = Some(slot);
            }
        }
        fallback.and_then(|slot| self.try_take(slot))
    }

    fn try_take(&self, slot: &Arc<PoolSlot>) -> Option<SlotRef> {
        slot.available
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| {
                log::trace!("acquired pool slot {}", slot.name);
                SlotRef {
                    slot: Arc::clone(slot),
                }
            })
    }

    /// Number of slots currently available.
    #[must_use]
    pub fn available_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.available.load(Ordering::Acquire))
            .count()
    }

    /// Destroy every render target. Outstanding [`SlotRef`]s keep their
    /// scratch images alive but the device targets are gone; the generator
    /// only calls this after abandoning all pending textures.
    pub fn shutdown(&mut self, device: &mut dyn RenderDevice) {
        for slot in self.slots.drain(..) {
            device.destroy_render_target(slot.target);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{
        MaterialId, ResultTextureId, WaitHandle,
    };
    use crate::image::CompressedImage;
    use crate::key::CompositeFormat;
    use crate::visuals::MaterialDesc;

    /// Minimal device that hands out sequential ids.
    #[derive(Default)]
    struct CountingDevice {
        next: u32,
        fail: bool,
        destroyed: Vec<RenderTargetId>,
    }

    impl RenderDevice for CountingDevice {
        fn create_render_target(
            &mut self,
            _name: &str,
            _size: u32,
            _srgb: bool,
        ) -> Result<RenderTargetId, WeftError> {
            if self.fail {
                return Err(WeftError::Device("forced failure".into()));
            }
            self.next += 1;
            Ok(RenderTargetId(self.next))
        }

        fn destroy_render_target(&mut self, target: RenderTargetId) {
            self.destroyed.push(target);
        }

        fn create_material(
            &mut self,
            _desc: &MaterialDesc,
            _sources: &[crate::device::SourceTexture],
        ) -> Result<MaterialId, WeftError> {
            Ok(MaterialId(0))
        }

        fn destroy_material(&mut self, _material: MaterialId) {}

        fn render_composite(
            &mut self,
            _material: MaterialId,
            _target: RenderTargetId,
        ) {
        }

        fn read_render_target(
            &mut self,
            _target: RenderTargetId,
        ) -> Box<dyn WaitHandle> {
            Box::new(crate::device::FlagWait::new())
        }

        fn resolve_readback(
            &mut self,
            _target: RenderTargetId,
            _dest: &SharedScratch,
        ) -> Box<dyn WaitHandle> {
            Box::new(crate::device::FlagWait::new())
        }

        fn create_result_texture(
            &mut self,
            _name: &str,
            _format: CompositeFormat,
            _size: u32,
            _srgb: bool,
        ) -> Result<ResultTextureId, WeftError> {
            Ok(ResultTextureId(0))
        }

        fn destroy_result_texture(&mut self, _texture: ResultTextureId) {}

        fn upload_compressed(
            &mut self,
            _texture: ResultTextureId,
            _image: &CompressedImage,
        ) {
        }

        fn poll_events(&mut self) {}
    }

    fn pool_with(sizes: &[u32]) -> RenderTargetPool {
        let mut device = CountingDevice::default();
        RenderTargetPool::init(&mut device, sizes, true).unwrap()
    }

    #[test]
    fn exact_size_preferred() {
        let pool = pool_with(&[2048, 1024, 512]);
        let slot = pool.acquire(512).unwrap();
        assert_eq!(slot.slot().pixel_size(), 512);
    }

    #[test]
    fn smallest_larger_fallback_never_undersized() {
        let pool = pool_with(&[2048, 1024, 512]);
        let first = pool.acquire(512).unwrap();
        // Exact slot busy: falls back to the smallest larger one
        let second = pool.acquire(512).unwrap();
        assert_eq!(second.slot().pixel_size(), 1024);
        drop(first);
        drop(second);

        // A request bigger than everything available fails
        let big = pool.acquire(2048).unwrap();
        assert!(pool.acquire(2048).is_none());
        drop(big);
    }

    #[test]
    fn drop_returns_slot() {
        let pool = pool_with(&[256]);
        assert_eq!(pool.available_count(), 1);
        let slot = pool.acquire(256).unwrap();
        assert_eq!(pool.available_count(), 0);
        drop(slot);
        assert_eq!(pool.available_count(), 1);
        assert!(pool.acquire(256).is_some());
    }

    #[test]
    fn init_failure_rolls_back() {
        let mut device = CountingDevice { fail: true, ..Default::default() };
        assert!(RenderTargetPool::init(&mut device, &[128], true).is_err());
    }

    #[test]
    fn shutdown_destroys_targets() {
        let mut device = CountingDevice::default();
        let mut pool =
            RenderTargetPool::init(&mut device, &[512, 256], true).unwrap();
        pool.shutdown(&mut device);
        assert_eq!(device.destroyed.len(), 2);
        assert!(pool.acquire(256).is_none());
    }
}
