//! End-to-end pipeline tests driving the generator against fake device and
//! texture-manager capabilities, so every stage runs without a GPU.

#![allow(clippy::unwrap_used)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use weft::device::{
    FlagWait, MaterialId, RenderDevice, RenderTargetId, ResultTextureId,
    SharedScratch, SourceTexture, TextureManager, WaitHandle,
};
use weft::error::WeftError;
use weft::image::CompressedImage;
use weft::key::{CompositeFormat, MaterialParamId, TextureSize};
use weft::visuals::{MaterialDesc, SourceTextureRef, VisualsDataProcessor};
use weft::{CompositeTextureGenerator, CompositeTextureInfo, GeneratorOptions, Stage};

// -- fakes ---------------------------------------------------------------

#[derive(Default)]
struct DeviceInner {
    next_id: u32,
    fail_materials: bool,
    live_materials: usize,
    uploads: Vec<(ResultTextureId, usize)>,
    destroyed_targets: usize,
}

/// Fake render device: readbacks complete immediately and fill the scratch
/// image with a solid color.
#[derive(Clone, Default)]
struct FakeDevice {
    inner: Arc<Mutex<DeviceInner>>,
}

impl FakeDevice {
    fn uploads(&self) -> Vec<(ResultTextureId, usize)> {
        self.inner.lock().unwrap().uploads.clone()
    }

    fn live_materials(&self) -> usize {
        self.inner.lock().unwrap().live_materials
    }

    fn fail_materials(&self) {
        self.inner.lock().unwrap().fail_materials = true;
    }

    fn signaled() -> Box<dyn WaitHandle> {
        let wait = FlagWait::new();
        wait.signal().store(true, Ordering::Release);
        Box::new(wait)
    }
}

impl RenderDevice for FakeDevice {
    fn create_render_target(
        &mut self,
        _name: &str,
        _size: u32,
        _srgb: bool,
    ) -> Result<RenderTargetId, WeftError> {
        let mut inner = self.inner.lock().unwrap();
        inner.next_id += 1;
        Ok(RenderTargetId(inner.next_id))
    }

    fn destroy_render_target(&mut self, _target: RenderTargetId) {
        self.inner.lock().unwrap().destroyed_targets += 1;
    }

    fn create_material(
        &mut self,
        _desc: &MaterialDesc,
        _sources: &[SourceTexture],
    ) -> Result<MaterialId, WeftError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_materials {
            return Err(WeftError::MaterialCreation("error material".into()));
        }
        inner.next_id += 1;
        inner.live_materials += 1;
        Ok(MaterialId(inner.next_id))
    }

    fn destroy_material(&mut self, _material: MaterialId) {
        self.inner.lock().unwrap().live_materials -= 1;
    }

    fn render_composite(&mut self, _material: MaterialId, _target: RenderTargetId) {}

    fn read_render_target(&mut self, _target: RenderTargetId) -> Box<dyn WaitHandle> {
        Self::signaled()
    }

    fn resolve_readback(
        &mut self,
        _target: RenderTargetId,
        dest: &SharedScratch,
    ) -> Box<dyn WaitHandle> {
        let mut scratch = dest.lock().unwrap();
        for px in scratch.data_mut().chunks_exact_mut(4) {
            px.copy_from_slice(&[128, 64, 32, 255]);
        }
        Self::signaled()
    }

    fn create_result_texture(
        &mut self,
        _name: &str,
        _format: CompositeFormat,
        _size: u32,
        _srgb: bool,
    ) -> Result<ResultTextureId, WeftError> {
        let mut inner = self.inner.lock().unwrap();
        inner.next_id += 1;
        Ok(ResultTextureId(inner.next_id))
    }

    fn destroy_result_texture(&mut self, _texture: ResultTextureId) {}

    fn upload_compressed(&mut self, texture: ResultTextureId, image: &CompressedImage) {
        self.inner
            .lock()
            .unwrap()
            .uploads
            .push((texture, image.total_bytes()));
    }

    fn poll_events(&mut self) {}
}

/// Fake texture manager. Loads complete instantly unless `stall` is set.
#[derive(Clone, Default)]
struct FakeTextureManager {
    stall: bool,
    released: Arc<Mutex<Vec<String>>>,
}

impl TextureManager for FakeTextureManager {
    fn find_or_load_async(&mut self, path: &str) -> SourceTexture {
        SourceTexture::new(
            path.to_owned(),
            Arc::new(AtomicBool::new(!self.stall)),
        )
    }

    fn release(&mut self, texture: &SourceTexture) {
        self.released.lock().unwrap().push(texture.path().to_owned());
    }
}

/// Processor with a mutable comparison blob, like wear/seed changing on a
/// live item.
struct FakeProcessor {
    blob: Mutex<Vec<u8>>,
}

impl FakeProcessor {
    fn new(blob: &[u8]) -> Arc<Self> {
        Arc::new(Self {
            blob: Mutex::new(blob.to_vec()),
        })
    }

    fn set_blob(&self, blob: &[u8]) {
        *self.blob.lock().unwrap() = blob.to_vec();
    }
}

impl VisualsDataProcessor for FakeProcessor {
    fn material_desc(&self, param: MaterialParamId) -> MaterialDesc {
        MaterialDesc {
            shader: "weapon_composite".into(),
            textures: vec![
                SourceTextureRef {
                    param: "$basetexture".into(),
                    path: format!("weapons/base_{}", param.ident()),
                },
                SourceTextureRef {
                    param: "$patterntexture".into(),
                    path: "patterns/hydra".into(),
                },
            ],
            params: vec![("$blendstrength".into(), 0.75)],
        }
    }

    fn comparison_blob(&self) -> Vec<u8> {
        self.blob.lock().unwrap().clone()
    }
}

// -- harness -------------------------------------------------------------

fn test_options() -> GeneratorOptions {
    GeneratorOptions {
        pool_sizes: vec![1024, 512, 256],
        picmip: 0,
        worker_poll_ms: 1,
        queue_wait_ms: 5,
        readback_wait_ms: 1,
        release_result_after_upload: false,
    }
}

fn make_generator(
    device: &FakeDevice,
    textures: &FakeTextureManager,
    options: GeneratorOptions,
) -> CompositeTextureGenerator {
    let _ = env_logger::builder().is_test(true).try_init();
    CompositeTextureGenerator::new(
        Box::new(device.clone()),
        Box::new(textures.clone()),
        options,
    )
    .unwrap()
}

fn request(processor: &Arc<FakeProcessor>, size: TextureSize) -> CompositeTextureInfo {
    CompositeTextureInfo {
        processor: Arc::<FakeProcessor>::clone(processor),
        material_param: MaterialParamId::BaseDiffuse,
        size,
        format: CompositeFormat::Dxt5,
        srgb: false,
        ignore_picmip: false,
    }
}

/// Run frames until `done` or the frame budget runs out.
fn drive(
    generator: &mut CompositeTextureGenerator,
    mut done: impl FnMut(&CompositeTextureGenerator) -> bool,
) -> bool {
    for _ in 0..3000 {
        let _ = generator.process();
        if done(generator) {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    false
}

// -- tests ---------------------------------------------------------------

#[test]
fn generates_and_dedups_identical_requests() {
    let device = FakeDevice::default();
    let textures = FakeTextureManager::default();
    let mut generator = make_generator(&device, &textures, test_options());

    let processor = FakeProcessor::new(b"A");
    let info = request(&processor, TextureSize::Size512);

    let texture = generator.get_composite_texture(&info, true).unwrap();
    assert_eq!(generator.pending_count(), 1);
    assert!(!texture.generation_complete());

    // A second identical request returns the same instance even while
    // generation is still in flight.
    let same = generator.get_composite_texture(&info, true).unwrap();
    assert!(Arc::ptr_eq(&texture, &same));
    assert_eq!(generator.pending_count(), 1);

    assert!(drive(&mut generator, |g| g.ready_count() == 1));
    assert_eq!(generator.pending_count(), 0);
    assert!(texture.generation_complete());
    assert!(texture.is_finalized());
    assert!(texture.result_texture().is_some());

    // Exactly one upload, sized for the 512 pool slot's full mip chain
    let uploads = device.uploads();
    assert_eq!(uploads.len(), 1);
    let expected =
        CompressedImage::with_layout(CompositeFormat::Dxt5, 512, 512)
            .total_bytes();
    assert_eq!(uploads[0].1, expected);

    // Still the same instance after completion; nothing new queued
    let again = generator.get_composite_texture(&info, true).unwrap();
    assert!(Arc::ptr_eq(&texture, &again));
    assert_eq!(generator.pending_count(), 0);
    assert_eq!(generator.ready_count(), 1);

    // The finished bits are real (non-blank)
    let mut dest = vec![0u8; expected];
    assert!(texture.copy_result(&mut dest));
    assert!(dest.iter().any(|&b| b != 0));
}

#[test]
fn allow_create_false_returns_none_on_miss() {
    let device = FakeDevice::default();
    let textures = FakeTextureManager::default();
    let mut generator = make_generator(&device, &textures, test_options());

    let processor = FakeProcessor::new(b"A");
    let info = request(&processor, TextureSize::Size256);
    assert!(generator.get_composite_texture(&info, false).is_none());
    assert_eq!(generator.pending_count(), 0);

    let texture = generator.get_composite_texture(&info, true).unwrap();
    let found = generator.get_composite_texture(&info, false).unwrap();
    assert!(Arc::ptr_eq(&texture, &found));
}

#[test]
fn different_blobs_create_distinct_instances() {
    let device = FakeDevice::default();
    let textures = FakeTextureManager::default();
    let mut generator = make_generator(&device, &textures, test_options());

    let a = FakeProcessor::new(b"A");
    let b = FakeProcessor::new(b"B");
    let first = generator
        .get_composite_texture(&request(&a, TextureSize::Size256), true)
        .unwrap();
    let second = generator
        .get_composite_texture(&request(&b, TextureSize::Size256), true)
        .unwrap();
    assert!(!Arc::ptr_eq(&first, &second));
    assert_eq!(generator.pending_count(), 2);
}

#[test]
fn stages_are_monotonic_between_resets() {
    let device = FakeDevice::default();
    let textures = FakeTextureManager::default();
    let mut generator = make_generator(&device, &textures, test_options());

    let processor = FakeProcessor::new(b"A");
    let texture = generator
        .get_composite_texture(&request(&processor, TextureSize::Size256), true)
        .unwrap();

    let mut seen = vec![texture.stage()];
    assert!(drive(&mut generator, |g| {
        seen.push(texture.stage());
        g.ready_count() == 1
    }));
    for pair in seen.windows(2) {
        assert!(pair[0] <= pair[1], "stage moved backward: {pair:?}");
    }
    assert_eq!(*seen.last().unwrap(), Stage::Complete);
}

#[test]
fn concurrent_textures_never_share_a_pool_slot() {
    let device = FakeDevice::default();
    let textures = FakeTextureManager::default();
    let mut generator = make_generator(&device, &textures, test_options());

    let a = FakeProcessor::new(b"A");
    let b = FakeProcessor::new(b"B");
    let c = FakeProcessor::new(b"C");
    let handles = vec![
        generator
            .get_composite_texture(&request(&a, TextureSize::Size256), true)
            .unwrap(),
        generator
            .get_composite_texture(&request(&b, TextureSize::Size256), true)
            .unwrap(),
        generator
            .get_composite_texture(&request(&c, TextureSize::Size256), true)
            .unwrap(),
    ];

    assert!(drive(&mut generator, |g| {
        let mut held: Vec<String> = handles
            .iter()
            .filter_map(|t| t.acquired_slot_name())
            .collect();
        let total = held.len();
        held.sort();
        held.dedup();
        assert_eq!(held.len(), total, "two textures share a pool slot");
        g.ready_count() == 3
    }));
}

#[test]
fn every_queued_texture_terminates() {
    let device = FakeDevice::default();
    let textures = FakeTextureManager::default();
    let mut generator = make_generator(&device, &textures, test_options());

    let processors: Vec<Arc<FakeProcessor>> = (0..4)
        .map(|i| FakeProcessor::new(format!("blob{i}").as_bytes()))
        .collect();
    let handles: Vec<_> = processors
        .iter()
        .map(|p| {
            generator
                .get_composite_texture(&request(p, TextureSize::Size256), true)
                .unwrap()
        })
        .collect();

    assert!(drive(&mut generator, |g| g.ready_count() == 4));
    for texture in &handles {
        assert!(texture.generation_complete());
        assert!(texture.result_texture().is_some());
    }
    // Transient resources are gone: every material destroyed, every
    // preloaded source released
    assert_eq!(device.live_materials(), 0);
    assert_eq!(textures.released.lock().unwrap().len(), 8);
}

#[test]
fn no_pool_slot_degrades_to_blank_complete() {
    let device = FakeDevice::default();
    let textures = FakeTextureManager::default();
    let options = GeneratorOptions {
        pool_sizes: Vec::new(),
        ..test_options()
    };
    let mut generator = make_generator(&device, &textures, options);

    let processor = FakeProcessor::new(b"A");
    let texture = generator
        .get_composite_texture(&request(&processor, TextureSize::Size256), true)
        .unwrap();

    // Let the worker walk the load stages up to NeedsInit
    assert!(drive(&mut generator, |_| texture.stage() >= Stage::NeedsInit));
    // One Process() call turns slot-acquisition failure into COMPLETE
    if texture.stage() == Stage::NeedsInit {
        let _ = generator.process();
    }
    assert!(texture.generation_complete());

    assert!(drive(&mut generator, |g| g.ready_count() == 1));
    assert!(texture.result_texture().is_none());
    assert!(device.uploads().is_empty());

    let mut dest = vec![0xAA; 64];
    assert!(!texture.copy_result(&mut dest));
    assert!(dest.iter().all(|&b| b == 0));
}

#[test]
fn error_material_degrades_gracefully() {
    let device = FakeDevice::default();
    device.fail_materials();
    let textures = FakeTextureManager::default();
    let mut generator = make_generator(&device, &textures, test_options());

    let processor = FakeProcessor::new(b"A");
    let texture = generator
        .get_composite_texture(&request(&processor, TextureSize::Size256), true)
        .unwrap();

    assert!(drive(&mut generator, |g| g.ready_count() == 1));
    assert!(texture.generation_complete());
    assert!(device.uploads().is_empty());
    assert_eq!(device.live_materials(), 0);
    // The slot borrowed at NeedsInit went back to the pool
    assert!(texture.acquired_slot_name().is_none());
}

#[test]
fn stalled_source_load_only_stalls_its_own_texture() {
    let device = FakeDevice::default();
    let fast = FakeTextureManager::default();
    let mut generator = make_generator(&device, &fast, test_options());

    // First request loads normally and completes...
    let a = FakeProcessor::new(b"A");
    let ok = generator
        .get_composite_texture(&request(&a, TextureSize::Size256), true)
        .unwrap();
    assert!(drive(&mut generator, |g| g.ready_count() == 1));
    assert!(ok.generation_complete());

    // ...then sources stop resolving; the next texture stays parked in
    // the load-wait stage without disturbing the ready one.
    let stalled_tm = FakeTextureManager {
        stall: true,
        ..Default::default()
    };
    let mut stalled_generator =
        make_generator(&device, &stalled_tm, test_options());
    let b = FakeProcessor::new(b"B");
    let stalled = stalled_generator
        .get_composite_texture(&request(&b, TextureSize::Size256), true)
        .unwrap();
    let _ = drive(&mut stalled_generator, |_| {
        stalled.stage() == Stage::WaitingForAsyncTextureLoadFinish
    });
    assert_eq!(stalled.stage(), Stage::WaitingForAsyncTextureLoadFinish);
    assert!(!stalled.generation_complete());
}

#[test]
fn force_regenerate_runs_a_second_pass() {
    let device = FakeDevice::default();
    let textures = FakeTextureManager::default();
    let mut generator = make_generator(&device, &textures, test_options());

    let processor = FakeProcessor::new(b"A");
    let texture = generator
        .get_composite_texture(&request(&processor, TextureSize::Size512), true)
        .unwrap();
    assert!(drive(&mut generator, |g| g.ready_count() == 1));
    assert_eq!(device.uploads().len(), 1);

    assert!(generator.force_regenerate(&texture));
    assert_eq!(generator.pending_count(), 1);
    assert_eq!(generator.ready_count(), 0);
    assert!(!texture.is_finalized());

    assert!(drive(&mut generator, |g| g.ready_count() == 1));
    assert_eq!(device.uploads().len(), 2);

    // Unknown handles are rejected
    let other = FakeProcessor::new(b"other");
    let mut other_generator = make_generator(&device, &textures, test_options());
    let foreign = other_generator
        .get_composite_texture(&request(&other, TextureSize::Size256), true)
        .unwrap();
    assert!(!generator.force_regenerate(&foreign));
}

#[test]
fn changed_blob_triggers_regeneration_sweep() {
    let device = FakeDevice::default();
    let textures = FakeTextureManager::default();
    let mut generator = make_generator(&device, &textures, test_options());

    let processor = FakeProcessor::new(b"worn-0.1");
    let texture = generator
        .get_composite_texture(&request(&processor, TextureSize::Size256), true)
        .unwrap();
    assert!(drive(&mut generator, |g| g.ready_count() == 1));

    processor.set_blob(b"worn-0.9");
    assert!(texture.needs_regenerate());
    let _ = generator.process();
    assert_eq!(generator.pending_count(), 1);

    assert!(drive(&mut generator, |g| g.ready_count() == 1));
    assert_eq!(device.uploads().len(), 2);
    assert!(texture.matches(texture.key(), b"worn-0.9"));
}

#[test]
fn unreferenced_ready_textures_are_released() {
    let device = FakeDevice::default();
    let textures = FakeTextureManager::default();
    let mut generator = make_generator(&device, &textures, test_options());

    let processor = FakeProcessor::new(b"A");
    let texture = generator
        .get_composite_texture(&request(&processor, TextureSize::Size256), true)
        .unwrap();
    assert!(drive(&mut generator, |g| g.ready_count() == 1));

    // Still referenced: survives the sweep
    let _ = generator.process();
    assert_eq!(generator.ready_count(), 1);

    drop(texture);
    let _ = generator.process();
    assert_eq!(generator.ready_count(), 0);
}

#[test]
fn shutdown_joins_worker_and_frees_pool() {
    let device = FakeDevice::default();
    let textures = FakeTextureManager::default();
    let mut generator = make_generator(&device, &textures, test_options());

    let processor = FakeProcessor::new(b"A");
    let _texture = generator
        .get_composite_texture(&request(&processor, TextureSize::Size512), true)
        .unwrap();

    // Shut down mid-generation; the pending texture is abandoned
    generator.shutdown();
    assert_eq!(device.inner.lock().unwrap().destroyed_targets, 3);
}
