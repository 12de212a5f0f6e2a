//! [`RenderDevice`] over a wgpu device/queue pair.
//!
//! Render targets are offscreen `Rgba8Unorm` textures with a 256-byte-row-
//! aligned staging buffer each. Readback is two-phase to match the
//! pipeline's contract: phase one copies the target into its staging
//! buffer and signals on submitted-work-done; phase two maps the staging
//! buffer and, inside the map callback (which runs during
//! [`poll_events`](WgpuDevice::poll_events) on the main thread), strips
//! the row padding into the pool slot's scratch image.
//!
//! Result textures use the BC1/BC3 formats, so the wgpu device must be
//! created with `Features::TEXTURE_COMPRESSION_BC`.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::PoisonError;

use crate::device::{
    FlagWait, MaterialId, RenderDevice, RenderTargetId, ResultTextureId,
    SharedScratch, SourceTexture, WaitHandle,
};
use crate::error::WeftError;
use crate::image::{mip_count, CompressedImage, SCRATCH_BPP};
use crate::key::CompositeFormat;
use crate::visuals::MaterialDesc;

/// wgpu requires buffer rows copied from textures to be 256-byte aligned.
const ROW_ALIGN: u32 = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;

fn padded_bytes_per_row(width: u32) -> u32 {
    let unpadded = width * SCRATCH_BPP as u32;
    unpadded.div_ceil(ROW_ALIGN) * ROW_ALIGN
}

struct TargetEntry {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    staging: wgpu::Buffer,
    size: u32,
    srgb: bool,
}

struct MaterialEntry {
    bind_group: wgpu::BindGroup,
    // Kept alive for the bind group's lifetime
    _params: wgpu::Buffer,
}

/// The production [`RenderDevice`]: composites with a fullscreen-triangle
/// pass and publishes block-compressed result textures.
pub struct WgpuDevice {
    device: wgpu::Device,
    queue: wgpu::Queue,
    pipeline_linear: wgpu::RenderPipeline,
    pipeline_srgb: wgpu::RenderPipeline,
    bind_group_layout: wgpu::BindGroupLayout,
    sampler: wgpu::Sampler,
    fallback_view: wgpu::TextureView,
    source_views: HashMap<String, wgpu::TextureView>,
    targets: HashMap<u32, TargetEntry>,
    materials: HashMap<u32, MaterialEntry>,
    results: HashMap<u32, wgpu::Texture>,
    next_id: u32,
}

impl WgpuDevice {
    /// Build the composite pipeline and supporting objects.
    #[must_use]
    pub fn new(device: wgpu::Device, queue: wgpu::Queue) -> Self {
        let shader = device.create_shader_module(wgpu::include_wgsl!(
            "../../assets/shaders/composite.wgsl"
        ));

        let bind_group_layout =
            device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("Composite Bind Group Layout"),
                entries: &[
                    wgpu::BindGroupLayoutEntry {
                        binding: 0,
                        visibility: wgpu::ShaderStages::FRAGMENT,
                        ty: wgpu::BindingType::Sampler(
                            wgpu::SamplerBindingType::Filtering,
                        ),
                        count: None,
                    },
                    texture_layout_entry(1),
                    texture_layout_entry(2),
                    texture_layout_entry(3),
                    wgpu::BindGroupLayoutEntry {
                        binding: 4,
                        visibility: wgpu::ShaderStages::FRAGMENT,
                        ty: wgpu::BindingType::Buffer {
                            ty: wgpu::BufferBindingType::Uniform,
                            has_dynamic_offset: false,
                            min_binding_size: None,
                        },
                        count: None,
                    },
                ],
            });

        let pipeline_layout =
            device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("Composite Pipeline Layout"),
                bind_group_layouts: &[&bind_group_layout],
                push_constant_ranges: &[],
            });

        let pipeline_linear = create_composite_pipeline(
            &device,
            &shader,
            &pipeline_layout,
            wgpu::TextureFormat::Rgba8Unorm,
        );
        let pipeline_srgb = create_composite_pipeline(
            &device,
            &shader,
            &pipeline_layout,
            wgpu::TextureFormat::Rgba8UnormSrgb,
        );

        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("Composite Sampler"),
            address_mode_u: wgpu::AddressMode::Repeat,
            address_mode_v: wgpu::AddressMode::Repeat,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            ..Default::default()
        });

        let fallback_view = create_fallback_texture(&device, &queue);

        Self {
            device,
            queue,
            pipeline_linear,
            pipeline_srgb,
            bind_group_layout,
            sampler,
            fallback_view,
            source_views: HashMap::new(),
            targets: HashMap::new(),
            materials: HashMap::new(),
            results: HashMap::new(),
            next_id: 0,
        }
    }

    /// Register the GPU view for a loaded source texture so compositing
    /// materials can resolve it by path. The texture manager driving the
    /// async loads is expected to call this as downloads finish.
    pub fn register_source_texture(
        &mut self,
        path: &str,
        view: wgpu::TextureView,
    ) {
        drop(self.source_views.insert(path.to_owned(), view));
    }

    fn alloc_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }
}

fn texture_layout_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::FRAGMENT,
        ty: wgpu::BindingType::Texture {
            sample_type: wgpu::TextureSampleType::Float { filterable: true },
            view_dimension: wgpu::TextureViewDimension::D2,
            multisampled: false,
        },
        count: None,
    }
}

fn create_composite_pipeline(
    device: &wgpu::Device,
    shader: &wgpu::ShaderModule,
    layout: &wgpu::PipelineLayout,
    format: wgpu::TextureFormat,
) -> wgpu::RenderPipeline {
    device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
        label: Some("Composite Pipeline"),
        layout: Some(layout),
        vertex: wgpu::VertexState {
            module: shader,
            entry_point: Some("vs_main"),
            buffers: &[],
            compilation_options: Default::default(),
        },
        fragment: Some(wgpu::FragmentState {
            module: shader,
            entry_point: Some("fs_main"),
            targets: &[Some(wgpu::ColorTargetState {
                format,
                blend: None,
                write_mask: wgpu::ColorWrites::ALL,
            })],
            compilation_options: Default::default(),
        }),
        primitive: wgpu::PrimitiveState {
            topology: wgpu::PrimitiveTopology::TriangleList,
            cull_mode: None,
            ..Default::default()
        },
        depth_stencil: None,
        multisample: wgpu::MultisampleState::default(),
        multiview: None,
        cache: None,
    })
}

/// 1×1 opaque black texture bound in place of absent pattern/mask sources.
fn create_fallback_texture(
    device: &wgpu::Device,
    queue: &wgpu::Queue,
) -> wgpu::TextureView {
    let texture = device.create_texture(&wgpu::TextureDescriptor {
        label: Some("Composite Fallback Texture"),
        size: wgpu::Extent3d {
            width: 1,
            height: 1,
            depth_or_array_layers: 1,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: wgpu::TextureFormat::Rgba8Unorm,
        usage: wgpu::TextureUsages::TEXTURE_BINDING
            | wgpu::TextureUsages::COPY_DST,
        view_formats: &[],
    });
    queue.write_texture(
        wgpu::TexelCopyTextureInfo {
            texture: &texture,
            mip_level: 0,
            origin: wgpu::Origin3d::ZERO,
            aspect: wgpu::TextureAspect::All,
        },
        &[0, 0, 0, 255],
        wgpu::TexelCopyBufferLayout {
            offset: 0,
            bytes_per_row: Some(4),
            rows_per_image: Some(1),
        },
        wgpu::Extent3d {
            width: 1,
            height: 1,
            depth_or_array_layers: 1,
        },
    );
    texture.create_view(&wgpu::TextureViewDescriptor::default())
}

fn result_format(
    format: CompositeFormat,
    srgb: bool,
) -> wgpu::TextureFormat {
    match (format, srgb) {
        (CompositeFormat::Dxt1, false) => wgpu::TextureFormat::Bc1RgbaUnorm,
        (CompositeFormat::Dxt1, true) => wgpu::TextureFormat::Bc1RgbaUnormSrgb,
        (CompositeFormat::Dxt5, false) => wgpu::TextureFormat::Bc3RgbaUnorm,
        (CompositeFormat::Dxt5, true) => wgpu::TextureFormat::Bc3RgbaUnormSrgb,
    }
}

/// Scalar parameters packed for the shader's `CompositeParams` uniform.
fn pack_params(desc: &MaterialDesc) -> [f32; 4] {
    let mut packed = [1.0, 0.0, 1.0, 0.0];
    for (name, value) in &desc.params {
        match name.as_str() {
            "$blendstrength" => packed[0] = *value,
            "$patternscale" => packed[2] = *value,
            "$patternoffset" => packed[3] = *value,
            _ => {}
        }
    }
    packed
}

impl RenderDevice for WgpuDevice {
    fn create_render_target(
        &mut self,
        name: &str,
        size: u32,
        srgb: bool,
    ) -> Result<RenderTargetId, WeftError> {
        let format = if srgb {
            wgpu::TextureFormat::Rgba8UnormSrgb
        } else {
            wgpu::TextureFormat::Rgba8Unorm
        };
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some(name),
            size: wgpu::Extent3d {
                width: size,
                height: size,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT
                | wgpu::TextureUsages::TEXTURE_BINDING
                | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Composite Staging Buffer"),
            size: u64::from(padded_bytes_per_row(size)) * u64::from(size),
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });

        let id = self.alloc_id();
        drop(self.targets.insert(
            id,
            TargetEntry {
                texture,
                view,
                staging,
                size,
                srgb,
            },
        ));
        Ok(RenderTargetId(id))
    }

    fn destroy_render_target(&mut self, target: RenderTargetId) {
        drop(self.targets.remove(&target.0));
    }

    fn create_material(
        &mut self,
        desc: &MaterialDesc,
        sources: &[SourceTexture],
    ) -> Result<MaterialId, WeftError> {
        // Roles by position: base, pattern, mask. Absent slots fall back
        // to a neutral texture; an unresolved base is the error material.
        let mut views: Vec<&wgpu::TextureView> = Vec::with_capacity(3);
        for (i, source) in sources.iter().take(3).enumerate() {
            match self.source_views.get(source.path()) {
                Some(view) => views.push(view),
                None if i == 0 => {
                    return Err(WeftError::MaterialCreation(format!(
                        "unresolved base texture {}",
                        source.path()
                    )));
                }
                None => views.push(&self.fallback_view),
            }
        }
        if views.is_empty() {
            return Err(WeftError::MaterialCreation(
                "material references no textures".into(),
            ));
        }
        while views.len() < 3 {
            views.push(&self.fallback_view);
        }

        let params = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Composite Params"),
            size: 16,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        self.queue
            .write_buffer(&params, 0, bytemuck::cast_slice(&pack_params(desc)));

        let bind_group =
            self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("Composite Bind Group"),
                layout: &self.bind_group_layout,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: wgpu::BindingResource::Sampler(&self.sampler),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: wgpu::BindingResource::TextureView(views[0]),
                    },
                    wgpu::BindGroupEntry {
                        binding: 2,
                        resource: wgpu::BindingResource::TextureView(views[1]),
                    },
                    wgpu::BindGroupEntry {
                        binding: 3,
                        resource: wgpu::BindingResource::TextureView(views[2]),
                    },
                    wgpu::BindGroupEntry {
                        binding: 4,
                        resource: params.as_entire_binding(),
                    },
                ],
            });

        let id = self.alloc_id();
        drop(self.materials.insert(
            id,
            MaterialEntry {
                bind_group,
                _params: params,
            },
        ));
        Ok(MaterialId(id))
    }

    fn destroy_material(&mut self, material: MaterialId) {
        drop(self.materials.remove(&material.0));
    }

    fn render_composite(
        &mut self,
        material: MaterialId,
        target: RenderTargetId,
    ) {
        let (Some(material), Some(target)) = (
            self.materials.get(&material.0),
            self.targets.get(&target.0),
        ) else {
            log::warn!("render_composite: stale material or target id");
            return;
        };

        let mut encoder = self.device.create_command_encoder(
            &wgpu::CommandEncoderDescriptor {
                label: Some("Composite Encoder"),
            },
        );
        {
            let mut pass =
                encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                    label: Some("Composite Pass"),
                    color_attachments: &[Some(
                        wgpu::RenderPassColorAttachment {
                            view: &target.view,
                            resolve_target: None,
                            ops: wgpu::Operations {
                                load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                                store: wgpu::StoreOp::Store,
                            },
                            depth_slice: None,
                        },
                    )],
                    depth_stencil_attachment: None,
                    ..Default::default()
                });
            let pipeline = if target.srgb {
                &self.pipeline_srgb
            } else {
                &self.pipeline_linear
            };
            pass.set_pipeline(pipeline);
            pass.set_bind_group(0, &material.bind_group, &[]);
            pass.draw(0..3, 0..1);
        }
        let _ = self.queue.submit(std::iter::once(encoder.finish()));
    }

    fn read_render_target(
        &mut self,
        target: RenderTargetId,
    ) -> Box<dyn WaitHandle> {
        let wait = FlagWait::new();
        let Some(entry) = self.targets.get(&target.0) else {
            log::warn!("read_render_target: stale target id");
            return Box::new(wait);
        };

        let mut encoder = self.device.create_command_encoder(
            &wgpu::CommandEncoderDescriptor {
                label: Some("Composite Readback Encoder"),
            },
        );
        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture: &entry.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &entry.staging,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(padded_bytes_per_row(entry.size)),
                    rows_per_image: Some(entry.size),
                },
            },
            wgpu::Extent3d {
                width: entry.size,
                height: entry.size,
                depth_or_array_layers: 1,
            },
        );
        let _ = self.queue.submit(std::iter::once(encoder.finish()));

        let signal = wait.signal();
        self.queue.on_submitted_work_done(move || {
            signal.store(true, Ordering::Release);
        });
        Box::new(wait)
    }

    fn resolve_readback(
        &mut self,
        target: RenderTargetId,
        dest: &SharedScratch,
    ) -> Box<dyn WaitHandle> {
        let wait = FlagWait::new();
        let Some(entry) = self.targets.get(&target.0) else {
            log::warn!("resolve_readback: stale target id");
            return Box::new(wait);
        };

        let buffer = entry.staging.clone();
        let size = entry.size;
        let dest = std::sync::Arc::clone(dest);
        let signal = wait.signal();
        entry.staging.slice(..).map_async(wgpu::MapMode::Read, move |result| {
            if let Err(e) = result {
                log::warn!("composite readback map failed: {e}");
                signal.store(true, Ordering::Release);
                return;
            }
            {
                let mapped = buffer.slice(..).get_mapped_range();
                let padded = padded_bytes_per_row(size) as usize;
                let row_bytes = size as usize * SCRATCH_BPP;
                let mut scratch =
                    dest.lock().unwrap_or_else(PoisonError::into_inner);
                if scratch.width() == size && scratch.height() == size {
                    for y in 0..size as usize {
                        let src = &mapped[y * padded..y * padded + row_bytes];
                        scratch.data_mut()[y * row_bytes..(y + 1) * row_bytes]
                            .copy_from_slice(src);
                    }
                } else {
                    log::warn!(
                        "resolve_readback: scratch size mismatch ({}x{} vs {size})",
                        scratch.width(),
                        scratch.height()
                    );
                }
            }
            buffer.unmap();
            signal.store(true, Ordering::Release);
        });
        Box::new(wait)
    }

    fn create_result_texture(
        &mut self,
        name: &str,
        format: CompositeFormat,
        size: u32,
        srgb: bool,
    ) -> Result<ResultTextureId, WeftError> {
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some(name),
            size: wgpu::Extent3d {
                width: size,
                height: size,
                depth_or_array_layers: 1,
            },
            mip_level_count: mip_count(size),
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: result_format(format, srgb),
            usage: wgpu::TextureUsages::TEXTURE_BINDING
                | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        let id = self.alloc_id();
        drop(self.results.insert(id, texture));
        Ok(ResultTextureId(id))
    }

    fn destroy_result_texture(&mut self, texture: ResultTextureId) {
        drop(self.results.remove(&texture.0));
    }

    fn upload_compressed(
        &mut self,
        texture: ResultTextureId,
        image: &CompressedImage,
    ) {
        let Some(gpu_texture) = self.results.get(&texture.0) else {
            log::warn!("upload_compressed: stale result texture id");
            return;
        };
        let block_bytes = image.format().block_bytes() as u32;
        for level in 0..image.mip_levels().min(gpu_texture.mip_level_count()) {
            let w = (image.width() >> level).max(1);
            let h = (image.height() >> level).max(1);
            self.queue.write_texture(
                wgpu::TexelCopyTextureInfo {
                    texture: gpu_texture,
                    mip_level: level,
                    origin: wgpu::Origin3d::ZERO,
                    aspect: wgpu::TextureAspect::All,
                },
                image.mip(level),
                wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(w.div_ceil(4) * block_bytes),
                    rows_per_image: Some(h.div_ceil(4)),
                },
                wgpu::Extent3d {
                    width: w,
                    height: h,
                    depth_or_array_layers: 1,
                },
            );
        }
    }

    fn poll_events(&mut self) {
        let _ = self.device.poll(wgpu::PollType::Poll);
    }
}
