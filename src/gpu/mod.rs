//! wgpu implementation of the external rendering capabilities.

pub mod device;

pub use device::WgpuDevice;
