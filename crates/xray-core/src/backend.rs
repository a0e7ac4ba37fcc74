//! Backend selection for the Burn framework.
//!
//! NdArray is the default and the one every test runs on. Building with the
//! `wgpu` feature switches the aliases to the WGPU backend.

use burn::backend::Autodiff;

#[cfg(not(feature = "wgpu"))]
mod selected {
    pub type Backend = burn_ndarray::NdArray<f32>;
    pub const NAME: &str = "ndarray";
}

#[cfg(feature = "wgpu")]
mod selected {
    pub type Backend = burn_wgpu::Wgpu;
    pub const NAME: &str = "wgpu";
}

/// Inference backend
pub type DefaultBackend = selected::Backend;

/// Training backend with automatic differentiation
pub type TrainingBackend = Autodiff<DefaultBackend>;

/// Device of the selected backend
pub type DefaultDevice = <DefaultBackend as burn::tensor::backend::Backend>::Device;

/// Default device of the selected backend
pub fn default_device() -> DefaultDevice {
    let device = DefaultDevice::default();
    tracing::debug!(backend = selected::NAME, ?device, "selected compute device");
    device
}

/// Name of the compiled-in backend
pub fn backend_name() -> &'static str {
    selected::NAME
}
