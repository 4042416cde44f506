//! Host graphics API boundary.
//!
//! Everything above this module records work through [`GraphicsBackend`]; the
//! scheduler worker is the only caller of the `cmd_*` methods. A host binding
//! implements the trait once. [`software::SoftwareBackend`] executes commands
//! on CPU-side images so the whole pipeline runs headless.

pub mod software;

use crate::engines::fermi_2d;
use crate::error::BackendError;
use crate::texture_cache::copy_params::CopyParams;
use crate::texture_cache::format::PixelFormat;
use crate::texture_cache::surface_params::SurfaceParams;
use crate::texture_cache::view::ViewParams;
use oxidinx_hw::specs::render_targets::NUM_COLOR;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

pub use software::SoftwareBackend;

/// Host-visible memory an image download lands in
pub type StagingBuffer = Arc<Mutex<Vec<u8>>>;

/// Attachment layout of a render pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct RenderPassKey {
    pub color_formats: [Option<PixelFormat>; NUM_COLOR],
    pub depth_format: Option<PixelFormat>,
    pub width: u32,
    pub height: u32,
}

/// Capabilities the emulated GPU needs from a host graphics API.
///
/// Completion is tracked with a single timeline: [`submit`](Self::submit)
/// signals `signal` once the command buffer has executed, after waiting for
/// `wait`.
pub trait GraphicsBackend: Send + Sync + 'static {
    type CommandBuffer: Copy + Send + Sync + std::fmt::Debug;
    /// Shared handle to a host image
    type Image: Clone + Send + Sync;
    type Event: Clone + Send + Sync;

    // --------------------------------------------------------------------------------------------
    // Device
    // --------------------------------------------------------------------------------------------

    /// Highest timeline value the host has completed.
    fn timeline_counter(&self) -> u64;

    /// Block until the timeline reaches `value`, returning false on timeout.
    fn wait_timeline(&self, value: u64, timeout: Duration) -> bool;

    fn allocate_command_buffers(&self, count: usize) -> Vec<Self::CommandBuffer>;

    fn begin_command_buffer(&self, cmdbuf: Self::CommandBuffer);

    fn end_command_buffer(&self, cmdbuf: Self::CommandBuffer);

    fn submit(&self, cmdbuf: Self::CommandBuffer, wait: u64, signal: u64) -> Result<(), BackendError>;

    fn create_image(&self, params: &SurfaceParams) -> Self::Image;

    fn create_event(&self) -> Self::Event;

    fn event_is_set(&self, event: &Self::Event) -> bool;

    /// Hand a finished frame to the presentation layer.
    fn present(&self, image: &Self::Image);

    // --------------------------------------------------------------------------------------------
    // Recorded commands
    // --------------------------------------------------------------------------------------------

    fn cmd_begin_render_pass(&self, cmdbuf: Self::CommandBuffer, key: &RenderPassKey);

    fn cmd_end_render_pass(&self, cmdbuf: Self::CommandBuffer);

    fn cmd_bind_pipeline(&self, cmdbuf: Self::CommandBuffer, pipeline: u64);

    fn cmd_copy_image(
        &self,
        cmdbuf: Self::CommandBuffer,
        src: &Self::Image,
        dst: &Self::Image,
        copy: &CopyParams,
    );

    fn cmd_blit_image(
        &self,
        cmdbuf: Self::CommandBuffer,
        src: &Self::Image,
        src_view: &ViewParams,
        dst: &Self::Image,
        dst_view: &ViewParams,
        config: &fermi_2d::Config,
    );

    /// Replace the whole image with `data`, laid out level-major then slice-major.
    fn cmd_upload_image(&self, cmdbuf: Self::CommandBuffer, image: &Self::Image, data: &[u8]);

    /// Copy the whole image into `staging` in the upload layout.
    fn cmd_download_image(
        &self,
        cmdbuf: Self::CommandBuffer,
        image: &Self::Image,
        staging: &StagingBuffer,
    );

    /// Clear one attachment of the open render pass.
    fn cmd_clear_image(
        &self,
        cmdbuf: Self::CommandBuffer,
        image: &Self::Image,
        view: &ViewParams,
        color: [f32; 4],
    );

    fn cmd_draw(&self, cmdbuf: Self::CommandBuffer, vertex_count: u32, instance_count: u32);

    fn cmd_dispatch(&self, cmdbuf: Self::CommandBuffer, code_addr: u64);

    fn cmd_set_event(&self, cmdbuf: Self::CommandBuffer, event: &Self::Event);
}
