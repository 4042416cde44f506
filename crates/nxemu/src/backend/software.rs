//! CPU-side implementation of [`GraphicsBackend`].
//!
//! Images are tightly packed byte vectors in the host layout the texture cache
//! uploads: mip levels back to back, each level holding its layers (or depth
//! slices) in order. Recorded commands run on the scheduler worker as they are
//! replayed, so by the time a command buffer is submitted its work is done and
//! the timeline advances immediately.
//!
//! The backend also polices command placement: work that is only legal inside
//! a render pass (draws, attachment clears) or only legal outside one (copies,
//! transfers, events) is counted as a violation when recorded in the wrong
//! context.

use super::{GraphicsBackend, RenderPassKey, StagingBuffer};
use crate::engines::fermi_2d;
use crate::error::BackendError;
use crate::texture_cache::copy_params::CopyParams;
use crate::texture_cache::format::PixelFormat;
use crate::texture_cache::surface_params::SurfaceParams;
use crate::texture_cache::view::ViewParams;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, error, trace, warn};

// ================================================================================================
// Resources
// ================================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SoftwareCommandBuffer(pub u64);

/// A host image backed by CPU memory
#[derive(Debug)]
pub struct SoftwareImage {
    id: u64,
    params: SurfaceParams,
    data: Mutex<Vec<u8>>,
}

impl SoftwareImage {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn params(&self) -> &SurfaceParams {
        &self.params
    }

    /// Snapshot of the image contents
    pub fn data(&self) -> Vec<u8> {
        self.data.lock().clone()
    }

    fn slice_offset(&self, level: u32, slice: u32) -> usize {
        self.params.host_mipmap_level_offset(level) + slice as usize * self.params.host_slice_size(level)
    }

    /// Row pitch of `level` in bytes
    fn row_pitch(&self, level: u32) -> usize {
        let blocks = self
            .params
            .mip_width(level)
            .div_ceil(self.params.default_block_width());
        blocks as usize * self.params.bytes_per_pixel() as usize
    }

    fn slices(&self, level: u32) -> u32 {
        if self.params.is_layered {
            self.params.depth
        } else {
            self.params.mip_depth(level)
        }
    }
}

/// Command and submission counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SoftwareStats {
    pub submissions: u64,
    pub render_passes: u64,
    pub pipeline_binds: u64,
    pub draws: u64,
    pub clears: u64,
    pub dispatches: u64,
    pub copies: u64,
    pub blits: u64,
    pub uploads: u64,
    pub downloads: u64,
    pub events: u64,
    pub presents: u64,
    /// Commands recorded inside a render pass that must not be, or the reverse
    pub render_pass_violations: u64,
}

// ================================================================================================
// Backend
// ================================================================================================

#[derive(Default)]
pub struct SoftwareBackend {
    timeline: Mutex<u64>,
    timeline_cv: Condvar,
    next_id: AtomicU64,
    device_lost: AtomicBool,
    render_pass: Mutex<Option<RenderPassKey>>,
    stats: Mutex<SoftwareStats>,
    last_frame: Mutex<Option<Arc<SoftwareImage>>>,
}

impl SoftwareBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> SoftwareStats {
        self.stats.lock().clone()
    }

    /// Make every later submission fail as if the device had been lost.
    pub fn set_device_lost(&self) {
        self.device_lost.store(true, Ordering::Release);
    }

    /// Contents of the last presented image
    pub fn last_presented(&self) -> Option<Vec<u8>> {
        self.last_frame.lock().as_ref().map(|image| image.data())
    }

    pub fn is_in_render_pass(&self) -> bool {
        self.render_pass.lock().is_some()
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn count(&self, f: impl FnOnce(&mut SoftwareStats)) {
        f(&mut self.stats.lock());
    }

    /// Count a violation unless the render pass state is `inside`.
    fn expect_render_pass(&self, inside: bool, what: &str) {
        if self.render_pass.lock().is_some() != inside {
            error!(
                "{} recorded {} a render pass",
                what,
                if inside { "outside" } else { "inside" }
            );
            self.count(|stats| stats.render_pass_violations += 1);
        }
    }
}

/// Encode a clear value in `format`; formats without an encoding clear to zero.
fn encode_clear_value(format: PixelFormat, color: [f32; 4]) -> Vec<u8> {
    let unorm8 = |value: f32| (value.clamp(0.0, 1.0) * 255.0).round() as u8;
    let [r, g, b, a] = color;
    match format {
        PixelFormat::A8B8G8R8Unorm | PixelFormat::A8B8G8R8Srgb => {
            vec![unorm8(r), unorm8(g), unorm8(b), unorm8(a)]
        }
        PixelFormat::B8G8R8A8Unorm | PixelFormat::B8G8R8A8Srgb => {
            vec![unorm8(b), unorm8(g), unorm8(r), unorm8(a)]
        }
        PixelFormat::R8Unorm => vec![unorm8(r)],
        PixelFormat::R8G8Unorm => vec![unorm8(r), unorm8(g)],
        PixelFormat::R32Float | PixelFormat::D32Float => r.to_le_bytes().to_vec(),
        PixelFormat::R32G32B32A32Float => color.iter().flat_map(|c| c.to_le_bytes()).collect(),
        PixelFormat::D16Unorm | PixelFormat::R16Unorm => {
            ((r.clamp(0.0, 1.0) * 65535.0).round() as u16).to_le_bytes().to_vec()
        }
        other => {
            trace!("Clearing {:?} to zero", other);
            vec![0; other.bytes_per_pixel() as usize]
        }
    }
}

impl GraphicsBackend for SoftwareBackend {
    type CommandBuffer = SoftwareCommandBuffer;
    type Image = Arc<SoftwareImage>;
    type Event = Arc<AtomicBool>;

    fn timeline_counter(&self) -> u64 {
        *self.timeline.lock()
    }

    fn wait_timeline(&self, value: u64, timeout: Duration) -> bool {
        let mut timeline = self.timeline.lock();
        if *timeline >= value {
            return true;
        }
        let _ = self
            .timeline_cv
            .wait_while_for(&mut timeline, |counter| *counter < value, timeout);
        *timeline >= value
    }

    fn allocate_command_buffers(&self, count: usize) -> Vec<Self::CommandBuffer> {
        (0..count)
            .map(|_| SoftwareCommandBuffer(self.next_id()))
            .collect()
    }

    fn begin_command_buffer(&self, cmdbuf: Self::CommandBuffer) {
        trace!("Begin command buffer {:?}", cmdbuf);
    }

    fn end_command_buffer(&self, cmdbuf: Self::CommandBuffer) {
        trace!("End command buffer {:?}", cmdbuf);
        self.expect_render_pass(false, "End of command buffer");
    }

    fn submit(&self, cmdbuf: Self::CommandBuffer, wait: u64, signal: u64) -> Result<(), BackendError> {
        if self.device_lost.load(Ordering::Acquire) {
            return Err(BackendError::DeviceLost);
        }
        let mut timeline = self.timeline.lock();
        if *timeline < wait {
            return Err(BackendError::Submit(format!(
                "{:?} waits on tick {} but the timeline is at {}",
                cmdbuf, wait, *timeline
            )));
        }
        debug!("Submit {:?} (wait {}, signal {})", cmdbuf, wait, signal);
        *timeline = (*timeline).max(signal);
        self.timeline_cv.notify_all();
        drop(timeline);
        self.count(|stats| stats.submissions += 1);
        Ok(())
    }

    fn create_image(&self, params: &SurfaceParams) -> Self::Image {
        let size = params.host_size_in_bytes();
        trace!(
            "Creating {} {:?} image {}x{}x{} ({} bytes)",
            params.target_name(),
            params.pixel_format,
            params.width,
            params.height,
            params.depth,
            size
        );
        Arc::new(SoftwareImage {
            id: self.next_id(),
            params: *params,
            data: Mutex::new(vec![0; size]),
        })
    }

    fn create_event(&self) -> Self::Event {
        Arc::new(AtomicBool::new(false))
    }

    fn event_is_set(&self, event: &Self::Event) -> bool {
        event.load(Ordering::Acquire)
    }

    fn present(&self, image: &Self::Image) {
        debug!("Present image {}", image.id);
        *self.last_frame.lock() = Some(image.clone());
        self.count(|stats| stats.presents += 1);
    }

    fn cmd_begin_render_pass(&self, _cmdbuf: Self::CommandBuffer, key: &RenderPassKey) {
        let mut render_pass = self.render_pass.lock();
        if render_pass.is_some() {
            error!("Render pass begun while another is open");
            self.count(|stats| stats.render_pass_violations += 1);
        }
        *render_pass = Some(*key);
        drop(render_pass);
        self.count(|stats| stats.render_passes += 1);
    }

    fn cmd_end_render_pass(&self, _cmdbuf: Self::CommandBuffer) {
        if self.render_pass.lock().take().is_none() {
            error!("Render pass ended while none is open");
            self.count(|stats| stats.render_pass_violations += 1);
        }
    }

    fn cmd_bind_pipeline(&self, _cmdbuf: Self::CommandBuffer, pipeline: u64) {
        trace!("Bind pipeline {:#x}", pipeline);
        self.count(|stats| stats.pipeline_binds += 1);
    }

    fn cmd_copy_image(
        &self,
        _cmdbuf: Self::CommandBuffer,
        src: &Self::Image,
        dst: &Self::Image,
        copy: &CopyParams,
    ) {
        self.expect_render_pass(false, "Image copy");
        self.count(|stats| stats.copies += 1);

        let bpp = src.params.bytes_per_pixel() as usize;
        if bpp != dst.params.bytes_per_pixel() as usize {
            warn!(
                "Image copy between {:?} and {:?} has mismatched block sizes",
                src.params.pixel_format, dst.params.pixel_format
            );
            return;
        }
        let (src_bw, src_bh) = (
            src.params.default_block_width(),
            src.params.default_block_height(),
        );
        let (dst_bw, dst_bh) = (
            dst.params.default_block_width(),
            dst.params.default_block_height(),
        );
        let row_bytes = copy.width.div_ceil(src_bw) as usize * bpp;
        let rows = copy.height.div_ceil(src_bh);
        let src_pitch = src.row_pitch(copy.source_level);
        let dst_pitch = dst.row_pitch(copy.dest_level);

        // Snapshot so copies within one image do not alias
        let source = src.data();
        let mut target = dst.data.lock();
        for z in 0..copy.depth {
            let src_base = src.slice_offset(copy.source_level, copy.source_z + z);
            let dst_base = dst.slice_offset(copy.dest_level, copy.dest_z + z);
            for row in 0..rows {
                let src_offset = src_base
                    + (copy.source_y / src_bh + row) as usize * src_pitch
                    + (copy.source_x / src_bw) as usize * bpp;
                let dst_offset = dst_base
                    + (copy.dest_y / dst_bh + row) as usize * dst_pitch
                    + (copy.dest_x / dst_bw) as usize * bpp;
                let (Some(from), Some(to)) = (
                    source.get(src_offset..src_offset + row_bytes),
                    target.get_mut(dst_offset..dst_offset + row_bytes),
                ) else {
                    trace!("Image copy row {} of slice {} out of bounds", row, z);
                    continue;
                };
                to.copy_from_slice(from);
            }
        }
    }

    fn cmd_blit_image(
        &self,
        _cmdbuf: Self::CommandBuffer,
        src: &Self::Image,
        src_view: &ViewParams,
        dst: &Self::Image,
        dst_view: &ViewParams,
        config: &fermi_2d::Config,
    ) {
        self.expect_render_pass(false, "Image blit");
        self.count(|stats| stats.blits += 1);

        let bpp = src.params.bytes_per_pixel() as usize;
        if bpp == 0 || bpp != dst.params.bytes_per_pixel() as usize {
            warn!(
                "Blit from {:?} to {:?} needs a format conversion",
                src.params.pixel_format, dst.params.pixel_format
            );
            return;
        }
        if src.params.is_compressed() || dst.params.is_compressed() {
            warn!("Blit between compressed images is unimplemented");
            return;
        }

        let (src_rect, dst_rect) = (config.src_rect, config.dst_rect);
        let (src_w, src_h) = (src_rect.width().max(1), src_rect.height().max(1));
        let (dst_w, dst_h) = (dst_rect.width(), dst_rect.height());
        let src_level = src_view.base_level;
        let dst_level = dst_view.base_level;
        let src_extent = (src.params.mip_width(src_level), src.params.mip_height(src_level));
        let dst_extent = (dst.params.mip_width(dst_level), dst.params.mip_height(dst_level));
        let src_base = src.slice_offset(src_level, src_view.base_layer);
        let dst_base = dst.slice_offset(dst_level, dst_view.base_layer);
        let src_pitch = src.row_pitch(src_level);
        let dst_pitch = dst.row_pitch(dst_level);

        let source = src.data();
        let mut target = dst.data.lock();
        for y in 0..dst_h {
            let dy = dst_rect.top + y;
            let sy = src_rect.top + (y as u64 * src_h as u64 / dst_h.max(1) as u64) as u32;
            if dy >= dst_extent.1 || sy >= src_extent.1 {
                continue;
            }
            for x in 0..dst_w {
                let dx = dst_rect.left + x;
                let sx = src_rect.left + (x as u64 * src_w as u64 / dst_w.max(1) as u64) as u32;
                if dx >= dst_extent.0 || sx >= src_extent.0 {
                    continue;
                }
                let from = src_base + sy as usize * src_pitch + sx as usize * bpp;
                let to = dst_base + dy as usize * dst_pitch + dx as usize * bpp;
                if let (Some(pixel), Some(out)) =
                    (source.get(from..from + bpp), target.get_mut(to..to + bpp))
                {
                    out.copy_from_slice(pixel);
                }
            }
        }
    }

    fn cmd_upload_image(&self, _cmdbuf: Self::CommandBuffer, image: &Self::Image, data: &[u8]) {
        self.expect_render_pass(false, "Image upload");
        self.count(|stats| stats.uploads += 1);
        let mut target = image.data.lock();
        let len = target.len().min(data.len());
        target[..len].copy_from_slice(&data[..len]);
    }

    fn cmd_download_image(
        &self,
        _cmdbuf: Self::CommandBuffer,
        image: &Self::Image,
        staging: &StagingBuffer,
    ) {
        self.expect_render_pass(false, "Image download");
        self.count(|stats| stats.downloads += 1);
        *staging.lock() = image.data();
    }

    fn cmd_clear_image(
        &self,
        _cmdbuf: Self::CommandBuffer,
        image: &Self::Image,
        view: &ViewParams,
        color: [f32; 4],
    ) {
        self.expect_render_pass(true, "Attachment clear");
        self.count(|stats| stats.clears += 1);

        let value = encode_clear_value(image.params.pixel_format, color);
        if value.is_empty() {
            return;
        }
        let mut target = image.data.lock();
        for level in view.base_level..view.base_level + view.num_levels {
            let layers = view.num_layers.min(image.slices(level).saturating_sub(view.base_layer));
            let start = image.slice_offset(level, view.base_layer);
            let end = start + layers as usize * image.params.host_slice_size(level);
            if let Some(bytes) = target.get_mut(start..end) {
                for pixel in bytes.chunks_exact_mut(value.len()) {
                    pixel.copy_from_slice(&value);
                }
            }
        }
    }

    fn cmd_draw(&self, _cmdbuf: Self::CommandBuffer, vertex_count: u32, instance_count: u32) {
        self.expect_render_pass(true, "Draw");
        trace!("Draw {} vertices, {} instances", vertex_count, instance_count);
        self.count(|stats| stats.draws += 1);
    }

    fn cmd_dispatch(&self, _cmdbuf: Self::CommandBuffer, code_addr: u64) {
        self.expect_render_pass(false, "Dispatch");
        trace!("Dispatch compute at {:#x}", code_addr);
        self.count(|stats| stats.dispatches += 1);
    }

    fn cmd_set_event(&self, _cmdbuf: Self::CommandBuffer, event: &Self::Event) {
        self.expect_render_pass(false, "Event signal");
        event.store(true, Ordering::Release);
        self.count(|stats| stats.events += 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::texture_cache::format::SurfaceTarget;
    use crate::texture_cache::surface_params::tests::rgba8_2d;

    fn cmdbuf(backend: &SoftwareBackend) -> SoftwareCommandBuffer {
        backend.allocate_command_buffers(1)[0]
    }

    #[test]
    fn test_submit_advances_timeline() {
        let backend = SoftwareBackend::new();
        let cmd = cmdbuf(&backend);
        assert_eq!(backend.timeline_counter(), 0);
        backend.submit(cmd, 0, 1).unwrap();
        assert_eq!(backend.timeline_counter(), 1);
        assert!(backend.wait_timeline(1, Duration::ZERO));
        assert!(!backend.wait_timeline(2, Duration::from_millis(1)));
    }

    #[test]
    fn test_submit_after_device_loss_fails() {
        let backend = SoftwareBackend::new();
        let cmd = cmdbuf(&backend);
        backend.set_device_lost();
        assert_eq!(backend.submit(cmd, 0, 1), Err(BackendError::DeviceLost));
    }

    #[test]
    fn test_copy_image_region() {
        let backend = SoftwareBackend::new();
        let cmd = cmdbuf(&backend);
        let src = backend.create_image(&rgba8_2d(4, 4, false));
        let dst = backend.create_image(&rgba8_2d(4, 4, false));
        let pattern: Vec<u8> = (0..64).collect();
        backend.cmd_upload_image(cmd, &src, &pattern);

        let copy = CopyParams::new((2, 2, 0), (0, 0, 0), 0, 0, 2, 2, 1);
        backend.cmd_copy_image(cmd, &src, &dst, &copy);

        let out = dst.data();
        // Source row 2 starts at byte 32; column 2 is 8 bytes in
        assert_eq!(&out[0..8], &pattern[40..48]);
        assert_eq!(&out[16..24], &pattern[56..64]);
        assert_eq!(&out[8..16], &[0; 8]);
    }

    #[test]
    fn test_blit_scales_nearest() {
        let backend = SoftwareBackend::new();
        let cmd = cmdbuf(&backend);
        let src = backend.create_image(&rgba8_2d(2, 2, false));
        let dst = backend.create_image(&rgba8_2d(4, 4, false));
        let pixels: Vec<u8> = [1u8, 2, 3, 4].iter().flat_map(|&p| [p; 4]).collect();
        backend.cmd_upload_image(cmd, &src, &pixels);

        let view = ViewParams::new(SurfaceTarget::Texture2D, 0, 1, 0, 1);
        let config = fermi_2d::Config {
            operation: fermi_2d::Operation::SrcCopy,
            filter: fermi_2d::Filter::PointSample,
            src_rect: fermi_2d::Rect { left: 0, top: 0, right: 2, bottom: 2 },
            dst_rect: fermi_2d::Rect { left: 0, top: 0, right: 4, bottom: 4 },
        };
        backend.cmd_blit_image(cmd, &src, &view, &dst, &view, &config);

        let out = dst.data();
        let pixel = |x: usize, y: usize| out[(y * 4 + x) * 4];
        assert_eq!(pixel(0, 0), 1);
        assert_eq!(pixel(1, 1), 1);
        assert_eq!(pixel(3, 0), 2);
        assert_eq!(pixel(0, 3), 3);
        assert_eq!(pixel(3, 3), 4);
    }

    #[test]
    fn test_render_pass_policing() {
        let backend = SoftwareBackend::new();
        let cmd = cmdbuf(&backend);
        let image = backend.create_image(&rgba8_2d(2, 2, false));
        let view = ViewParams::new(SurfaceTarget::Texture2D, 0, 1, 0, 1);

        backend.cmd_draw(cmd, 3, 1);
        assert_eq!(backend.stats().render_pass_violations, 1);

        backend.cmd_begin_render_pass(cmd, &RenderPassKey::default());
        backend.cmd_clear_image(cmd, &image, &view, [1.0, 0.0, 0.0, 1.0]);
        backend.cmd_draw(cmd, 3, 1);
        backend.cmd_upload_image(cmd, &image, &[0; 16]);
        assert_eq!(backend.stats().render_pass_violations, 2);
        backend.cmd_end_render_pass(cmd);
        assert!(!backend.is_in_render_pass());

        let stats = backend.stats();
        assert_eq!(stats.draws, 2);
        assert_eq!(stats.clears, 1);
        assert_eq!(stats.render_passes, 1);
    }

    #[test]
    fn test_clear_encodes_format() {
        let backend = SoftwareBackend::new();
        let cmd = cmdbuf(&backend);
        let image = backend.create_image(&rgba8_2d(2, 1, false));
        let view = ViewParams::new(SurfaceTarget::Texture2D, 0, 1, 0, 1);
        backend.cmd_begin_render_pass(cmd, &RenderPassKey::default());
        backend.cmd_clear_image(cmd, &image, &view, [1.0, 0.0, 0.0, 1.0]);
        backend.cmd_end_render_pass(cmd);
        assert_eq!(image.data(), vec![255, 0, 0, 255, 255, 0, 0, 255]);
    }

    #[test]
    fn test_events() {
        let backend = SoftwareBackend::new();
        let cmd = cmdbuf(&backend);
        let event = backend.create_event();
        assert!(!backend.event_is_set(&event));
        backend.cmd_set_event(cmd, &event);
        assert!(backend.event_is_set(&event));
    }
}
