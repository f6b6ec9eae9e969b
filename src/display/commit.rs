// SPDX-License-Identifier: GPL-3.0-only

//! Per-frame window configuration handed to the commit sink.
//!
//! Each display controller window gets one slot. Slot geometry follows the
//! hardware contract: clamp negative offsets, cap at the per-format
//! maximum, align sizes down and offsets up, then re-clip.

use std::sync::Arc;

use dpu_comp_config::SizeRestriction;

use crate::{
    backend::{
        BlendMode, ColorSpace, CompressionType, Format, GraphicBuffer, PlaneId, Transform,
    },
    display::{layers::Layer, regions::CompositionInfo, HwcError},
    fence::Fence,
    utils::geometry::{align_down, align_up, Rect},
};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum WindowState {
    #[default]
    Disabled,
    /// Solid fill, ARGB8888 packed.
    Color(u32),
    Buffer,
    Cursor,
    Decoration,
}

/// One window slot of the display controller.
#[derive(Debug, Default)]
pub struct WindowConfig {
    pub state: WindowState,
    pub plane: Option<PlaneId>,
    pub buffer_id: Option<u64>,
    pub format: Option<Format>,
    pub src: Rect,
    pub dst: Rect,
    pub blend: BlendMode,
    pub plane_alpha: f32,
    pub transform: Transform,
    pub color_space: ColorSpace,
    pub protected: bool,
    pub compression: CompressionType,
    pub acquire_fence: Option<Fence>,
}

impl WindowConfig {
    pub fn disable(&mut self) {
        // Replacing the slot drops its fence, which closes it through the
        // ledger.
        *self = WindowConfig::default();
    }

    fn enabled(&self) -> bool {
        self.state != WindowState::Disabled
    }
}

/// Fence-free snapshot of a window slot, kept for change detection and
/// static-skip replay.
#[derive(Clone, Debug, PartialEq)]
pub struct SavedWindow {
    pub state: WindowState,
    pub plane: Option<PlaneId>,
    pub buffer_id: Option<u64>,
    pub format: Option<Format>,
    pub src: Rect,
    pub dst: Rect,
    pub blend: BlendMode,
    pub plane_alpha: f32,
    pub transform: Transform,
    pub color_space: ColorSpace,
}

impl SavedWindow {
    pub(super) fn of(config: &WindowConfig) -> SavedWindow {
        SavedWindow {
            state: config.state,
            plane: config.plane,
            buffer_id: config.buffer_id,
            format: config.format,
            src: config.src,
            dst: config.dst,
            blend: config.blend,
            plane_alpha: config.plane_alpha,
            transform: config.transform,
            color_space: config.color_space,
        }
    }
}

/// Snapshot of a whole committed frame. Replaced wholesale after each
/// successful commit, never mutated in place.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SavedCommit {
    pub windows: Vec<SavedWindow>,
}

#[derive(Debug)]
pub struct FrameCommitModel {
    pub configs: Vec<WindowConfig>,
    /// Bounding box of everything that changed this frame, display space.
    pub window_update: Option<Rect>,
    display_width: i32,
    display_height: i32,
}

impl FrameCommitModel {
    pub fn new(windows: usize, display_width: i32, display_height: i32) -> FrameCommitModel {
        FrameCommitModel {
            configs: (0..windows).map(|_| WindowConfig::default()).collect(),
            window_update: None,
            display_width,
            display_height,
        }
    }

    /// Disable every slot, closing owned fences first.
    pub fn reset(&mut self) {
        for config in &mut self.configs {
            config.disable();
        }
        self.window_update = None;
    }

    pub fn save(&self) -> SavedCommit {
        SavedCommit {
            windows: self.configs.iter().map(SavedWindow::of).collect(),
        }
    }

    /// Replay a saved slot, used when the static skip substitutes the
    /// previous client target output.
    pub fn restore_slot(&mut self, slot: usize, saved: &SavedWindow) -> Result<(), HwcError> {
        let config = self
            .configs
            .get_mut(slot)
            .ok_or(HwcError::BadWindowIndex)?;
        config.acquire_fence = None;
        config.state = saved.state;
        config.plane = saved.plane;
        config.buffer_id = saved.buffer_id;
        config.format = saved.format;
        config.src = saved.src;
        config.dst = saved.dst;
        config.blend = saved.blend;
        config.plane_alpha = saved.plane_alpha;
        config.transform = saved.transform;
        config.color_space = saved.color_space;
        Ok(())
    }

    /// Fill a slot from an overlay layer.
    pub fn configure_layer(
        &mut self,
        layer: &mut Layer,
        slot: usize,
        plane: PlaneId,
        restriction: &SizeRestriction,
    ) -> Result<(), HwcError> {
        let (display_width, display_height) = (self.display_width, self.display_height);
        let config = self
            .configs
            .get_mut(slot)
            .ok_or(HwcError::BadWindowIndex)?;
        config.disable();

        let dst = layer
            .display_frame
            .clipped_to_display(display_width, display_height);
        if dst.is_empty() {
            return Ok(());
        }

        config.plane = Some(plane);
        config.dst = dst;
        config.blend = layer.blend;
        config.plane_alpha = layer.plane_alpha;
        config.transform = layer.transform;
        config.color_space = layer.color_space;

        let Some(buffer) = layer.buffer.clone() else {
            config.state = WindowState::Color(layer.color.to_argb());
            config.src = dst;
            return Ok(());
        };

        let mut src = layer.src_crop;
        // Pixels clipped off the frame come out of the crop as well.
        src.x += dst.x - layer.display_frame.x;
        src.y += dst.y - layer.display_frame.y;
        src.w -= layer.display_frame.w - dst.w;
        src.h -= layer.display_frame.h - dst.h;

        let src = aligned_source(src, &buffer, restriction)?;
        footprint_check(&src, &buffer)?;

        config.state = match layer.validated_type {
            crate::display::layers::CompositionType::Cursor => WindowState::Cursor,
            crate::display::layers::CompositionType::Decoration => WindowState::Decoration,
            _ => WindowState::Buffer,
        };
        config.buffer_id = Some(buffer.id);
        config.format = Some(buffer.format);
        config.protected = buffer.protected;
        config.compression = buffer.compression;
        config.src = src;
        config.acquire_fence = layer.acquire_fence.take();
        layer.window_index = Some(slot);
        Ok(())
    }

    /// Fill a slot from a composition target (client or blender output).
    /// The destination is the merged frame of the member layers; if that
    /// cannot satisfy the hardware minimum the slot falls back to the full
    /// display.
    pub fn configure_target(
        &mut self,
        info: &mut CompositionInfo,
        slot: usize,
        plane: PlaneId,
        merged: Rect,
        restriction: &SizeRestriction,
    ) -> Result<(), HwcError> {
        let (display_width, display_height) = (self.display_width, self.display_height);
        let buffer = info.target.clone().ok_or(HwcError::MissingResource)?;
        let config = self
            .configs
            .get_mut(slot)
            .ok_or(HwcError::BadWindowIndex)?;
        config.disable();

        let mut dst = merged.clipped_to_display(display_width, display_height);
        dst.x = align_down(dst.x, restriction.crop_x_align);
        dst.y = align_down(dst.y, restriction.crop_y_align);
        dst.w = align_up(dst.w, restriction.crop_width_align).min(display_width - dst.x);
        dst.h = align_up(dst.h, restriction.crop_height_align).min(display_height - dst.y);
        if dst.is_empty()
            || dst.w < restriction.min_crop_width
            || dst.h < restriction.min_crop_height
        {
            dst = Rect::from_size(display_width, display_height);
        }

        // Target buffers are display sized, crop equals frame.
        let src = aligned_source(dst, &buffer, restriction)?;
        footprint_check(&src, &buffer)?;

        config.state = WindowState::Buffer;
        config.plane = Some(plane);
        config.buffer_id = Some(buffer.id);
        config.format = Some(buffer.format);
        config.protected = buffer.protected;
        config.compression = buffer.compression;
        config.src = src;
        config.dst = dst;
        config.blend = BlendMode::Premultiplied;
        config.plane_alpha = 1.0;
        config.transform = Transform::Normal;
        config.color_space = info.color_space;
        config.acquire_fence = info.acquire_fence.take();
        info.window_index = Some(slot);
        Ok(())
    }

    /// Check the whole plan before it goes to the hardware.
    pub fn validate(&self) -> Result<(), HwcError> {
        let mut any = false;
        for (i, config) in self.configs.iter().enumerate() {
            if !config.enabled() {
                continue;
            }
            any = true;
            let Some(plane) = config.plane else {
                return Err(HwcError::InvalidConfig);
            };
            for other in &self.configs[i + 1..] {
                if other.enabled() && other.plane == Some(plane) {
                    return Err(HwcError::InvalidConfig);
                }
            }
            let dst = config.dst;
            if dst.w <= 0
                || dst.h <= 0
                || dst.x < 0
                || dst.y < 0
                || dst.right() > self.display_width
                || dst.bottom() > self.display_height
            {
                return Err(HwcError::InvalidConfig);
            }
            if matches!(config.state, WindowState::Buffer | WindowState::Cursor)
                && (config.src.w <= 0 || config.src.h <= 0)
            {
                return Err(HwcError::InvalidConfig);
            }
        }
        if !any {
            return Err(HwcError::InvalidConfig);
        }
        Ok(())
    }

    /// Slot-wise comparison against the last committed frame. `true`
    /// means the hardware must be programmed again.
    pub fn changed_from(&self, previous: &SavedCommit) -> bool {
        if previous.windows.len() != self.configs.len() {
            return true;
        }
        self.configs
            .iter()
            .zip(previous.windows.iter())
            .any(|(config, saved)| *saved != SavedWindow::of(config))
    }

    /// Union of the frames of every enabled slot that differs from the
    /// previous commit.
    pub fn compute_window_update(&mut self, previous: Option<&SavedCommit>) {
        let Some(previous) = previous else {
            self.window_update = Some(Rect::from_size(self.display_width, self.display_height));
            return;
        };
        let mut update = Rect::default();
        for (i, config) in self.configs.iter().enumerate() {
            let saved = previous.windows.get(i);
            let same = saved.map(|s| *s == SavedWindow::of(config)).unwrap_or(false);
            if same {
                continue;
            }
            if config.enabled() {
                update = update.union(&config.dst);
            }
            if let Some(saved) = saved.filter(|s| s.state != WindowState::Disabled) {
                update = update.union(&saved.dst);
            }
        }
        self.window_update = (!update.is_empty()).then_some(update);
    }
}

fn aligned_source(
    src: Rect,
    buffer: &Arc<GraphicBuffer>,
    restriction: &SizeRestriction,
) -> Result<Rect, HwcError> {
    let mut src = src;
    if src.x < 0 {
        src.w += src.x;
        src.x = 0;
    }
    if src.y < 0 {
        src.h += src.y;
        src.y = 0;
    }
    src.w = src.w.min(restriction.max_crop_width).min(buffer.width - src.x);
    src.h = src.h.min(restriction.max_crop_height).min(buffer.height - src.y);

    src.w = align_down(src.w, restriction.crop_width_align);
    src.h = align_down(src.h, restriction.crop_height_align);
    src.x = align_up(src.x, restriction.crop_x_align);
    src.y = align_up(src.y, restriction.crop_y_align);

    // Aligning the offset up may push the crop past the buffer edge.
    if src.right() > buffer.width {
        src.w = align_down(buffer.width - src.x, restriction.crop_width_align);
    }
    if src.bottom() > buffer.height {
        src.h = align_down(buffer.height - src.y, restriction.crop_height_align);
    }
    if src.w < restriction.min_crop_width || src.h < restriction.min_crop_height {
        return Err(HwcError::InvalidConfig);
    }
    Ok(src)
}

fn footprint_check(src: &Rect, buffer: &Arc<GraphicBuffer>) -> Result<(), HwcError> {
    if buffer.is_lossy() {
        return Ok(());
    }
    let needed = (src.bottom() as u64)
        .saturating_mul(buffer.stride as u64)
        .saturating_mul(buffer.format.bits_per_pixel())
        / 8;
    if buffer.size_bytes < needed {
        return Err(HwcError::BufferTooSmall);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::display::layers::{Layer, LayerId};

    fn restriction() -> SizeRestriction {
        SizeRestriction {
            max_frame_width: 4096,
            max_frame_height: 4096,
            frame_width_align: 1,
            frame_height_align: 1,
            min_crop_width: 16,
            min_crop_height: 8,
            max_crop_width: 4096,
            max_crop_height: 4096,
            crop_x_align: 2,
            crop_y_align: 2,
            crop_width_align: 2,
            crop_height_align: 2,
        }
    }

    fn model() -> FrameCommitModel {
        FrameCommitModel::new(4, 1440, 3120)
    }

    fn buffer_layer(id: u64, frame: Rect) -> Layer {
        let mut layer = Layer::new(LayerId(id));
        layer.set_buffer(
            Some(GraphicBuffer::new(id, 1440, 3120, Format::Argb8888)),
            None,
        );
        layer.src_crop = Rect::new(0, 0, frame.w, frame.h);
        layer.display_frame = frame;
        layer
    }

    #[test]
    fn negative_offsets_are_clamped_into_the_crop() {
        let mut model = model();
        let mut layer = buffer_layer(1, Rect::new(0, 0, 100, 100));
        layer.src_crop = Rect::new(-10, -6, 110, 106);
        model
            .configure_layer(&mut layer, 0, PlaneId(0), &restriction())
            .unwrap();
        let config = &model.configs[0];
        assert_eq!(config.src, Rect::new(0, 0, 100, 100));
        assert_eq!(config.state, WindowState::Buffer);
    }

    #[test]
    fn crop_is_aligned_and_reclipped() {
        let mut model = model();
        let mut layer = buffer_layer(1, Rect::new(0, 0, 101, 101));
        layer.src_crop = Rect::new(1, 1, 101, 101);
        model
            .configure_layer(&mut layer, 0, PlaneId(0), &restriction())
            .unwrap();
        let config = &model.configs[0];
        // Offset aligned up to 2, size aligned down to 100.
        assert_eq!(config.src.x % 2, 0);
        assert_eq!(config.src.w % 2, 0);
        assert!(config.src.right() <= 1440);
    }

    #[test]
    fn undersized_buffer_is_rejected() {
        let mut model = model();
        let mut layer = buffer_layer(1, Rect::new(0, 0, 100, 100));
        // Lie about the allocation size.
        let buffer = GraphicBuffer::new(2, 100, 100, Format::Argb8888);
        let mut small = (*buffer).clone();
        small.size_bytes = 16;
        layer.buffer = Some(Arc::new(small));
        assert!(matches!(
            model.configure_layer(&mut layer, 0, PlaneId(0), &restriction()),
            Err(HwcError::BufferTooSmall)
        ));
    }

    #[test]
    fn offscreen_layer_leaves_slot_disabled() {
        let mut model = model();
        let mut layer = buffer_layer(1, Rect::new(2000, 4000, 100, 100));
        model
            .configure_layer(&mut layer, 0, PlaneId(0), &restriction())
            .unwrap();
        assert_eq!(model.configs[0].state, WindowState::Disabled);
    }

    #[test]
    fn duplicate_plane_fails_validation() {
        let mut model = model();
        let mut a = buffer_layer(1, Rect::new(0, 0, 100, 100));
        let mut b = buffer_layer(2, Rect::new(100, 100, 100, 100));
        model
            .configure_layer(&mut a, 0, PlaneId(0), &restriction())
            .unwrap();
        model
            .configure_layer(&mut b, 1, PlaneId(0), &restriction())
            .unwrap();
        assert!(matches!(model.validate(), Err(HwcError::InvalidConfig)));

        model.configs[1].plane = Some(PlaneId(1));
        assert!(model.validate().is_ok());
    }

    #[test]
    fn all_disabled_plan_is_invalid() {
        let model = model();
        assert!(matches!(model.validate(), Err(HwcError::InvalidConfig)));
    }

    #[test]
    fn tiny_merged_target_falls_back_to_fullscreen() {
        let mut model = model();
        let mut info =
            crate::display::regions::CompositionInfo::new(crate::display::regions::TargetKind::Client);
        info.set_target(
            Some(GraphicBuffer::new(7, 1440, 3120, Format::Argb8888)),
            None,
            ColorSpace::Srgb,
        );
        model
            .configure_target(&mut info, 0, PlaneId(0), Rect::new(4, 4, 6, 2), &restriction())
            .unwrap();
        assert_eq!(model.configs[0].dst, Rect::from_size(1440, 3120));
    }

    #[test]
    fn change_detection_tracks_buffer_identity_and_geometry() {
        let mut model = model();
        let mut layer = buffer_layer(1, Rect::new(0, 0, 100, 100));
        model
            .configure_layer(&mut layer, 0, PlaneId(0), &restriction())
            .unwrap();
        let saved = model.save();
        assert!(!model.changed_from(&saved));

        let mut moved = buffer_layer(1, Rect::new(10, 10, 100, 100));
        model
            .configure_layer(&mut moved, 0, PlaneId(0), &restriction())
            .unwrap();
        assert!(model.changed_from(&saved));

        model.compute_window_update(Some(&saved));
        // Old and new frames both belong to the damaged region.
        assert_eq!(model.window_update, Some(Rect::new(0, 0, 110, 110)));
    }
}
