// SPDX-License-Identifier: GPL-3.0-only

//! Client-submitted layers and the per-display layer collection.

use std::sync::Arc;

use smallvec::SmallVec;

use crate::{
    backend::{BlendMode, ColorSpace, GraphicBuffer, PathCaps, PlaneId, Transform},
    fence::Fence,
    state::GeometryChanged,
    utils::geometry::Rect,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LayerId(pub u64);

/// Composition type of a layer. Clients request one of the non-`Blender`
/// variants; validation may answer with any of them.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CompositionType {
    /// Not yet decided for this frame.
    #[default]
    Invalid,
    /// GPU composition into the client target buffer.
    Client,
    /// Own overlay plane.
    Device,
    /// Overlay plane driven through the cursor fast path.
    Cursor,
    /// No buffer, a solid fill handled by the plane hardware.
    SolidColor,
    /// Refresh-rate indicator overlay; device path, exempt from idle hints.
    RefreshRateIndicator,
    /// Pre-blended by the 2D blender block.
    Blender,
    /// Rounded-corner decoration slot.
    Decoration,
}

/// Why validation moved a layer away from its requested type. Diagnostic
/// only, never drives behavior.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValidationReason {
    SandwichedBetweenClient,
    SandwichedBetweenBlender,
    UnsupportedByBlender,
    MaxPriorityEviction,
    HighPriorityConflict,
    ResourceAssignFail,
    SkipStatic,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    #[default]
    Normal,
    /// Stays out of blender ranges; opaque high-priority layers are also
    /// exempt from the sandwich rule.
    High,
    /// Demands the combined blender exclusively.
    Max,
}

/// The hardware path a layer ended up on after validation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AssignedPath {
    #[default]
    None,
    Overlay(PlaneId),
    Blender,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Color {
    pub a: u8,
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Color {
    pub fn to_argb(&self) -> u32 {
        ((self.a as u32) << 24) | ((self.r as u32) << 16) | ((self.g as u32) << 8) | self.b as u32
    }
}

/// Damage reported for a layer this frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DamageKind {
    /// No damage list submitted, assume everything changed.
    Full,
    /// Merged damage rectangle in layer coordinates.
    Partial(Rect),
    /// An explicit empty damage, nothing changed.
    Skip,
    /// Malformed rectangles.
    Error,
}

#[derive(Debug)]
pub struct Layer {
    pub id: LayerId,
    pub z: u32,
    pub requested_type: CompositionType,
    /// Set during validate; copied to `committed_type` by accept.
    pub validated_type: CompositionType,
    pub committed_type: CompositionType,
    pub validation_reason: Option<ValidationReason>,
    pub path: AssignedPath,
    pub window_index: Option<usize>,
    pub src_crop: Rect,
    pub display_frame: Rect,
    pub blend: BlendMode,
    pub plane_alpha: f32,
    pub transform: Transform,
    pub color_space: ColorSpace,
    pub color: Color,
    pub priority: Priority,
    pub supported_paths: PathCaps,
    pub damage: SmallVec<[Rect; 4]>,
    pub damage_submitted: bool,
    pub buffer: Option<Arc<GraphicBuffer>>,
    pub last_buffer: Option<u64>,
    pub acquire_fence: Option<Fence>,
    pub release_fence: Option<Fence>,
    pub geometry_changed: GeometryChanged,
}

impl Layer {
    pub fn new(id: LayerId) -> Layer {
        Layer {
            id,
            z: 0,
            requested_type: CompositionType::Device,
            validated_type: CompositionType::Invalid,
            committed_type: CompositionType::Invalid,
            validation_reason: None,
            path: AssignedPath::None,
            window_index: None,
            src_crop: Rect::default(),
            display_frame: Rect::default(),
            blend: BlendMode::None,
            plane_alpha: 1.0,
            transform: Transform::Normal,
            color_space: ColorSpace::Srgb,
            color: Color::default(),
            priority: Priority::Normal,
            supported_paths: PathCaps::OVERLAY,
            damage: SmallVec::new(),
            damage_submitted: false,
            buffer: None,
            last_buffer: None,
            acquire_fence: None,
            release_fence: None,
            geometry_changed: GeometryChanged::empty(),
        }
    }

    pub fn set_buffer(&mut self, buffer: Option<Arc<GraphicBuffer>>, acquire: Option<Fence>) {
        self.last_buffer = self.buffer.as_ref().map(|b| b.id);
        if self.last_buffer != buffer.as_ref().map(|b| b.id) {
            self.geometry_changed |= GeometryChanged::LAYER_BUFFER;
        }
        self.buffer = buffer;
        // An unconsumed acquire fence would leak, the new one replaces it.
        self.acquire_fence = acquire;
    }

    pub fn set_src_crop(&mut self, crop: Rect) {
        if self.src_crop != crop {
            self.geometry_changed |= GeometryChanged::LAYER_SOURCE_CROP;
        }
        self.src_crop = crop;
    }

    pub fn set_display_frame(&mut self, frame: Rect) {
        if self.display_frame != frame {
            self.geometry_changed |= GeometryChanged::LAYER_DISPLAY_FRAME;
        }
        self.display_frame = frame;
    }

    pub fn set_z(&mut self, z: u32) {
        if self.z != z {
            self.geometry_changed |= GeometryChanged::LAYER_ZORDER;
        }
        self.z = z;
    }

    pub fn set_blend(&mut self, blend: BlendMode) {
        if self.blend != blend {
            self.geometry_changed |= GeometryChanged::LAYER_BLEND;
        }
        self.blend = blend;
    }

    pub fn set_transform(&mut self, transform: Transform) {
        if self.transform != transform {
            self.geometry_changed |= GeometryChanged::LAYER_TRANSFORM;
        }
        self.transform = transform;
    }

    pub fn set_plane_alpha(&mut self, alpha: f32) {
        if self.plane_alpha != alpha {
            self.geometry_changed |= GeometryChanged::LAYER_ALPHA;
        }
        self.plane_alpha = alpha;
    }

    pub fn set_damage(&mut self, damage: &[Rect]) {
        self.damage = SmallVec::from_slice(damage);
        self.damage_submitted = true;
    }

    pub fn is_opaque(&self) -> bool {
        if self.plane_alpha < 1.0 {
            return false;
        }
        match self.blend {
            BlendMode::None => true,
            _ => self
                .buffer
                .as_ref()
                .map(|buffer| !buffer.format.has_alpha())
                .unwrap_or(false),
        }
    }

    /// Opaque high/max priority layers punch through client composition:
    /// the GPU pass clears their destination instead of drawing them.
    pub fn needs_clear_client_target(&self) -> bool {
        self.priority >= Priority::High && self.is_opaque()
    }

    pub fn buffer_id(&self) -> Option<u64> {
        self.buffer.as_ref().map(|buffer| buffer.id)
    }

    pub fn is_protected(&self) -> bool {
        self.buffer
            .as_ref()
            .map(|buffer| buffer.protected)
            .unwrap_or(false)
    }

    pub fn update_validated_type(&mut self, ty: CompositionType, reason: Option<ValidationReason>) {
        self.validated_type = ty;
        if reason.is_some() {
            self.validation_reason = reason;
        }
    }

    pub fn reset_assigned_path(&mut self) -> Option<PlaneId> {
        let released = match self.path {
            AssignedPath::Overlay(plane) => Some(plane),
            _ => None,
        };
        self.path = AssignedPath::None;
        self.window_index = None;
        released
    }
}

/// Z-ordered layer collection plus the side-set of layers the client
/// asked us to ignore (cached/suppressed). Ignored layers take no part
/// in validation and hold no fences.
#[derive(Debug, Default)]
pub struct LayerSet {
    layers: Vec<Layer>,
    ignored: Vec<Layer>,
}

impl LayerSet {
    pub fn add(&mut self, layer: Layer) {
        self.layers.push(layer);
    }

    pub fn remove(&mut self, id: LayerId) -> bool {
        if let Some(pos) = self.layers.iter().position(|l| l.id == id) {
            self.layers.remove(pos);
            return true;
        }
        if let Some(pos) = self.ignored.iter().position(|l| l.id == id) {
            self.ignored.remove(pos);
            return true;
        }
        false
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Layer> {
        self.layers.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Layer> {
        self.layers.get_mut(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Layer> {
        self.layers.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Layer> {
        self.layers.iter_mut()
    }

    pub fn by_id_mut(&mut self, id: LayerId) -> Option<&mut Layer> {
        self.layers
            .iter_mut()
            .chain(self.ignored.iter_mut())
            .find(|l| l.id == id)
    }

    pub fn ignored_count(&self) -> usize {
        self.ignored.len()
    }

    /// Stable ascending z sort; equal z keeps submission order.
    pub fn sort_by_z(&mut self) {
        self.layers.sort_by_key(|l| l.z);
    }

    /// Move a layer between the active list and the ignored side-set.
    /// Ignoring a layer drops its fences.
    pub fn set_ignored(&mut self, id: LayerId, ignored: bool) -> bool {
        if ignored {
            if let Some(pos) = self.layers.iter().position(|l| l.id == id) {
                let mut layer = self.layers.remove(pos);
                if layer.acquire_fence.take().is_some() {
                    tracing::debug!(?id, "closing acquire fence of ignored layer");
                }
                layer.release_fence = None;
                self.ignored.push(layer);
                return true;
            }
        } else if let Some(pos) = self.ignored.iter().position(|l| l.id == id) {
            let layer = self.ignored.remove(pos);
            self.layers.push(layer);
            return true;
        }
        false
    }

    /// Merge the layer's damage list into one region, in layer-local
    /// coordinates.
    pub fn region_for(&self, layer: &Layer) -> DamageKind {
        if !layer.damage_submitted {
            return DamageKind::Full;
        }
        if layer.damage.is_empty() {
            return DamageKind::Full;
        }
        let mut merged = Rect::default();
        let mut all_empty = true;
        for rect in &layer.damage {
            if rect.w < 0 || rect.h < 0 {
                return DamageKind::Error;
            }
            if rect.is_empty() {
                continue;
            }
            all_empty = false;
            merged = merged.union(rect);
        }
        if all_empty {
            DamageKind::Skip
        } else {
            DamageKind::Partial(merged)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layer(id: u64, z: u32) -> Layer {
        let mut l = Layer::new(LayerId(id));
        l.z = z;
        l
    }

    #[test]
    fn sort_is_stable_for_equal_z() {
        let mut set = LayerSet::default();
        set.add(layer(1, 2));
        set.add(layer(2, 0));
        set.add(layer(3, 2));
        set.sort_by_z();
        let order: Vec<u64> = set.iter().map(|l| l.id.0).collect();
        assert_eq!(order, vec![2, 1, 3]);
    }

    #[test]
    fn ignored_layers_leave_the_active_list() {
        let mut set = LayerSet::default();
        set.add(layer(1, 0));
        set.add(layer(2, 1));
        assert!(set.set_ignored(LayerId(2), true));
        assert_eq!(set.len(), 1);
        assert_eq!(set.ignored_count(), 1);

        assert!(set.set_ignored(LayerId(2), false));
        assert_eq!(set.len(), 2);
        assert!(set.remove(LayerId(2)));
        assert!(!set.remove(LayerId(2)));
    }

    #[test]
    fn damage_region_merging() {
        let mut set = LayerSet::default();
        let mut l = layer(1, 0);
        assert_eq!(set.region_for(&l), DamageKind::Full);

        l.set_damage(&[Rect::new(0, 0, 10, 10), Rect::new(20, 20, 10, 10)]);
        set.add(l);
        let l = set.get(0).unwrap();
        assert_eq!(set.region_for(l), DamageKind::Partial(Rect::new(0, 0, 30, 30)));
    }

    #[test]
    fn empty_damage_means_skip() {
        let mut l = layer(1, 0);
        l.set_damage(&[Rect::default()]);
        let set = LayerSet::default();
        assert_eq!(set.region_for(&l), DamageKind::Skip);

        let mut bad = layer(2, 0);
        bad.set_damage(&[Rect::new(0, 0, -5, 10)]);
        assert_eq!(set.region_for(&bad), DamageKind::Error);
    }

    #[test]
    fn buffer_change_sets_geometry_bit() {
        let mut l = layer(1, 0);
        let buf = crate::backend::GraphicBuffer::new(7, 100, 100, crate::backend::Format::Argb8888);
        l.set_buffer(Some(buf.clone()), None);
        assert!(l.geometry_changed.contains(GeometryChanged::LAYER_BUFFER));

        l.geometry_changed = GeometryChanged::empty();
        l.set_buffer(Some(buf), None);
        assert!(!l.geometry_changed.contains(GeometryChanged::LAYER_BUFFER));
    }
}
