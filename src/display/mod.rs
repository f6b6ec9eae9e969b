// SPDX-License-Identifier: GPL-3.0-only

//! Per-display frame lifecycle.
//!
//! [`Display`] owns the validate/accept/present state machine. A frame is
//! validated (layers sorted, composition paths assigned, commit plan
//! pre-built), optionally accepted by the client, then presented through
//! the commit sink. Failures never leave the machine stuck: every present
//! attempt ends in [`RenderingState::Presented`].

use std::{sync::Arc, time::Duration};

use parking_lot::RwLock;
use smallvec::SmallVec;
use tracing::{debug, error, info, trace, warn};

use crate::{
    backend::{
        ColorSpace, CommitError, CommitSink, Format, FormatClass, GraphicBuffer, PathDecision,
        PlaneId, ResourceArbiter,
    },
    fence::{Fence, FenceKind, FenceLedger, WaitStatus},
    state::{Common, GeometryChanged},
    utils::geometry::Rect,
};

pub mod commit;
pub mod layers;
pub mod regions;
pub mod skip;

use commit::{FrameCommitModel, SavedCommit, SavedWindow, WindowState};
use layers::{AssignedPath, CompositionType, DamageKind, Layer, LayerId, LayerSet, ValidationReason};
use regions::{RegionUpdate, Regions};
use skip::{can_skip_validate, evaluate_static_skip, SkipValidateCheck};

#[derive(Debug, thiserror::Error)]
pub enum HwcError {
    #[error("display was not validated")]
    NotValidated,
    #[error("layer index out of bounds")]
    InvalidIndex,
    #[error("composition range boundary violation")]
    InvalidRange,
    #[error("no such layer")]
    NoSuchLayer,
    #[error("required hardware resource is missing")]
    MissingResource,
    #[error("window configuration is invalid")]
    InvalidConfig,
    #[error("window index out of bounds")]
    BadWindowIndex,
    #[error("buffer is smaller than the configured source")]
    BufferTooSmall,
    #[error(transparent)]
    CommitFailed(#[from] CommitError),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RenderingState {
    #[default]
    None,
    Validated,
    AcceptedChange,
    Presented,
}

/// What validate() reported back to the client.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ValidationChanges {
    /// Layers whose composition type differs from the requested one.
    pub types_changed: usize,
    /// Layers with a pending display request (client target punch-through).
    pub requests: usize,
}

/// Client-visible display request attached to a layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DisplayRequest {
    /// The GPU pass must clear this layer's destination instead of
    /// drawing it; the layer scans out on its own plane.
    ClearClientTarget,
}

const RETIRE_WAIT_VSYNCS: u32 = 5;
/// Intermediate blender output buffers owned by the display, used round
/// robin so a frame never writes into the buffer still on screen.
const BLENDER_TARGET_BUFS: usize = 2;

pub struct Display {
    pub name: String,
    common: Arc<Common>,
    layers: Arc<RwLock<LayerSet>>,
    regions: Regions,
    state: RenderingState,
    model: FrameCommitModel,
    last_model: Option<SavedCommit>,
    geometry_changed: GeometryChanged,
    pub ledger: Arc<FenceLedger>,
    sink: Box<dyn CommitSink>,
    arbiter: Box<dyn ResourceArbiter>,
    last_retire: Option<Fence>,
    blender_targets: Vec<Arc<GraphicBuffer>>,
    blender_target_flip: usize,
    /// The glue supplied a blender target of its own; keep hands off.
    blender_target_external: bool,
    /// Present one blank frame after power-on before trusting geometry.
    skip_frame: bool,
    powered: bool,
    plugged: bool,
    first_frame: bool,
    had_resource_error: bool,
    next_layer_id: u64,
    width: i32,
    height: i32,
}

impl Display {
    pub fn new(
        name: impl Into<String>,
        common: Arc<Common>,
        sink: Box<dyn CommitSink>,
        arbiter: Box<dyn ResourceArbiter>,
    ) -> Display {
        let hw = &common.config.hardware;
        let (width, height) = (hw.width, hw.height);
        let windows = hw.plane_count + hw.decoration_slots;
        Display {
            name: name.into(),
            common,
            layers: Arc::new(RwLock::new(LayerSet::default())),
            regions: Regions::new(),
            state: RenderingState::None,
            model: FrameCommitModel::new(windows, width, height),
            last_model: None,
            geometry_changed: GeometryChanged::FORCE_VALIDATE,
            ledger: FenceLedger::new(),
            sink,
            arbiter,
            last_retire: None,
            blender_targets: Vec::new(),
            blender_target_flip: 0,
            blender_target_external: false,
            skip_frame: true,
            powered: true,
            plugged: true,
            first_frame: true,
            had_resource_error: false,
            next_layer_id: 1,
            width,
            height,
        }
    }

    pub fn layers(&self) -> Arc<RwLock<LayerSet>> {
        self.layers.clone()
    }

    pub fn state(&self) -> RenderingState {
        self.state
    }

    pub fn create_layer(&mut self) -> LayerId {
        let id = LayerId(self.next_layer_id);
        self.next_layer_id += 1;
        self.layers.write().add(Layer::new(id));
        self.geometry_changed |= GeometryChanged::LAYER_ADDED;
        trace!(display = %self.name, ?id, "created layer");
        id
    }

    pub fn destroy_layer(&mut self, id: LayerId) -> Result<(), HwcError> {
        if !self.layers.write().remove(id) {
            return Err(HwcError::NoSuchLayer);
        }
        self.geometry_changed |= GeometryChanged::LAYER_REMOVED;
        trace!(display = %self.name, ?id, "destroyed layer");
        Ok(())
    }

    pub fn set_layer_ignored(&mut self, id: LayerId, ignored: bool) -> Result<(), HwcError> {
        if !self.layers.write().set_ignored(id, ignored) {
            return Err(HwcError::NoSuchLayer);
        }
        self.geometry_changed |= GeometryChanged::LAYER_IGNORED;
        Ok(())
    }

    /// Buffer the GPU composition renders into.
    pub fn set_client_target(
        &mut self,
        target: Option<Arc<GraphicBuffer>>,
        acquire: Option<Fence>,
        color_space: ColorSpace,
    ) {
        self.regions.client.set_target(target, acquire, color_space);
    }

    /// Override the blender's intermediate buffer. Without one the
    /// display allocates its own pool.
    pub fn set_blender_target(
        &mut self,
        target: Option<Arc<GraphicBuffer>>,
        acquire: Option<Fence>,
        color_space: ColorSpace,
    ) {
        self.blender_target_external = target.is_some();
        self.regions.blender.set_target(target, acquire, color_space);
    }

    pub fn set_powered(&mut self, powered: bool) {
        if self.powered == powered {
            return;
        }
        self.powered = powered;
        self.geometry_changed |= GeometryChanged::DISPLAY_POWER;
        if powered {
            // The first frame after power-on runs on stale plane state.
            self.skip_frame = true;
        }
        info!(display = %self.name, powered, "power state changed");
    }

    pub fn set_plugged(&mut self, plugged: bool) {
        if self.plugged == plugged {
            return;
        }
        self.plugged = plugged;
        self.common.mark_device_geometry(GeometryChanged::FORCE_VALIDATE);
        info!(display = %self.name, plugged, "connection state changed");
    }

    /// Full validate pass: sort, assign composition paths, evaluate the
    /// static skip and pre-build the commit plan ranges.
    #[profiling::function]
    pub fn validate(&mut self) -> Result<ValidationChanges, HwcError> {
        self.geometry_changed |= self.common.take_device_geometry();
        let layers = self.layers.clone();
        let mut layers = layers.write();
        for layer in layers.iter_mut() {
            self.geometry_changed |= layer.geometry_changed;
            layer.geometry_changed = GeometryChanged::empty();
            layer.validation_reason = None;
        }
        layers.sort_by_z();

        if !self.powered || !self.plugged {
            debug!(display = %self.name, "validate on inactive display");
            let released = self.regions.reset_ranges();
            self.release_planes(released);
            self.state = RenderingState::Validated;
            return Ok(ValidationChanges::default());
        }

        self.had_resource_error = false;
        if self.assign_paths(&mut layers).is_err() {
            self.force_client_fallback(&mut layers);
        }

        // Composition targets need planes of their own.
        if self.regions.client.has_layers && self.regions.client.plane.is_none() {
            self.regions.client.plane = self.arbiter.claim_plane();
            if self.regions.client.plane.is_none() {
                self.force_client_fallback(&mut layers);
            }
        }
        if self.regions.blender.has_layers && self.regions.blender.plane.is_none() {
            self.regions.blender.plane = self.arbiter.claim_plane();
            if self.regions.blender.plane.is_none() {
                self.force_client_fallback(&mut layers);
            }
        }

        let skip_feature = self.common.config.controls.skip_static_layers
            && !self.geometry_changed.contains(GeometryChanged::ERROR_CASE);
        evaluate_static_skip(
            &mut self.regions.client,
            &layers,
            skip_feature,
            self.had_resource_error,
        );

        let mut changes = ValidationChanges::default();
        for (index, layer) in layers.iter().enumerate() {
            if layer.validated_type != layer.requested_type {
                changes.types_changed += 1;
            }
            if self.regions.client.contains(index) && layer.needs_clear_client_target() {
                changes.requests += 1;
            }
        }

        self.geometry_changed = GeometryChanged::empty();
        self.state = RenderingState::Validated;
        debug!(
            display = %self.name,
            types_changed = changes.types_changed,
            requests = changes.requests,
            client = ?self.regions.client.range(),
            blender = ?self.regions.blender.range(),
            "validated frame"
        );
        Ok(changes)
    }

    /// Layers whose validated type differs from what the client asked for.
    pub fn changed_composition_types(&self) -> Vec<(LayerId, CompositionType)> {
        self.layers
            .read()
            .iter()
            .filter(|layer| layer.validated_type != layer.requested_type)
            .map(|layer| (layer.id, layer.validated_type))
            .collect()
    }

    pub fn display_requests(&self) -> Vec<(LayerId, DisplayRequest)> {
        let layers = self.layers.read();
        layers
            .iter()
            .enumerate()
            .filter(|(index, layer)| {
                self.regions.client.contains(*index) && layer.needs_clear_client_target()
            })
            .map(|(_, layer)| (layer.id, DisplayRequest::ClearClientTarget))
            .collect()
    }

    pub fn accept_display_changes(&mut self) -> Result<(), HwcError> {
        if self.state != RenderingState::Validated {
            warn!(display = %self.name, state = ?self.state, "accept without validate");
            return Err(HwcError::NotValidated);
        }
        for layer in self.layers.write().iter_mut() {
            layer.committed_type = layer.validated_type;
        }
        self.state = RenderingState::AcceptedChange;
        Ok(())
    }

    /// Commit the accepted frame. Always ends in `Presented` except for
    /// the skip-validate refusal, which leaves state untouched so the
    /// caller can run a full validate instead.
    #[profiling::function]
    pub fn present(&mut self) -> Result<Option<Fence>, HwcError> {
        match self.state {
            RenderingState::AcceptedChange => {}
            RenderingState::None | RenderingState::Presented => {
                self.geometry_changed |= self.common.take_device_geometry();
                let check = {
                    let layers = self.layers.read();
                    let pending = self.has_pending_request(&layers);
                    can_skip_validate(
                        self.common.config.controls.skip_validate,
                        self.first_frame,
                        self.geometry_changed,
                        &self.regions.client,
                        &layers,
                        pending,
                    )
                };
                if check != SkipValidateCheck::Ok {
                    trace!(display = %self.name, ?check, "cannot skip validate");
                    return Err(HwcError::NotValidated);
                }
                debug!(display = %self.name, "presenting on the validate fast path");
            }
            RenderingState::Validated => {
                warn!(display = %self.name, "present without accept");
                return Err(HwcError::NotValidated);
            }
        }

        if !self.powered || !self.plugged || self.skip_frame {
            debug!(
                display = %self.name,
                powered = self.powered,
                plugged = self.plugged,
                skip_frame = self.skip_frame,
                "skipping frame"
            );
            self.skip_frame = false;
            self.close_frame_fences();
            self.state = RenderingState::Presented;
            return Ok(None);
        }

        // An empty stack renders as blank, not as a failed frame.
        if self.layers.read().is_empty() {
            debug!(display = %self.name, "no layers, blanking the display");
            let cleared = self.clear_display();
            self.state = RenderingState::Presented;
            return cleared.map(|_| None);
        }

        self.wait_for_last_retire();

        let result = self.commit_frame();
        match result {
            Ok(retire) => {
                self.first_frame = false;
                self.state = RenderingState::Presented;
                self.common.hints.signal_non_idle();
                self.audit_fences();
                Ok(retire)
            }
            Err(err) => {
                error!(display = %self.name, %err, "present failed, abandoning frame");
                // Blank rather than leave a partial composite on screen.
                if let Err(clear_err) = self.clear_display() {
                    error!(display = %self.name, %clear_err, "clear after failed present also failed");
                }
                self.geometry_changed |=
                    GeometryChanged::FORCE_VALIDATE | GeometryChanged::ERROR_CASE;
                self.state = RenderingState::Presented;
                self.audit_fences();
                Err(err)
            }
        }
    }

    /// Blank the display, e.g. before power-off.
    pub fn clear_display(&mut self) -> Result<(), HwcError> {
        self.model.reset();
        self.close_frame_fences();
        self.last_model = None;
        self.sink.clear()?;
        Ok(())
    }

    /// Take the per-layer release fences produced by the last present.
    pub fn take_release_fences(&mut self) -> Vec<(LayerId, Fence)> {
        self.layers
            .write()
            .iter_mut()
            .filter_map(|layer| layer.release_fence.take().map(|fence| (layer.id, fence)))
            .collect()
    }

    fn assign_paths(&mut self, layers: &mut LayerSet) -> Result<(), HwcError> {
        let released = self.regions.reset_ranges();
        self.release_planes(released);
        self.arbiter.begin_frame();
        for layer in layers.iter_mut() {
            layer.validated_type = CompositionType::Invalid;
            layer.path = AssignedPath::None;
            layer.window_index = None;
        }

        let blender_config = self.arbiter.blender();
        for index in 0..layers.len() {
            let requested = layers
                .get(index)
                .ok_or(HwcError::InvalidIndex)?
                .requested_type;
            if requested == CompositionType::Client {
                let update = self.regions.add_client(layers, index, None)?;
                self.release_planes(update.released);
                continue;
            }

            let used = self.blender_capacity_used(layers);
            let decision = {
                let layer = layers.get(index).ok_or(HwcError::InvalidIndex)?;
                self.arbiter.decide(layer, used)
            };
            let update: RegionUpdate = match decision {
                PathDecision::Overlay(plane) => {
                    let layer = layers.get_mut(index).ok_or(HwcError::InvalidIndex)?;
                    layer.path = AssignedPath::Overlay(plane);
                    layer.update_validated_type(requested, None);
                    continue;
                }
                PathDecision::Blender => {
                    let config = blender_config.as_ref().ok_or(HwcError::MissingResource)?;
                    let update =
                        self.regions
                            .add_blender(layers, index, config, &*self.arbiter, used)?;
                    if layers
                        .get(index)
                        .map(|l| l.validated_type == CompositionType::Blender)
                        .unwrap_or(false)
                    {
                        if let Some(layer) = layers.get_mut(index) {
                            layer.path = AssignedPath::Blender;
                        }
                    }
                    update
                }
                PathDecision::Client => self.regions.add_client(
                    layers,
                    index,
                    Some(ValidationReason::ResourceAssignFail),
                )?,
            };
            self.release_planes(update.released);
        }
        Ok(())
    }

    /// Full recovery: everything to the client path, from a clean slate.
    fn force_client_fallback(&mut self, layers: &mut LayerSet) {
        warn!(display = %self.name, "resource assignment failed, forcing client composition");
        self.had_resource_error = true;
        let released = self.regions.reset_ranges();
        self.release_planes(released);
        self.arbiter.begin_frame();
        for layer in layers.iter_mut() {
            layer.update_validated_type(
                CompositionType::Client,
                Some(ValidationReason::ResourceAssignFail),
            );
            layer.path = AssignedPath::None;
            layer.window_index = None;
        }
        if !layers.is_empty() {
            self.regions.client.has_layers = true;
            self.regions.client.first = 0;
            self.regions.client.last = layers.len() - 1;
        }
        self.regions.client.plane = self.arbiter.claim_plane();
    }

    fn blender_capacity_used(&self, layers: &LayerSet) -> f32 {
        layers
            .iter()
            .filter(|layer| layer.validated_type == CompositionType::Blender)
            .map(|layer| self.arbiter.blender_load(layer))
            .sum()
    }

    fn release_planes(&mut self, planes: SmallVec<[PlaneId; 2]>) {
        for plane in planes {
            self.arbiter.release_plane(plane);
        }
    }

    fn has_pending_request(&self, layers: &LayerSet) -> bool {
        layers.iter().enumerate().any(|(index, layer)| {
            self.regions.client.contains(index) && layer.needs_clear_client_target()
        })
    }

    fn restrictions_for(&self, layer: &Layer) -> dpu_comp_config::SizeRestriction {
        let class = layer
            .buffer
            .as_ref()
            .map(|buffer| buffer.format.class())
            .unwrap_or(FormatClass::Rgb);
        self.arbiter.restrictions(class)
    }

    /// Build the slot plan, hand it to the sink and fan the returned
    /// fences out to the layers.
    fn commit_frame(&mut self) -> Result<Option<Fence>, HwcError> {
        let layers = self.layers.clone();
        let mut layers = layers.write();
        self.model.reset();

        let mut slot = 0usize;
        let mut client_slot = None;
        let mut blender_slot = None;
        for index in 0..layers.len() {
            let validated = layers
                .get(index)
                .ok_or(HwcError::InvalidIndex)?
                .validated_type;
            match validated {
                CompositionType::Client => {
                    if client_slot.is_some() {
                        continue;
                    }
                    let merged = self.merged_frame(&layers, &self.regions.client);
                    let plane = self.regions.client.plane.ok_or(HwcError::MissingResource)?;
                    let restriction = self.arbiter.restrictions(FormatClass::Rgb);
                    self.model.configure_target(
                        &mut self.regions.client,
                        slot,
                        plane,
                        merged,
                        &restriction,
                    )?;
                    if self.regions.client.skip_flag {
                        self.substitute_static_slot(slot)?;
                    }
                    client_slot = Some(slot);
                    slot += 1;
                }
                CompositionType::Blender => {
                    if blender_slot.is_some() {
                        continue;
                    }
                    self.rotate_blender_target();
                    let merged = self.merged_frame(&layers, &self.regions.blender);
                    let plane = self
                        .regions
                        .blender
                        .plane
                        .ok_or(HwcError::MissingResource)?;
                    let restriction = self.arbiter.restrictions(FormatClass::Rgb);
                    self.model.configure_target(
                        &mut self.regions.blender,
                        slot,
                        plane,
                        merged,
                        &restriction,
                    )?;
                    blender_slot = Some(slot);
                    slot += 1;
                }
                CompositionType::Invalid => return Err(HwcError::NotValidated),
                _ => {
                    let restriction = {
                        let layer = layers.get(index).ok_or(HwcError::InvalidIndex)?;
                        self.restrictions_for(layer)
                    };
                    let layer = layers.get_mut(index).ok_or(HwcError::InvalidIndex)?;
                    let AssignedPath::Overlay(plane) = layer.path else {
                        return Err(HwcError::MissingResource);
                    };
                    self.model.configure_layer(layer, slot, plane, &restriction)?;
                    slot += 1;
                }
            }
        }

        self.model.validate()?;

        // An unchanged plan skips the hardware commit entirely; the
        // previous retire fence stands in for the new one.
        let skip_commit = self.common.config.controls.skip_window_config
            && !*self.common.multi_display.lock()
            && self
                .last_model
                .as_ref()
                .map(|last| !self.model.changed_from(last))
                .unwrap_or(false);
        if skip_commit {
            trace!(display = %self.name, "window config unchanged, skipping commit");
            for config in &mut self.model.configs {
                config.acquire_fence = None;
            }
            let retire = self.last_retire.as_ref().map(|fence| fence.dup());
            self.fan_out_releases_from_retire(&mut layers);
            self.last_model = Some(self.model.save());
            return Ok(retire);
        }

        self.model.compute_window_update(self.last_model.as_ref());
        if let Some(refined) = self.damage_refined_update(&layers) {
            self.model.window_update = Some(refined);
        }
        let mut feedback = self.sink.commit(&mut self.model)?;

        for (index, layer_slot) in self.slot_of_each_layer(&layers, client_slot, blender_slot) {
            let release = layer_slot
                .and_then(|s| feedback.releases.get(s))
                .and_then(|fence| fence.as_ref())
                .map(|fence| fence.dup());
            if let Some(layer) = layers.get_mut(index) {
                layer.release_fence = release;
            }
        }

        // Anything still holding an acquire fence here was not consumed by
        // the commit; close it rather than leak it.
        for layer in layers.iter_mut() {
            if layer.acquire_fence.take().is_some() {
                debug!(display = %self.name, id = ?layer.id, "closing unconsumed acquire fence");
            }
        }

        let retire = feedback.retire.take();
        self.last_retire = retire.as_ref().map(|fence| fence.dup());
        self.last_model = Some(self.model.save());
        Ok(retire)
    }

    /// Slot index each layer's release fence comes from: members of a
    /// composition range share their target's slot, overlays own theirs.
    fn slot_of_each_layer(
        &self,
        layers: &LayerSet,
        client_slot: Option<usize>,
        blender_slot: Option<usize>,
    ) -> Vec<(usize, Option<usize>)> {
        layers
            .iter()
            .enumerate()
            .map(|(index, layer)| {
                let slot = match layer.validated_type {
                    CompositionType::Client => client_slot,
                    CompositionType::Blender => blender_slot,
                    _ => layer.window_index,
                };
                (index, slot)
            })
            .collect()
    }

    /// Merged per-layer damage in display coordinates, usable as the
    /// window-update rect. Only sound for content-only frames: a slot
    /// whose state or geometry differs from last frame, an active static
    /// skip, or a layer without a usable damage list all fall back to the
    /// slot-diff union.
    fn damage_refined_update(&self, layers: &LayerSet) -> Option<Rect> {
        let previous = self.last_model.as_ref()?;
        if self.regions.client.skip_flag || self.regions.blender.skip_flag {
            return None;
        }
        for (index, config) in self.model.configs.iter().enumerate() {
            let saved = previous.windows.get(index)?;
            let mut now = SavedWindow::of(config);
            now.buffer_id = saved.buffer_id;
            if now != *saved {
                return None;
            }
        }
        let mut merged = Rect::default();
        for layer in layers.iter() {
            match layers.region_for(layer) {
                DamageKind::Skip => {}
                DamageKind::Partial(rect) => {
                    let frame = &layer.display_frame;
                    merged = merged.union(&Rect::new(
                        frame.x + rect.x,
                        frame.y + rect.y,
                        rect.w.min(frame.w),
                        rect.h.min(frame.h),
                    ));
                }
                DamageKind::Full | DamageKind::Error => return None,
            }
        }
        let merged = merged.clipped_to_display(self.width, self.height);
        (!merged.is_empty()).then_some(merged)
    }

    /// Point the blender at the next buffer of the display-owned pool.
    /// The blender produces fresh output every committed frame, so the
    /// buffer id changing per frame is what keeps change detection honest.
    fn rotate_blender_target(&mut self) {
        if self.blender_target_external {
            return;
        }
        if self.blender_targets.is_empty() {
            self.blender_targets = (0..BLENDER_TARGET_BUFS as u64)
                .map(|n| {
                    // Ids only need to be distinct within this display's plan.
                    GraphicBuffer::new(u64::MAX - n, self.width, self.height, Format::Argb8888)
                })
                .collect();
        }
        self.blender_target_flip = (self.blender_target_flip + 1) % self.blender_targets.len();
        let target = self.blender_targets[self.blender_target_flip].clone();
        let color_space = self.regions.blender.color_space;
        self.regions.blender.set_target(Some(target), None, color_space);
    }

    fn fan_out_releases_from_retire(&self, layers: &mut LayerSet) {
        for layer in layers.iter_mut() {
            layer.release_fence = self
                .last_retire
                .as_ref()
                .map(|fence| fence.dup_as(FenceKind::SrcRelease));
            layer.acquire_fence = None;
        }
    }

    /// Replace the freshly configured client-target slot with the one
    /// committed last frame; the buffer content is provably identical.
    fn substitute_static_slot(&mut self, slot: usize) -> Result<(), HwcError> {
        let Some(last) = &self.last_model else {
            return Ok(());
        };
        let Some(saved) = last
            .windows
            .get(slot)
            .filter(|window| window.state == WindowState::Buffer)
        else {
            return Ok(());
        };
        let live = self
            .model
            .configs
            .get(slot)
            .and_then(|config| config.buffer_id);
        if live.is_some() && live != saved.buffer_id {
            warn!(
                display = %self.name,
                slot,
                "client target changed under static skip, keeping the fresh slot"
            );
            self.regions.client.skip_flag = false;
            return Ok(());
        }
        trace!(display = %self.name, slot, "static skip, replaying client target slot");
        let saved = saved.clone();
        self.model.restore_slot(slot, &saved)
    }

    /// Union of the display frames of a composition range's members,
    /// minus nothing: punch-through holes stay inside the union.
    fn merged_frame(&self, layers: &LayerSet, info: &regions::CompositionInfo) -> Rect {
        let Some((first, last)) = info.range() else {
            return Rect::from_size(self.width, self.height);
        };
        let mut merged = Rect::default();
        for index in first..=last {
            if let Some(layer) = layers.get(index) {
                merged = merged.union(&layer.display_frame);
            }
        }
        if merged.is_empty() {
            Rect::from_size(self.width, self.height)
        } else {
            merged
        }
    }

    /// Bounded wait for the previous frame's retire fence. A stuck fence
    /// is logged and the frame proceeds anyway.
    fn wait_for_last_retire(&self) {
        let Some(retire) = &self.last_retire else {
            return;
        };
        let vsync = Duration::from_nanos(self.common.config.hardware.vsync_period_ns);
        if retire.wait(vsync * RETIRE_WAIT_VSYNCS) == WaitStatus::TimedOut {
            error!(display = %self.name, "retire fence not signaled after {RETIRE_WAIT_VSYNCS} vsyncs");
            if retire.wait(vsync) == WaitStatus::TimedOut {
                error!(display = %self.name, "retire fence still pending, continuing without it");
            }
        }
    }

    /// Close every fence the frame still owns.
    fn close_frame_fences(&mut self) {
        for layer in self.layers.write().iter_mut() {
            if layer.acquire_fence.take().is_some() {
                debug!(display = %self.name, id = ?layer.id, "closing acquire fence of skipped frame");
            }
            layer.release_fence = None;
        }
        self.regions.client.acquire_fence = None;
        self.regions.blender.acquire_fence = None;
    }

    fn audit_fences(&self) {
        let open = self.ledger.outstanding_of(FenceKind::SrcAcquire);
        if open > 0 {
            error!(display = %self.name, open, "acquire fences left open after present");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::software::{SoftArbiter, SoftwareSink};
    use crate::backend::{Format, PathCaps};
    use dpu_comp_config::DpuCompConfig;

    fn display_with(config: DpuCompConfig) -> Display {
        let common = Common::new(config);
        let arbiter = SoftArbiter::new(&common.config.hardware);
        let sink = SoftwareSink::new();
        let mut display = Display::new("primary", common, Box::new(sink), Box::new(arbiter));
        // Tests want real commits from the first frame.
        display.skip_frame = false;
        display
    }

    fn display() -> Display {
        display_with(DpuCompConfig::default())
    }

    fn push_layer(display: &mut Display, z: u32, ty: CompositionType) -> LayerId {
        let id = display.create_layer();
        let layers = display.layers();
        let mut layers = layers.write();
        let layer = layers.by_id_mut(id).unwrap();
        layer.set_z(z);
        layer.requested_type = ty;
        layer.supported_paths = PathCaps::OVERLAY | PathCaps::BLENDER;
        layer.set_display_frame(Rect::new(0, (z as i32) * 100, 200, 100));
        layer.src_crop = Rect::new(0, 0, 200, 100);
        layer.set_buffer(
            Some(GraphicBuffer::new(1000 + z as u64, 200, 100, Format::Argb8888)),
            None,
        );
        id
    }

    fn attach_client_target(display: &mut Display) {
        display.set_client_target(
            Some(GraphicBuffer::new(1, 1440, 3120, Format::Argb8888)),
            None,
            ColorSpace::Srgb,
        );
    }

    #[test]
    fn accept_requires_validated_state() {
        let mut display = display();
        push_layer(&mut display, 0, CompositionType::Device);
        assert!(matches!(
            display.accept_display_changes(),
            Err(HwcError::NotValidated)
        ));
        // No layer state was mutated by the failed accept.
        let layers = display.layers();
        assert_eq!(
            layers.read().get(0).unwrap().committed_type,
            CompositionType::Invalid
        );

        display.validate().unwrap();
        assert!(display.accept_display_changes().is_ok());
        assert_eq!(display.state(), RenderingState::AcceptedChange);
    }

    #[test]
    fn present_without_accept_is_rejected() {
        let mut display = display();
        push_layer(&mut display, 0, CompositionType::Device);
        display.validate().unwrap();
        assert!(matches!(display.present(), Err(HwcError::NotValidated)));
        // The refusal leaves the state machine where it was.
        assert_eq!(display.state(), RenderingState::Validated);
    }

    #[test]
    fn overlay_frame_end_to_end() {
        let mut display = display();
        push_layer(&mut display, 2, CompositionType::Device);
        push_layer(&mut display, 0, CompositionType::Device);
        push_layer(&mut display, 1, CompositionType::Device);

        let changes = display.validate().unwrap();
        assert_eq!(changes.types_changed, 0);
        display.accept_display_changes().unwrap();
        let retire = display.present().unwrap();
        assert!(retire.is_some());
        assert_eq!(display.state(), RenderingState::Presented);

        let releases = display.take_release_fences();
        assert_eq!(releases.len(), 3);
    }

    #[test]
    fn blender_frame_end_to_end() {
        let mut display = display();
        push_layer(&mut display, 2, CompositionType::Device);
        push_layer(&mut display, 0, CompositionType::Device);
        let video = push_layer(&mut display, 1, CompositionType::Device);
        {
            let layers = display.layers();
            let mut layers = layers.write();
            // The 2D blender is this layer's only option.
            layers.by_id_mut(video).unwrap().supported_paths = PathCaps::BLENDER;
        }

        let changes = display.validate().unwrap();
        assert_eq!(changes.types_changed, 1);
        assert_eq!(display.regions.blender.range(), Some((1, 1)));
        {
            let layers = display.layers();
            let layers = layers.read();
            assert!(layers
                .iter()
                .all(|layer| layer.validated_type != CompositionType::Client));
            assert_eq!(
                layers
                    .iter()
                    .filter(|layer| matches!(layer.path, AssignedPath::Overlay(_)))
                    .count(),
                2
            );
        }

        display.accept_display_changes().unwrap();
        let retire = display.present().unwrap();
        assert!(retire.is_some());
        assert_eq!(display.state(), RenderingState::Presented);

        // Two overlay slots plus the blender output slot made it to the
        // committed plan.
        let enabled = display
            .model
            .configs
            .iter()
            .filter(|c| c.state != WindowState::Disabled)
            .count();
        assert_eq!(enabled, 3);
        assert_eq!(display.take_release_fences().len(), 3);
    }

    #[test]
    fn blender_target_pool_rotates_between_frames() {
        let mut display = display();
        let video = push_layer(&mut display, 0, CompositionType::Device);
        {
            let layers = display.layers();
            let mut layers = layers.write();
            layers.by_id_mut(video).unwrap().supported_paths = PathCaps::BLENDER;
        }

        let mut seen = Vec::new();
        for frame in 0..2u64 {
            {
                let layers = display.layers();
                let mut layers = layers.write();
                let layer = layers.by_id_mut(video).unwrap();
                layer.set_buffer(
                    Some(GraphicBuffer::new(500 + frame, 200, 100, Format::Argb8888)),
                    None,
                );
            }
            display.validate().unwrap();
            display.accept_display_changes().unwrap();
            display.present().unwrap();
            seen.push(display.regions.blender.target.as_ref().unwrap().id);
        }
        // Consecutive frames never write into the buffer still on screen.
        assert_ne!(seen[0], seen[1]);
    }

    #[test]
    fn empty_layer_list_blanks_the_display() {
        let mut display = display();
        display.validate().unwrap();
        display.accept_display_changes().unwrap();
        let retire = display.present().unwrap();
        assert!(retire.is_none());
        assert_eq!(display.state(), RenderingState::Presented);
    }

    #[test]
    fn inactive_display_validates_to_nothing() {
        let mut display = display();
        push_layer(&mut display, 0, CompositionType::Device);
        display.set_powered(false);
        let changes = display.validate().unwrap();
        assert_eq!(changes, ValidationChanges::default());
        assert_eq!(display.regions.client.range(), None);
        assert_eq!(display.regions.blender.range(), None);
    }

    #[test]
    fn client_layers_share_one_window() {
        let mut display = display();
        attach_client_target(&mut display);
        push_layer(&mut display, 0, CompositionType::Client);
        push_layer(&mut display, 1, CompositionType::Client);
        push_layer(&mut display, 2, CompositionType::Device);

        display.validate().unwrap();
        display.accept_display_changes().unwrap();
        display.present().unwrap();

        let enabled = display
            .model
            .configs
            .iter()
            .filter(|c| c.state != WindowState::Disabled)
            .count();
        assert_eq!(enabled, 2);
    }

    #[test]
    fn validate_twice_is_idempotent() {
        let mut display = display();
        attach_client_target(&mut display);
        push_layer(&mut display, 0, CompositionType::Client);
        push_layer(&mut display, 1, CompositionType::Device);

        display.validate().unwrap();
        let first_client = display.regions.client.range();
        let first_blender = display.regions.blender.range();

        display.validate().unwrap();
        assert_eq!(display.regions.client.range(), first_client);
        assert_eq!(display.regions.blender.range(), first_blender);
    }

    #[test]
    fn plane_exhaustion_forces_client_fallback() {
        let mut config = DpuCompConfig::default();
        config.hardware.plane_count = 1;
        let mut display = display_with(config);
        attach_client_target(&mut display);
        for z in 0..4 {
            push_layer(&mut display, z, CompositionType::Device);
        }

        let changes = display.validate().unwrap();
        assert!(changes.types_changed > 0);
        let layers = display.layers();
        let layers = layers.read();
        // Full recovery, never partial: every layer went client.
        assert!(layers
            .iter()
            .all(|layer| layer.validated_type == CompositionType::Client));
        assert_eq!(display.regions.client.range(), Some((0, 3)));
    }

    #[test]
    fn presented_frame_closes_all_acquire_fences() {
        let mut display = display();
        let id = push_layer(&mut display, 0, CompositionType::Device);
        {
            let layers = display.layers();
            let mut layers = layers.write();
            let layer = layers.by_id_mut(id).unwrap();
            let fence = Fence::signaled(&display.ledger, FenceKind::SrcAcquire);
            layer.acquire_fence = Some(fence);
        }
        display.validate().unwrap();
        display.accept_display_changes().unwrap();
        display.present().unwrap();
        assert_eq!(display.ledger.outstanding_of(FenceKind::SrcAcquire), 0);
    }

    #[test]
    fn powered_off_present_skips_but_completes() {
        let mut display = display();
        push_layer(&mut display, 0, CompositionType::Device);
        display.validate().unwrap();
        display.accept_display_changes().unwrap();
        display.set_powered(false);
        let retire = display.present().unwrap();
        assert!(retire.is_none());
        assert_eq!(display.state(), RenderingState::Presented);
    }

    #[test]
    fn unchanged_frame_skips_the_commit() {
        let mut display = display();
        push_layer(&mut display, 0, CompositionType::Device);

        display.validate().unwrap();
        display.accept_display_changes().unwrap();
        display.present().unwrap();

        // Same geometry again: the fast path replays without validate.
        let retire = display.present().unwrap();
        assert!(retire.is_some());
        let releases = display.take_release_fences();
        assert_eq!(releases.len(), 1);
    }

    #[test]
    fn content_only_frame_narrows_the_window_update() {
        let mut display = display();
        let flipping = push_layer(&mut display, 0, CompositionType::Device);
        let steady = push_layer(&mut display, 1, CompositionType::Device);

        display.validate().unwrap();
        display.accept_display_changes().unwrap();
        display.present().unwrap();

        {
            let layers = display.layers();
            let mut layers = layers.write();
            let layer = layers.by_id_mut(flipping).unwrap();
            layer.set_buffer(
                Some(GraphicBuffer::new(2000, 200, 100, Format::Argb8888)),
                None,
            );
            layer.set_damage(&[Rect::new(10, 10, 20, 20)]);
            // An explicit empty damage list means nothing changed.
            let layer = layers.by_id_mut(steady).unwrap();
            layer.set_damage(&[Rect::default()]);
        }
        display.validate().unwrap();
        display.accept_display_changes().unwrap();
        display.present().unwrap();

        assert_eq!(display.model.window_update, Some(Rect::new(10, 10, 20, 20)));
    }

    #[test]
    fn sandwiched_blender_layer_ends_up_client() {
        let mut display = display();
        attach_client_target(&mut display);
        push_layer(&mut display, 0, CompositionType::Client);
        let mid = push_layer(&mut display, 1, CompositionType::Device);
        {
            let layers = display.layers();
            let mut layers = layers.write();
            let layer = layers.by_id_mut(mid).unwrap();
            // Only blender-capable, and scaled, so the arbiter cannot put
            // it on a plane.
            layer.supported_paths = PathCaps::BLENDER;
        }
        push_layer(&mut display, 2, CompositionType::Client);

        let changes = display.validate().unwrap();
        assert!(changes.types_changed >= 1);
        let layers = display.layers();
        let layers = layers.read();
        assert_eq!(
            layers.get(1).unwrap().validated_type,
            CompositionType::Client
        );
        assert_eq!(display.regions.client.range(), Some((0, 2)));
    }
}
