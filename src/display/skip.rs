// SPDX-License-Identifier: GPL-3.0-only

//! Static-layer skip and the validate fast path.
//!
//! When the client composition's member layers are provably unchanged the
//! previous client target buffer can be scanned out again without a GPU
//! pass. A second, cheaper check decides whether the whole validate step
//! can be skipped for the frame.

use crate::{
    backend::{BlendMode, ColorSpace, Transform},
    display::{
        layers::{CompositionType, LayerSet},
        regions::CompositionInfo,
    },
    state::GeometryChanged,
    utils::geometry::Rect,
};

/// Snapshot capacity. Client ranges wider than this are never skipped.
pub const NUM_SKIP_STATIC_LAYER: usize = 5;

/// Per-layer geometry snapshot taken when the skip window opens.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SnapshotEntry {
    pub buffer_id: Option<u64>,
    pub src_crop: Rect,
    pub display_frame: Rect,
    pub blend: BlendMode,
    pub transform: Transform,
    pub plane_alpha: f32,
    pub color_space: ColorSpace,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StaticSkip {
    Enabled,
    Disabled,
}

/// Reason the validate fast path cannot be taken. `Ok` means the frame
/// may go straight to present.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SkipValidateCheck {
    Disabled,
    FirstFrame,
    GeometryChanged,
    HasClientComposition,
    SkipStaticChanged,
    HasPendingRequest,
    InvalidClientTargetBuffer,
    Ok,
}

fn snapshot_of(layers: &LayerSet, first: usize, last: usize) -> Option<Vec<SnapshotEntry>> {
    let mut entries = Vec::with_capacity(last - first + 1);
    for i in first..=last {
        let layer = layers.get(i)?;
        entries.push(SnapshotEntry {
            buffer_id: layer.buffer_id(),
            src_crop: layer.src_crop,
            display_frame: layer.display_frame,
            blend: layer.blend,
            transform: layer.transform,
            plane_alpha: layer.plane_alpha,
            color_space: layer.color_space,
        });
    }
    Some(entries)
}

/// Evaluate the static-layer skip for the client composition.
///
/// First eligible pass caches the member snapshot and arms `skip_init`;
/// the next pass compares live state against the cache and enables
/// `skip_flag` on a full match. Any mismatch re-arms from scratch.
pub fn evaluate_static_skip(
    info: &mut CompositionInfo,
    layers: &LayerSet,
    feature_enabled: bool,
    had_resource_error: bool,
) -> StaticSkip {
    if !feature_enabled || had_resource_error {
        info.skip_flag = false;
        info.skip_init = false;
        info.snapshot.clear();
        return StaticSkip::Disabled;
    }
    let Some((first, last)) = info.range() else {
        info.skip_flag = false;
        info.skip_init = false;
        return StaticSkip::Disabled;
    };
    if last >= layers.len() || last - first + 1 > NUM_SKIP_STATIC_LAYER {
        info.skip_flag = false;
        info.skip_init = false;
        return StaticSkip::Disabled;
    }

    if info.skip_init {
        let matches = info.snapshot.len() == last - first + 1
            && (first..=last).zip(info.snapshot.iter()).all(|(i, cached)| {
                layers
                    .get(i)
                    .map(|layer| {
                        layer.validated_type == CompositionType::Client
                            && cached.buffer_id == layer.buffer_id()
                            && cached.src_crop == layer.src_crop
                            && cached.display_frame == layer.display_frame
                            && cached.blend == layer.blend
                            && cached.transform == layer.transform
                            && cached.plane_alpha == layer.plane_alpha
                            && cached.color_space == layer.color_space
                    })
                    .unwrap_or(false)
            });
        if matches {
            info.skip_flag = true;
            return StaticSkip::Enabled;
        }
        info.skip_flag = false;
    }

    // Arm the window: cache now, decide next pass.
    match snapshot_of(layers, first, last) {
        Some(snapshot) => {
            info.snapshot = snapshot;
            info.skip_init = true;
        }
        None => {
            info.snapshot.clear();
            info.skip_init = false;
        }
    }
    info.skip_flag = false;
    StaticSkip::Disabled
}

/// Decide whether a full validate pass can be bypassed this frame.
pub fn can_skip_validate(
    feature_enabled: bool,
    first_frame: bool,
    geometry_changed: GeometryChanged,
    client: &CompositionInfo,
    layers: &LayerSet,
    has_pending_request: bool,
) -> SkipValidateCheck {
    if !feature_enabled {
        return SkipValidateCheck::Disabled;
    }
    if first_frame {
        return SkipValidateCheck::FirstFrame;
    }
    if !geometry_changed.is_empty() {
        return SkipValidateCheck::GeometryChanged;
    }
    if has_pending_request {
        return SkipValidateCheck::HasPendingRequest;
    }
    if client.has_layers {
        // A live client range is only safe to replay under static skip,
        // and only with a target buffer to scan out.
        if !client.skip_flag {
            return SkipValidateCheck::HasClientComposition;
        }
        if client.target.is_none() {
            return SkipValidateCheck::InvalidClientTargetBuffer;
        }
        let (first, last) = (client.first, client.last);
        let unchanged = last < layers.len()
            && (first..=last).zip(client.snapshot.iter()).all(|(i, cached)| {
                layers
                    .get(i)
                    .map(|layer| cached.buffer_id == layer.buffer_id())
                    .unwrap_or(false)
            });
        if !unchanged {
            return SkipValidateCheck::SkipStaticChanged;
        }
    }
    SkipValidateCheck::Ok
}
