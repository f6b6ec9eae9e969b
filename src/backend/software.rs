// SPDX-License-Identifier: GPL-3.0-only

//! Software stand-ins for the kernel driver collaborators. Used by the
//! headless frame simulation and by tests; everything completes
//! synchronously.

use std::sync::Arc;

use dpu_comp_config::{BlenderConfig, HardwareConfig, SizeRestriction};
use tracing::trace;

use crate::{
    backend::{
        CommitError, CommitFeedback, CommitSink, FormatClass, PathCaps, PathDecision, PlaneId,
        ResourceArbiter,
    },
    display::{
        commit::{FrameCommitModel, WindowState},
        layers::Layer,
    },
    fence::{Fence, FenceKind, FenceLedger},
};

/// Greedy first-fit plane arbiter with a simple blender capacity model.
#[derive(Debug)]
pub struct SoftArbiter {
    plane_free: Vec<bool>,
    blender: Option<BlenderConfig>,
    restrictions_rgb: SizeRestriction,
    restrictions_yuv: SizeRestriction,
}

impl SoftArbiter {
    pub fn new(hardware: &HardwareConfig) -> SoftArbiter {
        SoftArbiter {
            plane_free: vec![true; hardware.plane_count],
            blender: hardware.blender,
            restrictions_rgb: hardware.restrictions_rgb,
            restrictions_yuv: hardware.restrictions_yuv,
        }
    }

    fn scaled(layer: &Layer) -> bool {
        layer.src_crop.w != layer.display_frame.w || layer.src_crop.h != layer.display_frame.h
    }
}

impl ResourceArbiter for SoftArbiter {
    fn begin_frame(&mut self) {
        self.plane_free.fill(true);
    }

    fn plane_count(&self) -> usize {
        self.plane_free.len()
    }

    fn blender(&self) -> Option<BlenderConfig> {
        self.blender
    }

    fn restrictions(&self, class: FormatClass) -> SizeRestriction {
        match class {
            FormatClass::Rgb => self.restrictions_rgb,
            FormatClass::Yuv => self.restrictions_yuv,
        }
    }

    fn decide(&mut self, layer: &Layer, used_blender_capacity: f32) -> PathDecision {
        // Planes cannot scale; scaled or plane-incapable layers need a
        // blend pass.
        let plane_ok = layer.supported_paths.contains(PathCaps::OVERLAY) && !Self::scaled(layer);
        if plane_ok {
            if let Some(plane) = self.claim_plane() {
                return PathDecision::Overlay(plane);
            }
        }
        if layer.supported_paths.contains(PathCaps::BLENDER)
            && self.is_blender_assignable(layer, used_blender_capacity)
        {
            return PathDecision::Blender;
        }
        PathDecision::Client
    }

    fn claim_plane(&mut self) -> Option<PlaneId> {
        let index = self.plane_free.iter().position(|free| *free)?;
        self.plane_free[index] = false;
        Some(PlaneId(index))
    }

    fn release_plane(&mut self, plane: PlaneId) {
        if let Some(free) = self.plane_free.get_mut(plane.0) {
            *free = true;
        }
    }

    fn is_blender_assignable(&self, layer: &Layer, used_capacity: f32) -> bool {
        match &self.blender {
            Some(config) => used_capacity + self.blender_load(layer) <= config.capacity,
            None => false,
        }
    }

    fn blender_load(&self, layer: &Layer) -> f32 {
        // Scaling costs more than a straight blit.
        if Self::scaled(layer) {
            2.0
        } else {
            1.0
        }
    }
}

/// Commit sink that scans out nowhere. Fences signal immediately.
pub struct SoftwareSink {
    ledger: Option<Arc<FenceLedger>>,
    commits: u64,
}

impl SoftwareSink {
    pub fn new() -> SoftwareSink {
        SoftwareSink {
            ledger: None,
            commits: 0,
        }
    }

    fn ledger(&mut self, model: &FrameCommitModel) -> Arc<FenceLedger> {
        // Fences must account against the same ledger as the display's;
        // adopt it from the first fence that passes through.
        if self.ledger.is_none() {
            self.ledger = model
                .configs
                .iter()
                .find_map(|config| config.acquire_fence.as_ref())
                .map(|fence| fence.ledger().clone());
        }
        self.ledger.get_or_insert_with(FenceLedger::new).clone()
    }
}

impl Default for SoftwareSink {
    fn default() -> Self {
        SoftwareSink::new()
    }
}

impl CommitSink for SoftwareSink {
    fn commit(&mut self, model: &mut FrameCommitModel) -> Result<CommitFeedback, CommitError> {
        let ledger = self.ledger(model);
        self.commits += 1;
        let mut feedback = CommitFeedback {
            retire: Some(Fence::signaled(&ledger, FenceKind::Retire)),
            releases: Vec::with_capacity(model.configs.len()),
        };
        for config in &mut model.configs {
            // Consume the acquire fence the way the kernel would.
            config.acquire_fence = None;
            feedback.releases.push(if config.state == WindowState::Disabled {
                None
            } else {
                Some(Fence::signaled(&ledger, FenceKind::SrcRelease))
            });
        }
        trace!(commit = self.commits, "software commit");
        Ok(feedback)
    }

    fn clear(&mut self) -> Result<(), CommitError> {
        trace!("software clear");
        Ok(())
    }
}
