// SPDX-License-Identifier: GPL-3.0-only

use std::sync::Arc;

use parking_lot::Mutex;

use crate::hints::HintSender;
use dpu_comp_config::DpuCompConfig;

bitflags::bitflags! {
    /// What changed since the last validated frame. Any set bit forces a
    /// full validate pass; ERROR_CASE additionally disables the static
    /// skip for one frame.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GeometryChanged: u32 {
        const LAYER_ADDED          = 1 << 0;
        const LAYER_REMOVED        = 1 << 1;
        const LAYER_ZORDER         = 1 << 2;
        const LAYER_BUFFER         = 1 << 3;
        const LAYER_SOURCE_CROP    = 1 << 4;
        const LAYER_DISPLAY_FRAME  = 1 << 5;
        const LAYER_BLEND          = 1 << 6;
        const LAYER_TRANSFORM      = 1 << 7;
        const LAYER_ALPHA          = 1 << 8;
        const LAYER_IGNORED        = 1 << 9;
        const CLIENT_TARGET        = 1 << 10;
        const DISPLAY_POWER        = 1 << 11;
        const FORCE_VALIDATE       = 1 << 12;
        const ERROR_CASE           = 1 << 13;
    }
}

/// Process-level context shared by every display instance. Replaces the
/// cross-display globals of older composer stacks with an explicitly
/// injected struct.
#[derive(Debug)]
pub struct Common {
    pub config: DpuCompConfig,
    /// Geometry dirt that applies to all displays, e.g. hotplug.
    pub device_geometry: Mutex<GeometryChanged>,
    pub hints: HintSender,
    /// More than one display connected disables the window-config skip.
    pub multi_display: Mutex<bool>,
}

impl Common {
    pub fn new(config: DpuCompConfig) -> Arc<Common> {
        Arc::new(Common {
            config,
            device_geometry: Mutex::new(GeometryChanged::FORCE_VALIDATE),
            hints: HintSender::spawn(),
            multi_display: Mutex::new(false),
        })
    }

    pub fn mark_device_geometry(&self, flags: GeometryChanged) {
        *self.device_geometry.lock() |= flags;
    }

    pub fn take_device_geometry(&self) -> GeometryChanged {
        std::mem::replace(&mut *self.device_geometry.lock(), GeometryChanged::empty())
    }
}
