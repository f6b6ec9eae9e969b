// SPDX-License-Identifier: GPL-3.0-only

use serde::{Deserialize, Serialize};

/// Runtime toggles for the composition fast paths. All of them default to
/// enabled; disabling one only costs performance, never correctness.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct ControlFlags {
    /// Reuse the previous client-target output while its member layers are
    /// provably unchanged.
    pub skip_static_layers: bool,
    /// Allow `present` without a preceding `validate` when the previous
    /// frame's assignment is still valid.
    pub skip_validate: bool,
    /// Elide the driver commit entirely when the new window configuration
    /// is identical to the committed one.
    pub skip_window_config: bool,
}

impl Default for ControlFlags {
    fn default() -> ControlFlags {
        ControlFlags {
            skip_static_layers: true,
            skip_validate: true,
            skip_window_config: true,
        }
    }
}

/// Logical type of the 2D blender block, when the display has one.
///
/// A `Combined` blender shares its pipeline with other functions and can
/// be claimed exclusively by a single max-priority layer; a `Scaler` is a
/// plain multi-input scaler/blender.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub enum BlenderKind {
    Combined,
    Scaler,
}

/// Source geometry restrictions of one hardware unit for one pixel-format
/// class. Sizes and offsets handed to the driver must respect these.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct SizeRestriction {
    pub max_frame_width: i32,
    pub max_frame_height: i32,
    pub frame_width_align: i32,
    pub frame_height_align: i32,
    pub min_crop_width: i32,
    pub min_crop_height: i32,
    pub max_crop_width: i32,
    pub max_crop_height: i32,
    pub crop_x_align: i32,
    pub crop_y_align: i32,
    pub crop_width_align: i32,
    pub crop_height_align: i32,
}

impl Default for SizeRestriction {
    fn default() -> SizeRestriction {
        SizeRestriction {
            max_frame_width: 65534,
            max_frame_height: 65534,
            frame_width_align: 1,
            frame_height_align: 1,
            min_crop_width: 1,
            min_crop_height: 1,
            max_crop_width: 65534,
            max_crop_height: 65534,
            crop_x_align: 1,
            crop_y_align: 1,
            crop_width_align: 1,
            crop_height_align: 1,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Deserialize, Serialize)]
pub struct BlenderConfig {
    pub kind: BlenderKind,
    /// Total processing capacity, in the arbiter's normalized units.
    pub capacity: f32,
}

/// Description of the display hardware the composer drives.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct HardwareConfig {
    /// Number of overlay window slots the display controller offers.
    pub plane_count: usize,
    /// Decoration (rounded-corner) slots, usually 0 or 1.
    pub decoration_slots: usize,
    pub blender: Option<BlenderConfig>,
    pub restrictions_rgb: SizeRestriction,
    pub restrictions_yuv: SizeRestriction,
    pub width: i32,
    pub height: i32,
    pub vsync_period_ns: u64,
}

impl Default for HardwareConfig {
    fn default() -> HardwareConfig {
        HardwareConfig {
            plane_count: 8,
            decoration_slots: 1,
            blender: Some(BlenderConfig {
                kind: BlenderKind::Combined,
                capacity: 8.0,
            }),
            restrictions_rgb: SizeRestriction::default(),
            restrictions_yuv: SizeRestriction {
                crop_x_align: 2,
                crop_y_align: 2,
                crop_width_align: 2,
                crop_height_align: 2,
                min_crop_width: 32,
                min_crop_height: 32,
                ..SizeRestriction::default()
            },
            width: 1440,
            height: 3120,
            vsync_period_ns: 16_666_666,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct DpuCompConfig {
    pub controls: ControlFlags,
    pub hardware: HardwareConfig,
}
