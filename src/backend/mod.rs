// SPDX-License-Identifier: GPL-3.0-only

//! Hardware-facing types and the seams towards the display driver.
//!
//! The composition core never talks to a kernel interface directly; it
//! drives a [`CommitSink`] (atomic commit execution and fence feedback)
//! and consults a [`ResourceArbiter`] (plane inventory, blender capacity
//! and format restrictions). The `software` module provides in-process
//! implementations of both, used by the headless binary and the tests.

use std::sync::Arc;

use dpu_comp_config::{BlenderConfig, SizeRestriction};

use crate::{
    display::{commit::FrameCommitModel, layers::Layer},
    fence::Fence,
};

pub mod software;

/// Pixel formats the pipeline cares to distinguish. Only the class (RGB
/// vs YUV), alpha presence and the per-pixel footprint matter here.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Format {
    Argb8888,
    Xrgb8888,
    Rgba1010102,
    Rgb565,
    Nv12,
    P010,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FormatClass {
    Rgb,
    Yuv,
}

impl Format {
    pub fn class(&self) -> FormatClass {
        match self {
            Format::Argb8888 | Format::Xrgb8888 | Format::Rgba1010102 | Format::Rgb565 => {
                FormatClass::Rgb
            }
            Format::Nv12 | Format::P010 => FormatClass::Yuv,
        }
    }

    pub fn has_alpha(&self) -> bool {
        matches!(self, Format::Argb8888 | Format::Rgba1010102)
    }

    /// Average bits per pixel, used for the buffer footprint check.
    pub fn bits_per_pixel(&self) -> u64 {
        match self {
            Format::Argb8888 | Format::Xrgb8888 | Format::Rgba1010102 => 32,
            Format::Rgb565 => 16,
            Format::Nv12 => 12,
            Format::P010 => 24,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CompressionType {
    #[default]
    None,
    /// Framebuffer compression; lossy variants are exempt from the
    /// footprint check.
    Afbc {
        lossy: bool,
    },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ColorSpace {
    #[default]
    Srgb,
    DisplayP3,
    Bt2020,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BlendMode {
    #[default]
    None,
    Premultiplied,
    Coverage,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Transform {
    #[default]
    Normal,
    Rot90,
    Rot180,
    Rot270,
    FlipH,
    FlipV,
}

/// A client-allocated graphic buffer. The core never reads pixel data;
/// identity and metadata are all it needs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GraphicBuffer {
    pub id: u64,
    pub width: i32,
    pub height: i32,
    pub stride: i32,
    pub vstride: i32,
    pub format: Format,
    pub size_bytes: u64,
    pub protected: bool,
    pub compression: CompressionType,
}

impl GraphicBuffer {
    pub fn new(id: u64, width: i32, height: i32, format: Format) -> Arc<GraphicBuffer> {
        Arc::new(GraphicBuffer {
            id,
            width,
            height,
            stride: width,
            vstride: height,
            format,
            size_bytes: (width as u64) * (height as u64) * format.bits_per_pixel() / 8,
            protected: false,
            compression: CompressionType::None,
        })
    }

    pub fn is_lossy(&self) -> bool {
        matches!(self.compression, CompressionType::Afbc { lossy: true })
    }
}

/// One overlay window/plane of the display controller.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PlaneId(pub usize);

bitflags::bitflags! {
    /// Composition paths a layer's format/usage combination can take,
    /// as reported by buffer-metadata extraction.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct PathCaps: u32 {
        const OVERLAY = 1 << 0;
        const BLENDER = 1 << 1;
    }
}

/// Where the arbiter wants a layer to go this frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PathDecision {
    Overlay(PlaneId),
    Blender,
    Client,
}

#[derive(Debug, thiserror::Error)]
pub enum CommitError {
    #[error("driver rejected the commit: {0}")]
    Rejected(&'static str),
    #[error("display device is gone")]
    DeviceLost,
}

/// Fences handed back by the driver after a commit.
#[derive(Debug, Default)]
pub struct CommitFeedback {
    /// Signals when the committed frame leaves the screen.
    pub retire: Option<Fence>,
    /// Per window slot: signals when the slot's buffer may be reused.
    pub releases: Vec<Option<Fence>>,
}

/// Atomic commit execution, the only way pixels reach the screen.
pub trait CommitSink {
    /// Submit a validated commit plan. Acquire fences travel inside the
    /// model; release and retire fences come back in the feedback.
    fn commit(&mut self, model: &mut FrameCommitModel) -> Result<CommitFeedback, CommitError>;

    /// Commit an all-disabled configuration (blank frame).
    fn clear(&mut self) -> Result<(), CommitError>;
}

/// Plane inventory, blender capacity and per-format restrictions.
///
/// The scoring that picks a path for a layer is the arbiter's business;
/// the lifecycle controller only acts on the returned decision and on
/// `is_blender_assignable` during region widening.
pub trait ResourceArbiter {
    /// Forget all assignments of the previous pass.
    fn begin_frame(&mut self);

    fn plane_count(&self) -> usize;

    /// The blender unit serving this display, if any.
    fn blender(&self) -> Option<BlenderConfig>;

    fn restrictions(&self, class: FormatClass) -> SizeRestriction;

    /// Pick a path for `layer` given the blender capacity already
    /// consumed this frame. An `Overlay` decision claims the plane.
    fn decide(&mut self, layer: &Layer, used_blender_capacity: f32) -> PathDecision;

    /// Claim a plane for a composition target.
    fn claim_plane(&mut self) -> Option<PlaneId>;

    fn release_plane(&mut self, plane: PlaneId);

    /// Whether the blender can still take `layer` on top of the given
    /// running capacity total.
    fn is_blender_assignable(&self, layer: &Layer, used_capacity: f32) -> bool;

    /// Capacity cost of processing `layer` on the blender.
    fn blender_load(&self, layer: &Layer) -> f32;
}
