// SPDX-License-Identifier: GPL-3.0-only

//! Contiguous composition-range bookkeeping.
//!
//! Two index ranges over the z-sorted layer list: the client (GPU) range
//! and the blender (2D hardware) range. Every mutation keeps both ranges
//! contiguous and disjoint, reclassifying layers between them as needed.

use std::sync::Arc;

use dpu_comp_config::{BlenderConfig, BlenderKind};
use smallvec::SmallVec;

use crate::{
    backend::{ColorSpace, GraphicBuffer, PathCaps, PlaneId, ResourceArbiter},
    display::{
        layers::{CompositionType, LayerSet, Priority, ValidationReason},
        skip::SnapshotEntry,
        HwcError,
    },
    fence::Fence,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TargetKind {
    Client,
    Blender,
}

/// Signal returned by every mutating range operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegionChange {
    Unchanged,
    /// Composition membership changed; the caller must re-derive anything
    /// computed from the previous assignment.
    Changed,
}

/// Outcome of a mutating range operation, carrying the hardware planes
/// that became free as layers were pulled off the overlay path.
#[must_use]
#[derive(Debug)]
pub struct RegionUpdate {
    pub change: RegionChange,
    pub released: SmallVec<[PlaneId; 2]>,
}

impl RegionUpdate {
    fn unchanged() -> RegionUpdate {
        RegionUpdate {
            change: RegionChange::Unchanged,
            released: SmallVec::new(),
        }
    }
}

/// State of one composition target (the client target buffer or the
/// blender intermediate buffer).
#[derive(Debug)]
pub struct CompositionInfo {
    pub kind: TargetKind,
    pub has_layers: bool,
    pub first: usize,
    pub last: usize,
    pub target: Option<Arc<GraphicBuffer>>,
    pub color_space: ColorSpace,
    pub acquire_fence: Option<Fence>,
    pub plane: Option<PlaneId>,
    pub window_index: Option<usize>,
    /// Single max-priority source on the combined blender.
    pub exclusive: bool,
    pub skip_flag: bool,
    pub skip_init: bool,
    pub snapshot: Vec<SnapshotEntry>,
}

impl CompositionInfo {
    pub fn new(kind: TargetKind) -> CompositionInfo {
        CompositionInfo {
            kind,
            has_layers: false,
            first: 0,
            last: 0,
            target: None,
            color_space: ColorSpace::Srgb,
            acquire_fence: None,
            plane: None,
            window_index: None,
            exclusive: false,
            skip_flag: false,
            skip_init: false,
            snapshot: Vec::new(),
        }
    }

    pub fn range(&self) -> Option<(usize, usize)> {
        self.has_layers.then_some((self.first, self.last))
    }

    pub fn contains(&self, index: usize) -> bool {
        self.has_layers && index >= self.first && index <= self.last
    }

    pub fn len(&self) -> usize {
        if self.has_layers {
            self.last - self.first + 1
        } else {
            0
        }
    }

    pub fn set_target(
        &mut self,
        target: Option<Arc<GraphicBuffer>>,
        acquire: Option<Fence>,
        color_space: ColorSpace,
    ) {
        self.target = target;
        self.acquire_fence = acquire;
        self.color_space = color_space;
    }

    /// Clear the range. Returns the plane claim to hand back.
    pub fn clear(&mut self) -> Option<PlaneId> {
        self.has_layers = false;
        self.first = 0;
        self.last = 0;
        self.exclusive = false;
        self.window_index = None;
        self.plane.take()
    }
}

/// Per-frame range tracker for both composition targets.
#[derive(Debug)]
pub struct Regions {
    pub client: CompositionInfo,
    pub blender: CompositionInfo,
}

impl Regions {
    pub fn new() -> Regions {
        Regions {
            client: CompositionInfo::new(TargetKind::Client),
            blender: CompositionInfo::new(TargetKind::Blender),
        }
    }

    /// Drop both ranges, keeping targets and skip bookkeeping.
    pub fn reset_ranges(&mut self) -> SmallVec<[PlaneId; 2]> {
        let mut released = SmallVec::new();
        released.extend(self.client.clear());
        released.extend(self.blender.clear());
        released
    }

    /// Put `index` on the client path and restore the range invariants.
    pub fn add_client(
        &mut self,
        layers: &mut LayerSet,
        index: usize,
        reason: Option<ValidationReason>,
    ) -> Result<RegionUpdate, HwcError> {
        let count = layers.len();
        if index >= count {
            return Err(HwcError::InvalidIndex);
        }
        let mut update = RegionUpdate::unchanged();

        {
            let layer = layers.get_mut(index).ok_or(HwcError::InvalidIndex)?;
            if layer.validated_type != CompositionType::Client {
                update.change = RegionChange::Changed;
            } else if self.client.contains(index) {
                return Ok(update);
            }
            layer.update_validated_type(CompositionType::Client, reason);
            update.released.extend(layer.reset_assigned_path());
        }

        if !self.client.has_layers {
            self.client.has_layers = true;
            self.client.first = index;
            self.client.last = index;
            update.change = RegionChange::Changed;
        }

        self.settle(layers, &mut update)?;
        Ok(update)
    }

    /// Take `index` back off the client path. Only legal at a range
    /// boundary; removing the sole member clears the range.
    pub fn remove_client(
        &mut self,
        layers: &mut LayerSet,
        index: usize,
    ) -> Result<RegionUpdate, HwcError> {
        if !self.client.contains(index) {
            return Err(HwcError::InvalidRange);
        }
        let mut update = RegionUpdate::unchanged();
        update.change = RegionChange::Changed;

        if self.client.first == self.client.last {
            update.released.extend(self.client.clear());
        } else if index == self.client.first {
            self.client.first += 1;
        } else if index == self.client.last {
            self.client.last -= 1;
        } else {
            return Err(HwcError::InvalidRange);
        }

        if let Some(layer) = layers.get_mut(index) {
            layer.validated_type = CompositionType::Invalid;
        }
        Ok(update)
    }

    /// Put `index` on the blender path, pulling in or evicting other
    /// layers as the range widens.
    pub fn add_blender(
        &mut self,
        layers: &mut LayerSet,
        index: usize,
        config: &BlenderConfig,
        arbiter: &dyn ResourceArbiter,
        capacity_used: f32,
    ) -> Result<RegionUpdate, HwcError> {
        let count = layers.len();
        if index >= count {
            return Err(HwcError::InvalidIndex);
        }

        // The combined blender in exclusive mode takes no further sources.
        if self.blender.exclusive {
            return self.add_client(layers, index, Some(ValidationReason::MaxPriorityEviction));
        }

        {
            let layer = layers.get(index).ok_or(HwcError::InvalidIndex)?;
            if !layer.supported_paths.contains(PathCaps::BLENDER)
                || !arbiter.is_blender_assignable(layer, capacity_used)
            {
                return self.add_client(layers, index, Some(ValidationReason::UnsupportedByBlender));
            }
        }

        let mut update = RegionUpdate::unchanged();
        update.change = RegionChange::Changed;

        // A max-priority source on the combined blender evicts everything
        // else and collapses the range to itself.
        let is_max = layers
            .get(index)
            .map(|l| l.priority == Priority::Max)
            .unwrap_or(false);
        if is_max && config.kind == BlenderKind::Combined {
            let members: Vec<usize> = (0..count)
                .filter(|&i| {
                    i != index
                        && layers
                            .get(i)
                            .map(|l| l.validated_type == CompositionType::Blender)
                            .unwrap_or(false)
                })
                .collect();
            if let Some(layer) = layers.get_mut(index) {
                layer.update_validated_type(CompositionType::Blender, None);
                update.released.extend(layer.reset_assigned_path());
            }
            self.blender.has_layers = true;
            self.blender.first = index;
            self.blender.last = index;
            self.blender.exclusive = true;
            for i in members {
                let u = self.add_client(layers, i, Some(ValidationReason::MaxPriorityEviction))?;
                update.released.extend(u.released);
            }
            self.settle(layers, &mut update)?;
            return Ok(update);
        }

        if let Some(layer) = layers.get_mut(index) {
            layer.update_validated_type(CompositionType::Blender, None);
            update.released.extend(layer.reset_assigned_path());
        }

        if !self.blender.has_layers {
            self.blender.has_layers = true;
            self.blender.first = index;
            self.blender.last = index;
            self.settle(layers, &mut update)?;
            return Ok(update);
        }

        let new_first = self.blender.first.min(index);
        let new_last = self.blender.last.max(index);

        // A high-priority overlay strictly inside the widened range can
        // neither join the blender nor stay sandwiched. Abandon the whole
        // assignment and push every non-high member to the client path.
        let high_inside = (new_first..=new_last).any(|i| {
            i > new_first
                && i < new_last
                && layers
                    .get(i)
                    .map(|l| {
                        l.priority == Priority::High
                            && l.validated_type != CompositionType::Blender
                    })
                    .unwrap_or(false)
        });
        if high_inside {
            let members: Vec<usize> = (0..count)
                .filter(|&i| {
                    layers
                        .get(i)
                        .map(|l| l.validated_type == CompositionType::Blender)
                        .unwrap_or(false)
                })
                .collect();
            update.released.extend(self.blender.clear());
            for i in members {
                let u =
                    self.add_client(layers, i, Some(ValidationReason::HighPriorityConflict))?;
                update.released.extend(u.released);
            }
            self.settle(layers, &mut update)?;
            return Ok(update);
        }

        // Pull strictly-inside layers into the blender when the hardware
        // can take them, otherwise push them to the client path.
        let mut running = capacity_used;
        let mut to_client: SmallVec<[usize; 4]> = SmallVec::new();
        for i in new_first..=new_last {
            let layer = layers.get(i).ok_or(HwcError::InvalidIndex)?;
            if layer.validated_type == CompositionType::Blender {
                continue;
            }
            if layer.supported_paths.contains(PathCaps::BLENDER)
                && arbiter.is_blender_assignable(layer, running)
            {
                running += arbiter.blender_load(layer);
                let layer = layers.get_mut(i).ok_or(HwcError::InvalidIndex)?;
                layer.update_validated_type(CompositionType::Blender, None);
                update.released.extend(layer.reset_assigned_path());
            } else {
                to_client.push(i);
            }
        }

        self.blender.first = new_first;
        self.blender.last = new_last;
        for i in to_client {
            let u = self.add_client(layers, i, Some(ValidationReason::SandwichedBetweenBlender))?;
            update.released.extend(u.released);
        }

        self.settle(layers, &mut update)?;
        Ok(update)
    }

    /// Restore all range invariants after membership changed. Runs the
    /// client sandwich pass and nesting resolution to a fixed point; every
    /// step only moves layers toward the client path, so it terminates.
    fn settle(
        &mut self,
        layers: &mut LayerSet,
        update: &mut RegionUpdate,
    ) -> Result<(), HwcError> {
        loop {
            let forced = self.client_sandwich_pass(layers, update)?;
            let nested = self.resolve_nesting(layers, update)?;
            if !forced && !nested {
                break;
            }
            update.change = RegionChange::Changed;
        }
        Ok(())
    }

    /// Recompute the client hull and force non-exempt layers inside it to
    /// the client path. Returns whether anything moved.
    fn client_sandwich_pass(
        &mut self,
        layers: &mut LayerSet,
        update: &mut RegionUpdate,
    ) -> Result<bool, HwcError> {
        if !self.client.has_layers {
            return Ok(false);
        }
        let mut first = None;
        let mut last = None;
        for (i, layer) in layers.iter().enumerate() {
            if layer.validated_type == CompositionType::Client {
                first.get_or_insert(i);
                last = Some(i);
            }
        }
        let (Some(first), Some(last)) = (first, last) else {
            update.released.extend(self.client.clear());
            return Ok(true);
        };
        let widened = first != self.client.first || last != self.client.last;
        self.client.first = first;
        self.client.last = last;

        let mut forced: SmallVec<[usize; 4]> = SmallVec::new();
        let mut blender_touched = false;
        for i in first..=last {
            let layer = layers.get(i).ok_or(HwcError::InvalidIndex)?;
            if layer.validated_type == CompositionType::Client {
                continue;
            }
            if layer.needs_clear_client_target() {
                // High/max priority opaque layers stay on their plane and
                // punch a hole through the client target instead.
                continue;
            }
            if layer.validated_type == CompositionType::Blender {
                blender_touched = true;
            }
            forced.push(i);
        }
        for &i in &forced {
            let layer = layers.get_mut(i).ok_or(HwcError::InvalidIndex)?;
            layer.update_validated_type(
                CompositionType::Client,
                Some(ValidationReason::SandwichedBetweenClient),
            );
            update.released.extend(layer.reset_assigned_path());
        }

        if blender_touched {
            self.recompute_blender(layers, update)?;
        }
        Ok(widened || !forced.is_empty())
    }

    /// Re-derive the blender range from its surviving members. A range
    /// with holes cannot be fed to the hardware, so its members fall back
    /// to the client path.
    fn recompute_blender(
        &mut self,
        layers: &mut LayerSet,
        update: &mut RegionUpdate,
    ) -> Result<(), HwcError> {
        if !self.blender.has_layers {
            return Ok(());
        }
        let members: Vec<usize> = layers
            .iter()
            .enumerate()
            .filter(|(_, l)| l.validated_type == CompositionType::Blender)
            .map(|(i, _)| i)
            .collect();
        let (Some(&first), Some(&last)) = (members.first(), members.last()) else {
            update.released.extend(self.blender.clear());
            return Ok(());
        };
        let contiguous = members.len() == last - first + 1;
        if contiguous {
            self.blender.first = first;
            self.blender.last = last;
            return Ok(());
        }
        update.released.extend(self.blender.clear());
        for i in members {
            let layer = layers.get_mut(i).ok_or(HwcError::InvalidIndex)?;
            layer.update_validated_type(
                CompositionType::Client,
                Some(ValidationReason::SandwichedBetweenClient),
            );
            update.released.extend(layer.reset_assigned_path());
        }
        Ok(())
    }

    /// When the two ranges overlap, shrink the blender range away from the
    /// client range on whichever side loses fewer layers. Evicted members
    /// join the client path.
    fn resolve_nesting(
        &mut self,
        layers: &mut LayerSet,
        update: &mut RegionUpdate,
    ) -> Result<bool, HwcError> {
        let (Some((cf, cl)), Some((bf, bl))) = (self.client.range(), self.blender.range()) else {
            return Ok(false);
        };
        if bl < cf || bf > cl {
            return Ok(false);
        }

        // Eviction counts for moving the blender range clear of the client
        // range from the front vs. from the back.
        let from_front = if bf <= cl { cl + 1 - bf } else { 0 };
        let from_back = if bl >= cf { bl + 1 - cf } else { 0 };
        let (evict_from, evict_to, keeps) = if from_front <= from_back {
            (bf, bl.min(cl), bl > cl)
        } else {
            (bf.max(cf), bl, bf < cf)
        };

        for i in evict_from..=evict_to {
            let layer = layers.get_mut(i).ok_or(HwcError::InvalidIndex)?;
            if layer.validated_type != CompositionType::Blender {
                continue;
            }
            layer.update_validated_type(
                CompositionType::Client,
                Some(ValidationReason::SandwichedBetweenClient),
            );
            update.released.extend(layer.reset_assigned_path());
        }
        if keeps {
            if from_front <= from_back {
                self.blender.first = cl + 1;
            } else {
                self.blender.last = cf - 1;
            }
        } else {
            update.released.extend(self.blender.clear());
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::software::SoftArbiter,
        display::layers::{Layer, LayerId},
    };
    use dpu_comp_config::HardwareConfig;

    fn layer_set(count: usize) -> LayerSet {
        let mut set = LayerSet::default();
        for i in 0..count {
            let mut layer = Layer::new(LayerId(i as u64));
            layer.z = i as u32;
            layer.supported_paths = PathCaps::OVERLAY | PathCaps::BLENDER;
            set.add(layer);
        }
        set.sort_by_z();
        set
    }

    fn arbiter() -> SoftArbiter {
        SoftArbiter::new(&HardwareConfig::default())
    }

    fn blender_cfg() -> BlenderConfig {
        BlenderConfig {
            kind: BlenderKind::Combined,
            capacity: 8.0,
        }
    }

    #[test]
    fn sandwiched_layer_is_forced_to_client() {
        let mut layers = layer_set(3);
        let mut regions = Regions::new();
        let arbiter = arbiter();
        let cfg = blender_cfg();

        regions
            .add_blender(&mut layers, 1, &cfg, &arbiter, 0.0)
            .unwrap();
        regions.add_client(&mut layers, 0, None).unwrap();
        let update = regions.add_client(&mut layers, 2, None).unwrap();

        assert_eq!(update.change, RegionChange::Changed);
        assert_eq!(regions.client.range(), Some((0, 2)));
        assert!(!regions.blender.has_layers);
        assert_eq!(
            layers.get(1).unwrap().validated_type,
            CompositionType::Client
        );
    }

    #[test]
    fn sole_member_removal_clears_the_range() {
        let mut layers = layer_set(1);
        let mut regions = Regions::new();
        regions.client.plane = Some(PlaneId(3));

        regions.add_client(&mut layers, 0, None).unwrap();
        assert_eq!(regions.client.range(), Some((0, 0)));

        let update = regions.remove_client(&mut layers, 0).unwrap();
        assert!(!regions.client.has_layers);
        assert_eq!(update.released.as_slice(), &[PlaneId(3)]);
    }

    #[test]
    fn interior_removal_is_rejected() {
        let mut layers = layer_set(3);
        let mut regions = Regions::new();
        for i in 0..3 {
            regions.add_client(&mut layers, i, None).unwrap();
        }
        assert!(matches!(
            regions.remove_client(&mut layers, 1),
            Err(HwcError::InvalidRange)
        ));
        let update = regions.remove_client(&mut layers, 0).unwrap();
        assert_eq!(update.change, RegionChange::Changed);
        assert_eq!(regions.client.range(), Some((1, 2)));
    }

    #[test]
    fn max_priority_collapses_combined_blender() {
        let mut layers = layer_set(3);
        layers.get_mut(2).unwrap().priority = Priority::Max;
        let mut regions = Regions::new();
        let arbiter = arbiter();
        let cfg = blender_cfg();

        regions
            .add_blender(&mut layers, 0, &cfg, &arbiter, 0.0)
            .unwrap();
        regions
            .add_blender(&mut layers, 1, &cfg, &arbiter, 1.0)
            .unwrap();
        regions
            .add_blender(&mut layers, 2, &cfg, &arbiter, 2.0)
            .unwrap();

        assert_eq!(regions.blender.range(), Some((2, 2)));
        assert!(regions.blender.exclusive);
        assert_eq!(
            layers.get(0).unwrap().validated_type,
            CompositionType::Client
        );
        assert_eq!(
            layers.get(1).unwrap().validated_type,
            CompositionType::Client
        );

        // Exclusive mode turns further candidates away.
        let update = regions
            .add_blender(&mut layers, 0, &cfg, &arbiter, 3.0)
            .unwrap();
        assert_eq!(update.change, RegionChange::Unchanged);
        assert_eq!(regions.blender.range(), Some((2, 2)));
        assert_eq!(
            layers.get(0).unwrap().validated_type,
            CompositionType::Client
        );
    }

    #[test]
    fn high_priority_inside_widened_range_abandons_blender() {
        let mut layers = layer_set(3);
        layers.get_mut(1).unwrap().priority = Priority::High;
        let mut regions = Regions::new();
        let arbiter = arbiter();
        let cfg = blender_cfg();

        regions
            .add_blender(&mut layers, 0, &cfg, &arbiter, 0.0)
            .unwrap();
        regions
            .add_blender(&mut layers, 2, &cfg, &arbiter, 1.0)
            .unwrap();

        assert!(!regions.blender.has_layers);
        assert_eq!(
            layers.get(0).unwrap().validated_type,
            CompositionType::Client
        );
        assert_eq!(
            layers.get(2).unwrap().validated_type,
            CompositionType::Client
        );
        // The high-priority layer itself keeps its overlay assignment.
        assert_ne!(
            layers.get(1).unwrap().validated_type,
            CompositionType::Client
        );
    }

    #[test]
    fn blender_ineligible_interior_layer_goes_to_client() {
        let mut layers = layer_set(3);
        layers.get_mut(1).unwrap().supported_paths = PathCaps::OVERLAY;
        let mut regions = Regions::new();
        let arbiter = arbiter();
        let cfg = blender_cfg();

        regions
            .add_blender(&mut layers, 0, &cfg, &arbiter, 0.0)
            .unwrap();
        regions
            .add_blender(&mut layers, 2, &cfg, &arbiter, 1.0)
            .unwrap();

        // Layer 1 cannot join the blender, so the sandwich collapses the
        // whole stack onto the client path.
        assert_eq!(
            layers.get(1).unwrap().validated_type,
            CompositionType::Client
        );
        assert!(regions.client.has_layers);
        assert!(!regions.blender.has_layers || !regions.blender.contains(1));
    }

    #[test]
    fn opaque_high_priority_layer_is_exempt_from_sandwich() {
        let mut layers = layer_set(3);
        {
            let punch = layers.get_mut(1).unwrap();
            punch.priority = Priority::High;
            punch.blend = crate::backend::BlendMode::None;
        }
        let mut regions = Regions::new();

        regions.add_client(&mut layers, 0, None).unwrap();
        regions.add_client(&mut layers, 2, None).unwrap();

        assert_eq!(regions.client.range(), Some((0, 2)));
        assert_ne!(
            layers.get(1).unwrap().validated_type,
            CompositionType::Client
        );
    }

    #[test]
    fn out_of_bounds_index_is_a_contract_violation() {
        let mut layers = layer_set(2);
        let mut regions = Regions::new();
        assert!(matches!(
            regions.add_client(&mut layers, 5, None),
            Err(HwcError::InvalidIndex)
        ));
    }
}
