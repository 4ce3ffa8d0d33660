//! Queue family classification and selection.
//!
//! Families are classified by the capabilities they expose. Selection is a
//! pure function of the family list: every capability gets the best scoring
//! family that carries it, and families may be shared across capabilities.

use crate::error::{GpuError, Result};
use ash::vk;
use bitflags::bitflags;

/// A single queue capability, used as a lookup key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum QueueCapability {
    Graphics,
    Compute,
    Transfer,
    Present,
}

impl QueueCapability {
    /// All capabilities, in selection order.
    pub const ALL: [Self; 4] = [Self::Graphics, Self::Compute, Self::Transfer, Self::Present];

    /// The flag corresponding to this capability.
    #[inline]
    #[must_use]
    pub const fn flag(self) -> QueueCapabilities {
        match self {
            Self::Graphics => QueueCapabilities::GRAPHICS,
            Self::Compute => QueueCapabilities::COMPUTE,
            Self::Transfer => QueueCapabilities::TRANSFER,
            Self::Present => QueueCapabilities::PRESENT,
        }
    }

    const fn slot(self) -> usize {
        self as usize
    }
}

bitflags! {
    /// Set of capabilities exposed by a queue family.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct QueueCapabilities: u8 {
        const GRAPHICS = 0b0001;
        const COMPUTE  = 0b0010;
        const TRANSFER = 0b0100;
        const PRESENT  = 0b1000;
    }
}

impl QueueCapabilities {
    /// Build the capability set from Vulkan queue flags and surface support.
    pub fn from_vk(flags: vk::QueueFlags, present_support: bool) -> Self {
        let mut caps = Self::empty();
        if flags.contains(vk::QueueFlags::GRAPHICS) {
            caps |= Self::GRAPHICS;
        }
        if flags.contains(vk::QueueFlags::COMPUTE) {
            caps |= Self::COMPUTE;
        }
        if flags.contains(vk::QueueFlags::TRANSFER) {
            caps |= Self::TRANSFER;
        }
        if present_support {
            caps |= Self::PRESENT;
        }
        caps
    }
}

/// Queues of the same family share the same set of capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamily {
    index: u32,
    queue_count: u32,
    capabilities: QueueCapabilities,
    timestamp_valid_bits: u32,
}

impl QueueFamily {
    pub fn new(
        index: u32,
        queue_count: u32,
        capabilities: QueueCapabilities,
        timestamp_valid_bits: u32,
    ) -> Self {
        Self {
            index,
            queue_count,
            capabilities,
            timestamp_valid_bits,
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn queue_count(&self) -> u32 {
        self.queue_count
    }

    pub fn capabilities(&self) -> QueueCapabilities {
        self.capabilities
    }

    #[inline]
    pub fn has(&self, capability: QueueCapability) -> bool {
        self.capabilities.contains(capability.flag())
    }

    /// Returns `true` if the family exposes exactly one capability.
    pub fn is_exclusive(&self) -> bool {
        self.capabilities.bits().count_ones() == 1
    }

    pub fn can_use_timestamps(&self) -> bool {
        self.timestamp_valid_bits != 0
    }

    pub fn timestamp_valid_bits(&self) -> u32 {
        self.timestamp_valid_bits
    }
}

/// The queue families present on a physical device.
#[derive(Debug, Clone, Default)]
pub struct QueueFamilyContainer {
    families: Vec<QueueFamily>,
    cumulative: QueueCapabilities,
}

impl QueueFamilyContainer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a family. Families without queues are ignored.
    pub fn add_family(&mut self, family: QueueFamily) {
        if family.queue_count == 0 {
            return;
        }
        self.cumulative |= family.capabilities;
        self.families.push(family);
    }

    /// Returns `true` if every capability is covered by at least one family.
    pub fn has_all_capabilities(&self) -> bool {
        self.cumulative.is_all()
    }

    /// Union of the capabilities of all families.
    pub fn capabilities(&self) -> QueueCapabilities {
        self.cumulative
    }

    pub fn len(&self) -> usize {
        self.families.len()
    }

    pub fn is_empty(&self) -> bool {
        self.families.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &QueueFamily> {
        self.families.iter()
    }

    /// Families that carry the given capability, in device order.
    pub fn families_with(&self, capability: QueueCapability) -> impl Iterator<Item = &QueueFamily> {
        self.families.iter().filter(move |f| f.has(capability))
    }
}

impl FromIterator<QueueFamily> for QueueFamilyContainer {
    fn from_iter<I: IntoIterator<Item = QueueFamily>>(iter: I) -> Self {
        let mut container = Self::new();
        for family in iter {
            container.add_family(family);
        }
        container
    }
}

/// Score of `family` as the queue for `capability`, or `None` if it lacks it.
///
/// Graphics, compute and present prefer families that also carry the other
/// capabilities. Transfer prefers families that carry nothing else.
pub fn queue_family_score(family: &QueueFamily, capability: QueueCapability) -> Option<u32> {
    use QueueCapability::{Compute, Graphics, Present, Transfer};

    if !family.has(capability) {
        return None;
    }

    let bonus = |cap: QueueCapability, points: u32| if family.has(cap) { points } else { 0 };
    let missing = |cap: QueueCapability| u32::from(!family.has(cap));

    let score = match capability {
        Graphics => bonus(Present, 5) + bonus(Compute, 1) + bonus(Transfer, 1),
        Compute => bonus(Present, 5) + bonus(Graphics, 1) + bonus(Transfer, 1),
        Present => bonus(Graphics, 5) + bonus(Compute, 4) + bonus(Transfer, 1),
        Transfer => missing(Present) + missing(Graphics) + missing(Compute),
    };
    Some(score)
}

/// Pick the best family for a capability. Ties keep the first family found.
pub fn select_queue_family(
    container: &QueueFamilyContainer,
    capability: QueueCapability,
) -> Option<QueueFamily> {
    let mut best: Option<(u32, &QueueFamily)> = None;
    for family in container.iter() {
        let Some(score) = queue_family_score(family, capability) else {
            continue;
        };
        if best.map_or(true, |(best_score, _)| score > best_score) {
            best = Some((score, family));
        }
    }
    best.map(|(_, family)| *family)
}

/// One chosen family per capability. Entries may refer to the same family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectedQueueFamilies {
    families: [QueueFamily; 4],
}

impl SelectedQueueFamilies {
    pub fn get(&self, capability: QueueCapability) -> &QueueFamily {
        &self.families[capability.slot()]
    }

    pub fn graphics(&self) -> &QueueFamily {
        self.get(QueueCapability::Graphics)
    }

    pub fn compute(&self) -> &QueueFamily {
        self.get(QueueCapability::Compute)
    }

    pub fn transfer(&self) -> &QueueFamily {
        self.get(QueueCapability::Transfer)
    }

    pub fn present(&self) -> &QueueFamily {
        self.get(QueueCapability::Present)
    }

    /// Sorted, de-duplicated family indices.
    pub fn family_indices(&self) -> Vec<u32> {
        let mut indices: Vec<u32> = self.families.iter().map(QueueFamily::index).collect();
        indices.sort_unstable();
        indices.dedup();
        indices
    }
}

/// Choose a family for each capability by greedy per-capability scoring.
pub fn select_queue_families(container: &QueueFamilyContainer) -> Result<SelectedQueueFamilies> {
    let pick = |capability| {
        select_queue_family(container, capability).ok_or_else(|| {
            GpuError::InvalidState(format!("no queue family supports {capability:?}"))
        })
    };

    let selected = SelectedQueueFamilies {
        families: [
            pick(QueueCapability::Graphics)?,
            pick(QueueCapability::Compute)?,
            pick(QueueCapability::Transfer)?,
            pick(QueueCapability::Present)?,
        ],
    };

    tracing::debug!(
        graphics = selected.graphics().index(),
        compute = selected.compute().index(),
        transfer = selected.transfer().index(),
        present = selected.present().index(),
        "Selected queue families"
    );

    Ok(selected)
}

/// For each capability, prefer the first family that carries only that
/// capability; otherwise keep the entry from `shared`.
pub fn select_exclusive_queue_families(
    container: &QueueFamilyContainer,
    shared: &SelectedQueueFamilies,
) -> SelectedQueueFamilies {
    let mut families = shared.families;
    for capability in QueueCapability::ALL {
        if let Some(family) = container
            .families_with(capability)
            .find(|f| f.is_exclusive())
        {
            families[capability.slot()] = *family;
        }
    }
    SelectedQueueFamilies { families }
}

/// A device queue together with the family it was taken from.
#[derive(Debug, Clone, Copy)]
pub struct Queue {
    handle: vk::Queue,
    family: QueueFamily,
}

impl Queue {
    pub fn handle(&self) -> vk::Queue {
        self.handle
    }

    pub fn family(&self) -> &QueueFamily {
        &self.family
    }
}

/// The queues owned by the logical device, addressable by capability.
///
/// Entries may point to the same queue.
#[derive(Debug, Clone)]
pub struct QueueContainer {
    shared: [Queue; 4],
    exclusive: [Queue; 4],
}

impl QueueContainer {
    /// Build the container, fetching one queue per family through `get_queue`.
    pub fn new(
        shared: &SelectedQueueFamilies,
        exclusive: &SelectedQueueFamilies,
        mut get_queue: impl FnMut(u32) -> vk::Queue,
    ) -> Self {
        let mut make = |family: QueueFamily| Queue {
            handle: get_queue(family.index()),
            family,
        };
        Self {
            shared: shared.families.map(&mut make),
            exclusive: exclusive.families.map(&mut make),
        }
    }

    /// The queue for `capability`. With `exclusive`, a dedicated family is
    /// preferred when the device has one.
    pub fn get(&self, capability: QueueCapability, exclusive: bool) -> &Queue {
        if exclusive {
            &self.exclusive[capability.slot()]
        } else {
            &self.shared[capability.slot()]
        }
    }

    pub fn graphics(&self) -> &Queue {
        self.get(QueueCapability::Graphics, false)
    }

    pub fn present(&self) -> &Queue {
        self.get(QueueCapability::Present, false)
    }

    /// Any queue taken from `family_index`.
    pub fn by_family_index(&self, family_index: u32) -> Option<&Queue> {
        self.shared
            .iter()
            .chain(self.exclusive.iter())
            .find(|q| q.family.index() == family_index)
    }

    /// Sorted, de-duplicated indices of every family with a queue.
    pub fn family_indices_in_use(&self) -> Vec<u32> {
        let mut indices: Vec<u32> = self
            .shared
            .iter()
            .chain(self.exclusive.iter())
            .map(|q| q.family.index())
            .collect();
        indices.sort_unstable();
        indices.dedup();
        indices
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(index: u32, caps: QueueCapabilities) -> QueueFamily {
        QueueFamily::new(index, 1, caps, 64)
    }

    fn all() -> QueueCapabilities {
        QueueCapabilities::all()
    }

    #[test]
    fn single_universal_family_serves_everything() {
        let container: QueueFamilyContainer = [family(0, all())].into_iter().collect();
        let selected = select_queue_families(&container).unwrap();

        for cap in QueueCapability::ALL {
            assert_eq!(selected.get(cap).index(), 0);
        }
        assert_eq!(selected.family_indices(), vec![0]);
    }

    #[test]
    fn transfer_prefers_dedicated_family() {
        let container: QueueFamilyContainer = [
            family(0, all()),
            family(1, QueueCapabilities::COMPUTE | QueueCapabilities::TRANSFER),
            family(2, QueueCapabilities::TRANSFER),
        ]
        .into_iter()
        .collect();
        let selected = select_queue_families(&container).unwrap();

        assert_eq!(selected.graphics().index(), 0);
        assert_eq!(selected.compute().index(), 0);
        assert_eq!(selected.present().index(), 0);
        assert_eq!(selected.transfer().index(), 2);
    }

    #[test]
    fn compute_prefers_family_with_more_capabilities() {
        let container: QueueFamilyContainer = [
            family(0, QueueCapabilities::COMPUTE),
            family(1, all()),
        ]
        .into_iter()
        .collect();
        let selected = select_queue_families(&container).unwrap();
        assert_eq!(selected.compute().index(), 1);
    }

    #[test]
    fn timestamp_support_follows_valid_bits() {
        assert!(QueueFamily::new(0, 1, all(), 64).can_use_timestamps());
        assert!(!QueueFamily::new(1, 1, QueueCapabilities::TRANSFER, 0).can_use_timestamps());
    }

    #[test]
    fn ties_keep_first_family() {
        let container: QueueFamilyContainer =
            [family(3, all()), family(5, all())].into_iter().collect();
        let selected = select_queue_families(&container).unwrap();
        for cap in QueueCapability::ALL {
            assert_eq!(selected.get(cap).index(), 3);
        }
    }

    #[test]
    fn families_lacking_a_capability_are_never_chosen_for_it() {
        // Family 0 scores well for present (graphics + compute) but lacks it.
        let container: QueueFamilyContainer = [
            family(
                0,
                QueueCapabilities::GRAPHICS | QueueCapabilities::COMPUTE | QueueCapabilities::TRANSFER,
            ),
            family(1, QueueCapabilities::PRESENT),
        ]
        .into_iter()
        .collect();
        let selected = select_queue_families(&container).unwrap();
        assert_eq!(selected.present().index(), 1);
        assert_eq!(selected.graphics().index(), 0);
    }

    #[test]
    fn every_capability_selected_for_all_nonempty_subsets() {
        // Exhaustive over small family lists: whenever some family carries a
        // capability, selection returns a family carrying it.
        let sets: Vec<QueueCapabilities> = (1u8..16)
            .map(|bits| QueueCapabilities::from_bits_truncate(bits))
            .collect();
        for a in &sets {
            for b in &sets {
                let container: QueueFamilyContainer =
                    [family(0, *a), family(1, *b)].into_iter().collect();
                for cap in QueueCapability::ALL {
                    let chosen = select_queue_family(&container, cap);
                    if container.capabilities().contains(cap.flag()) {
                        assert!(chosen.expect("family available").has(cap));
                    } else {
                        assert!(chosen.is_none());
                    }
                }
                assert_eq!(
                    select_queue_families(&container).is_ok(),
                    container.has_all_capabilities()
                );
            }
        }
    }

    #[test]
    fn missing_capability_is_an_error() {
        let container: QueueFamilyContainer = [family(
            0,
            QueueCapabilities::GRAPHICS | QueueCapabilities::COMPUTE | QueueCapabilities::TRANSFER,
        )]
        .into_iter()
        .collect();
        assert!(!container.has_all_capabilities());
        assert!(select_queue_families(&container).is_err());
    }

    #[test]
    fn empty_families_are_ignored() {
        let mut container = QueueFamilyContainer::new();
        container.add_family(QueueFamily::new(0, 0, all(), 0));
        assert!(container.is_empty());
        assert!(!container.has_all_capabilities());
    }

    #[test]
    fn exclusive_selection_prefers_dedicated_families() {
        let container: QueueFamilyContainer = [
            family(0, all()),
            family(1, QueueCapabilities::COMPUTE),
            family(2, QueueCapabilities::TRANSFER),
        ]
        .into_iter()
        .collect();
        let shared = select_queue_families(&container).unwrap();
        let exclusive = select_exclusive_queue_families(&container, &shared);

        assert_eq!(exclusive.compute().index(), 1);
        assert_eq!(exclusive.transfer().index(), 2);
        // No dedicated graphics or present family: falls back to the shared one.
        assert_eq!(exclusive.graphics().index(), 0);
        assert_eq!(exclusive.present().index(), 0);
    }

    #[test]
    fn queue_container_lookup() {
        use ash::vk::Handle;

        let container: QueueFamilyContainer = [family(0, all()), family(2, QueueCapabilities::TRANSFER)]
            .into_iter()
            .collect();
        let shared = select_queue_families(&container).unwrap();
        let exclusive = select_exclusive_queue_families(&container, &shared);
        let queues = QueueContainer::new(&shared, &exclusive, |idx| {
            vk::Queue::from_raw(u64::from(idx) + 100)
        });

        assert_eq!(queues.family_indices_in_use(), vec![0, 2]);
        assert_eq!(queues.get(QueueCapability::Transfer, true).family().index(), 2);
        assert_eq!(queues.get(QueueCapability::Transfer, false).family().index(), 2);
        assert_eq!(queues.graphics().handle().as_raw(), 100);
        assert!(queues.by_family_index(1).is_none());
    }
}
