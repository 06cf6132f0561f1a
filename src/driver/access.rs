//! Memory access masks, image layout tracking, and hazard detection.
//!
//! An image keeps a _primary_ layout for the whole image plus at most one _exception_: a single
//! slice which is in a different layout. Every request which cannot be expressed this way is
//! folded back into that shape by first collapsing the exception.

use {
    super::image::ImageSlice,
    arrayvec::ArrayVec,
    ash::vk,
    std::ops::{BitOr, BitOrAssign},
};

/// The maximum number of slices one image access may name.
pub const MAX_IMAGE_ACCESS_SLICES: usize = 4;

const HISTORY_CAPACITY: usize = 4;

const fn stages(
    a: vk::PipelineStageFlags2,
    b: vk::PipelineStageFlags2,
) -> vk::PipelineStageFlags2 {
    vk::PipelineStageFlags2::from_raw(a.as_raw() | b.as_raw())
}

const fn accesses(a: vk::AccessFlags2, b: vk::AccessFlags2) -> vk::AccessFlags2 {
    vk::AccessFlags2::from_raw(a.as_raw() | b.as_raw())
}

/// The pipeline stages and memory accesses of one use of a resource, split into reads and
/// writes.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct MemoryAccess {
    pub read_stages: vk::PipelineStageFlags2,
    pub read_access: vk::AccessFlags2,
    pub write_stages: vk::PipelineStageFlags2,
    pub write_access: vk::AccessFlags2,
}

impl MemoryAccess {
    pub const NONE: Self = Self::read(vk::PipelineStageFlags2::NONE, vk::AccessFlags2::NONE);

    pub const COLOR_ATTACHMENT_READ: Self = Self::read(
        vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
        vk::AccessFlags2::COLOR_ATTACHMENT_READ,
    );

    pub const COLOR_ATTACHMENT_WRITE: Self = Self::write(
        vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
        vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
    );

    pub const DEPTH_STENCIL_ATTACHMENT_READ: Self = Self::read(
        stages(
            vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS,
            vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS,
        ),
        vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ,
    );

    pub const DEPTH_STENCIL_ATTACHMENT_WRITE: Self = Self::write(
        stages(
            vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS,
            vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS,
        ),
        vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE,
    );

    pub const SHADER_READ: Self = Self::read(
        vk::PipelineStageFlags2::ALL_COMMANDS,
        vk::AccessFlags2::SHADER_READ,
    );

    pub const SHADER_WRITE: Self = Self::write(
        vk::PipelineStageFlags2::ALL_COMMANDS,
        vk::AccessFlags2::SHADER_WRITE,
    );

    pub const TRANSFER_READ: Self = Self::read(
        vk::PipelineStageFlags2::TRANSFER,
        vk::AccessFlags2::TRANSFER_READ,
    );

    pub const TRANSFER_WRITE: Self = Self::write(
        vk::PipelineStageFlags2::TRANSFER,
        vk::AccessFlags2::TRANSFER_WRITE,
    );

    pub const VERTEX_ATTRIBUTE_READ: Self = Self::read(
        vk::PipelineStageFlags2::VERTEX_ATTRIBUTE_INPUT,
        vk::AccessFlags2::VERTEX_ATTRIBUTE_READ,
    );

    pub const INDEX_READ: Self = Self::read(
        vk::PipelineStageFlags2::INDEX_INPUT,
        vk::AccessFlags2::INDEX_READ,
    );

    pub const UNIFORM_READ: Self = Self::read(
        vk::PipelineStageFlags2::ALL_COMMANDS,
        vk::AccessFlags2::UNIFORM_READ,
    );

    /// Everything; used when the next access is not known.
    pub const ALL: Self = Self {
        read_stages: vk::PipelineStageFlags2::ALL_COMMANDS,
        read_access: vk::AccessFlags2::MEMORY_READ,
        write_stages: vk::PipelineStageFlags2::ALL_COMMANDS,
        write_access: vk::AccessFlags2::MEMORY_WRITE,
    };

    pub const fn read(stages: vk::PipelineStageFlags2, access: vk::AccessFlags2) -> Self {
        Self {
            read_stages: stages,
            read_access: access,
            write_stages: vk::PipelineStageFlags2::NONE,
            write_access: vk::AccessFlags2::NONE,
        }
    }

    pub const fn write(stages: vk::PipelineStageFlags2, access: vk::AccessFlags2) -> Self {
        Self {
            read_stages: vk::PipelineStageFlags2::NONE,
            read_access: vk::AccessFlags2::NONE,
            write_stages: stages,
            write_access: access,
        }
    }

    /// Shader reads at the given stages.
    pub const fn shader_read(stages: vk::PipelineStageFlags2) -> Self {
        Self::read(stages, vk::AccessFlags2::SHADER_READ)
    }

    /// Shader reads and writes at the given stages, as used by storage resources.
    pub const fn shader_read_write(stages: vk::PipelineStageFlags2) -> Self {
        Self {
            read_stages: stages,
            read_access: vk::AccessFlags2::SHADER_STORAGE_READ,
            write_stages: stages,
            write_access: vk::AccessFlags2::SHADER_STORAGE_WRITE,
        }
    }

    /// Combines read-only and read-write accesses which happen as one operation.
    pub const fn with(self, other: Self) -> Self {
        Self {
            read_stages: stages(self.read_stages, other.read_stages),
            read_access: accesses(self.read_access, other.read_access),
            write_stages: stages(self.write_stages, other.write_stages),
            write_access: accesses(self.write_access, other.write_access),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.stages().is_empty() && self.accesses().is_empty()
    }

    pub fn is_write(&self) -> bool {
        !self.write_access.is_empty()
    }

    pub fn stages(&self) -> vk::PipelineStageFlags2 {
        self.read_stages | self.write_stages
    }

    pub fn accesses(&self) -> vk::AccessFlags2 {
        self.read_access | self.write_access
    }
}

impl BitOr for MemoryAccess {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        self.with(rhs)
    }
}

impl BitOrAssign for MemoryAccess {
    fn bitor_assign(&mut self, rhs: Self) {
        *self = self.with(rhs);
    }
}

fn is_attachment_write(write_access: vk::AccessFlags2) -> bool {
    write_access == vk::AccessFlags2::COLOR_ATTACHMENT_WRITE
        || write_access == vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE
}

/// Returns `true` if `next` must wait for `prev` to complete.
///
/// Read-after-read never needs a barrier. Back-to-back attachment writes of the same kind are
/// ordered by the rasterization order guarantees and do not need one either.
pub fn need_barrier(prev: &MemoryAccess, next: &MemoryAccess) -> bool {
    if !prev.is_write() && !next.is_write() {
        return false;
    }

    if prev.write_access == next.write_access && is_attachment_write(prev.write_access) {
        return false;
    }

    true
}

pub type LayoutRequests = ArrayVec<(ImageSlice, vk::ImageLayout), MAX_IMAGE_ACCESS_SLICES>;

/// One slice of an [`ImageAccess`].
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct ImageSliceAccess {
    pub slice: ImageSlice,
    pub layout: vk::ImageLayout,
    pub access: MemoryAccess,
}

/// All slices of one image used by one operation.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ImageAccess {
    slices: ArrayVec<ImageSliceAccess, MAX_IMAGE_ACCESS_SLICES>,
}

impl ImageAccess {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(slice: ImageSlice, layout: vk::ImageLayout, access: MemoryAccess) -> Self {
        let mut res = Self::new();
        res.push(slice, layout, access);
        res
    }

    /// Adds a slice to this access.
    ///
    /// # Panics
    ///
    /// Panics if more than [`MAX_IMAGE_ACCESS_SLICES`] slices are added.
    pub fn push(&mut self, slice: ImageSlice, layout: vk::ImageLayout, access: MemoryAccess) {
        assert!(
            !self.slices.is_full(),
            "image access names more than {MAX_IMAGE_ACCESS_SLICES} slices"
        );

        self.slices.push(ImageSliceAccess {
            slice,
            layout,
            access,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.slices.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ImageSliceAccess> {
        self.slices.iter()
    }

    /// The combined access of every slice.
    pub fn union(&self) -> MemoryAccess {
        self.slices
            .iter()
            .fold(MemoryAccess::NONE, |res, slice| res | slice.access)
    }

    /// Returns one request per distinct layout, covering every slice which uses it.
    pub fn layout_requests(&self) -> LayoutRequests {
        let mut res = LayoutRequests::new();

        for access in &self.slices {
            if access.slice.is_empty() {
                continue;
            }

            if let Some((slice, _)) = res.iter_mut().find(|(_, layout)| *layout == access.layout) {
                *slice = slice.bounding(&access.slice);
            } else {
                res.push((access.slice, access.layout));
            }
        }

        res
    }
}

/// One layout transition of an image slice.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct LayoutTransition {
    pub slice: ImageSlice,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
}

/// The transitions required to place one slice in a requested layout.
///
/// `collapse` (when present) must be recorded before `transition`.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct LayoutTranslation {
    pub collapse: Option<LayoutTransition>,
    pub transition: Option<LayoutTransition>,
}

impl LayoutTranslation {
    pub fn is_noop(&self) -> bool {
        self.collapse.is_none() && self.transition.is_none()
    }
}

/// Layout of every subresource of one image: a primary layout plus at most one exception slice.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct LayoutState {
    whole: ImageSlice,
    primary: vk::ImageLayout,
    exception: Option<(ImageSlice, vk::ImageLayout)>,
}

impl LayoutState {
    pub fn new(whole: ImageSlice, primary: vk::ImageLayout) -> Self {
        Self {
            whole,
            primary,
            exception: None,
        }
    }

    pub fn primary(&self) -> vk::ImageLayout {
        self.primary
    }

    pub fn exception(&self) -> Option<(ImageSlice, vk::ImageLayout)> {
        self.exception
    }

    pub fn whole(&self) -> ImageSlice {
        self.whole
    }

    /// Returns the layout of `slice`, or `None` when it is partially inside the exception.
    pub fn layout_of(&self, slice: &ImageSlice) -> Option<vk::ImageLayout> {
        match self.exception {
            Some((exception, layout)) if exception.contains(slice) => Some(layout),
            Some((exception, _)) if exception.intersects(slice) => None,
            _ => Some(self.primary),
        }
    }

    /// Computes the transitions which place `slice` in `layout` without applying them.
    pub fn layout_translation(
        &self,
        slice: ImageSlice,
        layout: vk::ImageLayout,
    ) -> LayoutTranslation {
        let mut res = LayoutTranslation::default();

        if slice.is_empty() {
            return res;
        }

        let Some((exception, exception_layout)) = self.exception else {
            if self.primary != layout {
                res.transition = Some(LayoutTransition {
                    slice,
                    old_layout: self.primary,
                    new_layout: layout,
                });
            }

            return res;
        };

        if exception.contains(&slice) && exception_layout == layout {
            return res;
        }

        if slice == exception {
            res.transition = Some(LayoutTransition {
                slice,
                old_layout: exception_layout,
                new_layout: layout,
            });
        } else if exception.contains(&slice) {
            // Strictly inside: the rest of the exception must leave its layout too
            res.collapse = Some(LayoutTransition {
                slice: exception,
                old_layout: exception_layout,
                new_layout: self.primary,
            });

            if self.primary != layout {
                res.transition = Some(LayoutTransition {
                    slice,
                    old_layout: self.primary,
                    new_layout: layout,
                });
            }
        } else if !exception.intersects(&slice) {
            // Entirely outside the exception: a second exception cannot be represented
            if self.primary != layout {
                if exception_layout != self.primary {
                    res.collapse = Some(LayoutTransition {
                        slice: exception,
                        old_layout: exception_layout,
                        new_layout: self.primary,
                    });
                }

                res.transition = Some(LayoutTransition {
                    slice,
                    old_layout: self.primary,
                    new_layout: layout,
                });
            }
        } else {
            // Straddles the exception boundary
            if exception_layout != self.primary {
                res.collapse = Some(LayoutTransition {
                    slice: exception,
                    old_layout: exception_layout,
                    new_layout: self.primary,
                });
            }

            if self.primary != layout {
                res.transition = Some(LayoutTransition {
                    slice,
                    old_layout: self.primary,
                    new_layout: layout,
                });
            }
        }

        res
    }

    /// Commits the translation of `slice` into `layout`.
    pub fn apply(&mut self, slice: ImageSlice, layout: vk::ImageLayout) -> LayoutTranslation {
        let res = self.layout_translation(slice, layout);

        if res.collapse.is_some() {
            self.exception = None;
        }

        if let Some(transition) = res.transition {
            self.set(transition.slice, transition.new_layout);
        }

        self.normalize();

        res
    }

    fn set(&mut self, slice: ImageSlice, layout: vk::ImageLayout) {
        if slice.contains(&self.whole) {
            self.primary = layout;
            self.exception = None;
        } else if layout == self.primary {
            // The slice was the exception
            self.exception = None;
        } else {
            self.exception = Some((slice, layout));
        }
    }

    fn normalize(&mut self) {
        if let Some((exception, layout)) = self.exception {
            if layout == self.primary || exception.is_empty() {
                self.exception = None;
            } else if exception.contains(&self.whole) {
                self.primary = layout;
                self.exception = None;
            }
        }
    }

    /// Returns the transitions which turn this state into `target`, in recording order.
    ///
    /// At most three are needed: collapse this exception, convert the primary layout, then
    /// create the target exception.
    pub fn conversion_to(&self, target: &Self) -> ArrayVec<LayoutTransition, 3> {
        let mut res = ArrayVec::new();

        if self == target {
            return res;
        }

        let mut primary = self.primary;

        if let Some((exception, layout)) = self.exception {
            res.push(LayoutTransition {
                slice: exception,
                old_layout: layout,
                new_layout: primary,
            });
        }

        if primary != target.primary {
            res.push(LayoutTransition {
                slice: self.whole,
                old_layout: primary,
                new_layout: target.primary,
            });
            primary = target.primary;
        }

        if let Some((exception, layout)) = target.exception {
            res.push(LayoutTransition {
                slice: exception,
                old_layout: primary,
                new_layout: layout,
            });
        }

        res
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
struct HistoryEntry {
    slice: ImageSlice,
    access: MemoryAccess,

    /// Stages ordered after the most recent layout transition of this slice; later work at other
    /// stages still needs a dependency on that transition.
    transitioned_for: Option<vk::PipelineStageFlags2>,
}

/// Recent accesses of an image, bounded to a few slices.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AccessHistory {
    whole: ImageSlice,
    entries: ArrayVec<HistoryEntry, HISTORY_CAPACITY>,
}

impl AccessHistory {
    pub fn new(whole: ImageSlice) -> Self {
        Self {
            whole,
            entries: ArrayVec::new(),
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// The combined access of every entry.
    pub fn union(&self) -> MemoryAccess {
        self.entries
            .iter()
            .fold(MemoryAccess::NONE, |res, entry| res | entry.prior())
    }

    /// The combined access of every entry which intersects `slice`.
    pub fn prior(&self, slice: &ImageSlice) -> MemoryAccess {
        self.entries
            .iter()
            .filter(|entry| entry.slice.intersects(slice))
            .fold(MemoryAccess::NONE, |res, entry| res | entry.prior())
    }

    /// Returns the access `next` must wait for, if any.
    pub fn hazard(&self, slice: &ImageSlice, next: &MemoryAccess) -> Option<MemoryAccess> {
        let hazardous = self
            .entries
            .iter()
            .filter(|entry| entry.slice.intersects(slice))
            .any(|entry| entry.is_hazard(next));

        hazardous.then(|| self.prior(slice))
    }

    /// Records that `slice` was transitioned by a barrier whose destination scope is `stages`.
    pub fn record_transition(&mut self, slice: ImageSlice, stages: vk::PipelineStageFlags2) {
        self.entries.retain(|entry| !slice.contains(&entry.slice));
        self.push(HistoryEntry {
            slice,
            access: MemoryAccess::NONE,
            transitioned_for: Some(stages),
        });
    }

    /// Records `access` of `slice`.
    ///
    /// When `resolved` is `true` a barrier covering every prior access of `slice` was recorded
    /// just before, so contained entries are replaced; otherwise they are merged.
    pub fn record(&mut self, slice: ImageSlice, access: MemoryAccess, resolved: bool) {
        self.insert(
            HistoryEntry {
                slice,
                access,
                transitioned_for: None,
            },
            resolved,
        );
    }

    /// Adds the entries of `later`, whose accesses happened after every access of this history.
    pub fn extend(&mut self, later: &Self) {
        for entry in &later.entries {
            self.insert(*entry, false);
        }
    }

    fn insert(&mut self, mut entry: HistoryEntry, resolved: bool) {
        let slice = entry.slice;

        self.entries.retain(|prev| {
            if !slice.contains(&prev.slice) {
                return true;
            }

            if !resolved {
                entry.access |= prev.access;
                entry.transitioned_for = match (entry.transitioned_for, prev.transitioned_for) {
                    (Some(a), Some(b)) => Some(a & b),
                    (a, b) => a.or(b),
                };
            }

            false
        });

        self.push(entry);
    }

    fn push(&mut self, entry: HistoryEntry) {
        if self.entries.is_full() {
            let folded = HistoryEntry {
                slice: self.whole,
                access: self.union(),
                transitioned_for: None,
            };

            self.entries.clear();
            self.entries.push(folded);
        }

        self.entries.push(entry);
    }
}

impl HistoryEntry {
    fn is_hazard(&self, next: &MemoryAccess) -> bool {
        if !self.access.is_empty() && need_barrier(&self.access, next) {
            return true;
        }

        match self.transitioned_for {
            Some(stages) => !stages.contains(next.stages()),
            None => false,
        }
    }

    /// This entry as the source scope of a barrier.
    fn prior(&self) -> MemoryAccess {
        let mut res = self.access;

        if let Some(stages) = self.transitioned_for {
            res.read_stages |= stages;
        }

        res
    }
}

#[cfg(test)]
mod tests {
    use {super::*, std::ops::Range};

    type L = vk::ImageLayout;

    fn slice(array_layers: Range<u32>, mip_levels: Range<u32>) -> ImageSlice {
        ImageSlice::new(
            vk::ImageAspectFlags::COLOR,
            mip_levels.start,
            mip_levels.len() as _,
            array_layers.start,
            array_layers.len() as _,
        )
    }

    fn whole() -> ImageSlice {
        slice(0..4, 0..4)
    }

    #[test]
    pub fn need_barrier_read_after_read() {
        assert!(!need_barrier(
            &MemoryAccess::SHADER_READ,
            &MemoryAccess::TRANSFER_READ
        ));
        assert!(!need_barrier(&MemoryAccess::NONE, &MemoryAccess::NONE));
    }

    #[test]
    pub fn need_barrier_writes() {
        assert!(need_barrier(
            &MemoryAccess::TRANSFER_WRITE,
            &MemoryAccess::SHADER_READ
        ));
        assert!(need_barrier(
            &MemoryAccess::SHADER_READ,
            &MemoryAccess::TRANSFER_WRITE
        ));
        assert!(need_barrier(
            &MemoryAccess::TRANSFER_WRITE,
            &MemoryAccess::TRANSFER_WRITE
        ));
        assert!(need_barrier(
            &MemoryAccess::COLOR_ATTACHMENT_WRITE,
            &MemoryAccess::DEPTH_STENCIL_ATTACHMENT_WRITE
        ));
    }

    #[test]
    pub fn need_barrier_attachment_writes() {
        assert!(!need_barrier(
            &MemoryAccess::COLOR_ATTACHMENT_WRITE,
            &MemoryAccess::COLOR_ATTACHMENT_WRITE
        ));
        assert!(!need_barrier(
            &MemoryAccess::DEPTH_STENCIL_ATTACHMENT_WRITE,
            &MemoryAccess::DEPTH_STENCIL_ATTACHMENT_WRITE
        ));

        // Blending reads the attachment too
        assert!(!need_barrier(
            &MemoryAccess::COLOR_ATTACHMENT_WRITE,
            &(MemoryAccess::COLOR_ATTACHMENT_WRITE | MemoryAccess::COLOR_ATTACHMENT_READ)
        ));
    }

    #[test]
    pub fn image_access_layout_requests() {
        let mut access = ImageAccess::new();
        access.push(slice(0..1, 0..1), L::TRANSFER_SRC_OPTIMAL, MemoryAccess::TRANSFER_READ);
        access.push(slice(2..3, 1..2), L::TRANSFER_SRC_OPTIMAL, MemoryAccess::TRANSFER_READ);
        access.push(slice(0..1, 3..4), L::GENERAL, MemoryAccess::SHADER_WRITE);

        let requests = access.layout_requests();

        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0], (slice(0..3, 0..2), L::TRANSFER_SRC_OPTIMAL));
        assert_eq!(requests[1], (slice(0..1, 3..4), L::GENERAL));
        assert!(access.union().is_write());
    }

    #[test]
    #[should_panic(expected = "more than 4 slices")]
    pub fn image_access_overflow() {
        let mut access = ImageAccess::new();

        for layer in 0..5 {
            access.push(
                slice(layer..layer + 1, 0..1),
                L::GENERAL,
                MemoryAccess::SHADER_READ,
            );
        }
    }

    #[test]
    pub fn layout_translation_no_exception() {
        let state = LayoutState::new(whole(), L::GENERAL);

        assert!(state.layout_translation(slice(0..1, 0..1), L::GENERAL).is_noop());

        let translation = state.layout_translation(slice(0..1, 0..1), L::TRANSFER_DST_OPTIMAL);

        assert!(translation.collapse.is_none());
        assert_eq!(
            translation.transition,
            Some(LayoutTransition {
                slice: slice(0..1, 0..1),
                old_layout: L::GENERAL,
                new_layout: L::TRANSFER_DST_OPTIMAL,
            })
        );
    }

    #[test]
    pub fn layout_translation_inside_exception() {
        let mut state = LayoutState::new(whole(), L::GENERAL);
        state.apply(slice(0..2, 0..2), L::TRANSFER_DST_OPTIMAL);

        assert!(state
            .layout_translation(slice(0..1, 0..1), L::TRANSFER_DST_OPTIMAL)
            .is_noop());

        // The whole exception moves, not only the requested part of it
        let translation = state.apply(slice(0..2, 0..2), L::SHADER_READ_ONLY_OPTIMAL);

        assert!(translation.collapse.is_none());
        assert_eq!(
            translation.transition.map(|t| t.old_layout),
            Some(L::TRANSFER_DST_OPTIMAL)
        );
        assert_eq!(
            state.exception(),
            Some((slice(0..2, 0..2), L::SHADER_READ_ONLY_OPTIMAL))
        );
    }

    #[test]
    pub fn layout_translation_strictly_inside_exception() {
        let mut state = LayoutState::new(whole(), L::GENERAL);
        state.apply(slice(0..2, 0..2), L::TRANSFER_DST_OPTIMAL);

        let translation = state.apply(slice(0..1, 0..1), L::SHADER_READ_ONLY_OPTIMAL);

        assert_eq!(
            translation.collapse,
            Some(LayoutTransition {
                slice: slice(0..2, 0..2),
                old_layout: L::TRANSFER_DST_OPTIMAL,
                new_layout: L::GENERAL,
            })
        );
        assert_eq!(
            translation.transition,
            Some(LayoutTransition {
                slice: slice(0..1, 0..1),
                old_layout: L::GENERAL,
                new_layout: L::SHADER_READ_ONLY_OPTIMAL,
            })
        );
        assert_eq!(state.layout_of(&slice(0..1, 1..2)), Some(L::GENERAL));

        // Back to the primary layout leaves no exception behind
        state.apply(slice(0..2, 0..2), L::TRANSFER_DST_OPTIMAL);

        let translation = state.apply(slice(0..1, 0..1), L::GENERAL);

        assert!(translation.collapse.is_some());
        assert!(translation.transition.is_none());
        assert_eq!(state.exception(), None);
        assert_eq!(state.layout_of(&whole()), Some(L::GENERAL));
    }

    #[test]
    pub fn layout_translation_sequences() {
        const LAYOUTS: [L; 3] = [
            L::GENERAL,
            L::TRANSFER_DST_OPTIMAL,
            L::SHADER_READ_ONLY_OPTIMAL,
        ];

        // Every slice of a 2x2 image: layer ranges x level ranges
        let ranges = [0..1, 1..2, 0..2];
        let slices = ranges
            .iter()
            .flat_map(|layers| ranges.iter().map(|levels| slice(layers.clone(), levels.clone())))
            .collect::<Vec<_>>();
        let whole = slice(0..2, 0..2);
        let subresource = |layer: usize, level: usize| {
            let (layer, level) = (layer as u32, level as u32);

            slice(layer..layer + 1, level..level + 1)
        };

        // Small xorshift so every run replays the same sequences
        let mut seed = 0x2545_f491_u32;
        let mut next = |n: usize| {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            seed as usize % n
        };

        for _ in 0..64 {
            let mut state = LayoutState::new(whole, L::UNDEFINED);
            let mut model = [[L::UNDEFINED; 2]; 2];

            for _ in 0..16 {
                let request = slices[next(slices.len())];
                let layout = LAYOUTS[next(LAYOUTS.len())];
                let translation = state.apply(request, layout);

                for transition in [translation.collapse, translation.transition]
                    .into_iter()
                    .flatten()
                {
                    for (layer, levels) in model.iter_mut().enumerate() {
                        for (level, current) in levels.iter_mut().enumerate() {
                            if transition.slice.contains(&subresource(layer, level)) {
                                assert_eq!(*current, transition.old_layout);

                                *current = transition.new_layout;
                            }
                        }
                    }
                }

                for (layer, levels) in model.iter().enumerate() {
                    for (level, current) in levels.iter().enumerate() {
                        assert_eq!(
                            state.layout_of(&subresource(layer, level)),
                            Some(*current)
                        );
                    }
                }

                assert_eq!(state.layout_of(&request), Some(layout));

                if let Some((exception, exception_layout)) = state.exception() {
                    assert!(!exception.contains(&whole));
                    assert_ne!(exception_layout, state.primary());
                }
            }
        }
    }

    #[test]
    pub fn layout_translation_outside_exception() {
        let mut state = LayoutState::new(whole(), L::GENERAL);
        state.apply(slice(0..1, 0..1), L::TRANSFER_DST_OPTIMAL);

        // Already in primary: nothing to do, the exception stays
        assert!(state.layout_translation(slice(3..4, 3..4), L::GENERAL).is_noop());

        let translation = state.apply(slice(3..4, 3..4), L::TRANSFER_SRC_OPTIMAL);

        assert_eq!(
            translation.collapse,
            Some(LayoutTransition {
                slice: slice(0..1, 0..1),
                old_layout: L::TRANSFER_DST_OPTIMAL,
                new_layout: L::GENERAL,
            })
        );
        assert_eq!(
            translation.transition,
            Some(LayoutTransition {
                slice: slice(3..4, 3..4),
                old_layout: L::GENERAL,
                new_layout: L::TRANSFER_SRC_OPTIMAL,
            })
        );
        assert_eq!(
            state.exception(),
            Some((slice(3..4, 3..4), L::TRANSFER_SRC_OPTIMAL))
        );
        assert_eq!(state.layout_of(&slice(0..1, 0..1)), Some(L::GENERAL));
    }

    #[test]
    pub fn layout_translation_straddles_exception() {
        let mut state = LayoutState::new(whole(), L::GENERAL);
        state.apply(slice(0..2, 0..1), L::TRANSFER_DST_OPTIMAL);

        assert_eq!(state.layout_of(&slice(1..3, 0..1)), None);

        let translation = state.apply(slice(1..3, 0..1), L::GENERAL);

        assert!(translation.collapse.is_some());
        assert!(translation.transition.is_none());
        assert_eq!(state.exception(), None);
        assert_eq!(state.layout_of(&whole()), Some(L::GENERAL));
    }

    #[test]
    pub fn layout_translation_whole_image() {
        let mut state = LayoutState::new(whole(), L::GENERAL);
        state.apply(slice(0..1, 0..1), L::TRANSFER_DST_OPTIMAL);
        state.apply(whole(), L::SHADER_READ_ONLY_OPTIMAL);

        assert_eq!(state.primary(), L::SHADER_READ_ONLY_OPTIMAL);
        assert_eq!(state.exception(), None);
    }

    #[test]
    pub fn layout_translation_back_to_primary() {
        let mut state = LayoutState::new(whole(), L::GENERAL);
        state.apply(slice(0..1, 0..1), L::TRANSFER_DST_OPTIMAL);

        let translation = state.apply(slice(0..1, 0..1), L::GENERAL);

        assert!(translation.collapse.is_none());
        assert!(translation.transition.is_some());
        assert_eq!(state.exception(), None);
    }

    #[test]
    pub fn layout_conversion() {
        let mut from = LayoutState::new(whole(), L::GENERAL);
        from.apply(slice(0..1, 0..1), L::TRANSFER_DST_OPTIMAL);

        let mut to = LayoutState::new(whole(), L::SHADER_READ_ONLY_OPTIMAL);
        to.apply(slice(1..2, 1..2), L::COLOR_ATTACHMENT_OPTIMAL);

        let conversion = from.conversion_to(&to);

        assert_eq!(conversion.len(), 3);
        assert_eq!(conversion[0].slice, slice(0..1, 0..1));
        assert_eq!(conversion[0].new_layout, L::GENERAL);
        assert_eq!(conversion[1].slice, whole());
        assert_eq!(conversion[1].new_layout, L::SHADER_READ_ONLY_OPTIMAL);
        assert_eq!(conversion[2].old_layout, L::SHADER_READ_ONLY_OPTIMAL);
        assert_eq!(conversion[2].new_layout, L::COLOR_ATTACHMENT_OPTIMAL);

        assert!(from.conversion_to(&from).is_empty());
    }

    #[test]
    pub fn access_history_hazards() {
        let mut history = AccessHistory::new(whole());
        history.record(slice(0..1, 0..1), MemoryAccess::TRANSFER_WRITE, false);

        assert!(history
            .hazard(&slice(1..2, 0..1), &MemoryAccess::SHADER_READ)
            .is_none());

        let hazard = history
            .hazard(&slice(0..4, 0..1), &MemoryAccess::SHADER_READ)
            .unwrap();

        assert_eq!(hazard, MemoryAccess::TRANSFER_WRITE);

        history.record(slice(0..4, 0..1), MemoryAccess::SHADER_READ, true);

        assert_eq!(history.len(), 1);
        assert!(history
            .hazard(&slice(0..1, 0..1), &MemoryAccess::TRANSFER_READ)
            .is_none());
    }

    #[test]
    pub fn access_history_transition() {
        let mut history = AccessHistory::new(whole());
        let fragment = MemoryAccess::shader_read(vk::PipelineStageFlags2::FRAGMENT_SHADER);
        let vertex = MemoryAccess::shader_read(vk::PipelineStageFlags2::VERTEX_SHADER);

        history.record_transition(slice(0..1, 0..1), fragment.stages());
        history.record(slice(0..1, 0..1), fragment, false);

        assert!(history.hazard(&slice(0..1, 0..1), &fragment).is_none());

        let hazard = history.hazard(&slice(0..1, 0..1), &vertex).unwrap();

        assert!(hazard
            .read_stages
            .contains(vk::PipelineStageFlags2::FRAGMENT_SHADER));
    }

    #[test]
    pub fn access_history_extend() {
        let mut history = AccessHistory::new(whole());
        history.record(
            slice(0..1, 0..1),
            MemoryAccess::shader_read(vk::PipelineStageFlags2::FRAGMENT_SHADER),
            false,
        );

        let mut later = AccessHistory::new(whole());
        later.record(slice(1..2, 0..1), MemoryAccess::SHADER_READ, false);
        history.extend(&later);

        assert_eq!(history.len(), 2);

        let hazard = history
            .hazard(&slice(0..1, 0..1), &MemoryAccess::TRANSFER_WRITE)
            .unwrap();

        assert!(hazard
            .read_stages
            .contains(vk::PipelineStageFlags2::FRAGMENT_SHADER));
    }

    #[test]
    pub fn access_history_overflow() {
        let mut history = AccessHistory::new(whole());

        for layer in 0..4 {
            history.record(
                slice(layer..layer + 1, 0..1),
                MemoryAccess::SHADER_READ,
                false,
            );
        }

        assert_eq!(history.len(), 4);

        history.record(slice(0..1, 1..2), MemoryAccess::TRANSFER_WRITE, false);

        assert_eq!(history.len(), 2);
        assert_eq!(
            history.union(),
            MemoryAccess::SHADER_READ | MemoryAccess::TRANSFER_WRITE
        );

        // Folded entries cover the whole image
        assert!(history
            .hazard(&slice(3..4, 3..4), &MemoryAccess::TRANSFER_WRITE)
            .is_some());
    }
}
