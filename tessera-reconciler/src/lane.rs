//! Priority lanes.
//!
//! A [`Lanes`] value is a 31-bit mask. Each bit is a lane; sets of lanes are
//! unions of bits. Lower bits are more urgent, so the highest priority lane in a
//! set is its lowest set bit.
//!
//! ## Bands
//!
//! | Band | Bits |
//! |---|---|
//! | sync | 0 |
//! | input continuous | 1 |
//! | default | 2 |
//! | transition | 3..=16 |
//! | retry | 17..=21 |
//! | idle | 28 |
//! | offscreen | 29 |
//! | deferred | 30 |
//!
//! Lanes are never meaningful across renders on their own. Only sets are
//! compared, merged and subtracted.

use std::{
    fmt,
    ops::{BitAnd, BitAndAssign, BitOr, BitOrAssign, Index, IndexMut, Not},
};

use crate::host::SchedulerPriority;

/// Number of lanes available in a [`Lanes`] mask.
pub const TOTAL_LANES: usize = 31;

/// Milliseconds on the host clock.
pub type Timestamp = u64;

/// A set of priority lanes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct Lanes(u32);

/// A single lane. Alias kept for readability at call sites that require one bit.
pub type Lane = Lanes;

impl Lanes {
    /// The empty set.
    pub const NONE: Lanes = Lanes(0);
    /// Discrete user input and `flush_sync`.
    pub const SYNC: Lanes = Lanes(1 << 0);
    /// Continuous input such as drags and scrolls.
    pub const INPUT_CONTINUOUS: Lanes = Lanes(1 << 1);
    /// Updates with no explicit priority.
    pub const DEFAULT: Lanes = Lanes(1 << 2);
    /// All transition lanes.
    pub const TRANSITIONS: Lanes = Lanes(0b0000_0000_0000_0001_1111_1111_1111_1000);
    /// First transition lane.
    pub const TRANSITION_1: Lanes = Lanes(1 << 3);
    /// All retry lanes.
    pub const RETRIES: Lanes = Lanes(0b0000_0000_0011_1110_0000_0000_0000_0000);
    /// First retry lane.
    pub const RETRY_1: Lanes = Lanes(1 << 17);
    /// Idle work.
    pub const IDLE: Lanes = Lanes(1 << 28);
    /// Work on hidden subtrees.
    pub const OFFSCREEN: Lanes = Lanes(1 << 29);
    /// Deferred values spawned by a render.
    pub const DEFERRED: Lanes = Lanes(1 << 30);

    /// The synchronous band. Any of these collapses to a synchronous render.
    pub const SYNC_UPDATE: Lanes = Lanes(Self::SYNC.0 | Self::INPUT_CONTINUOUS.0);
    /// Lanes that render without time slicing.
    pub const BLOCKING: Lanes = Lanes(Self::INPUT_CONTINUOUS.0 | Self::DEFAULT.0);
    /// Everything below idle.
    pub const NON_IDLE: Lanes = Lanes(0b0000_1111_1111_1111_1111_1111_1111_1111);
    /// Every lane.
    pub const ALL: Lanes = Lanes((1 << TOTAL_LANES) - 1);

    /// Builds a lane set from raw bits, discarding bits outside the mask.
    pub const fn from_bits(bits: u32) -> Self {
        Lanes(bits & Self::ALL.0)
    }

    /// Raw bits.
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Whether the set is empty.
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Whether `self` and `other` share any lane.
    pub const fn intersects(self, other: Lanes) -> bool {
        self.0 & other.0 != 0
    }

    /// Whether every lane of `subset` is in `self`.
    pub const fn contains(self, subset: Lanes) -> bool {
        self.0 & subset.0 == subset.0
    }

    /// Union.
    pub const fn merge(self, other: Lanes) -> Lanes {
        Lanes(self.0 | other.0)
    }

    /// Intersection.
    pub const fn intersect(self, other: Lanes) -> Lanes {
        Lanes(self.0 & other.0)
    }

    /// `self` without the lanes in `other`.
    pub const fn remove(self, other: Lanes) -> Lanes {
        Lanes(self.0 & !other.0)
    }

    /// The most urgent lane of the set, i.e. its lowest set bit.
    pub const fn highest_priority_lane(self) -> Lane {
        Lanes(self.0 & self.0.wrapping_neg())
    }

    /// Bit index of the most urgent lane. Only meaningful for non-empty sets.
    pub const fn index_of_highest(self) -> usize {
        self.0.trailing_zeros() as usize
    }

    /// Number of lanes in the set.
    pub const fn len(self) -> u32 {
        self.0.count_ones()
    }

    /// The single lane at `index`.
    pub const fn from_index(index: usize) -> Lane {
        Lanes(1 << index)
    }

    /// Iterates `(index, lane)` pairs, most urgent first.
    pub fn iter(self) -> impl Iterator<Item = (usize, Lane)> {
        let mut remaining = self.0;
        std::iter::from_fn(move || {
            if remaining == 0 {
                return None;
            }
            let index = remaining.trailing_zeros() as usize;
            remaining &= !(1 << index);
            Some((index, Lanes(1 << index)))
        })
    }

    /// Whether the set contains a lane of the synchronous band.
    pub const fn includes_sync_lane(self) -> bool {
        self.intersects(Self::SYNC_UPDATE)
    }

    /// Whether the set renders without yielding.
    pub const fn includes_blocking_lane(self) -> bool {
        self.intersects(Self::SYNC_UPDATE.merge(Self::BLOCKING))
    }

    /// Whether every lane is a transition lane.
    pub const fn includes_only_transitions(self) -> bool {
        !self.is_empty() && self.remove(Self::TRANSITIONS).is_empty()
    }

    /// Whether every lane is a retry lane.
    pub const fn includes_only_retries(self) -> bool {
        !self.is_empty() && self.remove(Self::RETRIES).is_empty()
    }

    /// Whether every lane is a retry or transition lane, the lanes that may
    /// stay on the previous screen instead of showing a fallback.
    pub const fn includes_only_non_urgent(self) -> bool {
        !self.is_empty()
            && self
                .remove(Self::TRANSITIONS.merge(Self::RETRIES))
                .is_empty()
    }

    /// Whether the set has any non-idle lane.
    pub const fn includes_non_idle_work(self) -> bool {
        self.intersects(Self::NON_IDLE)
    }

    /// Whether the lane is one of the transition lanes.
    pub const fn is_transition(self) -> bool {
        self.includes_only_transitions()
    }

    /// The band of `self` that should be worked on first.
    ///
    /// The synchronous band collapses to every pending synchronous lane.
    /// Every other band yields its most urgent lane.
    pub fn highest_priority_band(self) -> Lanes {
        let sync = self.intersect(Self::SYNC_UPDATE);
        if !sync.is_empty() {
            return sync;
        }
        self.highest_priority_lane()
    }

    /// Picks one lane out of the set, used for render-phase updates.
    pub const fn pick_arbitrary_lane(self) -> Lane {
        self.highest_priority_lane()
    }

    /// Host scheduler priority for rendering this set.
    pub fn scheduler_priority(self) -> SchedulerPriority {
        EventPriority::from_lanes(self).scheduler_priority()
    }
}

impl fmt::Debug for Lanes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Lanes({:#033b})", self.0)
    }
}

impl BitOr for Lanes {
    type Output = Lanes;

    fn bitor(self, rhs: Lanes) -> Lanes {
        self.merge(rhs)
    }
}

impl BitOrAssign for Lanes {
    fn bitor_assign(&mut self, rhs: Lanes) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Lanes {
    type Output = Lanes;

    fn bitand(self, rhs: Lanes) -> Lanes {
        self.intersect(rhs)
    }
}

impl BitAndAssign for Lanes {
    fn bitand_assign(&mut self, rhs: Lanes) {
        self.0 &= rhs.0;
    }
}

impl Not for Lanes {
    type Output = Lanes;

    fn not(self) -> Lanes {
        Lanes(!self.0 & Self::ALL.0)
    }
}

/// Coarse priority of the event that produced an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventPriority {
    /// Clicks, key presses and other discrete input.
    Discrete,
    /// Drags, scrolls and other continuous input.
    Continuous,
    /// Everything without an explicit priority.
    Default,
    /// Idle work.
    Idle,
}

impl EventPriority {
    /// The lane assigned to updates made at this priority.
    pub const fn lane(self) -> Lane {
        match self {
            EventPriority::Discrete => Lanes::SYNC,
            EventPriority::Continuous => Lanes::INPUT_CONTINUOUS,
            EventPriority::Default => Lanes::DEFAULT,
            EventPriority::Idle => Lanes::IDLE,
        }
    }

    /// Priority derived from the most urgent lane of a set.
    pub fn from_lanes(lanes: Lanes) -> EventPriority {
        let lane = lanes.highest_priority_lane();
        if lane.intersects(Lanes::SYNC) {
            EventPriority::Discrete
        } else if lane.intersects(Lanes::INPUT_CONTINUOUS) {
            EventPriority::Continuous
        } else if lane.includes_non_idle_work() {
            EventPriority::Default
        } else {
            EventPriority::Idle
        }
    }

    /// Host scheduler priority used for callbacks at this event priority.
    pub const fn scheduler_priority(self) -> SchedulerPriority {
        match self {
            EventPriority::Discrete => SchedulerPriority::Immediate,
            EventPriority::Continuous => SchedulerPriority::UserBlocking,
            EventPriority::Default => SchedulerPriority::Normal,
            EventPriority::Idle => SchedulerPriority::Idle,
        }
    }
}

/// Fixed-size table with one slot per lane.
#[derive(Debug, Clone)]
pub struct LaneMap<T> {
    slots: [T; TOTAL_LANES],
}

impl<T: Copy> LaneMap<T> {
    /// Creates a table with every slot set to `value`.
    pub fn filled(value: T) -> Self {
        Self {
            slots: [value; TOTAL_LANES],
        }
    }

    /// Sets every slot selected by `lanes` to `value`.
    pub fn fill_lanes(&mut self, lanes: Lanes, value: T) {
        for (index, _) in lanes.iter() {
            self.slots[index] = value;
        }
    }
}

impl<T> Index<usize> for LaneMap<T> {
    type Output = T;

    fn index(&self, index: usize) -> &T {
        &self.slots[index]
    }
}

impl<T> IndexMut<usize> for LaneMap<T> {
    fn index_mut(&mut self, index: usize) -> &mut T {
        &mut self.slots[index]
    }
}

/// Cycles through a band, handing out one lane at a time.
#[derive(Debug, Clone, Copy)]
pub struct LaneCursor {
    band: Lanes,
    next: Lane,
}

impl LaneCursor {
    /// A cursor over the transition band.
    pub const fn transitions() -> Self {
        Self {
            band: Lanes::TRANSITIONS,
            next: Lanes::TRANSITION_1,
        }
    }

    /// A cursor over the retry band.
    pub const fn retries() -> Self {
        Self {
            band: Lanes::RETRIES,
            next: Lanes::RETRY_1,
        }
    }

    /// Returns the next lane and advances, wrapping at the end of the band.
    pub fn claim(&mut self) -> Lane {
        let lane = self.next;
        let shifted = Lanes::from_bits(self.next.bits() << 1);
        self.next = if shifted.intersects(self.band) {
            shifted
        } else {
            self.band.highest_priority_lane()
        };
        lane
    }
}

/// Deadline for a lane first seen at `now`, or `None` for lanes that never
/// expire.
pub fn compute_expiration_time(
    lane: Lane,
    now: Timestamp,
    config: &crate::ReconcilerConfig,
) -> Option<Timestamp> {
    if lane.intersects(Lanes::SYNC_UPDATE.merge(Lanes::DEFAULT)) {
        Some(now + config.sync_lane_expiration_ms)
    } else if lane.intersects(Lanes::TRANSITIONS) {
        Some(now + config.transition_lane_expiration_ms)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn highest_priority_is_lowest_bit() {
        let lanes = Lanes::DEFAULT | Lanes::TRANSITION_1 | Lanes::IDLE;
        assert_eq!(lanes.highest_priority_lane(), Lanes::DEFAULT);
        assert_eq!(Lanes::NONE.highest_priority_lane(), Lanes::NONE);
    }

    #[test]
    fn sync_band_collapses() {
        let lanes = Lanes::SYNC | Lanes::INPUT_CONTINUOUS | Lanes::DEFAULT;
        assert_eq!(
            lanes.highest_priority_band(),
            Lanes::SYNC | Lanes::INPUT_CONTINUOUS
        );
        let transitions = Lanes::from_bits(0b11000);
        assert_eq!(transitions.highest_priority_band(), Lanes::TRANSITION_1);
    }

    #[test]
    fn bands_do_not_overlap() {
        let bands = [
            Lanes::SYNC,
            Lanes::INPUT_CONTINUOUS,
            Lanes::DEFAULT,
            Lanes::TRANSITIONS,
            Lanes::RETRIES,
            Lanes::IDLE,
            Lanes::OFFSCREEN,
            Lanes::DEFERRED,
        ];
        for (i, a) in bands.iter().enumerate() {
            for b in bands.iter().skip(i + 1) {
                assert!(!a.intersects(*b), "{a:?} overlaps {b:?}");
            }
        }
        assert_eq!(Lanes::TRANSITIONS.len(), 14);
        assert_eq!(Lanes::RETRIES.len(), 5);
    }

    #[test]
    fn cursor_wraps_within_band() {
        let mut cursor = LaneCursor::retries();
        let claimed: Vec<Lanes> = (0..6).map(|_| cursor.claim()).collect();
        assert_eq!(claimed[0], Lanes::RETRY_1);
        assert_eq!(claimed[5], Lanes::RETRY_1);
        assert!(claimed.iter().all(|lane| Lanes::RETRIES.contains(*lane)));
    }

    #[test]
    fn iter_walks_most_urgent_first() {
        let lanes = Lanes::IDLE | Lanes::SYNC | Lanes::RETRY_1;
        let order: Vec<Lanes> = lanes.iter().map(|(_, lane)| lane).collect();
        assert_eq!(order, vec![Lanes::SYNC, Lanes::RETRY_1, Lanes::IDLE]);
    }

    #[test]
    fn expiration_by_band() {
        let config = crate::ReconcilerConfig::default();
        assert_eq!(
            compute_expiration_time(Lanes::SYNC, 10, &config),
            Some(10 + config.sync_lane_expiration_ms)
        );
        assert_eq!(
            compute_expiration_time(Lanes::TRANSITION_1, 10, &config),
            Some(10 + config.transition_lane_expiration_ms)
        );
        assert_eq!(compute_expiration_time(Lanes::RETRY_1, 10, &config), None);
        assert_eq!(compute_expiration_time(Lanes::IDLE, 10, &config), None);
    }

    #[test]
    fn event_priority_mapping() {
        assert_eq!(
            EventPriority::from_lanes(Lanes::TRANSITION_1 | Lanes::INPUT_CONTINUOUS),
            EventPriority::Continuous
        );
        assert_eq!(
            EventPriority::from_lanes(Lanes::OFFSCREEN),
            EventPriority::Idle
        );
        assert_eq!(
            (Lanes::RETRY_1).scheduler_priority(),
            SchedulerPriority::Normal
        );
    }
}
