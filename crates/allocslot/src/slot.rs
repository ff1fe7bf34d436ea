use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ResolveError;

cfg_if::cfg_if! {
    if #[cfg(target_pointer_width = "64")] {
        /// Alignment every default-alignment allocation is guaranteed to get.
        /// Anything stricter is an extended-alignment request.
        pub const DEFAULT_ALIGNMENT: usize = 16;
    } else {
        /// Alignment every default-alignment allocation is guaranteed to get.
        /// Anything stricter is an extended-alignment request.
        pub const DEFAULT_ALIGNMENT: usize = 8;
    }
}

pub const SLOT_COUNT: usize = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Allocate,
    Release,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
    Scalar,
    Array,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlignmentClass {
    Default,
    Extended,
}

impl AlignmentClass {
    /// Callers must validate `align` first; zero is not an alignment.
    pub const fn of(align: usize) -> Self {
        if align > DEFAULT_ALIGNMENT {
            AlignmentClass::Extended
        } else {
            AlignmentClass::Default
        }
    }
}

/// How an allocation failure is surfaced to the caller. On release slots this
/// selects between the ordinary entry point and the nothrow one that only the
/// construction-unwind path reaches.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    #[default]
    Throwing,
    Reporting,
}

/// One independently replaceable entry point.
///
/// The set is closed: every combination of [`Operation`], [`ObjectKind`],
/// [`AlignmentClass`] and [`FailureMode`] names exactly one variant, and no
/// other slot exists. Slots are also the index space of the
/// [`CounterRegistry`](crate::CounterRegistry) and the
/// [`OverrideTable`](crate::OverrideTable).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum EntryPointSlot {
    AllocScalar = 0,
    AllocScalarNothrow,
    AllocScalarAligned,
    AllocScalarAlignedNothrow,
    AllocArray,
    AllocArrayNothrow,
    AllocArrayAligned,
    AllocArrayAlignedNothrow,
    ReleaseScalar,
    ReleaseScalarNothrow,
    ReleaseScalarAligned,
    ReleaseScalarAlignedNothrow,
    ReleaseArray,
    ReleaseArrayNothrow,
    ReleaseArrayAligned,
    ReleaseArrayAlignedNothrow,
}

impl EntryPointSlot {
    pub const ALL: [EntryPointSlot; SLOT_COUNT] = [
        EntryPointSlot::AllocScalar,
        EntryPointSlot::AllocScalarNothrow,
        EntryPointSlot::AllocScalarAligned,
        EntryPointSlot::AllocScalarAlignedNothrow,
        EntryPointSlot::AllocArray,
        EntryPointSlot::AllocArrayNothrow,
        EntryPointSlot::AllocArrayAligned,
        EntryPointSlot::AllocArrayAlignedNothrow,
        EntryPointSlot::ReleaseScalar,
        EntryPointSlot::ReleaseScalarNothrow,
        EntryPointSlot::ReleaseScalarAligned,
        EntryPointSlot::ReleaseScalarAlignedNothrow,
        EntryPointSlot::ReleaseArray,
        EntryPointSlot::ReleaseArrayNothrow,
        EntryPointSlot::ReleaseArrayAligned,
        EntryPointSlot::ReleaseArrayAlignedNothrow,
    ];

    /// Bit layout of the discriminant: `op << 3 | kind << 2 | align << 1 | failure`.
    pub const fn new(
        operation: Operation,
        kind: ObjectKind,
        alignment: AlignmentClass,
        failure_mode: FailureMode,
    ) -> Self {
        let index = ((operation as usize) << 3)
            | ((kind as usize) << 2)
            | ((alignment as usize) << 1)
            | (failure_mode as usize);
        Self::ALL[index]
    }

    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    pub const fn operation(self) -> Operation {
        if self.index() & 0b1000 == 0 {
            Operation::Allocate
        } else {
            Operation::Release
        }
    }

    pub const fn kind(self) -> ObjectKind {
        if self.index() & 0b0100 == 0 {
            ObjectKind::Scalar
        } else {
            ObjectKind::Array
        }
    }

    pub const fn alignment(self) -> AlignmentClass {
        if self.index() & 0b0010 == 0 {
            AlignmentClass::Default
        } else {
            AlignmentClass::Extended
        }
    }

    pub const fn failure_mode(self) -> FailureMode {
        if self.index() & 0b0001 == 0 {
            FailureMode::Throwing
        } else {
            FailureMode::Reporting
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            EntryPointSlot::AllocScalar => "alloc_scalar",
            EntryPointSlot::AllocScalarNothrow => "alloc_scalar_nothrow",
            EntryPointSlot::AllocScalarAligned => "alloc_scalar_aligned",
            EntryPointSlot::AllocScalarAlignedNothrow => "alloc_scalar_aligned_nothrow",
            EntryPointSlot::AllocArray => "alloc_array",
            EntryPointSlot::AllocArrayNothrow => "alloc_array_nothrow",
            EntryPointSlot::AllocArrayAligned => "alloc_array_aligned",
            EntryPointSlot::AllocArrayAlignedNothrow => "alloc_array_aligned_nothrow",
            EntryPointSlot::ReleaseScalar => "release_scalar",
            EntryPointSlot::ReleaseScalarNothrow => "release_scalar_nothrow",
            EntryPointSlot::ReleaseScalarAligned => "release_scalar_aligned",
            EntryPointSlot::ReleaseScalarAlignedNothrow => "release_scalar_aligned_nothrow",
            EntryPointSlot::ReleaseArray => "release_array",
            EntryPointSlot::ReleaseArrayNothrow => "release_array_nothrow",
            EntryPointSlot::ReleaseArrayAligned => "release_array_aligned",
            EntryPointSlot::ReleaseArrayAlignedNothrow => "release_array_aligned_nothrow",
        }
    }
}

impl fmt::Display for EntryPointSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for EntryPointSlot {
    type Err = ResolveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|slot| slot.name() == s)
            .ok_or_else(|| ResolveError::InvalidSlot(s.to_string()))
    }
}

impl TryFrom<u8> for EntryPointSlot {
    type Error = ResolveError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::ALL
            .get(value as usize)
            .copied()
            .ok_or_else(|| ResolveError::InvalidSlot(format!("#{value}")))
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Allocate => write!(f, "allocate"),
            Operation::Release => write!(f, "release"),
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectKind::Scalar => write!(f, "scalar"),
            ObjectKind::Array => write!(f, "array"),
        }
    }
}

impl fmt::Display for AlignmentClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlignmentClass::Default => write!(f, "default"),
            AlignmentClass::Extended => write!(f, "extended"),
        }
    }
}

impl fmt::Display for FailureMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureMode::Throwing => write!(f, "throwing"),
            FailureMode::Reporting => write!(f, "reporting"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_are_exhaustive_and_distinct() {
        let ops = [Operation::Allocate, Operation::Release];
        let kinds = [ObjectKind::Scalar, ObjectKind::Array];
        let aligns = [AlignmentClass::Default, AlignmentClass::Extended];
        let modes = [FailureMode::Throwing, FailureMode::Reporting];

        let mut seen = std::collections::HashSet::new();
        for op in ops {
            for kind in kinds {
                for align in aligns {
                    for mode in modes {
                        let slot = EntryPointSlot::new(op, kind, align, mode);
                        assert_eq!(slot.operation(), op);
                        assert_eq!(slot.kind(), kind);
                        assert_eq!(slot.alignment(), align);
                        assert_eq!(slot.failure_mode(), mode);
                        assert!(seen.insert(slot), "{slot} mapped twice");
                    }
                }
            }
        }
        assert_eq!(seen.len(), SLOT_COUNT);
    }

    #[test]
    fn names_round_trip_through_from_str() {
        for slot in EntryPointSlot::ALL {
            assert_eq!(slot.name().parse::<EntryPointSlot>().unwrap(), slot);
        }
    }

    #[test]
    fn unknown_names_and_indices_are_invalid_slots() {
        assert!(matches!(
            "release_everything".parse::<EntryPointSlot>(),
            Err(ResolveError::InvalidSlot(name)) if name == "release_everything"
        ));
        assert!(matches!(
            EntryPointSlot::try_from(SLOT_COUNT as u8),
            Err(ResolveError::InvalidSlot(_))
        ));
        assert_eq!(
            EntryPointSlot::try_from(12).unwrap(),
            EntryPointSlot::ReleaseArray
        );
    }

    #[test]
    fn alignment_class_threshold() {
        assert_eq!(AlignmentClass::of(1), AlignmentClass::Default);
        assert_eq!(AlignmentClass::of(DEFAULT_ALIGNMENT), AlignmentClass::Default);
        assert_eq!(
            AlignmentClass::of(DEFAULT_ALIGNMENT * 2),
            AlignmentClass::Extended
        );
    }

    #[test]
    fn serde_uses_slot_names() {
        let json = serde_json::to_string(&EntryPointSlot::ReleaseArrayAligned).unwrap();
        assert_eq!(json, "\"release_array_aligned\"");
    }
}
