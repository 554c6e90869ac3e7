// archetype.rs - component-set bitmasks
//
// An archetype is the exact set of component kinds an entity carries.
// Two entities with the same bitmask share one column store.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use super::component::{ComponentKind, NUM_COMPONENT_KINDS};

/// Bitmask over the declared component kinds.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Archetype(u32);

impl Archetype {
    /// The empty component set; marks a free entity slot.
    pub const EMPTY: Archetype = Archetype(0);

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    #[inline]
    pub fn bits(self) -> u32 {
        self.0
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn contains(self, kind: ComponentKind) -> bool {
        self.0 & kind.bit() != 0
    }

    /// Whether every kind in `required` is present.
    #[inline]
    pub fn contains_all(self, required: Archetype) -> bool {
        self.0 & required.0 == required.0
    }

    #[inline]
    pub fn is_disjoint(self, other: Archetype) -> bool {
        self.0 & other.0 == 0
    }

    #[inline]
    pub fn component_count(self) -> usize {
        self.0.count_ones() as usize
    }

    /// Column index of `kind` within a block of this archetype.
    ///
    /// Entry 0 is the back-reference column, so a present kind lands at
    /// 1 + the number of present kinds below it.
    #[inline]
    pub fn component_index(self, kind: ComponentKind) -> usize {
        1 + (self.0 & (kind.bit() - 1)).count_ones() as usize
    }

    /// Present kinds in ascending kind-index order.
    pub fn kinds(self) -> impl Iterator<Item = ComponentKind> {
        (0..NUM_COMPONENT_KINDS)
            .map(ComponentKind::from_index)
            .filter(move |kind| self.contains(*kind))
    }
}

impl From<ComponentKind> for Archetype {
    fn from(kind: ComponentKind) -> Self {
        Archetype(kind.bit())
    }
}

impl BitOr for Archetype {
    type Output = Archetype;
    fn bitor(self, rhs: Archetype) -> Archetype {
        Archetype(self.0 | rhs.0)
    }
}

impl BitOr<ComponentKind> for Archetype {
    type Output = Archetype;
    fn bitor(self, rhs: ComponentKind) -> Archetype {
        Archetype(self.0 | rhs.bit())
    }
}

impl BitOr<ComponentKind> for ComponentKind {
    type Output = Archetype;
    fn bitor(self, rhs: ComponentKind) -> Archetype {
        Archetype(self.bit() | rhs.bit())
    }
}

impl BitOrAssign for Archetype {
    fn bitor_assign(&mut self, rhs: Archetype) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for Archetype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "Archetype(empty)");
        }
        write!(f, "Archetype(")?;
        for (position, kind) in self.kinds().enumerate() {
            if position > 0 {
                write!(f, "|")?;
            }
            write!(f, "{kind:?}")?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ecs::component::ComponentKind::*;

    #[test]
    fn test_mask_queries() {
        let archetype = Position | Velocity | Scale;
        assert!(archetype.contains(Position));
        assert!(!archetype.contains(Rotation));
        assert_eq!(archetype.component_count(), 3);

        assert!(archetype.contains_all(Position | Velocity));
        assert!(!archetype.contains_all(Position | Rotation));
        assert!(archetype.is_disjoint(Rotation | Behavior));
        assert!(!archetype.is_disjoint(Scale.into()));
    }

    #[test]
    fn test_component_index_counts_lower_present_kinds() {
        let archetype = Position | Rotation | Scale;
        // Entry 0 is the back-reference column.
        assert_eq!(archetype.component_index(Position), 1);
        assert_eq!(archetype.component_index(Rotation), 2);
        assert_eq!(archetype.component_index(Scale), 3);
    }

    #[test]
    fn test_kinds_iterate_ascending() {
        let archetype = Scale | Position | DestroyTimer;
        let kinds: Vec<_> = archetype.kinds().collect();
        assert_eq!(kinds, vec![Position, Scale, DestroyTimer]);
    }
}
