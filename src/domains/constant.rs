//! Flat lattice over a set of constants.

use std::fmt::Debug;

use crate::domains::AbstractDomain;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ConstantDomain<T> {
    Bottom,
    Value(T),
    Top,
}

impl<T> ConstantDomain<T> {
    pub fn value(v: T) -> Self {
        ConstantDomain::Value(v)
    }

    pub fn get_constant(&self) -> Option<&T> {
        match self {
            ConstantDomain::Value(v) => Some(v),
            _ => None,
        }
    }
}

impl<T: Clone + PartialEq + Debug> AbstractDomain for ConstantDomain<T> {
    fn bottom() -> Self {
        ConstantDomain::Bottom
    }

    fn top() -> Self {
        ConstantDomain::Top
    }

    fn is_bottom(&self) -> bool {
        matches!(self, ConstantDomain::Bottom)
    }

    fn is_top(&self) -> bool {
        matches!(self, ConstantDomain::Top)
    }

    fn leq(&self, other: &Self) -> bool {
        match (self, other) {
            (ConstantDomain::Bottom, _) | (_, ConstantDomain::Top) => true,
            (ConstantDomain::Value(a), ConstantDomain::Value(b)) => a == b,
            _ => false,
        }
    }

    fn join_with(&mut self, other: &Self) {
        let next = match (&*self, other) {
            (_, ConstantDomain::Bottom) | (ConstantDomain::Top, _) => return,
            (ConstantDomain::Bottom, o) => o.clone(),
            (ConstantDomain::Value(a), ConstantDomain::Value(b)) if a == b => return,
            _ => ConstantDomain::Top,
        };
        *self = next;
    }

    fn meet_with(&mut self, other: &Self) {
        let next = match (&*self, other) {
            (_, ConstantDomain::Top) | (ConstantDomain::Bottom, _) => return,
            (ConstantDomain::Top, o) => o.clone(),
            (ConstantDomain::Value(a), ConstantDomain::Value(b)) if a == b => return,
            _ => ConstantDomain::Bottom,
        };
        *self = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flat_lattice() {
        let one = ConstantDomain::value(1);
        let two = ConstantDomain::value(2);
        assert_eq!(one.join(&two), ConstantDomain::Top);
        assert_eq!(one.meet(&two), ConstantDomain::Bottom);
        assert_eq!(one.join(&ConstantDomain::Bottom), one);
        assert_eq!(one.get_constant(), Some(&1));
        crate::domains::check_lattice_laws(&[ConstantDomain::Bottom, one, two, ConstantDomain::Top]);
    }
}
