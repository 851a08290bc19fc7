//! Disjoint union of two domains.
//!
//! Values of different sides never mix: their join is top and their meet is bottom. A side's
//! own top or bottom collapses to the union's.

use std::fmt::Debug;

use crate::domains::AbstractDomain;

#[derive(Debug, Clone, PartialEq)]
pub enum DisjointUnion<A, B> {
    Bottom,
    Left(A),
    Right(B),
    Top,
}

impl<A: AbstractDomain, B: AbstractDomain> DisjointUnion<A, B> {
    pub fn left(a: A) -> Self {
        if a.is_bottom() {
            DisjointUnion::Bottom
        } else if a.is_top() {
            DisjointUnion::Top
        } else {
            DisjointUnion::Left(a)
        }
    }

    pub fn right(b: B) -> Self {
        if b.is_bottom() {
            DisjointUnion::Bottom
        } else if b.is_top() {
            DisjointUnion::Top
        } else {
            DisjointUnion::Right(b)
        }
    }

    pub fn get_left(&self) -> Option<&A> {
        match self {
            DisjointUnion::Left(a) => Some(a),
            _ => None,
        }
    }

    pub fn get_right(&self) -> Option<&B> {
        match self {
            DisjointUnion::Right(b) => Some(b),
            _ => None,
        }
    }
}

impl<A: AbstractDomain, B: AbstractDomain> AbstractDomain for DisjointUnion<A, B> {
    fn bottom() -> Self {
        DisjointUnion::Bottom
    }

    fn top() -> Self {
        DisjointUnion::Top
    }

    fn is_bottom(&self) -> bool {
        matches!(self, DisjointUnion::Bottom)
    }

    fn is_top(&self) -> bool {
        matches!(self, DisjointUnion::Top)
    }

    fn leq(&self, other: &Self) -> bool {
        match (self, other) {
            (DisjointUnion::Bottom, _) | (_, DisjointUnion::Top) => true,
            (DisjointUnion::Left(a), DisjointUnion::Left(b)) => a.leq(b),
            (DisjointUnion::Right(a), DisjointUnion::Right(b)) => a.leq(b),
            _ => false,
        }
    }

    fn join_with(&mut self, other: &Self) {
        let next = match (&*self, other) {
            (_, DisjointUnion::Bottom) | (DisjointUnion::Top, _) => return,
            (DisjointUnion::Bottom, o) => o.clone(),
            (DisjointUnion::Left(a), DisjointUnion::Left(b)) => Self::left(a.join(b)),
            (DisjointUnion::Right(a), DisjointUnion::Right(b)) => Self::right(a.join(b)),
            _ => DisjointUnion::Top,
        };
        *self = next;
    }

    fn widen_with(&mut self, other: &Self) {
        let next = match (&*self, other) {
            (_, DisjointUnion::Bottom) | (DisjointUnion::Top, _) => return,
            (DisjointUnion::Bottom, o) => o.clone(),
            (DisjointUnion::Left(a), DisjointUnion::Left(b)) => Self::left(a.widening(b)),
            (DisjointUnion::Right(a), DisjointUnion::Right(b)) => Self::right(a.widening(b)),
            _ => DisjointUnion::Top,
        };
        *self = next;
    }

    fn meet_with(&mut self, other: &Self) {
        let next = match (&*self, other) {
            (_, DisjointUnion::Top) | (DisjointUnion::Bottom, _) => return,
            (DisjointUnion::Top, o) => o.clone(),
            (DisjointUnion::Left(a), DisjointUnion::Left(b)) => Self::left(a.meet(b)),
            (DisjointUnion::Right(a), DisjointUnion::Right(b)) => Self::right(a.meet(b)),
            _ => DisjointUnion::Bottom,
        };
        *self = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::constant::ConstantDomain;

    type U = DisjointUnion<ConstantDomain<i32>, ConstantDomain<&'static str>>;

    #[test]
    fn test_sides_do_not_mix() {
        let l = U::left(ConstantDomain::value(1));
        let r = U::right(ConstantDomain::value("a"));
        assert!(l.join(&r).is_top());
        assert!(l.meet(&r).is_bottom());
        assert!(U::left(ConstantDomain::value(1)).join(&U::left(ConstantDomain::value(2))).is_top());
        assert_eq!(U::left(ConstantDomain::Bottom), U::Bottom);
        assert_eq!(r.get_right(), Some(&ConstantDomain::value("a")));
        crate::domains::check_lattice_laws(&[U::Bottom, U::Top, l, r, U::left(ConstantDomain::value(3))]);
    }
}
