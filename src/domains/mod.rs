//! Abstract domains for the dataflow analyses.
//!
//! Every domain is a lattice with a bottom and a top element. Values are kept in a canonical
//! form so that `==` is lattice equality.

use std::fmt::Debug;

pub mod constant;
pub mod disjoint_union;
pub mod environment;
pub mod finite_lattice;
pub mod partition;
pub mod patricia_tree;
pub mod reduced_product;
pub mod sign;
pub mod signed_constant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinResult {
    Unchanged,
    Changed,
}

pub trait AbstractDomain: Clone + PartialEq + Debug + Sized {
    fn bottom() -> Self;

    fn top() -> Self;

    fn is_bottom(&self) -> bool;

    fn is_top(&self) -> bool;

    fn leq(&self, other: &Self) -> bool;

    fn join_with(&mut self, other: &Self);

    fn meet_with(&mut self, other: &Self);

    /// Defaults to join, which is enough for domains of finite height.
    fn widen_with(&mut self, other: &Self) {
        self.join_with(other)
    }

    fn narrow_with(&mut self, other: &Self) {
        self.meet_with(other)
    }

    fn join(&self, other: &Self) -> Self {
        let mut out = self.clone();
        out.join_with(other);
        out
    }

    fn meet(&self, other: &Self) -> Self {
        let mut out = self.clone();
        out.meet_with(other);
        out
    }

    fn widening(&self, other: &Self) -> Self {
        let mut out = self.clone();
        out.widen_with(other);
        out
    }

    fn set_to_bottom(&mut self) {
        *self = Self::bottom();
    }

    fn set_to_top(&mut self) {
        *self = Self::top();
    }

    /// Joins and reports whether `self` moved.
    fn join_changed(&mut self, other: &Self) -> JoinResult {
        let old = self.clone();
        self.join_with(other);
        if *self == old {
            JoinResult::Unchanged
        } else {
            JoinResult::Changed
        }
    }
}

/// Checks the lattice laws on a sample of values; shared by the domain tests.
#[cfg(test)]
pub(crate) fn check_lattice_laws<D: AbstractDomain>(values: &[D]) {
    let bottom = D::bottom();
    let top = D::top();
    assert!(bottom.is_bottom() && top.is_top());
    for x in values {
        assert!(bottom.leq(x), "bottom <= {:?}", x);
        assert!(x.leq(&top), "{:?} <= top", x);
        assert_eq!(x.join(x), *x);
        assert_eq!(x.meet(x), *x);
        for y in values {
            let j = x.join(y);
            let m = x.meet(y);
            assert!(x.leq(&j) && y.leq(&j), "join({:?}, {:?}) = {:?}", x, y, j);
            assert!(m.leq(x) && m.leq(y), "meet({:?}, {:?}) = {:?}", x, y, m);
            assert_eq!(j, y.join(x));
            assert_eq!(m, y.meet(x));
            for z in values {
                assert_eq!(x.join(y).join(z), x.join(&y.join(z)));
            }
        }
    }
}
