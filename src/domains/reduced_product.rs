//! Products of two domains with a reduction step.
//!
//! The product is smashing: if either side is bottom, both are. After a meet the `Reduce`
//! hook lets each side sharpen the other.

use std::fmt::{self, Debug};
use std::marker::PhantomData;

use crate::domains::AbstractDomain;

pub trait Reduce<A, B> {
    fn reduce(first: &mut A, second: &mut B);
}

/// No cross-component reduction.
pub struct NoReduce;

impl<A, B> Reduce<A, B> for NoReduce {
    fn reduce(_: &mut A, _: &mut B) {}
}

pub struct ReducedProduct<A, B, R = NoReduce> {
    first: A,
    second: B,
    _reduce: PhantomData<fn() -> R>,
}

impl<A: AbstractDomain, B: AbstractDomain, R: Reduce<A, B>> ReducedProduct<A, B, R> {
    pub fn new(first: A, second: B) -> Self {
        let mut p = ReducedProduct { first, second, _reduce: PhantomData };
        p.normalize();
        p
    }

    pub fn first(&self) -> &A {
        &self.first
    }

    pub fn second(&self) -> &B {
        &self.second
    }

    pub fn set_first(&mut self, a: A) {
        self.first = a;
        self.normalize();
    }

    pub fn set_second(&mut self, b: B) {
        self.second = b;
        self.normalize();
    }

    fn normalize(&mut self) {
        if !self.first.is_bottom() && !self.second.is_bottom() {
            R::reduce(&mut self.first, &mut self.second);
        }
        if self.first.is_bottom() || self.second.is_bottom() {
            self.first = A::bottom();
            self.second = B::bottom();
        }
    }
}

impl<A: Clone, B: Clone, R> Clone for ReducedProduct<A, B, R> {
    fn clone(&self) -> Self {
        ReducedProduct { first: self.first.clone(), second: self.second.clone(), _reduce: PhantomData }
    }
}

impl<A: PartialEq, B: PartialEq, R> PartialEq for ReducedProduct<A, B, R> {
    fn eq(&self, other: &Self) -> bool {
        self.first == other.first && self.second == other.second
    }
}

impl<A: Debug, B: Debug, R> Debug for ReducedProduct<A, B, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:?}, {:?})", self.first, self.second)
    }
}

impl<A: AbstractDomain, B: AbstractDomain, R: Reduce<A, B>> AbstractDomain for ReducedProduct<A, B, R> {
    fn bottom() -> Self {
        ReducedProduct { first: A::bottom(), second: B::bottom(), _reduce: PhantomData }
    }

    fn top() -> Self {
        ReducedProduct { first: A::top(), second: B::top(), _reduce: PhantomData }
    }

    fn is_bottom(&self) -> bool {
        self.first.is_bottom()
    }

    fn is_top(&self) -> bool {
        self.first.is_top() && self.second.is_top()
    }

    fn leq(&self, other: &Self) -> bool {
        self.is_bottom() || (self.first.leq(&other.first) && self.second.leq(&other.second))
    }

    fn join_with(&mut self, other: &Self) {
        if other.is_bottom() {
            return;
        }
        if self.is_bottom() {
            *self = other.clone();
            return;
        }
        self.first.join_with(&other.first);
        self.second.join_with(&other.second);
        self.normalize();
    }

    fn widen_with(&mut self, other: &Self) {
        if other.is_bottom() {
            return;
        }
        if self.is_bottom() {
            *self = other.clone();
            return;
        }
        self.first.widen_with(&other.first);
        self.second.widen_with(&other.second);
    }

    fn meet_with(&mut self, other: &Self) {
        self.first.meet_with(&other.first);
        self.second.meet_with(&other.second);
        self.normalize();
    }

    fn narrow_with(&mut self, other: &Self) {
        self.first.narrow_with(&other.first);
        self.second.narrow_with(&other.second);
        self.normalize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::constant::ConstantDomain;

    type Pair = ReducedProduct<ConstantDomain<i32>, ConstantDomain<bool>>;

    #[test]
    fn test_smashing_bottom() {
        let p = Pair::new(ConstantDomain::value(1), ConstantDomain::Bottom);
        assert!(p.is_bottom());
        assert_eq!(p, Pair::bottom());
        let q = Pair::new(ConstantDomain::value(1), ConstantDomain::value(true));
        assert!(q.meet(&Pair::new(ConstantDomain::value(2), ConstantDomain::Top)).is_bottom());
        assert_eq!(q.join(&Pair::bottom()), q);
    }
}
