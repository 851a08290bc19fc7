//! Integers known by sign, exact value, or both.

use std::fmt;

use crate::domains::constant::ConstantDomain;
use crate::domains::reduced_product::{Reduce, ReducedProduct};
use crate::domains::sign::{Sign, SignDomain};
use crate::domains::AbstractDomain;

pub struct SignConstantReduce;

impl Reduce<SignDomain, ConstantDomain<i64>> for SignConstantReduce {
    fn reduce(sign: &mut SignDomain, constant: &mut ConstantDomain<i64>) {
        match constant.get_constant() {
            Some(v) => {
                let s = sign.element().meet(Sign::of(*v));
                *sign = SignDomain::new(s);
                if s == Sign::Bottom {
                    *constant = ConstantDomain::Bottom;
                }
            }
            None if sign.element() == Sign::Eqz && constant.is_top() => *constant = ConstantDomain::value(0),
            None => {}
        }
    }
}

#[derive(Clone, PartialEq)]
pub struct SignedConstantDomain(ReducedProduct<SignDomain, ConstantDomain<i64>, SignConstantReduce>);

impl SignedConstantDomain {
    pub fn from_constant(v: i64) -> Self {
        SignedConstantDomain(ReducedProduct::new(SignDomain::new(Sign::of(v)), ConstantDomain::value(v)))
    }

    pub fn from_sign(s: Sign) -> Self {
        SignedConstantDomain(ReducedProduct::new(SignDomain::new(s), ConstantDomain::Top))
    }

    pub fn nez() -> Self {
        Self::from_sign(Sign::Nez)
    }

    pub fn get_constant(&self) -> Option<i64> {
        self.0.second().get_constant().copied()
    }

    pub fn interval(&self) -> Sign {
        self.0.first().element()
    }

    pub fn contains(&self, v: i64) -> bool {
        match self.get_constant() {
            Some(c) => c == v,
            None => self.interval().contains(v),
        }
    }

    pub fn min_element(&self) -> Option<i64> {
        self.get_constant().or_else(|| self.interval().min_value())
    }

    pub fn max_element(&self) -> Option<i64> {
        self.get_constant().or_else(|| self.interval().max_value())
    }
}

impl fmt::Debug for SignedConstantDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.get_constant() {
            Some(v) => write!(f, "{}", v),
            None => write!(f, "{:?}", self.interval()),
        }
    }
}

impl AbstractDomain for SignedConstantDomain {
    fn bottom() -> Self {
        SignedConstantDomain(ReducedProduct::bottom())
    }

    fn top() -> Self {
        SignedConstantDomain(ReducedProduct::top())
    }

    fn is_bottom(&self) -> bool {
        self.0.is_bottom()
    }

    fn is_top(&self) -> bool {
        self.0.is_top()
    }

    fn leq(&self, other: &Self) -> bool {
        self.0.leq(&other.0)
    }

    fn join_with(&mut self, other: &Self) {
        self.0.join_with(&other.0)
    }

    fn meet_with(&mut self, other: &Self) {
        self.0.meet_with(&other.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn c(v: i64) -> SignedConstantDomain {
        SignedConstantDomain::from_constant(v)
    }

    #[test]
    fn test_join_keeps_sign() {
        assert_eq!(c(1).join(&c(2)), SignedConstantDomain::from_sign(Sign::Gtz));
        assert_eq!(c(0).join(&c(5)), SignedConstantDomain::from_sign(Sign::Gez));
        assert_eq!(c(-1).join(&c(1)), SignedConstantDomain::nez());
        assert!(c(3).join(&c(3)).get_constant() == Some(3));
    }

    #[test]
    fn test_meet_reduces() {
        let eqz = SignedConstantDomain::from_sign(Sign::Gez).meet(&SignedConstantDomain::from_sign(Sign::Lez));
        assert_eq!(eqz.get_constant(), Some(0));
        assert_eq!(eqz, c(0));
        assert!(c(0).meet(&SignedConstantDomain::nez()).is_bottom());
        assert!(c(4).meet(&SignedConstantDomain::from_sign(Sign::Ltz)).is_bottom());
        assert_eq!(c(4).meet(&SignedConstantDomain::from_sign(Sign::Gez)), c(4));
    }

    #[test]
    fn test_bounds() {
        let ltz = SignedConstantDomain::from_sign(Sign::Ltz);
        assert_eq!(ltz.max_element(), Some(-1));
        assert_eq!(ltz.min_element(), Some(i64::MIN));
        assert_eq!(c(9).max_element(), Some(9));
        assert!(SignedConstantDomain::top().contains(12));
        assert!(!ltz.contains(0));
    }

    #[test]
    fn test_lattice_laws() {
        let mut values = vec![SignedConstantDomain::bottom(), SignedConstantDomain::top(), c(-2), c(0), c(7)];
        for s in [Sign::Ltz, Sign::Gtz, Sign::Lez, Sign::Gez, Sign::Nez] {
            values.push(SignedConstantDomain::from_sign(s));
        }
        crate::domains::check_lattice_laws(&values);
    }
}
