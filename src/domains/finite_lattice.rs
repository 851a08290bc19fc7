//! Finite lattices encoded as bit vectors.
//!
//! Elements are numbered in a topological order of the partial order (bottom first). The meet
//! encoding of `x` is the set of elements below it, so `meet` is a bitwise AND and the highest
//! set bit names the element. The join encoding is the set of elements above `x`, where `join`
//! is a bitwise AND and the lowest set bit names the element. Bottom's meet encoding has one
//! bit, top's has all of them.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::marker::PhantomData;

use crate::domains::AbstractDomain;
use crate::error::{DexError, Result};

#[derive(Debug, Clone)]
pub struct FiniteLattice<E> {
    elements: Vec<E>,
    index: HashMap<E, usize>,
    down: Vec<u64>,
    up: Vec<u64>,
}

impl<E: Copy + Eq + Hash + Debug> FiniteLattice<E> {
    /// Builds the lattice from its Hasse diagram, given as `(lower, upper)` covering pairs.
    /// Fails unless the order has a unique bottom and top and every pair of elements has a
    /// meet and a join.
    pub fn new(elements: &[E], hasse: &[(E, E)]) -> Result<Self> {
        let n = elements.len();
        if n == 0 || n > 64 {
            return Err(DexError::new(format!("finite lattice needs 1..=64 elements, got {}", n)));
        }
        for (lo, hi) in hasse {
            if !elements.contains(lo) || !elements.contains(hi) {
                return Err(DexError::new(format!("unknown element in {:?} < {:?}", lo, hi)));
            }
        }
        let lattice = Self::from_trusted(elements, hasse);
        lattice.validate()?;
        Ok(lattice)
    }

    /// `new` without the checks, for the fixed tables the analyses declare.
    pub fn from_trusted(elements: &[E], hasse: &[(E, E)]) -> Self {
        let n = elements.len().min(64);
        let pos: HashMap<E, usize> = elements.iter().take(n).enumerate().map(|(i, e)| (*e, i)).collect();
        let mut above = vec![vec![false; n]; n];
        for (i, row) in above.iter_mut().enumerate() {
            row[i] = true;
        }
        for (lo, hi) in hasse {
            if let (Some(l), Some(h)) = (pos.get(lo), pos.get(hi)) {
                above[*l][*h] = true;
            }
        }
        // transitive closure
        for k in 0..n {
            for i in 0..n {
                if above[i][k] {
                    for j in 0..n {
                        if above[k][j] {
                            above[i][j] = true;
                        }
                    }
                }
            }
        }

        // topological order: fewer elements below comes first
        let mut order: Vec<usize> = (0..n).collect();
        order.sort_by_key(|&x| (0..n).filter(|&y| above[y][x]).count());

        let sorted: Vec<E> = order.iter().map(|&i| elements[i]).collect();
        let mut down = vec![0u64; n];
        let mut up = vec![0u64; n];
        for (a, &x) in order.iter().enumerate() {
            for (b, &y) in order.iter().enumerate() {
                if above[y][x] {
                    down[a] |= 1u64 << b;
                }
                if above[x][y] {
                    up[a] |= 1u64 << b;
                }
            }
        }
        FiniteLattice {
            index: sorted.iter().enumerate().map(|(i, e)| (*e, i)).collect(),
            elements: sorted,
            down,
            up,
        }
    }

    fn validate(&self) -> Result<()> {
        let n = self.elements.len();
        for i in 0..n {
            for j in 0..i {
                if self.down[i] & (1u64 << j) != 0 && self.down[j] & (1u64 << i) != 0 {
                    return Err(DexError::new(format!("order on {:?} is cyclic", self.elements[i])));
                }
            }
        }
        if self.down[0].count_ones() != 1 || self.down[n - 1].count_ones() as usize != n {
            return Err(DexError::new("finite lattice needs a unique bottom and top"));
        }
        for i in 0..n {
            for j in 0..n {
                let m = self.down[i] & self.down[j];
                if m == 0 || self.down[63 - m.leading_zeros() as usize] != m {
                    return Err(DexError::new(format!(
                        "{:?} and {:?} have no meet",
                        self.elements[i], self.elements[j]
                    )));
                }
                let u = self.up[i] & self.up[j];
                if u == 0 || self.up[u.trailing_zeros() as usize] != u {
                    return Err(DexError::new(format!(
                        "{:?} and {:?} have no join",
                        self.elements[i], self.elements[j]
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn elements(&self) -> &[E] {
        &self.elements
    }

    pub fn bottom(&self) -> E {
        self.elements[0]
    }

    pub fn top(&self) -> E {
        self.elements[self.elements.len() - 1]
    }

    fn ix(&self, e: E) -> usize {
        // elements come from the lattice's own enum; an unknown one is treated as top
        self.index.get(&e).copied().unwrap_or(self.elements.len() - 1)
    }

    /// The meet encoding of `e`.
    pub fn encode(&self, e: E) -> u64 {
        self.down[self.ix(e)]
    }

    pub fn decode(&self, bits: u64) -> Option<E> {
        if bits == 0 {
            return None;
        }
        let i = 63 - bits.leading_zeros() as usize;
        (self.down.get(i) == Some(&bits)).then(|| self.elements[i])
    }

    pub fn leq(&self, x: E, y: E) -> bool {
        let (x, y) = (self.encode(x), self.encode(y));
        x & y == x
    }

    pub fn meet(&self, x: E, y: E) -> E {
        let m = self.encode(x) & self.encode(y);
        self.elements[63 - m.leading_zeros() as usize]
    }

    pub fn join(&self, x: E, y: E) -> E {
        let u = self.up[self.ix(x)] & self.up[self.ix(y)];
        self.elements[u.trailing_zeros() as usize]
    }
}

/// Names a lattice held in a static.
pub trait LatticeSpec: Clone + Debug + PartialEq {
    type Element: Copy + Eq + Hash + Debug + 'static;

    fn lattice() -> &'static FiniteLattice<Self::Element>;
}

/// A value of the finite lattice `L`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FiniteDomain<L: LatticeSpec> {
    element: L::Element,
    _lattice: PhantomData<L>,
}

impl<L: LatticeSpec> FiniteDomain<L> {
    pub fn new(element: L::Element) -> Self {
        FiniteDomain { element, _lattice: PhantomData }
    }

    pub fn element(&self) -> L::Element {
        self.element
    }
}

impl<L: LatticeSpec> Debug for FiniteDomain<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.element)
    }
}

impl<L: LatticeSpec> AbstractDomain for FiniteDomain<L> {
    fn bottom() -> Self {
        Self::new(L::lattice().bottom())
    }

    fn top() -> Self {
        Self::new(L::lattice().top())
    }

    fn is_bottom(&self) -> bool {
        self.element == L::lattice().bottom()
    }

    fn is_top(&self) -> bool {
        self.element == L::lattice().top()
    }

    fn leq(&self, other: &Self) -> bool {
        L::lattice().leq(self.element, other.element)
    }

    fn join_with(&mut self, other: &Self) {
        self.element = L::lattice().join(self.element, other.element);
    }

    fn meet_with(&mut self, other: &Self) {
        self.element = L::lattice().meet(self.element, other.element);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum D {
        Bot,
        A,
        B,
        C,
        Top,
    }

    fn diamond() -> FiniteLattice<D> {
        // listed out of order on purpose
        FiniteLattice::new(
            &[D::Top, D::C, D::A, D::Bot, D::B],
            &[(D::Bot, D::A), (D::Bot, D::B), (D::Bot, D::C), (D::A, D::Top), (D::B, D::Top), (D::C, D::Top)],
        )
        .unwrap()
    }

    #[test]
    fn test_encoding_shape() {
        let l = diamond();
        assert_eq!(l.bottom(), D::Bot);
        assert_eq!(l.top(), D::Top);
        assert_eq!(l.encode(D::Bot).count_ones(), 1);
        assert_eq!(l.encode(D::Top).count_ones(), 5);
        let mut zeros: Vec<u32> = l.elements().iter().map(|e| l.encode(*e).leading_zeros()).collect();
        zeros.sort();
        zeros.dedup();
        assert_eq!(zeros.len(), 5);
        for e in l.elements() {
            assert_eq!(l.decode(l.encode(*e)), Some(*e));
        }
    }

    #[test]
    fn test_meet_join() {
        let l = diamond();
        assert_eq!(l.meet(D::A, D::B), D::Bot);
        assert_eq!(l.join(D::A, D::B), D::Top);
        assert_eq!(l.join(D::A, D::Bot), D::A);
        assert_eq!(l.meet(D::C, D::Top), D::C);
        assert!(l.leq(D::Bot, D::C));
        assert!(!l.leq(D::A, D::C));
        for x in l.elements() {
            for y in l.elements() {
                let m = l.meet(*x, *y);
                let j = l.join(*x, *y);
                assert!(l.leq(m, *x) && l.leq(m, *y));
                assert!(l.leq(*x, j) && l.leq(*y, j));
            }
        }
    }

    #[test]
    fn test_rejects_non_lattice() {
        // two maximal elements
        assert!(FiniteLattice::new(&[D::Bot, D::A, D::B], &[(D::Bot, D::A), (D::Bot, D::B)]).is_err());
        // cycle
        assert!(FiniteLattice::new(&[D::A, D::B], &[(D::A, D::B), (D::B, D::A)]).is_err());
    }
}
