//! Maps from labels to abstract values where a missing label is bottom.
//!
//! The dual of `Environment`: used for heaps, where only labels something was stored at are
//! interesting.

use std::fmt::{self, Debug};

use crate::domains::patricia_tree::{PatriciaKey, PatriciaTreeMap};
use crate::domains::AbstractDomain;

pub struct Partition<K, V> {
    bindings: PatriciaTreeMap<K, V>,
    top: bool,
}

impl<K, V> Clone for Partition<K, V> {
    fn clone(&self) -> Self {
        Partition { bindings: self.bindings.clone(), top: self.top }
    }
}

impl<K: PatriciaKey, V: AbstractDomain> Partition<K, V> {
    pub fn get(&self, k: K) -> V {
        if self.top {
            return V::top();
        }
        self.bindings.get(k).cloned().unwrap_or_else(V::bottom)
    }

    /// No-op on top.
    pub fn set(&mut self, k: K, v: V) {
        if self.top {
            return;
        }
        if v.is_bottom() {
            self.bindings.remove(k);
        } else {
            self.bindings.insert(k, v);
        }
    }

    pub fn update(&mut self, k: K, f: impl FnOnce(&V) -> V) {
        let v = f(&self.get(k));
        self.set(k, v);
    }

    pub fn bindings(&self) -> Vec<(K, &V)> {
        self.bindings.iter().collect()
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }
}

impl<K: PatriciaKey, V: AbstractDomain> PartialEq for Partition<K, V> {
    fn eq(&self, other: &Self) -> bool {
        self.top == other.top && self.bindings == other.bindings
    }
}

impl<K: PatriciaKey + Debug, V: AbstractDomain> Debug for Partition<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.top {
            write!(f, "T")
        } else {
            write!(f, "{:?}", self.bindings)
        }
    }
}

impl<K: PatriciaKey + Debug, V: AbstractDomain> AbstractDomain for Partition<K, V> {
    fn bottom() -> Self {
        Partition { bindings: PatriciaTreeMap::new(), top: false }
    }

    fn top() -> Self {
        Partition { bindings: PatriciaTreeMap::new(), top: true }
    }

    fn is_bottom(&self) -> bool {
        !self.top && self.bindings.is_empty()
    }

    fn is_top(&self) -> bool {
        self.top
    }

    fn leq(&self, other: &Self) -> bool {
        if other.top {
            return true;
        }
        if self.top {
            return false;
        }
        self.bindings.iter().all(|(k, v)| v.leq(&other.get(k)))
    }

    fn join_with(&mut self, other: &Self) {
        if self.top {
            return;
        }
        if other.top {
            *self = Self::top();
            return;
        }
        self.bindings.union_with(&other.bindings, |a, b| Some(a.join(b)));
    }

    fn widen_with(&mut self, other: &Self) {
        if self.top {
            return;
        }
        if other.top {
            *self = Self::top();
            return;
        }
        self.bindings.union_with(&other.bindings, |a, b| Some(a.widening(b)));
    }

    fn meet_with(&mut self, other: &Self) {
        if other.top {
            return;
        }
        if self.top {
            *self = other.clone();
            return;
        }
        self.bindings.intersection_with(&other.bindings, |a, b| {
            let m = a.meet(b);
            (!m.is_bottom()).then_some(m)
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::constant::ConstantDomain;

    type Heap = Partition<u32, ConstantDomain<i64>>;

    #[test]
    fn test_missing_is_bottom() {
        let mut p = Heap::bottom();
        assert!(p.get(4).is_bottom());
        p.set(4, ConstantDomain::value(1));
        assert_eq!(p.get(4), ConstantDomain::value(1));
        p.set(4, ConstantDomain::Bottom);
        assert!(p.is_bottom());
    }

    #[test]
    fn test_join_meet() {
        let mut a = Heap::bottom();
        a.set(1, ConstantDomain::value(1));
        let mut b = Heap::bottom();
        b.set(1, ConstantDomain::value(2));
        b.set(2, ConstantDomain::value(2));
        let j = a.join(&b);
        assert!(j.get(1).is_top());
        assert_eq!(j.get(2), ConstantDomain::value(2));
        assert!(a.meet(&b).is_bottom());
        assert_eq!(Heap::top().meet(&b), b);
        crate::domains::check_lattice_laws(&[Heap::bottom(), Heap::top(), a, b, j]);
    }
}
