//! Maps from variables to abstract values.
//!
//! A variable without a binding is top. Binding any variable to bottom makes the whole
//! environment bottom.

use std::fmt::{self, Debug};

use crate::domains::patricia_tree::{PatriciaKey, PatriciaTreeMap};
use crate::domains::AbstractDomain;

pub struct Environment<K, V> {
    bindings: PatriciaTreeMap<K, V>,
    bottom: bool,
}

impl<K, V> Clone for Environment<K, V> {
    fn clone(&self) -> Self {
        Environment { bindings: self.bindings.clone(), bottom: self.bottom }
    }
}

impl<K: PatriciaKey + Debug, V: AbstractDomain> Environment<K, V> {
    pub fn get(&self, k: K) -> V {
        if self.bottom {
            return V::bottom();
        }
        self.bindings.get(k).cloned().unwrap_or_else(V::top)
    }

    pub fn set(&mut self, k: K, v: V) {
        if self.bottom {
            return;
        }
        if v.is_bottom() {
            self.set_to_bottom();
        } else if v.is_top() {
            self.bindings.remove(k);
        } else {
            self.bindings.insert(k, v);
        }
    }

    pub fn with(mut self, k: K, v: V) -> Self {
        self.set(k, v);
        self
    }

    pub fn update(&mut self, k: K, f: impl FnOnce(&V) -> V) {
        let v = f(&self.get(k));
        self.set(k, v);
    }

    /// Bindings other than top, in key order.
    pub fn bindings(&self) -> Vec<(K, &V)> {
        self.bindings.iter().collect()
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    fn normalize(&mut self) {
        if self.bindings.iter().any(|(_, v)| v.is_bottom()) {
            self.set_to_bottom();
        }
    }
}

/// The empty environment, binding every key to top.
impl<K: PatriciaKey + Debug, V: AbstractDomain> Default for Environment<K, V> {
    fn default() -> Self {
        Self::top()
    }
}

impl<K: PatriciaKey, V: AbstractDomain> PartialEq for Environment<K, V> {
    fn eq(&self, other: &Self) -> bool {
        self.bottom == other.bottom && self.bindings == other.bindings
    }
}

impl<K: PatriciaKey + Debug, V: AbstractDomain> Debug for Environment<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.bottom {
            write!(f, "_|_")
        } else {
            write!(f, "{:?}", self.bindings)
        }
    }
}

impl<K: PatriciaKey + Debug, V: AbstractDomain> AbstractDomain for Environment<K, V> {
    fn bottom() -> Self {
        Environment { bindings: PatriciaTreeMap::new(), bottom: true }
    }

    fn top() -> Self {
        Environment { bindings: PatriciaTreeMap::new(), bottom: false }
    }

    fn is_bottom(&self) -> bool {
        self.bottom
    }

    fn is_top(&self) -> bool {
        !self.bottom && self.bindings.is_empty()
    }

    fn leq(&self, other: &Self) -> bool {
        if self.bottom {
            return true;
        }
        if other.bottom {
            return false;
        }
        other.bindings.iter().all(|(k, v)| self.get(k).leq(v))
    }

    fn join_with(&mut self, other: &Self) {
        if other.bottom {
            return;
        }
        if self.bottom {
            *self = other.clone();
            return;
        }
        self.bindings.intersection_with(&other.bindings, |a, b| {
            let j = a.join(b);
            (!j.is_top()).then_some(j)
        });
    }

    fn widen_with(&mut self, other: &Self) {
        if other.bottom {
            return;
        }
        if self.bottom {
            *self = other.clone();
            return;
        }
        self.bindings.intersection_with(&other.bindings, |a, b| {
            let w = a.widening(b);
            (!w.is_top()).then_some(w)
        });
    }

    fn meet_with(&mut self, other: &Self) {
        if self.bottom {
            return;
        }
        if other.bottom {
            self.set_to_bottom();
            return;
        }
        self.bindings.union_with(&other.bindings, |a, b| Some(a.meet(b)));
        self.normalize();
    }

    fn narrow_with(&mut self, other: &Self) {
        if self.bottom {
            return;
        }
        if other.bottom {
            self.set_to_bottom();
            return;
        }
        self.bindings.union_with(&other.bindings, |a, b| {
            let mut n = a.clone();
            n.narrow_with(b);
            Some(n)
        });
        self.normalize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::constant::ConstantDomain;

    type Env = Environment<u32, ConstantDomain<i64>>;

    fn c(v: i64) -> ConstantDomain<i64> {
        ConstantDomain::value(v)
    }

    #[test]
    fn test_bottom_is_absorbing() {
        let mut env = Env::top().with(0, c(1));
        env.set(1, ConstantDomain::bottom());
        assert!(env.is_bottom());
        env.set(2, c(5));
        assert!(env.is_bottom());
        assert!(env.get(2).is_bottom());
    }

    #[test]
    fn test_top_is_erase() {
        let mut env = Env::top().with(0, c(1)).with(3, c(2));
        env.set(0, ConstantDomain::top());
        assert_eq!(env, Env::top().with(3, c(2)));
        assert_eq!(Env::default(), Env::top());
        assert_eq!(env.len(), 1);
        assert!(env.get(0).is_top());
    }

    #[test]
    fn test_join_meet() {
        let a = Env::top().with(0, c(1)).with(1, c(2));
        let b = Env::top().with(0, c(1)).with(1, c(3)).with(2, c(4));
        assert_eq!(a.join(&b), Env::top().with(0, c(1)));
        assert_eq!(a.meet(&Env::top().with(2, c(4))), a.clone().with(2, c(4)));
        assert!(a.meet(&b).is_bottom());
        assert!(a.join(&b).leq(&Env::top()));
        assert!(b.leq(&a.join(&b)));
        assert_eq!(Env::bottom().join(&a), a);
    }

    #[test]
    fn test_lattice_laws() {
        let values = vec![
            Env::bottom(),
            Env::top(),
            Env::top().with(0, c(1)),
            Env::top().with(0, c(2)),
            Env::top().with(0, c(1)).with(1, c(1)),
            Env::top().with(1, c(1)),
        ];
        crate::domains::check_lattice_laws(&values);
    }
}
