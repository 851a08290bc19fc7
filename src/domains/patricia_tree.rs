//! Persistent big-endian Patricia trees keyed by 32-bit integers.
//!
//! Nodes are shared through `Arc`, so cloning a map is O(1) and the merge operations skip
//! subtrees both sides share. In-order traversal yields keys in ascending order.

use std::fmt::{self, Debug};
use std::marker::PhantomData;
use std::sync::Arc;

use crate::ir::interner::{FieldId, MethodId, TypeId};

/// Keys that map onto `u32`.
pub trait PatriciaKey: Copy {
    fn to_key(self) -> u32;
    fn from_key(key: u32) -> Self;
}

impl PatriciaKey for u32 {
    fn to_key(self) -> u32 {
        self
    }

    fn from_key(key: u32) -> Self {
        key
    }
}

macro_rules! id_key {
    ($($id:ty),*) => {
        $(
            impl PatriciaKey for $id {
                fn to_key(self) -> u32 {
                    self.index() as u32
                }

                fn from_key(key: u32) -> Self {
                    <$id>::from(key)
                }
            }
        )*
    };
}

id_key!(FieldId, MethodId, TypeId);

enum Node<V> {
    Leaf { key: u32, value: V },
    Branch { prefix: u32, bit: u32, left: Arc<Node<V>>, right: Arc<Node<V>> },
}

fn mask(k: u32, bit: u32) -> u32 {
    k & !(bit | (bit - 1))
}

fn zero_bit(k: u32, bit: u32) -> bool {
    k & bit == 0
}

fn match_prefix(k: u32, prefix: u32, bit: u32) -> bool {
    mask(k, bit) == prefix
}

fn branching_bit(p0: u32, p1: u32) -> u32 {
    let diff = p0 ^ p1;
    1 << (31 - diff.leading_zeros())
}

fn prefix_of<V>(n: &Node<V>) -> u32 {
    match n {
        Node::Leaf { key, .. } => *key,
        Node::Branch { prefix, .. } => *prefix,
    }
}

type Tree<V> = Option<Arc<Node<V>>>;

fn leaf<V>(key: u32, value: V) -> Arc<Node<V>> {
    Arc::new(Node::Leaf { key, value })
}

fn join_trees<V>(t0: Arc<Node<V>>, t1: Arc<Node<V>>) -> Arc<Node<V>> {
    let (p0, p1) = (prefix_of(&t0), prefix_of(&t1));
    let bit = branching_bit(p0, p1);
    let prefix = mask(p0, bit);
    if zero_bit(p0, bit) {
        Arc::new(Node::Branch { prefix, bit, left: t0, right: t1 })
    } else {
        Arc::new(Node::Branch { prefix, bit, left: t1, right: t0 })
    }
}

fn make_branch<V>(prefix: u32, bit: u32, left: Tree<V>, right: Tree<V>) -> Tree<V> {
    match (left, right) {
        (Some(left), Some(right)) => Some(Arc::new(Node::Branch { prefix, bit, left, right })),
        (l, r) => l.or(r),
    }
}

fn lookup<V>(mut node: &Arc<Node<V>>, k: u32) -> Option<&V> {
    loop {
        match &**node {
            Node::Leaf { key, value } => return (*key == k).then_some(value),
            Node::Branch { prefix, bit, left, right } => {
                if !match_prefix(k, *prefix, *bit) {
                    return None;
                }
                node = if zero_bit(k, *bit) { left } else { right };
            }
        }
    }
}

/// Rewrites the binding of `k`; `f` sees the current value and returns the new one, or
/// `None` to drop the binding.
fn update<V: Clone>(node: Option<&Arc<Node<V>>>, k: u32, f: &mut dyn FnMut(Option<&V>) -> Option<V>) -> Tree<V> {
    let n = match node {
        None => return f(None).map(|v| leaf(k, v)),
        Some(n) => n,
    };
    match &**n {
        Node::Leaf { key, value } if *key == k => f(Some(value)).map(|v| leaf(k, v)),
        Node::Branch { prefix, bit, left, right } if match_prefix(k, *prefix, *bit) => {
            if zero_bit(k, *bit) {
                make_branch(*prefix, *bit, update(Some(left), k, f), Some(right.clone()))
            } else {
                make_branch(*prefix, *bit, Some(left.clone()), update(Some(right), k, f))
            }
        }
        _ => match f(None) {
            None => Some(n.clone()),
            Some(v) => Some(join_trees(leaf(k, v), n.clone())),
        },
    }
}

/// Union of both key sets; shared keys go through `f` (`None` drops the key). `f` must be
/// idempotent, because subtrees shared by both sides are kept as they are.
fn merge<V: Clone>(a: &Arc<Node<V>>, b: &Arc<Node<V>>, f: &dyn Fn(&V, &V) -> Option<V>) -> Tree<V> {
    if Arc::ptr_eq(a, b) {
        return Some(a.clone());
    }
    match (&**a, &**b) {
        (Node::Leaf { key, value }, _) => update(Some(b), *key, &mut |bv| match bv {
            Some(bv) => f(value, bv),
            None => Some(value.clone()),
        }),
        (_, Node::Leaf { key, value }) => update(Some(a), *key, &mut |av| match av {
            Some(av) => f(av, value),
            None => Some(value.clone()),
        }),
        (
            Node::Branch { prefix: p, bit: m, left: l0, right: r0 },
            Node::Branch { prefix: q, bit: n, left: l1, right: r1 },
        ) => {
            if m == n && p == q {
                make_branch(*p, *m, merge(l0, l1, f), merge(r0, r1, f))
            } else if m > n && match_prefix(*q, *p, *m) {
                if zero_bit(*q, *m) {
                    make_branch(*p, *m, merge(l0, b, f), Some(r0.clone()))
                } else {
                    make_branch(*p, *m, Some(l0.clone()), merge(r0, b, f))
                }
            } else if m < n && match_prefix(*p, *q, *n) {
                if zero_bit(*p, *n) {
                    make_branch(*q, *n, merge(a, l1, f), Some(r1.clone()))
                } else {
                    make_branch(*q, *n, Some(l1.clone()), merge(a, r1, f))
                }
            } else {
                Some(join_trees(a.clone(), b.clone()))
            }
        }
    }
}

/// Keys present on both sides, combined by `f` (`None` drops the key). Same idempotence
/// requirement as `merge`.
fn intersect<V: Clone>(a: &Arc<Node<V>>, b: &Arc<Node<V>>, f: &dyn Fn(&V, &V) -> Option<V>) -> Tree<V> {
    if Arc::ptr_eq(a, b) {
        return Some(a.clone());
    }
    match (&**a, &**b) {
        (Node::Leaf { key, value }, _) => lookup(b, *key).and_then(|bv| f(value, bv)).map(|v| leaf(*key, v)),
        (_, Node::Leaf { key, value }) => lookup(a, *key).and_then(|av| f(av, value)).map(|v| leaf(*key, v)),
        (
            Node::Branch { prefix: p, bit: m, left: l0, right: r0 },
            Node::Branch { prefix: q, bit: n, left: l1, right: r1 },
        ) => {
            if m == n && p == q {
                make_branch(*p, *m, intersect(l0, l1, f), intersect(r0, r1, f))
            } else if m > n && match_prefix(*q, *p, *m) {
                intersect(if zero_bit(*q, *m) { l0 } else { r0 }, b, f)
            } else if m < n && match_prefix(*p, *q, *n) {
                intersect(a, if zero_bit(*p, *n) { l1 } else { r1 }, f)
            } else {
                None
            }
        }
    }
}

fn collect<'a, V>(node: &'a Arc<Node<V>>, out: &mut Vec<(u32, &'a V)>) {
    match &**node {
        Node::Leaf { key, value } => out.push((*key, value)),
        Node::Branch { left, right, .. } => {
            collect(left, out);
            collect(right, out);
        }
    }
}

pub struct PatriciaTreeMap<K, V> {
    root: Tree<V>,
    _key: PhantomData<K>,
}

impl<K, V> Clone for PatriciaTreeMap<K, V> {
    fn clone(&self) -> Self {
        PatriciaTreeMap { root: self.root.clone(), _key: PhantomData }
    }
}

impl<K, V> Default for PatriciaTreeMap<K, V> {
    fn default() -> Self {
        PatriciaTreeMap { root: None, _key: PhantomData }
    }
}

impl<K: PatriciaKey, V: Clone> PatriciaTreeMap<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    pub fn len(&self) -> usize {
        self.iter().len()
    }

    pub fn get(&self, k: K) -> Option<&V> {
        self.root.as_ref().and_then(|r| lookup(r, k.to_key()))
    }

    pub fn contains_key(&self, k: K) -> bool {
        self.get(k).is_some()
    }

    pub fn insert(&mut self, k: K, v: V) {
        let mut slot = Some(v);
        self.root = update(self.root.as_ref(), k.to_key(), &mut |_| slot.take());
    }

    pub fn remove(&mut self, k: K) {
        if self.contains_key(k) {
            self.root = update(self.root.as_ref(), k.to_key(), &mut |_| None);
        }
    }

    /// Rewrites one binding in place; returning `None` removes it.
    pub fn update_with(&mut self, k: K, mut f: impl FnMut(Option<&V>) -> Option<V>) {
        self.root = update(self.root.as_ref(), k.to_key(), &mut f);
    }

    pub fn union_with(&mut self, other: &Self, f: impl Fn(&V, &V) -> Option<V>) {
        self.root = match (&self.root, &other.root) {
            (Some(a), Some(b)) => merge(a, b, &f),
            (None, b) => b.clone(),
            (a, None) => a.clone(),
        };
    }

    pub fn intersection_with(&mut self, other: &Self, f: impl Fn(&V, &V) -> Option<V>) {
        self.root = match (&self.root, &other.root) {
            (Some(a), Some(b)) => intersect(a, b, &f),
            _ => None,
        };
    }

    /// Bindings in ascending key order.
    pub fn iter(&self) -> std::vec::IntoIter<(K, &V)> {
        let mut out = Vec::new();
        if let Some(r) = &self.root {
            collect(r, &mut out);
        }
        out.into_iter().map(|(k, v)| (K::from_key(k), v)).collect::<Vec<_>>().into_iter()
    }

    pub fn keys(&self) -> Vec<K> {
        self.iter().map(|(k, _)| k).collect()
    }

    /// Whether both maps share their root node.
    pub fn same_root(&self, other: &Self) -> bool {
        match (&self.root, &other.root) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        }
    }
}

impl<K: PatriciaKey, V: Clone + PartialEq> PartialEq for PatriciaTreeMap<K, V> {
    fn eq(&self, other: &Self) -> bool {
        if self.same_root(other) {
            return true;
        }
        let (a, b) = (self.iter(), other.iter());
        a.len() == b.len() && a.zip(b).all(|((ka, va), (kb, vb))| ka.to_key() == kb.to_key() && va == vb)
    }
}

impl<K: PatriciaKey + Debug, V: Clone + Debug> Debug for PatriciaTreeMap<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

impl<K: PatriciaKey, V: Clone> FromIterator<(K, V)> for PatriciaTreeMap<K, V> {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut map = PatriciaTreeMap::new();
        for (k, v) in iter {
            map.insert(k, v);
        }
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(entries: &[(u32, i32)]) -> PatriciaTreeMap<u32, i32> {
        entries.iter().copied().collect()
    }

    #[test]
    fn test_insert_get_remove() {
        let mut m = map(&[(5, 50), (1, 10), (0xffff_fff0, 7), (3, 30)]);
        assert_eq!(m.len(), 4);
        assert_eq!(m.get(3), Some(&30));
        assert_eq!(m.get(0xffff_fff0), Some(&7));
        assert_eq!(m.get(4), None);
        m.insert(3, 31);
        assert_eq!(m.get(3), Some(&31));
        m.remove(1);
        m.remove(100);
        assert_eq!(m.keys(), vec![3, 5, 0xffff_fff0]);
    }

    #[test]
    fn test_persistence() {
        let a = map(&[(1, 1), (2, 2)]);
        let mut b = a.clone();
        assert!(a.same_root(&b));
        b.insert(3, 3);
        assert_eq!(a.len(), 2);
        assert_eq!(b.len(), 3);
        assert!(!a.same_root(&b));
    }

    #[test]
    fn test_union_and_intersection() {
        let mut a = map(&[(1, 1), (2, 2), (8, 8), (64, 1)]);
        let b = map(&[(2, 20), (3, 3), (64, 1), (1024, 5)]);
        let mut u = a.clone();
        u.union_with(&b, |x, y| Some(x.max(y).to_owned()));
        assert_eq!(u, map(&[(1, 1), (2, 20), (3, 3), (8, 8), (64, 1), (1024, 5)]));

        a.intersection_with(&b, |x, y| if x == y { None } else { Some(x + y) });
        assert_eq!(a, map(&[(2, 22)]));
    }

    #[test]
    fn test_equality_ignores_insertion_order() {
        let a = map(&[(9, 1), (4, 2), (77, 3)]);
        let b = map(&[(77, 3), (9, 1), (4, 2)]);
        assert_eq!(a, b);
        assert_eq!(format!("{:?}", a), "{4: 2, 9: 1, 77: 3}");
    }
}
