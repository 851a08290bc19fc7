//! Weak topological ordering (Bourdoncle, 1993).
//!
//! A WTO is a hierarchy of nested components: a component is a loop, visited from its head,
//! and a vertex is a node outside any loop below the current level. Iterating components
//! in this order stabilizes inner loops before outer ones.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WtoComponent<N> {
    Vertex(N),
    Component(N, Vec<WtoComponent<N>>),
}

impl<N: Copy> WtoComponent<N> {
    pub fn head(&self) -> N {
        match self {
            WtoComponent::Vertex(n) | WtoComponent::Component(n, _) => *n,
        }
    }

    pub fn is_component(&self) -> bool {
        matches!(self, WtoComponent::Component(..))
    }
}

#[derive(Debug, Clone)]
pub struct Wto<N> {
    components: Vec<WtoComponent<N>>,
}

struct Builder<'s, N> {
    dfn: HashMap<N, u32>,
    stack: Vec<N>,
    num: u32,
    succs: &'s dyn Fn(N) -> Vec<N>,
}

impl<'s, N: Copy + Eq + Hash> Builder<'s, N> {
    fn dfn(&self, n: N) -> u32 {
        self.dfn.get(&n).copied().unwrap_or(0)
    }

    fn visit(&mut self, v: N, partition: &mut VecDeque<WtoComponent<N>>) -> u32 {
        self.stack.push(v);
        self.num += 1;
        self.dfn.insert(v, self.num);
        let mut head = self.num;
        let mut is_loop = false;
        for w in (self.succs)(v) {
            let min = match self.dfn(w) {
                0 => self.visit(w, partition),
                d => d,
            };
            if min <= head {
                head = min;
                is_loop = true;
            }
        }
        if head == self.dfn(v) {
            self.dfn.insert(v, u32::MAX);
            let mut element = self.stack.pop();
            if is_loop {
                while let Some(e) = element {
                    if e == v {
                        break;
                    }
                    self.dfn.insert(e, 0);
                    element = self.stack.pop();
                }
                let c = self.component(v);
                partition.push_front(c);
            } else {
                partition.push_front(WtoComponent::Vertex(v));
            }
        }
        head
    }

    fn component(&mut self, v: N) -> WtoComponent<N> {
        let mut partition = VecDeque::new();
        for w in (self.succs)(v) {
            if self.dfn(w) == 0 {
                self.visit(w, &mut partition);
            }
        }
        WtoComponent::Component(v, partition.into())
    }
}

impl<N: Copy + Eq + Hash> Wto<N> {
    pub fn new(root: N, succs: impl Fn(N) -> Vec<N>) -> Self {
        let mut b = Builder { dfn: HashMap::new(), stack: Vec::new(), num: 0, succs: &succs };
        let mut partition = VecDeque::new();
        b.visit(root, &mut partition);
        Wto { components: partition.into() }
    }

    pub fn components(&self) -> &[WtoComponent<N>] {
        &self.components
    }

    /// Every node, heads before their bodies.
    pub fn flatten(&self) -> Vec<N> {
        fn walk<N: Copy>(cs: &[WtoComponent<N>], out: &mut Vec<N>) {
            for c in cs {
                out.push(c.head());
                if let WtoComponent::Component(_, inner) = c {
                    walk(inner, out);
                }
            }
        }
        let mut out = Vec::new();
        walk(&self.components, &mut out);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wto(edges: &[(u32, u32)]) -> Wto<u32> {
        let edges = edges.to_vec();
        Wto::new(1, move |n| edges.iter().filter(|(s, _)| *s == n).map(|(_, t)| *t).collect())
    }

    #[test]
    fn test_straight_line() {
        let w = wto(&[(1, 2), (2, 3)]);
        assert_eq!(w.components(), &[WtoComponent::Vertex(1), WtoComponent::Vertex(2), WtoComponent::Vertex(3)]);
    }

    #[test]
    fn test_nested_loops() {
        // 1 -> 2 -> 3 -> 4 -> 3, 4 -> 2, 2 -> 5
        let w = wto(&[(1, 2), (2, 3), (3, 4), (4, 3), (4, 2), (2, 5)]);
        assert_eq!(
            w.components(),
            &[
                WtoComponent::Vertex(1),
                WtoComponent::Component(
                    2,
                    vec![WtoComponent::Component(3, vec![WtoComponent::Vertex(4)])]
                ),
                WtoComponent::Vertex(5),
            ]
        );
        assert_eq!(w.flatten(), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_self_loop() {
        let w = wto(&[(1, 1), (1, 2)]);
        assert_eq!(w.components(), &[WtoComponent::Component(1, vec![]), WtoComponent::Vertex(2)]);
    }
}
