//! Disjoint sets over dense indices, with union by rank and path halving.

#[derive(Debug, Clone, Default)]
pub struct UnionFind {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl UnionFind {
    pub fn new() -> Self {
        UnionFind::default()
    }

    pub fn len(&self) -> usize {
        self.parent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parent.is_empty()
    }

    /// Adds a singleton set and returns its element.
    pub fn make_set(&mut self) -> usize {
        let x = self.parent.len();
        self.parent.push(x);
        self.rank.push(0);
        x
    }

    pub fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    /// Merges the sets of `a` and `b` and returns the new representative.
    pub fn union(&mut self, a: usize, b: usize) -> usize {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return ra;
        }
        let (root, child) = if self.rank[ra] >= self.rank[rb] { (ra, rb) } else { (rb, ra) };
        self.parent[child] = root;
        if self.rank[root] == self.rank[child] {
            self.rank[root] += 1;
        }
        root
    }

    pub fn same_set(&mut self, a: usize, b: usize) -> bool {
        self.find(a) == self.find(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_union_and_find() {
        let mut uf = UnionFind::new();
        let xs: Vec<usize> = (0..6).map(|_| uf.make_set()).collect();
        uf.union(xs[0], xs[1]);
        uf.union(xs[2], xs[3]);
        assert!(!uf.same_set(xs[1], xs[2]));
        let r = uf.union(xs[1], xs[3]);
        assert_eq!(uf.find(xs[0]), r);
        assert_eq!(uf.find(xs[2]), r);
        assert!(!uf.same_set(xs[4], xs[0]));
        assert_eq!(uf.union(xs[4], xs[4]), xs[4]);
        assert_eq!(uf.len(), 6);
    }
}
