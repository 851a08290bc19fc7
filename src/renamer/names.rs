//! Short method names and the live stack-trace strings they must not repeat.

use std::collections::HashMap;

use crate::ir::interner::{StringId, TypeId};

const ALPHABET: &[u8; 52] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// The `index`-th name: `A`..`Z`, `a`..`z`, then `AA`, `AB`, ...
pub fn name_for_index(index: u64) -> String {
    let mut n = index + 1;
    let mut out = Vec::new();
    while n > 0 {
        n -= 1;
        out.push(ALPHABET[(n % 52) as usize]);
        n /= 52;
    }
    out.reverse();
    String::from_utf8_lossy(&out).into_owned()
}

/// How many method definitions print as `Class.name` in a stack trace.
#[derive(Debug, Clone, Default)]
pub struct StackTraceNames {
    counts: HashMap<(TypeId, StringId), u32>,
}

impl StackTraceNames {
    pub fn new() -> Self {
        StackTraceNames::default()
    }

    pub fn add(&mut self, class: TypeId, name: StringId) {
        *self.counts.entry((class, name)).or_insert(0) += 1;
    }

    pub fn remove(&mut self, class: TypeId, name: StringId) {
        if let Some(c) = self.counts.get_mut(&(class, name)) {
            *c -= 1;
            if *c == 0 {
                self.counts.remove(&(class, name));
            }
        }
    }

    pub fn count(&self, class: TypeId, name: StringId) -> u32 {
        self.counts.get(&(class, name)).copied().unwrap_or(0)
    }

    pub fn is_live(&self, class: TypeId, name: StringId) -> bool {
        self.count(class, name) > 0
    }

    pub fn entries(&self) -> impl Iterator<Item = ((TypeId, StringId), u32)> + '_ {
        self.counts.iter().map(|(k, v)| (*k, *v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base52_names() {
        assert_eq!(name_for_index(0), "A");
        assert_eq!(name_for_index(25), "Z");
        assert_eq!(name_for_index(26), "a");
        assert_eq!(name_for_index(51), "z");
        assert_eq!(name_for_index(52), "AA");
        assert_eq!(name_for_index(53), "AB");
        assert_eq!(name_for_index(52 + 52 * 52), "AAA");
    }

    #[test]
    fn test_stack_trace_counts() {
        let mut names = StackTraceNames::new();
        let (c, n) = (TypeId::from(1), StringId::from(2));
        names.add(c, n);
        names.add(c, n);
        assert_eq!(names.count(c, n), 2);
        names.remove(c, n);
        assert!(names.is_live(c, n));
        names.remove(c, n);
        assert!(!names.is_live(c, n));
        assert_eq!(names.entries().count(), 0);
    }
}
