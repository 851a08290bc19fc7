//! Parallel iteration over the methods of a scope.
//!
//! Work is split by class on a fixed-size rayon pool. Every worker checks a shared
//! [`CancellationToken`] before each method; the first failing method cancels the rest of the
//! walk. Results come back in scope order, so reductions done afterwards are deterministic.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::debug;
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::error::{DexError, ErrorKind, Result};
use crate::ir::class::{DexMethod, Scope};

#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        CancellationToken::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct Walker {
    pool: ThreadPool,
    token: CancellationToken,
}

impl Walker {
    /// A pool of `num_threads` workers, or one per core.
    pub fn new(num_threads: Option<usize>) -> Result<Self> {
        let mut builder = ThreadPoolBuilder::new();
        if let Some(n) = num_threads {
            builder = builder.num_threads(n);
        }
        let pool = builder
            .build()
            .map_err(|e| DexError::with_kind(ErrorKind::InternalError, format!("cannot start worker pool: {}", e)))?;
        debug!("[walkers] {} worker threads", pool.current_num_threads());
        Ok(Walker { pool, token: CancellationToken::new() })
    }

    pub fn num_threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Handle that stops running and future walks of this walker.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Calls `f` on every method of every internal class.
    pub fn walk_methods_parallel<F>(&self, scope: &mut Scope, f: F) -> Result<()>
    where
        F: Fn(&mut DexMethod) -> Result<()> + Sync + Send,
    {
        self.map_methods_parallel(scope, f).map(|_| ())
    }

    /// Calls `f` on every method of every internal class and returns the results in
    /// scope order.
    pub fn map_methods_parallel<T, F>(&self, scope: &mut Scope, f: F) -> Result<Vec<T>>
    where
        T: Send,
        F: Fn(&mut DexMethod) -> Result<T> + Sync + Send,
    {
        let token = &self.token;
        let per_class: Result<Vec<Vec<T>>> = self.pool.install(|| {
            scope
                .classes_mut()
                .par_iter_mut()
                .filter(|c| !c.external)
                .map(|c| {
                    let mut out = Vec::new();
                    for m in c.methods_mut() {
                        if token.is_cancelled() {
                            break;
                        }
                        match f(m) {
                            Ok(v) => out.push(v),
                            Err(e) => {
                                token.cancel();
                                return Err(e);
                            }
                        }
                    }
                    Ok(out)
                })
                .collect()
        });
        let results: Vec<T> = per_class?.into_iter().flatten().collect();
        if token.is_cancelled() {
            return Err(DexError::with_kind(ErrorKind::InternalError, "method walk cancelled"));
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::ir::assembler::parse_code;
    use crate::ir::class::{AccessFlags, DexClass};
    use crate::ir::interner::Interner;

    fn scope(g: &Interner, classes: usize, methods: usize) -> Scope {
        let mut scope = Scope::new();
        for c in 0..classes {
            let ty = g.make_type(&format!("LC{};", c));
            let mut class = DexClass::new(ty, None, AccessFlags::PUBLIC);
            for m in 0..methods {
                let r = g.make_method_from_str(&format!("LC{};.m{}:()I", c, m)).unwrap();
                let code = parse_code(g, &format!("((const v0 {}) (return v0))", m)).unwrap();
                class
                    .add_method(g, DexMethod::new(r, AccessFlags::PUBLIC | AccessFlags::STATIC).with_code(code))
                    .unwrap();
            }
            scope.add_class(g, class).unwrap();
        }
        let mut lib = DexClass::new(g.make_type("LLib;"), None, AccessFlags::PUBLIC);
        lib.external = true;
        lib.add_method(g, DexMethod::new(g.make_method_from_str("LLib;.x:()V").unwrap(), AccessFlags::PUBLIC)).unwrap();
        scope.add_external_class(g, lib, false);
        scope
    }

    #[test]
    fn test_map_keeps_scope_order() {
        let g = Interner::new();
        let mut scope = scope(&g, 8, 3);
        let walker = Walker::new(Some(4)).unwrap();
        assert_eq!(walker.num_threads(), 4);
        let names = walker.map_methods_parallel(&mut scope, |m| Ok(g.show_method(m.reference))).unwrap();
        assert_eq!(names.len(), 24);
        assert_eq!(names[0], "LC0;.m0:()I");
        assert_eq!(names[23], "LC7;.m2:()I");

        let seen = AtomicUsize::new(0);
        walker
            .walk_methods_parallel(&mut scope, |_| {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 24);
    }

    #[test]
    fn test_first_error_cancels() {
        let g = Interner::new();
        let mut scope = scope(&g, 4, 2);
        let walker = Walker::new(Some(2)).unwrap();
        let err = walker
            .walk_methods_parallel(&mut scope, |m| {
                if g.show_method(m.reference) == "LC2;.m1:()I" {
                    Err(DexError::with_kind(ErrorKind::TypeCheckError, "bad method"))
                } else {
                    Ok(())
                }
            })
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TypeCheckError);
        assert!(walker.token().is_cancelled());
    }

    #[test]
    fn test_external_cancellation() {
        let g = Interner::new();
        let mut scope = scope(&g, 2, 2);
        let walker = Walker::new(Some(1)).unwrap();
        walker.token().cancel();
        let err = walker.walk_methods_parallel(&mut scope, |_| Ok(())).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InternalError);
    }
}
