//! The sign lattice of integers.
//!
//! ```text
//!          ALL
//!        /  |  \
//!      LEZ NEZ  GEZ
//!      | \ / \ / |
//!      |  X   X  |
//!     LTZ  EQZ  GTZ
//!        \  |  /
//!         BOTTOM
//! ```

use once_cell::sync::Lazy;

use crate::domains::finite_lattice::{FiniteDomain, FiniteLattice, LatticeSpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Sign {
    Bottom,
    Ltz,
    Eqz,
    Gtz,
    Lez,
    Gez,
    Nez,
    All,
}

const SIGNS: [Sign; 8] = [Sign::Bottom, Sign::Ltz, Sign::Eqz, Sign::Gtz, Sign::Lez, Sign::Gez, Sign::Nez, Sign::All];

const SIGN_ORDER: [(Sign, Sign); 12] = [
    (Sign::Bottom, Sign::Ltz),
    (Sign::Bottom, Sign::Eqz),
    (Sign::Bottom, Sign::Gtz),
    (Sign::Ltz, Sign::Lez),
    (Sign::Eqz, Sign::Lez),
    (Sign::Eqz, Sign::Gez),
    (Sign::Gtz, Sign::Gez),
    (Sign::Ltz, Sign::Nez),
    (Sign::Gtz, Sign::Nez),
    (Sign::Lez, Sign::All),
    (Sign::Gez, Sign::All),
    (Sign::Nez, Sign::All),
];

static SIGN_LATTICE: Lazy<FiniteLattice<Sign>> = Lazy::new(|| FiniteLattice::from_trusted(&SIGNS, &SIGN_ORDER));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SignLattice;

impl LatticeSpec for SignLattice {
    type Element = Sign;

    fn lattice() -> &'static FiniteLattice<Sign> {
        &SIGN_LATTICE
    }
}

pub type SignDomain = FiniteDomain<SignLattice>;

impl Sign {
    pub fn of(v: i64) -> Sign {
        match v {
            0 => Sign::Eqz,
            v if v < 0 => Sign::Ltz,
            _ => Sign::Gtz,
        }
    }

    pub fn contains(self, v: i64) -> bool {
        SIGN_LATTICE.leq(Sign::of(v), self)
    }

    /// Smallest value in the interval, for 64-bit integers.
    pub fn min_value(self) -> Option<i64> {
        match self {
            Sign::Bottom => None,
            Sign::Eqz | Sign::Gez => Some(0),
            Sign::Gtz => Some(1),
            Sign::Ltz | Sign::Lez | Sign::Nez | Sign::All => Some(i64::MIN),
        }
    }

    pub fn max_value(self) -> Option<i64> {
        match self {
            Sign::Bottom => None,
            Sign::Eqz | Sign::Lez => Some(0),
            Sign::Ltz => Some(-1),
            Sign::Gtz | Sign::Gez | Sign::Nez | Sign::All => Some(i64::MAX),
        }
    }

    pub fn meet(self, other: Sign) -> Sign {
        SIGN_LATTICE.meet(self, other)
    }

    pub fn join(self, other: Sign) -> Sign {
        SIGN_LATTICE.join(self, other)
    }

    pub fn leq(self, other: Sign) -> bool {
        SIGN_LATTICE.leq(self, other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::AbstractDomain;

    #[test]
    fn test_table_is_a_lattice() {
        assert!(FiniteLattice::new(&SIGNS, &SIGN_ORDER).is_ok());
        let l = SignLattice::lattice();
        assert_eq!(l.bottom(), Sign::Bottom);
        assert_eq!(l.top(), Sign::All);
        for s in SIGNS {
            assert_eq!(l.decode(l.encode(s)), Some(s));
        }
    }

    #[test]
    fn test_sign_ops() {
        assert_eq!(Sign::Lez.meet(Sign::Gez), Sign::Eqz);
        assert_eq!(Sign::Lez.meet(Sign::Nez), Sign::Ltz);
        assert_eq!(Sign::Ltz.join(Sign::Gtz), Sign::Nez);
        assert_eq!(Sign::Ltz.join(Sign::Eqz), Sign::Lez);
        assert_eq!(Sign::Eqz.join(Sign::Nez), Sign::All);
        assert!(Sign::Gez.contains(0) && !Sign::Gtz.contains(0));
        assert_eq!(Sign::of(-3), Sign::Ltz);
        let values: Vec<SignDomain> = SIGNS.iter().map(|s| SignDomain::new(*s)).collect();
        crate::domains::check_lattice_laws(&values);
        assert!(SignDomain::new(Sign::All).is_top());
    }
}
