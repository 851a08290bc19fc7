use std::backtrace::Backtrace;
use std::collections::BTreeMap;
use std::fmt;

/// Error classes exposed at the process boundary. The discriminant is the exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ErrorKind
{
    InternalError = 1,
    GenericAssertionError = 2,
    CacheIndexOutOfBound = 3,
    DuplicateClasses = 4,
    DuplicateMethods = 5,
    MalformedDex = 6,
    InvalidJava = 7,
    TypeCheckError = 8,
}

impl ErrorKind
{
    pub fn code(self) -> i32
    {
        self as i32
    }

    pub fn name(self) -> &'static str
    {
        match self
        {
            ErrorKind::InternalError => "INTERNAL_ERROR",
            ErrorKind::GenericAssertionError => "GENERIC_ASSERTION_ERROR",
            ErrorKind::CacheIndexOutOfBound => "CACHE_INDEX_OUT_OF_BOUND",
            ErrorKind::DuplicateClasses => "DUPLICATE_CLASSES",
            ErrorKind::DuplicateMethods => "DUPLICATE_METHODS",
            ErrorKind::MalformedDex => "MALFORMED_DEX",
            ErrorKind::InvalidJava => "INVALID_JAVA",
            ErrorKind::TypeCheckError => "TYPE_CHECK_ERROR",
        }
    }
}

impl fmt::Display for ErrorKind
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.write_str(self.name())
    }
}

/// Where an `always_assert!` fired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssertionSite
{
    pub file: &'static str,
    pub line: u32,
    pub module: &'static str,
    pub expr: &'static str,
}

#[derive(Debug, Clone)]
pub struct DexError
{
    kind: ErrorKind,
    msg: String,
    contexts: Vec<String>,
    extra_info: BTreeMap<String, String>,
    site: Option<AssertionSite>,
    backtrace: Option<String>,
}

pub type Result<T> = std::result::Result<T, DexError>;

/// Returns early with an `INTERNAL_ERROR` built from a message or format string,
/// optionally wrapped in a context.
#[macro_export]
macro_rules! fail {
    ($msg:literal) => {
        return Err($crate::error::DexError::new(format!($msg)))
    };
    (($msg:literal), ($context:literal)) => {
        return Err($crate::error::DexError::with_context($crate::error::DexError::new($msg), $context))
    };
    (($fmtstr:literal, $($args:tt)*), ($contextfmt:literal, $($contextargs:tt)*)) => {
        return Err($crate::error::DexError::with_context(
            $crate::error::DexError::new(format!($fmtstr, $($args)*)),
            format!($contextfmt, $($contextargs)*),
        ))
    };
    ($fmtstr:literal, $($args:tt)*) => {
        return Err($crate::error::DexError::new(format!($fmtstr, $($args)*)))
    };
}

/// Builds (without returning) an `INTERNAL_ERROR`.
#[macro_export]
macro_rules! err {
    ($msg:literal) => {
        $crate::error::DexError::new(format!($msg))
    };
    ($fmtstr:literal, $($args:tt)*) => {
        $crate::error::DexError::new(format!($fmtstr, $($args)*))
    };
}

/// Returns early with a typed error.
#[macro_export]
macro_rules! fail_kind {
    ($kind:expr, $msg:literal) => {
        return Err($crate::error::DexError::with_kind($kind, format!($msg)))
    };
    ($kind:expr, $fmtstr:literal, $($args:tt)*) => {
        return Err($crate::error::DexError::with_kind($kind, format!($fmtstr, $($args)*)))
    };
}

#[macro_export]
macro_rules! assertion_site {
    ($expr:expr) => {
        $crate::error::AssertionSite {
            file: file!(),
            line: line!(),
            module: module_path!(),
            expr: $expr,
        }
    };
}

/// Invariant check for functions returning `Result`; records location and a backtrace.
#[macro_export]
macro_rules! always_assert {
    ($cond:expr) => {
        if !($cond) {
            return Err($crate::error::DexError::assertion(
                $crate::error::ErrorKind::GenericAssertionError,
                $crate::assertion_site!(stringify!($cond)),
                String::new(),
            ));
        }
    };
}

#[macro_export]
macro_rules! always_assert_log {
    ($cond:expr, $fmtstr:literal $(, $args:expr)* $(,)?) => {
        if !($cond) {
            return Err($crate::error::DexError::assertion(
                $crate::error::ErrorKind::GenericAssertionError,
                $crate::assertion_site!(stringify!($cond)),
                format!($fmtstr $(, $args)*),
            ));
        }
    };
}

/// Like `always_assert_log!` but tags the failure with a specific kind.
#[macro_export]
macro_rules! assert_kind {
    ($cond:expr, $kind:expr, $fmtstr:literal $(, $args:expr)* $(,)?) => {
        if !($cond) {
            return Err($crate::error::DexError::assertion(
                $kind,
                $crate::assertion_site!(stringify!($cond)),
                format!($fmtstr $(, $args)*),
            ));
        }
    };
}

impl DexError
{
    pub fn new<S: Into<String>>(msg: S) -> Self
    {
        DexError::with_kind(ErrorKind::InternalError, msg)
    }

    pub fn with_kind<S: Into<String>>(kind: ErrorKind, msg: S) -> Self
    {
        DexError {
            kind,
            msg: msg.into(),
            contexts: Vec::new(),
            extra_info: BTreeMap::new(),
            site: None,
            backtrace: None,
        }
    }

    /// A `MALFORMED_DEX` error pinned to a byte offset.
    pub fn malformed<S: Into<String>>(offset: usize, msg: S) -> Self
    {
        DexError::with_kind(ErrorKind::MalformedDex, msg).extra("offset", format!("0x{:x}", offset))
    }

    pub fn index_out_of_bound(table: &str, index: u32, size: usize) -> Self
    {
        DexError::with_kind(
            ErrorKind::CacheIndexOutOfBound,
            format!("{} index {} out of bound (size {})", table, index, size),
        )
        .extra("table", table)
        .extra("index", index.to_string())
    }

    pub fn assertion(kind: ErrorKind, site: AssertionSite, msg: String) -> Self
    {
        let msg = if msg.is_empty() { format!("assertion `{}` failed", site.expr) } else { msg };
        DexError {
            kind,
            msg,
            contexts: Vec::new(),
            extra_info: BTreeMap::new(),
            site: Some(site),
            backtrace: Some(Backtrace::force_capture().to_string()),
        }
    }

    pub fn with_context<S: Into<String>>(base: DexError, context: S) -> Self
    {
        let mut base = base;
        base.contexts.push(context.into());
        base
    }

    pub fn context<S: Into<String>>(self, context: S) -> Self
    {
        DexError::with_context(self, context)
    }

    pub fn extra<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self
    {
        self.extra_info.insert(key.into(), value.into());
        self
    }

    pub fn kind(&self) -> ErrorKind
    {
        self.kind
    }

    pub fn message(&self) -> &str
    {
        &self.msg
    }

    pub fn extra_info(&self) -> &BTreeMap<String, String>
    {
        &self.extra_info
    }

    pub fn site(&self) -> Option<&AssertionSite>
    {
        self.site.as_ref()
    }

    pub fn backtrace(&self) -> Option<&str>
    {
        self.backtrace.as_deref()
    }

    /// Multi-line report used by the driver: summary line, assertion site, extra info, backtrace.
    pub fn report(&self) -> String
    {
        let mut out = format!("{}: {}", self.kind, self);
        if let Some(site) = &self.site {
            out.push_str(&format!("\n  at {}:{} in {} ({})", site.file, site.line, site.module, site.expr));
        }
        for (k, v) in &self.extra_info {
            out.push_str(&format!("\n  {}: {}", k, v));
        }
        if let Some(bt) = &self.backtrace {
            out.push_str("\n");
            out.push_str(bt);
        }
        out
    }
}

impl PartialEq for DexError
{
    fn eq(&self, other: &Self) -> bool
    {
        self.kind == other.kind && self.msg == other.msg && self.contexts == other.contexts && self.extra_info == other.extra_info
    }
}

impl fmt::Display for DexError
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "{}", self.msg)?;
        let mut connector = " for ";
        for context in &self.contexts
        {
            write!(f, "{}{}", connector, context)?;
            connector = " of ";
        }
        if !self.extra_info.is_empty()
        {
            let pairs: Vec<String> = self.extra_info.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
            write!(f, " {{{}}}", pairs.join(", "))?;
        }
        Ok(())
    }
}

impl std::error::Error for DexError {}

impl From<std::io::Error> for DexError
{
    fn from(e: std::io::Error) -> Self
    {
        DexError::new(format!("I/O error: {}", e))
    }
}

impl From<zip::result::ZipError> for DexError
{
    fn from(e: zip::result::ZipError) -> Self
    {
        DexError::with_kind(ErrorKind::InvalidJava, format!("ZIP error: {}", e))
    }
}

impl From<serde_json::Error> for DexError
{
    fn from(e: serde_json::Error) -> Self
    {
        DexError::new(format!("invalid configuration: {}", e))
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    fn checked(v: u32) -> Result<u32>
    {
        always_assert_log!(v < 10, "value {} too large", v);
        Ok(v)
    }

    #[test]
    fn test_context_chain_display()
    {
        let e = DexError::with_context(DexError::new("bad tag"), "annotation").context("class LFoo;");
        assert_eq!(e.to_string(), "bad tag for annotation of class LFoo;");
        assert_eq!(e.kind(), ErrorKind::InternalError);
    }

    #[test]
    fn test_assertion_carries_site()
    {
        let e = checked(12).unwrap_err();
        assert_eq!(e.kind(), ErrorKind::GenericAssertionError);
        assert_eq!(e.message(), "value 12 too large");
        let site = e.site().unwrap();
        assert_eq!(site.expr, "v < 10");
        assert!(site.file.ends_with("error.rs"));
        assert!(e.backtrace().is_some());
        assert_eq!(checked(3), Ok(3));
    }

    #[test]
    fn test_extra_info_and_codes()
    {
        let e = DexError::with_kind(ErrorKind::DuplicateClasses, "duplicate class LA;")
            .extra("class", "LA;")
            .extra("dex1", "classes.dex")
            .extra("dex2", "classes2.dex");
        assert_eq!(e.kind().code(), 4);
        assert_eq!(e.extra_info().len(), 3);
        assert!(e.to_string().contains("dex1=classes.dex"));
        assert_eq!(ErrorKind::CacheIndexOutOfBound.code(), 3);
        assert_eq!(DexError::index_out_of_bound("type", 9, 2).kind(), ErrorKind::CacheIndexOutOfBound);
    }
}
