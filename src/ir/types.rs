//! Type-descriptor helpers.

use crate::error::{DexError, Result};

pub const JAVA_LANG_OBJECT: &str = "Ljava/lang/Object;";
pub const JAVA_LANG_CLASS: &str = "Ljava/lang/Class;";
pub const JAVA_LANG_STRING: &str = "Ljava/lang/String;";
pub const JAVA_LANG_THROWABLE: &str = "Ljava/lang/Throwable;";
pub const JAVA_LANG_INTEGER: &str = "Ljava/lang/Integer;";
pub const JAVA_LANG_REFLECT_METHOD: &str = "Ljava/lang/reflect/Method;";
pub const JAVA_LANG_REFLECT_FIELD: &str = "Ljava/lang/reflect/Field;";
pub const JAVA_LANG_REFLECT_CONSTRUCTOR: &str = "Ljava/lang/reflect/Constructor;";

pub fn is_void(desc: &str) -> bool {
    desc == "V"
}

pub fn is_wide(desc: &str) -> bool {
    desc == "J" || desc == "D"
}

pub fn is_primitive(desc: &str) -> bool {
    matches!(desc, "Z" | "B" | "S" | "C" | "I" | "J" | "F" | "D" | "V")
}

pub fn is_object(desc: &str) -> bool {
    desc.starts_with('L') || desc.starts_with('[')
}

pub fn is_array(desc: &str) -> bool {
    desc.starts_with('[')
}

/// Integral types that live in a single 32-bit register.
pub fn is_int_like(desc: &str) -> bool {
    matches!(desc, "Z" | "B" | "S" | "C" | "I")
}

pub fn shorty_char(desc: &str) -> char {
    match desc.chars().next() {
        Some('[') | Some('L') | None => 'L',
        Some(c) => c,
    }
}

pub fn array_component(desc: &str) -> Option<&str> {
    desc.strip_prefix('[')
}

pub fn make_array(component: &str) -> String {
    format!("[{}", component)
}

/// `Ljava/lang/String;` -> `java.lang.String`; arrays keep their descriptor form with dots,
/// like `Class.getName()` does.
pub fn java_name(desc: &str) -> String {
    if let Some(inner) = desc.strip_prefix('L').and_then(|d| d.strip_suffix(';')) {
        inner.replace('/', ".")
    } else {
        desc.replace('/', ".")
    }
}

/// Inverse of `java_name` for class names accepted by `Class.forName`.
pub fn descriptor_from_java_name(name: &str) -> String {
    if name.starts_with('[') {
        name.replace('.', "/")
    } else {
        format!("L{};", name.replace('.', "/"))
    }
}

/// Simple (unqualified) class name used in stack-trace collision checks.
pub fn simple_name(desc: &str) -> &str {
    let inner = desc.strip_prefix('L').and_then(|d| d.strip_suffix(';')).unwrap_or(desc);
    match inner.rfind('/') {
        Some(ix) => &inner[ix + 1..],
        None => inner,
    }
}

/// Splits one field descriptor off the front of `s`.
fn next_descriptor(s: &str) -> Result<(&str, &str)> {
    let bytes = s.as_bytes();
    let mut ix = 0;
    while ix < bytes.len() && bytes[ix] == b'[' {
        ix += 1;
    }
    if ix >= bytes.len() {
        return Err(DexError::new(format!("truncated type descriptor {}", s)));
    }
    let end = match bytes[ix] {
        b'L' => match s[ix..].find(';') {
            Some(semi) => ix + semi + 1,
            None => return Err(DexError::new(format!("unterminated class descriptor {}", s))),
        },
        b'Z' | b'B' | b'S' | b'C' | b'I' | b'J' | b'F' | b'D' | b'V' => ix + 1,
        c => return Err(DexError::new(format!("invalid descriptor character '{}' in {}", c as char, s))),
    };
    Ok((&s[..end], &s[end..]))
}

/// `(IJLjava/lang/String;)V` -> (["I", "J", "Ljava/lang/String;"], "V")
pub fn split_method_descriptor(desc: &str) -> Result<(Vec<&str>, &str)> {
    let rest = desc
        .strip_prefix('(')
        .ok_or_else(|| DexError::new(format!("method descriptor must start with '(': {}", desc)))?;
    let close = rest
        .find(')')
        .ok_or_else(|| DexError::new(format!("method descriptor missing ')': {}", desc)))?;
    let mut params = &rest[..close];
    let mut args = Vec::new();
    while !params.is_empty() {
        let (d, tail) = next_descriptor(params)?;
        args.push(d);
        params = tail;
    }
    let (rtype, tail) = next_descriptor(&rest[close + 1..])?;
    if !tail.is_empty() {
        return Err(DexError::new(format!("trailing characters in method descriptor {}", desc)));
    }
    Ok((args, rtype))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_method_descriptor() {
        let (args, r) = split_method_descriptor("(I[JLjava/lang/String;[[LFoo;)Z").unwrap();
        assert_eq!(args, vec!["I", "[J", "Ljava/lang/String;", "[[LFoo;"]);
        assert_eq!(r, "Z");
        assert!(split_method_descriptor("(Q)V").is_err());
        assert!(split_method_descriptor("I)V").is_err());
    }

    #[test]
    fn test_names() {
        assert_eq!(java_name("Ljava/lang/String;"), "java.lang.String");
        assert_eq!(descriptor_from_java_name("java.lang.String"), "Ljava/lang/String;");
        assert_eq!(descriptor_from_java_name("[Ljava.lang.String;"), "[Ljava/lang/String;");
        assert_eq!(simple_name("Lcom/foo/Bar;"), "Bar");
        assert_eq!(shorty_char("[I"), 'L');
        assert!(is_wide("D") && !is_wide("I"));
    }
}
