//! Declares the classes of JAR files as external classes of a scope.

use std::collections::HashSet;
use std::fs;
use std::io::{Cursor, Read};
use std::path::Path;

use log::{debug, info};
use zip::ZipArchive;

use crate::config::LoaderConfig;
use crate::dex::encoded_values::EncodedValue;
use crate::error::{DexError, ErrorKind, Result};
use crate::ir::class::{AccessFlags, DexClass, DexField, DexMethod, Scope};
use crate::ir::interner::{Interner, TypeId};
use crate::jar::class_file::{parse_class_file, ClassFile, JavaConstant, MemberInfo, ACC_SUPER};

pub struct JarLoader<'g> {
    g: &'g Interner,
    whitelist: HashSet<String>,
}

impl<'g> JarLoader<'g> {
    pub fn new(g: &'g Interner, config: &LoaderConfig) -> Self {
        JarLoader { g, whitelist: config.duplicate_class_whitelist.iter().cloned().collect() }
    }

    fn type_of(&self, internal: &str) -> TypeId {
        if internal.starts_with('[') {
            self.g.make_type(internal)
        } else {
            self.g.make_type(&format!("L{};", internal))
        }
    }

    fn static_value(&self, field: &MemberInfo) -> Option<EncodedValue> {
        let v = field.constant_value.as_ref()?;
        Some(match (v, field.descriptor.as_str()) {
            (JavaConstant::Int(x), "Z") => EncodedValue::Boolean(*x != 0),
            (JavaConstant::Int(x), "B") => EncodedValue::Byte(*x as i8),
            (JavaConstant::Int(x), "S") => EncodedValue::Short(*x as i16),
            (JavaConstant::Int(x), "C") => EncodedValue::Char(*x as u16),
            (JavaConstant::Int(x), _) => EncodedValue::Int(*x),
            (JavaConstant::Long(x), _) => EncodedValue::Long(*x),
            (JavaConstant::Float(x), _) => EncodedValue::Float(*x),
            (JavaConstant::Double(x), _) => EncodedValue::Double(*x),
            (JavaConstant::String(s), _) => EncodedValue::String(self.g.make_string(s)),
        })
    }

    /// Turns a parsed class file into an external class.
    pub fn declare(&self, cf: &ClassFile, location: &str) -> Result<DexClass> {
        let g = self.g;
        let ty = self.type_of(&cf.this_class);
        let access = AccessFlags::from_bits_truncate(u32::from(cf.access & !ACC_SUPER));
        let mut class = DexClass::new(ty, cf.super_class.as_deref().map(|s| self.type_of(s)), access);
        class.interfaces = cf.interfaces.iter().map(|i| self.type_of(i)).collect();
        class.location = location.to_string();
        class.external = true;

        for f in &cf.fields {
            let reference = g.make_field(ty, g.make_string(&f.name), g.make_type(&f.descriptor));
            let mut field = DexField::new(reference, AccessFlags::from_bits_truncate(u32::from(f.access)));
            if field.is_static() {
                field.static_value = self.static_value(f);
                class.sfields.push(field);
            } else {
                class.ifields.push(field);
            }
        }
        for m in &cf.methods {
            let proto = g
                .make_proto_from_descriptor(&m.descriptor)
                .map_err(|e| DexError::with_kind(ErrorKind::InvalidJava, e.message()).context(format!("method {}", m.name)))?;
            let reference = g.make_method(ty, g.make_string(&m.name), proto);
            let mut access = AccessFlags::from_bits_truncate(u32::from(m.access));
            if m.name == "<init>" || m.name == "<clinit>" {
                access |= AccessFlags::CONSTRUCTOR;
            }
            class.add_method(g, DexMethod::new(reference, access))?;
        }
        Ok(class)
    }

    pub fn load_class(&self, bytes: &[u8], location: &str) -> Result<DexClass> {
        let cf = parse_class_file(bytes).map_err(|e| e.extra("location", location))?;
        self.declare(&cf, location)
    }

    /// Every `.class` entry of an in-memory JAR, in central-directory order.
    pub fn load_bytes(&self, bytes: &[u8], location: &str) -> Result<Vec<DexClass>> {
        let mut archive = ZipArchive::new(Cursor::new(bytes)).map_err(|e| DexError::from(e).extra("jar", location))?;
        let mut classes = Vec::new();
        for index in 0..archive.len() {
            let mut entry = archive.by_index(index).map_err(|e| DexError::from(e).extra("jar", location))?;
            if entry.is_dir() || !entry.name().ends_with(".class") {
                continue;
            }
            let where_ = format!("{}!{}", location, entry.name());
            let mut data = Vec::with_capacity(entry.size() as usize);
            // a crc mismatch surfaces as a read error here
            entry.read_to_end(&mut data).map_err(|e| {
                DexError::with_kind(ErrorKind::InvalidJava, format!("cannot inflate entry: {}", e)).extra("location", &where_)
            })?;
            classes.push(self.load_class(&data, &where_)?);
        }
        debug!("[jar] {}: {} classes", location, classes.len());
        Ok(classes)
    }

    pub fn load_file(&self, path: &Path) -> Result<Vec<DexClass>> {
        let bytes = fs::read(path).map_err(|e| {
            DexError::with_kind(ErrorKind::InvalidJava, format!("cannot read {}: {}", path.display(), e))
        })?;
        self.load_bytes(&bytes, &path.display().to_string())
    }

    /// Adds `classes` to `scope` as library classes. Returns how many were new.
    pub fn add_to_scope(&self, scope: &mut Scope, classes: Vec<DexClass>) -> usize {
        let g = self.g;
        let mut added = 0;
        for c in classes {
            let whitelisted = self.whitelist.contains(&*g.descriptor(c.ty));
            if scope.add_external_class(g, c, whitelisted) {
                added += 1;
            }
        }
        added
    }
}

/// Loads every JAR of `paths` into `scope`, in order. Earlier JARs win on duplicates.
pub fn load_jar_files(g: &Interner, scope: &mut Scope, paths: &[impl AsRef<Path>], config: &LoaderConfig) -> Result<usize> {
    let loader = JarLoader::new(g, config);
    let mut added = 0;
    for p in paths {
        let classes = loader.load_file(p.as_ref())?;
        added += loader.add_to_scope(scope, classes);
    }
    info!("[jar] {} library classes from {} jars", added, paths.len());
    Ok(added)
}

#[cfg(test)]
mod tests {
    use zip::CompressionMethod;

    use super::*;
    use crate::ir::class::MethodSearch;
    use crate::jar::class_file::fixtures::{class_file, Member};

    fn jar(entries: &[(&str, Vec<u8>)]) -> Vec<u8> {
        crate::tests::jar(entries, CompressionMethod::Deflated)
    }

    fn base_class() -> Vec<u8> {
        class_file(
            0x0421,
            "lib/Base",
            Some("java/lang/Object"),
            &["java/lang/Runnable"],
            &[Member { access: 0x19, name: "LIMIT", descriptor: "I", constant: Some(JavaConstant::Int(7)) }],
            &[
                Member { access: 0x1, name: "<init>", descriptor: "()V", constant: None },
                Member { access: 0x401, name: "run", descriptor: "()V", constant: None },
                Member { access: 0x9, name: "make", descriptor: "(I[Ljava/lang/String;)Llib/Base;", constant: None },
            ],
        )
    }

    #[test]
    fn test_declares_external_classes() {
        let g = Interner::new();
        let bytes = jar(&[("META-INF/MANIFEST.MF", b"x".to_vec()), ("lib/Base.class", base_class())]);
        let loader = JarLoader::new(&g, &LoaderConfig::default());
        let classes = loader.load_bytes(&bytes, "lib.jar").unwrap();
        assert_eq!(classes.len(), 1);
        let c = &classes[0];
        assert!(c.external);
        assert_eq!(&*g.descriptor(c.ty), "Llib/Base;");
        assert_eq!(c.location, "lib.jar!lib/Base.class");
        assert!(c.access.contains(AccessFlags::ABSTRACT));
        assert!(!c.access.contains(AccessFlags::SYNCHRONIZED));
        assert_eq!(c.sfields[0].static_value, Some(EncodedValue::Int(7)));
        assert_eq!(c.dmethods.len(), 2);
        assert_eq!(c.vmethods.len(), 1);

        let mut scope = Scope::new();
        assert_eq!(loader.add_to_scope(&mut scope, classes), 1);
        let make = g.make_method_from_str("Llib/Base;.make:(I[Ljava/lang/String;)Llib/Base;").unwrap();
        assert_eq!(scope.resolve_method(&g, make, MethodSearch::Static), Some(make));
        assert!(scope.is_external(g.make_type("Llib/Base;")));
    }

    #[test]
    fn test_first_definition_wins() {
        let g = Interner::new();
        let other = class_file(0x1, "lib/Base", Some("java/lang/Object"), &[], &[], &[]);
        let loader = JarLoader::new(&g, &LoaderConfig::default());
        let mut scope = Scope::new();
        let first = loader.load_bytes(&jar(&[("lib/Base.class", base_class())]), "a.jar").unwrap();
        let second = loader.load_bytes(&jar(&[("lib/Base.class", other)]), "b.jar").unwrap();
        assert_eq!(loader.add_to_scope(&mut scope, first), 1);
        assert_eq!(loader.add_to_scope(&mut scope, second), 0);
        let c = scope.class(g.make_type("Llib/Base;")).unwrap();
        assert_eq!(c.location, "a.jar!lib/Base.class");
    }

    #[test]
    fn test_load_from_disk_and_errors() {
        let g = Interner::new();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lib.jar");
        fs::write(&path, jar(&[("lib/Base.class", base_class())])).unwrap();
        let mut scope = Scope::new();
        assert_eq!(load_jar_files(&g, &mut scope, &[&path], &LoaderConfig::default()).unwrap(), 1);

        let bad = dir.path().join("bad.jar");
        fs::write(&bad, jar(&[("Bad.class", vec![0, 1, 2, 3])])).unwrap();
        let err = load_jar_files(&g, &mut scope, &[&bad], &LoaderConfig::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidJava);
        assert_eq!(err.extra_info().get("location").map(String::as_str), Some(format!("{}!Bad.class", bad.display()).as_str()));
    }

    #[test]
    fn test_stored_entries_and_directories() {
        let g = Interner::new();
        let bytes = crate::tests::jar(
            &[("lib/", Vec::new()), ("lib/Base.class", base_class()), ("lib/notes.txt", b"hi".to_vec())],
            CompressionMethod::Stored,
        );
        let classes = JarLoader::new(&g, &LoaderConfig::default()).load_bytes(&bytes, "lib.jar").unwrap();
        assert_eq!(classes.len(), 1);
        assert_eq!(&*g.descriptor(classes[0].ty), "Llib/Base;");
    }

    #[test]
    fn test_corrupt_archives_are_invalid_java() {
        let g = Interner::new();
        let loader = JarLoader::new(&g, &LoaderConfig::default());
        let err = loader.load_bytes(b"PK\x03\x04", "tiny.jar").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidJava);
        assert_eq!(err.extra_info().get("jar").map(String::as_str), Some("tiny.jar"));

        // stored data is laid out verbatim, so flipping a byte of it breaks the crc
        let class = base_class();
        let mut bytes = crate::tests::jar(&[("lib/Base.class", class.clone())], CompressionMethod::Stored);
        let at = bytes.windows(class.len()).position(|w| w == class.as_slice()).unwrap();
        bytes[at + class.len() - 1] ^= 0xFF;
        let err = loader.load_bytes(&bytes, "bad.jar").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidJava);
        assert_eq!(err.extra_info().get("location").map(String::as_str), Some("bad.jar!lib/Base.class"));
    }
}
