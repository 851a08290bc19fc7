use std::collections::BTreeMap;
use std::sync::Arc;

use super::{class, method};
use crate::dex::annotations::{AnnotationSet, AnnotationVisibility, DexAnnotation};
use crate::dex::dex_file::DexFile;
use crate::dex::encoded_values::{AnnotationElement, EncodedAnnotation, EncodedValue};
use crate::dex::loader::DexLoader;
use crate::dex::writer::DexWriter;
use crate::ir::assembler::print_code;
use crate::ir::class::{AccessFlags, DexClass, DexField};
use crate::ir::interner::Interner;

fn write_and_read(g: &Interner, classes: &[DexClass]) -> (Vec<u8>, Vec<DexClass>) {
    let bytes = DexWriter::new(g).write(classes).unwrap();
    let dex = DexFile::from_bytes("mem", Arc::from(bytes.clone())).unwrap();
    let loaded = DexLoader::new(g, true).load(&dex).unwrap();
    (bytes, loaded)
}

/// One line per class member, keyed by class descriptor. Method bodies are printed in full.
fn summarize(g: &Interner, classes: &mut [DexClass]) -> BTreeMap<String, Vec<String>> {
    let mut out = BTreeMap::new();
    for c in classes.iter_mut() {
        let mut lines = vec![format!(
            "{:?} super={:?} ifaces={:?} file={:?} annos={:?}",
            c.access,
            c.super_class.map(|t| g.descriptor(t)),
            c.interfaces.iter().map(|t| g.descriptor(*t)).collect::<Vec<_>>(),
            c.source_file.map(|s| g.string(s)),
            c.annotations
                .iter()
                .flat_map(|set| set.annotations.iter())
                .map(|a| format!("{}{:?}", g.descriptor(a.annotation.ty), a.annotation.elements))
                .collect::<Vec<_>>()
        )];
        for f in c.sfields.iter().chain(c.ifields.iter()) {
            lines.push(format!("{} {:?} {:?} {:?}", g.show_field(f.reference), f.access, f.static_value, f.annotations));
        }
        for m in c.methods_mut() {
            let header = format!("{} {:?} {:?} {:?}", g.show_method(m.reference), m.access, m.annotations, m.param_annotations);
            lines.push(header);
            if let Some(code) = m.code_mut(g).unwrap() {
                lines.push(print_code(code, g));
            }
        }
        out.insert(g.descriptor(c.ty).to_string(), lines);
    }
    out
}

fn annotation(g: &Interner, ty: &str, visibility: AnnotationVisibility, elements: Vec<(&str, EncodedValue)>) -> AnnotationSet {
    let elements = elements
        .into_iter()
        .map(|(name, value)| AnnotationElement { name: g.make_string(name), value })
        .collect();
    AnnotationSet {
        annotations: vec![DexAnnotation { visibility, annotation: EncodedAnnotation { ty: g.make_type(ty), elements } }],
    }
}

/// A small program touching most of the format: hierarchy, static values, annotations,
/// try/catch, switches, wide registers, debug positions and non-ASCII strings.
fn corpus(g: &Interner) -> Vec<DexClass> {
    let iface = AccessFlags::PUBLIC | AccessFlags::INTERFACE | AccessFlags::ABSTRACT;
    let mut shape = class(g, "Lgeo/Shape;", Some("Ljava/lang/Object;"), iface);
    method(g, &mut shape, "Lgeo/Shape;.area:()D", AccessFlags::PUBLIC | AccessFlags::ABSTRACT, "");

    let mut circle = class(g, "Lgeo/Circle;", Some("Ljava/lang/Object;"), AccessFlags::PUBLIC);
    circle.interfaces.push(g.make_type("Lgeo/Shape;"));
    circle.source_file = Some(g.make_string("Circle.java"));
    circle.annotations = Some(annotation(
        g,
        "Lgeo/Tag;",
        AnnotationVisibility::Runtime,
        vec![("value", EncodedValue::String(g.make_string("r\u{e9}sum\u{e9}\u{0}"))), ("weight", EncodedValue::Int(-3))],
    ));

    let pi = g.make_field_from_str("Lgeo/Circle;.PI:D").unwrap();
    let mut pi_field = DexField::new(pi, AccessFlags::PUBLIC | AccessFlags::STATIC | AccessFlags::FINAL);
    pi_field.static_value = Some(EncodedValue::Double(3.25));
    circle.sfields.push(pi_field);
    let name = g.make_field_from_str("Lgeo/Circle;.NAME:Ljava/lang/String;").unwrap();
    let mut name_field = DexField::new(name, AccessFlags::PUBLIC | AccessFlags::STATIC | AccessFlags::FINAL);
    name_field.static_value = Some(EncodedValue::String(g.make_string("\u{1F600} circle")));
    circle.sfields.push(name_field);
    let radius = g.make_field_from_str("Lgeo/Circle;.radius:D").unwrap();
    circle.ifields.push(DexField::new(radius, AccessFlags::PRIVATE));

    method(
        g,
        &mut circle,
        "Lgeo/Circle;.<init>:(D)V",
        AccessFlags::PUBLIC | AccessFlags::CONSTRUCTOR,
        r#"((load-param-object v0) (load-param-wide v1)
            (invoke-direct (v0) "Ljava/lang/Object;.<init>:()V")
            (iput-wide v1 v0 "Lgeo/Circle;.radius:D")
            (return-void))"#,
    );
    method(
        g,
        &mut circle,
        "Lgeo/Circle;.area:()D",
        AccessFlags::PUBLIC,
        r#"((load-param-object v4)
            (.pos "Lgeo/Circle;.area:()D" "Circle.java" 12)
            (iget-wide v4 "Lgeo/Circle;.radius:D")
            (move-result-pseudo-wide v0)
            (sget-wide "Lgeo/Circle;.PI:D")
            (move-result-pseudo-wide v2)
            (mul-double v0 v0 v0)
            (.pos "Lgeo/Circle;.area:()D" "Circle.java" 13)
            (mul-double v0 v0 v2)
            (return-wide v0))"#,
    );
    method(
        g,
        &mut circle,
        "Lgeo/Circle;.classify:(I)Ljava/lang/String;",
        AccessFlags::PUBLIC | AccessFlags::STATIC,
        r#"((load-param v1)
            (switch v1 (:one :two :many))
            (const-string "other")
            (move-result-pseudo-object v0)
            (return-object v0)
            (:one 1)
            (const-string "one")
            (move-result-pseudo-object v0)
            (return-object v0)
            (:two 2)
            (const-string "two")
            (move-result-pseudo-object v0)
            (return-object v0)
            (:many 1000)
            (const-string "many")
            (move-result-pseudo-object v0)
            (return-object v0))"#,
    );
    method(
        g,
        &mut circle,
        "Lgeo/Circle;.safeArea:(Lgeo/Shape;)D",
        AccessFlags::PUBLIC | AccessFlags::STATIC,
        r#"((load-param-object v2)
            (.try_start c0)
            (invoke-interface (v2) "Lgeo/Shape;.area:()D")
            (move-result-wide v0)
            (.try_end c0)
            (return-wide v0)
            (.catch (c0) "Ljava/lang/RuntimeException;")
            (const-wide v0 0)
            (return-wide v0))"#,
    );
    vec![circle, shape]
}

#[test]
fn written_program_reads_back_unchanged() {
    let g = Interner::new();
    let (_, mut first) = write_and_read(&g, &corpus(&g));
    // the interface is written before its implementor
    assert_eq!(first.len(), 2);
    assert_eq!(&*g.descriptor(first[0].ty), "Lgeo/Shape;");

    let (_, mut second) = write_and_read(&g, &first);
    let before = summarize(&g, &mut first);
    let after = summarize(&g, &mut second);
    assert_eq!(before, after);

    let circle = &before["Lgeo/Circle;"];
    assert!(circle[0].contains("Lgeo/Tag;"));
    assert!(circle.iter().any(|l| l.contains("(switch")));
    assert!(circle.iter().any(|l| l.contains(".catch")));
    assert!(circle.iter().any(|l| l.contains("Circle.java")));
}

#[test]
fn written_file_has_header_version() {
    let g = Interner::new();
    let (bytes, _) = write_and_read(&g, &corpus(&g));
    let dex = DexFile::from_bytes("mem", Arc::from(bytes.clone())).unwrap();
    assert_eq!(dex.header.version(), "035");
    assert_eq!(dex.header.file_size as usize, bytes.len());
    assert_eq!(&bytes[..4], b"dex\n");
}

#[test]
fn truncated_file_is_malformed() {
    let g = Interner::new();
    let bytes = DexWriter::new(&g).write(&corpus(&g)).unwrap();
    let cut = &bytes[..bytes.len() / 2];
    let err = DexFile::from_bytes("mem", Arc::from(cut.to_vec())).unwrap_err();
    assert_eq!(err.kind(), crate::error::ErrorKind::MalformedDex);
}
