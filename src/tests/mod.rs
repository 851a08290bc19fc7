mod constprop_scenarios;
mod dex_roundtrip;

use std::io::{Cursor, Write};

use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::ir::assembler::{parse_code, print_code};
use crate::ir::class::{AccessFlags, DexClass, DexMethod, Scope};
use crate::ir::interner::{Interner, MethodId};

pub(crate) fn class(g: &Interner, name: &str, sup: Option<&str>, access: AccessFlags) -> DexClass {
    DexClass::new(g.make_type(name), sup.map(|s| g.make_type(s)), access)
}

/// Adds a method to `class`. An empty body declares it without code.
pub(crate) fn method(g: &Interner, class: &mut DexClass, sig: &str, access: AccessFlags, body: &str) -> MethodId {
    let m = g.make_method_from_str(sig).unwrap();
    let mut def = DexMethod::new(m, access);
    if !body.is_empty() {
        def = def.with_code(parse_code(g, body).unwrap());
    }
    class.add_method(g, def).unwrap();
    m
}

pub(crate) fn canonical(g: &Interner, body: &str) -> String {
    print_code(&parse_code(g, body).unwrap(), g)
}

pub(crate) fn body_of(g: &Interner, scope: &Scope, m: MethodId) -> String {
    print_code(scope.method_def(m, g).unwrap().code().unwrap(), g)
}

/// An in-memory JAR holding `entries` in the given order.
pub(crate) fn jar(entries: &[(&str, Vec<u8>)], method: CompressionMethod) -> Vec<u8> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(method);
    for (name, data) in entries {
        if name.ends_with('/') {
            writer.add_directory(*name, options).unwrap();
        } else {
            writer.start_file(*name, options).unwrap();
            writer.write_all(data).unwrap();
        }
    }
    writer.finish().unwrap().into_inner()
}
