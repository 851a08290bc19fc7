//! Annotations: the resolved form attached to classes and members, and the raw
//! `annotations_directory_item` / `annotation_set_item` / `annotation_set_ref_list` records.

use crate::dex::encoded_values::{EncodedAnnotation, UnknownTagPolicy};
use crate::dex::{read_u1, read_u4, write_u1, write_u4, IndexResolver, RefResolver, RefVisitor};
use crate::error::{DexError, Result};
use crate::ir::interner::{Interner, TypeId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AnnotationVisibility {
    Build = 0,
    Runtime = 1,
    System = 2,
}

impl AnnotationVisibility {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(AnnotationVisibility::Build),
            1 => Some(AnnotationVisibility::Runtime),
            2 => Some(AnnotationVisibility::System),
            _ => None,
        }
    }
}

/// `annotation_item`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DexAnnotation {
    pub visibility: AnnotationVisibility,
    pub annotation: EncodedAnnotation,
}

impl DexAnnotation {
    pub(crate) fn read(bytes: &[u8], ix: &mut usize, refs: &dyn RefResolver, policy: UnknownTagPolicy) -> Result<DexAnnotation> {
        let start = *ix;
        let raw = read_u1(bytes, ix)?;
        let visibility = AnnotationVisibility::from_u8(raw)
            .ok_or_else(|| DexError::malformed(start, format!("bad annotation visibility {}", raw)))?;
        let annotation = EncodedAnnotation::read(bytes, ix, refs, policy)?;
        Ok(DexAnnotation { visibility, annotation })
    }

    pub(crate) fn write(&self, bytes: &mut Vec<u8>, idx: &dyn IndexResolver) -> Result<usize> {
        let mut c = write_u1(bytes, self.visibility as u8);
        c += self.annotation.write(bytes, idx)?;
        Ok(c)
    }
}

/// The annotations attached to one class, member or parameter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct AnnotationSet {
    pub annotations: Vec<DexAnnotation>,
}

impl AnnotationSet {
    pub fn contains(&self, ty: TypeId) -> bool {
        self.annotations.iter().any(|a| a.annotation.ty == ty)
    }

    pub fn is_empty(&self) -> bool {
        self.annotations.is_empty()
    }

    pub(crate) fn visit_refs(&self, v: &mut dyn RefVisitor) {
        for a in &self.annotations {
            a.annotation.visit_refs(v);
        }
    }

    /// Reads an `annotation_set_item` and the items it points at.
    pub(crate) fn read_at(bytes: &[u8], off: u32, refs: &dyn RefResolver, policy: UnknownTagPolicy) -> Result<AnnotationSet> {
        let mut ix = off as usize;
        let raw = AnnotationSetItem::read(bytes, &mut ix)?;
        let mut annotations = Vec::with_capacity(raw.entries.len());
        for entry in raw.entries {
            if entry == 0 {
                continue;
            }
            let mut j = entry as usize;
            annotations.push(DexAnnotation::read(bytes, &mut j, refs, policy)?);
        }
        Ok(AnnotationSet { annotations })
    }

    pub fn show(&self, g: &Interner) -> String {
        let parts: Vec<String> = self.annotations.iter().map(|a| a.annotation.show(g)).collect();
        parts.join(" ")
    }
}

/// annotation_set_item: offsets of `annotation_item`s
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnotationSetItem {
    pub entries: Vec<u32>,
}

impl AnnotationSetItem {
    pub fn read(bytes: &[u8], ix: &mut usize) -> Result<AnnotationSetItem> {
        let size = read_u4(bytes, ix)? as usize;
        let mut entries = Vec::with_capacity(size.min(4096));
        for _ in 0..size {
            entries.push(read_u4(bytes, ix)?);
        }
        Ok(AnnotationSetItem { entries })
    }

    pub fn write(&self, bytes: &mut Vec<u8>) -> usize {
        let mut c = write_u4(bytes, self.entries.len() as u32);
        for off in &self.entries {
            c += write_u4(bytes, *off);
        }
        c
    }
}

/// annotation_set_ref_list: one set offset per parameter, 0 for none
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnotationSetRefList {
    pub list: Vec<u32>,
}

impl AnnotationSetRefList {
    pub fn read(bytes: &[u8], ix: &mut usize) -> Result<AnnotationSetRefList> {
        let size = read_u4(bytes, ix)? as usize;
        let mut list = Vec::with_capacity(size.min(256));
        for _ in 0..size {
            list.push(read_u4(bytes, ix)?);
        }
        Ok(AnnotationSetRefList { list })
    }

    pub fn write(&self, bytes: &mut Vec<u8>) -> usize {
        let mut c = write_u4(bytes, self.list.len() as u32);
        for off in &self.list {
            c += write_u4(bytes, *off);
        }
        c
    }
}

/// One `(member index, offset)` pair of an annotations directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemberAnnotations {
    pub idx: u32,
    pub annotations_off: u32,
}

impl MemberAnnotations {
    fn read(bytes: &[u8], ix: &mut usize) -> Result<MemberAnnotations> {
        Ok(MemberAnnotations { idx: read_u4(bytes, ix)?, annotations_off: read_u4(bytes, ix)? })
    }

    fn write(&self, bytes: &mut Vec<u8>) -> usize {
        write_u4(bytes, self.idx) + write_u4(bytes, self.annotations_off)
    }
}

/// annotations_directory_item
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AnnotationsDirectoryItem {
    pub class_annotations_off: u32,
    pub field_annotations: Vec<MemberAnnotations>,
    pub method_annotations: Vec<MemberAnnotations>,
    /// Offsets here point at `annotation_set_ref_list`s.
    pub parameter_annotations: Vec<MemberAnnotations>,
}

impl AnnotationsDirectoryItem {
    pub fn read(bytes: &[u8], ix: &mut usize) -> Result<AnnotationsDirectoryItem> {
        let class_annotations_off = read_u4(bytes, ix)?;
        let fields_size = read_u4(bytes, ix)? as usize;
        let methods_size = read_u4(bytes, ix)? as usize;
        let parameters_size = read_u4(bytes, ix)? as usize;
        let mut read_list = |n: usize| -> Result<Vec<MemberAnnotations>> {
            (0..n).map(|_| MemberAnnotations::read(bytes, ix)).collect()
        };
        let field_annotations = read_list(fields_size)?;
        let method_annotations = read_list(methods_size)?;
        let parameter_annotations = read_list(parameters_size)?;
        Ok(AnnotationsDirectoryItem { class_annotations_off, field_annotations, method_annotations, parameter_annotations })
    }

    pub fn write(&self, bytes: &mut Vec<u8>) -> usize {
        let mut c = write_u4(bytes, self.class_annotations_off);
        c += write_u4(bytes, self.field_annotations.len() as u32);
        c += write_u4(bytes, self.method_annotations.len() as u32);
        c += write_u4(bytes, self.parameter_annotations.len() as u32);
        for m in self
            .field_annotations
            .iter()
            .chain(self.method_annotations.iter())
            .chain(self.parameter_annotations.iter())
        {
            c += m.write(bytes);
        }
        c
    }

    pub fn is_empty(&self) -> bool {
        self.class_annotations_off == 0
            && self.field_annotations.is_empty()
            && self.method_annotations.is_empty()
            && self.parameter_annotations.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dex::encoded_values::tests::IdentityIndex;
    use crate::dex::encoded_values::{AnnotationElement, EncodedValue};

    #[test]
    fn test_annotation_item_roundtrip() {
        let g = Interner::new();
        let item = DexAnnotation {
            visibility: AnnotationVisibility::Runtime,
            annotation: EncodedAnnotation {
                ty: g.make_type("LKeep;"),
                elements: vec![AnnotationElement { name: g.make_string("value"), value: EncodedValue::Boolean(true) }],
            },
        };
        let mut buf = vec![];
        item.write(&mut buf, &IdentityIndex).unwrap();
        let mut ix = 0;
        let back = DexAnnotation::read(&buf, &mut ix, &IdentityIndex, UnknownTagPolicy::Fail).unwrap();
        assert_eq!(ix, buf.len());
        assert_eq!(back, item);
        assert!(AnnotationSet { annotations: vec![back] }.contains(g.make_type("LKeep;")));
    }

    #[test]
    fn test_bad_visibility_is_malformed() {
        let mut ix = 0;
        let e = DexAnnotation::read(&[7, 0, 0], &mut ix, &IdentityIndex, UnknownTagPolicy::Fail).unwrap_err();
        assert_eq!(e.kind(), crate::error::ErrorKind::MalformedDex);
    }

    #[test]
    fn test_directory_roundtrip() {
        let dir = AnnotationsDirectoryItem {
            class_annotations_off: 0x1000,
            field_annotations: vec![MemberAnnotations { idx: 1, annotations_off: 0x2000 }],
            method_annotations: vec![MemberAnnotations { idx: 2, annotations_off: 0x3000 }],
            parameter_annotations: vec![MemberAnnotations { idx: 3, annotations_off: 0x4000 }],
        };
        let mut buf = vec![];
        assert_eq!(dir.write(&mut buf), 16 + 3 * 8);
        let mut ix = 0;
        assert_eq!(AnnotationsDirectoryItem::read(&buf, &mut ix).unwrap(), dir);
    }
}
