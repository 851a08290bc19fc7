//! Raw DEX container records: header, map list, id tables, class data and code items.
//!
//! These mirror the on-disk layout with plain table indices and file offsets. The loader
//! turns them into interned ids and IR; the writer produces them from IR.

use std::path::Path;
use std::sync::Arc;

use log::warn;

use crate::dex::{
    check_index, read_sleb128, read_u2, read_u4, read_uleb128, read_x, write_sleb128, write_u2, write_u4,
    write_uleb128, write_x,
};
use crate::error::{DexError, Result};

pub const DEX_MAGIC_035: [u8; 8] = [0x64, 0x65, 0x78, 0x0a, 0x30, 0x33, 0x35, 0x00];
pub const DEX_MAGIC_038: [u8; 8] = [0x64, 0x65, 0x78, 0x0a, 0x30, 0x33, 0x38, 0x00];
pub const ENDIAN_CONSTANT: u32 = 0x12345678;
pub const REVERSE_ENDIAN_CONSTANT: u32 = 0x78563412;
pub const NO_INDEX: u32 = 0xffffffff;
pub const HEADER_SIZE: u32 = 0x70;

// Map list item types
pub const TYPE_HEADER_ITEM: u16 = 0x0000;
pub const TYPE_STRING_ID_ITEM: u16 = 0x0001;
pub const TYPE_TYPE_ID_ITEM: u16 = 0x0002;
pub const TYPE_PROTO_ID_ITEM: u16 = 0x0003;
pub const TYPE_FIELD_ID_ITEM: u16 = 0x0004;
pub const TYPE_METHOD_ID_ITEM: u16 = 0x0005;
pub const TYPE_CLASS_DEF_ITEM: u16 = 0x0006;
pub const TYPE_CALL_SITE_ID_ITEM: u16 = 0x0007;
pub const TYPE_METHOD_HANDLE_ITEM: u16 = 0x0008;
pub const TYPE_MAP_LIST: u16 = 0x1000;
pub const TYPE_TYPE_LIST: u16 = 0x1001;
pub const TYPE_ANNOTATION_SET_REF_LIST: u16 = 0x1002;
pub const TYPE_ANNOTATION_SET_ITEM: u16 = 0x1003;
pub const TYPE_CLASS_DATA_ITEM: u16 = 0x2000;
pub const TYPE_CODE_ITEM: u16 = 0x2001;
pub const TYPE_STRING_DATA_ITEM: u16 = 0x2002;
pub const TYPE_DEBUG_INFO_ITEM: u16 = 0x2003;
pub const TYPE_ANNOTATION_ITEM: u16 = 0x2004;
pub const TYPE_ENCODED_ARRAY_ITEM: u16 = 0x2005;
pub const TYPE_ANNOTATIONS_DIRECTORY_ITEM: u16 = 0x2006;

// Debug info opcodes
pub const DBG_END_SEQUENCE: u8 = 0x00;
pub const DBG_ADVANCE_PC: u8 = 0x01;
pub const DBG_ADVANCE_LINE: u8 = 0x02;
pub const DBG_START_LOCAL: u8 = 0x03;
pub const DBG_START_LOCAL_EXTENDED: u8 = 0x04;
pub const DBG_END_LOCAL: u8 = 0x05;
pub const DBG_RESTART_LOCAL: u8 = 0x06;
pub const DBG_SET_PROLOGUE_END: u8 = 0x07;
pub const DBG_SET_EPILOGUE_BEGIN: u8 = 0x08;
pub const DBG_SET_FILE: u8 = 0x09;
pub const DBG_FIRST_SPECIAL: u8 = 0x0a;
pub const DBG_LINE_BASE: i32 = -4;
pub const DBG_LINE_RANGE: i32 = 15;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub magic: [u8; 8],
    pub checksum: u32,
    pub signature: [u8; 20],
    pub file_size: u32,
    pub header_size: u32,
    pub endian_tag: u32,
    pub link_size: u32,
    pub link_off: u32,
    pub map_off: u32,
    pub string_ids_size: u32,
    pub string_ids_off: u32,
    pub type_ids_size: u32,
    pub type_ids_off: u32,
    pub proto_ids_size: u32,
    pub proto_ids_off: u32,
    pub field_ids_size: u32,
    pub field_ids_off: u32,
    pub method_ids_size: u32,
    pub method_ids_off: u32,
    pub class_defs_size: u32,
    pub class_defs_off: u32,
    pub data_size: u32,
    pub data_off: u32,
}

impl Header {
    pub fn read(bytes: &[u8], ix: &mut usize) -> Result<Header> {
        if bytes.len() < HEADER_SIZE as usize {
            return Err(DexError::malformed(0, "file too short for a DEX header"));
        }
        let mut magic = [0u8; 8];
        magic.copy_from_slice(&read_x(bytes, ix, 8)?);
        if magic[..4] != DEX_MAGIC_035[..4] || magic[7] != 0 {
            return Err(DexError::malformed(0, "bad DEX magic"));
        }
        let checksum = read_u4(bytes, ix)?;
        let mut signature = [0u8; 20];
        signature.copy_from_slice(&read_x(bytes, ix, 20)?);
        let header = Header {
            magic,
            checksum,
            signature,
            file_size: read_u4(bytes, ix)?,
            header_size: read_u4(bytes, ix)?,
            endian_tag: read_u4(bytes, ix)?,
            link_size: read_u4(bytes, ix)?,
            link_off: read_u4(bytes, ix)?,
            map_off: read_u4(bytes, ix)?,
            string_ids_size: read_u4(bytes, ix)?,
            string_ids_off: read_u4(bytes, ix)?,
            type_ids_size: read_u4(bytes, ix)?,
            type_ids_off: read_u4(bytes, ix)?,
            proto_ids_size: read_u4(bytes, ix)?,
            proto_ids_off: read_u4(bytes, ix)?,
            field_ids_size: read_u4(bytes, ix)?,
            field_ids_off: read_u4(bytes, ix)?,
            method_ids_size: read_u4(bytes, ix)?,
            method_ids_off: read_u4(bytes, ix)?,
            class_defs_size: read_u4(bytes, ix)?,
            class_defs_off: read_u4(bytes, ix)?,
            data_size: read_u4(bytes, ix)?,
            data_off: read_u4(bytes, ix)?,
        };
        if header.endian_tag == REVERSE_ENDIAN_CONSTANT {
            return Err(DexError::malformed(0x28, "big-endian DEX files are not supported"));
        }
        if header.endian_tag != ENDIAN_CONSTANT {
            return Err(DexError::malformed(0x28, format!("bad endian tag 0x{:08x}", header.endian_tag)));
        }
        Ok(header)
    }

    pub fn write(&self, bytes: &mut Vec<u8>) -> usize {
        let mut c = 0;
        c += write_x(bytes, &self.magic);
        c += write_u4(bytes, self.checksum);
        c += write_x(bytes, &self.signature);
        for v in [
            self.file_size,
            self.header_size,
            self.endian_tag,
            self.link_size,
            self.link_off,
            self.map_off,
            self.string_ids_size,
            self.string_ids_off,
            self.type_ids_size,
            self.type_ids_off,
            self.proto_ids_size,
            self.proto_ids_off,
            self.field_ids_size,
            self.field_ids_off,
            self.method_ids_size,
            self.method_ids_off,
            self.class_defs_size,
            self.class_defs_off,
            self.data_size,
            self.data_off,
        ] {
            c += write_u4(bytes, v);
        }
        c
    }

    /// "035", "038", ...
    pub fn version(&self) -> String {
        String::from_utf8_lossy(&self.magic[4..7]).into_owned()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapItem {
    pub ty: u16,
    pub size: u32,
    pub offset: u32,
}

impl MapItem {
    pub fn read(bytes: &[u8], ix: &mut usize) -> Result<MapItem> {
        let ty = read_u2(bytes, ix)?;
        read_u2(bytes, ix)?;
        Ok(MapItem { ty, size: read_u4(bytes, ix)?, offset: read_u4(bytes, ix)? })
    }

    pub fn write(&self, bytes: &mut Vec<u8>) -> usize {
        write_u2(bytes, self.ty) + write_u2(bytes, 0) + write_u4(bytes, self.size) + write_u4(bytes, self.offset)
    }
}

pub fn read_map_list(bytes: &[u8], off: u32) -> Result<Vec<MapItem>> {
    let mut ix = off as usize;
    let size = read_u4(bytes, &mut ix)?;
    if size as usize > bytes.len() / 12 {
        return Err(DexError::malformed(off as usize, format!("implausible map list size {}", size)));
    }
    (0..size).map(|_| MapItem::read(bytes, &mut ix)).collect()
}

pub fn write_map_list(bytes: &mut Vec<u8>, items: &[MapItem]) -> usize {
    let mut c = write_u4(bytes, items.len() as u32);
    for item in items {
        c += item.write(bytes);
    }
    c
}

/// type_list: u4 size, then u2 type indices
pub fn read_type_list(bytes: &[u8], off: u32) -> Result<Vec<u32>> {
    if off == 0 {
        return Ok(Vec::new());
    }
    let mut ix = off as usize;
    let size = read_u4(bytes, &mut ix)?;
    (0..size).map(|_| read_u2(bytes, &mut ix).map(u32::from)).collect()
}

pub fn write_type_list(bytes: &mut Vec<u8>, types: &[u32]) -> usize {
    let mut c = write_u4(bytes, types.len() as u32);
    for t in types {
        c += write_u2(bytes, *t as u16);
    }
    c
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtoIdItem {
    pub shorty_idx: u32,
    pub return_type_idx: u32,
    pub parameters_off: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldIdItem {
    pub class_idx: u16,
    pub type_idx: u16,
    pub name_idx: u32,
}

impl FieldIdItem {
    pub fn read(bytes: &[u8], ix: &mut usize) -> Result<FieldIdItem> {
        Ok(FieldIdItem { class_idx: read_u2(bytes, ix)?, type_idx: read_u2(bytes, ix)?, name_idx: read_u4(bytes, ix)? })
    }

    pub fn write(&self, bytes: &mut Vec<u8>) -> usize {
        write_u2(bytes, self.class_idx) + write_u2(bytes, self.type_idx) + write_u4(bytes, self.name_idx)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodIdItem {
    pub class_idx: u16,
    pub proto_idx: u16,
    pub name_idx: u32,
}

impl MethodIdItem {
    pub fn read(bytes: &[u8], ix: &mut usize) -> Result<MethodIdItem> {
        Ok(MethodIdItem { class_idx: read_u2(bytes, ix)?, proto_idx: read_u2(bytes, ix)?, name_idx: read_u4(bytes, ix)? })
    }

    pub fn write(&self, bytes: &mut Vec<u8>) -> usize {
        write_u2(bytes, self.class_idx) + write_u2(bytes, self.proto_idx) + write_u4(bytes, self.name_idx)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodHandleItem {
    pub kind: u16,
    pub target_idx: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassDefItem {
    pub class_idx: u32,
    pub access_flags: u32,
    pub superclass_idx: u32,
    pub interfaces_off: u32,
    pub source_file_idx: u32,
    pub annotations_off: u32,
    pub class_data_off: u32,
    pub static_values_off: u32,
}

impl ClassDefItem {
    pub fn read(bytes: &[u8], ix: &mut usize) -> Result<ClassDefItem> {
        Ok(ClassDefItem {
            class_idx: read_u4(bytes, ix)?,
            access_flags: read_u4(bytes, ix)?,
            superclass_idx: read_u4(bytes, ix)?,
            interfaces_off: read_u4(bytes, ix)?,
            source_file_idx: read_u4(bytes, ix)?,
            annotations_off: read_u4(bytes, ix)?,
            class_data_off: read_u4(bytes, ix)?,
            static_values_off: read_u4(bytes, ix)?,
        })
    }

    pub fn write(&self, bytes: &mut Vec<u8>) -> usize {
        let mut c = 0;
        for v in [
            self.class_idx,
            self.access_flags,
            self.superclass_idx,
            self.interfaces_off,
            self.source_file_idx,
            self.annotations_off,
            self.class_data_off,
            self.static_values_off,
        ] {
            c += write_u4(bytes, v);
        }
        c
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodedField {
    pub field_idx: u32,
    pub access_flags: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodedMethod {
    pub method_idx: u32,
    pub access_flags: u32,
    pub code_off: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ClassDataItem {
    pub static_fields: Vec<EncodedField>,
    pub instance_fields: Vec<EncodedField>,
    pub direct_methods: Vec<EncodedMethod>,
    pub virtual_methods: Vec<EncodedMethod>,
}

impl ClassDataItem {
    pub fn read(bytes: &[u8], ix: &mut usize) -> Result<ClassDataItem> {
        let static_fields_size = read_uleb128(bytes, ix)?;
        let instance_fields_size = read_uleb128(bytes, ix)?;
        let direct_methods_size = read_uleb128(bytes, ix)?;
        let virtual_methods_size = read_uleb128(bytes, ix)?;

        let mut read_fields = |n: u32, ix: &mut usize| -> Result<Vec<EncodedField>> {
            let mut idx = 0u32;
            let mut out = Vec::with_capacity((n as usize).min(4096));
            for _ in 0..n {
                idx = idx.wrapping_add(read_uleb128(bytes, ix)?);
                out.push(EncodedField { field_idx: idx, access_flags: read_uleb128(bytes, ix)? });
            }
            Ok(out)
        };
        let static_fields = read_fields(static_fields_size, ix)?;
        let instance_fields = read_fields(instance_fields_size, ix)?;

        let read_methods = |n: u32, ix: &mut usize| -> Result<Vec<EncodedMethod>> {
            let mut idx = 0u32;
            let mut out = Vec::with_capacity((n as usize).min(4096));
            for _ in 0..n {
                idx = idx.wrapping_add(read_uleb128(bytes, ix)?);
                let access_flags = read_uleb128(bytes, ix)?;
                let code_off = read_uleb128(bytes, ix)?;
                out.push(EncodedMethod { method_idx: idx, access_flags, code_off });
            }
            Ok(out)
        };
        let direct_methods = read_methods(direct_methods_size, ix)?;
        let virtual_methods = read_methods(virtual_methods_size, ix)?;

        Ok(ClassDataItem { static_fields, instance_fields, direct_methods, virtual_methods })
    }

    /// Members must already be sorted by index.
    pub fn write(&self, bytes: &mut Vec<u8>) -> usize {
        let mut c = 0;
        c += write_uleb128(bytes, self.static_fields.len() as u32);
        c += write_uleb128(bytes, self.instance_fields.len() as u32);
        c += write_uleb128(bytes, self.direct_methods.len() as u32);
        c += write_uleb128(bytes, self.virtual_methods.len() as u32);
        for list in [&self.static_fields, &self.instance_fields] {
            let mut last = 0;
            for f in list.iter() {
                c += write_uleb128(bytes, f.field_idx - last);
                c += write_uleb128(bytes, f.access_flags);
                last = f.field_idx;
            }
        }
        for list in [&self.direct_methods, &self.virtual_methods] {
            let mut last = 0;
            for m in list.iter() {
                c += write_uleb128(bytes, m.method_idx - last);
                c += write_uleb128(bytes, m.access_flags);
                c += write_uleb128(bytes, m.code_off);
                last = m.method_idx;
            }
        }
        c
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodedTypeAddrPair {
    pub type_idx: u32,
    pub addr: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TryItem {
    pub start_addr: u32,
    pub insn_count: u16,
    /// Byte offset of the handler from the start of the `encoded_catch_handler_list`.
    pub handler_off: u16,
}

impl TryItem {
    pub fn read(bytes: &[u8], ix: &mut usize) -> Result<TryItem> {
        Ok(TryItem { start_addr: read_u4(bytes, ix)?, insn_count: read_u2(bytes, ix)?, handler_off: read_u2(bytes, ix)? })
    }

    pub fn write(&self, bytes: &mut Vec<u8>) -> usize {
        write_u4(bytes, self.start_addr) + write_u2(bytes, self.insn_count) + write_u2(bytes, self.handler_off)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EncodedCatchHandler {
    pub handlers: Vec<(u32, u32)>,
    pub catch_all_addr: Option<u32>,
}

impl EncodedCatchHandler {
    pub fn read(bytes: &[u8], ix: &mut usize) -> Result<EncodedCatchHandler> {
        let size = read_sleb128(bytes, ix)?;
        let count = size.unsigned_abs() as usize;
        let mut handlers = Vec::with_capacity(count.min(256));
        for _ in 0..count {
            let type_idx = read_uleb128(bytes, ix)?;
            let addr = read_uleb128(bytes, ix)?;
            handlers.push((type_idx, addr));
        }
        let catch_all_addr = if size <= 0 { Some(read_uleb128(bytes, ix)?) } else { None };
        Ok(EncodedCatchHandler { handlers, catch_all_addr })
    }

    pub fn write(&self, bytes: &mut Vec<u8>) -> usize {
        let n = self.handlers.len() as i32;
        let mut c = write_sleb128(bytes, if self.catch_all_addr.is_some() { -n } else { n });
        for (type_idx, addr) in &self.handlers {
            c += write_uleb128(bytes, *type_idx);
            c += write_uleb128(bytes, *addr);
        }
        if let Some(addr) = self.catch_all_addr {
            c += write_uleb128(bytes, addr);
        }
        c
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CodeItem {
    pub registers_size: u16,
    pub ins_size: u16,
    pub outs_size: u16,
    pub debug_info_off: u32,
    pub insns: Vec<u16>,
    pub tries: Vec<TryItem>,
    /// Handlers keyed by their byte offset within the handler list.
    pub handlers: Vec<(u16, EncodedCatchHandler)>,
}

impl CodeItem {
    pub fn read(bytes: &[u8], ix: &mut usize) -> Result<CodeItem> {
        let start = *ix;
        let registers_size = read_u2(bytes, ix)?;
        let ins_size = read_u2(bytes, ix)?;
        let outs_size = read_u2(bytes, ix)?;
        let tries_size = read_u2(bytes, ix)?;
        let debug_info_off = read_u4(bytes, ix)?;
        let insns_size = read_u4(bytes, ix)? as usize;
        if insns_size > (bytes.len().saturating_sub(*ix)) / 2 {
            return Err(DexError::malformed(start, format!("code item claims {} code units", insns_size)));
        }
        let mut insns = Vec::with_capacity(insns_size);
        for _ in 0..insns_size {
            insns.push(read_u2(bytes, ix)?);
        }
        let mut tries = Vec::new();
        let mut handlers = Vec::new();
        if tries_size > 0 {
            if insns_size & 1 != 0 {
                let padding = read_u2(bytes, ix)?;
                if padding != 0 {
                    warn!("[loader] non-zero code item padding 0x{:04x} at 0x{:x}", padding, *ix - 2);
                }
            }
            for _ in 0..tries_size {
                tries.push(TryItem::read(bytes, ix)?);
            }
            let base = *ix;
            let list_size = read_uleb128(bytes, ix)?;
            if list_size as usize > bytes.len() - base {
                return Err(DexError::malformed(base, "implausible catch handler list size"));
            }
            for i in 0..list_size {
                let entry_off = *ix;
                let h = EncodedCatchHandler::read(bytes, ix).map_err(|e| {
                    e.context(format!("catch handler #{} at 0x{:x} of code item at 0x{:x}", i, entry_off, start))
                })?;
                handlers.push(((entry_off - base) as u16, h));
            }
            for t in &tries {
                if !handlers.iter().any(|(off, _)| *off == t.handler_off) {
                    return Err(DexError::malformed(
                        start,
                        format!("try item handler offset {} matches no handler", t.handler_off),
                    ));
                }
            }
        }
        Ok(CodeItem { registers_size, ins_size, outs_size, debug_info_off, insns, tries, handlers })
    }

    /// Writes the item; `handlers` offsets are recomputed and `tries` patched to match.
    pub fn write(&self, bytes: &mut Vec<u8>) -> usize {
        let mut c = 0;
        c += write_u2(bytes, self.registers_size);
        c += write_u2(bytes, self.ins_size);
        c += write_u2(bytes, self.outs_size);
        c += write_u2(bytes, self.tries.len() as u16);
        c += write_u4(bytes, self.debug_info_off);
        c += write_u4(bytes, self.insns.len() as u32);
        for u in &self.insns {
            c += write_u2(bytes, *u);
        }
        if self.tries.is_empty() {
            return c;
        }
        if self.insns.len() & 1 != 0 {
            c += write_u2(bytes, 0);
        }
        let mut list = Vec::new();
        write_uleb128(&mut list, self.handlers.len() as u32);
        let mut remap = Vec::with_capacity(self.handlers.len());
        for (old, h) in &self.handlers {
            remap.push((*old, list.len() as u16));
            h.write(&mut list);
        }
        for t in &self.tries {
            let handler_off = remap.iter().find(|(old, _)| *old == t.handler_off).map_or(0, |(_, new)| *new);
            c += TryItem { handler_off, ..*t }.write(bytes);
        }
        c += write_x(bytes, &list);
        c
    }
}

/// A parsed DEX file: the header plus all id tables. Data items are read on demand from
/// `bytes`.
#[derive(Debug, Clone)]
pub struct DexFile {
    pub location: String,
    pub header: Header,
    pub bytes: Arc<[u8]>,
    pub string_data_offs: Vec<u32>,
    pub type_ids: Vec<u32>,
    pub proto_ids: Vec<ProtoIdItem>,
    pub field_ids: Vec<FieldIdItem>,
    pub method_ids: Vec<MethodIdItem>,
    pub class_defs: Vec<ClassDefItem>,
    pub method_handles: Vec<MethodHandleItem>,
    pub call_site_offs: Vec<u32>,
    pub map: Vec<MapItem>,
}

impl DexFile {
    pub fn from_bytes(location: &str, bytes: Arc<[u8]>) -> Result<DexFile> {
        let data: &[u8] = &bytes;
        let mut ix = 0;
        let header = Header::read(data, &mut ix)?;
        if header.file_size as usize != data.len() {
            warn!("[loader] {}: header file_size {} but {} bytes present", location, header.file_size, data.len());
        }
        let expected = adler::adler32_slice(&data[12..]);
        if expected != header.checksum {
            warn!("[loader] {}: checksum mismatch (header 0x{:08x}, computed 0x{:08x})", location, header.checksum, expected);
        }

        let table = |off: u32, size: u32, elem: usize, what: &str| -> Result<usize> {
            let end = off as usize + size as usize * elem;
            if size > 0 && end > data.len() {
                return Err(DexError::malformed(off as usize, format!("{} table extends past end of file", what)));
            }
            Ok(off as usize)
        };

        let mut ix = table(header.string_ids_off, header.string_ids_size, 4, "string_ids")?;
        let string_data_offs = (0..header.string_ids_size).map(|_| read_u4(data, &mut ix)).collect::<Result<Vec<_>>>()?;

        let mut ix = table(header.type_ids_off, header.type_ids_size, 4, "type_ids")?;
        let mut type_ids = Vec::with_capacity(header.type_ids_size as usize);
        for _ in 0..header.type_ids_size {
            let s = read_u4(data, &mut ix)?;
            check_index("string", s, string_data_offs.len())?;
            type_ids.push(s);
        }

        let mut ix = table(header.proto_ids_off, header.proto_ids_size, 12, "proto_ids")?;
        let mut proto_ids = Vec::with_capacity(header.proto_ids_size as usize);
        for _ in 0..header.proto_ids_size {
            proto_ids.push(ProtoIdItem {
                shorty_idx: read_u4(data, &mut ix)?,
                return_type_idx: read_u4(data, &mut ix)?,
                parameters_off: read_u4(data, &mut ix)?,
            });
        }

        let mut ix = table(header.field_ids_off, header.field_ids_size, 8, "field_ids")?;
        let field_ids = (0..header.field_ids_size).map(|_| FieldIdItem::read(data, &mut ix)).collect::<Result<Vec<_>>>()?;

        let mut ix = table(header.method_ids_off, header.method_ids_size, 8, "method_ids")?;
        let method_ids =
            (0..header.method_ids_size).map(|_| MethodIdItem::read(data, &mut ix)).collect::<Result<Vec<_>>>()?;

        let mut ix = table(header.class_defs_off, header.class_defs_size, 32, "class_defs")?;
        let class_defs =
            (0..header.class_defs_size).map(|_| ClassDefItem::read(data, &mut ix)).collect::<Result<Vec<_>>>()?;

        let map = if header.map_off != 0 { read_map_list(data, header.map_off)? } else { Vec::new() };
        let mut method_handles = Vec::new();
        let mut call_site_offs = Vec::new();
        for item in &map {
            match item.ty {
                TYPE_METHOD_HANDLE_ITEM => {
                    let mut ix = table(item.offset, item.size, 8, "method_handles")?;
                    for _ in 0..item.size {
                        let kind = read_u2(data, &mut ix)?;
                        read_u2(data, &mut ix)?;
                        let target_idx = read_u2(data, &mut ix)?;
                        read_u2(data, &mut ix)?;
                        method_handles.push(MethodHandleItem { kind, target_idx });
                    }
                }
                TYPE_CALL_SITE_ID_ITEM => {
                    let mut ix = table(item.offset, item.size, 4, "call_site_ids")?;
                    for _ in 0..item.size {
                        call_site_offs.push(read_u4(data, &mut ix)?);
                    }
                }
                _ => {}
            }
        }

        Ok(DexFile {
            location: location.to_string(),
            header,
            bytes,
            string_data_offs,
            type_ids,
            proto_ids,
            field_ids,
            method_ids,
            class_defs,
            method_handles,
            call_site_offs,
            map,
        })
    }

    pub fn from_file(path: &Path) -> Result<DexFile> {
        let bytes = std::fs::read(path).map_err(|e| DexError::new(format!("cannot read {}: {}", path.display(), e)))?;
        DexFile::from_bytes(&path.display().to_string(), Arc::from(bytes))
    }

    pub fn string_data_off(&self, idx: u32) -> Result<u32> {
        Ok(self.string_data_offs[check_index("string", idx, self.string_data_offs.len())?])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let header = Header {
            magic: DEX_MAGIC_035,
            checksum: 1,
            signature: [7; 20],
            file_size: 0x70,
            header_size: HEADER_SIZE,
            endian_tag: ENDIAN_CONSTANT,
            link_size: 0,
            link_off: 0,
            map_off: 0,
            string_ids_size: 0,
            string_ids_off: 0,
            type_ids_size: 0,
            type_ids_off: 0,
            proto_ids_size: 0,
            proto_ids_off: 0,
            field_ids_size: 0,
            field_ids_off: 0,
            method_ids_size: 0,
            method_ids_off: 0,
            class_defs_size: 0,
            class_defs_off: 0,
            data_size: 0,
            data_off: 0,
        };
        let mut buf = vec![];
        assert_eq!(header.write(&mut buf), HEADER_SIZE as usize);
        let mut ix = 0;
        assert_eq!(Header::read(&buf, &mut ix).unwrap(), header);
        assert_eq!(header.version(), "035");

        buf[0] = b'x';
        let mut ix = 0;
        assert_eq!(Header::read(&buf, &mut ix).unwrap_err().kind(), crate::error::ErrorKind::MalformedDex);
    }

    #[test]
    fn test_catch_all_handler_encoding() {
        let h = EncodedCatchHandler { handlers: vec![(42, 0xabcd)], catch_all_addr: Some(0x1234) };
        let mut bytes = vec![];
        h.write(&mut bytes);
        assert_eq!(crate::dex::read_sleb128(&bytes, &mut 0).unwrap(), -1);
        let mut ix = 0;
        assert_eq!(EncodedCatchHandler::read(&bytes, &mut ix).unwrap(), h);

        // size 0 means a lone catch-all
        let only_all = EncodedCatchHandler { handlers: vec![], catch_all_addr: Some(3) };
        let mut bytes = vec![];
        only_all.write(&mut bytes);
        let mut ix = 0;
        assert_eq!(EncodedCatchHandler::read(&bytes, &mut ix).unwrap(), only_all);
    }

    #[test]
    fn test_code_item_with_tries() {
        let code = CodeItem {
            registers_size: 2,
            ins_size: 1,
            outs_size: 0,
            debug_info_off: 0,
            insns: vec![0x0012, 0x000e, 0x000e],
            tries: vec![TryItem { start_addr: 0, insn_count: 1, handler_off: 1 }],
            handlers: vec![(1, EncodedCatchHandler { handlers: vec![], catch_all_addr: Some(2) })],
        };
        let mut buf = vec![];
        code.write(&mut buf);
        // 16 header bytes and 3 code units, a pad unit before the 8-byte try item, then
        // the handler list: its size, one catch-all-only handler and the catch-all address
        assert_eq!(&buf[22..24], &[0, 0]);
        assert_eq!(u32::from_le_bytes([buf[24], buf[25], buf[26], buf[27]]), 0);
        assert_eq!(&buf[32..], &[0x01, 0x00, 0x02]);
        assert_eq!(buf.len(), 35);
        let mut ix = 0;
        assert_eq!(CodeItem::read(&buf, &mut ix).unwrap(), code);
    }

    #[test]
    fn test_class_data_delta_encoding() {
        let cd = ClassDataItem {
            static_fields: vec![EncodedField { field_idx: 3, access_flags: 8 }, EncodedField { field_idx: 9, access_flags: 8 }],
            instance_fields: vec![],
            direct_methods: vec![EncodedMethod { method_idx: 1, access_flags: 0x10001, code_off: 0x200 }],
            virtual_methods: vec![EncodedMethod { method_idx: 0, access_flags: 1, code_off: 0 }],
        };
        let mut buf = vec![];
        cd.write(&mut buf);
        let mut ix = 0;
        assert_eq!(ClassDataItem::read(&buf, &mut ix).unwrap(), cd);
    }
}
