//! Text form of method bodies.
//!
//! A body is one s-expression list of items:
//!
//! ```text
//! ((load-param v0)
//!  (const v1 0)
//!  (if-eqz v1 :L1)
//!  (invoke-static (v0) "LFoo;.bar:(I)V")
//!  (:L1)
//!  (return-void))
//! ```
//!
//! Labels are `:name` or `(:name)`; a switch lists its case labels, `(switch v0 (:a :b))`, and
//! each case label carries its key, `(:a 1)`. Try regions are `(.try_start c0)` ...
//! `(.try_end c0)` with handlers `(.catch (c0 c1) "LFoo;")`, where `c1` names the next handler
//! of the chain and a missing type catches everything. Printing renumbers labels and catches,
//! so equivalent bodies print identically.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::Write as _;
use std::sync::Arc;

use nom::branch::alt;
use nom::bytes::complete::{is_not, tag, take_while1};
use nom::character::complete::{char, hex_digit1, multispace1, not_line_ending};
use nom::combinator::{all_consuming, map, map_opt, value};
use nom::multi::many0;
use nom::sequence::{delimited, pair, preceded};
use nom::IResult;

use crate::error::{DexError, Result};
use crate::ir::code::{
    BranchTarget, BranchTargetKind, CatchEntry, DexDebugInstruction, DexPosition, IRCode, ItemId, MethodItemEntry,
};
use crate::ir::instruction::{ArrayData, IRInstruction, Operand, Reg};
use crate::ir::interner::{
    CallSiteData, CallSiteId, Interner, MethodHandleId, MethodHandleKind, MethodHandleTarget,
};
use crate::ir::opcode::{IROpcode, OperandKind};
use crate::dex::encoded_values::EncodedValue;

#[derive(Debug, Clone, PartialEq)]
enum SExpr {
    Atom(String),
    Str(String),
    List(Vec<SExpr>),
}

impl SExpr {
    fn atom(&self) -> Option<&str> {
        match self {
            SExpr::Atom(a) => Some(a),
            _ => None,
        }
    }

    fn string(&self) -> Option<&str> {
        match self {
            SExpr::Str(s) => Some(s),
            _ => None,
        }
    }
}

fn skip(i: &str) -> IResult<&str, ()> {
    value((), many0(alt((value((), multispace1), value((), pair(char(';'), not_line_ending))))))(i)
}

fn ws<'a, O, F>(inner: F) -> impl FnMut(&'a str) -> IResult<&'a str, O>
where
    F: FnMut(&'a str) -> IResult<&'a str, O>,
{
    delimited(skip, inner, skip)
}

fn parse_atom(i: &str) -> IResult<&str, SExpr> {
    map(take_while1(|c: char| !c.is_whitespace() && !"()\";".contains(c)), |s: &str| {
        SExpr::Atom(s.to_string())
    })(i)
}

fn parse_escape(i: &str) -> IResult<&str, char> {
    alt((
        value('\\', char('\\')),
        value('"', char('"')),
        value('\'', char('\'')),
        value('\n', char('n')),
        value('\t', char('t')),
        value('\r', char('r')),
        value('\0', char('0')),
        map_opt(delimited(tag("u{"), hex_digit1, char('}')), |h: &str| {
            u32::from_str_radix(h, 16).ok().and_then(char::from_u32)
        }),
    ))(i)
}

fn parse_string(i: &str) -> IResult<&str, SExpr> {
    let (i, _) = char('"')(i)?;
    let mut out = String::new();
    let mut rest = i;
    loop {
        if let Ok((r, _)) = char::<&str, nom::error::Error<&str>>('"')(rest) {
            return Ok((r, SExpr::Str(out)));
        }
        if let Ok((r, c)) = preceded(char('\\'), parse_escape)(rest) {
            out.push(c);
            rest = r;
            continue;
        }
        let (r, chunk) = is_not("\\\"")(rest)?;
        out.push_str(chunk);
        rest = r;
    }
}

fn parse_list(i: &str) -> IResult<&str, SExpr> {
    map(delimited(char('('), many0(ws(parse_sexpr)), char(')')), SExpr::List)(i)
}

fn parse_sexpr(i: &str) -> IResult<&str, SExpr> {
    alt((parse_list, parse_string, parse_atom))(i)
}

fn parse_document(i: &str) -> IResult<&str, SExpr> {
    all_consuming(ws(parse_sexpr))(i)
}

fn syntax(msg: impl Into<String>) -> DexError {
    DexError::new(format!("assembler: {}", msg.into()))
}

fn parse_reg(s: &str) -> Option<Reg> {
    s.strip_prefix('v')?.parse().ok()
}

/// Decimal or `0x` hex, optionally negative. Hex spans the full 64 bits.
pub fn parse_literal(s: &str) -> Option<i64> {
    let (neg, body) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    let v = match body.strip_prefix("0x").or_else(|| body.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok()? as i64,
        None => body.parse::<u64>().ok().map(|v| v as i64)?,
    };
    Some(if neg { v.wrapping_neg() } else { v })
}

fn handle_kind_name(kind: MethodHandleKind) -> &'static str {
    match kind {
        MethodHandleKind::StaticPut => "static-put",
        MethodHandleKind::StaticGet => "static-get",
        MethodHandleKind::InstancePut => "instance-put",
        MethodHandleKind::InstanceGet => "instance-get",
        MethodHandleKind::InvokeStatic => "invoke-static",
        MethodHandleKind::InvokeInstance => "invoke-instance",
        MethodHandleKind::InvokeConstructor => "invoke-constructor",
        MethodHandleKind::InvokeDirect => "invoke-direct",
        MethodHandleKind::InvokeInterface => "invoke-interface",
    }
}

fn handle_kind_from_name(name: &str) -> Option<MethodHandleKind> {
    (0..=8u16).filter_map(MethodHandleKind::from_u16).find(|k| handle_kind_name(*k) == name)
}

fn quote(s: &str) -> String {
    format!("{:?}", s)
}

pub fn show_method_handle(g: &Interner, h: MethodHandleId) -> String {
    let d = g.method_handle(h);
    let target = match d.target {
        MethodHandleTarget::Method(m) => g.show_method(m),
        MethodHandleTarget::Field(f) => g.show_field(f),
    };
    format!("({} {})", handle_kind_name(d.kind), quote(&target))
}

fn show_value(g: &Interner, v: &EncodedValue) -> String {
    match v {
        EncodedValue::String(s) => quote(&g.string(*s)),
        EncodedValue::Int(i) => i.to_string(),
        EncodedValue::Type(t) => format!("(type {})", quote(&g.descriptor(*t))),
        EncodedValue::MethodType(p) => format!("(proto {})", quote(&g.show_proto(*p))),
        EncodedValue::MethodHandle(h) => show_method_handle(g, *h),
        other => format!("(value {})", quote(&format!("{:?}", other))),
    }
}

pub fn show_call_site(g: &Interner, cs: CallSiteId) -> String {
    let d = g.call_site(cs);
    let mut out = format!(
        "(call-site {} {} {}",
        show_method_handle(g, d.bootstrap),
        quote(&g.string(d.name)),
        quote(&g.show_proto(d.proto))
    );
    for a in &d.args {
        out.push(' ');
        out.push_str(&show_value(g, a));
    }
    out.push(')');
    out
}

fn build_method_handle(g: &Interner, items: &[SExpr]) -> Result<MethodHandleId> {
    let kind = items
        .first()
        .and_then(|k| k.atom())
        .and_then(handle_kind_from_name)
        .ok_or_else(|| syntax("unknown method handle kind"))?;
    let target = items.get(1).and_then(|t| t.string()).ok_or_else(|| syntax("method handle needs a target"))?;
    let target = if kind.is_invoke() {
        MethodHandleTarget::Method(g.make_method_from_str(target)?)
    } else {
        MethodHandleTarget::Field(g.make_field_from_str(target)?)
    };
    Ok(g.make_method_handle(kind, target))
}

fn build_value(g: &Interner, e: &SExpr) -> Result<EncodedValue> {
    match e {
        SExpr::Str(s) => Ok(EncodedValue::String(g.make_string(s))),
        SExpr::Atom(a) => parse_literal(a)
            .and_then(|v| i32::try_from(v).ok())
            .map(EncodedValue::Int)
            .ok_or_else(|| syntax(format!("bad call site argument {}", a))),
        SExpr::List(items) => match (items.first().and_then(|h| h.atom()), items.get(1).and_then(|s| s.string())) {
            (Some("type"), Some(t)) => Ok(EncodedValue::Type(g.make_type(t))),
            (Some("proto"), Some(p)) => Ok(EncodedValue::MethodType(g.make_proto_from_descriptor(p)?)),
            _ => Ok(EncodedValue::MethodHandle(build_method_handle(g, items)?)),
        },
    }
}

fn build_call_site(g: &Interner, items: &[SExpr]) -> Result<CallSiteId> {
    let bootstrap = match items.get(1) {
        Some(SExpr::List(h)) => build_method_handle(g, h)?,
        _ => return Err(syntax("call site needs a bootstrap method handle")),
    };
    let name = items.get(2).and_then(|s| s.string()).ok_or_else(|| syntax("call site needs a name"))?;
    let proto = items.get(3).and_then(|s| s.string()).ok_or_else(|| syntax("call site needs a prototype"))?;
    let args = items[4.min(items.len())..].iter().map(|a| build_value(g, a)).collect::<Result<Vec<_>>>()?;
    Ok(g.make_call_site(CallSiteData {
        bootstrap,
        name: g.make_string(name),
        proto: g.make_proto_from_descriptor(proto)?,
        args,
    }))
}

fn build_data(items: &[SExpr]) -> Result<ArrayData> {
    let nums = items[1..]
        .iter()
        .map(|e| e.atom().and_then(parse_literal).ok_or_else(|| syntax("array data holds numbers only")))
        .collect::<Result<Vec<i64>>>()?;
    if nums.len() < 2 {
        return Err(syntax("array data needs width and count"));
    }
    let element_width = nums[0] as u16;
    let element_count = nums[1] as u32;
    let data: Vec<u8> = nums[2..].iter().map(|b| *b as u8).collect();
    if data.len() != element_width as usize * element_count as usize {
        return Err(syntax(format!(
            "array data has {} bytes, expected {} x {}",
            data.len(),
            element_count,
            element_width
        )));
    }
    Ok(ArrayData { element_width, element_count, data })
}

/// An instruction and the labels its branch refers to.
struct ParsedInsn {
    insn: IRInstruction,
    labels: Vec<String>,
}

fn build_insn(g: &Interner, op: IROpcode, args: &[SExpr]) -> Result<ParsedInsn> {
    let mut regs = Vec::new();
    let mut literal = None;
    let mut strings = Vec::new();
    let mut labels = Vec::new();
    let mut handle = None;
    let mut call_site = None;
    let mut data = None;
    for a in args {
        match a {
            SExpr::Atom(s) if s.starts_with(':') => labels.push(s[1..].to_string()),
            SExpr::Atom(s) => match parse_reg(s) {
                Some(r) => regs.push(r),
                None => literal = Some(parse_literal(s).ok_or_else(|| syntax(format!("bad operand {} of {}", s, op)))?),
            },
            SExpr::Str(s) => strings.push(s.as_str()),
            SExpr::List(items) => match items.first().and_then(|h| h.atom()) {
                None => {}
                Some(h) if h.starts_with(':') => {
                    for l in items {
                        let l = l.atom().and_then(|l| l.strip_prefix(':')).ok_or_else(|| syntax("bad case list"))?;
                        labels.push(l.to_string());
                    }
                }
                Some("data") => data = Some(build_data(items)?),
                Some("call-site") => call_site = Some(build_call_site(g, items)?),
                Some(h) if parse_reg(h).is_some() => {
                    for r in items {
                        regs.push(r.atom().and_then(parse_reg).ok_or_else(|| syntax("bad register list"))?);
                    }
                }
                Some(_) => handle = Some(build_method_handle(g, items)?),
            },
        }
    }
    let string_at = |i: usize| strings.get(i).copied().ok_or_else(|| syntax(format!("{} needs a quoted operand", op)));

    let mut insn = IRInstruction::new(op);
    if op.has_dest() {
        if regs.is_empty() {
            return Err(syntax(format!("{} needs a destination", op)));
        }
        insn = insn.with_dest(regs.remove(0));
    }
    if let Some(n) = op.pseudo_result_srcs() {
        if regs.len() != n {
            return Err(syntax(format!(
                "{} takes {} source register(s), got {}; its result is read with move-result-pseudo",
                op,
                n,
                regs.len()
            )));
        }
    }
    insn.set_srcs(regs);
    let operand = match op.operand_kind() {
        OperandKind::None => Operand::None,
        OperandKind::Literal => Operand::Literal(literal.ok_or_else(|| syntax(format!("{} needs a literal", op)))?),
        OperandKind::String => Operand::String(g.make_string(string_at(0)?)),
        OperandKind::Type => Operand::Type(g.make_type(string_at(0)?)),
        OperandKind::Field => Operand::Field(g.make_field_from_str(string_at(0)?)?),
        OperandKind::Method => Operand::Method(g.make_method_from_str(string_at(0)?)?),
        OperandKind::MethodAndProto => Operand::MethodAndProto(
            g.make_method_from_str(string_at(0)?)?,
            g.make_proto_from_descriptor(string_at(1)?)?,
        ),
        OperandKind::Proto => Operand::Proto(g.make_proto_from_descriptor(string_at(0)?)?),
        OperandKind::CallSite => Operand::CallSite(call_site.ok_or_else(|| syntax("invoke-custom needs a call site"))?),
        OperandKind::MethodHandle => {
            Operand::MethodHandle(handle.ok_or_else(|| syntax("const-method-handle needs a handle"))?)
        }
        OperandKind::Data => Operand::Data(Arc::new(data.ok_or_else(|| syntax("fill-array-data needs data"))?)),
    };
    insn.set_operand(operand);
    Ok(ParsedInsn { insn, labels })
}

fn position_from(g: &Interner, items: &[SExpr]) -> Result<DexPosition> {
    let method = match items.get(1).and_then(|m| m.string()) {
        Some("") | None => None,
        Some(m) => Some(g.make_method_from_str(m)?),
    };
    let file = match items.get(2).and_then(|f| f.string()) {
        Some("") | None => None,
        Some(f) => Some(g.make_string(f)),
    };
    let line = items
        .get(3)
        .and_then(|l| l.atom())
        .and_then(parse_literal)
        .ok_or_else(|| syntax(".pos needs a line"))? as u32;
    let mut pos = DexPosition::new(method, file, line);
    if let Some(SExpr::List(parent)) = items.get(4) {
        pos.parent = Some(Arc::new(position_from(g, parent)?));
    }
    Ok(pos)
}

fn debug_from(g: &Interner, items: &[SExpr]) -> Result<DexDebugInstruction> {
    let reg = || items.get(2).and_then(|r| r.atom()).and_then(parse_reg).ok_or_else(|| syntax(".dbg needs a register"));
    let opt_str = |i: usize| match items.get(i).and_then(|s| s.string()) {
        Some("") | None => None,
        Some(s) => Some(s.to_string()),
    };
    Ok(match items.get(1).and_then(|k| k.atom()) {
        Some("start-local") => DexDebugInstruction::StartLocal {
            reg: reg()?,
            name: opt_str(3).map(|s| g.make_string(&s)),
            ty: opt_str(4).map(|s| g.make_type(&s)),
            sig: opt_str(5).map(|s| g.make_string(&s)),
        },
        Some("end-local") => DexDebugInstruction::EndLocal(reg()?),
        Some("restart-local") => DexDebugInstruction::RestartLocal(reg()?),
        Some("prologue-end") => DexDebugInstruction::SetPrologueEnd,
        Some("epilogue-begin") => DexDebugInstruction::SetEpilogueBegin,
        other => return Err(syntax(format!("unknown debug item {:?}", other))),
    })
}

enum Item<'a> {
    Label(String),
    Insn(ParsedInsn, Option<ItemId>),
    Entry(MethodItemEntry),
    TryStart(&'a str),
    TryEnd(&'a str),
    Catch(&'a str, Option<&'a str>, Option<&'a str>),
}

fn label_def(e: &SExpr) -> Option<(String, Option<i32>)> {
    match e {
        SExpr::Atom(a) => a.strip_prefix(':').map(|l| (l.to_string(), None)),
        SExpr::List(items) => {
            let name = items.first()?.atom()?.strip_prefix(':')?;
            let key = items.get(1).and_then(|k| k.atom()).and_then(parse_literal).map(|k| k as i32);
            Some((name.to_string(), key))
        }
        _ => None,
    }
}

/// Parses a body. The register frame is sized to the highest register used.
pub fn parse_code(g: &Interner, text: &str) -> Result<IRCode> {
    let (_, doc) = parse_document(text).map_err(|e| syntax(format!("{}", e)))?;
    let items = match doc {
        SExpr::List(items) => items,
        _ => return Err(syntax("a body is a list of items")),
    };
    let mut code = IRCode::new(0);

    let mut case_keys: HashMap<String, Option<i32>> = HashMap::new();
    let mut parsed = Vec::with_capacity(items.len());
    for e in &items {
        if let Some((name, key)) = label_def(e) {
            if case_keys.insert(name.clone(), key).is_some() {
                return Err(syntax(format!("label :{} defined twice", name)));
            }
            parsed.push(Item::Label(name));
            continue;
        }
        let list = match e {
            SExpr::List(l) if !l.is_empty() => l,
            _ => return Err(syntax(format!("unexpected item {:?}", e))),
        };
        let head = list[0].atom().ok_or_else(|| syntax("item head must be a symbol"))?;
        let item = match head {
            ".try_start" | ".try_end" => {
                let name = list.get(1).and_then(|c| c.atom()).ok_or_else(|| syntax("try marker needs a catch name"))?;
                if head == ".try_start" { Item::TryStart(name) } else { Item::TryEnd(name) }
            }
            ".catch" => {
                let names = match list.get(1) {
                    Some(SExpr::List(n)) => n,
                    _ => return Err(syntax(".catch needs (name [next])")),
                };
                let name = names.first().and_then(|n| n.atom()).ok_or_else(|| syntax(".catch needs a name"))?;
                let next = names.get(1).and_then(|n| n.atom());
                Item::Catch(name, next, list.get(2).and_then(|t| t.string()))
            }
            ".pos" => Item::Entry(MethodItemEntry::Position(Arc::new(position_from(g, list)?))),
            ".dbg" => Item::Entry(MethodItemEntry::Debug(debug_from(g, list)?)),
            ".src_block" => {
                let id = list.get(1).and_then(|i| i.atom()).and_then(parse_literal).unwrap_or(0);
                Item::Entry(MethodItemEntry::SourceBlock(id as u32))
            }
            ".fallthrough" => Item::Entry(MethodItemEntry::Fallthrough),
            name => {
                let op = IROpcode::from_name(name).ok_or_else(|| syntax(format!("unknown opcode {}", name)))?;
                let p = build_insn(g, op, &list[1..])?;
                // branches get their id up front so targets defined earlier can point at them
                let id = op.is_branch().then(|| code.reserve());
                Item::Insn(p, id)
            }
        };
        parsed.push(item);
    }

    // label -> branches referring to it
    let mut referrers: HashMap<String, Vec<(ItemId, BranchTargetKind)>> = HashMap::new();
    for item in &parsed {
        if let Item::Insn(p, Some(id)) = item {
            let is_switch = p.insn.opcode().is_switch();
            for l in &p.labels {
                let key = case_keys.get(l.as_str()).ok_or_else(|| syntax(format!("undefined label :{}", l)))?;
                let kind = match (is_switch, key) {
                    (true, Some(k)) => BranchTargetKind::Case(*k),
                    (true, None) => return Err(syntax(format!("case label :{} has no key", l))),
                    (false, _) => BranchTargetKind::Simple,
                };
                referrers.entry(l.clone()).or_default().push((*id, kind));
            }
        }
    }

    let mut catch_ids: HashMap<String, ItemId> = HashMap::new();
    let mut catch_id = |code: &mut IRCode, name: &str| -> ItemId {
        *catch_ids.entry(name.to_string()).or_insert_with(|| code.reserve())
    };
    let mut defined_catches = HashSet::new();
    let mut used_catches = HashSet::new();
    let mut max_reg = 0u32;
    for item in parsed {
        match item {
            Item::Label(name) => {
                for (src, kind) in referrers.get(&name).into_iter().flatten() {
                    code.push_back(MethodItemEntry::Target(BranchTarget { src: *src, kind: *kind }));
                }
            }
            Item::Insn(p, id) => {
                let insn = p.insn;
                if let Some(d) = insn.dest() {
                    max_reg = max_reg.max(d + if insn.dest_is_wide() { 2 } else { 1 });
                }
                for (i, r) in insn.srcs().iter().enumerate() {
                    max_reg = max_reg.max(r + if insn.src_is_wide(i, g) { 2 } else { 1 });
                }
                match id {
                    Some(id) => code.link_reserved_back(id, MethodItemEntry::Opcode(insn)),
                    None => {
                        code.push_back(MethodItemEntry::Opcode(insn));
                    }
                }
            }
            Item::Entry(e) => {
                code.push_back(e);
            }
            Item::TryStart(c) => {
                let id = catch_id(&mut code, c);
                used_catches.insert(c);
                code.push_back(MethodItemEntry::TryStart(id));
            }
            Item::TryEnd(c) => {
                let id = catch_id(&mut code, c);
                used_catches.insert(c);
                code.push_back(MethodItemEntry::TryEnd(id));
            }
            Item::Catch(name, next, ty) => {
                let id = catch_id(&mut code, name);
                let next = next.map(|n| {
                    used_catches.insert(n);
                    catch_id(&mut code, n)
                });
                if !defined_catches.insert(name) {
                    return Err(syntax(format!("catch {} defined twice", name)));
                }
                let catch_type = ty.map(|t| g.make_type(t));
                code.link_reserved_back(id, MethodItemEntry::Catch(CatchEntry { catch_type, next }));
            }
        }
    }
    if let Some(c) = used_catches.iter().find(|c| !defined_catches.contains(*c)) {
        return Err(syntax(format!("catch {} is referenced but never defined", c)));
    }
    code.set_registers_size(max_reg);
    Ok(code)
}

/// Prints a body in the form `parse_code` reads. A built CFG is printed in its linear order.
pub fn print_code(code: &IRCode, g: &Interner) -> String {
    match code.cfg() {
        Some(cfg) => match cfg.linearize() {
            Ok(linear) => print_linear(&linear, g),
            Err(e) => format!("(;; cannot linearize: {}\n)", e),
        },
        None => print_linear(code, g),
    }
}

fn print_linear(code: &IRCode, g: &Interner) -> String {
    // canonical names, in order of appearance
    let mut label_of_target: HashMap<ItemId, usize> = HashMap::new();
    let mut labels_of_branch: HashMap<ItemId, BTreeMap<(i64, usize), usize>> = HashMap::new();
    let mut run_label = None;
    let mut next_label = 0;
    let mut catch_names: HashMap<ItemId, usize> = HashMap::new();
    for (id, entry) in code.iter() {
        match entry {
            MethodItemEntry::Target(t) => {
                let label = match (t.kind, run_label) {
                    (BranchTargetKind::Simple, Some(l)) => l,
                    (BranchTargetKind::Simple, None) => {
                        next_label += 1;
                        run_label = Some(next_label - 1);
                        next_label - 1
                    }
                    (BranchTargetKind::Case(_), _) => {
                        next_label += 1;
                        next_label - 1
                    }
                };
                label_of_target.insert(id, label);
                let key = match t.kind {
                    BranchTargetKind::Case(k) => k as i64,
                    BranchTargetKind::Simple => i64::MIN,
                };
                labels_of_branch.entry(t.src).or_default().insert((key, label), label);
                continue;
            }
            MethodItemEntry::Catch(_) => {
                let n = catch_names.len();
                catch_names.insert(id, n);
            }
            _ => {}
        }
        run_label = None;
    }

    let catch_name = |id: &ItemId| match catch_names.get(id) {
        Some(n) => format!("c{}", n),
        None => "c?".to_string(),
    };
    let mut out = String::from("(\n");
    let mut printed_run: Option<usize> = None;
    for (id, entry) in code.iter() {
        let line = match entry {
            MethodItemEntry::Target(t) => {
                let label = label_of_target.get(&id).copied().unwrap_or(usize::MAX);
                match t.kind {
                    BranchTargetKind::Simple if printed_run == Some(label) => continue,
                    BranchTargetKind::Simple => {
                        printed_run = Some(label);
                        format!("(:L{})", label)
                    }
                    BranchTargetKind::Case(k) => format!("(:L{} {})", label, k),
                }
            }
            MethodItemEntry::Opcode(insn) if insn.opcode().is_branch() => {
                let targets: Vec<String> = labels_of_branch
                    .get(&id)
                    .map(|m| m.values().map(|l| format!(":L{}", l)).collect())
                    .unwrap_or_default();
                let mut s = format!("({}", insn.opcode().name());
                for r in insn.srcs() {
                    let _ = write!(s, " v{}", r);
                }
                if insn.opcode().is_switch() {
                    let _ = write!(s, " ({})", targets.join(" "));
                } else {
                    let _ = write!(s, " {}", targets.first().map(String::as_str).unwrap_or(":?"));
                }
                s.push(')');
                s
            }
            MethodItemEntry::Opcode(insn) => insn.show(g),
            MethodItemEntry::TryStart(c) => format!("(.try_start {})", catch_name(c)),
            MethodItemEntry::TryEnd(c) => format!("(.try_end {})", catch_name(c)),
            MethodItemEntry::Catch(c) => {
                let mut s = format!("(.catch ({}", catch_name(&id));
                if let Some(n) = &c.next {
                    let _ = write!(s, " {}", catch_name(n));
                }
                s.push(')');
                if let Some(t) = c.catch_type {
                    let _ = write!(s, " {}", quote(&g.descriptor(t)));
                }
                s.push(')');
                s
            }
            MethodItemEntry::Position(p) => show_position(g, p),
            MethodItemEntry::Debug(d) => show_debug(g, d),
            MethodItemEntry::Fallthrough => "(.fallthrough)".to_string(),
            MethodItemEntry::SourceBlock(n) => format!("(.src_block {})", n),
        };
        if !matches!(entry, MethodItemEntry::Target(_)) {
            printed_run = None;
        }
        out.push_str("  ");
        out.push_str(&line);
        out.push('\n');
    }
    out.push(')');
    out
}

fn show_position(g: &Interner, p: &DexPosition) -> String {
    let method = p.method.map(|m| g.show_method(m)).unwrap_or_default();
    let file = p.file.map(|f| g.string(f).to_string()).unwrap_or_default();
    let mut s = format!("(.pos {} {} {}", quote(&method), quote(&file), p.line);
    if let Some(parent) = &p.parent {
        s.push(' ');
        s.push_str(&show_position(g, parent));
    }
    s.push(')');
    s
}

fn show_debug(g: &Interner, d: &DexDebugInstruction) -> String {
    match d {
        DexDebugInstruction::StartLocal { reg, name, ty, sig } => {
            let mut s = format!(
                "(.dbg start-local v{} {} {}",
                reg,
                quote(&name.map(|n| g.string(n).to_string()).unwrap_or_default()),
                quote(&ty.map(|t| g.descriptor(t).to_string()).unwrap_or_default())
            );
            if let Some(sig) = sig {
                let _ = write!(s, " {}", quote(&g.string(*sig)));
            }
            s.push(')');
            s
        }
        DexDebugInstruction::EndLocal(r) => format!("(.dbg end-local v{})", r),
        DexDebugInstruction::RestartLocal(r) => format!("(.dbg restart-local v{})", r),
        DexDebugInstruction::SetPrologueEnd => "(.dbg prologue-end)".to_string(),
        DexDebugInstruction::SetEpilogueBegin => "(.dbg epilogue-begin)".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(g: &Interner, text: &str) -> String {
        let printed = print_code(&parse_code(g, text).unwrap(), g);
        assert_eq!(print_code(&parse_code(g, &printed).unwrap(), g), printed);
        printed
    }

    #[test]
    fn test_parse_basic_body() {
        let g = Interner::new();
        let code = parse_code(
            &g,
            r#"((load-param v0) (const v1 0) (if-eqz v1 :L1) (invoke-static (v0) "LFoo;.bar:(I)V") :L1 (return-void))"#,
        )
        .unwrap();
        let ops: Vec<IROpcode> = code.instructions().map(|(_, i)| i.opcode()).collect();
        assert_eq!(
            ops,
            vec![IROpcode::LoadParam, IROpcode::Const, IROpcode::IfEqz, IROpcode::InvokeStatic, IROpcode::ReturnVoid]
        );
        assert_eq!(code.registers_size(), 2);
        let branch = code.instructions().find(|(_, i)| i.opcode() == IROpcode::IfEqz).map(|(id, _)| id).unwrap();
        assert_eq!(code.targets_of(branch).len(), 1);
    }

    #[test]
    fn test_labels_print_canonically() {
        let g = Interner::new();
        let a = roundtrip(&g, "((const v0 0) (if-eqz v0 :skip) (const v0 1) (:skip) (return-void))");
        let b = roundtrip(&g, "((const v0 0) (if-eqz v0 :other) (const v0 1) :other (return-void))");
        assert_eq!(a, b);
        assert!(a.contains("(if-eqz v0 :L0)"));
        assert!(a.contains("(:L0)"));
    }

    #[test]
    fn test_backward_branch_and_switch() {
        let g = Interner::new();
        let code = parse_code(
            &g,
            "((:top) (const v0 1) (switch v0 (:a :b)) (goto :top) (:a 1) (return-void) (:b 5) (return-void))",
        )
        .unwrap();
        let kinds: Vec<BranchTargetKind> = code
            .iter()
            .filter_map(|(_, e)| match e {
                MethodItemEntry::Target(t) => Some(t.kind),
                _ => None,
            })
            .collect();
        assert_eq!(kinds, vec![BranchTargetKind::Simple, BranchTargetKind::Case(1), BranchTargetKind::Case(5)]);
        let printed = roundtrip(&g, "((:top) (const v0 1) (switch v0 (:a :b)) (goto :top) (:a 1) (return-void) (:b 5) (return-void))");
        assert!(printed.contains("(switch v0 (:L1 :L2))"));
    }

    #[test]
    fn test_try_catch_chain() {
        let g = Interner::new();
        let code = parse_code(
            &g,
            r#"((.try_start c0) (invoke-static () "LFoo;.f:()V") (.try_end c0) (return-void)
               (.catch (c0 c1) "Ljava/io/IOException;") (return-void) (.catch (c1)) (return-void))"#,
        )
        .unwrap();
        let catches: Vec<CatchEntry> = code
            .iter()
            .filter_map(|(_, e)| match e {
                MethodItemEntry::Catch(c) => Some(*c),
                _ => None,
            })
            .collect();
        assert_eq!(catches.len(), 2);
        assert!(catches[0].next.is_some());
        assert_eq!(catches[1].catch_type, None);
        roundtrip(&g, &print_code(&code, &g));
    }

    #[test]
    fn test_pseudo_result_ops_take_no_destination() {
        let g = Interner::new();
        let err = parse_code(&g, r#"((load-param-object v4) (iget-wide v0 v4 "LFoo;.x:J") (return-void))"#).unwrap_err();
        assert!(err.message().contains("iget-wide takes 1 source register(s), got 2"), "{}", err.message());
        assert!(parse_code(&g, r#"((check-cast v0 v1 "LFoo;") (return-void))"#).is_err());
        assert!(parse_code(&g, r#"((const-string v0 "s") (return-void))"#).is_err());
        assert!(parse_code(&g, r#"((aget v0 v1 v2) (return-void))"#).is_err());

        let code = parse_code(
            &g,
            r#"((load-param-object v4) (iget-wide v4 "LFoo;.x:J") (move-result-pseudo-wide v0) (return-wide v0))"#,
        )
        .unwrap();
        let iget = code.instructions().nth(1).map(|(_, i)| i.clone()).unwrap();
        assert_eq!(iget.srcs(), &[4]);
        assert_eq!(iget.dest(), None);
    }

    #[test]
    fn test_pseudo_ops_and_wide_registers() {
        let g = Interner::new();
        let code = parse_code(
            &g,
            r#"((const-wide v2 0xffffffffffffffff) (sget-wide "LFoo;.x:J") (move-result-pseudo-wide v4)
               (const-string "a\"b") (move-result-pseudo-object v0) (return-wide v2))"#,
        )
        .unwrap();
        assert_eq!(code.registers_size(), 6);
        let lit = code.instructions().next().and_then(|(_, i)| i.literal());
        assert_eq!(lit, Some(-1));
        let s = code.instructions().find_map(|(_, i)| i.string()).unwrap();
        assert_eq!(&*g.string(s), "a\"b");
        roundtrip(&g, &print_code(&code, &g));
    }

    #[test]
    fn test_positions_and_debug() {
        let g = Interner::new();
        roundtrip(
            &g,
            r#"((.pos "LFoo;.f:()V" "Foo.java" 10 (.pos "LFoo;.g:()V" "Foo.java" 3))
                (.dbg start-local v0 "x" "I") (const v0 1) (.dbg end-local v0) (return-void))"#,
        );
    }

    #[test]
    fn test_method_handle_and_data() {
        let g = Interner::new();
        let printed = roundtrip(
            &g,
            r#"((const-method-handle (invoke-static "LFoo;.f:()V")) (move-result-pseudo-object v0)
               (fill-array-data v1 (data 2 2 1 0 2 0)) (return-void))"#,
        );
        assert!(printed.contains("(invoke-static \"LFoo;.f:()V\")"));
    }

    #[test]
    fn test_errors() {
        let g = Interner::new();
        assert!(parse_code(&g, "((goto :nowhere))").is_err());
        assert!(parse_code(&g, "((frobnicate v0))").is_err());
        assert!(parse_code(&g, "((.try_start c0) (return-void) (.try_end c0))").is_err());
        assert!(parse_code(&g, "((const v0))").is_err());
        assert!(parse_code(&g, "((const v0 1)").is_err());
    }

    #[test]
    fn test_literals() {
        assert_eq!(parse_literal("42"), Some(42));
        assert_eq!(parse_literal("-0x10"), Some(-16));
        assert_eq!(parse_literal("0x7fffffff"), Some(i32::MAX as i64));
        assert_eq!(parse_literal("v0"), None);
    }
}
