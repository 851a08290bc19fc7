//! Dumps CFGs in the textual format read by the C1 visualizer, so one method can be
//! followed across passes.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use log::debug;

use crate::cfg::graph::{ControlFlowGraph, EdgeType};
use crate::error::{DexError, Result};
use crate::ir::code::{IRCode, MethodItemEntry};
use crate::ir::interner::Interner;

pub struct CfgVisualizer<'g> {
    g: &'g Interner,
    out: String,
    indent: usize,
    next_insn: usize,
}

impl<'g> CfgVisualizer<'g> {
    pub fn new(g: &'g Interner) -> Self {
        CfgVisualizer { g, out: String::new(), indent: 0, next_insn: 0 }
    }

    fn line(&mut self, text: &str) {
        for _ in 0..self.indent {
            self.out.push_str("  ");
        }
        self.out.push_str(text);
        self.out.push('\n');
    }

    fn begin(&mut self, tag: &str) {
        self.line(&format!("begin_{}", tag));
        self.indent += 1;
    }

    fn end(&mut self, tag: &str) {
        self.indent = self.indent.saturating_sub(1);
        self.line(&format!("end_{}", tag));
    }

    /// Opens the record that the following `add_cfg` calls belong to.
    pub fn begin_compilation(&mut self, name: &str) {
        self.next_insn = 0;
        self.begin("compilation");
        self.line(&format!("name \"{}\"", name));
        self.line(&format!("method \"{}\"", name));
        self.line("date 0");
        self.end("compilation");
    }

    /// Adds one cfg for `pass`. Code without a built CFG gets a temporary one.
    pub fn add_code(&mut self, pass: &str, code: &IRCode) -> Result<()> {
        match code.cfg() {
            Some(cfg) => {
                self.add_cfg(pass, cfg);
                Ok(())
            }
            None => {
                let cfg = ControlFlowGraph::build(code)?;
                self.add_cfg(pass, &cfg);
                Ok(())
            }
        }
    }

    pub fn add_cfg(&mut self, pass: &str, cfg: &ControlFlowGraph) {
        self.begin("cfg");
        self.line(&format!("name \"{}\"", pass));
        for b in cfg.block_order() {
            self.add_block(cfg, b);
        }
        self.end("cfg");
    }

    fn block_list(ids: impl Iterator<Item = usize>) -> String {
        ids.map(|b| format!(" \"B{}\"", b)).collect()
    }

    fn add_block(&mut self, cfg: &ControlFlowGraph, b: usize) {
        let block = match cfg.block(b) {
            Some(block) => block,
            None => return,
        };
        self.begin("block");
        self.line(&format!("name \"B{}\"", b));
        self.line("from_bci -1");
        self.line("to_bci -1");
        let preds = Self::block_list(cfg.predecessors(b).into_iter());
        let succs = Self::block_list(
            cfg.get_succ_edges_if(b, |e| !e.is_throw() && e.kind != EdgeType::Ghost)
                .iter()
                .map(|e| e.target),
        );
        let handlers = Self::block_list(cfg.get_succ_edges_if(b, |e| e.is_throw()).iter().map(|e| e.target));
        self.line(&format!("predecessors{}", preds));
        self.line(&format!("successors{}", succs));
        self.line(&format!("xhandlers{}", handlers));
        if cfg.entry_block() == b {
            self.line("flags \"std\"");
        } else {
            self.line("flags");
        }

        self.begin("states");
        self.begin("locals");
        self.line(&format!("size {}", cfg.registers_size()));
        self.line("method \"None\"");
        self.end("locals");
        self.end("states");

        self.begin("HIR");
        for item in block.items() {
            let text = match item {
                MethodItemEntry::Opcode(insn) => {
                    let shown = insn.show(self.g);
                    let body = shown.strip_prefix('(').and_then(|s| s.strip_suffix(')')).unwrap_or(&shown);
                    let mut text = body.to_string();
                    if insn.opcode().is_branch() {
                        let targets: Vec<String> = cfg
                            .get_succ_edges_if(b, |e| e.kind == EdgeType::Branch)
                            .iter()
                            .map(|e| match e.case_key {
                                Some(k) => format!("{}:B{}", k, e.target),
                                None => format!("B{}", e.target),
                            })
                            .collect();
                        text.push_str(&format!(" [{}]", targets.join(", ")));
                    }
                    text
                }
                MethodItemEntry::Position(p) => format!("#pos line {}", p.line),
                MethodItemEntry::SourceBlock(id) => format!("#source-block {}", id),
                _ => continue,
            };
            let id = self.next_insn;
            self.next_insn += 1;
            self.line(&format!("0 0 i{} {} <|@", id, text));
        }
        self.end("HIR");
        self.end("block");
    }

    pub fn finish(self) -> String {
        self.out
    }

    /// Appends the collected records to `path`.
    pub fn append_to_file(self, path: &Path) -> Result<()> {
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| DexError::new(format!("cannot open {}: {}", path.display(), e)))?;
        f.write_all(self.out.as_bytes())
            .map_err(|e| DexError::new(format!("cannot write {}: {}", path.display(), e)))?;
        debug!("[cfg] appended {} bytes to {}", self.out.len(), path.display());
        Ok(())
    }
}
