pub mod passes;

use crate::cidr::Cidr;
use crate::language::types::{LiteralType, MatchClass};
use crate::regexp::RegExp;
use crate::vm::instruction::Opcode;
use crate::vm::runtime::Signature;
use std::fmt::Write as _;
use std::net::IpAddr;

/// Handler generated for global-scope variable initializers; the
/// interpreter runs it once before the first user handler invocation.
pub const GLOBAL_INIT_HANDLER: &str = "@__global_init__";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct InstrId(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BlockId(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HandlerId(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConstId(pub u32);

/// Operand edge of an instruction. Only terminators may carry `Block`
/// operands.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operand {
    Instr(InstrId),
    Const(ConstId),
    Block(BlockId),
}

#[derive(Clone, Debug, PartialEq)]
pub enum ConstantKind {
    Boolean(bool),
    Number(i64),
    String(String),
    IPAddress(IpAddr),
    Cidr(Cidr),
    RegExp(RegExp),
    Array {
        ty: LiteralType,
        elements: Vec<ConstId>,
    },
    BuiltinFunction(Signature),
    BuiltinHandler(Signature),
    HandlerRef(String),
}

impl ConstantKind {
    pub fn ty(&self) -> LiteralType {
        match self {
            ConstantKind::Boolean(_) => LiteralType::Boolean,
            ConstantKind::Number(_) => LiteralType::Number,
            ConstantKind::String(_) => LiteralType::String,
            ConstantKind::IPAddress(_) => LiteralType::IPAddress,
            ConstantKind::Cidr(_) => LiteralType::Cidr,
            ConstantKind::RegExp(_) => LiteralType::RegExp,
            ConstantKind::Array { ty, .. } => *ty,
            ConstantKind::BuiltinFunction(_) => LiteralType::Void,
            ConstantKind::BuiltinHandler(_) => LiteralType::Boolean,
            ConstantKind::HandlerRef(_) => LiteralType::Handler,
        }
    }
}

#[derive(Debug)]
pub struct Constant {
    pub kind: ConstantKind,
    users: Vec<InstrId>,
}

impl Constant {
    pub fn users(&self) -> &[InstrId] {
        &self.users
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InstrKind {
    Alloca,
    Load,
    Store,
    Unary(Opcode),
    Binary(Opcode),
    RegExpGroup,
    CallFunction,
    InvokeHandler,
    Ret,
    Br,
    CondBr,
    Match(MatchClass),
}

impl InstrKind {
    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            InstrKind::Ret | InstrKind::Br | InstrKind::CondBr | InstrKind::Match(_)
        )
    }

    /// Pure instructions may be dropped when nothing uses their result.
    pub fn is_pure(&self) -> bool {
        matches!(
            self,
            InstrKind::Alloca
                | InstrKind::Load
                | InstrKind::Unary(_)
                | InstrKind::Binary(_)
                | InstrKind::RegExpGroup
        )
    }
}

#[derive(Debug)]
pub struct Instr {
    pub kind: InstrKind,
    pub ty: LiteralType,
    pub name: String,
    pub block: BlockId,
    operands: Vec<Operand>,
    users: Vec<InstrId>,
}

impl Instr {
    pub fn operands(&self) -> &[Operand] {
        &self.operands
    }

    pub fn users(&self) -> &[InstrId] {
        &self.users
    }
}

#[derive(Debug)]
pub struct BasicBlock {
    pub name: String,
    pub handler: HandlerId,
    instrs: Vec<InstrId>,
    predecessors: Vec<BlockId>,
    successors: Vec<BlockId>,
    users: Vec<InstrId>,
}

impl BasicBlock {
    pub fn instrs(&self) -> &[InstrId] {
        &self.instrs
    }

    pub fn predecessors(&self) -> &[BlockId] {
        &self.predecessors
    }

    pub fn successors(&self) -> &[BlockId] {
        &self.successors
    }

    pub fn users(&self) -> &[InstrId] {
        &self.users
    }
}

#[derive(Debug)]
pub struct IrHandler {
    pub name: String,
    blocks: Vec<BlockId>,
}

impl IrHandler {
    pub fn blocks(&self) -> &[BlockId] {
        &self.blocks
    }

    pub fn entry_block(&self) -> Option<BlockId> {
        self.blocks.first().copied()
    }
}

/// Arena-owned IR for one compiled unit. Handlers, blocks, instructions
/// and constants live in flat vectors and refer to each other by id; all
/// use-def and CFG edge bookkeeping goes through the mutation primitives
/// below so the invariants checked by `verify_handler` hold at all times.
#[derive(Debug, Default)]
pub struct IrProgram {
    pub modules: Vec<(String, String)>,
    constants: Vec<Constant>,
    instrs: Vec<Instr>,
    blocks: Vec<BasicBlock>,
    handlers: Vec<IrHandler>,
}

impl IrProgram {
    pub fn new() -> Self {
        Self::default()
    }

    // constants, deduplicated on insert

    fn intern(&mut self, kind: ConstantKind) -> ConstId {
        for (i, constant) in self.constants.iter().enumerate() {
            if constant.kind == kind {
                return ConstId(i as u32);
            }
        }
        let id = ConstId(self.constants.len() as u32);
        self.constants.push(Constant {
            kind,
            users: Vec::new(),
        });
        id
    }

    pub fn get_boolean(&mut self, value: bool) -> ConstId {
        self.intern(ConstantKind::Boolean(value))
    }

    pub fn get_number(&mut self, value: i64) -> ConstId {
        self.intern(ConstantKind::Number(value))
    }

    pub fn get_string(&mut self, value: &str) -> ConstId {
        self.intern(ConstantKind::String(value.to_string()))
    }

    pub fn get_ipaddress(&mut self, value: IpAddr) -> ConstId {
        self.intern(ConstantKind::IPAddress(value))
    }

    pub fn get_cidr(&mut self, value: Cidr) -> ConstId {
        self.intern(ConstantKind::Cidr(value))
    }

    pub fn get_regexp(&mut self, value: RegExp) -> ConstId {
        self.intern(ConstantKind::RegExp(value))
    }

    pub fn get_array(&mut self, ty: LiteralType, elements: Vec<ConstId>) -> ConstId {
        self.intern(ConstantKind::Array { ty, elements })
    }

    pub fn get_builtin_function(&mut self, signature: Signature) -> ConstId {
        self.intern(ConstantKind::BuiltinFunction(signature))
    }

    pub fn get_builtin_handler(&mut self, signature: Signature) -> ConstId {
        self.intern(ConstantKind::BuiltinHandler(signature))
    }

    pub fn get_handler_ref(&mut self, name: &str) -> ConstId {
        self.intern(ConstantKind::HandlerRef(name.to_string()))
    }

    pub fn constant(&self, id: ConstId) -> &Constant {
        &self.constants[id.0 as usize]
    }

    pub fn constant_count(&self) -> usize {
        self.constants.len()
    }

    pub fn constants(&self) -> &[Constant] {
        &self.constants
    }

    // handlers and blocks

    pub fn create_handler(&mut self, name: &str) -> HandlerId {
        let id = HandlerId(self.handlers.len() as u32);
        self.handlers.push(IrHandler {
            name: name.to_string(),
            blocks: Vec::new(),
        });
        id
    }

    pub fn find_handler(&self, name: &str) -> Option<HandlerId> {
        self.handlers
            .iter()
            .position(|h| h.name == name)
            .map(|i| HandlerId(i as u32))
    }

    pub fn get_or_create_handler(&mut self, name: &str) -> HandlerId {
        match self.find_handler(name) {
            Some(id) => id,
            None => self.create_handler(name),
        }
    }

    pub fn handler(&self, id: HandlerId) -> &IrHandler {
        &self.handlers[id.0 as usize]
    }

    pub fn handler_ids(&self) -> Vec<HandlerId> {
        (0..self.handlers.len() as u32).map(HandlerId).collect()
    }

    pub fn create_block(&mut self, handler: HandlerId, name: &str) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(BasicBlock {
            name: name.to_string(),
            handler,
            instrs: Vec::new(),
            predecessors: Vec::new(),
            successors: Vec::new(),
            users: Vec::new(),
        });
        self.handlers[handler.0 as usize].blocks.push(id);
        id
    }

    pub fn block(&self, id: BlockId) -> &BasicBlock {
        &self.blocks[id.0 as usize]
    }

    pub fn instr(&self, id: InstrId) -> &Instr {
        &self.instrs[id.0 as usize]
    }

    pub fn terminator(&self, block: BlockId) -> Option<InstrId> {
        let last = *self.block(block).instrs.last()?;
        self.instr(last).kind.is_terminator().then_some(last)
    }

    pub fn operand_type(&self, operand: Operand) -> LiteralType {
        match operand {
            Operand::Instr(id) => self.instr(id).ty,
            Operand::Const(id) => self.constant(id).kind.ty(),
            Operand::Block(_) => LiteralType::Void,
        }
    }

    // instruction creation and the mutation primitives

    pub fn append_instr(
        &mut self,
        block: BlockId,
        kind: InstrKind,
        ty: LiteralType,
        operands: Vec<Operand>,
        name: &str,
    ) -> InstrId {
        let id = InstrId(self.instrs.len() as u32);
        self.instrs.push(Instr {
            kind,
            ty,
            name: name.to_string(),
            block,
            operands: Vec::new(),
            users: Vec::new(),
        });
        self.blocks[block.0 as usize].instrs.push(id);
        for operand in operands {
            self.add_operand(id, operand);
        }
        id
    }

    pub fn add_operand(&mut self, instr: InstrId, operand: Operand) {
        self.instrs[instr.0 as usize].operands.push(operand);
        self.add_user(operand, instr);
        if let Operand::Block(target) = operand {
            let owner = self.instrs[instr.0 as usize].block;
            self.link_successor(owner, target);
        }
    }

    pub fn set_operand(&mut self, instr: InstrId, index: usize, operand: Operand) -> Operand {
        let old = self.instrs[instr.0 as usize].operands[index];
        self.instrs[instr.0 as usize].operands[index] = operand;

        let owner = self.instrs[instr.0 as usize].block;
        self.remove_user(old, instr);
        if let Operand::Block(old_block) = old {
            self.unlink_successor(owner, old_block);
        }
        self.add_user(operand, instr);
        if let Operand::Block(new_block) = operand {
            self.link_successor(owner, new_block);
        }
        old
    }

    pub fn replace_operand(&mut self, instr: InstrId, old: Operand, new: Operand) -> usize {
        let mut count = 0;
        for index in 0..self.instrs[instr.0 as usize].operands.len() {
            if self.instrs[instr.0 as usize].operands[index] == old {
                self.set_operand(instr, index, new);
                count += 1;
            }
        }
        count
    }

    pub fn clear_operands(&mut self, instr: InstrId) {
        let operands = std::mem::take(&mut self.instrs[instr.0 as usize].operands);
        let owner = self.instrs[instr.0 as usize].block;
        for operand in operands {
            self.remove_user(operand, instr);
            if let Operand::Block(block) = operand {
                self.unlink_successor(owner, block);
            }
        }
    }

    /// Rewrites an instruction in place, releasing its old operand edges
    /// and wiring the new ones. Users of its result are kept.
    pub fn rewrite_instr(
        &mut self,
        instr: InstrId,
        kind: InstrKind,
        ty: LiteralType,
        operands: Vec<Operand>,
    ) {
        self.clear_operands(instr);
        self.instrs[instr.0 as usize].kind = kind;
        self.instrs[instr.0 as usize].ty = ty;
        for operand in operands {
            self.add_operand(instr, operand);
        }
    }

    /// Detaches an instruction from its block. The caller must have made
    /// its user list empty first.
    pub fn remove_instr(&mut self, instr: InstrId) {
        self.clear_operands(instr);
        let block = self.instrs[instr.0 as usize].block;
        self.blocks[block.0 as usize].instrs.retain(|&i| i != instr);
    }

    /// Removes a block and everything in it from its handler. Any user
    /// edges into the block must have been rewritten beforehand.
    pub fn remove_block(&mut self, block: BlockId) {
        let instrs = self.blocks[block.0 as usize].instrs.clone();
        for instr in instrs {
            self.remove_instr(instr);
        }
        let handler = self.blocks[block.0 as usize].handler;
        self.handlers[handler.0 as usize]
            .blocks
            .retain(|&b| b != block);
    }

    /// Points every instruction that references `old` as a block operand
    /// at `new` instead.
    pub fn replace_block_refs(&mut self, old: BlockId, new: BlockId) {
        let users = self.blocks[old.0 as usize].users.clone();
        for user in users {
            self.replace_operand(user, Operand::Block(old), Operand::Block(new));
        }
    }

    /// Moves all instructions of `from` to the end of `to`, transferring
    /// outgoing CFG edges. `from` is left empty.
    pub fn transfer_block_contents(&mut self, from: BlockId, to: BlockId) {
        let moved = std::mem::take(&mut self.blocks[from.0 as usize].instrs);
        for &instr in &moved {
            self.instrs[instr.0 as usize].block = to;
            for operand in self.instrs[instr.0 as usize].operands.clone() {
                if let Operand::Block(target) = operand {
                    self.unlink_successor(from, target);
                    self.link_successor(to, target);
                }
            }
        }
        self.blocks[to.0 as usize].instrs.extend(moved);
    }

    fn add_user(&mut self, operand: Operand, user: InstrId) {
        match operand {
            Operand::Instr(id) => self.instrs[id.0 as usize].users.push(user),
            Operand::Const(id) => self.constants[id.0 as usize].users.push(user),
            Operand::Block(id) => self.blocks[id.0 as usize].users.push(user),
        }
    }

    fn remove_user(&mut self, operand: Operand, user: InstrId) {
        let users = match operand {
            Operand::Instr(id) => &mut self.instrs[id.0 as usize].users,
            Operand::Const(id) => &mut self.constants[id.0 as usize].users,
            Operand::Block(id) => &mut self.blocks[id.0 as usize].users,
        };
        if let Some(pos) = users.iter().position(|&u| u == user) {
            users.remove(pos);
        }
    }

    fn link_successor(&mut self, from: BlockId, to: BlockId) {
        self.blocks[from.0 as usize].successors.push(to);
        self.blocks[to.0 as usize].predecessors.push(from);
    }

    fn unlink_successor(&mut self, from: BlockId, to: BlockId) {
        let successors = &mut self.blocks[from.0 as usize].successors;
        if let Some(pos) = successors.iter().position(|&b| b == to) {
            successors.remove(pos);
        }
        let predecessors = &mut self.blocks[to.0 as usize].predecessors;
        if let Some(pos) = predecessors.iter().position(|&b| b == from) {
            predecessors.remove(pos);
        }
    }

    // verification

    /// Checks the structural invariants of one handler: terminator
    /// placement, block-operand discipline, CFG edge symmetry and use-def
    /// symmetry. Violations are compiler bugs, reported as `Err`.
    pub fn verify_handler(&self, handler: HandlerId) -> Result<(), String> {
        let handler_ref = self.handler(handler);

        for &block_id in handler_ref.blocks() {
            let block = self.block(block_id);

            for (index, &instr_id) in block.instrs.iter().enumerate() {
                let is_last = index + 1 == block.instrs.len();
                if self.instr(instr_id).kind.is_terminator() && !is_last {
                    return Err(format!(
                        "handler {}: block {} has a terminator before its end",
                        handler_ref.name, block.name
                    ));
                }
            }

            if let Some(&last) = block.instrs.last() {
                if !self.instr(last).kind.is_terminator() {
                    return Err(format!(
                        "handler {}: block {} does not end in a terminator",
                        handler_ref.name, block.name
                    ));
                }
            }

            let mut block_operands = Vec::new();
            for &instr_id in &block.instrs {
                let instr = self.instr(instr_id);
                let has_block_operand = instr
                    .operands
                    .iter()
                    .any(|op| matches!(op, Operand::Block(_)));
                if has_block_operand && !instr.kind.is_terminator() {
                    return Err(format!(
                        "handler {}: non-terminator in block {} references a block",
                        handler_ref.name, block.name
                    ));
                }
                for operand in &instr.operands {
                    if let Operand::Block(target) = operand {
                        block_operands.push(*target);
                    }
                }
            }

            if !multiset_eq(&block_operands, &block.successors) {
                return Err(format!(
                    "handler {}: successors of block {} disagree with its terminator",
                    handler_ref.name, block.name
                ));
            }
        }

        // predecessor lists are the transpose of successor lists
        for &block_id in handler_ref.blocks() {
            let mut expected = Vec::new();
            for &other_id in handler_ref.blocks() {
                for &succ in &self.block(other_id).successors {
                    if succ == block_id {
                        expected.push(other_id);
                    }
                }
            }
            if !multiset_eq(&expected, &self.block(block_id).predecessors) {
                return Err(format!(
                    "handler {}: predecessors of block {} are not the successor transpose",
                    handler_ref.name,
                    self.block(block_id).name
                ));
            }
        }

        // use-def symmetry with multiplicity
        for &block_id in handler_ref.blocks() {
            for &instr_id in self.block(block_id).instrs() {
                let instr = self.instr(instr_id);
                for &operand in &instr.operands {
                    let edge_count = instr.operands.iter().filter(|&&o| o == operand).count();
                    let users = match operand {
                        Operand::Instr(id) => self.instr(id).users(),
                        Operand::Const(id) => self.constant(id).users(),
                        Operand::Block(id) => self.block(id).users(),
                    };
                    let user_count = users.iter().filter(|&&u| u == instr_id).count();
                    if edge_count != user_count {
                        return Err(format!(
                            "handler {}: use-def asymmetry on %{} ({} edges, {} user entries)",
                            handler_ref.name, instr.name, edge_count, user_count
                        ));
                    }
                }
            }
        }

        Ok(())
    }

    // debugging output

    pub fn dump(&self) -> String {
        let mut out = String::from("; IrProgram\n");
        for handler in &self.handlers {
            let _ = writeln!(out, "\nhandler {}", handler.name);
            for &block_id in &handler.blocks {
                let block = self.block(block_id);
                let _ = writeln!(out, "  {}:", block.name);
                for &instr_id in &block.instrs {
                    let _ = writeln!(out, "    {}", self.format_instr(instr_id));
                }
            }
        }
        out
    }

    fn format_instr(&self, id: InstrId) -> String {
        let instr = self.instr(id);
        let mnemonic = match &instr.kind {
            InstrKind::Alloca => "alloca".to_string(),
            InstrKind::Load => "load".to_string(),
            InstrKind::Store => "store".to_string(),
            InstrKind::Unary(op) | InstrKind::Binary(op) => op.mnemonic().to_lowercase(),
            InstrKind::RegExpGroup => "sreggroup".to_string(),
            InstrKind::CallFunction => "call".to_string(),
            InstrKind::InvokeHandler => "handler".to_string(),
            InstrKind::Ret => "ret".to_string(),
            InstrKind::Br => "br".to_string(),
            InstrKind::CondBr => "condbr".to_string(),
            InstrKind::Match(class) => format!("match {}", class),
        };

        let mut line = if instr.ty == LiteralType::Void {
            mnemonic
        } else {
            format!("%{} = {}", instr.name, mnemonic)
        };

        for (i, operand) in instr.operands.iter().enumerate() {
            line.push_str(if i == 0 { " " } else { ", " });
            match operand {
                Operand::Instr(v) => {
                    line.push('%');
                    line.push_str(&self.instr(*v).name);
                }
                Operand::Block(b) => {
                    line.push('%');
                    line.push_str(&self.block(*b).name);
                }
                Operand::Const(c) => match &self.constant(*c).kind {
                    ConstantKind::Boolean(v) => line.push_str(if *v { "true" } else { "false" }),
                    ConstantKind::Number(v) => {
                        let _ = write!(line, "{}", v);
                    }
                    ConstantKind::String(v) => {
                        let _ = write!(line, "{:?}", v);
                    }
                    ConstantKind::IPAddress(v) => {
                        let _ = write!(line, "{}", v);
                    }
                    ConstantKind::Cidr(v) => {
                        let _ = write!(line, "{}", v);
                    }
                    ConstantKind::RegExp(v) => {
                        let _ = write!(line, "{}", v);
                    }
                    ConstantKind::Array { elements, .. } => {
                        let _ = write!(line, "[{} elements]", elements.len());
                    }
                    ConstantKind::BuiltinFunction(sig) | ConstantKind::BuiltinHandler(sig) => {
                        let _ = write!(line, "{}", sig);
                    }
                    ConstantKind::HandlerRef(name) => {
                        let _ = write!(line, "@{}", name);
                    }
                },
            }
        }

        line
    }
}

fn multiset_eq(a: &[BlockId], b: &[BlockId]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut a_sorted: Vec<u32> = a.iter().map(|b| b.0).collect();
    let mut b_sorted: Vec<u32> = b.iter().map(|b| b.0).collect();
    a_sorted.sort_unstable();
    b_sorted.sort_unstable();
    a_sorted == b_sorted
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constants_are_deduplicated() {
        let mut program = IrProgram::new();
        let a = program.get_number(42);
        let b = program.get_number(42);
        let c = program.get_number(7);
        assert_eq!(a, b);
        assert_ne!(a, c);

        let s1 = program.get_string("hello");
        let s2 = program.get_string("hello");
        assert_eq!(s1, s2);
    }

    #[test]
    fn operand_edges_maintain_user_lists() {
        let mut program = IrProgram::new();
        let handler = program.create_handler("test");
        let entry = program.create_block(handler, "entry");

        let one = program.get_number(1);
        let two = program.get_number(2);
        let add = program.append_instr(
            entry,
            InstrKind::Binary(Opcode::NADD),
            LiteralType::Number,
            vec![Operand::Const(one), Operand::Const(two)],
            "t0",
        );

        assert_eq!(program.constant(one).users(), &[add]);
        program.replace_operand(add, Operand::Const(one), Operand::Const(two));
        assert!(program.constant(one).users().is_empty());
        assert_eq!(program.constant(two).users().len(), 2);
    }

    #[test]
    fn terminator_block_operands_track_cfg_edges() {
        let mut program = IrProgram::new();
        let handler = program.create_handler("test");
        let entry = program.create_block(handler, "entry");
        let target = program.create_block(handler, "target");
        let other = program.create_block(handler, "other");

        let br = program.append_instr(
            entry,
            InstrKind::Br,
            LiteralType::Void,
            vec![Operand::Block(target)],
            "",
        );
        assert_eq!(program.block(entry).successors(), &[target]);
        assert_eq!(program.block(target).predecessors(), &[entry]);

        program.replace_operand(br, Operand::Block(target), Operand::Block(other));
        assert_eq!(program.block(entry).successors(), &[other]);
        assert!(program.block(target).predecessors().is_empty());

        let ret_false = program.get_boolean(false);
        program.append_instr(
            other,
            InstrKind::Ret,
            LiteralType::Void,
            vec![Operand::Const(ret_false)],
            "",
        );
        let ret2 = program.get_boolean(false);
        program.append_instr(
            target,
            InstrKind::Ret,
            LiteralType::Void,
            vec![Operand::Const(ret2)],
            "",
        );
        assert!(program.verify_handler(handler).is_ok());
    }

    #[test]
    fn verify_rejects_missing_terminator() {
        let mut program = IrProgram::new();
        let handler = program.create_handler("test");
        let entry = program.create_block(handler, "entry");
        let one = program.get_number(1);
        program.append_instr(
            entry,
            InstrKind::Unary(Opcode::NNEG),
            LiteralType::Number,
            vec![Operand::Const(one)],
            "t0",
        );
        assert!(program.verify_handler(handler).is_err());
    }
}
