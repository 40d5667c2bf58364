use crate::ir::{
    BlockId, ConstantKind, GLOBAL_INIT_HANDLER, HandlerId, InstrId, InstrKind, IrProgram, Operand,
};
use crate::language::types::{LiteralType, MatchClass};
use crate::vm::instruction::{self, Instruction, Opcode, make_instruction};
use crate::vm::program::{ConstantPool, Handler, MatchCaseDef, MatchDef, Program};
use std::collections::{HashMap, HashSet};

/// Lowers optimized IR into the linear bytecode `Program`. Every IR value
/// gets a frame slot; branches are emitted with block indices and patched
/// to instruction offsets in a second pass.
pub fn generate(ir: &IrProgram) -> Program {
    TargetCodeGenerator::new(ir).generate()
}

struct TargetCodeGenerator<'a> {
    ir: &'a IrProgram,
    pool: ConstantPool,
    handler_indices: HashMap<String, usize>,
    globals: HashMap<InstrId, u16>,
}

impl<'a> TargetCodeGenerator<'a> {
    fn new(ir: &'a IrProgram) -> Self {
        let mut handler_indices = HashMap::new();
        for (index, id) in ir.handler_ids().into_iter().enumerate() {
            handler_indices.insert(ir.handler(id).name.clone(), index);
        }

        // allocas of the global-init handler become process-lifetime
        // globals; references from any handler compile to GLOAD/GSTORE
        let mut globals = HashMap::new();
        if let Some(init) = ir.find_handler(GLOBAL_INIT_HANDLER) {
            for &block in ir.handler(init).blocks() {
                for &instr in ir.block(block).instrs() {
                    if ir.instr(instr).kind == InstrKind::Alloca {
                        let slot = globals.len() as u16;
                        globals.insert(instr, slot);
                    }
                }
            }
        }

        Self {
            ir,
            pool: ConstantPool::default(),
            handler_indices,
            globals,
        }
    }

    fn generate(mut self) -> Program {
        self.pool.modules = self.ir.modules.clone();
        let globals_count = self.globals.len();

        let mut handlers = Vec::new();
        for handler_id in self.ir.handler_ids() {
            let code = self.emit_handler(handler_id);
            handlers.push(Handler::new(self.ir.handler(handler_id).name.clone(), code));
        }

        Program::new(self.pool, handlers, globals_count)
    }

    fn emit_handler(&mut self, handler: HandlerId) -> Vec<Instruction> {
        // every local alloca and every used non-void result gets a slot
        let mut slots: HashMap<InstrId, u16> = HashMap::new();
        let mut local_count: u16 = 0;
        for &block in self.ir.handler(handler).blocks() {
            for &instr in self.ir.block(block).instrs() {
                let i = self.ir.instr(instr);
                let needs_slot = match i.kind {
                    InstrKind::Alloca => !self.globals.contains_key(&instr),
                    _ => i.ty != LiteralType::Void && !i.users().is_empty(),
                };
                if needs_slot {
                    slots.insert(instr, local_count);
                    local_count += 1;
                }
            }
        }

        let order = self.layout_blocks(handler);

        let mut code: Vec<Instruction> = Vec::new();
        if local_count > 0 {
            code.push(make_instruction(Opcode::ALLOCA, local_count, 0, 0));
        }

        let mut offsets: HashMap<BlockId, usize> = HashMap::new();
        let mut branch_patches: Vec<(usize, u8, BlockId)> = Vec::new();
        let mut match_patches: Vec<(usize, Option<usize>, BlockId)> = Vec::new();

        for &block in &order {
            offsets.insert(block, code.len());
            for &instr in self.ir.block(block).instrs() {
                self.emit_instr(instr, &slots, &mut code, &mut branch_patches, &mut match_patches);
            }
        }

        // replace block indices in branch operands with instruction offsets
        for (index, field, block) in branch_patches {
            let offset = offsets[&block] as u16;
            let old = code[index];
            let op = instruction::opcode(old);
            let mut a = instruction::operand_a(old);
            let mut b = instruction::operand_b(old);
            let c = instruction::operand_c(old);
            match field {
                0 => a = offset,
                _ => b = offset,
            }
            code[index] = make_instruction(op, a, b, c);
        }

        for (def_index, case, block) in match_patches {
            let pc = offsets[&block];
            let def = self.pool.match_def_mut(def_index);
            match case {
                None => def.else_pc = pc,
                Some(k) => def.cases[k].pc = pc,
            }
        }

        code
    }

    /// Emission order: entry first, then depth-first with the fall-through
    /// candidate (branch target, false edge of a CondBr) emitted next.
    fn layout_blocks(&self, handler: HandlerId) -> Vec<BlockId> {
        let handler_ref = self.ir.handler(handler);
        let mut order = Vec::new();
        let mut visited = HashSet::new();

        if let Some(entry) = handler_ref.entry_block() {
            let mut stack = vec![entry];
            while let Some(block) = stack.pop() {
                if !visited.insert(block) {
                    continue;
                }
                order.push(block);
                if let Some(term) = self.ir.terminator(block) {
                    for &operand in self.ir.instr(term).operands() {
                        if let Operand::Block(target) = operand {
                            stack.push(target);
                        }
                    }
                }
            }
        }

        for &block in handler_ref.blocks() {
            if visited.insert(block) {
                order.push(block);
            }
        }
        order
    }

    fn emit_instr(
        &mut self,
        instr: InstrId,
        slots: &HashMap<InstrId, u16>,
        code: &mut Vec<Instruction>,
        branch_patches: &mut Vec<(usize, u8, BlockId)>,
        match_patches: &mut Vec<(usize, Option<usize>, BlockId)>,
    ) {
        let kind = self.ir.instr(instr).kind.clone();
        let operands: Vec<Operand> = self.ir.instr(instr).operands().to_vec();

        match kind {
            InstrKind::Alloca => {}
            InstrKind::Load => {
                if let Operand::Instr(alloca) = operands[0] {
                    match self.globals.get(&alloca) {
                        Some(&slot) => code.push(make_instruction(Opcode::GLOAD, slot, 0, 0)),
                        None => code.push(make_instruction(Opcode::LOAD, slots[&alloca], 0, 0)),
                    }
                }
                self.store_result(instr, slots, code);
            }
            InstrKind::Store => {
                self.emit_push(operands[1], slots, code);
                if let Operand::Instr(alloca) = operands[0] {
                    match self.globals.get(&alloca) {
                        Some(&slot) => code.push(make_instruction(Opcode::GSTORE, slot, 0, 0)),
                        None => code.push(make_instruction(Opcode::STORE, slots[&alloca], 0, 0)),
                    }
                }
            }
            InstrKind::Unary(op) => {
                self.emit_push(operands[0], slots, code);
                code.push(make_instruction(op, 0, 0, 0));
                self.store_result(instr, slots, code);
            }
            InstrKind::Binary(op) => {
                self.emit_push(operands[0], slots, code);
                self.emit_push(operands[1], slots, code);
                code.push(make_instruction(op, 0, 0, 0));
                self.store_result(instr, slots, code);
            }
            InstrKind::RegExpGroup => {
                let group = match operands[0] {
                    Operand::Const(id) => match self.ir.constant(id).kind {
                        ConstantKind::Number(value) => value as u16,
                        _ => 0,
                    },
                    _ => 0,
                };
                code.push(make_instruction(Opcode::SREGGROUP, group, 0, 0));
                self.store_result(instr, slots, code);
            }
            InstrKind::CallFunction => {
                let signature = match operands[0] {
                    Operand::Const(id) => match &self.ir.constant(id).kind {
                        ConstantKind::BuiltinFunction(sig) => sig.clone(),
                        _ => return,
                    },
                    _ => return,
                };
                for &arg in &operands[1..] {
                    self.emit_push(arg, slots, code);
                }
                let id = self.pool.make_native_function(signature.clone()) as u16;
                let argc = (operands.len() - 1) as u16;
                let returns = signature.ret != LiteralType::Void;
                code.push(make_instruction(Opcode::CALL, id, argc, u16::from(returns)));
                if returns {
                    self.store_result(instr, slots, code);
                }
            }
            InstrKind::InvokeHandler => {
                let signature = match operands[0] {
                    Operand::Const(id) => match &self.ir.constant(id).kind {
                        ConstantKind::BuiltinHandler(sig) => sig.clone(),
                        _ => return,
                    },
                    _ => return,
                };
                for &arg in &operands[1..] {
                    self.emit_push(arg, slots, code);
                }
                let id = self.pool.make_native_handler(signature) as u16;
                let argc = (operands.len() - 1) as u16;
                code.push(make_instruction(Opcode::HANDLER, id, argc, 0));
            }
            InstrKind::Ret => match operands[0] {
                Operand::Const(id) => match self.ir.constant(id).kind {
                    ConstantKind::Boolean(value) => {
                        code.push(make_instruction(Opcode::EXIT, u16::from(value), 0, 0));
                    }
                    _ => {
                        self.emit_push(operands[0], slots, code);
                        code.push(make_instruction(Opcode::RET, 0, 0, 0));
                    }
                },
                other => {
                    self.emit_push(other, slots, code);
                    code.push(make_instruction(Opcode::RET, 0, 0, 0));
                }
            },
            InstrKind::Br => {
                if let Operand::Block(target) = operands[0] {
                    branch_patches.push((code.len(), 0, target));
                    code.push(make_instruction(Opcode::BR, target.0 as u16, 0, 0));
                }
            }
            InstrKind::CondBr => {
                self.emit_push(operands[0], slots, code);
                if let (Operand::Block(on_true), Operand::Block(on_false)) =
                    (operands[1], operands[2])
                {
                    branch_patches.push((code.len(), 0, on_true));
                    branch_patches.push((code.len(), 1, on_false));
                    code.push(make_instruction(
                        Opcode::CONDBR,
                        on_true.0 as u16,
                        on_false.0 as u16,
                        0,
                    ));
                }
            }
            InstrKind::Match(class) => {
                self.emit_push(operands[0], slots, code);
                let else_block = match operands[1] {
                    Operand::Block(block) => block,
                    _ => return,
                };

                let mut cases = Vec::new();
                let mut case_targets = Vec::new();
                for pair in operands[2..].chunks(2) {
                    let (label, target) = match (pair[0], pair[1]) {
                        (Operand::Const(label), Operand::Block(target)) => (label, target),
                        _ => continue,
                    };
                    let pool_index = match (&class, &self.ir.constant(label).kind) {
                        (MatchClass::RegExp, ConstantKind::RegExp(re)) => {
                            self.pool.make_regexp(re.clone())
                        }
                        (_, ConstantKind::String(s)) => {
                            let s = s.clone();
                            self.pool.make_string(&s)
                        }
                        _ => continue,
                    };
                    cases.push(MatchCaseDef {
                        label: pool_index,
                        pc: 0,
                    });
                    case_targets.push(target);
                }

                let def_index = self.pool.make_match_def(MatchDef {
                    op: class,
                    else_pc: 0,
                    cases,
                });
                for (k, target) in case_targets.into_iter().enumerate() {
                    match_patches.push((def_index, Some(k), target));
                }
                match_patches.push((def_index, None, else_block));
                code.push(make_instruction(Opcode::MATCH, def_index as u16, 0, 0));
            }
        }
    }

    fn store_result(
        &self,
        instr: InstrId,
        slots: &HashMap<InstrId, u16>,
        code: &mut Vec<Instruction>,
    ) {
        match slots.get(&instr) {
            Some(&slot) => code.push(make_instruction(Opcode::STORE, slot, 0, 0)),
            None => {
                if self.ir.instr(instr).ty != LiteralType::Void {
                    code.push(make_instruction(Opcode::POP, 0, 0, 0));
                }
            }
        }
    }

    fn emit_push(
        &mut self,
        operand: Operand,
        slots: &HashMap<InstrId, u16>,
        code: &mut Vec<Instruction>,
    ) {
        match operand {
            Operand::Instr(value) => match self.globals.get(&value) {
                Some(&slot) => code.push(make_instruction(Opcode::GLOAD, slot, 0, 0)),
                None => code.push(make_instruction(Opcode::LOAD, slots[&value], 0, 0)),
            },
            Operand::Const(id) => {
                let kind = self.ir.constant(id).kind.clone();
                let instr = match kind {
                    ConstantKind::Boolean(value) => {
                        make_instruction(Opcode::ILOAD, u16::from(value), 0, 0)
                    }
                    ConstantKind::Number(value) => {
                        if (0..=i64::from(u16::MAX)).contains(&value) {
                            make_instruction(Opcode::ILOAD, value as u16, 0, 0)
                        } else {
                            let index = self.pool.make_number(value) as u16;
                            make_instruction(Opcode::NLOAD, index, 0, 0)
                        }
                    }
                    ConstantKind::String(value) => {
                        let index = self.pool.make_string(&value) as u16;
                        make_instruction(Opcode::SLOAD, index, 0, 0)
                    }
                    ConstantKind::IPAddress(value) => {
                        let index = self.pool.make_ipaddr(value) as u16;
                        make_instruction(Opcode::PLOAD, index, 0, 0)
                    }
                    ConstantKind::Cidr(value) => {
                        let index = self.pool.make_cidr(value) as u16;
                        make_instruction(Opcode::CLOAD, index, 0, 0)
                    }
                    ConstantKind::RegExp(value) => {
                        let index = self.pool.make_regexp(value) as u16;
                        make_instruction(Opcode::RLOAD, index, 0, 0)
                    }
                    ConstantKind::Array { ty, elements } => {
                        self.emit_array_load(ty, &elements)
                    }
                    ConstantKind::HandlerRef(name) => {
                        let index = self.handler_indices.get(&name).copied().unwrap_or(0);
                        make_instruction(Opcode::HLOAD, index as u16, 0, 0)
                    }
                    // builtin references only appear as call targets
                    ConstantKind::BuiltinFunction(_) | ConstantKind::BuiltinHandler(_) => return,
                };
                code.push(instr);
            }
            Operand::Block(_) => {}
        }
    }

    fn emit_array_load(&mut self, ty: LiteralType, elements: &[crate::ir::ConstId]) -> Instruction {
        match ty {
            LiteralType::IntArray => {
                let values: Vec<i64> = elements
                    .iter()
                    .filter_map(|&id| match self.ir.constant(id).kind {
                        ConstantKind::Number(v) => Some(v),
                        _ => None,
                    })
                    .collect();
                let index = self.pool.make_int_array(values) as u16;
                make_instruction(Opcode::ITLOAD, index, 0, 0)
            }
            LiteralType::StringArray => {
                let values: Vec<String> = elements
                    .iter()
                    .filter_map(|&id| match &self.ir.constant(id).kind {
                        ConstantKind::String(v) => Some(v.clone()),
                        _ => None,
                    })
                    .collect();
                let index = self.pool.make_string_array(values) as u16;
                make_instruction(Opcode::STLOAD, index, 0, 0)
            }
            LiteralType::IPAddrArray => {
                let values: Vec<std::net::IpAddr> = elements
                    .iter()
                    .filter_map(|&id| match self.ir.constant(id).kind {
                        ConstantKind::IPAddress(v) => Some(v),
                        _ => None,
                    })
                    .collect();
                let index = self.pool.make_ipaddr_array(values) as u16;
                make_instruction(Opcode::PTLOAD, index, 0, 0)
            }
            _ => {
                let values: Vec<crate::cidr::Cidr> = elements
                    .iter()
                    .filter_map(|&id| match self.ir.constant(id).kind {
                        ConstantKind::Cidr(v) => Some(v),
                        _ => None,
                    })
                    .collect();
                let index = self.pool.make_cidr_array(values) as u16;
                make_instruction(Opcode::CTLOAD, index, 0, 0)
            }
        }
    }
}
