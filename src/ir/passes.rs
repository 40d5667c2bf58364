use crate::ir::{BlockId, ConstantKind, HandlerId, InstrKind, IrProgram, Operand};
use crate::language::types::LiteralType;
use std::collections::HashSet;

pub type HandlerPass = fn(&mut IrProgram, HandlerId) -> bool;

/// Runs handler-scoped passes to a fixed point: for each handler the full
/// pass list is repeated until one sweep reports no changes. The IR is
/// re-verified after every pass that changed something.
pub struct PassManager {
    passes: Vec<(&'static str, HandlerPass)>,
    debug: bool,
}

impl PassManager {
    pub fn new() -> Self {
        Self {
            passes: Vec::new(),
            debug: false,
        }
    }

    /// The standard pipeline. Level 0 runs only the mandatory empty-block
    /// elimination; level 1 and up enable the full set.
    pub fn with_optimization_level(level: i32) -> Self {
        let mut pm = Self::new();
        pm.register_pass("eliminate-empty-blocks", eliminate_empty_blocks);
        if level >= 1 {
            pm.register_pass("eliminate-linear-br", eliminate_linear_br);
            pm.register_pass("eliminate-unused-blocks", eliminate_unused_blocks);
            pm.register_pass("eliminate-unused-instr", eliminate_unused_instr);
            pm.register_pass("fold-constant-condbr", fold_constant_condbr);
            pm.register_pass("rewrite-br-to-exit", rewrite_br_to_exit);
            pm.register_pass("rewrite-cond-br-to-same-branches", rewrite_condbr_to_same_branches);
            pm.register_pass("merge-same-blocks", merge_same_blocks);
        }
        pm
    }

    pub fn register_pass(&mut self, name: &'static str, pass: HandlerPass) {
        self.passes.push((name, pass));
    }

    /// Enables per-pass debug logging through `tracing`; the host decides,
    /// there is no environment read here.
    pub fn set_debug(&mut self, debug: bool) {
        self.debug = debug;
    }

    /// Returns true if any pass changed any handler.
    pub fn run(&self, program: &mut IrProgram) -> bool {
        let mut any = false;
        for handler in program.handler_ids() {
            if self.debug {
                tracing::debug!(handler = %program.handler(handler).name, "optimizing handler");
            }
            any |= self.run_handler(program, handler);
        }
        any
    }

    fn run_handler(&self, program: &mut IrProgram, handler: HandlerId) -> bool {
        let mut any = false;
        loop {
            let mut changes = 0;
            for (name, pass) in &self.passes {
                if self.debug {
                    tracing::debug!(pass = name, "executing pass");
                }
                if pass(program, handler) {
                    if self.debug {
                        tracing::debug!(pass = name, "changes detected");
                    }
                    if let Err(message) = program.verify_handler(handler) {
                        panic!("IR verification failed after pass {}: {}", name, message);
                    }
                    changes += 1;
                }
            }
            if self.debug {
                tracing::debug!(changes, "sweep finished");
            }
            if changes == 0 {
                return any;
            }
            any = true;
        }
    }
}

impl Default for PassManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Removes non-entry blocks that consist of a single unconditional branch,
/// pointing their predecessors directly at the branch target.
pub fn eliminate_empty_blocks(program: &mut IrProgram, handler: HandlerId) -> bool {
    let mut changed = false;
    loop {
        let blocks = program.handler(handler).blocks().to_vec();
        let entry = blocks.first().copied();
        let mut removed = false;

        for &block in &blocks {
            if Some(block) == entry {
                continue;
            }
            let instrs = program.block(block).instrs();
            if instrs.len() != 1 {
                continue;
            }
            let only = instrs[0];
            if program.instr(only).kind != InstrKind::Br {
                continue;
            }
            let target = match program.instr(only).operands()[0] {
                Operand::Block(target) => target,
                _ => continue,
            };
            if target == block {
                continue;
            }

            program.replace_block_refs(block, target);
            program.remove_block(block);
            removed = true;
            changed = true;
            break;
        }

        if !removed {
            return changed;
        }
    }
}

/// Removes blocks unreachable from the entry block.
pub fn eliminate_unused_blocks(program: &mut IrProgram, handler: HandlerId) -> bool {
    let blocks = program.handler(handler).blocks().to_vec();
    let entry = match blocks.first() {
        Some(&entry) => entry,
        None => return false,
    };

    let mut reachable = HashSet::new();
    let mut worklist = vec![entry];
    while let Some(block) = worklist.pop() {
        if !reachable.insert(block) {
            continue;
        }
        for &succ in program.block(block).successors() {
            worklist.push(succ);
        }
    }

    let unreachable: Vec<BlockId> = blocks
        .iter()
        .copied()
        .filter(|b| !reachable.contains(b))
        .collect();
    if unreachable.is_empty() {
        return false;
    }

    // release all edges first so removal order does not matter
    for &block in &unreachable {
        for instr in program.block(block).instrs().to_vec() {
            program.clear_operands(instr);
        }
    }
    for &block in &unreachable {
        program.remove_block(block);
    }
    true
}

/// Inlines a successor that has exactly one predecessor into that
/// predecessor when the edge is an unconditional branch.
pub fn eliminate_linear_br(program: &mut IrProgram, handler: HandlerId) -> bool {
    let mut changed = false;
    loop {
        let blocks = program.handler(handler).blocks().to_vec();
        let entry = blocks.first().copied();
        let mut merged = false;

        for &block in &blocks {
            let term = match program.terminator(block) {
                Some(term) => term,
                None => continue,
            };
            if program.instr(term).kind != InstrKind::Br {
                continue;
            }
            let target = match program.instr(term).operands()[0] {
                Operand::Block(target) => target,
                _ => continue,
            };
            if target == block || Some(target) == entry {
                continue;
            }
            if program.block(target).predecessors() != [block] {
                continue;
            }

            program.remove_instr(term);
            program.transfer_block_contents(target, block);
            program.remove_block(target);
            merged = true;
            changed = true;
            break;
        }

        if !merged {
            return changed;
        }
    }
}

/// Drops pure instructions whose results have no users.
pub fn eliminate_unused_instr(program: &mut IrProgram, handler: HandlerId) -> bool {
    let mut changed = false;
    loop {
        let mut removed = false;
        for &block in &program.handler(handler).blocks().to_vec() {
            for instr in program.block(block).instrs().to_vec() {
                if program.instr(instr).kind.is_pure() && program.instr(instr).users().is_empty() {
                    program.remove_instr(instr);
                    removed = true;
                    changed = true;
                }
            }
        }
        if !removed {
            return changed;
        }
    }
}

/// Replaces a conditional branch on a constant boolean with an
/// unconditional branch to the taken side.
pub fn fold_constant_condbr(program: &mut IrProgram, handler: HandlerId) -> bool {
    let mut changed = false;
    for &block in &program.handler(handler).blocks().to_vec() {
        let term = match program.terminator(block) {
            Some(term) => term,
            None => continue,
        };
        if program.instr(term).kind != InstrKind::CondBr {
            continue;
        }
        let operands = program.instr(term).operands();
        let cond = operands[0];
        let (true_block, false_block) = (operands[1], operands[2]);

        let value = match cond {
            Operand::Const(id) => match program.constant(id).kind {
                ConstantKind::Boolean(value) => value,
                _ => continue,
            },
            _ => continue,
        };

        let taken = if value { true_block } else { false_block };
        program.rewrite_instr(term, InstrKind::Br, LiteralType::Void, vec![taken]);
        changed = true;
    }
    changed
}

/// Replaces a conditional branch whose two targets are the same block
/// with an unconditional branch.
pub fn rewrite_condbr_to_same_branches(program: &mut IrProgram, handler: HandlerId) -> bool {
    let mut changed = false;
    for &block in &program.handler(handler).blocks().to_vec() {
        let term = match program.terminator(block) {
            Some(term) => term,
            None => continue,
        };
        if program.instr(term).kind != InstrKind::CondBr {
            continue;
        }
        let operands = program.instr(term).operands();
        if operands[1] != operands[2] {
            continue;
        }
        let target = operands[1];
        program.rewrite_instr(term, InstrKind::Br, LiteralType::Void, vec![target]);
        changed = true;
    }
    changed
}

/// Rewrites a branch to a block that only returns a constant into that
/// return itself.
pub fn rewrite_br_to_exit(program: &mut IrProgram, handler: HandlerId) -> bool {
    let mut changed = false;
    for &block in &program.handler(handler).blocks().to_vec() {
        let term = match program.terminator(block) {
            Some(term) => term,
            None => continue,
        };
        if program.instr(term).kind != InstrKind::Br {
            continue;
        }
        let target = match program.instr(term).operands()[0] {
            Operand::Block(target) => target,
            _ => continue,
        };
        if target == block {
            continue;
        }
        let target_instrs = program.block(target).instrs();
        if target_instrs.len() != 1 {
            continue;
        }
        let ret = target_instrs[0];
        if program.instr(ret).kind != InstrKind::Ret {
            continue;
        }
        let result = match program.instr(ret).operands()[0] {
            Operand::Const(id) => Operand::Const(id),
            _ => continue,
        };

        program.rewrite_instr(term, InstrKind::Ret, LiteralType::Void, vec![result]);
        changed = true;
    }
    changed
}

/// Merges blocks whose instruction sequences and outgoing edges are
/// structurally identical.
pub fn merge_same_blocks(program: &mut IrProgram, handler: HandlerId) -> bool {
    let mut changed = false;
    loop {
        let blocks = program.handler(handler).blocks().to_vec();
        let mut merged = false;

        'outer: for i in 0..blocks.len() {
            for j in (i + 1)..blocks.len() {
                let (keep, dup) = (blocks[i], blocks[j]);
                if !blocks_structurally_equal(program, keep, dup) {
                    continue;
                }
                if !block_is_self_contained(program, dup) {
                    continue;
                }
                program.replace_block_refs(dup, keep);
                // now unreachable; drop its instructions and the block
                for instr in program.block(dup).instrs().to_vec() {
                    program.clear_operands(instr);
                }
                program.remove_block(dup);
                merged = true;
                changed = true;
                break 'outer;
            }
        }

        if !merged {
            return changed;
        }
    }
}

/// True when every value defined in the block is only used inside it, so
/// the block can be dropped without stranding users elsewhere.
fn block_is_self_contained(program: &IrProgram, block: BlockId) -> bool {
    let instrs: HashSet<_> = program.block(block).instrs().iter().copied().collect();
    instrs.iter().all(|&instr| {
        program
            .instr(instr)
            .users()
            .iter()
            .all(|user| instrs.contains(user))
    })
}

fn blocks_structurally_equal(program: &IrProgram, a: BlockId, b: BlockId) -> bool {
    let a_instrs = program.block(a).instrs();
    let b_instrs = program.block(b).instrs();
    if a_instrs.len() != b_instrs.len() {
        return false;
    }

    let local_index = |instrs: &[crate::ir::InstrId], id| instrs.iter().position(|&i| i == id);

    for (&ia, &ib) in a_instrs.iter().zip(b_instrs) {
        let instr_a = program.instr(ia);
        let instr_b = program.instr(ib);
        if instr_a.kind != instr_b.kind || instr_a.ty != instr_b.ty {
            return false;
        }
        if instr_a.operands().len() != instr_b.operands().len() {
            return false;
        }
        for (&op_a, &op_b) in instr_a.operands().iter().zip(instr_b.operands()) {
            let equal = match (op_a, op_b) {
                (Operand::Instr(va), Operand::Instr(vb)) => {
                    // local values must correspond positionally
                    match (local_index(a_instrs, va), local_index(b_instrs, vb)) {
                        (Some(pa), Some(pb)) => pa == pb,
                        _ => va == vb,
                    }
                }
                (a, b) => a == b,
            };
            if !equal {
                return false;
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{InstrKind, IrProgram, Operand};
    use crate::language::types::LiteralType;
    use crate::vm::instruction::Opcode;

    fn ret_false(program: &mut IrProgram, block: BlockId) {
        let value = program.get_boolean(false);
        program.append_instr(
            block,
            InstrKind::Ret,
            LiteralType::Void,
            vec![Operand::Const(value)],
            "",
        );
    }

    #[test]
    fn empty_block_is_bypassed() {
        let mut program = IrProgram::new();
        let handler = program.create_handler("h");
        let entry = program.create_block(handler, "entry");
        let hop = program.create_block(handler, "hop");
        let exit = program.create_block(handler, "exit");

        program.append_instr(entry, InstrKind::Br, LiteralType::Void, vec![Operand::Block(hop)], "");
        program.append_instr(hop, InstrKind::Br, LiteralType::Void, vec![Operand::Block(exit)], "");
        ret_false(&mut program, exit);

        assert!(eliminate_empty_blocks(&mut program, handler));
        assert!(program.verify_handler(handler).is_ok());
        assert_eq!(program.handler(handler).blocks().len(), 2);
        assert_eq!(program.block(entry).successors(), &[exit]);
        assert!(!eliminate_empty_blocks(&mut program, handler));
    }

    #[test]
    fn unreachable_blocks_are_dropped() {
        let mut program = IrProgram::new();
        let handler = program.create_handler("h");
        let entry = program.create_block(handler, "entry");
        let orphan = program.create_block(handler, "orphan");
        ret_false(&mut program, entry);
        ret_false(&mut program, orphan);

        assert!(eliminate_unused_blocks(&mut program, handler));
        assert!(program.verify_handler(handler).is_ok());
        assert_eq!(program.handler(handler).blocks().len(), 1);
    }

    #[test]
    fn singleton_successor_is_inlined() {
        let mut program = IrProgram::new();
        let handler = program.create_handler("h");
        let entry = program.create_block(handler, "entry");
        let next = program.create_block(handler, "next");
        program.append_instr(entry, InstrKind::Br, LiteralType::Void, vec![Operand::Block(next)], "");
        ret_false(&mut program, next);

        assert!(eliminate_linear_br(&mut program, handler));
        assert!(program.verify_handler(handler).is_ok());
        assert_eq!(program.handler(handler).blocks().len(), 1);
        let entry_instrs = program.block(entry).instrs();
        assert_eq!(entry_instrs.len(), 1);
        assert_eq!(program.instr(entry_instrs[0]).kind, InstrKind::Ret);
    }

    #[test]
    fn unused_pure_instructions_are_removed() {
        let mut program = IrProgram::new();
        let handler = program.create_handler("h");
        let entry = program.create_block(handler, "entry");
        let one = program.get_number(1);
        let two = program.get_number(2);
        program.append_instr(
            entry,
            InstrKind::Binary(Opcode::NADD),
            LiteralType::Number,
            vec![Operand::Const(one), Operand::Const(two)],
            "dead",
        );
        ret_false(&mut program, entry);

        assert!(eliminate_unused_instr(&mut program, handler));
        assert!(program.verify_handler(handler).is_ok());
        assert_eq!(program.block(entry).instrs().len(), 1);
    }

    #[test]
    fn constant_condbr_folds_to_br() {
        let mut program = IrProgram::new();
        let handler = program.create_handler("h");
        let entry = program.create_block(handler, "entry");
        let yes = program.create_block(handler, "yes");
        let no = program.create_block(handler, "no");
        let cond = program.get_boolean(true);
        program.append_instr(
            entry,
            InstrKind::CondBr,
            LiteralType::Void,
            vec![Operand::Const(cond), Operand::Block(yes), Operand::Block(no)],
            "",
        );
        ret_false(&mut program, yes);
        ret_false(&mut program, no);

        assert!(fold_constant_condbr(&mut program, handler));
        assert!(program.verify_handler(handler).is_ok());
        assert_eq!(program.block(entry).successors(), &[yes]);
        assert!(program.block(no).predecessors().is_empty());
    }

    #[test]
    fn condbr_with_identical_targets_becomes_br() {
        let mut program = IrProgram::new();
        let handler = program.create_handler("h");
        let entry = program.create_block(handler, "entry");
        let next = program.create_block(handler, "next");
        let one = program.get_number(1);
        let cond_slot = program.append_instr(
            entry,
            InstrKind::Alloca,
            LiteralType::Boolean,
            vec![Operand::Const(one)],
            "c",
        );
        let cond = program.append_instr(
            entry,
            InstrKind::Load,
            LiteralType::Boolean,
            vec![Operand::Instr(cond_slot)],
            "c.load",
        );
        program.append_instr(
            entry,
            InstrKind::CondBr,
            LiteralType::Void,
            vec![
                Operand::Instr(cond),
                Operand::Block(next),
                Operand::Block(next),
            ],
            "",
        );
        ret_false(&mut program, next);

        assert!(rewrite_condbr_to_same_branches(&mut program, handler));
        assert!(program.verify_handler(handler).is_ok());
        assert_eq!(program.block(entry).successors(), &[next]);
    }

    #[test]
    fn branch_to_constant_return_is_rewritten() {
        let mut program = IrProgram::new();
        let handler = program.create_handler("h");
        let entry = program.create_block(handler, "entry");
        let exit = program.create_block(handler, "exit");
        program.append_instr(entry, InstrKind::Br, LiteralType::Void, vec![Operand::Block(exit)], "");
        ret_false(&mut program, exit);

        assert!(rewrite_br_to_exit(&mut program, handler));
        assert!(program.verify_handler(handler).is_ok());
        let term = program.terminator(entry).unwrap();
        assert_eq!(program.instr(term).kind, InstrKind::Ret);
    }

    #[test]
    fn identical_blocks_merge() {
        let mut program = IrProgram::new();
        let handler = program.create_handler("h");
        let entry = program.create_block(handler, "entry");
        let a = program.create_block(handler, "a");
        let b = program.create_block(handler, "b");
        let one = program.get_number(1);
        let cond_slot = program.append_instr(
            entry,
            InstrKind::Alloca,
            LiteralType::Boolean,
            vec![Operand::Const(one)],
            "c",
        );
        let cond = program.append_instr(
            entry,
            InstrKind::Load,
            LiteralType::Boolean,
            vec![Operand::Instr(cond_slot)],
            "c.load",
        );
        program.append_instr(
            entry,
            InstrKind::CondBr,
            LiteralType::Void,
            vec![Operand::Instr(cond), Operand::Block(a), Operand::Block(b)],
            "",
        );
        ret_false(&mut program, a);
        ret_false(&mut program, b);

        assert!(merge_same_blocks(&mut program, handler));
        assert!(program.verify_handler(handler).is_ok());
        assert_eq!(program.handler(handler).blocks().len(), 2);
    }

    #[test]
    fn pass_manager_reaches_a_fixed_point() {
        let mut program = IrProgram::new();
        let handler = program.create_handler("h");
        let entry = program.create_block(handler, "entry");
        let hop = program.create_block(handler, "hop");
        let exit = program.create_block(handler, "exit");
        program.append_instr(entry, InstrKind::Br, LiteralType::Void, vec![Operand::Block(hop)], "");
        program.append_instr(hop, InstrKind::Br, LiteralType::Void, vec![Operand::Block(exit)], "");
        ret_false(&mut program, exit);

        let pm = PassManager::with_optimization_level(1);
        assert!(pm.run(&mut program));
        assert!(!pm.run(&mut program));
        assert!(program.verify_handler(handler).is_ok());
    }
}
