//! Small instruction-emission helpers shared by the annotation passes.

use prism_spirv::{Editor, Id, Instruction, Op};

/// An instruction sequence under construction, spliced into a function body
/// once complete.
#[derive(Debug, Default)]
pub struct Body {
    insts: Vec<Instruction>,
}

impl Body {
    pub fn new() -> Body {
        Body::default()
    }

    pub fn instructions(self) -> Vec<Instruction> {
        self.insts
    }

    pub fn len(&self) -> usize {
        self.insts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.insts.is_empty()
    }

    pub fn push(&mut self, inst: Instruction) {
        self.insts.push(inst);
    }

    /// Emits an instruction with a result type and a freshly allocated result
    /// id, returning the id.
    pub fn emit(&mut self, ed: &mut Editor, op: Op, result_type: Id, operands: &[u32]) -> Id {
        let result = ed.alloc_id();
        let mut words = vec![result_type.0, result.0];
        words.extend_from_slice(operands);
        self.insts.push(Instruction::new(op, &words));
        result
    }

    /// Emits an instruction without a result (stores, branches, barriers).
    pub fn emit_no_result(&mut self, op: Op, operands: &[u32]) {
        self.insts.push(Instruction::new(op, operands));
    }

    pub fn label(&mut self, ed: &mut Editor) -> Id {
        let id = ed.alloc_id();
        self.insts.push(Instruction::new(Op::LABEL, &[id.0]));
        id
    }

    pub fn load(&mut self, ed: &mut Editor, ty: Id, pointer: Id) -> Id {
        self.emit(ed, Op::LOAD, ty, &[pointer.0])
    }

    pub fn store(&mut self, pointer: Id, value: Id) {
        self.emit_no_result(Op::STORE, &[pointer.0, value.0]);
    }

    pub fn access_chain(&mut self, ed: &mut Editor, ptr_ty: Id, base: Id, indices: &[Id]) -> Id {
        let mut operands = vec![base.0];
        operands.extend(indices.iter().map(|i| i.0));
        self.emit(ed, Op::ACCESS_CHAIN, ptr_ty, &operands)
    }

    pub fn binop(&mut self, ed: &mut Editor, op: Op, ty: Id, a: Id, b: Id) -> Id {
        self.emit(ed, op, ty, &[a.0, b.0])
    }

    /// `GLSL.std.450` extended instruction call.
    pub fn ext_inst(&mut self, ed: &mut Editor, ty: Id, inst: u32, args: &[Id]) -> Id {
        let set = ed.glsl450_import();
        let mut operands = vec![set.0, inst];
        operands.extend(args.iter().map(|a| a.0));
        self.emit(ed, Op::EXT_INST, ty, &operands)
    }
}
