//! SPIR-V module container: parse, section model, serialize.
//!
//! The input is treated as **untrusted**: every word count is validated and
//! parsing never panics on malformed data. Instructions the editor does not
//! recognize are preserved verbatim; the opcode number alone is enough to
//! classify an instruction into the correct logical section.

use crate::error::SpirvError;
use crate::opcode::{ExecutionModel, Op};
use core::fmt;

pub const SPIRV_MAGIC: u32 = 0x0723_0203;

/// Result/operand id inside one module.
///
/// Ids are globally unique for the module's lifetime; the editor allocates
/// fresh ids by bumping the header bound and never reuses a freed id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Id(pub u32);

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

/// One instruction, stored as its raw word sequence.
///
/// `words[0]` packs `(word_count << 16) | opcode` and is kept in sync with
/// `words.len()` by every mutator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    words: Vec<u32>,
}

impl Instruction {
    pub fn new(op: Op, operands: &[u32]) -> Instruction {
        let mut words = Vec::with_capacity(1 + operands.len());
        words.push(0);
        words.extend_from_slice(operands);
        let mut inst = Instruction { words };
        inst.words[0] = inst.pack_first_word(op);
        inst
    }

    fn pack_first_word(&self, op: Op) -> u32 {
        ((self.words.len() as u32) << 16) | op.0 as u32
    }

    pub fn op(&self) -> Op {
        Op((self.words[0] & 0xffff) as u16)
    }

    pub fn words(&self) -> &[u32] {
        &self.words
    }

    /// Operands, excluding the leading `(count, opcode)` word.
    pub fn operands(&self) -> &[u32] {
        &self.words[1..]
    }

    pub fn operand(&self, index: usize) -> Option<u32> {
        self.words.get(1 + index).copied()
    }

    pub fn set_operand(&mut self, index: usize, value: u32) {
        self.words[1 + index] = value;
    }

    pub fn push_operand(&mut self, value: u32) {
        let op = self.op();
        self.words.push(value);
        self.words[0] = self.pack_first_word(op);
    }

    /// Replaces the operand list wholesale, keeping the opcode.
    pub fn set_operands(&mut self, operands: &[u32]) {
        let op = self.op();
        self.words.truncate(1);
        self.words.extend_from_slice(operands);
        self.words[0] = self.pack_first_word(op);
    }

    /// `(has_result_type, has_result_id)` for opcodes the editor knows.
    ///
    /// Returns `None` for unrecognized opcodes, which are treated as opaque.
    pub fn result_shape(op: Op) -> Option<(bool, bool)> {
        Some(match op {
            o if o.is_type_decl() => (false, true),
            o if o.is_constant_decl() => (true, true),
            Op::UNDEF
            | Op::EXT_INST
            | Op::FUNCTION
            | Op::FUNCTION_PARAMETER
            | Op::FUNCTION_CALL
            | Op::VARIABLE
            | Op::LOAD
            | Op::ACCESS_CHAIN
            | Op::IN_BOUNDS_ACCESS_CHAIN
            | Op::PTR_ACCESS_CHAIN
            | Op::ARRAY_LENGTH
            | Op::VECTOR_SHUFFLE
            | Op::COMPOSITE_CONSTRUCT
            | Op::COMPOSITE_EXTRACT
            | Op::COMPOSITE_INSERT
            | Op::COPY_OBJECT
            | Op::PHI
            | Op::SELECT => (true, true),
            o if (Op::CONVERT_F_TO_U.0..=Op::BITCAST.0).contains(&o.0) => (true, true),
            o if (Op::S_NEGATE.0..=Op::U_MOD.0).contains(&o.0) => (true, true),
            o if (Op::LOGICAL_OR.0..=Op::F_ORD_GREATER_THAN.0).contains(&o.0) => (true, true),
            o if (Op::SHIFT_RIGHT_LOGICAL.0..=Op::BIT_FIELD_U_EXTRACT.0).contains(&o.0) => {
                (true, true)
            }
            Op::ATOMIC_LOAD
            | Op::ATOMIC_EXCHANGE
            | Op::ATOMIC_I_ADD
            | Op::ATOMIC_U_MAX
            | Op::ATOMIC_AND
            | Op::ATOMIC_OR
            | Op::ATOMIC_XOR => (true, true),
            Op::STRING | Op::EXT_INST_IMPORT | Op::LABEL | Op::DECORATION_GROUP => (false, true),
            Op::NOP
            | Op::SOURCE
            | Op::SOURCE_CONTINUED
            | Op::SOURCE_EXTENSION
            | Op::NAME
            | Op::MEMBER_NAME
            | Op::LINE
            | Op::EXTENSION
            | Op::MEMORY_MODEL
            | Op::ENTRY_POINT
            | Op::EXECUTION_MODE
            | Op::EXECUTION_MODE_ID
            | Op::CAPABILITY
            | Op::FUNCTION_END
            | Op::STORE
            | Op::DECORATE
            | Op::DECORATE_ID
            | Op::MEMBER_DECORATE
            | Op::GROUP_DECORATE
            | Op::GROUP_MEMBER_DECORATE
            | Op::CONTROL_BARRIER
            | Op::MEMORY_BARRIER
            | Op::ATOMIC_STORE
            | Op::LOOP_MERGE
            | Op::SELECTION_MERGE
            | Op::BRANCH
            | Op::BRANCH_CONDITIONAL
            | Op::SWITCH
            | Op::RETURN
            | Op::RETURN_VALUE
            | Op::UNREACHABLE
            | Op::SET_MESH_OUTPUTS_EXT
            | Op::EMIT_MESH_TASKS_EXT => (false, false),
            _ => return None,
        })
    }

    /// Result id of this instruction, if its opcode is known to produce one.
    pub fn result_id(&self) -> Option<Id> {
        let (has_type, has_result) = Self::result_shape(self.op())?;
        if !has_result {
            return None;
        }
        let index = if has_type { 1 } else { 0 };
        self.operand(index).map(Id)
    }

    /// Result type id, if the opcode carries one.
    pub fn result_type(&self) -> Option<Id> {
        let (has_type, _) = Self::result_shape(self.op())?;
        if !has_type {
            return None;
        }
        self.operand(0).map(Id)
    }

    /// Decodes a nul-terminated UTF-8 literal starting at `operand_index`.
    ///
    /// Returns the string and the operand index just past the literal.
    pub fn decode_string(&self, operand_index: usize) -> Option<(String, usize)> {
        let mut bytes = Vec::new();
        let mut index = operand_index;
        loop {
            let word = self.operand(index)?;
            index += 1;
            for b in word.to_le_bytes() {
                if b == 0 {
                    let s = String::from_utf8(bytes).ok()?;
                    return Some((s, index));
                }
                bytes.push(b);
            }
        }
    }

    /// Encodes `s` as SPIR-V literal words (nul-terminated, little-endian).
    pub fn encode_string(s: &str) -> Vec<u32> {
        let bytes = s.as_bytes();
        let mut words = Vec::with_capacity(bytes.len() / 4 + 1);
        for chunk in bytes.chunks(4) {
            let mut w = [0u8; 4];
            w[..chunk.len()].copy_from_slice(chunk);
            words.push(u32::from_le_bytes(w));
        }
        // The terminating nul needs its own word when the string length is a
        // multiple of four.
        if bytes.len() % 4 == 0 {
            words.push(0);
        }
        words
    }
}

/// Logical sections of a module, in required order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Section {
    Capabilities,
    Extensions,
    ExtInstImports,
    MemoryModel,
    EntryPoints,
    ExecutionModes,
    Debug,
    Annotations,
    TypesConstantsGlobals,
}

impl Section {
    /// Section an instruction belongs to when it appears before the first
    /// function. Unknown opcodes land in types/constants/globals, which keeps
    /// their original relative order intact on round trip.
    pub fn classify(op: Op) -> Section {
        match op {
            Op::CAPABILITY => Section::Capabilities,
            Op::EXTENSION => Section::Extensions,
            Op::EXT_INST_IMPORT => Section::ExtInstImports,
            Op::MEMORY_MODEL => Section::MemoryModel,
            Op::ENTRY_POINT => Section::EntryPoints,
            Op::EXECUTION_MODE | Op::EXECUTION_MODE_ID => Section::ExecutionModes,
            Op::STRING
            | Op::SOURCE
            | Op::SOURCE_CONTINUED
            | Op::SOURCE_EXTENSION
            | Op::NAME
            | Op::MEMBER_NAME
            | Op::LINE => Section::Debug,
            Op::DECORATE
            | Op::DECORATE_ID
            | Op::MEMBER_DECORATE
            | Op::DECORATION_GROUP
            | Op::GROUP_DECORATE
            | Op::GROUP_MEMBER_DECORATE => Section::Annotations,
            _ => Section::TypesConstantsGlobals,
        }
    }
}

/// An entry point declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryPoint {
    pub execution_model: ExecutionModel,
    pub function: Id,
    pub name: String,
    /// Interface variable ids listed on the `OpEntryPoint`.
    pub interface: Vec<Id>,
}

/// A parsed SPIR-V module.
///
/// The instruction stream is split into the pre-function preamble (sections
/// up to and including types/constants/globals, original order preserved) and
/// the flat function stream (`OpFunction .. OpFunctionEnd` runs).
#[derive(Debug, Clone)]
pub struct Module {
    pub version: u32,
    pub generator: u32,
    id_bound: u32,
    pub schema: u32,
    preamble: Vec<Instruction>,
    functions: Vec<Instruction>,
}

impl Module {
    /// Parses a module from its word stream.
    pub fn parse(words: &[u32]) -> Result<Module, SpirvError> {
        if words.len() < 5 {
            return Err(SpirvError::MalformedHeader {
                context: format!("need at least 5 header words, got {}", words.len()),
            });
        }
        if words[0] != SPIRV_MAGIC {
            return Err(SpirvError::MalformedHeader {
                context: format!("bad magic {:#010x}, expected {:#010x}", words[0], SPIRV_MAGIC),
            });
        }
        let version = words[1];
        let generator = words[2];
        let id_bound = words[3];
        let schema = words[4];

        let mut preamble = Vec::new();
        let mut functions = Vec::new();
        let mut in_functions = false;

        let mut offset = 5usize;
        while offset < words.len() {
            let first = words[offset];
            let count = (first >> 16) as usize;
            let op = Op((first & 0xffff) as u16);
            if count == 0 {
                return Err(SpirvError::MalformedInstruction {
                    offset,
                    context: "zero word count".to_string(),
                });
            }
            let end = offset.checked_add(count).ok_or_else(|| {
                SpirvError::MalformedInstruction {
                    offset,
                    context: format!("word count {count} overflows stream offset"),
                }
            })?;
            if end > words.len() {
                return Err(SpirvError::MalformedInstruction {
                    offset,
                    context: format!(
                        "instruction at {offset} declares {count} words, {} remain",
                        words.len() - offset
                    ),
                });
            }
            let inst = Instruction {
                words: words[offset..end].to_vec(),
            };
            if op == Op::FUNCTION {
                in_functions = true;
            }
            if in_functions {
                functions.push(inst);
            } else {
                preamble.push(inst);
            }
            offset = end;
        }

        Ok(Module {
            version,
            generator,
            id_bound,
            schema,
            preamble,
            functions,
        })
    }

    /// Serializes the module back to a word stream.
    pub fn words(&self) -> Vec<u32> {
        let body_len: usize = self
            .preamble
            .iter()
            .chain(self.functions.iter())
            .map(|i| i.words.len())
            .sum();
        let mut out = Vec::with_capacity(5 + body_len);
        out.push(SPIRV_MAGIC);
        out.push(self.version);
        out.push(self.generator);
        out.push(self.id_bound);
        out.push(self.schema);
        for inst in self.preamble.iter().chain(self.functions.iter()) {
            out.extend_from_slice(&inst.words);
        }
        out
    }

    pub fn id_bound(&self) -> u32 {
        self.id_bound
    }

    /// Allocates a fresh id, bumping the module bound.
    pub fn alloc_id(&mut self) -> Id {
        let id = self.id_bound;
        self.id_bound += 1;
        Id(id)
    }

    pub fn preamble(&self) -> &[Instruction] {
        &self.preamble
    }

    pub fn preamble_mut(&mut self) -> &mut Vec<Instruction> {
        &mut self.preamble
    }

    pub fn functions(&self) -> &[Instruction] {
        &self.functions
    }

    pub fn functions_mut(&mut self) -> &mut Vec<Instruction> {
        &mut self.functions
    }

    /// Inserts `inst` at the end of `section`, before any later section.
    ///
    /// Dependencies of a types/constants/globals declaration always precede
    /// it, so appending at the section tail keeps forward references legal.
    pub fn insert_in_section(&mut self, section: Section, inst: Instruction) {
        let mut insert_at = self.preamble.len();
        // Walk backwards to the last instruction whose section sorts at or
        // before the requested one.
        for (index, existing) in self.preamble.iter().enumerate().rev() {
            if Section::classify(existing.op()) <= section {
                insert_at = index + 1;
                break;
            }
            insert_at = index;
        }
        self.preamble.insert(insert_at, inst);
    }

    /// All entry points declared by the module.
    pub fn entry_points(&self) -> Vec<EntryPoint> {
        let mut out = Vec::new();
        for inst in &self.preamble {
            if inst.op() != Op::ENTRY_POINT {
                continue;
            }
            let Some(model) = inst.operand(0).and_then(ExecutionModel::from_u32) else {
                continue;
            };
            let Some(function) = inst.operand(1).map(Id) else {
                continue;
            };
            let Some((name, next)) = inst.decode_string(2) else {
                continue;
            };
            let interface = inst.operands()[next.min(inst.operands().len())..]
                .iter()
                .map(|&w| Id(w))
                .collect();
            out.push(EntryPoint {
                execution_model: model,
                function,
                name,
                interface,
            });
        }
        out
    }

    /// Index range `[start, end)` into the function stream covering the body
    /// of the function with result id `function`, if present.
    pub fn function_range(&self, function: Id) -> Option<(usize, usize)> {
        let mut start = None;
        for (index, inst) in self.functions.iter().enumerate() {
            match inst.op() {
                Op::FUNCTION if inst.result_id() == Some(function) => start = Some(index),
                Op::FUNCTION_END => {
                    if let Some(s) = start {
                        return Some((s, index + 1));
                    }
                }
                _ => {}
            }
        }
        None
    }

    /// Returns a human-readable summary of the module's sections.
    pub fn debug_summary(&self) -> String {
        use core::fmt::Write as _;
        let mut out = String::new();
        let _ = write!(
            &mut out,
            "spirv version={:#x} bound={} preamble={} function_words={}",
            self.version,
            self.id_bound,
            self.preamble.len(),
            self.functions.iter().map(|i| i.words.len()).sum::<usize>()
        );
        for ep in self.entry_points() {
            let _ = write!(
                &mut out,
                "\n  entry {:?} {} \"{}\" interface={}",
                ep.execution_model,
                ep.function,
                ep.name,
                ep.interface.len()
            );
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_bad_magic_and_truncation() {
        assert!(Module::parse(&[0xdead_beef, 0, 0, 0, 0]).is_err());
        assert!(Module::parse(&[SPIRV_MAGIC, 0x0001_0300, 0]).is_err());
        // Instruction declaring more words than remain.
        let words = [SPIRV_MAGIC, 0x0001_0300, 0, 10, 0, (5 << 16) | 17];
        assert!(Module::parse(&words).is_err());
        // Zero word count must not loop forever.
        let words = [SPIRV_MAGIC, 0x0001_0300, 0, 10, 0, 17];
        assert!(Module::parse(&words).is_err());
    }

    #[test]
    fn string_literal_round_trip() {
        for s in ["main", "abc", "abcd", "", "post_vs_fetch"] {
            let words = Instruction::encode_string(s);
            let mut operands = vec![7];
            operands.extend_from_slice(&words);
            let inst = Instruction::new(Op::NAME, &operands);
            let (decoded, next) = inst.decode_string(1).expect("decodes");
            assert_eq!(decoded, s);
            assert_eq!(next, 1 + words.len());
        }
    }

    #[test]
    fn parse_serialize_round_trip_preserves_words() {
        // A tiny but well-formed module: capability, memory model, entry
        // point, void type, fn type, and an empty function.
        let mut words = vec![SPIRV_MAGIC, 0x0001_0300, 0, 8, 0];
        let push = |words: &mut Vec<u32>, op: u16, operands: &[u32]| {
            words.push((((operands.len() + 1) as u32) << 16) | op as u32);
            words.extend_from_slice(operands);
        };
        push(&mut words, 17, &[1]); // OpCapability Shader
        push(&mut words, 14, &[0, 1]); // OpMemoryModel Logical GLSL450
        push(&mut words, 15, &[5, 4, u32::from_le_bytes(*b"main"), 0]); // OpEntryPoint GLCompute %4 "main"
        push(&mut words, 19, &[2]); // %2 = OpTypeVoid
        push(&mut words, 33, &[3, 2]); // %3 = OpTypeFunction %2
        push(&mut words, 54, &[2, 4, 0, 3]); // %4 = OpFunction
        push(&mut words, 248, &[5]); // OpLabel
        push(&mut words, 253, &[]); // OpReturn
        push(&mut words, 56, &[]); // OpFunctionEnd

        let module = Module::parse(&words).expect("parses");
        assert_eq!(module.words(), words);

        let eps = module.entry_points();
        assert_eq!(eps.len(), 1);
        assert_eq!(eps[0].execution_model, ExecutionModel::GLCompute);
        assert_eq!(eps[0].function, Id(4));
        assert_eq!(eps[0].name, "main");
        assert_eq!(module.function_range(Id(4)), Some((0, 4)));
    }

    #[test]
    fn section_insertion_keeps_order() {
        let mut words = vec![SPIRV_MAGIC, 0x0001_0300, 0, 8, 0];
        let push = |words: &mut Vec<u32>, op: u16, operands: &[u32]| {
            words.push((((operands.len() + 1) as u32) << 16) | op as u32);
            words.extend_from_slice(operands);
        };
        push(&mut words, 17, &[1]);
        push(&mut words, 14, &[0, 1]);
        push(&mut words, 19, &[2]);
        let mut module = Module::parse(&words).expect("parses");

        module.insert_in_section(Section::Capabilities, Instruction::new(Op::CAPABILITY, &[11]));
        module.insert_in_section(
            Section::Extensions,
            Instruction::new(
                Op::EXTENSION,
                &Instruction::encode_string("SPV_KHR_whatever"),
            ),
        );

        let ops: Vec<Op> = module.preamble().iter().map(|i| i.op()).collect();
        assert_eq!(
            ops,
            vec![
                Op::CAPABILITY,
                Op::CAPABILITY,
                Op::EXTENSION,
                Op::MEMORY_MODEL,
                Op::TYPE_VOID
            ]
        );
    }
}
