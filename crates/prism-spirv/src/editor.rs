//! In-place module editor: id allocation, type/constant deduplication,
//! section-aware insertion, operand patching.
//!
//! The editor assumes the source module is well-formed; an id lookup that
//! fails is an internal-consistency error ([`SpirvError::UnknownId`]), not a
//! user-input error. Transforms abort on it and the caller surfaces a status
//! string instead of crashing.

use crate::error::SpirvError;
use crate::module::{Id, Instruction, Module, Section};
use crate::opcode::{decoration, Op, StorageClass};
use std::collections::{HashMap, HashSet};

/// Structural identity of a type declaration.
///
/// Decorations are attached out-of-band and are not part of type identity,
/// with two deliberate exceptions that affect the memory contract between the
/// GPU-side writer and the CPU-side reader: array strides and struct member
/// offsets. The same inner type may need two different strides for two
/// different storage locations, so each stride gets its own declaration.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeDesc {
    Void,
    Bool,
    Int { width: u32, signed: bool },
    Float { width: u32 },
    Vector { component: Id, count: u32 },
    Matrix { column: Id, count: u32 },
    Array { element: Id, length: Id, stride: Option<u32> },
    RuntimeArray { element: Id, stride: Option<u32> },
    Struct { members: Vec<Id>, offsets: Option<Vec<u32>>, block: bool },
    Pointer { storage_class: u32, pointee: Id },
    Function { return_type: Id, params: Vec<Id> },
    /// Image/sampler and other declarations the layout passes never recurse
    /// into; identity is the raw operand list.
    Opaque { op: u16, operands: Vec<u32> },
}

/// A declared (spec-)constant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConstInfo {
    pub op: Op,
    pub ty: Id,
    /// Value words (1 for 32-bit scalars, 2 for 64-bit; component ids for
    /// composites).
    pub words: Vec<u32>,
    pub spec_id: Option<u32>,
}

impl ConstInfo {
    /// Scalar integer value, when this is a 32- or 64-bit scalar constant.
    pub fn scalar_u64(&self) -> Option<u64> {
        match (self.op, self.words.as_slice()) {
            (Op::CONSTANT | Op::SPEC_CONSTANT, [lo]) => Some(*lo as u64),
            (Op::CONSTANT | Op::SPEC_CONSTANT, [lo, hi]) => {
                Some((*lo as u64) | ((*hi as u64) << 32))
            }
            (Op::CONSTANT_TRUE | Op::SPEC_CONSTANT_TRUE, _) => Some(1),
            (Op::CONSTANT_FALSE | Op::SPEC_CONSTANT_FALSE, _) => Some(0),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ConstKey {
    op: u16,
    ty: Id,
    words: Vec<u32>,
    spec_id: Option<u32>,
}

/// Specialization-constant overrides, keyed by `SpecId`.
#[derive(Debug, Clone, Default)]
pub struct SpecValues {
    values: HashMap<u32, u64>,
}

impl SpecValues {
    pub fn new() -> SpecValues {
        SpecValues::default()
    }

    pub fn set(&mut self, spec_id: u32, value: u64) -> &mut SpecValues {
        self.values.insert(spec_id, value);
        self
    }

    pub fn get(&self, spec_id: u32) -> Option<u64> {
        self.values.get(&spec_id).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, u64)> + '_ {
        self.values.iter().map(|(&id, &value)| (id, value))
    }
}

/// Mutable module editor with type/constant caches.
pub struct Editor {
    module: Module,
    types: HashMap<Id, TypeDesc>,
    type_cache: HashMap<TypeDesc, Id>,
    constants: HashMap<Id, ConstInfo>,
    constant_cache: HashMap<ConstKey, Id>,
    capabilities: HashSet<u32>,
    extensions: HashSet<String>,
    glsl450: Option<Id>,
}

impl Editor {
    pub fn new(module: Module) -> Editor {
        let mut editor = Editor {
            module,
            types: HashMap::new(),
            type_cache: HashMap::new(),
            constants: HashMap::new(),
            constant_cache: HashMap::new(),
            capabilities: HashSet::new(),
            extensions: HashSet::new(),
            glsl450: None,
        };
        editor.rebuild_tables();
        editor
    }

    pub fn module(&self) -> &Module {
        &self.module
    }

    pub fn module_mut(&mut self) -> &mut Module {
        &mut self.module
    }

    pub fn finish(self) -> Module {
        self.module
    }

    pub fn alloc_id(&mut self) -> Id {
        self.module.alloc_id()
    }

    /// Rebuilds the type/constant tables from the preamble.
    ///
    /// This is the post-modify resync: any in-place edit of a declaration or
    /// annotation instruction (word counts included) invalidates the cached
    /// view, and this recomputes it from scratch.
    pub fn rebuild_tables(&mut self) {
        self.types.clear();
        self.type_cache.clear();
        self.constants.clear();
        self.constant_cache.clear();
        self.capabilities.clear();
        self.extensions.clear();
        self.glsl450 = None;

        // Decorations first; array strides and member offsets participate in
        // type identity.
        let mut array_strides: HashMap<Id, u32> = HashMap::new();
        let mut member_offsets: HashMap<Id, Vec<(u32, u32)>> = HashMap::new();
        let mut blocks: HashSet<Id> = HashSet::new();
        let mut spec_ids: HashMap<Id, u32> = HashMap::new();
        for inst in self.module.preamble() {
            match inst.op() {
                Op::DECORATE => {
                    let (Some(target), Some(dec)) = (inst.operand(0), inst.operand(1)) else {
                        continue;
                    };
                    match dec {
                        decoration::ARRAY_STRIDE => {
                            if let Some(stride) = inst.operand(2) {
                                array_strides.insert(Id(target), stride);
                            }
                        }
                        decoration::BLOCK | decoration::BUFFER_BLOCK => {
                            blocks.insert(Id(target));
                        }
                        decoration::SPEC_ID => {
                            if let Some(spec_id) = inst.operand(2) {
                                spec_ids.insert(Id(target), spec_id);
                            }
                        }
                        _ => {}
                    }
                }
                Op::MEMBER_DECORATE => {
                    let (Some(target), Some(member), Some(dec)) =
                        (inst.operand(0), inst.operand(1), inst.operand(2))
                    else {
                        continue;
                    };
                    if dec == decoration::OFFSET {
                        if let Some(offset) = inst.operand(3) {
                            member_offsets
                                .entry(Id(target))
                                .or_default()
                                .push((member, offset));
                        }
                    }
                }
                _ => {}
            }
        }

        for inst in self.module.preamble() {
            let op = inst.op();
            if op == Op::CAPABILITY {
                if let Some(cap) = inst.operand(0) {
                    self.capabilities.insert(cap);
                }
                continue;
            }
            if op == Op::EXTENSION {
                if let Some((name, _)) = inst.decode_string(0) {
                    self.extensions.insert(name);
                }
                continue;
            }
            if op == Op::EXT_INST_IMPORT {
                if let (Some(result), Some((name, _))) = (inst.operand(0), inst.decode_string(1)) {
                    if name == "GLSL.std.450" {
                        self.glsl450 = Some(Id(result));
                    }
                }
                continue;
            }
            if op.is_type_decl() {
                let Some(result) = inst.operand(0).map(Id) else {
                    continue;
                };
                let desc = Self::decode_type(
                    inst,
                    array_strides.get(&result).copied(),
                    member_offsets.get(&result),
                    blocks.contains(&result),
                );
                self.type_cache.entry(desc.clone()).or_insert(result);
                self.types.insert(result, desc);
                continue;
            }
            if op.is_constant_decl() {
                let (Some(ty), Some(result)) = (inst.operand(0), inst.operand(1)) else {
                    continue;
                };
                let info = ConstInfo {
                    op,
                    ty: Id(ty),
                    words: inst.operands()[2..].to_vec(),
                    spec_id: spec_ids.get(&Id(result)).copied(),
                };
                let key = ConstKey {
                    op: op.0,
                    ty: info.ty,
                    words: info.words.clone(),
                    spec_id: info.spec_id,
                };
                self.constant_cache.entry(key).or_insert(Id(result));
                self.constants.insert(Id(result), info);
            }
        }
    }

    fn decode_type(
        inst: &Instruction,
        array_stride: Option<u32>,
        member_offsets: Option<&Vec<(u32, u32)>>,
        block: bool,
    ) -> TypeDesc {
        let ops = inst.operands();
        match inst.op() {
            Op::TYPE_VOID => TypeDesc::Void,
            Op::TYPE_BOOL => TypeDesc::Bool,
            Op::TYPE_INT => TypeDesc::Int {
                width: ops.get(1).copied().unwrap_or(32),
                signed: ops.get(2).copied().unwrap_or(0) != 0,
            },
            Op::TYPE_FLOAT => TypeDesc::Float {
                width: ops.get(1).copied().unwrap_or(32),
            },
            Op::TYPE_VECTOR => TypeDesc::Vector {
                component: Id(ops.get(1).copied().unwrap_or(0)),
                count: ops.get(2).copied().unwrap_or(0),
            },
            Op::TYPE_MATRIX => TypeDesc::Matrix {
                column: Id(ops.get(1).copied().unwrap_or(0)),
                count: ops.get(2).copied().unwrap_or(0),
            },
            Op::TYPE_ARRAY => TypeDesc::Array {
                element: Id(ops.get(1).copied().unwrap_or(0)),
                length: Id(ops.get(2).copied().unwrap_or(0)),
                stride: array_stride,
            },
            Op::TYPE_RUNTIME_ARRAY => TypeDesc::RuntimeArray {
                element: Id(ops.get(1).copied().unwrap_or(0)),
                stride: array_stride,
            },
            Op::TYPE_STRUCT => {
                let members: Vec<Id> = ops[1..].iter().map(|&w| Id(w)).collect();
                let offsets = member_offsets.map(|pairs| {
                    let mut offsets = vec![0u32; members.len()];
                    for &(member, offset) in pairs {
                        if let Some(slot) = offsets.get_mut(member as usize) {
                            *slot = offset;
                        }
                    }
                    offsets
                });
                TypeDesc::Struct {
                    members,
                    offsets,
                    block,
                }
            }
            Op::TYPE_POINTER => TypeDesc::Pointer {
                storage_class: ops.get(1).copied().unwrap_or(0),
                pointee: Id(ops.get(2).copied().unwrap_or(0)),
            },
            Op::TYPE_FUNCTION => TypeDesc::Function {
                return_type: Id(ops.get(1).copied().unwrap_or(0)),
                params: ops[2..].iter().map(|&w| Id(w)).collect(),
            },
            other => TypeDesc::Opaque {
                op: other.0,
                operands: ops[1..].to_vec(),
            },
        }
    }

    pub fn type_of(&self, id: Id) -> Result<&TypeDesc, SpirvError> {
        self.types.get(&id).ok_or(SpirvError::UnknownId {
            id,
            context: "type lookup",
        })
    }

    pub fn constant_info(&self, id: Id) -> Option<&ConstInfo> {
        self.constants.get(&id)
    }

    /// Evaluates an integer constant id under the given spec-constant
    /// overrides. Required for array lengths that are spec constants.
    pub fn eval_constant(&self, id: Id, spec: &SpecValues) -> Result<u64, SpirvError> {
        let info = self
            .constants
            .get(&id)
            .ok_or(SpirvError::UnknownId { id, context: "constant lookup" })?;
        if let Some(spec_id) = info.spec_id {
            if let Some(value) = spec.get(spec_id) {
                return Ok(value);
            }
        }
        info.scalar_u64()
            .ok_or(SpirvError::UnevaluatedConstant { id })
    }

    /// Returns the existing id for a structurally identical type, or declares
    /// a new one at the tail of the types section (dependencies of a new
    /// declaration always already exist, so the tail keeps ordering valid).
    pub fn declare_type(&mut self, desc: TypeDesc) -> Id {
        if let Some(&existing) = self.type_cache.get(&desc) {
            return existing;
        }
        let id = self.module.alloc_id();
        let inst = match &desc {
            TypeDesc::Void => Instruction::new(Op::TYPE_VOID, &[id.0]),
            TypeDesc::Bool => Instruction::new(Op::TYPE_BOOL, &[id.0]),
            TypeDesc::Int { width, signed } => {
                Instruction::new(Op::TYPE_INT, &[id.0, *width, u32::from(*signed)])
            }
            TypeDesc::Float { width } => Instruction::new(Op::TYPE_FLOAT, &[id.0, *width]),
            TypeDesc::Vector { component, count } => {
                Instruction::new(Op::TYPE_VECTOR, &[id.0, component.0, *count])
            }
            TypeDesc::Matrix { column, count } => {
                Instruction::new(Op::TYPE_MATRIX, &[id.0, column.0, *count])
            }
            TypeDesc::Array { element, length, .. } => {
                Instruction::new(Op::TYPE_ARRAY, &[id.0, element.0, length.0])
            }
            TypeDesc::RuntimeArray { element, .. } => {
                Instruction::new(Op::TYPE_RUNTIME_ARRAY, &[id.0, element.0])
            }
            TypeDesc::Struct { members, .. } => {
                let mut operands = vec![id.0];
                operands.extend(members.iter().map(|m| m.0));
                Instruction::new(Op::TYPE_STRUCT, &operands)
            }
            TypeDesc::Pointer { storage_class, pointee } => {
                Instruction::new(Op::TYPE_POINTER, &[id.0, *storage_class, pointee.0])
            }
            TypeDesc::Function { return_type, params } => {
                let mut operands = vec![id.0, return_type.0];
                operands.extend(params.iter().map(|p| p.0));
                Instruction::new(Op::TYPE_FUNCTION, &operands)
            }
            TypeDesc::Opaque { op, operands } => {
                let mut words = vec![id.0];
                words.extend_from_slice(operands);
                Instruction::new(Op(*op), &words)
            }
        };
        self.module.insert_in_section(Section::TypesConstantsGlobals, inst);

        // Layout-relevant decorations travel with the declaration.
        match &desc {
            TypeDesc::Array { stride: Some(stride), .. }
            | TypeDesc::RuntimeArray { stride: Some(stride), .. } => {
                self.decorate(id, decoration::ARRAY_STRIDE, &[*stride]);
            }
            TypeDesc::Struct { offsets: Some(offsets), block, .. } => {
                for (member, offset) in offsets.iter().enumerate() {
                    self.member_decorate(id, member as u32, decoration::OFFSET, &[*offset]);
                }
                if *block {
                    self.decorate(id, decoration::BLOCK, &[]);
                }
            }
            _ => {}
        }

        self.type_cache.insert(desc.clone(), id);
        self.types.insert(id, desc);
        id
    }

    // Common type shorthands.

    pub fn type_void(&mut self) -> Id {
        self.declare_type(TypeDesc::Void)
    }

    pub fn type_bool(&mut self) -> Id {
        self.declare_type(TypeDesc::Bool)
    }

    pub fn type_u32(&mut self) -> Id {
        self.declare_type(TypeDesc::Int { width: 32, signed: false })
    }

    pub fn type_i32(&mut self) -> Id {
        self.declare_type(TypeDesc::Int { width: 32, signed: true })
    }

    pub fn type_u64(&mut self) -> Id {
        self.declare_type(TypeDesc::Int { width: 64, signed: false })
    }

    pub fn type_f32(&mut self) -> Id {
        self.declare_type(TypeDesc::Float { width: 32 })
    }

    pub fn type_vec(&mut self, component: Id, count: u32) -> Id {
        self.declare_type(TypeDesc::Vector { component, count })
    }

    pub fn type_ptr(&mut self, storage_class: StorageClass, pointee: Id) -> Id {
        self.declare_type(TypeDesc::Pointer {
            storage_class: storage_class as u32,
            pointee,
        })
    }

    /// Declares a constant, deduplicated by `(opcode, type, value words)`.
    pub fn declare_constant_words(&mut self, op: Op, ty: Id, words: &[u32]) -> Id {
        let key = ConstKey {
            op: op.0,
            ty,
            words: words.to_vec(),
            spec_id: None,
        };
        if let Some(&existing) = self.constant_cache.get(&key) {
            return existing;
        }
        let id = self.module.alloc_id();
        let mut operands = vec![ty.0, id.0];
        operands.extend_from_slice(words);
        self.module
            .insert_in_section(Section::TypesConstantsGlobals, Instruction::new(op, &operands));
        let info = ConstInfo {
            op,
            ty,
            words: words.to_vec(),
            spec_id: None,
        };
        self.constant_cache.insert(key, id);
        self.constants.insert(id, info);
        id
    }

    pub fn const_u32(&mut self, value: u32) -> Id {
        let ty = self.type_u32();
        self.declare_constant_words(Op::CONSTANT, ty, &[value])
    }

    pub fn const_i32(&mut self, value: i32) -> Id {
        let ty = self.type_i32();
        self.declare_constant_words(Op::CONSTANT, ty, &[value as u32])
    }

    pub fn const_f32(&mut self, value: f32) -> Id {
        let ty = self.type_f32();
        self.declare_constant_words(Op::CONSTANT, ty, &[value.to_bits()])
    }

    pub fn const_composite(&mut self, ty: Id, components: &[Id]) -> Id {
        let words: Vec<u32> = components.iter().map(|c| c.0).collect();
        self.declare_constant_words(Op::CONSTANT_COMPOSITE, ty, &words)
    }

    /// Declares a specialization constant with a dedicated `SpecId`.
    ///
    /// Spec constants with distinct spec ids are never deduplicated against
    /// each other; the id is how the host names the slot at pipeline build.
    pub fn declare_spec_constant(&mut self, ty: Id, default_words: &[u32], spec_id: u32) -> Id {
        let key = ConstKey {
            op: Op::SPEC_CONSTANT.0,
            ty,
            words: default_words.to_vec(),
            spec_id: Some(spec_id),
        };
        if let Some(&existing) = self.constant_cache.get(&key) {
            return existing;
        }
        let id = self.module.alloc_id();
        let mut operands = vec![ty.0, id.0];
        operands.extend_from_slice(default_words);
        self.module.insert_in_section(
            Section::TypesConstantsGlobals,
            Instruction::new(Op::SPEC_CONSTANT, &operands),
        );
        self.decorate(id, decoration::SPEC_ID, &[spec_id]);
        self.constant_cache.insert(key, id);
        self.constants.insert(
            id,
            ConstInfo {
                op: Op::SPEC_CONSTANT,
                ty,
                words: default_words.to_vec(),
                spec_id: Some(spec_id),
            },
        );
        id
    }

    pub fn add_capability(&mut self, capability: u32) {
        if self.capabilities.insert(capability) {
            self.module.insert_in_section(
                Section::Capabilities,
                Instruction::new(Op::CAPABILITY, &[capability]),
            );
        }
    }

    pub fn add_extension(&mut self, name: &str) {
        if self.extensions.insert(name.to_string()) {
            self.module.insert_in_section(
                Section::Extensions,
                Instruction::new(Op::EXTENSION, &Instruction::encode_string(name)),
            );
        }
    }

    /// Id of the `GLSL.std.450` import, adding one if absent.
    pub fn glsl450_import(&mut self) -> Id {
        if let Some(id) = self.glsl450 {
            return id;
        }
        let id = self.module.alloc_id();
        let mut operands = vec![id.0];
        operands.extend(Instruction::encode_string("GLSL.std.450"));
        self.module.insert_in_section(
            Section::ExtInstImports,
            Instruction::new(Op::EXT_INST_IMPORT, &operands),
        );
        self.glsl450 = Some(id);
        id
    }

    /// Rewrites the addressing model operand of `OpMemoryModel`.
    pub fn set_addressing_model(&mut self, addressing_model: u32) {
        for inst in self.module.preamble_mut() {
            if inst.op() == Op::MEMORY_MODEL {
                inst.set_operand(0, addressing_model);
            }
        }
    }

    pub fn decorate(&mut self, target: Id, dec: u32, operands: &[u32]) {
        let mut words = vec![target.0, dec];
        words.extend_from_slice(operands);
        self.module
            .insert_in_section(Section::Annotations, Instruction::new(Op::DECORATE, &words));
    }

    pub fn member_decorate(&mut self, target: Id, member: u32, dec: u32, operands: &[u32]) {
        let mut words = vec![target.0, member, dec];
        words.extend_from_slice(operands);
        self.module.insert_in_section(
            Section::Annotations,
            Instruction::new(Op::MEMBER_DECORATE, &words),
        );
    }

    /// Removes every `OpDecorate target dec ...` annotation.
    ///
    /// Used when a variable's storage class is re-purposed and its `BuiltIn`
    /// or `Location` decorations must be elided.
    pub fn strip_decoration(&mut self, target: Id, dec: u32) {
        self.module.preamble_mut().retain(|inst| {
            !(inst.op() == Op::DECORATE
                && inst.operand(0) == Some(target.0)
                && inst.operand(1) == Some(dec))
        });
    }

    /// Collected decorations `(decoration, extra operands)` for `target`.
    pub fn decorations_of(&self, target: Id) -> Vec<(u32, Vec<u32>)> {
        let mut out = Vec::new();
        for inst in self.module.preamble() {
            if inst.op() == Op::DECORATE && inst.operand(0) == Some(target.0) {
                if let Some(dec) = inst.operand(1) {
                    out.push((dec, inst.operands()[2..].to_vec()));
                }
            }
        }
        out
    }

    /// Brackets an in-place edit of a preamble instruction.
    ///
    /// `pre_modify` hands out the mutable instruction; `post_modify` resyncs
    /// the caches that a word-count or operand change may have invalidated.
    pub fn pre_modify(&mut self, preamble_index: usize) -> Option<&mut Instruction> {
        self.module.preamble_mut().get_mut(preamble_index)
    }

    pub fn post_modify(&mut self) {
        self.rebuild_tables();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::SPIRV_MAGIC;

    fn empty_module() -> Module {
        let words = vec![
            SPIRV_MAGIC,
            0x0001_0300,
            0,
            100,
            0,
            (2 << 16) | 17,
            1, // OpCapability Shader
            (3 << 16) | 14,
            0,
            1, // OpMemoryModel Logical GLSL450
        ];
        Module::parse(&words).expect("parses")
    }

    #[test]
    fn type_dedup_is_structural() {
        let mut ed = Editor::new(empty_module());
        let u32_a = ed.type_u32();
        let u32_b = ed.type_u32();
        assert_eq!(u32_a, u32_b);
        let vec4 = ed.type_vec(u32_a, 4);
        assert_ne!(vec4, u32_a);
        assert_eq!(ed.type_vec(u32_a, 4), vec4);
    }

    #[test]
    fn stride_is_type_identity_relevant() {
        let mut ed = Editor::new(empty_module());
        let f32_ty = ed.type_f32();
        let len = ed.const_u32(8);
        let a = ed.declare_type(TypeDesc::Array {
            element: f32_ty,
            length: len,
            stride: Some(4),
        });
        let b = ed.declare_type(TypeDesc::Array {
            element: f32_ty,
            length: len,
            stride: Some(16),
        });
        assert_ne!(a, b, "same inner type with two strides needs two ids");
        let a_again = ed.declare_type(TypeDesc::Array {
            element: f32_ty,
            length: len,
            stride: Some(4),
        });
        assert_eq!(a, a_again);
    }

    #[test]
    fn constants_dedup_and_evaluate() {
        let mut ed = Editor::new(empty_module());
        let a = ed.const_u32(128);
        let b = ed.const_u32(128);
        assert_eq!(a, b);
        assert_eq!(ed.eval_constant(a, &SpecValues::new()).unwrap(), 128);

        let u32_ty = ed.type_u32();
        let sc = ed.declare_spec_constant(u32_ty, &[4], 7);
        assert_eq!(ed.eval_constant(sc, &SpecValues::new()).unwrap(), 4);
        let mut spec = SpecValues::new();
        spec.set(7, 64);
        assert_eq!(ed.eval_constant(sc, &spec).unwrap(), 64);
    }

    #[test]
    fn spec_constants_with_distinct_ids_stay_distinct() {
        let mut ed = Editor::new(empty_module());
        let u32_ty = ed.type_u32();
        let a = ed.declare_spec_constant(u32_ty, &[0], 1);
        let b = ed.declare_spec_constant(u32_ty, &[0], 2);
        assert_ne!(a, b);
    }

    #[test]
    fn caches_survive_serialization_round_trip() {
        let mut ed = Editor::new(empty_module());
        let u32_ty = ed.type_u32();
        let c = ed.const_u32(42);
        let words = ed.finish().words();

        let mut ed2 = Editor::new(Module::parse(&words).expect("parses"));
        assert_eq!(ed2.type_u32(), u32_ty);
        assert_eq!(ed2.const_u32(42), c);
    }

    #[test]
    fn unknown_id_is_internal_error() {
        let ed = Editor::new(empty_module());
        let err = ed.type_of(Id(9999)).unwrap_err();
        assert!(matches!(err, SpirvError::UnknownId { .. }));
    }

    #[test]
    fn strip_decoration_removes_only_matching() {
        let mut ed = Editor::new(empty_module());
        let target = ed.alloc_id();
        ed.decorate(target, decoration::BUILT_IN, &[42]);
        ed.decorate(target, decoration::LOCATION, &[3]);
        ed.strip_decoration(target, decoration::BUILT_IN);
        let decs = ed.decorations_of(target);
        assert_eq!(decs, vec![(decoration::LOCATION, vec![3])]);
    }
}
