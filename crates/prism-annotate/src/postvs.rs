//! Vertex→compute rewrite for post-transform output capture.
//!
//! The original vertex shader keeps its entry function untouched. A new
//! compute wrapper decomposes the global thread index into
//! (vertex-in-instance, instance, view), seeds the original input variables
//! (reclassified to `Private`) from compacted attribute buffers, calls the
//! original entry point, and stores every output into a packed record at the
//! thread's slot. Dispatch is `ceil(total / 128)` groups of 128 threads;
//! out-of-range threads exit before touching memory.
//!
//! CPU-side helpers live here too: index-buffer rebasing for indexed draws
//! and the near/far plane derivation run on the captured positions after
//! readback.

use std::collections::{BTreeSet, HashMap, HashSet};

use crate::attr::{CompType, VertexFormat};
use crate::emit::Body;
use crate::reflect::{reflect_entry, InterfaceVar};
use crate::strategy::{AddressMode, PointerStrategy, StrategyVars, RESERVED_BINDING_COUNT};
use crate::{AnnotateError, ShaderStage};
use prism_spirv::opcode::{
    builtin, decoration, execution_mode, glsl450, ExecutionModel, Op, StorageClass,
};
use prism_spirv::{
    compute_layout, plan_struct, Editor, Id, Instruction, Module, Section, SpecValues, TypeDesc,
};

/// Threads per workgroup in the rewritten compute shader.
pub const DISPATCH_WIDTH: u32 = 128;

/// `SpecId`s for the dispatch dimensions, resolved at pipeline build.
pub const SPEC_ID_VERTEX_COUNT: u32 = 200;
pub const SPEC_ID_INSTANCE_COUNT: u32 = 201;
pub const SPEC_ID_VIEW_COUNT: u32 = 202;

/// Buffer-slot assignment shared with the executor: the packed output record
/// buffer, the rebased index buffer, then one compacted buffer per attribute
/// in config order.
pub const SLOT_OUTPUT: u32 = 0;
pub const SLOT_INDEX: u32 = 1;
pub const SLOT_FIRST_ATTRIBUTE: u32 = 2;

/// One bound vertex attribute, in the order the executor compacts them.
#[derive(Debug, Clone, Copy)]
pub struct VertexInputDesc {
    pub location: u32,
    pub format: VertexFormat,
    /// Instance-rate attribute: fetched by instance, not by vertex.
    pub per_instance: bool,
}

#[derive(Debug, Clone)]
pub struct PostVsConfig {
    pub entry: String,
    pub indexed: bool,
    pub mode: AddressMode,
    pub inputs: Vec<VertexInputDesc>,
}

/// One member of the packed output record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordField {
    pub location: Option<u32>,
    pub builtin: Option<u32>,
    pub offset: u32,
    pub byte_size: u32,
}

/// The rewritten module plus the layout contract the CPU reader needs.
#[derive(Debug, Clone)]
pub struct PostVsShader {
    pub words: Vec<u32>,
    pub record_stride: u32,
    pub fields: Vec<RecordField>,
    /// Buffer slots the executor must bind: 2 fixed + one per attribute.
    pub slot_count: u32,
    pub has_position: bool,
}

pub fn rewrite_vertex_to_compute(
    words: &[u32],
    config: &PostVsConfig,
) -> Result<PostVsShader, AnnotateError> {
    let module = Module::parse(words)?;
    let mut ed = Editor::new(module);

    let reflection = reflect_entry(&ed, &config.entry)?;
    if reflection.stage != ShaderStage::Vertex {
        return Err(AnnotateError::WrongStage {
            name: config.entry.clone(),
            found: reflection.stage,
            expected: ShaderStage::Vertex,
        });
    }

    if config.mode == AddressMode::DescriptorBinding {
        PointerStrategy::shift_user_bindings(&mut ed, RESERVED_BINDING_COUNT);
    }
    let slot_count = SLOT_FIRST_ATTRIBUTE + config.inputs.len() as u32;
    let strategy = PointerStrategy::new(config.mode, slot_count);
    let vars = strategy.prepare(&mut ed);

    reclassify_to_private(&mut ed, reflection.inputs.iter().chain(&reflection.outputs));
    redirect_interface_chains(
        &mut ed,
        reflection.inputs.iter().chain(&reflection.outputs),
    )?;

    // Record layout over the output value types, booleans stored as u32.
    let spec = SpecValues::new();
    let mut member_ids = Vec::with_capacity(reflection.outputs.len());
    for out in &reflection.outputs {
        member_ids.push(storage_member_type(&mut ed, out.value_type)?);
    }
    let layout = plan_struct(&ed, &member_ids, &spec)?;
    let fields: Vec<RecordField> = reflection
        .outputs
        .iter()
        .zip(&layout.members)
        .map(|(out, member)| RecordField {
            location: out.location,
            builtin: out.builtin,
            offset: member.offset,
            byte_size: member.layout.size,
        })
        .collect();

    let wrapper = emit_wrapper(&mut ed, &strategy, &vars, config, &reflection, &layout, &spec)?;
    retarget_entry_point(&mut ed, &config.entry, wrapper)?;

    let has_position = reflection
        .outputs
        .iter()
        .any(|o| o.builtin == Some(builtin::POSITION));
    Ok(PostVsShader {
        words: ed.finish().words(),
        record_stride: layout.size,
        fields,
        slot_count,
        has_position,
    })
}

/// Moves every interface variable to `Private` and strips the decorations
/// that are only legal on `Input`/`Output` storage.
fn reclassify_to_private<'a>(ed: &mut Editor, vars: impl Iterator<Item = &'a InterfaceVar>) {
    for var in vars {
        let private_ptr = ed.type_ptr(StorageClass::Private, var.value_type);
        let index = ed
            .module()
            .preamble()
            .iter()
            .position(|inst| inst.op() == Op::VARIABLE && inst.operand(1) == Some(var.id.0));
        if let Some(index) = index {
            if let Some(inst) = ed.pre_modify(index) {
                inst.set_operand(0, private_ptr.0);
                inst.set_operand(2, StorageClass::Private as u32);
            }
        }
        ed.strip_decoration(var.id, decoration::LOCATION);
        ed.strip_decoration(var.id, decoration::BUILT_IN);
        ed.strip_decoration(var.id, decoration::FLAT);
        ed.strip_decoration(var.id, decoration::COMPONENT);
    }
    ed.post_modify();
}

/// Retypes every access chain rooted (transitively) at a reclassified
/// variable so its pointer storage class matches the variable's new class.
fn redirect_interface_chains<'a>(
    ed: &mut Editor,
    vars: impl Iterator<Item = &'a InterfaceVar>,
) -> Result<(), AnnotateError> {
    let mut roots: HashSet<u32> = vars.map(|v| v.id.0).collect();
    // Defs precede uses inside a function, so one forward pass reaches every
    // chained derivation.
    let mut edits: Vec<(usize, Id)> = Vec::new();
    for (index, inst) in ed.module().functions().iter().enumerate() {
        let base_slot = match inst.op() {
            Op::ACCESS_CHAIN | Op::IN_BOUNDS_ACCESS_CHAIN | Op::COPY_OBJECT => 2,
            _ => continue,
        };
        let Some(base) = inst.operand(base_slot) else {
            continue;
        };
        if !roots.contains(&base) {
            continue;
        }
        let (Some(old_type), Some(result)) = (inst.operand(0), inst.operand(1)) else {
            continue;
        };
        // Only pointer-typed results participate (OpCopyObject of a loaded
        // value has a non-pointer type and needs no retyping).
        if matches!(ed.type_of(Id(old_type)), Ok(TypeDesc::Pointer { .. })) {
            edits.push((index, Id(old_type)));
            roots.insert(result);
        }
    }
    for (index, old_type) in edits {
        let pointee = match ed.type_of(old_type)? {
            TypeDesc::Pointer { pointee, .. } => *pointee,
            _ => continue,
        };
        let new_type = ed.type_ptr(StorageClass::Private, pointee);
        ed.module_mut().functions_mut()[index].set_operand(0, new_type.0);
    }
    Ok(())
}

/// Storage representation of an output member: booleans (and boolean
/// vectors) become u32.
fn storage_member_type(ed: &mut Editor, ty: Id) -> Result<Id, AnnotateError> {
    match ed.type_of(ty)?.clone() {
        TypeDesc::Bool => Ok(ed.type_u32()),
        TypeDesc::Vector { component, count } => {
            if matches!(ed.type_of(component)?, TypeDesc::Bool) {
                let u32_ty = ed.type_u32();
                Ok(ed.type_vec(u32_ty, count))
            } else {
                Ok(ty)
            }
        }
        _ => Ok(ty),
    }
}

/// Scalar component kind of a shader input/output, widened view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScalarKind {
    F32,
    F64,
    I32,
    U32,
    I64,
    U64,
}

fn classify_scalar(ed: &Editor, ty: Id) -> Option<ScalarKind> {
    match ed.type_of(ty).ok()? {
        TypeDesc::Float { width: 32 } => Some(ScalarKind::F32),
        TypeDesc::Float { width: 64 } => Some(ScalarKind::F64),
        TypeDesc::Int { width: 32, signed } => {
            Some(if *signed { ScalarKind::I32 } else { ScalarKind::U32 })
        }
        TypeDesc::Int { width: 64, signed } => {
            Some(if *signed { ScalarKind::I64 } else { ScalarKind::U64 })
        }
        _ => None,
    }
}

#[allow(clippy::too_many_arguments)]
fn emit_wrapper(
    ed: &mut Editor,
    strategy: &PointerStrategy,
    vars: &StrategyVars,
    config: &PostVsConfig,
    reflection: &crate::reflect::EntryReflection,
    layout: &prism_spirv::StructLayout,
    spec: &SpecValues,
) -> Result<Id, AnnotateError> {
    let u32_ty = ed.type_u32();
    let uvec3 = ed.type_vec(u32_ty, 3);
    let bool_ty = ed.type_bool();
    let void_ty = ed.type_void();

    // gl_GlobalInvocationID input for the wrapper.
    let gid_ptr_ty = ed.type_ptr(StorageClass::Input, uvec3);
    let gid_var = ed.alloc_id();
    ed.module_mut().insert_in_section(
        Section::TypesConstantsGlobals,
        Instruction::new(
            Op::VARIABLE,
            &[gid_ptr_ty.0, gid_var.0, StorageClass::Input as u32],
        ),
    );
    ed.decorate(gid_var, decoration::BUILT_IN, &[builtin::GLOBAL_INVOCATION_ID]);

    let vertex_count = ed.declare_spec_constant(u32_ty, &[1], SPEC_ID_VERTEX_COUNT);
    let instance_count = ed.declare_spec_constant(u32_ty, &[1], SPEC_ID_INSTANCE_COUNT);
    let view_count = ed.declare_spec_constant(u32_ty, &[1], SPEC_ID_VIEW_COUNT);

    let fn_ty = ed.declare_type(TypeDesc::Function {
        return_type: void_ty,
        params: Vec::new(),
    });
    let wrapper = ed.alloc_id();

    let mut body = Body::new();
    body.push(Instruction::new(
        Op::FUNCTION,
        &[void_ty.0, wrapper.0, 0, fn_ty.0],
    ));
    body.label(ed);

    let gid = body.load(ed, uvec3, gid_var);
    let thread = body.emit(ed, Op::COMPOSITE_EXTRACT, u32_ty, &[gid.0, 0]);
    let per_view = body.binop(ed, Op::I_MUL, u32_ty, vertex_count, instance_count);
    let total = body.binop(ed, Op::I_MUL, u32_ty, per_view, view_count);
    let in_range = body.binop(ed, Op::U_LESS_THAN, bool_ty, thread, total);

    let work_label = ed.alloc_id();
    let merge_label = ed.alloc_id();
    body.emit_no_result(Op::SELECTION_MERGE, &[merge_label.0, 0]);
    body.emit_no_result(
        Op::BRANCH_CONDITIONAL,
        &[in_range.0, work_label.0, merge_label.0],
    );
    body.push(Instruction::new(Op::LABEL, &[work_label.0]));

    let vert = body.binop(ed, Op::U_MOD, u32_ty, thread, vertex_count);
    let rest = body.binop(ed, Op::U_DIV, u32_ty, thread, vertex_count);
    let instance = body.binop(ed, Op::U_MOD, u32_ty, rest, instance_count);
    let view = body.binop(ed, Op::U_DIV, u32_ty, rest, instance_count);

    let vertex_index = if config.indexed {
        strategy.load_word(ed, &mut body, vars, SLOT_INDEX, vert)
    } else {
        vert
    };

    // Seed reclassified inputs: builtins from the decomposition, attributes
    // from their compacted buffers.
    for input in &reflection.inputs {
        if let Some(b) = input.builtin {
            let value = match b {
                builtin::VERTEX_INDEX => Some(vertex_index),
                builtin::INSTANCE_INDEX => Some(instance),
                builtin::VIEW_INDEX => Some(view),
                _ => None,
            };
            if let Some(value) = value {
                let cast = cast_index(ed, &mut body, value, input.value_type);
                body.store(input.id, cast);
            }
            continue;
        }
        let Some(location) = input.location else {
            continue;
        };
        let slot_in_config = config
            .inputs
            .iter()
            .position(|d| d.location == location)
            .ok_or(AnnotateError::MissingAttribute { location })?;
        let desc = config.inputs[slot_in_config];
        let element = if desc.per_instance { instance } else { vertex_index };
        let slot = SLOT_FIRST_ATTRIBUTE + slot_in_config as u32;
        let value = fetch_attribute(
            ed,
            &mut body,
            strategy,
            vars,
            slot,
            element,
            desc.format,
            input.value_type,
            location,
        )?;
        body.store(input.id, value);
    }

    body.emit(ed, Op::FUNCTION_CALL, void_ty, &[reflection.entry.function.0]);

    // Pack every output into the record at [thread].
    let stride_words = ed.const_u32(layout.size / 4);
    let record_base = body.binop(ed, Op::I_MUL, u32_ty, thread, stride_words);
    for (out, member) in reflection.outputs.iter().zip(&layout.members) {
        let value = body.load(ed, out.value_type, out.id);
        store_flattened(
            ed,
            &mut body,
            strategy,
            vars,
            record_base,
            member.offset / 4,
            value,
            out.value_type,
            spec,
        )?;
    }

    body.emit_no_result(Op::BRANCH, &[merge_label.0]);
    body.push(Instruction::new(Op::LABEL, &[merge_label.0]));
    body.emit_no_result(Op::RETURN, &[]);
    body.push(Instruction::new(Op::FUNCTION_END, &[]));
    ed.module_mut().functions_mut().extend(body.instructions());
    Ok(wrapper)
}

/// Rewrites the entry point declaration in place: execution model, function
/// id, and the appended builtin interface variable; then attaches the fixed
/// workgroup size.
fn retarget_entry_point(ed: &mut Editor, name: &str, wrapper: Id) -> Result<(), AnnotateError> {
    let gid_var = ed
        .module()
        .preamble()
        .iter()
        .rev()
        .find(|inst| {
            inst.op() == Op::VARIABLE && inst.operand(2) == Some(StorageClass::Input as u32)
        })
        .and_then(|inst| inst.operand(1))
        .map(Id)
        .ok_or(AnnotateError::MissingEntryPoint(name.to_string()))?;

    let index = ed
        .module()
        .preamble()
        .iter()
        .position(|inst| {
            inst.op() == Op::ENTRY_POINT
                && inst.decode_string(2).map(|(n, _)| n) == Some(name.to_string())
        })
        .ok_or_else(|| AnnotateError::MissingEntryPoint(name.to_string()))?;
    if let Some(inst) = ed.pre_modify(index) {
        inst.set_operand(0, ExecutionModel::GLCompute as u32);
        inst.set_operand(1, wrapper.0);
        inst.push_operand(gid_var.0);
    }
    ed.post_modify();

    ed.module_mut().insert_in_section(
        Section::ExecutionModes,
        Instruction::new(
            Op::EXECUTION_MODE,
            &[wrapper.0, execution_mode::LOCAL_SIZE, DISPATCH_WIDTH, 1, 1],
        ),
    );
    Ok(())
}

/// Casts a u32 index to the value type of a seeded builtin variable.
fn cast_index(ed: &mut Editor, body: &mut Body, value: Id, target: Id) -> Id {
    match ed.type_of(target).ok() {
        Some(TypeDesc::Int { width: 32, signed: true }) => {
            let i32_ty = ed.type_i32();
            body.emit(ed, Op::BITCAST, i32_ty, &[value.0])
        }
        _ => value,
    }
}

/// Emits the fetch of one attribute value from its compacted buffer and
/// widens it to the input variable's type.
#[allow(clippy::too_many_arguments)]
fn fetch_attribute(
    ed: &mut Editor,
    body: &mut Body,
    strategy: &PointerStrategy,
    vars: &StrategyVars,
    slot: u32,
    element: Id,
    format: VertexFormat,
    target_type: Id,
    location: u32,
) -> Result<Id, AnnotateError> {
    let u32_ty = ed.type_u32();
    let (comp_type, target_count) = match ed.type_of(target_type)?.clone() {
        TypeDesc::Vector { component, count } => (component, count),
        _ => (target_type, 1),
    };
    let kind = classify_scalar(ed, comp_type).ok_or(AnnotateError::UnsupportedInputType {
        location,
        context: "input component is not a 32- or 64-bit scalar",
    })?;

    let byte_size = ed.const_u32(format.byte_size());
    let elem_base = body.binop(ed, Op::I_MUL, u32_ty, element, byte_size);
    let comp_bytes = format.width / 8;

    let mut comps = Vec::with_capacity(target_count as usize);
    for c in 0..format.count.min(target_count) {
        let comp_off = ed.const_u32(c * comp_bytes);
        let byte_off = body.binop(ed, Op::I_ADD, u32_ty, elem_base, comp_off);
        let comp = fetch_component(
            ed, body, strategy, vars, slot, byte_off, format, kind, comp_type, location,
        )?;
        comps.push(comp);
    }
    // Missing components default to (0, 0, 0, 1).
    while (comps.len() as u32) < target_count {
        let one = comps.len() == 3;
        comps.push(scalar_const(ed, kind, comp_type, if one { 1 } else { 0 }));
    }

    if target_count == 1 {
        Ok(comps[0])
    } else {
        let operands: Vec<u32> = comps.iter().map(|c| c.0).collect();
        Ok(body.emit(ed, Op::COMPOSITE_CONSTRUCT, target_type, &operands))
    }
}

/// Loads and widens one component at byte offset `byte_off`.
#[allow(clippy::too_many_arguments)]
fn fetch_component(
    ed: &mut Editor,
    body: &mut Body,
    strategy: &PointerStrategy,
    vars: &StrategyVars,
    slot: u32,
    byte_off: Id,
    format: VertexFormat,
    kind: ScalarKind,
    comp_type: Id,
    location: u32,
) -> Result<Id, AnnotateError> {
    let u32_ty = ed.type_u32();
    let two = ed.const_u32(2);
    let word_index = body.binop(ed, Op::SHIFT_RIGHT_LOGICAL, u32_ty, byte_off, two);
    let word = strategy.load_word(ed, body, vars, slot, word_index);

    // Sub-word components: shift the containing word down to the component's
    // byte position and mask.
    let narrow = |ed: &mut Editor, body: &mut Body, mask: u32| {
        let three = ed.const_u32(3);
        let eight = ed.const_u32(8);
        let in_word = body.binop(ed, Op::BITWISE_AND, u32_ty, byte_off, three);
        let shift = body.binop(ed, Op::I_MUL, u32_ty, in_word, eight);
        let shifted = body.binop(ed, Op::SHIFT_RIGHT_LOGICAL, u32_ty, word, shift);
        let mask = ed.const_u32(mask);
        body.binop(ed, Op::BITWISE_AND, u32_ty, shifted, mask)
    };
    let sign_extend = |ed: &mut Editor, body: &mut Body, raw: Id, width: u32| {
        let amount = ed.const_u32(32 - width);
        let up = body.binop(ed, Op::SHIFT_LEFT_LOGICAL, u32_ty, raw, amount);
        body.binop(ed, Op::SHIFT_RIGHT_ARITHMETIC, u32_ty, up, amount)
    };

    let unsupported = AnnotateError::UnsupportedInputType {
        location,
        context: "format/component combination has no widening rule",
    };

    match (format.comp, format.width, kind) {
        (CompType::Float, 32, ScalarKind::F32) => {
            Ok(body.emit(ed, Op::BITCAST, comp_type, &[word.0]))
        }
        (CompType::Float, 16, ScalarKind::F32) => {
            let half = narrow(ed, body, 0xffff);
            let f32_ty = ed.type_f32();
            let vec2f = ed.type_vec(f32_ty, 2);
            let pair = body.ext_inst(ed, vec2f, glsl450::UNPACK_HALF_2X16, &[half]);
            Ok(body.emit(ed, Op::COMPOSITE_EXTRACT, comp_type, &[pair.0, 0]))
        }
        (CompType::UNorm, w @ (8 | 16), ScalarKind::F32) => {
            let raw = narrow(ed, body, (1u32 << w) - 1);
            let f = body.emit(ed, Op::CONVERT_U_TO_F, comp_type, &[raw.0]);
            let scale = ed.const_f32(1.0 / (((1u64 << w) - 1) as f32));
            Ok(body.binop(ed, Op::F_MUL, comp_type, f, scale))
        }
        (CompType::SNorm, w @ (8 | 16), ScalarKind::F32) => {
            let raw = narrow(ed, body, (1u32 << w) - 1);
            let signed = sign_extend(ed, body, raw, w);
            let i32_ty = ed.type_i32();
            let as_i32 = body.emit(ed, Op::BITCAST, i32_ty, &[signed.0]);
            let f = body.emit(ed, Op::CONVERT_S_TO_F, comp_type, &[as_i32.0]);
            let scale = ed.const_f32(1.0 / (((1u64 << (w - 1)) - 1) as f32));
            let scaled = body.binop(ed, Op::F_MUL, comp_type, f, scale);
            let floor = ed.const_f32(-1.0);
            Ok(body.ext_inst(ed, comp_type, glsl450::F_MAX, &[scaled, floor]))
        }
        (CompType::UInt, 32, ScalarKind::U32) => Ok(word),
        (CompType::UInt, 32, ScalarKind::I32) | (CompType::SInt, 32, ScalarKind::I32) => {
            Ok(body.emit(ed, Op::BITCAST, comp_type, &[word.0]))
        }
        (CompType::SInt, 32, ScalarKind::U32) => Ok(word),
        (CompType::UInt, w @ (8 | 16), ScalarKind::U32) => Ok(narrow(ed, body, (1u32 << w) - 1)),
        (CompType::UInt, w @ (8 | 16), ScalarKind::I32) => {
            let raw = narrow(ed, body, (1u32 << w) - 1);
            Ok(body.emit(ed, Op::BITCAST, comp_type, &[raw.0]))
        }
        (CompType::SInt, w @ (8 | 16), ScalarKind::I32) => {
            let raw = narrow(ed, body, (1u32 << w) - 1);
            let signed = sign_extend(ed, body, raw, w);
            Ok(body.emit(ed, Op::BITCAST, comp_type, &[signed.0]))
        }
        (CompType::SInt, w @ (8 | 16), ScalarKind::U32) => {
            let raw = narrow(ed, body, (1u32 << w) - 1);
            Ok(sign_extend(ed, body, raw, w))
        }
        // 64-bit components: two words reassembled through bit-packing
        // intrinsics (doubles) or a plain bitcast (longs).
        (CompType::Float, 64, ScalarKind::F64)
        | (CompType::UInt, 64, ScalarKind::U64)
        | (CompType::SInt, 64, ScalarKind::I64) => {
            let one = ed.const_u32(1);
            let hi_index = body.binop(ed, Op::I_ADD, u32_ty, word_index, one);
            let hi = strategy.load_word(ed, body, vars, slot, hi_index);
            let uvec2 = ed.type_vec(u32_ty, 2);
            let pair = body.emit(ed, Op::COMPOSITE_CONSTRUCT, uvec2, &[word.0, hi.0]);
            if kind == ScalarKind::F64 {
                Ok(body.ext_inst(ed, comp_type, glsl450::PACK_DOUBLE_2X32, &[pair]))
            } else {
                Ok(body.emit(ed, Op::BITCAST, comp_type, &[pair.0]))
            }
        }
        _ => Err(unsupported),
    }
}

/// Constant 0 or 1 in the given scalar kind.
fn scalar_const(ed: &mut Editor, kind: ScalarKind, ty: Id, value: u32) -> Id {
    match kind {
        ScalarKind::F32 => ed.const_f32(value as f32),
        ScalarKind::I32 | ScalarKind::U32 => ed.declare_constant_words(Op::CONSTANT, ty, &[value]),
        ScalarKind::F64 => {
            let bits = (value as f64).to_bits();
            ed.declare_constant_words(Op::CONSTANT, ty, &[bits as u32, (bits >> 32) as u32])
        }
        ScalarKind::I64 | ScalarKind::U64 => {
            ed.declare_constant_words(Op::CONSTANT, ty, &[value, 0])
        }
    }
}

/// Decomposes `value` into u32 words and stores them into the output slot
/// starting at `base + offset_words`.
#[allow(clippy::too_many_arguments)]
fn store_flattened(
    ed: &mut Editor,
    body: &mut Body,
    strategy: &PointerStrategy,
    vars: &StrategyVars,
    base: Id,
    offset_words: u32,
    value: Id,
    ty: Id,
    spec: &SpecValues,
) -> Result<u32, AnnotateError> {
    let u32_ty = ed.type_u32();
    let store_at = |ed: &mut Editor, body: &mut Body, word_offset: u32, word: Id| {
        let off = ed.const_u32(offset_words + word_offset);
        let index = body.binop(ed, Op::I_ADD, u32_ty, base, off);
        strategy.store_word(ed, body, vars, SLOT_OUTPUT, index, word);
    };

    match ed.type_of(ty)?.clone() {
        TypeDesc::Bool => {
            let one = ed.const_u32(1);
            let zero = ed.const_u32(0);
            let word = body.emit(ed, Op::SELECT, u32_ty, &[value.0, one.0, zero.0]);
            store_at(ed, body, 0, word);
            Ok(1)
        }
        TypeDesc::Int { width: 32, signed: false } => {
            store_at(ed, body, 0, value);
            Ok(1)
        }
        TypeDesc::Int { width: 32, signed: true } | TypeDesc::Float { width: 32 } => {
            let word = body.emit(ed, Op::BITCAST, u32_ty, &[value.0]);
            store_at(ed, body, 0, word);
            Ok(1)
        }
        TypeDesc::Float { width: 64 } => {
            let uvec2 = ed.type_vec(u32_ty, 2);
            let pair = body.ext_inst(ed, uvec2, glsl450::UNPACK_DOUBLE_2X32, &[value]);
            let lo = body.emit(ed, Op::COMPOSITE_EXTRACT, u32_ty, &[pair.0, 0]);
            let hi = body.emit(ed, Op::COMPOSITE_EXTRACT, u32_ty, &[pair.0, 1]);
            store_at(ed, body, 0, lo);
            store_at(ed, body, 1, hi);
            Ok(2)
        }
        TypeDesc::Int { width: 64, signed } => {
            let u64_ty = ed.type_u64();
            let bits = if signed {
                body.emit(ed, Op::BITCAST, u64_ty, &[value.0])
            } else {
                value
            };
            let uvec2 = ed.type_vec(u32_ty, 2);
            let pair = body.emit(ed, Op::BITCAST, uvec2, &[bits.0]);
            let lo = body.emit(ed, Op::COMPOSITE_EXTRACT, u32_ty, &[pair.0, 0]);
            let hi = body.emit(ed, Op::COMPOSITE_EXTRACT, u32_ty, &[pair.0, 1]);
            store_at(ed, body, 0, lo);
            store_at(ed, body, 1, hi);
            Ok(2)
        }
        TypeDesc::Vector { component, count } => {
            let mut words = 0;
            for i in 0..count {
                let comp = body.emit(ed, Op::COMPOSITE_EXTRACT, component, &[value.0, i]);
                words += store_flattened(
                    ed,
                    body,
                    strategy,
                    vars,
                    base,
                    offset_words + words,
                    comp,
                    component,
                    spec,
                )?;
            }
            Ok(words)
        }
        TypeDesc::Array { element, length, .. } => {
            let len = ed.eval_constant(length, spec)? as u32;
            let stride_words = compute_layout(ed, ty, spec)?
                .array_stride
                .map(|s| s / 4)
                .unwrap_or(1);
            for i in 0..len {
                let elem = body.emit(ed, Op::COMPOSITE_EXTRACT, element, &[value.0, i]);
                store_flattened(
                    ed,
                    body,
                    strategy,
                    vars,
                    base,
                    offset_words + i * stride_words,
                    elem,
                    element,
                    spec,
                )?;
            }
            Ok(len * stride_words)
        }
        _ => Err(AnnotateError::UnsupportedOutputType {
            context: "output member is not a scalar, vector, or sized array",
        }),
    }
}

/// Rebased view of an index buffer for indexed post-transform fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebasedIndices {
    /// Sorted, de-duplicated, clamped original indices: the set of vertices
    /// the rewritten shader actually runs.
    pub unique: Vec<u32>,
    /// Same length as the source indices; each entry is a position into
    /// `unique`.
    pub rebased: Vec<u32>,
    /// `unique[i] + base_vertex`, clamped to the valid fetch range; what the
    /// attribute compaction reads.
    pub fetch_indices: Vec<u32>,
}

/// De-duplicates and rebases an index buffer.
///
/// Out-of-range indices clamp to `max_index` (the largest index the bound
/// vertex buffers can satisfy) rather than propagating. `base_vertex` may be
/// negative; the biased fetch index clamps at zero.
pub fn rebase_indices(indices: &[u32], base_vertex: i64, max_index: u32) -> RebasedIndices {
    let clamped: Vec<u32> = indices.iter().map(|&i| i.min(max_index)).collect();
    let set: BTreeSet<u32> = clamped.iter().copied().collect();
    let unique: Vec<u32> = set.into_iter().collect();
    let position: HashMap<u32, u32> = unique
        .iter()
        .enumerate()
        .map(|(p, &v)| (v, p as u32))
        .collect();
    let rebased = clamped.iter().map(|v| position[v]).collect();
    let fetch_indices = unique
        .iter()
        .map(|&v| (v as i64 + base_vertex).clamp(0, max_index as i64) as u32)
        .collect();
    RebasedIndices {
        unique,
        rebased,
        fetch_indices,
    }
}

/// Derives (near, far) from captured clip-space positions.
///
/// With a perspective projection, `clip.z = A * view.z + B` and
/// `clip.w = view.z`; two positions with distinct depths solve for (A, B),
/// giving `near = -B / A` (depth 0) and `far = B / (1 - A)` (depth 1). If
/// every position is degenerate (identical z/w), a reversed-infinite
/// projection is assumed when `z > 0 && w > z`; otherwise the planes default
/// to 0.1 and 100.
pub fn derive_clip_planes(positions: &[[f32; 4]]) -> (f32, f32) {
    const EPS: f32 = 1e-6;
    for i in 0..positions.len() {
        for j in (i + 1)..positions.len() {
            let (z0, w0) = (positions[i][2], positions[i][3]);
            let (z1, w1) = (positions[j][2], positions[j][3]);
            if (w0 - w1).abs() < EPS || w0.abs() < EPS || w1.abs() < EPS {
                continue;
            }
            if (z0 / w0 - z1 / w1).abs() < EPS {
                continue;
            }
            let a = (z0 - z1) / (w0 - w1);
            let b = z0 - a * w0;
            if a.abs() < EPS || (1.0 - a).abs() < EPS {
                continue;
            }
            let near = -b / a;
            let far = b / (1.0 - a);
            if near.is_finite() && far.is_finite() && near > 0.0 && far > near {
                return (near, far);
            }
        }
    }
    if let Some(p) = positions.iter().find(|p| p[3].abs() > EPS) {
        if p[2] > 0.0 && p[3] > p[2] {
            return (p[2], f32::INFINITY);
        }
    }
    (0.1, 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attr::{CompType, VertexFormat};
    use prism_spirv::opcode::capability;
    use prism_spirv::SPIRV_MAGIC;

    /// Assembles a minimal vertex shader: one vec4 input at location 0, one
    /// vec4 Position output, entry "main" copying input to output.
    fn toy_vertex_shader() -> Vec<u32> {
        let header = vec![SPIRV_MAGIC, 0x0001_0300, 0, 100, 0];
        let module = Module::parse(
            &[
                header,
                vec![(2 << 16) | 17, capability::SHADER],
                vec![(3 << 16) | 14, 0, 1],
            ]
            .concat(),
        )
        .expect("parses");
        let mut ed = Editor::new(module);

        let f32_ty = ed.type_f32();
        let vec4 = ed.type_vec(f32_ty, 4);
        let in_ptr = ed.type_ptr(StorageClass::Input, vec4);
        let out_ptr = ed.type_ptr(StorageClass::Output, vec4);
        let void_ty = ed.type_void();
        let fn_ty = ed.declare_type(TypeDesc::Function {
            return_type: void_ty,
            params: Vec::new(),
        });

        let input = ed.alloc_id();
        let output = ed.alloc_id();
        ed.module_mut().insert_in_section(
            Section::TypesConstantsGlobals,
            Instruction::new(Op::VARIABLE, &[in_ptr.0, input.0, StorageClass::Input as u32]),
        );
        ed.module_mut().insert_in_section(
            Section::TypesConstantsGlobals,
            Instruction::new(
                Op::VARIABLE,
                &[out_ptr.0, output.0, StorageClass::Output as u32],
            ),
        );
        ed.decorate(input, decoration::LOCATION, &[0]);
        ed.decorate(output, decoration::BUILT_IN, &[builtin::POSITION]);

        let main_fn = ed.alloc_id();
        let mut ep = vec![ExecutionModel::Vertex as u32, main_fn.0];
        ep.extend(Instruction::encode_string("main"));
        ep.push(input.0);
        ep.push(output.0);
        ed.module_mut()
            .insert_in_section(Section::EntryPoints, Instruction::new(Op::ENTRY_POINT, &ep));

        let label = ed.alloc_id();
        let loaded = ed.alloc_id();
        let insts = vec![
            Instruction::new(Op::FUNCTION, &[void_ty.0, main_fn.0, 0, fn_ty.0]),
            Instruction::new(Op::LABEL, &[label.0]),
            Instruction::new(Op::LOAD, &[vec4.0, loaded.0, input.0]),
            Instruction::new(Op::STORE, &[output.0, loaded.0]),
            Instruction::new(Op::RETURN, &[]),
            Instruction::new(Op::FUNCTION_END, &[]),
        ];
        ed.module_mut().functions_mut().extend(insts);
        ed.finish().words()
    }

    fn config(mode: AddressMode) -> PostVsConfig {
        PostVsConfig {
            entry: "main".to_string(),
            indexed: false,
            mode,
            inputs: vec![VertexInputDesc {
                location: 0,
                format: VertexFormat::new(CompType::Float, 32, 4),
                per_instance: false,
            }],
        }
    }

    #[test]
    fn rewrite_produces_compute_entry_with_fixed_workgroup() {
        let shader = toy_vertex_shader();
        let rewritten =
            rewrite_vertex_to_compute(&shader, &config(AddressMode::DescriptorBinding))
                .expect("rewrites");
        let module = Module::parse(&rewritten.words).expect("reparses");

        let entries = module.entry_points();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].execution_model, ExecutionModel::GLCompute);
        assert_eq!(entries[0].name, "main");

        let mut local_size = None;
        for inst in module.preamble() {
            if inst.op() == Op::EXECUTION_MODE
                && inst.operand(1) == Some(execution_mode::LOCAL_SIZE)
            {
                local_size = Some((inst.operand(2), inst.operand(3), inst.operand(4)));
            }
        }
        assert_eq!(local_size, Some((Some(DISPATCH_WIDTH), Some(1), Some(1))));
    }

    #[test]
    fn interface_variables_become_private() {
        let shader = toy_vertex_shader();
        let rewritten =
            rewrite_vertex_to_compute(&shader, &config(AddressMode::DescriptorBinding))
                .expect("rewrites");
        let module = Module::parse(&rewritten.words).expect("reparses");

        let mut output_class_seen = false;
        let mut input_vars = 0;
        for inst in module.preamble() {
            if inst.op() != Op::VARIABLE {
                continue;
            }
            match inst.operand(2) {
                Some(c) if c == StorageClass::Output as u32 => output_class_seen = true,
                Some(c) if c == StorageClass::Input as u32 => input_vars += 1,
                _ => {}
            }
        }
        assert!(!output_class_seen, "outputs must be reclassified");
        // The only remaining Input is the synthesized gl_GlobalInvocationID.
        assert_eq!(input_vars, 1);
    }

    #[test]
    fn wrapper_calls_original_entry_function() {
        let shader = toy_vertex_shader();
        let original = Module::parse(&shader).expect("parses").entry_points()[0].function;
        let rewritten =
            rewrite_vertex_to_compute(&shader, &config(AddressMode::BufferAddressKhr))
                .expect("rewrites");
        let module = Module::parse(&rewritten.words).expect("reparses");

        let called: Vec<u32> = module
            .functions()
            .iter()
            .filter(|inst| inst.op() == Op::FUNCTION_CALL)
            .filter_map(|inst| inst.operand(2))
            .collect();
        assert_eq!(called, vec![original.0]);
        // The new entry function is distinct from the original.
        assert_ne!(module.entry_points()[0].function, original);
    }

    #[test]
    fn record_layout_covers_all_outputs() {
        let shader = toy_vertex_shader();
        let rewritten =
            rewrite_vertex_to_compute(&shader, &config(AddressMode::DescriptorBinding))
                .expect("rewrites");
        assert!(rewritten.has_position);
        assert_eq!(rewritten.fields.len(), 1);
        assert_eq!(rewritten.fields[0].builtin, Some(builtin::POSITION));
        assert_eq!(rewritten.fields[0].offset, 0);
        assert_eq!(rewritten.fields[0].byte_size, 16);
        assert_eq!(rewritten.record_stride, 16);
        assert_eq!(rewritten.slot_count, 3);
    }

    #[test]
    fn missing_attribute_description_is_an_error() {
        let shader = toy_vertex_shader();
        let mut cfg = config(AddressMode::DescriptorBinding);
        cfg.inputs.clear();
        let err = rewrite_vertex_to_compute(&shader, &cfg).unwrap_err();
        assert!(matches!(err, AnnotateError::MissingAttribute { location: 0 }));
    }

    #[test]
    fn wrong_stage_is_rejected() {
        let shader = toy_vertex_shader();
        let mut words = shader.clone();
        // Patch the entry point's execution model to Fragment.
        let module = Module::parse(&words).expect("parses");
        let _ = module;
        let pos = words
            .windows(2)
            .position(|w| (w[0] & 0xffff) == 15)
            .expect("has entry point");
        words[pos + 1] = ExecutionModel::Fragment as u32;
        let err = rewrite_vertex_to_compute(&words, &config(AddressMode::DescriptorBinding))
            .unwrap_err();
        assert!(matches!(err, AnnotateError::WrongStage { .. }));
    }

    #[test]
    fn rebase_clamps_out_of_range_and_dedups() {
        // Indices [5,5,7,1000000] with baseVertex -3 and 10 valid vertices.
        let r = rebase_indices(&[5, 5, 7, 1_000_000], -3, 9);
        assert_eq!(r.unique, vec![5, 7, 9]);
        assert_eq!(r.rebased, vec![0, 0, 1, 2]);
        assert_eq!(r.fetch_indices, vec![2, 4, 6]);
    }

    #[test]
    fn rebase_remap_reproduces_post_clamp_vertices() {
        let indices = [3u32, 0, 3, 12, 7, 7, 100];
        let max = 12;
        for base in [-5i64, 0, 4] {
            let r = rebase_indices(&indices, base, max);
            for (k, &orig) in indices.iter().enumerate() {
                let clamped = orig.min(max);
                let via = r.fetch_indices[r.rebased[k] as usize];
                let direct = (clamped as i64 + base).clamp(0, max as i64) as u32;
                assert_eq!(via, direct, "index {k} base {base}");
            }
        }
    }

    #[test]
    fn clip_planes_recovered_from_perspective_positions() {
        // Standard projection with near 0.5 and far 100: clip.z = A*vz + B,
        // clip.w = vz, with A = f/(f-n), B = -f*n/(f-n).
        let (n, f) = (0.5f32, 100.0f32);
        let a = f / (f - n);
        let b = -f * n / (f - n);
        let at = |vz: f32| [0.0, 0.0, a * vz + b, vz];
        let (near, far) = derive_clip_planes(&[at(2.0), at(10.0), at(50.0)]);
        assert!((near - n).abs() < 1e-3, "near {near}");
        assert!((far - f).abs() < 1e-1, "far {far}");
    }

    #[test]
    fn degenerate_positions_use_reversed_infinite_heuristic() {
        // Identical z/w everywhere, z > 0, w > z.
        let p = [0.0, 0.0, 1.0, 4.0];
        let (near, far) = derive_clip_planes(&[p, [0.0, 0.0, 2.0, 8.0]]);
        assert_eq!(near, 1.0);
        assert_eq!(far, f32::INFINITY);
    }

    #[test]
    fn hopeless_positions_fall_back_to_defaults() {
        let (near, far) = derive_clip_planes(&[[0.0; 4], [0.0; 4]]);
        assert_eq!((near, far), (0.1, 100.0));
    }
}
