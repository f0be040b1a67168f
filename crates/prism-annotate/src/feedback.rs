//! Descriptor-feedback and debug-printf instrumentation.
//!
//! Two rewrites over an already-compiled pipeline's shaders:
//!
//! - Every access chain into a tracked descriptor array gets its index
//!   clamped to the declared bound, and an atomic OR records which element
//!   was dynamically touched, without altering the original read's result.
//! - Every debug-print call is replaced by a packed write into a ring-style
//!   buffer: a stage+message header word, four per-stage location words, then
//!   the arguments flattened to 32-bit words. Space is reserved with an
//!   atomic add on the buffer's first word; messages past the capacity are
//!   dropped.
//!
//! When a stage cannot use storage writes at all, [`shift_bindings_only`]
//! keeps its descriptor-set layout consistent with its patched siblings
//! without instrumenting anything.

use std::collections::HashMap;

use crate::emit::Body;
use crate::reflect::{find_or_add_builtin, reflect_entry};
use crate::strategy::{AddressMode, PointerStrategy, StrategyVars, RESERVED_BINDING_COUNT};
use crate::{AnnotateError, ShaderStage};
use prism_spirv::opcode::{builtin, decoration, glsl450, Op};
use prism_spirv::{Editor, Id, Module, TypeDesc};

/// Sentinel OR'd into a feedback word when an array element is accessed.
pub const ACCESS_SENTINEL: u32 = 1;

/// Extended instruction set name of the debug-print intrinsic.
pub const PRINTF_SET_NAME: &str = "NonSemantic.DebugPrintf";

/// One tracked descriptor-array binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackedBinding {
    pub set: u32,
    pub binding: u32,
    /// Declared array length; indices clamp to `array_len - 1`.
    pub array_len: u32,
    /// Word offset of this binding's feedback words in the feedback buffer.
    pub offset_words: u32,
}

#[derive(Debug, Clone)]
pub struct FeedbackConfig {
    pub entry: String,
    pub mode: AddressMode,
    pub bindings: Vec<TrackedBinding>,
    /// Instrument debug-print calls as well.
    pub printf: bool,
    /// Total capacity of the printf data area, in words (excluding the
    /// reservation counter at word 0).
    pub printf_capacity_words: u32,
}

/// Where the printf data area begins: word 0 is the reservation counter.
pub const PRINTF_DATA_BASE_WORDS: u32 = 1;

/// Words written per message before the arguments.
pub const PRINTF_PREFIX_WORDS: u32 = 5;

/// One instrumented debug-print call site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrintfSite {
    pub message_id: u32,
    /// Format string from the intrinsic's `OpString` operand, when present.
    pub format: Option<String>,
    /// Flattened argument words per message (excluding header and location).
    pub arg_words: u32,
}

#[derive(Debug, Clone)]
pub struct FeedbackShader {
    pub words: Vec<u32>,
    pub sites: Vec<PrintfSite>,
}

/// A decoded printf message from the readback buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrintfMessage {
    pub stage_index: u32,
    pub message_id: u32,
    pub location: [u32; 4],
    pub args: Vec<u32>,
}

pub fn annotate_feedback(
    words: &[u32],
    config: &FeedbackConfig,
) -> Result<FeedbackShader, AnnotateError> {
    let module = Module::parse(words)?;
    let mut ed = Editor::new(module);
    let reflection = reflect_entry(&ed, &config.entry)?;
    let stage = reflection.stage;

    if config.mode == AddressMode::DescriptorBinding {
        PointerStrategy::shift_user_bindings(&mut ed, RESERVED_BINDING_COUNT);
    }
    let strategy = PointerStrategy::new(config.mode, 1);
    let vars = strategy.prepare(&mut ed);

    instrument_descriptor_arrays(&mut ed, &strategy, &vars, config)?;
    let sites = if config.printf {
        instrument_printf(&mut ed, &strategy, &vars, config, stage)?
    } else {
        Vec::new()
    };

    Ok(FeedbackShader {
        words: ed.finish().words(),
        sites,
    })
}

/// Rewrites the module's binding numbers without instrumenting anything.
///
/// Used for a stage whose bytecode must stay unpatched (storage writes
/// unsupported) but whose descriptor-set layout must match the patched
/// stages of the same pipeline.
pub fn shift_bindings_only(words: &[u32]) -> Result<Vec<u32>, AnnotateError> {
    let module = Module::parse(words)?;
    let mut ed = Editor::new(module);
    PointerStrategy::shift_user_bindings(&mut ed, RESERVED_BINDING_COUNT);
    Ok(ed.finish().words())
}

/// Map from variable id to its (set, binding), read from the annotations.
///
/// Collected after any binding shift, so the numbers match the layout the
/// executor actually binds.
fn binding_map(ed: &Editor) -> HashMap<u32, (u32, u32)> {
    let mut sets: HashMap<u32, u32> = HashMap::new();
    let mut bindings: HashMap<u32, u32> = HashMap::new();
    for inst in ed.module().preamble() {
        if inst.op() != Op::DECORATE {
            continue;
        }
        let (Some(target), Some(dec)) = (inst.operand(0), inst.operand(1)) else {
            continue;
        };
        match dec {
            decoration::DESCRIPTOR_SET => {
                if let Some(v) = inst.operand(2) {
                    sets.insert(target, v);
                }
            }
            decoration::BINDING => {
                if let Some(v) = inst.operand(2) {
                    bindings.insert(target, v);
                }
            }
            _ => {}
        }
    }
    bindings
        .into_iter()
        .filter_map(|(var, binding)| sets.get(&var).map(|&set| (var, (set, binding))))
        .collect()
}

/// Clamps tracked descriptor-array indices and records accesses.
fn instrument_descriptor_arrays(
    ed: &mut Editor,
    strategy: &PointerStrategy,
    vars: &StrategyVars,
    config: &FeedbackConfig,
) -> Result<(), AnnotateError> {
    if config.bindings.is_empty() {
        return Ok(());
    }
    let shift = if config.mode == AddressMode::DescriptorBinding {
        RESERVED_BINDING_COUNT
    } else {
        0
    };
    let by_var: HashMap<u32, TrackedBinding> = {
        let map = binding_map(ed);
        map.into_iter()
            .filter_map(|(var, (set, binding))| {
                config
                    .bindings
                    .iter()
                    .find(|t| t.set == set && t.binding + shift == binding)
                    .map(|&t| (var, t))
            })
            .collect()
    };

    // (function index, tracked binding, original index id)
    let mut sites: Vec<(usize, TrackedBinding, Id)> = Vec::new();
    for (index, inst) in ed.module().functions().iter().enumerate() {
        if !matches!(inst.op(), Op::ACCESS_CHAIN | Op::IN_BOUNDS_ACCESS_CHAIN) {
            continue;
        }
        let (Some(base), Some(first_index)) = (inst.operand(2), inst.operand(3)) else {
            continue;
        };
        if let Some(&tracked) = by_var.get(&base) {
            sites.push((index, tracked, Id(first_index)));
        }
    }

    let u32_ty = ed.type_u32();
    for (site, tracked, original) in sites.into_iter().rev() {
        let mut body = Body::new();
        let zero = ed.const_u32(0);
        let bound = ed.const_u32(tracked.array_len.saturating_sub(1));
        let clamped = body.ext_inst(ed, u32_ty, glsl450::U_CLAMP, &[original, zero, bound]);
        let offset = ed.const_u32(tracked.offset_words);
        let word = body.binop(ed, Op::I_ADD, u32_ty, offset, clamped);
        let sentinel = ed.const_u32(ACCESS_SENTINEL);
        let _ = strategy.atomic_word(ed, &mut body, vars, Op::ATOMIC_OR, 0, word, sentinel);
        let insert = body.instructions();

        let functions = ed.module_mut().functions_mut();
        // Clamp feeds the original read: patch the chain's index operand.
        functions[site].set_operand(3, clamped.0);
        functions.splice(site..site, insert);
    }
    Ok(())
}

/// Replaces every debug-print intrinsic with a packed buffer write.
fn instrument_printf(
    ed: &mut Editor,
    strategy: &PointerStrategy,
    vars: &StrategyVars,
    config: &FeedbackConfig,
    stage: ShaderStage,
) -> Result<Vec<PrintfSite>, AnnotateError> {
    let Some(printf_set) = find_printf_import(ed) else {
        return Ok(Vec::new());
    };
    let strings = collect_strings(ed);

    // (function index, format string id, argument ids)
    let mut calls: Vec<(usize, Option<u32>, Vec<Id>)> = Vec::new();
    for (index, inst) in ed.module().functions().iter().enumerate() {
        if inst.op() != Op::EXT_INST || inst.operand(2) != Some(printf_set.0) {
            continue;
        }
        let operands = inst.operands();
        // [type, result, set, instruction, format, args...]
        let format = operands.get(4).copied();
        let args: Vec<Id> = operands[5.min(operands.len())..]
            .iter()
            .map(|&w| Id(w))
            .collect();
        calls.push((index, format, args));
    }

    let mut sites = Vec::with_capacity(calls.len());
    let u32_ty = ed.type_u32();
    let bool_ty = ed.type_bool();
    for (message_id, (site, format, args)) in calls.iter().enumerate().rev() {
        let message_id = message_id as u32;
        let mut body = Body::new();

        // Flatten arguments first so the word count is known.
        let mut arg_words: Vec<Id> = Vec::new();
        for &arg in args {
            flatten_arg(ed, &mut body, arg, &mut arg_words)?;
        }
        let total_words = PRINTF_PREFIX_WORDS + arg_words.len() as u32;

        // Reserve [reserved, reserved + total) with an atomic add on word 0.
        let zero = ed.const_u32(0);
        let n = ed.const_u32(total_words);
        let reserved = strategy.atomic_word(ed, &mut body, vars, Op::ATOMIC_I_ADD, 0, zero, n);
        let end = body.binop(ed, Op::I_ADD, u32_ty, reserved, n);
        let capacity = ed.const_u32(config.printf_capacity_words);
        let fits = body.binop(ed, Op::U_LESS_THAN_EQUAL, bool_ty, end, capacity);

        let then_label = ed.alloc_id();
        let merge_label = ed.alloc_id();
        body.emit_no_result(Op::SELECTION_MERGE, &[merge_label.0, 0]);
        body.emit_no_result(
            Op::BRANCH_CONDITIONAL,
            &[fits.0, then_label.0, merge_label.0],
        );
        body.push(prism_spirv::Instruction::new(Op::LABEL, &[then_label.0]));

        let data_base = ed.const_u32(PRINTF_DATA_BASE_WORDS);
        let base = body.binop(ed, Op::I_ADD, u32_ty, reserved, data_base);
        let header =
            ed.const_u32((stage.index() << 24) | (message_id & 0x00ff_ffff));
        let mut words: Vec<Id> = vec![header];
        words.extend(location_words(ed, &mut body, stage, &config.entry)?);
        words.extend(&arg_words);
        for (k, word) in words.into_iter().enumerate() {
            let off = ed.const_u32(k as u32);
            let at = body.binop(ed, Op::I_ADD, u32_ty, base, off);
            strategy.store_word(ed, &mut body, vars, 0, at, word);
        }

        body.emit_no_result(Op::BRANCH, &[merge_label.0]);
        body.push(prism_spirv::Instruction::new(Op::LABEL, &[merge_label.0]));

        let insert = body.instructions();
        let functions = ed.module_mut().functions_mut();
        functions.splice(*site..site + 1, insert);

        sites.push(PrintfSite {
            message_id,
            format: format.and_then(|f| strings.get(&f).cloned()),
            arg_words: arg_words.len() as u32,
        });
    }
    sites.reverse();
    Ok(sites)
}

fn find_printf_import(ed: &Editor) -> Option<Id> {
    for inst in ed.module().preamble() {
        if inst.op() == Op::EXT_INST_IMPORT {
            if let (Some(result), Some((name, _))) = (inst.operand(0), inst.decode_string(1)) {
                if name == PRINTF_SET_NAME {
                    return Some(Id(result));
                }
            }
        }
    }
    None
}

fn collect_strings(ed: &Editor) -> HashMap<u32, String> {
    let mut out = HashMap::new();
    for inst in ed.module().preamble() {
        if inst.op() == Op::STRING {
            if let (Some(result), Some((s, _))) = (inst.operand(0), inst.decode_string(1)) {
                out.insert(result, s);
            }
        }
    }
    out
}

/// Flattens one argument into 32-bit words: doubles through the unpack
/// intrinsic, 64-bit integers split, sub-32-bit integers promoted, vectors
/// component-wise.
fn flatten_arg(
    ed: &mut Editor,
    body: &mut Body,
    arg: Id,
    out: &mut Vec<Id>,
) -> Result<(), AnnotateError> {
    // The argument's type comes from its defining constant or instruction;
    // for constants the editor knows it, otherwise scan the function stream.
    let ty = type_of_value(ed, arg)?;
    flatten_typed(ed, body, arg, ty, out)
}

fn type_of_value(ed: &Editor, value: Id) -> Result<Id, AnnotateError> {
    if let Some(info) = ed.constant_info(value) {
        return Ok(info.ty);
    }
    for inst in ed.module().functions() {
        if inst.result_id() == Some(value) {
            if let Some(ty) = inst.result_type() {
                return Ok(ty);
            }
        }
    }
    Err(AnnotateError::Spirv(prism_spirv::SpirvError::UnknownId {
        id: value,
        context: "printf argument type",
    }))
}

fn flatten_typed(
    ed: &mut Editor,
    body: &mut Body,
    value: Id,
    ty: Id,
    out: &mut Vec<Id>,
) -> Result<(), AnnotateError> {
    let u32_ty = ed.type_u32();
    match ed.type_of(ty)?.clone() {
        TypeDesc::Int { width: 32, signed: false } => {
            out.push(value);
            Ok(())
        }
        TypeDesc::Int { width: 32, signed: true } | TypeDesc::Float { width: 32 } => {
            out.push(body.emit(ed, Op::BITCAST, u32_ty, &[value.0]));
            Ok(())
        }
        TypeDesc::Int { width: w, signed } if w < 32 => {
            let op = if signed { Op::S_CONVERT } else { Op::U_CONVERT };
            let target = if signed { ed.type_i32() } else { u32_ty };
            let wide = body.emit(ed, op, target, &[value.0]);
            if signed {
                out.push(body.emit(ed, Op::BITCAST, u32_ty, &[wide.0]));
            } else {
                out.push(wide);
            }
            Ok(())
        }
        TypeDesc::Float { width: 64 } => {
            let uvec2 = ed.type_vec(u32_ty, 2);
            let pair = body.ext_inst(ed, uvec2, glsl450::UNPACK_DOUBLE_2X32, &[value]);
            out.push(body.emit(ed, Op::COMPOSITE_EXTRACT, u32_ty, &[pair.0, 0]));
            out.push(body.emit(ed, Op::COMPOSITE_EXTRACT, u32_ty, &[pair.0, 1]));
            Ok(())
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
            out.push(body.emit(ed, Op::COMPOSITE_EXTRACT, u32_ty, &[pair.0, 0]));
            out.push(body.emit(ed, Op::COMPOSITE_EXTRACT, u32_ty, &[pair.0, 1]));
            Ok(())
        }
        TypeDesc::Vector { component, count } => {
            for i in 0..count {
                let comp = body.emit(ed, Op::COMPOSITE_EXTRACT, component, &[value.0, i]);
                flatten_typed(ed, body, comp, component, out)?;
            }
            Ok(())
        }
        TypeDesc::Bool => {
            let one = ed.const_u32(1);
            let zero = ed.const_u32(0);
            out.push(body.emit(ed, Op::SELECT, u32_ty, &[value.0, one.0, zero.0]));
            Ok(())
        }
        _ => Err(AnnotateError::UnsupportedOutputType {
            context: "printf argument is not a scalar, vector, or boolean",
        }),
    }
}

/// Emits the four per-stage location words.
///
/// Compute/task: global invocation id xyz. Vertex: vertex, instance, view.
/// Fragment: pixel x, pixel y, sample, view. Geometry/mesh fall back to the
/// packed workgroup scheme (primitive or workgroup id plus local index).
fn location_words(
    ed: &mut Editor,
    body: &mut Body,
    stage: ShaderStage,
    entry: &str,
) -> Result<Vec<Id>, AnnotateError> {
    let u32_ty = ed.type_u32();
    let uvec3 = ed.type_vec(u32_ty, 3);
    let zero = ed.const_u32(0);

    match stage {
        ShaderStage::Compute | ShaderStage::Task => {
            let var = find_or_add_builtin(ed, entry, builtin::GLOBAL_INVOCATION_ID, uvec3)?;
            let gid = body.load(ed, uvec3, var);
            let x = body.emit(ed, Op::COMPOSITE_EXTRACT, u32_ty, &[gid.0, 0]);
            let y = body.emit(ed, Op::COMPOSITE_EXTRACT, u32_ty, &[gid.0, 1]);
            let z = body.emit(ed, Op::COMPOSITE_EXTRACT, u32_ty, &[gid.0, 2]);
            Ok(vec![x, y, z, zero])
        }
        ShaderStage::Vertex => {
            let i32_ty = ed.type_i32();
            let vertex_var = find_or_add_builtin(ed, entry, builtin::VERTEX_INDEX, i32_ty)?;
            let instance_var = find_or_add_builtin(ed, entry, builtin::INSTANCE_INDEX, i32_ty)?;
            let vertex = body.load(ed, i32_ty, vertex_var);
            let instance = body.load(ed, i32_ty, instance_var);
            let v = body.emit(ed, Op::BITCAST, u32_ty, &[vertex.0]);
            let i = body.emit(ed, Op::BITCAST, u32_ty, &[instance.0]);
            Ok(vec![v, i, zero, zero])
        }
        ShaderStage::Fragment => {
            let f32_ty = ed.type_f32();
            let vec4 = ed.type_vec(f32_ty, 4);
            let frag_var = find_or_add_builtin(ed, entry, builtin::FRAG_COORD, vec4)?;
            let coord = body.load(ed, vec4, frag_var);
            let fx = body.emit(ed, Op::COMPOSITE_EXTRACT, f32_ty, &[coord.0, 0]);
            let fy = body.emit(ed, Op::COMPOSITE_EXTRACT, f32_ty, &[coord.0, 1]);
            let x = body.emit(ed, Op::CONVERT_F_TO_U, u32_ty, &[fx.0]);
            let y = body.emit(ed, Op::CONVERT_F_TO_U, u32_ty, &[fy.0]);
            let i32_ty = ed.type_i32();
            let sample_var = find_or_add_builtin(ed, entry, builtin::SAMPLE_ID, i32_ty)?;
            let sample = body.load(ed, i32_ty, sample_var);
            let s = body.emit(ed, Op::BITCAST, u32_ty, &[sample.0]);
            Ok(vec![x, y, s, zero])
        }
        ShaderStage::Geometry => {
            let i32_ty = ed.type_i32();
            let prim_var = find_or_add_builtin(ed, entry, builtin::PRIMITIVE_ID, i32_ty)?;
            let prim = body.load(ed, i32_ty, prim_var);
            let p = body.emit(ed, Op::BITCAST, u32_ty, &[prim.0]);
            Ok(vec![p, zero, zero, zero])
        }
        ShaderStage::Mesh
        | ShaderStage::TessControl
        | ShaderStage::TessEval => {
            let wg_var = find_or_add_builtin(ed, entry, builtin::WORKGROUP_ID, uvec3)?;
            let wg = body.load(ed, uvec3, wg_var);
            let x = body.emit(ed, Op::COMPOSITE_EXTRACT, u32_ty, &[wg.0, 0]);
            let y = body.emit(ed, Op::COMPOSITE_EXTRACT, u32_ty, &[wg.0, 1]);
            let z = body.emit(ed, Op::COMPOSITE_EXTRACT, u32_ty, &[wg.0, 2]);
            let local_var =
                find_or_add_builtin(ed, entry, builtin::LOCAL_INVOCATION_INDEX, u32_ty)?;
            let local = body.load(ed, u32_ty, local_var);
            Ok(vec![x, y, z, local])
        }
    }
}

/// Decodes the printf ring buffer after readback.
///
/// `words[0]` holds the total words reserved; messages follow from word 1.
/// Argument counts come from the per-site table the annotation produced.
pub fn decode_printf_buffer(words: &[u32], sites: &[PrintfSite]) -> Vec<PrintfMessage> {
    let mut out = Vec::new();
    let Some(&reserved) = words.first() else {
        return out;
    };
    let data = &words[1..];
    let used = (reserved as usize).min(data.len());
    let mut at = 0usize;
    while at + PRINTF_PREFIX_WORDS as usize <= used {
        let header = data[at];
        let stage_index = header >> 24;
        let message_id = header & 0x00ff_ffff;
        let Some(site) = sites.iter().find(|s| s.message_id == message_id) else {
            break;
        };
        let arg_count = site.arg_words as usize;
        let end = at + PRINTF_PREFIX_WORDS as usize + arg_count;
        if end > used {
            break;
        }
        let location = [data[at + 1], data[at + 2], data[at + 3], data[at + 4]];
        let args = data[at + PRINTF_PREFIX_WORDS as usize..end].to_vec();
        out.push(PrintfMessage {
            stage_index,
            message_id,
            location,
            args,
        });
        at = end;
    }
    out
}
