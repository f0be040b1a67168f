//! Task/mesh shader output capture.
//!
//! Mesh and task output sizes are per-invocation data-dependent, so capture
//! is a two-pass count-then-commit protocol:
//!
//! 1. **Count pass**: the patched shader records its real counts (mesh vertex
//!    and primitive counts, task dispatch size) into a per-workgroup slot and
//!    then zeroes the values it hands to the pipeline, suppressing the real
//!    amplification. A CPU readback of the slots sizes the final allocation.
//! 2. **Commit pass**: the shader runs for real; every output-variable store
//!    is mirrored into a packed meshlet record alongside the original store.
//!
//! Each meshlet record starts with a 32-byte header (real and committed
//! vertex/primitive counts), then the index block, then the per-vertex and
//! per-primitive blocks. Primitive blocks precede vertex blocks only when the
//! shader declares `PerPrimitiveEXT` outputs.

use std::collections::HashMap;

use crate::emit::Body;
use crate::reflect::{find_or_add_builtin, reflect_entry, InterfaceVar};
use crate::strategy::{AddressMode, PointerStrategy, StrategyVars, RESERVED_BINDING_COUNT};
use crate::{AnnotateError, ShaderStage};
use prism_spirv::opcode::{builtin, decoration, execution_mode, Op};
use prism_spirv::{
    compute_layout, plan_struct, Editor, Id, Instruction, Module, SpecValues, TypeDesc,
};

/// Meshlet header size: real vertex count, real primitive count, committed
/// vertex count, committed primitive count, four reserved words.
pub const MESHLET_HEADER_BYTES: u32 = 32;

/// Task slot: dispatch x/y/z plus a payload word count, then payload words.
pub const TASK_HEADER_WORDS: u32 = 4;

/// Which pass of the count-then-commit protocol is being patched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapturePass {
    Count,
    Commit,
}

#[derive(Debug, Clone)]
pub struct MeshCaptureConfig {
    pub entry: String,
    pub mode: AddressMode,
    pub pass: CapturePass,
}

/// Byte layout of one meshlet record, computed once per annotated variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeshletLayout {
    pub max_vertices: u32,
    pub max_primitives: u32,
    pub indices_per_prim: u32,
    pub vertex_stride: u32,
    pub primitive_stride: u32,
    pub index_offset: u32,
    pub vertex_offset: u32,
    pub primitive_offset: u32,
    /// Total bytes per meshlet, 16-aligned.
    pub total_size: u32,
    /// Primitive block laid out before the vertex block.
    pub primitives_first: bool,
}

fn align16(v: u32) -> u32 {
    (v + 15) & !15
}

/// Plans the meshlet record blocks.
pub fn plan_meshlet_layout(
    max_vertices: u32,
    max_primitives: u32,
    indices_per_prim: u32,
    vertex_stride: u32,
    primitive_stride: u32,
    primitives_first: bool,
) -> MeshletLayout {
    let index_offset = MESHLET_HEADER_BYTES;
    let index_bytes = max_primitives * indices_per_prim * 4;
    let after_indices = align16(index_offset + index_bytes);
    let vertex_bytes = max_vertices * vertex_stride;
    let primitive_bytes = max_primitives * primitive_stride;
    let (vertex_offset, primitive_offset, end) = if primitives_first {
        let primitive_offset = after_indices;
        let vertex_offset = align16(primitive_offset + primitive_bytes);
        (vertex_offset, primitive_offset, vertex_offset + vertex_bytes)
    } else {
        let vertex_offset = after_indices;
        let primitive_offset = align16(vertex_offset + vertex_bytes);
        (vertex_offset, primitive_offset, primitive_offset + primitive_bytes)
    };
    MeshletLayout {
        max_vertices,
        max_primitives,
        indices_per_prim,
        vertex_stride,
        primitive_stride,
        index_offset,
        vertex_offset,
        primitive_offset,
        total_size: align16(end),
        primitives_first,
    }
}

/// Per-meshlet counts read back after the count pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MeshletCounts {
    pub vertices: u32,
    pub primitives: u32,
}

/// Decodes the header of every meshlet slot from a readback buffer.
pub fn decode_meshlet_counts(bytes: &[u8], layout: &MeshletLayout, groups: u32) -> Vec<MeshletCounts> {
    let mut out = Vec::with_capacity(groups as usize);
    let stride = layout.total_size as usize;
    for g in 0..groups as usize {
        let base = g * stride;
        let word = |at: usize| -> u32 {
            bytes
                .get(base + at * 4..base + at * 4 + 4)
                .and_then(|b| b.try_into().ok())
                .map(u32::from_le_bytes)
                .unwrap_or(0)
        };
        out.push(MeshletCounts {
            vertices: word(0),
            primitives: word(1),
        });
    }
    out
}

/// True when no group produced any output; the fetch surfaces a status
/// string instead of a zero-length-but-valid result.
pub fn all_counts_empty(counts: &[MeshletCounts]) -> bool {
    counts.iter().all(|c| c.vertices == 0 && c.primitives == 0)
}

/// Output of a mesh/task annotation: patched words plus the layout contract.
#[derive(Debug, Clone)]
pub struct MeshCaptureShader {
    pub words: Vec<u32>,
    pub layout: MeshletLayout,
}

/// Category of one mesh output variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputKind {
    Indices,
    PerVertex,
    PerPrimitive,
}

#[derive(Debug, Clone)]
struct MeshOutput {
    var: InterfaceVar,
    kind: OutputKind,
    /// Element type of the per-vertex/per-primitive array.
    element_type: Id,
    /// Byte offset of this variable within its record.
    record_offset: u32,
}

/// Synthesized builtin inputs for address computation.
struct BuiltinInputs {
    workgroup_id: Id,
    num_workgroups: Id,
    local_index: Id,
}

pub fn annotate_mesh_shader(
    words: &[u32],
    config: &MeshCaptureConfig,
) -> Result<MeshCaptureShader, AnnotateError> {
    let module = Module::parse(words)?;
    let mut ed = Editor::new(module);
    let reflection = reflect_entry(&ed, &config.entry)?;
    if reflection.stage != ShaderStage::Mesh {
        return Err(AnnotateError::WrongStage {
            name: config.entry.clone(),
            found: reflection.stage,
            expected: ShaderStage::Mesh,
        });
    }

    if config.mode == AddressMode::DescriptorBinding {
        PointerStrategy::shift_user_bindings(&mut ed, RESERVED_BINDING_COUNT);
    }
    let strategy = PointerStrategy::new(config.mode, 1);
    let vars = strategy.prepare(&mut ed);

    let (max_vertices, max_primitives) = output_limits(&ed, reflection.entry.function)?;
    let outputs = classify_outputs(&mut ed, &reflection.outputs)?;
    let layout = plan_from_outputs(&mut ed, &outputs, max_vertices, max_primitives)?;
    let outputs = assign_record_offsets(&mut ed, outputs)?;
    let builtins = synthesize_builtins(&mut ed, &config.entry)?;

    patch_set_mesh_outputs(&mut ed, &strategy, &vars, &layout, &builtins, config.pass)?;
    if config.pass == CapturePass::Commit {
        mirror_output_stores(&mut ed, &strategy, &vars, &layout, &outputs, &builtins)?;
    }

    Ok(MeshCaptureShader {
        words: ed.finish().words(),
        layout,
    })
}

pub fn annotate_task_shader(
    words: &[u32],
    config: &MeshCaptureConfig,
) -> Result<Vec<u32>, AnnotateError> {
    let module = Module::parse(words)?;
    let mut ed = Editor::new(module);
    let reflection = reflect_entry(&ed, &config.entry)?;
    if reflection.stage != ShaderStage::Task {
        return Err(AnnotateError::WrongStage {
            name: config.entry.clone(),
            found: reflection.stage,
            expected: ShaderStage::Task,
        });
    }

    if config.mode == AddressMode::DescriptorBinding {
        PointerStrategy::shift_user_bindings(&mut ed, RESERVED_BINDING_COUNT);
    }
    let strategy = PointerStrategy::new(config.mode, 1);
    let vars = strategy.prepare(&mut ed);
    let builtins = synthesize_builtins(&mut ed, &config.entry)?;

    patch_emit_mesh_tasks(&mut ed, &strategy, &vars, &builtins, config.pass)?;
    Ok(ed.finish().words())
}

/// Reads `OutputVertices` and `OutputPrimitivesEXT` for the entry function.
fn output_limits(ed: &Editor, function: Id) -> Result<(u32, u32), AnnotateError> {
    let mut vertices = None;
    let mut primitives = None;
    for inst in ed.module().preamble() {
        if inst.op() != Op::EXECUTION_MODE || inst.operand(0) != Some(function.0) {
            continue;
        }
        match inst.operand(1) {
            Some(execution_mode::OUTPUT_VERTICES) => vertices = inst.operand(2),
            Some(execution_mode::OUTPUT_PRIMITIVES_EXT) => primitives = inst.operand(2),
            _ => {}
        }
    }
    match (vertices, primitives) {
        (Some(v), Some(p)) => Ok((v, p)),
        _ => Err(AnnotateError::MissingMeshInstruction(
            "OutputVertices/OutputPrimitivesEXT execution mode",
        )),
    }
}

fn classify_outputs(
    ed: &mut Editor,
    outputs: &[InterfaceVar],
) -> Result<Vec<MeshOutput>, AnnotateError> {
    let mut out = Vec::with_capacity(outputs.len());
    for var in outputs {
        let element_type = match ed.type_of(var.value_type)? {
            TypeDesc::Array { element, .. } => *element,
            // Non-arrayed outputs do not participate in meshlet records.
            _ => continue,
        };
        let kind = if matches!(
            var.builtin,
            Some(
                builtin::PRIMITIVE_POINT_INDICES_EXT
                    | builtin::PRIMITIVE_LINE_INDICES_EXT
                    | builtin::PRIMITIVE_TRIANGLE_INDICES_EXT
            )
        ) {
            OutputKind::Indices
        } else if ed
            .decorations_of(var.id)
            .iter()
            .any(|(d, _)| *d == decoration::PER_PRIMITIVE_EXT)
        {
            OutputKind::PerPrimitive
        } else {
            OutputKind::PerVertex
        };
        out.push(MeshOutput {
            var: var.clone(),
            kind,
            element_type,
            record_offset: 0,
        });
    }
    Ok(out)
}

fn plan_from_outputs(
    ed: &mut Editor,
    outputs: &[MeshOutput],
    max_vertices: u32,
    max_primitives: u32,
) -> Result<MeshletLayout, AnnotateError> {
    let spec = SpecValues::new();
    let vertex_members: Vec<Id> = outputs
        .iter()
        .filter(|o| o.kind == OutputKind::PerVertex)
        .map(|o| o.element_type)
        .collect();
    let prim_members: Vec<Id> = outputs
        .iter()
        .filter(|o| o.kind == OutputKind::PerPrimitive)
        .map(|o| o.element_type)
        .collect();
    let vertex_stride = if vertex_members.is_empty() {
        0
    } else {
        plan_struct(ed, &vertex_members, &spec)?.size
    };
    let primitive_stride = if prim_members.is_empty() {
        0
    } else {
        plan_struct(ed, &prim_members, &spec)?.size
    };

    let indices_per_prim = outputs
        .iter()
        .find(|o| o.kind == OutputKind::Indices)
        .map(|o| match ed.type_of(o.element_type) {
            Ok(TypeDesc::Vector { count, .. }) => *count,
            _ => 1,
        })
        .ok_or(AnnotateError::MissingMeshInstruction(
            "primitive indices builtin output",
        ))?;

    let primitives_first = !prim_members.is_empty();
    Ok(plan_meshlet_layout(
        max_vertices,
        max_primitives,
        indices_per_prim,
        vertex_stride,
        primitive_stride,
        primitives_first,
    ))
}

/// Fills `record_offset` for every per-vertex and per-primitive output.
fn assign_record_offsets(
    ed: &mut Editor,
    mut outputs: Vec<MeshOutput>,
) -> Result<Vec<MeshOutput>, AnnotateError> {
    let spec = SpecValues::new();
    for kind in [OutputKind::PerVertex, OutputKind::PerPrimitive] {
        let members: Vec<Id> = outputs
            .iter()
            .filter(|o| o.kind == kind)
            .map(|o| o.element_type)
            .collect();
        if members.is_empty() {
            continue;
        }
        let planned = plan_struct(ed, &members, &spec)?;
        let mut member = 0usize;
        for output in outputs.iter_mut().filter(|o| o.kind == kind) {
            output.record_offset = planned.members[member].offset;
            member += 1;
        }
    }
    Ok(outputs)
}

/// Finds or creates the builtin input variables the capture addresses need,
/// appending any new variable to the entry point's interface.
fn synthesize_builtins(ed: &mut Editor, entry: &str) -> Result<BuiltinInputs, AnnotateError> {
    let u32_ty = ed.type_u32();
    let uvec3 = ed.type_vec(u32_ty, 3);
    let workgroup_id = find_or_add_builtin(ed, entry, builtin::WORKGROUP_ID, uvec3)?;
    let num_workgroups = find_or_add_builtin(ed, entry, builtin::NUM_WORKGROUPS, uvec3)?;
    let local_index = find_or_add_builtin(ed, entry, builtin::LOCAL_INVOCATION_INDEX, u32_ty)?;
    Ok(BuiltinInputs {
        workgroup_id,
        num_workgroups,
        local_index,
    })
}

/// Emits the flattened workgroup slot index:
/// `wg.x + wg.y * num.x + wg.z * num.x * num.y`.
fn emit_group_slot(ed: &mut Editor, body: &mut Body, builtins: &BuiltinInputs) -> Id {
    let u32_ty = ed.type_u32();
    let uvec3 = ed.type_vec(u32_ty, 3);
    let wg = body.load(ed, uvec3, builtins.workgroup_id);
    let num = body.load(ed, uvec3, builtins.num_workgroups);
    let wx = body.emit(ed, Op::COMPOSITE_EXTRACT, u32_ty, &[wg.0, 0]);
    let wy = body.emit(ed, Op::COMPOSITE_EXTRACT, u32_ty, &[wg.0, 1]);
    let wz = body.emit(ed, Op::COMPOSITE_EXTRACT, u32_ty, &[wg.0, 2]);
    let nx = body.emit(ed, Op::COMPOSITE_EXTRACT, u32_ty, &[num.0, 0]);
    let ny = body.emit(ed, Op::COMPOSITE_EXTRACT, u32_ty, &[num.0, 1]);
    let row = body.binop(ed, Op::I_MUL, u32_ty, wy, nx);
    let plane_size = body.binop(ed, Op::I_MUL, u32_ty, nx, ny);
    let plane = body.binop(ed, Op::I_MUL, u32_ty, wz, plane_size);
    let partial = body.binop(ed, Op::I_ADD, u32_ty, wx, row);
    body.binop(ed, Op::I_ADD, u32_ty, partial, plane)
}

/// Wraps `guarded` in `if (LocalInvocationIndex == 0) { ... }`.
fn guard_thread_zero(
    ed: &mut Editor,
    builtins: &BuiltinInputs,
    guarded: Body,
) -> Vec<Instruction> {
    let u32_ty = ed.type_u32();
    let bool_ty = ed.type_bool();
    let zero = ed.const_u32(0);
    let mut body = Body::new();
    let local = body.load(ed, u32_ty, builtins.local_index);
    let is_zero = body.binop(ed, Op::I_EQUAL, bool_ty, local, zero);
    let then_label = ed.alloc_id();
    let merge_label = ed.alloc_id();
    body.emit_no_result(Op::SELECTION_MERGE, &[merge_label.0, 0]);
    body.emit_no_result(Op::BRANCH_CONDITIONAL, &[is_zero.0, then_label.0, merge_label.0]);
    body.push(Instruction::new(Op::LABEL, &[then_label.0]));
    for inst in guarded.instructions() {
        body.push(inst);
    }
    body.emit_no_result(Op::BRANCH, &[merge_label.0]);
    body.push(Instruction::new(Op::LABEL, &[merge_label.0]));
    body.instructions()
}

/// Patches every `SetMeshOutputsEXT`: record the real counts at thread zero,
/// and in the count pass zero the operands handed to the pipeline.
fn patch_set_mesh_outputs(
    ed: &mut Editor,
    strategy: &PointerStrategy,
    vars: &StrategyVars,
    layout: &MeshletLayout,
    builtins: &BuiltinInputs,
    pass: CapturePass,
) -> Result<(), AnnotateError> {
    let sites: Vec<usize> = ed
        .module()
        .functions()
        .iter()
        .enumerate()
        .filter(|(_, inst)| inst.op() == Op::SET_MESH_OUTPUTS_EXT)
        .map(|(i, _)| i)
        .collect();
    if sites.is_empty() {
        return Err(AnnotateError::MissingMeshInstruction("SetMeshOutputsEXT"));
    }

    let u32_ty = ed.type_u32();
    // Back to front so earlier indices stay valid across splices.
    for site in sites.into_iter().rev() {
        let inst = &ed.module().functions()[site];
        let (Some(vert_count), Some(prim_count)) = (inst.operand(0), inst.operand(1)) else {
            continue;
        };

        let mut capture = Body::new();
        let slot = emit_group_slot(ed, &mut capture, builtins);
        let slot_words = ed.const_u32(layout.total_size / 4);
        let base = capture.binop(ed, Op::I_MUL, u32_ty, slot, slot_words);
        let one = ed.const_u32(1);
        let word1 = capture.binop(ed, Op::I_ADD, u32_ty, base, one);
        strategy.store_word(ed, &mut capture, vars, 0, base, Id(vert_count));
        strategy.store_word(ed, &mut capture, vars, 0, word1, Id(prim_count));
        let insert = guard_thread_zero(ed, builtins, capture);

        let functions = ed.module_mut().functions_mut();
        functions.splice(site..site, insert);

        if pass == CapturePass::Count {
            let zero = ed.const_u32(0);
            // The instruction moved past the spliced prologue.
            let functions = ed.module_mut().functions_mut();
            let moved = functions
                .iter_mut()
                .skip(site)
                .find(|inst| inst.op() == Op::SET_MESH_OUTPUTS_EXT);
            if let Some(inst) = moved {
                inst.set_operand(0, zero.0);
                inst.set_operand(1, zero.0);
            }
        }
    }
    Ok(())
}

/// Patches every `EmitMeshTasksEXT`: record the dispatch size (and payload
/// presence) at thread zero; in the count pass, zero the real dispatch.
fn patch_emit_mesh_tasks(
    ed: &mut Editor,
    strategy: &PointerStrategy,
    vars: &StrategyVars,
    builtins: &BuiltinInputs,
    pass: CapturePass,
) -> Result<(), AnnotateError> {
    let sites: Vec<usize> = ed
        .module()
        .functions()
        .iter()
        .enumerate()
        .filter(|(_, inst)| inst.op() == Op::EMIT_MESH_TASKS_EXT)
        .map(|(i, _)| i)
        .collect();
    if sites.is_empty() {
        return Err(AnnotateError::MissingMeshInstruction("EmitMeshTasksEXT"));
    }

    let u32_ty = ed.type_u32();
    for site in sites.into_iter().rev() {
        let inst = &ed.module().functions()[site];
        let dims = [inst.operand(0), inst.operand(1), inst.operand(2)];
        let has_payload = inst.operand(3).is_some();

        let mut capture = Body::new();
        let slot = emit_group_slot(ed, &mut capture, builtins);
        let slot_words = ed.const_u32(TASK_HEADER_WORDS);
        let base = capture.binop(ed, Op::I_MUL, u32_ty, slot, slot_words);
        for (k, dim) in dims.iter().enumerate() {
            let Some(dim) = dim else { continue };
            let off = ed.const_u32(k as u32);
            let at = capture.binop(ed, Op::I_ADD, u32_ty, base, off);
            strategy.store_word(ed, &mut capture, vars, 0, at, Id(*dim));
        }
        let marker = ed.const_u32(u32::from(has_payload));
        let three = ed.const_u32(3);
        let at = capture.binop(ed, Op::I_ADD, u32_ty, base, three);
        strategy.store_word(ed, &mut capture, vars, 0, at, marker);
        let insert = guard_thread_zero(ed, builtins, capture);

        let functions = ed.module_mut().functions_mut();
        functions.splice(site..site, insert);

        if pass == CapturePass::Count {
            let zero = ed.const_u32(0);
            let functions = ed.module_mut().functions_mut();
            let moved = functions
                .iter_mut()
                .skip(site)
                .find(|inst| inst.op() == Op::EMIT_MESH_TASKS_EXT);
            if let Some(inst) = moved {
                for k in 0..3 {
                    inst.set_operand(k, zero.0);
                }
            }
        }
    }
    Ok(())
}

/// A store site to mirror: the function index of the `OpStore`, the target
/// output, the dynamic element index id, and the static byte offset inside
/// the element.
struct MirrorSite {
    index: usize,
    kind: OutputKind,
    record_offset: u32,
    element_index: Id,
    inner_offset: u32,
    value: Id,
    value_type: Id,
}

/// Mirrors every store through an output-variable access chain into the
/// meshlet record, leaving the original store in place.
fn mirror_output_stores(
    ed: &mut Editor,
    strategy: &PointerStrategy,
    vars: &StrategyVars,
    layout: &MeshletLayout,
    outputs: &[MeshOutput],
    builtins: &BuiltinInputs,
) -> Result<(), AnnotateError> {
    let by_var: HashMap<u32, &MeshOutput> =
        outputs.iter().map(|o| (o.var.id.0, o)).collect();
    let spec = SpecValues::new();

    // Chain result id -> (output, element index, accumulated byte offset,
    // current pointee type).
    let mut chains: HashMap<u32, (u32, Id, u32, Id)> = HashMap::new();
    let mut sites: Vec<MirrorSite> = Vec::new();

    for (index, inst) in ed.module().functions().iter().enumerate() {
        match inst.op() {
            Op::ACCESS_CHAIN | Op::IN_BOUNDS_ACCESS_CHAIN => {
                let (Some(result), Some(base)) = (inst.operand(1), inst.operand(2)) else {
                    continue;
                };
                let indices: Vec<u32> = inst.operands()[3..].to_vec();
                if let Some(output) = by_var.get(&base) {
                    // First index selects the element; the rest are static.
                    let Some(&element) = indices.first() else {
                        continue;
                    };
                    let (offset, ty) = walk_static_indices(
                        ed,
                        output.element_type,
                        &indices[1..],
                        &spec,
                    )?;
                    chains.insert(result, (base, Id(element), offset, ty));
                } else if let Some(&(root, element, offset, ty)) = chains.get(&base) {
                    let (extra, ty) = walk_static_indices(ed, ty, &indices, &spec)?;
                    chains.insert(result, (root, element, offset + extra, ty));
                }
            }
            Op::STORE => {
                let (Some(pointer), Some(value)) = (inst.operand(0), inst.operand(1)) else {
                    continue;
                };
                if let Some(&(root, element, offset, ty)) = chains.get(&pointer) {
                    let output = by_var[&root];
                    sites.push(MirrorSite {
                        index,
                        kind: output.kind,
                        record_offset: output.record_offset,
                        element_index: element,
                        inner_offset: offset,
                        value: Id(value),
                        value_type: ty,
                    });
                }
            }
            _ => {}
        }
    }

    let u32_ty = ed.type_u32();
    for site in sites.into_iter().rev() {
        let mut capture = Body::new();
        let slot = emit_group_slot(ed, &mut capture, builtins);
        let slot_words = ed.const_u32(layout.total_size / 4);
        let meshlet_base = capture.binop(ed, Op::I_MUL, u32_ty, slot, slot_words);

        let (block_offset, stride) = match site.kind {
            OutputKind::Indices => (layout.index_offset, layout.indices_per_prim * 4),
            OutputKind::PerVertex => (layout.vertex_offset, layout.vertex_stride),
            OutputKind::PerPrimitive => (layout.primitive_offset, layout.primitive_stride),
        };
        let stride_words = ed.const_u32((stride / 4).max(1));
        let elem_words = capture.binop(
            ed,
            Op::I_MUL,
            u32_ty,
            site.element_index,
            stride_words,
        );
        let static_words =
            ed.const_u32(block_offset / 4 + (site.record_offset + site.inner_offset) / 4);
        let with_block = capture.binop(ed, Op::I_ADD, u32_ty, elem_words, static_words);
        let base = capture.binop(ed, Op::I_ADD, u32_ty, meshlet_base, with_block);

        mirror_value(
            ed,
            &mut capture,
            strategy,
            vars,
            base,
            site.value,
            site.value_type,
        )?;
        let insert = capture.instructions();
        let at = site.index + 1;
        ed.module_mut().functions_mut().splice(at..at, insert);
    }
    Ok(())
}

/// Folds constant trailing access-chain indices into a byte offset.
fn walk_static_indices(
    ed: &Editor,
    mut ty: Id,
    indices: &[u32],
    spec: &SpecValues,
) -> Result<(u32, Id), AnnotateError> {
    let mut offset = 0u32;
    for &index_id in indices {
        let index = ed.eval_constant(Id(index_id), spec).map_err(|_| {
            AnnotateError::UnsupportedOutputType {
                context: "dynamic non-leading access-chain index in mesh output",
            }
        })? as u32;
        match ed.type_of(ty)?.clone() {
            TypeDesc::Vector { component, .. } => {
                let comp = compute_layout(ed, component, spec)?;
                offset += comp.size * index;
                ty = component;
            }
            TypeDesc::Struct { members, .. } => {
                let planned = plan_struct(ed, &members, spec)?;
                let member = planned.members.get(index as usize).ok_or(
                    AnnotateError::UnsupportedOutputType {
                        context: "access-chain member index out of range",
                    },
                )?;
                offset += member.offset;
                ty = members[index as usize];
            }
            TypeDesc::Array { element, .. } => {
                let elem = compute_layout(ed, ty, spec)?;
                offset += elem.array_stride.unwrap_or(0) * index;
                ty = element;
            }
            _ => {
                return Err(AnnotateError::UnsupportedOutputType {
                    context: "access chain walks into a non-composite type",
                })
            }
        }
    }
    Ok((offset, ty))
}

/// Stores a 32-bit scalar or vector value into the capture buffer word by
/// word.
fn mirror_value(
    ed: &mut Editor,
    body: &mut Body,
    strategy: &PointerStrategy,
    vars: &StrategyVars,
    base: Id,
    value: Id,
    ty: Id,
) -> Result<(), AnnotateError> {
    let u32_ty = ed.type_u32();
    let scalar_word = |ed: &mut Editor, body: &mut Body, v: Id, desc: &TypeDesc| match desc {
        TypeDesc::Int { width: 32, signed: false } => Some(v),
        TypeDesc::Int { width: 32, signed: true } | TypeDesc::Float { width: 32 } => {
            let u32_ty = ed.type_u32();
            Some(body.emit(ed, Op::BITCAST, u32_ty, &[v.0]))
        }
        _ => None,
    };

    match ed.type_of(ty)?.clone() {
        TypeDesc::Vector { component, count } => {
            let comp_desc = ed.type_of(component)?.clone();
            for i in 0..count {
                let comp = body.emit(ed, Op::COMPOSITE_EXTRACT, component, &[value.0, i]);
                let word = scalar_word(ed, body, comp, &comp_desc).ok_or(
                    AnnotateError::UnsupportedOutputType {
                        context: "mesh output component is not a 32-bit scalar",
                    },
                )?;
                let off = ed.const_u32(i);
                let at = body.binop(ed, Op::I_ADD, u32_ty, base, off);
                strategy.store_word(ed, body, vars, 0, at, word);
            }
            Ok(())
        }
        desc => {
            let word = scalar_word(ed, body, value, &desc).ok_or(
                AnnotateError::UnsupportedOutputType {
                    context: "mesh output value is not a 32-bit scalar or vector",
                },
            )?;
            strategy.store_word(ed, body, vars, 0, base, word);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prism_spirv::opcode::{capability, ExecutionModel, StorageClass};
    use prism_spirv::{Section, SPIRV_MAGIC};

    #[test]
    fn meshlet_layout_orders_blocks_by_per_primitive_flag() {
        // 64 verts of 16 bytes, 126 triangles of 8 bytes, 3 indices each.
        let vertex_first = plan_meshlet_layout(64, 126, 3, 16, 8, false);
        assert_eq!(vertex_first.index_offset, 32);
        assert!(vertex_first.vertex_offset < vertex_first.primitive_offset);
        assert_eq!(vertex_first.index_offset % 16, 0);
        assert_eq!(vertex_first.vertex_offset % 16, 0);
        assert_eq!(vertex_first.total_size % 16, 0);

        let prim_first = plan_meshlet_layout(64, 126, 3, 16, 8, true);
        assert!(prim_first.primitive_offset < prim_first.vertex_offset);
        assert_eq!(prim_first.total_size, vertex_first.total_size);
    }

    #[test]
    fn meshlet_layout_accounts_for_every_block() {
        let l = plan_meshlet_layout(3, 1, 3, 16, 0, false);
        // header 32 + indices 12 (align 48) + vertices 48 = 96.
        assert_eq!(l.index_offset, 32);
        assert_eq!(l.vertex_offset, 48);
        assert_eq!(l.total_size, 96);
    }

    #[test]
    fn count_decode_and_empty_detection() {
        let layout = plan_meshlet_layout(3, 1, 3, 16, 0, false);
        let mut bytes = vec![0u8; layout.total_size as usize * 2];
        // Group 1 reports 3 vertices, 1 primitive.
        let base = layout.total_size as usize;
        bytes[base..base + 4].copy_from_slice(&3u32.to_le_bytes());
        bytes[base + 4..base + 8].copy_from_slice(&1u32.to_le_bytes());

        let counts = decode_meshlet_counts(&bytes, &layout, 2);
        assert_eq!(counts[0], MeshletCounts { vertices: 0, primitives: 0 });
        assert_eq!(counts[1], MeshletCounts { vertices: 3, primitives: 1 });
        assert!(!all_counts_empty(&counts));
        assert!(all_counts_empty(&counts[..1]));
    }

    /// Assembles a minimal mesh shader: vec4 positions array, uvec3 triangle
    /// indices array, SetMeshOutputsEXT(3, 1), one store to each output.
    fn toy_mesh_shader() -> Vec<u32> {
        let header = vec![SPIRV_MAGIC, 0x0001_0600, 0, 100, 0];
        let module = Module::parse(
            &[
                header,
                vec![(2 << 16) | 17, capability::SHADER],
                vec![(2 << 16) | 17, capability::MESH_SHADING_EXT],
                vec![(3 << 16) | 14, 0, 1],
            ]
            .concat(),
        )
        .expect("parses");
        let mut ed = Editor::new(module);

        let u32_ty = ed.type_u32();
        let f32_ty = ed.type_f32();
        let vec4 = ed.type_vec(f32_ty, 4);
        let uvec3 = ed.type_vec(u32_ty, 3);
        let three = ed.const_u32(3);
        let one_c = ed.const_u32(1);
        let pos_array = ed.declare_type(TypeDesc::Array {
            element: vec4,
            length: three,
            stride: None,
        });
        let idx_array = ed.declare_type(TypeDesc::Array {
            element: uvec3,
            length: one_c,
            stride: None,
        });
        let pos_ptr = ed.type_ptr(StorageClass::Output, pos_array);
        let idx_ptr = ed.type_ptr(StorageClass::Output, idx_array);
        let pos_elem_ptr = ed.type_ptr(StorageClass::Output, vec4);
        let idx_elem_ptr = ed.type_ptr(StorageClass::Output, uvec3);

        let positions = ed.alloc_id();
        let indices = ed.alloc_id();
        for (var, ptr) in [(positions, pos_ptr), (indices, idx_ptr)] {
            ed.module_mut().insert_in_section(
                Section::TypesConstantsGlobals,
                Instruction::new(Op::VARIABLE, &[ptr.0, var.0, StorageClass::Output as u32]),
            );
        }
        ed.decorate(positions, decoration::BUILT_IN, &[builtin::POSITION]);
        ed.decorate(
            indices,
            decoration::BUILT_IN,
            &[builtin::PRIMITIVE_TRIANGLE_INDICES_EXT],
        );

        let void_ty = ed.type_void();
        let fn_ty = ed.declare_type(TypeDesc::Function {
            return_type: void_ty,
            params: Vec::new(),
        });
        let main_fn = ed.alloc_id();
        let mut ep = vec![ExecutionModel::MeshEXT as u32, main_fn.0];
        ep.extend(Instruction::encode_string("main"));
        ep.push(positions.0);
        ep.push(indices.0);
        ed.module_mut()
            .insert_in_section(Section::EntryPoints, Instruction::new(Op::ENTRY_POINT, &ep));
        for (mode, value) in [
            (execution_mode::OUTPUT_VERTICES, 3),
            (execution_mode::OUTPUT_PRIMITIVES_EXT, 1),
        ] {
            ed.module_mut().insert_in_section(
                Section::ExecutionModes,
                Instruction::new(Op::EXECUTION_MODE, &[main_fn.0, mode, value]),
            );
        }

        let zero = ed.const_u32(0);
        let fzero = ed.const_f32(0.0);
        let fone = ed.const_f32(1.0);
        let pos_value = ed.const_composite(vec4, &[fzero, fzero, fzero, fone]);
        let two = ed.const_u32(2);
        let idx_value = ed.const_composite(uvec3, &[zero, one_c, two]);

        let label = ed.alloc_id();
        let pos_chain = ed.alloc_id();
        let idx_chain = ed.alloc_id();
        let insts = vec![
            Instruction::new(Op::FUNCTION, &[void_ty.0, main_fn.0, 0, fn_ty.0]),
            Instruction::new(Op::LABEL, &[label.0]),
            Instruction::new(Op::SET_MESH_OUTPUTS_EXT, &[three.0, one_c.0]),
            Instruction::new(
                Op::ACCESS_CHAIN,
                &[pos_elem_ptr.0, pos_chain.0, positions.0, zero.0],
            ),
            Instruction::new(Op::STORE, &[pos_chain.0, pos_value.0]),
            Instruction::new(
                Op::ACCESS_CHAIN,
                &[idx_elem_ptr.0, idx_chain.0, indices.0, zero.0],
            ),
            Instruction::new(Op::STORE, &[idx_chain.0, idx_value.0]),
            Instruction::new(Op::RETURN, &[]),
            Instruction::new(Op::FUNCTION_END, &[]),
        ];
        ed.module_mut().functions_mut().extend(insts);
        ed.finish().words()
    }

    fn mesh_config(pass: CapturePass) -> MeshCaptureConfig {
        MeshCaptureConfig {
            entry: "main".to_string(),
            mode: AddressMode::DescriptorBinding,
            pass,
        }
    }

    #[test]
    fn count_pass_zeroes_set_mesh_outputs_and_guards_header_store() {
        let shader = toy_mesh_shader();
        let patched =
            annotate_mesh_shader(&shader, &mesh_config(CapturePass::Count)).expect("patches");
        let module = Module::parse(&patched.words).expect("reparses");

        // Locate the zero constant id.
        let zero_const = module
            .preamble()
            .iter()
            .find(|inst| inst.op() == Op::CONSTANT && inst.operand(2) == Some(0))
            .and_then(|inst| inst.operand(1))
            .expect("has zero constant");
        let set = module
            .functions()
            .iter()
            .find(|inst| inst.op() == Op::SET_MESH_OUTPUTS_EXT)
            .expect("keeps SetMeshOutputsEXT");
        assert_eq!(set.operand(0), Some(zero_const));
        assert_eq!(set.operand(1), Some(zero_const));

        // Thread-zero guard: a conditional branch precedes the patched call.
        let ops: Vec<Op> = module.functions().iter().map(|i| i.op()).collect();
        let set_at = ops
            .iter()
            .position(|&o| o == Op::SET_MESH_OUTPUTS_EXT)
            .unwrap();
        assert!(ops[..set_at].contains(&Op::BRANCH_CONDITIONAL));
        assert!(ops[..set_at].contains(&Op::SELECTION_MERGE));
    }

    #[test]
    fn commit_pass_keeps_real_counts_and_mirrors_stores() {
        let shader = toy_mesh_shader();
        let original_stores = Module::parse(&shader)
            .unwrap()
            .functions()
            .iter()
            .filter(|i| i.op() == Op::STORE)
            .count();
        let patched =
            annotate_mesh_shader(&shader, &mesh_config(CapturePass::Commit)).expect("patches");
        let module = Module::parse(&patched.words).expect("reparses");

        let set = module
            .functions()
            .iter()
            .find(|inst| inst.op() == Op::SET_MESH_OUTPUTS_EXT)
            .expect("keeps SetMeshOutputsEXT");
        // Real counts survive: operands are the 3 and 1 constants.
        let const_value = |id: u32| {
            module
                .preamble()
                .iter()
                .find(|i| i.op() == Op::CONSTANT && i.operand(1) == Some(id))
                .and_then(|i| i.operand(2))
        };
        assert_eq!(set.operand(0).and_then(const_value), Some(3));
        assert_eq!(set.operand(1).and_then(const_value), Some(1));

        // Each original store gains mirrored capture stores.
        let stores = module
            .functions()
            .iter()
            .filter(|i| i.op() == Op::STORE)
            .count();
        assert!(stores > original_stores, "{stores} vs {original_stores}");
    }

    #[test]
    fn layout_derived_from_shader_declarations() {
        let shader = toy_mesh_shader();
        let patched =
            annotate_mesh_shader(&shader, &mesh_config(CapturePass::Count)).expect("patches");
        assert_eq!(patched.layout.max_vertices, 3);
        assert_eq!(patched.layout.max_primitives, 1);
        assert_eq!(patched.layout.indices_per_prim, 3);
        assert_eq!(patched.layout.vertex_stride, 16);
        assert!(!patched.layout.primitives_first);
    }

    #[test]
    fn missing_set_mesh_outputs_is_reported() {
        let shader = toy_mesh_shader();
        // Drop the SetMeshOutputsEXT instruction.
        let mut module = Module::parse(&shader).unwrap();
        module
            .functions_mut()
            .retain(|i| i.op() != Op::SET_MESH_OUTPUTS_EXT);
        let err =
            annotate_mesh_shader(&module.words(), &mesh_config(CapturePass::Count)).unwrap_err();
        assert!(matches!(
            err,
            AnnotateError::MissingMeshInstruction("SetMeshOutputsEXT")
        ));
    }

    /// Minimal task shader: EmitMeshTasksEXT(4, 1, 1).
    fn toy_task_shader() -> Vec<u32> {
        let header = vec![SPIRV_MAGIC, 0x0001_0600, 0, 100, 0];
        let module = Module::parse(
            &[
                header,
                vec![(2 << 16) | 17, capability::SHADER],
                vec![(2 << 16) | 17, capability::MESH_SHADING_EXT],
                vec![(3 << 16) | 14, 0, 1],
            ]
            .concat(),
        )
        .expect("parses");
        let mut ed = Editor::new(module);

        let void_ty = ed.type_void();
        let fn_ty = ed.declare_type(TypeDesc::Function {
            return_type: void_ty,
            params: Vec::new(),
        });
        let main_fn = ed.alloc_id();
        let mut ep = vec![ExecutionModel::TaskEXT as u32, main_fn.0];
        ep.extend(Instruction::encode_string("main"));
        ed.module_mut()
            .insert_in_section(Section::EntryPoints, Instruction::new(Op::ENTRY_POINT, &ep));

        let four = ed.const_u32(4);
        let one = ed.const_u32(1);
        let label = ed.alloc_id();
        let insts = vec![
            Instruction::new(Op::FUNCTION, &[void_ty.0, main_fn.0, 0, fn_ty.0]),
            Instruction::new(Op::LABEL, &[label.0]),
            Instruction::new(Op::EMIT_MESH_TASKS_EXT, &[four.0, one.0, one.0]),
            Instruction::new(Op::FUNCTION_END, &[]),
        ];
        ed.module_mut().functions_mut().extend(insts);
        ed.finish().words()
    }

    #[test]
    fn task_count_pass_suppresses_amplification() {
        let shader = toy_task_shader();
        let patched = annotate_task_shader(&shader, &mesh_config(CapturePass::Count))
            .expect("patches");
        let module = Module::parse(&patched).expect("reparses");

        let zero_const = module
            .preamble()
            .iter()
            .find(|inst| inst.op() == Op::CONSTANT && inst.operand(2) == Some(0))
            .and_then(|inst| inst.operand(1))
            .expect("has zero constant");
        let emit = module
            .functions()
            .iter()
            .find(|inst| inst.op() == Op::EMIT_MESH_TASKS_EXT)
            .expect("keeps EmitMeshTasksEXT");
        for k in 0..3 {
            assert_eq!(emit.operand(k), Some(zero_const));
        }
    }

    #[test]
    fn task_commit_pass_keeps_dispatch_and_records_it() {
        let shader = toy_task_shader();
        let patched = annotate_task_shader(&shader, &mesh_config(CapturePass::Commit))
            .expect("patches");
        let module = Module::parse(&patched).expect("reparses");

        let emit = module
            .functions()
            .iter()
            .find(|inst| inst.op() == Op::EMIT_MESH_TASKS_EXT)
            .expect("keeps EmitMeshTasksEXT");
        let const_value = |id: Option<u32>| {
            module
                .preamble()
                .iter()
                .find(|i| i.op() == Op::CONSTANT && i.operand(1) == id)
                .and_then(|i| i.operand(2))
        };
        assert_eq!(const_value(emit.operand(0)), Some(4));
        // Capture stores were inserted ahead of the emit.
        let ops: Vec<Op> = module.functions().iter().map(|i| i.op()).collect();
        let emit_at = ops.iter().position(|&o| o == Op::EMIT_MESH_TASKS_EXT).unwrap();
        assert!(ops[..emit_at].contains(&Op::STORE) || ops[..emit_at].contains(&Op::ACCESS_CHAIN));
    }
}
