//! Minimal reflection over a module's entry points and interface variables.

use crate::{AnnotateError, ShaderStage};
use prism_spirv::opcode::{decoration, StorageClass};
use prism_spirv::{Editor, EntryPoint, Id, Instruction, Op, Section, TypeDesc};

/// A shader-interface global variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceVar {
    pub id: Id,
    /// Pointer type declared on the `OpVariable`.
    pub pointer_type: Id,
    /// Pointee type (the value type the shader loads/stores).
    pub value_type: Id,
    pub storage_class: StorageClass,
    pub location: Option<u32>,
    pub builtin: Option<u32>,
}

/// Reflection of one entry point: its declaration plus its input and output
/// interface variables.
#[derive(Debug, Clone)]
pub struct EntryReflection {
    pub entry: EntryPoint,
    pub stage: ShaderStage,
    pub inputs: Vec<InterfaceVar>,
    pub outputs: Vec<InterfaceVar>,
}

/// Reflects the entry point called `name`.
pub fn reflect_entry(ed: &Editor, name: &str) -> Result<EntryReflection, AnnotateError> {
    let entry = ed
        .module()
        .entry_points()
        .into_iter()
        .find(|ep| ep.name == name)
        .ok_or_else(|| AnnotateError::MissingEntryPoint(name.to_string()))?;
    let stage = ShaderStage::from_execution_model(entry.execution_model);

    let mut inputs = Vec::new();
    let mut outputs = Vec::new();
    for inst in ed.module().preamble() {
        if inst.op() != Op::VARIABLE {
            continue;
        }
        let (Some(ptr_ty), Some(result), Some(sc)) =
            (inst.operand(0), inst.operand(1), inst.operand(2))
        else {
            continue;
        };
        let Some(storage_class) = StorageClass::from_u32(sc) else {
            continue;
        };
        if storage_class != StorageClass::Input && storage_class != StorageClass::Output {
            continue;
        }
        let id = Id(result);
        if !entry.interface.contains(&id) {
            continue;
        }
        let value_type = match ed.type_of(Id(ptr_ty))? {
            TypeDesc::Pointer { pointee, .. } => *pointee,
            _ => continue,
        };

        let mut location = None;
        let mut builtin = None;
        for (dec, operands) in ed.decorations_of(id) {
            match dec {
                decoration::LOCATION => location = operands.first().copied(),
                decoration::BUILT_IN => builtin = operands.first().copied(),
                _ => {}
            }
        }

        let var = InterfaceVar {
            id,
            pointer_type: Id(ptr_ty),
            value_type,
            storage_class,
            location,
            builtin,
        };
        if storage_class == StorageClass::Input {
            inputs.push(var);
        } else {
            outputs.push(var);
        }
    }

    // Deterministic ordering: by location, builtins (no location) last.
    let sort_key = |v: &InterfaceVar| (v.location.is_none(), v.location.unwrap_or(0), v.id);
    inputs.sort_by_key(sort_key);
    outputs.sort_by_key(sort_key);

    Ok(EntryReflection {
        entry,
        stage,
        inputs,
        outputs,
    })
}

/// Id of the input variable decorated with the given `BuiltIn`, synthesizing
/// one (and appending it to the entry point's interface) when the shader
/// never declared it.
pub(crate) fn find_or_add_builtin(
    ed: &mut Editor,
    entry: &str,
    which: u32,
    value_type: Id,
) -> Result<Id, AnnotateError> {
    for inst in ed.module().preamble() {
        if inst.op() == Op::DECORATE
            && inst.operand(1) == Some(decoration::BUILT_IN)
            && inst.operand(2) == Some(which)
        {
            if let Some(target) = inst.operand(0) {
                return Ok(Id(target));
            }
        }
    }
    let ptr = ed.type_ptr(StorageClass::Input, value_type);
    let var = ed.alloc_id();
    ed.module_mut().insert_in_section(
        Section::TypesConstantsGlobals,
        Instruction::new(Op::VARIABLE, &[ptr.0, var.0, StorageClass::Input as u32]),
    );
    ed.decorate(var, decoration::BUILT_IN, &[which]);

    let index = ed
        .module()
        .preamble()
        .iter()
        .position(|inst| {
            inst.op() == Op::ENTRY_POINT
                && inst.decode_string(2).map(|(n, _)| n) == Some(entry.to_string())
        })
        .ok_or_else(|| AnnotateError::MissingEntryPoint(entry.to_string()))?;
    if let Some(inst) = ed.pre_modify(index) {
        inst.push_operand(var.0);
    }
    ed.post_modify();
    Ok(var)
}
