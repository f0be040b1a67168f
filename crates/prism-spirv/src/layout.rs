//! std430-equivalent layout planner for packed output records.
//!
//! The GPU-side writer and the CPU-side reader must agree bit-for-bit without
//! a schema exchange, so this computation is deterministic: the same type
//! graph and the same specialization-constant values always produce the same
//! offsets and strides.
//!
//! Rules:
//! - scalars align to their component byte size;
//! - vectors align to `component * 2` for 2-vectors and `component * 4`
//!   otherwise (3-vectors pad to 4-vector alignment);
//! - structs and arrays-of-structs align to 16 bytes before their first
//!   member, and struct sizes round up to 16;
//! - booleans have no defined memory representation and are stored as u32;
//! - every array gets its own stride; the planner reports the stride so the
//!   caller can declare a stride-decorated array type.

use crate::editor::{Editor, SpecValues, TypeDesc};
use crate::error::SpirvError;
use crate::module::Id;

/// Size/alignment of one laid-out type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeLayout {
    pub size: u32,
    pub align: u32,
    /// Element stride when the type is an array; also the stride the caller
    /// must decorate the synthesized array type with.
    pub array_stride: Option<u32>,
    /// Column stride when the type is a matrix.
    pub matrix_stride: Option<u32>,
}

/// One member of a planned struct.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemberLayout {
    pub offset: u32,
    pub layout: TypeLayout,
}

/// A fully planned struct: per-member offsets plus total size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructLayout {
    pub members: Vec<MemberLayout>,
    pub size: u32,
    pub align: u32,
}

fn align_up(v: u32, align: u32) -> u32 {
    debug_assert!(align.is_power_of_two());
    (v + (align - 1)) & !(align - 1)
}

/// Computes the layout of `ty` under the given spec-constant assignment.
///
/// Pure with respect to its inputs; see the module docs for the packing
/// rules. Runtime arrays are rejected: a packed output record must have a
/// statically known (possibly spec-constant-derived) size.
pub fn compute_layout(
    editor: &Editor,
    ty: Id,
    spec: &SpecValues,
) -> Result<TypeLayout, SpirvError> {
    match editor.type_of(ty)?.clone() {
        // Booleans are stored as 32-bit unsigned integers.
        TypeDesc::Bool => Ok(TypeLayout {
            size: 4,
            align: 4,
            array_stride: None,
            matrix_stride: None,
        }),
        TypeDesc::Int { width, .. } | TypeDesc::Float { width } => {
            let bytes = width / 8;
            Ok(TypeLayout {
                size: bytes,
                align: bytes,
                array_stride: None,
                matrix_stride: None,
            })
        }
        TypeDesc::Vector { component, count } => {
            let comp = compute_layout(editor, component, spec)?;
            let align_mul = if count == 2 { 2 } else { 4 };
            Ok(TypeLayout {
                size: comp.size * count,
                align: comp.size * align_mul,
                array_stride: None,
                matrix_stride: None,
            })
        }
        TypeDesc::Matrix { column, count } => {
            let col = compute_layout(editor, column, spec)?;
            let stride = align_up(col.size, col.align);
            Ok(TypeLayout {
                size: stride * count,
                align: col.align,
                array_stride: None,
                matrix_stride: Some(stride),
            })
        }
        TypeDesc::Array { element, length, .. } => {
            let elem = compute_layout(editor, element, spec)?;
            let len = editor.eval_constant(length, spec)? as u32;
            // Arrays of structs inherit the 16-byte aggregate alignment from
            // their element.
            let align = elem.align;
            let stride = align_up(elem.size, align);
            Ok(TypeLayout {
                size: stride * len,
                align,
                array_stride: Some(stride),
                matrix_stride: None,
            })
        }
        TypeDesc::Struct { members, .. } => {
            let planned = plan_struct(editor, &members, spec)?;
            Ok(TypeLayout {
                size: planned.size,
                align: planned.align,
                array_stride: None,
                matrix_stride: None,
            })
        }
        TypeDesc::RuntimeArray { .. } => Err(SpirvError::UnsupportedLayoutType {
            id: ty,
            context: "runtime array has no statically known size",
        }),
        TypeDesc::Void
        | TypeDesc::Pointer { .. }
        | TypeDesc::Function { .. }
        | TypeDesc::Opaque { .. } => Err(SpirvError::UnsupportedLayoutType {
            id: ty,
            context: "type has no buffer representation",
        }),
    }
}

/// Plans offsets for a struct with the given member types.
pub fn plan_struct(
    editor: &Editor,
    members: &[Id],
    spec: &SpecValues,
) -> Result<StructLayout, SpirvError> {
    let mut cursor = 0u32;
    let mut align = 16u32;
    let mut planned = Vec::with_capacity(members.len());
    for &member in members {
        let layout = compute_layout(editor, member, spec)?;
        let member_align = effective_member_align(editor, member, layout)?;
        align = align.max(member_align);
        let offset = align_up(cursor, member_align);
        cursor = offset + layout.size;
        planned.push(MemberLayout { offset, layout });
    }
    Ok(StructLayout {
        members: planned,
        size: align_up(cursor.max(1), 16).max(16),
        align,
    })
}

/// Aggregates (structs, arrays of structs) align to 16 before their first
/// member regardless of their natural member alignment.
fn effective_member_align(
    editor: &Editor,
    member: Id,
    layout: TypeLayout,
) -> Result<u32, SpirvError> {
    let is_aggregate = match editor.type_of(member)? {
        TypeDesc::Struct { .. } => true,
        TypeDesc::Array { element, .. } => {
            matches!(editor.type_of(*element)?, TypeDesc::Struct { .. })
        }
        _ => false,
    };
    Ok(if is_aggregate {
        layout.align.max(16)
    } else {
        layout.align
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::{Module, SPIRV_MAGIC};

    fn editor() -> Editor {
        let words = vec![
            SPIRV_MAGIC,
            0x0001_0300,
            0,
            200,
            0,
            (2 << 16) | 17,
            1,
            (3 << 16) | 14,
            0,
            1,
        ];
        Editor::new(Module::parse(&words).expect("parses"))
    }

    #[test]
    fn scalar_and_vector_rules() {
        let mut ed = editor();
        let f32_ty = ed.type_f32();
        let vec2 = ed.type_vec(f32_ty, 2);
        let vec3 = ed.type_vec(f32_ty, 3);
        let vec4 = ed.type_vec(f32_ty, 4);
        let spec = SpecValues::new();

        let l = compute_layout(&ed, f32_ty, &spec).unwrap();
        assert_eq!((l.size, l.align), (4, 4));
        let l = compute_layout(&ed, vec2, &spec).unwrap();
        assert_eq!((l.size, l.align), (8, 8));
        // 3-vectors pad to 4-vector alignment.
        let l = compute_layout(&ed, vec3, &spec).unwrap();
        assert_eq!((l.size, l.align), (12, 16));
        let l = compute_layout(&ed, vec4, &spec).unwrap();
        assert_eq!((l.size, l.align), (16, 16));
    }

    #[test]
    fn bool_members_store_as_u32() {
        let mut ed = editor();
        let bool_ty = ed.type_bool();
        let l = compute_layout(&ed, bool_ty, &SpecValues::new()).unwrap();
        assert_eq!((l.size, l.align), (4, 4));
    }

    #[test]
    fn struct_offsets_follow_member_alignment() {
        let mut ed = editor();
        let f32_ty = ed.type_f32();
        let u32_ty = ed.type_u32();
        let vec3 = ed.type_vec(f32_ty, 3);
        let vec4 = ed.type_vec(f32_ty, 4);

        // { vec4 pos; float scale; vec3 normal; uint id; }
        let layout = plan_struct(&ed, &[vec4, f32_ty, vec3, u32_ty], &SpecValues::new()).unwrap();
        let offsets: Vec<u32> = layout.members.iter().map(|m| m.offset).collect();
        assert_eq!(offsets, vec![0, 16, 32, 44]);
        assert_eq!(layout.size, 48);
    }

    #[test]
    fn struct_size_rounds_to_16() {
        let mut ed = editor();
        let f32_ty = ed.type_f32();
        let layout = plan_struct(&ed, &[f32_ty], &SpecValues::new()).unwrap();
        assert_eq!(layout.size, 16);
    }

    #[test]
    fn array_stride_honors_spec_constant_length() {
        let mut ed = editor();
        let f32_ty = ed.type_f32();
        let vec3 = ed.type_vec(f32_ty, 3);
        let u32_ty = ed.type_u32();
        let len = ed.declare_spec_constant(u32_ty, &[4], 11);
        let arr = ed.declare_type(TypeDesc::Array {
            element: vec3,
            length: len,
            stride: None,
        });

        let default_layout = compute_layout(&ed, arr, &SpecValues::new()).unwrap();
        assert_eq!(default_layout.array_stride, Some(16));
        assert_eq!(default_layout.size, 64);

        let mut spec = SpecValues::new();
        spec.set(11, 10);
        let overridden = compute_layout(&ed, arr, &spec).unwrap();
        assert_eq!(overridden.size, 160);
    }

    #[test]
    fn nested_struct_aligns_to_16() {
        let mut ed = editor();
        let f32_ty = ed.type_f32();
        let inner = ed.declare_type(TypeDesc::Struct {
            members: vec![f32_ty],
            offsets: None,
            block: false,
        });
        // { float a; struct { float } b; }
        let layout = plan_struct(&ed, &[f32_ty, inner], &SpecValues::new()).unwrap();
        assert_eq!(layout.members[1].offset, 16);
        assert_eq!(layout.size, 32);
    }

    #[test]
    fn layout_is_deterministic() {
        let mut ed = editor();
        let f32_ty = ed.type_f32();
        let vec3 = ed.type_vec(f32_ty, 3);
        let u32_ty = ed.type_u32();
        let members = [vec3, u32_ty, vec3, f32_ty];
        let spec = SpecValues::new();
        let a = plan_struct(&ed, &members, &spec).unwrap();
        let b = plan_struct(&ed, &members, &spec).unwrap();
        assert_eq!(a, b);
    }
}
