//! End-to-end editing: assemble a module from a bare header, declare types
//! and constants through the editor, serialize, and reparse the result.

use prism_spirv::opcode::capability;
use prism_spirv::{
    compute_layout, plan_struct, Editor, Module, SpecValues, TypeDesc, SPIRV_MAGIC,
};

fn bare_module() -> Module {
    let words = [
        vec![SPIRV_MAGIC, 0x0001_0300, 0, 10, 0],
        vec![(2 << 16) | 17, capability::SHADER],
        vec![(3 << 16) | 14, 0, 1],
    ]
    .concat();
    Module::parse(&words).expect("bare module parses")
}

#[test]
fn declared_types_survive_a_round_trip() {
    let mut ed = Editor::new(bare_module());
    let u32_ty = ed.type_u32();
    let f32_ty = ed.type_f32();
    let vec4 = ed.type_vec(f32_ty, 4);
    let packed = ed.declare_type(TypeDesc::Struct {
        members: vec![u32_ty, vec4],
        offsets: Some(vec![0, 16]),
        block: false,
    });

    let words = ed.finish().words();
    let reparsed = Module::parse(&words).expect("serialized module reparses");
    let before = reparsed.words().len();

    // The rebuilt editor dedups against the parsed declarations instead of
    // appending fresh ones.
    let mut ed = Editor::new(reparsed);
    let u32_again = ed.type_u32();
    let f32_again = ed.type_f32();
    let vec4_again = ed.type_vec(f32_again, 4);
    let packed_again = ed.declare_type(TypeDesc::Struct {
        members: vec![u32_again, vec4_again],
        offsets: Some(vec![0, 16]),
        block: false,
    });
    assert_eq!(u32_ty, u32_again);
    assert_eq!(vec4, vec4_again);
    assert_eq!(packed, packed_again);
    assert_eq!(ed.finish().words().len(), before);
}

#[test]
fn spec_constant_override_resizes_arrays() {
    let mut ed = Editor::new(bare_module());
    let f32_ty = ed.type_f32();
    let vec4 = ed.type_vec(f32_ty, 4);
    let u32_ty = ed.type_u32();
    let length = ed.declare_spec_constant(u32_ty, &[4], 7);
    let array = ed.declare_type(TypeDesc::Array {
        element: vec4,
        length,
        stride: Some(16),
    });

    let default = compute_layout(&ed, array, &SpecValues::new()).expect("layout");
    assert_eq!(default.size, 64);
    assert_eq!(default.array_stride, Some(16));

    let mut spec = SpecValues::new();
    spec.set(7, 6);
    let resized = compute_layout(&ed, array, &spec).expect("layout");
    assert_eq!(resized.size, 96);
}

#[test]
fn struct_planning_aligns_and_rounds() {
    let mut ed = Editor::new(bare_module());
    let u32_ty = ed.type_u32();
    let f32_ty = ed.type_f32();
    let vec3 = ed.type_vec(f32_ty, 3);

    let plan = plan_struct(&ed, &[u32_ty, vec3], &SpecValues::new()).expect("plans");
    assert_eq!(plan.members[0].offset, 0);
    // vec3 aligns as vec4.
    assert_eq!(plan.members[1].offset, 16);
    assert_eq!(plan.size % 16, 0);
}

#[test]
fn truncated_instruction_is_an_error_not_a_panic() {
    // Word count in the opcode header says five words; only one follows.
    let words = vec![SPIRV_MAGIC, 0x0001_0300, 0, 10, 0, (5 << 16) | 17];
    assert!(Module::parse(&words).is_err());
}
