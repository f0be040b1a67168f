//! SPIR-V opcode and enum subset used by the editor and the annotators.
//!
//! Only the opcodes the patching passes actually inspect or emit are named
//! here. Everything else round-trips through the editor as an opaque word
//! sequence; the opcode number is still enough to classify an unknown
//! instruction into the correct logical section.

/// A SPIR-V opcode number.
///
/// Named constants cover the subset the editor understands; instructions with
/// other opcodes are preserved verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Op(pub u16);

impl Op {
    pub const NOP: Op = Op(0);
    pub const UNDEF: Op = Op(1);
    pub const SOURCE_CONTINUED: Op = Op(2);
    pub const SOURCE: Op = Op(3);
    pub const SOURCE_EXTENSION: Op = Op(4);
    pub const NAME: Op = Op(5);
    pub const MEMBER_NAME: Op = Op(6);
    pub const STRING: Op = Op(7);
    pub const LINE: Op = Op(8);
    pub const EXTENSION: Op = Op(10);
    pub const EXT_INST_IMPORT: Op = Op(11);
    pub const EXT_INST: Op = Op(12);
    pub const MEMORY_MODEL: Op = Op(14);
    pub const ENTRY_POINT: Op = Op(15);
    pub const EXECUTION_MODE: Op = Op(16);
    pub const CAPABILITY: Op = Op(17);

    pub const TYPE_VOID: Op = Op(19);
    pub const TYPE_BOOL: Op = Op(20);
    pub const TYPE_INT: Op = Op(21);
    pub const TYPE_FLOAT: Op = Op(22);
    pub const TYPE_VECTOR: Op = Op(23);
    pub const TYPE_MATRIX: Op = Op(24);
    pub const TYPE_IMAGE: Op = Op(25);
    pub const TYPE_SAMPLER: Op = Op(26);
    pub const TYPE_SAMPLED_IMAGE: Op = Op(27);
    pub const TYPE_ARRAY: Op = Op(28);
    pub const TYPE_RUNTIME_ARRAY: Op = Op(29);
    pub const TYPE_STRUCT: Op = Op(30);
    pub const TYPE_POINTER: Op = Op(32);
    pub const TYPE_FUNCTION: Op = Op(33);

    pub const CONSTANT_TRUE: Op = Op(41);
    pub const CONSTANT_FALSE: Op = Op(42);
    pub const CONSTANT: Op = Op(43);
    pub const CONSTANT_COMPOSITE: Op = Op(44);
    pub const CONSTANT_NULL: Op = Op(46);
    pub const SPEC_CONSTANT_TRUE: Op = Op(48);
    pub const SPEC_CONSTANT_FALSE: Op = Op(49);
    pub const SPEC_CONSTANT: Op = Op(50);
    pub const SPEC_CONSTANT_COMPOSITE: Op = Op(51);
    pub const SPEC_CONSTANT_OP: Op = Op(52);

    pub const FUNCTION: Op = Op(54);
    pub const FUNCTION_PARAMETER: Op = Op(55);
    pub const FUNCTION_END: Op = Op(56);
    pub const FUNCTION_CALL: Op = Op(57);

    pub const VARIABLE: Op = Op(59);
    pub const LOAD: Op = Op(61);
    pub const STORE: Op = Op(62);
    pub const ACCESS_CHAIN: Op = Op(65);
    pub const IN_BOUNDS_ACCESS_CHAIN: Op = Op(66);
    pub const PTR_ACCESS_CHAIN: Op = Op(67);
    pub const ARRAY_LENGTH: Op = Op(68);

    pub const DECORATE: Op = Op(71);
    pub const MEMBER_DECORATE: Op = Op(72);
    pub const DECORATION_GROUP: Op = Op(73);
    pub const GROUP_DECORATE: Op = Op(74);
    pub const GROUP_MEMBER_DECORATE: Op = Op(75);

    pub const VECTOR_SHUFFLE: Op = Op(79);
    pub const COMPOSITE_CONSTRUCT: Op = Op(80);
    pub const COMPOSITE_EXTRACT: Op = Op(81);
    pub const COMPOSITE_INSERT: Op = Op(82);
    pub const COPY_OBJECT: Op = Op(83);

    pub const CONVERT_F_TO_U: Op = Op(109);
    pub const CONVERT_F_TO_S: Op = Op(110);
    pub const CONVERT_S_TO_F: Op = Op(111);
    pub const CONVERT_U_TO_F: Op = Op(112);
    pub const U_CONVERT: Op = Op(113);
    pub const S_CONVERT: Op = Op(114);
    pub const F_CONVERT: Op = Op(115);
    pub const CONVERT_U_TO_PTR: Op = Op(120);
    pub const BITCAST: Op = Op(124);

    pub const S_NEGATE: Op = Op(126);
    pub const F_NEGATE: Op = Op(127);
    pub const I_ADD: Op = Op(128);
    pub const F_ADD: Op = Op(129);
    pub const I_SUB: Op = Op(130);
    pub const F_SUB: Op = Op(131);
    pub const I_MUL: Op = Op(132);
    pub const F_MUL: Op = Op(133);
    pub const U_DIV: Op = Op(134);
    pub const S_DIV: Op = Op(135);
    pub const F_DIV: Op = Op(136);
    pub const U_MOD: Op = Op(137);

    pub const LOGICAL_OR: Op = Op(166);
    pub const LOGICAL_AND: Op = Op(167);
    pub const LOGICAL_NOT: Op = Op(168);
    pub const SELECT: Op = Op(169);
    pub const I_EQUAL: Op = Op(170);
    pub const I_NOT_EQUAL: Op = Op(171);
    pub const U_GREATER_THAN: Op = Op(172);
    pub const S_GREATER_THAN: Op = Op(173);
    pub const U_GREATER_THAN_EQUAL: Op = Op(174);
    pub const S_GREATER_THAN_EQUAL: Op = Op(175);
    pub const U_LESS_THAN: Op = Op(176);
    pub const S_LESS_THAN: Op = Op(177);
    pub const U_LESS_THAN_EQUAL: Op = Op(178);
    pub const S_LESS_THAN_EQUAL: Op = Op(179);
    pub const F_ORD_EQUAL: Op = Op(180);
    pub const F_ORD_LESS_THAN: Op = Op(184);
    pub const F_ORD_GREATER_THAN: Op = Op(186);

    pub const SHIFT_RIGHT_LOGICAL: Op = Op(194);
    pub const SHIFT_RIGHT_ARITHMETIC: Op = Op(195);
    pub const SHIFT_LEFT_LOGICAL: Op = Op(196);
    pub const BITWISE_OR: Op = Op(197);
    pub const BITWISE_XOR: Op = Op(198);
    pub const BITWISE_AND: Op = Op(199);
    pub const NOT: Op = Op(200);
    pub const BIT_FIELD_S_EXTRACT: Op = Op(202);
    pub const BIT_FIELD_U_EXTRACT: Op = Op(203);

    pub const CONTROL_BARRIER: Op = Op(224);
    pub const MEMORY_BARRIER: Op = Op(225);

    pub const ATOMIC_LOAD: Op = Op(227);
    pub const ATOMIC_STORE: Op = Op(228);
    pub const ATOMIC_EXCHANGE: Op = Op(229);
    pub const ATOMIC_I_ADD: Op = Op(234);
    pub const ATOMIC_U_MAX: Op = Op(239);
    pub const ATOMIC_AND: Op = Op(240);
    pub const ATOMIC_OR: Op = Op(241);
    pub const ATOMIC_XOR: Op = Op(242);

    pub const PHI: Op = Op(245);
    pub const LOOP_MERGE: Op = Op(246);
    pub const SELECTION_MERGE: Op = Op(247);
    pub const LABEL: Op = Op(248);
    pub const BRANCH: Op = Op(249);
    pub const BRANCH_CONDITIONAL: Op = Op(250);
    pub const SWITCH: Op = Op(251);
    pub const RETURN: Op = Op(253);
    pub const RETURN_VALUE: Op = Op(254);
    pub const UNREACHABLE: Op = Op(255);

    pub const EXECUTION_MODE_ID: Op = Op(331);
    pub const DECORATE_ID: Op = Op(332);

    pub const SET_MESH_OUTPUTS_EXT: Op = Op(5295);
    pub const EMIT_MESH_TASKS_EXT: Op = Op(5294);

    /// True for instructions that declare a type.
    pub fn is_type_decl(self) -> bool {
        (Self::TYPE_VOID.0..=Self::TYPE_FUNCTION.0).contains(&self.0)
    }

    /// True for instructions that declare a (spec-)constant.
    pub fn is_constant_decl(self) -> bool {
        (Self::CONSTANT_TRUE.0..=Self::SPEC_CONSTANT_OP.0).contains(&self.0)
    }
}

/// GLSL.std.450 extended instruction numbers used by the annotators.
pub mod glsl450 {
    pub const F_MIN: u32 = 37;
    pub const U_MIN: u32 = 38;
    pub const F_MAX: u32 = 40;
    pub const U_MAX: u32 = 41;
    pub const U_CLAMP: u32 = 44;
    pub const PACK_HALF_2X16: u32 = 58;
    pub const UNPACK_HALF_2X16: u32 = 62;
    pub const PACK_DOUBLE_2X32: u32 = 59;
    pub const UNPACK_DOUBLE_2X32: u32 = 65;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum StorageClass {
    UniformConstant = 0,
    Input = 1,
    Uniform = 2,
    Output = 3,
    Workgroup = 4,
    Private = 6,
    Function = 7,
    PushConstant = 9,
    StorageBuffer = 12,
    PhysicalStorageBuffer = 5349,
    TaskPayloadWorkgroupEXT = 5402,
}

impl StorageClass {
    pub fn from_u32(v: u32) -> Option<StorageClass> {
        Some(match v {
            0 => StorageClass::UniformConstant,
            1 => StorageClass::Input,
            2 => StorageClass::Uniform,
            3 => StorageClass::Output,
            4 => StorageClass::Workgroup,
            6 => StorageClass::Private,
            7 => StorageClass::Function,
            9 => StorageClass::PushConstant,
            12 => StorageClass::StorageBuffer,
            5349 => StorageClass::PhysicalStorageBuffer,
            5402 => StorageClass::TaskPayloadWorkgroupEXT,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ExecutionModel {
    Vertex = 0,
    TessellationControl = 1,
    TessellationEvaluation = 2,
    Geometry = 3,
    Fragment = 4,
    GLCompute = 5,
    TaskEXT = 5364,
    MeshEXT = 5365,
}

impl ExecutionModel {
    pub fn from_u32(v: u32) -> Option<ExecutionModel> {
        Some(match v {
            0 => ExecutionModel::Vertex,
            1 => ExecutionModel::TessellationControl,
            2 => ExecutionModel::TessellationEvaluation,
            3 => ExecutionModel::Geometry,
            4 => ExecutionModel::Fragment,
            5 => ExecutionModel::GLCompute,
            5364 => ExecutionModel::TaskEXT,
            5365 => ExecutionModel::MeshEXT,
            _ => return None,
        })
    }
}

/// Decoration numbers the editor and annotators care about.
pub mod decoration {
    pub const SPEC_ID: u32 = 1;
    pub const BLOCK: u32 = 2;
    pub const BUFFER_BLOCK: u32 = 3;
    pub const ARRAY_STRIDE: u32 = 6;
    pub const MATRIX_STRIDE: u32 = 7;
    pub const BUILT_IN: u32 = 11;
    pub const FLAT: u32 = 14;
    pub const NON_WRITABLE: u32 = 24;
    pub const LOCATION: u32 = 30;
    pub const COMPONENT: u32 = 31;
    pub const BINDING: u32 = 33;
    pub const DESCRIPTOR_SET: u32 = 34;
    pub const OFFSET: u32 = 35;
    pub const PER_PRIMITIVE_EXT: u32 = 5271;
}

/// BuiltIn numbers the annotators consume or synthesize.
pub mod builtin {
    pub const POSITION: u32 = 0;
    pub const POINT_SIZE: u32 = 1;
    pub const PRIMITIVE_ID: u32 = 7;
    pub const FRAG_COORD: u32 = 15;
    pub const SAMPLE_ID: u32 = 18;
    pub const NUM_WORKGROUPS: u32 = 24;
    pub const WORKGROUP_ID: u32 = 26;
    pub const LOCAL_INVOCATION_ID: u32 = 27;
    pub const GLOBAL_INVOCATION_ID: u32 = 28;
    pub const LOCAL_INVOCATION_INDEX: u32 = 29;
    pub const VERTEX_INDEX: u32 = 42;
    pub const INSTANCE_INDEX: u32 = 43;
    pub const VIEW_INDEX: u32 = 4440;
    pub const PRIMITIVE_POINT_INDICES_EXT: u32 = 5294;
    pub const PRIMITIVE_LINE_INDICES_EXT: u32 = 5295;
    pub const PRIMITIVE_TRIANGLE_INDICES_EXT: u32 = 5296;
}

/// Capability numbers the annotators add or require.
pub mod capability {
    pub const SHADER: u32 = 1;
    pub const FLOAT64: u32 = 10;
    pub const INT64: u32 = 11;
    pub const INT16: u32 = 22;
    pub const INT8: u32 = 39;
    pub const MESH_SHADING_EXT: u32 = 5283;
    pub const PHYSICAL_STORAGE_BUFFER_ADDRESSES: u32 = 5347;
}

/// Execution modes the annotators attach to rewritten entry points.
pub mod execution_mode {
    pub const LOCAL_SIZE: u32 = 17;
    pub const OUTPUT_VERTICES: u32 = 26;
    pub const OUTPUT_POINTS: u32 = 27;
    pub const OUTPUT_LINES_EXT: u32 = 5269;
    pub const OUTPUT_PRIMITIVES_EXT: u32 = 5270;
    pub const OUTPUT_TRIANGLES_EXT: u32 = 5298;
}

pub mod addressing_model {
    pub const LOGICAL: u32 = 0;
    pub const PHYSICAL_STORAGE_BUFFER64: u32 = 5348;
}

pub mod memory_model {
    pub const GLSL450: u32 = 1;
}

/// Memory semantics / scope values for the atomics the feedback pass emits.
pub mod memory {
    pub const SCOPE_DEVICE: u32 = 1;
    pub const SEMANTICS_NONE: u32 = 0;
}
