//! SPIR-V word-stream editing for replay-time shader patching.
//!
//! This crate is the bytecode layer of the Prism replay debugger: a strict,
//! zero-dependency parser/serializer for SPIR-V modules plus an in-place
//! editor (id allocation, structural type/constant deduplication,
//! section-aware insertion, operand patching) and a std430-equivalent struct
//! layout planner.
//!
//! It deliberately understands only the instruction subset the annotation
//! passes need; everything else round-trips untouched.

pub mod editor;
pub mod error;
pub mod layout;
pub mod module;
pub mod opcode;

pub use editor::{ConstInfo, Editor, SpecValues, TypeDesc};
pub use error::SpirvError;
pub use layout::{compute_layout, plan_struct, MemberLayout, StructLayout, TypeLayout};
pub use module::{EntryPoint, Id, Instruction, Module, Section, SPIRV_MAGIC};
pub use opcode::{ExecutionModel, Op, StorageClass};
