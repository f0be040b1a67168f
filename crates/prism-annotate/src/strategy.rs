//! Buffer addressing strategy, selected once per fetch operation.
//!
//! The annotators never branch on the addressing mode at their call sites;
//! they go through [`PointerStrategy`] for pointer-type declaration, base
//! materialization, and word-granular loads/stores/atomics. Three modes:
//!
//! - `BufferAddressKhr`: 64-bit device addresses via
//!   `SPV_KHR_physical_storage_buffer`; each buffer slot's address arrives as
//!   a pair of 32-bit specialization constants.
//! - `BufferAddressExt`: the EXT flavor; same delivery, but the pointer is
//!   built through a 64-bit integer and so requires the `shaderInt64`
//!   feature.
//! - `DescriptorBinding`: no address extension at all; every slot lives in
//!   one arrayed SSBO binding in a reserved descriptor slot, and all
//!   user-declared bindings are shifted up to make room.

use crate::emit::Body;
use prism_spirv::opcode::{addressing_model, capability, decoration, memory, Op, StorageClass};
use prism_spirv::{Editor, Id, TypeDesc};

/// First `SpecId` used for buffer-slot addresses: slot `s` occupies
/// `SPEC_ID_ADDR_BASE + 2*s` (low word) and `+ 2*s + 1` (high word).
///
/// The replay executor packs pipeline specialization data with the same
/// numbering; keeping the constants centralized avoids divergence.
pub const SPEC_ID_ADDR_BASE: u32 = 100;

/// Descriptor set that holds the reserved arrayed SSBO in
/// [`AddressMode::DescriptorBinding`] mode.
pub const RESERVED_SET: u32 = 0;

/// Binding of the reserved arrayed SSBO within [`RESERVED_SET`].
pub const RESERVED_BINDING: u32 = 0;

/// Number of binding slots reserved ahead of user bindings in descriptor
/// mode (the arrayed data buffer, the index buffer view, the output buffer).
pub const RESERVED_BINDING_COUNT: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressMode {
    BufferAddressKhr,
    BufferAddressExt,
    DescriptorBinding,
}

impl AddressMode {
    /// Capability-gated selection, in priority order: KHR addresses, EXT
    /// addresses (needs 64-bit integers), then plain descriptor bindings.
    pub fn choose(khr_address: bool, ext_address: bool, shader_int64: bool) -> AddressMode {
        if khr_address {
            AddressMode::BufferAddressKhr
        } else if ext_address && shader_int64 {
            AddressMode::BufferAddressExt
        } else {
            AddressMode::DescriptorBinding
        }
    }

    pub fn uses_device_address(self) -> bool {
        matches!(
            self,
            AddressMode::BufferAddressKhr | AddressMode::BufferAddressExt
        )
    }
}

/// Per-slot base: either a spec-constant uvec2 address or the slot index into
/// the reserved arrayed binding.
#[derive(Debug, Clone, Copy)]
enum SlotBase {
    Address { lo: Id, hi: Id },
    Binding { slot_index: Id },
}

/// Declarations the strategy makes once per patched module.
#[derive(Debug)]
pub struct StrategyVars {
    mode: AddressMode,
    /// `struct { uint data[]; }`, Block-decorated, stride 4.
    block_type: Id,
    /// Pointer-to-block in the mode's storage class.
    block_ptr_type: Id,
    /// Pointer-to-u32 in the mode's storage class.
    word_ptr_type: Id,
    u32_type: Id,
    /// Descriptor mode only: the arrayed SSBO variable.
    binding_var: Option<Id>,
    slots: Vec<SlotBase>,
}

impl StrategyVars {
    pub fn mode(&self) -> AddressMode {
        self.mode
    }
}

/// Strategy object passed down to every transform function.
#[derive(Debug, Clone, Copy)]
pub struct PointerStrategy {
    pub mode: AddressMode,
    pub slot_count: u32,
}

impl PointerStrategy {
    pub fn new(mode: AddressMode, slot_count: u32) -> PointerStrategy {
        PointerStrategy { mode, slot_count }
    }

    fn storage_class(&self) -> StorageClass {
        if self.mode.uses_device_address() {
            StorageClass::PhysicalStorageBuffer
        } else {
            StorageClass::StorageBuffer
        }
    }

    /// Declares the capabilities, types, spec constants and (in descriptor
    /// mode) the reserved binding variable for `slot_count` buffer slots.
    pub fn prepare(&self, ed: &mut Editor) -> StrategyVars {
        match self.mode {
            AddressMode::BufferAddressKhr => {
                ed.add_capability(capability::PHYSICAL_STORAGE_BUFFER_ADDRESSES);
                ed.add_extension("SPV_KHR_physical_storage_buffer");
                ed.set_addressing_model(addressing_model::PHYSICAL_STORAGE_BUFFER64);
            }
            AddressMode::BufferAddressExt => {
                ed.add_capability(capability::PHYSICAL_STORAGE_BUFFER_ADDRESSES);
                ed.add_capability(capability::INT64);
                ed.add_extension("SPV_EXT_physical_storage_buffer");
                ed.set_addressing_model(addressing_model::PHYSICAL_STORAGE_BUFFER64);
            }
            AddressMode::DescriptorBinding => {}
        }

        let u32_type = ed.type_u32();
        let word_array = ed.declare_type(TypeDesc::RuntimeArray {
            element: u32_type,
            stride: Some(4),
        });
        let block_type = ed.declare_type(TypeDesc::Struct {
            members: vec![word_array],
            offsets: Some(vec![0]),
            block: true,
        });
        let sc = self.storage_class();
        let block_ptr_type = ed.type_ptr(sc, block_type);
        let word_ptr_type = ed.type_ptr(sc, u32_type);

        let mut binding_var = None;
        let mut slots = Vec::with_capacity(self.slot_count as usize);
        match self.mode {
            AddressMode::BufferAddressKhr | AddressMode::BufferAddressExt => {
                for slot in 0..self.slot_count {
                    let lo = ed.declare_spec_constant(
                        u32_type,
                        &[0],
                        SPEC_ID_ADDR_BASE + 2 * slot,
                    );
                    let hi = ed.declare_spec_constant(
                        u32_type,
                        &[0],
                        SPEC_ID_ADDR_BASE + 2 * slot + 1,
                    );
                    slots.push(SlotBase::Address { lo, hi });
                }
            }
            AddressMode::DescriptorBinding => {
                let count = ed.const_u32(self.slot_count.max(1));
                let blocks = ed.declare_type(TypeDesc::Array {
                    element: block_type,
                    length: count,
                    stride: None,
                });
                let var_ptr = ed.type_ptr(StorageClass::StorageBuffer, blocks);
                let var = ed.alloc_id();
                ed.module_mut().insert_in_section(
                    prism_spirv::Section::TypesConstantsGlobals,
                    prism_spirv::Instruction::new(
                        Op::VARIABLE,
                        &[var_ptr.0, var.0, StorageClass::StorageBuffer as u32],
                    ),
                );
                ed.decorate(var, decoration::DESCRIPTOR_SET, &[RESERVED_SET]);
                ed.decorate(var, decoration::BINDING, &[RESERVED_BINDING]);
                binding_var = Some(var);
                for slot in 0..self.slot_count {
                    let slot_index = ed.const_u32(slot);
                    slots.push(SlotBase::Binding { slot_index });
                }
            }
        }

        StrategyVars {
            mode: self.mode,
            block_type,
            block_ptr_type,
            word_ptr_type,
            u32_type,
            binding_var,
            slots,
        }
    }

    /// Emits a pointer to u32 word `word_index` of buffer `slot`.
    fn word_pointer(
        &self,
        ed: &mut Editor,
        body: &mut Body,
        vars: &StrategyVars,
        slot: u32,
        word_index: Id,
    ) -> Id {
        let member0 = ed.const_u32(0);
        match vars.slots[slot as usize] {
            SlotBase::Address { lo, hi } => {
                let uvec2 = ed.type_vec(vars.u32_type, 2);
                let addr2 = body.emit(
                    ed,
                    Op::COMPOSITE_CONSTRUCT,
                    uvec2,
                    &[lo.0, hi.0],
                );
                let base = match vars.mode {
                    AddressMode::BufferAddressKhr => {
                        // Address pair bitcasts straight to a physical pointer.
                        body.emit(ed, Op::BITCAST, vars.block_ptr_type, &[addr2.0])
                    }
                    AddressMode::BufferAddressExt => {
                        let u64_type = ed.type_u64();
                        let addr64 = body.emit(ed, Op::BITCAST, u64_type, &[addr2.0]);
                        body.emit(ed, Op::CONVERT_U_TO_PTR, vars.block_ptr_type, &[addr64.0])
                    }
                    AddressMode::DescriptorBinding => unreachable!(),
                };
                body.access_chain(ed, vars.word_ptr_type, base, &[member0, word_index])
            }
            SlotBase::Binding { slot_index } => {
                let var = vars
                    .binding_var
                    .expect("descriptor mode declares the binding variable");
                body.access_chain(
                    ed,
                    vars.word_ptr_type,
                    var,
                    &[slot_index, member0, word_index],
                )
            }
        }
    }

    fn mem_operands(&self) -> &'static [u32] {
        // Physical pointers require an explicit Aligned memory operand.
        if self.mode.uses_device_address() {
            &[0x2, 4]
        } else {
            &[]
        }
    }

    pub fn load_word(
        &self,
        ed: &mut Editor,
        body: &mut Body,
        vars: &StrategyVars,
        slot: u32,
        word_index: Id,
    ) -> Id {
        let ptr = self.word_pointer(ed, body, vars, slot, word_index);
        let mut operands = vec![ptr.0];
        operands.extend_from_slice(self.mem_operands());
        body.emit(ed, Op::LOAD, vars.u32_type, &operands)
    }

    pub fn store_word(
        &self,
        ed: &mut Editor,
        body: &mut Body,
        vars: &StrategyVars,
        slot: u32,
        word_index: Id,
        value: Id,
    ) {
        let ptr = self.word_pointer(ed, body, vars, slot, word_index);
        let mut operands = vec![ptr.0, value.0];
        operands.extend_from_slice(self.mem_operands());
        body.emit_no_result(Op::STORE, &operands);
    }

    /// Emits an atomic read-modify-write on a feedback word and returns the
    /// original value.
    pub fn atomic_word(
        &self,
        ed: &mut Editor,
        body: &mut Body,
        vars: &StrategyVars,
        op: Op,
        slot: u32,
        word_index: Id,
        value: Id,
    ) -> Id {
        let ptr = self.word_pointer(ed, body, vars, slot, word_index);
        let scope = ed.const_u32(memory::SCOPE_DEVICE);
        let semantics = ed.const_u32(memory::SEMANTICS_NONE);
        body.emit(
            ed,
            op,
            vars.u32_type,
            &[ptr.0, scope.0, semantics.0, value.0],
        )
    }

    /// Shifts every user-declared `Binding` decoration up by `reserved`.
    ///
    /// Used in descriptor mode so the reserved slots stay collision-free, and
    /// by the store-unsupported fallback where a stage's bytecode is left
    /// unpatched but must keep descriptor-set layouts consistent with its
    /// patched siblings.
    pub fn shift_user_bindings(ed: &mut Editor, reserved: u32) {
        let mut targets = Vec::new();
        for (index, inst) in ed.module().preamble().iter().enumerate() {
            if inst.op() == Op::DECORATE && inst.operand(1) == Some(decoration::BINDING) {
                targets.push(index);
            }
        }
        for index in targets {
            if let Some(inst) = ed.pre_modify(index) {
                let old = inst.operand(2).unwrap_or(0);
                inst.set_operand(2, old + reserved);
            }
        }
        ed.post_modify();
    }
}
