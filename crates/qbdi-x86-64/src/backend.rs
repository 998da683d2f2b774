//! `X86_64Backend`: the concrete `CpuBackend` wiring `decode.rs`,
//! `encode.rs`, `regs.rs` and `rules.rs` together (spec.md §9's "small
//! trait surface" extension point, instantiated for the one target this
//! workspace ships).

use alloc::vec;
use alloc::vec::Vec;

use qbdi_ir::{
    Context, CpuMode, GPRState, HostState, InstInfo, MCInst, Opcode, Operand, Reg, RegLLVM, RelocatableInst, ShadowTag,
};

use qbdi_codegen::backend::CpuBackend;
use qbdi_codegen::error::CodegenError;
use qbdi_codegen::rule_assembly::PatchRule;

use crate::{decode, encode, regs, rules};

/// Opaque pre-encoded bytes, carried straight from the decoder to the
/// final output (the identity `PatchRule`'s `IdentityPassthrough`). Picked
/// far above any real `iced_x86::Code` discriminant so it can never
/// collide with a genuinely decoded opcode.
pub const RAW_BYTES_OPCODE: u32 = 0xFFFF_0001;
/// `[Reg(src), Imm(disp32)]`: `mov [rip+disp32], src`. The `Imm` is a
/// placeholder a `RelocatableInst::DataBlockRel`/`TaggedShadow` template
/// fills in at resolve time.
const PSEUDO_STORE_RIP_REL: u32 = 0xFFFF_0002;
/// `[Reg(dst), Imm(disp32)]`: `mov dst, [rip+disp32]`.
const PSEUDO_LOAD_RIP_REL: u32 = 0xFFFF_0003;
/// `[Imm(rel32)]`: `jmp rel32`, filled in by `RelocatableInst::EpilogueRel`.
const PSEUDO_JMP_REL32: u32 = 0xFFFF_0004;
/// `[Imm(disp32)]`: `mov [rip+disp32], rsp`. RSP has no `Reg` operand to
/// carry, so the placeholder is the only operand.
const PSEUDO_STORE_RSP_RIP_REL: u32 = 0xFFFF_0005;
/// `[Imm(disp32)]`: `mov rsp, [rip+disp32]`.
const PSEUDO_LOAD_RSP_RIP_REL: u32 = 0xFFFF_0006;
/// `[Imm(disp32)]`: `push [rip+disp32]`.
const PSEUDO_PUSH_RIP_REL: u32 = 0xFFFF_0007;
/// `[Imm(disp32)]`: `pop [rip+disp32]`.
const PSEUDO_POP_RIP_REL: u32 = 0xFFFF_0008;
/// `[Imm(disp32)]`: `jmp [rip+disp32]`, an indirect jump through memory.
const PSEUDO_JMP_RIP_REL_INDIRECT: u32 = 0xFFFF_0009;
/// `[Imm(disp32), Imm(value)]`: `mov qword [rip+disp32], value`.
const PSEUDO_STORE_IMM_RIP_REL: u32 = 0xFFFF_000A;

/// The fixed `rword`-wide selector slot `terminator()` writes the resume
/// address into, at a statically known offset rather than a dynamically
/// allocated shadow (there is exactly one such slot per data block,
/// mirroring `HostState::selector`). Computed from the real field layout
/// rather than assumed, since `GPRState`/`FPRState` sit in front of it.
const SELECTOR_SLOT_OFFSET: i64 = (core::mem::offset_of!(Context, host) + core::mem::offset_of!(HostState, selector)) as i64;

/// Mirrors `SELECTOR_SLOT_OFFSET` for `HostState::callback`: the slot a
/// `break_to_host` instrumentation fragment writes its callback id into
/// before jumping to the epilogue.
const CALLBACK_SLOT_OFFSET: i64 = (core::mem::offset_of!(Context, host) + core::mem::offset_of!(HostState, callback)) as i64;

/// The `rword` slot right after `Context` holding the host code address
/// the shared prologue's closing indirect jump reads: `select_seq` writes
/// it, never handed out by `alloc_shadow` (see
/// `ExecBlock::RESERVED_SCRATCH_SIZE`).
const ENTRY_ADDR_SLOT_OFFSET: i64 = core::mem::size_of::<Context>() as i64;

/// The three `rword` slots after that, reserved for `record_memory_access`
/// instrumentation (address/value/size).
const MEM_ACCESS_ADDRESS_SLOT_OFFSET: i64 = ENTRY_ADDR_SLOT_OFFSET + 8;
const MEM_ACCESS_VALUE_SLOT_OFFSET: i64 = MEM_ACCESS_ADDRESS_SLOT_OFFSET + 8;
const MEM_ACCESS_SIZE_SLOT_OFFSET: i64 = MEM_ACCESS_VALUE_SLOT_OFFSET + 8;

/// Real host RSP, saved by the block prologue and restored by the block
/// epilogue around whichever guest RSP the sequence runs with.
const HOST_SP_SLOT_OFFSET: i64 = (core::mem::offset_of!(Context, host) + core::mem::offset_of!(HostState, host_sp)) as i64;
/// Guest RSP/eflags slots inside `GPRState`, addressed directly since
/// neither is representable as a `Reg` (`GPR_ID` excludes RSP, and
/// eflags lives outside the allocatable-GPR array entirely).
const GUEST_RSP_SLOT_OFFSET: i64 = (core::mem::offset_of!(Context, gpr) + core::mem::offset_of!(GPRState, rsp)) as i64;
const GUEST_EFLAGS_SLOT_OFFSET: i64 =
    (core::mem::offset_of!(Context, gpr) + core::mem::offset_of!(GPRState, eflags)) as i64;

fn raw(bytes: Vec<u8>) -> RelocatableInst {
    RelocatableInst::NoReloc {
        inst: MCInst::new(Opcode(RAW_BYTES_OPCODE), vec![Operand::RawBytes(bytes)]),
    }
}

fn gpr(reg: Reg) -> Operand {
    Operand::Reg(RegLLVM::Gpr(reg))
}

/// A `DataBlockRel` template with a single `Imm` placeholder operand, for
/// the RSP/memory-only pseudo-ops that carry no register operand at all.
fn data_rel_disp_only(opcode: u32, offset: i64) -> RelocatableInst {
    RelocatableInst::DataBlockRel {
        inst: MCInst::new(Opcode(opcode), vec![Operand::Imm(0)]),
        operand_idx: 0,
        offset,
    }
}

fn imm_at(inst: &MCInst, idx: usize) -> i32 {
    match inst.operand(idx) {
        Some(Operand::Imm(v)) => *v as i32,
        _ => 0,
    }
}

pub struct X86_64Backend;

impl CpuBackend for X86_64Backend {
    fn name(&self) -> &'static str {
        "x86-64"
    }

    fn decode(&self, bytes: &[u8], address: u64, mode: CpuMode) -> Result<(MCInst, u8, InstInfo), CodegenError> {
        decode::decode_one(bytes, address, mode)
    }

    fn encode(&self, inst: &MCInst, _mode: CpuMode) -> Vec<u8> {
        match inst.opcode.0 {
            RAW_BYTES_OPCODE => match inst.operand(0) {
                Some(Operand::RawBytes(bytes)) => bytes.clone(),
                _ => Vec::new(),
            },
            PSEUDO_STORE_RIP_REL => {
                let (src, disp) = reg_and_disp(inst);
                encode::store_rip_rel(disp, src, 8)
            }
            PSEUDO_LOAD_RIP_REL => {
                let (dst, disp) = reg_and_disp(inst);
                encode::load_rip_rel(dst, disp, 8)
            }
            PSEUDO_JMP_REL32 => {
                let disp = match inst.operand(0) {
                    Some(Operand::Imm(v)) => *v as i32,
                    _ => 0,
                };
                encode::jmp_rel32(disp)
            }
            PSEUDO_STORE_RSP_RIP_REL => encode::store_rip_rel_rsp(imm_at(inst, 0)),
            PSEUDO_LOAD_RSP_RIP_REL => encode::load_rip_rel_rsp(imm_at(inst, 0)),
            PSEUDO_PUSH_RIP_REL => encode::push_rip_rel(imm_at(inst, 0)),
            PSEUDO_POP_RIP_REL => encode::pop_rip_rel(imm_at(inst, 0)),
            PSEUDO_JMP_RIP_REL_INDIRECT => encode::jmp_rip_rel_indirect(imm_at(inst, 0)),
            PSEUDO_STORE_IMM_RIP_REL => encode::store_imm_rip_rel(imm_at(inst, 0), imm_at(inst, 1)),
            code => encode_rewritten_guest_inst(code, inst),
        }
    }

    fn pc_bias(&self, _mode: CpuMode) -> i64 {
        // Unlike ARM/Thumb (PC always reads as current instruction + a
        // fixed 8/4-byte constant, a true hardware fact independent of
        // how the relocated instruction itself is encoded), x86-64's
        // RIP-relative displacement depends on *that instruction's own*
        // encoded length, which varies by pseudo-op (5 bytes for
        // `jmp rel32`, 7 for the RIP-relative mov forms). That can't be
        // expressed as a single per-architecture constant, so this
        // backend reports zero here and leaves the end-of-instruction
        // correction to `ExecBlock`'s own two-pass length probe (it
        // already has to encode the template once to learn its size
        // before it can place it, so folding the RIP-relative fixup into
        // that same pass costs nothing extra).
        0
    }

    fn min_block_size(&self) -> usize {
        64
    }

    fn has_scratch_register(&self) -> bool {
        // x86-64 reaches the data block via RIP-relative addressing, so
        // it needs no reserved base register the way ARM/Thumb do.
        false
    }

    fn unrestored_priority(&self) -> Vec<Reg> {
        regs::unrestored_priority()
    }

    fn rules(&self) -> Vec<PatchRule> {
        rules::table()
    }

    fn jmp_epilogue(&self) -> RelocatableInst {
        RelocatableInst::EpilogueRel {
            inst: MCInst::new(Opcode(PSEUDO_JMP_REL32), vec![Operand::Imm(0)]),
            operand_idx: 0,
        }
    }

    fn target_prologue(&self) -> RelocatableInst {
        self.nop()
    }

    fn terminator(&self, next_addr: u64) -> Vec<RelocatableInst> {
        // R11 is caller-clobbered and never used to pass arguments; safe
        // to stomp unconditionally since the block being abandoned has no
        // downstream instructions relying on it.
        let scratch = regs::from_iced(iced_x86::Register::R11).expect("r11 is always allocatable");
        vec![
            raw(encode::mov_imm(scratch, next_addr as i64)),
            RelocatableInst::DataBlockRel {
                inst: MCInst::new(Opcode(PSEUDO_STORE_RIP_REL), vec![gpr(scratch), Operand::Imm(0)]),
                operand_idx: 1,
                offset: SELECTOR_SLOT_OFFSET,
            },
            self.jmp_epilogue(),
        ]
    }

    fn signal_callback(&self, callback_id: u32) -> Vec<RelocatableInst> {
        let scratch = regs::from_iced(iced_x86::Register::R11).expect("r11 is always allocatable");
        vec![
            raw(encode::mov_imm(scratch, callback_id as i64)),
            RelocatableInst::DataBlockRel {
                inst: MCInst::new(Opcode(PSEUDO_STORE_RIP_REL), vec![gpr(scratch), Operand::Imm(0)]),
                operand_idx: 1,
                offset: CALLBACK_SLOT_OFFSET,
            },
            self.jmp_epilogue(),
        ]
    }

    fn store_mem_access_address(&self, src: Reg) -> RelocatableInst {
        RelocatableInst::DataBlockRel {
            inst: MCInst::new(Opcode(PSEUDO_STORE_RIP_REL), vec![gpr(src), Operand::Imm(0)]),
            operand_idx: 1,
            offset: MEM_ACCESS_ADDRESS_SLOT_OFFSET,
        }
    }

    fn store_mem_access_value(&self, src: Reg) -> RelocatableInst {
        RelocatableInst::DataBlockRel {
            inst: MCInst::new(Opcode(PSEUDO_STORE_RIP_REL), vec![gpr(src), Operand::Imm(0)]),
            operand_idx: 1,
            offset: MEM_ACCESS_VALUE_SLOT_OFFSET,
        }
    }

    fn store_mem_access_size(&self, size: u8) -> RelocatableInst {
        RelocatableInst::DataBlockRel {
            inst: MCInst::new(Opcode(PSEUDO_STORE_IMM_RIP_REL), vec![Operand::Imm(0), Operand::Imm(size as i64)]),
            operand_idx: 0,
            offset: MEM_ACCESS_SIZE_SLOT_OFFSET,
        }
    }

    /// Order matters: the real host RSP is saved before it's repointed at
    /// the guest stack, eflags is restored off the still-valid host stack
    /// (a plain `push [rip+disp]`/`popfq`, no scratch register needed),
    /// every allocatable GPR is loaded from `GPRState`, and only then is
    /// RSP itself repointed at the guest stack — after which nothing here
    /// may touch the host stack again. The closing indirect jump reads
    /// `ENTRY_ADDR_SLOT_OFFSET` rather than any register, so it can run
    /// after the GPR loop without clobbering what it just loaded.
    fn block_prologue(&self) -> Vec<RelocatableInst> {
        let mut insts = vec![
            data_rel_disp_only(PSEUDO_STORE_RSP_RIP_REL, HOST_SP_SLOT_OFFSET),
            data_rel_disp_only(PSEUDO_PUSH_RIP_REL, GUEST_EFLAGS_SLOT_OFFSET),
            raw(encode::popfq()),
        ];
        for id in 0..qbdi_ir::AVAILABLE_GPR as u8 {
            insts.push(self.load_reg_from_context(Reg::new(id)));
        }
        insts.push(data_rel_disp_only(PSEUDO_LOAD_RSP_RIP_REL, GUEST_RSP_SLOT_OFFSET));
        insts.push(data_rel_disp_only(PSEUDO_JMP_RIP_REL_INDIRECT, ENTRY_ADDR_SLOT_OFFSET));
        insts
    }

    /// Mirror of `block_prologue`: the guest RSP is saved before anything
    /// else touches it, every GPR is saved to `GPRState` before any of
    /// them is reused, eflags is saved via `pushfq`/`pop [rip+disp]` (the
    /// real registers are already safe in `GPRState` by this point), and
    /// only then is the host RSP restored, right before the `ret` that
    /// actually needs it.
    fn block_epilogue(&self) -> Vec<RelocatableInst> {
        let mut insts = vec![data_rel_disp_only(PSEUDO_STORE_RSP_RIP_REL, GUEST_RSP_SLOT_OFFSET)];
        for id in 0..qbdi_ir::AVAILABLE_GPR as u8 {
            insts.push(self.save_reg_to_context(Reg::new(id)));
        }
        insts.push(raw(encode::pushfq()));
        insts.push(data_rel_disp_only(PSEUDO_POP_RIP_REL, GUEST_EFLAGS_SLOT_OFFSET));
        insts.push(data_rel_disp_only(PSEUDO_LOAD_RSP_RIP_REL, HOST_SP_SLOT_OFFSET));
        insts.push(raw(encode::ret()));
        insts
    }

    fn mov_imm(&self, dst: Reg, imm: i64) -> RelocatableInst {
        raw(encode::mov_imm(dst, imm))
    }

    fn mov_reg(&self, dst: Reg, src: Reg) -> RelocatableInst {
        raw(encode::mov_reg(dst, src))
    }

    fn store_to_shadow(&self, src: Reg, tag: Option<ShadowTag>) -> RelocatableInst {
        let inst = MCInst::new(Opcode(PSEUDO_STORE_RIP_REL), vec![gpr(src), Operand::Imm(0)]);
        match tag {
            Some(tag) => RelocatableInst::TaggedShadow {
                inst,
                operand_idx: 1,
                tag,
            },
            // No tag requested: still needs a fresh slot, so reuse the
            // `InstId` allocation path (it allocates exactly like
            // `TaggedShadow` with `None`, and its extra `next_inst_id`
            // bookkeeping is harmless here).
            None => RelocatableInst::InstId { inst, operand_idx: 1 },
        }
    }

    fn load_from_shadow(&self, dst: Reg, tag: ShadowTag) -> RelocatableInst {
        // Reads a freshly (re-)tagged shadow rather than looking up a
        // slot a different patch wrote earlier — cross-patch shadow
        // addressing needs the `ShadowRegistry::lookup` path the runtime
        // dispatcher drives, not a code-generation-time primitive. No
        // rule in this workspace's table calls this yet (see DESIGN.md).
        RelocatableInst::TaggedShadow {
            inst: MCInst::new(Opcode(PSEUDO_LOAD_RIP_REL), vec![gpr(dst), Operand::Imm(0)]),
            operand_idx: 1,
            tag,
        }
    }

    fn save_reg_to_context(&self, reg: Reg) -> RelocatableInst {
        RelocatableInst::DataBlockRel {
            inst: MCInst::new(Opcode(PSEUDO_STORE_RIP_REL), vec![gpr(reg), Operand::Imm(0)]),
            operand_idx: 1,
            offset: reg.offset() as i64,
        }
    }

    fn load_reg_from_context(&self, reg: Reg) -> RelocatableInst {
        RelocatableInst::DataBlockRel {
            inst: MCInst::new(Opcode(PSEUDO_LOAD_RIP_REL), vec![gpr(reg), Operand::Imm(0)]),
            operand_idx: 1,
            offset: reg.offset() as i64,
        }
    }

    fn push(&self, src: Reg) -> RelocatableInst {
        raw(encode::push(src))
    }

    fn pop(&self, dst: Reg) -> RelocatableInst {
        raw(encode::pop(dst))
    }

    fn compute_mem_address(&self, dst: Reg, inst: &MCInst) -> RelocatableInst {
        let mem = inst.operands.iter().find_map(|op| match op {
            Operand::Mem { base, index, scale, disp } => Some((*base, *index, *scale, *disp)),
            _ => None,
        });
        let Some((base, index, _scale, disp)) = mem else {
            return self.nop();
        };
        if index.is_some() {
            // Indexed addressing (`[base + index*scale]`) isn't needed by
            // any rule this workspace ships; `lea_base_disp` only covers
            // base+disp32 (see DESIGN.md).
            return self.nop();
        }
        match base {
            Some(RegLLVM::InstructionPointer) => {
                // RIP-relative targets are statically known at generate
                // time (the guest image is already loaded), so this is a
                // plain immediate load, not a relocation — the same
                // insight `GetPcOffset` relies on.
                raw(encode::mov_imm(dst, disp))
            }
            Some(RegLLVM::Gpr(base_reg)) => raw(encode::lea_base_disp(dst, base_reg, disp as i32)),
            _ => self.nop(),
        }
    }

    fn load_mem_value(&self, dst: Reg, addr_reg: Reg, size: u8) -> RelocatableInst {
        raw(encode::load_base_disp(dst, addr_reg, 0, size))
    }

    fn nop(&self) -> RelocatableInst {
        raw(encode::nop())
    }
}

fn reg_and_disp(inst: &MCInst) -> (Reg, i32) {
    let reg = match inst.operand(0) {
        Some(Operand::Reg(RegLLVM::Gpr(r))) => *r,
        _ => Reg::new(0),
    };
    let disp = match inst.operand(1) {
        Some(Operand::Imm(v)) => *v as i32,
        _ => 0,
    };
    (reg, disp)
}

/// Re-encode a guest instruction the `pc_as_source` rule rewrote via
/// `InstTransform::SetMemBase` — the only body instructions whose opcode
/// is still a real `iced_x86::Code` by the time `encode()` sees them.
/// Restricted to the two forms the rule table actually emits: `lea` and a
/// 64-bit register load from memory. Any other opcode reaching here is an
/// engine bug (`rules.rs`'s `UnsupportedPcRead` fallback is responsible
/// for rejecting everything else before translation reaches the encoder).
fn encode_rewritten_guest_inst(code: u32, inst: &MCInst) -> Vec<u8> {
    let (dst, base, disp) = match inst.operands.as_slice() {
        [Operand::Reg(RegLLVM::Gpr(dst)), Operand::Mem {
            base: Some(RegLLVM::Gpr(base)),
            disp,
            ..
        }] => (*dst, *base, *disp as i32),
        _ => return encode::nop(),
    };
    if code == iced_x86::Code::Lea_r64_m as u32 {
        encode::lea_base_disp(dst, base, disp)
    } else if code == iced_x86::Code::Mov_r64_rm64 as u32 {
        encode::load_base_disp(dst, base, disp, 8)
    } else {
        encode::nop()
    }
}
