//! Per-opcode execute routines and the block-at-a-time dispatch loop.
//!
//! `exec_block` runs straight-line instructions until one of them leaves
//! `state.exit_reason` set to something other than `None`, at which point
//! the caller (the step driver in [`crate::machine`]) decides what happens
//! next.

use crate::address::GuestAddress;
use crate::constants::NAN_BOX_UPPER;
use crate::decode::decode;
use crate::error::{Error, Result};
use crate::float::{
    f32_classify, f32_to_i32_saturating, f32_to_i64_saturating, f32_to_u32_saturating,
    f32_to_u64_saturating, f64_classify, f64_to_i32_saturating, f64_to_i64_saturating,
    f64_to_u32_saturating, f64_to_u64_saturating,
};
use crate::inst::{Instruction, Op};
use crate::mmu::Mmu;
use crate::state::{ExitReason, MachineState};

unsafe fn load<T: Copy>(addr: u64) -> T {
    let host = GuestAddress::new(addr).to_host();
    unsafe { (host.as_ptr::<T>()).read_unaligned() }
}

unsafe fn store<T>(addr: u64, value: T) {
    let host = GuestAddress::new(addr).to_host();
    unsafe { (host.as_mut_ptr::<T>()).write_unaligned(value) }
}

/// Executes instructions starting at `state.pc` until one of them sets
/// `state.exit_reason`.
pub fn exec_block(state: &mut MachineState, mmu: &Mmu) -> Result<()> {
    loop {
        let raw: u32 = unsafe { load(state.pc) };
        let inst = decode(raw, state.pc)?;
        execute(state, mmu, &inst)?;
        state.clear_zero_reg();
        if state.exit_reason != ExitReason::None {
            return Ok(());
        }
        state.pc = state.pc.wrapping_add(inst.width());
    }
}

fn gp(state: &MachineState, idx: i32) -> u64 {
    state.gp_regs[idx as usize]
}

fn set_gp(state: &mut MachineState, idx: i32, value: u64) {
    if idx >= 0 {
        state.gp_regs[idx as usize] = value;
    }
}

fn execute(state: &mut MachineState, _mmu: &Mmu, inst: &Instruction) -> Result<()> {
    let imm = inst.imm as i64 as u64;
    match inst.op {
        Op::Lb => set_gp(state, inst.rd, unsafe {
            load::<i8>(gp(state, inst.rs1).wrapping_add(imm)) as i64 as u64
        }),
        Op::Lh => set_gp(state, inst.rd, unsafe {
            load::<i16>(gp(state, inst.rs1).wrapping_add(imm)) as i64 as u64
        }),
        Op::Lw => set_gp(state, inst.rd, unsafe {
            load::<i32>(gp(state, inst.rs1).wrapping_add(imm)) as i64 as u64
        }),
        Op::Ld => set_gp(state, inst.rd, unsafe {
            load::<i64>(gp(state, inst.rs1).wrapping_add(imm)) as u64
        }),
        Op::Lbu => set_gp(state, inst.rd, unsafe {
            load::<u8>(gp(state, inst.rs1).wrapping_add(imm)) as u64
        }),
        Op::Lhu => set_gp(state, inst.rd, unsafe {
            load::<u16>(gp(state, inst.rs1).wrapping_add(imm)) as u64
        }),
        Op::Lwu => set_gp(state, inst.rd, unsafe {
            load::<u32>(gp(state, inst.rs1).wrapping_add(imm)) as u64
        }),
        Op::Fence | Op::FenceI => {}

        Op::Addi => set_gp(state, inst.rd, gp(state, inst.rs1).wrapping_add(imm)),
        Op::Slli => set_gp(state, inst.rd, gp(state, inst.rs1) << (inst.imm & 0x3f)),
        Op::Slti => set_gp(
            state,
            inst.rd,
            ((gp(state, inst.rs1) as i64) < inst.imm as i64) as u64,
        ),
        Op::Sltiu => set_gp(state, inst.rd, (gp(state, inst.rs1) < imm) as u64),
        Op::Xori => set_gp(state, inst.rd, gp(state, inst.rs1) ^ imm),
        Op::Srli => set_gp(state, inst.rd, gp(state, inst.rs1) >> (inst.imm & 0x3f)),
        Op::Srai => set_gp(
            state,
            inst.rd,
            ((gp(state, inst.rs1) as i64) >> (inst.imm & 0x3f)) as u64,
        ),
        Op::Ori => set_gp(state, inst.rd, gp(state, inst.rs1) | imm),
        Op::Andi => set_gp(state, inst.rd, gp(state, inst.rs1) & imm),
        Op::Auipc => set_gp(state, inst.rd, state.pc.wrapping_add(imm)),
        Op::Addiw => set_gp(
            state,
            inst.rd,
            ((gp(state, inst.rs1) as i32).wrapping_add(inst.imm) as i64) as u64,
        ),
        Op::Slliw => set_gp(
            state,
            inst.rd,
            (((gp(state, inst.rs1) as i32) << (inst.imm & 0x1f)) as i64) as u64,
        ),
        Op::Srliw => set_gp(
            state,
            inst.rd,
            (((gp(state, inst.rs1) as u32) >> (inst.imm & 0x1f)) as i32 as i64) as u64,
        ),
        Op::Sraiw => set_gp(
            state,
            inst.rd,
            (((gp(state, inst.rs1) as i32) >> (inst.imm & 0x1f)) as i64) as u64,
        ),
        Op::Sb => unsafe {
            store::<u8>(gp(state, inst.rs1).wrapping_add(imm), gp(state, inst.rs2) as u8)
        },
        Op::Sh => unsafe {
            store::<u16>(gp(state, inst.rs1).wrapping_add(imm), gp(state, inst.rs2) as u16)
        },
        Op::Sw => unsafe {
            store::<u32>(gp(state, inst.rs1).wrapping_add(imm), gp(state, inst.rs2) as u32)
        },
        Op::Sd => unsafe {
            store::<u64>(gp(state, inst.rs1).wrapping_add(imm), gp(state, inst.rs2))
        },
        Op::Add => set_gp(
            state,
            inst.rd,
            gp(state, inst.rs1).wrapping_add(gp(state, inst.rs2)),
        ),
        Op::Sll => set_gp(
            state,
            inst.rd,
            gp(state, inst.rs1) << (gp(state, inst.rs2) & 0x3f),
        ),
        Op::Slt => set_gp(
            state,
            inst.rd,
            ((gp(state, inst.rs1) as i64) < gp(state, inst.rs2) as i64) as u64,
        ),
        Op::Sltu => set_gp(
            state,
            inst.rd,
            (gp(state, inst.rs1) < gp(state, inst.rs2)) as u64,
        ),
        Op::Xor => set_gp(state, inst.rd, gp(state, inst.rs1) ^ gp(state, inst.rs2)),
        Op::Srl => set_gp(
            state,
            inst.rd,
            gp(state, inst.rs1) >> (gp(state, inst.rs2) & 0x3f),
        ),
        Op::Or => set_gp(state, inst.rd, gp(state, inst.rs1) | gp(state, inst.rs2)),
        Op::And => set_gp(state, inst.rd, gp(state, inst.rs1) & gp(state, inst.rs2)),
        Op::Mul => set_gp(
            state,
            inst.rd,
            gp(state, inst.rs1).wrapping_mul(gp(state, inst.rs2)),
        ),
        Op::Mulh => set_gp(state, inst.rd, {
            let a = gp(state, inst.rs1) as i64 as i128;
            let b = gp(state, inst.rs2) as i64 as i128;
            ((a * b) >> 64) as u64
        }),
        Op::Mulhsu => set_gp(state, inst.rd, {
            let a = gp(state, inst.rs1) as i64 as i128;
            let b = gp(state, inst.rs2) as u128 as i128;
            ((a * b) >> 64) as u64
        }),
        Op::Mulhu => set_gp(state, inst.rd, {
            let a = gp(state, inst.rs1) as u128;
            let b = gp(state, inst.rs2) as u128;
            ((a * b) >> 64) as u64
        }),
        Op::Div => set_gp(state, inst.rd, {
            let a = gp(state, inst.rs1) as i64;
            let b = gp(state, inst.rs2) as i64;
            if b == 0 {
                u64::MAX
            } else if a == i64::MIN && b == -1 {
                i64::MIN as u64
            } else {
                (a.wrapping_div(b)) as u64
            }
        }),
        Op::Divu => set_gp(state, inst.rd, {
            let a = gp(state, inst.rs1);
            let b = gp(state, inst.rs2);
            if b == 0 { u64::MAX } else { a / b }
        }),
        Op::Rem => set_gp(state, inst.rd, {
            let a = gp(state, inst.rs1) as i64;
            let b = gp(state, inst.rs2) as i64;
            if b == 0 {
                a as u64
            } else if a == i64::MIN && b == -1 {
                0
            } else {
                (a.wrapping_rem(b)) as u64
            }
        }),
        Op::Remu => set_gp(state, inst.rd, {
            let a = gp(state, inst.rs1);
            let b = gp(state, inst.rs2);
            if b == 0 { a } else { a % b }
        }),
        Op::Sub => set_gp(
            state,
            inst.rd,
            gp(state, inst.rs1).wrapping_sub(gp(state, inst.rs2)),
        ),
        Op::Sra => set_gp(
            state,
            inst.rd,
            ((gp(state, inst.rs1) as i64) >> (gp(state, inst.rs2) & 0x3f)) as u64,
        ),
        Op::Lui => set_gp(state, inst.rd, imm),
        Op::Addw => set_gp(state, inst.rd, {
            let a = gp(state, inst.rs1) as i32;
            let b = gp(state, inst.rs2) as i32;
            a.wrapping_add(b) as i64 as u64
        }),
        Op::Sllw => set_gp(state, inst.rd, {
            let a = gp(state, inst.rs1) as i32;
            let shamt = gp(state, inst.rs2) & 0x1f;
            (a << shamt) as i64 as u64
        }),
        Op::Srlw => set_gp(state, inst.rd, {
            let a = gp(state, inst.rs1) as u32;
            let shamt = gp(state, inst.rs2) & 0x1f;
            ((a >> shamt) as i32) as i64 as u64
        }),
        Op::Mulw => set_gp(state, inst.rd, {
            let a = gp(state, inst.rs1) as i32;
            let b = gp(state, inst.rs2) as i32;
            a.wrapping_mul(b) as i64 as u64
        }),
        Op::Divw => set_gp(state, inst.rd, {
            let a = gp(state, inst.rs1) as i32;
            let b = gp(state, inst.rs2) as i32;
            let r = if b == 0 {
                -1i32
            } else if a == i32::MIN && b == -1 {
                i32::MIN
            } else {
                a.wrapping_div(b)
            };
            r as i64 as u64
        }),
        Op::Divuw => set_gp(state, inst.rd, {
            let a = gp(state, inst.rs1) as u32;
            let b = gp(state, inst.rs2) as u32;
            let r = if b == 0 { u32::MAX } else { a / b };
            (r as i32) as i64 as u64
        }),
        Op::Remw => set_gp(state, inst.rd, {
            let a = gp(state, inst.rs1) as i32;
            let b = gp(state, inst.rs2) as i32;
            let r = if b == 0 {
                a
            } else if a == i32::MIN && b == -1 {
                0
            } else {
                a.wrapping_rem(b)
            };
            r as i64 as u64
        }),
        Op::Remuw => set_gp(state, inst.rd, {
            let a = gp(state, inst.rs1) as u32;
            let b = gp(state, inst.rs2) as u32;
            let r = if b == 0 { a } else { a % b };
            (r as i32) as i64 as u64
        }),
        Op::Subw => set_gp(state, inst.rd, {
            let a = gp(state, inst.rs1) as i32;
            let b = gp(state, inst.rs2) as i32;
            a.wrapping_sub(b) as i64 as u64
        }),
        Op::Sraw => set_gp(state, inst.rd, {
            let a = gp(state, inst.rs1) as i32;
            let shamt = gp(state, inst.rs2) & 0x1f;
            (a >> shamt) as i64 as u64
        }),

        Op::Beq => execute_branch(state, inst, gp(state, inst.rs1) == gp(state, inst.rs2)),
        Op::Bne => execute_branch(state, inst, gp(state, inst.rs1) != gp(state, inst.rs2)),
        Op::Blt => execute_branch(
            state,
            inst,
            (gp(state, inst.rs1) as i64) < gp(state, inst.rs2) as i64,
        ),
        Op::Bge => execute_branch(
            state,
            inst,
            (gp(state, inst.rs1) as i64) >= gp(state, inst.rs2) as i64,
        ),
        Op::Bltu => execute_branch(state, inst, gp(state, inst.rs1) < gp(state, inst.rs2)),
        Op::Bgeu => execute_branch(state, inst, gp(state, inst.rs1) >= gp(state, inst.rs2)),

        Op::Jalr => {
            let rs1 = gp(state, inst.rs1);
            set_gp(state, inst.rd, state.pc.wrapping_add(inst.width()));
            state.reenter_pc = (rs1.wrapping_add(imm)) & !1u64;
            state.exit_reason = ExitReason::IndirectBranch;
        }
        Op::Jal => {
            set_gp(state, inst.rd, state.pc.wrapping_add(inst.width()));
            state.pc = state.pc.wrapping_add(imm);
            state.reenter_pc = state.pc;
            state.exit_reason = ExitReason::DirectBranch;
        }
        Op::Ecall => {
            state.exit_reason = ExitReason::Ecall;
            state.reenter_pc = state.pc.wrapping_add(4);
        }

        Op::Csrrw | Op::Csrrs | Op::Csrrc | Op::Csrrwi | Op::Csrrsi | Op::Csrrci => {
            check_csr(inst.csr)?;
            set_gp(state, inst.rd, 0);
        }

        Op::Flw => {
            let addr = gp(state, inst.rs1).wrapping_add(imm);
            let bits = unsafe { load::<u32>(addr) };
            state.fp_regs[inst.rd as usize].store_bits(bits as u64 | NAN_BOX_UPPER);
        }
        Op::Fld => {
            let addr = gp(state, inst.rs1).wrapping_add(imm);
            let bits = unsafe { load::<u64>(addr) };
            state.fp_regs[inst.rd as usize].store_bits(bits);
        }
        Op::Fsw => unsafe {
            store::<u32>(gp(state, inst.rs1).wrapping_add(imm),
                state.fp_regs[inst.rs2 as usize].low_word(),
            )
        },
        Op::Fsd => unsafe {
            store::<u64>(gp(state, inst.rs1).wrapping_add(imm),
                state.fp_regs[inst.rs2 as usize].bits(),
            )
        },

        Op::FmaddS => fma_single(state, inst, |a, b, c| a * b + c),
        Op::FmsubS => fma_single(state, inst, |a, b, c| a * b - c),
        Op::FnmsubS => fma_single(state, inst, |a, b, c| -(a * b) + c),
        Op::FnmaddS => fma_single(state, inst, |a, b, c| -(a * b) - c),
        Op::FmaddD => fma_double(state, inst, |a, b, c| a * b + c),
        Op::FmsubD => fma_double(state, inst, |a, b, c| a * b - c),
        Op::FnmsubD => fma_double(state, inst, |a, b, c| -(a * b) + c),
        Op::FnmaddD => fma_double(state, inst, |a, b, c| -(a * b) - c),

        Op::FaddS => bin_single(state, inst, |a, b| a + b),
        Op::FsubS => bin_single(state, inst, |a, b| a - b),
        Op::FmulS => bin_single(state, inst, |a, b| a * b),
        Op::FdivS => bin_single(state, inst, |a, b| a / b),
        Op::FsqrtS => {
            let rs1 = fp_single(state, inst.rs1);
            store_single(state, inst.rd, rs1.sqrt());
        }
        Op::FminS => bin_single(state, inst, |a, b| if a < b { a } else { b }),
        Op::FmaxS => bin_single(state, inst, |a, b| if a > b { a } else { b }),

        Op::FaddD => bin_double(state, inst, |a, b| a + b),
        Op::FsubD => bin_double(state, inst, |a, b| a - b),
        Op::FmulD => bin_double(state, inst, |a, b| a * b),
        Op::FdivD => bin_double(state, inst, |a, b| a / b),
        Op::FsqrtD => {
            let rs1 = fp_double(state, inst.rs1);
            store_double(state, inst.rd, rs1.sqrt());
        }
        Op::FminD => bin_double(state, inst, |a, b| if a < b { a } else { b }),
        Op::FmaxD => bin_double(state, inst, |a, b| if a > b { a } else { b }),

        Op::FsgnjS => sgnj_single(state, inst, false, false),
        Op::FsgnjnS => sgnj_single(state, inst, true, false),
        Op::FsgnjxS => sgnj_single(state, inst, false, true),
        Op::FsgnjD => sgnj_double(state, inst, false, false),
        Op::FsgnjnD => sgnj_double(state, inst, true, false),
        Op::FsgnjxD => sgnj_double(state, inst, false, true),

        Op::FeqS => set_gp(
            state,
            inst.rd,
            (fp_single(state, inst.rs1) == fp_single(state, inst.rs2)) as u64,
        ),
        Op::FltS => set_gp(
            state,
            inst.rd,
            (fp_single(state, inst.rs1) < fp_single(state, inst.rs2)) as u64,
        ),
        Op::FleS => set_gp(
            state,
            inst.rd,
            (fp_single(state, inst.rs1) <= fp_single(state, inst.rs2)) as u64,
        ),
        Op::FeqD => set_gp(
            state,
            inst.rd,
            (fp_double(state, inst.rs1) == fp_double(state, inst.rs2)) as u64,
        ),
        Op::FltD => set_gp(
            state,
            inst.rd,
            (fp_double(state, inst.rs1) < fp_double(state, inst.rs2)) as u64,
        ),
        Op::FleD => set_gp(
            state,
            inst.rd,
            (fp_double(state, inst.rs1) <= fp_double(state, inst.rs2)) as u64,
        ),

        Op::FclassS => set_gp(state, inst.rd, f32_classify(fp_single(state, inst.rs1))),
        Op::FclassD => set_gp(state, inst.rd, f64_classify(fp_double(state, inst.rs1))),

        Op::FcvtWS => set_gp(
            state,
            inst.rd,
            f32_to_i32_saturating(fp_single(state, inst.rs1)) as i64 as u64,
        ),
        Op::FcvtWuS => set_gp(
            state,
            inst.rd,
            f32_to_u32_saturating(fp_single(state, inst.rs1)) as i32 as i64 as u64,
        ),
        Op::FcvtWD => set_gp(
            state,
            inst.rd,
            f64_to_i32_saturating(fp_double(state, inst.rs1)) as i64 as u64,
        ),
        Op::FcvtWuD => set_gp(
            state,
            inst.rd,
            f64_to_u32_saturating(fp_double(state, inst.rs1)) as i32 as i64 as u64,
        ),
        Op::FcvtLS => set_gp(state, inst.rd, f32_to_i64_saturating(fp_single(state, inst.rs1)) as u64),
        Op::FcvtLuS => set_gp(state, inst.rd, f32_to_u64_saturating(fp_single(state, inst.rs1))),
        Op::FcvtLD => set_gp(state, inst.rd, f64_to_i64_saturating(fp_double(state, inst.rs1)) as u64),
        Op::FcvtLuD => set_gp(state, inst.rd, f64_to_u64_saturating(fp_double(state, inst.rs1))),

        Op::FcvtSW => store_single(state, inst.rd, (gp(state, inst.rs1) as i32) as f32),
        Op::FcvtSWu => store_single(state, inst.rd, (gp(state, inst.rs1) as u32) as f32),
        Op::FcvtSL => store_single(state, inst.rd, gp(state, inst.rs1) as i64 as f32),
        Op::FcvtSLu => store_single(state, inst.rd, gp(state, inst.rs1) as f32),
        Op::FcvtDW => store_double(state, inst.rd, (gp(state, inst.rs1) as i32) as f64),
        Op::FcvtDWu => store_double(state, inst.rd, (gp(state, inst.rs1) as u32) as f64),
        Op::FcvtDL => store_double(state, inst.rd, gp(state, inst.rs1) as i64 as f64),
        Op::FcvtDLu => store_double(state, inst.rd, gp(state, inst.rs1) as f64),

        Op::FcvtSD => store_single(state, inst.rd, fp_double(state, inst.rs1) as f32),
        Op::FcvtDS => store_double(state, inst.rd, fp_single(state, inst.rs1) as f64),

        Op::FmvXW => set_gp(
            state,
            inst.rd,
            (state.fp_regs[inst.rs1 as usize].low_word() as i32) as i64 as u64,
        ),
        Op::FmvWX => {
            let bits = gp(state, inst.rs1) as u32;
            state.fp_regs[inst.rd as usize].store_bits(bits as u64 | NAN_BOX_UPPER);
        }
        Op::FmvXD => set_gp(state, inst.rd, state.fp_regs[inst.rs1 as usize].bits()),
        Op::FmvDX => state.fp_regs[inst.rd as usize].store_bits(gp(state, inst.rs1)),
    }

    Ok(())
}

fn execute_branch(state: &mut MachineState, inst: &Instruction, taken: bool) {
    if taken {
        let target = state.pc.wrapping_add(inst.imm as i64 as u64);
        state.pc = target;
        state.reenter_pc = target;
        state.exit_reason = ExitReason::DirectBranch;
    }
}

fn check_csr(csr: u16) -> Result<()> {
    match csr {
        0x001 | 0x002 | 0x003 => Ok(()),
        other => Err(Error::UnsupportedCsr(other)),
    }
}

fn fp_single(state: &MachineState, idx: i32) -> f32 {
    state.fp_regs[idx as usize].as_single()
}

fn fp_double(state: &MachineState, idx: i32) -> f64 {
    state.fp_regs[idx as usize].as_double()
}

fn store_single(state: &mut MachineState, idx: i32, value: f32) {
    state.fp_regs[idx as usize].store_single(value);
}

fn store_double(state: &mut MachineState, idx: i32, value: f64) {
    state.fp_regs[idx as usize].store_double(value);
}

fn bin_single(state: &mut MachineState, inst: &Instruction, op: impl Fn(f32, f32) -> f32) {
    let result = op(fp_single(state, inst.rs1), fp_single(state, inst.rs2));
    store_single(state, inst.rd, result);
}

fn bin_double(state: &mut MachineState, inst: &Instruction, op: impl Fn(f64, f64) -> f64) {
    let result = op(fp_double(state, inst.rs1), fp_double(state, inst.rs2));
    store_double(state, inst.rd, result);
}

fn fma_single(state: &mut MachineState, inst: &Instruction, op: impl Fn(f32, f32, f32) -> f32) {
    let result = op(
        fp_single(state, inst.rs1),
        fp_single(state, inst.rs2),
        fp_single(state, inst.rs3),
    );
    store_single(state, inst.rd, result);
}

fn fma_double(state: &mut MachineState, inst: &Instruction, op: impl Fn(f64, f64, f64) -> f64) {
    let result = op(
        fp_double(state, inst.rs1),
        fp_double(state, inst.rs2),
        fp_double(state, inst.rs3),
    );
    store_double(state, inst.rd, result);
}

fn fsgnj32(rs1: u32, rs2: u32, negate: bool, xor: bool) -> u32 {
    let sign_bit = if xor {
        (rs1 ^ rs2) & 0x8000_0000
    } else if negate {
        (!rs2) & 0x8000_0000
    } else {
        rs2 & 0x8000_0000
    };
    (rs1 & 0x7fff_ffff) | sign_bit
}

fn fsgnj64(rs1: u64, rs2: u64, negate: bool, xor: bool) -> u64 {
    let sign_bit = if xor {
        (rs1 ^ rs2) & 0x8000_0000_0000_0000
    } else if negate {
        (!rs2) & 0x8000_0000_0000_0000
    } else {
        rs2 & 0x8000_0000_0000_0000
    };
    (rs1 & 0x7fff_ffff_ffff_ffff) | sign_bit
}

fn sgnj_single(state: &mut MachineState, inst: &Instruction, negate: bool, xor: bool) {
    let rs1 = state.fp_regs[inst.rs1 as usize].low_word();
    let rs2 = state.fp_regs[inst.rs2 as usize].low_word();
    let result = fsgnj32(rs1, rs2, negate, xor);
    state.fp_regs[inst.rd as usize].store_bits(result as u64 | NAN_BOX_UPPER);
}

fn sgnj_double(state: &mut MachineState, inst: &Instruction, negate: bool, xor: bool) {
    let rs1 = state.fp_regs[inst.rs1 as usize].bits();
    let rs2 = state.fp_regs[inst.rs2 as usize].bits();
    state.fp_regs[inst.rd as usize].store_bits(fsgnj64(rs1, rs2, negate, xor));
}
