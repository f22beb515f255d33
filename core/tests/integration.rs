//! End-to-end tests that build a minimal RISC-V64 ELF in memory, load it
//! through the real MMU, and drive it through `Machine::step` exactly as
//! the command-line front end would.

use std::fs;
use std::path::PathBuf;

use rv_core::Machine;
use rv_core::constants::{REG_A0, REG_A7};

const PT_LOAD: u32 = 1;
const EM_RISCV: u16 = 243;
const VADDR: u64 = 0x1_0000;

fn write_elf(name: &str, code: &[u8]) -> PathBuf {
    let ehsize = 64u64;
    let phentsize = 56u64;
    let offset = ehsize + phentsize;

    let mut bytes = Vec::new();
    bytes.extend_from_slice(&[0x7f, b'E', b'L', b'F', 2, 1, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
    bytes.extend_from_slice(&2u16.to_le_bytes()); // e_type = ET_EXEC
    bytes.extend_from_slice(&EM_RISCV.to_le_bytes());
    bytes.extend_from_slice(&1u32.to_le_bytes()); // e_version
    bytes.extend_from_slice(&VADDR.to_le_bytes()); // e_entry
    bytes.extend_from_slice(&offset.to_le_bytes()); // e_phoff
    bytes.extend_from_slice(&0u64.to_le_bytes()); // e_shoff
    bytes.extend_from_slice(&0u32.to_le_bytes()); // e_flags
    bytes.extend_from_slice(&(ehsize as u16).to_le_bytes());
    bytes.extend_from_slice(&(phentsize as u16).to_le_bytes());
    bytes.extend_from_slice(&1u16.to_le_bytes()); // e_phnum
    bytes.extend_from_slice(&0u16.to_le_bytes()); // e_shentsize
    bytes.extend_from_slice(&0u16.to_le_bytes()); // e_shnum
    bytes.extend_from_slice(&0u16.to_le_bytes()); // e_shstrndx
    assert_eq!(bytes.len() as u64, ehsize);

    let filesz = code.len() as u64;
    bytes.extend_from_slice(&PT_LOAD.to_le_bytes());
    bytes.extend_from_slice(&5u32.to_le_bytes()); // p_flags = R | X
    bytes.extend_from_slice(&offset.to_le_bytes()); // p_offset
    bytes.extend_from_slice(&VADDR.to_le_bytes()); // p_vaddr
    bytes.extend_from_slice(&VADDR.to_le_bytes()); // p_paddr
    bytes.extend_from_slice(&filesz.to_le_bytes()); // p_filesz
    bytes.extend_from_slice(&filesz.to_le_bytes()); // p_memsz
    bytes.extend_from_slice(&0x1000u64.to_le_bytes()); // p_align
    assert_eq!(bytes.len() as u64, offset);

    bytes.extend_from_slice(code);

    let path = std::env::temp_dir().join(format!("rvemu-test-{}-{}", std::process::id(), name));
    fs::write(&path, &bytes).unwrap();
    path
}

fn word(raw: u32) -> [u8; 4] {
    raw.to_le_bytes()
}

/// Encodes a B-type branch (the inverse of the decoder's `b_imm` extraction).
fn b_type(imm: u32, rs1: u32, rs2: u32, funct3: u32, opcode: u32) -> u32 {
    (((imm >> 12) & 1) << 31)
        | (((imm >> 5) & 0x3f) << 25)
        | (rs2 << 20)
        | (rs1 << 15)
        | (funct3 << 12)
        | (((imm >> 1) & 0xf) << 8)
        | (((imm >> 11) & 1) << 7)
        | opcode
}

#[test]
fn exits_with_guest_requested_code() {
    // addi a0, x0, 42 ; addi a7, x0, 93 ; ecall
    let addi_a0_42: u32 = (42 << 20) | (10 << 7) | 0x13;
    let addi_a7_93: u32 = (93 << 20) | (17 << 7) | 0x13;
    let ecall: u32 = 0x73;

    let mut code = Vec::new();
    code.extend_from_slice(&word(addi_a0_42));
    code.extend_from_slice(&word(addi_a7_93));
    code.extend_from_slice(&word(ecall));

    let path = write_elf("exit-code", &code);
    let mut machine = Machine::new();
    machine.load_program(&path).unwrap();
    machine.setup(&["prog".to_string()]).unwrap();

    let reason = machine.step().unwrap();
    assert_eq!(reason, rv_core::ExitReason::Ecall);
    assert_eq!(machine.state.gp_regs[REG_A7], 93);
    assert_eq!(machine.state.gp_regs[REG_A0], 42);

    fs::remove_file(&path).ok();
}

#[test]
fn branch_not_taken_falls_through_to_next_block() {
    // addi a0, x0, 1
    // beq a0, x0, +8   (not taken: a0 != 0)
    // addi a1, x0, 7
    // addi a7, x0, 93
    // ecall
    let addi_a0_1: u32 = (1 << 20) | (10 << 7) | 0x13;
    let beq: u32 = b_type(8, 10, 0, 0, 0x63);
    let addi_a1_7: u32 = (7 << 20) | (11 << 7) | 0x13;
    let addi_a7_93: u32 = (93 << 20) | (17 << 7) | 0x13;
    let ecall: u32 = 0x73;

    let mut code = Vec::new();
    for w in [addi_a0_1, beq, addi_a1_7, addi_a7_93, ecall] {
        code.extend_from_slice(&word(w));
    }

    let path = write_elf("branch-fallthrough", &code);
    let mut machine = Machine::new();
    machine.load_program(&path).unwrap();
    machine.setup(&["prog".to_string()]).unwrap();

    machine.step().unwrap();
    assert_eq!(machine.state.gp_regs[11], 7);

    fs::remove_file(&path).ok();
}

#[test]
fn jal_links_return_address_and_jumps() {
    // jal ra, +8        ; at VADDR
    // addi x0, x0, 0    ; skipped
    // addi a0, x0, 99   ; jump target
    // addi a7, x0, 93
    // ecall
    let jal: u32 = {
        let imm: u32 = 8;
        let imm20 = (imm >> 20) & 1;
        let imm10_1 = (imm >> 1) & 0x3ff;
        let imm11 = (imm >> 11) & 1;
        let imm19_12 = (imm >> 12) & 0xff;
        (imm20 << 31) | (imm10_1 << 21) | (imm11 << 20) | (imm19_12 << 12) | (1 << 7) | 0x6f
    };
    let nop: u32 = 0x13; // addi x0, x0, 0
    let addi_a0_99: u32 = (99 << 20) | (10 << 7) | 0x13;
    let addi_a7_93: u32 = (93 << 20) | (17 << 7) | 0x13;
    let ecall: u32 = 0x73;

    let mut code = Vec::new();
    for w in [jal, nop, addi_a0_99, addi_a7_93, ecall] {
        code.extend_from_slice(&word(w));
    }

    let path = write_elf("jal-jump", &code);
    let mut machine = Machine::new();
    machine.load_program(&path).unwrap();
    machine.setup(&["prog".to_string()]).unwrap();

    machine.step().unwrap();
    assert_eq!(machine.state.gp_regs[1], VADDR + 4); // ra
    assert_eq!(machine.state.gp_regs[REG_A0], 99);

    fs::remove_file(&path).ok();
}
