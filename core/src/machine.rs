//! Ties the MMU and machine state together: program loading, the guest
//! stack/argv layout, and the step driver that runs blocks until a trap
//! needs the host's attention.

use std::path::Path;

use crate::address::GuestAddress;
use crate::constants::{GUEST_STACK_SIZE, REG_SP};
use crate::error::Result;
use crate::interp::exec_block;
use crate::mmu::Mmu;
use crate::state::{ExitReason, MachineState};

/// A loaded guest program: its address space and its register file.
pub struct Machine {
    pub mmu: Mmu,
    pub state: MachineState,
}

impl Machine {
    pub fn new() -> Self {
        Self {
            mmu: Mmu::new(),
            state: MachineState::new(),
        }
    }

    /// Loads the ELF at `path` and points the program counter at its entry.
    pub fn load_program(&mut self, path: &Path) -> Result<()> {
        self.mmu.load_elf(path)?;
        self.state.pc = self.mmu.entry.as_u64();
        Ok(())
    }

    /// Allocates the guest stack and writes the initial argc/argv/envp/auxv
    /// image. `args[0]` is dropped (it is the emulator's own name, not the
    /// guest's), so `args[1]` becomes the guest's `argv[0]`; `argc` is the
    /// full length of `args`, matching the reference's count of its own
    /// `main`'s `argc` rather than the number of pointers actually pushed.
    pub fn setup(&mut self, args: &[String]) -> Result<()> {
        let stack_base = self.mmu.alloc(GUEST_STACK_SIZE as i64)?;
        let mut sp = stack_base.as_u64() + GUEST_STACK_SIZE;

        sp -= 8; // auxv terminator
        sp -= 8; // envp terminator
        sp -= 8; // argv terminator

        for arg in args.iter().skip(1).rev() {
            let bytes = arg.as_bytes();
            let str_addr = self.mmu.alloc((bytes.len() + 1) as i64)?;
            self.mmu.write(str_addr, bytes);

            sp -= 8;
            self.mmu.write(GuestAddress::new(sp), &str_addr.as_u64().to_le_bytes());
        }

        sp -= 8; // argc
        let argc = args.len() as u64;
        self.mmu.write(GuestAddress::new(sp), &argc.to_le_bytes());

        self.state.gp_regs[REG_SP] = sp;
        Ok(())
    }

    /// Runs blocks until the guest issues `ecall`, returning control to the
    /// caller with `pc` already advanced past it.
    pub fn step(&mut self) -> Result<ExitReason> {
        loop {
            self.state.exit_reason = ExitReason::None;
            exec_block(&mut self.state, &self.mmu)?;
            debug_assert_ne!(self.state.exit_reason, ExitReason::None);
            match self.state.exit_reason {
                ExitReason::DirectBranch | ExitReason::IndirectBranch => {
                    self.state.pc = self.state.reenter_pc;
                    continue;
                }
                _ => break,
            }
        }
        self.state.pc = self.state.reenter_pc;
        Ok(ExitReason::Ecall)
    }
}

impl Default for Machine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setup_keeps_program_path_as_guest_argv0() {
        let mut machine = Machine::new();
        machine.mmu.base = GuestAddress::new(0x1000);
        machine.mmu.guest_alloc = GuestAddress::new(0x1000);
        machine.mmu.host_alloc =
            crate::address::HostAddress::new(GuestAddress::new(0x10_0000).to_host().as_u64());

        // args[0] is the emulator's own name and is dropped; args[1] ("prog")
        // must surface as the guest's argv[0], and argc counts all of args.
        machine
            .setup(&[
                "rvemu".to_string(),
                "prog".to_string(),
                "one".to_string(),
                "two".to_string(),
            ])
            .unwrap();

        let sp = machine.state.gp_regs[REG_SP];

        let mut argc_bytes = [0u8; 8];
        machine.mmu.read(GuestAddress::new(sp), &mut argc_bytes);
        assert_eq!(u64::from_le_bytes(argc_bytes), 4);

        let mut argv0_ptr_bytes = [0u8; 8];
        machine
            .mmu
            .read(GuestAddress::new(sp + 8), &mut argv0_ptr_bytes);
        let argv0_ptr = u64::from_le_bytes(argv0_ptr_bytes);

        let mut argv0_str = [0u8; 4];
        machine.mmu.read(GuestAddress::new(argv0_ptr), &mut argv0_str);
        assert_eq!(&argv0_str, b"prog");
    }
}
