//! The host-side syscall dispatcher the core traps into on `ecall`.
//!
//! This is deliberately small: enough of the Linux/RISC-V syscall ABI to
//! run a statically-linked guest that writes to stdout and grows its heap
//! via `brk`. Dispatch-by-number and the errno convention follow the
//! kernel's own syscall handler table; everything ring0/MSR-specific
//! there has no counterpart here since the guest never runs in its own
//! protection domain.

use std::io::Write;

use rv_core::Machine;
use rv_core::address::GuestAddress;
use rv_core::constants::{REG_A0, REG_A7};

const SYS_WRITE: u64 = 64;
const SYS_BRK: u64 = 214;
const SYS_EXIT: u64 = 93;
const SYS_EXIT_GROUP: u64 = 94;

const EBADF: i64 = 9;
const ENOSYS: i64 = 38;

const STDOUT_FD: u64 = 1;
const STDERR_FD: u64 = 2;

#[inline]
const fn errno(code: i64) -> u64 {
    (-code) as u64
}

/// What the outer run loop should do after a trap has been serviced.
pub enum Outcome {
    /// Resume the guest with this value placed in a0.
    Continue(u64),
    /// The guest asked to terminate with this status code.
    Exit(i32),
}

/// Services the syscall named by a7 using a0..a6 as arguments.
pub fn dispatch(machine: &mut Machine) -> rv_core::Result<Outcome> {
    let nr = machine.state.gp_regs[REG_A7];
    let a0 = machine.state.gp_regs[REG_A0];
    let a1 = machine.state.gp_regs[REG_A0 + 1];
    let a2 = machine.state.gp_regs[REG_A0 + 2];

    Ok(match nr {
        SYS_WRITE => Outcome::Continue(sys_write(machine, a0, a1, a2)),
        SYS_BRK => Outcome::Continue(sys_brk(machine, a0)?),
        SYS_EXIT | SYS_EXIT_GROUP => Outcome::Exit(a0 as i32),
        _ => Outcome::Continue(errno(ENOSYS)),
    })
}

fn sys_write(machine: &Machine, fd: u64, ptr: u64, len: u64) -> u64 {
    if fd != STDOUT_FD && fd != STDERR_FD {
        return errno(EBADF);
    }
    if len == 0 {
        return 0;
    }

    let mut buf = vec![0u8; len as usize];
    machine.mmu.read(GuestAddress::new(ptr), &mut buf);

    let result = if fd == STDOUT_FD {
        std::io::stdout().write_all(&buf)
    } else {
        std::io::stderr().write_all(&buf)
    };
    match result {
        Ok(()) => len,
        Err(_) => errno(EBADF),
    }
}

fn sys_brk(machine: &mut Machine, addr: u64) -> rv_core::Result<u64> {
    let current = machine.mmu.brk().as_u64();
    if addr == 0 || addr == current {
        return Ok(current);
    }
    let delta = addr as i64 - current as i64;
    machine.mmu.alloc(delta)?;
    Ok(machine.mmu.brk().as_u64())
}
