use std::path::Path;

use clap::Parser;
use rv_core::Machine;
use rv_core::constants::REG_A0;

use crate::error::fatal;
use crate::syscall::{self, Outcome};

/// Runs a statically-linked RISC-V64 ELF binary under emulation.
///
/// The program path becomes the guest's `argv[0]`; arguments after it are
/// passed through as `argv[1..]`, matching the host invocation.
#[derive(Parser)]
#[command(name = "rvemu")]
pub struct Cmd {
    /// Path to the guest ELF binary.
    pub program: String,

    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,
}

impl Cmd {
    pub fn execute(&self) -> i32 {
        let mut machine = Machine::new();

        if let Err(err) = machine.load_program(Path::new(&self.program)) {
            fatal!("{err}");
        }

        // `setup` drops slot 0 (the emulator's own name) the way the
        // reference drops `argv[0]` of its `main`; the program path here
        // becomes the guest's `argv[0]`.
        let mut argv = Vec::with_capacity(self.args.len() + 2);
        argv.push("rvemu".to_string());
        argv.push(self.program.clone());
        argv.extend(self.args.iter().cloned());
        if let Err(err) = machine.setup(&argv) {
            fatal!("{err}");
        }

        loop {
            if let Err(err) = machine.step() {
                fatal!("{err}");
            }
            match syscall::dispatch(&mut machine) {
                Ok(Outcome::Continue(value)) => {
                    machine.state.gp_regs[REG_A0] = value;
                }
                Ok(Outcome::Exit(code)) => return code,
                Err(err) => fatal!("{err}"),
            }
        }
    }
}
