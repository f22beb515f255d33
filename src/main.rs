mod cmd;
mod error;
mod syscall;

use clap::Parser;

fn main() {
    let cmd = cmd::run::Cmd::parse();
    let code = cmd.execute();
    std::process::exit(code);
}
