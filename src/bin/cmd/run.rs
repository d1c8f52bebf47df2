use std::path::PathBuf;

use clap::{Args, ValueEnum};

#[derive(Clone, Copy, ValueEnum)]
pub enum FormatArg {
    Bin,
    Elf64,
    Any,
}

impl From<FormatArg> for ivee::Format {
    fn from(f: FormatArg) -> Self {
        match f {
            FormatArg::Bin => ivee::Format::Bin,
            FormatArg::Elf64 => ivee::Format::Elf64,
            FormatArg::Any => ivee::Format::Any,
        }
    }
}

#[derive(Args)]
pub struct Cmd {
    /// Path to the guest image (ELF64 executable/shared object, or a raw flat binary).
    pub filepath: PathBuf,

    #[arg(short, long, value_enum, default_value_t = FormatArg::Any)]
    pub format: FormatArg,

    #[arg(long, default_value_t = 0)]
    pub rax: u64,
    #[arg(long, default_value_t = 0)]
    pub rdi: u64,
    #[arg(long, default_value_t = 0)]
    pub rsi: u64,
}

impl Cmd {
    pub fn execute(&self) -> ivee::Result<()> {
        let caps = ivee::capabilities();
        let mut instance = ivee::create(caps)?;

        ivee::load_executable(&mut instance, &self.filepath, self.format.into())?;

        let regs = ivee::Registers {
            rax: self.rax,
            rdi: self.rdi,
            rsi: self.rsi,
            ..Default::default()
        };
        let out = ivee::call(&mut instance, &regs)?;

        println!("rax = {:#x}", out.rax);
        println!("rbx = {:#x}", out.rbx);
        println!("rcx = {:#x}", out.rcx);
        println!("rdx = {:#x}", out.rdx);
        if let Some(v) = ivee::last_exit_value(&instance) {
            log::debug!("guest wrote {v:#x} to the exit port before terminating");
        }

        ivee::destroy(instance);
        Ok(())
    }
}
