use anyhow::{Result, anyhow, ensure};
use clap::{Parser, ValueEnum};
use dynasmrt::{DynasmApi, DynasmError, VecAssembler, dynasm};
use env_logger::Env;
use log::info;
use std::time::Instant;

use jitguard::{
    BackendKind, CodeSpaceWriteScope, Config,
    ResetPkuPermissionsForThreadSpawning, Runtime, RwxMemoryWriteScope,
};

mod code_space;
use code_space::CodeSpace;

/// Patches JIT code from several threads under W^X write scopes
#[derive(Parser)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Number of worker threads, each with its own code region
    #[clap(short, long, default_value_t = 4)]
    threads: usize,

    /// Number of patch-then-call rounds per worker
    #[clap(short, long, default_value_t = 1000)]
    patches: u32,

    /// Hardware backend used to toggle write access
    #[clap(short, long, value_enum, default_value_t = BackendArg::Auto)]
    backend: BackendArg,

    /// Write-protect each code region with `mprotect` when no fast backend
    /// is available
    #[clap(long)]
    write_protect_code_memory: bool,

    /// Don't consider protection keys when auto-detecting the backend
    #[clap(long)]
    no_pkeys: bool,
}

#[derive(ValueEnum, Clone, Copy)]
enum BackendArg {
    Auto,
    ThreadJit,
    Pkey,
    None,
}

impl From<BackendArg> for Option<BackendKind> {
    fn from(b: BackendArg) -> Self {
        match b {
            BackendArg::Auto => None,
            BackendArg::ThreadJit => Some(BackendKind::ThreadJit),
            BackendArg::Pkey => Some(BackendKind::ProtectionKey),
            BackendArg::None => Some(BackendKind::Unsupported),
        }
    }
}

/// Assembles `fn() -> u32 { value }`
#[cfg(target_arch = "x86_64")]
fn assemble(value: u32) -> Result<Vec<u8>, DynasmError> {
    let mut ops = VecAssembler::<dynasmrt::x64::X64Relocation>::new(0);
    dynasm!(ops
        ; .arch x64
        ; mov eax, value as i32
        ; ret
    );
    ops.finalize()
}

/// Assembles `fn() -> u32 { value }`
#[cfg(target_arch = "aarch64")]
fn assemble(value: u32) -> Result<Vec<u8>, DynasmError> {
    let mut ops =
        VecAssembler::<dynasmrt::aarch64::Aarch64Relocation>::new(0);
    dynasm!(ops
        ; .arch aarch64
        ; movz w0, #(value & 0xFFFF)
        ; movk w0, #(value >> 16), lsl 16
        ; ret
    );
    ops.finalize()
}

/// Repeatedly patches and calls a function in a private code region
fn worker(
    index: usize,
    runtime: &'static Runtime,
    patches: u32,
) -> Result<()> {
    let space = CodeSpace::new(CodeSpace::PAGE_SIZE, runtime)?;
    let seed = (index as u32) << 20;
    for i in 0..patches {
        let value = seed | i;
        let code = assemble(value)?;
        {
            let _outer = CodeSpaceWriteScope::for_region(&space);

            // Reopening the same region is free
            let scope = CodeSpaceWriteScope::for_region(&space);
            space.patch(0, &code, &scope);
        }
        ensure!(space.writers() == 0, "writer count leaked");

        // SAFETY: we just wrote a complete function to the start of the
        // region, and no writer is open
        let out = unsafe { space.call() };
        ensure!(out == value, "worker {index}: expected {value}, got {out}");
    }
    log::debug!("worker {index} done ({} byte region)", space.len());
    Ok(())
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .init();

    let args = Args::parse();
    let runtime = jitguard::init(Config {
        backend: args.backend.into(),
        memory_protection_keys: !args.no_pkeys,
        write_protect_code_memory: args.write_protect_code_memory,
    })?;
    info!(
        "backend: {:?}, mode: {:?}",
        runtime.backend(),
        runtime.mode()
    );
    if !RwxMemoryWriteScope::is_supported() {
        info!("no fast W^X backend available");
    }

    let start = Instant::now();

    // Hold a write scope while spawning, to show that workers don't inherit
    // write access from this thread
    let _scope = RwxMemoryWriteScope::new("spawning workers");
    let _reset = ResetPkuPermissionsForThreadSpawning::new();
    std::thread::scope(|s| {
        let handles: Vec<_> = (0..args.threads)
            .map(|i| s.spawn(move || worker(i, runtime, args.patches)))
            .collect();
        handles
            .into_iter()
            .enumerate()
            .try_for_each(|(i, h)| {
                h.join().map_err(|_| anyhow!("worker {i} panicked"))?
            })
    })?;

    info!(
        "{} threads x {} patches in {:?}",
        args.threads,
        args.patches,
        start.elapsed()
    );
    Ok(())
}
