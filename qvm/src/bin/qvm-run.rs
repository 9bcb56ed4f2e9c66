use std::io::{self, Write};
use std::time::Instant;

use qvm::config::parse_number;
use qvm::wire::format_instruction;
use qvm::{
    ExecutionMode, FaultKind, RuntimeFault, SandboxMemory, SyscallTable, VmConfig, VmHandle,
    VmRegistry, assemble, disassemble_bytes, encode_image, install_shared_traps,
    render_fault, render_load_error,
};
use qvm_abi::ModuleKind;
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use tracing::info;

const DEFAULT_FRAMES: u32 = 1;
/// Simulated time between module frames, in milliseconds.
const FRAME_MSEC: i32 = 50;

#[derive(Debug, Clone, PartialEq, Eq)]
struct CliConfig {
    image: Option<String>,
    module: Option<ModuleKind>,
    frames: u32,
    call_args: Option<Vec<i32>>,
    interpret: bool,
    budget: Option<u64>,
    stack_size: Option<u32>,
    disasm: bool,
    assemble_source: Option<String>,
    output: Option<String>,
    repl: bool,
    help: bool,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            image: None,
            module: None,
            frames: DEFAULT_FRAMES,
            call_args: None,
            interpret: false,
            budget: None,
            stack_size: None,
            disasm: false,
            assemble_source: None,
            output: None,
            repl: false,
            help: false,
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();
    let args: Vec<String> = std::env::args().skip(1).collect();
    let cli = parse_cli_args(&args).map_err(io::Error::other)?;
    if cli.help {
        print_usage();
        return Ok(());
    }
    if let Some(source_path) = cli.assemble_source.as_ref() {
        let output = cli
            .output
            .as_ref()
            .ok_or_else(|| io::Error::other("--assemble requires -o <output>"))?;
        let source = std::fs::read_to_string(source_path)?;
        let image = assemble(&source).map_err(|err| io::Error::other(format!("{source_path}:{err}")))?;
        let encoded = encode_image(&image);
        std::fs::write(output, &encoded)?;
        println!(
            "wrote {} bytes ({} instructions) to {output}",
            encoded.len(),
            image.instruction_count()
        );
        return Ok(());
    }

    let image_path = cli
        .image
        .as_ref()
        .ok_or_else(|| io::Error::other("missing image path"))?;
    let bytes = std::fs::read(image_path)?;
    if cli.disasm {
        match disassemble_bytes(&bytes) {
            Ok(listing) => print!("{listing}"),
            Err(err) => return Err(io::Error::other(render_load_error(&err)).into()),
        }
        return Ok(());
    }

    let config = build_config(&cli)?;
    let mut registry = VmRegistry::new(config);
    let kind = cli.module.unwrap_or(ModuleKind::Game);
    let syscalls = console_syscalls(kind).into_shared();
    let name = module_name(image_path);
    let handle = match registry.load(&name, &bytes, syscalls) {
        Ok(handle) => handle,
        Err(err) => return Err(io::Error::other(render_load_error(&err)).into()),
    };

    if cli.repl {
        return run_repl(&mut registry, handle);
    }
    let outcome = match (cli.module, cli.call_args.as_ref()) {
        (Some(kind), None) => run_module(&mut registry, handle, kind, cli.frames),
        (_, Some(args)) => registry.call(handle, args).map(|value| {
            println!("=> {value}");
        }),
        (None, None) => registry.call(handle, &[0]).map(|value| {
            println!("=> {value}");
        }),
    };
    if let Err(fault) = outcome {
        return Err(io::Error::other(report_fault(&registry, handle, &fault)).into());
    }
    Ok(())
}

fn init_logging() {
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .try_init();
}

fn parse_cli_args(args: &[String]) -> Result<CliConfig, String> {
    let mut cfg = CliConfig::default();
    let mut index = 0usize;
    let value_of = |index: usize, flag: &str| {
        args.get(index + 1)
            .ok_or_else(|| format!("missing value for {flag}"))
    };

    while index < args.len() {
        match args[index].as_str() {
            "-h" | "--help" => {
                cfg.help = true;
                index += 1;
            }
            "--module" => {
                let raw = value_of(index, "--module")?;
                let kind = ModuleKind::parse(raw)
                    .ok_or_else(|| format!("unknown module kind '{raw}'"))?;
                cfg.module = Some(kind);
                index += 2;
            }
            "--frames" => {
                let raw = value_of(index, "--frames")?;
                cfg.frames = raw
                    .parse::<u32>()
                    .map_err(|_| format!("invalid --frames value '{raw}'"))?;
                index += 2;
            }
            "--call" => {
                let raw = value_of(index, "--call")?;
                cfg.call_args = Some(parse_call_args(raw)?);
                index += 2;
            }
            "--interpret" => {
                cfg.interpret = true;
                index += 1;
            }
            "--budget" => {
                let raw = value_of(index, "--budget")?;
                let budget =
                    parse_number(raw).ok_or_else(|| format!("invalid --budget value '{raw}'"))?;
                cfg.budget = Some(budget);
                index += 2;
            }
            "--stack-size" => {
                let raw = value_of(index, "--stack-size")?;
                let size = parse_number(raw)
                    .and_then(|size| u32::try_from(size).ok())
                    .ok_or_else(|| format!("invalid --stack-size value '{raw}'"))?;
                cfg.stack_size = Some(size);
                index += 2;
            }
            "--disasm" => {
                cfg.disasm = true;
                index += 1;
            }
            "--assemble" => {
                cfg.assemble_source = Some(value_of(index, "--assemble")?.clone());
                index += 2;
            }
            "-o" | "--output" => {
                cfg.output = Some(value_of(index, "-o")?.clone());
                index += 2;
            }
            "--repl" => {
                cfg.repl = true;
                index += 1;
            }
            value if value.starts_with('-') => {
                return Err(format!("unknown flag '{value}'"));
            }
            path => {
                if cfg.image.is_some() {
                    return Err("multiple image paths provided".to_string());
                }
                cfg.image = Some(path.to_string());
                index += 1;
            }
        }
    }

    if cfg.help {
        return Ok(cfg);
    }
    if cfg.assemble_source.is_some() {
        if cfg.output.is_none() {
            return Err("--assemble requires -o <output>".to_string());
        }
        if cfg.image.is_some() || cfg.disasm || cfg.repl || cfg.call_args.is_some() {
            return Err("assemble mode cannot be combined with run flags".to_string());
        }
        return Ok(cfg);
    }
    if cfg.output.is_some() {
        return Err("-o requires --assemble".to_string());
    }
    if cfg.image.is_none() {
        return Err("missing image path".to_string());
    }
    if cfg.disasm && (cfg.repl || cfg.call_args.is_some() || cfg.module.is_some()) {
        return Err("disasm mode cannot be combined with run flags".to_string());
    }
    if cfg.repl && cfg.call_args.is_some() {
        return Err("repl mode does not accept --call".to_string());
    }
    Ok(cfg)
}

/// `a,b,c` with decimal or `0x` hex words.
fn parse_call_args(raw: &str) -> Result<Vec<i32>, String> {
    raw.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| parse_word(part).ok_or_else(|| format!("invalid call argument '{part}'")))
        .collect()
}

fn parse_word(raw: &str) -> Option<i32> {
    if let Some(rest) = raw.strip_prefix('-') {
        return parse_number(rest)
            .and_then(|value| i64::try_from(value).ok())
            .and_then(|value| i32::try_from(-value).ok());
    }
    parse_number(raw)
        .and_then(|value| u32::try_from(value).ok())
        .map(|value| value as i32)
}

fn build_config(cli: &CliConfig) -> Result<VmConfig, Box<dyn std::error::Error>> {
    let mut config = VmConfig::from_env()?;
    if cli.interpret {
        config.mode = ExecutionMode::Interpreted;
    }
    if let Some(budget) = cli.budget {
        config.instruction_budget = Some(budget);
    }
    if let Some(stack_size) = cli.stack_size {
        config.stack_size = stack_size;
    }
    config.validate()?;
    Ok(config)
}

fn module_name(path: &str) -> String {
    std::path::Path::new(path)
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or("module")
        .to_string()
}

/// Console traps for `kind` plus the shared traps.
fn console_syscalls(kind: ModuleKind) -> SyscallTable {
    let mut table = SyscallTable::new();
    let start = Instant::now();
    table.register(kind.print_trap(), "print", |ctx, args| {
        let text = ctx.read_string(args.addr(0))?;
        print!("{text}");
        let _ = io::stdout().flush();
        Ok(0)
    });
    table.register(kind.error_trap(), "error", |ctx, args| {
        let text = ctx.read_string(args.addr(0))?;
        Err(RuntimeFault::host(text.trim_end().to_string()))
    });
    table.register(kind.milliseconds_trap(), "milliseconds", move |_, _| {
        Ok(start.elapsed().as_millis() as i32)
    });
    install_shared_traps(&mut table);
    table
}

fn run_module(
    registry: &mut VmRegistry,
    handle: VmHandle,
    kind: ModuleKind,
    frames: u32,
) -> Result<(), RuntimeFault> {
    let version = registry.call(handle, &[kind.init_command(), 0, 0, 0])?;
    info!("{} module initialized ({version})", kind.name());
    for frame in 1..=frames {
        let level_time = FRAME_MSEC.wrapping_mul(frame as i32);
        registry.call(handle, &[kind.frame_command(), level_time])?;
    }
    registry.call(handle, &[kind.shutdown_command(), 0])?;
    info!("{} module shut down after {frames} frames", kind.name());
    Ok(())
}

fn report_fault(registry: &VmRegistry, handle: VmHandle, fault: &RuntimeFault) -> String {
    match registry.instance(handle) {
        Some(instance) => render_fault(instance.image(), fault),
        None => format!("runtime error: {fault}"),
    }
}

fn print_usage() {
    println!("Usage:");
    println!("  qvm-run <image.qvm>                         (calls the entry point with 0)");
    println!("  qvm-run <image.qvm> --call <a,b,c>");
    println!("  qvm-run <image.qvm> --module <game|cgame|ui> [--frames <n>]");
    println!("  qvm-run <image.qvm> [--interpret] [--budget <n>] [--stack-size <bytes>]");
    println!("  qvm-run <image.qvm> --disasm");
    println!("  qvm-run <image.qvm> --repl");
    println!("  qvm-run --assemble <source.asm> -o <image.qvm>");
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ReplCommand {
    Call(Vec<i32>),
    Memory { addr: u32, len: usize },
    Disasm { start: u32, count: u32 },
    Stats,
    Help,
    Quit,
}

const DEFAULT_DUMP_LEN: usize = 64;
const DEFAULT_DISASM_COUNT: u32 = 16;

fn parse_repl_line(line: &str) -> Result<ReplCommand, String> {
    let mut parts = line.split_whitespace();
    let command = parts.next().unwrap_or("");
    let rest: Vec<&str> = parts.collect();
    let number = |raw: &str| {
        parse_number(raw).ok_or_else(|| format!("invalid number '{raw}'"))
    };
    match command {
        "call" => {
            let args = rest
                .iter()
                .map(|raw| parse_word(raw).ok_or_else(|| format!("invalid argument '{raw}'")))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(ReplCommand::Call(args))
        }
        "mem" => {
            let addr = rest.first().copied().ok_or("mem needs an address")?;
            let addr = u32::try_from(number(addr)?).map_err(|_| "address out of range")?;
            let len = match rest.get(1).copied() {
                Some(raw) => number(raw)? as usize,
                None => DEFAULT_DUMP_LEN,
            };
            Ok(ReplCommand::Memory { addr, len })
        }
        "disasm" => {
            let start = match rest.first().copied() {
                Some(raw) => number(raw)? as u32,
                None => 0,
            };
            let count = match rest.get(1).copied() {
                Some(raw) => number(raw)? as u32,
                None => DEFAULT_DISASM_COUNT,
            };
            Ok(ReplCommand::Disasm { start, count })
        }
        "stats" => Ok(ReplCommand::Stats),
        "help" => Ok(ReplCommand::Help),
        "quit" | "exit" => Ok(ReplCommand::Quit),
        other => Err(format!("unknown command '{other}' (try 'help')")),
    }
}

fn run_repl(registry: &mut VmRegistry, handle: VmHandle) -> Result<(), Box<dyn std::error::Error>> {
    println!("qvm REPL ({handle}), commands: call, mem, disasm, stats, help, quit");
    let mut editor = DefaultEditor::new()?;
    loop {
        match editor.readline("qvm> ") {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let _ = editor.add_history_entry(line);
                let command = match parse_repl_line(line) {
                    Ok(command) => command,
                    Err(err) => {
                        println!("{err}");
                        continue;
                    }
                };
                if command == ReplCommand::Quit {
                    break;
                }
                execute_repl_command(registry, handle, command);
            }
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
            Err(err) => return Err(Box::new(io::Error::other(err.to_string()))),
        }
    }
    println!("bye");
    Ok(())
}

fn execute_repl_command(registry: &mut VmRegistry, handle: VmHandle, command: ReplCommand) {
    match command {
        ReplCommand::Call(args) => match registry.call(handle, &args) {
            Ok(value) => println!("=> {value} ({value:#x})"),
            Err(fault) => println!("{}", report_fault(registry, handle, &fault)),
        },
        ReplCommand::Memory { addr, len } => {
            let Some(instance) = registry.instance(handle) else {
                println!("instance unavailable");
                return;
            };
            match format_memory(instance.memory(), addr, len) {
                Ok(dump) => print!("{dump}"),
                Err(kind) => println!("{kind}"),
            }
        }
        ReplCommand::Disasm { start, count } => {
            let Some(instance) = registry.instance(handle) else {
                println!("instance unavailable");
                return;
            };
            let image = instance.image();
            for pc in start..start.saturating_add(count) {
                match format_instruction(image, pc) {
                    Some(line) => println!("{line}"),
                    None => break,
                }
            }
        }
        ReplCommand::Stats => {
            let Some(instance) = registry.instance(handle) else {
                println!("instance unavailable");
                return;
            };
            println!("name:          {}", instance.name());
            println!("instructions:  {}", instance.image().instruction_count());
            println!("sandbox bytes: {}", instance.memory().size());
            println!(
                "mode:          {}",
                if instance.is_compiled() { "compiled" } else { "interpreted" }
            );
            if let Some(code) = instance.compiled_code() {
                println!("native bytes:  {} ({})", code.code().len(), code.arch().name());
            }
            println!("calls:         {}", instance.call_count());
            println!("breaks:        {}", instance.break_count());
        }
        ReplCommand::Help => {
            println!("commands:");
            println!("  call [args...]        call the entry point");
            println!("  mem <addr> [len]      dump sandbox memory");
            println!("  disasm [start] [n]    list instructions");
            println!("  stats                 instance counters");
            println!("  quit                  leave the repl");
        }
        ReplCommand::Quit => {}
    }
}

fn format_memory(memory: &SandboxMemory, addr: u32, len: usize) -> Result<String, FaultKind> {
    let bytes = memory.slice(addr, len)?;
    let mut out = String::new();
    for (row, chunk) in bytes.chunks(16).enumerate() {
        let hex: Vec<String> = chunk.iter().map(|byte| format!("{byte:02x}")).collect();
        let text: String = chunk
            .iter()
            .map(|byte| {
                if byte.is_ascii_graphic() || *byte == b' ' {
                    *byte as char
                } else {
                    '.'
                }
            })
            .collect();
        out.push_str(&format!(
            "{:08x}  {:<47}  {text}\n",
            addr as usize + row * 16,
            hex.join(" ")
        ));
    }
    Ok(out)
}
