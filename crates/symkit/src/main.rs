use std::error::Error;
use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand, ValueEnum};
use symkit_core::image::SectionProvider;
use symkit_core::types::{TypePayload, VarKind};
use symkit_core::dwarf::DwarfSections;
use symkit_core::unwind::{cfi, CfiUnwinder, RuntimeFunction, UnwindInfo};
use symkit_core::{BackendKind, LoadOptions, ModuleId, ObjectImage, SectionMap, SymbolSession, UnwindLimits};
use symkit_utils::{info, init_logging_with_level, LogFormat, LogLevel};

type CliResult<T> = Result<T, Box<dyn Error>>;

/// Inspect procedures, lines, types and unwind tables of a binary image.
#[derive(Parser, Debug)]
#[command(name = "symkit")]
#[command(version)]
#[command(about = "Inspect procedures, lines, types and unwind tables of a binary image", long_about = None)]
struct Cli
{
    /// ELF, Mach-O or PE file to read
    file: PathBuf,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "warn")]
    log_level: LogLevel,

    /// Log format (pretty or json)
    #[arg(long, global = true, default_value = "pretty")]
    log_format: LogFormat,

    /// Added to every address the image stores (hex with 0x, or decimal)
    #[arg(long, global = true, default_value = "0", value_parser = parse_address)]
    load_bias: u64,

    /// Use this debug-info format instead of trying each in turn
    #[arg(long, global = true)]
    backend: Option<Backend>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Backend
{
    Pdb,
    Dwarf,
    Symtab,
}

impl From<Backend> for BackendKind
{
    fn from(backend: Backend) -> Self
    {
        match backend {
            Backend::Pdb => BackendKind::Pdb,
            Backend::Dwarf => BackendKind::Dwarf,
            Backend::Symtab => BackendKind::ElfSymtab,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands
{
    /// List compilation units
    Modules,
    /// List procedures and their address ranges
    Procs
    {
        /// Only this module
        #[arg(short, long)]
        module: Option<u32>,
    },
    /// Dump line tables
    Lines
    {
        /// Only this module
        #[arg(short, long)]
        module: Option<u32>,
    },
    /// List global variables
    Globals
    {
        /// Only this module
        #[arg(short, long)]
        module: Option<u32>,
    },
    /// Resolve an address to its procedure, source line and locals
    Lookup
    {
        #[arg(value_parser = parse_address)]
        address: u64,
    },
    /// List named types with their members
    Types
    {
        /// Only this module
        #[arg(short, long)]
        module: Option<u32>,
    },
    /// Print the CFI row in effect at an address
    Cfi
    {
        #[arg(value_parser = parse_address)]
        address: u64,
    },
    /// Print the Windows x64 unwind record covering an address
    Pdata
    {
        #[arg(value_parser = parse_address)]
        address: u64,
    },
}

fn parse_address(text: &str) -> Result<u64, String>
{
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => text.parse(),
    };
    parsed.map_err(|err| format!("invalid address '{text}': {err}"))
}

fn main()
{
    let cli = Cli::parse();

    let _guard = match init_logging_with_level(cli.log_level, cli.log_format) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e}");
            process::exit(1);
        }
    };

    if let Err(e) = run(&cli) {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn run(cli: &Cli) -> CliResult<()>
{
    info!(file = %cli.file.display(), "reading image");
    let data = std::fs::read(&cli.file)?;
    let image = ObjectImage::parse(&data)?;
    info!(arch = ?image.arch(), symbols = image.symbol_count(), "parsed image");
    let map = image.section_map();

    match &cli.command {
        Commands::Cfi { address } => return print_cfi(&map, address.wrapping_sub(cli.load_bias)),
        Commands::Pdata { address } => return print_pdata(&map, address.wrapping_sub(cli.load_bias)),
        _ => {}
    }

    let options = LoadOptions {
        prefer: cli.backend.map(Into::into),
        ..LoadOptions::default()
    };
    let mut session = SymbolSession::init(cli.load_bias);
    session.load_debug_info(&[&map], options)?;
    info!(backend = %session.backend_kind(), arch = %session.arch(), "debug info loaded");

    match &cli.command {
        Commands::Modules => print_modules(&session),
        Commands::Procs { module } => print_procs(&session, *module),
        Commands::Lines { module } => print_lines(&session, *module),
        Commands::Globals { module } => print_globals(&session, *module),
        Commands::Lookup { address } => print_lookup(&session, *address),
        Commands::Types { module } => print_types(&session, *module),
        Commands::Cfi { .. } | Commands::Pdata { .. } => Ok(()),
    }
}

/// `only`, or every module of the session.
fn selected(session: &SymbolSession<'_>, only: Option<u32>) -> Vec<ModuleId>
{
    match only {
        Some(id) => vec![ModuleId(id)],
        None => session.modules().map(|module| module.id).collect(),
    }
}

fn print_modules(session: &SymbolSession<'_>) -> CliResult<()>
{
    println!("Backend: {} ({})", session.backend_kind(), session.arch());
    for module in session.modules() {
        print!("{:>4}  {}", module.id, module.name);
        if let Some(dir) = &module.comp_dir {
            print!("  [{dir}]");
        }
        if let Some(producer) = &module.producer {
            print!("  {producer}");
        }
        println!();
    }
    Ok(())
}

fn print_procs(session: &SymbolSession<'_>, only: Option<u32>) -> CliResult<()>
{
    for module in selected(session, only) {
        for proc in session.procs(module)? {
            println!("{}  {:>4}  {}", proc.range, module, proc.name);
        }
    }
    Ok(())
}

fn print_lines(session: &SymbolSession<'_>, only: Option<u32>) -> CliResult<()>
{
    for module in selected(session, only) {
        for row in session.lines(module)? {
            if row.end_sequence {
                println!("0x{:016x}  end of sequence", row.address);
                continue;
            }
            let file = session.file_name(module, row.file)?.unwrap_or("?");
            println!("0x{:016x}  {file}:{}:{}", row.address, row.line, row.column);
        }
    }
    Ok(())
}

fn print_globals(session: &SymbolSession<'_>, only: Option<u32>) -> CliResult<()>
{
    for module in selected(session, only) {
        for var in session.globals(module)? {
            println!("{:>4}  {:<32}  {:?}", module, var.name, var.location);
        }
    }
    Ok(())
}

fn print_lookup(session: &SymbolSession<'_>, address: u64) -> CliResult<()>
{
    match session.proc_at(address)? {
        Some(proc) => {
            println!("0x{address:x}: {} + 0x{:x}", proc.name, address - proc.range.lo);
            for var in session.locals(&proc)? {
                let kind = match var.kind {
                    VarKind::Parameter => "param",
                    VarKind::Local => "local",
                    VarKind::Global => "global",
                };
                println!("  {kind:<6} {:<24} {:?}", var.name, var.location);
            }
        }
        None => println!("0x{address:x}: no procedure"),
    }
    if let Some((module, hit)) = session.line_at(address)? {
        let file = session.file_name(module, hit.file)?.unwrap_or("?");
        println!("  {file}:{}:{} (row 0x{:x}, {} bytes)", hit.line, hit.column, hit.address, hit.span);
    }
    Ok(())
}

fn print_types(session: &SymbolSession<'_>, only: Option<u32>) -> CliResult<()>
{
    for module in selected(session, only) {
        for reference in session.types(module)? {
            let graph = match session.resolve_type(reference) {
                Ok(graph) => graph,
                Err(err) => {
                    println!("0x{:x}: {err}", reference.0);
                    continue;
                }
            };
            let Some(root) = graph.root_node() else {
                continue;
            };
            let name = root.ty.name.as_deref().unwrap_or("<anonymous>");
            println!("0x{:x}: {:?} {name} ({} bytes)", reference.0, root.ty.kind, root.ty.size);
            for member in &root.members {
                let ty = member
                    .ty
                    .and_then(|id| graph.node(id))
                    .map_or_else(|| "?".to_string(), |node| describe(&node.ty));
                println!(
                    "    {:<24} {ty:<24} {:?}",
                    member.member.name.as_deref().unwrap_or("<unnamed>"),
                    member.member.kind
                );
            }
        }
    }
    Ok(())
}

fn describe(ty: &symkit_core::Type) -> String
{
    let name = ty.name.clone().unwrap_or_else(|| format!("{:?}", ty.kind));
    match ty.payload {
        TypePayload::Array { count } => format!("{name}[{count}]"),
        _ if ty.modifiers.is_empty() => name,
        _ => format!("{} {name}", ty.modifiers),
    }
}

fn print_cfi(map: &SectionMap<'_>, address: u64) -> CliResult<()>
{
    let arch = map.arch().unwrap_or(symkit_core::Arch::X86_64);
    let section = DwarfSections::load(map)
        .cfi_section(arch.pointer_size())
        .ok_or("image has neither .eh_frame nor .debug_frame")?;

    let unwinder = CfiUnwinder::new(section);
    info!(fdes = unwinder.index().len(), "indexed call frame information");
    let Some(fde) = unwinder.find(address)? else {
        return Err(format!("no FDE covers 0x{address:x}").into());
    };
    let row = cfi::unwind_row(unwinder.section(), &fde, address, &UnwindLimits::default())?;
    println!("FDE [0x{:x}, 0x{:x}) at offset 0x{:x}", fde.start, fde.end, fde.offset);
    println!("  row [0x{:x}, 0x{:x})", row.start, row.end);
    println!("  cfa = {}", row.cfa);
    println!("  ra  = {}", fde.cie.return_register);
    for (reg, rule) in row.rules() {
        println!("  {reg:<4} {rule:?}");
    }
    Ok(())
}

fn print_pdata(map: &SectionMap<'_>, address: u64) -> CliResult<()>
{
    let pdata = map.section(".pdata").ok_or("image has no .pdata section")?;
    let base = map.load_base();
    let rva = u32::try_from(address.wrapping_sub(base)).map_err(|_| format!("0x{address:x} is outside the image"))?;
    let Some(mut function) = RuntimeFunction::lookup(pdata.data, rva)? else {
        println!("0x{address:x}: no RUNTIME_FUNCTION, leaf frame");
        return Ok(());
    };

    loop {
        println!("{function}");
        let info_address = base + u64::from(function.unwind_info & !1);
        let bytes = bytes_at(map, info_address).ok_or_else(|| format!("UNWIND_INFO at 0x{info_address:x} is not mapped"))?;
        let info = UnwindInfo::parse(bytes)?;
        println!(
            "  version {} flags 0x{:x} prologue {} bytes, frame {:?}+{}",
            info.version,
            info.flags,
            info.prolog_size,
            info.frame_register,
            u32::from(info.frame_offset) * 16
        );
        for code in &info.codes {
            println!("  @{:<3} {:?}", code.prolog_offset, code.op);
        }
        match info.chained {
            Some(parent) => {
                println!("  chained to:");
                function = parent;
            }
            None => return Ok(()),
        }
    }
}

/// Bytes from `address` to the end of the section holding it.
fn bytes_at<'data>(map: &SectionMap<'data>, address: u64) -> Option<&'data [u8]>
{
    map.iter().find_map(|section| {
        let offset = usize::try_from(address.checked_sub(section.address)?).ok()?;
        section.data.get(offset..).filter(|rest| !rest.is_empty())
    })
}
