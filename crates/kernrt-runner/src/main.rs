use std::ffi::c_void;
use std::path::PathBuf;
use std::process::ExitCode;
use std::ptr::NonNull;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use kernrt::compiler::hex_lower;
use kernrt::{
    metadata, BuildMode, ContextKind, Dims, Driver, EngineConfig, HostAllocation, LaunchRange,
    ObjectRuntime, Script, ScriptIdentity, ScriptSource,
};
use kernrt_contracts::{
    ENV_LOG, KERNRT_INFO_REPORT_SCHEMA_VERSION, KERNRT_RUNNER_REPORT_SCHEMA_VERSION,
};
use serde_json::json;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "kernrt-runner")]
#[command(about = "Load compiled kernel modules and run their entry points.", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Parse a self-description text file.
    ParseInfo { file: PathBuf },
    /// Load a script and print its export table.
    Inspect(ScriptArgs),
    /// Create a script and call an exported function.
    Invoke {
        #[command(flatten)]
        script: ScriptArgs,
        #[arg(long)]
        slot: usize,
        /// Parameter block as hex.
        #[arg(long, default_value = "")]
        params_hex: String,
    },
    /// Create a script and call its root.
    Root(ScriptArgs),
    /// Create a script and run a ForEach kernel into a zeroed output.
    Foreach {
        #[command(flatten)]
        script: ScriptArgs,
        #[arg(long)]
        slot: usize,
        #[arg(long)]
        dim_x: u32,
        #[arg(long, default_value_t = 0)]
        dim_y: u32,
        #[arg(long, default_value_t = 4)]
        elem_size: usize,
        #[arg(long, default_value_t = 0)]
        x_start: u32,
        #[arg(long, default_value_t = 0)]
        x_end: u32,
        #[arg(long, default_value_t = 0)]
        y_start: u32,
        #[arg(long, default_value_t = 0)]
        y_end: u32,
        /// User data as hex.
        #[arg(long)]
        usr_hex: Option<String>,
    },
}

#[derive(Args)]
struct ScriptArgs {
    #[arg(long)]
    cache_dir: PathBuf,

    #[arg(long)]
    res_name: String,

    #[arg(long, value_enum, default_value_t = BuildMode::Prebuilt)]
    mode: BuildMode,

    /// Source module for compile mode.
    #[arg(long)]
    source: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = ContextKind::Normal)]
    context: ContextKind,
}

/// The runner hands out no objects, so there is nothing to count.
struct NoObjects;

impl ObjectRuntime for NoObjects {
    fn inc_ref(&self, obj: NonNull<c_void>) {
        tracing::trace!(?obj, "inc_ref");
    }

    fn dec_ref(&self, obj: NonNull<c_void>) {
        tracing::trace!(?obj, "dec_ref");
    }
}

fn main() -> ExitCode {
    match try_main() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            ExitCode::from(2)
        }
    }
}

fn try_main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_logging();

    let report = match cli.command {
        Command::ParseInfo { file } => {
            let text =
                std::fs::read(&file).with_context(|| format!("read info: {}", file.display()))?;
            let meta = metadata::parse(&text)
                .with_context(|| format!("parse info: {}", file.display()))?;
            json!({
                "schema_version": KERNRT_INFO_REPORT_SCHEMA_VERSION,
                "command": "parse-info",
                "metadata": meta,
            })
        }
        Command::Inspect(args) => {
            let driver = build_driver(&args)?;
            let source = read_source(&args)?;
            // SAFETY: the caller names a compiled kernel module.
            let script =
                unsafe { Script::load(&driver, identity(&args), script_source(&args, &source)) }?;
            let symbols = script.symbols();
            json!({
                "schema_version": KERNRT_RUNNER_REPORT_SCHEMA_VERSION,
                "command": "inspect",
                "identity": script.identity(),
                "module": script.module().path(),
                "info": script.info(),
                "metadata": script.metadata(),
                "symbols": {
                    "root": symbols.has_root(),
                    "root_expand": symbols.has_root_expand(),
                    "init": symbols.has_init(),
                    "dtor": symbols.has_dtor(),
                    "variables": symbols.variables().iter().map(|v| json!({
                        "name": v.name,
                        "resolved": v.addr.is_some(),
                        "object": v.is_object,
                    })).collect::<Vec<_>>(),
                    "foreach": symbols.foreach().iter().map(|f| json!({
                        "name": f.name,
                        "signature": f.signature,
                        "resolved": f.kernel.is_some(),
                    })).collect::<Vec<_>>(),
                },
            })
        }
        Command::Invoke {
            script: args,
            slot,
            params_hex,
        } => {
            let params = parse_hex(&params_hex).context("--params-hex")?;
            let driver = build_driver(&args)?;
            let script = create(&driver, &args)?;
            script.invoke_routine(slot, &params)?;
            json!({
                "schema_version": KERNRT_RUNNER_REPORT_SCHEMA_VERSION,
                "command": "invoke",
                "identity": script.identity(),
                "slot": slot,
                "params_len": params.len(),
            })
        }
        Command::Root(args) => {
            let driver = build_driver(&args)?;
            let script = create(&driver, &args)?;
            let ret = script.invoke_root()?;
            json!({
                "schema_version": KERNRT_RUNNER_REPORT_SCHEMA_VERSION,
                "command": "root",
                "identity": script.identity(),
                "has_root": ret.is_some(),
                "return": ret,
            })
        }
        Command::Foreach {
            script: args,
            slot,
            dim_x,
            dim_y,
            elem_size,
            x_start,
            x_end,
            y_start,
            y_end,
            usr_hex,
        } => {
            let usr = usr_hex
                .as_deref()
                .map(parse_hex)
                .transpose()
                .context("--usr-hex")?;
            let driver = build_driver(&args)?;
            let script = create(&driver, &args)?;
            let output = HostAllocation::new(Dims::new(dim_x, dim_y, 0), elem_size);
            let range = LaunchRange {
                x_start,
                x_end,
                y_start,
                y_end,
                ..LaunchRange::default()
            };
            let outcome = script.invoke_for_each(
                slot,
                None,
                Some(&output),
                usr.as_deref(),
                Some(&range),
            )?;
            json!({
                "schema_version": KERNRT_RUNNER_REPORT_SCHEMA_VERSION,
                "command": "foreach",
                "identity": script.identity(),
                "slot": slot,
                "range": range,
                "outcome": outcome,
                "output_hex": hex_lower(&output.to_vec()),
            })
        }
    };

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(ExitCode::SUCCESS)
}

fn init_logging() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_env(ENV_LOG).unwrap_or_else(|_| "warn".into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn build_driver(args: &ScriptArgs) -> Result<Driver> {
    let config = EngineConfig::from_env()?;
    let mut builder = Driver::builder(Arc::new(NoObjects))
        .config(config)
        .context(args.context);
    if args.mode == BuildMode::Compile {
        builder = builder.external_compiler();
    }
    Ok(builder.build())
}

fn identity(args: &ScriptArgs) -> ScriptIdentity {
    ScriptIdentity::new(&args.cache_dir, &args.res_name)
}

fn read_source(args: &ScriptArgs) -> Result<Vec<u8>> {
    match (args.mode, &args.source) {
        (BuildMode::Prebuilt, _) => Ok(Vec::new()),
        (BuildMode::Compile, Some(path)) => {
            std::fs::read(path).with_context(|| format!("read source: {}", path.display()))
        }
        (BuildMode::Compile, None) => anyhow::bail!("--mode compile requires --source"),
    }
}

fn script_source<'a>(args: &ScriptArgs, source: &'a [u8]) -> ScriptSource<'a> {
    match args.mode {
        BuildMode::Compile => ScriptSource::Bitcode(source),
        BuildMode::Prebuilt => ScriptSource::Prebuilt,
    }
}

fn create(driver: &Driver, args: &ScriptArgs) -> Result<Script> {
    let source = read_source(args)?;
    // SAFETY: the caller names a compiled kernel module.
    let script =
        unsafe { Script::create(driver, identity(args), script_source(args, &source)) }
            .with_context(|| format!("create script {:?}", args.res_name))?;
    Ok(script)
}

fn parse_hex(s: &str) -> Result<Vec<u8>> {
    let s = s.trim();
    if s.len() % 2 != 0 {
        anyhow::bail!("odd number of hex digits");
    }
    s.as_bytes()
        .chunks(2)
        .enumerate()
        .map(|(i, pair)| {
            std::str::from_utf8(pair)
                .ok()
                .and_then(|digits| u8::from_str_radix(digits, 16).ok())
                .with_context(|| format!("invalid hex byte at offset {}", i * 2))
        })
        .collect()
}
