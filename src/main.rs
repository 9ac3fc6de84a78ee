use clap::{Parser, Subcommand, ValueEnum};
use cmake_driver::config::{CMakeToolsConfig, SettingValue};
use cmake_driver::driver::{Kit, Linkage, VariantOptions, load_kits};
use cmake_driver::logging::{LogConfig, init_logging};
use cmake_driver::{CMakeTools, ToolsError};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};

/// Configure, build and test CMake projects
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Source directory (defaults to current directory)
    #[arg(long, value_name = "DIR")]
    source: Option<PathBuf>,

    /// Settings file (defaults to .cmake-tools.json in the source directory)
    #[arg(long, value_name = "FILE")]
    settings: Option<PathBuf>,

    /// JSON file with kit definitions
    #[arg(long, value_name = "FILE")]
    kits: Option<PathBuf>,

    /// Kit to use from --kits
    #[arg(long, value_name = "NAME", requires = "kits")]
    kit: Option<String>,

    #[arg(long, value_name = "TYPE", default_value = "Debug")]
    build_type: String,

    #[arg(long, value_enum)]
    linkage: Option<LinkageArg>,

    /// Extra cache entry, KEY=VALUE
    #[arg(short = 'D', value_name = "KEY=VALUE", value_parser = parse_define)]
    define: Vec<(String, String)>,

    /// Always run cmake directly instead of through CMake Server
    #[arg(long)]
    no_server: bool,

    /// Log level (overrides RUST_LOG env var)
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Log file path (overrides CMT_LOG_FILE env var)
    #[arg(long, value_name = "FILE")]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Configure the build directory
    Configure {
        /// Remove the cache first
        #[arg(long)]
        clean: bool,
        /// Extra arguments passed to cmake
        #[arg(last = true)]
        extra: Vec<String>,
    },
    /// Build a target (default: all)
    Build { target: Option<String> },
    Install,
    /// Run ctest
    Test,
    Clean,
    /// Print the cache entries
    Cache,
    /// List targets of the current build type
    Targets,
    /// Print the debugger launch description of an executable target
    Debug { target: Option<String> },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum LinkageArg {
    Static,
    Shared,
}

impl From<LinkageArg> for Linkage {
    fn from(arg: LinkageArg) -> Self {
        match arg {
            LinkageArg::Static => Linkage::Static,
            LinkageArg::Shared => Linkage::Shared,
        }
    }
}

fn parse_define(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got '{raw}'"))
}

fn load_config(args: &Args, source_dir: &std::path::Path) -> Result<CMakeToolsConfig, String> {
    let mut config = match &args.settings {
        Some(path) => CMakeToolsConfig::load(path),
        None => CMakeToolsConfig::load_or_default(source_dir),
    }
    .map_err(|e| e.to_string())?;

    for (key, value) in &args.define {
        config
            .configure_settings
            .insert(key.clone(), SettingValue::String(value.clone()));
    }
    if args.no_server {
        config.use_cmake_server = false;
    }
    Ok(config)
}

fn select_kit(args: &Args) -> Result<Kit, String> {
    let Some(path) = &args.kits else {
        return Ok(Kit::unspecified());
    };
    let kits = load_kits(path).map_err(|e| e.to_string())?;
    match &args.kit {
        Some(name) => kits
            .into_iter()
            .find(|k| &k.name == name)
            .ok_or_else(|| format!("No kit named '{name}' in {}", path.display())),
        None => kits
            .into_iter()
            .next()
            .ok_or_else(|| format!("{} defines no kits", path.display())),
    }
}

async fn run(tools: &CMakeTools, command: Command) -> Result<i32, ToolsError> {
    match command {
        Command::Configure { clean: true, .. } => tools.clean_configure().await,
        Command::Configure { extra, .. } => tools.configure(&extra).await,
        Command::Build { target } => tools.build(target.as_deref()).await,
        Command::Install => tools.install().await,
        Command::Test => tools.ctest().await,
        Command::Clean => tools.clean().await,
        Command::Cache => {
            let cache = tools.cache().await?;
            for entry in cache.sorted_entries() {
                println!("{}", entry.to_cache_line());
            }
            Ok(0)
        }
        Command::Targets => {
            if tools.driver().await?.code_model().is_none() {
                tools.configure(&[]).await?;
            }
            for target in tools.driver().await?.targets() {
                println!("{target}");
            }
            Ok(0)
        }
        Command::Debug { target } => {
            let launch = tools.debug_target(target.as_deref()).await?;
            println!("name: {}", launch.name);
            println!("program: {}", launch.program.display());
            println!("cwd: {}", launch.cwd.display());
            println!("MIMode: {}", launch.mi_mode.as_str());
            if let Some(debugger) = &launch.debugger_path {
                println!("miDebuggerPath: {}", debugger.display());
            }
            Ok(0)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let log_config =
        LogConfig::from_env().with_overrides(args.log_level.clone(), args.log_file.clone());
    if let Err(e) = init_logging(log_config) {
        eprintln!("Failed to initialize logging: {e}");
        return ExitCode::FAILURE;
    }

    let source_dir = match args.source.clone().map(Ok).unwrap_or_else(std::env::current_dir) {
        Ok(dir) => dir,
        Err(e) => {
            eprintln!("Failed to get current directory: {e}");
            return ExitCode::FAILURE;
        }
    };

    let (config, kit) = match (load_config(&args, &source_dir), select_kit(&args)) {
        (Ok(config), Ok(kit)) => (config, kit),
        (Err(e), _) | (_, Err(e)) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let mut variant = VariantOptions::for_build_type(&args.build_type);
    variant.linkage = args.linkage.map(Linkage::from);

    info!(
        "Using source directory {} with kit {}",
        source_dir.display(),
        kit.name
    );
    let tools = CMakeTools::new(source_dir, config)
        .with_kit(kit)
        .with_variant(variant);

    let result = run(&tools, args.command).await;
    tools.dispose().await;

    match result {
        Ok(0) => ExitCode::SUCCESS,
        Ok(code) => {
            error!("cmake exited with code {}", code);
            ExitCode::from(u8::try_from(code).unwrap_or(1))
        }
        Err(e) => {
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}
