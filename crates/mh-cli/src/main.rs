use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use log::info;
use mh_api::{create_builder, create_runner_pool, CreateHostOptions};
use mh_core::{HostValue, InvocationContext};
use mh_runtime::DirStore;
use walkdir::WalkDir;

#[derive(Debug, Parser)]
#[command(name = "methodhost")]
#[command(about = "Script method hosting CLI")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Compile the given scripts and invoke one method.
    Run(RunArgs),
    /// Compile the given scripts and list the exported method metadata.
    Methods(MethodsArgs),
}

#[derive(Debug, Args)]
struct SourceArgs {
    /// Script files, or directories scanned for `.rhai` files.
    #[arg(required = true)]
    paths: Vec<String>,
    /// Compatibility mode, `base` or `extended`.
    #[arg(long = "compat")]
    compat: Option<String>,
    /// Extra environment variables exposed to scripts as KEY=VALUE.
    #[arg(long = "env", value_name = "KEY=VALUE")]
    env: Vec<String>,
    /// Hide the process environment from scripts.
    #[arg(long = "no-system-env")]
    no_system_env: bool,
    /// Metadata field holding the method identifier.
    #[arg(long = "id-field")]
    id_field: Option<String>,
}

#[derive(Debug, Args)]
struct RunArgs {
    #[command(flatten)]
    source: SourceArgs,
    /// Method to invoke; defaults to the single script's default method.
    #[arg(long = "method")]
    method: Option<String>,
    /// Invocation argument as JSON.
    #[arg(long = "arg")]
    arg: Option<String>,
    #[arg(long = "timeout-ms")]
    timeout_ms: Option<u64>,
    /// Number of pooled environments to build.
    #[arg(long = "pool", default_value_t = 1)]
    pool: usize,
}

#[derive(Debug, Args)]
struct MethodsArgs {
    #[command(flatten)]
    source: SourceArgs,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    match Cli::parse().command {
        Command::Run(args) => run(args),
        Command::Methods(args) => methods(args),
    }
}

fn run(args: RunArgs) -> anyhow::Result<()> {
    let options = host_options(&args.source)?;
    let arg = match &args.arg {
        Some(raw) => serde_json::from_str::<HostValue>(raw).context("parsing --arg as JSON")?,
        None => HostValue::Null,
    };

    let (pool, _metas) = create_runner_pool(options, args.pool.max(1))?;
    let runner = pool.acquire();

    let ctx = match args.timeout_ms {
        Some(ms) => InvocationContext::with_timeout(Duration::from_millis(ms)),
        None => InvocationContext::background(),
    };

    let result = match &args.method {
        Some(name) => runner.run_method(&ctx, name, arg)?,
        None => runner.run_default(&ctx, arg)?,
    };

    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

fn methods(args: MethodsArgs) -> anyhow::Result<()> {
    let options = host_options(&args.source)?;
    let builder = create_builder(options)?;
    let runner = builder.build()?;
    println!("{}", serde_json::to_string_pretty(&runner.metas())?);
    Ok(())
}

fn host_options(args: &SourceArgs) -> anyhow::Result<CreateHostOptions> {
    let sources = collect_sources(&args.paths)?;
    info!("compiling {} script(s)", sources.len());

    let cwd = std::env::current_dir().context("resolving working directory")?;
    let mut options = CreateHostOptions {
        sources,
        store: Some(Arc::new(DirStore::new(cwd))),
        include_system_env_vars: !args.no_system_env,
        env: parse_env_pairs(&args.env)?,
        ..CreateHostOptions::default()
    };
    if let Some(compat) = &args.compat {
        options.compatibility_mode = Some(compat.clone());
    }
    if let Some(field) = &args.id_field {
        options.meta_identifier_field = Some(field.clone());
    }
    Ok(options)
}

fn collect_sources(paths: &[String]) -> anyhow::Result<BTreeMap<String, String>> {
    let mut sources = BTreeMap::new();

    for path in paths {
        let path = Path::new(path);
        if path.is_dir() {
            for entry in WalkDir::new(path)
                .follow_links(false)
                .into_iter()
                .filter_map(Result::ok)
            {
                if !entry.file_type().is_file() {
                    continue;
                }
                let file = entry.path();
                if file.extension().and_then(|ext| ext.to_str()) != Some("rhai") {
                    continue;
                }
                insert_source(&mut sources, file)?;
            }
        } else {
            insert_source(&mut sources, path)?;
        }
    }

    if sources.is_empty() {
        bail!("no script files found");
    }
    Ok(sources)
}

fn insert_source(sources: &mut BTreeMap<String, String>, path: &Path) -> anyhow::Result<()> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let key = path.to_string_lossy().replace('\\', "/");
    sources.insert(key, contents);
    Ok(())
}

fn parse_env_pairs(pairs: &[String]) -> anyhow::Result<BTreeMap<String, String>> {
    let mut env = BTreeMap::new();
    for pair in pairs {
        let Some((key, value)) = pair.split_once('=') else {
            bail!("invalid --env value {pair:?}, expected KEY=VALUE");
        };
        env.insert(key.to_string(), value.to_string());
    }
    Ok(env)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_root(tag: &str) -> std::path::PathBuf {
        let root = std::env::temp_dir().join(format!("mh-cli-test-{tag}-{}", std::process::id()));
        fs::create_dir_all(&root).expect("create temp root");
        root
    }

    #[test]
    fn env_pairs_split_on_the_first_equals_sign() {
        let env = parse_env_pairs(&["A=1".to_string(), "B=x=y".to_string()])
            .expect("pairs are well-formed");
        assert_eq!(env.get("A").map(String::as_str), Some("1"));
        assert_eq!(env.get("B").map(String::as_str), Some("x=y"));

        let error = parse_env_pairs(&["MALFORMED".to_string()]).expect_err("missing equals sign");
        assert!(error.to_string().contains("MALFORMED"));
    }

    #[test]
    fn directories_are_scanned_for_rhai_files_only() {
        let root = temp_root("scan");
        fs::write(root.join("a.rhai"), "exports.x = 1;").expect("write a");
        fs::write(root.join("b.rhai"), "exports.x = 2;").expect("write b");
        fs::write(root.join("notes.txt"), "ignored").expect("write notes");

        let sources =
            collect_sources(&[root.to_string_lossy().into_owned()]).expect("scan succeeds");
        assert_eq!(sources.len(), 2);
        assert!(sources.keys().all(|key| key.ends_with(".rhai")));

        fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn empty_scans_are_an_error() {
        let root = temp_root("empty");
        fs::write(root.join("readme.md"), "no scripts").expect("write readme");

        let error =
            collect_sources(&[root.to_string_lossy().into_owned()]).expect_err("nothing to run");
        assert!(error.to_string().contains("no script files"));

        fs::remove_dir_all(&root).ok();
    }
}
