use std::{env::args, path::Path};

use anyhow::{Context as _, anyhow};
use serde_json::Value;
use tether::{
    Context, PythonHostConfig, Supervisor, SupervisorConfig, ToolCallEvent, ToolRegistry,
};
use tether_python::checks;
use tracing::{Level, info};

fn init_tracing() -> anyhow::Result<()> {
    let envfilter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env()?;
    tracing_subscriber::fmt()
        .with_env_filter(envfilter)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing()?;

    let mut args = args().skip(1);
    let task = args.next();
    match task.as_deref() {
        Some("run") => {
            let file = args.next().ok_or_else(|| anyhow!("usage: tether run <file> [context.json]"))?;
            let context = args.next().map(|path| read_context(Path::new(&path))).transpose()?;
            run(Path::new(&file), context).await
        }
        Some("check") => {
            let file = args.next().ok_or_else(|| anyhow!("usage: tether check <file>"))?;
            check(Path::new(&file))
        }
        None | Some("help") => {
            print_help();
            Ok(())
        }
        Some(other) => Err(anyhow!("unknown task: {other}")),
    }
}

fn print_help() {
    println!("Tasks:");
    println!("  - run <file> [context.json]   run a program and print its result");
    println!("  - check <file>                report disallowed calls without running");
}

fn read_source(path: &Path) -> anyhow::Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
}

fn read_context(path: &Path) -> anyhow::Result<Context> {
    let raw = read_source(path)?;
    serde_json::from_str(&raw).with_context(|| format!("{} is not a JSON object", path.display()))
}

fn tools() -> anyhow::Result<ToolRegistry> {
    let mut tools = ToolRegistry::new();
    tools.register_fn("echo", |args: Value| async move { Ok(args) })?;
    Ok(tools)
}

async fn run(path: &Path, context: Option<Context>) -> anyhow::Result<()> {
    let code = read_source(path)?;
    let supervisor = Supervisor::python(PythonHostConfig::from_env())
        .config(SupervisorConfig::from_env())
        .tools(tools()?)
        .observer(|event: &ToolCallEvent| {
            info!(
                tool = %event.name,
                ok = event.ok,
                duration_ms = event.duration_ms,
                args_byte_size = event.args_byte_size,
                "tool call"
            );
        })
        .build();

    let output = supervisor.run(&code, context).await;
    supervisor.shutdown();
    let output = output?;

    println!("{}", serde_json::to_string_pretty(&output)?);
    if output.ok {
        Ok(())
    } else {
        std::process::exit(1)
    }
}

fn check(path: &Path) -> anyhow::Result<()> {
    let code = read_source(path)?;
    match checks::scan(&code) {
        Ok(()) => {
            println!("{}: ok", path.display());
            Ok(())
        }
        Err(violation) => Err(anyhow!("{}: {}", path.display(), violation.message())),
    }
}
