use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::process::{Command, Stdio};

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "Wallet port RPC task runner", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run tests
    Test {
        #[command(subcommand)]
        test_type: Option<TestType>,
    },

    /// Run clippy linter
    Clippy,

    /// Check formatting
    Fmt {
        /// Fix instead of check
        #[arg(long)]
        fix: bool,
    },

    /// Run the port latency measurement
    Latency,
}

#[derive(Subcommand)]
enum TestType {
    /// Run all Rust tests
    Unit,

    /// Run the latency measurement binary
    Latency,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Test { test_type } => test(test_type),
        Commands::Clippy => clippy(),
        Commands::Fmt { fix } => fmt(fix),
        Commands::Latency => latency(),
    }
}

fn test(test_type: Option<TestType>) -> Result<()> {
    match test_type {
        Some(TestType::Latency) => latency(),
        Some(TestType::Unit) | None => {
            println!("🧪 Running all tests...");
            run_cmd("cargo", &["test", "--workspace"])
        }
    }
}

fn clippy() -> Result<()> {
    println!("🔍 Running clippy on workspace (warnings as errors)...");
    run_cmd(
        "cargo",
        &[
            "clippy",
            "--workspace",
            "--all-targets",
            "--",
            "-D",
            "warnings",
        ],
    )
}

fn fmt(fix: bool) -> Result<()> {
    if fix {
        run_cmd("cargo", &["fmt", "--all"])
    } else {
        run_cmd("cargo", &["fmt", "--all", "--", "--check"])
    }
}

fn latency() -> Result<()> {
    println!("🧪 Running port latency test...");
    run_cmd("cargo", &["run", "--release", "--bin", "port_latency_test"])
}

fn run_cmd(program: &str, args: &[&str]) -> Result<()> {
    let status = Command::new(program)
        .args(args)
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status()
        .with_context(|| format!("Failed to run: {} {}", program, args.join(" ")))?;

    if !status.success() {
        anyhow::bail!("Command failed: {} {}", program, args.join(" "));
    }

    Ok(())
}
