use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

use crate::error::find_import_error;
use crate::import::{self, ImportJob};
use crate::repo::{Protocol, RepoCoordinates};

#[derive(Parser, Debug)]
#[command(name = "srpmproc")]
#[command(about = "Import and patch RPM source packages between git forges", long_about = None)]
pub struct Cli {
    /// Machine-readable JSON output
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Import one package from the upstream forge into the destination
    Import(ImportArgs),
}

#[derive(clap::Args, Debug)]
pub struct ImportArgs {
    /// Package name, also the repository name on both forges
    package: String,

    /// Major release version, used for branch and dist defaults
    #[arg(long)]
    release: u32,

    /// Upstream forge host
    #[arg(long)]
    source_host: String,

    /// Upstream organization or namespace
    #[arg(long, default_value = "rpms")]
    source_org: String,

    #[arg(long, value_enum, default_value_t = Protocol::Https)]
    source_protocol: Protocol,

    /// Destination forge host
    #[arg(long)]
    dest_host: String,

    /// Destination organization or namespace
    #[arg(long, default_value = "rpms")]
    dest_org: String,

    #[arg(long, value_enum, default_value_t = Protocol::Ssh)]
    dest_protocol: Protocol,

    /// Organization on the destination forge holding patch repositories
    #[arg(long)]
    patch_org: Option<String>,

    /// Upstream branch (default: c<release>)
    #[arg(long)]
    source_branch: Option<String>,

    /// Destination branch (default: r<release>)
    #[arg(long)]
    dest_branch: Option<String>,

    /// Dist tag prefix for the default .<prefix><release> dist
    #[arg(long, default_value = "el")]
    distprefix: String,

    /// Full dist tag override, with or without the leading dot
    #[arg(long)]
    distcustom: Option<String>,

    /// ssh user for forge access
    #[arg(long, default_value = "git")]
    git_user: String,

    /// Seconds an apply_script action may run before it is killed
    #[arg(long, default_value_t = 300)]
    script_timeout: u64,

    /// Directory-backed lookaside store for large source blobs
    #[arg(long)]
    lookaside: Option<PathBuf>,
}

impl ImportArgs {
    fn into_job(self) -> ImportJob {
        let source = RepoCoordinates::new(self.source_host, self.source_org, self.source_protocol)
            .with_user(self.git_user.clone());
        let dest = RepoCoordinates::new(self.dest_host.clone(), self.dest_org, self.dest_protocol)
            .with_user(self.git_user.clone());
        let patch = self.patch_org.map(|org| {
            RepoCoordinates::new(self.dest_host, org, self.dest_protocol)
                .with_user(self.git_user)
        });
        ImportJob {
            package: self.package,
            release_ver: self.release,
            source,
            dest,
            patch,
            source_branch: self.source_branch,
            dest_branch: self.dest_branch,
            distprefix: self.distprefix,
            distcustom: self.distcustom,
            script_timeout: Duration::from_secs(self.script_timeout),
            lookaside_dir: self.lookaside,
        }
    }
}

pub fn run() -> std::process::ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let json = cli.json;
    match run_with(cli) {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(err) => {
            if json {
                let (code, details) = match find_import_error(&err) {
                    Some(found) => (found.kind.code(), found.details.clone()),
                    None => ("E_UNEXPECTED", None),
                };
                let envelope = serde_json::json!({
                    "ok": false,
                    "error": {
                        "code": code,
                        "message": format!("{err:#}"),
                        "details": details,
                    },
                });
                println!("{envelope}");
            } else {
                eprintln!("{err:#}");
            }
            std::process::ExitCode::from(1)
        }
    }
}

fn run_with(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Import(args) => {
            let job = args.into_job();
            let report = import::run(&job)?;
            if cli.json {
                let envelope = serde_json::json!({
                    "ok": true,
                    "report": report,
                });
                println!("{envelope}");
            } else if report.no_op {
                println!("{} already up to date ({})", report.nvr, report.tag);
            } else {
                println!("imported {} as {} at {}", report.nvr, report.tag, report.commit);
            }
            Ok(())
        }
    }
}
