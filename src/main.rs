use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use dcmcat::config::{init_logging, AppConfig};
use dcmcat::indexer::{index_by_accession_list, ResumePoint};
use dcmcat::query::{search, write_csv, QueryFilter};
use dcmcat::retrieval::{retrieve, RetrievalOptions};
use dcmcat::scanner::{scan, ScanOptions};
use dcmcat::selection::SeriesSelection;
use dcmcat::{report, transmission, CatalogStore, Project};
use dimse::{DimseConfig, DimseScu, RemoteNode};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(
    name = "dcmcat",
    version,
    about = "Catalog DICOM series from archives and PACS, retrieve and send them"
)]
struct Cli {
    /// Configuration file (defaults to ~/.dcmcat/config.toml)
    #[arg(long, global = true, env = "DCMCAT_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Index a local DICOM archive into the catalog
    Index {
        #[arg(long)]
        archive: PathBuf,
        /// Keep the existing catalog content
        #[arg(long)]
        append: bool,
        #[arg(long)]
        workers: Option<usize>,
        #[arg(long)]
        catalog: Option<PathBuf>,
    },
    /// Search the catalog and print matching series as CSV
    Query {
        /// Exact study date (YYYYMMDD)
        #[arg(long)]
        date: Option<String>,
        /// First study date, inclusive
        #[arg(long)]
        sdate: Option<String>,
        /// Last study date, inclusive
        #[arg(long)]
        edate: Option<String>,
        /// Comma separated columns searched by --pattern
        #[arg(long, requires = "pattern")]
        targets: Option<String>,
        /// Regular expression
        #[arg(long)]
        pattern: Option<String>,
        #[arg(short, long)]
        output: Option<PathBuf>,
        #[arg(long)]
        catalog: Option<PathBuf>,
    },
    /// Send catalogued series to a remote node
    Send {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        aet: Option<String>,
        /// Calling AE title (defaults to `[dimse] local_aet`)
        #[arg(long)]
        local_aet: Option<String>,
        /// Series selection CSV; `-` reads standard input
        #[arg(short, long, default_value = "-")]
        input: PathBuf,
        #[arg(long)]
        catalog: Option<PathBuf>,
    },
    /// Manage projects
    Project {
        #[command(subcommand)]
        cmd: ProjectCmd,
    },
}

#[derive(Subcommand, Debug)]
enum ProjectCmd {
    /// Create a project
    Create {
        name: String,
        #[arg(long)]
        host: String,
        #[arg(long)]
        port: u16,
        #[arg(long)]
        aet: String,
        /// Accession number list, one per line
        #[arg(long)]
        targets: PathBuf,
    },
    /// Index the project's accession list from its remote node
    Index {
        name: String,
        #[arg(long, conflicts_with = "resume_accession")]
        resume_line: Option<usize>,
        #[arg(long)]
        resume_accession: Option<String>,
    },
    /// Retrieve catalogued series into a local receiver
    Retrieve {
        name: String,
        #[arg(long)]
        workers: Option<usize>,
        #[arg(short, long, default_value = ".")]
        output: PathBuf,
        /// Receiver port
        #[arg(long)]
        port: Option<u16>,
        /// Receiver AE title and C-MOVE destination
        #[arg(long)]
        aet: Option<String>,
        /// Series selection CSV; `-` reads standard input
        #[arg(short, long)]
        input: Option<PathBuf>,
        /// Replace each received subject directory by a .tar.gz
        #[arg(long)]
        compress: bool,
    },
    /// Summarise the project's catalog
    Report {
        name: String,
        /// Cost per study, stored in the project
        #[arg(long)]
        cost: Option<f64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.unwrap_or_else(AppConfig::default_path);
    let config = AppConfig::load(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    init_logging(&config.logging)?;

    match cli.cmd {
        Cmd::Index {
            archive,
            append,
            workers,
            catalog,
        } => {
            let catalog = CatalogStore::open(&catalog.unwrap_or_else(|| config.app.catalog_path()))?;
            let options = ScanOptions {
                workers: workers.unwrap_or(config.scan.workers),
                append,
            };
            let result = scan(&archive, &catalog, options).await;
            catalog.close();
            let report = result?;
            println!(
                "Indexed {} of {} files in {} directories ({} series created, {} instances inserted)",
                report.indexed, report.files_seen, report.directories, report.series_created, report.instances_inserted
            );
            println!(
                "Skipped: {} without UIDs, {} not DICOM, {} unreadable",
                report.skipped_missing_uid, report.skipped_not_dicom, report.failed_read
            );
        }
        Cmd::Query {
            date,
            sdate,
            edate,
            targets,
            pattern,
            output,
            catalog,
        } => {
            let filter = QueryFilter::from_options(date, sdate, edate, targets.as_deref(), pattern.as_deref())?;
            let catalog = CatalogStore::open_existing(&catalog.unwrap_or_else(|| config.app.catalog_path()))?;
            let rows = search(&catalog, &filter);
            catalog.close();
            let rows = rows?;
            match output {
                Some(path) => {
                    let file = std::fs::File::create(&path)
                        .with_context(|| format!("creating {}", path.display()))?;
                    write_csv(&rows, file)?;
                    eprintln!("Wrote {} series to {}", rows.len(), path.display());
                }
                None => write_csv(&rows, std::io::stdout().lock())?,
            }
        }
        Cmd::Send {
            host,
            port,
            aet,
            local_aet,
            input,
            catalog,
        } => {
            let remote = remote_node(host, port, aet, config.remote.clone())?;
            let selection = SeriesSelection::from_path(&input)?;
            let catalog = CatalogStore::open_existing(&catalog.unwrap_or_else(|| config.app.catalog_path()))?;
            let scu = DimseScu::new(calling_config(&config.dimse, local_aet));
            let result = transmission::send(&catalog, selection.uids(), &remote, &scu).await;
            catalog.close();
            let report = result?;
            for file in report.files.iter().filter(|f| !matches!(f.outcome, transmission::FileOutcome::Stored(_))) {
                eprintln!("{}: {}", file.path.display(), file.outcome);
            }
            println!("Sent {} files, {} failed", report.stored(), report.failed());
        }
        Cmd::Project { cmd } => run_project(cmd, config).await?,
    }
    Ok(())
}

async fn run_project(cmd: ProjectCmd, config: AppConfig) -> anyhow::Result<()> {
    let home = config.app.home_dir();
    match cmd {
        ProjectCmd::Create {
            name,
            host,
            port,
            aet,
            targets,
        } => {
            let project = Project::create(&home, &name, RemoteNode::new(aet, host, port), &targets)?;
            println!("Created project '{}' in {}", project.name, project.dir().display());
        }
        ProjectCmd::Index {
            name,
            resume_line,
            resume_accession,
        } => {
            let resume = ResumePoint::from_options(resume_line, resume_accession)?;
            let project = Project::load(&home, &name)?;
            let catalog = project.open_catalog()?;
            let scu = DimseScu::new(config.dimse.clone());
            let result = index_by_accession_list(&project, &catalog, &scu, resume).await;
            catalog.close();
            let report = result?;
            println!(
                "Processed {} accessions: {} studies, {} series indexed, {} failures",
                report.accessions, report.studies_found, report.series_indexed, report.failures
            );
        }
        ProjectCmd::Retrieve {
            name,
            workers,
            output,
            port,
            aet,
            input,
            compress,
        } => {
            let project = Project::load(&home, &name)?;
            let mut options = RetrievalOptions::from_config(&config, output);
            if let Some(workers) = workers {
                options.workers = workers;
            }
            if let Some(port) = port {
                options.port = port;
            }
            if let Some(aet) = aet {
                options.local_aet = aet;
            }
            options.compress |= compress;
            options.selection = input.map(|path| SeriesSelection::from_path(&path)).transpose()?;

            let factory = Arc::new(DimseScu::new(calling_config(
                &config.dimse,
                Some(options.local_aet.clone()),
            )));

            let catalog = project.open_existing_catalog()?;
            let result = retrieve(&project, &catalog, factory, options).await;
            catalog.close();
            let summary = result?;
            println!(
                "Requested {} series: {} completed, {} failed; {} objects received in {}",
                summary.submitted,
                summary.completed,
                summary.failed,
                summary.received,
                summary.output_root.display()
            );
            for archive in &summary.archives {
                println!("  {}", archive.display());
            }
        }
        ProjectCmd::Report { name, cost } => {
            let mut project = Project::load(&home, &name)?;
            let catalog = project.open_existing_catalog()?;
            let generated = report::generate(&mut project, &catalog, cost);
            catalog.close();
            let generated = generated?;
            print!("{}", generated.render());
            let path = report::write_report(&project, &generated)?;
            println!("\nReport saved to {}", path.display());
        }
    }
    Ok(())
}

/// SCU settings with an optional calling AE title override
fn calling_config(base: &DimseConfig, local_aet: Option<String>) -> DimseConfig {
    let mut config = base.clone();
    if let Some(local_aet) = local_aet {
        config.local_aet = local_aet;
    }
    config
}

fn remote_node(
    host: Option<String>,
    port: Option<u16>,
    aet: Option<String>,
    configured: Option<RemoteNode>,
) -> anyhow::Result<RemoteNode> {
    let node = match (host, port, aet, configured) {
        (Some(host), Some(port), Some(aet), _) => RemoteNode::new(aet, host, port),
        (None, None, None, Some(node)) => node,
        (None, None, None, None) => {
            return Err(anyhow!("no remote node: pass --host, --port and --aet or configure [remote]"))
        }
        _ => return Err(anyhow!("--host, --port and --aet must be given together")),
    };
    node.validate()?;
    Ok(node)
}
