use anyhow::Result;
use clap::Parser;
use inbox_ledger::cli::{self, Cli, Commands, ErrorReport, ProgressReporter};
use inbox_ledger::config::Config;
use inbox_ledger::error::ScanError;
use indicatif::MultiProgress;
use std::io::Write;
use std::process;
use std::sync::Arc;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

/// A writer that prints through MultiProgress to avoid progress bar conflicts
#[derive(Clone)]
struct MultiProgressWriter {
    multi: Arc<MultiProgress>,
    buffer: Arc<std::sync::Mutex<Vec<u8>>>,
}

impl MultiProgressWriter {
    fn new(multi: Arc<MultiProgress>) -> Self {
        Self {
            multi,
            buffer: Arc::new(std::sync::Mutex::new(Vec::new())),
        }
    }
}

impl Write for MultiProgressWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut buffer = self.buffer.lock().unwrap();
        buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut buffer = self.buffer.lock().unwrap();
        if !buffer.is_empty() {
            let msg = String::from_utf8_lossy(&buffer);
            let msg = msg.trim_end_matches('\n');
            if !msg.is_empty() {
                let _ = self.multi.println(msg);
            }
            buffer.clear();
        }
        Ok(())
    }
}

impl Drop for MultiProgressWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

/// MakeWriter implementation for tracing
#[derive(Clone)]
struct MultiProgressMakeWriter {
    multi: Arc<MultiProgress>,
}

impl<'a> MakeWriter<'a> for MultiProgressMakeWriter {
    type Writer = MultiProgressWriter;

    fn make_writer(&'a self) -> Self::Writer {
        MultiProgressWriter::new(Arc::clone(&self.multi))
    }
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {}", e);
        eprintln!("\nFor help, run: inbox-ledger --help");
        process::exit(1);
    }
}

async fn run() -> Result<()> {
    // aws-lc-rs everywhere except Windows, where ring avoids the NASM/CMake toolchain
    #[cfg(not(windows))]
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install default crypto provider"))?;

    #[cfg(windows)]
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install default crypto provider"))?;

    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("inbox_ledger=debug,info"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("inbox_ledger=info,warn"))
    };

    // Logs print above progress bars, both on stderr
    let multi_progress = Arc::new(MultiProgress::new());
    tracing_subscriber::fmt()
        .compact()
        .with_env_filter(filter)
        .with_writer(MultiProgressMakeWriter {
            multi: Arc::clone(&multi_progress),
        })
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    match cli.command {
        Commands::Auth { user, force } => {
            let config = Config::load(&cli.config).await?;
            tracing::info!("Authorizing mailbox for {}...", user);

            let address = cli::run_auth(&config, &user, force).await?;
            println!("Successfully authenticated {}", user);
            println!("Connected to account: {}", address);
            println!(
                "Token cached at: {:?}",
                inbox_ledger::auth::token_path(&config.auth.token_dir, &user)
            );
            Ok(())
        }

        Commands::Scan { user } => {
            let reporter = ProgressReporter::with_multi_progress((*multi_progress).clone());
            let result = match Config::load(&cli.config).await {
                Ok(config) => cli::run_scan(&config, &user, &reporter).await,
                Err(e) => Err(e),
            };

            match result {
                Ok(ids) => {
                    println!("{}", serde_json::to_string(&ids)?);
                    Ok(())
                }
                Err(e) => {
                    println!("{}", serde_json::to_string(&ErrorReport::from(&e))?);
                    process::exit(1);
                }
            }
        }

        Commands::Status { user } => {
            let config = Config::load(&cli.config).await?;
            let status = cli::load_status(&config, &user).await?;

            println!("\n========================================");
            println!("Status for {}", status.user_id);
            println!("========================================");
            println!(
                "Mailbox: {}",
                status.email.as_deref().unwrap_or("(not authorized)")
            );
            println!("Processed messages: {}", status.stats.records);
            println!("Financial messages: {}", status.stats.financial);
            println!("Archived files: {}", status.stats.archived_files);
            println!("Ledger rows: {}", status.stats.ledger_rows);
            if status.stats.unlabeled > 0 {
                println!(
                    "Awaiting label: {} (re-applied on the next scan)",
                    status.stats.unlabeled
                );
            }
            println!("========================================");
            Ok(())
        }

        Commands::InitConfig { output, force } => {
            tracing::info!("Generating example configuration file");

            if output.exists() && !force {
                return Err(ScanError::ConfigError(format!(
                    "Configuration file already exists at {:?}. Use --force to overwrite.",
                    output
                ))
                .into());
            }

            Config::create_example(&output).await?;

            println!("Created example configuration file at: {:?}", output);
            println!("\nPlease edit this file to customize your settings.");
            println!("Key settings to review:");
            println!("  - scan.newer_than_days: How far back unlabelled mail is picked up");
            println!("  - classification.provider: 'openai' (build with --features ml) or 'disabled'");
            println!("  - archive.root_dir: Where invoice attachments are stored");
            println!("  - auth.credentials: OAuth client secret downloaded from Google Cloud");
            Ok(())
        }
    }
}
