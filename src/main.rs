use std::fs::File;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use clap::Parser;
use color_eyre::eyre::{Result, WrapErr};
use tracing::{debug, error, info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Layer};

use overture_downloader::catalog::DEFAULT_RELEASE;
use overture_downloader::config::{AppConfig, OutputNaming};
use overture_downloader::server::{self, AppState};

#[derive(Parser, Debug, Clone)]
#[command(version, about)]
struct Args {
    /// Address to bind the form server to
    #[arg(long, default_value = "127.0.0.1")]
    host: IpAddr,

    /// Port to listen on
    #[arg(short, long, default_value_t = 8501)]
    port: u16,

    /// Downloader executable, looked up on PATH unless a path is given
    #[arg(long, default_value = "overturemaps")]
    downloader: PathBuf,

    /// Directory downloads are written to and served from
    #[arg(short, long, default_value = ".")]
    output_dir: PathBuf,

    /// Always write to output.<format> instead of output_<theme>_<type>.<format>
    #[arg(long)]
    fixed_output_name: bool,

    /// Release the version field is pre-filled with
    #[arg(long, default_value = DEFAULT_RELEASE)]
    release: String,

    /// Open the form in the default browser once the server is up
    #[arg(long)]
    open: bool,

    /// How verbose the output should be, can be set up to 3 times. Has no effect if RUST_LOG is set
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Path to output log to
    #[arg(short, long)]
    log_path: Option<PathBuf>,
}

impl Args {
    fn config(&self) -> AppConfig {
        AppConfig {
            bind: SocketAddr::new(self.host, self.port),
            downloader: self.downloader.clone(),
            output_dir: self.output_dir.clone(),
            naming: if self.fixed_output_name {
                OutputNaming::Fixed
            } else {
                OutputNaming::Qualified
            },
            default_release: self.release.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let old_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        let backtrace = std::backtrace::Backtrace::force_capture();
        old_hook(panic_info);
        error!("Backtrace: {:#?}", backtrace);
    }));

    let args = Args::parse();
    tracing_init(&args)?;
    debug!(?args);

    let config = args.config();
    std::fs::create_dir_all(&config.output_dir)
        .wrap_err_with(|| format!("could not create output directory {}", config.output_dir.display()))?;

    let url = format!("http://{}", config.bind);
    let state = Arc::new(AppState::new(config));

    if args.open {
        let url = url.clone();
        tokio::spawn(async move {
            // give the listener a moment to come up
            tokio::time::sleep(std::time::Duration::from_millis(300)).await;
            if let Err(e) = open::that(&url) {
                warn!("Failed to open {}: {}", url, e);
            }
        });
    }

    info!("form available at {}", url);
    server::serve(state.clone(), shutdown_signal(state))
        .await
        .wrap_err("server error")?;
    info!("server stopped");
    Ok(())
}

async fn shutdown_signal(state: Arc<AppState>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("failed to listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
    info!("shutting down");
    state.cancel_active();
}

fn tracing_init(args: &Args) -> Result<()> {
    tracing_log::LogTracer::init()?;

    let env_filter = EnvFilter::builder()
        .with_default_directive(
            match args.verbose {
                0 => "overture_downloader=info",
                1 => "info",
                2 => "debug",
                _ => "trace",
            }
            .parse()?,
        )
        .from_env_lossy();

    let stdout_log = tracing_subscriber::fmt::layer().with_filter(env_filter);

    let file_log = match &args.log_path {
        Some(log_path) => {
            let log_file =
                File::create(log_path).wrap_err_with(|| format!("could not create log file {}", log_path.display()))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(Mutex::new(log_file))
                    .with_filter(tracing::level_filters::LevelFilter::TRACE),
            )
        }
        None => None,
    };

    let subscriber = tracing_subscriber::registry().with(stdout_log).with(file_log);
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_args() {
        let args = Args::parse_from(["overture-downloader"]);
        let config = args.config();
        assert_eq!(config.bind, SocketAddr::from(([127, 0, 0, 1], 8501)));
        assert_eq!(config.naming, OutputNaming::Qualified);
        assert_eq!(config.default_release, DEFAULT_RELEASE);
        assert_eq!(config.downloader, PathBuf::from("overturemaps"));
    }

    #[test]
    fn test_fixed_output_flag() {
        let args = Args::parse_from([
            "overture-downloader",
            "--fixed-output-name",
            "-p",
            "9000",
            "--downloader",
            "/opt/bin/overturemaps",
            "-vv",
        ]);
        let config = args.config();
        assert_eq!(config.naming, OutputNaming::Fixed);
        assert_eq!(config.bind.port(), 9000);
        assert_eq!(args.verbose, 2);
    }

    #[test]
    fn test_args_are_consistent() {
        use clap::CommandFactory;
        Args::command().debug_assert();
    }
}
