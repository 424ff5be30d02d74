use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Err(e) = mcall::cli::run_cli().await {
        eprintln!("mcall: {:#}", e);
        std::process::exit(1);
    }
}
