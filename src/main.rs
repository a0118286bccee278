use clap::Parser;
use mr_dashboard_lib::Cli;

#[tokio::main]
async fn main() {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let cli = Cli::parse();
    if let Err(e) = mr_dashboard_lib::run(cli).await {
        log::error!("{}", e);
        std::process::exit(1);
    }
}
