use broker::{
    arguments,
    config,
    license::License,
    logger::{self, LogTag},
    service::Service,
};

/// Entry point for a broker node
///
/// - `--help`: print usage and exit
/// - `--new-license <secret>`: print an encoded license and exit
/// - otherwise: load configuration and serve until a shutdown signal
#[tokio::main]
async fn main() {
    logger::init(arguments::to_logger_config());

    if arguments::is_help_requested() {
        arguments::print_help();
        std::process::exit(0);
    }

    if let Some(secret) = arguments::new_license_secret() {
        println!(
            "{}",
            License::new_encoded(&secret, arguments::license_contract(), 0)
        );
        std::process::exit(0);
    }

    logger::info(LogTag::System, "Broker node starting up...");

    if let Err(e) = run().await {
        logger::error(LogTag::System, &format!("Broker node failed: {:#}", e));
        logger::flush();
        std::process::exit(1);
    }

    logger::info(LogTag::System, "Broker node stopped");
    logger::flush();
}

async fn run() -> anyhow::Result<()> {
    let path = arguments::config_path();
    let config = config::load_config_from_path(&path)?;
    let service = Service::new(config)?;
    service.listen().await?;
    Ok(())
}
