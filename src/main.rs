use std::error::Error;

use report_harvester::{AppConfig, Harvester, logging};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    logging::init(logging::level_from_env());
    log::info!("report-harvester {}", report_harvester::VERSION);

    let config = AppConfig::from_env().inspect_err(|err| log::error!("{err}"))?;
    let harvester = Harvester::from_config(config).inspect_err(|err| log::error!("{err}"))?;

    let summary = harvester
        .run()
        .await
        .inspect_err(|err| log::error!("harvest aborted: {err}"))?;
    if summary.failed > 0 {
        log::warn!("{} reports could not be downloaded", summary.failed);
    }
    Ok(())
}
