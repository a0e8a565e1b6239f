use std::process::ExitCode;

use finetune::config::AppConfig;
use finetune::jobs::{TrainRequest, run_training};

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    finetune::init_process();
    let args: Vec<String> = std::env::args().skip(1).collect();
    log::info!("=== STARTING TRAINING JOB === args: {:?}", args);

    let result = async {
        let request = TrainRequest::from_args(&args)?;
        let config = AppConfig::from_env()?;
        run_training(&config, &request).await
    }
    .await;

    match result {
        Ok(locations) => {
            log::info!("Model saved: {} | {}", locations.local_path, locations.cloud_path);
            println!("{}", locations.cloud_path);
            ExitCode::SUCCESS
        }
        Err(err) => {
            log::error!("Training job failed: {}", err);
            eprintln!("ERROR: {}", err);
            ExitCode::FAILURE
        }
    }
}
