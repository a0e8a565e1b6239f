use std::process::ExitCode;

use finetune::config::AppConfig;
use finetune::jobs::{ClassifyRequest, run_classification};

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    finetune::init_process();
    let args: Vec<String> = std::env::args().skip(1).collect();

    let result = async {
        let request = ClassifyRequest::from_args(&args)?;
        let config = AppConfig::from_env()?;
        let prediction = run_classification(&config, &request).await?;
        serde_json::to_string(&prediction)
            .map_err(|e| finetune::JobError::Training(format!("could not encode result: {}", e)))
    }
    .await;

    match result {
        Ok(json) => {
            println!("{}", json);
            ExitCode::SUCCESS
        }
        Err(err) => {
            log::error!("Classification job failed: {}", err);
            eprintln!("ERROR: {}", err);
            ExitCode::FAILURE
        }
    }
}
