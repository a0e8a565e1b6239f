pub mod catalog;
pub mod classifier;
pub mod config;
pub mod error;
pub mod jobs;
pub mod remote;
pub mod storage;
pub mod training;
pub mod vision;

pub use error::JobError;

/// Loads `.env`, then logs to stderr at `info` unless `RUST_LOG` says otherwise.
pub fn init_process() {
    dotenv::dotenv().ok();
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));
}
