pub mod config;
pub mod error;
pub mod record;

pub use config::{available_processors, load_dotenv, ComputeConfig, Config, StorageConfig};
pub use error::*;
pub use record::*;
