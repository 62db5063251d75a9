pub mod error;
pub mod gdf;
pub mod models;
pub mod trainers;

// Re-export common types
pub use error::{Error, Result};
pub use gdf::{Diffused, Gdf, GdfConfig};
pub use trainers::{load_settings, StageCTrainer, TrainSettings};

pub mod logging {
    use env_logger::{Builder, Env};
    use std::io::Write;

    /// Timestamped logger at Info level unless `RUST_LOG` says otherwise.
    pub fn init_logger() {
        Builder::from_env(Env::default().default_filter_or("info"))
            .format(|buf, record| {
                writeln!(
                    buf,
                    "{} [{}] - {}",
                    chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                    record.level(),
                    record.args()
                )
            })
            .init();
    }
}
