use tokio::runtime::{Builder, Runtime};

use crate::config::FetchConfig;
use crate::error::Result;

/// Build the multi-threaded worker pool that runs fetch tasks.
pub fn build_worker_pool(config: &FetchConfig) -> Result<Runtime> {
    let runtime = Builder::new_multi_thread()
        .worker_threads(config.worker_threads.max(1))
        .thread_name("astro-fetch")
        .enable_all()
        .build()?;
    Ok(runtime)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_runs_spawned_work() {
        let config = FetchConfig {
            worker_threads: 2,
            ..FetchConfig::default()
        };
        let runtime = build_worker_pool(&config).expect("runtime builds");
        let name = runtime
            .block_on(async {
                tokio::spawn(async {
                    std::thread::current().name().map(str::to_owned)
                })
                .await
            })
            .expect("task joins");
        assert_eq!(name.as_deref(), Some("astro-fetch"));
    }
}
