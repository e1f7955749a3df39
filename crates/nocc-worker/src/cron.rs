//! Periodic housekeeping: idle-client purge, cache eviction, stats, and
//! log reopening after rotation.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::logging::{self, LogWriter};
use crate::server::NoccServer;

const TICK: Duration = Duration::from_secs(10);
const EVICT_PERIOD: Duration = Duration::from_secs(180);
const STATS_PERIOD: Duration = Duration::from_secs(60);

pub fn run_cron(server: Arc<NoccServer>, log_writer: LogWriter) {
    let mut last_evict = Instant::now();
    let mut last_stats = Instant::now();

    while !server.quit.wait_timeout(TICK) {
        if logging::take_reopen_request() {
            log_writer.reopen();
            tracing::info!("log file reopened");
        }

        server.clients.delete_inactive_clients();

        if last_evict.elapsed() > EVICT_PERIOD {
            last_evict = Instant::now();
            let src_evicted = server.src_cache.enforce_limit();
            let obj_evicted = server.obj_cache.enforce_limit();
            if src_evicted + obj_evicted > 0 {
                tracing::info!(
                    "cache eviction: {src_evicted} src entries, {obj_evicted} obj entries"
                );
            }
        }

        if last_stats.elapsed() > STATS_PERIOD {
            last_stats = Instant::now();
            tracing::info!("stats: {}", server.stats_line());
        }
    }
}
