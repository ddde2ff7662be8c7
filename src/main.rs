use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use slex_core::config::GlobalConfig;
use slex_core::pipeline::{SortCriterion, SortJob, SortOptions, SortOutcome};
use slex_core::protocol::{ProbeTimeouts, SlpClient};
use slex_core::server_list::ServerListStore;
use slex_core::watcher::ListWatcher;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    tracing::info!("Server List Explorer core starting");

    let cfg = GlobalConfig::load().unwrap_or_default();
    let list_path = cfg.list_file();

    let mut store = ServerListStore::new(&list_path);
    store.load()?;

    // 목록 파일 외부 변경 감시
    let watcher = ListWatcher::new(&list_path, Duration::from_secs(1)).spawn();
    let mut changes = watcher.subscribe();
    tokio::spawn(async move {
        while changes.changed().await.is_ok() {
            let generation = *changes.borrow();
            tracing::info!("Server list file changed on disk (generation {})", generation);
        }
    });

    // 정렬 기준: SLEX_SORT_BY 환경변수 > 설정 파일 > 기본값(지연시간)
    let criterion = std::env::var("SLEX_SORT_BY")
        .ok()
        .as_deref()
        .and_then(SortCriterion::from_key)
        .or_else(|| cfg.default_criterion_key().and_then(SortCriterion::from_key))
        .unwrap_or(SortCriterion::ByLatency);
    tracing::info!("Sorting {} server(s) by {:?}", store.len(), criterion);

    let servers = store.list().to_vec();
    let store = Arc::new(Mutex::new(store));
    let options = SortOptions {
        timeouts: ProbeTimeouts {
            connect: cfg.connect_timeout(),
            probe: cfg.probe_timeout(),
        },
        concurrency_override: cfg.max_concurrency(),
        completion_hold: cfg.completion_hold(),
    };

    let sink_store = store.clone();
    let job = SortJob::spawn(
        servers,
        criterion,
        Arc::new(SlpClient::new()),
        options,
        move |ordered| async move {
            sink_store.lock().await.apply_order(ordered)?;
            Ok(())
        },
    );

    // Ctrl+C는 프로빙 단계 skip으로 처리 — 남은 프로브는 측정 없음으로 정렬
    let skip = job.skip_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Ctrl+C received, skipping remaining probes");
            skip.cancel();
        }
    });

    // 진행 상황 로그
    let mut progress = job.subscribe();
    tokio::spawn(async move {
        while progress.changed().await.is_ok() {
            let p = progress.borrow().clone();
            tracing::info!(
                "[Progress] {:?}: probes {}/{}, ranking {}/2",
                p.phase,
                p.probes_done,
                p.probes_total,
                p.ranking_steps
            );
        }
    });

    match job.wait().await? {
        SortOutcome::Completed { measured } => {
            let store = store.lock().await;
            tracing::info!(
                "Sort applied: {} measured / {} total",
                measured,
                store.len()
            );
            for record in store.list() {
                match &record.status {
                    Some(s) => tracing::info!(
                        "  {} ({}) — {} ms, {}/{} online",
                        record.name,
                        record.address,
                        s.latency_ms,
                        s.players_online,
                        s.players_max
                    ),
                    None => tracing::info!("  {} ({}) — no response", record.name, record.address),
                }
            }
        }
        SortOutcome::Cancelled => {
            tracing::info!("Sort cancelled before ranking, list unchanged");
        }
    }

    watcher.stop().await;
    tracing::info!("Server List Explorer core shutting down");
    Ok(())
}
