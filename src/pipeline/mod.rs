//! 정렬 파이프라인 — 서버 전체를 병렬 프로브한 뒤 순위를 계산하고 영속화
//!
//! ## 아키텍처
//! - Probing: 서버당 프로브 태스크 1개, Semaphore로 동시성 제한
//! - Ranking: 메모리 정렬 → 싱크 호출, 두 단계는 엄격히 순차 실행
//! - skip은 프로빙 단계만 조기 종료, cancel은 랭킹 시작 전까지만 유효
//! - 구독자는 watch 채널로 진행 스냅샷을 수신

use crate::protocol::{ProbeTimeouts, ServerStatus, StatusProbe};
use crate::server_list::ServerRecord;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, Notify, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// 정렬 기준
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortCriterion {
    /// 지연시간 오름차순, 미측정 서버는 뒤로
    #[serde(rename = "latency")]
    ByLatency,
    /// 접속자 수 내림차순, 미측정 서버는 뒤로
    #[serde(rename = "players")]
    ByPlayerCount,
}

impl SortCriterion {
    pub fn from_key(key: &str) -> Option<Self> {
        match key.to_ascii_lowercase().as_str() {
            "latency" | "ping" => Some(Self::ByLatency),
            "players" | "playercount" => Some(Self::ByPlayerCount),
            _ => None,
        }
    }
}

/// 파이프라인 단계
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Probing,
    Ranking,
    Done,
}

/// 진행 상태 스냅샷 — watch 채널로 구독자에게 전달
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortProgress {
    pub phase: Phase,
    pub probes_done: usize,
    pub probes_total: usize,
    /// 프로빙 단계 카운트다운 잔량. 표시용이며 0이 되어도 단계는 끝나지 않는다.
    pub budget_remaining: Duration,
    /// 랭킹 진행 단계 (0..=2): 1 = 메모리 정렬 완료, 2 = 영속화 완료
    pub ranking_steps: u8,
}

/// 파이프라인 종료 결과
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SortOutcome {
    /// 정렬 완료, 싱크가 정확히 한 번 호출됨
    Completed { measured: usize },
    /// 랭킹 시작 전 취소됨 — 싱크 미호출
    Cancelled,
}

/// 파이프라인 실행 옵션
#[derive(Debug, Clone)]
pub struct SortOptions {
    pub timeouts: ProbeTimeouts,
    /// 동시 프로브 상한 덮어쓰기 (기본: 하드웨어 병렬성 기반 자동)
    pub concurrency_override: Option<usize>,
    /// 완료 상태 유지 시간 — 관찰자가 종료 상태를 인지할 여유
    pub completion_hold: Duration,
}

impl Default for SortOptions {
    fn default() -> Self {
        Self {
            timeouts: ProbeTimeouts::default(),
            concurrency_override: None,
            completion_hold: Duration::from_secs(2),
        }
    }
}

/// 프로브 동시성 상한: min(서버 수, clamp(코어 × 2, 4, 32))
pub fn probe_concurrency(server_count: usize, concurrency_override: Option<usize>) -> usize {
    let hardware = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4);
    let cap = concurrency_override
        .unwrap_or_else(|| (hardware * 2).clamp(4, 32))
        .clamp(1, 32);
    server_count.min(cap).max(1)
}

/// 실행 중인 정렬 파이프라인 핸들
///
/// `spawn`으로 시작하고 `wait`로 결과를 회수한다. skip/cancel은 언제든
/// 호출 가능하며, 각각 프로빙 조기 종료와 랭킹 전 중단을 요청한다.
pub struct SortJob {
    skip_token: CancellationToken,
    cancel_token: CancellationToken,
    progress: watch::Receiver<SortProgress>,
    handle: tokio::task::JoinHandle<anyhow::Result<SortOutcome>>,
}

impl SortJob {
    /// 파이프라인 태스크 스폰
    ///
    /// `apply`는 최종 순서를 영속화하는 싱크로, 실행당 정확히 한 번 호출된다
    /// (랭킹 전에 취소된 경우 제외). 싱크 오류는 `wait`로 전파된다.
    pub fn spawn<P, S, Fut>(
        servers: Vec<ServerRecord>,
        criterion: SortCriterion,
        probe: Arc<P>,
        options: SortOptions,
        apply: S,
    ) -> Self
    where
        P: StatusProbe + 'static,
        S: FnOnce(Vec<ServerRecord>) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let skip_token = CancellationToken::new();
        let cancel_token = CancellationToken::new();
        let initial = SortProgress {
            phase: Phase::Probing,
            probes_done: 0,
            probes_total: servers.len(),
            budget_remaining: options.timeouts.probe,
            ranking_steps: 0,
        };
        let (progress_tx, progress_rx) = watch::channel(initial);

        let handle = tokio::spawn(run(
            servers,
            criterion,
            probe,
            options,
            apply,
            skip_token.clone(),
            cancel_token.clone(),
            progress_tx,
        ));

        Self {
            skip_token,
            cancel_token,
            progress: progress_rx,
            handle,
        }
    }

    /// 프로빙 조기 종료 — 시작 전 프로브는 측정 없음으로 처리
    pub fn skip(&self) {
        tracing::info!("[Pipeline] Skip requested");
        self.skip_token.cancel();
    }

    /// 랭킹 시작 전 전체 중단 요청. 랭킹 진입 후에는 무시된다.
    pub fn cancel(&self) {
        tracing::info!("[Pipeline] Cancel requested");
        self.cancel_token.cancel();
    }

    pub fn skip_token(&self) -> CancellationToken {
        self.skip_token.clone()
    }

    /// 진행 스냅샷 구독
    pub fn subscribe(&self) -> watch::Receiver<SortProgress> {
        self.progress.clone()
    }

    /// 파이프라인 종료까지 대기하고 결과 회수
    pub async fn wait(self) -> anyhow::Result<SortOutcome> {
        self.handle.await?
    }
}

#[allow(clippy::too_many_arguments)]
async fn run<P, S, Fut>(
    servers: Vec<ServerRecord>,
    criterion: SortCriterion,
    probe: Arc<P>,
    options: SortOptions,
    apply: S,
    skip: CancellationToken,
    cancel: CancellationToken,
    progress: watch::Sender<SortProgress>,
) -> anyhow::Result<SortOutcome>
where
    P: StatusProbe + 'static,
    S: FnOnce(Vec<ServerRecord>) -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let total = servers.len();
    let limit = probe_concurrency(total, options.concurrency_override);
    let budget = options.timeouts.probe;
    let started = Instant::now();
    tracing::info!(
        "[Pipeline] Probing {} server(s) with up to {} concurrent probe(s)",
        total,
        limit
    );

    let semaphore = Arc::new(Semaphore::new(limit));
    let results: Arc<Mutex<HashMap<Uuid, ServerStatus>>> = Arc::new(Mutex::new(HashMap::new()));
    let completed = Arc::new(Mutex::new(0usize));
    let all_done = Arc::new(Notify::new());

    let mut tasks = JoinSet::new();
    for record in servers.iter().cloned() {
        let semaphore = semaphore.clone();
        let probe = probe.clone();
        let results = results.clone();
        let completed = completed.clone();
        let all_done = all_done.clone();
        let skip = skip.clone();
        let timeouts = options.timeouts;

        tasks.spawn(async move {
            let status = async {
                // skip 이후에는 새 프로브를 시작하지 않는다 — 슬롯 대기 중에도 즉시 탈출
                let _permit = tokio::select! {
                    biased;
                    _ = skip.cancelled() => return None,
                    permit = semaphore.acquire_owned() => match permit {
                        Ok(p) => p,
                        Err(_) => return None,
                    },
                };
                if skip.is_cancelled() {
                    return None;
                }
                match probe.probe(&record.address, timeouts).await {
                    Ok(status) => Some(status),
                    Err(e) => {
                        tracing::debug!("[Pipeline] Probe failed for {}: {}", record.address, e);
                        None
                    }
                }
            }
            .await;

            if let Some(status) = status {
                results.lock().await.insert(record.id, status);
            }

            // 성공/실패/스킵과 무관하게 완료 카운터 증가
            let mut done = completed.lock().await;
            *done += 1;
            drop(done);
            all_done.notify_waiters();
        });
    }

    // 단계 종료 조건 대기: skip 또는 전 프로브 완료. 폴링 없이 알림으로만 깨어나며,
    // 1초 틱은 카운트다운 표시 갱신용이다.
    let mut ticker = interval(Duration::from_secs(1));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        let notified = all_done.notified();
        tokio::pin!(notified);
        // 카운터 확인 전에 등록해 두어 알림 유실을 막는다
        notified.as_mut().enable();
        let done = *completed.lock().await;
        let _ = progress.send(SortProgress {
            phase: Phase::Probing,
            probes_done: done,
            probes_total: total,
            budget_remaining: budget.saturating_sub(started.elapsed()),
            ranking_steps: 0,
        });
        if done >= total {
            break;
        }
        tokio::select! {
            _ = skip.cancelled() => break,
            _ = cancel.cancelled() => break,
            _ = &mut notified => {}
            _ = ticker.tick() => {}
        }
    }

    // 미완료 프로브 태스크는 무조건 정리
    tasks.abort_all();
    while tasks.join_next().await.is_some() {}

    if cancel.is_cancelled() {
        tracing::info!("[Pipeline] Cancelled before ranking, discarding probe results");
        return Ok(SortOutcome::Cancelled);
    }

    let done = *completed.lock().await;
    let measured = results.lock().await.clone();
    let measured_count = measured.len();
    tracing::info!(
        "[Pipeline] Probing finished: {} measured / {} total",
        measured_count,
        total
    );

    // 랭킹 1단계 — 메모리 정렬
    let _ = progress.send(SortProgress {
        phase: Phase::Ranking,
        probes_done: done,
        probes_total: total,
        budget_remaining: Duration::ZERO,
        ranking_steps: 0,
    });
    let ordered = rank(servers, &measured, criterion);
    let _ = progress.send(SortProgress {
        phase: Phase::Ranking,
        probes_done: done,
        probes_total: total,
        budget_remaining: Duration::ZERO,
        ranking_steps: 1,
    });

    // 랭킹 2단계 — 영속화. 실패는 호출자에게 전파된다.
    apply(ordered).await?;
    let _ = progress.send(SortProgress {
        phase: Phase::Ranking,
        probes_done: done,
        probes_total: total,
        budget_remaining: Duration::ZERO,
        ranking_steps: 2,
    });

    // 완료 상태를 잠시 유지 — 화면이 즉시 사라지지 않도록
    let _ = progress.send(SortProgress {
        phase: Phase::Done,
        probes_done: done,
        probes_total: total,
        budget_remaining: Duration::ZERO,
        ranking_steps: 2,
    });
    tokio::time::sleep(options.completion_hold).await;

    tracing::info!(
        "[Pipeline] Sort completed ({} measured / {} total)",
        measured_count,
        total
    );
    Ok(SortOutcome::Completed {
        measured: measured_count,
    })
}

/// 측정값 기준 안정 정렬. 미측정 서버는 두 기준 모두에서 뒤로 밀리며
/// 서로 간에는 입력 순서를 유지한다.
fn rank(
    mut servers: Vec<ServerRecord>,
    measured: &HashMap<Uuid, ServerStatus>,
    criterion: SortCriterion,
) -> Vec<ServerRecord> {
    for record in servers.iter_mut() {
        record.status = measured.get(&record.id).cloned();
    }
    match criterion {
        SortCriterion::ByLatency => {
            // 미측정은 최대 지연 sentinel
            servers.sort_by_key(|r| {
                r.status
                    .as_ref()
                    .map(|s| s.latency_ms)
                    .unwrap_or(u64::MAX)
            });
        }
        SortCriterion::ByPlayerCount => {
            // 미측정은 측정된 0명보다도 낮은 sentinel
            servers.sort_by_key(|r| {
                std::cmp::Reverse(
                    r.status
                        .as_ref()
                        .map(|s| s.players_online as i64)
                        .unwrap_or(-1),
                )
            });
        }
    }
    servers
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str) -> ServerRecord {
        ServerRecord::new(name, &format!("{}.example.net", name))
    }

    fn status(latency_ms: u64, players_online: u32) -> ServerStatus {
        ServerStatus {
            players_online,
            players_max: 100,
            latency_ms,
            version: None,
            motd: None,
        }
    }

    #[test]
    fn test_criterion_from_key() {
        assert_eq!(SortCriterion::from_key("latency"), Some(SortCriterion::ByLatency));
        assert_eq!(SortCriterion::from_key("PING"), Some(SortCriterion::ByLatency));
        assert_eq!(SortCriterion::from_key("players"), Some(SortCriterion::ByPlayerCount));
        assert_eq!(SortCriterion::from_key("alphabetical"), None);
    }

    #[test]
    fn test_concurrency_bounds() {
        // 상한은 min(서버 수, 32), 하한은 서버 수가 충분하면 4
        for count in [1, 2, 4, 5, 16, 100] {
            let limit = probe_concurrency(count, None);
            assert!(limit <= count.min(32), "limit {} for {} servers", limit, count);
            if count >= 4 {
                assert!(limit >= 4, "limit {} for {} servers", limit, count);
            }
        }
        assert_eq!(probe_concurrency(0, None), 1);
        assert_eq!(probe_concurrency(100, Some(8)), 8);
        assert_eq!(probe_concurrency(100, Some(500)), 32);
    }

    #[test]
    fn test_rank_by_latency() {
        let servers = vec![record("a"), record("b"), record("c"), record("d"), record("e")];
        let mut measured = HashMap::new();
        measured.insert(servers[0].id, status(10, 0));
        measured.insert(servers[1].id, status(50, 0));
        measured.insert(servers[2].id, status(5, 0));
        // d, e는 측정 없음

        let ordered = rank(servers, &measured, SortCriterion::ByLatency);
        let names: Vec<&str> = ordered.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["c", "a", "b", "d", "e"]);
    }

    #[test]
    fn test_rank_by_players_unmeasured_below_zero() {
        let servers = vec![record("empty"), record("busy"), record("down")];
        let mut measured = HashMap::new();
        measured.insert(servers[0].id, status(20, 0));
        measured.insert(servers[1].id, status(20, 7));
        // down은 측정 없음 — 접속자 0명인 서버보다도 뒤

        let ordered = rank(servers, &measured, SortCriterion::ByPlayerCount);
        let names: Vec<&str> = ordered.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["busy", "empty", "down"]);
    }

    #[test]
    fn test_rank_unmeasured_keeps_input_order() {
        let servers: Vec<ServerRecord> = ["one", "two", "three", "four"]
            .iter()
            .map(|n| record(n))
            .collect();
        let measured = HashMap::new();

        let ordered = rank(servers.clone(), &measured, SortCriterion::ByLatency);
        let names: Vec<&str> = ordered.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["one", "two", "three", "four"]);

        let ordered = rank(servers, &measured, SortCriterion::ByPlayerCount);
        let names: Vec<&str> = ordered.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["one", "two", "three", "four"]);
    }
}
