//! 서버 목록 파일 변경 감시 — mtime/크기 폴링
//!
//! 외부 편집(다른 프로세스, 수동 수정)을 감지해 구독자에게 세대 번호를
//! 브로드캐스트한다. 파일이 없는 상태는 오류가 아니며, 다시 나타나면
//! 변경으로 통지한다.

use std::path::PathBuf;
use std::time::{Duration, SystemTime};
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// 서버 목록 파일 감시자
pub struct ListWatcher {
    path: PathBuf,
    poll_interval: Duration,
}

/// 실행 중인 감시 태스크 핸들
pub struct WatcherHandle {
    generations: watch::Receiver<u64>,
    stop: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

impl ListWatcher {
    pub fn new(path: impl Into<PathBuf>, poll_interval: Duration) -> Self {
        Self {
            path: path.into(),
            poll_interval,
        }
    }

    /// 감시 태스크 시작
    pub fn spawn(self) -> WatcherHandle {
        let (tx, rx) = watch::channel(0u64);
        let stop = CancellationToken::new();
        let task = tokio::spawn(watch_loop(self.path, self.poll_interval, tx, stop.clone()));
        WatcherHandle {
            generations: rx,
            stop,
            task,
        }
    }
}

impl WatcherHandle {
    /// 변경 세대 번호 구독
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.generations.clone()
    }

    /// 감시 중지 및 태스크 종료 대기
    pub async fn stop(self) {
        self.stop.cancel();
        let _ = self.task.await;
    }
}

async fn watch_loop(
    path: PathBuf,
    poll_interval: Duration,
    tx: watch::Sender<u64>,
    stop: CancellationToken,
) {
    tracing::info!(
        "[Watcher] Watching {} (poll every {:?})",
        path.display(),
        poll_interval
    );

    let mut ticker = interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    // (mtime, 크기) 쌍 — mtime 해상도가 거친 파일시스템 대비
    let mut last: Option<(SystemTime, u64)> = None;
    let mut primed = false;
    let mut generation = 0u64;
    let mut error_count = 0u32;

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let observed = match tokio::fs::metadata(&path).await {
            Ok(meta) => match meta.modified() {
                Ok(mtime) => {
                    if error_count > 0 {
                        tracing::info!("[Watcher] Recovered after {} error(s)", error_count);
                        error_count = 0;
                    }
                    Some((mtime, meta.len()))
                }
                Err(e) => {
                    error_count += 1;
                    if error_count <= 3 || error_count % 10 == 0 {
                        tracing::error!(
                            "[Watcher] Failed to read mtime of {} (count: {}): {}",
                            path.display(),
                            error_count,
                            e
                        );
                    }
                    continue;
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // 파일 없음은 오류가 아님 — 재생성을 기다린다
                None
            }
            Err(e) => {
                error_count += 1;
                if error_count <= 3 || error_count % 10 == 0 {
                    tracing::error!(
                        "[Watcher] Failed to stat {} (count: {}): {}",
                        path.display(),
                        error_count,
                        e
                    );
                }
                continue;
            }
        };

        if !primed {
            // 최초 관측치는 기준점으로만 삼고 통지하지 않는다
            primed = true;
            last = observed;
            continue;
        }

        if observed != last {
            last = observed;
            if observed.is_some() {
                generation += 1;
                tracing::debug!("[Watcher] Change detected (generation {})", generation);
                let _ = tx.send(generation);
            }
        }
    }

    tracing::info!("[Watcher] Stopped");
}
