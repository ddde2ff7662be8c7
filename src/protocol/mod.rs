pub mod slp;

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

pub use slp::SlpClient;

/// 프로브 통신 오류 타입
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("Connection failed: {0}")]
    ConnectionError(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("Malformed status response: {0}")]
    MalformedResponse(String),

    #[error("Rate limited by {0}")]
    RateLimited(String),

    #[error("Invalid server address: {0}")]
    InvalidAddress(String),
}

/// 프로브 1회에 적용되는 타임아웃
///
/// `connect`는 TCP 연결 수립까지, `probe`는 핸드셰이크부터 응답 수신까지
/// 전체 교환에 적용된다. `probe` 값은 프로빙 단계 카운트다운의 기준이기도 하다.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeTimeouts {
    pub connect: Duration,
    pub probe: Duration,
}

impl Default for ProbeTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(5),
            probe: Duration::from_secs(30),
        }
    }
}

/// 프로브 성공 시 얻는 서버 상태 스냅샷
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerStatus {
    pub players_online: u32,
    pub players_max: u32,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub motd: Option<String>,
}

/// 서버 상태 조회 서비스
///
/// 파이프라인은 이 트레이트에만 의존한다. 성공 외의 모든 결과(타임아웃,
/// 연결 실패, 프로토콜 오류, rate limit)는 랭킹 시 "측정 없음"으로 취급된다.
pub trait StatusProbe: Send + Sync {
    fn probe(
        &self,
        address: &str,
        timeouts: ProbeTimeouts,
    ) -> impl Future<Output = Result<ServerStatus, ProbeError>> + Send;
}
