pub mod config;
pub mod pipeline;  // 프로브 → 랭킹 → 영속화 정렬 파이프라인
pub mod protocol;  // Server List Ping 클라이언트
pub mod server_list;
pub mod watcher;
