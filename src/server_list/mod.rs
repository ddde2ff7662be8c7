pub mod history;

use crate::protocol::ServerStatus;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

use history::EditHistory;

/// 되돌리기 스택 깊이
const HISTORY_DEPTH: usize = 64;

/// 서버 목록 저장소 작업 중 발생할 수 있는 에러 유형
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Server '{0}' not found")]
    NotFound(Uuid),

    #[error("Server id '{0}' already exists")]
    DuplicateId(Uuid),

    #[error("Ordering is not a permutation of the stored list")]
    NotAPermutation,

    #[error("{0}")]
    Internal(#[from] anyhow::Error),
}

/// 서버 북마크 — 사용자가 추가한 멀티플레이 서버 항목
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerRecord {
    pub id: Uuid,          // 고유 ID
    pub name: String,      // 사용자 지정 이름 (예: "Hypixel")
    pub address: String,   // host[:port], 포트 생략 시 25565
    /// 최근 프로브 결과 — 메모리에만 유지, 파일에는 저장하지 않음
    #[serde(skip)]
    pub status: Option<ServerStatus>,
}

impl ServerRecord {
    pub fn new(name: &str, address: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            address: address.to_string(),
            status: None,
        }
    }
}

/// 서버 목록 저장소 - servers.json 관리
pub struct ServerListStore {
    file_path: PathBuf,
    servers: Vec<ServerRecord>,
    history: EditHistory<Vec<ServerRecord>>,
}

impl ServerListStore {
    pub fn new(file_path: impl Into<PathBuf>) -> Self {
        Self {
            file_path: file_path.into(),
            servers: Vec::new(),
            history: EditHistory::new(HISTORY_DEPTH),
        }
    }

    /// 파일에서 서버 목록 로드. 파일이 없으면 빈 목록으로 시작.
    pub fn load(&mut self) -> Result<(), StoreError> {
        if !self.file_path.exists() {
            tracing::info!(
                "Server list file does not exist, starting empty: {}",
                self.file_path.display()
            );
            self.servers = Vec::new();
            self.history.clear();
            return Ok(());
        }

        let content = fs::read_to_string(&self.file_path)
            .with_context(|| format!("Failed to read {}", self.file_path.display()))?;
        self.servers = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", self.file_path.display()))?;
        self.history.clear();
        tracing::info!("Loaded {} server(s)", self.servers.len());
        Ok(())
    }

    /// 파일에 서버 목록 저장 — 임시 파일에 쓴 뒤 원자적으로 교체
    pub fn save(&self) -> Result<(), StoreError> {
        let content = serde_json::to_string_pretty(&self.servers)
            .context("Failed to serialize server list")?;

        let dir = self
            .file_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .with_context(|| format!("Failed to create temp file in {}", dir.display()))?;
        tmp.write_all(content.as_bytes())
            .context("Failed to write server list")?;
        tmp.persist(&self.file_path)
            .with_context(|| format!("Failed to replace {}", self.file_path.display()))?;

        tracing::info!(
            "Saved {} server(s) to {}",
            self.servers.len(),
            self.file_path.display()
        );
        Ok(())
    }

    /// 서버 추가
    pub fn add(&mut self, record: ServerRecord) -> Result<(), StoreError> {
        if self.servers.iter().any(|s| s.id == record.id) {
            return Err(StoreError::DuplicateId(record.id));
        }
        self.checkpoint();
        tracing::info!("Added server '{}' ({})", record.name, record.address);
        self.servers.push(record);
        self.save()
    }

    /// 서버 제거
    pub fn remove(&mut self, id: Uuid) -> Result<(), StoreError> {
        if !self.servers.iter().any(|s| s.id == id) {
            return Err(StoreError::NotFound(id));
        }
        self.checkpoint();
        self.servers.retain(|s| s.id != id);
        self.save()
    }

    /// 서버 수정. id는 저장소가 소유하며 변경되지 않는다.
    pub fn update(&mut self, id: Uuid, mut record: ServerRecord) -> Result<(), StoreError> {
        let pos = self
            .servers
            .iter()
            .position(|s| s.id == id)
            .ok_or(StoreError::NotFound(id))?;
        self.checkpoint();
        record.id = id;
        self.servers[pos] = record;
        self.save()
    }

    /// 수동 순서 변경 — 항목을 새 위치로 이동
    pub fn move_entry(&mut self, id: Uuid, new_index: usize) -> Result<(), StoreError> {
        let pos = self
            .servers
            .iter()
            .position(|s| s.id == id)
            .ok_or(StoreError::NotFound(id))?;
        self.checkpoint();
        let record = self.servers.remove(pos);
        let new_index = new_index.min(self.servers.len());
        self.servers.insert(new_index, record);
        self.save()
    }

    /// 정렬 파이프라인의 영속화 싱크 — 전체 순서를 교체하고 커밋
    ///
    /// 입력이 기존 목록의 순열이 아니면 거부한다.
    pub fn apply_order(&mut self, ordered: Vec<ServerRecord>) -> Result<(), StoreError> {
        if ordered.len() != self.servers.len() {
            return Err(StoreError::NotAPermutation);
        }
        let mut seen = HashSet::with_capacity(ordered.len());
        for record in &ordered {
            if !seen.insert(record.id) || !self.servers.iter().any(|s| s.id == record.id) {
                return Err(StoreError::NotAPermutation);
            }
        }
        self.checkpoint();
        self.servers = ordered;
        self.save()
    }

    /// 서버 조회
    pub fn get(&self, id: Uuid) -> Option<&ServerRecord> {
        self.servers.iter().find(|s| s.id == id)
    }

    /// 모든 서버 조회
    pub fn list(&self) -> &[ServerRecord] {
        &self.servers
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    /// 직전 변경 되돌리기. 이력이 없으면 false.
    pub fn undo(&mut self) -> Result<bool, StoreError> {
        match self.history.undo(self.servers.clone()) {
            Some(previous) => {
                self.servers = previous;
                self.save()?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// 되돌린 변경 다시 적용. 이력이 없으면 false.
    pub fn redo(&mut self) -> Result<bool, StoreError> {
        match self.history.redo(self.servers.clone()) {
            Some(next) => {
                self.servers = next;
                self.save()?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn can_undo(&self) -> bool {
        self.history.can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.history.can_redo()
    }

    fn checkpoint(&mut self) {
        self.history.record(self.servers.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_store() -> (tempfile::TempDir, ServerListStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ServerListStore::new(dir.path().join("servers.json"));
        (dir, store)
    }

    #[test]
    fn test_record_ids_unique() {
        let a = ServerRecord::new("one", "one.example.net");
        let b = ServerRecord::new("one", "one.example.net");
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_add_and_get() {
        let (_dir, mut store) = scratch_store();
        let record = ServerRecord::new("main", "mc.example.net");
        let id = record.id;
        store.add(record).unwrap();

        assert_eq!(store.len(), 1);
        assert_eq!(store.get(id).unwrap().name, "main");
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let (_dir, mut store) = scratch_store();
        let record = ServerRecord::new("main", "mc.example.net");
        store.add(record.clone()).unwrap();

        let result = store.add(record);
        assert!(matches!(result, Err(StoreError::DuplicateId(_))));
    }

    #[test]
    fn test_remove_missing() {
        let (_dir, mut store) = scratch_store();
        let result = store.remove(Uuid::new_v4());
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[test]
    fn test_update_keeps_id() {
        let (_dir, mut store) = scratch_store();
        let record = ServerRecord::new("old", "old.example.net");
        let id = record.id;
        store.add(record).unwrap();

        let replacement = ServerRecord::new("new", "new.example.net");
        store.update(id, replacement).unwrap();

        let updated = store.get(id).unwrap();
        assert_eq!(updated.id, id);
        assert_eq!(updated.name, "new");
    }

    #[test]
    fn test_move_entry() {
        let (_dir, mut store) = scratch_store();
        for name in ["a", "b", "c"] {
            store
                .add(ServerRecord::new(name, &format!("{}.example.net", name)))
                .unwrap();
        }
        let id_c = store.list()[2].id;
        store.move_entry(id_c, 0).unwrap();

        let names: Vec<&str> = store.list().iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["c", "a", "b"]);
    }

    #[test]
    fn test_status_not_persisted() {
        let record = ServerRecord {
            status: Some(ServerStatus {
                players_online: 3,
                players_max: 20,
                latency_ms: 40,
                version: None,
                motd: None,
            }),
            ..ServerRecord::new("main", "mc.example.net")
        };
        let json = serde_json::to_string(&record).unwrap();
        assert!(!json.contains("players_online"));

        let back: ServerRecord = serde_json::from_str(&json).unwrap();
        assert!(back.status.is_none());
    }
}
