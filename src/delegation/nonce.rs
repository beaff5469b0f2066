//! Nonce ledger
//!
//! Tracks consumed nonces per (system id, signer). Check-and-consume is a
//! single atomic step in both implementations, so two requests presenting
//! the same nonce can never both pass.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashSet;
use ethabi::ethereum_types::U256;
use ethabi::Address;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::types::SystemId;
use crate::chain::types::{format_address, parse_address};
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct NonceKey {
    system_id: SystemId,
    signer: Address,
    nonce: U256,
}

/// Replay protection store
#[async_trait]
pub trait NonceLedger: Send + Sync {
    /// Record `nonce` as consumed, or fail with `NonceReused` without mutating
    async fn check_and_consume(&self, system_id: &SystemId, signer: &Address, nonce: U256)
        -> Result<()>;

    /// Consumed nonces for one (system id, signer), ascending
    async fn consumed(&self, system_id: &SystemId, signer: &Address) -> Result<Vec<U256>>;
}

fn reused(nonce: U256) -> Error {
    Error::NonceReused {
        nonce: nonce.to_string(),
    }
}

/// Process-local ledger
#[derive(Debug, Default)]
pub struct InMemoryNonceLedger {
    seen: DashSet<NonceKey>,
}

impl InMemoryNonceLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl NonceLedger for InMemoryNonceLedger {
    async fn check_and_consume(
        &self,
        system_id: &SystemId,
        signer: &Address,
        nonce: U256,
    ) -> Result<()> {
        let inserted = self.seen.insert(NonceKey {
            system_id: *system_id,
            signer: *signer,
            nonce,
        });
        if !inserted {
            return Err(reused(nonce));
        }
        Ok(())
    }

    async fn consumed(&self, system_id: &SystemId, signer: &Address) -> Result<Vec<U256>> {
        let mut nonces: Vec<U256> = self
            .seen
            .iter()
            .filter(|key| key.system_id == *system_id && key.signer == *signer)
            .map(|key| key.nonce)
            .collect();
        nonces.sort();
        Ok(nonces)
    }
}

/// One line of the ledger file
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NonceEntry {
    system_id: String,
    signer: String,
    nonce: String,
    consumed_at: DateTime<Utc>,
}

impl NonceEntry {
    fn key(&self) -> Result<NonceKey> {
        let raw = hex::decode(self.system_id.trim_start_matches("0x"))
            .map_err(|e| Error::Persistence(format!("ledger systemId: {}", e)))?;
        let system_id: [u8; 32] = raw
            .as_slice()
            .try_into()
            .map_err(|_| Error::Persistence("ledger systemId must be 32 bytes".to_string()))?;
        let signer = parse_address(&self.signer)
            .map_err(|e| Error::Persistence(format!("ledger signer: {}", e)))?;
        let nonce = U256::from_dec_str(&self.nonce)
            .map_err(|e| Error::Persistence(format!("ledger nonce: {:?}", e)))?;
        Ok(NonceKey {
            system_id: SystemId(system_id),
            signer,
            nonce,
        })
    }
}

struct FileLedgerState {
    index: HashSet<NonceKey>,
    file: tokio::fs::File,
}

/// Durable ledger: JSON-lines append log plus an in-memory index
///
/// Each consumption is fsynced before it is acknowledged. The lock covers
/// one process; several processes must not share a ledger file.
pub struct FileNonceLedger {
    path: PathBuf,
    state: Mutex<FileLedgerState>,
}

impl FileNonceLedger {
    /// Open (or create) the ledger at `path` and rebuild the index
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let mut index = HashSet::new();
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => {
                let lines: Vec<&str> = content.lines().filter(|l| !l.trim().is_empty()).collect();
                let mut kept: Vec<&str> = Vec::with_capacity(lines.len());
                for (i, line) in lines.iter().enumerate() {
                    let parsed = serde_json::from_str::<NonceEntry>(line)
                        .map_err(Error::from)
                        .and_then(|entry| entry.key());
                    match parsed {
                        Ok(key) => {
                            index.insert(key);
                            kept.push(line);
                        }
                        // Torn write: the append was never acknowledged
                        Err(e) => warn!(
                            path = %path.display(),
                            line = i + 1,
                            "Dropping unreadable ledger line: {}",
                            e
                        ),
                    }
                }

                if kept.len() != lines.len() {
                    tokio::fs::write(&path, kept.join("\n"))
                        .await
                        .map_err(|e| Error::Persistence(format!("ledger repair: {}", e)))?;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        info!(path = %path.display(), entries = index.len(), "Nonce ledger opened");

        Ok(Self {
            path,
            state: Mutex::new(FileLedgerState { index, file }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

async fn append_synced(file: &mut tokio::fs::File, line: &[u8]) -> Result<()> {
    file.write_all(line)
        .await
        .map_err(|e| Error::Persistence(format!("ledger append: {}", e)))?;
    file.sync_data()
        .await
        .map_err(|e| Error::Persistence(format!("ledger fsync: {}", e)))
}

#[async_trait]
impl NonceLedger for FileNonceLedger {
    async fn check_and_consume(
        &self,
        system_id: &SystemId,
        signer: &Address,
        nonce: U256,
    ) -> Result<()> {
        let key = NonceKey {
            system_id: *system_id,
            signer: *signer,
            nonce,
        };

        let mut state = self.state.lock().await;
        if state.index.contains(&key) {
            return Err(reused(nonce));
        }

        let entry = NonceEntry {
            system_id: system_id.to_hex(),
            signer: format_address(signer),
            nonce: nonce.to_string(),
            consumed_at: Utc::now(),
        };
        let mut line = serde_json::to_vec(&entry)?;
        line.insert(0, b'\n');

        let len_before = state.file.metadata().await?.len();
        if let Err(e) = append_synced(&mut state.file, &line).await {
            // Cut the partial record so later appends never land after it
            if let Err(truncate) = state.file.set_len(len_before).await {
                warn!(path = %self.path.display(), "Ledger truncate after failed append: {}", truncate);
            }
            return Err(e);
        }

        state.index.insert(key);
        debug!(signer = %format_address(signer), %nonce, "Nonce consumed");
        Ok(())
    }

    async fn consumed(&self, system_id: &SystemId, signer: &Address) -> Result<Vec<U256>> {
        let state = self.state.lock().await;
        let mut nonces: Vec<U256> = state
            .index
            .iter()
            .filter(|key| key.system_id == *system_id && key.signer == *signer)
            .map(|key| key.nonce)
            .collect();
        nonces.sort();
        Ok(nonces)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn signer(byte: u8) -> Address {
        Address::from_slice(&[byte; 20])
    }

    async fn assert_replay_rejected(ledger: &dyn NonceLedger) {
        let system = SystemId::from_game_id("game123");
        let nonce = U256::from(7u64);

        ledger
            .check_and_consume(&system, &signer(0xab), nonce)
            .await
            .unwrap();
        let err = ledger
            .check_and_consume(&system, &signer(0xab), nonce)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NonceReused { ref nonce } if nonce == "7"));

        // Same nonce under another signer or system is independent
        ledger
            .check_and_consume(&system, &signer(0xcd), nonce)
            .await
            .unwrap();
        ledger
            .check_and_consume(&SystemId::from_game_id("other"), &signer(0xab), nonce)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_in_memory_rejects_replay() {
        assert_replay_rejected(&InMemoryNonceLedger::new()).await;
    }

    #[tokio::test]
    async fn test_file_ledger_rejects_replay() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = FileNonceLedger::open(dir.path().join("nonces.jsonl"))
            .await
            .unwrap();
        assert_replay_rejected(&ledger).await;
    }

    #[tokio::test]
    async fn test_nonces_need_not_be_sequential() {
        let ledger = InMemoryNonceLedger::new();
        let system = SystemId::from_game_id("g");
        for n in [900u64, 3, 42] {
            ledger
                .check_and_consume(&system, &signer(1), U256::from(n))
                .await
                .unwrap();
        }
        assert_eq!(
            ledger.consumed(&system, &signer(1)).await.unwrap(),
            vec![U256::from(3u64), U256::from(42u64), U256::from(900u64)]
        );
    }

    #[tokio::test]
    async fn test_concurrent_same_nonce_exactly_one_wins() {
        let memory: Arc<dyn NonceLedger> = Arc::new(InMemoryNonceLedger::new());
        let dir = tempfile::tempdir().unwrap();
        let file: Arc<dyn NonceLedger> = Arc::new(
            FileNonceLedger::open(dir.path().join("nonces.jsonl"))
                .await
                .unwrap(),
        );

        for ledger in [memory, file] {
            let system = SystemId::from_game_id("race");
            let handles: Vec<_> = (0..16)
                .map(|_| {
                    let ledger = ledger.clone();
                    tokio::spawn(async move {
                        ledger
                            .check_and_consume(&system, &signer(9), U256::from(1u64))
                            .await
                    })
                })
                .collect();

            let mut wins = 0;
            let mut reused = 0;
            for handle in handles {
                match handle.await.unwrap() {
                    Ok(()) => wins += 1,
                    Err(Error::NonceReused { .. }) => reused += 1,
                    Err(e) => panic!("unexpected error: {}", e),
                }
            }
            assert_eq!(wins, 1);
            assert_eq!(reused, 15);
        }
    }

    #[tokio::test]
    async fn test_file_ledger_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("nonces.jsonl");
        let system = SystemId::from_game_id("game123");

        {
            let ledger = FileNonceLedger::open(&path).await.unwrap();
            ledger
                .check_and_consume(&system, &signer(2), U256::from(7u64))
                .await
                .unwrap();
        }

        let reopened = FileNonceLedger::open(&path).await.unwrap();
        assert!(matches!(
            reopened
                .check_and_consume(&system, &signer(2), U256::from(7u64))
                .await,
            Err(Error::NonceReused { .. })
        ));
        assert_eq!(
            reopened.consumed(&system, &signer(2)).await.unwrap(),
            vec![U256::from(7u64)]
        );
    }

    #[tokio::test]
    async fn test_file_ledger_ignores_torn_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nonces.jsonl");
        let system = SystemId::from_game_id("g");

        {
            let ledger = FileNonceLedger::open(&path).await.unwrap();
            ledger
                .check_and_consume(&system, &signer(3), U256::from(1u64))
                .await
                .unwrap();
        }
        let mut content = std::fs::read_to_string(&path).unwrap();
        content.push_str("\n{\"systemId\":\"0x12");
        std::fs::write(&path, content).unwrap();

        let ledger = FileNonceLedger::open(&path).await.unwrap();
        assert_eq!(ledger.consumed(&system, &signer(3)).await.unwrap().len(), 1);
        ledger
            .check_and_consume(&system, &signer(3), U256::from(2u64))
            .await
            .unwrap();

        let reopened = FileNonceLedger::open(&path).await.unwrap();
        assert_eq!(reopened.consumed(&system, &signer(3)).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_file_ledger_reopens_with_torn_line_mid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nonces.jsonl");
        let system = SystemId::from_game_id("g");

        {
            let ledger = FileNonceLedger::open(&path).await.unwrap();
            ledger
                .check_and_consume(&system, &signer(4), U256::from(1u64))
                .await
                .unwrap();
        }
        // A partial record followed by a later, complete append
        let mut content = std::fs::read_to_string(&path).unwrap();
        content.push_str("\n{\"systemId\":\"0x12");
        std::fs::write(&path, content).unwrap();
        {
            let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
            let entry = NonceEntry {
                system_id: system.to_hex(),
                signer: format_address(&signer(4)),
                nonce: "2".to_string(),
                consumed_at: Utc::now(),
            };
            std::io::Write::write_all(
                &mut file,
                format!("\n{}", serde_json::to_string(&entry).unwrap()).as_bytes(),
            )
            .unwrap();
        }

        let ledger = FileNonceLedger::open(&path).await.unwrap();
        assert_eq!(
            ledger.consumed(&system, &signer(4)).await.unwrap(),
            vec![U256::from(1u64), U256::from(2u64)]
        );
        let err = ledger
            .check_and_consume(&system, &signer(4), U256::from(2u64))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NonceReused { .. }));
        ledger
            .check_and_consume(&system, &signer(4), U256::from(3u64))
            .await
            .unwrap();
        drop(ledger);

        let reopened = FileNonceLedger::open(&path).await.unwrap();
        assert_eq!(reopened.consumed(&system, &signer(4)).await.unwrap().len(), 3);
        assert!(!std::fs::read_to_string(&path).unwrap().contains("\"0x12\n"));
    }
}
