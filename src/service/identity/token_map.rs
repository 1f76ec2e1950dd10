//! Persistent credential map
//!
//! An append-only text file with one `token<TAB>user_id` record per line.
//! Later lines win; a record with an empty user id removes the token.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use matrixon_gateway_core::Result;
use ruma::{OwnedUserId, UserId};
use tokio::{
    fs::{self, OpenOptions},
    io::AsyncWriteExt,
    sync::Mutex,
};
use tracing::{debug, warn};

pub struct TokenMap {
    path: PathBuf,
    /// Serializes appends from concurrent lookups
    write_lock: Mutex<()>,
}

impl TokenMap {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replays the log. A missing file is an empty map.
    pub async fn load(&self) -> Result<HashMap<String, OwnedUserId>> {
        let contents = match fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("📁 No token map at {}, starting empty", self.path.display());
                return Ok(HashMap::new());
            }
            Err(e) => return Err(e.into()),
        };

        let mut map = HashMap::new();
        for (number, line) in contents.lines().enumerate() {
            let Some((token, user_id)) = line.split_once('\t') else {
                if !line.trim().is_empty() {
                    warn!("⚠️ Ignoring malformed token map line {}", number + 1);
                }
                continue;
            };
            if token.is_empty() {
                continue;
            }
            if user_id.is_empty() {
                map.remove(token);
                continue;
            }
            match UserId::parse(user_id) {
                Ok(user_id) => {
                    map.insert(token.to_owned(), user_id);
                }
                Err(e) => warn!("⚠️ Ignoring token map line {}: {}", number + 1, e),
            }
        }
        Ok(map)
    }

    /// Appends one record; `None` writes a removal.
    pub async fn append(&self, token: &str, user_id: Option<&UserId>) -> Result<()> {
        let line = format!("{}\t{}\n", token, user_id.map(UserId::as_str).unwrap_or(""));

        let _guard = self.write_lock.lock().await;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ruma::user_id;
    use test_log::test;

    #[test(tokio::test)]
    async fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let map = TokenMap::new(dir.path().join("token_map"));
        assert!(map.load().await.unwrap().is_empty());
    }

    #[test(tokio::test)]
    async fn test_later_lines_win_and_tombstones_remove() {
        let dir = tempfile::tempdir().unwrap();
        let map = TokenMap::new(dir.path().join("token_map"));
        map.append("tok_a", Some(user_id!("@alice:example.org"))).await.unwrap();
        map.append("tok_b", Some(user_id!("@bob:example.org"))).await.unwrap();
        map.append("tok_b", None).await.unwrap();
        map.append("tok_a", Some(user_id!("@alice:other.example"))).await.unwrap();

        let loaded = map.load().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded["tok_a"].as_str(), "@alice:other.example");
    }

    #[test(tokio::test)]
    async fn test_garbage_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token_map");
        tokio::fs::write(&path, "no tab here\ntok\tnot-a-user\n\ntok_ok\t@carol:example.org\n")
            .await
            .unwrap();
        let loaded = TokenMap::new(path).load().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert!(loaded.contains_key("tok_ok"));
    }
}
