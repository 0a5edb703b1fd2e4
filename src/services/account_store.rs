//! Flat-file account store.
//!
//! Accounts provisioned by the external registration tooling land in a
//! pipe-delimited text file, one record per line:
//!
//! `email|password|created_at|platform|access_token|refresh_token|token_expires|refresh_expires`
//!
//! The gateway reads this file at startup to build the token pool. Writes
//! are whole-file rewrites serialized behind a process-wide mutex; the store
//! has no row-level update primitive.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

/// Fixed comment header re-emitted at the top of the file on every save.
const FILE_HEADER: &str = "\
# CodeBuddy account pool
# format: email|password|created_at|platform|access_token|refresh_token|token_expires|refresh_expires
# =========================================================================================================
";

/// One provisioned upstream account. `email` is the stable identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountRecord {
    pub email: String,
    pub password: String,
    pub created_at: String,
    pub platform: String,
    pub access_token: String,
    pub refresh_token: String,
    pub token_expires: String,
    pub refresh_expires: String,
}

impl AccountRecord {
    /// Parse a data line. Lines with fewer than four fields are rejected;
    /// trailing fields default to empty.
    fn parse_line(line: &str) -> Option<Self> {
        let parts: Vec<&str> = line.split('|').collect();
        if parts.len() < 4 {
            return None;
        }

        let field = |i: usize| parts.get(i).map(|s| s.trim()).unwrap_or("").to_string();

        Some(Self {
            email: field(0),
            password: field(1),
            created_at: field(2),
            platform: field(3),
            access_token: field(4),
            refresh_token: field(5),
            token_expires: field(6),
            refresh_expires: field(7),
        })
    }

    fn to_line(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}|{}|{}|{}",
            self.email,
            self.password,
            self.created_at,
            self.platform,
            self.access_token,
            self.refresh_token,
            self.token_expires,
            self.refresh_expires
        )
    }
}

/// Handle on the account file. Cheap to share behind an `Arc`.
#[derive(Debug)]
pub struct AccountStore {
    path: PathBuf,
    // Serializes the whole read-modify-write cycle; see `upsert`.
    write_lock: Mutex<()>,
}

impl AccountStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every record from the file, in order. Blank lines, comment lines
    /// and malformed lines (fewer than four fields) are skipped, not fatal.
    pub async fn load(&self) -> Result<Vec<AccountRecord>> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read account file: {}", self.path.display()))?;

        let mut records = Vec::new();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match AccountRecord::parse_line(line) {
                Some(record) => records.push(record),
                None => {
                    tracing::warn!(line = %line, "Skipping malformed account line");
                }
            }
        }

        tracing::debug!(
            count = records.len(),
            path = %self.path.display(),
            "Loaded account records"
        );
        Ok(records)
    }

    /// Rewrite the whole file from `records`, header first, in order.
    pub async fn save(&self, records: &[AccountRecord]) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.save_locked(records).await
    }

    /// Replace the record whose `email` matches, then re-save the full set.
    /// A record with an unknown email is appended rather than dropped so the
    /// provisioning process never loses an account.
    pub async fn upsert(&self, record: AccountRecord) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        let mut records = self.load().await?;
        match records.iter_mut().find(|r| r.email == record.email) {
            Some(existing) => *existing = record,
            None => records.push(record),
        }

        self.save_locked(&records).await
    }

    /// Ordered distinct non-empty access tokens, for pool initialization.
    pub async fn tokens(&self) -> Result<Vec<String>> {
        let records = self.load().await?;
        let mut tokens = Vec::new();
        for record in records {
            if !record.access_token.is_empty() && !tokens.contains(&record.access_token) {
                tokens.push(record.access_token);
            }
        }
        Ok(tokens)
    }

    async fn save_locked(&self, records: &[AccountRecord]) -> Result<()> {
        let mut content = String::from(FILE_HEADER);
        for record in records {
            content.push_str(&record.to_line());
            content.push('\n');
        }

        // Write to a sibling temp file then rename, so a crash mid-write
        // never truncates the store.
        let tmp_path = self.path.with_extension("tmp");
        tokio::fs::write(&tmp_path, content.as_bytes())
            .await
            .with_context(|| format!("Failed to write account file: {}", tmp_path.display()))?;
        tokio::fs::rename(&tmp_path, &self.path)
            .await
            .with_context(|| format!("Failed to replace account file: {}", self.path.display()))?;

        tracing::debug!(
            count = records.len(),
            path = %self.path.display(),
            "Saved account records"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(email: &str, token: &str) -> AccountRecord {
        AccountRecord {
            email: email.to_string(),
            password: "pw".to_string(),
            created_at: "2025-01-01 00:00:00".to_string(),
            platform: "outlook".to_string(),
            access_token: token.to_string(),
            refresh_token: String::new(),
            token_expires: String::new(),
            refresh_expires: String::new(),
        }
    }

    fn store_in(dir: &TempDir) -> AccountStore {
        AccountStore::new(dir.path().join("accounts.txt"))
    }

    #[tokio::test]
    async fn test_save_and_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        let records = vec![record("a@example.com", "tok-a"), record("b@example.com", "tok-b")];
        store.save(&records).await.unwrap();

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded, records);
    }

    #[tokio::test]
    async fn test_load_skips_comments_and_blank_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("accounts.txt");
        tokio::fs::write(
            &path,
            "# header\n\n# more comments\na@x.com|pw|2025|outlook|tok\n\n",
        )
        .await
        .unwrap();

        let store = AccountStore::new(&path);
        let loaded = store.load().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].email, "a@x.com");
        assert_eq!(loaded[0].access_token, "tok");
        assert_eq!(loaded[0].refresh_token, "");
    }

    #[tokio::test]
    async fn test_load_skips_malformed_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("accounts.txt");
        tokio::fs::write(&path, "only|three|fields\na@x.com|pw|2025|outlook\n")
            .await
            .unwrap();

        let store = AccountStore::new(&path);
        let loaded = store.load().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].email, "a@x.com");
    }

    #[tokio::test]
    async fn test_short_line_defaults_trailing_fields() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("accounts.txt");
        tokio::fs::write(&path, "a@x.com|pw|2025|outlook|tok|refresh\n")
            .await
            .unwrap();

        let store = AccountStore::new(&path);
        let loaded = store.load().await.unwrap();
        assert_eq!(loaded[0].refresh_token, "refresh");
        assert_eq!(loaded[0].token_expires, "");
        assert_eq!(loaded[0].refresh_expires, "");
    }

    #[tokio::test]
    async fn test_save_emits_header_block() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store.save(&[record("a@x.com", "tok")]).await.unwrap();

        let content = tokio::fs::read_to_string(store.path()).await.unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert!(lines[0].starts_with('#'));
        assert!(lines[1].starts_with('#'));
        assert!(lines[2].starts_with('#'));
        assert!(lines[3].starts_with("a@x.com|"));
    }

    #[tokio::test]
    async fn test_upsert_replaces_by_email_without_duplicating() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store
            .save(&[record("a@x.com", "old"), record("b@x.com", "tok-b")])
            .await
            .unwrap();

        store.upsert(record("a@x.com", "new")).await.unwrap();

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].email, "a@x.com");
        assert_eq!(loaded[0].access_token, "new");
        assert_eq!(loaded[1].access_token, "tok-b");
    }

    #[tokio::test]
    async fn test_upsert_appends_unknown_email() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store.save(&[record("a@x.com", "tok-a")]).await.unwrap();

        store.upsert(record("c@x.com", "tok-c")).await.unwrap();

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[1].email, "c@x.com");
    }

    #[tokio::test]
    async fn test_tokens_deduplicates_and_skips_empty() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store
            .save(&[
                record("a@x.com", "tok-1"),
                record("b@x.com", ""),
                record("c@x.com", "tok-1"),
                record("d@x.com", "tok-2"),
            ])
            .await
            .unwrap();

        let tokens = store.tokens().await.unwrap();
        assert_eq!(tokens, vec!["tok-1".to_string(), "tok-2".to_string()]);
    }

    #[tokio::test]
    async fn test_load_missing_file_is_error() {
        let dir = TempDir::new().unwrap();
        let store = AccountStore::new(dir.path().join("missing.txt"));
        assert!(store.load().await.is_err());
    }
}
