//! File-backed degraded store
//!
//! The whole collection lives in one JSON array. Writes are
//! read-modify-write under the write lock and land through a sibling temp
//! file renamed over the target, so readers never see a partial file.

use std::path::{Path, PathBuf};

use chrono::Utc;
use idp_core::{ManagedUserRecord, NewUser, OWNER_ATTRIBUTE, UserPatch};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{Error, Result};

/// Owner of the seeded placeholder records
pub const PLACEHOLDER_OWNER: &str = "00000000-0000-0000-0000-000000000000";

/// Role label given to records created in degraded mode
pub const DEFAULT_ROLE: &str = "student";

/// (first name, last name, email, enabled, gender, birth date, phone)
const SEEDS: [(&str, &str, &str, bool, &str, &str, &str); 3] = [
    ("Juan (Example)", "Perez", "student1@example.com", true, "male", "1995-05-15", "+56 9 1234 5678"),
    ("Maria (Example)", "Gonzalez", "student2@example.com", true, "female", "1997-08-22", "+56 9 8765 4321"),
    ("Carlos (Example)", "Rodriguez", "student3@example.com", false, "male", "1996-03-10", ""),
];

fn seed_records() -> Vec<ManagedUserRecord> {
    let now = Utc::now().timestamp_millis();
    SEEDS
        .iter()
        .enumerate()
        .map(|(i, (first, last, email, enabled, gender, birth, phone))| {
            let input = NewUser {
                email: (*email).to_string(),
                first_name: (*first).to_string(),
                last_name: (*last).to_string(),
                enabled: Some(*enabled),
                gender: Some((*gender).to_string()),
                birthdate: Some((*birth).to_string()),
                phone_number: Some((*phone).to_string()),
                ..NewUser::default()
            };
            let mut record =
                input.to_record(format!("seed-{}", i + 1), PLACEHOLDER_OWNER, PLACEHOLDER_OWNER, now);
            record.role = Some(DEFAULT_ROLE.to_string());
            record
        })
        .collect()
}

/// Illustrative record returned to an owner with nothing stored
fn synthesized_example(owner: &str) -> ManagedUserRecord {
    let input = NewUser {
        email: "example@example.com".to_string(),
        first_name: "Example".to_string(),
        last_name: "for current user".to_string(),
        gender: Some(String::new()),
        ..NewUser::default()
    };
    let suffix = Uuid::new_v4().simple().to_string();
    let mut record = input.to_record(
        format!("example-{}", &suffix[..8]),
        owner,
        owner,
        Utc::now().timestamp_millis(),
    );
    record.role = Some(DEFAULT_ROLE.to_string());
    record
}

/// Degraded-mode user store
#[derive(Debug)]
pub struct DegradedStore {
    path: PathBuf,
    synthesize_example: bool,
    lock: RwLock<()>,
}

impl DegradedStore {
    /// Open the store at `path`, seeding placeholder records when the file is
    /// missing or empty.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Persistence`] when the directory or seed file cannot
    /// be written.
    pub async fn open(path: impl Into<PathBuf>, synthesize_example: bool) -> Result<Self> {
        let store = Self {
            path: path.into(),
            synthesize_example,
            lock: RwLock::new(()),
        };

        if let Some(parent) = store.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| store.persistence("create directory", &e))?;
        }

        let guard = store.lock.write().await;
        if store.read_raw().await?.is_none() {
            let seeds = seed_records();
            store.write_all(&seeds).await?;
            info!(path = %store.path.display(), records = seeds.len(), "Seeded degraded store");
        }
        drop(guard);

        Ok(store)
    }

    /// Backing file
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Records owned by `owner`. When none exist and synthesis is enabled,
    /// one illustrative record stamped with `owner` is returned (not stored).
    pub async fn list(&self, owner: &str) -> Result<Vec<ManagedUserRecord>> {
        let _guard = self.lock.read().await;
        let mut owned: Vec<_> = self
            .read_all()
            .await?
            .into_iter()
            .filter(|r| r.owner() == Some(owner))
            .collect();

        if owned.is_empty() && self.synthesize_example {
            debug!(owner = %owner, "No stored records, returning synthesized example");
            owned.push(synthesized_example(owner));
        }
        Ok(owned)
    }

    /// Every stored record
    pub async fn all(&self) -> Result<Vec<ManagedUserRecord>> {
        let _guard = self.lock.read().await;
        self.read_all().await
    }

    /// Record by id
    pub async fn get(&self, id: &str) -> Result<Option<ManagedUserRecord>> {
        let _guard = self.lock.read().await;
        Ok(self.read_all().await?.into_iter().find(|r| r.id == id))
    }

    /// Store a new record owned by `owner`. The professor defaults to the owner.
    pub async fn create(&self, input: &NewUser, owner: &str) -> Result<ManagedUserRecord> {
        let _guard = self.lock.write().await;
        let mut records = self.read_all().await?;

        let professor = input
            .professor_id
            .as_deref()
            .filter(|p| !p.is_empty())
            .unwrap_or(owner);

        let mut id = format!("fallback-{}", Uuid::new_v4());
        while records.iter().any(|r| r.id == id) {
            id = format!("fallback-{}", Uuid::new_v4());
        }

        let mut record = input.to_record(id, owner, professor, Utc::now().timestamp_millis());
        record.role = Some(DEFAULT_ROLE.to_string());

        records.push(record.clone());
        self.write_all(&records).await?;

        warn!(id = %record.id, owner = %owner, "User created in degraded store");
        Ok(record)
    }

    /// Merge `patch` into the record `id`. The owner attribute never changes.
    /// Returns `None` when no such record exists.
    pub async fn update(&self, id: &str, patch: &UserPatch) -> Result<Option<ManagedUserRecord>> {
        let _guard = self.lock.write().await;
        let mut records = self.read_all().await?;

        let Some(record) = records.iter_mut().find(|r| r.id == id) else {
            return Ok(None);
        };

        let report = record.apply_patch(patch);
        if report.touched_owner() {
            debug!(id = %id, attribute = OWNER_ATTRIBUTE, "Ignored owner change");
        }
        let updated = record.clone();

        self.write_all(&records).await?;
        warn!(id = %id, "User updated in degraded store");
        Ok(Some(updated))
    }

    /// Remove the record `id`. Returns `false` when it did not exist.
    pub async fn delete(&self, id: &str) -> Result<bool> {
        let _guard = self.lock.write().await;
        let mut records = self.read_all().await?;

        let before = records.len();
        records.retain(|r| r.id != id);
        if records.len() == before {
            return Ok(false);
        }

        self.write_all(&records).await?;
        warn!(id = %id, "User deleted from degraded store");
        Ok(true)
    }

    /// Parsed file content, `None` when the file is missing or blank
    async fn read_raw(&self) -> Result<Option<Vec<ManagedUserRecord>>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.persistence("read", &e)),
        };
        if content.trim().is_empty() {
            return Ok(None);
        }
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| self.persistence("parse", &e))
    }

    async fn read_all(&self) -> Result<Vec<ManagedUserRecord>> {
        Ok(self.read_raw().await?.unwrap_or_else(seed_records))
    }

    /// Atomic replace: write a sibling temp file, then rename it over the target
    async fn write_all(&self, records: &[ManagedUserRecord]) -> Result<()> {
        let content =
            serde_json::to_vec_pretty(records).map_err(|e| self.persistence("serialize", &e))?;

        let file_name = self
            .path
            .file_name()
            .map_or_else(|| "store".into(), |n| n.to_string_lossy().into_owned());
        let tmp = self
            .path
            .with_file_name(format!(".{file_name}.{}.tmp", Uuid::new_v4().simple()));

        tokio::fs::write(&tmp, &content)
            .await
            .map_err(|e| self.persistence("write", &e))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            if let Err(e) = tokio::fs::set_permissions(&tmp, perms).await {
                warn!(error = %e, "Failed to restrict degraded store permissions");
            }
        }

        if let Err(e) = tokio::fs::rename(&tmp, &self.path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(self.persistence("replace", &e));
        }
        Ok(())
    }

    fn persistence(&self, action: &str, err: &dyn std::fmt::Display) -> Error {
        Error::Persistence(format!(
            "Failed to {action} {}: {err}",
            self.path.display()
        ))
    }
}
