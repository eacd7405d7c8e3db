use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use serde::Deserialize;
use tern_common::internal;
use tern_tracing::traced;
use tokio::fs;

use crate::{
    EntryId, QueueEntry, SpoolError, ValidationError,
    error::SerializationError,
    r#trait::BackingStore,
};

const SENSITIVE_PREFIXES: [&str; 9] = [
    "/etc", "/bin", "/sbin", "/usr/bin", "/usr/sbin", "/boot", "/sys", "/proc", "/dev",
];

/// File-based backing store
///
/// Every entry is stored as up to three files named after its ULID:
/// - `{id}.eml` - the raw message body
/// - `{id}.bin` - the entry envelope, bincode encoded
/// - `{id}.inflight` - present while a worker holds the entry
///
/// The body is written before the envelope, and an entry exists only once its
/// envelope has been renamed into place. Deletion removes the envelope first,
/// so a crash at any point leaves either a complete entry or an orphaned body
/// that `init` removes.
#[derive(Debug, Clone)]
pub struct FileBackingStore {
    path: PathBuf,
    max_entries: Option<usize>,
}

impl Default for FileBackingStore {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/spool/tern"),
            max_entries: None,
        }
    }
}

impl<'de> Deserialize<'de> for FileBackingStore {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct FileBackingStoreHelper {
            path: PathBuf,
            #[serde(default)]
            max_entries: Option<usize>,
        }

        let helper = FileBackingStoreHelper::deserialize(deserializer)?;
        Self::validate_path(&helper.path).map_err(serde::de::Error::custom)?;

        Ok(Self {
            path: helper.path,
            max_entries: helper.max_entries,
        })
    }
}

impl FileBackingStore {
    /// Reject traversal, relative paths and system directories.
    fn validate_path(path: &Path) -> Result<(), ValidationError> {
        if path
            .components()
            .any(|component| component == std::path::Component::ParentDir)
        {
            return Err(ValidationError::ParentComponent(path.display().to_string()));
        }

        if !path.is_absolute() {
            return Err(ValidationError::NotAbsolute(path.display().to_string()));
        }

        if let Some(prefix) = SENSITIVE_PREFIXES
            .iter()
            .find(|prefix| path.starts_with(prefix))
        {
            return Err(ValidationError::SystemDirectory {
                prefix: (*prefix).to_string(),
                path: path.display().to_string(),
            });
        }

        Ok(())
    }

    pub fn builder() -> FileBackingStoreBuilder {
        FileBackingStoreBuilder::default()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub const fn max_entries(&self) -> Option<usize> {
        self.max_entries
    }

    /// A store for a named queue in a subdirectory of this one.
    #[must_use]
    pub fn queue(&self, name: &str) -> Self {
        Self {
            path: self.path.join(name),
            max_entries: self.max_entries,
        }
    }

    fn file(&self, id: &EntryId, extension: &str) -> PathBuf {
        self.path.join(format!("{id}.{extension}"))
    }

    fn temp_file(&self, id: &EntryId, extension: &str) -> PathBuf {
        self.path.join(format!(".tmp_{id}.{extension}"))
    }

    /// Create the store directory and remove debris left by a crash
    ///
    /// Removes `.deleted` and `.tmp_` files, bodies without an envelope and
    /// claim markers without an envelope. Claims on complete entries are kept
    /// for `recover`.
    pub fn init(&self) -> crate::Result<()> {
        internal!("Initialising spool at {}", self.path.display());

        if !self.path.try_exists()? {
            internal!("{} does not exist, creating...", self.path.display());
            std::fs::create_dir_all(&self.path)?;
        } else if !self.path.is_dir() {
            return Err(ValidationError::NotDirectory(self.path.display().to_string()).into());
        }

        self.cleanup()
    }

    fn cleanup(&self) -> crate::Result<()> {
        let mut cleaned = 0;

        for entry in std::fs::read_dir(&self.path)? {
            let entry = entry?;
            let filename = entry.file_name();
            let filename = filename.to_string_lossy();

            let debris = filename.ends_with(".deleted")
                || filename.starts_with(".tmp_")
                || ((filename.ends_with(".eml") || filename.ends_with(".inflight"))
                    && EntryId::from_filename(&filename)
                        .is_some_and(|id| !self.file(&id, "bin").exists()));

            if debris {
                std::fs::remove_file(entry.path())?;
                cleaned += 1;
            }
        }

        if cleaned > 0 {
            internal!(
                level = INFO,
                "Cleaned up {cleaned} orphaned files from {}",
                self.path.display()
            );
        }

        Ok(())
    }

    async fn write_atomically(&self, id: &EntryId, extension: &str, data: &[u8]) -> crate::Result<()> {
        let temp = self.temp_file(id, extension);
        fs::write(&temp, data).await?;

        // The data has to be on disk before the rename makes it visible
        fs::File::open(&temp).await?.sync_all().await?;
        fs::rename(&temp, self.file(id, extension)).await?;

        // The new name is only durable once the directory is synced
        self.sync_directory().await
    }

    async fn sync_directory(&self) -> crate::Result<()> {
        fs::File::open(&self.path).await?.sync_all().await?;
        Ok(())
    }

    fn encode(entry: &QueueEntry) -> crate::Result<Vec<u8>> {
        Ok(bincode::serde::encode_to_vec(
            entry,
            bincode::config::standard(),
        )?)
    }

    async fn remove_if_present(path: &Path) -> crate::Result<()> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[async_trait]
impl BackingStore for FileBackingStore {
    #[traced(instrument(level = tracing::Level::DEBUG, skip(self, entry), fields(id = %entry.id)), timing(precision = "ms"))]
    async fn write(&self, entry: &QueueEntry) -> crate::Result<()> {
        let envelope = self.file(&entry.id, "bin");
        if fs::try_exists(&envelope).await? {
            return Err(SpoolError::AlreadyExists(entry.id));
        }

        if let Some(max) = self.max_entries
            && self.list().await?.len() >= max
        {
            return Err(SpoolError::Full(max));
        }

        self.write_atomically(&entry.id, "eml", entry.mail.body())
            .await?;
        self.write_atomically(&entry.id, "bin", &Self::encode(entry)?)
            .await?;

        internal!(level = DEBUG, "Spooled {} to {}", entry.id, envelope.display());

        Ok(())
    }

    #[traced(instrument(level = tracing::Level::DEBUG, skip(self)), timing(precision = "ms"))]
    async fn list(&self) -> crate::Result<Vec<EntryId>> {
        let mut ids = Vec::new();
        let mut entries = fs::read_dir(&self.path).await?;

        while let Some(entry) = entries.next_entry().await? {
            let filename = entry.file_name();
            let filename = filename.to_string_lossy();

            if filename.ends_with(".bin")
                && let Some(id) = EntryId::from_filename(&filename)
            {
                ids.push(id);
            }
        }

        ids.sort();
        Ok(ids)
    }

    #[traced(instrument(level = tracing::Level::DEBUG, skip(self), fields(id = %id)), timing(precision = "ms"))]
    async fn read(&self, id: &EntryId) -> crate::Result<QueueEntry> {
        let envelope = match fs::read(self.file(id, "bin")).await {
            Ok(envelope) => envelope,
            Err(err) if err.kind() == ErrorKind::NotFound => return Err(SpoolError::NotFound(*id)),
            Err(err) => return Err(err.into()),
        };

        let (entry, _): (QueueEntry, usize) =
            bincode::serde::decode_from_slice(&envelope, bincode::config::standard())?;

        if entry.id != *id {
            return Err(SerializationError::Corrupted(format!(
                "{} contains entry {}",
                self.file(id, "bin").display(),
                entry.id
            ))
            .into());
        }

        let body = fs::read(self.file(id, "eml")).await?;

        Ok(QueueEntry {
            mail: entry.mail.with_body(body),
            ..entry
        })
    }

    #[traced(instrument(level = tracing::Level::DEBUG, skip(self, entry), fields(id = %entry.id)), timing(precision = "ms"))]
    async fn update(&self, entry: &QueueEntry) -> crate::Result<()> {
        if !fs::try_exists(self.file(&entry.id, "bin")).await? {
            return Err(SpoolError::NotFound(entry.id));
        }

        self.write_atomically(&entry.id, "bin", &Self::encode(entry)?)
            .await
    }

    #[traced(instrument(level = tracing::Level::DEBUG, skip(self), fields(id = %id)), timing(precision = "ms"))]
    async fn delete(&self, id: &EntryId) -> crate::Result<()> {
        let envelope = self.file(id, "bin");
        let body = self.file(id, "eml");
        let deleted_envelope = self.path.join(format!("{id}.bin.deleted"));
        let deleted_body = self.path.join(format!("{id}.eml.deleted"));

        match fs::rename(&envelope, &deleted_envelope).await {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => return Err(SpoolError::NotFound(*id)),
            Err(err) => return Err(err.into()),
        }

        // The entry is gone once the envelope is; the rest is cleanup
        if fs::rename(&body, &deleted_body).await.is_ok() {
            fs::remove_file(&deleted_body).await?;
        }
        fs::remove_file(&deleted_envelope).await?;
        Self::remove_if_present(&self.file(id, "inflight")).await?;
        self.sync_directory().await?;

        internal!(level = DEBUG, "Deleted {id} from spool");

        Ok(())
    }

    async fn claim(&self, id: &EntryId) -> crate::Result<bool> {
        if !fs::try_exists(self.file(id, "bin")).await? {
            return Err(SpoolError::NotFound(*id));
        }

        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.file(id, "inflight"))
            .await
        {
            Ok(_) => Ok(true),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    async fn release(&self, id: &EntryId) -> crate::Result<()> {
        Self::remove_if_present(&self.file(id, "inflight")).await
    }

    #[traced(instrument(level = tracing::Level::DEBUG, skip(self)), timing(precision = "ms"))]
    async fn recover(&self) -> crate::Result<usize> {
        let mut recovered = 0;
        let mut entries = fs::read_dir(&self.path).await?;

        while let Some(entry) = entries.next_entry().await? {
            let filename = entry.file_name();
            if filename.to_string_lossy().ends_with(".inflight") {
                Self::remove_if_present(&entry.path()).await?;
                recovered += 1;
            }
        }

        if recovered > 0 {
            internal!(
                level = INFO,
                "Returned {recovered} in-flight entries to pending in {}",
                self.path.display()
            );
        }

        Ok(recovered)
    }
}

/// Builder for `FileBackingStore`
#[derive(Debug, Default)]
pub struct FileBackingStoreBuilder {
    path: PathBuf,
    max_entries: Option<usize>,
}

impl FileBackingStoreBuilder {
    #[must_use]
    pub fn path(mut self, path: PathBuf) -> Self {
        self.path = path;
        self
    }

    /// Refuse writes once this many entries are stored.
    #[must_use]
    pub const fn max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = Some(max_entries);
        self
    }

    pub fn build(self) -> crate::Result<FileBackingStore> {
        FileBackingStore::validate_path(&self.path)?;

        Ok(FileBackingStore {
            path: self.path,
            max_entries: self.max_entries,
        })
    }
}
