use std::{fmt::Debug, path::PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;
use tern_common::{Mail, internal, tracing};
use tern_tracing::traced;
use tokio::{fs, io::AsyncWriteExt};

use crate::error::MaildropError;

/// Local mailbox storage.
#[async_trait]
pub trait Maildrop: Send + Sync + Debug {
    /// Store `mail` in the named maildrop. The mail must be durable once this returns.
    async fn store(&self, mail: &Mail, maildrop: &str) -> Result<(), MaildropError>;
}

/// One directory per maildrop under `root`, one file per mail.
#[derive(Debug, Clone)]
pub struct DirMaildrop {
    root: PathBuf,
}

impl DirMaildrop {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn validate(maildrop: &str) -> Result<(), MaildropError> {
        let valid = !maildrop.is_empty()
            && maildrop != "."
            && maildrop != ".."
            && maildrop
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '+'));

        if valid {
            Ok(())
        } else {
            Err(MaildropError::InvalidName(maildrop.to_string()))
        }
    }
}

#[async_trait]
impl Maildrop for DirMaildrop {
    #[traced(instrument(level = tracing::Level::DEBUG, skip(self, mail), fields(mail = %mail.id)), timing(precision = "ms"))]
    async fn store(&self, mail: &Mail, maildrop: &str) -> Result<(), MaildropError> {
        Self::validate(maildrop)?;

        let directory = self.root.join(maildrop);
        fs::create_dir_all(&directory).await?;

        let name = format!("{}.eml", ulid::Ulid::new());
        let temp = directory.join(format!(".tmp_{name}"));

        let mut file = fs::File::create(&temp).await?;
        file.write_all(mail.body()).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&temp, directory.join(&name)).await?;

        internal!(level = INFO, mail = %mail.id, maildrop, file = %name, "Stored");
        Ok(())
    }
}

/// Keeps stored mail in memory, for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryMaildrop {
    stored: Mutex<Vec<(String, Mail)>>,
    unavailable: Mutex<bool>,
}

impl MemoryMaildrop {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent store fail until called again with `false`.
    pub fn set_unavailable(&self, unavailable: bool) {
        *self.unavailable.lock() = unavailable;
    }

    pub fn stored(&self) -> Vec<(String, Mail)> {
        self.stored.lock().clone()
    }

    pub fn count(&self, maildrop: &str) -> usize {
        self.stored
            .lock()
            .iter()
            .filter(|(name, _)| name == maildrop)
            .count()
    }
}

#[async_trait]
impl Maildrop for MemoryMaildrop {
    async fn store(&self, mail: &Mail, maildrop: &str) -> Result<(), MaildropError> {
        if *self.unavailable.lock() {
            return Err(MaildropError::Unavailable(maildrop.to_string()));
        }

        self.stored.lock().push((maildrop.to_string(), mail.clone()));
        Ok(())
    }
}
