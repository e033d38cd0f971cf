use std::collections::HashSet;
use std::path::{Path, PathBuf};

use sha1::{Digest, Sha1};
use tracing::{debug, info};

use crate::{Dumper, Error};

/// What [`CaptureSession::decrypt_key_set`] did with a key.
#[derive(Clone, Copy, PartialEq, Eq, Debug, strum::Display)]
pub enum Capture {
    /// A background dump was started for the archive.
    Started,
    /// The archive was already dumped with this key.
    Duplicate,
    /// No archive has been seen yet.
    NoArchive,
    /// The dumper is still busy with another archive.
    Busy,
}

/// Turns "archive opened" and "decrypt key set" notifications from a host
/// reader into one dump per distinct `(archive, key)` pair.
#[derive(Debug)]
pub struct CaptureSession {
    dumper: Dumper,
    archive: Option<PathBuf>,
    processed: HashSet<[u8; 20]>,
}

impl Default for CaptureSession {
    fn default() -> Self {
        Self::new(Dumper::new())
    }
}

impl CaptureSession {
    pub fn new(dumper: Dumper) -> Self {
        Self {
            dumper,
            archive: None,
            processed: HashSet::new(),
        }
    }

    pub fn dumper(&self) -> &Dumper {
        &self.dumper
    }

    /// Remembers `path` as the archive the next key belongs to.
    pub fn archive_opened(&mut self, path: impl Into<PathBuf>) {
        let path = path.into();
        info!("archive opened '{}'", path.display());
        self.archive = Some(path);
    }

    /// Starts a self-closing background dump of the last opened archive.
    ///
    /// A pair that fails to open is still recorded and will not be retried.
    pub fn decrypt_key_set(&mut self, key: &[u8]) -> Result<Capture, Error> {
        info!("decrypt key set {}", key_fingerprint(key));
        let Some(path) = self.archive.as_deref() else {
            debug!("no archive to dump");
            return Ok(Capture::NoArchive);
        };
        if self.dumper.is_open() {
            debug!("dumper busy, ignoring key");
            return Ok(Capture::Busy);
        }
        if !self.processed.insert(pair_digest(path, key)) {
            debug!("'{}' already dumped with this key", path.display());
            return Ok(Capture::Duplicate);
        }

        self.dumper.open(path, key)?;
        self.dumper.dump_async(true)?;
        Ok(Capture::Started)
    }
}

fn pair_digest(path: &Path, key: &[u8]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(path.to_string_lossy().as_bytes());
    hasher.update([0]);
    hasher.update(key);
    hasher.finalize().into()
}

/// Short printable identifier for a key that does not reveal it.
pub fn key_fingerprint(key: &[u8]) -> String {
    if key.is_empty() {
        return "<none>".to_owned();
    }
    hex::encode(&Sha1::digest(key)[..4])
}
