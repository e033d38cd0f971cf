use std::collections::BTreeSet;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};
use zip::ZipWriter;

use crate::ext::ArchiveWriteExt;
use crate::manifest::{ENCRYPTION_PATH, RIGHTS_PATH};
use crate::{key_fingerprint, Container, Error};

type Result<T, E = Error> = std::result::Result<T, E>;

/// Inserted before the final extension of the input to name the output.
pub const DEFAULT_MARKER: &str = ".dump";

#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug, strum::Display, strum::FromRepr)]
pub enum DumpState {
    Closed,
    Open,
    Dumping,
}

/// Passed to the progress callback before each member is written.
#[derive(Debug, Clone, Copy)]
pub struct DumpProgress<'a> {
    pub index: usize,
    pub total: usize,
    pub decrypted: usize,
    pub expected: usize,
    pub name: &'a str,
}

/// Outcome of one pass over the input archive.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DumpReport {
    /// Members in the input archive.
    pub total: usize,
    /// Members copied through unchanged.
    pub copied: usize,
    /// Protected members written as plaintext.
    pub decrypted: usize,
    /// Protected members written as stored because no key was given.
    pub kept_encrypted: usize,
    /// Protected members listed in the manifest.
    pub expected: usize,
    pub skipped: usize,
    pub failed: usize,
    pub aborted: bool,
}

impl DumpReport {
    pub fn is_complete(&self) -> bool {
        !self.aborted && self.decrypted == self.expected
    }
}

type ProgressFn = dyn Fn(&DumpProgress<'_>) + Send + Sync;

pub struct DumperBuilder {
    marker: String,
    ignore: Vec<String>,
    progress: Option<Arc<ProgressFn>>,
}

impl Default for DumperBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl DumperBuilder {
    pub fn new() -> Self {
        Self {
            marker: DEFAULT_MARKER.to_owned(),
            ignore: vec![ENCRYPTION_PATH.to_owned(), RIGHTS_PATH.to_owned()],
            progress: None,
        }
    }
    /// Text inserted before the input's extension to name the output archive.
    pub fn marker(mut self, marker: impl Into<String>) -> Self {
        self.marker = marker.into();
        self
    }
    /// Member names left out of the output archive.
    pub fn ignore<S: Into<String>>(mut self, names: impl IntoIterator<Item = S>) -> Self {
        self.ignore = names.into_iter().map(Into::into).collect();
        self
    }
    pub fn progress(mut self, progress: impl Fn(&DumpProgress<'_>) + Send + Sync + 'static) -> Self {
        self.progress = Some(Arc::new(progress));
        self
    }
    pub fn build(self) -> Dumper {
        Dumper {
            shared: Arc::new(Shared {
                marker: self.marker,
                ignore: self.ignore,
                progress: self.progress,
                state: AtomicU8::new(DumpState::Closed as u8),
                abort: Arc::new(AtomicBool::new(false)),
                session: Mutex::new(None),
                worker: Mutex::new(None),
                running: Mutex::new(None),
            }),
        }
    }
}

/// Requests that a running dump stop before its next member.
#[derive(Debug, Clone)]
pub struct AbortHandle(Arc<AtomicBool>);

impl AbortHandle {
    pub fn abort(&self) {
        self.0.store(true, Ordering::Release);
    }
}

/// Writes a decrypted copy of a protected EPUB next to the original.
///
/// Lifecycle is `open` → `dump`/`dump_async` → `close`. Dropping the dumper
/// closes it.
pub struct Dumper {
    shared: Arc<Shared>,
}

impl Default for Dumper {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Dumper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dumper")
            .field("state", &self.state())
            .field("marker", &self.shared.marker)
            .finish_non_exhaustive()
    }
}

impl Dumper {
    pub fn new() -> Self {
        DumperBuilder::new().build()
    }

    pub fn builder() -> DumperBuilder {
        DumperBuilder::new()
    }

    pub fn state(&self) -> DumpState {
        self.shared.state()
    }

    pub fn is_open(&self) -> bool {
        self.state() != DumpState::Closed
    }

    /// Opens `path` with the raw decryption `key` and creates the output
    /// archive, returning its path.
    ///
    /// On failure nothing stays open and no output file is created.
    pub fn open(&self, path: impl AsRef<Path>, key: &[u8]) -> Result<PathBuf> {
        let path = path.as_ref();
        let Some(mut session) = self.shared.session.try_lock() else {
            return Err(Error::AlreadyOpen);
        };
        if session.is_some() || self.state() != DumpState::Closed {
            return Err(Error::AlreadyOpen);
        }
        self.shared.abort.store(false, Ordering::Release);

        info!(
            "open input archive '{}' with key {}",
            path.display(),
            key_fingerprint(key)
        );
        let input = File::open(path)
            .map_err(|err| Error::OpenArchive(err.into()))
            .and_then(|file| Container::open(BufReader::new(file), key))
            .inspect_err(|err| error!("open input archive error: {err}"))?;
        if !input.manifest().is_empty() {
            info!("{} encrypted members", input.manifest().len());
        }

        let output_path = output_path(path, &self.shared.marker);
        info!("open output archive '{}'", output_path.display());
        let file = File::create(&output_path).map_err(|source| Error::CreateOutput {
            path: output_path.display().to_string(),
            source,
        })?;

        *session = Some(Session {
            input,
            output: ZipWriter::new(file),
            directories: BTreeSet::new(),
            output_path: output_path.clone(),
            dumped: false,
        });
        self.shared.set_state(DumpState::Open);
        Ok(output_path)
    }

    /// Runs the dump on the calling thread. Only one dump may be run per
    /// open archive.
    pub fn dump(&self) -> Result<DumpReport> {
        if let Some(worker) = self.shared.worker.lock().as_ref() {
            if !worker.is_finished() {
                return Err(Error::Busy);
            }
        }
        self.shared.dump()
    }

    /// Runs the dump on a background thread. Only one may ever be started
    /// per open archive.
    pub fn dump_async(&self, close_when_done: bool) -> Result<()> {
        let mut worker = self.shared.worker.lock();
        if worker.is_some() || self.shared.abort.load(Ordering::Acquire) {
            return Err(Error::Busy);
        }
        if self.state() == DumpState::Closed {
            return Err(Error::NotOpen);
        }
        let dumped = self
            .shared
            .session
            .try_lock()
            .map_or(true, |session| session.as_ref().map_or(true, |s| s.dumped));
        if dumped {
            return Err(Error::Busy);
        }

        let shared = Arc::clone(&self.shared);
        self.shared.set_state(DumpState::Dumping);
        let handle = thread::Builder::new()
            .name("epub-dump".to_owned())
            .spawn(move || {
                if let Err(err) = shared.dump() {
                    warn!("dump failed: {err}");
                }
                if close_when_done {
                    shared.close();
                }
            })
            .map_err(|err| {
                self.shared.set_state(DumpState::Open);
                Error::Spawn(err)
            })?;
        *worker = Some(handle);
        Ok(())
    }

    pub fn abort(&self) {
        self.abort_handle().abort();
    }

    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle(Arc::clone(&self.shared.abort))
    }

    /// Stops any dump, waits for the worker and writes out the output
    /// archive. Calling it when already closed does nothing.
    pub fn close(&self) {
        self.shared.close();
    }
}

impl Drop for Dumper {
    fn drop(&mut self) {
        self.shared.close();
    }
}

struct Shared {
    marker: String,
    ignore: Vec<String>,
    progress: Option<Arc<ProgressFn>>,
    state: AtomicU8,
    abort: Arc<AtomicBool>,
    session: Mutex<Option<Session>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    /// Thread currently inside a dump, holding `session`.
    running: Mutex<Option<ThreadId>>,
}

impl Shared {
    fn state(&self) -> DumpState {
        DumpState::from_repr(self.state.load(Ordering::Acquire)).unwrap_or(DumpState::Closed)
    }

    fn set_state(&self, state: DumpState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn dump(&self) -> Result<DumpReport> {
        let mut session = self.session.lock();
        let Some(session) = session.as_mut() else {
            warn!("invalid state to dump");
            return Err(Error::NotOpen);
        };
        if session.dumped {
            return Err(Error::Busy);
        }
        session.dumped = true;

        self.set_state(DumpState::Dumping);
        *self.running.lock() = Some(thread::current().id());
        let report = session.dump(self);
        *self.running.lock() = None;
        self.set_state(DumpState::Open);
        Ok(report)
    }

    fn close(self: &Arc<Self>) {
        self.abort.store(true, Ordering::Release);

        let current = thread::current().id();
        let in_dump = *self.running.lock() == Some(current);
        let handle = {
            let mut worker = self.worker.lock();
            let on_worker = worker
                .as_ref()
                .is_some_and(|handle| handle.thread().id() == current);
            if in_dump || on_worker {
                // a thread cannot wait on its own dump, hand the teardown to another thread
                let shared = Arc::clone(self);
                match thread::Builder::new()
                    .name("epub-close".to_owned())
                    .spawn(move || shared.close())
                {
                    Ok(_) => return,
                    Err(err) if in_dump => {
                        // the dump stops at the next member, a later close finishes the output
                        error!("failed to defer close: {err}");
                        return;
                    }
                    Err(err) => {
                        warn!("failed to defer close, closing on worker: {err}");
                        worker.take();
                        None
                    }
                }
            } else {
                worker.take()
            }
        };
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("dump worker panicked");
            }
        }

        if let Some(session) = self.session.lock().take() {
            session.finish();
        }
        self.set_state(DumpState::Closed);
        self.abort.store(false, Ordering::Release);
    }
}

struct Session {
    input: Container<BufReader<File>>,
    output: ZipWriter<File>,
    /// Directory members already present in the output.
    directories: BTreeSet<String>,
    output_path: PathBuf,
    dumped: bool,
}

impl Session {
    fn dump(&mut self, shared: &Shared) -> DumpReport {
        let total = self.input.len();
        let expected = self.input.manifest().len();
        let has_key = self.input.has_key();
        let mut report = DumpReport {
            total,
            expected,
            ..Default::default()
        };
        if total == 0 {
            info!("epub has no files to dump");
            return report;
        }

        for index in 0..total {
            if shared.abort.load(Ordering::Acquire) {
                info!("dump aborted at {index}/{total}");
                report.aborted = true;
                break;
            }
            let Some(name) = self.input.name(index) else {
                warn!("failed to get name of member {index}");
                report.failed += 1;
                continue;
            };
            if shared.ignore.iter().any(|ignored| *ignored == name) {
                report.skipped += 1;
                continue;
            }

            debug!(
                "dump progress ALL({index}/{total}) ENC({}/{expected}) '{name}'",
                report.decrypted
            );
            if let Some(progress) = &shared.progress {
                progress(&DumpProgress {
                    index,
                    total,
                    decrypted: report.decrypted,
                    expected,
                    name: &name,
                });
            }

            let encrypted = self.input.is_encrypted(index);
            match self.write_member(index, &name, encrypted) {
                Ok(true) if encrypted && has_key => report.decrypted += 1,
                Ok(true) if encrypted => report.kept_encrypted += 1,
                Ok(true) => report.copied += 1,
                Ok(false) => report.skipped += 1,
                Err(err) => {
                    warn!("failed to dump '{name}': {err}");
                    report.failed += 1;
                }
            }
        }

        info!("dump complete");
        if has_key && report.decrypted < expected {
            warn!(
                "encrypted file count mismatch ({}/{expected}), dumped file might not work properly",
                report.decrypted
            );
        }
        report
    }

    /// Returns `false` when the member was already present.
    fn write_member(&mut self, index: usize, name: &str, encrypted: bool) -> Result<bool> {
        if encrypted {
            let data = self.input.read_index(index)?;
            self.output.add_parents(name, &mut self.directories)?;
            self.output.add_member(name, &data)?;
        } else if name.ends_with('/') {
            if self.directories.contains(name) {
                return Ok(false);
            }
            self.output.add_parents(name, &mut self.directories)?;
            self.input.copy_raw(index, &mut self.output)?;
            self.directories.insert(name.to_owned());
        } else {
            self.output.add_parents(name, &mut self.directories)?;
            self.input.copy_raw(index, &mut self.output)?;
        }
        Ok(true)
    }

    fn finish(self) {
        let Session {
            input,
            output,
            output_path,
            ..
        } = self;
        match output.finish() {
            Ok(_) => info!("output archive written '{}'", output_path.display()),
            Err(err) => error!("output archive close error: {err}"),
        }
        drop(input);
    }
}

/// `dir/book.epub` becomes `dir/book<marker>.epub`.
fn output_path(input: &Path, marker: &str) -> PathBuf {
    let mut name = input.file_stem().unwrap_or_default().to_os_string();
    name.push(marker);
    if let Some(extension) = input.extension() {
        name.push(".");
        name.push(extension);
    }
    input.with_file_name(name)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_output_path() {
        assert_eq!(
            output_path(Path::new("/books/novel.epub"), DEFAULT_MARKER),
            PathBuf::from("/books/novel.dump.epub")
        );
        assert_eq!(
            output_path(Path::new("novel.v2.epub"), ".out"),
            PathBuf::from("novel.v2.out.epub")
        );
        assert_eq!(
            output_path(Path::new("novel"), DEFAULT_MARKER),
            PathBuf::from("novel.dump")
        );
    }

    #[test]
    fn test_state_repr() {
        for state in [DumpState::Closed, DumpState::Open, DumpState::Dumping] {
            assert_eq!(DumpState::from_repr(state as u8), Some(state));
        }
        assert_eq!(DumpState::Dumping.to_string(), "Dumping");
    }

    #[test]
    fn test_close_without_open() {
        let dumper = Dumper::new();
        dumper.close();
        dumper.close();
        assert_eq!(dumper.state(), DumpState::Closed);
        assert!(matches!(dumper.dump(), Err(Error::NotOpen)));
        assert!(matches!(dumper.dump_async(false), Err(Error::NotOpen)));
    }
}
