use std::io::{Read, Seek, Write};

use tracing::debug;
use zeroize::Zeroizing;
use zip::{ZipArchive, ZipWriter};

use crate::entry;
use crate::ext::{ArchiveExt, ArchiveWriteExt};
use crate::manifest::{self, Manifest, CONTAINER_PATH};
use crate::Error;

type Result<T, E = Error> = std::result::Result<T, E>;

/// An opened EPUB whose protected members are decrypted on read.
pub struct Container<R> {
    archive: ZipArchive<R>,
    key: Zeroizing<Vec<u8>>,
    manifest: Manifest,
    root_file: String,
}

impl<R> std::fmt::Debug for Container<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container")
            .field("root_file", &self.root_file)
            .field("manifest", &self.manifest)
            .finish_non_exhaustive()
    }
}

impl<R: Read + Seek> Container<R> {
    /// Opens the archive, checks the root descriptor and loads the encryption
    /// manifest, test-decrypting every listed member with `key`.
    ///
    /// An empty `key` opens the container for inspection only; protected
    /// members are then read back still encrypted.
    pub fn open(reader: R, key: &[u8]) -> Result<Self> {
        let mut archive = ZipArchive::new(reader).map_err(Error::OpenArchive)?;

        let descriptor = archive
            .read_named(CONTAINER_PATH)
            .map_err(|err| Error::ContainerDescriptor(Box::new(err)))?;
        let root_file = manifest::parse_root_file(&descriptor)
            .map_err(|err| Error::ContainerDescriptor(Box::new(err)))?
            .filter(|path| !path.is_empty())
            .ok_or(Error::MissingRootFile)?;
        debug!("root file '{root_file}'");

        let manifest = Manifest::load(&mut archive, key)?;

        Ok(Self {
            archive,
            key: Zeroizing::new(key.to_vec()),
            manifest,
            root_file,
        })
    }

    /// `false` when opened for inspection only.
    pub fn has_key(&self) -> bool {
        !self.key.is_empty()
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// Path of the package document named by the root descriptor.
    pub fn root_file(&self) -> &str {
        &self.root_file
    }

    pub fn len(&self) -> usize {
        self.archive.len()
    }

    pub fn is_empty(&self) -> bool {
        self.archive.is_empty()
    }

    pub fn name(&self, index: usize) -> Option<String> {
        self.archive.member_name(index)
    }

    pub fn files(&self) -> Vec<String> {
        self.archive.file_names().map(str::to_owned).collect()
    }

    pub fn is_encrypted(&self, index: usize) -> bool {
        self.manifest.contains(index)
    }

    /// Reads the member at `index`, decrypting it if the manifest lists it.
    pub fn read_index(&mut self, index: usize) -> Result<Vec<u8>> {
        let data = self.archive.read_member(index)?;
        match self.manifest.get(index) {
            Some(size) => entry::decrypt(data, &self.key, size),
            None => Ok(data),
        }
    }

    /// Reads the member named `path`, decrypting it if the manifest lists it.
    pub fn read_path(&mut self, path: &str) -> Result<Vec<u8>> {
        match self.archive.index_for_name(path) {
            Some(index) => self.read_index(index),
            None => Err(Error::MissingEntry(path.to_owned())),
        }
    }

    /// Copies the member at `index` into `writer` as stored, without
    /// inflating or decrypting it.
    pub(crate) fn copy_raw<W: Write + Seek>(
        &mut self,
        index: usize,
        writer: &mut ZipWriter<W>,
    ) -> Result<()> {
        writer.copy_member(&mut self.archive, index)
    }
}
