use std::collections::BTreeSet;
use std::io::{Read, Seek, Write};

use zip::{write::SimpleFileOptions, ZipArchive, ZipWriter};

pub trait ArchiveExt {
    fn read_member(&mut self, index: usize) -> Result<Vec<u8>, super::Error>;
    fn read_named(&mut self, name: &str) -> Result<Vec<u8>, super::Error>;
    fn member_name(&self, index: usize) -> Option<String>;
}

pub trait ArchiveWriteExt {
    fn add_member(&mut self, name: &str, data: &[u8]) -> Result<(), super::Error>;
    fn copy_member<R: Read + Seek>(
        &mut self,
        source: &mut ZipArchive<R>,
        index: usize,
    ) -> Result<(), super::Error>;
    fn add_parents(&mut self, name: &str, known: &mut BTreeSet<String>)
        -> Result<(), super::Error>;
}

impl<R: Read + Seek> ArchiveExt for ZipArchive<R> {
    fn read_member(&mut self, index: usize) -> Result<Vec<u8>, super::Error> {
        let mut file = self.by_index(index)?;
        let mut buf = Vec::with_capacity(file.size().min(crate::entry::MAX_PREALLOCATION) as usize);
        file.read_to_end(&mut buf)?;
        Ok(buf)
    }

    fn read_named(&mut self, name: &str) -> Result<Vec<u8>, super::Error> {
        match self.index_for_name(name) {
            Some(index) => self.read_member(index),
            None => Err(super::Error::MissingEntry(name.to_owned())),
        }
    }

    fn member_name(&self, index: usize) -> Option<String> {
        self.name_for_index(index).map(str::to_owned)
    }
}

impl<W: Write + Seek> ArchiveWriteExt for ZipWriter<W> {
    fn add_member(&mut self, name: &str, data: &[u8]) -> Result<(), super::Error> {
        self.start_file(name, SimpleFileOptions::default())?;
        self.write_all(data)?;
        Ok(())
    }

    /// Copies the member's compressed bytes without inflating them.
    fn copy_member<R: Read + Seek>(
        &mut self,
        source: &mut ZipArchive<R>,
        index: usize,
    ) -> Result<(), super::Error> {
        let file = source.by_index_raw(index)?;
        self.raw_copy_file(file)?;
        Ok(())
    }

    /// Adds a directory member for every ancestor of `name` not yet in `known`.
    fn add_parents(
        &mut self,
        name: &str,
        known: &mut BTreeSet<String>,
    ) -> Result<(), super::Error> {
        for (i, _) in name.match_indices('/') {
            if i + 1 == name.len() {
                break;
            }
            let dir = &name[..=i];
            if !known.contains(dir) {
                self.add_directory(dir, SimpleFileOptions::default())?;
                known.insert(dir.to_owned());
            }
        }
        Ok(())
    }
}
