use std::collections::BTreeMap;
use std::io::{Read, Seek};

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use tracing::{debug, info, warn};
use zip::ZipArchive;

use crate::entry;
use crate::ext::ArchiveExt;
use crate::Error;

/// Root descriptor naming the package document.
pub const CONTAINER_PATH: &str = "META-INF/container.xml";
/// Encryption manifest listing the protected members.
pub const ENCRYPTION_PATH: &str = "META-INF/encryption.xml";
/// Rights document carrying the license.
pub const RIGHTS_PATH: &str = "META-INF/rights.xml";

/// Suffix of the one algorithm identifier that is honored.
pub const AES128_CBC_ALGORITHM: &str = "#aes128-cbc";

/// Protected members of an open container, keyed by archive index with the
/// declared plaintext size as value.
///
/// Every entry has already been decrypted and inflated once with the key the
/// container was opened with.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Manifest {
    entries: BTreeMap<usize, u64>,
}

impl Manifest {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, index: usize) -> bool {
        self.entries.contains_key(&index)
    }

    /// Declared plaintext size of the member at `index`, if it is protected.
    pub fn get(&self, index: usize) -> Option<u64> {
        self.entries.get(&index).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, u64)> + '_ {
        self.entries.iter().map(|(&index, &size)| (index, size))
    }

    /// Reads and validates the encryption manifest of `archive`.
    ///
    /// A missing or unparseable manifest yields an empty map. Entries with an
    /// unsupported algorithm, an unknown member or no usable size are skipped.
    /// Any accepted entry that fails to decode with `key` fails the whole load.
    pub(crate) fn load<R: Read + Seek>(
        archive: &mut ZipArchive<R>,
        key: &[u8],
    ) -> Result<Self, Error> {
        let xml = match archive.read_named(ENCRYPTION_PATH) {
            Ok(xml) => xml,
            Err(err) => {
                info!("skip encryption due to error: {err}");
                return Ok(Self::default());
            }
        };
        let resources = match parse_encryption(&xml) {
            Ok(resources) => resources,
            Err(err) => {
                warn!("skip encryption, unreadable manifest: {err}");
                return Ok(Self::default());
            }
        };

        let mut entries = BTreeMap::new();
        for resource in resources {
            if resource.uri.is_empty() {
                continue;
            }
            match resource.algorithm.as_deref() {
                Some(algorithm) if algorithm.ends_with(AES128_CBC_ALGORITHM) => {}
                algorithm => {
                    warn!(
                        "ignoring '{}' due to unsupported algorithm: {}",
                        resource.uri,
                        algorithm.unwrap_or("<none>")
                    );
                    continue;
                }
            }
            let Some(index) = archive.index_for_name(&resource.uri) else {
                warn!("ignoring '{}' due to error: no such member", resource.uri);
                continue;
            };
            let size = match resource.size.as_deref().map(str::trim).map(str::parse::<u64>) {
                Some(Ok(size)) if size > 0 => size,
                _ => {
                    warn!("ignoring '{}' due to invalid size", resource.uri);
                    continue;
                }
            };

            if let Err(err) = archive
                .read_member(index)
                .and_then(|data| entry::decrypt(data, key, size))
            {
                return Err(Error::WrongKey {
                    path: resource.uri,
                    source: Box::new(err),
                });
            }
            debug!("encrypted member {index} '{}' ({size} bytes)", resource.uri);
            entries.insert(index, size);
        }
        Ok(Self { entries })
    }
}

/// One `EncryptedData` element as written in the manifest.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct EncryptedResource {
    pub uri: String,
    pub algorithm: Option<String>,
    pub size: Option<String>,
}

fn attribute(
    e: &BytesStart<'_>,
    reader: &Reader<&[u8]>,
    name: &[u8],
) -> Result<Option<String>, Error> {
    for attr in e.attributes() {
        let attr = attr.map_err(quick_xml::Error::from)?;
        if attr.key.local_name().as_ref() == name {
            return Ok(Some(attr.decode_and_unescape_value(reader)?.into_owned()));
        }
    }
    Ok(None)
}

fn at_path(stack: &[Vec<u8>], path: &[&[u8]]) -> bool {
    stack.iter().map(Vec::as_slice).eq(path.iter().copied())
}

/// Returns the `full-path` of the first `container/rootfiles/rootfile`.
pub(crate) fn parse_root_file(xml: &[u8]) -> Result<Option<String>, Error> {
    let mut reader = Reader::from_reader(xml);
    let mut stack: Vec<Vec<u8>> = vec![];
    loop {
        match reader.read_event()? {
            Event::Start(e) => {
                if e.local_name().as_ref() == b"rootfile"
                    && at_path(&stack, &[b"container", b"rootfiles"])
                {
                    return attribute(&e, &reader, b"full-path");
                }
                stack.push(e.local_name().as_ref().to_vec());
            }
            Event::Empty(e) => {
                if e.local_name().as_ref() == b"rootfile"
                    && at_path(&stack, &[b"container", b"rootfiles"])
                {
                    return attribute(&e, &reader, b"full-path");
                }
            }
            Event::End(_) => {
                stack.pop();
            }
            Event::Eof => return Ok(None),
            _ => {}
        }
    }
}

/// Collects every `encryption/EncryptedData` element. Namespace prefixes are
/// ignored and `ResourceSize` may sit anywhere inside the element.
pub(crate) fn parse_encryption(xml: &[u8]) -> Result<Vec<EncryptedResource>, Error> {
    let mut reader = Reader::from_reader(xml);
    reader.trim_text(true);

    let mut stack: Vec<Vec<u8>> = vec![];
    let mut current: Option<EncryptedResource> = None;
    let mut in_size = false;
    let mut resources = vec![];

    loop {
        let event = reader.read_event()?;
        match &event {
            Event::Start(e) | Event::Empty(e) => {
                let name = e.local_name();
                match name.as_ref() {
                    b"EncryptedData" if at_path(&stack, &[b"encryption"]) => {
                        current = Some(EncryptedResource::default());
                    }
                    b"EncryptionMethod" => {
                        if let Some(resource) = current.as_mut() {
                            resource.algorithm = attribute(e, &reader, b"Algorithm")?;
                        }
                    }
                    b"CipherReference" => {
                        if let Some(resource) = current.as_mut() {
                            resource.uri = attribute(e, &reader, b"URI")?.unwrap_or_default();
                        }
                    }
                    b"ResourceSize" => {
                        in_size = current.is_some() && matches!(event, Event::Start(_));
                    }
                    _ => {}
                }
                if matches!(event, Event::Start(_)) {
                    stack.push(name.as_ref().to_vec());
                }
            }
            Event::Text(text) if in_size => {
                if let Some(resource) = current.as_mut() {
                    resource.size = Some(text.unescape()?.trim().to_owned());
                }
            }
            Event::End(e) => {
                stack.pop();
                match e.local_name().as_ref() {
                    b"EncryptedData" => resources.extend(current.take()),
                    b"ResourceSize" => in_size = false,
                    _ => {}
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(resources)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_root_file() {
        let xml = br#"<?xml version="1.0"?>
<container version="1.0" xmlns="urn:oasis:names:tc:opendocument:xmlns:container">
  <rootfiles>
    <rootfile full-path="OEBPS/content.opf" media-type="application/oebps-package+xml"/>
    <rootfile full-path="OEBPS/other.opf" media-type="application/oebps-package+xml"/>
  </rootfiles>
</container>"#;
        assert_eq!(
            parse_root_file(xml).unwrap().as_deref(),
            Some("OEBPS/content.opf")
        );
    }

    #[test]
    fn test_root_file_missing() {
        let xml = br#"<container><rootfiles></rootfiles></container>"#;
        assert_eq!(parse_root_file(xml).unwrap(), None);

        let xml = br#"<container><rootfile full-path="a.opf"/></container>"#;
        assert_eq!(parse_root_file(xml).unwrap(), None);

        let xml = br#"<container><rootfiles><rootfile full-path=""/></rootfiles></container>"#;
        assert_eq!(parse_root_file(xml).unwrap().as_deref(), Some(""));
    }

    #[test]
    fn test_encryption() {
        let xml = br#"<?xml version="1.0"?>
<encryption xmlns="urn:oasis:names:tc:opendocument:xmlns:container"
            xmlns:enc="http://www.w3.org/2001/04/xmlenc#">
  <enc:EncryptedData>
    <enc:EncryptionMethod Algorithm="http://www.w3.org/2001/04/xmlenc#aes128-cbc"/>
    <enc:KeyInfo><resource xmlns="http://ns.adobe.com/adept">urn:uuid:1234</resource></enc:KeyInfo>
    <enc:CipherData><enc:CipherReference URI="OEBPS/chapter1.xhtml"/></enc:CipherData>
    <enc:EncryptionProperties>
      <enc:EncryptionProperty><ResourceSize xmlns="http://ns.adobe.com/adept"> 2048 </ResourceSize></enc:EncryptionProperty>
    </enc:EncryptionProperties>
  </enc:EncryptedData>
  <EncryptedData>
    <EncryptionMethod Algorithm="http://www.idpf.org/2008/embedding"/>
    <CipherData><CipherReference URI="fonts/a&amp;b.otf"/></CipherData>
  </EncryptedData>
</encryption>"#;
        let resources = parse_encryption(xml).unwrap();
        assert_eq!(
            resources,
            vec![
                EncryptedResource {
                    uri: "OEBPS/chapter1.xhtml".to_owned(),
                    algorithm: Some("http://www.w3.org/2001/04/xmlenc#aes128-cbc".to_owned()),
                    size: Some("2048".to_owned()),
                },
                EncryptedResource {
                    uri: "fonts/a&b.otf".to_owned(),
                    algorithm: Some("http://www.idpf.org/2008/embedding".to_owned()),
                    size: None,
                },
            ]
        );
    }

    #[test]
    fn test_encryption_nested_data_ignored() {
        let xml = br#"<encryption><wrapper><EncryptedData>
            <CipherData><CipherReference URI="a"/></CipherData>
        </EncryptedData></wrapper></encryption>"#;
        assert!(parse_encryption(xml).unwrap().is_empty());
    }

    #[test]
    fn test_encryption_malformed() {
        assert!(parse_encryption(b"<encryption><EncryptedData></encryption>").is_err());
    }
}
