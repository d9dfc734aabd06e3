//! Reading sitting reports out of `.taz` archives.
//!
//! A `.taz` archive is a (usually gzipped) tarball containing another tarball, which in turn
//! contains the verbatim report of the sitting as a `CRI_*.xml` file, alongside other renditions
//! we don't use.

use anyhow::{Context, Error};
use flate2::read::MultiGzDecoder;
use std::fs::File;
use std::io::{BufRead, BufReader, Cursor, Read};
use std::path::Path;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// The raw verbatim report of a sitting.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CriXml {
    /// The name of the XML file within the inner tarball.
    pub name: String,
    pub bytes: Vec<u8>,
}

/// Extract the verbatim report from the archive at `path`.
///
/// Returns [`None`] if the archive is readable but does not contain a report.
pub fn read_cri_xml(path: &Path) -> Result<Option<CriXml>, Error> {
    let file = File::open(path).with_context(|| format!("unable to open {}", path.display()))?;
    read_cri_xml_from(file).with_context(|| format!("unable to read archive {}", path.display()))
}

/// Extract the verbatim report from an archive stream.
pub fn read_cri_xml_from<R: Read>(reader: R) -> Result<Option<CriXml>, Error> {
    let mut reader = BufReader::new(reader);
    let gzipped = reader.fill_buf()?.starts_with(&GZIP_MAGIC);
    let outer: Box<dyn Read + '_> = if gzipped {
        Box::new(MultiGzDecoder::new(reader))
    } else {
        Box::new(reader)
    };

    let Some((tar_name, tar_bytes)) = find_member(&mut tar::Archive::new(outer), |path| {
        path.to_str().map_or(false, |name| name.ends_with(".tar"))
    })?
    else {
        tracing::warn!("no .tar file in archive");
        return Ok(None);
    };
    tracing::debug!("found inner tarball {tar_name}");

    let Some((name, bytes)) =
        find_member(&mut tar::Archive::new(Cursor::new(tar_bytes)), |path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .map_or(false, |name| name.starts_with("CRI_") && name.ends_with(".xml"))
        })?
    else {
        tracing::warn!("no CRI XML file in {tar_name}");
        return Ok(None);
    };
    tracing::debug!("found report {name}");

    Ok(Some(CriXml { name, bytes }))
}

/// Read the first regular file in `archive` whose path satisfies `matches`.
fn find_member<R: Read>(
    archive: &mut tar::Archive<R>,
    matches: impl Fn(&Path) -> bool,
) -> Result<Option<(String, Vec<u8>)>, Error> {
    for entry in archive.entries()? {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let path = entry.path()?.into_owned();
        if matches(&path) {
            let mut bytes = vec![];
            entry.read_to_end(&mut bytes)?;
            return Ok(Some((path.display().to_string(), bytes)));
        }
    }
    Ok(None)
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use flate2::{write::GzEncoder, Compression};

    /// Build a tarball containing `files`.
    pub(crate) fn tarball(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(vec![]);
        for (name, contents) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, *contents).unwrap();
        }
        builder.into_inner().unwrap()
    }

    pub(crate) fn gzip(bytes: &[u8]) -> Vec<u8> {
        use std::io::Write;
        let mut encoder = GzEncoder::new(vec![], Compression::default());
        encoder.write_all(bytes).unwrap();
        encoder.finish().unwrap()
    }

    /// Build a `.taz` archive the way the DILA packages sitting reports.
    pub(crate) fn taz(xml_name: &str, xml: &[u8]) -> Vec<u8> {
        let inner = tarball(&[
            ("AN_2022002/CRA_20220002.pdf", &b"%PDF"[..]),
            (xml_name, xml),
        ]);
        gzip(&tarball(&[("AN_2022002.tar", inner.as_slice())]))
    }

    #[test]
    fn test_read_gzipped() {
        let archive = taz("AN_2022002/CRI_20220002.xml", b"<CRI/>");
        let report = read_cri_xml_from(archive.as_slice()).unwrap().unwrap();
        assert_eq!(report.name, "AN_2022002/CRI_20220002.xml");
        assert_eq!(report.bytes, b"<CRI/>");
    }

    #[test]
    fn test_read_plain_tar() {
        let inner = tarball(&[("CRI_1.xml", &b"<CRI/>"[..])]);
        let archive = tarball(&[("x.tar", inner.as_slice())]);
        let report = read_cri_xml_from(archive.as_slice()).unwrap().unwrap();
        assert_eq!(report.name, "CRI_1.xml");
    }

    #[test]
    fn test_missing_members() {
        let archive = gzip(&tarball(&[("readme.txt", &b"hi"[..])]));
        assert_eq!(read_cri_xml_from(archive.as_slice()).unwrap(), None);

        let archive = taz("AN_2022002/CRA_20220002.xml", b"<CRA/>");
        assert_eq!(read_cri_xml_from(archive.as_slice()).unwrap(), None);
    }
}
