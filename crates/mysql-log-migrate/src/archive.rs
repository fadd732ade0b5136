//! Export bundles: gzip-compressed tarballs of chunk files.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::error::{MigrateError, Result};

/// True when an entry name looks like a chunk file.
fn is_chunk_entry(name: &str) -> bool {
    let lower = name.to_lowercase();
    lower.ends_with(".csv") || lower.ends_with(".csv.gz")
}

/// Stream a `.tar.gz` bundle, invoking `f` for every chunk entry with its
/// name and a reader over the entry body. Directories and non-CSV entries are
/// skipped. Entries may appear in any order.
pub fn for_each_entry<F>(path: &Path, mut f: F) -> Result<()>
where
    F: FnMut(&str, &mut dyn Read) -> Result<()>,
{
    let file = File::open(path)?;
    let gz = GzDecoder::new(BufReader::new(file));
    let mut tar = tar::Archive::new(gz);

    for entry in tar
        .entries()
        .map_err(|e| MigrateError::Archive(format!("read {:?}: {}", path, e)))?
    {
        let mut entry = entry.map_err(|e| MigrateError::Archive(format!("tar read: {}", e)))?;
        if !entry.header().entry_type().is_file() {
            continue;
        }

        let name = entry
            .path()
            .map_err(|e| MigrateError::Archive(format!("tar entry name: {}", e)))?
            .to_string_lossy()
            .into_owned();
        if !is_chunk_entry(&name) {
            continue;
        }

        f(&name, &mut entry)?;
    }

    Ok(())
}

/// Pack every file under `src_dir` into a gzip tarball at `dst_path`, with
/// entry names relative to `src_dir`.
pub fn create_tar_gz(src_dir: &Path, dst_path: &Path) -> Result<()> {
    let out = File::create(dst_path)?;
    let gz = GzEncoder::new(BufWriter::new(out), Compression::default());
    let mut builder = tar::Builder::new(gz);

    builder
        .append_dir_all("", src_dir)
        .map_err(|e| MigrateError::Archive(format!("pack {:?}: {}", src_dir, e)))?;

    let gz = builder
        .into_inner()
        .map_err(|e| MigrateError::Archive(format!("finish tar: {}", e)))?;
    let mut buf = gz.finish()?;
    buf.flush()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_round_trip_skips_non_csv_entries() {
        let src = tempfile::tempdir().unwrap();
        fs::write(src.path().join("log_01_000001.csv"), "1,a\n2,b\n").unwrap();
        fs::write(src.path().join("log_01_000002.CSV"), "3,c\n").unwrap();
        fs::write(src.path().join("README.txt"), "not a chunk").unwrap();

        let out = tempfile::tempdir().unwrap();
        let bundle = out.path().join("bundle.tar.gz");
        create_tar_gz(src.path(), &bundle).unwrap();

        let mut seen = Vec::new();
        for_each_entry(&bundle, |name, reader| {
            let mut body = String::new();
            reader.read_to_string(&mut body).unwrap();
            seen.push((name.to_string(), body));
            Ok(())
        })
        .unwrap();

        seen.sort();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].1, "1,a\n2,b\n");
        assert_eq!(seen[1].1, "3,c\n");
    }

    #[test]
    fn test_callback_error_propagates() {
        let src = tempfile::tempdir().unwrap();
        fs::write(src.path().join("a.csv"), "1\n").unwrap();
        let out = tempfile::tempdir().unwrap();
        let bundle = out.path().join("bundle.tar.gz");
        create_tar_gz(src.path(), &bundle).unwrap();

        let result = for_each_entry(&bundle, |_, _| {
            Err(MigrateError::Archive("stop".into()))
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_missing_bundle_errors() {
        assert!(for_each_entry(Path::new("/nonexistent/bundle.tar.gz"), |_, _| Ok(())).is_err());
    }
}
