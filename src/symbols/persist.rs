//! Companion index file.
//!
//! A built [`SymbolIndex`] is saved next to the cache as gzip-compressed
//! JSON, so later runs against the same cache path skip the build. The file
//! carries no version or checksum and is trusted whenever it exists.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::{debug, info};

use super::{IndexBuilder, SymbolIndex};
use crate::cache::SharedCache;
use crate::error::{Error, Result};

/// Default companion file suffix.
pub const INDEX_SUFFIX: &str = "a2s";

/// Where the index lives and whether to reuse it.
#[derive(Debug, Clone)]
pub struct IndexOptions {
    /// Suffix appended to the cache path, without the dot
    pub suffix: String,
    /// Ignore an existing index and build a new one
    pub rebuild: bool,
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self {
            suffix: INDEX_SUFFIX.to_string(),
            rebuild: false,
        }
    }
}

impl IndexOptions {
    /// Companion index path for `cache_path`.
    pub fn index_path(&self, cache_path: &Path) -> PathBuf {
        let mut name = cache_path.as_os_str().to_os_string();
        name.push(".");
        name.push(&self.suffix);
        PathBuf::from(name)
    }
}

fn write_error(path: &Path) -> impl FnOnce(std::io::Error) -> Error + '_ {
    move |source| Error::FileWrite {
        path: path.to_path_buf(),
        source,
    }
}

/// Writes `index` to `path`.
///
/// The data goes to a sibling temporary file first and is renamed into place.
pub fn save(index: &SymbolIndex, path: &Path) -> Result<()> {
    let mut tmp_name = path.as_os_str().to_os_string();
    tmp_name.push(".tmp");
    let tmp = PathBuf::from(tmp_name);

    let result = (|| -> Result<()> {
        let file = File::create(&tmp).map_err(write_error(&tmp))?;
        let mut encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
        serde_json::to_writer(&mut encoder, index).map_err(|source| Error::IndexEncode {
            path: path.to_path_buf(),
            source,
        })?;
        encoder
            .finish()
            .and_then(|mut writer| writer.flush())
            .map_err(write_error(&tmp))?;
        fs::rename(&tmp, path).map_err(write_error(path))
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result?;

    debug!("Saved {} symbols to {}", index.len(), path.display());
    Ok(())
}

/// Reads an index written by [`save`].
pub fn load(path: &Path) -> Result<SymbolIndex> {
    let file = File::open(path).map_err(|source| Error::FileOpen {
        path: path.to_path_buf(),
        source,
    })?;
    let decoder = GzDecoder::new(BufReader::new(file));
    serde_json::from_reader(decoder).map_err(|source| Error::IndexDecode {
        path: path.to_path_buf(),
        source,
    })
}

/// Loads the companion index of `cache_path`, building and saving it when
/// missing or when a rebuild is requested.
///
/// An existing file that fails to decode is an error; it is not rebuilt
/// silently.
pub fn load_or_build<C: SharedCache + ?Sized>(
    cache: &C,
    cache_path: &Path,
    options: &IndexOptions,
) -> Result<SymbolIndex> {
    let path = options.index_path(cache_path);

    if !options.rebuild && path.exists() {
        let index = load(&path)?;
        info!("Loaded {} symbols from {}", index.len(), path.display());
        return Ok(index);
    }

    let index = IndexBuilder::new(cache).build()?;
    save(&index, &path)?;
    info!("Saved symbol index to {}", path.display());
    Ok(index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Symbol;
    use crate::testutil::MockCache;

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.a2s");
        let index: SymbolIndex = [
            Symbol::new(0x1_8000_0000, "_start"),
            Symbol::new(u64::MAX - 1, "__ZN3foo3barEv"),
            Symbol::new(0x1_8000_1000, "@\"quoted \\\" string\""),
        ]
        .into_iter()
        .collect();

        save(&index, &path).unwrap();
        assert_eq!(load(&path).unwrap(), index);
        assert!(!dir.path().join("cache.a2s.tmp").exists());
    }

    #[test]
    fn test_index_path() {
        let options = IndexOptions::default();
        assert_eq!(
            options.index_path(Path::new("/caches/dyld_shared_cache_arm64e")),
            PathBuf::from("/caches/dyld_shared_cache_arm64e.a2s")
        );
    }

    #[test]
    fn test_corrupt_index_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let cache_path = dir.path().join("cache");
        let options = IndexOptions::default();
        fs::write(options.index_path(&cache_path), b"not gzip").unwrap();

        let cache = MockCache::new();
        assert!(matches!(
            load_or_build(&cache, &cache_path, &options),
            Err(Error::IndexDecode { .. })
        ));
    }

    #[test]
    fn test_load_or_build_reuses_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let cache_path = dir.path().join("cache");
        let options = IndexOptions::default();

        let mut cache = MockCache::new();
        let a = cache.add_image("/usr/lib/libA.dylib", 0x4000, 0x1000);
        cache.image_mut(a).exports = vec![Symbol::new(0x4000, "_foo")];

        let built = load_or_build(&cache, &cache_path, &options).unwrap();
        assert_eq!(built.get(0x4000), Some("_foo"));

        // A changed cache at the same path still yields the saved index.
        cache.image_mut(a).exports = vec![Symbol::new(0x4000, "_renamed")];
        let reused = load_or_build(&cache, &cache_path, &options).unwrap();
        assert_eq!(reused.get(0x4000), Some("_foo"));

        let rebuilt = load_or_build(
            &cache,
            &cache_path,
            &IndexOptions {
                rebuild: true,
                ..IndexOptions::default()
            },
        )
        .unwrap();
        assert_eq!(rebuilt.get(0x4000), Some("_renamed"));
    }
}
