//! JSON persistence for proxy address sets.

use std::collections::HashSet;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyStoreError {
    #[error("proxy file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("proxy file {path} is not a JSON array of strings: {source}")]
    Format {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Write `proxies` as a pretty-printed JSON array. Entries are sorted so the
/// file is stable across runs.
pub fn save_proxies(path: impl AsRef<Path>, proxies: &HashSet<String>) -> Result<(), ProxyStoreError> {
    let path = path.as_ref();
    let io_err = |source| ProxyStoreError::Io {
        path: path.to_path_buf(),
        source,
    };

    let mut sorted: Vec<&String> = proxies.iter().collect();
    sorted.sort();

    let file = File::create(path).map_err(io_err)?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, &sorted).map_err(|source| ProxyStoreError::Format {
        path: path.to_path_buf(),
        source,
    })?;
    writer.flush().map_err(io_err)?;

    log::info!("saved {} proxies to {}", sorted.len(), path.display());
    Ok(())
}

pub fn load_proxies(path: impl AsRef<Path>) -> Result<HashSet<String>, ProxyStoreError> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|source| ProxyStoreError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let proxies: Vec<String> =
        serde_json::from_reader(BufReader::new(file)).map_err(|source| ProxyStoreError::Format {
            path: path.to_path_buf(),
            source,
        })?;

    log::info!("loaded {} proxies from {}", proxies.len(), path.display());
    Ok(proxies.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_preserves_set() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("proxies.json");
        let proxies: HashSet<String> = ["http://10.0.0.2:3128", "http://10.0.0.1:8080", "socks5://10.0.0.3:1080"]
            .into_iter()
            .map(String::from)
            .collect();

        save_proxies(&path, &proxies).unwrap();
        assert_eq!(load_proxies(&path).unwrap(), proxies);
    }

    #[test]
    fn duplicates_collapse_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("proxies.json");
        std::fs::write(&path, r#"["http://a:1", "http://a:1", "http://b:2"]"#).unwrap();
        assert_eq!(load_proxies(&path).unwrap().len(), 2);
    }

    #[test]
    fn rejects_non_array_payload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("proxies.json");
        std::fs::write(&path, r#"{"proxies": []}"#).unwrap();
        assert!(matches!(
            load_proxies(&path),
            Err(ProxyStoreError::Format { .. })
        ));
    }

    #[test]
    fn missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            load_proxies(dir.path().join("absent.json")),
            Err(ProxyStoreError::Io { .. })
        ));
    }
}
