//! Mutation inputs.
//!
//! An [`InputSet`] carries the bytes sent with the initialization request: the
//! binary to mutate, its linker map, and optionally a protected binary.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, instrument};

use crate::error::{ProtocolError, Result};

const SYMBOLS_EXTENSION: &str = "map";

#[derive(Clone, Default, PartialEq, Eq)]
pub struct InputSet {
    pub binary: Vec<u8>,
    pub symbols: Vec<u8>,
    pub protected_binary: Option<Vec<u8>>,
}

impl InputSet {
    pub fn new(binary: Vec<u8>, symbols: Vec<u8>) -> Self {
        Self {
            binary,
            symbols,
            protected_binary: None,
        }
    }

    pub fn with_protected(mut self, protected_binary: Vec<u8>) -> Self {
        self.protected_binary = Some(protected_binary);
        self
    }

    /// Load inputs from explicit paths
    #[instrument(skip_all)]
    pub fn from_paths(
        binary: impl AsRef<Path>,
        symbols: impl AsRef<Path>,
        protected_binary: Option<&Path>,
    ) -> Result<Self> {
        let protected_binary = match protected_binary {
            Some(path) => Some(read(path)?),
            None => None,
        };
        Ok(Self {
            binary: read(binary.as_ref())?,
            symbols: read(symbols.as_ref())?,
            protected_binary,
        })
    }

    /// Pick inputs out of a directory.
    ///
    /// The single `.map` file is the symbols file. Of the remaining regular
    /// files, a lone one is the binary; with two, the larger is the protected
    /// binary and the smaller the binary. Anything else is ambiguous and
    /// rejected with [`ProtocolError::Input`].
    #[instrument(skip_all, fields(dir = %dir.as_ref().display()))]
    pub fn from_directory(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let mut maps = Vec::new();
        let mut candidates: Vec<(PathBuf, u64)> = Vec::new();

        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let metadata = entry.metadata()?;
            if !metadata.is_file() {
                continue;
            }
            let path = entry.path();
            let is_map = path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext.eq_ignore_ascii_case(SYMBOLS_EXTENSION));
            if is_map {
                maps.push(path);
            } else {
                candidates.push((path, metadata.len()));
            }
        }

        let symbols = match maps.as_slice() {
            [single] => single.clone(),
            [] => {
                return Err(ProtocolError::Input(format!(
                    "no .{SYMBOLS_EXTENSION} file in {}",
                    dir.display()
                )))
            }
            many => {
                return Err(ProtocolError::Input(format!(
                    "{} .{SYMBOLS_EXTENSION} files in {}; expected one",
                    many.len(),
                    dir.display()
                )))
            }
        };

        let (binary, protected) = match candidates.as_slice() {
            [only] => (only.0.clone(), None),
            [a, b] if a.1 == b.1 => {
                return Err(ProtocolError::Input(format!(
                    "{} and {} have the same size; cannot tell binary from protected binary",
                    a.0.display(),
                    b.0.display()
                )))
            }
            [a, b] => {
                let (small, large) = if a.1 < b.1 { (a, b) } else { (b, a) };
                (small.0.clone(), Some(large.0.clone()))
            }
            [] => {
                return Err(ProtocolError::Input(format!(
                    "no binary in {}",
                    dir.display()
                )))
            }
            many => {
                return Err(ProtocolError::Input(format!(
                    "{} candidate binaries in {}; expected one or two",
                    many.len(),
                    dir.display()
                )))
            }
        };

        debug!(
            binary = %binary.display(),
            symbols = %symbols.display(),
            protected = ?protected,
            "inputs selected"
        );
        Self::from_paths(binary, symbols, protected.as_deref())
    }
}

// Payloads can be large; print sizes only
impl std::fmt::Debug for InputSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InputSet")
            .field("binary", &self.binary.len())
            .field("symbols", &self.symbols.len())
            .field(
                "protected_binary",
                &self.protected_binary.as_ref().map(Vec::len),
            )
            .finish()
    }
}

fn read(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).map_err(|e| ProtocolError::Input(format!("{}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write(dir: &TempDir, name: &str, len: usize) {
        fs::write(dir.path().join(name), vec![0x90; len]).unwrap();
    }

    #[test]
    fn single_binary_and_map() {
        let dir = TempDir::new().unwrap();
        write(&dir, "target.exe", 64);
        write(&dir, "target.map", 8);

        let inputs = InputSet::from_directory(dir.path()).unwrap();
        assert_eq!(inputs.binary.len(), 64);
        assert_eq!(inputs.symbols.len(), 8);
        assert!(inputs.protected_binary.is_none());
    }

    #[test]
    fn larger_of_two_is_protected() {
        let dir = TempDir::new().unwrap();
        write(&dir, "loader.dll", 32);
        write(&dir, "payload.dll", 128);
        write(&dir, "loader.MAP", 4);

        let inputs = InputSet::from_directory(dir.path()).unwrap();
        assert_eq!(inputs.binary.len(), 32);
        assert_eq!(inputs.protected_binary.map(|p| p.len()), Some(128));
    }

    #[test]
    fn subdirectories_are_ignored() {
        let dir = TempDir::new().unwrap();
        write(&dir, "a.exe", 10);
        write(&dir, "a.map", 1);
        fs::create_dir(dir.path().join("nested")).unwrap();

        assert!(InputSet::from_directory(dir.path()).is_ok());
    }

    #[test]
    fn ambiguous_layouts_are_rejected() {
        let equal = TempDir::new().unwrap();
        write(&equal, "a.exe", 16);
        write(&equal, "b.exe", 16);
        write(&equal, "a.map", 1);

        let three = TempDir::new().unwrap();
        write(&three, "a.exe", 1);
        write(&three, "b.exe", 2);
        write(&three, "c.exe", 3);
        write(&three, "a.map", 1);

        let two_maps = TempDir::new().unwrap();
        write(&two_maps, "a.exe", 1);
        write(&two_maps, "a.map", 1);
        write(&two_maps, "b.map", 1);

        let no_map = TempDir::new().unwrap();
        write(&no_map, "a.exe", 1);

        let no_binary = TempDir::new().unwrap();
        write(&no_binary, "a.map", 1);

        for dir in [&equal, &three, &two_maps, &no_map, &no_binary] {
            assert!(
                matches!(
                    InputSet::from_directory(dir.path()),
                    Err(ProtocolError::Input(_))
                ),
                "{:?} should be rejected",
                dir.path()
            );
        }
    }

    #[test]
    fn from_paths_reports_missing_file() {
        let dir = TempDir::new().unwrap();
        write(&dir, "a.exe", 4);
        let result = InputSet::from_paths(
            dir.path().join("a.exe"),
            dir.path().join("missing.map"),
            None,
        );
        assert!(matches!(result, Err(ProtocolError::Input(msg)) if msg.contains("missing.map")));
    }
}
