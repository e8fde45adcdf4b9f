//! Configuration file discovery.
//!
//! Candidate directories are probed in a configurable order (the "series");
//! within each directory the file stem `opwire-agent` is tried with the
//! known extensions, with a leading dot for the home directory.

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use crate::text::split_trimmed;

use super::fs::FileSystem;

const CONFIG_DIR_ENV: &str = "OPWIRE_AGENT_CONFIG_DIR";
const CONFIG_SERIES_ENV: &str = "OPWIRE_AGENT_CONFIG_SERIES";
const CONFIG_DIR_NAME: &str = "opwire";
const CONFIG_FILE_STEM: &str = "opwire-agent";
const CONFIG_FILE_EXTS: [&str; 3] = [".cfg", ".conf", ".json"];
const DEFAULT_SERIES: [&str; 7] = ["arg", "env", "bin", "cwd", "xdg", "home", "etc"];

pub struct Locator {
    fs: Arc<dyn FileSystem>,
}

impl Locator {
    pub fn new(fs: Arc<dyn FileSystem>) -> Self {
        Self { fs }
    }

    /// Find the configuration file, returning its path and the series token
    /// that produced it.
    pub fn config_path(&self, arg_config_path: Option<&Path>) -> Option<(PathBuf, String)> {
        for token in series() {
            if token == "arg" {
                if let Some(path) = arg_config_path {
                    if self.fs.exists(path) {
                        return Some((path.to_path_buf(), token));
                    }
                }
                continue;
            }
            let Some(dir) = directory_for(&token) else {
                continue;
            };
            for ext in CONFIG_FILE_EXTS {
                let mut file = format!("{CONFIG_FILE_STEM}{ext}");
                if token == "home" {
                    file = format!(".{file}");
                }
                let candidate = dir.join(file);
                if self.fs.exists(&candidate) {
                    return Some((candidate, token));
                }
            }
        }
        None
    }
}

/// Search order: the `OPWIRE_AGENT_CONFIG_SERIES` environment variable when
/// set, otherwise the built-in default.
fn series() -> Vec<String> {
    let configured = std::env::var(CONFIG_SERIES_ENV).unwrap_or_default();
    let tokens = split_trimmed(&configured, ',');
    if tokens.is_empty() {
        return DEFAULT_SERIES.iter().map(|t| t.to_string()).collect();
    }
    tokens
}

fn directory_for(token: &str) -> Option<PathBuf> {
    match token {
        "env" => std::env::var_os(CONFIG_DIR_ENV).map(PathBuf::from),
        "bin" => std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf)),
        "cwd" => std::env::current_dir().ok(),
        "xdg" => dirs::config_dir().map(|dir| dir.join(CONFIG_DIR_NAME)),
        "home" => dirs::home_dir(),
        "etc" => Some(PathBuf::from("/etc")),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::io;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeFs {
        files: Mutex<HashSet<PathBuf>>,
    }

    impl FakeFs {
        fn with(paths: &[&str]) -> Arc<Self> {
            let fs = Self::default();
            {
                let mut files = fs.files.lock().expect("files");
                for path in paths {
                    files.insert(PathBuf::from(path));
                }
            }
            Arc::new(fs)
        }
    }

    impl FileSystem for FakeFs {
        fn exists(&self, path: &Path) -> bool {
            self.files.lock().expect("files").contains(path)
        }

        fn read(&self, _path: &Path) -> io::Result<Vec<u8>> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn explicit_argument_wins_when_the_file_exists() {
        let locator = Locator::new(FakeFs::with(&["/tmp/custom.json"]));
        let (path, source) = locator
            .config_path(Some(Path::new("/tmp/custom.json")))
            .expect("found");
        assert_eq!(path, PathBuf::from("/tmp/custom.json"));
        assert_eq!(source, "arg");
    }

    #[test]
    fn missing_argument_file_falls_through() {
        let locator = Locator::new(FakeFs::with(&[]));
        assert!(locator.config_path(Some(Path::new("/tmp/missing.json"))).is_none());
    }

    #[test]
    fn etc_directory_is_probed_with_every_extension() {
        let locator = Locator::new(FakeFs::with(&["/etc/opwire-agent.conf"]));
        let (path, source) = locator.config_path(None).expect("found");
        assert_eq!(path, PathBuf::from("/etc/opwire-agent.conf"));
        assert_eq!(source, "etc");
    }
}
