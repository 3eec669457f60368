use std::env;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// Directory that receives a graphviz dump of every captured graph.
pub const DEBUG_DIRECTORY_ENV: &str = "GPU_GRAPH_DEBUG_DIRECTORY";

/// Debug output settings for graph capture.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GraphDebugOptions {
    dot_directory: Option<PathBuf>,
}

impl GraphDebugOptions {
    /// Reads [`DEBUG_DIRECTORY_ENV`]. The variable is read on every call so a
    /// directory configured after startup is still honored.
    pub fn from_env() -> Self {
        Self {
            dot_directory: env::var_os(DEBUG_DIRECTORY_ENV)
                .and_then(non_empty_path),
        }
    }

    pub fn with_dot_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.dot_directory = Some(directory.into());
        self
    }

    pub fn dot_directory(&self) -> Option<&Path> {
        self.dot_directory.as_deref()
    }
}

/// Trims UTF-8 values; other values are used as given.
fn non_empty_path(value: OsString) -> Option<PathBuf> {
    let path = match value.to_str() {
        Some(text) => PathBuf::from(text.trim()),
        None => PathBuf::from(value),
    };
    (!path.as_os_str().is_empty()).then_some(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_values_disable_dumps() {
        assert_eq!(non_empty_path("".into()), None);
        assert_eq!(non_empty_path("   ".into()), None);
        assert_eq!(
            non_empty_path(" /tmp/graphs ".into()),
            Some(PathBuf::from("/tmp/graphs"))
        );
    }

    #[cfg(unix)]
    #[test]
    fn non_utf8_directories_are_kept_verbatim() {
        use std::os::unix::ffi::OsStringExt;

        let raw = b"/tmp/gr\xffaphs".to_vec();
        let path = non_empty_path(OsString::from_vec(raw.clone())).expect("non-empty");
        assert_eq!(path.into_os_string().into_vec(), raw);
    }

    #[test]
    fn explicit_directory_overrides_default() {
        let options = GraphDebugOptions::default();
        assert!(options.dot_directory().is_none());
        let options = options.with_dot_directory("/var/tmp/dots");
        assert_eq!(options.dot_directory(), Some(Path::new("/var/tmp/dots")));
    }
}
