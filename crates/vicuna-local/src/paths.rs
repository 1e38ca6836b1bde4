//! Default locations for the inference executable and model weights.

use std::path::{Path, PathBuf};

/// Name of the per-user data directory under the home directory.
pub const DATA_DIR_NAME: &str = ".vicuna-ts";

/// Get the default data directory (~/.vicuna-ts/), if a home directory exists.
pub fn default_data_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(DATA_DIR_NAME))
}

/// File name of the inference executable for the current platform.
pub fn executable_name() -> &'static str {
    if cfg!(target_os = "windows") {
        "main.exe"
    } else {
        "main"
    }
}

/// Get the path to the inference executable inside `data_dir`.
pub fn executable_path(data_dir: &Path) -> PathBuf {
    data_dir.join(executable_name())
}

/// Get the path to a model's weights inside `data_dir`.
pub fn model_path(data_dir: &Path, model_id: &str) -> PathBuf {
    data_dir.join(format!("{}.bin", model_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_path_uses_bin_extension() {
        let path = model_path(Path::new("/data"), "ggml-vicuna-7b-4bit-rev1");
        assert_eq!(path, PathBuf::from("/data/ggml-vicuna-7b-4bit-rev1.bin"));
    }

    #[test]
    fn test_default_data_dir_under_home() {
        if let Some(home) = dirs::home_dir() {
            assert_eq!(default_data_dir(), Some(home.join(".vicuna-ts")));
        }
    }

    #[test]
    fn test_executable_inside_data_dir() {
        let path = executable_path(Path::new("/data"));
        assert_eq!(path.parent(), Some(Path::new("/data")));
    }
}
