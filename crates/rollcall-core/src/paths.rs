//! Default on-disk locations, following the XDG base directory layout.

use std::path::PathBuf;

const APP_DIR: &str = "rollcall";

/// `$XDG_DATA_HOME/rollcall`, falling back to `~/.local/share/rollcall`.
pub fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join(APP_DIR)
}

/// Where the SCRFD and ArcFace ONNX files are expected.
pub fn default_model_dir() -> PathBuf {
    default_data_dir().join("models")
}

/// One reference image per person, named after the person.
pub fn default_faces_dir() -> PathBuf {
    default_data_dir().join("faces")
}

pub fn default_db_path() -> PathBuf {
    default_data_dir().join("attendance.db")
}
