use chrono::{DateTime, Local};
use std::path::{Path, PathBuf};

/// Output folder naming for one capture session.
///
/// The folder name is derived once from the start time; every export of the
/// session lands in the same folder.
#[derive(Debug, Clone)]
pub struct CaptureSession {
    documents_root: PathBuf,
    folder_name: String,
    started_at: DateTime<Local>,
}

impl CaptureSession {
    pub fn start(documents_root: impl Into<PathBuf>, started_at: DateTime<Local>) -> Self {
        Self {
            documents_root: documents_root.into(),
            folder_name: started_at.format("%Y%m%d_%H%M%S").to_string(),
            started_at,
        }
    }

    pub fn documents_root(&self) -> &Path {
        &self.documents_root
    }

    pub fn folder_name(&self) -> &str {
        &self.folder_name
    }

    pub fn started_at(&self) -> DateTime<Local> {
        self.started_at
    }

    pub fn folder(&self) -> PathBuf {
        self.documents_root.join(&self.folder_name)
    }

    /// Same session root, new start time.
    pub fn restart(&self, started_at: DateTime<Local>) -> Self {
        Self::start(self.documents_root.clone(), started_at)
    }
}

pub fn mesh_file_name(unix_seconds: i64) -> String {
    format!("meshAnchorGeometries_{}.json", unix_seconds)
}

pub fn camera_file_name(unix_seconds: i64) -> String {
    format!("cameraPoses_{}.json", unix_seconds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn folder_name_follows_start_time() {
        let start = Local.with_ymd_and_hms(2024, 3, 7, 9, 5, 2).unwrap();
        let session = CaptureSession::start("/docs", start);
        assert_eq!(session.folder_name(), "20240307_090502");
        assert_eq!(session.folder(), PathBuf::from("/docs/20240307_090502"));

        let later = Local.with_ymd_and_hms(2024, 3, 7, 18, 0, 0).unwrap();
        assert_eq!(session.restart(later).folder_name(), "20240307_180000");
    }

    #[test]
    fn file_names() {
        assert_eq!(mesh_file_name(1_700_000_000), "meshAnchorGeometries_1700000000.json");
        assert_eq!(camera_file_name(42), "cameraPoses_42.json");
    }
}
