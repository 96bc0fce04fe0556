use serde::{Deserialize, Serialize};

use crate::chunk::DataChunk;

/// Lifecycle of one download, persisted as a single byte in the sidecar.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    #[default]
    Init,
    Started,
    Paused,
    Finished,
    Failed,
}

impl DownloadStatus {
    pub fn as_u8(self) -> u8 {
        match self {
            DownloadStatus::Init => 0,
            DownloadStatus::Started => 1,
            DownloadStatus::Paused => 2,
            DownloadStatus::Finished => 3,
            DownloadStatus::Failed => 4,
        }
    }

    pub fn from_u8(raw: u8) -> Option<Self> {
        Some(match raw {
            0 => DownloadStatus::Init,
            1 => DownloadStatus::Started,
            2 => DownloadStatus::Paused,
            3 => DownloadStatus::Finished,
            4 => DownloadStatus::Failed,
            _ => return None,
        })
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, DownloadStatus::Finished | DownloadStatus::Failed)
    }

    pub fn label(self) -> &'static str {
        match self {
            DownloadStatus::Init => "init",
            DownloadStatus::Started => "started",
            DownloadStatus::Paused => "paused",
            DownloadStatus::Finished => "finished",
            DownloadStatus::Failed => "failed",
        }
    }
}

/// Point-in-time view of a download handed to progress callbacks and
/// printed by inspect mode.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DownloadState {
    pub url: String,
    pub file_name: String,
    pub status: DownloadStatus,
    pub total_size: u64,
    pub chunk_size: u64,
    pub current_size: u64,
    pub last_time: u64,
    pub acc_time: u32,
    pub nr_user: u8,
    pub nr_effective: u8,
    pub acon: u8,
    pub parts: Vec<PartState>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PartState {
    pub index: usize,
    pub start_byte: u64,
    pub end_byte: u64,
    pub current_byte: u64,
    pub completed: bool,
}

impl PartState {
    pub fn from_chunk(index: usize, chunk: &DataChunk) -> Self {
        Self {
            index,
            start_byte: chunk.start_pos,
            end_byte: chunk.end_pos,
            current_byte: chunk.cur_pos,
            completed: chunk.is_complete(),
        }
    }
}

impl DownloadState {
    pub fn completed_parts(&self) -> usize {
        self.parts.iter().filter(|p| p.completed).count()
    }

    /// Percentage received, when the total is known.
    pub fn percent(&self) -> Option<f64> {
        (self.total_size > 0).then(|| self.current_size as f64 * 100.0 / self.total_size as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_byte_roundtrip() {
        for status in [
            DownloadStatus::Init,
            DownloadStatus::Started,
            DownloadStatus::Paused,
            DownloadStatus::Finished,
            DownloadStatus::Failed,
        ] {
            assert_eq!(DownloadStatus::from_u8(status.as_u8()), Some(status));
        }
        assert_eq!(DownloadStatus::from_u8(9), None);
        assert!(DownloadStatus::Finished.is_terminal());
        assert!(!DownloadStatus::Paused.is_terminal());
    }

    #[test]
    fn snapshot_serializes_status_lowercase() {
        let state = DownloadState {
            url: "http://h/f".into(),
            file_name: "f".into(),
            status: DownloadStatus::Paused,
            total_size: 200,
            chunk_size: 100,
            current_size: 50,
            last_time: 0,
            acc_time: 3,
            nr_user: 2,
            nr_effective: 2,
            acon: 0,
            parts: vec![
                PartState::from_chunk(0, &DataChunk { start_pos: 0, cur_pos: 50, end_pos: 100 }),
                PartState::from_chunk(1, &DataChunk::new(100, 200)),
            ],
        };
        let json = serde_json::to_string(&state).unwrap();
        assert!(json.contains("\"status\":\"paused\""));
        assert_eq!(state.percent(), Some(25.0));
        assert_eq!(state.completed_parts(), 0);
    }
}
