//! The saved-tracks library export, a second source of track identities.
//!
//! The account-data archive ships a `YourLibrary.json` next to the streaming
//! history. Its tracks carry full URIs, so a play that the history export
//! left URI-less can often be resolved here without a catalog search, and
//! every play of a saved track gets flagged.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use replay_catalog::uri_tail;
use replay_core::TrackReference;
use serde::Deserialize;
use tracing::info;

pub const LIBRARY_FILE_NAME: &str = "YourLibrary.json";

#[derive(Debug, Deserialize)]
struct LibraryExport {
    tracks: Vec<LibraryTrack>,
}

#[derive(Debug, Deserialize)]
struct LibraryTrack {
    artist: String,
    track: String,
    uri: String,
}

#[derive(Debug, Default)]
pub struct Library {
    by_src_id: HashMap<String, String>,
    uris: HashSet<String>,
}

impl Library {
    /// Loads the library export, `Ok(None)` when the file is absent. The
    /// export is optional; only a present-but-malformed file is an error.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let text =
            fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let export: LibraryExport =
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;

        let mut library = Library::default();
        for track in export.tracks {
            let id = uri_tail(&track.uri).to_string();
            let reference = TrackReference::new(track.artist, track.track);
            library.by_src_id.insert(reference.src_id(), id.clone());
            library.uris.insert(id);
        }
        info!(tracks = library.uris.len(), path = %path.display(), "loaded library export");
        Ok(Some(library))
    }

    /// Catalog id for a `"{artist}:{track}"` key, when the track is saved.
    pub fn resolve(&self, src_id: &str) -> Option<&str> {
        self.by_src_id.get(src_id).map(String::as_str)
    }

    pub fn contains(&self, track_uri: &str) -> bool {
        self.uris.contains(track_uri)
    }

    pub fn len(&self) -> usize {
        self.uris.len()
    }

    pub fn is_empty(&self) -> bool {
        self.uris.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const LIBRARY: &str = r#"{
        "tracks": [
            {
                "artist": "Nick Drake",
                "album": "Pink Moon",
                "track": "Pink Moon",
                "uri": "spotify:track:6e4CKf1nCbNU5NvXhUa5gf"
            },
            {
                "artist": "Daft Punk",
                "album": "Discovery",
                "track": "Veridis Quo",
                "uri": "spotify:track:2LD2gT7gwAurzdQDQtILds"
            }
        ]
    }"#;

    #[test]
    fn resolves_saved_tracks_by_name_and_artist() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join(LIBRARY_FILE_NAME);
        std::fs::write(&path, LIBRARY).expect("write");

        let library = Library::load(&path).expect("load").expect("present");
        assert_eq!(library.len(), 2);
        assert_eq!(
            library.resolve("Daft Punk:Veridis Quo"),
            Some("2LD2gT7gwAurzdQDQtILds")
        );
        assert_eq!(library.resolve("Daft Punk:One More Time"), None);
        assert!(library.contains("6e4CKf1nCbNU5NvXhUa5gf"));
        assert!(!library.contains("unknown"));
    }

    #[test]
    fn absent_export_is_not_an_error() {
        let dir = tempdir().expect("tempdir");
        let library = Library::load(&dir.path().join(LIBRARY_FILE_NAME)).expect("load");
        assert!(library.is_none());
    }

    #[test]
    fn malformed_export_is_an_error() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join(LIBRARY_FILE_NAME);
        std::fs::write(&path, "{").expect("write");
        assert!(Library::load(&path).is_err());
    }
}
