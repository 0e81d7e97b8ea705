//! Parsing of `.torrent` files.
//!
//! The bencoded `info` dictionary is deserialized as-is into [`Info`], then
//! normalized into [`Metainfo`]: a single file and a multi-file archive are
//! both folded into [`FsStructure`] up front, so the rest of the engine
//! never has to branch on `files.is_some()`.

use std::path::PathBuf;

use serde_bencode::Error;
use sha1::{Digest, Sha1};

use crate::{
    storage_info::{FileInfo, FsStructure},
    PieceIndex, Sha1Hash,
};

#[derive(Debug, Deserialize)]
struct RawMetainfo {
    info: Info,
    announce: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Info {
    pub name: String,
    #[serde(with = "serde_bytes")]
    pub pieces: Vec<u8>,
    #[serde(rename = "piece length")]
    pub piece_length: u64,
    pub length: Option<u64>,
    pub files: Option<Vec<File>>,
    pub private: Option<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct File {
    pub path: Vec<String>,
    pub length: i64,
}

/// A parsed `.torrent` file.
#[derive(Debug)]
pub struct Metainfo {
    pub name: String,
    pub piece_len: u32,
    /// The concatenation of all of the torrent's expected piece SHA-1
    /// hashes, 20 bytes each.
    pub piece_hashes: Vec<u8>,
    pub structure: FsStructure,
    /// The tracker's announce URL, absent for a trackerless (DHT-only)
    /// torrent.
    pub announce: Option<String>,
    /// Kept around only to reproduce the exact bencoded `info` dictionary
    /// for [`Metainfo::create_info_hash`]; serde's field order is what that
    /// depends on, not this struct's layout.
    info: Info,
}

impl Metainfo {
    pub fn from_bytes(buf: &[u8]) -> Result<Self, Error> {
        let raw: RawMetainfo = serde_bencode::from_bytes(buf)?;
        Ok(Self::from_info(raw.info, raw.announce))
    }

    fn from_info(info: Info, announce: Option<String>) -> Self {
        let structure = if let Some(files) = &info.files {
            let mut torrent_offset = 0;
            let files = files
                .iter()
                .map(|file| {
                    let mut path = PathBuf::from(&info.name);
                    path.extend(file.path.iter());
                    let file_info = FileInfo {
                        path,
                        len: file.length as u64,
                        torrent_offset,
                    };
                    torrent_offset += file_info.len;
                    file_info
                })
                .collect();
            FsStructure::Archive { files }
        } else {
            FsStructure::File(FileInfo {
                path: PathBuf::from(&info.name),
                len: info.length.unwrap_or(0),
                torrent_offset: 0,
            })
        };

        let name = info.name.clone();
        let piece_len = info.piece_length as u32;
        let piece_hashes = info.pieces.clone();

        Self {
            name,
            piece_len,
            piece_hashes,
            structure,
            announce,
            info,
        }
    }

    pub fn create_info_hash(&self) -> Result<Sha1Hash, Error> {
        let info = serde_bencode::to_bytes(&self.info)?;
        let digest = Sha1::digest(&info);
        let mut info_hash = [0; 20];
        info_hash.copy_from_slice(&digest);
        Ok(info_hash)
    }

    pub fn piece_count(&self) -> usize {
        self.piece_hashes.len() / 20
    }

    pub fn piece_hash(&self, index: PieceIndex) -> Sha1Hash {
        let start = index * 20;
        let mut hash = [0; 20];
        hash.copy_from_slice(&self.piece_hashes[start..start + 20]);
        hash
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_file_metainfo() -> Metainfo {
        let info = Info {
            name: "foo.txt".to_string(),
            pieces: vec![1u8; 40],
            piece_length: 1 << 14,
            length: Some(1 << 15),
            files: None,
            private: None,
        };
        Metainfo::from_info(info, Some("http://tracker.example.com:6969/announce".to_string()))
    }

    fn archive_metainfo() -> Metainfo {
        let info = Info {
            name: "bar".to_string(),
            pieces: vec![2u8; 60],
            piece_length: 1 << 14,
            length: None,
            files: Some(vec![
                File { path: vec!["a.txt".to_string()], length: 10 },
                File {
                    path: vec!["sub".to_string(), "b.txt".to_string()],
                    length: 20,
                },
            ]),
            private: None,
        };
        Metainfo::from_info(info, None)
    }

    #[test]
    fn single_file_becomes_fs_structure_file() {
        let metainfo = single_file_metainfo();
        assert!(!metainfo.structure.is_archive());
        assert_eq!(metainfo.structure.download_len(), 1 << 15);
        assert_eq!(metainfo.piece_count(), 2);
    }

    #[test]
    fn archive_files_get_cumulative_torrent_offsets() {
        let metainfo = archive_metainfo();
        assert!(metainfo.structure.is_archive());
        assert_eq!(metainfo.structure.download_len(), 30);
        if let FsStructure::Archive { files } = &metainfo.structure {
            assert_eq!(files[0].torrent_offset, 0);
            assert_eq!(files[1].torrent_offset, 10);
            assert_eq!(files[1].path, PathBuf::from("bar/sub/b.txt"));
        } else {
            panic!("expected an archive");
        }
    }

    #[test]
    fn piece_hash_slices_the_concatenated_digest() {
        let metainfo = single_file_metainfo();
        assert_eq!(metainfo.piece_hash(0), [1u8; 20]);
        assert_eq!(metainfo.piece_hash(1), [1u8; 20]);
    }
}
