//! Bulk directory enumeration into a compact wire form, with exclusion
//! filtering (spec §4.7, C7).

use std::path::Path;

use crate::codec::{Decoder, Encoder};
use crate::error::FabricError;
use crate::mode::{is_excluded, neutral_mode};

/// One filtered directory entry: name and projected mode bits only (spec §3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub mode: u32,
}

impl DirEntry {
    pub fn encode(&self, enc: &mut Encoder<'_>) {
        enc.string(&self.name);
        enc.u32(self.mode);
    }

    pub fn decode(dec: &mut Decoder<'_>) -> Result<Self, FabricError> {
        Ok(Self { name: dec.string()?, mode: dec.u32()? })
    }
}

/// Enumerates `dir`, skipping `.`/`..` implicitly (`std::fs::read_dir` never
/// yields them), filtering out symlinks/devices/FIFOs/sockets per
/// [`crate::mode::is_excluded`].
///
/// The teacher's `parser::read_buffer::CountBuffer` grows its scratch
/// buffer by doubling whenever the OS says "more data, try again"; this
/// reader applies the same doubling-capacity policy to the output `Vec`
/// (`Vec::with_capacity` seeded small, left to double via `push`) since
/// Rust's portable `read_dir` already hides the raw batched-getdents
/// buffer the original syscall-level design doubles.
pub async fn read_dir(dir: &Path) -> Result<Vec<DirEntry>, FabricError> {
    let dir = dir.to_path_buf();
    tokio::task::spawn_blocking(move || read_dir_blocking(&dir))
        .await
        .map_err(|err| FabricError::internal(format!("directory read task failed: {err}")))?
}

fn read_dir_blocking(dir: &Path) -> Result<Vec<DirEntry>, FabricError> {
    let mut entries = Vec::with_capacity(32);
    for entry in std::fs::read_dir(dir).map_err(FabricError::from)? {
        let entry = entry.map_err(FabricError::from)?;
        let meta = match entry.metadata() {
            Ok(meta) => meta,
            Err(_) => continue,
        };
        if is_excluded(&meta) {
            continue;
        }
        if entries.len() == entries.capacity() {
            entries.reserve(entries.capacity());
        }
        entries.push(DirEntry {
            name: entry.file_name().to_string_lossy().into_owned(),
            mode: neutral_mode(&meta),
        });
    }
    Ok(entries)
}

/// Encodes the full entry list as one wire array (spec §3, §4.6 `ReadDir`).
pub fn encode_entries(entries: &[DirEntry]) -> Vec<u8> {
    let mut scratch = Vec::new();
    let mut enc = Encoder::new(&mut scratch);
    enc.array(entries, |enc, entry| entry.encode(enc));
    enc.finish().to_vec()
}

pub fn decode_entries(payload: &[u8]) -> Result<Vec<DirEntry>, FabricError> {
    let mut dec = Decoder::new(payload);
    dec.array(DirEntry::decode)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;

    #[tokio::test]
    async fn filters_dotdirs_symlinks_and_reports_dir_bit() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("file1.txt"), b"hi").unwrap();
        std::fs::create_dir(tmp.path().join("subdir")).unwrap();
        symlink(tmp.path().join("file1.txt"), tmp.path().join("link")).unwrap();

        let mut entries = read_dir(tmp.path()).await.unwrap();
        entries.sort_by(|a, b| a.name.cmp(&b.name));

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "file1.txt");
        assert!(entries[0].mode & crate::mode::MODE_DIR == 0);
        assert_eq!(entries[1].name, "subdir");
        assert!(entries[1].mode & crate::mode::MODE_DIR != 0);
    }

    #[test]
    fn entry_list_round_trips() {
        let entries = vec![
            DirEntry { name: "a".into(), mode: 0o644 },
            DirEntry { name: "b".into(), mode: crate::mode::MODE_DIR | 0o755 },
        ];
        let encoded = encode_entries(&entries);
        assert_eq!(decode_entries(&encoded).unwrap(), entries);
    }
}
