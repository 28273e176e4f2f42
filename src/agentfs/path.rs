//! Path confinement against escape outside the snapshot root (spec §4.6).

use std::path::{Component, Path, PathBuf};

use crate::error::FabricError;

/// Lexically joins `rel` onto `root`, rejecting any `..` that would climb
/// above `root`. Empty string and `"."` denote the root itself (spec §4.6).
fn join_confined(root: &Path, rel: &str) -> Result<PathBuf, FabricError> {
    if rel.is_empty() || rel == "." {
        return Ok(root.to_path_buf());
    }

    let mut resolved = root.to_path_buf();
    for component in Path::new(rel).components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if !resolved.pop() || !resolved.starts_with(root) {
                    return Err(FabricError::invalid("path escapes snapshot root"));
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                resolved = root.to_path_buf();
            }
        }
    }
    Ok(resolved)
}

/// Resolves `rel` against `root` and confirms the result — after
/// following any symlinks — still lives under `root`. `root` must already
/// be canonicalized (done once at [`super::AgentFs::new`]).
pub async fn resolve(root: &Path, rel: &str) -> Result<PathBuf, FabricError> {
    let lexical = join_confined(root, rel)?;
    match tokio::fs::canonicalize(&lexical).await {
        Ok(canonical) => {
            if canonical.starts_with(root) {
                Ok(canonical)
            } else {
                Err(FabricError::invalid("path escapes snapshot root"))
            }
        }
        // The path may legitimately not exist yet from the caller's point
        // of view only for read-only attribute queries against a missing
        // entry; let the caller's subsequent stat surface "not found".
        Err(_) => {
            if lexical.starts_with(root) {
                Ok(lexical)
            } else {
                Err(FabricError::invalid("path escapes snapshot root"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_and_dot_denote_root() {
        let root = Path::new("/snapshot");
        assert_eq!(join_confined(root, "").unwrap(), root);
        assert_eq!(join_confined(root, ".").unwrap(), root);
    }

    #[test]
    fn parent_dir_cannot_climb_above_root() {
        let root = Path::new("/snapshot");
        assert!(join_confined(root, "../etc/passwd").is_err());
        assert!(join_confined(root, "a/../../b").is_err());
    }

    #[test]
    fn normal_relative_path_joins_onto_root() {
        let root = Path::new("/snapshot");
        assert_eq!(join_confined(root, "a/b.txt").unwrap(), root.join("a/b.txt"));
    }

    #[tokio::test]
    async fn resolve_rejects_symlink_escape() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("root");
        std::fs::create_dir(&root).unwrap();
        let outside = tmp.path().join("outside");
        std::fs::write(&outside, b"secret").unwrap();
        #[cfg(unix)]
        std::os::unix::fs::symlink(&outside, root.join("escape")).unwrap();

        let canonical_root = tokio::fs::canonicalize(&root).await.unwrap();
        #[cfg(unix)]
        assert!(resolve(&canonical_root, "escape").await.is_err());
    }
}
