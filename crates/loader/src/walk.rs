//! Deterministic directory traversal shared by catalog loading and input
//! discovery.

use std::collections::{HashSet, VecDeque};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

fn skip_denied<T>(res: io::Result<T>, path: &Path) -> anyhow::Result<Option<T>> {
    match res {
        Ok(v) => Ok(Some(v)),
        Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
            debug!(path = %path.display(), "Permission denied");
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

/// Calls `callback` for every regular file below `path`, breadth first with
/// directory entries in name order. Symlinks are never followed and
/// unreadable entries are skipped.
pub fn visit<F, C>(path: &Path, excludes: &F, callback: &mut C) -> anyhow::Result<()>
where
    F: Fn(&Path) -> bool,
    C: FnMut(&Path) -> anyhow::Result<()>,
{
    let mut pending: VecDeque<PathBuf> = VecDeque::from([path.to_path_buf()]);
    let mut visited: HashSet<PathBuf> = HashSet::new();

    while let Some(current) = pending.pop_front() {
        if !visited.insert(current.clone()) {
            continue;
        }
        if excludes(&current) {
            debug!(path = %current.display(), "Path excluded");
            continue;
        }
        let Some(metadata) = skip_denied(fs::symlink_metadata(&current), &current)? else {
            continue;
        };
        let file_type = metadata.file_type();
        if file_type.is_symlink() {
            debug!(path = %current.display(), "Symlink skipped");
        } else if file_type.is_file() {
            callback(&current)?;
        } else if file_type.is_dir() {
            let Some(entries) = skip_denied(fs::read_dir(&current), &current)? else {
                continue;
            };
            let mut children = Vec::new();
            for entry in entries {
                if let Some(entry) = skip_denied(entry, &current)? {
                    children.push(entry.path());
                }
            }
            children.sort();
            pending.extend(children);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::visit;
    use std::fs;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    fn collect(base: &Path, excludes: &dyn Fn(&Path) -> bool) -> Vec<PathBuf> {
        let mut seen = Vec::new();
        let mut cb = |p: &Path| {
            seen.push(p.strip_prefix(base).unwrap().to_path_buf());
            Ok(())
        };
        visit(base, &excludes, &mut cb).unwrap();
        seen
    }

    #[test]
    fn visits_breadth_first_in_name_order() {
        let tmp = TempDir::new().unwrap();
        let base = tmp.path();
        fs::create_dir_all(base.join("a/b")).unwrap();
        fs::write(base.join("z.java"), b"").unwrap();
        fs::write(base.join("a/file.java"), b"").unwrap();
        fs::write(base.join("a/b/leaf.java"), b"").unwrap();
        fs::write(base.join("m.java"), b"").unwrap();

        assert_eq!(
            collect(base, &|_| false),
            vec![
                PathBuf::from("m.java"),
                PathBuf::from("z.java"),
                PathBuf::from("a/file.java"),
                PathBuf::from("a/b/leaf.java"),
            ]
        );
    }

    #[test]
    fn excluded_directories_are_pruned() {
        let tmp = TempDir::new().unwrap();
        let base = tmp.path();
        fs::create_dir_all(base.join("target/gen")).unwrap();
        fs::write(base.join("target/gen/A.java"), b"").unwrap();
        fs::write(base.join("B.java"), b"").unwrap();
        let seen = collect(base, &|p: &Path| p.ends_with("target"));
        assert_eq!(seen, vec![PathBuf::from("B.java")]);
    }

    #[cfg(unix)]
    #[test]
    fn terminates_on_symlink_loop() {
        use std::os::unix::fs as unix_fs;

        let tmp = TempDir::new().unwrap();
        let base = tmp.path();
        fs::create_dir_all(base.join("a")).unwrap();
        fs::write(base.join("root.java"), b"").unwrap();
        unix_fs::symlink(base, base.join("a/loop")).unwrap();

        assert_eq!(collect(base, &|_| false), vec![PathBuf::from("root.java")]);
    }
}
