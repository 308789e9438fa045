use std::fs;
use std::os::unix::fs::DirBuilderExt;
use std::os::unix::net::UnixListener;
use std::path::Path;

use anyhow::{Context, Result};
use itertools::Itertools;

use crate::error::Error;

/// Bind a listening socket at `path`, removing any stale inode first.
///
/// The listener accepts exactly one peer: the emulator end of the channel.
pub(crate) fn bind_listener(path: &Path) -> Result<UnixListener> {
    if path.exists() {
        fs::remove_file(path)
            .with_context(|| format!("Failed to remove stale socket {}", path.display()))?;
    }
    UnixListener::bind(path).context(Error::SocketSetup(path.to_path_buf()))
}

/// Create a directory with mode 0o700 unless it already exists.
pub(crate) fn ensure_private_dir(path: &Path) -> Result<()> {
    if !path.exists() {
        fs::DirBuilder::new()
            .mode(0o700)
            .create(path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
    }
    Ok(())
}

/// Copy a file or a directory tree, preserving permission bits.
pub(crate) fn copy_recursive(src: &Path, dst: &Path) -> Result<()> {
    if src.is_dir() {
        fs::create_dir_all(dst).with_context(|| format!("Failed to create {}", dst.display()))?;
        let entries = fs::read_dir(src)
            .with_context(|| format!("Failed to read directory {}", src.display()))?;
        for entry in entries {
            let entry = entry.with_context(|| format!("Failed to list {}", src.display()))?;
            copy_recursive(&entry.path(), &dst.join(entry.file_name()))?;
        }
    } else {
        fs::copy(src, dst)
            .with_context(|| format!("Failed to copy {} to {}", src.display(), dst.display()))?;
    }
    Ok(())
}

/// Join arguments into one command line, quoting anything the in-guest
/// shell could mangle.
pub(crate) fn make_command<I>(args: I) -> Result<String>
where
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    itertools::process_results(
        args.into_iter()
            .map(|arg| shlex::try_quote(arg.as_ref()).map(|quoted| quoted.into_owned())),
        |mut quoted| quoted.join(" "),
    )
    .context("Failed to quote command arguments")
}

#[cfg(test)]
mod tests {
    use super::*;

    use rstest::rstest;
    use tempfile::tempdir;

    #[test]
    fn test_bind_listener_replaces_stale_inode() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("monitor");

        let first = bind_listener(&path).unwrap();
        drop(first);
        // The inode is still there; a fresh bind must clear it.
        assert!(path.exists());
        bind_listener(&path).unwrap();
    }

    #[test]
    fn test_bind_listener_reports_setup_failure() {
        let err = bind_listener(Path::new("/nonexistent-dir/socket")).unwrap_err();
        assert!(err.downcast_ref::<Error>().is_some());
    }

    #[test]
    fn test_copy_recursive_tree() {
        let src = tempdir().unwrap();
        let dst = tempdir().unwrap();
        fs::create_dir(src.path().join("sub")).unwrap();
        fs::write(src.path().join("a"), b"alpha").unwrap();
        fs::write(src.path().join("sub/b"), b"beta").unwrap();

        let target = dst.path().join("tree");
        copy_recursive(src.path(), &target).unwrap();

        assert_eq!(fs::read(target.join("a")).unwrap(), b"alpha");
        assert_eq!(fs::read(target.join("sub/b")).unwrap(), b"beta");
    }

    #[rstest]
    #[case(&["mkdir", "-p", "/tmp/shared/x"], "mkdir -p /tmp/shared/x")]
    #[case(&["cp", "-r", "a b", "c"], r#"cp -r "a b" c"#)]
    #[case(&["echo", "it's"], r#"echo "it's""#)]
    #[case(&["touch", ""], r#"touch """#)]
    fn test_make_command(#[case] args: &[&str], #[case] expected: &str) {
        assert_eq!(make_command(args.iter().copied()).unwrap(), expected);
    }
}
