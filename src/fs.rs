use derive_more::Display;
use log::debug;
use std::fs::{self, DirBuilder, File, Permissions};
use std::io;
use std::os::unix::fs::{lchown, symlink, DirBuilderExt, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use tokio::fs::{create_dir_all, metadata, remove_file};
use walkdir::WalkDir;

/// Mode used for directories which don't exist in the destination yet
const DIRECTORY_MODE: u32 = 0o755;

#[derive(Debug, Display)]
#[display(fmt = "Failed to {} '{}': {}", op, "path.display()", source)]
pub struct CopyError {
    pub op: &'static str,
    pub path: PathBuf,
    pub source: io::Error,
}

impl std::error::Error for CopyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

pub type CopyResult<T> = Result<T, CopyError>;

/// Attaches the failed operation and path to an io error
trait During<T> {
    fn during(self, op: &'static str, path: &Path) -> CopyResult<T>;
}

impl<T> During<T> for io::Result<T> {
    fn during(self, op: &'static str, path: &Path) -> CopyResult<T> {
        self.map_err(|source| CopyError {
            op,
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Prepares the directory repositories are cloned into. A stray file
/// sitting where the directory should be is replaced.
pub async fn create_directory(path: impl AsRef<Path>) -> io::Result<()> {
    let path = path.as_ref();
    match metadata(path).await {
        Ok(existing) if existing.is_dir() => return Ok(()),
        Ok(_) => remove_file(path).await?,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(err),
    }
    create_dir_all(path).await
}

/// Copies the contents of `src` into `dest` recursively. Directories,
/// regular files and symbolic links are recreated with the ownership
/// and permission bits of their source entry. Symbolic links are never
/// followed, neither in `src` nor in `dest`.
///
/// The first failure aborts the copy and is returned. Entries which
/// were already written are left in place.
pub fn copy_directory(src: &Path, dest: &Path) -> CopyResult<()> {
    let walker = WalkDir::new(src)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name();

    for entry in walker {
        let entry = entry.map_err(|err| walk_error(src, err))?;
        let source_path = entry.path();

        let Ok(relative_path) = source_path.strip_prefix(src) else {
            continue;
        };
        let dest_path = dest.join(relative_path);

        let metadata = entry.metadata().map_err(|err| walk_error(src, err))?;
        let file_type = entry.file_type();

        if file_type.is_dir() {
            remove_symlink(&dest_path)?;
            create_if_not_exists(&dest_path, DIRECTORY_MODE)?;
        } else if file_type.is_symlink() {
            copy_symlink(source_path, &dest_path)?;
        } else {
            copy_file(source_path, &dest_path)?;
        }

        lchown(&dest_path, Some(metadata.uid()), Some(metadata.gid()))
            .during("change owner of", &dest_path)?;

        // Symlink permission bits aren't meaningful and chmod would follow the link
        if !file_type.is_symlink() {
            fs::set_permissions(&dest_path, Permissions::from_mode(metadata.mode() & 0o7777))
                .during("change mode of", &dest_path)?;
        }
    }
    Ok(())
}

fn walk_error(src: &Path, err: walkdir::Error) -> CopyError {
    let path = err.path().unwrap_or(src).to_path_buf();
    CopyError {
        op: "read directory",
        path,
        source: io::Error::from(err),
    }
}

/// Removes `path` if it is a symbolic link so the entry replacing it
/// isn't written through the link
fn remove_symlink(path: &Path) -> CopyResult<()> {
    if let Ok(existing) = fs::symlink_metadata(path) {
        if existing.file_type().is_symlink() {
            fs::remove_file(path).during("replace", path)?;
        }
    }
    Ok(())
}

/// Creates the directory at `path` with `mode` unless something
/// already exists there. Existing directories keep their mode.
fn create_if_not_exists(path: &Path, mode: u32) -> CopyResult<()> {
    if fs::symlink_metadata(path).is_ok() {
        return Ok(());
    }
    DirBuilder::new()
        .recursive(true)
        .mode(mode)
        .create(path)
        .during("create directory", path)
}

/// Byte copies `src` over `dest` truncating any existing contents
fn copy_file(src: &Path, dest: &Path) -> CopyResult<()> {
    remove_symlink(dest)?;

    // A previous overlay may have left a read-only copy behind
    if let Ok(existing) = fs::symlink_metadata(dest) {
        if existing.is_file() && existing.permissions().readonly() {
            fs::set_permissions(dest, Permissions::from_mode(existing.mode() | 0o200))
                .during("change mode of", dest)?;
        }
    }

    let mut input = File::open(src).during("open", src)?;
    let mut output = File::create(dest).during("create", dest)?;
    let written = io::copy(&mut input, &mut output).during("copy into", dest)?;
    debug!("Copied {} bytes to {}", written, dest.display());
    Ok(())
}

/// Recreates the link at `src` as `dest` pointing to the same target
fn copy_symlink(src: &Path, dest: &Path) -> CopyResult<()> {
    let target = fs::read_link(src).during("read link", src)?;

    if let Ok(existing) = fs::symlink_metadata(dest) {
        if !existing.is_dir() {
            fs::remove_file(dest).during("replace", dest)?;
        }
    }

    symlink(&target, dest).during("create symlink", dest)
}
