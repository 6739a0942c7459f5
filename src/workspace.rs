use crate::stages::archive::zip_entries;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

const DIR_PREFIX: &str = "denss-";

/// Working directory of a job, derived from its id so leftovers can be
/// traced back to the job that made them.
pub fn job_dir(work_root: &Path, job_id: i64) -> PathBuf {
    work_root.join(format!("{}{}", DIR_PREFIX, job_id))
}

pub async fn create(work_root: &Path, job_id: i64) -> io::Result<PathBuf> {
    let dir = job_dir(work_root, job_id);
    tokio::fs::create_dir_all(&dir).await?;
    set_private(&dir).await?;
    Ok(dir)
}

#[cfg(unix)]
async fn set_private(dir: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700)).await
}

#[cfg(not(unix))]
async fn set_private(_dir: &Path) -> io::Result<()> {
    Ok(())
}

/// Removes a job's working directory. Failure is only logged.
pub async fn remove(dir: &Path) {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => debug!(dir = %dir.display(), "Removed working directory"),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => warn!(dir = %dir.display(), error = %err, "Failed to remove working directory"),
    }
}

/// Job ids of working directories still present under `work_root`.
pub async fn scan_orphans(work_root: &Path) -> io::Result<Vec<i64>> {
    let work_root = work_root.to_path_buf();
    tokio::task::spawn_blocking(move || list_job_dirs(&work_root))
        .await
        .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?
}

fn list_job_dirs(work_root: &Path) -> io::Result<Vec<i64>> {
    let mut ids = Vec::new();
    for entry in std::fs::read_dir(work_root)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name();
        if let Some(id) = name
            .to_str()
            .and_then(|name| name.strip_prefix(DIR_PREFIX))
            .and_then(|id| id.parse::<i64>().ok())
        {
            ids.push(id);
        }
    }
    ids.sort_unstable();
    Ok(ids)
}

/// Zips every file under `dir` into `<failed_root>/denss-<id>.zip` for
/// post-mortem inspection.
pub async fn archive_failed(dir: &Path, failed_root: &Path, job_id: i64) -> anyhow::Result<PathBuf> {
    let dir = dir.to_path_buf();
    let target = failed_root.join(format!("{}{}.zip", DIR_PREFIX, job_id));
    let destination = target.clone();

    tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
        let mut files = Vec::new();
        for entry in WalkDir::new(&dir).sort_by_file_name() {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry
                .path()
                .strip_prefix(&dir)?
                .to_string_lossy()
                .into_owned();
            files.push((name, std::fs::read(entry.path())?));
        }

        let archive = zip_entries(
            files
                .iter()
                .map(|(name, body)| (name.as_str(), body.as_slice())),
        )?;
        std::fs::create_dir_all(destination.parent().unwrap_or(Path::new(".")))?;
        std::fs::write(&destination, archive)?;
        Ok(())
    })
    .await??;

    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[tokio::test]
    async fn create_and_remove() {
        let root = tempfile::tempdir().unwrap();
        let dir = create(root.path(), 42).await.unwrap();

        assert_eq!(dir, root.path().join("denss-42"));
        assert!(dir.is_dir());

        remove(&dir).await;
        assert!(!dir.exists());
        // Removing twice is harmless.
        remove(&dir).await;
    }

    #[tokio::test]
    async fn orphans_are_found_by_name() {
        let root = tempfile::tempdir().unwrap();
        create(root.path(), 7).await.unwrap();
        create(root.path(), 3).await.unwrap();
        std::fs::create_dir(root.path().join("denss-notanid")).unwrap();
        std::fs::create_dir(root.path().join("unrelated")).unwrap();
        std::fs::write(root.path().join("denss-9"), b"file, not dir").unwrap();

        assert_eq!(scan_orphans(root.path()).await.unwrap(), vec![3, 7]);
        assert!(scan_orphans(&root.path().join("absent")).await.is_err());
    }

    #[tokio::test]
    async fn failed_archive_keeps_nested_files() {
        let root = tempfile::tempdir().unwrap();
        let failed = root.path().join("failed");
        let dir = create(root.path(), 5).await.unwrap();
        std::fs::write(dir.join("worker.log"), b"denss exited 3").unwrap();
        std::fs::create_dir(dir.join("spt_01")).unwrap();
        std::fs::write(dir.join("spt_01").join("fsc_0.txt"), b"0.1 0.9").unwrap();

        let zip_path = archive_failed(&dir, &failed, 5).await.unwrap();
        assert_eq!(zip_path, failed.join("denss-5.zip"));

        let mut archive = zip::ZipArchive::new(std::fs::File::open(&zip_path).unwrap()).unwrap();
        let mut log = String::new();
        archive
            .by_name("worker.log")
            .unwrap()
            .read_to_string(&mut log)
            .unwrap();
        assert_eq!(log, "denss exited 3");
        assert!(archive.by_name("spt_01/fsc_0.txt").is_ok());
    }
}
