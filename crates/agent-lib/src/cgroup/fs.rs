use async_trait::async_trait;
use std::io;
use std::path::Path;
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Read/write primitive for cgroup control files
#[async_trait]
pub trait CgroupFs: Send + Sync {
    async fn read(&self, path: &Path) -> io::Result<String>;

    async fn write(&self, path: &Path, content: &str) -> io::Result<()>;
}

/// Cgroup files on the host filesystem
#[derive(Debug, Clone, Copy, Default)]
pub struct HostCgroupFs;

#[async_trait]
impl CgroupFs for HostCgroupFs {
    async fn read(&self, path: &Path) -> io::Result<String> {
        fs::read_to_string(path).await
    }

    async fn write(&self, path: &Path, content: &str) -> io::Result<()> {
        // Control files are created by the kernel; a missing file means the
        // cgroup is gone and must not be recreated as a regular file.
        let mut file = fs::OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(path)
            .await?;
        // The kernel only acts on a write(2); an empty cpuset is a lone newline.
        let bytes = if content.is_empty() { "\n" } else { content };
        file.write_all(bytes.as_bytes()).await?;
        file.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_write_existing_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("cpuset.cpus");
        fs::write(&path, "0-15\n").await.unwrap();

        HostCgroupFs.write(&path, "0-3").await.unwrap();
        assert_eq!(HostCgroupFs.read(&path).await.unwrap(), "0-3");
    }

    #[tokio::test]
    async fn test_write_missing_file_fails() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("gone").join("cpuset.cpus");

        let err = HostCgroupFs.write(&path, "0-3").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_write_empty_clears_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("cpuset.cpus");
        fs::write(&path, "0-15\n").await.unwrap();

        HostCgroupFs.write(&path, "").await.unwrap();
        assert_eq!(HostCgroupFs.read(&path).await.unwrap(), "\n");
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_write_empty_reaches_the_kernel() {
        // /dev/full fails every write(2), so an empty update must surface ENOSPC
        let path = Path::new("/dev/full");
        if !path.exists() {
            return;
        }

        assert!(HostCgroupFs.write(path, "").await.is_err());
    }
}
