use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::thread::sleep;
use std::time::Duration;

const LOCK_RETRIES: u32 = 2000;
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(10);

/// Mutual exclusion visible to sibling processes: the lock is held while a
/// directory of the given name exists. Creation is atomic even across
/// processes, so whoever creates the directory owns the lock.
#[derive(Debug)]
pub struct DirLock {
    path: PathBuf,
}

impl DirLock {
    /// Acquire the lock, retrying for roughly twenty seconds before giving
    /// up on a holder that never releases.
    pub fn acquire(path: &Path) -> io::Result<DirLock> {
        for _ in 0..LOCK_RETRIES {
            match fs::create_dir(path) {
                Ok(()) => {
                    return Ok(DirLock {
                        path: path.to_path_buf(),
                    })
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    sleep(LOCK_RETRY_INTERVAL)
                }
                Err(e) => return Err(e),
            }
        }
        Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("gave up waiting for lock {}", path.display()),
        ))
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        fs::remove_dir(&self.path).ok();
    }
}
