use std::{
  error,
  fmt,
  fs::{
    self,
    File,
    OpenOptions,
  },
  io::{
    self,
    Write as _,
  },
  path::{
    Path,
    PathBuf,
  },
  process,
};

#[cfg(unix)] use nix::{
  errno::Errno,
  fcntl::{
    Flock,
    FlockArg,
  },
};

#[cfg(not(unix))]
compile_error!("cputhrottle is only supported on Unix-like systems");

/// Exclusive PID file, removed when dropped.
pub struct LockFile {
  _lock: Flock<File>,
  path:  PathBuf,
}

#[derive(Debug)]
pub enum LockError {
  /// Another instance holds the lock. `pid` is `None` when the file could
  /// not be parsed.
  Held { path: PathBuf, pid: Option<u32> },
  Io { path: PathBuf, source: io::Error },
  Flock { path: PathBuf, errno: Errno },
}

impl fmt::Display for LockError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Held {
        pid: Some(pid), ..
      } => write!(f, "another cputhrottle daemon is running (PID: {pid})"),

      Self::Held { path, pid: None } => {
        write!(
          f,
          "another cputhrottle daemon holds '{path}'",
          path = path.display(),
        )
      },

      Self::Io { path, source } => {
        write!(
          f,
          "failed to set up lock file '{path}': {source}",
          path = path.display(),
        )
      },

      Self::Flock { path, errno } => {
        write!(
          f,
          "failed to lock '{path}': {errno}",
          path = path.display(),
        )
      },
    }
  }
}

impl error::Error for LockError {
  fn source(&self) -> Option<&(dyn error::Error + 'static)> {
    match self {
      Self::Io { source, .. } => Some(source),
      Self::Flock { errno, .. } => Some(errno),
      Self::Held { .. } => None,
    }
  }
}

impl LockFile {
  pub fn path(&self) -> &Path {
    &self.path
  }

  /// Take the lock at `path`, writing our PID into it.
  ///
  /// When another instance holds it and `force` is set, a warning is logged
  /// and `Ok(None)` is returned: the caller runs unlocked.
  pub fn acquire(path: &Path, force: bool) -> Result<Option<Self>, LockError> {
    let io_error = |source| {
      LockError::Io {
        path: path.to_owned(),
        source,
      }
    };

    #[allow(clippy::suspicious_open_options)]
    let file = OpenOptions::new()
      .create(true)
      .read(true)
      .write(true)
      .open(path)
      .map_err(io_error)?;

    let mut lock = match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
      Ok(lock) => lock,

      Err((_, Errno::EWOULDBLOCK)) => {
        let pid = Self::read_pid(path);

        if !force {
          return Err(LockError::Held {
            path: path.to_owned(),
            pid,
          });
        }

        match pid {
          Some(pid) => {
            log::warn!(
              "another cputhrottle instance is running (PID: {pid}), starting \
               anyway"
            );
          },

          None => {
            log::warn!(
              "could not determine PID of existing cputhrottle instance, \
               starting anyway"
            );
          },
        }

        return Ok(None);
      },

      Err((_, errno)) => {
        return Err(LockError::Flock {
          path: path.to_owned(),
          errno,
        });
      },
    };

    lock.set_len(0).map_err(io_error)?;
    writeln!(lock, "{pid}", pid = process::id()).map_err(io_error)?;
    lock.sync_all().map_err(io_error)?;

    Ok(Some(Self {
      _lock: lock,
      path:  path.to_owned(),
    }))
  }

  fn read_pid(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
  }
}

impl Drop for LockFile {
  fn drop(&mut self) {
    let _ = fs::remove_file(&self.path);
  }
}
