use std::{
  error,
  fs,
  io,
  path::{
    Path,
    PathBuf,
  },
  str,
};

use anyhow::Context;

/// A filesystem root that absolute sysfs and procfs paths are resolved
/// against.
///
/// Production code uses [`Root::system`]. Tests point it at a temporary
/// directory that mirrors the parts of `/sys` and `/proc` they care about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Root {
  base: PathBuf,
}

impl Root {
  pub fn system() -> Self {
    Self::new("/")
  }

  pub fn new(base: impl Into<PathBuf>) -> Self {
    Self { base: base.into() }
  }

  /// Resolve `path` below this root. Leading slashes are ignored, so
  /// `"/sys/class"` and `"sys/class"` resolve to the same location.
  pub fn path(&self, path: impl AsRef<Path>) -> PathBuf {
    let path = path.as_ref();

    self.base.join(path.strip_prefix("/").unwrap_or(path))
  }

  pub fn exists(&self, path: impl AsRef<Path>) -> bool {
    self.path(path).exists()
  }

  pub fn read(&self, path: impl AsRef<Path>) -> anyhow::Result<Option<String>> {
    let path = self.path(path);

    match fs::read_to_string(&path) {
      Ok(string) => Ok(Some(string.trim().to_owned())),

      Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(None),

      Err(error) => {
        Err(error)
          .context(format!("failed to read '{path}'", path = path.display()))
      },
    }
  }

  pub fn read_n<N: str::FromStr>(
    &self,
    path: impl AsRef<Path>,
  ) -> anyhow::Result<Option<N>>
  where
    N::Err: error::Error + Send + Sync + 'static,
  {
    let path = path.as_ref();

    let Some(content) = self.read(path)? else {
      return Ok(None);
    };

    let number = content.parse().with_context(|| {
      format!(
        "failed to parse contents of '{path}' as a number: '{content}'",
        path = self.path(path).display(),
      )
    })?;

    Ok(Some(number))
  }
}
