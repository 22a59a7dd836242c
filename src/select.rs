//! Entry selection and destination naming
//!
//! Both seams are traits so callers can plug in closures for quick filters
//! or fallible implementations that reject malformed paths.

use crate::error::{FanoutError, Result};

/// Decides whether an archive entry is forwarded or drained.
///
/// Must be pure: the same path always produces the same answer.
pub trait EntrySelector: Send + Sync {
    fn select(&self, path: &str) -> Result<bool>;
}

impl<F> EntrySelector for F
where
    F: Fn(&str) -> bool + Send + Sync,
{
    fn select(&self, path: &str) -> Result<bool> {
        Ok(self(path))
    }
}

/// Derives the destination object key for a selected entry.
pub trait DestinationNamer: Send + Sync {
    fn destination(&self, path: &str) -> Result<String>;
}

impl<F> DestinationNamer for F
where
    F: Fn(&str) -> String + Send + Sync,
{
    fn destination(&self, path: &str) -> Result<String> {
        Ok(self(path))
    }
}

/// Last component of a `/`-separated archive path.
///
/// A trailing slash is ignored, so `docs/` yields `docs`.
pub fn basename(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(idx) => &trimmed[idx + 1..],
        None => trimmed,
    }
}

/// Extension of the basename including its dot, or `""`.
///
/// A leading dot does not start an extension: `.pdf` has none, `.c.pdf`
/// has `.pdf`.
pub fn extension(path: &str) -> &str {
    let name = basename(path);
    match name.rfind('.') {
        Some(0) | None => "",
        Some(idx) => &name[idx..],
    }
}

/// Selects entries by extension, optionally skipping hidden files.
#[derive(Debug, Clone)]
pub struct ExtensionFilter {
    extensions: Vec<String>,
    skip_hidden: bool,
    ignore_case: bool,
}

impl Default for ExtensionFilter {
    fn default() -> Self {
        Self::new([".xlsx", ".pdf"])
    }
}

impl ExtensionFilter {
    /// Match any of `extensions` (each with its leading dot); hidden files
    /// are skipped.
    pub fn new<I, S>(extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            extensions: extensions.into_iter().map(Into::into).collect(),
            skip_hidden: true,
            ignore_case: false,
        }
    }

    /// Also accept basenames that start with `.`
    pub fn include_hidden(mut self, include: bool) -> Self {
        self.skip_hidden = !include;
        self
    }

    /// Compare extensions ASCII case-insensitively
    pub fn ignore_case(mut self, ignore: bool) -> Self {
        self.ignore_case = ignore;
        self
    }

    pub fn extensions(&self) -> &[String] {
        &self.extensions
    }

    fn matches(&self, path: &str) -> bool {
        let ext = extension(path);
        if ext.is_empty() {
            return false;
        }
        if self.skip_hidden && basename(path).starts_with('.') {
            return false;
        }
        self.extensions.iter().any(|candidate| {
            if self.ignore_case {
                candidate.eq_ignore_ascii_case(ext)
            } else {
                candidate == ext
            }
        })
    }
}

impl EntrySelector for ExtensionFilter {
    fn select(&self, path: &str) -> Result<bool> {
        Ok(self.matches(path))
    }
}

/// Names the destination `prefix + basename(path)`.
#[derive(Debug, Clone)]
pub struct PrefixNamer {
    prefix: String,
}

impl Default for PrefixNamer {
    fn default() -> Self {
        Self::new("unzipped/")
    }
}

impl PrefixNamer {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

impl DestinationNamer for PrefixNamer {
    fn destination(&self, path: &str) -> Result<String> {
        let name = basename(path);
        if name.is_empty() {
            return Err(FanoutError::SelectorError {
                path: path.to_string(),
                message: "path has no file name".to_string(),
            });
        }
        Ok(format!("{}{}", self.prefix, name))
    }
}
