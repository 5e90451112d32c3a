//! Submission - one unit of untrusted code plus its input

use std::path::{Component, Path};

use super::limits::LimitOverride;
use crate::error::{EngineError, Result};

/// Name of the stdin file materialised in every sandbox root.
pub const STDIN_FILE: &str = "stdin.txt";

/// A source file of a submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    /// Path relative to the sandbox root. `None` means "the language's
    /// default source file name".
    pub path: Option<String>,
    pub content: Vec<u8>,
}

/// Immutable once admitted by the scheduler.
#[derive(Debug, Clone)]
pub struct Submission {
    pub language: String,
    pub files: Vec<SourceFile>,
    pub stdin: Vec<u8>,
    pub limits: LimitOverride,
    /// Tenant key for the optional per-tenant concurrency ceiling
    pub tenant: Option<String>,
}

impl Submission {
    /// Single-file submission written under the language's default file name.
    pub fn new(language: impl Into<String>, code: impl Into<Vec<u8>>) -> Self {
        Self {
            language: language.into(),
            files: vec![SourceFile {
                path: None,
                content: code.into(),
            }],
            stdin: Vec::new(),
            limits: LimitOverride::default(),
            tenant: None,
        }
    }

    /// Submission with no files yet; add them with [`Submission::with_file`].
    pub fn empty(language: impl Into<String>) -> Self {
        Self {
            language: language.into(),
            files: Vec::new(),
            stdin: Vec::new(),
            limits: LimitOverride::default(),
            tenant: None,
        }
    }

    pub fn with_file(mut self, path: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        self.files.push(SourceFile {
            path: Some(path.into()),
            content: content.into(),
        });
        self
    }

    pub fn with_stdin(mut self, stdin: impl Into<Vec<u8>>) -> Self {
        self.stdin = stdin.into();
        self
    }

    pub fn with_limits(mut self, limits: LimitOverride) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_tenant(mut self, tenant: impl Into<String>) -> Self {
        self.tenant = Some(tenant.into());
        self
    }

    /// Reject submissions that could escape the sandbox root or are ambiguous.
    pub fn validate(&self) -> Result<()> {
        if self.files.is_empty() {
            return Err(EngineError::InvalidSubmission(
                "submission contains no source files".into(),
            ));
        }

        let unnamed = self.files.iter().filter(|f| f.path.is_none()).count();
        if unnamed > 1 {
            return Err(EngineError::InvalidSubmission(
                "only one source file may omit its name".into(),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for path in self.files.iter().filter_map(|f| f.path.as_deref()) {
            if !is_safe_path(path) {
                return Err(EngineError::InvalidSubmission(format!(
                    "unsafe file path: {:?}",
                    path
                )));
            }
            if path == STDIN_FILE {
                return Err(EngineError::InvalidSubmission(format!(
                    "file name {} is reserved",
                    STDIN_FILE
                )));
            }
            if !seen.insert(path) {
                return Err(EngineError::InvalidSubmission(format!(
                    "duplicate file path: {}",
                    path
                )));
            }
        }

        Ok(())
    }
}

/// Check if a file path is safe (relative, no traversal)
pub fn is_safe_path(path: &str) -> bool {
    if path.is_empty() || path.contains('\0') {
        return false;
    }
    Path::new(path)
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safe_paths() {
        assert!(is_safe_path("main.cpp"));
        assert!(is_safe_path("src/lib/util.h"));
        assert!(is_safe_path("./main.py"));
        assert!(!is_safe_path(""));
        assert!(!is_safe_path("/etc/passwd"));
        assert!(!is_safe_path("../main.py"));
        assert!(!is_safe_path("src/../../x"));
    }

    #[test]
    fn test_validate_rejects_bad_submissions() {
        assert!(Submission::empty("python").validate().is_err());

        let mixed = Submission::new("python", "print(1)").with_file("a.py", "x");
        assert!(mixed.validate().is_ok());

        let mut ambiguous = Submission::new("python", "print(1)");
        ambiguous.files.push(SourceFile {
            path: None,
            content: b"x".to_vec(),
        });
        assert!(matches!(
            ambiguous.validate(),
            Err(EngineError::InvalidSubmission(_))
        ));

        let dup = Submission::empty("cpp")
            .with_file("a.cpp", "")
            .with_file("a.cpp", "");
        assert!(dup.validate().is_err());

        let escape = Submission::empty("cpp").with_file("../a.cpp", "");
        assert!(escape.validate().is_err());

        let reserved = Submission::empty("cpp").with_file(STDIN_FILE, "");
        assert!(reserved.validate().is_err());
    }
}
