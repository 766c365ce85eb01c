//! Function source capture
//!
//! The engine never inspects a callable itself; it consumes a [`FuncSource`]
//! describing where the callable came from and what its definition looks
//! like. The [`callable!`] macro captures all of that at the call site with
//! `module_path!`, `stringify!`, `file!` and `line!`, but a `FuncSource` can
//! just as well be built by hand (e.g. for generated code).
//!
//! The recorded source is stored with a `// first line: N` header so a
//! later process can tell a redefinition apart from a name collision even
//! when only the line number moved.

use memoir_store::FuncId;
use std::path::PathBuf;

/// Header prefix of stored source text.
pub const FIRST_LINE_TEXT: &str = "// first line:";

/// Name given to callables without one, matching how rustc renders closures.
pub const ANONYMOUS_NAME: &str = "{{closure}}";

/// Origin and definition of a cached callable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FuncSource {
    /// `::`-separated module qualifier (as produced by `module_path!`)
    pub module: String,
    /// Function name, or [`ANONYMOUS_NAME`] when there is none
    pub name: String,
    /// Source text of the definition
    pub code: String,
    /// File the definition lives in, when known
    pub file: Option<PathBuf>,
    /// 1-based line the definition starts on, when known
    pub first_line: Option<u32>,
}

impl FuncSource {
    /// Describe a named callable.
    #[must_use]
    pub fn new(module: impl Into<String>, name: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            name: name.into(),
            code: code.into(),
            file: None,
            first_line: None,
        }
    }

    /// Describe a callable without a usable name.
    ///
    /// Collisions between anonymous callables in the same module cannot be
    /// detected; the engine warns about this at cache time.
    #[must_use]
    pub fn anonymous(module: impl Into<String>, code: impl Into<String>) -> Self {
        Self::new(module, ANONYMOUS_NAME, code)
    }

    /// Attach the definition's file and first line.
    #[must_use]
    pub fn at(mut self, file: impl Into<PathBuf>, first_line: u32) -> Self {
        self.file = Some(file.into());
        self.first_line = Some(first_line);
        self
    }

    /// Whether the callable has no usable name.
    #[must_use]
    pub fn is_anonymous(&self) -> bool {
        self.name == ANONYMOUS_NAME
    }

    /// The path-like identifier derived from module and name.
    #[must_use]
    pub fn func_id(&self) -> FuncId {
        FuncId::from_qualified(&self.module, &self.name)
    }

    /// Short human-readable description for warnings.
    #[must_use]
    pub fn describe(&self) -> String {
        match (&self.file, self.first_line) {
            (Some(file), Some(line)) => format!("{} ({}:{line})", self.name, file.display()),
            _ => self.name.clone(),
        }
    }

    /// Encode the source for storage, with the first-line header.
    #[must_use]
    pub fn encode_stored(&self) -> String {
        let line = self.first_line.map_or(-1, i64::from);
        format!("{FIRST_LINE_TEXT} {line}\n{}", self.code)
    }
}

/// Split stored source text into `(code, first_line)`.
///
/// Text without the header (or with a `-1` marker) yields `None` for the
/// line, meaning the recorded definition could not be located on disk.
#[must_use]
pub fn extract_first_line(stored: &str) -> (String, Option<u32>) {
    if let Some(rest) = stored.strip_prefix(FIRST_LINE_TEXT) {
        let (header, code) = rest.split_once('\n').unwrap_or((rest, ""));
        let first_line = header
            .trim()
            .parse::<i64>()
            .ok()
            .and_then(|n| u32::try_from(n).ok());
        (code.to_string(), first_line)
    } else {
        (stored.to_string(), None)
    }
}

/// Capture a callable together with its [`FuncSource`].
///
/// Expands to a `(FuncSource, F)` pair suitable for
/// [`Memory::cache`](crate::Memory::cache):
///
/// ```
/// let (source, twice) = memoir_core::callable!(twice = |x: &i64| x * 2);
/// assert_eq!(source.name, "twice");
/// assert_eq!(twice(&21), 42);
/// ```
///
/// Without a name the callable is recorded as anonymous and collision
/// detection is disabled for it:
///
/// ```
/// let (source, _f) = memoir_core::callable!(|x: &i64| x + 1);
/// assert!(source.is_anonymous());
/// ```
#[macro_export]
macro_rules! callable {
    ($name:ident = $f:expr) => {
        (
            $crate::FuncSource::new(module_path!(), stringify!($name), stringify!($f))
                .at(file!(), line!()),
            $f,
        )
    };
    ($f:expr) => {
        (
            $crate::FuncSource::anonymous(module_path!(), stringify!($f)).at(file!(), line!()),
            $f,
        )
    };
}
