//! Raw stack frames captured at instrumented call sites
//!
//! Frames arrive innermost-first, exactly as captured inside the monitored
//! process. They carry names and line numbers only; resolution against debug
//! metadata happens in [`crate::reconstruct`].

/// One captured stack frame. Structural equality and hashing make frames
/// usable as memoization keys for repeated call-site lookups.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RawFrame {
    /// Qualified name of the declaring type.
    pub type_name: String,
    /// Routine name as reported by the capture facility; constructors and
    /// static initializers use `<init>` and `<clinit>`.
    pub method_name: String,
    /// Source file name, if the capture facility knows it.
    pub file_name: Option<String>,
    /// 1-based source line of the call site, if known.
    pub line: Option<u32>,
}

impl RawFrame {
    pub fn new(type_name: impl Into<String>, method_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            method_name: method_name.into(),
            file_name: None,
            line: None,
        }
    }

    pub fn with_line(mut self, line: u32) -> Self {
        self.line = Some(line);
        self
    }

    /// Whether this frame belongs to the stack-capture machinery itself and
    /// must be skipped before path construction starts.
    pub fn is_capture_machinery(&self) -> bool {
        CAPTURE_FRAMES
            .iter()
            .any(|(t, m)| self.type_name == *t && self.method_name == *m)
    }
}

/// (type, method) pairs of the capture facilities seen in practice.
const CAPTURE_FRAMES: &[(&str, &str)] = &[
    ("java.lang.Thread", "getStackTrace"),
    ("java.lang.Throwable", "getStackTrace"),
];
