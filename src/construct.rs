//! Construct identifiers for traced program elements
//!
//! A construct is a uniquely named program element: a method, constructor,
//! static initializer, type or package. Identifiers arrive from instrumented
//! call sites as qualified names (parameter types already de-qualified to
//! simple names) and are parsed into [`ConstructId`] values that the rest of
//! the crate treats as opaque keys.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Language of the monitored program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Lang {
    Java,
    Py,
}

/// Kind of a traced construct, serialized as the backend's short tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ConstructKind {
    #[serde(rename = "PACK")]
    Package,
    #[serde(rename = "CLAS")]
    Class,
    #[serde(rename = "METH")]
    Method,
    #[serde(rename = "CONS")]
    Constructor,
    #[serde(rename = "INIT")]
    StaticInit,
}

impl fmt::Display for ConstructKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConstructKind::Package => "package",
            ConstructKind::Class => "class",
            ConstructKind::Method => "method",
            ConstructKind::Constructor => "constructor",
            ConstructKind::StaticInit => "static initializer",
        };
        f.write_str(s)
    }
}

/// Error raised when a callback hands over a name that cannot be parsed
/// into a construct of the requested kind.
#[derive(Debug, Error)]
#[error("invalid {kind} name [{name}]")]
pub struct NameParseError {
    pub kind: ConstructKind,
    pub name: String,
}

/// Identity of a traced construct. Equality, ordering and hashing cover all
/// three fields, so identical constructs observed through different loaders
/// collapse to one key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConstructId {
    pub lang: Lang,
    #[serde(rename = "type")]
    pub kind: ConstructKind,
    pub qname: String,
}

/// Marker suffix of static initializer names.
const STATIC_INIT_SUFFIX: &str = ".<clinit>";

impl ConstructId {
    pub fn new(lang: Lang, kind: ConstructKind, qname: impl Into<String>) -> Self {
        Self {
            lang,
            kind,
            qname: qname.into(),
        }
    }

    /// Parse a method name of the shape `com.acme.Foo.bar(String,int)`.
    pub fn parse_method_qname(lang: Lang, name: &str) -> Result<Self, NameParseError> {
        let prefix = routine_prefix(name)
            .ok_or_else(|| parse_error(ConstructKind::Method, name))?;
        // The part before the parameter list must hold both a type and a
        // method name.
        if !prefix.contains('.') {
            return Err(parse_error(ConstructKind::Method, name));
        }
        Ok(Self::new(lang, ConstructKind::Method, name))
    }

    /// Parse a constructor name of the shape `com.acme.Foo(String)`.
    pub fn parse_constructor_qname(lang: Lang, name: &str) -> Result<Self, NameParseError> {
        routine_prefix(name).ok_or_else(|| parse_error(ConstructKind::Constructor, name))?;
        Ok(Self::new(lang, ConstructKind::Constructor, name))
    }

    /// Parse a static initializer name. Accepts either the bare type name or
    /// the canonical `com.acme.Foo.<clinit>` form; the result is always
    /// canonical.
    pub fn parse_static_init_qname(lang: Lang, name: &str) -> Result<Self, NameParseError> {
        if name.is_empty() || name.contains('(') {
            return Err(parse_error(ConstructKind::StaticInit, name));
        }
        let qname = if name.ends_with(STATIC_INIT_SUFFIX) {
            name.to_string()
        } else {
            format!("{name}{STATIC_INIT_SUFFIX}")
        };
        Ok(Self::new(lang, ConstructKind::StaticInit, qname))
    }

    /// Qualified name of the type declaring this construct, if it is a
    /// member (method, constructor or static initializer).
    pub fn declaring_type_name(&self) -> Option<&str> {
        match self.kind {
            ConstructKind::Method => {
                let prefix = routine_prefix(&self.qname)?;
                let dot = prefix.rfind('.')?;
                Some(&prefix[..dot])
            }
            // A constructor carries the type name directly in front of the
            // parameter list.
            ConstructKind::Constructor => routine_prefix(&self.qname),
            ConstructKind::StaticInit => self.qname.strip_suffix(STATIC_INIT_SUFFIX),
            ConstructKind::Class | ConstructKind::Package => None,
        }
    }

    /// The type construct a member belongs to (`None` for types and
    /// packages).
    pub fn definition_context(&self) -> Option<ConstructId> {
        self.declaring_type_name()
            .map(|t| ConstructId::new(self.lang, ConstructKind::Class, t))
    }

    /// The package a member or type belongs to. Constructs in the default
    /// package have none.
    pub fn package_id(&self) -> Option<ConstructId> {
        let type_name = match self.kind {
            ConstructKind::Class => Some(self.qname.as_str()),
            ConstructKind::Package => None,
            _ => self.declaring_type_name(),
        }?;
        let dot = type_name.rfind('.')?;
        Some(ConstructId::new(
            self.lang,
            ConstructKind::Package,
            &type_name[..dot],
        ))
    }

    /// Simple (unqualified) routine name, e.g. `bar` for
    /// `com.acme.Foo.bar(String)`. Types and packages yield their full name.
    pub fn simple_routine_name(&self) -> &str {
        match self.kind {
            ConstructKind::Method => {
                let prefix = routine_prefix(&self.qname).unwrap_or(&self.qname);
                match prefix.rfind('.') {
                    Some(dot) => &prefix[dot + 1..],
                    None => prefix,
                }
            }
            ConstructKind::Constructor => "<init>",
            ConstructKind::StaticInit => "<clinit>",
            _ => &self.qname,
        }
    }
}

impl fmt::Display for ConstructId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.kind, self.qname)
    }
}

fn parse_error(kind: ConstructKind, name: &str) -> NameParseError {
    NameParseError {
        kind,
        name: name.to_string(),
    }
}

/// Part of a routine name in front of its parameter list, or `None` if the
/// name has no well-formed parameter list.
fn routine_prefix(name: &str) -> Option<&str> {
    let open = name.find('(')?;
    if open == 0 || !name.ends_with(')') {
        return None;
    }
    Some(&name[..open])
}
