//! Scope predicates deciding whether a middleware entry applies to a request.
//!
//! A scope combines three rules, all of which must hold:
//! * the request method is one of the configured methods (unset means any)
//! * the path matches at least one include pattern (unset means any)
//! * the path matches none of the exclude patterns
//!
//! Patterns are compiled once at registration so malformed input fails at
//! startup instead of on the request path.
use http::Method;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Order assigned to entries that do not specify one.
pub const DEFAULT_ORDER: i32 = 100;

/// Errors raised while compiling a [`MiddlewareScope`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ScopeConfigError {
    #[error("Path pattern must not be empty")]
    EmptyPattern,

    #[error("Path pattern '{pattern}' must start with '/'")]
    MissingLeadingSlash { pattern: String },

    #[error("Path pattern '{pattern}' may only use '*' or '/**' as its final element")]
    MisplacedWildcard { pattern: String },

    #[error("Path pattern '{pattern}' must not contain a query string or fragment")]
    QueryInPattern { pattern: String },

    #[error("Invalid HTTP method '{method}'")]
    InvalidMethod { method: String },
}

/// Declarative scope attached to a middleware entry (serde friendly).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MiddlewareScope {
    /// Include patterns; `None` applies to every path
    pub paths: Option<Vec<String>>,
    /// Patterns that always disable the entry
    pub exclude_paths: Option<Vec<String>>,
    /// Allowed methods; `None` applies to every method
    pub methods: Option<Vec<String>>,
    /// Ascending execution order, ties keep registration order
    pub order: i32,
}

impl Default for MiddlewareScope {
    fn default() -> Self {
        Self {
            paths: None,
            exclude_paths: None,
            methods: None,
            order: DEFAULT_ORDER,
        }
    }
}

impl MiddlewareScope {
    pub fn paths<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.paths = Some(paths.into_iter().map(Into::into).collect());
        self
    }

    pub fn exclude_paths<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude_paths = Some(paths.into_iter().map(Into::into).collect());
        self
    }

    pub fn methods<I, S>(mut self, methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.methods = Some(methods.into_iter().map(Into::into).collect());
        self
    }

    pub fn order(mut self, order: i32) -> Self {
        self.order = order;
        self
    }
}

/// A single compiled path pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathPattern {
    /// Exact string equality
    Exact(String),
    /// `prefix/**`: the prefix itself or anything below it at a segment boundary
    Subtree(String),
    /// `prefix*`: the prefix followed by the rest of a single segment
    Segment(String),
}

impl PathPattern {
    /// Compile a textual pattern.
    pub fn parse(pattern: &str) -> Result<Self, ScopeConfigError> {
        if pattern.is_empty() {
            return Err(ScopeConfigError::EmptyPattern);
        }
        if !pattern.starts_with('/') {
            return Err(ScopeConfigError::MissingLeadingSlash {
                pattern: pattern.to_string(),
            });
        }
        if pattern.contains(['?', '#']) {
            return Err(ScopeConfigError::QueryInPattern {
                pattern: pattern.to_string(),
            });
        }

        let misplaced = || ScopeConfigError::MisplacedWildcard {
            pattern: pattern.to_string(),
        };

        if let Some(prefix) = pattern.strip_suffix("/**") {
            if prefix.contains('*') {
                return Err(misplaced());
            }
            return Ok(PathPattern::Subtree(prefix.to_string()));
        }
        if let Some(prefix) = pattern.strip_suffix('*') {
            if prefix.contains('*') {
                return Err(misplaced());
            }
            return Ok(PathPattern::Segment(prefix.to_string()));
        }
        if pattern.contains('*') {
            return Err(misplaced());
        }
        Ok(PathPattern::Exact(pattern.to_string()))
    }

    /// Case-sensitive match against a bare path (no query string).
    pub fn matches(&self, path: &str) -> bool {
        match self {
            PathPattern::Exact(expected) => path == expected,
            PathPattern::Subtree(prefix) => path
                .strip_prefix(prefix.as_str())
                .is_some_and(|rest| rest.is_empty() || rest.starts_with('/')),
            PathPattern::Segment(prefix) => path
                .strip_prefix(prefix.as_str())
                .is_some_and(|rest| !rest.contains('/')),
        }
    }
}

/// Compiled form of a [`MiddlewareScope`].
#[derive(Debug, Clone)]
pub struct ScopeMatcher {
    methods: Option<Vec<Method>>,
    include: Option<Vec<PathPattern>>,
    exclude: Vec<PathPattern>,
    order: i32,
}

impl Default for ScopeMatcher {
    fn default() -> Self {
        Self {
            methods: None,
            include: None,
            exclude: Vec::new(),
            order: DEFAULT_ORDER,
        }
    }
}

impl ScopeMatcher {
    /// Compile a scope, rejecting malformed patterns and method names.
    pub fn compile(scope: &MiddlewareScope) -> Result<Self, ScopeConfigError> {
        let methods = scope
            .methods
            .as_ref()
            .map(|methods| {
                methods
                    .iter()
                    .map(|raw| {
                        Method::from_bytes(raw.trim().to_ascii_uppercase().as_bytes()).map_err(
                            |_| ScopeConfigError::InvalidMethod {
                                method: raw.clone(),
                            },
                        )
                    })
                    .collect::<Result<Vec<_>, _>>()
            })
            .transpose()?;

        let include = scope
            .paths
            .as_ref()
            .map(|paths| compile_patterns(paths))
            .transpose()?;

        let exclude = match &scope.exclude_paths {
            Some(paths) => compile_patterns(paths)?,
            None => Vec::new(),
        };

        Ok(Self {
            methods,
            include,
            exclude,
            order: scope.order,
        })
    }

    pub fn order(&self) -> i32 {
        self.order
    }

    /// Whether an entry with this scope applies to the given request.
    pub fn applies(&self, method: &Method, path: &str) -> bool {
        let path = path.split_once('?').map_or(path, |(bare, _)| bare);

        if let Some(methods) = &self.methods {
            if !methods.contains(method) {
                return false;
            }
        }

        if let Some(include) = &self.include {
            if !include.iter().any(|pattern| pattern.matches(path)) {
                return false;
            }
        }

        !self.exclude.iter().any(|pattern| pattern.matches(path))
    }
}

fn compile_patterns(patterns: &[String]) -> Result<Vec<PathPattern>, ScopeConfigError> {
    patterns.iter().map(|p| PathPattern::parse(p)).collect()
}
