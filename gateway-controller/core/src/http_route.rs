use crate::ir::BackendRef;
use anyhow::Result;
pub use http::{
    header::{HeaderName, HeaderValue},
    uri::Scheme,
    Method, StatusCode,
};
use regex::Regex;
use std::{fmt, num::NonZeroU16, ops::Deref, str::FromStr};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HttpRouteMatch {
    pub path: Option<PathMatch>,
    pub headers: Vec<HeaderMatch>,
    pub query_params: Vec<QueryParamMatch>,
    pub method: Option<Method>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PathMatch {
    Exact(String),
    Prefix(String),
    Regex(Pattern),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HeaderMatch {
    Exact(HeaderName, HeaderValue),
    Regex(HeaderName, Pattern),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum QueryParamMatch {
    Exact(String, String),
    Regex(String, Pattern),
}

/// A compiled regular expression, compared by its source.
#[derive(Clone)]
pub struct Pattern(Regex);

#[derive(Clone, Debug, PartialEq)]
pub enum HttpFilter {
    RequestHeaderModifier(HeaderModifierFilter),
    ResponseHeaderModifier(HeaderModifierFilter),
    RequestRedirect(RequestRedirectFilter),
    UrlRewrite(UrlRewriteFilter),
    RequestMirror(BackendRef),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeaderModifierFilter {
    pub add: Vec<(HeaderName, HeaderValue)>,
    pub set: Vec<(HeaderName, HeaderValue)>,
    pub remove: Vec<HeaderName>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestRedirectFilter {
    pub scheme: Option<Scheme>,
    pub host: Option<String>,
    pub path: Option<PathModifier>,
    pub port: Option<NonZeroU16>,
    pub status: Option<StatusCode>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UrlRewriteFilter {
    pub host: Option<String>,
    pub path: Option<PathModifier>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PathModifier {
    Full(String),
    Prefix(String),
}

// === impl HttpRouteMatch ===

impl Default for HttpRouteMatch {
    /// Matches every request: a `/` prefix.
    fn default() -> Self {
        Self {
            path: Some(PathMatch::Prefix("/".to_string())),
            headers: vec![],
            query_params: vec![],
            method: None,
        }
    }
}

impl HttpRouteMatch {
    /// Returns true when every request matched by `self` is also matched by
    /// `parent`.
    ///
    /// Used when inlining delegated routes: a child match is only kept when it
    /// narrows its parent's match.
    pub fn is_contained_by(&self, parent: &HttpRouteMatch) -> bool {
        let path_ok = match (&parent.path, &self.path) {
            (None, _) => true,
            (Some(PathMatch::Prefix(p)), Some(PathMatch::Prefix(c)))
            | (Some(PathMatch::Prefix(p)), Some(PathMatch::Exact(c))) => c.starts_with(p.as_str()),
            (Some(PathMatch::Exact(p)), Some(PathMatch::Exact(c))) => p == c,
            (Some(PathMatch::Regex(p)), Some(PathMatch::Regex(c))) => p == c,
            _ => false,
        };
        let method_ok = match (&parent.method, &self.method) {
            (None, _) => true,
            (Some(p), Some(c)) => p == c,
            (Some(_), None) => false,
        };
        path_ok
            && method_ok
            && parent.headers.iter().all(|h| self.headers.contains(h))
            && parent.query_params.iter().all(|q| self.query_params.contains(q))
    }

    pub fn path_str(&self) -> &str {
        match &self.path {
            Some(PathMatch::Exact(p)) | Some(PathMatch::Prefix(p)) => p,
            Some(PathMatch::Regex(r)) => r.as_str(),
            None => "",
        }
    }
}

// === impl PathMatch ===

impl PathMatch {
    pub fn regex(s: &str) -> Result<Self> {
        Ok(Self::Regex(s.parse()?))
    }
}

// === impl Pattern ===

impl FromStr for Pattern {
    type Err = regex::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Regex::new(s).map(Self)
    }
}

impl Deref for Pattern {
    type Target = Regex;

    fn deref(&self) -> &Regex {
        &self.0
    }
}

impl PartialEq for Pattern {
    fn eq(&self, other: &Self) -> bool {
        self.0.as_str() == other.0.as_str()
    }
}

impl Eq for Pattern {}

impl fmt::Debug for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.0.as_str(), f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prefix(p: &str) -> HttpRouteMatch {
        HttpRouteMatch {
            path: Some(PathMatch::Prefix(p.to_string())),
            ..Default::default()
        }
    }

    #[test]
    fn child_prefix_is_contained_by_parent_prefix() {
        assert!(prefix("/api/v1").is_contained_by(&prefix("/api")));
        assert!(!prefix("/web").is_contained_by(&prefix("/api")));
    }

    #[test]
    fn patterns_compare_by_source() {
        let a = PathMatch::regex("/a.*").unwrap();
        assert_eq!(a, PathMatch::regex("/a.*").unwrap());
        assert_ne!(a, PathMatch::regex("/b.*").unwrap());
        assert!(PathMatch::regex("(").is_err());
        let regex = HttpRouteMatch {
            path: Some(a),
            ..Default::default()
        };
        assert!(regex.is_contained_by(&regex.clone()));
        assert!(!regex.is_contained_by(&prefix("/a")));
    }

    #[test]
    fn child_must_keep_parent_headers() {
        let header = HeaderMatch::Exact(
            HeaderName::from_static("x-env"),
            HeaderValue::from_static("prod"),
        );
        let parent = HttpRouteMatch {
            headers: vec![header.clone()],
            ..prefix("/")
        };
        assert!(!prefix("/a").is_contained_by(&parent));
        let child = HttpRouteMatch {
            headers: vec![header],
            ..prefix("/a")
        };
        assert!(child.is_contained_by(&parent));
    }
}
