//! Channel pattern matching and the registration table.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use crate::error::{Result, SyncError};
use crate::types::RouteParams;

use super::channel::Channel;

#[derive(Clone, Debug, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
}

/// A path-like pattern compiled once at registration.
///
/// `users/:id` matches `users/14` binding `id = "14"`. Each segment matches
/// exactly one path component, so it does not match `users/14/posts`.
#[derive(Clone, PartialEq, Eq)]
pub struct ChannelPattern {
    source: String,
    segments: Vec<Segment>,
}

impl ChannelPattern {
    /// Tokenize a pattern.
    pub fn parse(pattern: &str) -> Result<Self> {
        let invalid = |reason: &str| SyncError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: reason.to_string(),
        };

        if pattern.is_empty() {
            return Err(invalid("empty pattern"));
        }

        let mut segments = Vec::new();
        let mut names = HashSet::new();

        for part in pattern.split('/') {
            if part.is_empty() {
                return Err(invalid("empty segment"));
            }
            match part.strip_prefix(':') {
                Some("") => return Err(invalid("unnamed parameter")),
                Some(name) => {
                    if !names.insert(name) {
                        return Err(invalid("duplicate parameter name"));
                    }
                    segments.push(Segment::Param(name.to_string()));
                }
                None => segments.push(Segment::Literal(part.to_string())),
            }
        }

        Ok(Self {
            source: pattern.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Match a concrete channel name, returning the captured parameters.
    pub fn matches(&self, name: &str) -> Option<RouteParams> {
        let mut params = RouteParams::new();
        let mut parts = name.split('/');

        for segment in &self.segments {
            let part = parts.next()?;
            if part.is_empty() {
                return None;
            }
            match segment {
                Segment::Literal(literal) => {
                    if literal != part {
                        return None;
                    }
                }
                Segment::Param(param) => {
                    params.insert(param.clone(), part.to_string());
                }
            }
        }

        if parts.next().is_some() {
            return None;
        }

        Some(params)
    }
}

impl fmt::Debug for ChannelPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChannelPattern({})", self.source)
    }
}

/// A registered channel definition.
#[derive(Clone)]
pub struct Route {
    pub pattern: ChannelPattern,
    pub channel: Arc<dyn Channel>,
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("pattern", &self.pattern)
            .finish_non_exhaustive()
    }
}

/// Result of routing a channel name.
#[derive(Clone, Debug)]
pub struct RouteMatch {
    pub route: Route,
    pub params: RouteParams,
}

/// Registration table. Built at startup, then handed to the server, which
/// only reads it.
#[derive(Default)]
pub struct Router {
    routes: Vec<Route>,
    /// Action type -> indices of routes whose `resend` handles it.
    resenders: HashMap<String, Vec<usize>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a channel. Registration order decides which of several
    /// matching patterns wins.
    pub fn register<C: Channel>(&mut self, pattern: &str, channel: C) -> Result<&mut Self> {
        self.register_arc(pattern, Arc::new(channel))
    }

    pub fn register_arc(&mut self, pattern: &str, channel: Arc<dyn Channel>) -> Result<&mut Self> {
        let pattern = ChannelPattern::parse(pattern)?;
        let index = self.routes.len();

        for kind in channel.resend_types() {
            let indices = self.resenders.entry(kind).or_default();
            if !indices.contains(&index) {
                indices.push(index);
            }
        }

        self.routes.push(Route { pattern, channel });
        Ok(self)
    }

    /// First registered route matching `name`.
    pub fn route(&self, name: &str) -> Option<RouteMatch> {
        self.routes.iter().find_map(|route| {
            route.pattern.matches(name).map(|params| RouteMatch {
                route: route.clone(),
                params,
            })
        })
    }

    /// Routes whose `resend` is declared for this action type, in
    /// registration order.
    pub fn resenders(&self, kind: &str) -> impl Iterator<Item = &Route> {
        self.resenders
            .get(kind)
            .into_iter()
            .flatten()
            .filter_map(|&index| self.routes.get(index))
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("routes", &self.routes)
            .finish_non_exhaustive()
    }
}
