//! Memoized path classification.
//!
//! Several middlewares (bearer auth, request logging, request signing) make
//! the same per-request decision: map the request path to a small level enum
//! that says how much work to do for it. The rule list is configured once at
//! startup; the set of distinct paths is bounded by the application's route
//! table, so each path is classified exactly once and the result memoized.
//!
//! # Rules
//!
//! Rules are evaluated in registration order; the first match wins and a
//! configured default applies when nothing matches. A rule is one of:
//!
//! - an exact path string,
//! - a regular expression,
//! - an arbitrary predicate function.
//!
//! # Concurrency
//!
//! The memo cache is a [`DashMap`] shared by all request-handling tasks.
//! Entries are write-once and never evicted. Two tasks racing to classify
//! the same fresh path both evaluate the rule list, but they compute the
//! same level, so whichever insert lands first is authoritative and the
//! race is benign.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use regex::Regex;

/// Predicate rule signature.
pub type PathPredicate = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// A single classification rule.
#[derive(Clone)]
pub enum PathRule {
    /// Matches when the path equals the string exactly.
    Exact(String),
    /// Matches when the regular expression matches anywhere in the path.
    Pattern(Regex),
    /// Matches when the predicate returns true.
    Predicate(PathPredicate),
}

impl PathRule {
    fn matches(&self, path: &str) -> bool {
        match self {
            PathRule::Exact(exact) => exact == path,
            PathRule::Pattern(re) => re.is_match(path),
            PathRule::Predicate(pred) => pred(path),
        }
    }
}

impl fmt::Debug for PathRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathRule::Exact(exact) => f.debug_tuple("Exact").field(exact).finish(),
            PathRule::Pattern(re) => f.debug_tuple("Pattern").field(&re.as_str()).finish(),
            PathRule::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

/// Memoized path → level classifier.
///
/// `L` is the consuming middleware's level enum (auth, log, sign levels all
/// reuse this one type).
///
/// # Example
///
/// ```rust
/// use gatekit::classify::PathClassifier;
///
/// #[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// enum Level { Skip, Check }
///
/// let classifier = PathClassifier::new(Level::Check)
///     .exact("/health/check", Level::Skip)
///     .pattern(regex::Regex::new("^/static/").unwrap(), Level::Skip);
///
/// assert_eq!(classifier.classify("/health/check"), Level::Skip);
/// assert_eq!(classifier.classify("/static/logo.png"), Level::Skip);
/// assert_eq!(classifier.classify("/orders"), Level::Check);
/// ```
pub struct PathClassifier<L> {
    rules: Vec<(PathRule, L)>,
    default_level: L,
    cache: DashMap<String, L>,
}

impl<L: Copy> PathClassifier<L> {
    /// Create a classifier that answers `default_level` for unmatched paths.
    pub fn new(default_level: L) -> Self {
        Self {
            rules: Vec::new(),
            default_level,
            cache: DashMap::new(),
        }
    }

    /// Append a rule. Rules match in registration order.
    pub fn rule(mut self, rule: PathRule, level: L) -> Self {
        self.rules.push((rule, level));
        self
    }

    /// Append an exact-match rule.
    pub fn exact(self, path: impl Into<String>, level: L) -> Self {
        self.rule(PathRule::Exact(path.into()), level)
    }

    /// Append a regular-expression rule.
    pub fn pattern(self, re: Regex, level: L) -> Self {
        self.rule(PathRule::Pattern(re), level)
    }

    /// Append a predicate rule.
    pub fn predicate<F>(self, pred: F, level: L) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        self.rule(PathRule::Predicate(Arc::new(pred)), level)
    }

    /// The level configured for unmatched paths.
    pub fn default_level(&self) -> L {
        self.default_level
    }

    /// Classify a path, consulting the memo cache first.
    ///
    /// On a miss the rule list is evaluated once and the result inserted
    /// write-once; later calls with the same path never touch the rules
    /// again.
    pub fn classify(&self, path: &str) -> L {
        if let Some(hit) = self.cache.get(path) {
            return *hit;
        }

        let level = self
            .rules
            .iter()
            .find(|(rule, _)| rule.matches(path))
            .map(|(_, level)| *level)
            .unwrap_or(self.default_level);

        // or_insert keeps the first write on a racing insert; all racers
        // computed the same level from the same immutable rule list.
        *self.cache.entry(path.to_string()).or_insert(level)
    }

    /// Number of distinct paths classified so far.
    pub fn cached_paths(&self) -> usize {
        self.cache.len()
    }
}

impl<L: Copy + fmt::Debug> fmt::Debug for PathClassifier<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PathClassifier")
            .field("rules", &self.rules)
            .field("default_level", &self.default_level)
            .field("cached_paths", &self.cache.len())
            .finish()
    }
}
