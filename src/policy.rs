//! Which errors may be swallowed to keep one failing task from stopping
//! the others.
//!
//! Every place where the engine or core would isolate a per-task failure
//! builds an [`ErrorContext`] and asks the configured [`ErrorPolicy`].

use std::collections::HashSet;
use std::env;

use crate::error::GridError;

/// Environment variable with extra comma-separated `no_catch_errors`
/// keywords.
pub const NO_CATCH_ENV: &str = "GRIDFLOW_NO_CATCH_ERRORS";

/// Where an error was caught.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorContext {
    pub module: &'static str,
    pub class: &'static str,
    pub method: &'static str,
    pub tags: Vec<String>,
}

impl ErrorContext {
    pub fn new(module: &'static str, class: &'static str, method: &'static str) -> Self {
        Self {
            module,
            class,
            method,
            tags: Vec::new(),
        }
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// `Class.method()`, for log messages.
    pub fn location(&self) -> String {
        format!("{}.{}()", self.class, self.method)
    }

    fn keywords<'a>(&'a self, err: &'a GridError) -> impl Iterator<Item = String> + 'a {
        [self.module, self.class, self.method, err.kind_name()]
            .into_iter()
            .map(str::to_string)
            .chain(self.tags.iter().cloned())
            .map(|w| w.to_lowercase())
    }
}

/// Decides whether a caught error may be logged and ignored.
pub trait ErrorPolicy {
    fn should_ignore(&self, ctx: &ErrorContext, err: &GridError) -> bool;
}

impl<F> ErrorPolicy for F
where
    F: Fn(&ErrorContext, &GridError) -> bool,
{
    fn should_ignore(&self, ctx: &ErrorContext, err: &GridError) -> bool {
        self(ctx, err)
    }
}

/// Whether `err` may be swallowed: fatal errors never are.
pub fn ignorable(policy: &dyn ErrorPolicy, ctx: &ErrorContext, err: &GridError) -> bool {
    !err.is_fatal() && policy.should_ignore(ctx, err)
}

/// Ignores everything except errors whose context matches one of the
/// configured keywords. The keyword `all` turns ignoring off entirely.
#[derive(Debug, Clone, Default)]
pub struct KeywordPolicy {
    catch_nothing: bool,
    keywords: HashSet<String>,
}

impl KeywordPolicy {
    pub fn new<I, S>(keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let keywords: HashSet<String> = keywords
            .into_iter()
            .map(|k| k.as_ref().trim().to_lowercase())
            .filter(|k| !k.is_empty())
            .collect();
        Self {
            catch_nothing: keywords.contains("all"),
            keywords,
        }
    }

    /// Configured keywords plus those listed in [`NO_CATCH_ENV`].
    pub fn from_env(configured: &[String]) -> Self {
        let from_env = env::var(NO_CATCH_ENV).unwrap_or_default();
        Self::new(
            configured
                .iter()
                .map(String::as_str)
                .chain(from_env.split(',')),
        )
    }

    pub fn keywords(&self) -> impl Iterator<Item = &str> {
        self.keywords.iter().map(String::as_str)
    }
}

impl ErrorPolicy for KeywordPolicy {
    fn should_ignore(&self, ctx: &ErrorContext, err: &GridError) -> bool {
        if err.is_fatal() || self.catch_nothing {
            return false;
        }
        !ctx.keywords(err).any(|w| self.keywords.contains(&w))
    }
}
