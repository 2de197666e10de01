//! URL pattern compilation and path resolution.
//!
//! Resolution order: exact lookup, then the merged folder/extension list in precedence order,
//! then the default target. Folder patterns outrank extension patterns, longer keys outrank
//! shorter ones, and equal-length keys fall back to the pattern text.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::core::error::ConfigError;
use crate::hashbrown::HashMap;
use crate::support::debug::{self, InfoLevel};

const STAR: char = '*';
const SLASH: char = '/';

/// Declaration order is precedence order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MappingKind {
    Exact,
    Folder,
    Extension,
    Default,
    NameLink,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mapping {
    pattern: String,
    key: String,
    kind: MappingKind,
    pattern_first: bool,
    target: String,
}

impl Mapping {
    /// Compile a URL pattern bound to `target`.
    pub fn url(pattern: &str, target: &str) -> Result<Mapping, ConfigError> {
        let mut pattern = pattern.trim().to_owned();

        if pattern == "*" {
            debug::print(
                &format!("Rewriting the bare `*` mapping for {} as `/*`", target),
                InfoLevel::Warning,
            );
            pattern = String::from("/*");
        } else if !pattern.is_empty()
            && !pattern.starts_with(STAR)
            && !pattern.starts_with(SLASH)
            && (pattern.contains(SLASH) || !pattern.contains(STAR))
        {
            pattern.insert(0, SLASH);
        }

        let invalid = |reason: &'static str| ConfigError::InvalidPattern {
            pattern: pattern.clone(),
            reason,
        };

        let stars = pattern.matches(STAR).count();
        let (key, kind, pattern_first) = if pattern == "/" {
            (String::new(), MappingKind::Default, false)
        } else if stars == 0 {
            (pattern.clone(), MappingKind::Exact, false)
        } else if stars > 1 {
            return Err(ConfigError::MultipleWildcards(pattern.clone()));
        } else if pattern.ends_with("/*") {
            (pattern[..pattern.len() - 2].to_owned(), MappingKind::Folder, false)
        } else if pattern.contains(SLASH) {
            return Err(invalid("a wildcard inside a path must be a trailing `/*`"));
        } else if pattern.starts_with(STAR) {
            (pattern[1..].to_owned(), MappingKind::Extension, false)
        } else if pattern.ends_with(STAR) {
            (pattern[..pattern.len() - 1].to_owned(), MappingKind::Extension, true)
        } else {
            return Err(invalid("the wildcard must lead or trail the pattern"));
        };

        Ok(Mapping {
            pattern,
            key,
            kind,
            pattern_first,
            target: target.to_owned(),
        })
    }

    /// Bind `target` to whatever is registered as `link_name`; `*` links to every name.
    pub fn name_link(link_name: &str, target: &str) -> Mapping {
        Mapping {
            pattern: link_name.to_owned(),
            key: link_name.to_owned(),
            kind: MappingKind::NameLink,
            pattern_first: false,
            target: target.to_owned(),
        }
    }

    #[inline]
    pub fn kind(&self) -> MappingKind {
        self.kind
    }

    #[inline]
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    #[inline]
    pub fn key(&self) -> &str {
        &self.key
    }

    #[inline]
    pub fn target(&self) -> &str {
        &self.target
    }

    /// For extension patterns: the literal part leads (`blah*`) rather than trails (`*blah`).
    #[inline]
    pub fn is_pattern_first(&self) -> bool {
        self.pattern_first
    }

    /// Structural match of an in-application path. Returns the servlet path and path info the
    /// target sees.
    pub fn match_path(&self, path: &str) -> Option<(String, Option<String>)> {
        match self.kind {
            MappingKind::Exact => {
                if path == self.key {
                    Some((path.to_owned(), None))
                } else {
                    None
                }
            }
            MappingKind::Folder => {
                if path == self.key {
                    return Some((self.key.clone(), None));
                }

                if path.starts_with(&self.key) && path[self.key.len()..].starts_with(SLASH) {
                    return Some((self.key.clone(), Some(path[self.key.len()..].to_owned())));
                }

                None
            }
            MappingKind::Extension => {
                let slash = path.rfind(SLASH)?;
                if slash == path.len() - 1 {
                    return None;
                }

                let file_name = &path[slash + 1..];
                let hit = if self.pattern_first {
                    file_name.starts_with(&self.key)
                } else {
                    file_name.ends_with(&self.key)
                };

                if hit {
                    Some((path.to_owned(), None))
                } else {
                    None
                }
            }
            MappingKind::Default => Some((path.to_owned(), None)),
            MappingKind::NameLink => None,
        }
    }

    #[inline]
    pub fn matches_path(&self, path: &str) -> bool {
        self.match_path(path).is_some()
    }

    pub fn matches_name(&self, name: &str) -> bool {
        self.kind == MappingKind::NameLink && (self.key == "*" || self.key == name)
    }
}

impl PartialOrd for Mapping {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Mapping {
    fn cmp(&self, other: &Self) -> Ordering {
        if self.kind == MappingKind::NameLink && other.kind == MappingKind::NameLink {
            return self
                .key
                .cmp(&other.key)
                .then_with(|| self.target.cmp(&other.target));
        }

        self.kind
            .cmp(&other.kind)
            .then_with(|| other.key.len().cmp(&self.key.len()))
            .then_with(|| self.pattern.cmp(&other.pattern))
            .then_with(|| self.target.cmp(&other.target))
    }
}

/// Anything a URL can resolve to. Targets that are no longer live are skipped.
pub trait MappingTarget {
    fn is_live(&self) -> bool;
}

#[derive(Debug)]
pub struct Resolution<T> {
    pub target: Arc<T>,
    pub servlet_path: String,
    pub path_info: Option<String>,
    pub kind: MappingKind,
}

/// Compiled mapping table. Read-only once built.
pub struct UrlMap<T> {
    exact: HashMap<String, Arc<T>>,
    patterns: Vec<(Mapping, Arc<T>)>,
    default: Option<Arc<T>>,
}

impl<T: MappingTarget> UrlMap<T> {
    /// `lookup` turns a mapping's target name into its typed handle, once, here.
    pub fn build<F>(mappings: Vec<Mapping>, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<Arc<T>>,
    {
        let mut exact = HashMap::new();
        let mut patterns = Vec::new();
        let mut default = None;

        for mapping in mappings {
            let target = lookup(mapping.target()).ok_or_else(|| ConfigError::UnknownTarget {
                pattern: mapping.pattern().to_owned(),
                target: mapping.target().to_owned(),
            })?;

            match mapping.kind() {
                MappingKind::Exact => {
                    exact.insert(mapping.key().to_owned(), target);
                }
                MappingKind::Folder | MappingKind::Extension => patterns.push((mapping, target)),
                MappingKind::Default => default = Some(target),
                MappingKind::NameLink => {
                    return Err(ConfigError::InvalidPattern {
                        pattern: mapping.pattern().to_owned(),
                        reason: "name links cannot route URLs",
                    })
                }
            }
        }

        patterns.sort_by(|a, b| a.0.cmp(&b.0));

        Ok(UrlMap {
            exact,
            patterns,
            default,
        })
    }

    pub fn resolve(&self, path: &str) -> Option<Resolution<T>> {
        if let Some(target) = self.exact.get(path).filter(|target| target.is_live()) {
            return Some(Resolution {
                target: Arc::clone(target),
                servlet_path: path.to_owned(),
                path_info: None,
                kind: MappingKind::Exact,
            });
        }

        for (mapping, target) in self.patterns.iter() {
            if !target.is_live() {
                continue;
            }

            if let Some((servlet_path, path_info)) = mapping.match_path(path) {
                return Some(Resolution {
                    target: Arc::clone(target),
                    servlet_path,
                    path_info,
                    kind: mapping.kind(),
                });
            }
        }

        self.default
            .as_ref()
            .filter(|target| target.is_live())
            .map(|target| Resolution {
                target: Arc::clone(target),
                servlet_path: path.to_owned(),
                path_info: None,
                kind: MappingKind::Default,
            })
    }

    /// Patterns in the order they are tried.
    pub fn patterns(&self) -> impl Iterator<Item = &Mapping> {
        self.patterns.iter().map(|(mapping, _)| mapping)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};

    #[derive(Debug)]
    struct Named {
        name: &'static str,
        live: AtomicBool,
    }

    impl MappingTarget for Named {
        fn is_live(&self) -> bool {
            self.live.load(AtomicOrdering::Acquire)
        }
    }

    fn target(name: &'static str) -> Arc<Named> {
        Arc::new(Named {
            name,
            live: AtomicBool::new(true),
        })
    }

    fn table(entries: &[(&str, &Arc<Named>)]) -> UrlMap<Named> {
        let mappings = entries
            .iter()
            .map(|(pattern, t)| Mapping::url(pattern, t.name).unwrap())
            .collect();
        let targets: Vec<Arc<Named>> = entries.iter().map(|(_, t)| Arc::clone(t)).collect();

        UrlMap::build(mappings, |name| {
            targets.iter().find(|t| t.name == name).cloned()
        })
        .unwrap()
    }

    #[test]
    fn pattern_kinds() {
        let default = Mapping::url("/", "d").unwrap();
        assert_eq!(default.kind(), MappingKind::Default);
        assert_eq!(default.key(), "");

        let exact = Mapping::url("status", "s").unwrap();
        assert_eq!(exact.kind(), MappingKind::Exact);
        assert_eq!(exact.pattern(), "/status");

        let folder = Mapping::url("/app/*", "a").unwrap();
        assert_eq!(folder.kind(), MappingKind::Folder);
        assert_eq!(folder.key(), "/app");

        let root = Mapping::url("/*", "r").unwrap();
        assert_eq!(root.kind(), MappingKind::Folder);
        assert_eq!(root.key(), "");

        let suffix = Mapping::url("*.jsp", "j").unwrap();
        assert_eq!(suffix.kind(), MappingKind::Extension);
        assert!(!suffix.is_pattern_first());
        assert_eq!(suffix.key(), ".jsp");

        let prefix = Mapping::url("draft*", "p").unwrap();
        assert_eq!(prefix.kind(), MappingKind::Extension);
        assert!(prefix.is_pattern_first());
        assert_eq!(prefix.key(), "draft");
    }

    #[test]
    fn bare_star_becomes_root_folder() {
        let mapping = Mapping::url("*", "all").unwrap();
        assert_eq!(mapping.kind(), MappingKind::Folder);
        assert_eq!(mapping.pattern(), "/*");
    }

    #[test]
    fn bad_patterns_fail_at_registration() {
        assert!(matches!(
            Mapping::url("/a/*/b/*", "x"),
            Err(ConfigError::MultipleWildcards(_))
        ));
        assert!(matches!(
            Mapping::url("*.*", "x"),
            Err(ConfigError::MultipleWildcards(_))
        ));
        assert!(matches!(
            Mapping::url("/a/*.jsp", "x"),
            Err(ConfigError::InvalidPattern { .. })
        ));
        assert!(matches!(
            Mapping::url("ab*cd", "x"),
            Err(ConfigError::InvalidPattern { .. })
        ));
    }

    #[test]
    fn unknown_target_is_a_config_error() {
        let result = UrlMap::<Named>::build(vec![Mapping::url("/x", "ghost").unwrap()], |_| None);
        assert!(matches!(result, Err(ConfigError::UnknownTarget { .. })));
    }

    #[test]
    fn exact_always_wins() {
        let exact = target("exact");
        let folder = target("folder");
        let ext = target("ext");
        let map = table(&[("/app/*", &folder), ("/app/page.jsp", &exact), ("*.jsp", &ext)]);

        let hit = map.resolve("/app/page.jsp").unwrap();
        assert_eq!(hit.target.name, "exact");
        assert_eq!(hit.servlet_path, "/app/page.jsp");
        assert!(hit.path_info.is_none());
    }

    #[test]
    fn folder_requires_a_separating_slash() {
        let folder = target("folder");
        let default = target("default");
        let map = table(&[("/app/*", &folder), ("/", &default)]);

        let bare = map.resolve("/app").unwrap();
        assert_eq!(bare.target.name, "folder");
        assert_eq!(bare.servlet_path, "/app");
        assert!(bare.path_info.is_none());

        let nested = map.resolve("/app/anything/else").unwrap();
        assert_eq!(nested.target.name, "folder");
        assert_eq!(nested.path_info.as_deref(), Some("/anything/else"));

        assert_eq!(map.resolve("/appx").unwrap().target.name, "default");
    }

    #[test]
    fn extension_checks_only_the_last_segment() {
        let ext = target("ext");
        let default = target("default");
        let map = table(&[("*.ext", &ext), ("/", &default)]);

        assert_eq!(map.resolve("/a/file.ext").unwrap().target.name, "ext");
        assert_eq!(map.resolve("/a.ext/b").unwrap().target.name, "default");
        assert_eq!(map.resolve("/a.ext/").unwrap().target.name, "default");
    }

    #[test]
    fn folder_beats_extension_and_default_catches_the_rest() {
        let h1 = target("H1");
        let h2 = target("H2");
        let fallback = target("Default");
        let map = table(&[("*.jsp", &h2), ("/app/*", &h1), ("/", &fallback)]);

        assert_eq!(map.resolve("/app/x.jsp").unwrap().target.name, "H1");
        assert_eq!(map.resolve("/other.jsp").unwrap().target.name, "H2");

        let random = map.resolve("/random").unwrap();
        assert_eq!(random.target.name, "Default");
        assert_eq!(random.kind, MappingKind::Default);
        assert_eq!(random.servlet_path, "/random");
    }

    #[test]
    fn longer_folders_are_tried_first() {
        let short = target("short");
        let long = target("long");
        let map = table(&[("/a/*", &short), ("/a/b/*", &long)]);

        assert_eq!(map.resolve("/a/b/c").unwrap().target.name, "long");
        assert_eq!(map.resolve("/a/c").unwrap().target.name, "short");

        let order: Vec<&str> = map.patterns().map(Mapping::pattern).collect();
        assert_eq!(order, vec!["/a/b/*", "/a/*"]);
    }

    #[test]
    fn dead_targets_are_skipped() {
        let exact = target("exact");
        let folder = target("folder");
        let default = target("default");
        let map = table(&[("/app/x", &exact), ("/app/*", &folder), ("/", &default)]);

        exact.live.store(false, AtomicOrdering::Release);
        assert_eq!(map.resolve("/app/x").unwrap().target.name, "folder");

        folder.live.store(false, AtomicOrdering::Release);
        assert_eq!(map.resolve("/app/x").unwrap().target.name, "default");

        default.live.store(false, AtomicOrdering::Release);
        assert!(map.resolve("/app/x").is_none());
    }

    #[test]
    fn name_links_sort_lexicographically() {
        let mut links = vec![
            Mapping::name_link("zeta", "f1"),
            Mapping::name_link("*", "f2"),
            Mapping::name_link("alpha", "f3"),
        ];
        links.sort();

        let keys: Vec<&str> = links.iter().map(Mapping::key).collect();
        assert_eq!(keys, vec!["*", "alpha", "zeta"]);
        assert!(links[0].matches_name("anything"));
        assert!(links[1].matches_name("alpha"));
        assert!(!links[1].matches_name("beta"));
    }
}
