/// Ordered allowlist of tool/path rules for otherwise-unexpected accesses
use crate::config::loader::AllowlistEntryConfig;
use crate::config::types::{Result, SandboxError};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Classification of one access against the allowlist.
///
/// Ordered from most to least restrictive, so `min` is the least permissive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AllowlistMatch {
    NoMatch,
    MatchesButNotCacheable,
    MatchesAndCacheable,
}

impl AllowlistMatch {
    /// Least permissive of two classifications
    pub fn combine(self, other: AllowlistMatch) -> AllowlistMatch {
        self.min(other)
    }

    /// Least permissive classification of all `matches`; `None` when empty
    pub fn least_permissive<I>(matches: I) -> Option<AllowlistMatch>
    where
        I: IntoIterator<Item = AllowlistMatch>,
    {
        matches.into_iter().reduce(AllowlistMatch::combine)
    }

    pub fn is_match(self) -> bool {
        self != AllowlistMatch::NoMatch
    }
}

/// How an entry identifies the tool performing the access
#[derive(Debug, Clone)]
pub enum ExecutableMatcher {
    Path(String),
    Regex(Regex),
}

impl ExecutableMatcher {
    fn matches(&self, tool_path: &str) -> bool {
        match self {
            ExecutableMatcher::Path(path) => path == tool_path,
            ExecutableMatcher::Regex(regex) => regex.is_match(tool_path),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AllowlistEntry {
    pub name: String,
    pub executable: ExecutableMatcher,
    /// `None` matches every path
    pub path_regex: Option<Regex>,
    pub allows_caching: bool,
}

fn compile(pattern: &str, entry: &str, field: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| {
        SandboxError::Config(format!("allowlist entry '{}' has invalid {}: {}", entry, field, e))
    })
}

impl AllowlistEntry {
    pub fn for_executable(
        name: impl Into<String>,
        executable_path: impl Into<String>,
        path_regex: &str,
        allows_caching: bool,
    ) -> Result<Self> {
        let name = name.into();
        let path_regex = Self::path_regex(&name, path_regex)?;
        Ok(Self {
            executable: ExecutableMatcher::Path(executable_path.into()),
            name,
            path_regex,
            allows_caching,
        })
    }

    pub fn for_executable_regex(
        name: impl Into<String>,
        executable_regex: &str,
        path_regex: &str,
        allows_caching: bool,
    ) -> Result<Self> {
        let name = name.into();
        let executable =
            ExecutableMatcher::Regex(compile(executable_regex, &name, "executable_path_regex")?);
        let path_regex = Self::path_regex(&name, path_regex)?;
        Ok(Self {
            name,
            executable,
            path_regex,
            allows_caching,
        })
    }

    fn path_regex(name: &str, pattern: &str) -> Result<Option<Regex>> {
        if pattern.is_empty() {
            Ok(None)
        } else {
            compile(pattern, name, "path_regex").map(Some)
        }
    }

    pub fn from_config(config: &AllowlistEntryConfig) -> Result<Self> {
        match (&config.executable_path, &config.executable_path_regex) {
            (Some(path), _) => Self::for_executable(
                config.name.clone(),
                path.clone(),
                &config.path_regex,
                config.allows_caching,
            ),
            (None, Some(regex)) => Self::for_executable_regex(
                config.name.clone(),
                regex,
                &config.path_regex,
                config.allows_caching,
            ),
            (None, None) => Err(SandboxError::Config(format!(
                "allowlist entry '{}' needs executable_path or executable_path_regex",
                config.name
            ))),
        }
    }

    /// Structural match on tool and accessed path
    pub fn matches(&self, tool_path: &str, access_path: &str) -> bool {
        self.executable.matches(tool_path)
            && self
                .path_regex
                .as_ref()
                .map_or(true, |regex| regex.is_match(access_path))
    }

    fn classification(&self) -> AllowlistMatch {
        if self.allows_caching {
            AllowlistMatch::MatchesAndCacheable
        } else {
            AllowlistMatch::MatchesButNotCacheable
        }
    }
}

/// Immutable for the duration of a build; shared read-only across supervisors.
#[derive(Debug, Clone, Default)]
pub struct FileAccessAllowlist {
    entries: Vec<AllowlistEntry>,
}

impl FileAccessAllowlist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(entries: &[AllowlistEntryConfig]) -> Result<Self> {
        let entries = entries
            .iter()
            .map(AllowlistEntry::from_config)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { entries })
    }

    pub fn add(&mut self, entry: AllowlistEntry) {
        self.entries.push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[AllowlistEntry] {
        &self.entries
    }

    /// First structural match in list order decides caching.
    pub fn match_access(
        &self,
        tool_path: &str,
        access_path: &str,
    ) -> (AllowlistMatch, Option<&AllowlistEntry>) {
        match self
            .entries
            .iter()
            .find(|entry| entry.matches(tool_path, access_path))
        {
            Some(entry) => (entry.classification(), Some(entry)),
            None => (AllowlistMatch::NoMatch, None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restrictiveness_order() {
        assert!(AllowlistMatch::NoMatch < AllowlistMatch::MatchesButNotCacheable);
        assert!(AllowlistMatch::MatchesButNotCacheable < AllowlistMatch::MatchesAndCacheable);
        assert_eq!(
            AllowlistMatch::MatchesAndCacheable.combine(AllowlistMatch::NoMatch),
            AllowlistMatch::NoMatch
        );
        assert_eq!(
            AllowlistMatch::least_permissive([
                AllowlistMatch::MatchesAndCacheable,
                AllowlistMatch::MatchesButNotCacheable,
                AllowlistMatch::MatchesAndCacheable,
            ]),
            Some(AllowlistMatch::MatchesButNotCacheable)
        );
        assert_eq!(AllowlistMatch::least_permissive(Vec::new()), None);
    }

    #[test]
    fn first_structural_match_wins() {
        let mut allowlist = FileAccessAllowlist::new();
        let pdb = AllowlistEntry::for_executable_regex("pdb", r".*/link$", r"\.pdb$", false);
        let any = AllowlistEntry::for_executable_regex("link-any", r".*/link$", "", true);
        allowlist.add(pdb.unwrap());
        allowlist.add(any.unwrap());

        let (m, entry) = allowlist.match_access("/usr/bin/link", "/out/a.pdb");
        assert_eq!(m, AllowlistMatch::MatchesButNotCacheable);
        assert_eq!(entry.unwrap().name, "pdb");

        let (m, entry) = allowlist.match_access("/usr/bin/link", "/out/a.exe");
        assert_eq!(m, AllowlistMatch::MatchesAndCacheable);
        assert_eq!(entry.unwrap().name, "link-any");

        let (m, entry) = allowlist.match_access("/usr/bin/cc", "/out/a.pdb");
        assert_eq!(m, AllowlistMatch::NoMatch);
        assert!(entry.is_none());
    }

    #[test]
    fn exact_executable_path() {
        let entry = AllowlistEntry::for_executable("cc", "/usr/bin/cc", "", true).unwrap();
        assert!(entry.matches("/usr/bin/cc", "/anything"));
        assert!(!entry.matches("/usr/bin/cc2", "/anything"));
    }

    #[test]
    fn config_requires_an_executable() {
        let config = AllowlistEntryConfig {
            name: "broken".to_string(),
            executable_path: None,
            executable_path_regex: None,
            path_regex: String::new(),
            allows_caching: true,
        };
        assert!(matches!(AllowlistEntry::from_config(&config), Err(SandboxError::Config(_))));
    }
}
