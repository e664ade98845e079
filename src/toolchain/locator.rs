//! Finding `ildasm` and `ilasm` on disk.
//!
//! Search order: the `DLLEXPORT_ILDASM`/`DLLEXPORT_ILASM` override, the JSON cache from an earlier
//! run, then every `PATH` entry and the platform's SDK/runtime directories. When a scan finds more
//! than one candidate, paths mentioning [`VERSION_HINT`] win. Scan results are written back to the
//! cache; a cache that cannot be read or written only costs a rescan.

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{Tool, ToolchainError, VERSION_HINT};

/// On-disk cache of resolved tool paths, keyed by program name.
#[derive(Debug, Default, Serialize, Deserialize)]
struct ToolCache {
    #[serde(default)]
    tools: BTreeMap<String, PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ToolLocator {
    /// Ignore cached locations (they are still rewritten after the scan).
    rescan: bool,
    cache_file: Option<PathBuf>,
    overrides: BTreeMap<Tool, PathBuf>,
    search_dirs: Vec<PathBuf>,
}

impl ToolLocator {
    /// Locator configured from the environment.
    pub fn from_env(rescan: bool) -> Self {
        let overrides = Tool::ALL
            .into_iter()
            .filter_map(|tool| env::var_os(tool.env_override()).map(|path| (tool, PathBuf::from(path))))
            .collect();
        let mut search_dirs: Vec<PathBuf> = env::var_os("PATH")
            .map(|paths| env::split_paths(&paths).collect())
            .unwrap_or_default();
        search_dirs.extend(platform_dirs());

        Self {
            rescan,
            cache_file: cache_dir().map(|dir| dir.join("dllexport").join("toolchain.json")),
            overrides,
            search_dirs,
        }
    }

    /// Locator with explicit inputs and no environment lookups.
    pub fn new(cache_file: Option<PathBuf>, search_dirs: Vec<PathBuf>) -> Self {
        Self {
            rescan: false,
            cache_file,
            overrides: BTreeMap::new(),
            search_dirs,
        }
    }

    pub fn with_override(mut self, tool: Tool, path: PathBuf) -> Self {
        self.overrides.insert(tool, path);
        self
    }

    pub fn rescan(mut self, rescan: bool) -> Self {
        self.rescan = rescan;
        self
    }

    #[tracing::instrument(skip(self), fields(rescan = self.rescan))]
    pub fn find(&self, tool: Tool) -> Result<PathBuf, ToolchainError> {
        if let Some(path) = self.overrides.get(&tool) {
            if path.is_file() {
                debug!(path = %path.display(), "using {} override", tool.env_override());
                return Ok(path.clone());
            }
            warn!(path = %path.display(), "{} does not point at a file; searching instead", tool.env_override());
        }

        if !self.rescan
            && let Some(path) = self.cached(tool)
        {
            debug!(path = %path.display(), "using cached location");
            return Ok(path);
        }

        let found = self.scan(tool).ok_or(ToolchainError::NotFound {
            tool,
            env: tool.env_override(),
        })?;
        debug!(path = %found.display(), "found by scan");
        self.remember(tool, &found);
        Ok(found)
    }

    fn cached(&self, tool: Tool) -> Option<PathBuf> {
        let cache = self.load_cache()?;
        cache.tools.get(tool.program()).filter(|path| path.is_file()).cloned()
    }

    fn load_cache(&self) -> Option<ToolCache> {
        let file = self.cache_file.as_ref()?;
        let text = fs::read_to_string(file).ok()?;
        match serde_json::from_str(&text) {
            Ok(cache) => Some(cache),
            Err(e) => {
                warn!(path = %file.display(), "ignoring unreadable tool cache: {e}");
                None
            }
        }
    }

    fn remember(&self, tool: Tool, path: &Path) {
        let Some(file) = &self.cache_file else {
            return;
        };
        let mut cache = self.load_cache().unwrap_or_default();
        cache.tools.insert(tool.program().to_string(), path.to_path_buf());

        let written = file
            .parent()
            .map_or(Ok(()), fs::create_dir_all)
            .and_then(|()| serde_json::to_string_pretty(&cache).map_err(std::io::Error::other))
            .and_then(|json| fs::write(file, json));
        if let Err(e) = written {
            warn!(path = %file.display(), "cannot update tool cache: {e}");
        }
    }

    /// Every existing candidate, best first.
    pub fn candidates(&self, tool: Tool) -> Vec<PathBuf> {
        let name = tool.file_name();
        let mut found: Vec<PathBuf> = Vec::new();
        for dir in &self.search_dirs {
            for candidate in expand(dir) {
                let path = candidate.join(&name);
                if path.is_file() && !found.contains(&path) {
                    found.push(path);
                }
            }
        }
        // Stable sort keeps search order among equally ranked paths.
        found.sort_by_key(|path| rank(path));
        found
    }

    fn scan(&self, tool: Tool) -> Option<PathBuf> {
        self.candidates(tool).into_iter().next()
    }
}

/// 0 for paths naming the preferred tool version, 1 otherwise.
fn rank(path: &Path) -> u8 {
    let text = path.to_string_lossy();
    let version = VERSION_HINT.rsplit_once('.').map_or(VERSION_HINT, |(prefix, _)| prefix);
    if text.contains(version) || text.contains("NETFX 4") { 0 } else { 1 }
}

/// Every existing directory matching `dir`, where any component may be `*`.
///
/// Each `*` fans out over the subdirectories at that level, newest name first.
fn expand(dir: &Path) -> Vec<PathBuf> {
    let mut matches = vec![PathBuf::new()];
    for component in dir.components() {
        if component.as_os_str() == "*" {
            matches = matches.iter().flat_map(|prefix| subdirectories(prefix)).collect();
        } else {
            for path in &mut matches {
                path.push(component);
            }
        }
        if matches.is_empty() {
            break;
        }
    }
    matches
}

fn subdirectories(parent: &Path) -> Vec<PathBuf> {
    let mut children: Vec<PathBuf> = fs::read_dir(parent)
        .map(|entries| {
            entries
                .filter_map(Result::ok)
                .map(|entry| entry.path())
                .filter(|path| path.is_dir())
                .collect()
        })
        .unwrap_or_default();
    // Newest SDKs sort last by name; look at them first.
    children.sort();
    children.reverse();
    children
}

fn platform_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if cfg!(windows) {
        for var in ["ProgramFiles(x86)", "ProgramFiles"] {
            if let Some(root) = env::var_os(var).map(PathBuf::from) {
                dirs.push(root.join("Microsoft SDKs").join("Windows").join("*").join("bin"));
                dirs.push(root.join("Microsoft SDKs").join("Windows").join("*").join("bin").join("NETFX 4.0 Tools"));
                dirs.push(root.join("Microsoft SDKs").join("Windows").join("*").join("bin").join("*"));
            }
        }
        if let Some(windir) = env::var_os("WINDIR").map(PathBuf::from) {
            dirs.push(windir.join("Microsoft.NET").join("Framework64").join("v4.0.30319"));
            dirs.push(windir.join("Microsoft.NET").join("Framework").join("v4.0.30319"));
        }
    } else {
        if let Some(home) = env::var_os("HOME").map(PathBuf::from) {
            dirs.push(home.join(".dotnet").join("tools"));
        }
        dirs.push(PathBuf::from("/usr/local/share/dotnet/tools"));
        dirs.push(PathBuf::from("/usr/local/bin"));
        dirs.push(PathBuf::from("/usr/bin"));
    }
    dirs
}

/// `DLLEXPORT_CACHE_DIR`, else the user's cache directory.
fn cache_dir() -> Option<PathBuf> {
    if let Some(dir) = env::var_os("DLLEXPORT_CACHE_DIR") {
        return Some(PathBuf::from(dir));
    }
    if cfg!(windows) {
        return env::var_os("LOCALAPPDATA").map(PathBuf::from);
    }
    env::var_os("XDG_CACHE_HOME")
        .map(PathBuf::from)
        .or_else(|| env::var_os("HOME").map(|home| PathBuf::from(home).join(".cache")))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn touch(path: &Path) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"").unwrap();
    }

    #[test]
    fn test_scan_finds_tool_and_writes_cache() {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("bin");
        let ildasm = bin.join(Tool::Disassembler.file_name());
        touch(&ildasm);
        let cache = dir.path().join("cache").join("toolchain.json");

        let locator = ToolLocator::new(Some(cache.clone()), vec![bin]);
        assert_eq!(locator.find(Tool::Disassembler).unwrap(), ildasm);

        let written: ToolCache = serde_json::from_str(&fs::read_to_string(&cache).unwrap()).unwrap();
        assert_eq!(written.tools.get("ildasm"), Some(&ildasm));
    }

    #[test]
    fn test_cache_wins_unless_rescanning() {
        let dir = tempfile::tempdir().unwrap();
        let cached = dir.path().join("old").join(Tool::Assembler.file_name());
        let scanned = dir.path().join("new").join(Tool::Assembler.file_name());
        touch(&cached);
        touch(&scanned);
        let cache = dir.path().join("toolchain.json");
        let mut tools = BTreeMap::new();
        tools.insert("ilasm".to_string(), cached.clone());
        fs::write(&cache, serde_json::to_string(&ToolCache { tools }).unwrap()).unwrap();

        let locator = ToolLocator::new(Some(cache.clone()), vec![dir.path().join("new")]);
        assert_eq!(locator.find(Tool::Assembler).unwrap(), cached);

        let locator = locator.rescan(true);
        assert_eq!(locator.find(Tool::Assembler).unwrap(), scanned);
        let rewritten: ToolCache = serde_json::from_str(&fs::read_to_string(&cache).unwrap()).unwrap();
        assert_eq!(rewritten.tools.get("ilasm"), Some(&scanned));
    }

    #[test]
    fn test_override_beats_everything() {
        let dir = tempfile::tempdir().unwrap();
        let pinned = dir.path().join("pinned").join("my-ilasm");
        let scanned = dir.path().join("bin").join(Tool::Assembler.file_name());
        touch(&pinned);
        touch(&scanned);

        let locator =
            ToolLocator::new(None, vec![dir.path().join("bin")]).with_override(Tool::Assembler, pinned.clone());
        assert_eq!(locator.find(Tool::Assembler).unwrap(), pinned);
    }

    #[test]
    fn test_version_hint_ranks_first() {
        let dir = tempfile::tempdir().unwrap();
        let plain = dir.path().join("tools");
        let hinted = dir.path().join("v4.0.30319");
        touch(&plain.join(Tool::Disassembler.file_name()));
        touch(&hinted.join(Tool::Disassembler.file_name()));

        let locator = ToolLocator::new(None, vec![plain, hinted.clone()]);
        assert_eq!(
            locator.candidates(Tool::Disassembler).first(),
            Some(&hinted.join(Tool::Disassembler.file_name()))
        );
    }

    #[test]
    fn test_wildcard_dirs_expand_to_children() {
        let dir = tempfile::tempdir().unwrap();
        let sdk = dir.path().join("sdk").join("v7.0A");
        touch(&sdk.join(Tool::Assembler.file_name()));

        let locator = ToolLocator::new(None, vec![dir.path().join("sdk").join("*")]);
        assert_eq!(locator.find(Tool::Assembler).unwrap(), sdk.join(Tool::Assembler.file_name()));
    }

    #[test]
    fn test_wildcard_in_the_middle_of_a_dir() {
        let dir = tempfile::tempdir().unwrap();
        let windows = dir.path().join("Windows");
        let older = windows.join("v6.0A").join("bin");
        let newer = windows.join("v7.0A").join("bin");
        touch(&older.join(Tool::Disassembler.file_name()));
        touch(&newer.join(Tool::Disassembler.file_name()));
        fs::create_dir_all(windows.join("v8.0").join("lib")).unwrap();

        let locator = ToolLocator::new(None, vec![windows.join("*").join("bin")]);
        assert_eq!(
            locator.find(Tool::Disassembler).unwrap(),
            newer.join(Tool::Disassembler.file_name())
        );
    }

    #[test]
    fn test_nested_wildcards_expand_each_level() {
        let dir = tempfile::tempdir().unwrap();
        let tools = dir.path().join("Windows").join("v8.1A").join("bin").join("NETFX 4.5.1 Tools");
        touch(&tools.join(Tool::Assembler.file_name()));

        let expanded = expand(&dir.path().join("Windows").join("*").join("bin").join("*"));
        assert_eq!(expanded, vec![tools]);
        assert!(expand(&dir.path().join("Missing").join("*").join("bin")).is_empty());
    }

    #[test]
    fn test_missing_tool_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let locator = ToolLocator::new(None, vec![dir.path().to_path_buf()]);
        let err = locator.find(Tool::Disassembler).unwrap_err();
        assert!(matches!(err, ToolchainError::NotFound { tool: Tool::Disassembler, .. }));
    }
}
