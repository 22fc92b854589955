//! Incremental-scan planner
//!
//! Decides, per request, whether cached per-file results may substitute
//! for live scanning. The planner never fails: anything it cannot read,
//! hash, or diff lands in the live-scan set, and a total inability to
//! compute a diff degrades to a full scan with the originating reason.

use std::collections::HashSet;
use std::sync::{Arc, OnceLock};

use regex::Regex;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::cache::{CacheKey, ResultCache};
use crate::config::OrchestratorConfig;
use crate::gitio::GitWorkdir;
use crate::model::{CachedResult, FileChange, PlanStrategy, ScanRequest, WorkPlan};
use crate::registry::AgentRegistry;

/// Files whose change invalidates every cached result: scanner and
/// dependency configuration, matched by basename.
const CONFIG_FILE_NAMES: &[&str] = &[
    ".agentscan.yml",
    ".agentscan.yaml",
    "agentscan.yml",
    "agentscan.yaml",
    ".semgrepignore",
    "pyproject.toml",
    "setup.cfg",
    "bandit.yml",
    "bandit.yaml",
    ".bandit",
    "go.mod",
    "go.sum",
    "package.json",
    "package-lock.json",
    "yarn.lock",
    "requirements.txt",
    "Pipfile",
    "Pipfile.lock",
    "poetry.lock",
    "Cargo.toml",
    "Cargo.lock",
];

/// Extensions the scanners understand; everything else is ignored by
/// planning.
const SCANNABLE_EXTENSIONS: &[&str] = &[
    "go", "js", "ts", "jsx", "tsx", "py", "java", "c", "cpp", "h", "hpp", "cs", "php", "rb",
    "rs", "kt", "scala", "swift", "m", "mm",
];

fn config_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\.eslintrc.*|eslint\.config\..+)$").expect("static regex"))
}

/// Whether a changed path is scanner/dependency configuration
fn is_config_file(path: &str) -> bool {
    let basename = path.rsplit('/').next().unwrap_or(path);
    CONFIG_FILE_NAMES.contains(&basename) || config_pattern().is_match(basename)
}

/// Whether the planner considers a path scannable source
fn is_scannable(path: &str) -> bool {
    path.rsplit('.')
        .next()
        .map(|ext| SCANNABLE_EXTENSIONS.contains(&ext))
        .unwrap_or(false)
}

/// SHA-256 of file content, hex encoded
pub fn content_hash(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(64);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// The incremental-scan planner
pub struct Planner {
    cache: Arc<ResultCache>,
    registry: Arc<AgentRegistry>,
    max_diff_files: usize,
    min_hit_ratio: f64,
}

impl Planner {
    pub fn new(
        cache: Arc<ResultCache>,
        registry: Arc<AgentRegistry>,
        config: &OrchestratorConfig,
    ) -> Self {
        Self {
            cache,
            registry,
            max_diff_files: config.max_diff_files,
            min_hit_ratio: config.min_hit_ratio,
        }
    }

    /// Produce a work plan for the request.
    ///
    /// Deterministic given the same request, cache contents, and repository
    /// state. Deleted and renamed-away paths have their cache entries
    /// invalidated before the plan is returned, so the plan is consistent
    /// with post-invalidation cache state.
    pub async fn plan(
        &self,
        request: &ScanRequest,
        workdir: &GitWorkdir,
        agents: &[String],
    ) -> WorkPlan {
        let agents = agents.to_vec();

        if !request.incremental {
            return WorkPlan::full("incremental scanning not requested", agents);
        }
        let prior = match &request.prior_commit {
            Some(prior) => prior.clone(),
            None => return WorkPlan::full("no baseline", agents),
        };

        let current = match &request.commit {
            Some(commit) => commit.clone(),
            None => match workdir.last_commit(&request.branch) {
                Ok(commit) => commit,
                Err(e) => {
                    warn!(error = %e, "cannot resolve branch tip, falling back to full scan");
                    return WorkPlan::full(format!("cannot resolve branch: {e}"), agents);
                }
            },
        };

        let changes = match workdir.diff(&prior, &current).await {
            Ok(changes) => changes,
            Err(e) => {
                warn!(error = %e, "diff failed, falling back to full scan");
                return WorkPlan::full(format!("diff failed: {e}"), agents);
            }
        };

        // Deleted paths and old paths of renames leave the cache now, so
        // whatever plan we return reflects post-invalidation state.
        self.invalidate_vacated(&request.repo, &changes).await;

        if let Some(config_change) = changes.iter().find(|c| is_config_file(&c.path)) {
            info!(path = %config_change.path, "configuration file changed");
            return WorkPlan::full(
                format!("configuration file changed: {}", config_change.path),
                agents,
            );
        }

        if changes.len() > self.max_diff_files {
            return WorkPlan::full(
                format!(
                    "too many changes: {} > {}",
                    changes.len(),
                    self.max_diff_files
                ),
                agents,
            );
        }

        let scannable: Vec<&FileChange> = changes
            .iter()
            .filter(|c| !c.is_deleted() && is_scannable(&c.path))
            .collect();

        if scannable.is_empty() {
            return WorkPlan {
                strategy: PlanStrategy::Incremental,
                reason: "no scannable changes".into(),
                live_files: Vec::new(),
                cached: Vec::new(),
                hit_ratio: 0.0,
                agents,
            };
        }

        let mut live_files: HashSet<String> = HashSet::new();
        let mut cached: Vec<CachedResult> = Vec::new();
        let mut cached_files = 0usize;

        for change in &scannable {
            match self.lookup_file(&request.repo, &change.path, workdir, &agents).await {
                Some(results) => {
                    cached_files += 1;
                    cached.extend(results);
                }
                None => {
                    live_files.insert(change.path.clone());
                }
            }
        }

        let hit_ratio = cached_files as f64 / scannable.len() as f64;
        debug!(
            cached_files,
            total = scannable.len(),
            hit_ratio,
            "cache consultation finished"
        );

        if hit_ratio <= self.min_hit_ratio {
            return WorkPlan::full(
                format!("low hit rate: {hit_ratio:.2} <= {:.2}", self.min_hit_ratio),
                agents,
            );
        }

        let mut live_files: Vec<String> = live_files.into_iter().collect();
        live_files.sort();
        cached.sort_by(|a, b| a.path.cmp(&b.path).then_with(|| a.tool.cmp(&b.tool)));

        WorkPlan {
            strategy: PlanStrategy::Incremental,
            reason: format!("{cached_files} of {} changed files cached", scannable.len()),
            live_files,
            cached,
            hit_ratio,
            agents,
        }
    }

    /// Consult the cache for one file across every requested tool.
    ///
    /// Returns the cached results only when *every* tool hits; a single
    /// miss sends the whole file to the live set (no partial per-tool
    /// skipping within a file). Read, hash, or cache errors count as
    /// misses.
    async fn lookup_file(
        &self,
        repo: &str,
        path: &str,
        workdir: &GitWorkdir,
        agents: &[String],
    ) -> Option<Vec<CachedResult>> {
        let bytes = match workdir.read_file(path) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(path, error = %e, "cannot read changed file, scanning live");
                return None;
            }
        };
        let content = content_hash(&bytes);

        let mut results = Vec::with_capacity(agents.len());
        for agent in agents {
            let profile = self.registry.profile(agent)?;
            let key = CacheKey::new(repo, path, agent.clone(), content.clone(), profile.digest());
            match self.cache.get(&key).await {
                Ok(Some(entry)) => results.push(CachedResult {
                    path: path.to_string(),
                    tool: agent.clone(),
                    findings: entry.findings,
                }),
                Ok(None) => return None,
                Err(e) => {
                    warn!(path, agent, error = %e, "cache error treated as miss");
                    return None;
                }
            }
        }
        Some(results)
    }

    async fn invalidate_vacated(&self, repo: &str, changes: &[FileChange]) {
        let vacated: Vec<String> = changes
            .iter()
            .filter_map(|c| c.vacated_path().map(str::to_string))
            .collect();
        if vacated.is_empty() {
            return;
        }
        if let Err(e) = self.cache.invalidate(repo, &vacated).await {
            warn!(error = %e, "cache invalidation for removed paths failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheEntry;
    use crate::model::Priority;
    use crate::testutil::{test_finding, StubDriver};
    use std::path::Path;
    use std::process::Command;
    use std::time::Duration;

    fn git(dir: &Path, args: &[&str]) {
        let out = Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .unwrap();
        assert!(out.status.success(), "git {args:?} failed");
    }

    struct Fixture {
        dir: tempfile::TempDir,
        workdir: GitWorkdir,
        cache: Arc<ResultCache>,
        registry: Arc<AgentRegistry>,
        base: String,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            git(dir.path(), &["init", "-b", "main"]);
            git(dir.path(), &["config", "user.email", "t@t.com"]);
            git(dir.path(), &["config", "user.name", "T"]);
            std::fs::write(dir.path().join("seed.py"), "seed = 0\n").unwrap();
            git(dir.path(), &["add", "."]);
            git(dir.path(), &["commit", "-m", "seed"]);

            let workdir = GitWorkdir::new(dir.path());
            let base = workdir.last_commit("main").unwrap();

            let mut registry = AgentRegistry::new();
            registry.register(Arc::new(StubDriver::completing("bandit", vec![])));
            registry.register(Arc::new(StubDriver::completing("semgrep", vec![])));

            Self {
                dir,
                workdir,
                cache: Arc::new(ResultCache::in_memory(Duration::from_secs(3600))),
                registry: Arc::new(registry),
                base,
            }
        }

        fn planner(&self) -> Planner {
            Planner::new(
                self.cache.clone(),
                self.registry.clone(),
                &OrchestratorConfig::default(),
            )
        }

        fn commit_all(&self, message: &str) -> String {
            git(self.dir.path(), &["add", "-A"]);
            git(self.dir.path(), &["commit", "-m", message]);
            self.workdir.last_commit("main").unwrap()
        }

        fn write(&self, path: &str, content: &str) {
            let full = self.dir.path().join(path);
            if let Some(parent) = full.parent() {
                std::fs::create_dir_all(parent).unwrap();
            }
            std::fs::write(full, content).unwrap();
        }

        fn request(&self, prior: Option<&str>, current: &str) -> ScanRequest {
            let mut request = ScanRequest::new("repo-1", "main");
            request.priority = Priority::Medium;
            request.incremental = true;
            request.prior_commit = prior.map(str::to_string);
            request.commit = Some(current.to_string());
            request
        }

        /// Seed a cache entry matching the file's current content for one
        /// tool.
        async fn seed_cache(&self, path: &str, tool: &str) {
            let bytes = std::fs::read(self.dir.path().join(path)).unwrap();
            let profile = self.registry.profile(tool).unwrap();
            let key = CacheKey::new(
                "repo-1",
                path,
                tool,
                content_hash(&bytes),
                profile.digest(),
            );
            let entry = CacheEntry::new(
                key,
                vec![test_finding(tool, "R1", path, 10, 0.9)],
                "0.0.0-stub",
            );
            self.cache.set(entry).await.unwrap();
        }
    }

    fn agents() -> Vec<String> {
        vec!["bandit".into(), "semgrep".into()]
    }

    #[tokio::test]
    async fn test_no_baseline_is_full() {
        let fx = Fixture::new();
        let request = fx.request(None, &fx.base);
        let plan = fx.planner().plan(&request, &fx.workdir, &agents()).await;
        assert!(plan.is_full());
        assert_eq!(plan.reason, "no baseline");
    }

    #[tokio::test]
    async fn test_incremental_disabled_is_full() {
        let fx = Fixture::new();
        let mut request = fx.request(Some(&fx.base), &fx.base);
        request.incremental = false;
        let plan = fx.planner().plan(&request, &fx.workdir, &agents()).await;
        assert!(plan.is_full());
    }

    #[tokio::test]
    async fn test_config_file_change_forces_full() {
        let fx = Fixture::new();
        fx.write("package.json", "{}\n");
        fx.write("src/app.js", "let x = 1;\n");
        let head = fx.commit_all("deps");

        let request = fx.request(Some(&fx.base), &head);
        let plan = fx.planner().plan(&request, &fx.workdir, &agents()).await;
        assert!(plan.is_full());
        assert!(plan.reason.contains("config"));
        assert!(plan.cached.is_empty());
    }

    #[test]
    fn test_eslintrc_pattern_counts_as_config() {
        assert!(is_config_file(".eslintrc"));
        assert!(is_config_file(".eslintrc.json"));
        assert!(is_config_file("eslint.config.mjs"));
        assert!(is_config_file("pkg/.eslintrc.yml"));
        assert!(!is_config_file("src/eslint_helpers.js"));
        assert!(!is_config_file("eslint.config")); // no trailing component
    }

    #[tokio::test]
    async fn test_too_many_changes_forces_full() {
        let fx = Fixture::new();
        for i in 0..101 {
            fx.write(&format!("src/f{i}.py"), &format!("x = {i}\n"));
        }
        let head = fx.commit_all("big change");

        let request = fx.request(Some(&fx.base), &head);
        let plan = fx.planner().plan(&request, &fx.workdir, &agents()).await;
        assert!(plan.is_full());
        assert!(plan.reason.contains("too many changes"));
    }

    #[tokio::test]
    async fn test_diff_at_cap_is_not_too_many() {
        let fx = Fixture::new();
        for i in 0..100 {
            fx.write(&format!("src/f{i}.py"), &format!("x = {i}\n"));
        }
        let head = fx.commit_all("at cap");

        let request = fx.request(Some(&fx.base), &head);
        let plan = fx.planner().plan(&request, &fx.workdir, &agents()).await;
        // Nothing cached, so this degrades to full for hit rate, never for
        // diff size.
        assert!(!plan.reason.contains("too many changes"));
    }

    #[tokio::test]
    async fn test_low_hit_rate_forces_full() {
        let fx = Fixture::new();
        fx.write("src/a.py", "a = 1\n");
        fx.write("src/b.py", "b = 2\n");
        let head = fx.commit_all("two files");

        let request = fx.request(Some(&fx.base), &head);
        let plan = fx.planner().plan(&request, &fx.workdir, &agents()).await;
        assert!(plan.is_full());
        assert!(plan.reason.contains("low hit rate"));
    }

    #[tokio::test]
    async fn test_exact_threshold_hit_rate_is_full() {
        // 3 of 10 cached = 0.30, which is not above the 0.3 floor.
        let fx = Fixture::new();
        for i in 0..10 {
            fx.write(&format!("src/f{i}.py"), &format!("x = {i}\n"));
        }
        let head = fx.commit_all("ten files");
        for i in 0..3 {
            for tool in ["bandit", "semgrep"] {
                fx.seed_cache(&format!("src/f{i}.py"), tool).await;
            }
        }

        let request = fx.request(Some(&fx.base), &head);
        let plan = fx.planner().plan(&request, &fx.workdir, &agents()).await;
        assert!(plan.is_full());
        assert!(plan.reason.contains("low hit rate"));
    }

    #[tokio::test]
    async fn test_incremental_partitions_live_and_cached() {
        let fx = Fixture::new();
        fx.write("src/main.go", "package main\n");
        fx.write("src/utils.go", "package main // utils\n");
        let head = fx.commit_all("go files");
        for tool in ["bandit", "semgrep"] {
            fx.seed_cache("src/main.go", tool).await;
        }

        let request = fx.request(Some(&fx.base), &head);
        let plan = fx.planner().plan(&request, &fx.workdir, &agents()).await;

        assert_eq!(plan.strategy, PlanStrategy::Incremental);
        assert_eq!(plan.live_files, vec!["src/utils.go"]);
        assert_eq!(plan.cached.len(), 2); // one per tool
        assert!((plan.hit_ratio - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_partial_tool_hit_sends_file_live() {
        let fx = Fixture::new();
        fx.write("src/main.go", "package main\n");
        fx.write("src/other.go", "package main // other\n");
        fx.write("src/third.go", "package main // third\n");
        let head = fx.commit_all("go files");
        // main.go cached for both tools; other.go for bandit only.
        for tool in ["bandit", "semgrep"] {
            fx.seed_cache("src/main.go", tool).await;
        }
        fx.seed_cache("src/other.go", "bandit").await;

        let request = fx.request(Some(&fx.base), &head);
        let plan = fx.planner().plan(&request, &fx.workdir, &agents()).await;

        assert_eq!(plan.strategy, PlanStrategy::Incremental);
        assert!(plan.live_files.contains(&"src/other.go".to_string()));
        assert!(plan.live_files.contains(&"src/third.go".to_string()));
        assert!(plan.cached.iter().all(|c| c.path == "src/main.go"));
    }

    #[tokio::test]
    async fn test_deleted_file_invalidated_and_never_live() {
        let fx = Fixture::new();
        fx.write("src/dead.py", "gone = 1\n");
        fx.write("src/kept.py", "kept = 1\n");
        let mid = fx.commit_all("add files");

        // Cache entries exist for the soon-to-be-deleted path.
        for tool in ["bandit", "semgrep"] {
            fx.seed_cache("src/dead.py", tool).await;
            fx.seed_cache("src/kept.py", tool).await;
        }

        std::fs::remove_file(fx.dir.path().join("src/dead.py")).unwrap();
        fx.write("src/kept.py", "kept = 2\n");
        let head = fx.commit_all("delete one");

        let request = fx.request(Some(&mid), &head);
        let plan = fx.planner().plan(&request, &fx.workdir, &agents()).await;

        assert!(!plan.live_files.contains(&"src/dead.py".to_string()));
        let stats = fx.cache.stats("repo-1").await.unwrap();
        // Both dead.py entries are gone; kept.py entries remain (stale
        // content hash, but still present under their key).
        assert_eq!(stats.entries, 2);
    }

    #[tokio::test]
    async fn test_no_scannable_changes_is_empty_incremental() {
        let fx = Fixture::new();
        fx.write("README.md", "# docs\n");
        let head = fx.commit_all("docs only");

        let request = fx.request(Some(&fx.base), &head);
        let plan = fx.planner().plan(&request, &fx.workdir, &agents()).await;

        assert_eq!(plan.strategy, PlanStrategy::Incremental);
        assert!(plan.live_files.is_empty());
        assert!(plan.cached.is_empty());
    }

    #[test]
    fn test_scannable_extension_set() {
        assert!(is_scannable("src/app.py"));
        assert!(is_scannable("a/b/c.tsx"));
        assert!(is_scannable("native/impl.mm"));
        assert!(!is_scannable("README.md"));
        assert!(!is_scannable("Makefile"));
        assert!(!is_scannable("image.png"));
    }

    #[test]
    fn test_content_hash_is_sha256_hex() {
        let h = content_hash(b"hello\n");
        assert_eq!(h.len(), 64);
        assert_eq!(
            h,
            "5891b5b522d5df086d0ff0b110fbd9d21bb4fc7163af34d08286a2e846f6be03"
        );
    }
}
