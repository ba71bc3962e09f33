//! Batch driver: workspace configuration, page classification, per-file patching and run reports.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sitepatch_core::{
    BatchCounts, BatchReport, ClassificationRules, ContentRegistry, FailureKind, FeatureConfig,
    FileOutcome, FileReport, MissingAnchorPolicy, PageFile, PageTarget, SkipReason,
};
use sitepatch_rewrite::{apply_rules, compile_pattern, CompiledFeature, TemplateContext};
use sitepatch_storage::{sha256_hex, FsPageStore, PageStore, PageWalker, DEFAULT_EXTENSIONS};
use tracing::{debug, info, info_span, warn};

pub const CRATE_NAME: &str = "sitepatch-batch";

/// Schema version declared by `features.yaml` and `rules/categories.yaml`.
pub const CONFIG_VERSION: u32 = 1;

#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub workspace_root: PathBuf,
    pub target_dir: PathBuf,
    pub reports_dir: Option<PathBuf>,
    pub dry_run: bool,
    pub extensions: Vec<String>,
    pub page_stems: Vec<String>,
}

impl BatchConfig {
    pub fn from_env() -> Self {
        let workspace_root = std::env::var("SITEPATCH_WORKSPACE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));
        Self {
            target_dir: std::env::var("SITEPATCH_TARGET_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| workspace_root.join("app")),
            reports_dir: std::env::var("SITEPATCH_REPORTS_DIR").ok().map(PathBuf::from),
            dry_run: std::env::var("SITEPATCH_DRY_RUN")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            extensions: env_list("SITEPATCH_EXTENSIONS", DEFAULT_EXTENSIONS),
            page_stems: env_list("SITEPATCH_PAGE_STEMS", &["page"]),
            workspace_root,
        }
    }

    pub fn walker(&self) -> PageWalker {
        PageWalker::new(&self.target_dir)
            .with_extensions(&self.extensions)
            .with_page_stems(&self.page_stems)
    }
}

fn env_list(name: &str, default: &[&str]) -> Vec<String> {
    std::env::var(name)
        .map(|v| {
            v.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_else(|_| default.iter().map(|s| s.to_string()).collect())
}

fn read_yaml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let text =
        fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

/// Contents of `features.yaml`.
#[derive(Debug, Clone, Deserialize)]
pub struct FeatureRegistry {
    version: u32,
    pub features: Vec<FeatureConfig>,
}

impl FeatureRegistry {
    pub fn load(path: &Path) -> Result<Self> {
        let registry: Self = read_yaml(path)?;
        if registry.version != CONFIG_VERSION {
            bail!(
                "{}: unsupported version {} (expected {CONFIG_VERSION})",
                path.display(),
                registry.version
            );
        }
        let mut seen = BTreeSet::new();
        for feature in &registry.features {
            if !seen.insert(feature.name.as_str()) {
                bail!("{}: feature `{}` is defined twice", path.display(), feature.name);
            }
        }
        Ok(registry)
    }

    pub fn from_workspace_root(root: &Path) -> Result<Self> {
        Self::load(&root.join("features.yaml"))
    }

    pub fn get(&self, name: &str) -> Result<&FeatureConfig> {
        match self.features.iter().find(|f| f.name == name) {
            Some(feature) => Ok(feature),
            None => bail!(
                "unknown feature `{name}` (configured: {})",
                self.features
                    .iter()
                    .map(|f| f.name.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        }
    }

    pub fn enabled(&self) -> impl Iterator<Item = &FeatureConfig> {
        self.features.iter().filter(|f| f.enabled)
    }
}

pub fn load_content_registry(path: &Path) -> Result<ContentRegistry> {
    read_yaml(path)
}

pub fn load_classification_rules(root: &Path) -> Result<ClassificationRules> {
    let path = root.join("rules").join("categories.yaml");
    let rules: ClassificationRules = read_yaml(&path)?;
    if rules.version != CONFIG_VERSION {
        bail!(
            "{}: unsupported version {} (expected {CONFIG_VERSION})",
            path.display(),
            rules.version
        );
    }
    Ok(rules)
}

#[derive(Debug, Clone)]
pub struct CategoryRule {
    pattern: Regex,
    category: String,
}

/// First rule whose pattern matches the slug decides; `default` otherwise.
pub fn classify<'a>(slug: &str, rules: &'a [CategoryRule], default: &'a str) -> &'a str {
    rules
        .iter()
        .find(|rule| rule.pattern.is_match(slug))
        .map_or(default, |rule| rule.category.as_str())
}

/// Maps a page slug to the category used for content lookup.
pub trait CategorySource {
    fn category_for(&self, slug: &str) -> String;
}

#[derive(Debug, Clone)]
pub struct Classifier {
    rules: Vec<CategoryRule>,
    default: String,
}

impl Classifier {
    pub fn new(config: &ClassificationRules) -> Result<Self> {
        if config.default.trim().is_empty() {
            bail!("classification rules need a non-empty default category");
        }
        let rules = config
            .rules
            .iter()
            .enumerate()
            .map(|(index, rule)| {
                compile_pattern(&rule.pattern)
                    .map(|pattern| CategoryRule {
                        pattern,
                        category: rule.category.clone(),
                    })
                    .with_context(|| {
                        format!("classification rule {index} ({})", rule.category)
                    })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            rules,
            default: config.default.clone(),
        })
    }

    pub fn from_workspace_root(root: &Path) -> Result<Self> {
        Self::new(&load_classification_rules(root)?)
            .context("compiling rules/categories.yaml")
    }

    pub fn classify(&self, slug: &str) -> &str {
        classify(slug, &self.rules, &self.default)
    }
}

impl CategorySource for Classifier {
    fn category_for(&self, slug: &str) -> String {
        self.classify(slug).to_string()
    }
}

/// A compiled feature together with the content it injects.
#[derive(Debug, Clone)]
pub struct PreparedFeature {
    pub feature: CompiledFeature,
    pub content: ContentRegistry,
}

impl PreparedFeature {
    pub fn load(workspace_root: &Path, config: &FeatureConfig) -> Result<Self> {
        let feature = CompiledFeature::compile(config)?;
        let content_path = workspace_root.join(feature.content());
        let content = load_content_registry(&content_path)
            .with_context(|| format!("loading content for feature `{}`", config.name))?;
        if let Some(expected) = config.payload {
            if content.kind() != expected {
                bail!(
                    "feature `{}` expects {} content but {} holds {}",
                    config.name,
                    expected.as_str(),
                    content_path.display(),
                    content.kind().as_str()
                );
            }
        }
        Ok(Self { feature, content })
    }
}

/// Applies one feature to a list of pages, one file at a time.
pub struct BatchPipeline<'a> {
    feature: &'a CompiledFeature,
    content: &'a ContentRegistry,
    categories: &'a dyn CategorySource,
    store: &'a dyn PageStore,
    dry_run: bool,
}

#[derive(Default)]
struct FileTrace {
    category: Option<String>,
    before_sha256: Option<String>,
    after_sha256: Option<String>,
}

impl<'a> BatchPipeline<'a> {
    pub fn new(
        feature: &'a CompiledFeature,
        content: &'a ContentRegistry,
        categories: &'a dyn CategorySource,
        store: &'a dyn PageStore,
    ) -> Self {
        Self {
            feature,
            content,
            categories,
            store,
            dry_run: false,
        }
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Pages outside the feature's `applies_to` filter are not part of the report.
    pub fn run(&self, targets: &[PageTarget]) -> BatchReport {
        let mut report = BatchReport::start(self.feature.name(), self.dry_run);
        for target in targets.iter().filter(|t| self.feature.applies_to(&t.slug)) {
            let span = info_span!(
                "patch_file",
                feature = self.feature.name(),
                path = %target.path.display(),
                slug = %target.slug
            );
            let _guard = span.enter();
            let file = self.process(target);
            match &file.outcome {
                FileOutcome::Updated { splices } => {
                    info!(splices = splices.len(), dry_run = self.dry_run, "page updated")
                }
                FileOutcome::Skipped { reason, .. } => {
                    debug!(reason = reason.as_str(), "page skipped")
                }
                FileOutcome::Failed { kind, message, .. } => {
                    warn!(kind = kind.as_str(), %message, "page failed")
                }
            }
            report.files.push(file);
        }

        let report = report.finish();
        let counts = report.counts();
        info!(
            feature = %report.feature,
            updated = counts.updated,
            skipped = counts.skipped_already_present + counts.skipped_no_category + counts.skipped_no_anchor,
            failed = counts.failed,
            "batch complete"
        );
        report
    }

    fn process(&self, target: &PageTarget) -> FileReport {
        let mut trace = FileTrace::default();
        let outcome = self.patch_page(target, &mut trace);
        FileReport {
            path: target.path.clone(),
            slug: target.slug.clone(),
            category: trace.category,
            outcome,
            before_sha256: trace.before_sha256,
            after_sha256: trace.after_sha256,
        }
    }

    fn patch_page(&self, target: &PageTarget, trace: &mut FileTrace) -> FileOutcome {
        let page = match self.store.read_page(&target.path) {
            Ok(content) => PageFile::new(target, content),
            Err(err) => return failed(FailureKind::Read, None, err.to_string()),
        };
        trace.before_sha256 = Some(sha256_hex(page.content.as_bytes()));

        if self.feature.is_present(&page.content) {
            return skipped(SkipReason::AlreadyPresent, None);
        }

        let category = self.categories.category_for(&page.slug);
        trace.category = Some(category.clone());
        let Some(payload) = self.content.payload_for(&page.slug, &category) else {
            return skipped(
                SkipReason::NoMatchingCategory,
                Some(format!("no content for page or category `{category}`")),
            );
        };

        let ctx = TemplateContext {
            feature: self.feature.name(),
            slug: &page.slug,
            category: &category,
            payload: &payload,
        };
        let patched = match apply_rules(&page.content, self.feature.rules(), &ctx) {
            Ok(patched) => patched,
            Err(failure) => {
                let kind = failure.error.failure_kind();
                if kind == FailureKind::AnchorNotFound
                    && self.feature.on_missing_anchor() == MissingAnchorPolicy::Skip
                {
                    return skipped(SkipReason::NoAnchor, Some(failure.to_string()));
                }
                return failed(kind, Some(failure.index), failure.to_string());
            }
        };

        if !self.feature.is_present(&patched.text) {
            return failed(
                FailureKind::MarkerNotEstablished,
                None,
                format!(
                    "marker of feature `{}` is still missing after {} splice(s)",
                    self.feature.name(),
                    patched.splices.len()
                ),
            );
        }

        if !self.dry_run {
            if let Err(err) = self.store.write_page(&page.path, &patched.text) {
                return failed(FailureKind::WriteFailure, None, err.to_string());
            }
        }
        trace.after_sha256 = Some(sha256_hex(patched.text.as_bytes()));
        FileOutcome::Updated {
            splices: patched.splices,
        }
    }
}

fn skipped(reason: SkipReason, detail: Option<String>) -> FileOutcome {
    FileOutcome::Skipped { reason, detail }
}

fn failed(kind: FailureKind, rule_index: Option<usize>, message: String) -> FileOutcome {
    FileOutcome::Failed {
        kind,
        rule_index,
        message,
    }
}

pub fn run_batch(
    targets: &[PageTarget],
    feature: &CompiledFeature,
    content: &ContentRegistry,
    categories: &dyn CategorySource,
    store: &dyn PageStore,
    dry_run: bool,
) -> BatchReport {
    BatchPipeline::new(feature, content, categories, store)
        .with_dry_run(dry_run)
        .run(targets)
}

/// Plain-text summary: counts, then updated files with their splices, then failures and skips.
pub fn render_summary(report: &BatchReport) -> String {
    let counts = report.counts();
    let mut lines = vec![format!(
        "{}{}: {} updated, {} already present, {} without content, {} without anchor, {} failed",
        report.feature,
        if report.dry_run { " (dry run)" } else { "" },
        counts.updated,
        counts.skipped_already_present,
        counts.skipped_no_category,
        counts.skipped_no_anchor,
        counts.failed,
    )];

    let verb = if report.dry_run { "would update" } else { "updated" };
    for file in report.updated() {
        lines.push(format!("  {verb} {}", file.path.display()));
        if let FileOutcome::Updated { splices } = &file.outcome {
            for splice in splices {
                let name = splice
                    .label
                    .as_deref()
                    .map_or_else(|| format!("rule {}", splice.rule_index), |l| l.to_string());
                lines.push(format!(
                    "    line {}: {name} (+{} lines, -{} bytes)",
                    splice.line, splice.inserted_lines, splice.removed_bytes
                ));
            }
        }
    }
    for file in report.failed() {
        if let FileOutcome::Failed { kind, message, .. } = &file.outcome {
            lines.push(format!(
                "  failed {} [{}]: {message}",
                file.path.display(),
                kind.as_str()
            ));
        }
    }
    for file in report.skipped() {
        if let FileOutcome::Skipped { reason, detail } = &file.outcome {
            let detail = detail.as_deref().map(|d| format!(": {d}")).unwrap_or_default();
            lines.push(format!(
                "  skipped {} [{}]{detail}",
                file.path.display(),
                reason.as_str()
            ));
        }
    }
    lines.join("\n")
}

fn render_markdown(report: &BatchReport, counts: &BatchCounts) -> String {
    format!(
        "# sitepatch run\n\n- Run ID: `{}`\n- Feature: `{}`\n- Dry run: {}\n- Started: {}\n- Finished: {}\n- Files: {}\n\n## Counts\n- updated: {}\n- already present: {}\n- no matching category: {}\n- no anchor: {}\n- failed: {}\n\n## Files\n```\n{}\n```\n",
        report.run_id,
        report.feature,
        report.dry_run,
        report.started_at,
        report.finished_at,
        counts.total(),
        counts.updated,
        counts.skipped_already_present,
        counts.skipped_no_category,
        counts.skipped_no_anchor,
        counts.failed,
        render_summary(report),
    )
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredReport {
    counts: BatchCounts,
    report: BatchReport,
}

/// Write `summary.md` and `report.json` under `<reports_root>/<run_id>/`.
pub fn write_reports(reports_root: &Path, report: &BatchReport) -> Result<PathBuf> {
    let reports_dir = reports_root.join(report.run_id.to_string());
    fs::create_dir_all(&reports_dir)
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    let counts = report.counts();
    fs::write(reports_dir.join("summary.md"), render_markdown(report, &counts))
        .context("writing summary.md")?;

    let stored = StoredReport {
        counts,
        report: report.clone(),
    };
    let json = serde_json::to_vec_pretty(&stored).context("serializing batch report")?;
    fs::write(reports_dir.join("report.json"), json).context("writing report.json")?;

    Ok(reports_dir)
}

/// Markdown listing of the most recent persisted runs, newest first.
pub fn report_recent_markdown(runs: usize, reports_root: &Path) -> Result<String> {
    let mut stored = Vec::new();
    for entry in fs::read_dir(reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
    {
        let entry = entry.with_context(|| format!("reading {}", reports_root.display()))?;
        let path = entry.path().join("report.json");
        if !path.is_file() {
            continue;
        }
        let text =
            fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
        let report: StoredReport =
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        stored.push((entry.path(), report));
    }
    stored.sort_by(|a, b| b.1.report.started_at.cmp(&a.1.report.started_at));

    let mut lines = vec!["# sitepatch runs".to_string(), String::new()];
    for (dir, StoredReport { counts, report }) in stored.into_iter().take(runs.max(1)) {
        lines.push(format!("## Run `{}`", report.run_id));
        lines.push(format!("- feature: `{}`", report.feature));
        lines.push(format!("- started: {}", report.started_at));
        if report.dry_run {
            lines.push("- dry run".to_string());
        }
        lines.push(format!(
            "- updated: {}, skipped: {}, failed: {}",
            counts.updated,
            counts.skipped_already_present + counts.skipped_no_category + counts.skipped_no_anchor,
            counts.failed
        ));
        for file in report.failed() {
            lines.push(format!("  - failed: `{}`", file.slug));
        }
        lines.push(format!("- summary: `{}`", dir.join("summary.md").display()));
        lines.push(String::new());
    }

    Ok(lines.join("\n"))
}

#[derive(Debug, Clone)]
pub struct FeatureRun {
    pub report: BatchReport,
    pub reports_dir: Option<PathBuf>,
    /// Set when the pages were processed but persisting the report failed.
    pub report_error: Option<String>,
}

impl FeatureRun {
    pub fn has_failures(&self) -> bool {
        self.report.has_failures() || self.report_error.is_some()
    }
}

/// Run one named feature, or every enabled feature in registry order.
///
/// All configuration is loaded and compiled before the first page is read.
pub fn run_features(config: &BatchConfig, only: Option<&str>) -> Result<Vec<FeatureRun>> {
    let registry = FeatureRegistry::from_workspace_root(&config.workspace_root)?;
    let selected = match only {
        Some(name) => vec![registry.get(name)?],
        None => registry.enabled().collect(),
    };
    if selected.is_empty() {
        bail!("no enabled features in features.yaml");
    }
    let prepared = selected
        .into_iter()
        .map(|feature| PreparedFeature::load(&config.workspace_root, feature))
        .collect::<Result<Vec<_>>>()?;
    let classifier = Classifier::from_workspace_root(&config.workspace_root)?;
    let targets = config.walker().collect_targets()?;
    info!(
        target_dir = %config.target_dir.display(),
        pages = targets.len(),
        features = prepared.len(),
        dry_run = config.dry_run,
        "starting batch"
    );

    let store = FsPageStore;
    let mut runs = Vec::with_capacity(prepared.len());
    for PreparedFeature { feature, content } in &prepared {
        let report = run_batch(&targets, feature, content, &classifier, &store, config.dry_run);
        let mut run = FeatureRun {
            report,
            reports_dir: None,
            report_error: None,
        };
        if let Some(root) = &config.reports_dir {
            match write_reports(root, &run.report) {
                Ok(dir) => run.reports_dir = Some(dir),
                Err(err) => {
                    warn!(feature = %run.report.feature, error = %format!("{err:#}"), "report not written");
                    run.report_error = Some(format!("{err:#}"));
                }
            }
        }
        runs.push(run);
    }
    Ok(runs)
}
