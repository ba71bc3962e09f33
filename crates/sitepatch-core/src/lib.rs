//! Core domain model for sitepatch: page files, injectable features, content payloads,
//! classification rules, and batch outcomes.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "sitepatch-core";

/// A matcher over page text or slugs. Literals are escaped before compilation.
///
/// Written in config files as a single-key map, `{literal: ...}` or `{regex: ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "PatternRepr", into = "PatternRepr")]
pub enum TextPattern {
    Literal(String),
    Regex(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct PatternRepr {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    literal: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    regex: Option<String>,
}

impl TryFrom<PatternRepr> for TextPattern {
    type Error = String;

    fn try_from(repr: PatternRepr) -> Result<Self, Self::Error> {
        match (repr.literal, repr.regex) {
            (Some(text), None) => Ok(Self::Literal(text)),
            (None, Some(pattern)) => Ok(Self::Regex(pattern)),
            (Some(_), Some(_)) => Err("pattern sets both `literal` and `regex`".to_string()),
            (None, None) => Err("pattern needs one of `literal` or `regex`".to_string()),
        }
    }
}

impl From<TextPattern> for PatternRepr {
    fn from(pattern: TextPattern) -> Self {
        match pattern {
            TextPattern::Literal(text) => Self {
                literal: Some(text),
                regex: None,
            },
            TextPattern::Regex(pattern) => Self {
                literal: None,
                regex: Some(pattern),
            },
        }
    }
}

impl TextPattern {
    pub fn literal(text: impl Into<String>) -> Self {
        Self::Literal(text.into())
    }

    pub fn regex(pattern: impl Into<String>) -> Self {
        Self::Regex(pattern.into())
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Literal(s) | Self::Regex(s) => s,
        }
    }
}

/// A page discovered on disk, before its content is read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageTarget {
    pub path: PathBuf,
    pub slug: String,
}

/// A page held in memory for the duration of one batch iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageFile {
    pub path: PathBuf,
    pub slug: String,
    pub content: String,
}

impl PageFile {
    pub fn new(target: &PageTarget, content: String) -> Self {
        Self {
            path: target.path.clone(),
            slug: target.slug.clone(),
            content,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsertPosition {
    Before,
    After,
    Replace,
}

/// One textual splice located by an anchor that must match exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InsertionRule {
    #[serde(default)]
    pub label: Option<String>,
    pub anchor: TextPattern,
    /// Capture group of the anchor to splice around instead of the whole match.
    #[serde(default)]
    pub group: Option<String>,
    pub position: InsertPosition,
    pub template: String,
    /// The rule is a no-op when this already matches the current text.
    #[serde(default)]
    pub unless_present: Option<TextPattern>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingAnchorPolicy {
    #[default]
    Fail,
    Skip,
}

/// Immutable descriptor of one injectable feature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureConfig {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub marker: TextPattern,
    /// Content registry file, relative to the workspace root.
    pub content: PathBuf,
    #[serde(default)]
    pub applies_to: Option<TextPattern>,
    #[serde(default)]
    pub on_missing_anchor: MissingAnchorPolicy,
    /// Payload kind the templates are written for; the content file must match.
    #[serde(default)]
    pub payload: Option<PayloadKind>,
    pub rules: Vec<InsertionRule>,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaqEntry {
    pub question: String,
    pub answer: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelatedArticle {
    pub title: String,
    pub href: String,
    pub description: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadKind {
    Faq,
    RelatedArticles,
}

impl PayloadKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Faq => "faq",
            Self::RelatedArticles => "related_articles",
        }
    }
}

/// Structured content injected into a page by a feature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "entries", rename_all = "snake_case")]
pub enum Payload {
    Faq(Vec<FaqEntry>),
    RelatedArticles(Vec<RelatedArticle>),
}

impl Payload {
    pub fn kind(&self) -> PayloadKind {
        match self {
            Self::Faq(_) => PayloadKind::Faq,
            Self::RelatedArticles(_) => PayloadKind::RelatedArticles,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Faq(entries) => entries.len(),
            Self::RelatedArticles(entries) => entries.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Entries keyed by exact page slug and by category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
pub struct ContentTable<T> {
    #[serde(default)]
    pub pages: BTreeMap<String, Vec<T>>,
    #[serde(default)]
    pub categories: BTreeMap<String, Vec<T>>,
}

impl<T> Default for ContentTable<T> {
    fn default() -> Self {
        Self {
            pages: BTreeMap::new(),
            categories: BTreeMap::new(),
        }
    }
}

impl<T> ContentTable<T> {
    /// Page-specific entries win over category entries.
    pub fn lookup(&self, slug: &str, category: &str) -> Option<&Vec<T>> {
        self.pages
            .get(slug)
            .or_else(|| self.categories.get(category))
            .filter(|entries| !entries.is_empty())
    }
}

/// Page-key / category → payload mapping for one feature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ContentRegistry {
    Faq(ContentTable<FaqEntry>),
    RelatedArticles(ContentTable<RelatedArticle>),
}

impl ContentRegistry {
    pub fn kind(&self) -> PayloadKind {
        match self {
            Self::Faq(_) => PayloadKind::Faq,
            Self::RelatedArticles(_) => PayloadKind::RelatedArticles,
        }
    }

    pub fn payload_for(&self, slug: &str, category: &str) -> Option<Payload> {
        match self {
            Self::Faq(table) => table.lookup(slug, category).cloned().map(Payload::Faq),
            Self::RelatedArticles(table) => table
                .lookup(slug, category)
                .cloned()
                .map(Payload::RelatedArticles),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassificationRule {
    pub pattern: TextPattern,
    pub category: String,
}

/// Ordered classification rules; first match wins, `default` otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassificationRules {
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub rules: Vec<ClassificationRule>,
    pub default: String,
}

/// Structured diff entry for one applied insertion rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpliceRecord {
    pub rule_index: usize,
    pub label: Option<String>,
    /// Byte offset of the splice in the text the rule was applied to.
    pub offset: usize,
    /// 1-based line of `offset`.
    pub line: usize,
    pub removed_bytes: usize,
    pub inserted_bytes: usize,
    pub inserted_lines: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    AlreadyPresent,
    NoMatchingCategory,
    NoAnchor,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AlreadyPresent => "already_present",
            Self::NoMatchingCategory => "no_matching_category",
            Self::NoAnchor => "no_anchor",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Read,
    AnchorNotFound,
    AnchorAmbiguous,
    Template,
    MarkerNotEstablished,
    WriteFailure,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::AnchorNotFound => "anchor_not_found",
            Self::AnchorAmbiguous => "anchor_ambiguous",
            Self::Template => "template",
            Self::MarkerNotEstablished => "marker_not_established",
            Self::WriteFailure => "write_failure",
        }
    }
}

/// Terminal state of one file in a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FileOutcome {
    Updated {
        splices: Vec<SpliceRecord>,
    },
    Skipped {
        reason: SkipReason,
        #[serde(default)]
        detail: Option<String>,
    },
    Failed {
        kind: FailureKind,
        #[serde(default)]
        rule_index: Option<usize>,
        message: String,
    },
}

impl FileOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileReport {
    pub path: PathBuf,
    pub slug: String,
    pub category: Option<String>,
    pub outcome: FileOutcome,
    pub before_sha256: Option<String>,
    pub after_sha256: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BatchCounts {
    pub updated: usize,
    pub skipped_already_present: usize,
    pub skipped_no_category: usize,
    pub skipped_no_anchor: usize,
    pub failed: usize,
}

impl BatchCounts {
    pub fn total(&self) -> usize {
        self.updated
            + self.skipped_already_present
            + self.skipped_no_category
            + self.skipped_no_anchor
            + self.failed
    }
}

/// Aggregate result of applying one feature to a set of pages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    pub run_id: Uuid,
    pub feature: String,
    pub dry_run: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub files: Vec<FileReport>,
}

impl BatchReport {
    pub fn start(feature: impl Into<String>, dry_run: bool) -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            feature: feature.into(),
            dry_run,
            started_at: now,
            finished_at: now,
            files: Vec::new(),
        }
    }

    pub fn finish(mut self) -> Self {
        self.finished_at = Utc::now();
        self
    }

    pub fn counts(&self) -> BatchCounts {
        let mut counts = BatchCounts::default();
        for file in &self.files {
            match &file.outcome {
                FileOutcome::Updated { .. } => counts.updated += 1,
                FileOutcome::Skipped { reason, .. } => match reason {
                    SkipReason::AlreadyPresent => counts.skipped_already_present += 1,
                    SkipReason::NoMatchingCategory => counts.skipped_no_category += 1,
                    SkipReason::NoAnchor => counts.skipped_no_anchor += 1,
                },
                FileOutcome::Failed { .. } => counts.failed += 1,
            }
        }
        counts
    }

    pub fn has_failures(&self) -> bool {
        self.files.iter().any(|f| f.outcome.is_failed())
    }

    pub fn failed(&self) -> impl Iterator<Item = &FileReport> {
        self.files.iter().filter(|f| f.outcome.is_failed())
    }

    pub fn skipped(&self) -> impl Iterator<Item = &FileReport> {
        self.files
            .iter()
            .filter(|f| matches!(f.outcome, FileOutcome::Skipped { .. }))
    }

    pub fn updated(&self) -> impl Iterator<Item = &FileReport> {
        self.files
            .iter()
            .filter(|f| matches!(f.outcome, FileOutcome::Updated { .. }))
    }
}
