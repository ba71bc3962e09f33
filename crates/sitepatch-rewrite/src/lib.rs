//! Feature detection and anchor-located splicing of rendered templates into page text.
//!
//! Pages are treated as opaque text. Every insertion rule names an anchor that must match
//! exactly once in the text it is applied to; the rendered template is spliced before,
//! after, or in place of that match (or of one of its capture groups) and nothing outside
//! the splice changes.

use std::path::PathBuf;
use std::sync::LazyLock;

use regex::{Captures, Regex};
use sitepatch_core::{
    FailureKind, FeatureConfig, InsertPosition, InsertionRule, MissingAnchorPolicy, Payload,
    SpliceRecord, TextPattern,
};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "sitepatch-rewrite";

static PLACEHOLDER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\{\{|\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}\}").unwrap()
});

#[derive(Debug, Error)]
pub enum RewriteError {
    #[error("invalid pattern `{pattern}`: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("anchor `{pattern}` has no capture group named `{group}`")]
    UnknownGroup { pattern: String, group: String },
    #[error("anchor `{pattern}` not found")]
    AnchorNotFound { pattern: String },
    #[error("anchor `{pattern}` matched {count} times, expected exactly one")]
    AnchorAmbiguous { pattern: String, count: usize },
    #[error("capture group `{group}` of anchor `{pattern}` did not take part in the match")]
    GroupNotCaptured { pattern: String, group: String },
    #[error("template placeholder `{{{{{name}}}}}` has no value")]
    UnresolvedPlaceholder { name: String },
}

impl RewriteError {
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::AnchorNotFound { .. } | Self::GroupNotCaptured { .. } => {
                FailureKind::AnchorNotFound
            }
            Self::AnchorAmbiguous { .. } => FailureKind::AnchorAmbiguous,
            Self::InvalidPattern { .. }
            | Self::UnknownGroup { .. }
            | Self::UnresolvedPlaceholder { .. } => FailureKind::Template,
        }
    }
}

/// A rule error tagged with the position of the rule that raised it.
#[derive(Debug, Error)]
#[error("{}: {}", rule_name(.index, .label), .error)]
pub struct RuleFailure {
    pub index: usize,
    pub label: Option<String>,
    #[source]
    pub error: RewriteError,
}

fn rule_name(index: &usize, label: &Option<String>) -> String {
    match label {
        Some(label) => format!("rule {index} ({label})"),
        None => format!("rule {index}"),
    }
}

#[derive(Debug, Error)]
#[error("feature `{feature}` {part}: {source}")]
pub struct FeatureError {
    pub feature: String,
    pub part: String,
    #[source]
    pub source: RewriteError,
}

pub fn compile_pattern(pattern: &TextPattern) -> Result<Regex, RewriteError> {
    let source = match pattern {
        TextPattern::Literal(text) => regex::escape(text),
        TextPattern::Regex(re) => re.clone(),
    };
    Regex::new(&source).map_err(|source| RewriteError::InvalidPattern {
        pattern: pattern.as_str().to_string(),
        source,
    })
}

/// True iff `marker` matches anywhere in `text`.
pub fn has_feature(text: &str, marker: &Regex) -> bool {
    marker.is_match(text)
}

#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub label: Option<String>,
    anchor: Regex,
    group: Option<String>,
    position: InsertPosition,
    template: String,
    unless_present: Option<Regex>,
}

impl CompiledRule {
    pub fn compile(rule: &InsertionRule) -> Result<Self, RewriteError> {
        let anchor = compile_pattern(&rule.anchor)?;
        if let Some(group) = &rule.group {
            if !anchor.capture_names().flatten().any(|name| name == group) {
                return Err(RewriteError::UnknownGroup {
                    pattern: rule.anchor.as_str().to_string(),
                    group: group.clone(),
                });
            }
        }
        let unless_present = rule.unless_present.as_ref().map(compile_pattern).transpose()?;
        Ok(Self {
            label: rule.label.clone(),
            anchor,
            group: rule.group.clone(),
            position: rule.position,
            template: rule.template.clone(),
            unless_present,
        })
    }
}

/// A feature with every pattern compiled, ready to be applied to many pages.
#[derive(Debug, Clone)]
pub struct CompiledFeature {
    name: String,
    marker: Regex,
    applies_to: Option<Regex>,
    on_missing_anchor: MissingAnchorPolicy,
    content: PathBuf,
    rules: Vec<CompiledRule>,
}

impl CompiledFeature {
    pub fn compile(config: &FeatureConfig) -> Result<Self, FeatureError> {
        let invalid = |part: String| {
            let feature = config.name.clone();
            move |source| FeatureError {
                feature,
                part,
                source,
            }
        };

        let marker = compile_pattern(&config.marker).map_err(invalid("marker".to_string()))?;
        let applies_to = config
            .applies_to
            .as_ref()
            .map(compile_pattern)
            .transpose()
            .map_err(invalid("applies_to".to_string()))?;
        let rules = config
            .rules
            .iter()
            .enumerate()
            .map(|(index, rule)| {
                CompiledRule::compile(rule).map_err(invalid(rule_name(&index, &rule.label)))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            name: config.name.clone(),
            marker,
            applies_to,
            on_missing_anchor: config.on_missing_anchor,
            content: config.content.clone(),
            rules,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn content(&self) -> &PathBuf {
        &self.content
    }

    pub fn rules(&self) -> &[CompiledRule] {
        &self.rules
    }

    pub fn on_missing_anchor(&self) -> MissingAnchorPolicy {
        self.on_missing_anchor
    }

    pub fn is_present(&self, text: &str) -> bool {
        has_feature(text, &self.marker)
    }

    pub fn applies_to(&self, slug: &str) -> bool {
        self.applies_to.as_ref().map_or(true, |re| re.is_match(slug))
    }
}

/// Values available to `{{placeholder}}`s while rendering a rule template.
#[derive(Debug, Clone, Copy)]
pub struct TemplateContext<'a> {
    pub feature: &'a str,
    pub slug: &'a str,
    pub category: &'a str,
    pub payload: &'a Payload,
}

/// Substitute `{{payload}}`, `{{slug}}`, `{{category}}`, `{{feature}}` and `{{count}}`, then
/// any named capture group of the anchor match (e.g. `{{indent}}`).
/// The payload literal is indented to the leading whitespace of its line.
///
/// `{{{{` renders as a literal `{{`, so JSX object shorthand is written
/// `style={{{{ display }}` in a template.
pub fn render_template(
    template: &str,
    ctx: &TemplateContext<'_>,
    anchor: Option<&Captures<'_>>,
) -> Result<String, RewriteError> {
    let mut out = String::with_capacity(template.len());
    let mut last = 0;
    for caps in PLACEHOLDER_RE.captures_iter(template) {
        let Some(whole) = caps.get(0) else {
            continue;
        };
        out.push_str(&template[last..whole.start()]);
        let Some(name) = caps.get(1) else {
            out.push_str("{{");
            last = whole.end();
            continue;
        };
        let value = match name.as_str() {
            "payload" => payload_literal(ctx.payload, &current_line_indent(&out)),
            "slug" => ctx.slug.to_string(),
            "category" => ctx.category.to_string(),
            "feature" => ctx.feature.to_string(),
            "count" => ctx.payload.len().to_string(),
            other => anchor
                .and_then(|caps| caps.name(other))
                .map(|m| m.as_str().to_string())
                .ok_or_else(|| RewriteError::UnresolvedPlaceholder {
                    name: other.to_string(),
                })?,
        };
        out.push_str(&value);
        last = whole.end();
    }
    out.push_str(&template[last..]);
    Ok(out)
}

fn current_line_indent(rendered: &str) -> String {
    let line = rendered.rsplit('\n').next().unwrap_or_default();
    line.chars().take_while(|c| *c == ' ' || *c == '\t').collect()
}

/// Serialize a payload as a JS array literal of object literals.
pub fn payload_literal(payload: &Payload, indent: &str) -> String {
    let objects: Vec<Vec<(&str, &str)>> = match payload {
        Payload::Faq(entries) => entries
            .iter()
            .map(|e| vec![("question", e.question.as_str()), ("answer", e.answer.as_str())])
            .collect(),
        Payload::RelatedArticles(entries) => entries
            .iter()
            .map(|e| {
                vec![
                    ("title", e.title.as_str()),
                    ("href", e.href.as_str()),
                    ("description", e.description.as_str()),
                ]
            })
            .collect(),
    };
    if objects.is_empty() {
        return "[]".to_string();
    }

    let mut out = String::from("[\n");
    for fields in objects {
        out.push_str(&format!("{indent}  {{\n"));
        for (key, value) in fields {
            out.push_str(&format!("{indent}    {key}: {},\n", js_string(value)));
        }
        out.push_str(&format!("{indent}  }},\n"));
    }
    out.push_str(&format!("{indent}]"));
    out
}

fn js_string(value: &str) -> String {
    serde_json::Value::String(value.to_string()).to_string()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Applied {
    pub text: String,
    /// `None` when the rule's `unless_present` guard already matched.
    pub splice: Option<SpliceRecord>,
}

/// Apply one rule. The anchor must match exactly once in `text`.
pub fn apply_rule(
    text: &str,
    rule: &CompiledRule,
    index: usize,
    ctx: &TemplateContext<'_>,
) -> Result<Applied, RewriteError> {
    if let Some(guard) = &rule.unless_present {
        if guard.is_match(text) {
            debug!(rule = index, guard = guard.as_str(), "rule guard matched, skipping");
            return Ok(Applied {
                text: text.to_string(),
                splice: None,
            });
        }
    }

    let pattern = || rule.anchor.as_str().to_string();
    let mut matches = rule.anchor.captures_iter(text);
    let Some(caps) = matches.next() else {
        return Err(RewriteError::AnchorNotFound { pattern: pattern() });
    };
    let extra = matches.count();
    if extra > 0 {
        return Err(RewriteError::AnchorAmbiguous {
            pattern: pattern(),
            count: extra + 1,
        });
    }

    let region = match &rule.group {
        Some(group) => caps.name(group).ok_or_else(|| RewriteError::GroupNotCaptured {
            pattern: pattern(),
            group: group.clone(),
        })?,
        None => caps.get(0).ok_or_else(|| RewriteError::AnchorNotFound { pattern: pattern() })?,
    };
    let (start, end) = match rule.position {
        InsertPosition::Before => (region.start(), region.start()),
        InsertPosition::After => (region.end(), region.end()),
        InsertPosition::Replace => (region.start(), region.end()),
    };

    let rendered = render_template(&rule.template, ctx, Some(&caps))?;
    let mut out = String::with_capacity(text.len() + rendered.len());
    out.push_str(&text[..start]);
    out.push_str(&rendered);
    out.push_str(&text[end..]);

    let splice = SpliceRecord {
        rule_index: index,
        label: rule.label.clone(),
        offset: start,
        line: text[..start].matches('\n').count() + 1,
        removed_bytes: end - start,
        inserted_bytes: rendered.len(),
        inserted_lines: rendered.lines().count(),
    };
    debug!(rule = index, line = splice.line, bytes = splice.inserted_bytes, "rule applied");
    Ok(Applied {
        text: out,
        splice: Some(splice),
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Patched {
    pub text: String,
    pub splices: Vec<SpliceRecord>,
}

/// Apply rules in order to the evolving text, stopping at the first failure.
pub fn apply_rules(
    text: &str,
    rules: &[CompiledRule],
    ctx: &TemplateContext<'_>,
) -> Result<Patched, RuleFailure> {
    let mut current = text.to_string();
    let mut splices = Vec::new();
    for (index, rule) in rules.iter().enumerate() {
        let applied = apply_rule(&current, rule, index, ctx).map_err(|error| RuleFailure {
            index,
            label: rule.label.clone(),
            error,
        })?;
        current = applied.text;
        splices.extend(applied.splice);
    }
    Ok(Patched {
        text: current,
        splices,
    })
}
