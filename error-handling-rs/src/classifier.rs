//! # Error Classifier
//!
//! Scores incidents against the pattern library and, when nothing matches,
//! synthesises a new pattern from the incident text.
//!
//! Auto-created patterns come from a keyword heuristic. They are a
//! best-effort guess and their thresholds are plain constants meant to be
//! tuned.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::incident::{Classification, ErrorIncident};
use crate::pattern::{builtin_patterns, CompiledPattern, ErrorPattern, StrategyKind};
use crate::types::{ErrorCategory, Result, Severity};

/// Words that never count as significant for auto-created patterns
const STOPWORDS: &[&str] = &[
    "about", "after", "again", "been", "before", "being", "could", "does", "error", "from", "have",
    "into", "only", "over", "should", "some", "than", "that", "their", "them", "then", "there",
    "these", "they", "this", "unit", "very", "were", "what", "when", "which", "while", "will",
    "with", "would", "your",
];

/// Strategies seeded into every auto-created pattern
pub const DEFAULT_STRATEGIES: [StrategyKind; 2] = [StrategyKind::Retry, StrategyKind::Fallback];

/// Classifier settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    /// A pattern matches only when its score is strictly above this
    pub confidence_floor: f64,
    /// Synthesise a pattern for incidents nothing matches
    pub auto_create_patterns: bool,
    pub default_max_retries: u32,
    pub default_base_delay: Duration,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            confidence_floor: 0.3,
            auto_create_patterns: true,
            default_max_retries: 3,
            default_base_delay: Duration::from_secs(1),
        }
    }
}

/// Statistics for one pattern
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternStats {
    pub id: String,
    pub category: ErrorCategory,
    pub severity: Severity,
    pub occurrences: u64,
    pub successes: u64,
    pub success_rate: Option<f64>,
    pub auto_created: bool,
}

/// Pattern library plus the scoring rules that use it
#[derive(Debug)]
pub struct ErrorClassifier {
    config: ClassifierConfig,
    patterns: RwLock<Vec<CompiledPattern>>,
}

impl ErrorClassifier {
    /// Classifier seeded with the builtin pattern library
    pub fn new(config: ClassifierConfig) -> Self {
        let patterns = builtin_patterns()
            .into_iter()
            .filter_map(|pattern| CompiledPattern::compile(pattern).ok())
            .collect();

        Self {
            config,
            patterns: RwLock::new(patterns),
        }
    }

    /// Classifier with the given library only
    pub fn with_patterns(config: ClassifierConfig, patterns: Vec<ErrorPattern>) -> Result<Self> {
        let patterns = patterns
            .into_iter()
            .map(CompiledPattern::compile)
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            config,
            patterns: RwLock::new(patterns),
        })
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    /// Adds a pattern, replacing one with the same id in place
    pub fn add_pattern(&self, pattern: ErrorPattern) -> Result<()> {
        let compiled = CompiledPattern::compile(pattern)?;
        let mut patterns = self.patterns.write().unwrap_or_else(PoisonError::into_inner);

        match patterns.iter_mut().find(|p| p.pattern.id == compiled.pattern.id) {
            Some(existing) => *existing = compiled,
            None => patterns.push(compiled),
        }
        Ok(())
    }

    pub fn pattern(&self, id: &str) -> Option<ErrorPattern> {
        self.patterns
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|p| p.pattern.id == id)
            .map(|p| p.pattern.clone())
    }

    pub fn pattern_count(&self) -> usize {
        self.patterns.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Matches `incident` against the library without changing it.
    ///
    /// Every pattern scoring above the floor contributes its
    /// strategies; the best score wins the category and severity, earliest
    /// registered on ties.
    pub fn classify(&self, incident: &ErrorIncident) -> Option<Classification> {
        let patterns = self.patterns.read().unwrap_or_else(PoisonError::into_inner);

        let mut scored: Vec<(f64, &CompiledPattern)> = patterns
            .iter()
            .map(|p| (p.score(incident), p))
            .filter(|(score, _)| *score > self.config.confidence_floor)
            .collect();

        // Stable sort keeps registration order among equal scores
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

        let (confidence, primary) = scored.first().map(|(score, p)| (*score, &p.pattern))?;

        let mut strategies = Vec::new();
        for (_, compiled) in &scored {
            for strategy in &compiled.pattern.strategies {
                if !strategies.contains(strategy) {
                    strategies.push(*strategy);
                }
            }
        }

        debug!(
            incident_id = %incident.id,
            pattern_id = %primary.id,
            confidence = confidence,
            matched = scored.len(),
            "Incident classified"
        );

        Some(Classification {
            pattern_id: Some(primary.id.clone()),
            matched_pattern_ids: scored.iter().map(|(_, p)| p.pattern.id.clone()).collect(),
            category: primary.category,
            severity: primary.severity,
            confidence,
            strategies,
            max_retries: primary.max_retries,
            retry_delay_base: primary.retry_delay_base,
            auto_created: primary.auto_created,
        })
    }

    /// Classifies `incident`, creating a pattern for it if nothing matched
    /// and auto-creation is enabled.
    ///
    /// With auto-creation disabled an unmatched incident gets a
    /// pattern-less classification from the keyword heuristic and the
    /// default strategies.
    pub fn classify_or_create(&self, incident: &ErrorIncident) -> Result<Classification> {
        if let Some(classification) = self.classify(incident) {
            return Ok(classification);
        }

        let pattern = self.synthesize_pattern(incident);

        if !self.config.auto_create_patterns {
            counter!("recovery.classification.unmatched", 1);
            return Ok(Classification {
                pattern_id: None,
                matched_pattern_ids: Vec::new(),
                category: pattern.category,
                severity: pattern.severity,
                confidence: 0.0,
                strategies: pattern.strategies,
                max_retries: pattern.max_retries,
                retry_delay_base: pattern.retry_delay_base,
                auto_created: false,
            });
        }

        info!(
            incident_id = %incident.id,
            pattern_id = %pattern.id,
            category = %pattern.category,
            severity = %pattern.severity,
            "Auto-created error pattern"
        );
        counter!("recovery.patterns.auto_created", 1, "category" => pattern.category.to_string());

        let compiled = CompiledPattern::compile(pattern)?;
        let confidence = compiled.score(incident);
        let pattern = compiled.pattern.clone();
        self.patterns.write().unwrap_or_else(PoisonError::into_inner).push(compiled);

        Ok(Classification {
            pattern_id: Some(pattern.id.clone()),
            matched_pattern_ids: vec![pattern.id],
            category: pattern.category,
            severity: pattern.severity,
            confidence,
            strategies: pattern.strategies,
            max_retries: pattern.max_retries,
            retry_delay_base: pattern.retry_delay_base,
            auto_created: true,
        })
    }

    /// Counts an occurrence against each pattern, and a success against
    /// each when `resolved`
    pub fn record_outcome(&self, pattern_ids: &[String], resolved: bool) {
        let mut patterns = self.patterns.write().unwrap_or_else(PoisonError::into_inner);
        for compiled in patterns.iter_mut().filter(|p| pattern_ids.contains(&p.pattern.id)) {
            compiled.pattern.occurrence_count += 1;
            if resolved {
                compiled.pattern.success_count += 1;
            }
        }
    }

    pub fn pattern_stats(&self) -> Vec<PatternStats> {
        self.patterns
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|compiled| {
                let p = &compiled.pattern;
                PatternStats {
                    id: p.id.clone(),
                    category: p.category,
                    severity: p.severity,
                    occurrences: p.occurrence_count,
                    successes: p.success_count,
                    success_rate: p.success_rate(),
                    auto_created: p.auto_created,
                }
            })
            .collect()
    }

    fn synthesize_pattern(&self, incident: &ErrorIncident) -> ErrorPattern {
        let words = significant_words(&incident.message, 3);
        let haystack = format!("{} {}", incident.message, incident.error_kind).to_lowercase();
        let category = infer_category(&haystack);
        let severity = infer_severity(&haystack);

        let base_id = if words.is_empty() {
            format!("auto_{}", incident.error_kind.to_lowercase())
        } else {
            format!("auto_{}", words.join("_"))
        };
        let id = self.unique_id(base_id);

        let mut pattern = ErrorPattern::new(id, category, severity)
            .with_description(format!("Auto-created from incident {}", incident.id))
            .with_exception_type(incident.error_kind.clone())
            .with_strategies(DEFAULT_STRATEGIES.to_vec())
            .with_retry(self.config.default_max_retries, self.config.default_base_delay);

        // The exception kind alone never clears the floor, so every
        // auto-created pattern also carries a message regex.
        let message = incident.message.trim();
        if !words.is_empty() {
            let escaped: Vec<String> = words.iter().map(|w| regex::escape(w)).collect();
            pattern = pattern.with_message_pattern(format!("(?i){}", escaped.join(".*")));
        } else if !message.is_empty() {
            pattern = pattern.with_message_pattern(format!("(?i)^{}$", regex::escape(message)));
        }
        pattern.auto_created = true;
        pattern
    }

    fn unique_id(&self, base: String) -> String {
        let patterns = self.patterns.read().unwrap_or_else(PoisonError::into_inner);
        let taken = |id: &str| patterns.iter().any(|p| p.pattern.id == id);

        if !taken(&base) {
            return base;
        }
        let mut n = 2;
        loop {
            let candidate = format!("{}_{}", base, n);
            if !taken(&candidate) {
                return candidate;
            }
            n += 1;
        }
    }
}

/// The `limit` most frequent significant words of `message`, returned in
/// order of first appearance. Frequency ties go to the earlier word.
pub fn significant_words(message: &str, limit: usize) -> Vec<String> {
    let mut counts: HashMap<String, (usize, usize)> = HashMap::new();

    for (position, word) in message
        .split(|c: char| !c.is_alphanumeric())
        .map(str::to_lowercase)
        .filter(|w| w.chars().count() > 3 && !STOPWORDS.contains(&w.as_str()))
        .enumerate()
    {
        counts.entry(word).or_insert((0, position)).0 += 1;
    }

    let mut ranked: Vec<(String, usize, usize)> = counts
        .into_iter()
        .map(|(word, (count, first))| (word, count, first))
        .collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.2.cmp(&b.2)));
    ranked.truncate(limit);
    ranked.sort_by_key(|(_, _, first)| *first);

    ranked.into_iter().map(|(word, _, _)| word).collect()
}

/// Keyword-bucket category guess over lowercased text
pub fn infer_category(text: &str) -> ErrorCategory {
    let has = |keywords: &[&str]| keywords.iter().any(|k| text.contains(k));

    if has(&["network", "timeout", "timed out", "connection"]) {
        ErrorCategory::Network
    } else if has(&["auth", "permission"]) {
        ErrorCategory::Authentication
    } else if has(&["memory", "resource"]) {
        ErrorCategory::Resource
    } else if has(&["validation", "format"]) {
        ErrorCategory::Validation
    } else {
        ErrorCategory::System
    }
}

/// Keyword-bucket severity guess over lowercased text
pub fn infer_severity(text: &str) -> Severity {
    let has = |keywords: &[&str]| keywords.iter().any(|k| text.contains(k));

    if has(&["critical", "fatal"]) {
        Severity::Critical
    } else if has(&["memory", "disk"]) {
        Severity::High
    } else if has(&["validation"]) {
        Severity::Low
    } else {
        Severity::Medium
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_classifier() -> ErrorClassifier {
        ErrorClassifier::with_patterns(ClassifierConfig::default(), Vec::new()).unwrap()
    }

    #[test]
    fn test_builtin_network_match() {
        let classifier = ErrorClassifier::new(ClassifierConfig::default());
        let incident = ErrorIncident::new("connection refused by upstream", "BackendError");

        let classification = classifier.classify(&incident).unwrap();
        assert_eq!(classification.pattern_id.as_deref(), Some("network_connection"));
        assert_eq!(classification.category, ErrorCategory::Network);
        assert!((classification.confidence - 0.4).abs() < 1e-9);
    }

    #[test]
    fn test_strategies_gathered_and_deduplicated() {
        let classifier = ErrorClassifier::with_patterns(
            ClassifierConfig::default(),
            vec![
                ErrorPattern::new("a", ErrorCategory::Network, Severity::Medium)
                    .with_message_pattern("refused")
                    .with_strategies(vec![StrategyKind::Retry, StrategyKind::Fallback]),
                ErrorPattern::new("b", ErrorCategory::Backend, Severity::High)
                    .with_message_pattern("refused")
                    .with_exception_type("BackendError")
                    .with_strategies(vec![StrategyKind::CircuitBreak, StrategyKind::Retry]),
            ],
        )
        .unwrap();

        let classification = classifier
            .classify(&ErrorIncident::new("connection refused", "BackendError"))
            .unwrap();
        assert_eq!(classification.pattern_id.as_deref(), Some("b"));
        assert_eq!(classification.severity, Severity::High);
        assert_eq!(
            classification.strategies,
            vec![StrategyKind::CircuitBreak, StrategyKind::Retry, StrategyKind::Fallback]
        );
    }

    #[test]
    fn test_equal_scores_prefer_earliest_pattern() {
        let classifier = ErrorClassifier::with_patterns(
            ClassifierConfig::default(),
            vec![
                ErrorPattern::new("first", ErrorCategory::Network, Severity::Low).with_message_pattern("boom"),
                ErrorPattern::new("second", ErrorCategory::System, Severity::High).with_message_pattern("boom"),
            ],
        )
        .unwrap();

        let incident = ErrorIncident::new("boom", "BackendError");
        for _ in 0..5 {
            assert_eq!(classifier.classify(&incident).unwrap().pattern_id.as_deref(), Some("first"));
        }
    }

    #[test]
    fn test_below_floor_does_not_match() {
        let classifier = ErrorClassifier::with_patterns(
            ClassifierConfig::default(),
            vec![ErrorPattern::new("ctx", ErrorCategory::System, Severity::Low)
                .with_context("a", "1")
                .with_context("b", "2")],
        )
        .unwrap();

        let incident = ErrorIncident::new("x", "BackendError").with_context("a", "1");
        assert!(classifier.classify(&incident).is_none());
    }

    #[test]
    fn test_auto_created_pattern() {
        let classifier = empty_classifier();
        let incident = ErrorIncident::new(
            "Fatal memory allocation failure while allocating memory arena",
            "BackendError",
        );

        let classification = classifier.classify_or_create(&incident).unwrap();
        assert!(classification.auto_created);
        assert_eq!(classification.category, ErrorCategory::Resource);
        assert_eq!(classification.severity, Severity::Critical);
        assert_eq!(classification.strategies, DEFAULT_STRATEGIES.to_vec());
        assert_eq!(classifier.pattern_count(), 1);

        let pattern = classifier.pattern(classification.pattern_id.as_deref().unwrap()).unwrap();
        assert_eq!(pattern.message_patterns, vec!["(?i)fatal.*memory.*allocation".to_string()]);
        assert_eq!(pattern.exception_types, vec!["BackendError".to_string()]);
    }

    #[test]
    fn test_classification_is_idempotent() {
        let classifier = empty_classifier();
        let incident = ErrorIncident::new("network unreachable while contacting search", "BackendError");

        let first = classifier.classify_or_create(&incident).unwrap();
        let second = classifier.classify_or_create(&incident).unwrap();
        assert_eq!(first.category, second.category);
        assert_eq!(first.severity, second.severity);
        assert_eq!(first.pattern_id, second.pattern_id);
        assert_eq!(classifier.pattern_count(), 1);

        let builtin = ErrorClassifier::new(ClassifierConfig::default());
        let incident = ErrorIncident::new("deadline exceeded", "TimeoutError");
        assert_eq!(builtin.classify(&incident), builtin.classify(&incident));
    }

    #[test]
    fn test_exception_kind_alone_does_not_match() {
        let classifier = empty_classifier();

        let first = classifier
            .classify_or_create(&ErrorIncident::new("upstream unavailable", "BackendError"))
            .unwrap();
        assert_eq!(first.category, ErrorCategory::System);

        let incident = ErrorIncident::new("network connection timeout to host", "BackendError");
        assert!(classifier.classify(&incident).is_none());

        let second = classifier.classify_or_create(&incident).unwrap();
        assert!(second.auto_created);
        assert_ne!(second.pattern_id, first.pattern_id);
        assert_eq!(second.category, ErrorCategory::Network);
        assert_eq!(classifier.pattern_count(), 2);
    }

    #[test]
    fn test_short_message_pattern_matches_again() {
        let classifier = empty_classifier();
        let incident = ErrorIncident::new("EOF", "IoError");

        let first = classifier.classify_or_create(&incident).unwrap();
        let second = classifier.classify_or_create(&incident).unwrap();
        assert_eq!(first.pattern_id, second.pattern_id);
        assert!((second.confidence - 0.7).abs() < 1e-9);
        assert_eq!(classifier.pattern_count(), 1);
    }

    #[test]
    fn test_auto_create_disabled() {
        let config = ClassifierConfig {
            auto_create_patterns: false,
            ..ClassifierConfig::default()
        };
        let classifier = ErrorClassifier::with_patterns(config, Vec::new()).unwrap();

        let classification = classifier
            .classify_or_create(&ErrorIncident::new("input validation rejected", "ValidationError"))
            .unwrap();
        assert!(classification.pattern_id.is_none());
        assert_eq!(classification.category, ErrorCategory::Validation);
        assert_eq!(classification.severity, Severity::Low);
        assert_eq!(classifier.pattern_count(), 0);
    }

    #[test]
    fn test_significant_words() {
        assert_eq!(
            significant_words("the socket socket closed before payload sent, socket reset", 3),
            vec!["socket".to_string(), "closed".to_string(), "payload".to_string()]
        );
        assert!(significant_words("a b c", 3).is_empty());
    }

    #[test]
    fn test_keyword_inference() {
        assert_eq!(infer_category("permission denied"), ErrorCategory::Authentication);
        assert_eq!(infer_category("request timeout"), ErrorCategory::Network);
        assert_eq!(infer_category("bad format"), ErrorCategory::Validation);
        assert_eq!(infer_category("segfault"), ErrorCategory::System);
        assert_eq!(infer_severity("disk is full"), Severity::High);
        assert_eq!(infer_severity("something odd"), Severity::Medium);
    }

    #[test]
    fn test_record_outcome() {
        let classifier = ErrorClassifier::new(ClassifierConfig::default());
        let ids = vec!["backend_timeout".to_string()];
        classifier.record_outcome(&ids, true);
        classifier.record_outcome(&ids, false);

        let stats = classifier
            .pattern_stats()
            .into_iter()
            .find(|s| s.id == "backend_timeout")
            .unwrap();
        assert_eq!(stats.occurrences, 2);
        assert_eq!(stats.successes, 1);
        assert_eq!(stats.success_rate, Some(0.5));
    }
}
