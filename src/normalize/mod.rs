//! Name normalization: ordered, type-scoped rewrite rules producing the
//! normalized key every other component (locks, cache, blocking, exact match)
//! is keyed on.
//!
//! `normalize` is deterministic and idempotent: applying it to its own output
//! yields the same string. Null/blank inputs normalize to the empty string.

use regex::Regex;

/// A single rewrite rule. Rules whose `applicable_types` set contains the
/// input type (empty set = universal) run in ascending `priority` order; each
/// rule's output feeds the next.
#[derive(Debug, Clone)]
pub struct NormalizationRule {
	pub name: String,
	pub pattern: Regex,
	pub replacement: String,
	pub applicable_types: Vec<String>,
	pub priority: i32,
}

impl NormalizationRule {
	pub fn new(
		name: impl Into<String>,
		pattern: &str,
		replacement: impl Into<String>,
		applicable_types: Vec<String>,
		priority: i32,
	) -> Result<Self, regex::Error> {
		Ok(Self {
			name: name.into(),
			pattern: Regex::new(pattern)?,
			replacement: replacement.into(),
			applicable_types,
			priority,
		})
	}

	fn applies_to(&self, entity_type: &str) -> bool {
		self.applicable_types.is_empty()
			|| self
				.applicable_types
				.iter()
				.any(|t| t.eq_ignore_ascii_case(entity_type))
	}
}

/// Rule engine. Construct with `with_builtin_rules` for the stock company
/// rules, or `new` with a custom rule set.
#[derive(Debug, Clone)]
pub struct NormalizationEngine {
	rules: Vec<NormalizationRule>,
}

impl NormalizationEngine {
	pub fn new(mut rules: Vec<NormalizationRule>) -> Self {
		rules.sort_by_key(|r| r.priority);
		Self { rules }
	}

	/// The built-in company rule set: strip stacked legal suffixes, a leading
	/// article, and ampersand/"and" connectors. Longer suffix alternatives are
	/// listed first so `corporation` is not half-consumed as `corp`.
	pub fn with_builtin_rules() -> Self {
		let company = vec!["COMPANY".to_string()];
		let rules = vec![
			NormalizationRule::new(
				"strip-legal-suffixes",
				r"(?i)(?:[\s,]+(?:incorporated|inc|corporation|corp|limited|ltd|llc|company|co|ag|gmbh|nv|bv)\.?)+\s*$",
				"",
				company.clone(),
				10,
			)
			.expect("builtin rule pattern"),
			NormalizationRule::new("strip-leading-the", r"(?i)^\s*the\s+", "", company.clone(), 20)
				.expect("builtin rule pattern"),
			NormalizationRule::new("strip-and", r"(?i)\s+and\s+", " ", company.clone(), 30)
				.expect("builtin rule pattern"),
			NormalizationRule::new("strip-ampersand", r"\s*&\s*", " ", company, 40)
				.expect("builtin rule pattern"),
		];
		Self::new(rules)
	}

	/// Apply all applicable rules, then lowercase, collapse whitespace, trim.
	pub fn normalize(&self, raw: &str, entity_type: &str) -> String {
		if raw.trim().is_empty() {
			return String::new();
		}

		let mut current = raw.to_string();
		for rule in &self.rules {
			if rule.applies_to(entity_type) {
				current = rule
					.pattern
					.replace_all(&current, rule.replacement.as_str())
					.into_owned();
			}
		}

		current
			.to_lowercase()
			.split_whitespace()
			.collect::<Vec<_>>()
			.join(" ")
	}

	/// Two raw names are equivalent iff they normalize to the same non-empty
	/// key under the same type.
	pub fn are_equivalent(&self, a: &str, b: &str, entity_type: &str) -> bool {
		let na = self.normalize(a, entity_type);
		na == self.normalize(b, entity_type) && !na.is_empty()
	}
}

impl Default for NormalizationEngine {
	fn default() -> Self {
		Self::with_builtin_rules()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn engine() -> NormalizationEngine {
		NormalizationEngine::with_builtin_rules()
	}

	#[test]
	fn strips_legal_suffixes() {
		let e = engine();
		assert_eq!(e.normalize("Tesla, Inc.", "COMPANY"), "tesla");
		assert_eq!(e.normalize("Tesla Incorporated", "COMPANY"), "tesla");
		assert_eq!(e.normalize("Microsoft Corporation", "COMPANY"), "microsoft");
		assert_eq!(e.normalize("Microsoft Corp.", "COMPANY"), "microsoft");
		assert_eq!(e.normalize("Siemens AG", "COMPANY"), "siemens");
		assert_eq!(e.normalize("Philips N.V.", "COMPANY"), "philips n.v.");
		assert_eq!(e.normalize("Philips NV", "COMPANY"), "philips");
	}

	#[test]
	fn strips_stacked_suffixes() {
		let e = engine();
		assert_eq!(e.normalize("Acme Holdings Co., Ltd.", "COMPANY"), "acme holdings");
	}

	#[test]
	fn suffix_requires_word_boundary() {
		let e = engine();
		// "Banco" and "Cisco" end in "co" but carry no separator.
		assert_eq!(e.normalize("Banco", "COMPANY"), "banco");
		assert_eq!(e.normalize("Cisco", "COMPANY"), "cisco");
		// A plural is not a legal suffix.
		assert_eq!(e.normalize("Acme Corporations", "COMPANY"), "acme corporations");
	}

	#[test]
	fn strips_leading_article_and_connectors() {
		let e = engine();
		assert_eq!(e.normalize("The Boring Company", "COMPANY"), "boring");
		assert_eq!(e.normalize("Johnson & Johnson", "COMPANY"), "johnson johnson");
		assert_eq!(e.normalize("Johnson and Johnson", "COMPANY"), "johnson johnson");
	}

	#[test]
	fn rules_are_type_scoped() {
		let e = engine();
		// Company suffix rules do not fire for other types.
		assert_eq!(e.normalize("Monsters Inc", "PRODUCT"), "monsters inc");
		assert_eq!(e.normalize("Monsters Inc", "COMPANY"), "monsters");
	}

	#[test]
	fn universal_finalization_applies_to_all_types() {
		let e = engine();
		assert_eq!(e.normalize("  Apple   Vision\tPro  ", "PRODUCT"), "apple vision pro");
	}

	#[test]
	fn blank_input_normalizes_to_empty() {
		let e = engine();
		assert_eq!(e.normalize("", "COMPANY"), "");
		assert_eq!(e.normalize("   \t ", "COMPANY"), "");
	}

	#[test]
	fn normalize_is_idempotent() {
		let e = engine();
		for raw in [
			"Tesla, Inc.",
			"The Boring Company",
			"Johnson & Johnson",
			"Acme Holdings Co., Ltd.",
			"  Mixed   CASE  name ",
			"plain",
			"",
			"Inc",
		] {
			let once = e.normalize(raw, "COMPANY");
			let twice = e.normalize(&once, "COMPANY");
			assert_eq!(once, twice, "not idempotent for {:?}", raw);
		}
	}

	#[test]
	fn equivalence_requires_non_empty_key() {
		let e = engine();
		assert!(e.are_equivalent("Tesla, Inc.", "Tesla Incorporated", "COMPANY"));
		assert!(!e.are_equivalent("Tesla", "Edison", "COMPANY"));
		// Both normalize to "", which never counts as equivalent.
		assert!(!e.are_equivalent("", "   ", "COMPANY"));
	}

	#[test]
	fn custom_rules_run_in_priority_order() {
		let rules = vec![
			NormalizationRule::new("second", r"b", "c", vec![], 2).unwrap(),
			NormalizationRule::new("first", r"a", "b", vec![], 1).unwrap(),
		];
		let e = NormalizationEngine::new(rules);
		// "a" -> "b" (priority 1), then "b" -> "c" (priority 2).
		assert_eq!(e.normalize("a", "ANY"), "c");
	}
}
