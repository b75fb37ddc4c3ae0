//! Blocking keys: short surrogates of a normalized name used to narrow the
//! fuzzy candidate pool before scoring. Three generator families, disjoint by
//! prefix (`pfx:`, `tok:`, `bg:`). Keys are persisted on entity creation and
//! looked up via shared-key traversal by the repositories.

/// Generate the blocking key set for a normalized name, in insertion order,
/// deduplicated. Blank input yields the empty set.
pub fn blocking_keys(normalized: &str) -> Vec<String> {
	let trimmed = normalized.trim();
	if trimmed.is_empty() {
		return Vec::new();
	}

	let mut keys: Vec<String> = Vec::with_capacity(3);

	// pfx: first three characters (or all of a shorter name).
	let prefix: String = trimmed.chars().take(3).collect();
	push_unique(&mut keys, format!("pfx:{}", prefix));

	// tok: the two lexicographically smallest tokens, joined in order.
	let mut tokens: Vec<&str> = trimmed.split_whitespace().collect();
	tokens.sort_unstable();
	tokens.dedup();
	let tok_key = match tokens.as_slice() {
		[] => None,
		[only] => Some(format!("tok:{}", only)),
		[first, second, ..] => Some(format!("tok:{}|{}", first, second)),
	};
	if let Some(k) = tok_key {
		push_unique(&mut keys, k);
	}

	// bg: first two characters (or all of a shorter name).
	let bigram: String = trimmed.chars().take(2).collect();
	push_unique(&mut keys, format!("bg:{}", bigram));

	keys
}

fn push_unique(keys: &mut Vec<String>, key: String) {
	if !keys.contains(&key) {
		keys.push(key);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn multi_token_name_generates_three_keys() {
		let keys = blocking_keys("acme systems");
		assert_eq!(keys, vec!["pfx:acm", "tok:acme|systems", "bg:ac"]);
	}

	#[test]
	fn token_key_uses_two_smallest_tokens() {
		let keys = blocking_keys("zeta alpha mid");
		assert!(keys.contains(&"tok:alpha|mid".to_string()));
	}

	#[test]
	fn single_token_key_has_no_separator() {
		let keys = blocking_keys("tesla");
		assert_eq!(keys, vec!["pfx:tes", "tok:tesla", "bg:te"]);
	}

	#[test]
	fn short_names_use_all_characters() {
		let keys = blocking_keys("ab");
		assert_eq!(keys, vec!["pfx:ab", "tok:ab", "bg:ab"]);

		let keys = blocking_keys("a");
		assert_eq!(keys, vec!["pfx:a", "tok:a", "bg:a"]);
	}

	#[test]
	fn blank_input_yields_empty_set() {
		assert!(blocking_keys("").is_empty());
		assert!(blocking_keys("   ").is_empty());
	}

	#[test]
	fn keys_are_deterministic() {
		assert_eq!(blocking_keys("acme systems"), blocking_keys("acme systems"));
	}

	#[test]
	fn multibyte_prefixes_do_not_split_characters() {
		let keys = blocking_keys("münchen brauerei");
		assert!(keys[0].starts_with("pfx:mün"));
	}
}
