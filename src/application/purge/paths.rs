//! CDN path-variant derivation.
//!
//! A single logical URL is cached at the edge under several representations:
//! the document itself, a fragment variant used for partial client-side
//! navigation, and a build-scoped client-data route. Purging only the
//! document would leave the others serving stale content.

use std::collections::BTreeSet;

/// Suffix and prefix conventions for derived variants. Both are owned by the
/// build pipeline, so they arrive through configuration.
#[derive(Debug, Clone)]
pub struct VariantRules {
    fragment_suffix: String,
    data_prefix: String,
}

impl VariantRules {
    pub fn new(fragment_suffix: impl Into<String>, data_prefix: impl Into<String>) -> Self {
        Self {
            fragment_suffix: fragment_suffix.into(),
            data_prefix: data_prefix.into(),
        }
    }

    /// The full variant set implied by one logical URL.
    ///
    /// - the URL itself;
    /// - `<url>.<fragment_suffix>` unless the URL already is a fragment
    ///   variant;
    /// - `/<data_prefix>/*/<url>.json` unless the URL already is a
    ///   client-data route. The build identifier segment is wildcarded: it
    ///   is not known here, and an over-broad purge is the accepted cost of
    ///   covering every live build.
    pub fn variants(&self, url: &str) -> BTreeSet<String> {
        let mut paths = BTreeSet::new();
        paths.insert(url.to_string());

        let fragment_suffix = format!(".{}", self.fragment_suffix);
        if !url.ends_with(&fragment_suffix) {
            paths.insert(format!("{url}{fragment_suffix}"));
        }

        let data_root = format!("/{}/", self.data_prefix);
        if !url.starts_with(&data_root) {
            let trimmed = url.trim_start_matches('/');
            paths.insert(format!("/{}/*/{trimmed}.json", self.data_prefix));
        }

        paths
    }

    /// Union of the variant sets for a whole batch, deduplicated.
    pub fn batch_variants<'a>(&self, urls: impl IntoIterator<Item = &'a str>) -> BTreeSet<String> {
        let mut paths = BTreeSet::new();
        for url in urls {
            paths.extend(self.variants(url));
        }
        paths
    }
}

impl Default for VariantRules {
    fn default() -> Self {
        Self::new("frag", "_data")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules() -> VariantRules {
        VariantRules::default()
    }

    #[test]
    fn expands_plain_url_to_three_variants() {
        let paths = rules().variants("/foo");
        let expected: BTreeSet<String> = ["/foo", "/foo.frag", "/_data/*/foo.json"]
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(paths, expected);
    }

    #[test]
    fn fragment_variant_is_not_duplicated() {
        let paths = rules().variants("/foo.frag");
        assert!(paths.contains("/foo.frag"));
        assert!(!paths.contains("/foo.frag.frag"));
    }

    #[test]
    fn data_route_is_not_nested() {
        let paths = rules().variants("/_data/abc123/foo.json");
        assert!(paths.contains("/_data/abc123/foo.json"));
        assert!(paths.iter().filter(|p| p.starts_with("/_data/*/")).count() == 0);
    }

    #[test]
    fn nested_paths_keep_their_segments() {
        let paths = rules().variants("/blog/post-1");
        assert!(paths.contains("/_data/*/blog/post-1.json"));
    }

    #[test]
    fn batch_union_deduplicates() {
        let paths = rules().batch_variants(["/foo", "/foo", "/bar"]);
        assert_eq!(paths.len(), 6);
        assert_eq!(paths.iter().filter(|p| p.as_str() == "/foo").count(), 1);
    }

    #[test]
    fn custom_conventions_are_honored() {
        let rules = VariantRules::new("rsc", "_next/data");
        let paths = rules.variants("/foo");
        assert!(paths.contains("/foo.rsc"));
        assert!(paths.contains("/_next/data/*/foo.json"));
    }
}
