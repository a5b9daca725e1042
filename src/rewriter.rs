use hickory_proto::op::Query;
use hickory_proto::rr::Name;
use regex::Regex;
use tracing::debug;

use crate::error::ConfigError;

pub const DEFAULT_ALB_REGION: &str = "ap-southeast-1";

/// Anchored, case-sensitive matcher for internal Kubernetes ALB names in one region,
/// e.g. `internal-k8s-example-123.ap-southeast-1.elb.amazonaws.com.`
#[derive(Debug, Clone)]
pub struct AlbNameMatcher {
    regex: Regex,
}

impl AlbNameMatcher {
    pub fn for_region(region: &str) -> Result<Self, ConfigError> {
        if region.is_empty() {
            return Err(ConfigError::EmptyRegion);
        }
        let pattern = format!(
            r"^internal-k8s-.*\.{}\.elb\.amazonaws\.com\.?$",
            regex::escape(region)
        );
        Ok(Self {
            regex: Regex::new(&pattern)?,
        })
    }

    #[inline]
    pub fn is_match(&self, name: &str) -> bool {
        self.regex.is_match(name)
    }
}

/// Prepend the zone hint. No length check.
#[inline]
pub fn tag_name(zone: &str, name: &str) -> String {
    format!("{zone}.{name}")
}

/// Tag every matching question with `zone`, in place. Returns how many were rewritten.
///
/// Not idempotent: a name that still matches after tagging is tagged again on
/// a second pass.
pub fn rewrite_queries(matcher: &AlbNameMatcher, zone: &str, queries: &mut [Query]) -> usize {
    let mut rewritten = 0;
    for query in queries.iter_mut() {
        // Match on the wire form so punycode labels stay `xn--`.
        let original = query.name().to_ascii();
        if !matcher.is_match(&original) {
            continue;
        }
        match Name::from_ascii(zone).and_then(|tag| tag.append_name(query.name())) {
            Ok(name) => {
                query.set_name(name);
                rewritten += 1;
            }
            Err(err) => {
                // Over-length or otherwise unrepresentable; leave the question as is.
                let tagged = tag_name(zone, &original);
                debug!(qname = %original, tagged = %tagged, error = %err, "zone tag not applied");
            }
        }
    }
    rewritten
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::rr::{DNSClass, RecordType};

    const ALB: &str = "internal-k8s-example-123.ap-southeast-1.elb.amazonaws.com.";

    fn default_matcher() -> AlbNameMatcher {
        AlbNameMatcher::for_region(DEFAULT_ALB_REGION).unwrap()
    }

    fn query(name: &str, qtype: RecordType) -> Query {
        Query::query(Name::from_ascii(name).unwrap(), qtype)
    }

    #[test]
    fn matcher_accepts_internal_alb_names() {
        let m = default_matcher();
        assert!(m.is_match(ALB));
        assert!(m.is_match("internal-k8s-example-123.ap-southeast-1.elb.amazonaws.com"));
        assert!(m.is_match("internal-k8s-.ap-southeast-1.elb.amazonaws.com."));
    }

    #[test]
    fn matcher_rejects_other_names() {
        let m = default_matcher();
        for name in [
            "example.com.",
            "k8s-example-123.ap-southeast-1.elb.amazonaws.com.",
            "internal-k8s-example-123.us-east-1.elb.amazonaws.com.",
            "INTERNAL-K8S-example-123.ap-southeast-1.elb.amazonaws.com.",
            "internal-k8s-example-123.ap-southeast-1.elb.amazonaws.com.evil.",
            "x.internal-k8s-example-123.ap-southeast-1.elb.amazonaws.com.",
            "internal-k8s-example-123.ap-southeast-1xelb.amazonaws.com.",
        ] {
            assert!(!m.is_match(name), "{name} should not match");
        }
    }

    #[test]
    fn matcher_region_is_configurable_and_escaped() {
        let m = AlbNameMatcher::for_region("us-east-1").unwrap();
        assert!(m.is_match("internal-k8s-a.us-east-1.elb.amazonaws.com."));
        assert!(!m.is_match(ALB));
        assert!(matches!(AlbNameMatcher::for_region(""), Err(ConfigError::EmptyRegion)));

        let dotted = AlbNameMatcher::for_region("a.b").unwrap();
        assert!(!dotted.is_match("internal-k8s-x.axb.elb.amazonaws.com."));
    }

    #[test]
    fn tag_name_is_plain_prepend() {
        assert_eq!(
            tag_name("ap-southeast-1a", ALB),
            "ap-southeast-1a.internal-k8s-example-123.ap-southeast-1.elb.amazonaws.com."
        );
    }

    #[test]
    fn rewrite_tags_matching_questions_only() {
        let m = default_matcher();
        let mut queries = vec![
            query(ALB, RecordType::CNAME),
            query("example.com.", RecordType::A),
            query("internal-k8s-other-9.ap-southeast-1.elb.amazonaws.com.", RecordType::AAAA),
        ];

        let n = rewrite_queries(&m, "ap-southeast-1a", &mut queries);
        assert_eq!(n, 2);
        assert_eq!(
            queries[0].name().to_string(),
            "ap-southeast-1a.internal-k8s-example-123.ap-southeast-1.elb.amazonaws.com."
        );
        assert_eq!(queries[0].query_type(), RecordType::CNAME);
        assert_eq!(queries[0].query_class(), DNSClass::IN);
        assert_eq!(queries[1].name().to_string(), "example.com.");
        assert_eq!(
            queries[2].name().to_string(),
            "ap-southeast-1a.internal-k8s-other-9.ap-southeast-1.elb.amazonaws.com."
        );
        assert_eq!(queries[2].query_type(), RecordType::AAAA);
    }

    #[test]
    fn rewrite_is_not_idempotent() {
        // The tagged name no longer starts with `internal-k8s-`, so only a zone
        // label that itself looks like an ALB prefix re-matches.
        let m = default_matcher();
        let mut queries = vec![query(ALB, RecordType::A)];
        assert_eq!(rewrite_queries(&m, "az1", &mut queries), 1);
        assert_eq!(rewrite_queries(&m, "az1", &mut queries), 0);

        let mut queries = vec![query(ALB, RecordType::A)];
        assert_eq!(rewrite_queries(&m, "internal-k8s-az", &mut queries), 1);
        assert_eq!(rewrite_queries(&m, "internal-k8s-az", &mut queries), 1);
        assert_eq!(
            queries[0].name().to_string(),
            format!("internal-k8s-az.internal-k8s-az.{ALB}")
        );
    }

    #[test]
    fn rewrite_keeps_punycode_labels() {
        let m = default_matcher();
        let idn = "internal-k8s-a.xn--bcher-kva.ap-southeast-1.elb.amazonaws.com.";
        let mut queries = vec![query(idn, RecordType::A)];

        assert_eq!(rewrite_queries(&m, "ap-southeast-1a", &mut queries), 1);
        assert_eq!(
            queries[0].name().to_ascii(),
            "ap-southeast-1a.internal-k8s-a.xn--bcher-kva.ap-southeast-1.elb.amazonaws.com."
        );
        assert!(queries[0].name().is_fqdn());
    }

    #[test]
    fn rewrite_keeps_relative_names_relative() {
        let m = default_matcher();
        let mut queries = vec![query(
            "internal-k8s-a.ap-southeast-1.elb.amazonaws.com",
            RecordType::A,
        )];
        assert_eq!(rewrite_queries(&m, "ap-southeast-1a", &mut queries), 1);
        assert_eq!(
            queries[0].name().to_ascii(),
            "ap-southeast-1a.internal-k8s-a.ap-southeast-1.elb.amazonaws.com"
        );
        assert!(!queries[0].name().is_fqdn());
    }

    #[test]
    fn rewrite_leaves_unrepresentable_names_alone() {
        let m = default_matcher();
        let mut queries = vec![query(ALB, RecordType::A)];
        // 64 octets is one more than a DNS label can carry.
        let zone = "b".repeat(64);
        assert_eq!(rewrite_queries(&m, &zone, &mut queries), 0);
        assert_eq!(queries[0].name().to_string(), ALB);
    }
}
