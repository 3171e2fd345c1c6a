use http::HeaderName;

use crate::{
    config::{ANONYMOUS_TIER, DEFAULT_API_KEY_TIER, ResolverConfig},
    context::RequestContext,
    ratelimit::LimitProfile,
};

/// Characters of an API key kept in the identifier; enough to tell keys
/// apart without writing whole secrets into the store.
const API_KEY_PREFIX_CHARS: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitSubject {
    pub identifier: String,
    pub tier: String,
    pub profile: LimitProfile,
}

/// Derives who is calling and which limits apply to them.
pub struct ProfileResolver {
    cfg: ResolverConfig,
    api_key_header: HeaderName,
    principal_header: Option<HeaderName>,
}

impl ProfileResolver {
    pub fn new(cfg: ResolverConfig) -> Self {
        let api_key_header = HeaderName::from_bytes(cfg.api_key_header.as_bytes())
            .unwrap_or_else(|_| HeaderName::from_static("x-api-key"));
        let principal_header = cfg
            .principal_header
            .as_deref()
            .and_then(|h| HeaderName::from_bytes(h.as_bytes()).ok());

        Self {
            cfg,
            api_key_header,
            principal_header,
        }
    }

    pub fn resolve(&self, ctx: &RequestContext) -> RateLimitSubject {
        let api_key = header_value(ctx, &self.api_key_header);

        let identifier = match api_key {
            Some(key) => format!(
                "apikey:{}",
                key.chars().take(API_KEY_PREFIX_CHARS).collect::<String>()
            ),
            None => self.anonymous_identifier(ctx),
        };

        let tier = match api_key {
            Some(key) => self
                .cfg
                .api_key_tiers
                .get(key)
                .map(String::as_str)
                .unwrap_or(DEFAULT_API_KEY_TIER),
            None => ANONYMOUS_TIER,
        };

        if let Some(route) = self
            .cfg
            .route_overrides
            .iter()
            .filter(|route| path_in_scope(ctx.uri.path(), &route.path_prefix))
            .max_by_key(|route| route.path_prefix.len())
        {
            // Route overrides get their own counters so they do not drain the
            // caller's general quota or get drained by it.
            return RateLimitSubject {
                identifier: route_scoped(&identifier, &route.path_prefix),
                tier: tier.to_string(),
                profile: route.profile,
            };
        }

        let profile = self.cfg.tiers.get(tier).copied().unwrap_or_else(|| {
            tracing::warn!(tier, "no limits configured for tier; request is unmetered");
            LimitProfile::default()
        });

        RateLimitSubject {
            identifier,
            tier: tier.to_string(),
            profile,
        }
    }

    fn anonymous_identifier(&self, ctx: &RequestContext) -> String {
        if let Some(principal) = self
            .principal_header
            .as_ref()
            .and_then(|name| header_value(ctx, name))
        {
            return format!("user:{principal}");
        }

        if self.cfg.trust_forwarded_for
            && let Some(first_hop) = ctx
                .headers
                .get("x-forwarded-for")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.split(',').next())
                .map(str::trim)
                .filter(|v| !v.is_empty())
        {
            return format!("ip:{first_hop}");
        }

        match ctx.client_ip {
            Some(ip) => format!("ip:{ip}"),
            None => "ip:unknown".to_string(),
        }
    }
}

/// Identifier under which a caller's traffic to a route override is metered.
pub fn route_scoped(identifier: &str, path_prefix: &str) -> String {
    format!("{identifier}@{path_prefix}")
}

/// Prefix match on whole path segments: `/api/v1/scan` covers
/// `/api/v1/scan/upload` but not `/api/v1/scanner-status`.
fn path_in_scope(path: &str, prefix: &str) -> bool {
    path.strip_prefix(prefix)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with('/') || prefix.ends_with('/'))
}

fn header_value<'a>(ctx: &'a RequestContext, name: &HeaderName) -> Option<&'a str> {
    ctx.headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        net::{IpAddr, Ipv4Addr},
    };

    use bytes::Bytes;
    use http::{HeaderMap, HeaderValue, Method, Uri};

    use super::*;
    use crate::config::RouteLimitConfig;

    fn resolver_config() -> ResolverConfig {
        ResolverConfig {
            api_key_header: "x-api-key".to_string(),
            principal_header: Some("x-user-id".to_string()),
            trust_forwarded_for: true,
            tiers: HashMap::from([
                (ANONYMOUS_TIER.to_string(), LimitProfile::new(20, 100, 1_000)),
                (DEFAULT_API_KEY_TIER.to_string(), LimitProfile::new(60, 500, 5_000)),
                ("pro".to_string(), LimitProfile::new(100, 1_000, 10_000)),
            ]),
            api_key_tiers: HashMap::from([(
                "bsc_pro_key_0123456789abcdef".to_string(),
                "pro".to_string(),
            )]),
            route_overrides: vec![
                RouteLimitConfig {
                    path_prefix: "/api/v1".to_string(),
                    profile: LimitProfile::new(30, 0, 0),
                },
                RouteLimitConfig {
                    path_prefix: "/api/v1/scan".to_string(),
                    profile: LimitProfile::new(5, 20, 0),
                },
            ],
        }
    }

    fn ctx(path: &str, headers: &[(&'static str, &str)]) -> RequestContext {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            map.insert(*name, HeaderValue::from_str(value).unwrap());
        }
        RequestContext::new(
            "req-1".to_string(),
            Method::GET,
            path.parse::<Uri>().unwrap(),
            map,
            Bytes::new(),
            Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7))),
        )
    }

    #[test]
    fn api_key_takes_precedence_and_is_truncated() {
        let resolver = ProfileResolver::new(resolver_config());
        let subject = resolver.resolve(&ctx("/reports", &[
            ("x-api-key", "bsc_pro_key_0123456789abcdef"),
            ("x-user-id", "42"),
        ]));

        assert_eq!(subject.identifier, "apikey:bsc_pro_key_0123");
        assert_eq!(subject.tier, "pro");
        assert_eq!(subject.profile, LimitProfile::new(100, 1_000, 10_000));
    }

    #[test]
    fn unknown_api_keys_fall_back_to_the_free_tier() {
        let resolver = ProfileResolver::new(resolver_config());
        let subject = resolver.resolve(&ctx("/reports", &[("x-api-key", "bsc_unknown")]));

        assert_eq!(subject.identifier, "apikey:bsc_unknown");
        assert_eq!(subject.tier, "free");
        assert_eq!(subject.profile, LimitProfile::new(60, 500, 5_000));
    }

    #[test]
    fn principal_beats_network_address() {
        let resolver = ProfileResolver::new(resolver_config());
        let subject = resolver.resolve(&ctx("/reports", &[
            ("x-user-id", "42"),
            ("x-forwarded-for", "203.0.113.9"),
        ]));

        assert_eq!(subject.identifier, "user:42");
        assert_eq!(subject.tier, ANONYMOUS_TIER);
    }

    #[test]
    fn forwarded_for_uses_the_first_hop() {
        let resolver = ProfileResolver::new(resolver_config());
        let subject = resolver.resolve(&ctx("/reports", &[(
            "x-forwarded-for",
            "203.0.113.9, 10.0.0.1",
        )]));

        assert_eq!(subject.identifier, "ip:203.0.113.9");
        assert_eq!(subject.profile, LimitProfile::new(20, 100, 1_000));
    }

    #[test]
    fn untrusted_forwarded_for_is_ignored() {
        let mut cfg = resolver_config();
        cfg.trust_forwarded_for = false;
        let resolver = ProfileResolver::new(cfg);
        let subject = resolver.resolve(&ctx("/reports", &[("x-forwarded-for", "203.0.113.9")]));

        assert_eq!(subject.identifier, "ip:10.0.0.7");
    }

    #[test]
    fn longest_route_override_wins_with_its_own_counters() {
        let resolver = ProfileResolver::new(resolver_config());
        let subject = resolver.resolve(&ctx("/api/v1/scan/upload", &[("x-api-key", "bsc_unknown")]));

        assert_eq!(subject.identifier, "apikey:bsc_unknown@/api/v1/scan");
        assert_eq!(subject.profile, LimitProfile::new(5, 20, 0));

        let broader = resolver.resolve(&ctx("/api/v1/history", &[]));
        assert_eq!(broader.identifier, "ip:10.0.0.7@/api/v1");
        assert_eq!(broader.profile, LimitProfile::new(30, 0, 0));
    }

    #[test]
    fn route_overrides_match_whole_path_segments() {
        let resolver = ProfileResolver::new(resolver_config());

        let sibling = resolver.resolve(&ctx("/api/v1/scanner-status", &[]));
        assert_eq!(sibling.identifier, "ip:10.0.0.7@/api/v1");
        assert_eq!(sibling.profile, LimitProfile::new(30, 0, 0));

        let exact = resolver.resolve(&ctx("/api/v1/scan", &[]));
        assert_eq!(exact.identifier, "ip:10.0.0.7@/api/v1/scan");

        let outside = resolver.resolve(&ctx("/api/v10/scan", &[]));
        assert_eq!(outside.identifier, "ip:10.0.0.7");
        assert_eq!(outside.profile, LimitProfile::new(20, 100, 1_000));
    }

    #[test]
    fn trailing_slash_prefixes_cover_their_subtree() {
        assert!(path_in_scope("/admin/x", "/admin/"));
        assert!(path_in_scope("/anything", "/"));
        assert!(!path_in_scope("/administrator", "/admin"));
    }
}
