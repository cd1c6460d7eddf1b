//! Outbound request rewriting.
//!
//! The director is a set of small pure functions composed by the
//! forwarder: strip the consumed mount prefix, prepend the backend's base
//! path, merge query strings, and derive the forwarded-for/host/proto
//! headers. Each step is independently unit-testable and idempotent where
//! the proxy contract requires it.

use crate::proxy::backend::Backend;

/// Removes the mount prefix consumed during routing from the request path.
///
/// The result always keeps a leading slash; stripping the whole path
/// yields `/`.
pub fn strip_prefix(path: &str, prefix: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        return path.to_string();
    }

    match path.strip_prefix(prefix) {
        Some(rest) if rest.is_empty() => "/".to_string(),
        Some(rest) if rest.starts_with('/') => rest.to_string(),
        // Not a path-segment boundary ("/apix" vs "/api"): leave untouched.
        _ => path.to_string(),
    }
}

/// Prepends the backend URL's path to the (already stripped) request path.
pub fn join_paths(base: &str, rest: &str) -> String {
    let base = base.trim_end_matches('/');
    if base.is_empty() {
        return if rest.is_empty() {
            "/".to_string()
        } else {
            rest.to_string()
        };
    }
    match rest {
        "" | "/" => base.to_string(),
        _ => format!("{}{}", base, rest),
    }
}

/// Merges the backend URL's query with the inbound query.
///
/// The backend query comes first; both present joins them with `&`.
pub fn merge_query(base: Option<&str>, request: Option<&str>) -> Option<String> {
    match (base, request) {
        (Some(b), Some(r)) if !b.is_empty() && !r.is_empty() => Some(format!("{}&{}", b, r)),
        (Some(b), _) if !b.is_empty() => Some(b.to_string()),
        (_, Some(r)) if !r.is_empty() => Some(r.to_string()),
        _ => None,
    }
}

/// Extracts the host portion of a peer address, robust to IPv6 literals.
///
/// `"1.2.3.4:555"` → `"1.2.3.4"`, `"[::1]:8080"` → `"[::1]"`, a bare host
/// passes through unchanged.
pub fn host_only(peer: &str) -> &str {
    if let Some(end) = peer.rfind(']') {
        // Bracketed IPv6, with or without a port suffix.
        return &peer[..=end];
    }
    match peer.rfind(':') {
        // More than one colon without brackets is a bare IPv6 literal.
        Some(idx) if peer[..idx].contains(':') => peer,
        Some(idx) => &peer[..idx],
        None => peer,
    }
}

/// Appends the original peer to an existing `X-Forwarded-For` chain.
pub fn append_forwarded_for(existing: Option<&str>, peer: &str) -> String {
    match existing {
        Some(chain) if !chain.is_empty() => format!("{}, {}", chain, peer),
        _ => peer.to_string(),
    }
}

/// Chooses the `X-Forwarded-Proto` value for the outbound request.
///
/// `https` when the inbound connection used TLS or an upstream proxy
/// already marked the chain as https; otherwise `http`.
pub fn forwarded_proto(connection_is_tls: bool, inbound: Option<&str>) -> &'static str {
    if connection_is_tls || inbound.is_some_and(|v| v.eq_ignore_ascii_case("https")) {
        "https"
    } else {
        "http"
    }
}

/// Composes the full outbound URL for a backend.
///
/// `request_path` must already have the mount prefix stripped. Running the
/// composition twice over its own output is not meaningful; the individual
/// steps are idempotent (see tests) which is what makes the director safe
/// to re-apply within one pass.
pub fn build_upstream_url(backend: &Backend, request_path: &str, request_query: Option<&str>) -> String {
    let path = join_paths(&backend.base_path, request_path);
    match merge_query(backend.base_query.as_deref(), request_query) {
        Some(query) => format!("{}{}?{}", backend.origin(), path, query),
        None => format!("{}{}", backend.origin(), path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::settings::ServiceEndpoint;
    use crate::proxy::backend::Backend;
    use crate::proxy::breaker::BreakerConfig;

    fn backend(url: &str) -> Backend {
        Backend::from_endpoint(
            "t1",
            &ServiceEndpoint {
                name: "s1".to_string(),
                url: url.to_string(),
                health_path: None,
            },
            BreakerConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn strip_prefix_consumes_mount() {
        assert_eq!(strip_prefix("/api/users", "/api"), "/users");
        assert_eq!(strip_prefix("/api/users", "/api/"), "/users");
        assert_eq!(strip_prefix("/api", "/api"), "/");
        assert_eq!(strip_prefix("/apix/users", "/api"), "/apix/users");
        assert_eq!(strip_prefix("/users", ""), "/users");
    }

    #[test]
    fn strip_prefix_is_idempotent_on_its_output() {
        let once = strip_prefix("/x/y", "/x");
        assert_eq!(once, "/y");
        // "/y" no longer starts with the prefix, so a second pass is a no-op.
        assert_eq!(strip_prefix(&once, "/x"), "/y");
    }

    #[test]
    fn join_paths_prepends_backend_base() {
        assert_eq!(join_paths("/api/v1", "/y"), "/api/v1/y");
        assert_eq!(join_paths("", "/y"), "/y");
        assert_eq!(join_paths("/api/v1", "/"), "/api/v1");
        assert_eq!(join_paths("", ""), "/");
    }

    #[test]
    fn merge_query_prepends_backend_query() {
        assert_eq!(merge_query(Some("a=1"), Some("x=1")).as_deref(), Some("a=1&x=1"));
        assert_eq!(merge_query(Some("a=1"), None).as_deref(), Some("a=1"));
        assert_eq!(merge_query(None, Some("x=1")).as_deref(), Some("x=1"));
        assert_eq!(merge_query(None, None), None);
        assert_eq!(merge_query(Some(""), Some("")), None);
    }

    #[test]
    fn host_only_handles_ipv4_ipv6_and_bare_hosts() {
        assert_eq!(host_only("1.2.3.4:555"), "1.2.3.4");
        assert_eq!(host_only("[::1]:8080"), "[::1]");
        assert_eq!(host_only("[::1]"), "[::1]");
        assert_eq!(host_only("::1"), "::1");
        assert_eq!(host_only("example.com"), "example.com");
        assert_eq!(host_only("example.com:80"), "example.com");
    }

    #[test]
    fn forwarded_for_appends_to_chain() {
        assert_eq!(append_forwarded_for(None, "1.2.3.4"), "1.2.3.4");
        assert_eq!(
            append_forwarded_for(Some("9.9.9.9"), "1.2.3.4"),
            "9.9.9.9, 1.2.3.4"
        );
        assert_eq!(append_forwarded_for(Some(""), "1.2.3.4"), "1.2.3.4");
    }

    #[test]
    fn forwarded_proto_prefers_tls_evidence() {
        assert_eq!(forwarded_proto(true, None), "https");
        assert_eq!(forwarded_proto(false, Some("https")), "https");
        assert_eq!(forwarded_proto(false, Some("HTTPS")), "https");
        assert_eq!(forwarded_proto(false, Some("http")), "http");
        assert_eq!(forwarded_proto(false, None), "http");
    }

    #[test]
    fn upstream_url_composes_mount_strip_and_backend_base() {
        // Backend path /api/v1, inbound /x/y with mount strip /x.
        let b = backend("http://b1:9000/api/v1");
        let stripped = strip_prefix("/x/y", "/x");
        assert_eq!(
            build_upstream_url(&b, &stripped, None),
            "http://b1:9000/api/v1/y"
        );
    }

    #[test]
    fn upstream_url_merges_queries() {
        let b = backend("http://b1:9000/root?env=prod");
        assert_eq!(
            build_upstream_url(&b, "/users", Some("x=1")),
            "http://b1:9000/root/users?env=prod&x=1"
        );
    }

    #[test]
    fn upstream_url_without_base_path() {
        let b = backend("http://b1:9000");
        assert_eq!(build_upstream_url(&b, "/users", None), "http://b1:9000/users");
    }
}
