use crate::{
    extensions::{RouteContext, TranslationPass},
    gateway::policy_failed,
};
use envoy_types::pb::{
    envoy::{
        config::{
            core::v3::{
                data_source, header_value_option::HeaderAppendAction, DataSource,
                HeaderValue as EnvoyHeaderValue, HeaderValueOption,
            },
            route::v3::{
                header_matcher::HeaderMatchSpecifier,
                query_parameter_matcher::QueryParameterMatchSpecifier,
                redirect_action::{PathRewriteSpecifier, RedirectResponseCode, SchemeRewriteSpecifier},
                route::Action,
                route_action::{ClusterSpecifier, HostRewriteSpecifier, RequestMirrorPolicy},
                route_match::PathSpecifier,
                weighted_cluster::ClusterWeight,
                DirectResponseAction, HeaderMatcher, QueryParameterMatcher, RedirectAction, Route,
                RouteAction, RouteMatch, VirtualHost, WeightedCluster,
            },
        },
        r#type::matcher::v3::{
            string_matcher::MatchPattern, RegexMatchAndSubstitute, RegexMatcher, StringMatcher,
        },
    },
    google::protobuf::UInt32Value,
};
use gateway_controller_core::{
    http_route::{
        HeaderMatch, HeaderModifierFilter, HeaderName, HeaderValue, HttpFilter, HttpRouteMatch,
        PathMatch, PathModifier, QueryParamMatch, RequestRedirectFilter, UrlRewriteFilter,
    },
    ir::{GroupKind, HttpRouteRuleMatchIr, ObjectSource, VirtualHostIr},
    reports::ReportMap,
};
use std::{cmp::Ordering, collections::BTreeMap};

pub(crate) struct RouteTranslator<'t> {
    pub gateway: &'t ObjectSource,
    pub passes: &'t mut BTreeMap<GroupKind, Box<dyn TranslationPass>>,
    pub reports: &'t mut ReportMap,
    /// Set once any route sends traffic to the black-hole cluster.
    pub uses_blackhole: bool,
}

// === impl RouteTranslator ===

impl RouteTranslator<'_> {
    pub fn virtual_host(&mut self, vh: &VirtualHostIr) -> VirtualHost {
        let mut rules = vh.rules.iter().collect::<Vec<_>>();
        rules.sort_by(|a, b| compare_rules(a, b));
        VirtualHost {
            name: vh.name.clone(),
            domains: vec![vh.hostname.clone()],
            routes: rules.into_iter().map(|r| self.route(r)).collect(),
            ..Default::default()
        }
    }

    fn route(&mut self, rule: &HttpRouteRuleMatchIr) -> Route {
        let mut out = Route {
            name: rule.route_name(),
            r#match: Some(route_match(&rule.matcher)),
            ..Default::default()
        };
        if !rule.errors.is_empty() {
            tracing::debug!(route = %out.name, errors = ?rule.errors, "Replacing invalid rule");
            out.action = Some(direct_response(500, None));
            return out;
        }

        let mut action = RouteAction::default();
        let mut redirect = None;
        for filter in &rule.filters {
            match filter {
                HttpFilter::RequestHeaderModifier(m) => {
                    out.request_headers_to_add.extend(header_options(m));
                    out.request_headers_to_remove
                        .extend(m.remove.iter().map(HeaderName::to_string));
                }
                HttpFilter::ResponseHeaderModifier(m) => {
                    out.response_headers_to_add.extend(header_options(m));
                    out.response_headers_to_remove
                        .extend(m.remove.iter().map(HeaderName::to_string));
                }
                HttpFilter::RequestRedirect(r) => redirect = Some(redirect_action(r)),
                HttpFilter::UrlRewrite(r) => rewrite(r, &rule.matcher, &mut action),
                HttpFilter::RequestMirror(backend) if backend.is_valid() => {
                    action.request_mirror_policies.push(RequestMirrorPolicy {
                        cluster: backend.cluster_name.clone(),
                        ..Default::default()
                    });
                }
                HttpFilter::RequestMirror(_) => {}
            }
        }
        out.action = Some(match redirect {
            Some(redirect) => Action::Redirect(redirect),
            None => self.backends(rule, action),
        });

        let ctx = RouteContext {
            gateway: self.gateway,
            rule,
        };
        for (gk, att) in rule.extension_refs.iter().chain(rule.attached_policies.iter()) {
            // Invalid policies are reported when the gateway is built.
            if !att.errors.is_empty() {
                continue;
            }
            let Some(pass) = self.passes.get_mut(gk) else {
                continue;
            };
            if let Err(error) = pass.apply_for_route(att, &ctx, &mut out) {
                policy_failed(self.reports, self.gateway, att, &error);
            }
        }
        out
    }

    fn backends(&mut self, rule: &HttpRouteRuleMatchIr, mut action: RouteAction) -> Action {
        let mut weights = Vec::<(&str, u32)>::new();
        let mut valid = false;
        for b in rule.backends.iter().map(|b| &b.backend).filter(|b| b.weight > 0) {
            valid |= b.is_valid();
            match weights.iter_mut().find(|(name, _)| *name == b.cluster_name) {
                Some((_, w)) => *w = w.saturating_add(b.weight),
                None => weights.push((b.cluster_name.as_str(), b.weight)),
            }
        }
        if !valid {
            return direct_response(500, None);
        }
        if rule.backends.iter().any(|b| !b.backend.is_valid()) {
            self.uses_blackhole = true;
        }

        action.cluster_specifier = Some(match weights.as_slice() {
            [(name, _)] => ClusterSpecifier::Cluster(name.to_string()),
            _ => ClusterSpecifier::WeightedClusters(WeightedCluster {
                clusters: weights
                    .iter()
                    .map(|(name, weight)| ClusterWeight {
                        name: name.to_string(),
                        weight: Some(UInt32Value { value: *weight }),
                        ..Default::default()
                    })
                    .collect(),
                ..Default::default()
            }),
        });
        Action::Route(action)
    }
}

pub fn direct_response(status: u32, body: Option<String>) -> Action {
    Action::DirectResponse(DirectResponseAction {
        status,
        body: body.map(|body| DataSource {
            specifier: Some(data_source::Specifier::InlineString(body)),
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Orders rules so that the most specific match is evaluated first: exact,
/// then regex, then prefix paths; longer paths; methods; more headers; more
/// query parameters; older routes. Ties keep their original order.
fn compare_rules(a: &HttpRouteRuleMatchIr, b: &HttpRouteRuleMatchIr) -> Ordering {
    fn path_rank(m: &HttpRouteMatch) -> u8 {
        match m.path {
            Some(PathMatch::Exact(_)) => 0,
            Some(PathMatch::Regex(_)) => 1,
            Some(PathMatch::Prefix(_)) | None => 2,
        }
    }

    let (am, bm) = (&a.matcher, &b.matcher);
    path_rank(am)
        .cmp(&path_rank(bm))
        .then_with(|| bm.path_str().len().cmp(&am.path_str().len()))
        .then_with(|| bm.method.is_some().cmp(&am.method.is_some()))
        .then_with(|| bm.headers.len().cmp(&am.headers.len()))
        .then_with(|| bm.query_params.len().cmp(&am.query_params.len()))
        .then_with(|| {
            let age = |r: &HttpRouteRuleMatchIr| (r.creation_timestamp.is_none(), r.creation_timestamp);
            age(a).cmp(&age(b))
        })
        .then_with(|| a.route.cmp(&b.route))
}

fn route_match(m: &HttpRouteMatch) -> RouteMatch {
    let path = match &m.path {
        Some(PathMatch::Exact(p)) => PathSpecifier::Path(p.clone()),
        Some(PathMatch::Regex(r)) => PathSpecifier::SafeRegex(regex(r.as_str())),
        Some(PathMatch::Prefix(p)) if !p.trim_end_matches('/').is_empty() => {
            PathSpecifier::PathSeparatedPrefix(p.trim_end_matches('/').to_string())
        }
        Some(PathMatch::Prefix(_)) | None => PathSpecifier::Prefix("/".to_string()),
    };

    let mut headers = m
        .headers
        .iter()
        .map(|h| match h {
            HeaderMatch::Exact(name, value) => header_matcher(name.as_str(), MatchPattern::Exact(lossy(value))),
            HeaderMatch::Regex(name, r) => {
                header_matcher(name.as_str(), MatchPattern::SafeRegex(regex(r.as_str())))
            }
        })
        .collect::<Vec<_>>();
    if let Some(method) = &m.method {
        headers.push(header_matcher(":method", MatchPattern::Exact(method.to_string())));
    }

    let query_parameters = m
        .query_params
        .iter()
        .map(|q| {
            let (name, pattern) = match q {
                QueryParamMatch::Exact(name, value) => (name, MatchPattern::Exact(value.clone())),
                QueryParamMatch::Regex(name, r) => (name, MatchPattern::SafeRegex(regex(r.as_str()))),
            };
            QueryParameterMatcher {
                name: name.clone(),
                query_parameter_match_specifier: Some(QueryParameterMatchSpecifier::StringMatch(
                    string_matcher(pattern),
                )),
            }
        })
        .collect();

    RouteMatch {
        path_specifier: Some(path),
        headers,
        query_parameters,
        ..Default::default()
    }
}

fn header_matcher(name: &str, pattern: MatchPattern) -> HeaderMatcher {
    HeaderMatcher {
        name: name.to_string(),
        header_match_specifier: Some(HeaderMatchSpecifier::StringMatch(string_matcher(pattern))),
        ..Default::default()
    }
}

fn string_matcher(pattern: MatchPattern) -> StringMatcher {
    StringMatcher {
        match_pattern: Some(pattern),
        ignore_case: false,
    }
}

fn regex(regex: &str) -> RegexMatcher {
    RegexMatcher {
        regex: regex.to_string(),
        ..Default::default()
    }
}

fn lossy(value: &HeaderValue) -> String {
    String::from_utf8_lossy(value.as_bytes()).into_owned()
}

/// Set headers overwrite existing values; added headers are appended.
fn header_options(m: &HeaderModifierFilter) -> impl Iterator<Item = HeaderValueOption> + '_ {
    let option = |(name, value): &(HeaderName, HeaderValue), action: HeaderAppendAction| {
        HeaderValueOption {
            header: Some(EnvoyHeaderValue {
                key: name.to_string(),
                value: lossy(value),
                ..Default::default()
            }),
            append_action: action as i32,
            ..Default::default()
        }
    };
    let set = m
        .set
        .iter()
        .map(move |h| option(h, HeaderAppendAction::OverwriteIfExistsOrAdd));
    let add = m
        .add
        .iter()
        .map(move |h| option(h, HeaderAppendAction::AppendIfExistsOrAdd));
    set.chain(add)
}

fn redirect_action(r: &RequestRedirectFilter) -> RedirectAction {
    let response_code = match r.status.map(|s| s.as_u16()) {
        Some(301) => RedirectResponseCode::MovedPermanently,
        Some(303) => RedirectResponseCode::SeeOther,
        Some(307) => RedirectResponseCode::TemporaryRedirect,
        Some(308) => RedirectResponseCode::PermanentRedirect,
        _ => RedirectResponseCode::Found,
    };
    RedirectAction {
        host_redirect: r.host.clone().unwrap_or_default(),
        port_redirect: r.port.map(|p| u32::from(p.get())).unwrap_or_default(),
        response_code: response_code as i32,
        scheme_rewrite_specifier: r
            .scheme
            .as_ref()
            .map(|s| SchemeRewriteSpecifier::SchemeRedirect(s.to_string())),
        path_rewrite_specifier: r.path.as_ref().map(|p| match p {
            PathModifier::Full(path) => PathRewriteSpecifier::PathRedirect(path.clone()),
            PathModifier::Prefix(prefix) => PathRewriteSpecifier::PrefixRewrite(prefix.clone()),
        }),
        ..Default::default()
    }
}

fn rewrite(r: &UrlRewriteFilter, matcher: &HttpRouteMatch, action: &mut RouteAction) {
    if let Some(host) = &r.host {
        action.host_rewrite_specifier = Some(HostRewriteSpecifier::HostRewriteLiteral(host.clone()));
    }
    match &r.path {
        Some(PathModifier::Full(path)) => {
            action.regex_rewrite = Some(RegexMatchAndSubstitute {
                pattern: Some(regex("^/.*$")),
                substitution: path.clone(),
            });
        }
        Some(PathModifier::Prefix(prefix)) => {
            let matched = match &matcher.path {
                Some(PathMatch::Prefix(p)) => p.trim_end_matches('/'),
                _ => "",
            };
            // A plain prefix rewrite of `/foo` to `/` would turn `/foo/bar`
            // into `//bar`.
            if prefix == "/" && !matched.is_empty() {
                action.regex_rewrite = Some(RegexMatchAndSubstitute {
                    pattern: Some(regex(&format!("^{}/*", regex::escape(matched)))),
                    substitution: "/".to_string(),
                });
            } else {
                action.prefix_rewrite = prefix.clone();
            }
        }
        None => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gateway_controller_core::{
        http_route::{Method, StatusCode},
        ir::GroupKind,
    };

    fn rule(name: &str, matcher: HttpRouteMatch) -> HttpRouteRuleMatchIr {
        HttpRouteRuleMatchIr {
            route: ObjectSource::new(&GroupKind::http_route(), "default", name),
            delegated_by: None,
            rule_index: 0,
            match_index: 0,
            matcher,
            filters: vec![],
            backends: vec![],
            extension_refs: Default::default(),
            attached_policies: Default::default(),
            errors: vec![],
            creation_timestamp: None,
        }
    }

    fn path(path: PathMatch) -> HttpRouteMatch {
        HttpRouteMatch {
            path: Some(path),
            ..Default::default()
        }
    }

    #[test]
    fn rules_sort_by_specificity() {
        let mut rules = vec![
            rule("prefix-short", path(PathMatch::Prefix("/".to_string()))),
            rule("prefix-long", path(PathMatch::Prefix("/api/v1".to_string()))),
            rule("regex", path(PathMatch::regex("/a.*").unwrap())),
            rule(
                "prefix-method",
                HttpRouteMatch {
                    method: Some(Method::GET),
                    ..path(PathMatch::Prefix("/api/v1".to_string()))
                },
            ),
            rule("exact", path(PathMatch::Exact("/healthz".to_string()))),
        ];
        rules.sort_by(compare_rules);
        let names = rules.iter().map(|r| r.route.name.as_str()).collect::<Vec<_>>();
        assert_eq!(
            names,
            ["exact", "regex", "prefix-method", "prefix-long", "prefix-short"]
        );
    }

    #[test]
    fn older_routes_win_ties() {
        use chrono::{TimeZone, Utc};
        let mut newer = rule("a", HttpRouteMatch::default());
        newer.creation_timestamp = Some(Utc.timestamp_opt(200, 0).unwrap());
        let mut older = rule("b", HttpRouteMatch::default());
        older.creation_timestamp = Some(Utc.timestamp_opt(100, 0).unwrap());
        let undated = rule("c", HttpRouteMatch::default());

        let mut rules = vec![undated, newer, older];
        rules.sort_by(compare_rules);
        let names = rules.iter().map(|r| r.route.name.as_str()).collect::<Vec<_>>();
        assert_eq!(names, ["b", "a", "c"]);
    }

    #[test]
    fn prefixes_match_path_segments() {
        let m = route_match(&path(PathMatch::Prefix("/api/".to_string())));
        assert_eq!(
            m.path_specifier,
            Some(PathSpecifier::PathSeparatedPrefix("/api".to_string()))
        );
        let m = route_match(&HttpRouteMatch::default());
        assert_eq!(m.path_specifier, Some(PathSpecifier::Prefix("/".to_string())));
    }

    #[test]
    fn methods_match_pseudo_header() {
        let m = route_match(&HttpRouteMatch {
            method: Some(Method::POST),
            ..Default::default()
        });
        assert_eq!(m.headers.len(), 1);
        assert_eq!(m.headers[0].name, ":method");
    }

    #[test]
    fn redirects_default_to_found() {
        let r = redirect_action(&RequestRedirectFilter {
            scheme: None,
            host: Some("example.com".to_string()),
            path: None,
            port: None,
            status: None,
        });
        assert_eq!(r.response_code, RedirectResponseCode::Found as i32);
        assert_eq!(r.host_redirect, "example.com");

        let r = redirect_action(&RequestRedirectFilter {
            scheme: None,
            host: None,
            path: Some(PathModifier::Full("/new".to_string())),
            port: None,
            status: Some(StatusCode::MOVED_PERMANENTLY),
        });
        assert_eq!(r.response_code, RedirectResponseCode::MovedPermanently as i32);
        assert_eq!(
            r.path_rewrite_specifier,
            Some(PathRewriteSpecifier::PathRedirect("/new".to_string()))
        );
    }

    #[test]
    fn prefix_rewrites_to_root_strip_the_match() {
        let mut action = RouteAction::default();
        rewrite(
            &UrlRewriteFilter {
                host: None,
                path: Some(PathModifier::Prefix("/".to_string())),
            },
            &path(PathMatch::Prefix("/api".to_string())),
            &mut action,
        );
        let rewrite = action.regex_rewrite.expect("regex rewrite");
        assert_eq!(rewrite.pattern.map(|p| p.regex).as_deref(), Some("^/api/*"));
        assert_eq!(rewrite.substitution, "/");
        assert!(action.prefix_rewrite.is_empty());
    }
}
