use anyhow::{anyhow, bail, Result};
use gateway_controller_core::http_route as routes;
use gateway_controller_k8s_api::gateway as api;
use std::num::NonZeroU16;

pub fn try_match(
    api::HttpRouteMatch {
        path,
        headers,
        query_params,
        method,
    }: &api::HttpRouteMatch,
) -> Result<routes::HttpRouteMatch> {
    let path = match path {
        Some(path) => Some(path_match(path)?),
        None => Some(routes::PathMatch::Prefix("/".to_string())),
    };

    let headers = headers
        .iter()
        .flatten()
        .map(header_match)
        .collect::<Result<_>>()?;

    let query_params = query_params
        .iter()
        .flatten()
        .map(query_param_match)
        .collect::<Result<_>>()?;

    let method = method
        .as_deref()
        .map(routes::Method::try_from)
        .transpose()?;

    Ok(routes::HttpRouteMatch {
        path,
        headers,
        query_params,
        method,
    })
}

pub fn path_match(path_match: &api::HttpPathMatch) -> Result<routes::PathMatch> {
    let value = path_match.value.clone().unwrap_or_else(|| "/".to_string());
    match path_match.type_.as_deref().unwrap_or("PathPrefix") {
        "Exact" | "PathPrefix" if !value.starts_with('/') => Err(anyhow!(
            "HttpPathMatch paths must be absolute (begin with `/`); {value:?} is not an absolute path"
        )),
        "Exact" => Ok(routes::PathMatch::Exact(value)),
        "PathPrefix" => Ok(routes::PathMatch::Prefix(value)),
        "RegularExpression" => routes::PathMatch::regex(&value),
        other => bail!("unsupported path match type {other:?}"),
    }
}

pub fn header_match(header_match: &api::HttpNamedMatch) -> Result<routes::HeaderMatch> {
    let name = routes::HeaderName::try_from(header_match.name.as_str())?;
    match header_match.type_.as_deref().unwrap_or("Exact") {
        "Exact" => Ok(routes::HeaderMatch::Exact(
            name,
            header_match.value.parse()?,
        )),
        "RegularExpression" => Ok(routes::HeaderMatch::Regex(name, header_match.value.parse()?)),
        other => bail!("unsupported header match type {other:?}"),
    }
}

pub fn query_param_match(query_match: &api::HttpNamedMatch) -> Result<routes::QueryParamMatch> {
    let name = query_match.name.clone();
    match query_match.type_.as_deref().unwrap_or("Exact") {
        "Exact" => Ok(routes::QueryParamMatch::Exact(name, query_match.value.clone())),
        "RegularExpression" => Ok(routes::QueryParamMatch::Regex(
            name,
            query_match.value.parse()?,
        )),
        other => bail!("unsupported query parameter match type {other:?}"),
    }
}

pub fn header_modifier(
    api::HttpHeaderFilter { set, add, remove }: &api::HttpHeaderFilter,
) -> Result<routes::HeaderModifierFilter> {
    let headers = |headers: &Option<Vec<api::HttpHeader>>| {
        headers
            .iter()
            .flatten()
            .map(|api::HttpHeader { name, value }| {
                Ok((
                    routes::HeaderName::try_from(name.as_str())?,
                    routes::HeaderValue::try_from(value.as_str())?,
                ))
            })
            .collect::<Result<Vec<_>>>()
    };
    Ok(routes::HeaderModifierFilter {
        add: headers(add)?,
        set: headers(set)?,
        remove: remove
            .iter()
            .flatten()
            .map(|name| routes::HeaderName::try_from(name.as_str()))
            .collect::<Result<_, _>>()?,
    })
}

pub fn req_redirect(
    api::HttpRequestRedirect {
        scheme,
        hostname,
        path,
        port,
        status_code,
    }: &api::HttpRequestRedirect,
) -> Result<routes::RequestRedirectFilter> {
    Ok(routes::RequestRedirectFilter {
        scheme: scheme
            .as_deref()
            .map(routes::Scheme::try_from)
            .transpose()?,
        host: hostname.clone(),
        path: path.as_ref().map(path_modifier).transpose()?,
        port: port
            .and_then(|p| u16::try_from(p).ok())
            .and_then(NonZeroU16::new),
        status: status_code
            .map(|code| {
                u16::try_from(code)
                    .map_err(anyhow::Error::from)
                    .and_then(|code| Ok(routes::StatusCode::from_u16(code)?))
            })
            .transpose()?,
    })
}

pub fn url_rewrite(
    api::HttpUrlRewrite { hostname, path }: &api::HttpUrlRewrite,
) -> Result<routes::UrlRewriteFilter> {
    Ok(routes::UrlRewriteFilter {
        host: hostname.clone(),
        path: path.as_ref().map(path_modifier).transpose()?,
    })
}

fn path_modifier(path_modifier: &api::HttpPathModifier) -> Result<routes::PathModifier> {
    let path = match path_modifier.type_.as_str() {
        "ReplaceFullPath" => path_modifier.replace_full_path.as_deref(),
        "ReplacePrefixMatch" => path_modifier.replace_prefix_match.as_deref(),
        other => bail!("unsupported path modifier type {other:?}"),
    }
    .ok_or_else(|| anyhow!("{} filter has no path", path_modifier.type_))?;
    if !path.starts_with('/') {
        bail!(
            "path modifiers may only contain absolute paths \
                (starting with '/'); {path:?} is not an absolute path"
        )
    }
    if path_modifier.type_ == "ReplaceFullPath" {
        Ok(routes::PathModifier::Full(path.to_string()))
    } else {
        Ok(routes::PathModifier::Prefix(path.to_string()))
    }
}
