// Token minting for the make-tokens subcommand.
use std::sync::LazyLock;

use anyhow::{Context, Result};
use hookbot_auth::sha1_hmac;
use regex::Regex;
use url::Url;

static SUBSCRIBE_URI: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("^(?:/unsafe)?/sub").expect("subscribe uri pattern"));

/// One output line per URI: either the bare token, or a URL carrying the
/// token as userinfo. The url-base supplies host and the secure bit of the
/// scheme; it is not part of the MAC.
pub fn make_tokens(key: &str, url_base: &str, uris: &[String], bare: bool) -> Result<Vec<String>> {
    let base = Url::parse(url_base).with_context(|| format!("parse url-base: {url_base}"))?;

    let mut lines = Vec::with_capacity(uris.len());
    for uri in uris {
        let mac = sha1_hmac(key, uri.as_bytes());
        if bare {
            lines.push(mac);
            continue;
        }

        let mut url = base.clone();
        let scheme = scheme_for(uri, base.scheme());
        url.set_scheme(scheme)
            .ok()
            .with_context(|| format!("set scheme {scheme} on {url_base}"))?;
        url.set_username(&mac)
            .ok()
            .context("set token as userinfo")?;
        url.set_path(uri);
        lines.push(url.to_string());
    }
    Ok(lines)
}

// Subscriptions are websockets, publishes plain http; the "s" comes from
// the url-base.
fn scheme_for(target: &str, base_scheme: &str) -> &'static str {
    let secure = matches!(base_scheme, "https" | "wss");
    match (SUBSCRIBE_URI.is_match(target), secure) {
        (true, true) => "wss",
        (true, false) => "ws",
        (false, true) => "https",
        (false, false) => "http",
    }
}
