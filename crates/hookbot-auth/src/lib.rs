// URL-scoped capability tokens.
//
// A token is the lowercase hex HMAC-SHA1 of a URL path under the server key.
// Holding the token for a path authorizes requests to that path; a token
// minted for a path ending in "/" authorizes the whole subtree below it, and
// a token minted without the leading /pub or /sub verb is valid for both.
use std::sync::LazyLock;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use hmac::{Hmac, Mac};
use regex::Regex;
use sha1::Sha1;
use subtle::ConstantTimeEq;

type HmacSha1 = Hmac<Sha1>;

/// Header required on unsafe requests in place of a token.
pub const UNSAFE_HEADER: &str = "X-Hookbot-Unsafe-Is-Ok";
/// The only accepted value for [`UNSAFE_HEADER`].
pub const UNSAFE_HEADER_VALUE: &str = "I understand the security implications";

static UNSAFE_PATH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("^/unsafe/(pub|sub)/.*").expect("unsafe path pattern"));

/// Lowercase hex HMAC-SHA1 of `payload` under `key`.
pub fn sha1_hmac(key: &str, payload: &[u8]) -> String {
    let mut mac = HmacSha1::new_from_slice(key.as_bytes()).expect("hmac accepts any key length");
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time string comparison.
pub fn secure_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

// Every prefix of the path ending at a "/" boundary, plus the path itself.
// "/a/b/c" yields "/", "/a/", "/a/b/", "/a/b/c".
fn subpaths(path: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let mut upto = String::new();
    for piece in path.split_inclusive('/') {
        upto.push_str(piece);
        out.push(upto.clone());
    }
    if out.last().map(String::as_str) != Some(path) {
        out.push(path.to_string());
    }
    out
}

// The path without its {/pub,/sub} verb; tokens minted for the bare path are
// valid for both verbs.
fn strip_verb(path: &str) -> &str {
    let path = path.strip_prefix("/pub").unwrap_or(path);
    path.strip_prefix("/sub").unwrap_or(path)
}

/// True iff `given` is the token for some candidate scope of `path`.
///
/// Candidates are every "/"-terminated prefix of the path plus the full
/// path, each also tried without the leading verb. All comparisons are
/// constant-time.
pub fn token_matches(key: &str, path: &str, given: &str) -> bool {
    let mut ok = false;
    for subpath in subpaths(path) {
        let expected = sha1_hmac(key, subpath.as_bytes());
        ok |= secure_eq(given, &expected);

        let expected = sha1_hmac(key, strip_verb(&subpath).as_bytes());
        ok |= secure_eq(given, &expected);
    }
    ok
}

/// Extract the presented token from an `Authorization` header value.
///
/// `Basic` carries the token in the username field (password ignored);
/// `Bearer` carries it verbatim. Anything else is not understood.
pub fn token_from_authorization(header: &str) -> Option<String> {
    let mut fields = header.split_whitespace();
    let scheme = fields.next()?;
    let value = fields.next()?;
    if fields.next().is_some() {
        return None;
    }

    match scheme.to_ascii_lowercase().as_str() {
        "basic" => {
            let decoded = BASE64.decode(value).ok()?;
            let decoded = String::from_utf8(decoded).ok()?;
            let (user, _password) = decoded.split_once(':')?;
            Some(user.to_string())
        }
        "bearer" => Some(value.to_string()),
        _ => None,
    }
}

/// Run the whole check: parse the header, derive candidates, compare.
pub fn authorized(key: &str, path: &str, authorization: Option<&str>) -> bool {
    let Some(given) = authorization.and_then(token_from_authorization) else {
        return false;
    };
    token_matches(key, path, &given)
}

/// Unsafe requests are those whose second path component is `unsafe`.
/// They bypass the token check and are gated by [`UNSAFE_HEADER`] instead.
pub fn is_unsafe_path(path: &str) -> bool {
    UNSAFE_PATH.is_match(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_KEY: &str = "key";

    fn basic_header(token: &str) -> String {
        format!("Basic {}", BASE64.encode(format!("{token}:")))
    }

    #[test]
    fn hmac_is_lowercase_hex() {
        let mac = sha1_hmac(TEST_KEY, b"/pub/place");
        assert_eq!(mac.len(), 40);
        assert!(mac.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn subpaths_stop_at_boundaries() {
        assert_eq!(
            subpaths("/pub/place/x"),
            vec!["/", "/pub/", "/pub/place/", "/pub/place/x"]
        );
    }

    #[test]
    fn subpaths_of_slash_terminated_path() {
        assert_eq!(subpaths("/pub/place/"), vec!["/", "/pub/", "/pub/place/"]);
    }

    #[test]
    fn exact_token_matches() {
        let token = sha1_hmac(TEST_KEY, b"/pub/place");
        assert!(token_matches(TEST_KEY, "/pub/place", &token));
    }

    #[test]
    fn wrong_token_rejected() {
        let token = sha1_hmac(TEST_KEY, b"/pub/not/the/same/as/above");
        assert!(!token_matches(TEST_KEY, "/pub/place", &token));
    }

    #[test]
    fn verbless_token_valid_for_both_verbs() {
        let token = sha1_hmac(TEST_KEY, b"/place");
        assert!(token_matches(TEST_KEY, "/pub/place", &token));
        assert!(token_matches(TEST_KEY, "/sub/place", &token));
    }

    #[test]
    fn prefix_token_covers_subtree() {
        let token = sha1_hmac(TEST_KEY, b"/pub/place/");
        assert!(token_matches(TEST_KEY, "/pub/place/sub/sub/sub", &token));
    }

    // "/pub/po" is not a whole step up from "/pub/post".
    #[test]
    fn non_boundary_prefix_rejected() {
        let token = sha1_hmac(TEST_KEY, b"/pub/po");
        assert!(!token_matches(TEST_KEY, "/pub/post", &token));
    }

    #[test]
    fn basic_auth_carries_token_in_username() {
        let token = sha1_hmac(TEST_KEY, b"/pub/place");
        assert!(authorized(TEST_KEY, "/pub/place", Some(&basic_header(&token))));
    }

    #[test]
    fn bearer_auth_carries_token_verbatim() {
        let token = sha1_hmac(TEST_KEY, b"/pub/place");
        let header = format!("Bearer {token}");
        assert!(authorized(TEST_KEY, "/pub/place", Some(&header)));
    }

    #[test]
    fn missing_or_garbled_authorization_rejected() {
        assert!(!authorized(TEST_KEY, "/pub/place", None));
        assert!(!authorized(TEST_KEY, "/pub/place", Some("Basic")));
        assert!(!authorized(TEST_KEY, "/pub/place", Some("Digest abc def")));
        assert!(!authorized(TEST_KEY, "/pub/place", Some("Basic not-base64!")));
    }

    #[test]
    fn unsafe_paths_are_anchored() {
        assert!(is_unsafe_path("/unsafe/pub/topic"));
        assert!(is_unsafe_path("/unsafe/sub/"));
        assert!(!is_unsafe_path("/pub/unsafe/topic"));
        assert!(!is_unsafe_path("/unsafe/other/topic"));
        assert!(!is_unsafe_path("/unsafe/pub"));
    }
}
