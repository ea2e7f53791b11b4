// Topic extraction from request paths.
use std::sync::LazyLock;

use regex::Regex;

// The topic is everything after the "/pub/" or "/sub/" component. The
// "/unsafe" prefix is deliberately not captured: unsafe topics get their own
// namespace below so a safe topic can never alias an unsafe one.
static TOPIC: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("^(?:/unsafe)?/[^/]+/(.*)$").expect("topic pattern"));

/// Suffix marking a prefix subscription.
pub const RECURSIVE_SUFFIX: &str = "?recursive";

/// Extract the topic from a request path. A path that does not parse yields
/// the empty topic, which dispatches normally but matches almost nothing.
pub fn from_path(path: &str, is_unsafe: bool) -> String {
    let topic = TOPIC
        .captures(path)
        .and_then(|captures| captures.get(1))
        .map(|group| group.as_str())
        .unwrap_or("");
    if is_unsafe {
        format!("/unsafe/{topic}")
    } else {
        topic.to_string()
    }
}

/// Split the `?recursive` suffix off a registered topic, reporting whether it
/// was present.
pub fn recursive(topic: &str) -> (&str, bool) {
    match topic.strip_suffix(RECURSIVE_SUFFIX) {
        Some(base) => (base, true),
        None => (topic, false),
    }
}
