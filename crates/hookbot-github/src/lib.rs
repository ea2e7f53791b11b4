// GitHub webhook translation.
//
// Raw webhook deliveries arrive on the unsafe namespace wrapped in the
// metadata envelope the publisher endpoint produces. This router validates
// each delivery's signature against the shared GitHub secret, decodes push
// events, and republishes a compact update onto a per-repo, per-branch
// topic that ordinary (authenticated) subscribers can watch.
use async_trait::async_trait;
use bytes::Bytes;
use hookbot_auth::{secure_eq, sha1_hmac};
use hookbot_broker::{Delivery, Publisher, Router};
use serde::{Deserialize, Serialize};

/// The topic raw GitHub deliveries are published to by webhook receivers.
pub const GITHUB_TOPIC: &str = "/unsafe/github.com/?recursive";

/// Metadata envelope carried when a publish requests
/// `?extra-metadata=github`: the signature and event headers plus the raw
/// payload bytes.
#[derive(Debug, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "Signature")]
    pub signature: String,
    #[serde(rename = "Event")]
    pub event: String,
    #[serde(rename = "Delivery")]
    pub delivery: String,
    // Payload is opaque bytes; on the wire it is a base64 string.
    #[serde(rename = "Payload", with = "base64_bytes")]
    pub payload: Vec<u8>,
}

mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64.decode(encoded).map_err(serde::de::Error::custom)
    }
}

/// Validate the envelope's signature: `sha1=<hex HMAC-SHA1(secret, payload)>`
/// compared in constant time.
pub fn is_valid_signature(secret: &str, message: &[u8]) -> bool {
    let envelope: Envelope = match serde_json::from_slice(message) {
        Ok(envelope) => envelope,
        Err(error) => {
            tracing::warn!(%error, "undecodable github envelope");
            return false;
        }
    };
    let expected = format!("sha1={}", sha1_hmac(secret, &envelope.payload));
    secure_eq(&envelope.signature, &expected)
}

#[derive(Debug, Deserialize)]
struct PushEvent {
    repository: Option<Repository>,
    pusher: Option<Pusher>,
    #[serde(rename = "ref", default)]
    git_ref: String,
    #[serde(default)]
    after: String,
}

impl PushEvent {
    fn branch(&self) -> &str {
        self.git_ref
            .strip_prefix("refs/heads/")
            .unwrap_or(&self.git_ref)
    }
}

#[derive(Debug, Deserialize)]
struct Repository {
    full_name: String,
}

#[derive(Debug, Deserialize)]
struct Pusher {
    name: String,
}

/// What gets republished for each push.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Update {
    #[serde(rename = "Type")]
    pub kind: String,
    #[serde(rename = "Repo")]
    pub repo: String,
    #[serde(rename = "Branch")]
    pub branch: String,
    #[serde(rename = "SHA")]
    pub sha: String,
    #[serde(rename = "Who")]
    pub who: String,
}

// Decode one validated envelope into the (topic, update) to republish.
// Events that aren't pushes, or that don't identify a repository, are
// skipped.
fn translate(message: &[u8]) -> Option<(String, Update)> {
    let envelope: Envelope = match serde_json::from_slice(message) {
        Ok(envelope) => envelope,
        Err(error) => {
            tracing::warn!(%error, "undecodable github envelope");
            return None;
        }
    };

    if envelope.event != "push" {
        tracing::info!(event = %envelope.event, "unhandled github event type");
        return None;
    }

    let event: PushEvent = match serde_json::from_slice(&envelope.payload) {
        Ok(event) => event,
        Err(error) => {
            tracing::warn!(%error, "undecodable github push payload");
            return None;
        }
    };

    let Some(repo) = event.repository.as_ref().filter(|r| !r.full_name.is_empty()) else {
        tracing::warn!(event = %envelope.event, "github event without a repository");
        return None;
    };

    let update = Update {
        kind: envelope.event.clone(),
        repo: repo.full_name.clone(),
        branch: event.branch().to_string(),
        sha: event.after.clone(),
        who: event
            .pusher
            .as_ref()
            .map(|pusher| pusher.name.clone())
            .unwrap_or_else(|| "<unknown>".to_string()),
    };
    let topic = format!("github.com/repo/{}/branch/{}", update.repo, update.branch);
    Some((topic, update))
}

/// Router that turns signed GitHub push deliveries into per-branch updates.
pub struct GithubRouter {
    secret: String,
}

impl GithubRouter {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }
}

#[async_trait]
impl Router for GithubRouter {
    fn name(&self) -> &str {
        "github"
    }

    fn topics(&self) -> Vec<String> {
        vec![GITHUB_TOPIC.to_string()]
    }

    async fn route(&self, delivery: Delivery, publisher: &Publisher) {
        tracing::debug!(topic = %delivery.topic, "route github delivery");

        if !is_valid_signature(&self.secret, &delivery.body) {
            tracing::warn!(topic = %delivery.topic, "rejected github signature");
            return;
        }
        let Some((topic, update)) = translate(&delivery.body) else {
            return;
        };
        let body = match serde_json::to_vec(&update) {
            Ok(body) => body,
            Err(error) => {
                tracing::warn!(%error, "failed to encode github update");
                return;
            }
        };
        if let Err(error) = publisher.publish(topic.clone(), Bytes::from(body)).await {
            tracing::warn!(%error, %topic, "failed to republish github update");
        }
    }
}
