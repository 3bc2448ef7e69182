pub mod normalize;

use normalize::normalize_docker_hub_image;

pub const DOCKER_HUB_REGISTRY: &str = "docker.io/";

/// Substring that identifies an ECR registry hostname.
const ECR_HOST_MARKER: &str = ".dkr.ecr.";

/// A single source-registry matching rule.
///
/// Rules are evaluated in configured order with a first-match-wins policy:
/// if a user configures both a specific ECR hostname and a broader catch-all,
/// whichever is listed first applies.
#[derive(Debug, Clone, PartialEq, Eq)]
enum RegistryRule {
    /// The `docker.io/` entry. Matches implicit Docker Hub references
    /// ("nginx", "owner/image") as well as explicit `docker.io/...` ones,
    /// after normalization.
    DockerHub,
    /// An ECR registry hostname (possibly a foreign account or region).
    /// On match the hostname is stripped and the path is re-rooted under
    /// the local cache hostname.
    Ecr(String),
    /// Any other registry prefix. On match the full image reference
    /// (registry included) is nested under the cache hostname, so one
    /// cache can multiplex several source registries without collisions.
    Prefix(String),
}

impl RegistryRule {
    fn classify(prefix: String) -> Self {
        if prefix == DOCKER_HUB_REGISTRY {
            RegistryRule::DockerHub
        } else if prefix.contains(ECR_HOST_MARKER) {
            RegistryRule::Ecr(prefix)
        } else {
            RegistryRule::Prefix(prefix)
        }
    }

    /// Apply this rule to an image reference, returning the rewritten
    /// reference when the rule matches.
    fn rewrite(&self, image: &str, cache_hostname: &str) -> Option<String> {
        match self {
            RegistryRule::DockerHub => {
                let normalized = normalize_docker_hub_image(image);
                normalized
                    .starts_with(DOCKER_HUB_REGISTRY)
                    .then(|| format!("{cache_hostname}{normalized}"))
            }
            RegistryRule::Ecr(prefix) => image
                .strip_prefix(prefix.as_str())
                .map(|path| format!("{cache_hostname}{path}")),
            RegistryRule::Prefix(prefix) => image
                .starts_with(prefix.as_str())
                .then(|| format!("{cache_hostname}{image}")),
        }
    }
}

/// The ordered set of source registries to mirror, plus the destination
/// pull-through cache hostname. Immutable after construction; safe to share
/// across concurrent admission requests.
#[derive(Debug, Clone)]
pub struct RegistryCatalog {
    rules: Vec<RegistryRule>,
    cache_hostname: String,
}

impl RegistryCatalog {
    /// Build a catalog from the configured account, region and source
    /// registry prefixes.
    ///
    /// Entries are trimmed, blank entries dropped, and every entry is
    /// normalized to exactly one trailing `/`. An empty list defaults to
    /// Docker Hub.
    pub fn new(account_id: &str, region: &str, registries: &[String]) -> Self {
        let mut rules: Vec<RegistryRule> = registries
            .iter()
            .map(|r| r.trim())
            .filter(|r| !r.is_empty())
            .map(|r| format!("{}/", r.trim_end_matches('/')))
            .map(RegistryRule::classify)
            .collect();
        if rules.is_empty() {
            rules.push(RegistryRule::DockerHub);
        }
        Self {
            rules,
            cache_hostname: format!("{account_id}.dkr.ecr.{region}.amazonaws.com/"),
        }
    }

    /// The destination cache prefix, e.g. `123456789012.dkr.ecr.us-east-1.amazonaws.com/`.
    pub fn cache_hostname(&self) -> &str {
        &self.cache_hostname
    }

    /// Decide whether `image` should be rewritten to pull through the cache.
    ///
    /// Returns the rewritten reference, or `None` when the image's registry
    /// is not configured (the image is then left untouched). Images already
    /// prefixed with the cache hostname are never rewritten again, so
    /// re-admitting a previously patched Pod is a no-op.
    pub fn rewrite(&self, image: &str) -> Option<String> {
        if image.starts_with(&self.cache_hostname) {
            return None;
        }
        self.rules
            .iter()
            .find_map(|rule| rule.rewrite(image, &self.cache_hostname))
    }
}
