use std::borrow::Cow;

use super::DOCKER_HUB_REGISTRY;

/// Normalize a Docker Hub image reference into its fully-qualified
/// `docker.io/<owner>/<name>[:tag|@digest]` form.
///
/// The candidate registry host is everything up to the first `/`. It only
/// counts as a host if it contains a `.` or a `:` (this is how `docker.io/nginx`
/// is told apart from `owner/image`). References with any other explicit host
/// are returned unchanged; normalization applies to Docker Hub forms only.
///
/// Tag and digest suffixes are opaque and passed through unexamined.
pub fn normalize_docker_hub_image(image: &str) -> Cow<'_, str> {
    let Some(slash) = image.find('/') else {
        // bare image: "nginx" -> docker.io/library/nginx
        return Cow::Owned(format!("{DOCKER_HUB_REGISTRY}library/{image}"));
    };

    // host includes the trailing '/'
    let (host, path) = image.split_at(slash + 1);
    if !host.contains('.') && !host.contains(':') {
        // no registry specified, implicit Docker Hub: "owner/image" -> docker.io/owner/image
        Cow::Owned(format!("{DOCKER_HUB_REGISTRY}{image}"))
    } else if host == DOCKER_HUB_REGISTRY && !path.contains('/') {
        // docker.io/nginx -> docker.io/library/nginx
        Cow::Owned(format!("{DOCKER_HUB_REGISTRY}library/{path}"))
    } else {
        Cow::Borrowed(image)
    }
}
