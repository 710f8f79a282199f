/// Normalize a caller-supplied URL to an absolute `https://` form.
///
/// Site-relative paths (leading `/`) are anchored to `site`; plain
/// `http://` URLs are upgraded to `https://`; any other scheme-less
/// input is taken to already start with its host. The normalized form
/// is used uniformly as the network target and the cache key, so cache
/// hits do not depend on how the caller phrased the URL.
pub fn normalize_url(url: &str, site: &str) -> String {
    if let Some(rest) = url.strip_prefix("http://") {
        return format!("https://{rest}");
    }
    if url.starts_with("https://") {
        return url.to_string();
    }
    match url.strip_prefix('/') {
        Some(path) => format!("https://{site}/{path}"),
        None => format!("https://{url}"),
    }
}
