// Blocking diagnostics - classifies extraction engine errors
//
// The engine reports failures as free text. Matching it against known
// patterns gives the caller a reason and something to try next.

use serde::{Deserialize, Serialize};

/// Why a site refused to hand over media info
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockingReason {
    /// HTTP 403 Forbidden - general access denied
    Http403Forbidden,

    /// Age-restricted content requiring login
    AgeRestricted,

    /// Geographic restriction
    GeoBlocked,

    /// Network timeout or unreachable proxy
    NetworkTimeout,

    /// Rate limiting (429 or similar)
    RateLimited,

    /// Bot detection or captcha
    BotDetection,

    /// Private media requiring authorization
    PrivateMedia,

    /// Media deleted or unavailable
    MediaUnavailable,

    /// DRM-protected content. Permanent, not an error.
    DrmProtected,

    /// No extractor understands this URL
    UnsupportedUrl,

    /// Generic/unknown blocking
    Unknown,
}

impl BlockingReason {
    /// Retrying later or through another network path might help
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Http403Forbidden | Self::NetworkTimeout | Self::RateLimited | Self::BotDetection
        )
    }

    /// Check if proxy might help
    pub fn proxy_might_help(&self) -> bool {
        matches!(
            self,
            Self::Http403Forbidden
                | Self::GeoBlocked
                | Self::NetworkTimeout
                | Self::RateLimited
                | Self::BotDetection
        )
    }

    /// No workaround exists
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Self::DrmProtected | Self::MediaUnavailable | Self::UnsupportedUrl
        )
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::Http403Forbidden => "Access denied (HTTP 403)",
            Self::AgeRestricted => "Age-restricted content",
            Self::GeoBlocked => "Geographic restriction",
            Self::NetworkTimeout => "Network timeout (possible throttling)",
            Self::RateLimited => "Rate limited by the site",
            Self::BotDetection => "Bot detection triggered",
            Self::PrivateMedia => "Private media",
            Self::MediaUnavailable => "Media unavailable",
            Self::DrmProtected => "DRM-protected content",
            Self::UnsupportedUrl => "Unsupported URL",
            Self::Unknown => "Unknown blocking reason",
        }
    }

    /// What the user can try next
    pub fn suggestion(&self) -> &'static str {
        match self {
            Self::Http403Forbidden | Self::BotDetection => {
                "Try again later or set network.proxy to route through another address."
            }
            Self::RateLimited => "Wait a few minutes before trying again.",
            Self::NetworkTimeout => {
                "Check the connection, or raise extraction.timeout_seconds in the config."
            }
            Self::GeoBlocked => "Set network.proxy to a server in a region where it is available.",
            Self::AgeRestricted | Self::PrivateMedia => {
                "The site requires a signed-in account for this media."
            }
            Self::MediaUnavailable => "The media was removed or never existed.",
            Self::DrmProtected => "DRM-protected media cannot be downloaded as a file.",
            Self::UnsupportedUrl => "Check that the URL points to a single media page.",
            Self::Unknown => "Run with RUST_LOG=media_downloader=debug for details.",
        }
    }
}

/// Analyze error message and return blocking reason
pub fn diagnose_error(error: &str) -> Option<BlockingReason> {
    if error.trim().is_empty() {
        return None;
    }
    let lower = error.to_lowercase();
    let has = |patterns: &[&str]| patterns.iter().any(|p| lower.contains(p));

    // Checked in order of specificity
    if has(&[
        "drm",
        "widevine",
        "playready",
        "fairplay",
        "encrypted media",
        "content is protected",
        "requires purchase",
        "requires payment",
    ]) {
        return Some(BlockingReason::DrmProtected);
    }

    if has(&["unsupported url", "no suitable extractor"]) {
        return Some(BlockingReason::UnsupportedUrl);
    }

    if has(&[
        "age-restricted",
        "sign in to confirm your age",
        "age_verification",
    ]) {
        return Some(BlockingReason::AgeRestricted);
    }

    if has(&[
        "private video",
        "video is private",
        "is private",
        "sign in if you've been granted access",
    ]) {
        return Some(BlockingReason::PrivateMedia);
    }

    if has(&[
        "video unavailable",
        "has been removed",
        "no longer available",
        "is unavailable",
        "http error 404",
    ]) {
        return Some(BlockingReason::MediaUnavailable);
    }

    if has(&[
        "not available in your country",
        "blocked in your country",
        "geo restrict",
        "geo-restrict",
        "geographic restriction",
    ]) {
        return Some(BlockingReason::GeoBlocked);
    }

    if has(&["429", "rate limit", "too many requests"]) {
        return Some(BlockingReason::RateLimited);
    }

    if has(&[
        "not a bot",
        "bot detection",
        "captcha",
        "unusual traffic",
        "automated queries",
    ]) {
        return Some(BlockingReason::BotDetection);
    }

    if has(&["403", "forbidden"]) {
        return Some(BlockingReason::Http403Forbidden);
    }

    if has(&[
        "timeout",
        "timed out",
        "connection refused",
        "network unreachable",
        "network unavailable",
    ]) {
        return Some(BlockingReason::NetworkTimeout);
    }

    Some(BlockingReason::Unknown)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_403_detection() {
        let error = "ERROR: HTTP Error 403: Forbidden";
        assert_eq!(diagnose_error(error), Some(BlockingReason::Http403Forbidden));
    }

    #[test]
    fn test_age_restricted_detection() {
        let error = "Sign in to confirm your age";
        assert_eq!(diagnose_error(error), Some(BlockingReason::AgeRestricted));
    }

    #[test]
    fn test_timeout_detection() {
        let error = "Timed out after 30s";
        assert_eq!(diagnose_error(error), Some(BlockingReason::NetworkTimeout));
    }

    #[test]
    fn test_geo_detection() {
        let error = "Video not available in your country";
        assert_eq!(diagnose_error(error), Some(BlockingReason::GeoBlocked));
    }

    #[test]
    fn test_drm_detection() {
        assert_eq!(
            diagnose_error("This video is DRM protected"),
            Some(BlockingReason::DrmProtected)
        );
        assert_eq!(
            diagnose_error("Widevine encrypted content cannot be downloaded"),
            Some(BlockingReason::DrmProtected)
        );
    }

    #[test]
    fn test_unsupported_url_detection() {
        let error = "ERROR: Unsupported URL: https://unrelated.example/";
        assert_eq!(diagnose_error(error), Some(BlockingReason::UnsupportedUrl));
        assert!(BlockingReason::UnsupportedUrl.is_permanent());
    }

    #[test]
    fn test_unmatched_text_is_unknown_and_empty_is_none() {
        assert_eq!(diagnose_error("something odd"), Some(BlockingReason::Unknown));
        assert_eq!(diagnose_error("   "), None);
    }

    #[test]
    fn test_every_reason_has_a_suggestion() {
        for reason in [
            BlockingReason::Http403Forbidden,
            BlockingReason::RateLimited,
            BlockingReason::NetworkTimeout,
            BlockingReason::DrmProtected,
            BlockingReason::Unknown,
        ] {
            assert!(!reason.suggestion().is_empty());
        }
        assert!(BlockingReason::RateLimited.is_retryable());
        assert!(!BlockingReason::DrmProtected.is_retryable());
    }
}
