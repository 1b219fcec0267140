//! Shared constants used across the application.

/// Instagram web GraphQL endpoint path (`doc_id` query for a single post).
pub const GRAPHQL_PATH: &str = "/graphql/query";

/// GraphQL document id for the single-post query (PolarisPostRootQuery).
pub const GRAPHQL_DOC_ID: &str = "34052121741099006";

/// Client id the Instagram web app sends in `X-IG-App-ID`.
pub const IG_APP_ID: &str = "936619743392459";

/// Production API host. Tests inject a mock server base URL instead.
pub const IG_BASE_URL: &str = "https://www.instagram.com";

/// Desktop browser user agent for authenticated API requests.
///
/// Matches the Instagram web app's traffic so API requests are
/// indistinguishable from a logged-in browser session.
pub const DESKTOP_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";

/// Plain user agent for CDN media downloads. CDN URLs are presigned, so these
/// requests carry no cookies.
pub const MEDIA_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7)";

/// Base-64 alphabet Instagram uses for shortcode <-> PK conversion.
pub const SHORTCODE_ALPHABET: &str =
    "ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-_";

/// Known-good shortcode used by the auth self-test.
pub const TEST_SHORTCODE: &str = "DUGZG3CjcN-";

/// Proactive cooldown cadence. The platform's anti-automation kicks in around
/// ~700 requests per session; cooling down every 600 stays under the wall.
pub const COOLDOWN_EVERY: usize = 600;

/// Cooldown pause length in seconds.
pub const COOLDOWN_SECS: u64 = 120;

/// Consecutive non-ok results before an early cooldown.
pub const MAX_CONSECUTIVE_FAILURES: usize = 10;

/// Pause after an HTTP 429 before refreshing cookies and resuming.
pub const RATE_LIMIT_PAUSE_SECS: u64 = 60;

/// Per-task wait when draining the media download pool.
pub const DOWNLOAD_DRAIN_TIMEOUT_SECS: u64 = 120;

/// Media download worker pool size. Small on purpose: downloads run
/// concurrently with a 3-second-per-request API loop.
pub const MEDIA_POOL_SIZE: usize = 4;

/// Seconds of video between sampled frames for OCR.
pub const FRAME_INTERVAL_SECS: f64 = 3.0;

/// Minimum OCR confidence (0..1) to keep a text line.
pub const MIN_OCR_CONFIDENCE: f64 = 0.5;

/// Minimum trimmed text length to keep; filters single-character noise.
pub const MIN_TEXT_LENGTH: usize = 2;
