//! Randomized pacing primitives.
//!
//! Bot-detection vendors fingerprint request rhythm as much as they
//! fingerprint the browser, so every wait in the pipeline draws from a
//! configured band instead of sleeping a fixed interval.

use std::time::Duration;

use rand::Rng;
use tracing::debug;

use crate::browser::PageDriver;

/// Pointer and scroll activity replayed on rendered pages.
const READING_SCRIPTS: &[&str] = &[
    r#"
    (() => {
        const w = window.innerWidth || 1280;
        const h = window.innerHeight || 800;
        for (let i = 0; i < 4; i++) {
            document.dispatchEvent(new MouseEvent('mousemove', {
                clientX: Math.floor(Math.random() * w),
                clientY: Math.floor(Math.random() * h),
                bubbles: true
            }));
        }
    })();
    "#,
    r#"
    (() => {
        const depth = 200 + Math.floor(Math.random() * 500);
        window.scrollBy({ top: depth, behavior: 'smooth' });
        setTimeout(() => window.scrollBy({ top: -Math.floor(depth / 2), behavior: 'smooth' }), 400);
    })();
    "#,
];

/// Sleep for a random duration drawn from `[min_secs, max_secs)`.
///
/// A degenerate band sleeps exactly `min_secs`; a non-positive draw
/// returns immediately.
pub async fn jitter(min_secs: f64, max_secs: f64) {
    let secs = if max_secs > min_secs {
        rand::rng().random_range(min_secs..max_secs)
    } else {
        min_secs
    };
    if secs <= 0.0 {
        return;
    }
    tokio::time::sleep(Duration::from_secs_f64(secs)).await;
}

/// Replay scroll and pointer activity on the current page, pausing within
/// `pause` after each script.
///
/// Best effort: a page that traps script evaluation must not take the
/// whole session down with it.
pub async fn simulate_reading(driver: &dyn PageDriver, pause: (f64, f64)) {
    for script in READING_SCRIPTS {
        if let Err(e) = driver.evaluate(script).await {
            debug!("Reading simulation script skipped: {}", e);
        }
        jitter(pause.0, pause.1).await;
    }
}
