//! Fingerprint evasion scripts and the desktop user-agent pool.
//!
//! Dealer platforms sit behind aggressive bot-detection vendors, so every
//! session presents a plain desktop Chrome profile and patches the handful
//! of navigator properties that CDP automation leaks.

use rand::Rng;

/// Evasion snippets applied to each page after it becomes ready.
///
/// Each snippet is independent; a failure in one is logged and skipped
/// so a hardened page cannot poison the whole session.
pub const STEALTH_SCRIPTS: &[&str] = &[
    // navigator.webdriver is the first thing every vendor checks
    r#"
    (() => {
        const proto = Object.getPrototypeOf(navigator);
        if ('webdriver' in proto) {
            delete proto.webdriver;
        }
        Object.defineProperty(navigator, 'webdriver', {
            get: () => false,
            configurable: true
        });
    })();
    "#,
    // headless Chrome ships without window.chrome
    r#"
    (() => {
        if (!window.chrome) {
            window.chrome = {};
        }
        window.chrome.runtime = window.chrome.runtime || {};
        window.chrome.loadTimes = window.chrome.loadTimes || function() { return {}; };
        window.chrome.csi = window.chrome.csi || function() { return {}; };
        window.chrome.app = window.chrome.app || { isInstalled: false };
    })();
    "#,
    // notification permission probes disagree with headless defaults
    r#"
    (() => {
        const nativeQuery = window.navigator.permissions.query.bind(window.navigator.permissions);
        window.navigator.permissions.query = (parameters) =>
            parameters && parameters.name === 'notifications'
                ? Promise.resolve({ state: Notification.permission })
                : nativeQuery(parameters);
    })();
    "#,
    // an empty plugin list marks automation
    r#"
    (() => {
        const plugins = [
            { name: 'PDF Viewer', filename: 'internal-pdf-viewer', description: 'Portable Document Format' },
            { name: 'Chromium PDF Viewer', filename: 'internal-pdf-viewer', description: 'Portable Document Format' }
        ];
        Object.defineProperty(navigator, 'plugins', {
            get: () => plugins,
            configurable: true
        });
    })();
    "#,
    r#"
    Object.defineProperty(navigator, 'languages', {
        get: () => ['en-US', 'en'],
        configurable: true
    });
    "#,
    // ChromeDriver leaves cdc_-prefixed globals behind
    r#"
    (() => {
        for (const key of Object.keys(window)) {
            if (key.startsWith('cdc_')) {
                delete window[key];
            }
        }
    })();
    "#,
    // UNMASKED_VENDOR_WEBGL / UNMASKED_RENDERER_WEBGL report SwiftShader in headless
    r#"
    (() => {
        const nativeGetParameter = WebGLRenderingContext.prototype.getParameter;
        WebGLRenderingContext.prototype.getParameter = function(parameter) {
            if (parameter === 37445) {
                return 'Google Inc. (Intel)';
            }
            if (parameter === 37446) {
                return 'ANGLE (Intel, Mesa Intel(R) UHD Graphics, OpenGL 4.6)';
            }
            return nativeGetParameter.call(this, parameter);
        };
    })();
    "#,
    // containers often expose 1-2 cores, which no desktop does
    r#"
    (() => {
        Object.defineProperty(navigator, 'hardwareConcurrency', {
            get: () => 8,
            configurable: true
        });
        Object.defineProperty(navigator, 'deviceMemory', {
            get: () => 8,
            configurable: true
        });
    })();
    "#,
];

/// Desktop Chrome user agents rotated across sessions.
pub const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/136.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/136.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/136.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/135.0.0.0 Safari/537.36",
];

/// Pick a user agent for a fresh session.
pub fn pick_user_agent() -> &'static str {
    let idx = rand::rng().random_range(0..USER_AGENTS.len());
    USER_AGENTS[idx]
}
