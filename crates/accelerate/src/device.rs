//! User agent parsing for endpoint device defaults and bot detection.

/// Device facts derived from a user agent string.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Hardware vendor, e.g. `Apple`.
    pub vendor: Option<String>,
    /// Hardware model, e.g. `iPhone`.
    pub model: Option<String>,
    /// `mobile`, `tablet` or `desktop`.
    pub device_type: &'static str,
    pub browser: Option<String>,
    pub browser_version: Option<String>,
    pub os: Option<String>,
    pub os_version: Option<String>,
}

const BOT_MARKERS: &[&str] = &[
    "bot",
    "crawl",
    "spider",
    "slurp",
    "headless",
    "lighthouse",
    "pingdom",
    "facebookexternalhit",
    "embedly",
    "preview",
];

/// Whether the user agent belongs to an automated client.
pub fn is_bot(user_agent: &str) -> bool {
    let ua = user_agent.to_ascii_lowercase();
    BOT_MARKERS.iter().any(|marker| ua.contains(marker))
}

/// Parse a user agent string.
pub fn parse_user_agent(user_agent: &str) -> DeviceInfo {
    let (browser, browser_version) = detect_browser(user_agent);
    let (os, os_version) = detect_os(user_agent);
    let (vendor, model, device_type) = detect_device(user_agent);

    DeviceInfo {
        vendor,
        model,
        device_type,
        browser: browser.map(String::from),
        browser_version,
        os: os.map(String::from),
        os_version,
    }
}

/// The version token following `marker`, e.g. `Chrome/` -> `120.0.1`.
fn version_after(ua: &str, marker: &str) -> Option<String> {
    let start = ua.find(marker)? + marker.len();
    let version: String = ua[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit() || matches!(c, '.' | '_'))
        .collect();
    (!version.is_empty()).then(|| version.replace('_', "."))
}

fn detect_browser(ua: &str) -> (Option<&'static str>, Option<String>) {
    const BROWSERS: &[(&str, &str)] = &[
        ("Edg/", "Edge"),
        ("OPR/", "Opera"),
        ("SamsungBrowser/", "Samsung Browser"),
        ("Firefox/", "Firefox"),
        ("FxiOS/", "Firefox"),
        ("CriOS/", "Chrome"),
        ("Chrome/", "Chrome"),
    ];
    for (marker, name) in BROWSERS {
        if let Some(version) = version_after(ua, marker) {
            return (Some(*name), Some(version));
        }
    }
    if ua.contains("Safari/") {
        return (Some("Safari"), version_after(ua, "Version/"));
    }
    (None, None)
}

fn detect_os(ua: &str) -> (Option<&'static str>, Option<String>) {
    if let Some(nt) = version_after(ua, "Windows NT ") {
        let version = match nt.as_str() {
            "10.0" => "10".to_string(),
            "6.3" => "8.1".to_string(),
            "6.2" => "8".to_string(),
            "6.1" => "7".to_string(),
            other => other.to_string(),
        };
        return (Some("Windows"), Some(version));
    }
    if ua.contains("iPhone") || ua.contains("iPad") || ua.contains("iPod") {
        let version = version_after(ua, "iPhone OS ").or_else(|| version_after(ua, "CPU OS "));
        return (Some("iOS"), version);
    }
    if let Some(version) = version_after(ua, "Android ") {
        return (Some("Android"), Some(version));
    }
    if ua.contains("CrOS") {
        return (Some("Chrome OS"), None);
    }
    if let Some(version) = version_after(ua, "Mac OS X ") {
        return (Some("Mac OS"), Some(version));
    }
    if ua.contains("Linux") {
        return (Some("Linux"), None);
    }
    (None, None)
}

fn detect_device(ua: &str) -> (Option<String>, Option<String>, &'static str) {
    for model in ["iPad", "iPhone", "iPod"] {
        if ua.contains(model) {
            let device_type = if model == "iPad" { "tablet" } else { "mobile" };
            return (Some("Apple".into()), Some(model.into()), device_type);
        }
    }
    if ua.contains("Android") {
        let device_type = if ua.contains("Mobile") { "mobile" } else { "tablet" };
        let model = android_model(ua);
        let vendor = model.as_deref().and_then(android_vendor).map(String::from);
        return (vendor, model, device_type);
    }
    if ua.contains("Macintosh") {
        return (Some("Apple".into()), Some("Macintosh".into()), "desktop");
    }
    (None, None, "desktop")
}

/// `Linux; Android 13; Pixel 7 Build/...)` -> `Pixel 7`
fn android_model(ua: &str) -> Option<String> {
    let start = ua.find("Android")?;
    let group_end = ua[start..].find(')')? + start;
    let model = ua[start..group_end]
        .split(';')
        .nth(1)?
        .split(" Build/")
        .next()?
        .trim();
    (!model.is_empty() && model != "K").then(|| model.to_string())
}

fn android_vendor(model: &str) -> Option<&'static str> {
    const VENDORS: &[(&str, &str)] = &[
        ("Pixel", "Google"),
        ("Nexus", "Google"),
        ("SM-", "Samsung"),
        ("GT-", "Samsung"),
        ("Moto", "Motorola"),
        ("Redmi", "Xiaomi"),
        ("Mi ", "Xiaomi"),
        ("ONEPLUS", "OnePlus"),
        ("HUAWEI", "Huawei"),
    ];
    VENDORS
        .iter()
        .find(|(prefix, _)| model.starts_with(prefix))
        .map(|(_, vendor)| *vendor)
}
