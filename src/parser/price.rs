use std::sync::LazyLock;

use regex::Regex;

// Tried in order; the first pattern that matches decides the fragment.
static PRICE_RULES: LazyLock<[Regex; 3]> = LazyLock::new(|| {
    [
        // ¥2,329 / ￥ 787.5
        Regex::new(r"[¥￥]\s*([0-9,]+\.?[0-9]*)").unwrap(),
        // 0.60/天
        Regex::new(r"([0-9,]+\.?[0-9]*)\s*/天").unwrap(),
        // 2329元
        Regex::new(r"([0-9,]+\.?[0-9]*)\s*元").unwrap(),
    ]
});

/// Pull a numeric price out of one button's text.
///
/// Handles the sell layout (`崭新出厂¥2329`), the rent layout
/// (`崭新出厂¥0.60/天`) and bare `元` amounts. Returns `None` when no rule
/// matches or the winning capture is not a number once separators are removed.
pub fn extract_price(text: &str) -> Option<f64> {
    let caps = PRICE_RULES.iter().find_map(|re| re.captures(text))?;
    let digits = caps[1].replace(',', "");
    digits.parse::<f64>().ok().filter(|p| p.is_finite())
}
