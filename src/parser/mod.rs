pub mod price;

use crate::model::{PriceMap, WearCondition};

pub use price::extract_price;

/// Substrings that mark the StatTrak toggle rather than a wear price button.
/// The toggle echoes wear labels, so it has to be dropped before matching.
const TOGGLE_MARKERS: &[&str] = &["StatTrak", "★"];

/// Which wear condition a button's text belongs to, if any.
pub fn wear_for_fragment(text: &str) -> Option<WearCondition> {
    let text = text.trim();
    if text.is_empty() || TOGGLE_MARKERS.iter().any(|m| text.contains(m)) {
        return None;
    }
    WearCondition::ALL
        .into_iter()
        .find(|w| text.contains(w.label()))
}

/// Two-step pipeline per fragment: fragment → wear condition → price.
///
/// Conditions with no usable fragment stay absent. When several fragments
/// resolve to the same condition the last priced one wins.
pub fn extract_prices<I, S>(fragments: I) -> PriceMap
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut prices = PriceMap::default();
    for fragment in fragments {
        let text = fragment.as_ref();
        let Some(wear) = wear_for_fragment(text) else {
            continue;
        };
        if let Some(price) = extract_price(text) {
            prices.set(wear, price);
        }
    }
    prices
}
